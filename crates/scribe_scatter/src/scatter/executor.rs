//! Remote-command executor contract and the tokio-backed adapter.
//!
//! The dispatcher hands fully-resolved commands to a `TaskExecutor` and gets
//! the outcome back through a callback. `TokioExecutor` implements the
//! contract on top of an abstract `NetworkLink`, so wire encoding and
//! connection management stay outside this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time;

use super::error::{ErrorCode, Status};
use super::types::{Document, RemoteCommandRequest};

/// Callback invoked exactly once with the outcome of a scheduled command.
pub type RemoteCommandCallback = Box<dyn FnOnce(Result<Document, Status>) + Send + 'static>;

/// Cancellation token for one scheduled command.
///
/// Executors hand one out per accepted request and watch it to abandon the
/// send. Cancellation is cooperative: requesting it does not stop the
/// callback from running, only changes what it reports.
#[derive(Clone, Default)]
pub struct CallbackHandle {
    inner: Arc<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CallbackHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative cancellation and wake any watcher.
    pub fn request_cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Wait until cancellation is requested.
    pub async fn canceled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not lost.
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Schedules remote commands and reports outcomes through callbacks.
///
/// Implementations own the tasks the callbacks run on. The callback runs
/// exactly once per accepted request, even after `cancel` (then with a
/// `CallbackCanceled` status). `cancel` is non-blocking. Callers never hold
/// locks a callback also takes across `schedule`.
pub trait TaskExecutor: Send + Sync + 'static {
    /// Accept a command for execution, or refuse it with a status.
    fn schedule(
        &self,
        request: RemoteCommandRequest,
        callback: RemoteCommandCallback,
    ) -> Result<CallbackHandle, Status>;

    /// Request cancellation of a previously scheduled command.
    fn cancel(&self, handle: &CallbackHandle);
}

/// The async channel that carries one command to a host and returns its
/// reply. Connection pooling, wire encoding, and transport-level retries all
/// live behind this trait.
#[async_trait]
pub trait NetworkLink: Send + Sync + 'static {
    async fn run_command(&self, request: RemoteCommandRequest) -> Result<Document, Status>;
}

/// `TaskExecutor` backed by the tokio runtime and an abstract link.
///
/// Each accepted request runs on its own task, racing the link against the
/// request timeout and the cancellation token. `schedule` must be called
/// from within a tokio runtime.
pub struct TokioExecutor {
    link: Arc<dyn NetworkLink>,
    default_timeout: Option<Duration>,
    shutdown: AtomicBool,
}

impl TokioExecutor {
    pub fn new(link: Arc<dyn NetworkLink>) -> Self {
        Self {
            link,
            default_timeout: None,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Apply a timeout to requests that do not carry their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Stop accepting new work. In-flight commands run to completion.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl TaskExecutor for TokioExecutor {
    fn schedule(
        &self,
        request: RemoteCommandRequest,
        callback: RemoteCommandCallback,
    ) -> Result<CallbackHandle, Status> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Status::new(
                ErrorCode::ShutdownInProgress,
                "executor is shutting down",
            ));
        }

        let handle = CallbackHandle::new();
        let watcher = handle.clone();
        let link = Arc::clone(&self.link);
        let timeout = request.timeout.or(self.default_timeout);
        tokio::spawn(async move {
            let host = request.host.clone();
            let command = link.run_command(request);
            let work = async {
                match timeout {
                    Some(limit) => match time::timeout(limit, command).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Status::new(
                            ErrorCode::NetworkTimeout,
                            format!("remote command to {host} timed out"),
                        )),
                    },
                    None => command.await,
                }
            };
            tokio::select! {
                outcome = work => callback(outcome),
                _ = watcher.canceled() => {
                    callback(Err(Status::new(
                        ErrorCode::CallbackCanceled,
                        "remote command canceled",
                    )));
                }
            }
        });
        Ok(handle)
    }

    fn cancel(&self, handle: &CallbackHandle) {
        handle.request_cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::super::types::HostAndPort;
    use super::*;

    struct EchoLink {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl NetworkLink for EchoLink {
        async fn run_command(&self, request: RemoteCommandRequest) -> Result<Document, Status> {
            if let Some(delay) = self.delay {
                time::sleep(delay).await;
            }
            Ok(json!({"ok": 1, "host": request.host.to_string()}))
        }
    }

    fn ping(timeout: Option<Duration>) -> RemoteCommandRequest {
        RemoteCommandRequest {
            host: HostAndPort::new("db0.scribe.local", 27017),
            database: "admin".to_string(),
            body: json!({"ping": 1}),
            metadata: json!({}),
            timeout,
        }
    }

    #[tokio::test]
    async fn callback_receives_the_link_reply() {
        let executor = TokioExecutor::new(Arc::new(EchoLink { delay: None }));
        let (tx, rx) = oneshot::channel();
        executor
            .schedule(ping(None), Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }))
            .unwrap();

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome["host"], "db0.scribe.local:27017");
    }

    #[tokio::test]
    async fn slow_links_hit_the_request_timeout() {
        let executor = TokioExecutor::new(Arc::new(EchoLink {
            delay: Some(Duration::from_secs(60)),
        }));
        let (tx, rx) = oneshot::channel();
        executor
            .schedule(
                ping(Some(Duration::from_millis(20))),
                Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                }),
            )
            .unwrap();

        let status = rx.await.unwrap().unwrap_err();
        assert_eq!(status.code, ErrorCode::NetworkTimeout);
    }

    #[tokio::test]
    async fn cancel_still_runs_the_callback_exactly_once() {
        let executor = TokioExecutor::new(Arc::new(EchoLink {
            delay: Some(Duration::from_secs(60)),
        }));
        let (tx, rx) = oneshot::channel();
        let handle = executor
            .schedule(ping(None), Box::new(move |outcome| {
                // A second invocation would panic on the consumed sender.
                let _ = tx.send(outcome);
            }))
            .unwrap();

        executor.cancel(&handle);
        let status = rx.await.unwrap().unwrap_err();
        assert_eq!(status.code, ErrorCode::CallbackCanceled);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let executor = TokioExecutor::new(Arc::new(EchoLink { delay: None }));
        executor.shutdown();
        let status = executor
            .schedule(ping(None), Box::new(|_| {}))
            .err()
            .unwrap();
        assert_eq!(status.code, ErrorCode::ShutdownInProgress);
    }
}
