//! Shared types for the scatter-gather dispatcher.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the dispatcher and the executor/targeter layers.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;

use super::error::Status;

/// Command and response payloads are documents.
pub type Document = serde_json::Value;

/// Maximum number of retries for network and not-primary errors (per remote).
pub const MAX_HOST_RETRY_ATTEMPTS: u32 = 3;

/// Upper bound for one target-resolution attempt against a shard's targeter.
pub const TARGET_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(20);

/// Logical identifier for a shard.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Concrete network endpoint within a shard, chosen by the targeter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One fan-out request: a command body targeted at a logical shard.
#[derive(Clone, Debug)]
pub struct Request {
    pub shard_id: ShardId,
    pub body: Document,
}

impl Request {
    pub fn new(shard_id: ShardId, body: Document) -> Self {
        Self { shard_id, body }
    }
}

/// Per-remote outcome handed back by `ScatterGather::next`.
#[derive(Clone, Debug)]
pub enum Response {
    Success {
        shard_id: ShardId,
        body: Document,
        host: HostAndPort,
    },
    /// The host is absent when target resolution never succeeded.
    Failure {
        shard_id: ShardId,
        status: Status,
        host: Option<HostAndPort>,
    },
}

impl Response {
    pub fn shard_id(&self) -> &ShardId {
        match self {
            Self::Success { shard_id, .. } => shard_id,
            Self::Failure { shard_id, .. } => shard_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Which replica-set members may serve the command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Read preference carried with a fan-out.
///
/// The dispatcher treats it opaquely: targeters use it to pick a host and the
/// serialized form rides along as request metadata for the remote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,
    pub max_staleness_secs: Option<u64>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            max_staleness_secs: None,
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    /// Render the `$readPreference` metadata document attached to every
    /// remote command of the fan-out.
    pub fn to_metadata(&self) -> Document {
        let mut pref = json!({ "mode": self.mode });
        if let Some(secs) = self.max_staleness_secs {
            pref["maxStalenessSeconds"] = json!(secs);
        }
        json!({ "$readPreference": pref })
    }
}

/// Fully-resolved remote command handed to the executor.
///
/// The per-request timeout is enforced by the executor; the dispatcher
/// itself has no wall-clock deadline.
#[derive(Clone, Debug)]
pub struct RemoteCommandRequest {
    pub host: HostAndPort,
    pub database: String,
    pub body: Document,
    pub metadata: Document,
    pub timeout: Option<Duration>,
}

/// Caller-owned execution context for one logical operation.
///
/// Interruption is cooperative: `interrupt` stores a terminal status and
/// wakes waiters; the dispatcher observes it while parked between remote
/// completions. The first interrupt wins and never reverts.
#[derive(Clone, Default)]
pub struct OperationContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    status: Mutex<Option<Status>>,
    notify: Notify,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the operation as interrupted with the given status.
    pub fn interrupt(&self, status: Status) {
        let mut current = self.inner.status.lock().unwrap();
        if current.is_none() {
            *current = Some(status);
            self.inner.notify.notify_waiters();
        }
    }

    /// Return the interrupt status, if the operation was interrupted.
    pub fn interrupt_status(&self) -> Option<Status> {
        self.inner.status.lock().unwrap().clone()
    }

    /// Wait until the operation is interrupted, then return the status.
    pub async fn interrupted(&self) -> Status {
        loop {
            // Register before checking so a concurrent interrupt is not lost.
            let notified = self.inner.notify.notified();
            if let Some(status) = self.interrupt_status() {
                return status;
            }
            notified.await;
        }
    }
}
