//! The scatter-gather dispatcher.
//!
//! `ScatterGather` multicasts one command batch to a set of shards and hands
//! back one outcome per remote. Construction schedules every remote;
//! executor callbacks record outcomes and wake the caller; `next` drains
//! ready slots, rescheduling retriable failures until each remote is
//! terminal.

use std::sync::{Arc, Mutex};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;

use super::error::{command_result_status, ErrorCode, Status};
use super::executor::{RemoteCommandCallback, TaskExecutor};
use super::registry::ShardRegistry;
use super::retry::RetryPolicy;
use super::slot::RemoteSlot;
use super::types::{
    Document, OperationContext, ReadPreference, RemoteCommandRequest, Request, Response,
    MAX_HOST_RETRY_ATTEMPTS, TARGET_RESOLUTION_TIMEOUT,
};

/// Mutable dispatcher state. Everything in here is guarded by one lock,
/// which is never held across an await or an executor call.
struct State {
    slots: Vec<RemoteSlot>,
    stop_retrying: bool,
    /// Set once when the caller's context interrupts a wait; never reverts.
    interrupt_status: Option<Status>,
    /// Armed by `next` before each wait; taken by the first signal per
    /// cycle, so one generation fires at most once.
    ready_signal: Option<oneshot::Sender<()>>,
}

impl State {
    fn fire_ready_signal(&mut self) {
        if let Some(signal) = self.ready_signal.take() {
            let _ = signal.send(());
        }
    }
}

/// Shared with executor callbacks, so a dropped dispatcher never leaves a
/// callback dangling: late completions write here and vanish with the last
/// clone.
struct Shared {
    state: Mutex<State>,
}

/// Fans one command batch out to a set of shards and collects per-remote
/// outcomes.
///
/// The caller drives the fan-out by awaiting `next` until `done`; each call
/// yields exactly one remote's outcome. Retriable failures are rescheduled
/// with a fresh target resolution, up to `MAX_HOST_RETRY_ATTEMPTS` per
/// remote. Dropping the dispatcher cancels anything still in flight.
pub struct ScatterGather {
    shared: Arc<Shared>,
    ctx: OperationContext,
    executor: Arc<dyn TaskExecutor>,
    registry: Arc<ShardRegistry>,
    database: String,
    read_pref: ReadPreference,
    metadata: Document,
    retry_policy: RetryPolicy,
}

impl ScatterGather {
    /// Build a dispatcher and schedule every remote.
    ///
    /// Remotes whose initial target resolution or scheduling fails are
    /// immediately ready with that failure; everything else is in flight
    /// when this returns.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        ctx: OperationContext,
        executor: Arc<dyn TaskExecutor>,
        registry: Arc<ShardRegistry>,
        database: impl Into<String>,
        requests: Vec<Request>,
        read_pref: ReadPreference,
        retry_policy: RetryPolicy,
    ) -> Self {
        let slots: Vec<_> = requests
            .into_iter()
            .map(|request| RemoteSlot::new(request.shard_id, request.body))
            .collect();
        let slot_count = slots.len();

        let metadata = read_pref.to_metadata();
        let sender = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slots,
                    stop_retrying: false,
                    interrupt_status: None,
                    ready_signal: None,
                }),
            }),
            ctx,
            executor,
            registry,
            database: database.into(),
            read_pref,
            metadata,
            retry_policy,
        };

        sender.schedule_batch((0..slot_count).collect()).await;
        sender
    }

    /// Wait for and return the next remote's outcome.
    ///
    /// Ready slots are emitted in traversal order; retriable failures are
    /// rescheduled before each wait. If the operation context is interrupted
    /// while parked, all outstanding sends are canceled and the remaining
    /// outcomes drain with the interrupt status in place of cancellation
    /// errors.
    ///
    /// # Panics
    ///
    /// Panics if every remote is already terminal; check `done` first.
    pub async fn next(&mut self) -> Response {
        assert!(!self.done(), "next called with no remotes outstanding");

        loop {
            let (ready_rx, pending) = {
                let mut state = self.shared.state.lock().unwrap();

                // Arm a fresh signal before scanning so a completion landing
                // between the scan and the wait is never lost.
                let (tx, rx) = oneshot::channel();
                state.ready_signal = Some(tx);

                if !state.stop_retrying {
                    self.classify_failures(&mut state);
                }

                if let Some(response) = self.take_ready(&mut state) {
                    state.ready_signal = None;
                    return response;
                }

                let pending = if state.stop_retrying {
                    Vec::new()
                } else {
                    state
                        .slots
                        .iter()
                        .enumerate()
                        .filter(|(_, slot)| slot.needs_scheduling())
                        .map(|(index, _)| index)
                        .collect()
                };
                (rx, pending)
            };

            self.schedule_batch(pending).await;
            self.wait_for_ready(ready_rx).await;
        }
    }

    /// True once every remote's outcome has been handed to the caller.
    pub fn done(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.slots.iter().all(|slot| slot.terminal)
    }

    /// Stop rescheduling failed remotes; in-flight sends complete naturally.
    /// Idempotent.
    pub fn stop_retrying(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.stop_retrying = true;
    }

    /// Apply retry classification to every unobserved error outcome.
    ///
    /// The terminal error comes from the executor-layer status or, when the
    /// transport succeeded, from the status embedded in the command reply.
    /// Remotes worth another attempt give up their outcome and spend one
    /// retry; everything else keeps (or becomes) its terminal error.
    fn classify_failures(&self, state: &mut State) {
        for slot in state.slots.iter_mut() {
            if slot.terminal {
                continue;
            }
            let Some(outcome) = &slot.outcome else {
                continue;
            };
            let effective = match outcome {
                Ok(body) => match command_result_status(body) {
                    Ok(()) => continue,
                    Err(status) => status,
                },
                Err(status) => status.clone(),
            };

            // A shard that vanished from the registry mid-operation is a
            // terminal error regardless of policy.
            let Some(shard) = self.registry.lookup(&slot.shard_id) else {
                slot.outcome = Some(Err(Status::new(
                    ErrorCode::ShardNotFound,
                    format!("could not find shard {}", slot.shard_id),
                )));
                continue;
            };

            if let Some(host) = &slot.host {
                shard.targeter().note_host_failure(host, &effective);
            }

            if self.retry_policy.is_retriable(effective.code)
                && slot.retry_count < MAX_HOST_RETRY_ATTEMPTS
            {
                tracing::debug!(
                    shard_id = %slot.shard_id,
                    host = ?slot.host,
                    error = %effective,
                    retry_count = slot.retry_count + 1,
                    "retrying remote after retriable error"
                );
                slot.reset_for_retry();
            } else {
                // Surface the effective error: a command failure embedded in
                // an otherwise successful reply becomes a failure outcome.
                slot.outcome = Some(Err(effective));
            }
        }
    }

    /// Emit the first ready slot in traversal order, if any.
    fn take_ready(&self, state: &mut State) -> Option<Response> {
        let interrupt_status = state.interrupt_status.clone();
        for slot in state.slots.iter_mut() {
            if !slot.is_ready() {
                continue;
            }
            slot.terminal = true;
            let shard_id = slot.shard_id.clone();
            let host = slot.host.clone();
            let Some(outcome) = slot.outcome.take() else {
                continue;
            };

            let response = match outcome {
                Ok(body) => {
                    // A successful send always resolved a target first.
                    let host = host.expect("ready success without a resolved host");
                    Response::Success {
                        shard_id,
                        body,
                        host,
                    }
                }
                Err(status) => {
                    // Promote executor-side cancellations to the caller's
                    // interrupt so internal teardown is distinguishable from
                    // a remote-side cancellation.
                    let status = match &interrupt_status {
                        Some(interrupt) if status.code == ErrorCode::CallbackCanceled => {
                            interrupt.clone()
                        }
                        _ => status,
                    };
                    Response::Failure {
                        shard_id,
                        status,
                        host,
                    }
                }
            };
            return Some(response);
        }
        None
    }

    /// Resolve targets and hand commands to the executor for the given
    /// slots, concurrently. Resolution happens outside the state lock; only
    /// slot bookkeeping re-enters it.
    async fn schedule_batch(&self, pending: Vec<usize>) {
        if pending.is_empty() {
            return;
        }
        let mut sends: FuturesUnordered<_> = pending
            .into_iter()
            .map(|index| self.schedule_remote(index))
            .collect();
        while sends.next().await.is_some() {}
    }

    /// Resolve one remote's target and submit its command.
    async fn schedule_remote(&self, index: usize) {
        let (shard_id, body) = {
            let state = self.shared.state.lock().unwrap();
            let slot = &state.slots[index];
            if !slot.needs_scheduling() {
                return;
            }
            (slot.shard_id.clone(), slot.body.clone())
        };

        let Some(shard) = self.registry.lookup(&shard_id) else {
            self.store_scheduling_failure(
                index,
                Status::new(
                    ErrorCode::ShardNotFound,
                    format!("could not find shard {shard_id}"),
                ),
            );
            return;
        };

        let resolved = shard
            .targeter()
            .find_host(&self.read_pref, TARGET_RESOLUTION_TIMEOUT)
            .await;
        let host = match resolved {
            Ok(host) => host,
            Err(status) => {
                tracing::debug!(
                    shard_id = %shard_id,
                    error = %status,
                    "target resolution failed"
                );
                self.store_scheduling_failure(index, status);
                return;
            }
        };

        {
            let mut state = self.shared.state.lock().unwrap();
            state.slots[index].host = Some(host.clone());
        }

        let request = RemoteCommandRequest {
            host,
            database: self.database.clone(),
            body,
            metadata: self.metadata.clone(),
            timeout: None,
        };
        let shared = Arc::clone(&self.shared);
        let callback: RemoteCommandCallback = Box::new(move |outcome| {
            Self::record_outcome(&shared, index, outcome);
        });

        match self.executor.schedule(request, callback) {
            Ok(handle) => {
                let mut state = self.shared.state.lock().unwrap();
                let slot = &mut state.slots[index];
                // The callback may already have fired; only a still-pending
                // slot keeps the handle.
                if slot.outcome.is_none() {
                    slot.in_flight = Some(handle);
                }
            }
            Err(status) => self.store_scheduling_failure(index, status),
        }
    }

    /// Record a resolution or scheduling failure and wake the caller.
    ///
    /// No callback will run for this remote, so the ready signal has to be
    /// fired here.
    fn store_scheduling_failure(&self, index: usize, status: Status) {
        let mut state = self.shared.state.lock().unwrap();
        let slot = &mut state.slots[index];
        slot.outcome = Some(Err(status));
        state.fire_ready_signal();
    }

    /// Executor callback target: store one remote's outcome and wake the
    /// caller.
    fn record_outcome(shared: &Shared, index: usize, outcome: Result<Document, Status>) {
        let mut state = shared.state.lock().unwrap();
        let slot = &mut state.slots[index];
        if slot.terminal {
            return;
        }
        debug_assert!(slot.outcome.is_none(), "remote completed twice");
        slot.in_flight = None;
        slot.outcome = Some(outcome);
        state.fire_ready_signal();
    }

    /// Park until a remote completes, observing interruption at most once.
    async fn wait_for_ready(&self, ready_rx: oneshot::Receiver<()>) {
        let draining = {
            let state = self.shared.state.lock().unwrap();
            state.interrupt_status.is_some()
        };
        if draining {
            // Already interrupted: wait for the canceled callbacks without
            // further interruption checks.
            let _ = ready_rx.await;
            return;
        }

        tokio::select! {
            _ = ready_rx => {}
            status = self.ctx.interrupted() => {
                tracing::debug!(
                    error = %status,
                    "fan-out interrupted; canceling outstanding requests"
                );
                {
                    let mut state = self.shared.state.lock().unwrap();
                    state.interrupt_status = Some(status);
                }
                self.cancel_pending_requests();
            }
        }
    }

    /// Stop retrying and cancel every outstanding send. The executor still
    /// runs each callback (with a cancellation status), which drives the
    /// affected slots to ready.
    ///
    /// Cancellation happens outside the state lock: executors may invoke
    /// callbacks inline from `cancel`, and those callbacks take the lock.
    fn cancel_pending_requests(&self) {
        let handles: Vec<_> = {
            let mut state = self.shared.state.lock().unwrap();
            state.stop_retrying = true;
            state
                .slots
                .iter()
                .filter_map(|slot| slot.in_flight.clone())
                .collect()
        };
        for handle in &handles {
            self.executor.cancel(handle);
        }
    }
}

impl Drop for ScatterGather {
    /// Tear-down cancels all outstanding sends. Callbacks own a clone of the
    /// shared state, so late completions write into it and are dropped with
    /// the last clone.
    fn drop(&mut self) {
        self.cancel_pending_requests();
    }
}
