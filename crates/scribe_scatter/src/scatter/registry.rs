//! Shard registry and replica-set targeting.
//!
//! The registry maps logical shard ids to shards; each shard owns a targeter
//! that turns a read preference into a concrete host. `ReplicaSetTargeter`
//! is the in-memory implementation shared by tests and the workload driver;
//! production deployments can plug in a discovering targeter behind the same
//! trait.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time;

use super::error::{ErrorCode, Status};
use super::types::{HostAndPort, ReadMode, ReadPreference, ShardId};

/// Per-shard host selector honoring read preference.
///
/// Implementations may perform network discovery internally; the dispatcher
/// treats one `find_host` call as atomic and bounds it with `max_wait`.
#[async_trait]
pub trait ShardTargeter: Send + Sync + 'static {
    /// Resolve a concrete host for the given read preference, waiting up to
    /// `max_wait` for one to become eligible.
    async fn find_host(
        &self,
        read_pref: &ReadPreference,
        max_wait: Duration,
    ) -> Result<HostAndPort, Status>;

    /// Feed an observed per-host failure back into the targeter so future
    /// resolutions can re-target.
    fn note_host_failure(&self, host: &HostAndPort, status: &Status);
}

/// A logical shard: identity plus its targeter.
pub struct Shard {
    id: ShardId,
    targeter: Arc<dyn ShardTargeter>,
}

impl Shard {
    pub fn new(id: ShardId, targeter: Arc<dyn ShardTargeter>) -> Self {
        Self { id, targeter }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn targeter(&self) -> &Arc<dyn ShardTargeter> {
        &self.targeter
    }
}

/// In-memory registry mapping shard ids to shards.
#[derive(Default)]
pub struct ShardRegistry {
    shards: RwLock<HashMap<ShardId, Arc<Shard>>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard: Arc<Shard>) {
        let mut shards = self.shards.write().unwrap();
        shards.insert(shard.id().clone(), shard);
    }

    /// Look up a shard without refreshing; unknown ids are the caller's
    /// error to surface.
    pub fn lookup(&self, shard_id: &ShardId) -> Option<Arc<Shard>> {
        self.shards.read().unwrap().get(shard_id).cloned()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self.shards.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Membership view a `ReplicaSetTargeter` selects hosts from.
#[derive(Default)]
struct ReplicaSetView {
    primary: Option<HostAndPort>,
    secondaries: Vec<HostAndPort>,
    excluded: HashSet<HostAndPort>,
}

impl ReplicaSetView {
    fn member_count(&self) -> usize {
        self.secondaries.len() + usize::from(self.primary.is_some())
    }
}

/// Targeter over a replica-set view with failure feedback.
///
/// Network and shutdown errors exclude the reported host from selection;
/// not-primary errors demote the primary to a secondary. Once every member
/// has been excluded the set is presumed recovered and the exclusions are
/// cleared.
pub struct ReplicaSetTargeter {
    view: RwLock<ReplicaSetView>,
    changed: Notify,
    rotation: AtomicUsize,
}

impl ReplicaSetTargeter {
    pub fn new(primary: HostAndPort, secondaries: Vec<HostAndPort>) -> Self {
        Self {
            view: RwLock::new(ReplicaSetView {
                primary: Some(primary),
                secondaries,
                excluded: HashSet::new(),
            }),
            changed: Notify::new(),
            rotation: AtomicUsize::new(0),
        }
    }

    /// Replace the member view, waking any resolution blocked on it.
    pub fn install_view(&self, primary: Option<HostAndPort>, secondaries: Vec<HostAndPort>) {
        {
            let mut view = self.view.write().unwrap();
            *view = ReplicaSetView {
                primary,
                secondaries,
                excluded: HashSet::new(),
            };
        }
        self.changed.notify_waiters();
    }

    fn try_select(&self, mode: ReadMode) -> Option<HostAndPort> {
        let view = self.view.read().unwrap();
        let primary = view
            .primary
            .as_ref()
            .filter(|host| !view.excluded.contains(*host))
            .cloned();
        let secondaries: Vec<_> = view
            .secondaries
            .iter()
            .filter(|host| !view.excluded.contains(*host))
            .cloned()
            .collect();

        match mode {
            ReadMode::Primary => primary,
            ReadMode::PrimaryPreferred => primary.or_else(|| self.rotate(&secondaries)),
            ReadMode::Secondary => self.rotate(&secondaries),
            ReadMode::SecondaryPreferred => self.rotate(&secondaries).or(primary),
            ReadMode::Nearest => {
                let mut eligible = secondaries;
                if let Some(primary) = primary {
                    eligible.push(primary);
                }
                self.rotate(&eligible)
            }
        }
    }

    fn rotate(&self, hosts: &[HostAndPort]) -> Option<HostAndPort> {
        if hosts.is_empty() {
            return None;
        }
        let index = self.rotation.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(hosts[index].clone())
    }
}

#[async_trait]
impl ShardTargeter for ReplicaSetTargeter {
    async fn find_host(
        &self,
        read_pref: &ReadPreference,
        max_wait: Duration,
    ) -> Result<HostAndPort, Status> {
        let deadline = time::Instant::now() + max_wait;
        loop {
            // Register for view changes before selecting so an install
            // between the two is not lost.
            let changed = self.changed.notified();
            if let Some(host) = self.try_select(read_pref.mode) {
                return Ok(host);
            }
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            if remaining.is_zero() || time::timeout(remaining, changed).await.is_err() {
                return Err(Status::new(
                    ErrorCode::FailedToSatisfyReadPreference,
                    format!("no eligible host for read preference {:?}", read_pref.mode),
                ));
            }
        }
    }

    fn note_host_failure(&self, host: &HostAndPort, status: &Status) {
        let mut view = self.view.write().unwrap();
        if status.code.is_network_error() || status.code.is_shutdown_error() {
            view.excluded.insert(host.clone());
            if view.excluded.len() >= view.member_count() {
                view.excluded.clear();
            }
        }
        if status.code.is_not_primary_error() && view.primary.as_ref() == Some(host) {
            // Keep the demoted member around for secondary reads.
            if let Some(demoted) = view.primary.take() {
                view.secondaries.push(demoted);
            }
        }
        tracing::debug!(host = %host, error = %status, "noted host failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostAndPort {
        HostAndPort::new(name, 27017)
    }

    fn targeter() -> ReplicaSetTargeter {
        ReplicaSetTargeter::new(host("db0"), vec![host("db1"), host("db2")])
    }

    #[tokio::test]
    async fn primary_mode_selects_the_primary() {
        let targeter = targeter();
        let found = targeter
            .find_host(&ReadPreference::primary(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(found, host("db0"));
    }

    #[tokio::test]
    async fn secondary_mode_never_selects_the_primary() {
        let targeter = targeter();
        for _ in 0..6 {
            let found = targeter
                .find_host(
                    &ReadPreference::new(ReadMode::Secondary),
                    Duration::from_millis(10),
                )
                .await
                .unwrap();
            assert_ne!(found, host("db0"));
        }
    }

    #[tokio::test]
    async fn network_failure_excludes_the_host() {
        let targeter = targeter();
        targeter.note_host_failure(
            &host("db0"),
            &Status::new(ErrorCode::HostUnreachable, "connection refused"),
        );
        let err = targeter
            .find_host(&ReadPreference::primary(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FailedToSatisfyReadPreference);
    }

    #[tokio::test]
    async fn excluding_every_member_clears_the_exclusions() {
        let targeter = targeter();
        let down = Status::new(ErrorCode::HostUnreachable, "connection refused");
        targeter.note_host_failure(&host("db0"), &down);
        targeter.note_host_failure(&host("db1"), &down);
        targeter.note_host_failure(&host("db2"), &down);

        // The sweep is presumed stale: selection works again.
        let found = targeter
            .find_host(&ReadPreference::primary(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(found, host("db0"));
    }

    #[tokio::test]
    async fn not_primary_error_demotes_the_primary() {
        let targeter = targeter();
        targeter.note_host_failure(
            &host("db0"),
            &Status::new(ErrorCode::NotWritablePrimary, "stepping down"),
        );

        let err = targeter
            .find_host(&ReadPreference::primary(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FailedToSatisfyReadPreference);

        // The demoted member still serves secondary reads.
        let mut seen = false;
        for _ in 0..6 {
            let found = targeter
                .find_host(
                    &ReadPreference::new(ReadMode::Secondary),
                    Duration::from_millis(10),
                )
                .await
                .unwrap();
            seen |= found == host("db0");
        }
        assert!(seen);
    }

    #[tokio::test]
    async fn resolution_blocks_until_a_view_is_installed() {
        let targeter = Arc::new(targeter());
        targeter.install_view(None, vec![]);

        let waiter = Arc::clone(&targeter);
        let task = tokio::spawn(async move {
            waiter
                .find_host(&ReadPreference::primary(), Duration::from_secs(5))
                .await
        });

        time::sleep(Duration::from_millis(20)).await;
        targeter.install_view(Some(host("db3")), vec![]);

        let found = task.await.unwrap().unwrap();
        assert_eq!(found, host("db3"));
    }

    #[tokio::test]
    async fn registry_lookup_misses_unknown_shards() {
        let registry = ShardRegistry::new();
        registry.register(Arc::new(Shard::new(
            ShardId::new("rs0"),
            Arc::new(targeter()),
        )));

        assert!(registry.lookup(&ShardId::new("rs0")).is_some());
        assert!(registry.lookup(&ShardId::new("rs9")).is_none());
        assert_eq!(registry.shard_ids(), vec![ShardId::new("rs0")]);
    }
}
