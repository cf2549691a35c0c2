//! Ban lifecycle: create, expire, lift.
//!
//! Every method here is meant to run inside a queue job, so two calls never
//! overlap. That is what makes [`BanManager::request_ban`] idempotent: the
//! active-ban lookup and the insert cannot interleave with another request.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alerts::{notify_detached, Notifier, NotifyEvent};
use crate::clock::Clock;
use crate::enforcer::{Enforcer, ReconcileReport};
use crate::error::BanwatchError;
use crate::records::{BanRecord, UnbanReason, UnbanRecord};
use crate::source::CompiledSource;
use crate::store::Store;

pub struct BanManager {
    store: Arc<dyn Store>,
    /// `None` for store-only maintenance while no engine owns the firewall
    enforcer: Option<Arc<Enforcer>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl BanManager {
    pub fn new(
        store: Arc<dyn Store>,
        enforcer: Arc<Enforcer>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            enforcer: Some(enforcer),
            notifier,
            clock,
        }
    }

    /// A manager that only touches records. The firewall chain is torn down
    /// whenever the engine is stopped, so there are no rules to revert.
    pub fn offline(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            enforcer: None,
            notifier,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Ban `address` for `source` unless an active ban already exists.
    ///
    /// Returns the new ban, or `None` when this was a duplicate request. A
    /// failed firewall command is logged; the next reconcile retries it.
    pub async fn request_ban(
        &self,
        address: Ipv4Addr,
        source: &CompiledSource,
        line: &str,
        match_count: usize,
    ) -> Result<Option<BanRecord>, BanwatchError> {
        if let Some(existing) = self.store.find_active_ban(address, source.id()).await? {
            debug!(
                address = %address,
                source = %source.id(),
                ban_id = existing.id,
                "Already banned"
            );
            return Ok(None);
        }

        let ban = self
            .store
            .create_ban(BanRecord::new(
                address,
                source.id(),
                self.clock.now(),
                source.config.ban_time,
            ))
            .await?;
        info!(
            address = %address,
            source = %source.id(),
            ban_id = ban.id,
            matches = match_count,
            "Ban created"
        );

        if let Some(enforcer) = &self.enforcer {
            if let Err(e) = enforcer.deny(address).await {
                error!(address = %address, "Deny failed, will retry on reconcile: {}", e);
            }
        }

        notify_detached(
            &self.notifier,
            NotifyEvent::BanCreated {
                address,
                source_id: source.id().to_string(),
                source_name: source.config.display_name().to_string(),
                line: line.to_string(),
                match_count,
            },
        );
        Ok(Some(ban))
    }

    /// End every active ban that has run its course or whose source is gone.
    ///
    /// A ban that cannot be ended is logged and skipped; the others still end.
    pub async fn expire_bans<F>(&self, source_exists: F) -> Result<Vec<UnbanRecord>, BanwatchError>
    where
        F: Fn(&str) -> bool,
    {
        let now = self.clock.now();
        let mut ended = Vec::new();
        for ban in self.store.find_active_bans().await? {
            let reason = if !source_exists(&ban.source_id) {
                UnbanReason::SourceRemoved
            } else if ban.is_expired(now) {
                UnbanReason::Expired
            } else {
                continue;
            };
            match self.end_ban(&ban, now, reason).await {
                Ok(Some(unban)) => ended.push(unban),
                Ok(None) => {}
                // Left active, so the next sweep tries again
                Err(e) => error!(
                    address = %ban.address,
                    ban_id = ban.id,
                    "Cannot end ban: {}", e
                ),
            }
        }
        if !ended.is_empty() {
            info!(count = ended.len(), "Bans expired");
        }
        Ok(ended)
    }

    /// Lift one ban by id. `None` if it does not exist or is already over.
    pub async fn lift_ban(&self, id: u64) -> Result<Option<UnbanRecord>, BanwatchError> {
        match self.store.find_ban(id).await? {
            Some(ban) if ban.active => self.end_ban(&ban, self.clock.now(), UnbanReason::Manual).await,
            _ => Ok(None),
        }
    }

    /// Lift every active ban on `address`, whichever source created it.
    pub async fn lift_address(&self, address: Ipv4Addr) -> Result<Vec<UnbanRecord>, BanwatchError> {
        let now = self.clock.now();
        let mut lifted = Vec::new();
        for ban in self.store.find_active_bans().await? {
            if ban.address != address {
                continue;
            }
            if let Some(unban) = self.end_ban(&ban, now, UnbanReason::Manual).await? {
                lifted.push(unban);
            }
        }
        Ok(lifted)
    }

    async fn end_ban(
        &self,
        ban: &BanRecord,
        now: DateTime<Utc>,
        reason: UnbanReason,
    ) -> Result<Option<UnbanRecord>, BanwatchError> {
        let Some(unban) = self
            .store
            .close_ban(UnbanRecord::for_ban(ban, now, reason))
            .await?
        else {
            return Ok(None);
        };
        info!(
            address = %ban.address,
            source = %ban.source_id,
            ban_id = ban.id,
            reason = %reason,
            "Ban lifted"
        );

        if let Some(enforcer) = &self.enforcer {
            let still_covered = self
                .store
                .find_active_bans()
                .await?
                .iter()
                .any(|other| other.address == ban.address);
            if still_covered {
                debug!(address = %ban.address, "Another active ban covers this address, keeping rule");
            } else if let Err(e) = enforcer.allow(ban.address).await {
                error!(address = %ban.address, "Allow failed, will retry on reconcile: {}", e);
            }
        }

        notify_detached(
            &self.notifier,
            NotifyEvent::Unban {
                address: ban.address,
                source_id: ban.source_id.clone(),
                reason,
            },
        );
        Ok(Some(unban))
    }

    /// Addresses that should currently be denied.
    pub async fn desired_set(&self) -> Result<BTreeSet<Ipv4Addr>, BanwatchError> {
        Ok(self
            .store
            .find_active_bans()
            .await?
            .into_iter()
            .map(|ban| ban.address)
            .collect())
    }

    /// Converge the firewall with the active bans.
    pub async fn reconcile(&self) -> Result<ReconcileReport, BanwatchError> {
        let Some(enforcer) = &self.enforcer else {
            return Ok(ReconcileReport::default());
        };
        let desired = self.desired_set().await?;
        let report = enforcer.reconcile(&desired).await;
        if report.failed > 0 {
            warn!(
                denied = report.denied,
                allowed = report.allowed,
                failed = report.failed,
                "Reconcile incomplete"
            );
        } else if !report.is_noop() {
            info!(denied = report.denied, allowed = report.allowed, "Firewall reconciled");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{MockNotifier, NullNotifier};
    use crate::clock::ManualClock;
    use crate::enforcer::mock::{enforcer_with, RecordingExecutor};
    use crate::source::SourceConfig;
    use crate::store::{JsonStore, MockStore};
    use chrono::TimeZone;
    use std::time::Duration;

    struct Fixture {
        store: Arc<JsonStore>,
        executor: Arc<RecordingExecutor>,
        enforcer: Arc<Enforcer>,
        clock: Arc<ManualClock>,
        manager: BanManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(JsonStore::in_memory());
        let executor = Arc::new(RecordingExecutor::new());
        let enforcer = Arc::new(enforcer_with(Arc::clone(&executor)));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let manager = BanManager::new(
            store.clone(),
            Arc::clone(&enforcer),
            Arc::new(NullNotifier),
            clock.clone(),
        );
        Fixture {
            store,
            executor,
            enforcer,
            clock,
            manager,
        }
    }

    fn source(id: &str, ban_secs: u64) -> CompiledSource {
        let mut config = SourceConfig::file(id, "/var/log/auth.log", "from <IP>");
        config.ban_time = Duration::from_secs(ban_secs);
        CompiledSource::compile(config).unwrap()
    }

    const ADDR: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

    #[tokio::test]
    async fn test_request_ban_is_idempotent() {
        let f = fixture();
        let sshd = source("sshd", 600);

        let first = f.manager.request_ban(ADDR, &sshd, "from 1.2.3.4", 3).await.unwrap();
        let second = f.manager.request_ban(ADDR, &sshd, "from 1.2.3.4", 4).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(f.store.find_active_bans().await.unwrap().len(), 1);
        assert_eq!(f.executor.count_containing("-I banwatch -s 1.2.3.4/32"), 1);
        assert!(f.enforcer.is_applied(ADDR).await);
    }

    #[tokio::test]
    async fn test_failed_deny_still_records_ban() {
        let f = fixture();
        f.executor.fail_when("-I banwatch -s");
        let ban = f
            .manager
            .request_ban(ADDR, &source("sshd", 600), "x", 3)
            .await
            .unwrap();
        assert!(ban.is_some());
        assert!(!f.enforcer.is_applied(ADDR).await);

        f.executor.clear_failures();
        let report = f.manager.reconcile().await.unwrap();
        assert_eq!(report.denied, 1);
        assert!(f.enforcer.is_applied(ADDR).await);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let f = fixture();
        f.manager
            .request_ban(ADDR, &source("sshd", 600), "x", 3)
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(599));
        assert!(f.manager.expire_bans(|_| true).await.unwrap().is_empty());

        f.clock.advance(Duration::from_secs(1));
        let ended = f.manager.expire_bans(|_| true).await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].reason, UnbanReason::Expired);

        // A later sweep finds nothing more to do
        f.clock.advance(Duration::from_secs(60));
        assert!(f.manager.expire_bans(|_| true).await.unwrap().is_empty());

        assert_eq!(f.store.unbans().await.unwrap().len(), 1);
        assert_eq!(f.executor.count_containing("-D banwatch -s 1.2.3.4/32"), 1);
        assert!(!f.enforcer.is_applied(ADDR).await);
    }

    #[tokio::test]
    async fn test_removed_source_ends_ban() {
        let f = fixture();
        f.manager
            .request_ban(ADDR, &source("gone", 3_600), "x", 3)
            .await
            .unwrap();
        let ended = f.manager.expire_bans(|id| id != "gone").await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].reason, UnbanReason::SourceRemoved);
    }

    #[tokio::test]
    async fn test_rule_kept_while_another_source_bans_address() {
        let f = fixture();
        f.manager
            .request_ban(ADDR, &source("sshd", 60), "x", 3)
            .await
            .unwrap();
        f.manager
            .request_ban(ADDR, &source("nginx", 3_600), "x", 3)
            .await
            .unwrap();
        // One rule despite two bans
        assert_eq!(f.executor.count_containing("-I banwatch -s 1.2.3.4/32"), 1);

        f.clock.advance(Duration::from_secs(60));
        let ended = f.manager.expire_bans(|_| true).await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(f.executor.count_containing("-D banwatch"), 0);
        assert!(f.enforcer.is_applied(ADDR).await);
    }

    #[tokio::test]
    async fn test_lift_ban_and_lift_address() {
        let f = fixture();
        let ban = f
            .manager
            .request_ban(ADDR, &source("sshd", 3_600), "x", 3)
            .await
            .unwrap()
            .unwrap();
        let unban = f.manager.lift_ban(ban.id).await.unwrap().unwrap();
        assert_eq!(unban.reason, UnbanReason::Manual);
        assert_eq!(unban.ban_id, ban.id);
        assert!(f.manager.lift_ban(ban.id).await.unwrap().is_none());
        assert!(f.manager.lift_ban(999).await.unwrap().is_none());

        f.manager
            .request_ban(ADDR, &source("a", 3_600), "x", 3)
            .await
            .unwrap();
        f.manager
            .request_ban(ADDR, &source("b", 3_600), "x", 3)
            .await
            .unwrap();
        assert_eq!(f.manager.lift_address(ADDR).await.unwrap().len(), 2);
        assert!(f.manager.desired_set().await.unwrap().is_empty());
        assert!(!f.enforcer.is_applied(ADDR).await);
    }

    #[tokio::test]
    async fn test_offline_manager_only_touches_records() {
        let store = Arc::new(JsonStore::in_memory());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let manager = BanManager::offline(store.clone(), Arc::new(NullNotifier), clock);
        manager
            .request_ban(ADDR, &source("sshd", 60), "x", 3)
            .await
            .unwrap();
        assert_eq!(manager.lift_address(ADDR).await.unwrap().len(), 1);
        assert!(manager.reconcile().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_ban_created_is_notified() {
        let store = Arc::new(JsonStore::in_memory());
        let executor = Arc::new(RecordingExecutor::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(move |event| {
            let _ = tx.send(event);
            Ok(())
        });
        let manager = BanManager::new(
            store,
            Arc::new(enforcer_with(executor)),
            Arc::new(notifier),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())),
        );
        manager
            .request_ban(ADDR, &source("sshd", 60), "from 1.2.3.4", 3)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            NotifyEvent::BanCreated {
                address: ADDR,
                source_id: "sshd".to_string(),
                source_name: "sshd".to_string(),
                line: "from 1.2.3.4".to_string(),
                match_count: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_persistence_error_propagates() {
        let mut store = MockStore::new();
        store
            .expect_find_active_ban()
            .returning(|_, _| Err(BanwatchError::persistence("disk full")));
        let manager = BanManager::offline(
            Arc::new(store),
            Arc::new(NullNotifier),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())),
        );
        let err = manager
            .request_ban(ADDR, &source("sshd", 60), "x", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, BanwatchError::Persistence(_)));
    }

    fn expired_ban(id: u64, address: Ipv4Addr) -> BanRecord {
        let mut ban = BanRecord::new(
            address,
            "sshd",
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Duration::from_secs(60),
        );
        ban.id = id;
        ban
    }

    #[tokio::test]
    async fn test_failed_ban_write_skips_deny_and_notification() {
        let mut store = MockStore::new();
        store.expect_find_active_ban().returning(|_, _| Ok(None));
        store
            .expect_create_ban()
            .returning(|_| Err(BanwatchError::persistence("disk full")));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(0);
        let executor = Arc::new(RecordingExecutor::new());
        let manager = BanManager::new(
            Arc::new(store),
            Arc::new(enforcer_with(Arc::clone(&executor))),
            Arc::new(notifier),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())),
        );

        let err = manager
            .request_ban(ADDR, &source("sshd", 60), "x", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, BanwatchError::Persistence(_)));
        assert_eq!(executor.count_containing("-I banwatch -s"), 0);
    }

    #[tokio::test]
    async fn test_one_failed_unban_does_not_stop_the_sweep() {
        let first = expired_ban(1, ADDR);
        let second = expired_ban(2, Ipv4Addr::new(5, 6, 7, 8));
        let mut store = MockStore::new();
        store
            .expect_find_active_bans()
            .returning(move || Ok(vec![first.clone(), second.clone()]));
        store.expect_close_ban().returning(|unban| {
            if unban.ban_id == 1 {
                Err(BanwatchError::persistence("disk full"))
            } else {
                Ok(Some(unban))
            }
        });
        let manager = BanManager::offline(
            Arc::new(store),
            Arc::new(NullNotifier),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap())),
        );

        let ended = manager.expire_bans(|_| true).await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].ban_id, 2);
    }

    #[tokio::test]
    async fn test_unban_retried_after_store_recovers() {
        let dir = tempfile::TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let store = Arc::new(JsonStore::open(&state_dir.join("records.json")).unwrap());
        let executor = Arc::new(RecordingExecutor::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let manager = BanManager::new(
            store.clone(),
            Arc::new(enforcer_with(Arc::clone(&executor))),
            Arc::new(NullNotifier),
            clock.clone(),
        );
        manager
            .request_ban(ADDR, &source("sshd", 60), "x", 3)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(60));

        std::fs::remove_dir_all(&state_dir).unwrap();
        assert!(manager.expire_bans(|_| true).await.unwrap().is_empty());
        assert_eq!(store.find_active_bans().await.unwrap().len(), 1);
        assert_eq!(executor.count_containing("-D banwatch -s"), 0);

        std::fs::create_dir_all(&state_dir).unwrap();
        let ended = manager.expire_bans(|_| true).await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(store.unbans().await.unwrap().len(), 1);
        assert_eq!(executor.count_containing("-D banwatch -s 1.2.3.4/32"), 1);
    }
}
