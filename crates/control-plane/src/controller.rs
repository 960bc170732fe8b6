//! 生命周期控制器
//!
//! 周期性 tick 把到期的记录交给有界 worker 池。每个 worker 先认领记录的租约，
//! 执行当前状态对应的阶段，再在租约下写回结果。

use crate::dns::DnsVerifier;
use crate::health::HealthMonitor;
use crate::issuer::CertificateIssuer;
use crate::metrics;
use crate::store::DomainStore;
use chrono::{DateTime, Utc};
use portyo_common::config::LifecyclePolicy;
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::lifecycle::{self, DomainPatch};
use portyo_common::snapshot::build_snapshot;
use portyo_common::state::RoutingTable;
use portyo_common::{DomainError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 一次认领内最长的链：pending -> verifying_dns -> DNS 检查
const MAX_STEPS_PER_CLAIM: usize = 4;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub transitions: usize,
}

enum Outcome {
    Processed { transitions: usize },
    Skipped,
}

#[derive(Clone)]
pub struct Controller {
    store: Arc<dyn DomainStore>,
    verifier: Arc<DnsVerifier>,
    issuer: Arc<CertificateIssuer>,
    health: Arc<HealthMonitor>,
    routing: RoutingTable,
    policy: Arc<LifecyclePolicy>,
    controller_id: Arc<str>,
    permits: Arc<Semaphore>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DomainStore>,
        verifier: Arc<DnsVerifier>,
        issuer: Arc<CertificateIssuer>,
        health: Arc<HealthMonitor>,
        routing: RoutingTable,
        policy: LifecyclePolicy,
        controller_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            verifier,
            issuer,
            health,
            routing,
            policy: Arc::new(policy),
            controller_id: Arc::from(controller_id.into()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub async fn run(self, interval: Duration) {
        info!(
            controller_id = %self.controller_id,
            interval_secs = interval.as_secs(),
            "domain controller started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(report) if report.due > 0 => info!(
                    due = report.due,
                    processed = report.processed,
                    skipped = report.skipped,
                    errors = report.errors,
                    transitions = report.transitions,
                    "controller tick finished"
                ),
                Ok(_) => {}
                Err(err) => error!("controller tick failed: {}", err),
            }
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// 以 `now` 为当前时间执行一轮调度
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let started = Instant::now();
        let processable: Vec<DomainStatus> = DomainStatus::ALL
            .into_iter()
            .filter(|s| s.is_processable())
            .collect();

        let due: Vec<Model> = self
            .store
            .list_by_status(&processable)
            .await?
            .into_iter()
            .filter(|r| !r.is_leased(now) && lifecycle::is_due(r, now, &self.policy))
            .collect();

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        let mut workers = JoinSet::new();
        for record in due {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| DomainError::Internal(err.into()))?;
            let controller = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                let domain = record.domain.clone();
                (domain, controller.process(record.id, now).await)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(Outcome::Processed { transitions }))) => {
                    report.processed += 1;
                    report.transitions += transitions;
                }
                Ok((_, Ok(Outcome::Skipped))) => report.skipped += 1,
                Ok((domain, Err(err))) => {
                    report.errors += 1;
                    warn!(domain = %domain, error = %err, "record processing failed, retrying next tick");
                }
                Err(err) => {
                    report.errors += 1;
                    error!("controller worker panicked: {}", err);
                }
            }
        }

        self.refresh_routing(now).await?;
        metrics::observe_tick(started.elapsed().as_secs_f64());
        Ok(report)
    }

    pub async fn refresh_routing(&self, now: DateTime<Utc>) -> Result<()> {
        let records = self.store.list_all().await?;
        self.routing.apply(build_snapshot(&records, now)).await;
        Ok(())
    }

    async fn process(&self, id: Uuid, now: DateTime<Utc>) -> Result<Outcome> {
        let lease = format!("{}/{}", self.controller_id, Uuid::new_v4());
        let Some(record) = self
            .store
            .claim(id, &lease, now, self.policy.lease_ttl)
            .await?
        else {
            debug!(%id, "record already claimed or removed");
            return Ok(Outcome::Skipped);
        };

        // 列表读取之后可能已被暂停或删除，以租约拿到的最新记录为准
        let outcome = if lifecycle::is_due(&record, now, &self.policy) {
            self.advance(record, &lease, now).await
        } else {
            Ok(Outcome::Skipped)
        };

        if let Err(err) = self.store.release(id, &lease).await {
            warn!(%id, error = %err, "failed to release lease, it will expire");
        }
        outcome
    }

    async fn advance(&self, mut record: Model, lease: &str, now: DateTime<Utc>) -> Result<Outcome> {
        let mut transitions = 0;

        for _ in 0..MAX_STEPS_PER_CLAIM {
            let from = record.status;
            let next = match from {
                DomainStatus::Pending => {
                    let patch = lifecycle::begin_dns_verification(&record, now)?;
                    self.persist(&record, lease, patch, now).await?
                }
                DomainStatus::VerifyingDns => {
                    let patch = self.verifier.verify(&record, now, &self.policy).await?;
                    self.persist(&record, lease, patch, now).await?
                }
                DomainStatus::DnsVerified => {
                    let patch = lifecycle::begin_issuance(&record, now)?;
                    self.persist(&record, lease, patch, now).await?
                }
                DomainStatus::GeneratingSsl => {
                    let patch = self.issuer.issue(&record, now, &self.policy).await?;
                    self.persist(&record, lease, patch, now).await?
                }
                DomainStatus::Active => {
                    let renewed = match self.issuer.renew(&record, now, &self.policy).await? {
                        patch if patch.is_empty() => Some(record.clone()),
                        patch => self.persist(&record, lease, patch, now).await?,
                    };
                    match renewed {
                        Some(current) if lifecycle::health_due(&current, now, &self.policy) => {
                            let patch = self.health.check(&current, now).await?;
                            self.persist(&current, lease, patch, now).await?
                        }
                        other => other,
                    }
                }
                DomainStatus::Failed | DomainStatus::Expired | DomainStatus::Suspended => {
                    break;
                }
            };

            let Some(next) = next else {
                info!(domain = %record.domain, status = %from, "lease lost, abandoning stale work");
                break;
            };
            if next.status != from {
                transitions += 1;
            }
            record = next;

            // 只有创建后的第一次验证和 generating_ssl 的准备步骤在同一次认领内继续
            if !matches!(
                (from, record.status),
                (DomainStatus::Pending, DomainStatus::VerifyingDns)
                    | (DomainStatus::DnsVerified, DomainStatus::GeneratingSsl)
            ) {
                break;
            }
        }

        Ok(Outcome::Processed { transitions })
    }

    /// 在租约下写回 `patch`。返回 `None` 表示记录已被管理操作或其他 worker
    /// 拿走，本次结果作废。
    async fn persist(
        &self,
        record: &Model,
        lease: &str,
        patch: DomainPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>> {
        if patch.is_empty() {
            return Ok(Some(record.clone()));
        }
        lifecycle::validate_invariants(&patch.applied(record))?;

        let Some(updated) = self.store.update(record.id, lease, &patch, now).await? else {
            return Ok(None);
        };
        if updated.status != record.status {
            metrics::inc_transition(record.status, updated.status);
            info!(
                domain = %updated.domain,
                from = %record.status,
                to = %updated.status,
                retry_count = updated.retry_count,
                error = updated.error_message.as_deref().unwrap_or(""),
                "domain status changed"
            );
        }
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertificateAuthority;
    use crate::dns::DnsLookup;
    use crate::store::MemoryStore;
    use crate::testing::{ScriptedAuthority, ScriptedDns, temp_storage};
    use chrono::Duration as TimeDelta;
    use portyo_common::lifecycle::DNS_TIMEOUT_MESSAGE;
    use portyo_common::models::NewCustomDomain;
    use portyo_common::snapshot::RoutingSnapshot;

    struct Harness {
        store: Arc<MemoryStore>,
        dns: Arc<ScriptedDns>,
        ca: Arc<ScriptedAuthority>,
        routing: RoutingTable,
        controller: Controller,
    }

    fn controller(
        id: &str,
        store: Arc<MemoryStore>,
        dns: Arc<ScriptedDns>,
        ca: Arc<ScriptedAuthority>,
        routing: RoutingTable,
    ) -> Controller {
        let lookup: Arc<dyn DnsLookup> = dns;
        let authority: Arc<dyn CertificateAuthority> = ca;
        let verifier = Arc::new(DnsVerifier::new(
            lookup,
            "cname.portyo.me",
            vec![],
            Duration::from_millis(200),
        ));
        let issuer = Arc::new(CertificateIssuer::new(
            authority,
            temp_storage(),
            Duration::from_secs(2),
        ));
        let health = Arc::new(HealthMonitor::new(verifier.clone(), issuer.clone()));
        Controller::new(
            store,
            verifier,
            issuer,
            health,
            routing,
            LifecyclePolicy::default(),
            id,
            4,
        )
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let dns = Arc::new(ScriptedDns::default());
        let ca = Arc::new(ScriptedAuthority::default());
        let routing = RoutingTable::new(RoutingSnapshot::default());
        let controller = controller(
            "controller-a",
            store.clone(),
            dns.clone(),
            ca.clone(),
            routing.clone(),
        );
        Harness {
            store,
            dns,
            ca,
            routing,
            controller,
        }
    }

    async fn create(store: &MemoryStore, domain: &str, now: DateTime<Utc>) -> Model {
        store
            .create(
                NewCustomDomain {
                    domain: domain.to_string(),
                    bio_id: Uuid::new_v4(),
                    user_id: Uuid::new_v4(),
                    expected_dns_value: "cname.portyo.me".to_string(),
                    verification_token: "token".to_string(),
                },
                now,
            )
            .await
            .unwrap()
    }

    async fn reload(store: &MemoryStore, id: Uuid) -> Model {
        store.find_by_id(id).await.unwrap().unwrap()
    }

    /// 跑完整条流水线直到 active
    async fn activate(h: &Harness, domain: &str, t0: DateTime<Utc>) -> Model {
        h.dns.set_cname(domain, &["cname.portyo.me"]);
        let rec = create(&h.store, domain, t0).await;
        h.controller.tick_at(t0).await.unwrap();
        h.controller
            .tick_at(t0 + TimeDelta::minutes(2))
            .await
            .unwrap();
        let active = reload(&h.store, rec.id).await;
        assert_eq!(active.status, DomainStatus::Active);
        active
    }

    #[tokio::test]
    async fn test_new_domain_reaches_dns_verified_in_one_tick() {
        let h = harness();
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["cname.portyo.me"]);
        let rec = create(&h.store, "foo.example.com", t0).await;

        let report = h.controller.tick_at(t0).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.transitions, 2);

        let rec = reload(&h.store, rec.id).await;
        assert_eq!(rec.status, DomainStatus::DnsVerified);
        assert_eq!(rec.dns_verified_at, Some(t0));
        assert_eq!(rec.actual_dns_value.as_deref(), Some("cname.portyo.me"));
        assert_eq!(rec.retry_count, 0);
        assert!(rec.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_wrong_target_for_two_days_fails_with_dns_timeout() {
        let h = harness();
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["other-host.com"]);
        let rec = create(&h.store, "foo.example.com", t0).await;

        for hour in 0..50 {
            h.controller
                .tick_at(t0 + TimeDelta::hours(hour))
                .await
                .unwrap();
            let current = reload(&h.store, rec.id).await;
            assert_ne!(current.status, DomainStatus::DnsVerified);
        }

        let rec = reload(&h.store, rec.id).await;
        assert_eq!(rec.status, DomainStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some(DNS_TIMEOUT_MESSAGE));
        assert_eq!(rec.actual_dns_value.as_deref(), Some("other-host.com"));
        assert!(rec.last_error_at.is_some());
    }

    #[tokio::test]
    async fn test_issuance_activates_once() {
        let h = harness();
        let t0 = Utc::now();
        let active = activate(&h, "foo.example.com", t0).await;
        assert!(active.ssl_active);
        assert!(active.ssl_certificate_path.is_some());
        assert!(active.ssl_private_key_path.is_some());
        assert!(active.ssl_expires_at.is_some());
        let activated_at = active.activated_at;
        assert_eq!(activated_at, Some(t0 + TimeDelta::minutes(2)));
        assert_eq!(h.ca.issued(), 1);

        // 再跑几轮只做健康检查，activatedAt 不变
        for hours in [1, 2, 3] {
            h.controller
                .tick_at(t0 + TimeDelta::hours(hours))
                .await
                .unwrap();
        }
        let again = reload(&h.store, active.id).await;
        assert_eq!(again.status, DomainStatus::Active);
        assert_eq!(again.activated_at, activated_at);
        assert_eq!(h.ca.issued(), 1);
    }

    #[tokio::test]
    async fn test_renewal_inside_window_keeps_active() {
        let h = harness();
        let t0 = Utc::now();
        let active = activate(&h, "foo.example.com", t0).await;
        let old_expiry = active.ssl_expires_at.unwrap();

        let renew_at = old_expiry - TimeDelta::days(20);
        h.ca.set_now(renew_at);
        h.controller.tick_at(renew_at).await.unwrap();

        let renewed = reload(&h.store, active.id).await;
        assert_eq!(renewed.status, DomainStatus::Active);
        assert!(renewed.ssl_active);
        assert!(renewed.ssl_expires_at.unwrap() > old_expiry);
        assert_eq!(renewed.activated_at, active.activated_at);
        assert_eq!(h.ca.issued(), 2);
    }

    #[tokio::test]
    async fn test_dns_drift_sends_record_back_to_verification() {
        let h = harness();
        let t0 = Utc::now();
        let active = activate(&h, "foo.example.com", t0).await;

        h.dns.set_cname("foo.example.com", &["other-host.com"]);
        h.controller
            .tick_at(t0 + TimeDelta::hours(2))
            .await
            .unwrap();

        let drifted = reload(&h.store, active.id).await;
        assert_eq!(drifted.status, DomainStatus::VerifyingDns);
        assert!(!drifted.is_healthy);
        assert_eq!(drifted.actual_dns_value.as_deref(), Some("other-host.com"));

        let route = h.routing.lookup("foo.example.com").await.unwrap();
        assert!(!route.serving);
    }

    #[tokio::test]
    async fn test_second_tick_at_same_instant_is_noop() {
        let h = harness();
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["cname.portyo.me"]);
        let rec = create(&h.store, "foo.example.com", t0).await;

        h.controller.tick_at(t0).await.unwrap();
        let first = reload(&h.store, rec.id).await;
        let queries = h.dns.queries();

        let report = h.controller.tick_at(t0).await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(reload(&h.store, rec.id).await, first);
        assert_eq!(h.dns.queries(), queries);
    }

    #[tokio::test]
    async fn test_racing_controllers_issue_one_certificate() {
        let h = harness();
        let other = controller(
            "controller-b",
            h.store.clone(),
            h.dns.clone(),
            h.ca.clone(),
            h.routing.clone(),
        );
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["cname.portyo.me"]);
        let rec = create(&h.store, "foo.example.com", t0).await;
        h.controller.tick_at(t0).await.unwrap();
        h.ca.set_delay(Duration::from_millis(100));

        let later = t0 + TimeDelta::minutes(2);
        let (a, b) = tokio::join!(h.controller.tick_at(later), other.tick_at(later));
        a.unwrap();
        b.unwrap();

        let rec = reload(&h.store, rec.id).await;
        assert_eq!(rec.status, DomainStatus::Active);
        assert_eq!(h.ca.issued(), 1);
    }

    #[tokio::test]
    async fn test_suspension_during_issuance_wins() {
        let h = harness();
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["cname.portyo.me"]);
        let rec = create(&h.store, "foo.example.com", t0).await;
        h.controller.tick_at(t0).await.unwrap();
        h.ca.set_delay(Duration::from_millis(300));

        let controller = h.controller.clone();
        let later = t0 + TimeDelta::minutes(2);
        let tick = tokio::spawn(async move { controller.tick_at(later).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = reload(&h.store, rec.id).await;
        assert_eq!(current.status, DomainStatus::GeneratingSsl);
        let patch = lifecycle::suspend(&current, "abuse report").unwrap();
        h.store
            .override_lifecycle(rec.id, DomainStatus::GeneratingSsl, &patch, later)
            .await
            .unwrap()
            .unwrap();

        tick.await.unwrap().unwrap();
        let rec = reload(&h.store, rec.id).await;
        assert_eq!(rec.status, DomainStatus::Suspended);
        assert!(!rec.ssl_active);
        assert_eq!(rec.error_message.as_deref(), Some("abuse report"));

        // 暂停的记录不再被处理
        let report = h
            .controller
            .tick_at(later + TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_reactivation_waits_for_abandoned_issuance() {
        let h = harness();
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["cname.portyo.me"]);
        let rec = create(&h.store, "foo.example.com", t0).await;
        h.controller.tick_at(t0).await.unwrap();
        h.ca.set_delay(Duration::from_millis(500));

        let controller = h.controller.clone();
        let later = t0 + TimeDelta::minutes(2);
        let tick = tokio::spawn(async move { controller.tick_at(later).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = reload(&h.store, rec.id).await;
        assert_eq!(current.status, DomainStatus::GeneratingSsl);
        let patch = lifecycle::suspend(&current, "abuse report").unwrap();
        let suspended = h
            .store
            .override_lifecycle(rec.id, DomainStatus::GeneratingSsl, &patch, later)
            .await
            .unwrap()
            .unwrap();
        let patch = lifecycle::reactivate(&suspended, later).unwrap();
        h.store
            .override_lifecycle(rec.id, DomainStatus::Suspended, &patch, later)
            .await
            .unwrap()
            .unwrap();

        // 旧 worker 还在等 CA，重新激活的记录不能被其他 tick 认领
        for minutes in [3, 4] {
            let report = h
                .controller
                .tick_at(t0 + TimeDelta::minutes(minutes))
                .await
                .unwrap();
            assert_eq!(report.due, 0);
        }

        tick.await.unwrap().unwrap();
        assert_eq!(h.ca.issued(), 1);
        let rec = reload(&h.store, rec.id).await;
        assert_eq!(rec.status, DomainStatus::VerifyingDns);
        assert!(!rec.ssl_active);
        assert!(rec.ssl_certificate_path.is_none());
        assert!(rec.lease_owner.is_none());

        // 旧 worker 释放后流水线照常推进
        h.ca.set_delay(Duration::ZERO);
        h.controller
            .tick_at(later + TimeDelta::hours(1))
            .await
            .unwrap();
        h.controller
            .tick_at(later + TimeDelta::hours(2))
            .await
            .unwrap();
        let rec = reload(&h.store, rec.id).await;
        assert_eq!(rec.status, DomainStatus::Active);
        assert_eq!(h.ca.issued(), 2);
    }

    #[tokio::test]
    async fn test_delete_during_issuance_is_tolerated() {
        let h = harness();
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["cname.portyo.me"]);
        let rec = create(&h.store, "foo.example.com", t0).await;
        h.controller.tick_at(t0).await.unwrap();
        h.ca.set_delay(Duration::from_millis(300));

        let controller = h.controller.clone();
        let tick = tokio::spawn(async move {
            controller.tick_at(t0 + TimeDelta::minutes(2)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.store.delete(rec.id).await.unwrap());

        let report = tick.await.unwrap().unwrap();
        assert_eq!(report.errors, 0);
        assert!(h.store.find_by_id(rec.id).await.unwrap().is_none());
        assert!(h.routing.lookup("foo.example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_issuance_failures_exhaust_to_failed() {
        let h = harness();
        let t0 = Utc::now();
        h.dns.set_cname("foo.example.com", &["cname.portyo.me"]);
        let rec = create(&h.store, "foo.example.com", t0).await;
        h.controller.tick_at(t0).await.unwrap();
        h.ca.fail_next(100);

        let mut now = t0;
        for _ in 0..10 {
            now += TimeDelta::hours(2);
            h.controller.tick_at(now).await.unwrap();
        }

        let rec = reload(&h.store, rec.id).await;
        assert_eq!(rec.status, DomainStatus::Failed);
        assert!(rec.retry_count > LifecyclePolicy::default().issuance_max_retries);
        assert!(rec.error_message.unwrap().contains("rate limited"));
        assert_eq!(h.ca.issued(), 0);
    }
}
