use super::DomainStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::lifecycle::DomainPatch;
use portyo_common::models::{NewCustomDomain, UpdateRoutingPreferences};
use portyo_common::{DomainError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 进程内存储，用于 `USE_MEMORY_STORE=true` 和测试。认领与条件更新都在写锁内完成。
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<Uuid, Model>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut list: Vec<Model>) -> Vec<Model> {
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.domain.cmp(&b.domain)));
        list
    }

    async fn filtered(&self, keep: impl Fn(&Model) -> bool) -> Vec<Model> {
        let records = self.records.read().await;
        Self::sorted(records.values().filter(|m| keep(m)).cloned().collect())
    }

    async fn remove_where(&self, keep: impl Fn(&Model) -> bool) -> u64 {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, m| keep(m));
        (before - records.len()) as u64
    }
}

#[async_trait]
impl DomainStore for MemoryStore {
    async fn create(&self, new: NewCustomDomain, now: DateTime<Utc>) -> Result<Model> {
        let mut records = self.records.write().await;
        if records.values().any(|m| m.domain == new.domain) {
            return Err(DomainError::DuplicateDomain(new.domain));
        }
        let model = Model {
            id: Uuid::new_v4(),
            domain: new.domain,
            bio_id: new.bio_id,
            user_id: new.user_id,
            status: DomainStatus::Pending,
            error_message: None,
            expected_dns_value: Some(new.expected_dns_value),
            dns_verified_at: None,
            actual_dns_value: None,
            ssl_active: false,
            ssl_expires_at: None,
            ssl_certificate_path: None,
            ssl_private_key_path: None,
            last_checked_at: None,
            activated_at: None,
            retry_count: 0,
            last_error_at: None,
            redirect_www: true,
            force_https: false,
            redirect_to: None,
            verification_token: Some(new.verification_token),
            last_health_check_at: None,
            is_healthy: true,
            dns_check_started_at: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Model>> {
        let records = self.records.read().await;
        Ok(records.values().find(|m| m.domain == domain).cloned())
    }

    async fn list_by_bio(&self, bio_id: Uuid) -> Result<Vec<Model>> {
        Ok(self.filtered(|m| m.bio_id == bio_id).await)
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Model>> {
        Ok(self.filtered(|m| m.user_id == user_id).await)
    }

    async fn list_by_status(&self, statuses: &[DomainStatus]) -> Result<Vec<Model>> {
        Ok(self.filtered(|m| statuses.contains(&m.status)).await)
    }

    async fn list_all(&self) -> Result<Vec<Model>> {
        Ok(self.filtered(|_| true).await)
    }

    async fn update_preferences(
        &self,
        id: Uuid,
        prefs: &UpdateRoutingPreferences,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>> {
        let mut records = self.records.write().await;
        let Some(model) = records.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(redirect_www) = prefs.redirect_www {
            model.redirect_www = redirect_www;
        }
        if let Some(force_https) = prefs.force_https {
            model.force_https = force_https;
        }
        if let Some(redirect_to) = &prefs.redirect_to {
            model.redirect_to = redirect_to.clone();
        }
        model.updated_at = now;
        Ok(Some(model.clone()))
    }

    async fn claim(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Model>> {
        let mut records = self.records.write().await;
        let Some(model) = records.get_mut(&id) else {
            return Ok(None);
        };
        if model.is_leased(now) {
            return Ok(None);
        }
        model.lease_owner = Some(owner.to_string());
        model.lease_expires_at = Some(now + ttl);
        Ok(Some(model.clone()))
    }

    async fn update(
        &self,
        id: Uuid,
        owner: &str,
        patch: &DomainPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>> {
        let mut records = self.records.write().await;
        let Some(model) = records.get_mut(&id) else {
            return Ok(None);
        };
        if model.lease_owner.as_deref() != Some(owner) {
            return Ok(None);
        }
        patch.apply_to(model);
        model.updated_at = now;
        Ok(Some(model.clone()))
    }

    async fn release(&self, id: Uuid, owner: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(model) = records.get_mut(&id)
            && model.lease_releasable_by(owner)
        {
            model.lease_owner = None;
            model.lease_expires_at = None;
        }
        Ok(())
    }

    async fn override_lifecycle(
        &self,
        id: Uuid,
        expected: DomainStatus,
        patch: &DomainPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>> {
        let mut records = self.records.write().await;
        let Some(model) = records.get_mut(&id) else {
            return Ok(None);
        };
        if model.status != expected {
            return Ok(None);
        }
        let (lease_owner, lease_expires_at) = model.revoked_lease(now);
        patch.apply_to(model);
        model.lease_owner = lease_owner;
        model.lease_expires_at = lease_expires_at;
        model.updated_at = now;
        Ok(Some(model.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn delete_by_bio(&self, bio_id: Uuid) -> Result<u64> {
        Ok(self.remove_where(|m| m.bio_id != bio_id).await)
    }

    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64> {
        Ok(self.remove_where(|m| m.user_id != user_id).await)
    }
}
