use super::DomainStore;
use crate::txn;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use portyo_common::entities::custom_domains::{
    self, Column, DomainStatus, Entity, Model, revoked_owner,
};
use portyo_common::lifecycle::DomainPatch;
use portyo_common::models::{NewCustomDomain, UpdateRoutingPreferences};
use portyo_common::{DomainError, Result};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
};
use uuid::Uuid;

#[cfg_attr(not(test), derive(Clone))]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn list(&self, condition: Condition) -> Result<Vec<Model>> {
        Ok(Entity::find()
            .filter(condition)
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?)
    }
}

fn set<T>(target: &mut ActiveValue<T>, value: &Option<T>)
where
    T: Clone + Into<sea_orm::Value>,
{
    if let Some(v) = value {
        *target = Set(v.clone());
    }
}

/// 只包含 patch 中出现的列，其余保持 NotSet
fn patch_columns(patch: &DomainPatch, now: DateTime<Utc>) -> custom_domains::ActiveModel {
    let mut active = <custom_domains::ActiveModel as Default>::default();
    set(&mut active.status, &patch.status);
    set(&mut active.error_message, &patch.error_message);
    set(&mut active.actual_dns_value, &patch.actual_dns_value);
    set(&mut active.dns_verified_at, &patch.dns_verified_at);
    set(&mut active.dns_check_started_at, &patch.dns_check_started_at);
    set(&mut active.ssl_active, &patch.ssl_active);
    set(&mut active.ssl_expires_at, &patch.ssl_expires_at);
    set(&mut active.ssl_certificate_path, &patch.ssl_certificate_path);
    set(&mut active.ssl_private_key_path, &patch.ssl_private_key_path);
    set(&mut active.last_checked_at, &patch.last_checked_at);
    set(&mut active.activated_at, &patch.activated_at);
    set(&mut active.retry_count, &patch.retry_count);
    set(&mut active.last_error_at, &patch.last_error_at);
    set(&mut active.last_health_check_at, &patch.last_health_check_at);
    set(&mut active.is_healthy, &patch.is_healthy);
    active.updated_at = Set(now);
    active
}

#[async_trait]
impl DomainStore for SeaOrmStore {
    async fn create(&self, new: NewCustomDomain, now: DateTime<Utc>) -> Result<Model> {
        let domain = new.domain.clone();
        let created = txn!(&self.db, |txn| {
            let existing = Entity::find()
                .filter(Column::Domain.eq(new.domain.as_str()))
                .one(txn)
                .await?;
            if existing.is_some() {
                return Err(DomainError::DuplicateDomain(new.domain));
            }

            let active = custom_domains::ActiveModel {
                id: Set(Uuid::new_v4()),
                domain: Set(new.domain),
                bio_id: Set(new.bio_id),
                user_id: Set(new.user_id),
                status: Set(DomainStatus::Pending),
                error_message: Set(None),
                expected_dns_value: Set(Some(new.expected_dns_value)),
                dns_verified_at: Set(None),
                actual_dns_value: Set(None),
                ssl_active: Set(false),
                ssl_expires_at: Set(None),
                ssl_certificate_path: Set(None),
                ssl_private_key_path: Set(None),
                last_checked_at: Set(None),
                activated_at: Set(None),
                retry_count: Set(0),
                last_error_at: Set(None),
                redirect_www: Set(true),
                force_https: Set(false),
                redirect_to: Set(None),
                verification_token: Set(Some(new.verification_token)),
                last_health_check_at: Set(None),
                is_healthy: Set(true),
                dns_check_started_at: Set(None),
                lease_owner: Set(None),
                lease_expires_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            };
            Ok(active.insert(txn).await?)
        });

        match created.map_err(DomainError::from) {
            // 并发创建时由唯一约束兜底
            Err(DomainError::Database(err))
                if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) =>
            {
                Err(DomainError::DuplicateDomain(domain))
            }
            other => Ok(other?),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>> {
        Ok(Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Model>> {
        Ok(Entity::find()
            .filter(Column::Domain.eq(domain))
            .one(&self.db)
            .await?)
    }

    async fn list_by_bio(&self, bio_id: Uuid) -> Result<Vec<Model>> {
        self.list(Condition::all().add(Column::BioId.eq(bio_id))).await
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Model>> {
        self.list(Condition::all().add(Column::UserId.eq(user_id))).await
    }

    async fn list_by_status(&self, statuses: &[DomainStatus]) -> Result<Vec<Model>> {
        self.list(Condition::all().add(Column::Status.is_in(statuses.iter().copied())))
            .await
    }

    async fn list_all(&self) -> Result<Vec<Model>> {
        self.list(Condition::all()).await
    }

    async fn update_preferences(
        &self,
        id: Uuid,
        prefs: &UpdateRoutingPreferences,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>> {
        let Some(model) = Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        let mut active: custom_domains::ActiveModel = model.into();
        if let Some(redirect_www) = prefs.redirect_www {
            active.redirect_www = Set(redirect_www);
        }
        if let Some(force_https) = prefs.force_https {
            active.force_https = Set(force_https);
        }
        if let Some(redirect_to) = &prefs.redirect_to {
            active.redirect_to = Set(redirect_to.clone());
        }
        active.updated_at = Set(now);
        Ok(Some(active.update(&self.db).await?))
    }

    async fn claim(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Model>> {
        let result = Entity::update_many()
            .col_expr(Column::LeaseOwner, Expr::value(owner.to_string()))
            .col_expr(Column::LeaseExpiresAt, Expr::value(now + ttl))
            .filter(Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(Column::LeaseOwner.is_null())
                    .add(Column::LeaseExpiresAt.is_null())
                    .add(Column::LeaseExpiresAt.lte(now)),
            )
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    async fn update(
        &self,
        id: Uuid,
        owner: &str,
        patch: &DomainPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>> {
        let result = Entity::update_many()
            .set(patch_columns(patch, now))
            .filter(Column::Id.eq(id))
            .filter(Column::LeaseOwner.eq(owner))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    async fn release(&self, id: Uuid, owner: &str) -> Result<()> {
        Entity::update_many()
            .col_expr(Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(
                Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(Column::LeaseOwner.eq(owner))
                    .add(Column::LeaseOwner.eq(revoked_owner(owner))),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn override_lifecycle(
        &self,
        id: Uuid,
        expected: DomainStatus,
        patch: &DomainPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>> {
        let patch = patch.clone();
        let updated = txn!(&self.db, |txn| {
            // 行锁保证读到的租约和写回的撤销标记一致
            let Some(current) = Entity::find_by_id(id)
                .filter(Column::Status.eq(expected))
                .lock_exclusive()
                .one(txn)
                .await?
            else {
                return Ok(None);
            };
            let (lease_owner, lease_expires_at) = current.revoked_lease(now);
            let mut active = patch_columns(&patch, now);
            active.lease_owner = Set(lease_owner);
            active.lease_expires_at = Set(lease_expires_at);
            Entity::update_many()
                .set(active)
                .filter(Column::Id.eq(id))
                .exec(txn)
                .await?;
            Ok(Entity::find_by_id(id).one(txn).await?)
        });
        Ok(updated?)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    async fn delete_by_bio(&self, bio_id: Uuid) -> Result<u64> {
        let result = Entity::delete_many()
            .filter(Column::BioId.eq(bio_id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64> {
        let result = Entity::delete_many()
            .filter(Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[test]
    fn test_patch_columns_only_sets_present_fields() {
        let now = Utc::now();
        let patch = DomainPatch {
            status: Some(DomainStatus::DnsVerified),
            actual_dns_value: Some(None),
            retry_count: Some(0),
            ..Default::default()
        };
        let active = patch_columns(&patch, now);
        assert_eq!(active.status, Set(DomainStatus::DnsVerified));
        assert_eq!(active.actual_dns_value, Set(None));
        assert_eq!(active.retry_count, Set(0));
        assert_eq!(active.updated_at, Set(now));
        assert!(active.ssl_active.is_not_set());
        assert!(active.error_message.is_not_set());
        assert!(active.lease_owner.is_not_set());
    }

    fn new_domain(domain: &str) -> NewCustomDomain {
        NewCustomDomain {
            domain: domain.to_string(),
            bio_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            expected_dns_value: "cname.portyo.me".to_string(),
            verification_token: "token".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_inserts_pending_record() {
        let inserted = record("foo.example.com", DomainStatus::Pending);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<Model>::new()])
            .append_query_results([vec![inserted.clone()]])
            .into_connection();
        let store = SeaOrmStore::new(db);

        let created = store
            .create(new_domain("foo.example.com"), Utc::now())
            .await
            .unwrap();
        assert_eq!(created, inserted);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_domain() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![record("foo.example.com", DomainStatus::Active)]])
            .into_connection();
        let store = SeaOrmStore::new(db);

        let err = store
            .create(new_domain("foo.example.com"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DuplicateDomain(d) if d == "foo.example.com"));
    }

    #[tokio::test]
    async fn test_override_fences_live_lease() {
        let now = Utc::now();
        let mut current = record("foo.example.com", DomainStatus::GeneratingSsl);
        current.lease_owner = Some("controller-a/1".to_string());
        current.lease_expires_at = Some(now + Duration::minutes(5));
        let mut suspended = current.clone();
        suspended.status = DomainStatus::Suspended;
        suspended.lease_owner = Some("revoked:controller-a/1".to_string());

        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![current]])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .append_query_results([vec![suspended.clone()]])
            .into_connection();
        let store = SeaOrmStore::new(db);

        let patch = DomainPatch {
            status: Some(DomainStatus::Suspended),
            ..Default::default()
        };
        let updated = store
            .override_lifecycle(suspended.id, DomainStatus::GeneratingSsl, &patch, now)
            .await
            .unwrap();
        assert_eq!(updated, Some(suspended));

        let log = format!("{:?}", store.db.into_transaction_log());
        assert!(log.contains("FOR UPDATE"));
        assert!(log.contains("revoked:controller-a/1"));
    }

    #[tokio::test]
    async fn test_override_skips_changed_status() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<Model>::new()])
            .into_connection();
        let store = SeaOrmStore::new(db);

        let patch = DomainPatch {
            status: Some(DomainStatus::Suspended),
            ..Default::default()
        };
        let updated = store
            .override_lifecycle(Uuid::new_v4(), DomainStatus::Active, &patch, Utc::now())
            .await
            .unwrap();
        assert!(updated.is_none());
    }
}
