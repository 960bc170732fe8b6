//! 域名记录存储
//!
//! 生命周期字段只通过两条路径写入：持有租约时的 [`DomainStore::update`]，
//! 以及管理操作使用的 [`DomainStore::override_lifecycle`]。后者会撤销仍有效的
//! 租约（保留过期时间），旧 worker 的写入因此失败，而新的认领要等旧 worker
//! 释放或租约过期，同一条记录不会同时有两个签发在进行。

mod memory;
mod sea;

pub use memory::MemoryStore;
pub use sea::SeaOrmStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::lifecycle::DomainPatch;
use portyo_common::models::{NewCustomDomain, UpdateRoutingPreferences};
use portyo_common::Result;
use uuid::Uuid;

#[async_trait]
pub trait DomainStore: Send + Sync {
    /// 插入 `pending` 记录；域名已被任何人注册时返回 `DuplicateDomain`
    async fn create(&self, new: NewCustomDomain, now: DateTime<Utc>) -> Result<Model>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>>;

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Model>>;

    async fn list_by_bio(&self, bio_id: Uuid) -> Result<Vec<Model>>;

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Model>>;

    async fn list_by_status(&self, statuses: &[DomainStatus]) -> Result<Vec<Model>>;

    async fn list_all(&self) -> Result<Vec<Model>>;

    /// 只修改路由偏好；记录不存在时返回 `None`
    async fn update_preferences(
        &self,
        id: Uuid,
        prefs: &UpdateRoutingPreferences,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>>;

    /// 租约空闲或已过期时认领，并返回最新记录
    async fn claim(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Model>>;

    /// 写入控制器 patch。返回 `None` 表示 `owner` 已不再持有租约
    /// （记录被删除、被管理操作撤销或被重新认领）。
    async fn update(
        &self,
        id: Uuid,
        owner: &str,
        patch: &DomainPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>>;

    async fn release(&self, id: Uuid, owner: &str) -> Result<()>;

    /// 管理操作 patch，只在记录仍处于 `expected` 时生效。
    ///
    /// 仍有效的租约被替换为撤销标记，原 worker 调用 [`DomainStore::release`]
    /// 时清除；已过期的租约直接清空。
    async fn override_lifecycle(
        &self,
        id: Uuid,
        expected: DomainStatus,
        patch: &DomainPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn delete_by_bio(&self, bio_id: Uuid) -> Result<u64>;

    async fn delete_by_user(&self, user_id: Uuid) -> Result<u64>;
}
