use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 自定义域名生命周期状态，取值与既有 `custom_domain_entity_status_enum` 保持一致。
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(
    rs_type = "String",
    db_type = "Enum",
    enum_name = "custom_domain_entity_status_enum"
)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "verifying_dns")]
    VerifyingDns,
    #[sea_orm(string_value = "dns_verified")]
    DnsVerified,
    #[sea_orm(string_value = "generating_ssl")]
    GeneratingSsl,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "suspended")]
    Suspended,
}

impl DomainStatus {
    pub const ALL: [DomainStatus; 8] = [
        DomainStatus::Pending,
        DomainStatus::VerifyingDns,
        DomainStatus::DnsVerified,
        DomainStatus::GeneratingSsl,
        DomainStatus::Active,
        DomainStatus::Failed,
        DomainStatus::Expired,
        DomainStatus::Suspended,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStatus::Pending => "pending",
            DomainStatus::VerifyingDns => "verifying_dns",
            DomainStatus::DnsVerified => "dns_verified",
            DomainStatus::GeneratingSsl => "generating_ssl",
            DomainStatus::Active => "active",
            DomainStatus::Failed => "failed",
            DomainStatus::Expired => "expired",
            DomainStatus::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "custom_domain_entity")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub domain: String,
    #[sea_orm(column_name = "bioId")]
    pub bio_id: Uuid,
    #[sea_orm(column_name = "userId")]
    pub user_id: Uuid,
    pub status: DomainStatus,
    #[sea_orm(column_name = "errorMessage")]
    pub error_message: Option<String>,
    #[sea_orm(column_name = "expectedDnsValue")]
    pub expected_dns_value: Option<String>,
    #[sea_orm(column_name = "dnsVerifiedAt")]
    pub dns_verified_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "actualDnsValue")]
    pub actual_dns_value: Option<String>,
    #[sea_orm(column_name = "sslActive")]
    pub ssl_active: bool,
    #[sea_orm(column_name = "sslExpiresAt")]
    pub ssl_expires_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "sslCertificatePath")]
    pub ssl_certificate_path: Option<String>,
    #[sea_orm(column_name = "sslPrivateKeyPath")]
    pub ssl_private_key_path: Option<String>,
    #[sea_orm(column_name = "lastCheckedAt")]
    pub last_checked_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "activatedAt")]
    pub activated_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "retryCount")]
    pub retry_count: i32,
    #[sea_orm(column_name = "lastErrorAt")]
    pub last_error_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "redirectWww")]
    pub redirect_www: bool,
    #[sea_orm(column_name = "forceHttps")]
    pub force_https: bool,
    #[sea_orm(column_name = "redirectTo")]
    pub redirect_to: Option<String>,
    #[sea_orm(column_name = "verificationToken")]
    pub verification_token: Option<String>,
    #[sea_orm(column_name = "lastHealthCheckAt")]
    pub last_health_check_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "isHealthy")]
    pub is_healthy: bool,
    #[sea_orm(column_name = "dnsCheckStartedAt")]
    pub dns_check_started_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "leaseOwner")]
    pub lease_owner: Option<String>,
    #[sea_orm(column_name = "leaseExpiresAt")]
    pub lease_expires_at: Option<DateTimeUtc>,
    #[sea_orm(column_name = "createdAt")]
    pub created_at: DateTimeUtc,
    #[sea_orm(column_name = "updatedAt")]
    pub updated_at: DateTimeUtc,
}

// bio_entity / user_entity 属于宿主应用，这里不建模
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// 当前租约是否仍被某个 worker 持有
    pub fn is_leased(&self, now: DateTimeUtc) -> bool {
        match (&self.lease_owner, self.lease_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    /// 管理操作撤销租约后的 (owner, 过期时间)。
    ///
    /// 仍有效的租约换成撤销标记并保留过期时间：原 worker 的写入全部失败，
    /// 其他 worker 也要等它释放或租约过期后才能重新认领。
    pub fn revoked_lease(&self, now: DateTimeUtc) -> (Option<String>, Option<DateTimeUtc>) {
        match &self.lease_owner {
            Some(owner) if self.is_leased(now) => {
                let fenced = if owner.starts_with(REVOKED_LEASE_PREFIX) {
                    owner.clone()
                } else {
                    revoked_owner(owner)
                };
                (Some(fenced), self.lease_expires_at)
            }
            _ => (None, None),
        }
    }

    /// `owner` 是否可以释放当前租约（包括已被撤销的租约）
    pub fn lease_releasable_by(&self, owner: &str) -> bool {
        match self.lease_owner.as_deref() {
            Some(current) => current == owner || current == revoked_owner(owner),
            None => false,
        }
    }

    /// www 变体。域名本身以 www. 开头，或加前缀后超过 253 字符时返回 None
    pub fn www_alias(&self) -> Option<String> {
        if self.domain.starts_with("www.") {
            return None;
        }
        let alias = format!("www.{}", self.domain);
        (alias.len() <= MAX_DOMAIN_LENGTH).then_some(alias)
    }
}

/// 被管理操作撤销的租约 owner 前缀
pub const REVOKED_LEASE_PREFIX: &str = "revoked:";

/// 完整域名的最大长度
pub const MAX_DOMAIN_LENGTH: usize = 253;

pub fn revoked_owner(owner: &str) -> String {
    format!("{REVOKED_LEASE_PREFIX}{owner}")
}
