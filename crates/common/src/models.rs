use crate::entities::custom_domains::{DomainStatus, Model};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCustomDomain {
    pub domain: String,
    pub bio_id: Uuid,
    pub user_id: Uuid,
}

/// 仅路由偏好，生命周期字段只能由控制器修改
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRoutingPreferences {
    pub redirect_www: Option<bool>,
    pub force_https: Option<bool>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub redirect_to: Option<Option<String>>,
}

/// 区分字段缺失（None）和显式 null（Some(None)）
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendRequest {
    pub reason: String,
}

/// 新记录的初始字段
#[derive(Debug, Clone)]
pub struct NewCustomDomain {
    pub domain: String,
    pub bio_id: Uuid,
    pub user_id: Uuid,
    pub expected_dns_value: String,
    pub verification_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsInstructions {
    pub record_type: String,
    pub host: String,
    pub value: String,
}

/// 仪表盘展示的记录视图（不包含租约等内部字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDomainView {
    pub id: Uuid,
    pub domain: String,
    pub bio_id: Uuid,
    pub user_id: Uuid,
    pub status: DomainStatus,
    pub expected_dns_value: Option<String>,
    pub actual_dns_value: Option<String>,
    pub dns_verified_at: Option<DateTime<Utc>>,
    pub ssl_active: bool,
    pub ssl_expires_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub redirect_www: bool,
    pub force_https: bool,
    pub redirect_to: Option<String>,
    pub verification_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Model> for CustomDomainView {
    fn from(m: Model) -> Self {
        Self {
            id: m.id,
            domain: m.domain,
            bio_id: m.bio_id,
            user_id: m.user_id,
            status: m.status,
            expected_dns_value: m.expected_dns_value,
            actual_dns_value: m.actual_dns_value,
            dns_verified_at: m.dns_verified_at,
            ssl_active: m.ssl_active,
            ssl_expires_at: m.ssl_expires_at,
            activated_at: m.activated_at,
            last_checked_at: m.last_checked_at,
            last_health_check_at: m.last_health_check_at,
            is_healthy: m.is_healthy,
            retry_count: m.retry_count,
            error_message: m.error_message,
            redirect_www: m.redirect_www,
            force_https: m.force_https,
            redirect_to: m.redirect_to,
            verification_token: m.verification_token,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCustomDomainResponse {
    pub domain: CustomDomainView,
    pub instructions: Vec<DnsInstructions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsCheckResponse {
    pub domain: String,
    pub available: bool,
    pub dns_configured: bool,
    pub expected_value: String,
    pub actual_value: Option<String>,
    pub existing_status: Option<DomainStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_preferences_distinguishes_null_from_missing() {
        let missing: UpdateRoutingPreferences = serde_json::from_str("{}").unwrap();
        assert!(missing.redirect_to.is_none());

        let cleared: UpdateRoutingPreferences =
            serde_json::from_str(r#"{"redirect_to": null}"#).unwrap();
        assert_eq!(cleared.redirect_to, Some(None));

        let set: UpdateRoutingPreferences =
            serde_json::from_str(r#"{"redirect_to": "https://example.com"}"#).unwrap();
        assert_eq!(set.redirect_to, Some(Some("https://example.com".to_string())));
    }
}
