//! 自定义域名生命周期状态机
//!
//! 所有状态变化都通过本模块的具名迁移函数生成 [`DomainPatch`]，
//! 迁移函数会先检查边是否合法：
//!
//! ```text
//! pending -> verifying_dns -> dns_verified -> generating_ssl -> active
//! verifying_dns  -> failed         (dns_timeout)
//! generating_ssl -> dns_verified   (重试)
//! generating_ssl -> failed         (重试耗尽)
//! active         -> verifying_dns  (DNS 漂移)
//! active         -> expired        (证书失效且续期失败)
//! *              -> suspended      (管理操作)
//! suspended      -> verifying_dns  (重新激活)
//! failed|expired -> pending        (用户重新提交)
//! ```

use crate::config::LifecyclePolicy;
use crate::entities::custom_domains::{DomainStatus, Model};
use crate::error::{DomainError, Result};
use chrono::{DateTime, Utc};

/// DNS 超时写入 errorMessage 的固定值
pub const DNS_TIMEOUT_MESSAGE: &str = "dns_timeout";
/// DNS 漂移写入 errorMessage 的固定值
pub const DNS_DRIFT_MESSAGE: &str = "dns_drift";

impl DomainStatus {
    /// 状态机中是否存在 self -> next 这条边
    pub fn can_transition_to(self, next: DomainStatus) -> bool {
        use DomainStatus::*;
        match (self, next) {
            (Suspended, Suspended) => false,
            (_, Suspended) => true,
            (Pending, VerifyingDns) => true,
            (VerifyingDns, DnsVerified | Failed) => true,
            (DnsVerified, GeneratingSsl) => true,
            (GeneratingSsl, Active | DnsVerified | Failed) => true,
            (Active, VerifyingDns | Expired) => true,
            (Failed | Expired, Pending) => true,
            (Suspended, VerifyingDns) => true,
            _ => false,
        }
    }

    /// 只能通过用户或管理员显式操作离开的状态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DomainStatus::Failed | DomainStatus::Expired | DomainStatus::Suspended
        )
    }

    /// 控制器会主动处理的状态
    pub fn is_processable(self) -> bool {
        !self.is_terminal()
    }
}

pub fn ensure_transition(from: DomainStatus, to: DomainStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DomainError::InvalidTransition { from, to })
    }
}

/// 已签发并落盘的证书
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateArtifacts {
    pub certificate_path: String,
    pub private_key_path: String,
    pub expires_at: DateTime<Utc>,
}

/// 控制器拥有的字段的部分更新。
///
/// 外层 `None` 表示不修改；可空列使用 `Option<Option<_>>`，`Some(None)` 表示置空。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainPatch {
    pub status: Option<DomainStatus>,
    pub error_message: Option<Option<String>>,
    pub actual_dns_value: Option<Option<String>>,
    pub dns_verified_at: Option<Option<DateTime<Utc>>>,
    pub dns_check_started_at: Option<Option<DateTime<Utc>>>,
    pub ssl_active: Option<bool>,
    pub ssl_expires_at: Option<Option<DateTime<Utc>>>,
    pub ssl_certificate_path: Option<Option<String>>,
    pub ssl_private_key_path: Option<Option<String>>,
    pub last_checked_at: Option<Option<DateTime<Utc>>>,
    pub activated_at: Option<Option<DateTime<Utc>>>,
    pub retry_count: Option<i32>,
    pub last_error_at: Option<Option<DateTime<Utc>>>,
    pub last_health_check_at: Option<Option<DateTime<Utc>>>,
    pub is_healthy: Option<bool>,
}

impl DomainPatch {
    pub fn is_empty(&self) -> bool {
        *self == DomainPatch::default()
    }

    pub fn apply_to(&self, model: &mut Model) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }

        set(&mut model.status, &self.status);
        set(&mut model.error_message, &self.error_message);
        set(&mut model.actual_dns_value, &self.actual_dns_value);
        set(&mut model.dns_verified_at, &self.dns_verified_at);
        set(&mut model.dns_check_started_at, &self.dns_check_started_at);
        set(&mut model.ssl_active, &self.ssl_active);
        set(&mut model.ssl_expires_at, &self.ssl_expires_at);
        set(&mut model.ssl_certificate_path, &self.ssl_certificate_path);
        set(&mut model.ssl_private_key_path, &self.ssl_private_key_path);
        set(&mut model.last_checked_at, &self.last_checked_at);
        set(&mut model.activated_at, &self.activated_at);
        set(&mut model.retry_count, &self.retry_count);
        set(&mut model.last_error_at, &self.last_error_at);
        set(&mut model.last_health_check_at, &self.last_health_check_at);
        set(&mut model.is_healthy, &self.is_healthy);
    }

    pub fn applied(&self, model: &Model) -> Model {
        let mut next = model.clone();
        self.apply_to(&mut next);
        next
    }

    fn with_certificate(mut self, cert: &CertificateArtifacts) -> Self {
        self.ssl_active = Some(true);
        self.ssl_certificate_path = Some(Some(cert.certificate_path.clone()));
        self.ssl_private_key_path = Some(Some(cert.private_key_path.clone()));
        self.ssl_expires_at = Some(Some(cert.expires_at));
        self
    }
}

/// 记录层面的不变量检查，控制器在落库前调用
pub fn validate_invariants(model: &Model) -> Result<()> {
    if model.ssl_active
        && (model.ssl_certificate_path.is_none()
            || model.ssl_private_key_path.is_none()
            || model.ssl_expires_at.is_none())
    {
        return Err(DomainError::Internal(anyhow::anyhow!(
            "{}: sslActive without certificate paths or expiry",
            model.domain
        )));
    }
    if model.status == DomainStatus::Active && model.activated_at.is_none() {
        return Err(DomainError::Internal(anyhow::anyhow!(
            "{}: active without activatedAt",
            model.domain
        )));
    }
    if model.retry_count < 0 {
        return Err(DomainError::Internal(anyhow::anyhow!(
            "{}: negative retryCount",
            model.domain
        )));
    }
    Ok(())
}

// ============ DNS 验证 ============

pub fn begin_dns_verification(record: &Model, now: DateTime<Utc>) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::VerifyingDns)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::VerifyingDns),
        retry_count: Some(0),
        dns_check_started_at: Some(Some(now)),
        error_message: Some(None),
        ..Default::default()
    })
}

pub fn dns_matched(record: &Model, actual: String, now: DateTime<Utc>) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::DnsVerified)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::DnsVerified),
        actual_dns_value: Some(Some(actual)),
        dns_verified_at: Some(Some(now)),
        last_checked_at: Some(Some(now)),
        retry_count: Some(0),
        error_message: Some(None),
        ..Default::default()
    })
}

/// 尚未匹配：状态保持 verifying_dns，只累计重试
pub fn dns_not_propagated(
    record: &Model,
    actual: Option<String>,
    now: DateTime<Utc>,
) -> Result<DomainPatch> {
    if record.status != DomainStatus::VerifyingDns {
        return Err(DomainError::InvalidTransition {
            from: record.status,
            to: DomainStatus::VerifyingDns,
        });
    }
    let pending = DomainError::DnsNotYetPropagated {
        expected: record.expected_dns_value.clone().unwrap_or_default(),
        actual: actual.clone(),
    };
    Ok(DomainPatch {
        actual_dns_value: Some(actual),
        retry_count: Some(record.retry_count + 1),
        last_checked_at: Some(Some(now)),
        error_message: Some(Some(pending.to_string())),
        ..Default::default()
    })
}

pub fn dns_timed_out(
    record: &Model,
    actual: Option<String>,
    now: DateTime<Utc>,
) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::Failed)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::Failed),
        actual_dns_value: Some(actual),
        retry_count: Some(record.retry_count + 1),
        last_checked_at: Some(Some(now)),
        last_error_at: Some(Some(now)),
        error_message: Some(Some(DNS_TIMEOUT_MESSAGE.to_string())),
        ..Default::default()
    })
}

/// 传播等待窗口或重试次数是否已用尽（按本次失败之后的计数判断）
pub fn dns_wait_exhausted(record: &Model, now: DateTime<Utc>, policy: &LifecyclePolicy) -> bool {
    let started = record.dns_check_started_at.unwrap_or(record.created_at);
    now - started >= policy.dns_max_wait || record.retry_count + 1 >= policy.dns_max_retries
}

// ============ 证书签发 ============

pub fn begin_issuance(record: &Model, now: DateTime<Utc>) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::GeneratingSsl)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::GeneratingSsl),
        last_checked_at: Some(Some(now)),
        ..Default::default()
    })
}

pub fn issuance_succeeded(
    record: &Model,
    cert: &CertificateArtifacts,
    now: DateTime<Utc>,
) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::Active)?;
    let patch = DomainPatch {
        status: Some(DomainStatus::Active),
        activated_at: record.activated_at.is_none().then_some(Some(now)),
        retry_count: Some(0),
        error_message: Some(None),
        is_healthy: Some(true),
        last_checked_at: Some(Some(now)),
        ..Default::default()
    };
    Ok(patch.with_certificate(cert))
}

/// 签发失败：未超过阈值回到 dns_verified 等待下次重试，否则进入 failed
pub fn issuance_failed(
    record: &Model,
    message: &str,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> Result<DomainPatch> {
    let retry_count = record.retry_count + 1;
    let next = if retry_count > policy.issuance_max_retries {
        DomainStatus::Failed
    } else {
        DomainStatus::DnsVerified
    };
    ensure_transition(record.status, next)?;
    Ok(DomainPatch {
        status: Some(next),
        retry_count: Some(retry_count),
        error_message: Some(Some(message.to_string())),
        last_error_at: Some(Some(now)),
        last_checked_at: Some(Some(now)),
        ..Default::default()
    })
}

pub fn renewal_succeeded(
    record: &Model,
    cert: &CertificateArtifacts,
    now: DateTime<Utc>,
) -> Result<DomainPatch> {
    require_active(record)?;
    let patch = DomainPatch {
        retry_count: Some(0),
        error_message: Some(None),
        last_checked_at: Some(Some(now)),
        ..Default::default()
    };
    Ok(patch.with_certificate(cert))
}

/// 续期失败不影响 active 状态
pub fn renewal_failed(record: &Model, message: &str, now: DateTime<Utc>) -> Result<DomainPatch> {
    require_active(record)?;
    Ok(DomainPatch {
        retry_count: Some(record.retry_count + 1),
        error_message: Some(Some(message.to_string())),
        last_error_at: Some(Some(now)),
        last_checked_at: Some(Some(now)),
        ..Default::default()
    })
}

pub fn renewal_due(record: &Model, now: DateTime<Utc>, policy: &LifecyclePolicy) -> bool {
    if record.status != DomainStatus::Active || !record.ssl_active {
        return false;
    }
    let Some(expires_at) = record.ssl_expires_at else {
        return false;
    };
    if expires_at - now > policy.renewal_window {
        return false;
    }
    match record.last_error_at {
        Some(last) => now - last >= policy.backoff(record.retry_count),
        None => true,
    }
}

// ============ 健康检查 ============

pub fn health_passed(record: &Model, now: DateTime<Utc>) -> Result<DomainPatch> {
    require_active(record)?;
    Ok(DomainPatch {
        last_health_check_at: Some(Some(now)),
        is_healthy: Some(true),
        // 续期失败的错误保留到续期成功为止
        error_message: (record.retry_count == 0).then_some(None),
        ..Default::default()
    })
}

/// 解析超时等无法得出结论的检查，只记录检查时间
pub fn health_inconclusive(record: &Model, message: &str, now: DateTime<Utc>) -> Result<DomainPatch> {
    require_active(record)?;
    Ok(DomainPatch {
        last_health_check_at: Some(Some(now)),
        error_message: Some(Some(message.to_string())),
        ..Default::default()
    })
}

pub fn dns_drifted(record: &Model, actual: Option<String>, now: DateTime<Utc>) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::VerifyingDns)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::VerifyingDns),
        is_healthy: Some(false),
        actual_dns_value: Some(actual),
        last_health_check_at: Some(Some(now)),
        last_checked_at: Some(Some(now)),
        retry_count: Some(0),
        dns_check_started_at: Some(Some(now)),
        error_message: Some(Some(DNS_DRIFT_MESSAGE.to_string())),
        ..Default::default()
    })
}

pub fn certificate_lapsed(record: &Model, message: &str, now: DateTime<Utc>) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::Expired)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::Expired),
        is_healthy: Some(false),
        ssl_active: Some(false),
        error_message: Some(Some(message.to_string())),
        last_error_at: Some(Some(now)),
        last_health_check_at: Some(Some(now)),
        ..Default::default()
    })
}

pub fn health_due(record: &Model, now: DateTime<Utc>, policy: &LifecyclePolicy) -> bool {
    record.status == DomainStatus::Active
        && record
            .last_health_check_at
            .is_none_or(|last| now - last >= policy.health_interval)
}

// ============ 管理操作 ============

pub fn suspend(record: &Model, reason: &str) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::Suspended)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::Suspended),
        error_message: Some(Some(reason.to_string())),
        ..Default::default()
    })
}

pub fn reactivate(record: &Model, now: DateTime<Utc>) -> Result<DomainPatch> {
    if record.status != DomainStatus::Suspended {
        return Err(DomainError::InvalidTransition {
            from: record.status,
            to: DomainStatus::VerifyingDns,
        });
    }
    Ok(DomainPatch {
        status: Some(DomainStatus::VerifyingDns),
        retry_count: Some(0),
        dns_check_started_at: Some(Some(now)),
        error_message: Some(None),
        ..Default::default()
    })
}

/// 用户重新提交 failed / expired 的域名
pub fn resubmit(record: &Model) -> Result<DomainPatch> {
    ensure_transition(record.status, DomainStatus::Pending)?;
    Ok(DomainPatch {
        status: Some(DomainStatus::Pending),
        retry_count: Some(0),
        error_message: Some(None),
        last_error_at: Some(None),
        dns_check_started_at: Some(None),
        is_healthy: Some(true),
        ..Default::default()
    })
}

// ============ 调度 ============

/// 当前 tick 是否需要处理该记录（lastCheckedAt + 指数退避）
pub fn is_due(record: &Model, now: DateTime<Utc>, policy: &LifecyclePolicy) -> bool {
    match record.status {
        DomainStatus::Pending | DomainStatus::GeneratingSsl => true,
        DomainStatus::VerifyingDns | DomainStatus::DnsVerified => record
            .last_checked_at
            .is_none_or(|last| now - last >= policy.backoff(record.retry_count)),
        DomainStatus::Active => {
            renewal_due(record, now, policy) || health_due(record, now, policy)
        }
        DomainStatus::Failed | DomainStatus::Expired | DomainStatus::Suspended => false,
    }
}

fn require_active(record: &Model) -> Result<()> {
    if record.status == DomainStatus::Active {
        Ok(())
    } else {
        Err(DomainError::InvalidTransition {
            from: record.status,
            to: DomainStatus::Active,
        })
    }
}
