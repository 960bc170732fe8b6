//! 自定义域名的证书签发与续期

use crate::certs::{CertificateAuthority, CertificateStorage};
use crate::metrics;
use chrono::{DateTime, Utc};
use portyo_common::config::LifecyclePolicy;
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::lifecycle::{self, CertificateArtifacts, DomainPatch};
use portyo_common::{DomainError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub struct CertificateIssuer {
    authority: Arc<dyn CertificateAuthority>,
    storage: CertificateStorage,
    issuance_timeout: Duration,
}

/// 主域名在前；开启 www 跳转时追加 `www.` 变体
pub fn certificate_names(record: &Model) -> Vec<String> {
    let mut names = vec![record.domain.clone()];
    if record.redirect_www
        && let Some(alias) = record.www_alias()
    {
        names.push(alias);
    }
    names
}

impl CertificateIssuer {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        storage: CertificateStorage,
        issuance_timeout: Duration,
    ) -> Self {
        Self {
            authority,
            storage,
            issuance_timeout,
        }
    }

    pub fn storage(&self) -> &CertificateStorage {
        &self.storage
    }

    /// 在签发超时内调用 CA，并把结果写盘
    pub async fn obtain(&self, record: &Model) -> Result<CertificateArtifacts> {
        let names = certificate_names(record);
        let issued = timeout(self.issuance_timeout, self.authority.issue(&names))
            .await
            .map_err(|_| {
                DomainError::issuance(format!(
                    "{} did not answer within {}s",
                    self.authority.name(),
                    self.issuance_timeout.as_secs()
                ))
            })??;
        self.storage.store(&record.domain, &issued).await
    }

    /// 证书在续期窗口之外仍然有效时复用
    async fn reusable(
        &self,
        record: &Model,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Option<CertificateArtifacts> {
        let cert_path = record.ssl_certificate_path.as_ref()?;
        let key_path = record.ssl_private_key_path.as_ref()?;
        if !tokio::fs::try_exists(key_path).await.unwrap_or(false) {
            return None;
        }
        let expires_at = self.storage.expiry(cert_path).await.ok().flatten()?;
        (expires_at - now > policy.renewal_window).then(|| CertificateArtifacts {
            certificate_path: cert_path.clone(),
            private_key_path: key_path.clone(),
            expires_at,
        })
    }

    /// `generating_ssl` 记录的签发阶段，其他状态不做任何事
    pub async fn issue(
        &self,
        record: &Model,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<DomainPatch> {
        if record.status != DomainStatus::GeneratingSsl {
            return Ok(DomainPatch::default());
        }

        if let Some(existing) = self.reusable(record, now, policy).await {
            metrics::inc_stage_check("issuance", "reused");
            info!(domain = %record.domain, expires_at = %existing.expires_at, "reusing stored certificate");
            return lifecycle::issuance_succeeded(record, &existing, now);
        }

        match self.obtain(record).await {
            Ok(cert) => {
                metrics::inc_stage_check("issuance", "issued");
                info!(
                    domain = %record.domain,
                    authority = self.authority.name(),
                    expires_at = %cert.expires_at,
                    "certificate issued"
                );
                lifecycle::issuance_succeeded(record, &cert, now)
            }
            Err(err) => {
                metrics::inc_stage_check("issuance", "failed");
                // CA 拒绝或超时之外的错误（写盘失败等）需要人工关注
                if err.is_transient() {
                    warn!(
                        domain = %record.domain,
                        retry_count = record.retry_count + 1,
                        error = %err,
                        "certificate issuance failed"
                    );
                } else {
                    error!(
                        domain = %record.domain,
                        retry_count = record.retry_count + 1,
                        error = %err,
                        "certificate issuance failed outside the CA"
                    );
                }
                lifecycle::issuance_failed(record, &err.to_string(), now, policy)
            }
        }
    }

    /// 续期窗口内的 `active` 记录续期，成功与否状态都保持 `active`
    pub async fn renew(
        &self,
        record: &Model,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<DomainPatch> {
        if !lifecycle::renewal_due(record, now, policy) {
            return Ok(DomainPatch::default());
        }

        match self.obtain(record).await {
            Ok(cert) => {
                metrics::inc_stage_check("renewal", "renewed");
                info!(domain = %record.domain, expires_at = %cert.expires_at, "certificate renewed");
                lifecycle::renewal_succeeded(record, &cert, now)
            }
            Err(err) => {
                metrics::inc_stage_check("renewal", "failed");
                warn!(domain = %record.domain, error = %err, "certificate renewal failed");
                lifecycle::renewal_failed(record, &err.to_string(), now)
            }
        }
    }
}
