//! `active` 域名的健康检查
//!
//! 确认 DNS 仍然指向平台，且落盘证书存在、未过期。

use crate::dns::{DnsObservation, DnsVerifier};
use crate::issuer::CertificateIssuer;
use crate::metrics;
use chrono::{DateTime, Utc};
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::lifecycle::{self, DomainPatch};
use portyo_common::{DomainError, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub struct HealthMonitor {
    verifier: Arc<DnsVerifier>,
    issuer: Arc<CertificateIssuer>,
}

impl HealthMonitor {
    pub fn new(verifier: Arc<DnsVerifier>, issuer: Arc<CertificateIssuer>) -> Self {
        Self { verifier, issuer }
    }

    /// 返回证书不可用的原因；可用时返回 None
    async fn certificate_problem(&self, record: &Model, now: DateTime<Utc>) -> Option<String> {
        if !record.ssl_active {
            return Some("certificate inactive".to_string());
        }
        let Some(cert_path) = record.ssl_certificate_path.as_deref() else {
            return Some("certificate path missing".to_string());
        };
        match self.issuer.storage().expiry(cert_path).await {
            Ok(Some(expires_at)) if expires_at > now => None,
            Ok(Some(expires_at)) => Some(format!("certificate expired at {expires_at}")),
            Ok(None) => Some(format!("certificate file {cert_path} missing")),
            Err(err) => Some(format!("certificate unreadable: {err}")),
        }
    }

    pub async fn check(&self, record: &Model, now: DateTime<Utc>) -> Result<DomainPatch> {
        if record.status != DomainStatus::Active {
            return Ok(DomainPatch::default());
        }

        let expected = self.verifier.expected_for(record);
        let observation = self.verifier.observe(&record.domain, &expected).await;
        if observation.is_drift() {
            metrics::inc_stage_check("health", "dns_drift");
            let failure = DomainError::health(observation.describe(&expected));
            warn!(domain = %record.domain, error = %failure, "dns drifted, re-verifying");
            return lifecycle::dns_drifted(record, observation.actual(), now);
        }

        if let Some(problem) = self.certificate_problem(record, now).await {
            return self.recover_certificate(record, &problem, now).await;
        }

        match observation {
            DnsObservation::Matched(_) => {
                metrics::inc_stage_check("health", "healthy");
                lifecycle::health_passed(record, now)
            }
            other => {
                metrics::inc_stage_check("health", "inconclusive");
                lifecycle::health_inconclusive(record, &other.describe(&expected), now)
            }
        }
    }

    /// 证书失效时立即尝试续期，失败则进入 expired
    async fn recover_certificate(
        &self,
        record: &Model,
        problem: &str,
        now: DateTime<Utc>,
    ) -> Result<DomainPatch> {
        match self.issuer.obtain(record).await {
            Ok(cert) => {
                metrics::inc_stage_check("health", "certificate_replaced");
                info!(domain = %record.domain, problem, "replaced unusable certificate");
                let mut patch = lifecycle::renewal_succeeded(record, &cert, now)?;
                patch.is_healthy = Some(true);
                patch.last_health_check_at = Some(Some(now));
                Ok(patch)
            }
            Err(err) => {
                metrics::inc_stage_check("health", "certificate_lapsed");
                let message = format!("{problem}; renewal failed: {err}");
                warn!(domain = %record.domain, error = %message, "certificate lapsed");
                lifecycle::certificate_lapsed(record, &message, now)
            }
        }
    }
}
