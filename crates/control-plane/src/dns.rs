//! DNS 验证
//!
//! 解析自定义域名当前指向，并与平台目标比较。

use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::RecordType;
use portyo_common::config::LifecyclePolicy;
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::lifecycle::{self, DomainPatch};
use portyo_common::{DomainError, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// NXDOMAIN 或没有该类型的记录
    NotFound,
    Timeout,
    Failed(String),
}

impl From<ResolveError> for LookupError {
    fn from(err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => LookupError::NotFound,
            ResolveErrorKind::Timeout => LookupError::Timeout,
            _ => LookupError::Failed(err.to_string()),
        }
    }
}

#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn cname(&self, name: &str) -> std::result::Result<Vec<String>, LookupError>;

    async fn ipv4(&self, name: &str) -> std::result::Result<Vec<Ipv4Addr>, LookupError>;
}

pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn new(lookup_timeout: Duration) -> Self {
        let mut options = ResolverOpts::default();
        options.try_tcp_on_error = true;
        options.use_hosts_file = false;
        options.timeout = lookup_timeout;
        options.attempts = 1;
        // 传播期间需要看到最新结果
        options.cache_size = 0;

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), options);
        Self { resolver }
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn cname(&self, name: &str) -> std::result::Result<Vec<String>, LookupError> {
        let lookup = self.resolver.lookup(name, RecordType::CNAME).await?;
        Ok(lookup
            .iter()
            .filter_map(|record| record.as_cname())
            .map(|cname| cname.to_string())
            .collect())
    }

    async fn ipv4(&self, name: &str) -> std::result::Result<Vec<Ipv4Addr>, LookupError> {
        let lookup = self.resolver.ipv4_lookup(name).await?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }
}

/// 一次 DNS 观测的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsObservation {
    /// 至少一条记录指向平台，携带匹配到的值
    Matched(String),
    /// 有记录但都不指向平台，携带逗号分隔的观测值
    Mismatch(String),
    NoRecords,
    Timeout,
    Failed(String),
}

impl DnsObservation {
    pub fn actual(&self) -> Option<String> {
        match self {
            DnsObservation::Matched(value) | DnsObservation::Mismatch(value) => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    /// 是否明确观测到域名没有指向平台
    pub fn is_drift(&self) -> bool {
        matches!(self, DnsObservation::Mismatch(_) | DnsObservation::NoRecords)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DnsObservation::Matched(_) => "matched",
            DnsObservation::Mismatch(_) => "mismatch",
            DnsObservation::NoRecords => "no_records",
            DnsObservation::Timeout => "timeout",
            DnsObservation::Failed(_) => "error",
        }
    }

    pub fn describe(&self, expected: &str) -> String {
        match self {
            DnsObservation::Matched(value) => format!("points at {value}"),
            DnsObservation::Mismatch(value) => format!("points at {value}, expected {expected}"),
            DnsObservation::NoRecords => format!("no CNAME or A records, expected {expected}"),
            DnsObservation::Timeout => "dns lookup timed out".to_string(),
            DnsObservation::Failed(err) => format!("dns lookup failed: {err}"),
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

pub struct DnsVerifier {
    lookup: Arc<dyn DnsLookup>,
    expected_target: String,
    platform_ips: Vec<Ipv4Addr>,
    lookup_timeout: Duration,
}

impl DnsVerifier {
    pub fn new(
        lookup: Arc<dyn DnsLookup>,
        expected_target: impl Into<String>,
        platform_ips: Vec<Ipv4Addr>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            lookup,
            expected_target: normalize_name(&expected_target.into()),
            platform_ips,
            lookup_timeout,
        }
    }

    pub fn expected_target(&self) -> &str {
        &self.expected_target
    }

    pub fn platform_ips(&self) -> &[Ipv4Addr] {
        &self.platform_ips
    }

    pub fn expected_for(&self, record: &Model) -> String {
        record
            .expected_dns_value
            .as_deref()
            .map(normalize_name)
            .unwrap_or_else(|| self.expected_target.clone())
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, LookupError>>,
    ) -> std::result::Result<T, LookupError> {
        timeout(self.lookup_timeout, fut)
            .await
            .unwrap_or(Err(LookupError::Timeout))
    }

    /// CNAME 优先；没有匹配时比较 A 记录与平台 IP（未配置时解析期望目标得到）。
    pub async fn observe(&self, domain: &str, expected: &str) -> DnsObservation {
        let expected = normalize_name(expected);
        let mut seen: Vec<String> = Vec::new();
        let mut errors: Vec<LookupError> = Vec::new();

        match self.bounded(self.lookup.cname(domain)).await {
            Ok(targets) => {
                for target in targets.iter().map(|t| normalize_name(t)) {
                    if target == expected {
                        return DnsObservation::Matched(target);
                    }
                    seen.push(target);
                }
            }
            Err(err) => errors.push(err),
        }

        let platform: BTreeSet<Ipv4Addr> = if self.platform_ips.is_empty() {
            match self.bounded(self.lookup.ipv4(&expected)).await {
                Ok(ips) => ips.into_iter().collect(),
                Err(err) => {
                    debug!(target = %expected, error = ?err, "could not resolve platform target");
                    BTreeSet::new()
                }
            }
        } else {
            self.platform_ips.iter().copied().collect()
        };

        match self.bounded(self.lookup.ipv4(domain)).await {
            Ok(addresses) => {
                if let Some(hit) = addresses.iter().find(|ip| platform.contains(ip)) {
                    return DnsObservation::Matched(hit.to_string());
                }
                seen.extend(addresses.iter().map(|ip| ip.to_string()));
            }
            Err(err) => errors.push(err),
        }

        if !seen.is_empty() {
            seen.dedup();
            return DnsObservation::Mismatch(seen.join(","));
        }
        if errors.contains(&LookupError::Timeout) {
            return DnsObservation::Timeout;
        }
        match errors.into_iter().find_map(|err| match err {
            LookupError::Failed(msg) => Some(msg),
            _ => None,
        }) {
            Some(msg) => DnsObservation::Failed(msg),
            None => DnsObservation::NoRecords,
        }
    }

    /// `verifying_dns` 记录的验证阶段，其他状态直接返回空 patch
    pub async fn verify(
        &self,
        record: &Model,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<DomainPatch> {
        if record.status != DomainStatus::VerifyingDns {
            return Ok(DomainPatch::default());
        }

        let expected = self.expected_for(record);
        let observation = self.observe(&record.domain, &expected).await;
        metrics::inc_stage_check("dns", observation.label());
        debug!(
            domain = %record.domain,
            outcome = observation.label(),
            retry_count = record.retry_count,
            "dns check"
        );

        match observation {
            DnsObservation::Matched(actual) => lifecycle::dns_matched(record, actual, now),
            other if lifecycle::dns_wait_exhausted(record, now, policy) => {
                warn!(
                    domain = %record.domain,
                    retry_count = record.retry_count + 1,
                    error = %DomainError::DnsTimeout(record.domain.clone()),
                    "giving up on dns verification"
                );
                lifecycle::dns_timed_out(record, other.actual(), now)
            }
            other => lifecycle::dns_not_propagated(record, other.actual(), now),
        }
    }
}
