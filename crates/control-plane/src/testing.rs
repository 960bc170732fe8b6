//! 单元测试共用的脚本化 DNS 与 CA

use crate::certs::{
    CertificateAuthority, CertificateStorage, IssuedCertificate, SelfSignedAuthority,
};
use crate::dns::{DnsLookup, LookupError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::{DomainError, Result};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

pub fn record(domain: &str, status: DomainStatus) -> Model {
    let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    Model {
        id: Uuid::new_v4(),
        domain: domain.to_string(),
        bio_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        status,
        error_message: None,
        expected_dns_value: Some("cname.portyo.me".to_string()),
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
        verification_token: Some("token".to_string()),
        last_health_check_at: None,
        is_healthy: true,
        dns_check_started_at: None,
        lease_owner: None,
        lease_expires_at: None,
        created_at: created,
        updated_at: created,
    }
}

pub fn temp_storage() -> CertificateStorage {
    CertificateStorage::new(std::env::temp_dir().join(format!("portyo-test-certs-{}", Uuid::new_v4())))
}

/// 按名称返回预设记录；未设置的名称视为 NXDOMAIN
#[derive(Default)]
pub struct ScriptedDns {
    cnames: Mutex<HashMap<String, Vec<String>>>,
    addresses: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
    hanging: Mutex<HashSet<String>>,
    queries: AtomicUsize,
}

impl ScriptedDns {
    pub fn set_cname(&self, name: &str, targets: &[&str]) {
        self.cnames.lock().unwrap().insert(
            name.to_string(),
            targets.iter().map(|t| t.to_string()).collect(),
        );
    }

    pub fn set_a(&self, name: &str, ips: &[&str]) {
        self.addresses.lock().unwrap().insert(
            name.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
    }

    /// 之后对该名称的查询永不返回
    pub fn hang(&self, name: &str) {
        self.hanging.lock().unwrap().insert(name.to_string());
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn stall_if_hanging(&self, name: &str) {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let hanging = self.hanging.lock().unwrap().contains(name);
        if hanging {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl DnsLookup for ScriptedDns {
    async fn cname(&self, name: &str) -> std::result::Result<Vec<String>, LookupError> {
        self.stall_if_hanging(name).await;
        self.cnames
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(LookupError::NotFound)
    }

    async fn ipv4(&self, name: &str) -> std::result::Result<Vec<Ipv4Addr>, LookupError> {
        self.stall_if_hanging(name).await;
        self.addresses
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(LookupError::NotFound)
    }
}

/// 真实签发自签名证书的 CA，可注入失败和延迟
#[derive(Default)]
pub struct ScriptedAuthority {
    issued: AtomicUsize,
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    clock: Mutex<Option<DateTime<Utc>>>,
    last_names: Mutex<Vec<String>>,
}

impl ScriptedAuthority {
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// 之后签发的证书以 `now` 为起点计算有效期
    pub fn set_now(&self, now: DateTime<Utc>) {
        *self.clock.lock().unwrap() = Some(now);
    }

    pub fn last_names(&self) -> Vec<String> {
        self.last_names.lock().unwrap().clone()
    }
}

#[async_trait]
impl CertificateAuthority for ScriptedAuthority {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn issue(&self, names: &[String]) -> Result<IssuedCertificate> {
        *self.last_names.lock().unwrap() = names.to_vec();
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DomainError::issuance("rate limited by scripted CA"));
        }
        let now = self.clock.lock().unwrap().unwrap_or_else(Utc::now);
        let issued = SelfSignedAuthority::generate(names, now)
            .map_err(|err| DomainError::issuance(err.to_string()))?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(issued)
    }
}
