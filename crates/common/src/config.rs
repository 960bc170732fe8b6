use anyhow::{Result, anyhow};
use chrono::Duration as TimeDelta;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// 生命周期阈值：重试、超时、续期窗口。默认值与环境变量默认值一致。
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub dns_max_wait: TimeDelta,
    pub dns_max_retries: i32,
    pub dns_lookup_timeout: Duration,
    pub retry_base: TimeDelta,
    pub retry_max_backoff: TimeDelta,
    pub issuance_timeout: Duration,
    pub issuance_max_retries: i32,
    pub renewal_window: TimeDelta,
    pub health_interval: TimeDelta,
    pub lease_ttl: TimeDelta,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            dns_max_wait: TimeDelta::hours(48),
            dns_max_retries: 100,
            dns_lookup_timeout: Duration::from_millis(5000),
            retry_base: TimeDelta::seconds(60),
            retry_max_backoff: TimeDelta::seconds(3600),
            issuance_timeout: Duration::from_secs(90),
            issuance_max_retries: 5,
            renewal_window: TimeDelta::days(30),
            health_interval: TimeDelta::seconds(3600),
            lease_ttl: TimeDelta::seconds(300),
        }
    }
}

impl LifecyclePolicy {
    /// base * 2^retry，封顶 retry_max_backoff
    pub fn backoff(&self, retry_count: i32) -> TimeDelta {
        let exponent = retry_count.clamp(0, 16) as u32;
        let factor = 1i32 << exponent;
        let delay = self.retry_base * factor;
        delay.min(self.retry_max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub use_memory_store: bool,
    pub api_addr: String,
    pub controller_id: String,
    pub run_api: bool,
    pub run_controller: bool,
    pub tick_interval_secs: u64,
    pub worker_concurrency: usize,
    pub dns_expected_target: String,
    pub platform_ips: Vec<Ipv4Addr>,
    pub platform_domains: Vec<String>,
    pub acme_enabled: bool,
    pub acme_contact_email: Option<String>,
    pub acme_directory_url: String,
    pub acme_storage_dir: PathBuf,
    pub certs_dir: PathBuf,
    pub policy: LifecyclePolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        // Load .env early so process env reads pick it up.
        let _ = dotenvy::dotenv();
        let use_memory_store = env_bool("USE_MEMORY_STORE", false);

        let database_url = env::var("DATABASE_URL").ok();
        if !use_memory_store && database_url.is_none() {
            return Err(anyhow!(
                "DATABASE_URL is required unless USE_MEMORY_STORE=true"
            ));
        }

        let api_addr = env::var("API_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
        let controller_id =
            env::var("CONTROLLER_ID").unwrap_or_else(|_| "domain-controller".to_string());
        let run_api = env_bool("RUN_API", true);
        let run_controller = env_bool("RUN_CONTROLLER", true);
        let tick_interval_secs = env_u64("TICK_INTERVAL_SECS", 30).max(1);
        let worker_concurrency = env_u64("WORKER_CONCURRENCY", 8).max(1) as usize;

        let dns_expected_target = env::var("DNS_EXPECTED_TARGET")
            .map(|v| v.trim().trim_end_matches('.').to_ascii_lowercase())
            .unwrap_or_else(|_| "cname.portyo.me".to_string());
        let platform_ips = env_list("PLATFORM_IPS")
            .into_iter()
            .map(|ip| {
                ip.parse::<Ipv4Addr>()
                    .map_err(|_| anyhow!("PLATFORM_IPS contains invalid address {}", ip))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut platform_domains = env_list("PLATFORM_DOMAINS");
        if platform_domains.is_empty() {
            platform_domains.push("portyo.me".to_string());
        }

        let policy = LifecyclePolicy {
            dns_max_wait: TimeDelta::hours(env_u64("DNS_MAX_WAIT_HOURS", 48) as i64),
            dns_max_retries: env_u64("DNS_MAX_RETRIES", 100) as i32,
            dns_lookup_timeout: Duration::from_millis(env_u64("DNS_LOOKUP_TIMEOUT_MS", 5000)),
            retry_base: TimeDelta::seconds(env_u64("RETRY_BASE_SECS", 60) as i64),
            retry_max_backoff: TimeDelta::seconds(env_u64("RETRY_MAX_BACKOFF_SECS", 3600) as i64),
            issuance_timeout: Duration::from_secs(env_u64("ISSUANCE_TIMEOUT_SECS", 90)),
            issuance_max_retries: env_u64("ISSUANCE_MAX_RETRIES", 5) as i32,
            renewal_window: TimeDelta::days(env_u64("RENEWAL_WINDOW_DAYS", 30) as i64),
            health_interval: TimeDelta::seconds(
                env_u64("HEALTH_CHECK_INTERVAL_SECS", 3600) as i64,
            ),
            lease_ttl: TimeDelta::seconds(env_u64("LEASE_TTL_SECS", 300) as i64),
        };
        if policy.lease_ttl <= TimeDelta::from_std(policy.issuance_timeout)? {
            return Err(anyhow!("LEASE_TTL_SECS must exceed ISSUANCE_TIMEOUT_SECS"));
        }

        let acme_enabled = env_bool("ACME_ENABLED", false);
        let acme_contact_email = env::var("ACME_CONTACT_EMAIL").ok();
        if acme_enabled && acme_contact_email.is_none() {
            return Err(anyhow!("ACME_CONTACT_EMAIL is required when ACME_ENABLED=true"));
        }
        let acme_directory_url = env::var("ACME_DIRECTORY_URL")
            .unwrap_or_else(|_| "https://acme-v02.api.letsencrypt.org/directory".to_string());
        let acme_storage_dir = env::var("ACME_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/acme"));
        let certs_dir = env::var("CERTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/certs"));

        Ok(Self {
            database_url,
            use_memory_store,
            api_addr,
            controller_id,
            run_api,
            run_controller,
            tick_interval_secs,
            worker_concurrency,
            dns_expected_target,
            platform_ips,
            platform_domains,
            acme_enabled,
            acme_contact_email,
            acme_directory_url,
            acme_storage_dir,
            certs_dir,
            policy,
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| parse_list(&raw))
        .unwrap_or_default()
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
