//! 自定义域名输入验证模块
//!
//! 控制面 API 与路由查询共享的域名规范化和校验逻辑。

use crate::entities::custom_domains::MAX_DOMAIN_LENGTH as MAX_DOMAIN_LEN;
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;

const MAX_LABEL_LEN: usize = 63;

/// 验证错误类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// 空域名
    Empty,

    /// 超过 253 个字符
    TooLong { len: usize },

    /// 单个标签超过 63 个字符
    LabelTooLong { label: String },

    /// 标签包含非法字符或以连字符开头/结尾
    InvalidLabel { label: String },

    /// 只有一个标签（例如 "localhost"）
    SingleLabel { domain: String },

    /// IP 字面量
    IpLiteral { value: String },

    /// 平台自身的域名
    PlatformDomain { domain: String },
}

impl ValidationError {
    /// 获取错误的详细描述
    pub fn description(&self) -> String {
        match self {
            Self::Empty => "domain is required".to_string(),
            Self::TooLong { len } => {
                format!("domain is {} characters long (max {})", len, MAX_DOMAIN_LEN)
            }
            Self::LabelTooLong { label } => {
                format!("label {} exceeds {} characters", label, MAX_LABEL_LEN)
            }
            Self::InvalidLabel { label } => format!("label {} is not a valid hostname label", label),
            Self::SingleLabel { domain } => {
                format!("{} must contain at least one dot", domain)
            }
            Self::IpLiteral { value } => format!("{} is an IP address, not a domain", value),
            Self::PlatformDomain { domain } => {
                format!("{} belongs to the platform and cannot be registered", domain)
            }
        }
    }
}

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9](?:[a-z0-9-]*[a-z0-9])?$").expect("label pattern is valid")
    })
}

/// 从用户输入或 Host 头中提取域名：去掉协议、路径、端口、末尾的点并转小写
pub fn normalize_domain(input: &str) -> String {
    let mut value = input.trim();
    if let Some((_, rest)) = value.split_once("://") {
        value = rest;
    }
    if let Some(idx) = value.find(['/', '?', '#']) {
        value = &value[..idx];
    }
    if let Some((_, host)) = value.rsplit_once('@') {
        value = host;
    }
    if value.starts_with('[') {
        // IPv6 字面量保持原样，交给验证拒绝
        return value.to_ascii_lowercase();
    }
    if let Some((host, port)) = value.rsplit_once(':')
        && port.chars().all(|c| c.is_ascii_digit())
    {
        value = host;
    }
    value.trim_end_matches('.').to_ascii_lowercase()
}

/// 验证上下文
pub struct ValidationContext {
    platform_domains: Vec<String>,
}

impl ValidationContext {
    pub fn new(platform_domains: Vec<String>) -> Self {
        Self {
            platform_domains: platform_domains
                .into_iter()
                .map(|d| normalize_domain(&d))
                .collect(),
        }
    }

    /// host 是否为平台域名或其子域名
    pub fn is_platform_host(&self, host: &str) -> bool {
        self.platform_domains
            .iter()
            .any(|p| host == p || host.ends_with(&format!(".{}", p)))
    }

    /// 验证已规范化的域名
    pub fn validate_domain(&self, domain: &str) -> Result<(), ValidationError> {
        if domain.is_empty() {
            return Err(ValidationError::Empty);
        }
        let bare = domain.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<IpAddr>().is_ok() {
            return Err(ValidationError::IpLiteral {
                value: domain.to_string(),
            });
        }
        if domain.len() > MAX_DOMAIN_LEN {
            return Err(ValidationError::TooLong { len: domain.len() });
        }

        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 {
            return Err(ValidationError::SingleLabel {
                domain: domain.to_string(),
            });
        }
        for label in &labels {
            if label.len() > MAX_LABEL_LEN {
                return Err(ValidationError::LabelTooLong {
                    label: label.to_string(),
                });
            }
            if !label_pattern().is_match(label) {
                return Err(ValidationError::InvalidLabel {
                    label: label.to_string(),
                });
            }
        }
        // 顶级域不能是纯数字
        if labels
            .last()
            .is_some_and(|tld| tld.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(ValidationError::InvalidLabel {
                label: labels[labels.len() - 1].to_string(),
            });
        }

        if self.is_platform_host(domain) {
            return Err(ValidationError::PlatformDomain {
                domain: domain.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ValidationContext {
        ValidationContext::new(vec!["portyo.me".to_string()])
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("  Foo.Example.COM "), "foo.example.com");
        assert_eq!(normalize_domain("https://foo.example.com/path?q=1"), "foo.example.com");
        assert_eq!(normalize_domain("foo.example.com:8443"), "foo.example.com");
        assert_eq!(normalize_domain("foo.example.com."), "foo.example.com");
        assert_eq!(normalize_domain("http://user@foo.example.com"), "foo.example.com");
    }

    #[test]
    fn test_accepts_regular_domains() {
        let ctx = ctx();
        assert!(ctx.validate_domain("foo.example.com").is_ok());
        assert!(ctx.validate_domain("parivahansewa.com").is_ok());
        assert!(ctx.validate_domain("my-site.co.uk").is_ok());
        assert!(ctx.validate_domain("xn--bcher-kva.example").is_ok());
    }

    #[test]
    fn test_rejects_invalid_domains() {
        let ctx = ctx();
        assert_eq!(ctx.validate_domain(""), Err(ValidationError::Empty));
        assert!(matches!(
            ctx.validate_domain("localhost"),
            Err(ValidationError::SingleLabel { .. })
        ));
        assert!(matches!(
            ctx.validate_domain("192.168.0.1"),
            Err(ValidationError::IpLiteral { .. })
        ));
        assert!(matches!(
            ctx.validate_domain("-bad.example.com"),
            Err(ValidationError::InvalidLabel { .. })
        ));
        assert!(matches!(
            ctx.validate_domain("under_score.example.com"),
            Err(ValidationError::InvalidLabel { .. })
        ));
        assert!(matches!(
            ctx.validate_domain(&format!("{}.com", "a".repeat(64))),
            Err(ValidationError::LabelTooLong { .. })
        ));
        let long = format!("{}.com", vec!["abcdefghij"; 25].join("."));
        assert!(matches!(
            ctx.validate_domain(&long),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_rejects_platform_domains() {
        let ctx = ctx();
        assert!(ctx.is_platform_host("portyo.me"));
        assert!(ctx.is_platform_host("api.portyo.me"));
        assert!(!ctx.is_platform_host("notportyo.me"));
        assert!(matches!(
            ctx.validate_domain("www.portyo.me"),
            Err(ValidationError::PlatformDomain { .. })
        ));
    }

    #[test]
    fn test_error_descriptions() {
        assert_eq!(ValidationError::Empty.description(), "domain is required");
        let err = ValidationError::PlatformDomain {
            domain: "portyo.me".into(),
        };
        assert!(err.description().contains("belongs to the platform"));
    }
}
