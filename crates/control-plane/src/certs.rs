use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use portyo_common::lifecycle::CertificateArtifacts;
use portyo_common::{DomainError, Result};
use rcgen::{CertificateParams, KeyPair};
use std::path::{Path, PathBuf};
use x509_parser::pem::parse_x509_pem;

const SELF_SIGNED_VALIDITY_DAYS: i64 = 90;

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    fn name(&self) -> &'static str;

    /// `names[0]` is the primary domain; the rest are extra SANs.
    async fn issue(&self, names: &[String]) -> Result<IssuedCertificate>;
}

pub fn parse_cert_expiry(cert_pem: &str) -> anyhow::Result<DateTime<Utc>> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())?;
    let cert = pem.parse_x509()?;
    let not_after = cert.validity().not_after.to_datetime();
    let timestamp = not_after.unix_timestamp();
    let nanos = not_after.nanosecond();
    DateTime::<Utc>::from_timestamp(timestamp, nanos)
        .ok_or_else(|| anyhow!("invalid certificate timestamp"))
}

/// 本地开发用的自签名签发器
pub struct SelfSignedAuthority;

impl SelfSignedAuthority {
    pub(crate) fn generate(names: &[String], now: DateTime<Utc>) -> anyhow::Result<IssuedCertificate> {
        let mut params = CertificateParams::new(names.to_vec())?;
        params.is_ca = rcgen::IsCa::NoCa;
        let not_before = now - Duration::days(1);
        let not_after = now + Duration::days(SELF_SIGNED_VALIDITY_DAYS);
        params.not_before = rcgen::date_time_ymd(
            not_before.year(),
            not_before.month() as u8,
            not_before.day() as u8,
        );
        params.not_after = rcgen::date_time_ymd(
            not_after.year(),
            not_after.month() as u8,
            not_after.day() as u8,
        );

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let certificate_pem = cert.pem();
        let expires_at = parse_cert_expiry(&certificate_pem)?;
        Ok(IssuedCertificate {
            certificate_pem,
            private_key_pem: key_pair.serialize_pem(),
            expires_at,
        })
    }
}

#[async_trait]
impl CertificateAuthority for SelfSignedAuthority {
    fn name(&self) -> &'static str {
        "self-signed"
    }

    async fn issue(&self, names: &[String]) -> Result<IssuedCertificate> {
        Self::generate(names, Utc::now()).map_err(|err| DomainError::issuance(format!("{err:#}")))
    }
}

/// `<root>/<domain>/fullchain.pem` + `privkey.pem`
#[derive(Debug, Clone)]
pub struct CertificateStorage {
    root: PathBuf,
}

impl CertificateStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let dir = self.root.join(domain);
        (dir.join("fullchain.pem"), dir.join("privkey.pem"))
    }

    pub async fn store(
        &self,
        domain: &str,
        issued: &IssuedCertificate,
    ) -> Result<CertificateArtifacts> {
        let (cert_path, key_path) = self.paths(domain);
        if let Some(dir) = cert_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        write_atomic(&key_path, issued.private_key_pem.as_bytes(), true).await?;
        write_atomic(&cert_path, issued.certificate_pem.as_bytes(), false).await?;

        Ok(CertificateArtifacts {
            certificate_path: cert_path.to_string_lossy().into_owned(),
            private_key_path: key_path.to_string_lossy().into_owned(),
            expires_at: issued.expires_at,
        })
    }

    /// 读取已落盘证书的过期时间；文件不存在时返回 None
    pub async fn expiry(&self, cert_path: &str) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::read_to_string(cert_path).await {
            Ok(pem) => Ok(Some(parse_cert_expiry(&pem)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

async fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    #[cfg(unix)]
    {
        if private {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
