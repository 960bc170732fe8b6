use crate::certs::{CertificateAuthority, IssuedCertificate, parse_cert_expiry};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use portyo_common::DomainError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

/// 订单进行中由 API 对外提供的 HTTP-01 key authorization
#[derive(Clone, Default)]
pub struct AcmeChallengeStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl AcmeChallengeStore {
    pub async fn set(&self, token: String, key_auth: String) {
        self.inner.write().await.insert(token, key_auth);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, tokens: &[String]) {
        let mut inner = self.inner.write().await;
        for token in tokens {
            inner.remove(token);
        }
    }
}

pub struct AcmeAuthority {
    directory_url: String,
    contact_email: String,
    storage_dir: PathBuf,
    challenges: AcmeChallengeStore,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    pub fn new(
        directory_url: String,
        contact_email: String,
        storage_dir: PathBuf,
        challenges: AcmeChallengeStore,
    ) -> Self {
        Self {
            directory_url,
            contact_email,
            storage_dir,
            challenges,
            account: OnceCell::new(),
        }
    }

    fn credentials_path(&self) -> PathBuf {
        self.storage_dir.join("account.json")
    }

    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account> {
        let path = self.credentials_path();
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let creds: AccountCredentials = serde_json::from_slice(&raw)?;
                return Ok(Account::builder()?.from_credentials(creds).await?);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let contact = format!("mailto:{}", self.contact_email);
        let (account, creds) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &[contact.as_str()],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;

        tokio::fs::create_dir_all(&self.storage_dir).await?;
        tokio::fs::write(&path, serde_json::to_vec(&creds)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!(directory = %self.directory_url, "registered acme account");
        Ok(account)
    }

    async fn order_certificate(&self, names: &[String]) -> Result<IssuedCertificate> {
        let account = self.account().await?;
        let mut tokens = Vec::new();
        let result = self.order_certificate_inner(account, names, &mut tokens).await;
        self.challenges.remove(&tokens).await;
        result
    }

    async fn order_certificate_inner(
        &self,
        account: &Account,
        names: &[String],
        tokens: &mut Vec<String>,
    ) -> Result<IssuedCertificate> {
        let identifiers: Vec<Identifier> = names
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result?;
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let mut challenge = authz
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| anyhow!("missing HTTP-01 challenge"))?;

            let key_auth = challenge.key_authorization().as_str().to_string();
            let token = challenge.token.clone();

            self.challenges.set(token.clone(), key_auth).await;
            tokens.push(token);
            challenge.set_ready().await?;
        }

        let status = order.poll_ready(&RetryPolicy::default()).await?;
        if status != OrderStatus::Ready {
            return Err(anyhow!("order not ready: {:?}", status));
        }

        let private_key_pem = order.finalize().await?;
        let cert_chain_pem = order.poll_certificate(&RetryPolicy::default()).await?;

        let expires_at = parse_cert_expiry(&cert_chain_pem)?;
        Ok(IssuedCertificate {
            certificate_pem: cert_chain_pem,
            private_key_pem,
            expires_at,
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    fn name(&self) -> &'static str {
        "acme"
    }

    async fn issue(&self, names: &[String]) -> portyo_common::Result<IssuedCertificate> {
        self.order_certificate(names)
            .await
            .map_err(|err| DomainError::issuance(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_challenge_store_removes_only_given_tokens() {
        let store = AcmeChallengeStore::default();
        store.set("a".into(), "a.key".into()).await;
        store.set("b".into(), "b.key".into()).await;

        store.remove(&["a".to_string()]).await;
        assert_eq!(store.get("a").await, None);
        assert_eq!(store.get("b").await.as_deref(), Some("b.key"));
    }
}
