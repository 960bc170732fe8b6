use crate::acme::AcmeChallengeStore;
use crate::dns::DnsVerifier;
use crate::store::DomainStore;
use chrono::Utc;
use portyo_common::Result;
use portyo_common::snapshot::build_snapshot;
use portyo_common::state::RoutingTable;
use portyo_common::validation::ValidationContext;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DomainStore>,
    pub routing: RoutingTable,
    pub verifier: Arc<DnsVerifier>,
    pub validation: Arc<ValidationContext>,
    pub acme_store: AcmeChallengeStore,
}

impl AppState {
    /// 写操作之后重建路由缓存
    pub async fn refresh_routing(&self) -> Result<()> {
        let records = self.store.list_all().await?;
        self.routing.apply(build_snapshot(&records, Utc::now())).await;
        Ok(())
    }
}
