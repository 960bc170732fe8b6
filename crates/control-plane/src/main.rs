mod acme;
mod api;
mod certs;
mod controller;
mod db;
mod dns;
mod health;
mod issuer;
mod metrics;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod transaction;

use crate::acme::{AcmeAuthority, AcmeChallengeStore};
use crate::certs::{CertificateAuthority, CertificateStorage, SelfSignedAuthority};
use crate::controller::Controller;
use crate::db::init_db;
use crate::dns::{DnsVerifier, HickoryLookup};
use crate::health::HealthMonitor;
use crate::issuer::CertificateIssuer;
use crate::state::AppState;
use crate::store::{DomainStore, MemoryStore, SeaOrmStore};
use anyhow::{Result, anyhow};
use chrono::Utc;
use portyo_common::config::AppConfig;
use portyo_common::snapshot::build_snapshot;
use portyo_common::state::RoutingTable;
use portyo_common::validation::ValidationContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn DomainStore> = if config.use_memory_store {
        warn!("USE_MEMORY_STORE=true, records are lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        let database_url = config
            .database_url
            .as_ref()
            .ok_or_else(|| anyhow!("DATABASE_URL is required for the domain service"))?;
        // 每个 worker 一个连接，外加 API 使用的连接
        let max_connections = config.worker_concurrency as u32 + 4;
        Arc::new(SeaOrmStore::new(init_db(database_url, max_connections).await?))
    };

    let records = store.list_all().await?;
    let routing = RoutingTable::new(build_snapshot(&records, Utc::now()));
    info!(routes = routing.len().await, "routing table loaded");

    let verifier = Arc::new(DnsVerifier::new(
        Arc::new(HickoryLookup::new(config.policy.dns_lookup_timeout)),
        config.dns_expected_target.clone(),
        config.platform_ips.clone(),
        config.policy.dns_lookup_timeout,
    ));
    let acme_store = AcmeChallengeStore::default();

    let state = AppState {
        store: store.clone(),
        routing: routing.clone(),
        verifier: verifier.clone(),
        validation: Arc::new(ValidationContext::new(config.platform_domains.clone())),
        acme_store: acme_store.clone(),
    };

    let api_task = if config.run_api {
        let api_addr = config.api_addr.clone();
        let api_state = state.clone();
        tokio::spawn(async move {
            let app = api::router(api_state);
            match tokio::net::TcpListener::bind(&api_addr).await {
                Ok(listener) => {
                    info!("domain api listening on {}", api_addr);
                    if let Err(err) = axum::serve(listener, app).await {
                        warn!("domain api exited: {}", err);
                    }
                }
                Err(err) => warn!("failed to bind domain api: {}", err),
            }
        })
    } else {
        info!("RUN_API=false, api disabled");
        tokio::spawn(std::future::pending())
    };

    let controller_task = if config.run_controller {
        let authority: Arc<dyn CertificateAuthority> = if config.acme_enabled {
            if !config.run_api {
                warn!("RUN_API=false, ACME HTTP-01 challenges will not be answered");
            }
            let contact_email = config
                .acme_contact_email
                .clone()
                .ok_or_else(|| anyhow!("ACME_CONTACT_EMAIL is required when ACME is enabled"))?;
            Arc::new(AcmeAuthority::new(
                config.acme_directory_url.clone(),
                contact_email,
                config.acme_storage_dir.clone(),
                acme_store,
            ))
        } else {
            warn!("ACME disabled, issuing self-signed certificates");
            Arc::new(SelfSignedAuthority)
        };
        let issuer = Arc::new(CertificateIssuer::new(
            authority,
            CertificateStorage::new(config.certs_dir.clone()),
            config.policy.issuance_timeout,
        ));
        let health = Arc::new(HealthMonitor::new(verifier.clone(), issuer.clone()));
        let controller = Controller::new(
            store,
            verifier,
            issuer,
            health,
            routing,
            config.policy.clone(),
            config.controller_id.clone(),
            config.worker_concurrency,
        );
        let interval = Duration::from_secs(config.tick_interval_secs);
        tokio::spawn(controller.run(interval))
    } else {
        info!("RUN_CONTROLLER=false, controller disabled");
        tokio::spawn(std::future::pending())
    };

    tokio::select! {
        _ = api_task => {},
        _ = controller_task => {},
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    Ok(())
}
