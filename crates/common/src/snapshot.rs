use crate::entities::custom_domains::{DomainStatus, Model};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// 边缘层路由一个 Host 所需的全部信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRoute {
    pub domain_id: Uuid,
    pub domain: String,
    pub bio_id: Uuid,
    pub status: DomainStatus,
    pub serving: bool,
    pub is_healthy: bool,
    pub is_www_alias: bool,
    pub ssl_certificate_path: Option<String>,
    pub ssl_private_key_path: Option<String>,
    pub redirect_www: bool,
    pub force_https: bool,
    pub redirect_to: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub routes: HashMap<String, DomainRoute>,
    pub built_at: Option<DateTime<Utc>>,
}

impl RoutingSnapshot {
    pub fn lookup(&self, host: &str) -> Option<&DomainRoute> {
        self.routes.get(host)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

pub fn build_snapshot(records: &[Model], now: DateTime<Utc>) -> RoutingSnapshot {
    let mut routes = HashMap::with_capacity(records.len());
    for record in records {
        let route = route_for(record, false);
        if record.redirect_www
            && let Some(alias) = record.www_alias()
        {
            // 显式注册的 www 域名优先于别名
            routes
                .entry(alias)
                .or_insert_with(|| route_for(record, true));
        }
        routes.insert(record.domain.clone(), route);
    }
    RoutingSnapshot {
        routes,
        built_at: Some(now),
    }
}

fn route_for(record: &Model, is_www_alias: bool) -> DomainRoute {
    DomainRoute {
        domain_id: record.id,
        domain: record.domain.clone(),
        bio_id: record.bio_id,
        status: record.status,
        serving: record.status == DomainStatus::Active && record.ssl_active,
        is_healthy: record.is_healthy,
        is_www_alias,
        ssl_certificate_path: record.ssl_certificate_path.clone(),
        ssl_private_key_path: record.ssl_private_key_path.clone(),
        redirect_www: record.redirect_www,
        force_https: record.force_https,
        redirect_to: record.redirect_to.clone(),
        error_message: record.error_message.clone(),
    }
}
