use crate::snapshot::{DomainRoute, RoutingSnapshot};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 路由快照缓存。边缘查询只读这里，不访问数据库。
#[derive(Clone)]
pub struct RoutingTable {
    current: Arc<RwLock<RoutingSnapshot>>,
}

impl RoutingTable {
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// 整体替换快照
    pub async fn apply(&self, snapshot: RoutingSnapshot) {
        *self.current.write().await = snapshot;
    }

    pub async fn lookup(&self, host: &str) -> Option<DomainRoute> {
        self.current.read().await.lookup(host).cloned()
    }

    pub async fn len(&self) -> usize {
        self.current.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::custom_domains::DomainStatus;
    use crate::lifecycle::tests::record;
    use crate::snapshot::build_snapshot;
    use chrono::Utc;

    #[tokio::test]
    async fn test_apply_replaces_snapshot() {
        let table = RoutingTable::new(RoutingSnapshot::default());
        assert!(table.lookup("foo.example.com").await.is_none());

        let snapshot = build_snapshot(&[record(DomainStatus::Pending)], Utc::now());
        table.apply(snapshot).await;

        assert_eq!(table.len().await, 2);
        let route = table.lookup("foo.example.com").await.unwrap();
        assert_eq!(route.status, DomainStatus::Pending);

        table.apply(RoutingSnapshot::default()).await;
        assert!(table.lookup("foo.example.com").await.is_none());
    }
}
