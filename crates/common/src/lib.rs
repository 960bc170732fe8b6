pub mod config;
pub mod entities;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod snapshot;
pub mod state;
pub mod validation;

// ============ 重新导出常用类型 ============

// 错误处理
pub use error::{DomainError, Result};

// 配置相关
pub use config::{AppConfig, LifecyclePolicy};

// 实体与状态机
pub use entities::custom_domains::{DomainStatus, Model as CustomDomain};
pub use lifecycle::{CertificateArtifacts, DomainPatch};

// 路由缓存
pub use snapshot::{DomainRoute, RoutingSnapshot, build_snapshot};
pub use state::RoutingTable;

// 验证相关
pub use validation::{ValidationContext, ValidationError, normalize_domain};
