//! 自定义域名服务统一错误类型定义
//!
//! 全项目共享一个错误类型，简化错误传播和处理。后台 tick 中的错误只会记录在
//! 实体上（retryCount / errorMessage / lastErrorAt），不会传播到 HTTP 响应。

use crate::entities::custom_domains::DomainStatus;
use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum DomainError {
    /// 域名已被其他记录占用 (409)
    #[error("域名已被注册: {0}")]
    DuplicateDomain(String),

    /// 资源未找到 (404)
    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 请求参数错误 (400)
    #[error("请求参数错误: {0}")]
    BadRequest(String),

    /// 域名格式验证错误 (400)
    #[error("域名无效: {0}")]
    Validation(String),

    /// 状态机不允许的迁移 (409)
    #[error("不允许的状态迁移: {from} -> {to}")]
    InvalidTransition { from: DomainStatus, to: DomainStatus },

    /// DNS 尚未传播，自动重试
    #[error("DNS 尚未生效: 期望 {expected}，实际 {}", .actual.as_deref().unwrap_or("无记录"))]
    DnsNotYetPropagated {
        expected: String,
        actual: Option<String>,
    },

    /// 超过最大等待时间仍未验证通过
    #[error("DNS 验证超时: {0}")]
    DnsTimeout(String),

    /// 证书签发失败，达到阈值前自动重试
    #[error("证书签发失败: {0}")]
    CertificateIssuance(String),

    /// 健康检查失败，触发重新验证
    #[error("健康检查失败: {0}")]
    HealthCheckFailure(String),

    /// 管理员暂停 (403)
    #[error("域名已被暂停: {0}")]
    AdministrativeSuspension(String),

    /// 数据库错误 (500)
    #[error("数据库错误: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// IO 错误 (500)
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误 (500)
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 其他内部错误 (500)
    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn issuance(msg: impl Into<String>) -> Self {
        Self::CertificateIssuance(msg.into())
    }

    pub fn health(msg: impl Into<String>) -> Self {
        Self::HealthCheckFailure(msg.into())
    }

    /// 判断是否为客户端错误（4xx）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateDomain(_)
                | Self::NotFound(_)
                | Self::BadRequest(_)
                | Self::Validation(_)
                | Self::InvalidTransition { .. }
                | Self::AdministrativeSuspension(_)
        )
    }

    /// 判断是否为服务端错误（5xx）
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// 可自动重试的瞬时错误，由控制器吸收
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DnsNotYetPropagated { .. }
                | Self::CertificateIssuance(_)
                | Self::HealthCheckFailure(_)
        )
    }

    /// 获取 HTTP 状态码
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::BadRequest(_) | Self::Validation(_) => 400,
            Self::AdministrativeSuspension(_) => 403,
            Self::DuplicateDomain(_) | Self::InvalidTransition { .. } => 409,
            _ => 500,
        }
    }

    #[cfg(feature = "control-plane")]
    pub fn axum_status_code(&self) -> axum::http::StatusCode {
        axum::http::StatusCode::from_u16(self.http_status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;

// ============ Axum HTTP 响应支持 ============

#[cfg(feature = "control-plane")]
mod axum_impl {
    use super::*;
    use axum::{
        Json,
        response::{IntoResponse, Response},
    };
    use serde_json::json;

    impl IntoResponse for DomainError {
        fn into_response(self) -> Response {
            let status = self.axum_status_code();

            // 客户端错误 info，外部服务 warn，其余 error
            match &self {
                DomainError::DuplicateDomain(domain) => {
                    tracing::info!(status = status.as_u16(), domain = %domain, "Duplicate domain");
                }
                DomainError::NotFound(resource) => {
                    tracing::info!(status = status.as_u16(), resource = %resource, "Resource not found");
                }
                DomainError::BadRequest(msg) | DomainError::Validation(msg) => {
                    tracing::info!(status = status.as_u16(), reason = %msg, "Request rejected");
                }
                DomainError::InvalidTransition { from, to } => {
                    tracing::info!(
                        status = status.as_u16(),
                        from = %from,
                        to = %to,
                        "Status transition refused"
                    );
                }
                DomainError::AdministrativeSuspension(msg) => {
                    tracing::info!(status = status.as_u16(), reason = %msg, "Domain suspended");
                }
                DomainError::DnsNotYetPropagated { .. }
                | DomainError::DnsTimeout(_)
                | DomainError::CertificateIssuance(_)
                | DomainError::HealthCheckFailure(_) => {
                    tracing::warn!(status = status.as_u16(), error = %self, "Lifecycle operation failed");
                }
                DomainError::Database(db_err) => {
                    tracing::error!(status = status.as_u16(), error = %db_err, "Database operation failed");
                }
                DomainError::Io(io_err) => {
                    tracing::error!(status = status.as_u16(), io_error = %io_err, "IO operation failed");
                }
                DomainError::Serialization(json_err) => {
                    tracing::error!(
                        status = status.as_u16(),
                        serialization_error = %json_err,
                        "JSON serialization failed"
                    );
                }
                DomainError::Internal(internal_err) => {
                    tracing::error!(
                        status = status.as_u16(),
                        internal_error = ?internal_err,
                        "Internal server error"
                    );
                }
            }

            let body = Json(json!({"error": self.to_string()}));
            (status, body).into_response()
        }
    }
}

// ============ 事务错误支持 ============

impl<T> From<sea_orm::TransactionError<T>> for DomainError
where
    T: Into<DomainError>,
{
    fn from(err: sea_orm::TransactionError<T>) -> Self {
        match err {
            sea_orm::TransactionError::Connection(db) => Self::Database(db),
            sea_orm::TransactionError::Transaction(app) => app.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_error() -> DomainError {
        DomainError::Database(sea_orm::DbErr::Conn(sea_orm::RuntimeErr::Internal(
            "test".to_string(),
        )))
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(DomainError::not_found("x").http_status_code(), 404);
        assert_eq!(DomainError::BadRequest("x".into()).http_status_code(), 400);
        assert_eq!(DomainError::validation("x").http_status_code(), 400);
        assert_eq!(
            DomainError::DuplicateDomain("foo.example.com".into()).http_status_code(),
            409
        );
        assert_eq!(
            DomainError::InvalidTransition {
                from: DomainStatus::Pending,
                to: DomainStatus::Active,
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            DomainError::AdministrativeSuspension("abuse".into()).http_status_code(),
            403
        );
        assert_eq!(db_error().http_status_code(), 500);
        assert_eq!(DomainError::issuance("rate limited").http_status_code(), 500);
    }

    #[test]
    fn test_classification() {
        assert!(DomainError::DuplicateDomain("a.com".into()).is_client_error());
        assert!(DomainError::validation("x").is_client_error());
        assert!(db_error().is_server_error());
        assert!(DomainError::DnsTimeout("a.com".into()).is_server_error());

        assert!(DomainError::issuance("x").is_transient());
        assert!(DomainError::health("x").is_transient());
        assert!(
            DomainError::DnsNotYetPropagated {
                expected: "cname.portyo.me".into(),
                actual: None,
            }
            .is_transient()
        );
        assert!(!DomainError::DnsTimeout("a.com".into()).is_transient());
    }

    #[test]
    fn test_messages() {
        let err = DomainError::DnsNotYetPropagated {
            expected: "cname.portyo.me".into(),
            actual: Some("other-host.com".into()),
        };
        assert_eq!(
            err.to_string(),
            "DNS 尚未生效: 期望 cname.portyo.me，实际 other-host.com"
        );

        let err = DomainError::DnsNotYetPropagated {
            expected: "cname.portyo.me".into(),
            actual: None,
        };
        assert!(err.to_string().ends_with("实际 无记录"));

        let err = DomainError::InvalidTransition {
            from: DomainStatus::Pending,
            to: DomainStatus::Active,
        };
        assert_eq!(err.to_string(), "不允许的状态迁移: pending -> active");
    }

    #[test]
    fn test_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DomainError = io_err.into();
        assert!(matches!(err, DomainError::Io(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: DomainError = json_err.into();
        assert!(matches!(err, DomainError::Serialization(_)));

        let err: DomainError = anyhow::anyhow!("something went wrong").into();
        assert!(matches!(err, DomainError::Internal(_)));
    }

    #[test]
    fn test_transaction_error_conversion() {
        let db_err = sea_orm::DbErr::Conn(sea_orm::RuntimeErr::Internal(
            "connection failed".to_string(),
        ));
        let tx_err: sea_orm::TransactionError<DomainError> =
            sea_orm::TransactionError::Connection(db_err);
        let converted: DomainError = tx_err.into();
        assert!(matches!(converted, DomainError::Database(_)));

        let tx_err: sea_orm::TransactionError<DomainError> =
            sea_orm::TransactionError::Transaction(DomainError::DuplicateDomain("a.com".into()));
        let converted: DomainError = tx_err.into();
        assert!(matches!(converted, DomainError::DuplicateDomain(_)));
    }

    #[cfg(feature = "control-plane")]
    #[test]
    fn test_axum_status_code() {
        use axum::http::StatusCode;

        assert_eq!(
            DomainError::DuplicateDomain("a.com".into()).axum_status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DomainError::not_found("x").axum_status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(db_error().axum_status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
