use crate::dns::{DnsObservation, DnsVerifier};
use crate::metrics;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, middleware};
use chrono::Utc;
use portyo_common::entities::custom_domains::{DomainStatus, Model};
use portyo_common::lifecycle::{self, DomainPatch};
use portyo_common::models::*;
use portyo_common::snapshot::DomainRoute;
use portyo_common::validation::normalize_domain;
use portyo_common::{DomainError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

type ApiResult<T> = Result<T>;

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/api/v1/domains", post(create_domain).get(list_domains))
        .route("/api/v1/domains/check", get(check_domain))
        .route(
            "/api/v1/domains/{id}",
            get(get_domain).patch(update_domain).delete(delete_domain),
        )
        .route("/api/v1/domains/{id}/verify", post(verify_now))
        .route("/api/v1/domains/{id}/resubmit", post(resubmit_domain))
        .route("/api/v1/domains/{id}/suspend", post(suspend_domain))
        .route("/api/v1/domains/{id}/reactivate", post(reactivate_domain))
        .route(
            "/api/v1/bios/{bio_id}/domains",
            get(list_bio_domains).delete(delete_bio_domains),
        )
        .route("/api/v1/users/{user_id}/domains", delete(delete_user_domains))
        .route("/api/v1/admin/domains", get(admin_list_domains))
        .route("/api/v1/routing/{host}", get(lookup_route))
        .route("/api/v1/acme/challenge/{token}", get(get_acme_challenge))
        .route("/.well-known/acme-challenge/{token}", get(serve_acme_challenge))
        .route("/api/v1/metrics", get(render_metrics))
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct OwnerQuery {
    user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct CheckQuery {
    domain: String,
}

#[derive(Debug, Deserialize)]
struct AdminQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RoutingAnswer {
    Platform { host: String },
    Custom(DomainRoute),
}

fn dns_instructions(record: &Model, verifier: &DnsVerifier) -> Vec<DnsInstructions> {
    let target = verifier.expected_for(record);
    let mut instructions = vec![DnsInstructions {
        record_type: "CNAME".to_string(),
        host: record.domain.clone(),
        value: target.clone(),
    }];
    if record.redirect_www
        && let Some(alias) = record.www_alias()
    {
        instructions.push(DnsInstructions {
            record_type: "CNAME".to_string(),
            host: alias,
            value: target,
        });
    }
    // 根域名不能设置 CNAME 时改用 A 记录
    for ip in verifier.platform_ips() {
        instructions.push(DnsInstructions {
            record_type: "A".to_string(),
            host: record.domain.clone(),
            value: ip.to_string(),
        });
    }
    instructions
}

async fn load_owned(state: &AppState, id: Uuid, owner: Option<Uuid>) -> Result<Model> {
    let record = state
        .store
        .find_by_id(id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("custom domain {id}")))?;
    match owner {
        // 不暴露其他用户的记录是否存在
        Some(user_id) if user_id != record.user_id => {
            Err(DomainError::not_found(format!("custom domain {id}")))
        }
        _ => Ok(record),
    }
}

fn ensure_not_suspended(record: &Model) -> Result<()> {
    if record.status == DomainStatus::Suspended {
        return Err(DomainError::AdministrativeSuspension(
            record
                .error_message
                .clone()
                .unwrap_or_else(|| "contact support to reactivate".to_string()),
        ));
    }
    Ok(())
}

/// 执行管理操作迁移。进行中的 worker 租约会被撤销，它的结果不会覆盖本次操作。
async fn apply_override(
    state: &AppState,
    record: &Model,
    patch: DomainPatch,
) -> Result<Model> {
    let target = patch.status.unwrap_or(record.status);
    let updated = state
        .store
        .override_lifecycle(record.id, record.status, &patch, Utc::now())
        .await?
        .ok_or(DomainError::InvalidTransition {
            from: record.status,
            to: target,
        })?;
    state.refresh_routing().await?;
    Ok(updated)
}

async fn create_domain(
    State(state): State<AppState>,
    Json(payload): Json<CreateCustomDomain>,
) -> ApiResult<(StatusCode, Json<CreateCustomDomainResponse>)> {
    let domain = normalize_domain(&payload.domain);
    state
        .validation
        .validate_domain(&domain)
        .map_err(|err| DomainError::validation(err.description()))?;

    let record = state
        .store
        .create(
            NewCustomDomain {
                domain,
                bio_id: payload.bio_id,
                user_id: payload.user_id,
                expected_dns_value: state.verifier.expected_target().to_string(),
                verification_token: Uuid::new_v4().simple().to_string(),
            },
            Utc::now(),
        )
        .await?;
    state.refresh_routing().await?;
    tracing::info!(domain = %record.domain, id = %record.id, "custom domain registered");

    let instructions = dns_instructions(&record, &state.verifier);
    Ok((
        StatusCode::CREATED,
        Json(CreateCustomDomainResponse {
            domain: record.into(),
            instructions,
        }),
    ))
}

async fn list_domains(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<CustomDomainView>>> {
    let user_id = query
        .user_id
        .ok_or_else(|| DomainError::BadRequest("user_id is required".to_string()))?;
    let list = state.store.list_by_user(user_id).await?;
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn check_domain(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<DnsCheckResponse>> {
    let domain = normalize_domain(&query.domain);
    state
        .validation
        .validate_domain(&domain)
        .map_err(|err| DomainError::validation(err.description()))?;

    let existing = state.store.find_by_domain(&domain).await?;
    let expected = state.verifier.expected_target().to_string();
    let observation = state.verifier.observe(&domain, &expected).await;

    Ok(Json(DnsCheckResponse {
        available: existing.is_none(),
        dns_configured: matches!(observation, DnsObservation::Matched(_)),
        actual_value: observation.actual(),
        existing_status: existing.map(|r| r.status),
        expected_value: expected,
        domain,
    }))
}

async fn get_domain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<Json<CustomDomainView>> {
    let record = load_owned(&state, id, owner.user_id).await?;
    Ok(Json(record.into()))
}

async fn update_domain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
    Json(payload): Json<UpdateRoutingPreferences>,
) -> ApiResult<Json<CustomDomainView>> {
    let record = load_owned(&state, id, owner.user_id).await?;
    ensure_not_suspended(&record)?;
    if let Some(Some(target)) = &payload.redirect_to
        && !(target.starts_with("https://") || target.starts_with("http://"))
    {
        return Err(DomainError::BadRequest(
            "redirect_to must be an http(s) URL".to_string(),
        ));
    }

    let updated = state
        .store
        .update_preferences(id, &payload, Utc::now())
        .await?
        .ok_or_else(|| DomainError::not_found(format!("custom domain {id}")))?;
    state.refresh_routing().await?;
    Ok(Json(updated.into()))
}

async fn delete_domain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<StatusCode> {
    let record = load_owned(&state, id, owner.user_id).await?;
    if !state.store.delete(id).await? {
        return Err(DomainError::not_found(format!("custom domain {id}")));
    }
    state.refresh_routing().await?;
    tracing::info!(domain = %record.domain, status = %record.status, "custom domain removed");
    Ok(StatusCode::NO_CONTENT)
}

/// 清除退避，下一次 tick 立即重新检查 DNS
async fn verify_now(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let record = load_owned(&state, id, owner.user_id).await?;
    ensure_not_suspended(&record)?;
    if !matches!(
        record.status,
        DomainStatus::VerifyingDns | DomainStatus::DnsVerified
    ) {
        return Err(DomainError::BadRequest(format!(
            "domain is {}, nothing to re-check",
            record.status
        )));
    }

    let patch = DomainPatch {
        last_checked_at: Some(None),
        ..Default::default()
    };
    apply_override(&state, &record, patch).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"scheduled": true}))))
}

async fn resubmit_domain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<Json<CustomDomainView>> {
    let record = load_owned(&state, id, owner.user_id).await?;
    ensure_not_suspended(&record)?;
    let patch = lifecycle::resubmit(&record)?;
    let updated = apply_override(&state, &record, patch).await?;
    Ok(Json(updated.into()))
}

async fn suspend_domain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SuspendRequest>,
) -> ApiResult<Json<CustomDomainView>> {
    let reason = payload.reason.trim();
    if reason.is_empty() {
        return Err(DomainError::BadRequest("reason is required".to_string()));
    }
    let record = load_owned(&state, id, None).await?;
    let patch = lifecycle::suspend(&record, reason)?;
    let updated = apply_override(&state, &record, patch).await?;
    tracing::info!(domain = %updated.domain, from = %record.status, reason, "custom domain suspended");
    Ok(Json(updated.into()))
}

async fn reactivate_domain(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CustomDomainView>> {
    let record = load_owned(&state, id, None).await?;
    let patch = lifecycle::reactivate(&record, Utc::now())?;
    let updated = apply_override(&state, &record, patch).await?;
    tracing::info!(domain = %updated.domain, "custom domain reactivated");
    Ok(Json(updated.into()))
}

async fn list_bio_domains(
    State(state): State<AppState>,
    Path(bio_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CustomDomainView>>> {
    let list = state.store.list_by_bio(bio_id).await?;
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn delete_bio_domains(
    State(state): State<AppState>,
    Path(bio_id): Path<Uuid>,
) -> ApiResult<Json<JsonValue>> {
    let deleted = state.store.delete_by_bio(bio_id).await?;
    state.refresh_routing().await?;
    Ok(Json(json!({"deleted": deleted})))
}

async fn delete_user_domains(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<JsonValue>> {
    let deleted = state.store.delete_by_user(user_id).await?;
    state.refresh_routing().await?;
    Ok(Json(json!({"deleted": deleted})))
}

async fn admin_list_domains(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> ApiResult<Json<Vec<CustomDomainView>>> {
    let list = match query.status.as_deref() {
        Some(raw) => {
            let status = DomainStatus::parse(raw)
                .ok_or_else(|| DomainError::BadRequest(format!("unknown status {raw}")))?;
            state.store.list_by_status(&[status]).await?
        }
        None => state.store.list_all().await?,
    };
    Ok(Json(list.into_iter().map(Into::into).collect()))
}

async fn lookup_route(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> ApiResult<Json<RoutingAnswer>> {
    let host = normalize_domain(&host);
    if state.validation.is_platform_host(&host) {
        return Ok(Json(RoutingAnswer::Platform { host }));
    }
    state
        .routing
        .lookup(&host)
        .await
        .map(|route| Json(RoutingAnswer::Custom(route)))
        .ok_or_else(|| DomainError::not_found(format!("host {host}")))
}

async fn render_metrics() -> axum::response::Response {
    metrics::render_metrics()
}

async fn get_acme_challenge(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    match state.acme_store.get(&token).await {
        Some(key_auth) => Ok(Json(json!({"key_auth": key_auth}))),
        None => Err(DomainError::not_found("challenge not found")),
    }
}

async fn serve_acme_challenge(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<String> {
    state
        .acme_store
        .get(&token)
        .await
        .ok_or_else(|| DomainError::not_found("challenge not found"))
}
