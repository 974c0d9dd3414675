//! Administrative command handlers.
//!
//! Each handler turns a parsed request into calls against the registry,
//! issuer, store, or ACME server, and maps failures onto the error kinds of
//! `crate::error`.

use http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::models::{CaOptions, LeafOptions};
use crate::paths;
use crate::pki;
use crate::storage::config_keys;
use crate::summary::build_summary;

use super::{AppContext, RequestParts};
use super::response::ApiResponse;
use super::sse;

// ---- CA lifecycle ---------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaSetupRequest {
    name: String,
    #[serde(flatten)]
    opts: CaOptions,
}

pub async fn ca_setup(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let body: CaSetupRequest = req.json_body()?;
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    let root = ctx.registry.create_root(&body.name, body.opts).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true, "id": root.id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateRequest {
    id: String,
}

pub async fn ca_activate(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = match req.query.get("id") {
        Some(id) => id.clone(),
        None => req.json_body::<ActivateRequest>()?.id,
    };
    ctx.registry.activate(&id).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true, "id": id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntermediateRequest {
    parent_ca_id: String,
    name: String,
    #[serde(flatten)]
    opts: CaOptions,
}

pub async fn ca_intermediate_create(
    ctx: AppContext,
    req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let body: IntermediateRequest = req.json_body()?;
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    let intermediate = ctx
        .registry
        .create_intermediate(&body.parent_ca_id, &body.name, body.opts)
        .await?;
    Ok(ApiResponse::ok_json(
        &json!({ "ok": true, "id": intermediate.id }),
    ))
}

pub async fn ca_delete(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.require_query("id")?;
    ctx.registry.delete_root(id).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

pub async fn ca_intermediate_delete(
    ctx: AppContext,
    req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let id = req.require_query("id")?;
    ctx.registry.delete_intermediate(id).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

/// Locate a CA row of either kind and its on-disk certificate path.
async fn ca_cert_location(
    ctx: &AppContext,
    id: &str,
) -> Result<std::path::PathBuf, ApiError> {
    let data_dir = ctx.store.data_dir().to_path_buf();
    if ctx.store.get_root(id).await?.is_some() {
        return Ok(paths::root_cert_path(&data_dir, id));
    }
    if ctx.store.get_intermediate(id).await?.is_some() {
        return Ok(paths::intermediate_cert_path(&data_dir, id));
    }
    Err(ApiError::NotFound(format!("no CA {id:?}")))
}

pub async fn ca_info(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.require_query("id")?;
    let cert_path = ca_cert_location(&ctx, id).await?;
    let pem = tokio::fs::read_to_string(&cert_path)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("reading {cert_path:?}: {e}")))?;
    let details = pki::parse_certificate(&pem)?;
    Ok(ApiResponse::ok_json(&json!({
        "ok": true,
        "id": id,
        "certificate": details,
    })))
}

pub async fn ca_cert_download(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.require_query("id")?;
    let cert_path = ca_cert_location(&ctx, id).await?;
    let pem = tokio::fs::read_to_string(&cert_path)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("reading {cert_path:?}: {e}")))?;
    Ok(ApiResponse::pem(pem))
}

pub async fn ca_list(ctx: AppContext, _req: RequestParts) -> Result<ApiResponse, ApiError> {
    let roots = ctx.store.list_roots().await?;
    let intermediates = ctx.store.list_intermediates().await?;
    let active = ctx.store.active_ca_id().await?;
    Ok(ApiResponse::ok_json(&json!({
        "ok": true,
        "activeCaId": active,
        "roots": roots,
        "intermediates": intermediates,
    })))
}

// ---- leaf lifecycle -------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertCreateRequest {
    issuer_id: Option<String>,
    domain: String,
    #[serde(flatten)]
    opts: LeafOptions,
}

pub async fn cert_create(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let body: CertCreateRequest = req.json_body()?;
    let issuer_id = match body.issuer_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => ctx
            .store
            .active_ca_id()
            .await?
            .ok_or_else(|| ApiError::BadRequest("no issuerId given and no active CA".into()))?,
    };
    let id = ctx
        .issuer
        .issue_leaf(&issuer_id, &body.domain, body.opts)
        .await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true, "id": id })))
}

pub async fn cert_revoke(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    ctx.issuer.revoke_leaf(id).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

pub async fn cert_renew(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    let new_id = ctx.issuer.renew_leaf(id).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true, "id": new_id })))
}

pub async fn cert_delete(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    ctx.issuer.delete_leaf(id).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

pub async fn cert_info(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    let leaf = ctx
        .store
        .get_leaf(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no certificate {id}")))?;
    let details = pki::parse_certificate(&leaf.pem)?;
    let revocation = ctx.store.get_revocation(id).await?;
    Ok(ApiResponse::ok_json(&json!({
        "ok": true,
        "id": id,
        "domain": leaf.domain,
        "issuerId": leaf.issuer_id,
        "isAcme": leaf.is_acme,
        "isEv": leaf.is_ev,
        "revoked": revocation.is_some(),
        "revokedAt": revocation.map(|r| r.revoked_at),
        "certificate": details,
    })))
}

pub async fn cert_download(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    let leaf = ctx
        .store
        .get_leaf(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no certificate {id}")))?;
    Ok(ApiResponse::pem(leaf.pem))
}

pub async fn cert_key(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    if ctx.store.get_leaf(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("no certificate {id}")));
    }
    let key_path = paths::leaf_key_path(ctx.store.data_dir(), id);
    let pem = tokio::fs::read_to_string(&key_path)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("reading {key_path:?}: {e}")))?;
    Ok(ApiResponse::pem(pem))
}

pub async fn cert_revocation_status(
    ctx: AppContext,
    req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    if ctx.store.get_leaf(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("no certificate {id}")));
    }
    let revocation = ctx.store.get_revocation(id).await?;
    Ok(ApiResponse::ok_json(&json!({
        "ok": true,
        "revoked": revocation.is_some(),
        "revokedAt": revocation.map(|r| r.revoked_at),
    })))
}

// ---- ACME policy tables ---------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WhitelistRequest {
    domain_pattern: String,
}

pub async fn whitelist_list(ctx: AppContext, _req: RequestParts) -> Result<ApiResponse, ApiError> {
    let entries = ctx.store.list_whitelist().await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true, "entries": entries })))
}

pub async fn whitelist_create(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let body: WhitelistRequest = req.json_body()?;
    let pattern = body.domain_pattern.trim().to_ascii_lowercase();
    if pattern.is_empty() {
        return Err(ApiError::BadRequest("domainPattern must not be empty".into()));
    }
    match ctx.store.insert_whitelist(&pattern).await? {
        Some(id) => Ok(ApiResponse::ok_json(&json!({ "ok": true, "id": id }))),
        None => Err(ApiError::Conflict(format!(
            "already-whitelisted: {pattern:?}"
        ))),
    }
}

pub async fn whitelist_delete(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    if !ctx.store.delete_whitelist(id).await? {
        return Err(ApiError::NotFound(format!("no whitelist entry {id}")));
    }
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentRequest {
    domain_pattern: String,
    ca_id: String,
}

pub async fn assignments_list(
    ctx: AppContext,
    _req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let entries = ctx.store.list_assignments().await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true, "entries": entries })))
}

pub async fn assignments_create(
    ctx: AppContext,
    req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let body: AssignmentRequest = req.json_body()?;
    let pattern = body.domain_pattern.trim().to_ascii_lowercase();
    if pattern.is_empty() {
        return Err(ApiError::BadRequest("domainPattern must not be empty".into()));
    }
    let ca_id = body.ca_id.trim();
    if ctx.store.get_root(ca_id).await?.is_none()
        && ctx.store.get_intermediate(ca_id).await?.is_none()
    {
        return Err(ApiError::NotFound(format!("no CA {ca_id:?}")));
    }
    match ctx.store.insert_assignment(&pattern, ca_id).await? {
        Some(id) => Ok(ApiResponse::ok_json(&json!({ "ok": true, "id": id }))),
        None => Err(ApiError::Conflict(format!(
            "assignment for {pattern:?} already exists"
        ))),
    }
}

pub async fn assignments_delete(
    ctx: AppContext,
    req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let id = req.id_param()?;
    if !ctx.store.delete_assignment(id).await? {
        return Err(ApiError::NotFound(format!("no assignment {id}")));
    }
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

// ---- ACME challenge administration ---------------------------------------

pub async fn acme_challenge_accept(
    ctx: AppContext,
    req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let authz_id = req.require_query("id")?;
    ctx.acme.accept_authorization(authz_id).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticChallengeRequest {
    token: String,
    key_authorization: String,
}

pub async fn acme_challenge_static(
    ctx: AppContext,
    req: RequestParts,
) -> Result<ApiResponse, ApiError> {
    let body: StaticChallengeRequest = req.json_body()?;
    if body.token.trim().is_empty() {
        return Err(ApiError::BadRequest("token must not be empty".into()));
    }
    ctx.store
        .upsert_legacy_challenge(
            body.token.trim(),
            body.key_authorization.trim(),
            &chrono::Utc::now().to_rfc3339(),
        )
        .await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

// ---- config ---------------------------------------------------------------

pub async fn config_get(ctx: AppContext, _req: RequestParts) -> Result<ApiResponse, ApiError> {
    let mut values = serde_json::Map::new();
    for key in config_keys::ALL {
        let value = ctx.store.get_config(key).await?;
        values.insert((*key).to_string(), json!(value));
    }
    Ok(ApiResponse::ok_json(&json!({
        "ok": true,
        "values": values,
        "defaults": {
            (config_keys::DEFAULT_KEY_SIZE): ctx.store.default_key_size().await?,
            (config_keys::DEFAULT_VALIDITY_YEARS): ctx.store.default_validity_years().await?,
            (config_keys::DEFAULT_VALIDITY_DAYS): ctx.store.default_validity_days().await?,
            (config_keys::DEFAULT_HASH_ALGORITHM): ctx.store.default_hash_algorithm().await?,
            (config_keys::DEFAULT_COMMON_NAME_ROOT): ctx.store.default_common_name_root().await?,
            (config_keys::DEFAULT_COMMON_NAME_INTERMEDIATE):
                ctx.store.default_common_name_intermediate().await?,
        },
    })))
}

#[derive(Deserialize)]
struct ConfigSetRequest {
    key: String,
    value: String,
}

pub async fn config_set(ctx: AppContext, req: RequestParts) -> Result<ApiResponse, ApiError> {
    let body: ConfigSetRequest = req.json_body()?;
    if !config_keys::ALL.contains(&body.key.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "unknown config key {:?}",
            body.key
        )));
    }
    ctx.store.set_config(&body.key, &body.value).await?;
    Ok(ApiResponse::ok_json(&json!({ "ok": true })))
}

// ---- summary & events -----------------------------------------------------

pub async fn summary(ctx: AppContext, _req: RequestParts) -> Result<ApiResponse, ApiError> {
    let snapshot = build_summary(&ctx.store, &ctx.validator, &ctx.stats).await?;
    Ok(ApiResponse::json(
        StatusCode::OK,
        &serde_json::to_value(snapshot).map_err(|e| ApiError::Internal(e.into()))?,
    ))
}

pub async fn events(ctx: AppContext, _req: RequestParts) -> Result<ApiResponse, ApiError> {
    let rx = sse::start_event_stream(ctx);
    Ok(ApiResponse::event_stream(rx))
}
