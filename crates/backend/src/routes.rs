//! HTTP handlers for the `/v1` surface.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    axum::{
        Json,
        body::Bytes,
        extract::{Query, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde::de::DeserializeOwned,
    tracing::debug,
};

use octo_protocol::{
    Command, CommandResult, POLL_TIMEOUT_MAX_SECS, POLL_TIMEOUT_MIN_SECS, TypedPayload,
    api::{
        OkResponse, PairClaimRequest, PairClaimResponse, PairStartRequest, PairStartResponse,
        PollResponse, ProjectsResponse,
    },
    error_codes, validate_command,
};

use crate::{
    error::ApiError,
    projection::apply_result_projection,
    state::{BackendState, CommandMeta},
};

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        ApiError::validation(
            error_codes::VALIDATION_INVALID_PAYLOAD,
            format!("invalid request body: {e}"),
        )
    })
}

fn required(field: &str) -> ApiError {
    ApiError::validation(
        error_codes::VALIDATION_REQUIRED_FIELD,
        format!("missing required field: {field}"),
    )
}

/// Resolve the calling agent: `Authorization: Bearer <agent_key>` preferred,
/// `X-Telegram-User-ID` through the binding otherwise.
fn authenticate(state: &BackendState, headers: &HeaderMap) -> Result<String, ApiError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value.to_str().map_err(|_| ApiError::unauthorized())?;
        if let Some(key) = value.strip_prefix("Bearer ") {
            return state
                .pairing
                .authenticate_agent_key(key.trim())
                .ok_or_else(ApiError::unauthorized);
        }
        return Err(ApiError::unauthorized());
    }
    if let Some(value) = headers.get("x-telegram-user-id") {
        let user_id = value.to_str().map_err(|_| ApiError::unauthorized())?;
        return state
            .pairing
            .agent_id_for_user(user_id.trim())
            .ok_or_else(ApiError::unauthorized);
    }
    Err(ApiError::unauthorized())
}

fn alias_from_path(raw: &str) -> String {
    std::path::Path::new(raw)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| raw.to_string())
}

// ── Handlers ────────────────────────────────────────────────────────────────

pub(crate) async fn healthz() -> impl IntoResponse {
    Json(OkResponse::new())
}

pub(crate) async fn pair_start(
    State(state): State<Arc<BackendState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: PairStartRequest = decode(&body)?;
    if req.telegram_user_id.trim().is_empty() {
        return Err(required("telegram_user_id"));
    }
    let issued = state.pairing.start_pairing(&req.telegram_user_id).await?;
    Ok(Json(PairStartResponse {
        pairing_code: issued.code,
        expires_at: issued.expires_at,
    })
    .into_response())
}

pub(crate) async fn pair_claim(
    State(state): State<Arc<BackendState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: PairClaimRequest = decode(&body)?;
    if req.pairing_code.trim().is_empty() {
        return Err(required("pairing_code"));
    }
    let binding = state
        .pairing
        .claim_pairing(&req.pairing_code, &req.device_info)
        .await?;
    Ok(Json(PairClaimResponse {
        agent_id: binding.agent_id,
        agent_key: binding.agent_key,
    })
    .into_response())
}

pub(crate) async fn command(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let agent_id = authenticate(&state, &headers)?;
    let cmd: Command = decode(&body)?;
    let kind = validate_command(&cmd).map_err(|e| ApiError::validation(e.code, e.message))?;
    let typed = cmd
        .typed_payload()
        .map_err(|e| ApiError::validation(e.code, e.message))?;

    let telegram_user_id = state
        .pairing
        .user_id_for_agent(&agent_id)
        .unwrap_or_default();
    let meta = match typed {
        TypedPayload::RegisterProject(p) => CommandMeta {
            telegram_user_id,
            command_type: kind,
            project_id: None,
            alias: Some(alias_from_path(&p.project_path_raw)),
            project_path: Some(p.project_path_raw),
        },
        TypedPayload::ApplyProjectPolicy(p) => CommandMeta {
            telegram_user_id,
            command_type: kind,
            project_id: Some(p.project_id),
            alias: None,
            project_path: None,
        },
        TypedPayload::StartServer(p) => CommandMeta {
            telegram_user_id,
            command_type: kind,
            project_id: Some(p.project_id),
            alias: None,
            project_path: None,
        },
        TypedPayload::RunTask(p) => CommandMeta {
            telegram_user_id,
            command_type: kind,
            project_id: Some(p.project_id),
            alias: None,
            project_path: None,
        },
        TypedPayload::Status(_) => CommandMeta {
            telegram_user_id,
            command_type: kind,
            project_id: None,
            alias: None,
            project_path: None,
        },
    };
    state.record_meta(&agent_id, &cmd.command_id, meta);

    debug!(agent_id, command_id = %cmd.command_id, r#type = %kind, "command accepted");
    state
        .queue
        .enqueue(&agent_id, cmd)
        .await
        .map_err(|e| ApiError::internal(format!("enqueue failed: {e}")))?;
    Ok((StatusCode::ACCEPTED, Json(OkResponse::new())).into_response())
}

pub(crate) async fn poll(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let agent_id = authenticate(&state, &headers)?;
    let timeout_seconds: u64 = params
        .get("timeout_seconds")
        .ok_or_else(|| required("timeout_seconds"))?
        .parse()
        .map_err(|_| {
            ApiError::validation(
                error_codes::VALIDATION_INVALID_PAYLOAD,
                "timeout_seconds must be an integer",
            )
        })?;
    if !(POLL_TIMEOUT_MIN_SECS..=POLL_TIMEOUT_MAX_SECS).contains(&timeout_seconds) {
        return Err(ApiError::validation(
            error_codes::VALIDATION_INVALID_PAYLOAD,
            format!(
                "timeout_seconds must be within {POLL_TIMEOUT_MIN_SECS}..={POLL_TIMEOUT_MAX_SECS}"
            ),
        ));
    }

    let polled = state
        .queue
        .poll(&agent_id, Duration::from_secs(timeout_seconds))
        .await
        .map_err(|e| ApiError::internal(format!("poll failed: {e}")))?;
    match polled {
        Some(command) => Ok(Json(PollResponse { command }).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub(crate) async fn result(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let agent_id = authenticate(&state, &headers)?;
    let result: CommandResult = decode(&body)?;
    if result.command_id.trim().is_empty() {
        return Err(required("command_id"));
    }
    state
        .queue
        .store_result(&agent_id, result.clone())
        .await
        .map_err(|e| ApiError::internal(format!("store result failed: {e}")))?;
    apply_result_projection(&state, &agent_id, &result);
    Ok(Json(OkResponse::new()).into_response())
}

pub(crate) async fn projects(
    State(state): State<Arc<BackendState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let telegram_user_id = params
        .get("telegram_user_id")
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| required("telegram_user_id"))?;
    Ok(Json(ProjectsResponse {
        projects: state.projects_for_user(telegram_user_id),
    })
    .into_response())
}

pub(crate) async fn result_status(
    State(state): State<Arc<BackendState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let telegram_user_id = params
        .get("telegram_user_id")
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| required("telegram_user_id"))?;
    let command_id = params
        .get("command_id")
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| required("command_id"))?;

    let Some(agent_id) = state.pairing.agent_id_for_user(telegram_user_id) else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let stored = state
        .queue
        .get_result(&agent_id, command_id)
        .await
        .map_err(|e| ApiError::internal(format!("result lookup failed: {e}")))?;
    match stored {
        Some(result) => {
            apply_result_projection(&state, &agent_id, &result);
            Ok(Json(result).into_response())
        },
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
