use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use mcp_gateway_config_store::{has_server_spec, ConfigRecord, ConfigStore};
use mcp_gateway_error::{ErrorBody, GatewayError};

use crate::prompt;
use crate::registry::ConnectionRegistry;
use crate::session;

#[derive(Debug)]
pub struct AppState {
    store: ConfigStore,
    registry: Arc<ConnectionRegistry>,
    heartbeat_interval: Duration,
}

impl AppState {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            heartbeat_interval: session::DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Overrides the heartbeat cadence. Tests use short intervals.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/api/configs", get(list_configs).post(create_config))
        .route(
            "/api/configs/:id",
            get(get_config).put(update_config).delete(delete_config),
        )
        .route("/sse/:id", get(open_stream))
        .route("/api/prompt/:id", post(send_prompt))
        .fallback(not_found)
        .with_state(shared.clone());

    let http_logging = match std::env::var("MCP_GATEWAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Closes every live session; used during graceful shutdown so no process
/// outlives the server.
pub async fn shutdown_sessions(state: &Arc<AppState>) {
    for session in state.registry.drain() {
        session.close();
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_configs,
        get_config,
        create_config,
        update_config,
        delete_config,
        open_stream,
        send_prompt
    ),
    components(
        schemas(
            HealthResponse,
            ConfigRecord,
            ConfigPayload,
            PromptRequest,
            PromptResponse,
            DeleteResponse,
            ErrorBody
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "configs", description = "Configuration management"),
        (name = "stream", description = "Streaming sessions and prompt delivery")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Gateway(err) => (err.status_code(), ErrorBody::from(err)),
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Body for creating or updating a configuration. Fields are optional so
/// missing ones surface as a 400 with a message, not a decode error.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ConfigPayload {
    pub name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PromptRequest {
    #[schema(value_type = Option<Object>)]
    pub prompt: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub success: bool,
    pub message: String,
    pub connection_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub message: String,
}

async fn not_found() -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new("Not Found")))
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/api/configs",
    responses((status = 200, body = Vec<ConfigRecord>)),
    tag = "configs"
)]
async fn list_configs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConfigRecord>>, ApiError> {
    let configs = state.store.list().await.map_err(|err| {
        tracing::error!(error = %err, "failed to list configurations");
        GatewayError::storage("Failed to fetch configurations")
    })?;
    Ok(Json(configs))
}

#[utoipa::path(
    get,
    path = "/api/configs/{id}",
    responses(
        (status = 200, body = ConfigRecord),
        (status = 404, body = ErrorBody)
    ),
    params(("id" = i64, Path, description = "Configuration id")),
    tag = "configs"
)]
async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ConfigRecord>, ApiError> {
    let record = state
        .store
        .get(id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, id, "failed to fetch configuration");
            GatewayError::storage("Failed to fetch configuration")
        })?
        .ok_or(GatewayError::ConfigNotFound)?;
    Ok(Json(record))
}

#[utoipa::path(
    post,
    path = "/api/configs",
    request_body = ConfigPayload,
    responses(
        (status = 201, body = ConfigRecord),
        (status = 400, body = ErrorBody)
    ),
    tag = "configs"
)]
async fn create_config(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ConfigPayload>,
) -> Result<(StatusCode, Json<ConfigRecord>), ApiError> {
    let (name, config) = validate_payload(payload)?;
    let record = state.store.create(&name, &config).await.map_err(|err| {
        tracing::error!(error = %err, "failed to create configuration");
        GatewayError::storage("Failed to create configuration")
    })?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[utoipa::path(
    put,
    path = "/api/configs/{id}",
    request_body = ConfigPayload,
    responses(
        (status = 200, body = ConfigRecord),
        (status = 400, body = ErrorBody),
        (status = 404, body = ErrorBody)
    ),
    params(("id" = i64, Path, description = "Configuration id")),
    tag = "configs"
)]
async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<ConfigPayload>,
) -> Result<Json<ConfigRecord>, ApiError> {
    let (name, config) = validate_payload(payload)?;
    let record = state
        .store
        .update(id, &name, &config)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, id, "failed to update configuration");
            GatewayError::storage("Failed to update configuration")
        })?
        .ok_or(GatewayError::ConfigNotFound)?;
    Ok(Json(record))
}

#[utoipa::path(
    delete,
    path = "/api/configs/{id}",
    responses(
        (status = 200, body = DeleteResponse),
        (status = 404, body = ErrorBody)
    ),
    params(("id" = i64, Path, description = "Configuration id")),
    tag = "configs"
)]
async fn delete_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.store.delete(id).await.map_err(|err| {
        tracing::error!(error = %err, id, "failed to delete configuration");
        GatewayError::storage("Failed to delete configuration")
    })?;
    if !deleted {
        return Err(GatewayError::ConfigNotFound.into());
    }
    Ok(Json(DeleteResponse {
        message: "Configuration deleted successfully".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/sse/{id}",
    responses(
        (status = 200, description = "SSE stream of process output"),
        (status = 404, body = ErrorBody)
    ),
    params(("id" = i64, Path, description = "Configuration id")),
    tag = "stream"
)]
async fn open_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let record = state
        .store
        .get(id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, id, "failed to fetch configuration");
            GatewayError::storage("Failed to fetch configuration")
        })?
        .ok_or(GatewayError::ConfigNotFound)?;

    let stream = session::open(state.registry.clone(), record, state.heartbeat_interval);
    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
    ];
    Ok((headers, Sse::new(stream)).into_response())
}

#[utoipa::path(
    post,
    path = "/api/prompt/{id}",
    request_body = PromptRequest,
    responses(
        (status = 200, body = PromptResponse),
        (status = 400, body = ErrorBody),
        (status = 404, body = ErrorBody),
        (status = 500, body = ErrorBody)
    ),
    params(("id" = i64, Path, description = "Configuration id")),
    tag = "stream"
)]
async fn send_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<PromptRequest>,
) -> Result<Json<PromptResponse>, ApiError> {
    let prompt = match request.prompt {
        None | Some(Value::Null) => {
            return Err(GatewayError::invalid_request("Prompt is required").into())
        }
        Some(prompt) => prompt,
    };

    let outcome = prompt::route(&state.registry, id, &prompt).await?;
    Ok(Json(PromptResponse {
        success: true,
        message: format!("Prompt sent to {} active connections", outcome.delivered),
        connection_count: outcome.candidates,
    }))
}

fn validate_payload(payload: ConfigPayload) -> Result<(String, Value), GatewayError> {
    let (name, config) = match (payload.name, payload.config) {
        (Some(name), Some(config)) if !name.is_empty() => (name, config),
        _ => return Err(GatewayError::invalid_request("Name and config are required")),
    };
    if !has_server_spec(&config) {
        return Err(GatewayError::invalid_request(
            "Configuration must have a mcpServers property",
        ));
    }
    Ok((name, config))
}
