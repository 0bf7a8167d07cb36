//! HTTP server.
//!
//! Exposes the Brief Forge API: JWT auth, shop and project CRUD, creative
//! brief generation, the two-layer knowledge base, the RAG copilot (JSON and
//! SSE), market trend queries, and the external analytics proxy.
//!
//! All routes live under `/api/v1`.
//!
//! # Error Contract
//!
//! Error responses use a machine-readable code plus a human-readable message:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Invalid email address" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `upstream_error` (502), `internal` (500).

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::fastmoss::MarketClient;
use crate::vector::VectorIndex;
use crate::{auth, copilot, db, fastmoss, knowledge, market, projects, shops};

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    /// External analytics client with its token and response caches.
    pub market: Arc<MarketClient>,
    /// Hosted vector index client with a cached index host.
    pub vector: Arc<VectorIndex>,
}

/// Starts the API server. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());
    let pool = db::connect(&config).await?;

    let vector = Arc::new(VectorIndex::new(config.clone()));
    if config.vector.is_enabled() {
        // Best effort: resolve (and create if missing) the index up front so
        // the first knowledge write doesn't pay the control-plane round trip.
        if let Err(e) = vector.ensure_index().await {
            tracing::warn!(error = %e, "vector index init skipped");
        }
    }

    let state = AppState {
        market: Arc::new(MarketClient::new(config.clone())),
        vector,
        config,
        pool,
    };

    let app = router(state.clone()).layer(cors_layer(&state.config));

    tracing::info!(bind = %bind_addr, "API server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.server.cors_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handle_health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::me))
        .route("/shops", get(shops::list_shops).post(shops::create_shop))
        .route(
            "/shops/{shop_id}",
            get(shops::get_shop)
                .patch(shops::update_shop)
                .delete(shops::delete_shop),
        )
        .route("/cr/projects", get(projects::list_projects))
        .route(
            "/cr/projects/{project_id}",
            get(projects::get_project).delete(projects::delete_project),
        )
        .route("/cr/generate", post(projects::generate_creative))
        .route(
            "/knowledge",
            get(knowledge::list_entries).post(knowledge::create_entry),
        )
        .route(
            "/knowledge/{entry_id}",
            get(knowledge::get_entry)
                .patch(knowledge::update_entry)
                .delete(knowledge::delete_entry),
        )
        .route(
            "/admin/knowledge",
            get(knowledge::list_global).post(knowledge::create_global),
        )
        .route(
            "/admin/knowledge/{entry_id}",
            get(knowledge::get_global)
                .patch(knowledge::update_global)
                .delete(knowledge::delete_global),
        )
        .route("/copilot/chat", post(copilot::chat))
        .route("/copilot/chat/stream", post(copilot::chat_stream))
        .route("/copilot/conversations", get(copilot::list_conversations))
        .route(
            "/copilot/conversations/{conversation_id}",
            get(copilot::get_conversation).delete(copilot::delete_conversation),
        )
        .route("/market/trends", get(market::list_trends))
        .route("/market/hidden-gems", get(market::list_hidden_gems))
        .route("/fastmoss/products", get(fastmoss::search_products))
        .route(
            "/fastmoss/products/{product_id}/videos",
            get(fastmoss::product_videos),
        )
        .route("/fastmoss/creators/ranking", get(fastmoss::creator_ranking))
        .route("/fastmoss/image-proxy", get(fastmoss::image_proxy));

    Router::new()
        .route("/", get(handle_root))
        .nest("/api/v1", api)
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// API error type that converts into an HTTP response.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    /// 502 for failures of the hosted AI / vector / analytics services.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "upstream_error",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert("WWW-Authenticate", HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::internal(e.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::internal(e.to_string())
    }
}

// ============ GET / ============

#[derive(Serialize)]
struct RootResponse {
    message: String,
}

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Welcome to the Brief Forge API".to_string(),
    })
}

// ============ GET /api/v1/health ============

/// JSON response body for `GET /api/v1/health`.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    /// `connected` or `disconnected`, from a `SELECT 1` probe.
    database: String,
}

/// Health check used by load balancers and monitoring.
async fn handle_health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<HealthResponse> {
    let database = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: database.to_string(),
    })
}
