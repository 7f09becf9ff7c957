//! Axum surface for the enquiry dashboard: data, diagnostics and the SPA shell.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use enquiry_aggregate::{
    AggregationError, AggregationReport, Aggregator, AggregatorConfig, ConfigError, DiagnosticReport,
};
use enquiry_core::DashboardPayload;
use enquiry_upstream::{HttpClientConfig, HttpUpstream, Upstream};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "enquiry-web";

const USER_AGENT: &str = "enquiry-dashboard/0.1";

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub static_root: PathBuf,
    upstream: Option<Arc<dyn Upstream>>,
    lookup: EnvLookup,
}

impl AppState {
    /// Reads configuration from the process environment on every request.
    pub fn new(static_root: impl Into<PathBuf>) -> Self {
        Self {
            static_root: static_root.into(),
            upstream: None,
            lookup: Arc::new(|name: &str| std::env::var(name).ok()),
        }
    }

    /// Fixed settings and transport, for embedding and tests.
    pub fn with_upstream(
        static_root: impl Into<PathBuf>,
        upstream: Arc<dyn Upstream>,
        settings: HashMap<String, String>,
    ) -> Self {
        Self {
            static_root: static_root.into(),
            upstream: Some(upstream),
            lookup: Arc::new(move |name: &str| settings.get(name).cloned()),
        }
    }

    fn config(&self) -> Result<AggregatorConfig, ConfigError> {
        AggregatorConfig::from_lookup(|name| (self.lookup)(name))
    }

    fn upstream_for(&self, config: &AggregatorConfig) -> Result<Arc<dyn Upstream>, ApiError> {
        if let Some(upstream) = &self.upstream {
            return Ok(Arc::clone(upstream));
        }
        let http = HttpUpstream::new(HttpClientConfig {
            timeout: config.request_timeout(),
            user_agent: Some(USER_AGENT.to_string()),
        })
        .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(Arc::new(http))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
enum ApiError {
    Config(ConfigError),
    Upstream(String),
    Internal(String),
}

impl From<AggregationError> for ApiError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::Config(e) => ApiError::Config(e),
            AggregationError::UpstreamTotalFailure(message) => ApiError::Upstream(message),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::Config(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Config(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/data", get(data_handler))
        .route("/api/monday", get(data_handler))
        .route("/api/diagnose", get(diagnose_handler))
        .route("/api/monday/diagnose", get(diagnose_handler))
        .route("/health", get(health_handler))
        .fallback(index_handler)
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ENQUIRY_WEB_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let static_root = std::env::var("ENQUIRY_STATIC_DIR").unwrap_or_else(|_| "public".to_string());
    let state = AppState::new(static_root);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn data_handler(State(state): State<Arc<AppState>>) -> Result<Json<DashboardPayload>, ApiError> {
    let request_id = Uuid::new_v4();
    aggregate_request(&state)
        .instrument(info_span!("api_data", %request_id))
        .await
        .map(Json)
}

async fn aggregate_request(state: &AppState) -> Result<DashboardPayload, ApiError> {
    let config = state.config()?;
    let (sources, warnings) = config.build_sources()?;
    for warning in &warnings {
        warn!(%warning, "source configuration");
    }
    let upstream = state.upstream_for(&config)?;
    let aggregator = Aggregator::new(upstream, config.request_timeout());
    match aggregator.aggregate(&sources).await {
        Ok(aggregation) => {
            log_report(&aggregation.report);
            Ok(aggregation.payload)
        }
        Err(err) => {
            warn!(error = %err, "aggregation failed");
            Err(err.into())
        }
    }
}

fn log_report(report: &AggregationReport) {
    for source in &report.sources {
        info!(
            source = %source.source,
            method = %source.method,
            fetched = source.fetched,
            merged = source.merged,
            failures = source.failures.len(),
            "source reconciled"
        );
    }
    for warning in &report.warnings {
        warn!(%warning, "aggregation warning");
    }
    info!(
        method = %report.method,
        count = report.count,
        reconstructed = report.reconstructed,
        "aggregation complete"
    );
}

async fn diagnose_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DiagnosticReport>, ApiError> {
    let request_id = Uuid::new_v4();
    diagnose_request(&state)
        .instrument(info_span!("api_diagnose", %request_id))
        .await
        .map(Json)
}

async fn diagnose_request(state: &AppState) -> Result<DiagnosticReport, ApiError> {
    let config = state.config()?;
    let (sources, warnings) = config.build_sources()?;
    for warning in &warnings {
        warn!(%warning, "source configuration");
    }
    let upstream = state.upstream_for(&config)?;
    let report = Aggregator::new(upstream, config.request_timeout())
        .diagnose(&sources)
        .await;
    let failed = report.values().filter(|o| o.is_error()).count();
    info!(probes = report.len(), failed, "diagnostics complete");
    Ok(report)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let index_path = state.static_root.join("index.html");
    match tokio::fs::read_to_string(&index_path).await {
        Ok(html) => Html(html).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("index.html not found".to_string())).into_response(),
    }
}
