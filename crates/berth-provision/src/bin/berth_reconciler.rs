//! Berth fleet reconciler service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use berth_core::observability::{LogFormat, init_logging};
use berth_provision::allocation::PortBandPolicy;
use berth_provision::catalog::PlanCatalog;
use berth_provision::directory::AllocationDirectory;
use berth_provision::error::{Error, Result};
use berth_provision::panel::PanelClient;
use berth_provision::panel::http::HttpPanelClient;
use berth_provision::provisioner::Provisioner;
use berth_provision::reconciler::{ReconcileSummary, Reconciler, ReconcilerConfig};
use berth_provision::store::Store;
use berth_provision::store::memory::InMemoryStore;

#[derive(Clone)]
struct AppState {
    reconciler: Arc<Reconciler>,
    metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    message: String,
    summary: Option<ReconcileSummary>,
}

impl ApiError {
    fn from_summary(summary: ReconcileSummary) -> Self {
        Self {
            message: "reconcile tick completed with errors".to_string(),
            summary: Some(summary),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            message: error.to_string(),
            summary: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        if let Some(summary) = self.summary {
            return (status, Json(summary)).into_response();
        }

        (
            status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

async fn run_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<ReconcileSummary>, ApiError> {
    let summary = state.reconciler.run().await;

    if summary.is_clean() {
        Ok(Json(summary))
    } else {
        Err(ApiError::from_summary(summary))
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |value| value.eq_ignore_ascii_case("true"))
}

fn duration_env(key: &str) -> Result<Option<Duration>> {
    let Some(value) = optional_env(key) else {
        return Ok(None);
    };

    let secs = value
        .parse::<u64>()
        .map_err(|_| Error::configuration(format!("invalid {key}")))?;
    if secs == 0 {
        return Err(Error::configuration(format!("{key} must be positive")));
    }

    Ok(Some(Duration::from_secs(secs)))
}

fn resolve_port() -> Result<u16> {
    if let Ok(port) = std::env::var("PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid PORT"));
    }

    if let Ok(port) = std::env::var("BERTH_PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid BERTH_PORT"));
    }

    Ok(8080)
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("BERTH_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let panel_url = required_env("BERTH_PANEL_URL")?;
    let panel_api_key = required_env("BERTH_PANEL_API_KEY")?;
    let port = resolve_port()?;

    let mut panel_client = HttpPanelClient::new(&panel_url, panel_api_key)?;
    if let Some(timeout) = duration_env("BERTH_PANEL_TIMEOUT_SECS")? {
        panel_client = panel_client.with_request_timeout(timeout);
    }

    let mut config = ReconcilerConfig::default();
    if let Some(stuck_after) = duration_env("BERTH_STUCK_AFTER_SECS")? {
        config.stuck_after = stuck_after;
    }
    if let Some(interval) = duration_env("BERTH_RECONCILE_INTERVAL_SECS")? {
        config.interval = interval;
    }

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::configuration(format!("failed to install metrics recorder: {e}")))?;

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let panel: Arc<dyn PanelClient> = Arc::new(panel_client);
    let directory = Arc::new(AllocationDirectory::new(
        panel.clone(),
        PortBandPolicy::default(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        panel.clone(),
        directory,
        Arc::new(PlanCatalog::builtin()),
    ));
    let reconciler = Arc::new(Reconciler::new(store, panel, provisioner, config));

    // Scheduler-triggered by default; the built-in ticker is opt-in so a
    // deployment never runs both.
    if parse_bool_env("BERTH_RECONCILE_LOOP", false) {
        let ticker = reconciler.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ticker.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let summary = ticker.run().await;
                if !summary.is_clean() {
                    tracing::warn!(
                        errors = summary.errors.len(),
                        "reconcile tick finished with errors"
                    );
                }
            }
        });
    }

    let state = AppState {
        reconciler,
        metrics: metrics_handle,
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/run", post(run_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))
}
