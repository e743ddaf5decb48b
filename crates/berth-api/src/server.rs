//! API server implementation.
//!
//! Provides health, ready, metrics, and the storefront/admin endpoints for
//! Berth. The server wires the provisioning engine (store, panel client,
//! provisioner, intake, allocation directory) into shared state and
//! optionally runs the reconcile loop in-process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use berth_core::{Error, Result};
use berth_provision::allocation::PortBandPolicy;
use berth_provision::catalog::PlanCatalog;
use berth_provision::directory::AllocationDirectory;
use berth_provision::intake::OrderIntake;
use berth_provision::panel::PanelClient;
use berth_provision::panel::fake::FakePanel;
use berth_provision::panel::http::HttpPanelClient;
use berth_provision::provisioner::Provisioner;
use berth_provision::reconciler::Reconciler;
use berth_provision::store::Store;
use berth_provision::store::memory::InMemoryStore;

use crate::config::Config;

// ============================================================================
// Health and Ready Responses
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Order, node, and instance records.
    pub store: Arc<dyn Store>,
    /// Remote panel client; the power route forwards through this.
    pub panel: Arc<dyn PanelClient>,
    /// Billing event intake.
    pub intake: OrderIntake,
    /// Provisioning engine; the admin retry route drives this inline.
    pub provisioner: Arc<Provisioner>,
    /// Allocation endpoint directory; the admin reset route rebuilds pools.
    pub directory: Arc<AllocationDirectory>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("store", &"<Store>")
            .field("panel", &"<PanelClient>")
            .field("intake", &"<OrderIntake>")
            .field("provisioner", &"<Provisioner>")
            .field("directory", &"<AllocationDirectory>")
            .finish()
    }
}

impl AppState {
    /// Creates application state, wiring the provisioning engine around the
    /// given store and panel client.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        panel: Arc<dyn PanelClient>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        let directory = Arc::new(AllocationDirectory::new(
            Arc::clone(&panel),
            PortBandPolicy::default(),
        ));
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&store),
            Arc::clone(&panel),
            Arc::clone(&directory),
            catalog,
        ));
        let intake = OrderIntake::new(Arc::clone(&store), Arc::clone(&provisioner));
        Self {
            config,
            store,
            panel,
            intake,
            provisioner,
            directory,
        }
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Returns 200 OK if the service is alive. This is a shallow check
/// that doesn't verify dependencies.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Returns 200 OK if the service is ready to accept requests. A node
/// listing is the cheapest store round-trip, so it stands in for a
/// connectivity check without touching order state.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_nodes().await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("store check failed: {e}")),
            }),
        ),
    }
}

// ============================================================================
// Server
// ============================================================================

/// The Berth API server.
///
/// Serves the billing webhook, order status, and admin endpoints.
pub struct Server {
    config: Config,
    store: Arc<dyn Store>,
    panel: Option<Arc<dyn PanelClient>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("store", &"<Store>")
            .field("panel", &self.panel.is_some())
            .finish()
    }
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// Defaults to the in-memory store; inject a persistent [`Store`]
    /// through the builder for production.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: Arc::new(InMemoryStore::new()),
            panel: None,
        }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the panel client from configuration.
    ///
    /// Falls back to the in-memory fake panel in debug mode so local runs
    /// need no credentials.
    fn panel_from_config(&self) -> Result<Arc<dyn PanelClient>> {
        match (
            self.config.panel.base_url.as_deref(),
            self.config.panel.api_key.as_deref(),
        ) {
            (Some(url), Some(key)) => {
                let client = HttpPanelClient::new(url, key)
                    .map_err(|e| Error::InvalidInput(format!("panel client: {e}")))?
                    .with_request_timeout(Duration::from_secs(self.config.panel.timeout_secs));
                Ok(Arc::new(client))
            }
            _ if self.config.debug => {
                tracing::warn!("no panel configured; using the in-memory fake panel (debug mode)");
                Ok(Arc::new(FakePanel::new()))
            }
            _ => Err(Error::InvalidInput(
                "BERTH_PANEL_URL and BERTH_PANEL_API_KEY are required when debug=false".to_string(),
            )),
        }
    }

    fn build_state(&self, panel: Arc<dyn PanelClient>) -> Result<Arc<AppState>> {
        let catalog = load_catalog(&self.config)?;
        Ok(Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.store),
            panel,
            catalog,
        )))
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self, state: Arc<AppState>) -> Router {
        let context_layer = middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::context::request_context_middleware,
        );
        let admin_auth_layer = middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::context::admin_auth_middleware,
        );
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        Router::new()
            // Health, ready, and metrics endpoints (no auth required)
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            // Storefront routes (webhook signature is checked in the handler)
            .merge(crate::routes::public_routes())
            // Operator routes behind the admin bearer token
            .merge(crate::routes::admin_routes().layer(admin_auth_layer))
            // Middleware (order matters): Metrics outermost for timing, then
            // trace, then the request context every route sees.
            .layer(context_layer)
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state)
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is incomplete, the plan catalog
    /// cannot be loaded, or the server cannot bind to the port.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;

        // Initialize metrics before starting the server
        crate::metrics::init_metrics();

        let panel = match &self.panel {
            Some(panel) => Arc::clone(panel),
            None => self.panel_from_config()?,
        };
        let state = self.build_state(panel)?;

        if self.config.reconcile.enabled {
            spawn_reconcile_loop(&state);
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let router = self.create_router(state);

        tracing::info!(
            port = self.config.port,
            debug = self.config.debug,
            reconcile_loop = self.config.reconcile.enabled,
            "Starting Berth API server"
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind to {addr}: {e}")))?;

        axum::serve(listener, router)
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")))?;

        Ok(())
    }

    /// Creates a test router for the server.
    ///
    /// This is useful for integration tests where you want to test
    /// the routes without actually binding to a port. Falls back to the
    /// in-memory fake panel when none was injected.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured plan catalog cannot be loaded.
    #[doc(hidden)]
    pub fn test_router(&self) -> Result<Router> {
        let panel: Arc<dyn PanelClient> = match self.panel.clone() {
            Some(panel) => panel,
            None => Arc::new(FakePanel::new()),
        };
        let state = self.build_state(panel)?;
        Ok(self.create_router(state))
    }
}

/// Loads the plan catalog from `plans_path`, or the builtin seed when unset.
fn load_catalog(config: &Config) -> Result<Arc<PlanCatalog>> {
    let Some(path) = config.plans_path.as_deref() else {
        return Ok(Arc::new(PlanCatalog::builtin()));
    };

    let bytes = std::fs::read(path)
        .map_err(|e| Error::storage(format!("failed to read plan catalog {path}: {e}")))?;
    let catalog = PlanCatalog::from_json_slice(&bytes)
        .map_err(|e| Error::InvalidInput(format!("invalid plan catalog {path}: {e}")))?;

    tracing::info!(path = %path, "plan catalog loaded");
    Ok(Arc::new(catalog))
}

/// Spawns the in-process reconcile loop.
///
/// Disable via `reconcile.enabled` when a standalone reconciler deployment
/// owns the sweeps.
fn spawn_reconcile_loop(state: &Arc<AppState>) {
    let reconciler = Reconciler::new(
        Arc::clone(&state.store),
        Arc::clone(&state.panel),
        Arc::clone(&state.provisioner),
        state.config.reconcile.reconciler_config(),
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reconciler.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let summary = reconciler.run().await;
            if !summary.is_clean() {
                tracing::warn!(
                    errors = summary.errors.len(),
                    "reconcile tick finished with errors"
                );
            }
        }
    });
}

// ============================================================================
// Server Builder
// ============================================================================

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    store: Arc<dyn Store>,
    panel: Option<Arc<dyn PanelClient>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("store", &"<Store>")
            .field("panel", &self.panel.is_some())
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: Arc::new(InMemoryStore::new()),
            panel: None,
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Enables debug mode.
    ///
    /// See `Config::debug` for behavior changes (missing secrets tolerated,
    /// fake panel fallback).
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the admin bearer token.
    ///
    /// Required when `debug` is false.
    #[must_use]
    pub fn admin_token(mut self, token: impl Into<String>) -> Self {
        self.config.admin.token = Some(token.into());
        self
    }

    /// Sets the webhook signing secret.
    ///
    /// Required when `debug` is false.
    #[must_use]
    pub fn webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.webhook.signing_secret = Some(secret.into());
        self
    }

    /// Enables or disables the in-process reconcile loop.
    #[must_use]
    pub fn reconcile_loop(mut self, enabled: bool) -> Self {
        self.config.reconcile.enabled = enabled;
        self
    }

    /// Sets the store used by request handlers.
    ///
    /// By default, the server uses an in-memory store intended only for
    /// tests/dev.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    /// Sets the panel client, replacing the config-built one.
    #[must_use]
    pub fn panel(mut self, panel: Arc<dyn PanelClient>) -> Self {
        self.panel = Some(panel);
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        Server {
            config: self.config,
            store: self.store,
            panel: self.panel,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
