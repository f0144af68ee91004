//! HTTP agent exposing fleet operations under `/agent/*`.
//!
//! # Authentication
//!
//! Every endpoint except `/agent/health` requires the configured api key,
//! either in the `X-API-Key` header or as a `?key=` query parameter.
//!
//! # Configuration
//!
//! - `FLEET_AGENT_API_KEY`: overrides `api_key` from the config file
//! - `FLEET_AGENT_PORT`: overrides the listen port
//! - `RUST_LOG`: log filter (default: fleet_agent=info,tower_http=info)

mod reboot;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header::HeaderName, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::executor::{Execute, HostExecutor};
use crate::registry::HostRegistry;

/// State shared by all request handlers. Nothing in it is mutated after
/// startup.
pub struct AppState {
    pub registry: Arc<HostRegistry>,
    pub executor: Arc<dyn Execute>,
    /// Shared secret every protected request must present.
    pub api_key: String,
    /// Script run by `/agent/diagnose`.
    pub diagnose_script: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: &AgentConfig,
        registry: Arc<HostRegistry>,
        executor: Arc<dyn Execute>,
    ) -> Self {
        Self {
            registry,
            executor,
            api_key: config.api_key.clone(),
            diagnose_script: config.diagnose_script.clone(),
            start_time: chrono::Utc::now(),
        }
    }

    /// State backed by the real local/SSH executor.
    pub fn from_config(config: &AgentConfig) -> Self {
        let registry = Arc::new(HostRegistry::from_config(config));
        let executor = Arc::new(HostExecutor::new(
            Arc::clone(&registry),
            config.command_timeout(),
        ));
        Self::new(config, registry, executor)
    }

    pub fn uptime_seconds(&self) -> i64 {
        (chrono::Utc::now() - self.start_time).num_seconds()
    }
}

/// Build the full router with tracing and CORS layers applied.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
        ]);

    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(config: &AgentConfig, addr: SocketAddr) -> Result<()> {
    let state = Arc::new(AppState::from_config(config));

    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    tracing::info!(
        "fleet-agent v{} on {} managing {}",
        env!("CARGO_PKG_VERSION"),
        hostname,
        state.registry.keys().join(", ")
    );

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("fleet-agent listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
