//! HTTP Status Server
//!
//! Read-only view of the directory registry for operators and `quizctl`.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::directory::{RegistrySnapshot, SharedRegistry};
use crate::error::{Error, Result};

/// Shared handler state
pub struct AppState {
    pub registry: SharedRegistry,
    pub started: Instant,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub has_primary: bool,
    pub uptime_seconds: u64,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub cluster_size: usize,
    #[serde(flatten)]
    pub registry: RegistrySnapshot,
}

/// HTTP status server of the directory
pub struct StatusServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl StatusServer {
    pub fn new(config: ApiConfig, registry: SharedRegistry) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                registry,
                started: Instant::now(),
            }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http());

        let router = if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        };

        router.with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.registry.lock().await;
    let snapshot = registry.snapshot(Instant::now());

    Json(StatusResponse {
        cluster_size: snapshot.nodes.len(),
        registry: snapshot,
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let has_primary = state.registry.lock().await.primary().is_some();

    Json(HealthResponse {
        healthy: true,
        has_primary,
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{NodeKey, Registry};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_status_reports_registry() {
        let registry = Arc::new(Mutex::new(Registry::new(Duration::from_secs(17))));
        {
            let mut r = registry.lock().await;
            let now = Instant::now();
            for port in [6100, 6200] {
                let key = NodeKey {
                    address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    client_port: port,
                };
                r.register(key, port + 1, now);
            }
        }

        let server = StatusServer::new(ApiConfig::default(), Arc::clone(&registry));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, token).await });

        let status: StatusResponse = reqwest::get(format!("http://{}/status", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.cluster_size, 2);
        assert_eq!(status.registry.primary.unwrap().client_port, 6100);
        assert_eq!(status.registry.nodes[1].role, "BACKUP");

        let health: HealthResponse = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(health.has_primary);

        shutdown.cancel();
    }
}
