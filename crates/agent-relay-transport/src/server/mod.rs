//! Relay server: routes agent runs between browsers and handlers.
//!
//! Browser and handler connections share the `/ws` endpoint; a handler
//! connection is marked by the `x-relay-handler` header or `?handler=true`.

mod connection;
mod handler;
mod state;

use std::{net::SocketAddr, sync::Arc};

use agent_relay_core::CancellationToken;
use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use handler::{AgentHandler, HandlerEvent, HandlerEventStream};

use self::state::RelayState;
use crate::{RelayError, config::RelayServerConfig, protocol::HANDLER_HEADER};

/// `GET /health` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server runs.
    pub status: String,
    /// Registered agent ids.
    pub handlers: Vec<String>,
    pub active_sessions: usize,
    pub browsers: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    handler: bool,
}

/// The relay server.
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Create a server. Nothing is bound until [`serve`](Self::serve) or
    /// [`listen`](Self::listen).
    #[must_use]
    pub fn new(config: RelayServerConfig) -> Self {
        Self {
            state: Arc::new(RelayState::new(config, CancellationToken::new())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RelayServerConfig {
        &self.state.config
    }

    /// Register an in-process handler for `agent_id`, replacing any prior one.
    pub async fn register_handler(&self, agent_id: &str, handler: Arc<dyn AgentHandler>) {
        self.state.register(agent_id, handler, None).await;
    }

    pub async fn unregister_handler(&self, agent_id: &str) -> bool {
        self.state.unregister(agent_id, None).await
    }

    /// Registered agent ids, sorted.
    pub async fn handler_ids(&self) -> Vec<String> {
        self.state.handler_ids().await
    }

    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.state.active_session_count()
    }

    /// Build the router with `/ws` and `/health`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until `shutdown` fires.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound or serving fails.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "Relay listening");
        }
        self.serve_on(listener, shutdown).await
    }

    /// Bind and serve in the background, returning the bound address.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn listen(
        &self,
        shutdown: CancellationToken,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<Result<(), RelayError>>), RelayError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move { run(listener, router, &state, shutdown).await });
        tracing::info!(%addr, "Relay listening");
        Ok((addr, handle))
    }

    async fn bind(&self) -> Result<tokio::net::TcpListener, RelayError> {
        let addr = self.state.config.bind_addr();
        tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })
    }

    async fn serve_on(
        &self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        run(listener, self.router(), &self.state, shutdown).await
    }
}

async fn run(
    listener: tokio::net::TcpListener,
    router: Router,
    state: &RelayState,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let relay_shutdown = state.shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Relay shutting down");
            relay_shutdown.cancel();
        })
        .await?;
    Ok(())
}

/// GET /health
async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        handlers: state.handler_ids().await,
        active_sessions: state.active_session_count(),
        browsers: state.browser_count().await,
    })
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    let is_handler = params.handler || headers.contains_key(HANDLER_HEADER);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            if is_handler {
                connection::handle_handler(socket, state).await;
            } else {
                connection::handle_browser(socket, state).await;
            }
        })
}
