//! HTTP surface: the client page and the signaling websocket

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use relayhub_sfu::{Hub, RtcTransport, RtcTransportFactory, SessionExit};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ws;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    hub: Arc<Hub<RtcTransport>>,
    factory: Arc<RtcTransportFactory>,
    max_message_size: usize,
}

impl AppState {
    pub fn new(hub: Arc<Hub<RtcTransport>>, config: &Config) -> Self {
        Self {
            factory: Arc::new(RtcTransportFactory::new(&config.sfu)),
            hub,
            max_message_size: config.server.max_message_size,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/websocket", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Client page with the websocket URL filled in for the requesting host
fn render_index(host: &str) -> String {
    INDEX_HTML.replace("{{WS_URL}}", &format!("ws://{host}/websocket"))
}

async fn index_handler(headers: HeaderMap) -> Html<String> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:8080");
    Html(render_index(host))
}

async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let (mut source, sink) = ws::split(socket);
            match state
                .hub
                .connect(&*state.factory, &mut source, Box::new(sink))
                .await
            {
                Ok(SessionExit::Failed(e)) => warn!(error = %e, "Session ended with error"),
                Ok(exit) => debug!(?exit, "Session ended"),
                Err(e) => error!(error = %e, "Failed to open session"),
            }
        })
}

/// Serve until Ctrl+C or SIGTERM, then stop the hub's background work
pub async fn serve(config: &Config, hub: Arc<Hub<RtcTransport>>) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {addr}: {e}"))?;
    info!("HTTP server listening on {}", addr);

    let app = router(AppState::new(Arc::clone(&hub), config));
    let graceful = {
        let hub = Arc::clone(&hub);
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, starting graceful shutdown...");
            hub.shutdown();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await?;

    info!("HTTP server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
