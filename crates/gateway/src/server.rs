//! HTTP server assembly: WebSocket upgrade route, health endpoint, TLS.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, Query, State, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
    },
    serde::Deserialize,
    tracing::info,
};

use crate::{error::Result, session, state::GatewayState};

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Bearer token. Headers are not portable across WebSocket clients; the
    /// query string is the only supported carrier.
    token: Option<String>,
    /// Conversation to join and replay history for.
    conversation: Option<String>,
}

pub fn build_app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        session::handle_socket(
            socket,
            state,
            addr.ip().to_string(),
            query.token,
            query.conversation,
        )
    })
}

/// Serve until the state's shutdown token fires. With TLS material
/// configured, binds through rustls; plain TCP otherwise.
pub async fn serve(
    state: Arc<GatewayState>,
    addr: SocketAddr,
    tls: Option<(String, String)>,
) -> Result<()> {
    let app = build_app(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        #[cfg(feature = "tls")]
        Some((cert, key)) => {
            use crate::error::Context;
            let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
                .await
                .context("loading tls material")?;
            info!(%addr, "gateway listening (tls)");

            let handle = axum_server::Handle::new();
            let shutdown = state.shutdown.clone();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
            });

            axum_server::bind_rustls(addr, config).handle(handle).serve(app).await?;
        },
        #[cfg(not(feature = "tls"))]
        Some(_) => {
            return Err(crate::error::Error::Message(
                "tls requested but the tls feature is not compiled in".into(),
            ));
        },
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "gateway listening");
            let shutdown = state.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
        },
    }
    Ok(())
}
