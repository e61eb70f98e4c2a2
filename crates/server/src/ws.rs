//! WebSocket endpoint.
//!
//! One route, `GET {ws_path}`. Server messages go out as binary frames,
//! text frames in are commands, and a close frame or read error ends the
//! connection.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::connection::{Connection, Inbound, Transport, TransportError};
use crate::{Coordinator, ServerError};

/// [`Transport`] over an upgraded axum WebSocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&mut self) -> Option<Inbound> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(Inbound::Text(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => return Some(Inbound::Binary(bytes)),
                Ok(Message::Close(_)) => return Some(Inbound::Close),
                // axum answers pings itself.
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    return None;
                }
            }
        }
    }

    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.socket
            .send(Message::Binary(message))
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))
    }
}

/// Router serving the WebSocket route from the coordinator's config.
pub fn build_router(coordinator: Arc<Coordinator>) -> Result<Router, ServerError> {
    let config = coordinator.config();
    config.validate()?;
    let path = config.ws_path.clone();
    Ok(Router::new()
        .route(&path, get(ws_handler))
        .with_state(coordinator))
}

async fn ws_handler(ws: WebSocketUpgrade, State(coordinator): State<Arc<Coordinator>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let connection = Connection::accept(coordinator);
        connection.run(WsTransport::new(socket)).await;
    })
}

/// Bind the configured address and serve until the listener fails.
pub async fn serve(coordinator: Arc<Coordinator>) -> Result<(), ServerError> {
    let router = build_router(coordinator.clone())?;
    let config = coordinator.config();
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        path = %config.ws_path,
        "listening for viewer connections"
    );
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;

    #[test]
    fn test_router_builds_for_default_config() {
        let coordinator = Arc::new(Coordinator::new(ServerConfig::default()));
        assert!(build_router(coordinator).is_ok());
    }

    #[test]
    fn test_router_rejects_relative_path() {
        let config = ServerConfig {
            ws_path: "ws".to_string(),
            ..Default::default()
        };
        let coordinator = Arc::new(Coordinator::new(config));
        assert!(matches!(
            build_router(coordinator),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            bind_addr: occupied.local_addr().unwrap(),
            ..Default::default()
        };
        let coordinator = Arc::new(Coordinator::new(config));
        assert!(matches!(serve(coordinator).await, Err(ServerError::Io(_))));
    }
}
