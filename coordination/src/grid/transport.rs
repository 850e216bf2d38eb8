//! WebSocket transport for the grid, the bus bridge and the engine gateway
//!
//! `GET /gateway` hosts an engine session; `GET /bus/{unit_id}` attaches a
//! unit to the event bus; `GET /{endpoint}` attaches a grid connection under
//! that endpoint id (`/nexus` included). Malformed grid frames are logged
//! and dropped without closing the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envelope::Psi;
use super::router::SharedGrid;
use crate::bridge::SharedBusBridge;
use crate::gateway::SharedGateway;

#[derive(Clone)]
struct TransportState {
    grid: SharedGrid,
    gateway: SharedGateway,
    bridge: SharedBusBridge,
    shutdown: CancellationToken,
}

/// Build the grid/bus/gateway router
pub fn router(
    grid: SharedGrid,
    gateway: SharedGateway,
    bridge: SharedBusBridge,
    shutdown: CancellationToken,
) -> Router {
    Router::new()
        .route("/gateway", get(gateway_handler))
        .route("/bus/{unit_id}", get(bus_handler))
        .route("/{endpoint}", get(endpoint_handler))
        .with_state(TransportState {
            grid,
            gateway,
            bridge,
            shutdown,
        })
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Grid listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn endpoint_handler(
    ws: WebSocketUpgrade,
    Path(endpoint): Path<String>,
    State(state): State<TransportState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_endpoint(socket, endpoint, state))
}

async fn bus_handler(
    ws: WebSocketUpgrade,
    Path(unit_id): Path<String>,
    State(state): State<TransportState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_bus(socket, unit_id, state))
}

async fn gateway_handler(ws: WebSocketUpgrade, State(state): State<TransportState>) -> Response {
    ws.on_upgrade(move |socket| handle_gateway(socket, state))
}

/// Parse an inbound frame and hand it to the grid. Returns `false` when the
/// frame was dropped.
fn route_frame(grid: &SharedGrid, endpoint: &str, raw: &str) -> bool {
    match Psi::parse(raw) {
        Ok(psi) => match grid.route(psi) {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint, "Route failed: {}", e);
                false
            }
        },
        Err(e) => {
            warn!(endpoint, "Dropping frame: {}", e);
            false
        }
    }
}

async fn handle_endpoint(socket: WebSocket, endpoint: String, state: TransportState) {
    let mut connection = match state.grid.connect(&endpoint).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(endpoint = %endpoint, "Connect refused: {}", e);
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();
    let mut unsent = None;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            outbound = connection.recv() => {
                let Some(psi) = outbound else {
                    debug!(endpoint = %endpoint, "Slot superseded");
                    break;
                };
                if let Err(e) = sender.send(Message::Text(psi.serialize().into())).await {
                    warn!(endpoint = %endpoint, "Send failed: {}", e);
                    unsent = Some(psi);
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    route_frame(&state.grid, &endpoint, text.as_str());
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(endpoint = %endpoint, "Binary frame dropped");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(endpoint = %endpoint, "Socket error: {}", e);
                    break;
                }
            },
        }
    }

    let requeued = connection.close_with(unsent);
    info!(endpoint = %endpoint, requeued, "Connection closed");
}

async fn handle_bus(socket: WebSocket, unit_id: String, state: TransportState) {
    let mut session = state.bridge.attach(&unit_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            event = session.next_event() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(unit_id = %unit_id, "Event not serializable: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(text.into())).await {
                    warn!(unit_id = %unit_id, "Send failed: {}", e);
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = session.handle_frame(text.as_str()).await else { continue };
                    if let Err(e) = sender.send(Message::Text(reply.to_json().into())).await {
                        warn!(unit_id = %unit_id, "Reply failed: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(unit_id = %unit_id, "Socket error: {}", e);
                    break;
                }
            },
        }
    }

    let recalled = session.close();
    info!(unit_id = %unit_id, recalled, "Bus connection closed");
}

async fn handle_gateway(socket: WebSocket, state: TransportState) {
    let mut session = state.gateway.session();
    let (mut sender, mut receiver) = socket.split();
    info!("Engine connected");

    loop {
        let inbound = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            inbound = receiver.next() => inbound,
        };
        let text = match inbound {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Engine socket error: {}", e);
                break;
            }
        };

        let reply = session.handle_frame(text.as_str());
        if let Err(e) = sender.send(Message::Text(reply.to_json().into())).await {
            warn!("Failed to reply to engine: {}", e);
            break;
        }
    }
    info!("Engine disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let grid = Grid::new().shared();
        grid.start();

        assert!(!route_frame(&grid, "zealot-1", "hello there"));
        assert!(route_frame(&grid, "zealot-1", "§PSI:archon-1:zealot-1:review:ready"));

        let inbox = grid.inbox("archon-1").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].content, "ready");
        grid.stop().await;
    }
}
