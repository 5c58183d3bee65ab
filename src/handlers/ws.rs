//! WebSocket device endpoint
//!
//! One task pair per socket: the reader loop feeds the message router in
//! arrival order, the writer task drains the connection's outbound
//! channel and maintains the buffered-byte gauge the TTS backpressure
//! sender reads. Teardown always funnels through the registry so the
//! offline transition fires exactly once, and a superseded socket's late
//! close can never tear down its successor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::core::registry::Connection;
use crate::router::{self, ConnectionContext};
use crate::state::AppState;

/// Upgrade handler for `/ws`.
pub async fn ws_device_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (conn, mut outbound_rx, gauge) = Connection::channel(Some(addr.to_string()));
    info!(remote = %addr, conn_id = %conn.conn_id(), "socket accepted");

    // Writer: single owner of the sink; the gauge drops only after the
    // frame actually reached the transport.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let cost = msg.cost;
            let result = sink.send(Message::Text(msg.payload.into())).await;
            gauge.fetch_sub(cost, Ordering::AcqRel);
            if result.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut ctx = ConnectionContext::new(conn.clone());
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id = %conn.conn_id(), error = %e, "socket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => router::handle_frame(&state, &mut ctx, &text).await,
            Message::Binary(data) => router::handle_binary(&state, &ctx, data.to_vec()).await,
            Message::Ping(_) | Message::Pong(_) => {
                // Transport-level liveness counts toward the pong check.
                conn.mark_pong();
                if let Some(device_id) = &ctx.device_id {
                    state.registry.touch(device_id);
                }
            }
            Message::Close(_) => break,
        }
    }

    if let Some(device_id) = &ctx.device_id {
        info!(device_id = %device_id, conn_id = %conn.conn_id(), "socket closed");
        state
            .registry
            .handle_disconnect(device_id, Some(conn.conn_id()));
    } else {
        debug!(conn_id = %conn.conn_id(), "unregistered socket closed");
    }
    // Idempotent; covers the unregistered path and lets the writer end.
    conn.shutdown();
    let _ = writer.await;
}
