//! Message router
//!
//! Demultiplexes inbound protocol frames by their `type` discriminator
//! and dispatches into the registry, the ASR session manager, the
//! command dispatcher, or the event bus. Every frame except `register`
//! is rejected with an in-band `error` reply until the sender has
//! registered. Heartbeat-class frames are exempt from verbose logging;
//! unknown types are logged and ignored.

pub mod frames;

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::core::registry::{Connection, DeviceLogEntry, device::now_ms};
use crate::events::DeviceMessage;
use crate::proxy::flatten_text;
use crate::state::AppState;

use frames::{InboundFrame, OutboundFrame};

/// Per-connection routing context. The device binding is established by
/// the `register` frame and sticks for the connection's lifetime.
pub struct ConnectionContext {
    pub conn: Arc<Connection>,
    pub device_id: Option<String>,
}

impl ConnectionContext {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            device_id: None,
        }
    }
}

/// Route one inbound text frame.
pub async fn handle_frame(state: &Arc<AppState>, ctx: &mut ConnectionContext, raw: &str) {
    let frame = match InboundFrame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "malformed frame");
            if let Some(device_id) = &ctx.device_id {
                state.registry.record_error(device_id);
            }
            send_error(ctx, &e.to_string(), None).await;
            return;
        }
    };

    if frame.is_heartbeat() {
        trace!(device_id = ?ctx.device_id, "heartbeat frame");
    } else {
        debug!(
            frame_type = frame.frame_type(),
            device_id = ?ctx.device_id,
            "inbound frame"
        );
    }

    // Everything except registration requires a bound device.
    let device_id = match (&ctx.device_id, &frame) {
        (_, InboundFrame::Register(params)) => {
            register(state, ctx, params).await;
            return;
        }
        (Some(device_id), _) => device_id.clone(),
        (None, _) => {
            warn!(frame_type = frame.frame_type(), "frame from unregistered sender");
            send_error(
                ctx,
                "device not registered, send register first",
                Some(frame.frame_type()),
            )
            .await;
            return;
        }
    };

    match frame {
        InboundFrame::Register(_) => unreachable!("handled above"),

        InboundFrame::Heartbeat => {
            state.registry.heartbeat_seen(&device_id);
            let commands = state
                .dispatcher
                .drain(&device_id, state.config.commands.flush_batch);
            if !commands.is_empty() {
                debug!(
                    device_id = %device_id,
                    count = commands.len(),
                    "flushing queued commands with heartbeat response"
                );
            }
            let _ = ctx
                .conn
                .send(&OutboundFrame::HeartbeatResponse {
                    timestamp: now_ms(),
                    commands,
                })
                .await;
        }

        InboundFrame::AsrSessionStart(params) => {
            state.registry.touch(&device_id);
            if let Err(e) = state.asr.start_session(&device_id, &params).await {
                state.registry.record_error(&device_id);
                send_error(ctx, &e.to_string(), Some("asr_session_start")).await;
            }
        }

        InboundFrame::AsrAudioChunk(params) => {
            state.registry.touch(&device_id);
            if let Err(e) = state.asr.ingest_chunk(&device_id, &params).await {
                state.registry.record_error(&device_id);
                send_error(ctx, &e.to_string(), Some("asr_audio_chunk")).await;
            }
        }

        InboundFrame::AsrSessionStop(params) => {
            state.registry.touch(&device_id);
            if let Err(e) = state.asr.stop_session(&device_id, &params).await {
                state.registry.record_error(&device_id);
                send_error(ctx, &e.to_string(), Some("asr_session_stop")).await;
            }
        }

        InboundFrame::TtsQueueStatus(params) => {
            state.registry.touch(&device_id);
            state.tts.record_status(&device_id, &params);
        }

        InboundFrame::Log(params) => {
            state.registry.touch(&device_id);
            state.registry.append_log(
                &device_id,
                DeviceLogEntry {
                    level: params.level,
                    message: params.message,
                    data: params.data,
                    timestamp: now_ms(),
                },
            );
        }

        InboundFrame::CommandResult(params) => {
            state.registry.touch(&device_id);
            state.dispatcher.complete(&params.command_id, params.result);
        }

        InboundFrame::Message(params) => {
            state.registry.record_message_received(&device_id);
            let device_type = state
                .registry
                .device(&device_id)
                .map(|d| d.device_type)
                .unwrap_or_else(|| "unknown".to_string());
            let segments = params.segments.unwrap_or_default();
            let text = params
                .text
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| flatten_text(&segments));
            state.events.publish_message(DeviceMessage {
                device_id,
                device_type,
                text,
                segments,
                sender: params.sender,
                channel: params.channel,
                master: params.master,
            });
        }

        InboundFrame::Unknown(frame_type) => {
            warn!(
                device_id = %device_id,
                frame_type = %frame_type,
                "unknown frame type, ignoring"
            );
        }
    }
}

/// Route one inbound binary frame: audio for the active ASR session.
pub async fn handle_binary(state: &Arc<AppState>, ctx: &ConnectionContext, data: Vec<u8>) {
    let Some(device_id) = &ctx.device_id else {
        debug!("binary frame from unregistered sender, dropping");
        return;
    };
    state.registry.touch(device_id);
    if let Err(e) = state
        .asr
        .ingest_binary(device_id, bytes::Bytes::from(data))
        .await
    {
        debug!(device_id = %device_id, error = %e, "binary audio ingest failed");
    }
}

async fn register(
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
    params: &frames::RegisterParams,
) {
    match state.registry.register(params, ctx.conn.clone()) {
        Ok(device) => {
            let rebound = match &ctx.device_id {
                Some(old) if *old != device.device_id => {
                    // The socket changed identity: release the old
                    // binding without closing the shared socket.
                    state
                        .registry
                        .detach_binding(old, ctx.conn.conn_id());
                    true
                }
                None => true,
                Some(_) => false,
            };
            ctx.device_id = Some(device.device_id.clone());
            if rebound {
                state.tts.bind_connection(&device.device_id, &ctx.conn);
            }
            let _ = ctx
                .conn
                .send(&OutboundFrame::RegisterResponse {
                    success: true,
                    device,
                })
                .await;
        }
        Err(e) => {
            warn!(error = %e, "registration rejected");
            send_error(ctx, &e.to_string(), Some("register")).await;
        }
    }
}

async fn send_error(ctx: &ConnectionContext, message: &str, frame_type: Option<&str>) {
    let _ = ctx
        .conn
        .send(&OutboundFrame::Error {
            message: message.to_string(),
            frame_type: frame_type.map(str::to_string),
        })
        .await;
}
