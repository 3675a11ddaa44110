//! Per-connection handling
//!
//! ```text
//! accept ─► handshake (first frame must be hello, within hello timeout)
//!             │ bad token ──► hello_ack{ok:false}, close 4001
//!             │ bad frame ──► close 4002 / 4003, timeout ─► close 4004
//!             ▼
//!           serve: frames ─► dispatcher ─► replies ─► writer task ─► socket
//!                  ping every interval, close when the peer goes silent
//! ```
//!
//! A single writer task owns the sink. `call_tool` runs in its own task so
//! one slow call never blocks other operations on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn, Instrument};

use super::dispatcher::Dispatcher;
use super::protocol::{close_code, ClientMessage, ProtocolError, ServerMessage};
use crate::config::{secs, ServerConfig};
use crate::error::ErrorCode;
use crate::session::Session;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

const REPLY_CHANNEL_CAPACITY: usize = 256;
const CONTROL_CHANNEL_CAPACITY: usize = 8;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Serve one TCP connection until the peer leaves or goes silent
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
) {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_bytes);
    ws_config.max_frame_size = Some(config.max_message_bytes);

    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket upgrade failed");
            return;
        }
    };
    let (mut sink, mut frames) = ws.split();

    let Some(session) = handshake(&mut sink, &mut frames, &dispatcher, &config).await else {
        return;
    };
    info!(peer = %peer, session_id = %session.id(), "Session opened");

    serve(sink, frames, &dispatcher, &session, &config).await;

    dispatcher.sessions().remove(session.id());
    info!(
        session_id = %session.id(),
        active_sessions = dispatcher.sessions().count(),
        "Session closed"
    );
}

// ============================================================================
// Handshake
// ============================================================================

async fn handshake(
    sink: &mut WsSink,
    frames: &mut WsStream,
    dispatcher: &Dispatcher,
    config: &ServerConfig,
) -> Option<Arc<Session>> {
    let first = match tokio::time::timeout(secs(config.hello_timeout_secs), next_text(frames)).await {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(_) => {
            warn!("No hello before timeout");
            close(sink, close_code::HELLO_TIMEOUT, "hello timeout").await;
            return None;
        }
    };

    let token = match ClientMessage::parse(&first) {
        Ok(ClientMessage::Hello { token, .. }) => token,
        Ok(other) => {
            warn!(op = other.op(), "First frame was not hello");
            close(sink, close_code::MISSING_HELLO, "expected hello").await;
            return None;
        }
        Err(ProtocolError::UnknownOp(op)) => {
            warn!(op = %op, "First frame was not hello");
            close(sink, close_code::MISSING_HELLO, "expected hello").await;
            return None;
        }
        Err(e) => {
            warn!(error = %e, "Invalid hello");
            close(sink, close_code::INVALID_HELLO, "invalid hello").await;
            return None;
        }
    };

    if !dispatcher.authenticate(token.as_deref()) {
        warn!("Hello rejected: bad token");
        let ack = ServerMessage::HelloAck {
            ok: false,
            session_id: None,
            error: Some(ErrorCode::Unauthorized.to_string()),
        };
        let _ = sink.send(Message::Text(ack.to_json())).await;
        close(sink, close_code::UNAUTHORIZED, "unauthorized").await;
        return None;
    }

    let session = dispatcher.sessions().create();
    let ack = ServerMessage::HelloAck {
        ok: true,
        session_id: Some(session.id().to_string()),
        error: None,
    };
    if let Err(e) = sink.send(Message::Text(ack.to_json())).await {
        debug!(error = %e, "Failed to send hello_ack");
        dispatcher.sessions().remove(session.id());
        return None;
    }
    Some(session)
}

/// Next text payload, skipping control frames; `None` once the peer is gone
async fn next_text(frames: &mut WsStream) -> Option<String> {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Binary(bytes)) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Read error during handshake");
                return None;
            }
        }
    }
    None
}

async fn close(sink: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

// ============================================================================
// Serving
// ============================================================================

async fn serve(sink: WsSink, mut frames: WsStream, dispatcher: &Arc<Dispatcher>, session: &Arc<Session>, config: &ServerConfig) {
    let (reply_tx, reply_rx) = mpsc::channel::<ServerMessage>(REPLY_CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel::<Message>(CONTROL_CHANNEL_CAPACITY);
    let mut writer = tokio::spawn(write_loop(sink, reply_rx, control_rx).in_current_span());

    let ping_interval = secs(config.ping_interval_secs);
    let silence_limit = ping_interval + secs(config.ping_timeout_secs);
    let mut ping_ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut last_seen = Instant::now();
    let mut calls = JoinSet::new();

    loop {
        tokio::select! {
            frame = frames.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Peer closed connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "Read error");
                        break;
                    }
                };
                last_seen = Instant::now();
                handle_frame(&text, dispatcher, session, &reply_tx, &mut calls).await;
            }

            _ = ping_ticker.tick() => {
                if last_seen.elapsed() > silence_limit {
                    warn!(silent_secs = last_seen.elapsed().as_secs_f64(), "Peer unresponsive, closing");
                    let _ = control_tx.send(Message::Close(None)).await;
                    break;
                }
                if control_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "Call task panicked");
                    }
                }
            }
        }
    }

    // Calls still running finish and populate the result cache
    let pending = calls.len();
    if pending > 0 {
        debug!(pending, "Detaching in-flight calls");
    }
    calls.detach_all();

    drop(control_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn handle_frame(
    text: &str,
    dispatcher: &Arc<Dispatcher>,
    session: &Arc<Session>,
    replies: &mpsc::Sender<ServerMessage>,
    calls: &mut JoinSet<()>,
) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Rejected frame");
            let _ = replies.send(ServerMessage::Error { message: e.to_string() }).await;
            return;
        }
    };
    debug!(op = message.op(), "Received");

    let reply = match message {
        ClientMessage::Hello { .. } => ServerMessage::Error {
            message: "session already established".into(),
        },
        ClientMessage::ListTools => dispatcher.list_tools(),
        ClientMessage::Health => dispatcher.health(),
        ClientMessage::RotateToken { old, new } => dispatcher.rotate_token(&old, &new),
        ClientMessage::CallTool(request) => {
            let dispatcher = Arc::clone(dispatcher);
            let session = Arc::clone(session);
            let replies = replies.clone();
            calls.spawn(
                async move {
                    if let Some(response) = dispatcher.call_tool(&session, request, &replies).await {
                        let _ = replies.send(response).await;
                    }
                }
                .in_current_span(),
            );
            return;
        }
    };
    let _ = replies.send(reply).await;
}

/// Sole owner of the sink
///
/// Ends when the control channel closes, after a close frame, or when the
/// socket fails.
async fn write_loop(mut sink: WsSink, mut replies: mpsc::Receiver<ServerMessage>, mut control: mpsc::Receiver<Message>) {
    loop {
        tokio::select! {
            biased;

            frame = control.recv() => match frame {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Flush replies that are already queued
                    while let Ok(reply) = replies.try_recv() {
                        if sink.send(Message::Text(reply.to_json())).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            },

            Some(reply) = replies.recv() => {
                if let Err(e) = sink.send(Message::Text(reply.to_json())).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
