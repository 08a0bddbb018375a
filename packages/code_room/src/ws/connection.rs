//! Room Connection Handler
//!
//! One WebSocket per participant. The connection waits for `init`, joins the
//! room through the registry, then runs a writer (participant queue → socket)
//! and a reader (socket → session) until either side ends.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::metrics::ServerMetrics;
use crate::session::{Participant, ParticipantId, SessionHandle, SessionRegistry};

use super::protocol::{ClientFrame, InitRequest, ServerFrame, decode_client_frame};

/// Local replies (protocol errors) waiting for the writer
const REPLY_QUEUE_CAPACITY: usize = 16;

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// Handle one participant's WebSocket for `room_id`
pub async fn handle_room_ws(
    socket: WebSocket,
    room_id: String,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
) {
    metrics.connection_opened();
    serve(socket, &room_id, &registry, &metrics).await;
    metrics.connection_closed();
}

async fn serve(
    socket: WebSocket,
    room_id: &str,
    registry: &SessionRegistry,
    metrics: &ServerMetrics,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let config = registry.room_config().clone();

    let init = match tokio::time::timeout(
        config.handshake_timeout,
        read_init(&mut ws_sender, &mut ws_receiver, metrics),
    )
    .await
    {
        Ok(Some(init)) => init,
        Ok(None) => {
            debug!(room = %room_id, "Connection closed before init");
            return;
        }
        Err(_) => {
            info!(room = %room_id, "No init within {:?}, closing", config.handshake_timeout);
            close(&mut ws_sender, close_code::POLICY, "handshake_timeout").await;
            return;
        }
    };

    if let Some(claimed) = init.session_id.as_deref().filter(|s| *s != room_id) {
        warn!(room = %room_id, claimed = %claimed, "Client init names a different session, using the path");
    }

    let (participant, outbound) = Participant::channel(config.outbound_queue_capacity);
    let participant_id = participant.id;
    let evicted = participant.eviction_token();

    let session = match registry
        .join(room_id, participant, init.language.as_deref())
        .await
    {
        Ok(session) => session,
        Err(err) => {
            info!(room = %room_id, participant = %participant_id, "Join failed: {}", err);
            send_frame(&mut ws_sender, &ServerFrame::error(&err)).await;
            close(&mut ws_sender, join_failure_close_code(&err), err.reason_code()).await;
            return;
        }
    };

    let (reply_tx, reply_rx) = mpsc::channel::<ServerFrame>(REPLY_QUEUE_CAPACITY);

    let writer = async move {
        let mut outbound = outbound;
        let mut reply_rx = reply_rx;
        loop {
            let frame = tokio::select! {
                biased;

                _ = evicted.cancelled() => {
                    close(&mut ws_sender, close_code::POLICY, "slow_consumer").await;
                    return;
                }
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                Some(frame) = reply_rx.recv() => frame,
            };
            if !send_frame(&mut ws_sender, &frame).await {
                break;
            }
        }
        close(&mut ws_sender, close_code::NORMAL, "").await;
    };

    let reader = read_frames(ws_receiver, &session, participant_id, reply_tx, metrics);

    tokio::select! {
        _ = writer => debug!(room = %room_id, participant = %participant_id, "Writer ended"),
        _ = reader => debug!(room = %room_id, participant = %participant_id, "Reader ended"),
    }

    registry.leave(room_id, participant_id).await;
    info!(room = %room_id, participant = %participant_id, "Connection closed");
}

/// Read until a valid `init` arrives. `None` if the socket closes first.
async fn read_init(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    metrics: &ServerMetrics,
) -> Option<InitRequest> {
    while let Some(msg) = ws_receiver.next().await {
        let reply = match msg {
            Ok(Message::Text(text)) => match decode_client_frame(&text) {
                Ok(Some(ClientFrame::Init(init))) => return Some(init),
                Ok(Some(_)) => SessionError::NotJoined,
                Ok(None) => continue,
                Err(e) => {
                    metrics.invalid_frame();
                    debug!("Malformed frame during handshake: {}", e);
                    e.into()
                }
            },
            Ok(Message::Binary(_)) => {
                metrics.invalid_frame();
                SessionError::InvalidRequest("binary frames are not supported".to_string())
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error during handshake: {}", e);
                return None;
            }
        };
        if !send_frame(ws_sender, &ServerFrame::error(&reply)).await {
            return None;
        }
    }
    None
}

/// Dispatch client frames to the session until the socket or session ends
async fn read_frames(
    mut ws_receiver: WsReceiver,
    session: &SessionHandle,
    participant: ParticipantId,
    reply_tx: mpsc::Sender<ServerFrame>,
    metrics: &ServerMetrics,
) {
    while let Some(msg) = ws_receiver.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => match decode_client_frame(&text) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(%participant, "Ignoring unknown frame type");
                    continue;
                }
                Err(e) => {
                    metrics.invalid_frame();
                    debug!(%participant, "Malformed frame: {}", e);
                    let err: SessionError = e.into();
                    if reply_tx.send(ServerFrame::error(&err)).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            Ok(Message::Binary(_)) => {
                metrics.invalid_frame();
                let err = SessionError::InvalidRequest("binary frames are not supported".into());
                if reply_tx.send(ServerFrame::error(&err)).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Close(_)) => {
                debug!(%participant, "Client closed connection");
                break;
            }
            // pings are answered by the websocket layer
            Ok(_) => continue,
            Err(e) => {
                error!(%participant, "WebSocket error: {}", e);
                break;
            }
        };

        let result = match frame {
            ClientFrame::Init(_) => {
                let err = ServerFrame::error(&SessionError::AlreadyJoined);
                if reply_tx.send(err).await.is_err() {
                    break;
                }
                Ok(())
            }
            ClientFrame::Edit(edit) => session.edit(participant, edit).await,
            ClientFrame::Language(language) => session.set_language(participant, language).await,
            ClientFrame::Run(request) => session.run(participant, request).await,
            ClientFrame::Cursor(data) => session.relay(participant, ServerFrame::Cursor(data)).await,
            ClientFrame::Chat(data) => session.relay(participant, ServerFrame::Chat(data)).await,
        };

        if let Err(e) = result {
            warn!(%participant, room = %session.room_id(), "Session unavailable: {}", e);
            break;
        }
    }
}

/// Returns false once the socket is gone
async fn send_frame(ws_sender: &mut WsSender, frame: &ServerFrame) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to serialize frame: {}", e);
            return true;
        }
    };
    ws_sender.send(Message::Text(json.into())).await.is_ok()
}

/// A refused join is a normal close; anything else is a server fault
fn join_failure_close_code(err: &SessionError) -> u16 {
    if err.is_fatal() {
        close_code::NORMAL
    } else {
        close_code::ERROR
    }
}

async fn close(ws_sender: &mut WsSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_sender.send(Message::Close(Some(frame))).await;
}
