//! The per-connection session task.

use std::net::SocketAddr;

use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse as _;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use vigil_broker::publish_json;
use vigil_status::{StatusBucket, StatusStore as _};
use vigil_storage::ObjectStore as _;
use vigil_types::messages::FrameEnvelope;
use vigil_types::{Action, ClientName, Reason, queues, ws_close_codes};

use crate::errors::SessionError;
use crate::registry::SessionId;
use crate::{GatewayState, metrics};

/// Inbound client message.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

/// Outbound policy response (pause warnings, denials).
#[derive(Debug, Clone, Copy, Serialize)]
struct PolicyNotice {
    action: Action,
    reason: Reason,
}

#[derive(Default)]
struct SessionCtx {
    name: Option<ClientName>,
    session_id: Option<SessionId>,
    remote: Option<SocketAddr>,
    // handed to the registry on admission; holding it here keeps the
    // outbound channel open until then
    pending_tx: Option<mpsc::UnboundedSender<String>>,
}

/// Accepts the upgrade if a session permit is available.
pub(crate) fn upgrade(
    state: GatewayState,
    ws: WebSocketUpgrade,
    remote: Option<SocketAddr>,
) -> axum::response::Response {
    let permit = match std::sync::Arc::clone(&state.session_permits).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::warn!("rejecting connection from {remote:?}: gateway is at capacity");
            return (StatusCode::SERVICE_UNAVAILABLE, "gateway is at capacity").into_response();
        }
    };
    ws.max_message_size(state.max_message_size)
        .on_failed_upgrade(|err| {
            tracing::warn!("could not establish websocket connection: {err:?}");
        })
        .on_upgrade(move |socket| async move {
            let _permit = permit;
            run_session(socket, state, remote).await;
        })
}

/// The whole life-cycle of one client connection.
async fn run_session(mut socket: WebSocket, state: GatewayState, remote: Option<SocketAddr>) {
    ::metrics::gauge!(metrics::METRICS_ID_GATEWAY_SESSIONS_OPEN).increment(1);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let mut ctx = SessionCtx {
        remote,
        pending_tx: Some(outbound_tx),
        ..Default::default()
    };

    let error = loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        let client = ctx.name.as_ref().map(ClientName::as_str).unwrap_or("?");
                        tracing::info!(
                            "sending response to {client} at {}",
                            vigil_types::wall_clock_stamp(chrono::Local::now())
                        );
                        if let Err(err) = socket.send(ws::Message::text(message)).await {
                            break SessionError::Transport(err);
                        }
                        ::metrics::counter!(metrics::METRICS_ID_GATEWAY_ACTIONS_SENT).increment(1);
                    }
                    // the registry dropped our sender: a reconnect took over
                    None => break SessionError::Superseded,
                }
            }
            inbound = tokio::time::timeout(state.message_timeout, socket.recv()) => {
                let message = match inbound {
                    Err(_) => {
                        tracing::warn!("timeout while awaiting data from {:?}", ctx.name);
                        break SessionError::Timeout;
                    }
                    Ok(None) => break SessionError::PeerClosed(None),
                    Ok(Some(Err(err))) => break SessionError::Transport(err),
                    Ok(Some(Ok(message))) => message,
                };
                match message {
                    ws::Message::Close(frame) => {
                        break SessionError::PeerClosed(frame.map(|frame| frame.code));
                    }
                    ws::Message::Text(text) => {
                        match handle_frame(&state, &mut ctx, text.as_ref()).await {
                            Ok(Some(notice)) => {
                                if let Err(err) = send_notice(&mut socket, notice).await {
                                    break SessionError::Transport(err);
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                if let Some(notice) = notice_for(&error) {
                                    // best effort: the close frame follows anyway
                                    let _ = send_notice(&mut socket, notice).await;
                                }
                                break error;
                            }
                        }
                    }
                    ws::Message::Binary(_) => {
                        tracing::warn!("ignoring binary frame from {:?}", ctx.name);
                    }
                    // ping/pong are answered by axum
                    _ => {}
                }
            }
        }
    };

    finish_session(&state, &ctx, error, &mut socket).await;
    ::metrics::gauge!(metrics::METRICS_ID_GATEWAY_SESSIONS_OPEN).decrement(1);
}

async fn send_notice(socket: &mut WebSocket, notice: PolicyNotice) -> Result<(), axum::Error> {
    let message = serde_json::to_string(&notice).expect("can serialize policy notice");
    socket.send(ws::Message::text(message)).await
}

fn notice_for(error: &SessionError) -> Option<PolicyNotice> {
    match error {
        SessionError::Blocked => Some(PolicyNotice {
            action: Action::Error,
            reason: Reason::Blocked,
        }),
        SessionError::NotAvailable => Some(PolicyNotice {
            action: Action::Error,
            reason: Reason::NotAvailable,
        }),
        SessionError::RateLimited => Some(PolicyNotice {
            action: Action::Error,
            reason: Reason::RateLimitExceeded,
        }),
        _ => None,
    }
}

/// Handles one inbound frame message.
///
/// `Ok(Some(notice))` keeps the session alive but answers with a policy
/// notice (paused clients); `Err` terminates the session.
async fn handle_frame(
    state: &GatewayState,
    ctx: &mut SessionCtx,
    text: &str,
) -> Result<Option<PolicyNotice>, SessionError> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!("unreadable client message: {err:?}");
            return Ok(None);
        }
    };
    let Some(client) = frame.user_name.as_deref().and_then(ClientName::parse) else {
        tracing::warn!("received payload without user_name");
        return Ok(None);
    };
    match &ctx.name {
        None => ctx.name = Some(client.clone()),
        Some(established) if *established != client => {
            tracing::warn!(
                "received mismatched user_name '{client}' for active client '{established}'"
            );
            return Ok(None);
        }
        Some(_) => {}
    }

    let snapshot = match state.status.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!("cannot read client status snapshot: {err:?}");
            Default::default()
        }
    };
    if snapshot.paused_clients.iter().any(|name| name == client.as_str()) {
        tracing::info!("'{client}' is paused - frame not enqueued");
        return Ok(Some(PolicyNotice {
            action: Action::Warning,
            reason: Reason::Paused,
        }));
    }
    if snapshot.blocked_clients.iter().any(|name| name == client.as_str()) {
        tracing::info!("connection closed: '{client}' is blocked");
        return Err(SessionError::Blocked);
    }
    if !state.users.contains(client.as_str()) {
        tracing::error!("connection closed: no enrolled client with name '{client}'");
        return Err(SessionError::NotAvailable);
    }
    if !state.rate_limiter.allow(client.as_str()) {
        return Err(SessionError::RateLimited);
    }

    tracing::debug!("client '{client}' sent data");
    let send_time = vigil_types::wall_clock_stamp(chrono::Local::now());
    let Some(image) = frame.image.as_deref() else {
        tracing::warn!("no image from '{client}'");
        return Ok(None);
    };
    let pixels = match vigil_models::imaging::decode_base64_image(image) {
        Ok(pixels) => pixels,
        Err(err) => {
            tracing::warn!("undecodable image from '{client}': {err:?}");
            return Ok(None);
        }
    };
    let jpeg = match vigil_models::imaging::encode_jpeg(&pixels) {
        Ok(jpeg) => jpeg,
        Err(err) => {
            tracing::error!("failed to encode frame of '{client}': {err:?}");
            return Ok(None);
        }
    };

    let object_key = vigil_storage::frame_key(&client);
    let frame_size_bytes = jpeg.len() as u64;
    if let Err(err) = state
        .store
        .put(&object_key, jpeg, vigil_storage::IMAGE_CONTENT_TYPE)
        .await
    {
        tracing::error!("failed to persist frame of '{client}': {err:?}");
        return Err(SessionError::Storage);
    }

    let mut envelope = FrameEnvelope {
        client_name: client.clone(),
        send_time,
        object_key,
        bucket: state.store.bucket().to_owned(),
        content_type: vigil_storage::IMAGE_CONTENT_TYPE.to_owned(),
        storage_provider: state.store.provider().to_owned(),
        frame_size_bytes,
        extra: Default::default(),
    };

    if let Some(outbound) = ctx.pending_tx.take() {
        // first admitted frame: the session becomes LIVE
        ctx.session_id = Some(state.registry.register(client.clone(), outbound));
        update_active_clients(state).await;
        if let Some(remote) = ctx.remote {
            envelope
                .extra
                .insert("client_ip".to_owned(), remote.ip().to_string().into());
            envelope
                .extra
                .insert("client_port".to_owned(), u64::from(remote.port()).into());
        }
        tracing::info!("registered new client '{client}' from {:?}", ctx.remote);
    }

    if let Err(err) = publish_json(
        &state.broker,
        queues::EXCHANGE_CLIENTS_DATA,
        queues::QUEUE_CLIENTS_DATA,
        &envelope,
    )
    .await
    {
        tracing::error!("failed to publish data for '{client}': {err:?}");
        return Err(SessionError::Storage);
    }
    ::metrics::counter!(metrics::METRICS_ID_GATEWAY_FRAMES_ACCEPTED).increment(1);
    Ok(None)
}

async fn finish_session(
    state: &GatewayState,
    ctx: &SessionCtx,
    error: SessionError,
    socket: &mut WebSocket,
) {
    if let (SessionError::PeerClosed(Some(code)), Some(client)) = (&error, &ctx.name) {
        tracing::warn!("connection closed for '{client}', code {code}");
        if *code == ws_close_codes::CONNECTIVITY {
            if let Err(err) = state
                .status
                .append(StatusBucket::ConnectivityError, client.as_str())
                .await
            {
                tracing::warn!("cannot record connectivity error: {err:?}");
            }
        }
    }
    if let Some(close_frame) = error.into_close_frame() {
        // sent best-effort and not awaited further, like axum's own example
        let _ = socket
            .send(ws::Message::Close(Some(close_frame)))
            .await;
    }
    if let (Some(client), Some(session_id)) = (&ctx.name, ctx.session_id) {
        state.registry.remove(client, session_id);
        update_active_clients(state).await;
        tracing::debug!("cleaned up connection for '{client}'");
    }
}

async fn update_active_clients(state: &GatewayState) {
    if let Err(err) = state
        .status
        .replace_bucket(StatusBucket::Active, state.registry.client_names())
        .await
    {
        tracing::warn!("failed to update active clients: {err:?}");
    }
}
