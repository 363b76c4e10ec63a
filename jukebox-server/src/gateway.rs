use std::ops::ControlFlow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
};
use chrono::{DateTime, Utc};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use jukebox_collab::{
    events::RoomEvent, ClientMessage, Collab, PrimaryKey, Room, UserData, VoteOutcome,
};
use jukebox_core::{ConnectionId, Subscription};

use crate::{
    context::ServerContext,
    errors::ServerError,
    serialized::{QueueEntry, RoomMember, RoomSettingsView, RoomState, ToSerialized, TrackRef, Vote},
    Router,
};

type Outgoing = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Everything the server pushes over the gateway.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "room:state")]
    RoomState(RoomState),
    #[serde(rename = "room:member-joined")]
    MemberJoined { member: RoomMember },
    #[serde(rename = "room:member-left")]
    MemberLeft { user_id: PrimaryKey },
    #[serde(rename = "room:owner-changed")]
    OwnerChanged { user_id: PrimaryKey },
    #[serde(rename = "room:settings")]
    SettingsUpdated { settings: RoomSettingsView },
    #[serde(rename = "queue:updated")]
    QueueUpdated {
        entries: Vec<QueueEntry>,
        currently_playing: Option<PrimaryKey>,
    },
    #[serde(rename = "queue:entry-removed")]
    QueueEntryRemoved {
        entry_id: PrimaryKey,
        reason: &'static str,
    },
    #[serde(rename = "playback:start")]
    PlaybackStart {
        track: TrackRef,
        start_at_server_time: i64,
        server_now_ms: i64,
        duration_seconds: i32,
    },
    #[serde(rename = "playback:pause")]
    PlaybackPause,
    #[serde(rename = "playback:stop")]
    PlaybackStop,
    #[serde(rename = "dj:changed")]
    DjChanged {
        dj_id: PrimaryKey,
        username: String,
        display_name: String,
    },
    #[serde(rename = "dj:removed")]
    DjRemoved { reason: &'static str },
    #[serde(rename = "vote:election-started")]
    ElectionStarted { vote: Vote },
    #[serde(rename = "vote:mutiny-started")]
    MutinyStarted { vote: Vote },
    #[serde(rename = "vote:results-updated")]
    VoteResultsUpdated { vote: Vote },
    #[serde(rename = "vote:complete")]
    VoteComplete {
        session_id: Uuid,
        outcome: &'static str,
    },
    #[serde(rename = "mutiny:success")]
    MutinySuccess,
    #[serde(rename = "mutiny:failed")]
    MutinyFailed,
    #[serde(rename = "chat:message")]
    ChatMessage {
        user_id: PrimaryKey,
        display_name: String,
        body: String,
        sent_at: DateTime<Utc>,
    },
    #[serde(rename = "sync:pong")]
    SyncPong {
        client_t0: i64,
        server_t1: i64,
        server_t2: i64,
    },
    #[serde(rename = "sync:ack")]
    SyncAck,
}

/// Timing probes, answered at the gateway without touching the room.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SyncFrame {
    #[serde(rename = "sync:ping")]
    Ping { client_t0: i64 },
    #[serde(rename = "sync:report")]
    Report { rtt_ms: u64 },
}

impl From<RoomEvent> for ServerEvent {
    fn from(value: RoomEvent) -> Self {
        match value {
            RoomEvent::State(snapshot) => Self::RoomState(snapshot.to_serialized()),
            RoomEvent::MemberJoined { new_member, .. } => Self::MemberJoined {
                member: new_member.to_serialized(),
            },
            RoomEvent::MemberLeft { user_id, .. } => Self::MemberLeft { user_id },
            RoomEvent::OwnerChanged { user_id, .. } => Self::OwnerChanged { user_id },
            RoomEvent::SettingsUpdated { settings, .. } => Self::SettingsUpdated {
                settings: settings.to_serialized(),
            },
            RoomEvent::QueueUpdated {
                entries,
                currently_playing,
                ..
            } => Self::QueueUpdated {
                entries: entries.to_serialized(),
                currently_playing,
            },
            RoomEvent::QueueEntryRemoved {
                entry_id, reason, ..
            } => Self::QueueEntryRemoved {
                entry_id,
                reason: match reason {
                    jukebox_collab::events::EntryRemovalReason::Requested => "requested",
                    jukebox_collab::events::EntryRemovalReason::Downvoted => "downvoted",
                },
            },
            RoomEvent::PlaybackStarted {
                playback,
                server_now_ms,
                ..
            } => Self::PlaybackStart {
                duration_seconds: playback.duration_seconds,
                start_at_server_time: playback.start_at_server_time,
                track: playback.to_serialized(),
                server_now_ms,
            },
            RoomEvent::PlaybackPaused { .. } => Self::PlaybackPause,
            RoomEvent::PlaybackStopped { .. } => Self::PlaybackStop,
            RoomEvent::DjChanged { new_dj, .. } => Self::DjChanged {
                dj_id: new_dj.user.id,
                username: new_dj.user.username,
                display_name: new_dj.user.display_name,
            },
            RoomEvent::DjRemoved { reason, .. } => Self::DjRemoved {
                reason: reason.as_str(),
            },
            RoomEvent::ElectionStarted { session, .. } => Self::ElectionStarted {
                vote: session.to_serialized(),
            },
            RoomEvent::MutinyStarted { session, .. } => Self::MutinyStarted {
                vote: session.to_serialized(),
            },
            RoomEvent::VoteResultsUpdated { session, .. } => Self::VoteResultsUpdated {
                vote: session.to_serialized(),
            },
            RoomEvent::VoteComplete {
                session_id,
                outcome,
                ..
            } => Self::VoteComplete {
                session_id,
                outcome: match outcome {
                    VoteOutcome::Pending => "pending",
                    VoteOutcome::Passed => "passed",
                    VoteOutcome::Failed => "failed",
                    VoteOutcome::Cancelled => "cancelled",
                },
            },
            RoomEvent::MutinySucceeded { .. } => Self::MutinySuccess,
            RoomEvent::MutinyFailed { .. } => Self::MutinyFailed,
            RoomEvent::ChatMessage {
                message, author, ..
            } => Self::ChatMessage {
                user_id: author.id,
                display_name: author.display_name,
                body: message.body,
                sent_at: message.sent_at,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: String,
}

/// The join handshake, expected as the first frame on a bare gateway
/// connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum JoinFrame {
    #[serde(rename = "room:join")]
    Join {
        room_code: String,
        password: Option<String>,
    },
}

type Incoming = futures_util::stream::SplitStream<WebSocket>;

/// Upgrades an authenticated member's connection straight into a room's
/// event channel.
async fn gateway(
    State(context): State<ServerContext>,
    Path(code): Path<String>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let session = authenticate(&context, &query.token).await?;
    let room = context.collab.rooms.room_by_code(&code)?;
    let collab = context.collab.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let connection_id = ConnectionId::new();
        let (outgoing, incoming) = socket.split();
        let outgoing: Outgoing = Arc::new(Mutex::new(outgoing));

        match collab
            .controller
            .attach(&room, session.user.id, connection_id)
            .await
        {
            Ok(subscription) => {
                run_session(
                    collab,
                    room,
                    session.user,
                    connection_id,
                    outgoing,
                    incoming,
                    subscription,
                )
                .await
            }
            Err(e) => send_error(&outgoing, &ServerError::from(e)).await,
        }
    }))
}

/// Upgrades an authenticated connection that joins its room with a
/// `room:join` frame, creating the membership on the fly.
async fn gateway_join(
    State(context): State<ServerContext>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let session = authenticate(&context, &query.token).await?;
    let collab = context.collab.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let connection_id = ConnectionId::new();
        let (outgoing, mut incoming) = socket.split();
        let outgoing: Outgoing = Arc::new(Mutex::new(outgoing));

        // Nothing but the handshake is valid before a room is joined.
        let (room, subscription) = loop {
            let Some(Ok(message)) = incoming.next().await else {
                return;
            };

            let Message::Text(text) = message else {
                if matches!(message, Message::Close(_)) {
                    return;
                }

                continue;
            };

            let frame = match serde_json::from_str::<JoinFrame>(&text) {
                Ok(frame) => frame,
                Err(_) => {
                    send_error(
                        &outgoing,
                        &ServerError::InvalidInput("Expected room:join".to_string()),
                    )
                    .await;

                    continue;
                }
            };

            let JoinFrame::Join {
                room_code,
                password,
            } = frame;

            match collab
                .controller
                .join(
                    session.user.id,
                    connection_id,
                    &room_code,
                    password.as_deref(),
                )
                .await
            {
                Ok(joined) => break joined,
                Err(e) => send_error(&outgoing, &ServerError::from(e)).await,
            }
        };

        run_session(
            collab,
            room,
            session.user,
            connection_id,
            outgoing,
            incoming,
            subscription,
        )
        .await
    }))
}

async fn authenticate(
    context: &ServerContext,
    token: &str,
) -> Result<jukebox_collab::SessionData, ServerError> {
    context
        .collab
        .auth
        .session(token)
        .await
        .map_err(|_| ServerError::Unauthorized("Session does not exist".to_string()))
}

/// The steady-state message loop of an attached connection.
async fn run_session(
    collab: Arc<Collab>,
    room: Arc<Room>,
    user: UserData,
    connection_id: ConnectionId,
    outgoing: Outgoing,
    mut incoming: Incoming,
    subscription: Subscription<RoomEvent>,
) {
    let forward = tokio::spawn(forward_events(subscription, outgoing.clone()));

    while let Some(Ok(message)) = incoming.next().await {
        match message {
            Message::Text(text) => {
                let flow =
                    handle_frame(&collab, &room, &user, connection_id, &outgoing, &text).await;

                if flow.is_break() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();
    collab.controller.detach(&room, user.id, connection_id).await;

    debug!(
        "Connection {connection_id} left the gateway of room {}",
        room.id()
    );
}

/// Routes one inbound frame: sync probes at the gateway, everything else into
/// the room controller.
async fn handle_frame(
    collab: &Arc<Collab>,
    room: &Arc<Room>,
    user: &UserData,
    connection_id: ConnectionId,
    outgoing: &Outgoing,
    text: &str,
) -> ControlFlow<()> {
    if let Ok(probe) = serde_json::from_str::<SyncFrame>(text) {
        match probe {
            SyncFrame::Ping { client_t0 } => {
                let pong = collab.sync.ping(connection_id, client_t0).await;

                send_event(
                    outgoing,
                    &ServerEvent::SyncPong {
                        client_t0: pong.client_t0,
                        server_t1: pong.server_t1,
                        server_t2: pong.server_t2,
                    },
                )
                .await;
            }
            SyncFrame::Report { rtt_ms } => {
                collab.sync.report_rtt(connection_id, rtt_ms).await;
                send_event(outgoing, &ServerEvent::SyncAck).await;
            }
        }

        return ControlFlow::Continue(());
    }

    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::RoomLeave) => {
            if let Err(e) = collab.controller.leave(room, user.id).await {
                send_error(outgoing, &ServerError::from(e)).await;
            }

            ControlFlow::Break(())
        }
        Ok(message) => {
            if let Err(e) = collab.controller.dispatch(room, user.id, message).await {
                send_error(outgoing, &ServerError::from(e)).await;
            }

            ControlFlow::Continue(())
        }
        Err(e) => {
            send_error(
                outgoing,
                &ServerError::InvalidInput(format!("Unrecognized message: {e}")),
            )
            .await;

            ControlFlow::Continue(())
        }
    }
}

async fn forward_events(mut subscription: Subscription<RoomEvent>, outgoing: Outgoing) {
    while let Some(event) = subscription.next().await {
        let serialized =
            serde_json::to_string(&ServerEvent::from(event)).expect("event serializes");

        if outgoing
            .lock()
            .await
            .send(Message::Text(serialized))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn send_event(outgoing: &Outgoing, event: &ServerEvent) {
    let serialized = serde_json::to_string(event).expect("event serializes");

    // Failures mean the socket is gone; the read loop will notice.
    let _ = outgoing.lock().await.send(Message::Text(serialized)).await;
}

async fn send_error(outgoing: &Outgoing, error: &ServerError) {
    let serialized = serde_json::to_string(&error.to_frame()).expect("frame serializes");
    let _ = outgoing.lock().await.send(Message::Text(serialized)).await;
}

pub fn router() -> Router {
    Router::new()
        .route("/gateway", get(gateway_join))
        .route("/rooms/:code/gateway", get(gateway))
}
