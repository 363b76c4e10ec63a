use std::sync::Arc;

use log::warn;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use jukebox_core::{ConnectionId, StoreError, Subscription};

use crate::{
    events::RoomEvent, CollabContext, DatabaseError, DjError, DjReason, DjStateMachine,
    LeaveOutcome, NewMessage, PlaybackCoordinator, PlaybackError, PlaybackSnapshot, PrimaryKey,
    QueueEngine, QueueEntryView, QueueError, Room, RoomConnection, RoomData, RoomError,
    RoomManager, RoomMemberData, VoteChoice, VoteEngine, VoteError, VoteSession,
};

/// The longest chat message the room relays
const MAX_CHAT_BODY: usize = 500;

/// Messages a connected client can send on a room's channel. Sync probes and
/// the join handshake are handled at the gateway before dispatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "room:leave")]
    RoomLeave,
    #[serde(rename = "dj:set")]
    DjSet { user_id: PrimaryKey },
    #[serde(rename = "dj:randomize")]
    DjRandomize,
    #[serde(rename = "queue:add")]
    QueueAdd { url: String },
    #[serde(rename = "queue:upvote")]
    QueueUpvote { entry_id: PrimaryKey },
    #[serde(rename = "queue:downvote")]
    QueueDownvote { entry_id: PrimaryKey },
    #[serde(rename = "queue:clear-vote")]
    QueueClearVote { entry_id: PrimaryKey },
    #[serde(rename = "queue:remove")]
    QueueRemove { entry_id: PrimaryKey },
    #[serde(rename = "playback:start")]
    PlaybackStart { entry_id: PrimaryKey },
    #[serde(rename = "playback:pause")]
    PlaybackPause,
    #[serde(rename = "playback:stop")]
    PlaybackStop,
    #[serde(rename = "playback:ended")]
    PlaybackEnded { entry_id: PrimaryKey },
    #[serde(rename = "vote:start-election")]
    VoteStartElection,
    #[serde(rename = "vote:cast-dj")]
    VoteCastDj {
        session_id: Uuid,
        target_user_id: PrimaryKey,
    },
    #[serde(rename = "vote:start-mutiny")]
    VoteStartMutiny,
    #[serde(rename = "vote:cast-mutiny")]
    VoteCastMutiny { session_id: Uuid, yes: bool },
    #[serde(rename = "chat:send")]
    ChatSend { body: String },
}

/// Everything a connecting client needs to reconcile: sent as one message
/// before any delta reaches the connection.
#[derive(Debug, Clone)]
pub struct RoomStateSnapshot {
    pub room: RoomData,
    pub members: Vec<RoomMemberData>,
    pub dj: Option<PrimaryKey>,
    pub playback: PlaybackSnapshot,
    pub queue: Vec<QueueEntryView>,
    pub pending_vote: Option<VoteSession>,
}

/// The error surface of the whole room runtime
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Message is invalid: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error(transparent)]
    Dj(#[from] DjError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Routes client events into the room runtime, applying membership checks and
/// the connection lifecycle (snapshot-first attach, DJ grace on disconnect).
pub struct RoomController {
    context: CollabContext,
    rooms: Arc<RoomManager>,
    queue: Arc<QueueEngine>,
    playback: Arc<PlaybackCoordinator>,
    dj: Arc<DjStateMachine>,
    votes: Arc<VoteEngine>,
}

impl RoomController {
    pub fn new(
        context: &CollabContext,
        rooms: Arc<RoomManager>,
        queue: Arc<QueueEngine>,
        playback: Arc<PlaybackCoordinator>,
        dj: Arc<DjStateMachine>,
        votes: Arc<VoteEngine>,
    ) -> Self {
        Self {
            context: context.clone(),
            rooms,
            queue,
            playback,
            dj,
            votes,
        }
    }

    /// Resolves a `room:join`: creates the membership when the principal is
    /// new to the room, then attaches the connection.
    pub async fn join(
        &self,
        user_id: PrimaryKey,
        connection_id: ConnectionId,
        code: &str,
        password: Option<&str>,
    ) -> Result<(Arc<Room>, Subscription<RoomEvent>), CollabError> {
        let room = match self.rooms.join_room(user_id, code, password).await {
            Ok((room, _)) => room,
            Err(RoomError::AlreadyMember) => self.rooms.room_by_code(code)?,
            Err(e) => return Err(e.into()),
        };

        let subscription = self.attach(&room, user_id, connection_id).await?;

        Ok((room, subscription))
    }

    /// Attaches a connection to its room: registers it, cancels any DJ grace
    /// timer for the principal, and delivers the `room:state` snapshot before
    /// the connection sees any other event.
    pub async fn attach(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
        connection_id: ConnectionId,
    ) -> Result<Subscription<RoomEvent>, CollabError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(CollabError::Room)?;
        room.member_by_user_id(user_id).map_err(CollabError::Room)?;

        room.disarm_grace(user_id);

        room.add_connection(RoomConnection {
            id: connection_id,
            user_id,
        });

        let snapshot = self.snapshot_locked(room, user_id).await?;

        // Subscribing and pushing the snapshot under the room lock guarantees
        // every later event reaches this connection after the snapshot.
        let subscription = self.context.fabric.subscribe(&room.topic());
        subscription.push(RoomEvent::State(snapshot));

        Ok(subscription)
    }

    /// Handles a dropped connection: updates `last_active`, forgets the sync
    /// record, and arms the DJ grace timer when the DJ vanished mid-session.
    pub async fn detach(&self, room: &Arc<Room>, user_id: PrimaryKey, connection_id: ConnectionId) {
        room.remove_connection(connection_id);
        self.context.sync.forget(connection_id).await;

        if let Err(e) = self.context.database.touch_member(room.id(), user_id).await {
            warn!("Failed to update last_active for user {user_id}: {e}");
        }

        if room.user_is_connected(user_id) {
            return;
        }

        let is_dj = self
            .dj
            .current_dj(room)
            .await
            .ok()
            .flatten()
            .is_some_and(|dj| dj.user_id == user_id);

        if is_dj {
            self.arm_grace_timer(room, user_id);
        }
    }

    /// Removes the principal's membership, tearing down whatever they held:
    /// open votes against them, the DJ slot, and finally the room itself when
    /// they were the last member.
    pub async fn leave(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
    ) -> Result<LeaveOutcome, CollabError> {
        let _guard = room.lock().await;

        room.member_by_user_id(user_id).map_err(CollabError::Room)?;

        let pending = self.votes.pending(room).await?;

        if pending.is_some_and(|session| session.target == Some(user_id)) {
            self.votes.cancel_locked(room).await?;
        }

        let dj = self.dj.current_dj(room).await?;

        if dj.is_some_and(|dj| dj.user_id == user_id) {
            self.dj.remove_locked(room, DjReason::Voluntary).await?;
        }

        let outcome = self
            .rooms
            .remove_member_locked(room, user_id)
            .await
            .map_err(CollabError::Room)?;

        if outcome.deactivated {
            self.votes.cancel_locked(room).await?;
            self.playback.stop_locked(room).await?;
            self.context.rooms.remove(&room.id());
        }

        Ok(outcome)
    }

    /// Dispatches an in-room client message to the owning component.
    pub async fn dispatch(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
        message: ClientMessage,
    ) -> Result<(), CollabError> {
        room.member_by_user_id(user_id).map_err(CollabError::Room)?;

        match message {
            ClientMessage::RoomLeave => {
                self.leave(room, user_id).await?;
            }
            ClientMessage::DjSet { user_id: target } => {
                self.dj.set_by_owner(room, user_id, target).await?;
            }
            ClientMessage::DjRandomize => {
                self.dj.randomize(room, user_id).await?;
            }
            ClientMessage::QueueAdd { url } => {
                self.queue.submit(room, user_id, &url).await?;
            }
            ClientMessage::QueueUpvote { entry_id } => {
                self.queue.vote(room, user_id, entry_id, Some(1)).await?;
            }
            ClientMessage::QueueDownvote { entry_id } => {
                self.queue.vote(room, user_id, entry_id, Some(-1)).await?;
            }
            ClientMessage::QueueClearVote { entry_id } => {
                self.queue.vote(room, user_id, entry_id, None).await?;
            }
            ClientMessage::QueueRemove { entry_id } => {
                self.queue.remove(room, user_id, entry_id).await?;
            }
            ClientMessage::PlaybackStart { entry_id } => {
                self.playback.start(room, user_id, entry_id).await?;
            }
            ClientMessage::PlaybackPause => {
                self.playback.pause(room, user_id).await?;
            }
            ClientMessage::PlaybackStop => {
                self.playback.stop(room, user_id).await?;
            }
            ClientMessage::PlaybackEnded { entry_id } => {
                self.playback.report_ended(room, user_id, entry_id).await?;
            }
            ClientMessage::VoteStartElection => {
                self.votes.open_election(room, user_id).await?;
            }
            ClientMessage::VoteCastDj {
                session_id,
                target_user_id,
            } => {
                self.votes
                    .cast(
                        room,
                        user_id,
                        session_id,
                        VoteChoice::Candidate(target_user_id),
                    )
                    .await?;
            }
            ClientMessage::VoteStartMutiny => {
                self.votes.open_mutiny(room, user_id).await?;
            }
            ClientMessage::VoteCastMutiny { session_id, yes } => {
                self.votes
                    .cast(room, user_id, session_id, VoteChoice::Approve(yes))
                    .await?;
            }
            ClientMessage::ChatSend { body } => {
                self.chat(room, user_id, body).await?;
            }
        }

        Ok(())
    }

    /// Persists and relays a chat message.
    pub async fn chat(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
        body: String,
    ) -> Result<(), CollabError> {
        let body = body.trim().to_string();

        if body.is_empty() || body.len() > MAX_CHAT_BODY {
            return Err(CollabError::InvalidMessage(format!(
                "Chat messages must be 1 to {MAX_CHAT_BODY} characters"
            )));
        }

        let _guard = room.lock().await;
        room.ensure_active().map_err(CollabError::Room)?;

        let member = room.member_by_user_id(user_id).map_err(CollabError::Room)?;

        let message = self
            .context
            .database
            .create_message(NewMessage {
                room_id: room.id(),
                user_id,
                body,
            })
            .await
            .map_err(CollabError::Database)?;

        self.context.emit(
            room.id(),
            RoomEvent::ChatMessage {
                room_id: room.id(),
                message,
                author: member.user,
            },
        );

        Ok(())
    }

    /// Builds the reconnect snapshot. The caller must hold the room lock.
    async fn snapshot_locked(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
    ) -> Result<RoomStateSnapshot, CollabError> {
        let dj = self.dj.current_dj(room).await?;
        let playback = self.playback.snapshot(room).await?;
        let queue = self.queue.list(room, user_id).await?;
        let pending_vote = self.votes.pending(room).await?;

        Ok(RoomStateSnapshot {
            room: room.data(),
            members: room.members(),
            dj: dj.map(|dj| dj.user_id),
            playback,
            queue,
            pending_vote,
        })
    }

    /// Starts the grace countdown after the DJ's last socket dropped. The
    /// timer is disarmed when any of their connections comes back.
    fn arm_grace_timer(&self, room: &Arc<Room>, user_id: PrimaryKey) {
        let dj = self.dj.clone();
        let room_handle = room.clone();
        let grace = self.context.config.dj_grace();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let _guard = room_handle.lock().await;
            room_handle.clear_grace();

            if !room_handle.is_active() || room_handle.user_is_connected(user_id) {
                return;
            }

            let still_dj = dj
                .current_dj(&room_handle)
                .await
                .ok()
                .flatten()
                .is_some_and(|slot| slot.user_id == user_id);

            if still_dj {
                if let Err(e) = dj.remove_locked(&room_handle, DjReason::Timeout).await {
                    warn!("Failed to remove DJ {user_id} after grace period: {e}");
                }
            }
        });

        room.arm_grace(user_id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestCollab;
    use futures_util::StreamExt;
    use jukebox_core::Config;

    #[tokio::test]
    async fn test_attach_delivers_the_snapshot_first() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(1).await;

        let mut subscription = collab
            .controller
            .attach(&room, users[1].id, jukebox_core::ConnectionId::new())
            .await
            .unwrap();

        // A mutation lands right after the attach.
        harness.submit(&room, users[0].id).await;

        let first = subscription.next().await.unwrap();
        assert!(
            matches!(first, RoomEvent::State(_)),
            "the snapshot precedes every delta"
        );

        let second = subscription.next().await.unwrap();
        assert!(matches!(second, RoomEvent::QueueUpdated { .. }));
    }

    #[tokio::test]
    async fn test_attach_requires_membership() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, _) = harness.room_with_members(0).await;
        let outsider = harness.user("outsider").await;

        let result = collab
            .controller
            .attach(&room, outsider.id, jukebox_core::ConnectionId::new())
            .await;

        assert!(matches!(
            result,
            Err(CollabError::Room(RoomError::UserNotInRoom))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_contains_ongoing_playback() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(1).await;

        let entry = harness.submit(&room, users[0].id).await;
        collab
            .playback
            .start(&room, users[0].id, entry.id)
            .await
            .unwrap();

        let mut subscription = collab
            .controller
            .attach(&room, users[1].id, jukebox_core::ConnectionId::new())
            .await
            .unwrap();

        let Some(RoomEvent::State(snapshot)) = subscription.next().await else {
            panic!("expected the snapshot");
        };

        assert!(snapshot.playback.playing);

        let record = snapshot.playback.record.unwrap();
        assert_eq!(record.entry_id, entry.id);
        assert!(
            snapshot.playback.server_now_ms >= record.start_at_server_time - 2_000,
            "a joiner can compute its position from the snapshot"
        );
    }

    #[tokio::test]
    async fn test_owner_leave_transfers_ownership() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(2).await;

        let outcome = collab.controller.leave(&room, users[0].id).await.unwrap();

        assert_eq!(
            outcome.new_owner,
            Some(users[1].id),
            "the earliest-joined member inherits the room"
        );
        assert!(!outcome.deactivated);
        assert!(room.is_owner(users[1].id));
    }

    #[tokio::test]
    async fn test_leaving_dj_owner_clears_the_slot() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(1).await;

        collab
            .dj
            .set_by_owner(&room, users[0].id, users[0].id)
            .await
            .unwrap();

        let entry = harness.submit(&room, users[1].id).await;
        collab
            .playback
            .start(&room, users[0].id, entry.id)
            .await
            .unwrap();

        collab.controller.leave(&room, users[0].id).await.unwrap();

        assert!(collab.dj.current_dj(&room).await.unwrap().is_none());
        assert!(!collab.playback.snapshot(&room).await.unwrap().playing);

        let history = collab.context.database.dj_history(room.id()).await.unwrap();
        assert_eq!(history[0].reason.as_deref(), Some("voluntary"));
    }

    #[tokio::test]
    async fn test_last_leave_deactivates_the_room() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(0).await;
        let code = room.data().code;

        let outcome = collab.controller.leave(&room, users[0].id).await.unwrap();

        assert!(outcome.deactivated);
        assert!(!room.is_active());
        assert!(collab.rooms.room_by_code(&code).is_err());
    }

    #[tokio::test]
    async fn test_mutiny_target_departure_cancels_the_vote() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(2).await;

        collab
            .dj
            .set_by_owner(&room, users[0].id, users[1].id)
            .await
            .unwrap();

        collab.votes.open_mutiny(&room, users[2].id).await.unwrap();

        collab.controller.leave(&room, users[1].id).await.unwrap();

        assert!(
            collab.votes.pending(&room).await.unwrap().is_none(),
            "the session died with its target"
        );
    }

    #[tokio::test]
    async fn test_dj_disconnect_grace_removal() {
        let config = Config {
            dj_grace_ms: 40,
            ..Config::default()
        };

        let harness = TestCollab::with_config(config);
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(1).await;

        collab
            .dj
            .set_by_owner(&room, users[0].id, users[1].id)
            .await
            .unwrap();

        let connection = jukebox_core::ConnectionId::new();
        collab
            .controller
            .attach(&room, users[1].id, connection)
            .await
            .unwrap();

        collab.controller.detach(&room, users[1].id, connection).await;

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;

        assert!(
            collab.dj.current_dj(&room).await.unwrap().is_none(),
            "the slot clears after the grace period"
        );

        let history = collab.context.database.dj_history(room.id()).await.unwrap();
        assert_eq!(history[0].reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_reconnect_disarms_the_grace_timer() {
        let config = Config {
            dj_grace_ms: 80,
            ..Config::default()
        };

        let harness = TestCollab::with_config(config);
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(1).await;

        collab
            .dj
            .set_by_owner(&room, users[0].id, users[1].id)
            .await
            .unwrap();

        let connection = jukebox_core::ConnectionId::new();
        collab
            .controller
            .attach(&room, users[1].id, connection)
            .await
            .unwrap();

        collab.controller.detach(&room, users[1].id, connection).await;

        // The DJ comes back before the grace elapses.
        collab
            .controller
            .attach(&room, users[1].id, jukebox_core::ConnectionId::new())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(160)).await;

        assert!(
            collab.dj.current_dj(&room).await.unwrap().is_some(),
            "a reconnected DJ keeps the slot"
        );
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(1).await;

        let mut subscription = collab
            .controller
            .attach(&room, users[1].id, jukebox_core::ConnectionId::new())
            .await
            .unwrap();

        // Skip the snapshot.
        subscription.next().await;

        collab
            .controller
            .dispatch(
                &room,
                users[0].id,
                ClientMessage::ChatSend {
                    body: "tune!".to_string(),
                },
            )
            .await
            .unwrap();

        let Some(RoomEvent::ChatMessage { message, author, .. }) = subscription.next().await
        else {
            panic!("expected the chat relay");
        };

        assert_eq!(message.body, "tune!");
        assert_eq!(author.id, users[0].id);

        let result = collab
            .controller
            .chat(&room, users[0].id, "  ".to_string())
            .await;

        assert!(matches!(result, Err(CollabError::InvalidMessage(_))));
    }
}
