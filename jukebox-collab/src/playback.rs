use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jukebox_core::{now_ms, StateStoreExt, StoreError};

use crate::{
    events::RoomEvent, CollabContext, DjSlot, PrimaryKey, QueueEngine, QueueError, Room, RoomError,
    SubmissionData,
};

/// Narrow handle on a room's active playback record, the second of the two
/// hot per-room keys. Other components observe playback through this, never
/// through the raw store key.
#[derive(Clone)]
pub struct PlaybackSlot {
    store: Arc<dyn jukebox_core::StateStore>,
}

/// The at-most-one active playback record of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRecord {
    pub entry_id: PrimaryKey,
    pub video_id: String,
    pub title: String,
    pub duration_seconds: i32,
    pub started_by: PrimaryKey,
    /// The wall-clock instant every client starts the track at, in ms
    pub start_at_server_time: i64,
    pub is_playing: bool,
}

/// What a reconnecting client needs to seek into ongoing playback.
///
/// Clients compute their position as
/// `max(0, now_in_server_time - start_at_server_time)` and treat positions
/// past the duration as an already-ended track.
#[derive(Debug, Clone)]
pub struct PlaybackSnapshot {
    pub playing: bool,
    pub record: Option<PlaybackRecord>,
    pub server_now_ms: i64,
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Only the DJ can drive playback")]
    NotDriver,
    #[error("Queue entry does not exist")]
    EntryNotFound,
    #[error("Nothing is playing")]
    NothingPlaying,
    #[error(transparent)]
    Room(RoomError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Queue(QueueError),
}

/// Schedules synchronized playback starts and tracks what is currently
/// playing in each room.
pub struct PlaybackCoordinator {
    context: CollabContext,
    queue: Arc<QueueEngine>,
    dj: DjSlot,
    slot: PlaybackSlot,
}

impl PlaybackSlot {
    pub fn new(store: &Arc<dyn jukebox_core::StateStore>) -> Self {
        Self {
            store: store.clone(),
        }
    }

    fn key(room_id: PrimaryKey) -> String {
        format!("room:{room_id}:playback")
    }

    pub async fn current(&self, room_id: PrimaryKey) -> Result<Option<PlaybackRecord>, StoreError> {
        self.store.get_as(&Self::key(room_id)).await
    }

    pub async fn put(&self, room_id: PrimaryKey, record: &PlaybackRecord) -> Result<(), StoreError> {
        self.store.put_as(&Self::key(room_id), record, None).await
    }

    pub async fn clear(&self, room_id: PrimaryKey) -> Result<(), StoreError> {
        self.store.remove(&Self::key(room_id)).await
    }
}

impl PlaybackCoordinator {
    /// The RTT percentile the start lead is sized against
    const RTT_PERCENTILE: f64 = 0.95;
    /// How many round-trips of margin the slowest member gets
    const LEAD_RTT_FACTOR: u64 = 3;

    pub fn new(
        context: &CollabContext,
        queue: Arc<QueueEngine>,
        dj: DjSlot,
        slot: PlaybackSlot,
    ) -> Self {
        Self {
            context: context.clone(),
            queue,
            dj,
            slot,
        }
    }

    /// Schedules a queue entry to start at a single wall-clock instant.
    /// A start over an already-playing session replaces it.
    pub async fn start(
        &self,
        room: &Arc<Room>,
        actor: PrimaryKey,
        entry_id: PrimaryKey,
    ) -> Result<PlaybackRecord, PlaybackError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(PlaybackError::Room)?;
        self.authorize_driver(room, actor).await?;

        let entry = room
            .submission_by_id(entry_id)
            .ok_or(PlaybackError::EntryNotFound)?;

        self.start_locked(room, actor, entry).await
    }

    /// Clears the playing flag without discarding the record.
    pub async fn pause(&self, room: &Arc<Room>, actor: PrimaryKey) -> Result<(), PlaybackError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(PlaybackError::Room)?;
        self.authorize_driver(room, actor).await?;

        let mut record = self
            .slot
            .current(room.id())
            .await
            .map_err(PlaybackError::Store)?
            .ok_or(PlaybackError::NothingPlaying)?;

        record.is_playing = false;

        self.slot
            .put(room.id(), &record)
            .await
            .map_err(PlaybackError::Store)?;

        self.context
            .emit(room.id(), RoomEvent::PlaybackPaused { room_id: room.id() });

        Ok(())
    }

    /// Ends the current playback session.
    pub async fn stop(&self, room: &Arc<Room>, actor: PrimaryKey) -> Result<(), PlaybackError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(PlaybackError::Room)?;
        self.authorize_driver(room, actor).await?;

        let stopped = self.stop_locked(room).await?;

        if stopped {
            Ok(())
        } else {
            Err(PlaybackError::NothingPlaying)
        }
    }

    /// The DJ's report that the track finished. Closes the session and
    /// auto-starts the highest-voted entry, if any. A report for a track
    /// that is not currently playing is ignored.
    pub async fn report_ended(
        &self,
        room: &Arc<Room>,
        actor: PrimaryKey,
        entry_id: PrimaryKey,
    ) -> Result<Option<PlaybackRecord>, PlaybackError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(PlaybackError::Room)?;
        self.authorize_driver(room, actor).await?;

        let current = self
            .slot
            .current(room.id())
            .await
            .map_err(PlaybackError::Store)?;

        let Some(ended) = current.filter(|r| r.entry_id == entry_id) else {
            return Ok(None);
        };

        self.slot
            .clear(room.id())
            .await
            .map_err(PlaybackError::Store)?;

        let next = self
            .queue
            .pop_next_locked(room)
            .await
            .map_err(PlaybackError::Queue)?;

        match next {
            Some(next) => {
                let record = self.start_locked(room, ended.started_by, next).await?;
                Ok(Some(record))
            }
            None => {
                self.context
                    .emit(room.id(), RoomEvent::PlaybackStopped { room_id: room.id() });

                Ok(None)
            }
        }
    }

    /// The reconnect snapshot. Does not take the room lock.
    pub async fn snapshot(&self, room: &Arc<Room>) -> Result<PlaybackSnapshot, PlaybackError> {
        let record = self
            .slot
            .current(room.id())
            .await
            .map_err(PlaybackError::Store)?
            .filter(|r| r.is_playing);

        Ok(PlaybackSnapshot {
            playing: record.is_some(),
            record,
            server_now_ms: now_ms(),
        })
    }

    /// Schedules the given entry. The caller must hold the room lock and have
    /// authorized the actor.
    pub(crate) async fn start_locked(
        &self,
        room: &Arc<Room>,
        started_by: PrimaryKey,
        entry: SubmissionData,
    ) -> Result<PlaybackRecord, PlaybackError> {
        let lead_ms = self.lead_ms(room).await;

        let record = PlaybackRecord {
            entry_id: entry.id,
            video_id: entry.video_id.clone(),
            title: entry.title.clone(),
            duration_seconds: entry.duration_seconds,
            started_by,
            start_at_server_time: now_ms() + lead_ms as i64,
            is_playing: true,
        };

        self.slot
            .put(room.id(), &record)
            .await
            .map_err(PlaybackError::Store)?;

        // Selection for playback freezes the entry's score.
        self.queue
            .mark_played_locked(room, entry.id)
            .await
            .map_err(PlaybackError::Queue)?;

        let queue_event = self
            .queue
            .updated_event_locked(room)
            .await
            .map_err(PlaybackError::Queue)?;

        info!(
            "Playing \"{}\" in room {} with a lead of {lead_ms}ms",
            entry.title,
            room.data().name
        );

        self.context.emit_all(
            room.id(),
            vec![
                RoomEvent::PlaybackStarted {
                    room_id: room.id(),
                    playback: record.clone(),
                    server_now_ms: now_ms(),
                },
                queue_event,
            ],
        );

        Ok(record)
    }

    /// Clears the record if one exists, broadcasting the stop. The caller
    /// must hold the room lock. Returns whether anything was stopped.
    pub(crate) async fn stop_locked(&self, room: &Arc<Room>) -> Result<bool, PlaybackError> {
        let current = self
            .slot
            .current(room.id())
            .await
            .map_err(PlaybackError::Store)?;

        if current.is_none() {
            return Ok(false);
        }

        self.slot
            .clear(room.id())
            .await
            .map_err(PlaybackError::Store)?;

        self.context
            .emit(room.id(), RoomEvent::PlaybackStopped { room_id: room.id() });

        Ok(true)
    }

    /// Picks the start lead so the slowest eligible member can still begin on
    /// time: at least the configured minimum, three observed round-trips for
    /// the 95th-percentile member, and never more than the maximum.
    async fn lead_ms(&self, room: &Arc<Room>) -> u64 {
        let p95 = self
            .context
            .sync
            .rtt_percentile(&room.connection_ids(), Self::RTT_PERCENTILE)
            .await;

        let raw = p95.map(|rtt| rtt * Self::LEAD_RTT_FACTOR).unwrap_or(0);

        self.context.config.clamp_lead(raw)
    }

    /// The DJ may act; absent a DJ, the owner may.
    async fn authorize_driver(
        &self,
        room: &Arc<Room>,
        actor: PrimaryKey,
    ) -> Result<(), PlaybackError> {
        let dj = self
            .dj
            .current(room.id())
            .await
            .map_err(PlaybackError::Store)?;

        match dj {
            Some(slot) if slot.user_id == actor => Ok(()),
            None if room.is_owner(actor) => Ok(()),
            _ => Err(PlaybackError::NotDriver),
        }
    }
}
