use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::{
    events::{EntryRemovalReason, RoomEvent},
    CollabContext, DatabaseError, InputError, MediaResolver, NewSubmission, PlaybackSlot,
    PrimaryKey, Room, RoomError, SubmissionData,
};

use jukebox_core::StoreError;

/// The voted queue: holds submissions, aggregates votes, and selects what
/// plays next.
pub struct QueueEngine {
    context: CollabContext,
    resolver: Arc<MediaResolver>,
    playback: PlaybackSlot,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue entry does not exist")]
    EntryNotFound,
    #[error("Submitters cannot vote on their own entry")]
    OwnVote,
    #[error("Only the submitter or the room owner can remove an entry")]
    NotAllowed,
    #[error(transparent)]
    Room(RoomError),
    #[error(transparent)]
    Input(InputError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Database(DatabaseError),
}

/// A queue entry with the caller's own ballot resolved
#[derive(Debug, Clone)]
pub struct QueueEntryView {
    pub submission: SubmissionData,
    pub user_vote: Option<i32>,
}

impl QueueEngine {
    pub fn new(context: &CollabContext, resolver: Arc<MediaResolver>, playback: PlaybackSlot) -> Self {
        Self {
            context: context.clone(),
            resolver,
            playback,
        }
    }

    /// Submits a URL to the room's queue. The metadata lookup happens before
    /// the room lock is taken, so a slow upstream never stalls the room.
    pub async fn submit(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
        url: &str,
    ) -> Result<SubmissionData, QueueError> {
        let metadata = self
            .resolver
            .resolve_media(url)
            .await
            .map_err(QueueError::Input)?;

        let _guard = room.lock().await;
        room.ensure_active().map_err(QueueError::Room)?;

        let submission = self
            .context
            .database
            .create_submission(NewSubmission {
                room_id: room.id(),
                user_id,
                video_id: metadata.video_id,
                url: url.to_string(),
                title: metadata.title,
                channel: metadata.channel,
                thumbnail: metadata.thumbnail,
                duration_seconds: metadata.duration_seconds,
            })
            .await
            .map_err(QueueError::Database)?;

        room.upsert_submission(submission.clone());

        info!(
            "Queued \"{}\" in room {}",
            submission.title,
            room.data().name
        );

        self.broadcast_queue(room).await?;

        Ok(submission)
    }

    /// Casts, flips, or clears a ballot on an entry. Same-polarity repeats
    /// are no-ops on the counts.
    pub async fn vote(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
        entry_id: PrimaryKey,
        vote: Option<i32>,
    ) -> Result<SubmissionData, QueueError> {
        let _guard = room.lock().await;
        room.ensure_active().map_err(QueueError::Room)?;

        let entry = room
            .submission_by_id(entry_id)
            .ok_or(QueueError::EntryNotFound)?;

        if entry.user_id == Some(user_id) {
            return Err(QueueError::OwnVote);
        }

        let updated = self
            .context
            .database
            .apply_submission_vote(entry_id, user_id, vote)
            .await
            .map_err(QueueError::Database)?;

        room.upsert_submission(updated.clone());

        let threshold = self.context.config.queue_autoremove_threshold;

        if threshold.is_some_and(|t| updated.net_score() <= t) {
            self.context
                .database
                .delete_submission(entry_id)
                .await
                .map_err(QueueError::Database)?;

            room.remove_submission(entry_id);

            self.broadcast_removal(room, entry_id, EntryRemovalReason::Downvoted)
                .await?;
        } else {
            self.broadcast_queue(room).await?;
        }

        Ok(updated)
    }

    /// Removes an unplayed entry; allowed for its submitter and the owner.
    pub async fn remove(
        &self,
        room: &Arc<Room>,
        actor: PrimaryKey,
        entry_id: PrimaryKey,
    ) -> Result<(), QueueError> {
        let _guard = room.lock().await;
        room.ensure_active().map_err(QueueError::Room)?;

        let entry = room
            .submission_by_id(entry_id)
            .ok_or(QueueError::EntryNotFound)?;

        if entry.user_id != Some(actor) && !room.is_owner(actor) {
            return Err(QueueError::NotAllowed);
        }

        self.context
            .database
            .delete_submission(entry_id)
            .await
            .map_err(QueueError::Database)?;

        room.remove_submission(entry_id);

        self.broadcast_removal(room, entry_id, EntryRemovalReason::Requested)
            .await
    }

    /// Returns the room's queue ordered for playback, with the caller's own
    /// ballots resolved.
    pub async fn list(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
    ) -> Result<Vec<QueueEntryView>, QueueError> {
        let entries = ordered(room.submissions());
        let mut views = Vec::with_capacity(entries.len());

        for submission in entries {
            let user_vote = self
                .context
                .database
                .submission_vote(submission.id, user_id)
                .await
                .map_err(QueueError::Database)?;

            views.push(QueueEntryView {
                submission,
                user_vote,
            });
        }

        Ok(views)
    }

    /// Selects the highest-scored unplayed entry, marks it played, and
    /// returns it. The caller must hold the room lock.
    pub async fn pop_next_locked(
        &self,
        room: &Arc<Room>,
    ) -> Result<Option<SubmissionData>, QueueError> {
        let next = ordered(room.submissions()).into_iter().next();

        let Some(next) = next else {
            return Ok(None);
        };

        self.mark_played_locked(room, next.id).await?;

        Ok(Some(next))
    }

    /// Freezes an entry: marks it played and drops it from the live queue.
    /// The caller must hold the room lock.
    pub async fn mark_played_locked(
        &self,
        room: &Arc<Room>,
        entry_id: PrimaryKey,
    ) -> Result<(), QueueError> {
        self.context
            .database
            .mark_submission_played(entry_id)
            .await
            .map_err(QueueError::Database)?;

        room.remove_submission(entry_id);

        Ok(())
    }

    /// Builds the queue:updated event for the room's current queue. The
    /// caller must hold the room lock.
    pub async fn updated_event_locked(&self, room: &Arc<Room>) -> Result<RoomEvent, QueueError> {
        let currently_playing = self
            .playback
            .current(room.id())
            .await
            .map_err(QueueError::Store)?
            .map(|record| record.entry_id);

        Ok(RoomEvent::QueueUpdated {
            room_id: room.id(),
            entries: ordered(room.submissions()),
            currently_playing,
        })
    }

    async fn broadcast_queue(&self, room: &Arc<Room>) -> Result<(), QueueError> {
        let event = self.updated_event_locked(room).await?;
        self.context.emit(room.id(), event);

        Ok(())
    }

    async fn broadcast_removal(
        &self,
        room: &Arc<Room>,
        entry_id: PrimaryKey,
        reason: EntryRemovalReason,
    ) -> Result<(), QueueError> {
        let updated = self.updated_event_locked(room).await?;

        self.context.emit_all(
            room.id(),
            vec![
                RoomEvent::QueueEntryRemoved {
                    room_id: room.id(),
                    entry_id,
                    reason,
                },
                updated,
            ],
        );

        Ok(())
    }
}

/// Net score descending, ties broken by earlier submission
fn ordered(mut entries: Vec<SubmissionData>) -> Vec<SubmissionData> {
    entries.sort_by(|a, b| {
        b.net_score()
            .cmp(&a.net_score())
            .then(a.created_at.cmp(&b.created_at))
    });

    entries
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::testutil::TestCollab;
    use futures_util::StreamExt;
    use jukebox_core::Config;

    #[tokio::test]
    async fn test_submitters_cannot_vote_on_their_own_entry() {
        let harness = TestCollab::new();
        let (room, users) = harness.room_with_members(1).await;

        let entry = harness.submit(&room, users[0].id).await;

        let result = harness
            .collab
            .queue
            .vote(&room, users[0].id, entry.id, Some(1))
            .await;

        assert!(matches!(result, Err(QueueError::OwnVote)));
    }

    #[tokio::test]
    async fn test_vote_polarity_rules() {
        let harness = TestCollab::new();
        let collab = &harness.collab;
        let (room, users) = harness.room_with_members(1).await;

        let entry = harness.submit(&room, users[0].id).await;
        let voter = users[1].id;

        let after = collab.queue.vote(&room, voter, entry.id, Some(1)).await.unwrap();
        assert_eq!((after.up_count, after.down_count), (1, 0));

        // Same polarity again is a no-op on the counts.
        let after = collab.queue.vote(&room, voter, entry.id, Some(1)).await.unwrap();
        assert_eq!((after.up_count, after.down_count), (1, 0));

        // The opposite polarity replaces the prior ballot.
        let after = collab.queue.vote(&room, voter, entry.id, Some(-1)).await.unwrap();
        assert_eq!((after.up_count, after.down_count), (0, 1));

        let after = collab.queue.vote(&room, voter, entry.id, None).await.unwrap();
        assert_eq!((after.up_count, after.down_count), (0, 0));
    }

    #[tokio::test]
    async fn test_list_resolves_the_callers_ballot() {
        let harness = TestCollab::new();
        let collab = &harness.collab;
        let (room, users) = harness.room_with_members(2).await;

        let entry = harness.submit(&room, users[0].id).await;

        collab
            .queue
            .vote(&room, users[1].id, entry.id, Some(-1))
            .await
            .unwrap();

        let listed = collab.queue.list(&room, users[1].id).await.unwrap();
        assert_eq!(listed[0].user_vote, Some(-1));

        let listed = collab.queue.list(&room, users[2].id).await.unwrap();
        assert_eq!(listed[0].user_vote, None);
    }

    #[tokio::test]
    async fn test_removal_authorization() {
        let harness = TestCollab::new();
        let collab = &harness.collab;
        let (room, users) = harness.room_with_members(2).await;

        let entry = harness.submit(&room, users[1].id).await;

        let result = collab.queue.remove(&room, users[2].id, entry.id).await;
        assert!(
            matches!(result, Err(QueueError::NotAllowed)),
            "an unrelated member cannot remove"
        );

        // The owner can remove anyone's entry.
        collab.queue.remove(&room, users[0].id, entry.id).await.unwrap();
        assert!(room.submission_by_id(entry.id).is_none());

        // The submitter can remove their own.
        let entry = harness.submit(&room, users[1].id).await;
        collab.queue.remove(&room, users[1].id, entry.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resubmitting_creates_a_distinct_entry() {
        let harness = TestCollab::new();
        let (room, users) = harness.room_with_members(0).await;

        let first = harness.submit(&room, users[0].id).await;
        let second = harness.submit(&room, users[0].id).await;

        assert_ne!(first.id, second.id, "no dedup is promised");
        assert_eq!(room.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_failure_creates_nothing() {
        let harness = TestCollab::new();
        let (room, users) = harness.room_with_members(0).await;

        let mut subscription = harness.collab.context.fabric.subscribe(&room.topic());

        let result = harness
            .collab
            .queue
            .submit(&room, users[0].id, "https://youtu.be/gone4040404")
            .await;

        assert!(matches!(
            result,
            Err(QueueError::Input(InputError::NotFound))
        ));

        assert!(room.submissions().is_empty(), "no submission is created");

        let pending = futures_util::poll!(subscription.next());
        assert!(pending.is_pending(), "nothing is broadcast");
    }

    #[tokio::test]
    async fn test_autoremoval_at_the_configured_threshold() {
        let config = Config {
            queue_autoremove_threshold: Some(-2),
            ..Config::default()
        };

        let harness = TestCollab::with_config(config);
        let collab = &harness.collab;
        let (room, users) = harness.room_with_members(2).await;

        let entry = harness.submit(&room, users[0].id).await;

        let mut subscription = collab.context.fabric.subscribe(&room.topic());

        collab
            .queue
            .vote(&room, users[1].id, entry.id, Some(-1))
            .await
            .unwrap();

        assert!(room.submission_by_id(entry.id).is_some());

        collab
            .queue
            .vote(&room, users[2].id, entry.id, Some(-1))
            .await
            .unwrap();

        assert!(
            room.submission_by_id(entry.id).is_none(),
            "the entry is dropped at the threshold"
        );

        // queue:updated for the first downvote, then the removal pair.
        subscription.next().await;

        let Some(RoomEvent::QueueEntryRemoved { reason, .. }) = subscription.next().await else {
            panic!("expected the removal event");
        };

        assert_eq!(reason, EntryRemovalReason::Downvoted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn submission(id: PrimaryKey, up: i32, down: i32, age_secs: i64) -> SubmissionData {
        SubmissionData {
            id,
            room_id: 1,
            user_id: Some(1),
            video_id: "dQw4w9WgXcQ".to_string(),
            url: "https://youtu.be/dQw4w9WgXcQ".to_string(),
            title: format!("Track {id}"),
            channel: "Channel".to_string(),
            thumbnail: None,
            duration_seconds: 180,
            up_count: up,
            down_count: down,
            played: false,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_ordering_by_score_then_age() {
        let entries = vec![
            submission(1, 1, 0, 30),
            submission(2, 3, 1, 10),
            submission(3, 2, 0, 20),
            submission(4, 5, 3, 40),
        ];

        let ordered: Vec<_> = ordered(entries).into_iter().map(|s| s.id).collect();

        // 2, 3 and 4 all have net score 2; the oldest submission wins the tie.
        assert_eq!(ordered, vec![4, 3, 2, 1]);
    }
}
