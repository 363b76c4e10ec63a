use std::sync::Arc;
use std::time::Duration;

use log::info;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jukebox_core::{now_ms, StateStore, StateStoreExt, StoreError};

use crate::{
    events::RoomEvent, CollabContext, DatabaseError, DjReason, MemberRole, PlaybackCoordinator,
    PlaybackError, PrimaryKey, Room, RoomError, RoomMemberData,
};

/// Narrow handle on a room's DJ slot, the hottest per-room key. Every write
/// goes through compare-and-swap so transitions are single-flight even across
/// backend instances.
#[derive(Clone)]
pub struct DjSlot {
    store: Arc<dyn StateStore>,
}

/// Who currently holds a room's DJ slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DjSlotValue {
    pub user_id: PrimaryKey,
    pub since_ms: i64,
}

#[derive(Debug, Error)]
pub enum DjError {
    #[error("Only the room owner may assign the DJ")]
    NotOwner,
    #[error("Only the room owner or the DJ may do this")]
    NotAllowed,
    #[error("Target user is not a member of this room")]
    TargetNotInRoom,
    #[error("Candidate was recently removed by mutiny and is on cooldown")]
    OnCooldown,
    #[error("The DJ slot changed concurrently")]
    SlotContention,
    #[error(transparent)]
    Room(RoomError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Database(DatabaseError),
    #[error(transparent)]
    Playback(PlaybackError),
}

impl DjSlot {
    pub fn new(store: &Arc<dyn StateStore>) -> Self {
        Self {
            store: store.clone(),
        }
    }

    fn key(room_id: PrimaryKey) -> String {
        format!("room:{room_id}:dj")
    }

    pub async fn current(&self, room_id: PrimaryKey) -> Result<Option<DjSlotValue>, StoreError> {
        self.store.get_as(&Self::key(room_id)).await
    }

    async fn swap(
        &self,
        room_id: PrimaryKey,
        expected: Option<DjSlotValue>,
        next: Option<DjSlotValue>,
    ) -> Result<bool, StoreError> {
        let encode = |value: Option<DjSlotValue>| {
            value
                .map(|v| serde_json::to_value(v).expect("slot value serializes"))
        };

        self.store
            .compare_and_swap(&Self::key(room_id), encode(expected), encode(next), None)
            .await
    }
}

/// Assigns and removes the DJ role, enforcing who may act and keeping the
/// membership roles, audit history, and transient slot in step.
pub struct DjStateMachine {
    context: CollabContext,
    playback: Arc<PlaybackCoordinator>,
    slot: DjSlot,
}

impl DjStateMachine {
    pub fn new(
        context: &CollabContext,
        playback: Arc<PlaybackCoordinator>,
        slot: DjSlot,
    ) -> Self {
        Self {
            context: context.clone(),
            playback,
            slot,
        }
    }

    /// Who currently holds the slot. Critical read: store failures propagate.
    pub async fn current_dj(&self, room: &Arc<Room>) -> Result<Option<DjSlotValue>, DjError> {
        self.slot.current(room.id()).await.map_err(DjError::Store)
    }

    /// Owner-only direct assignment of the slot.
    pub async fn set_by_owner(
        &self,
        room: &Arc<Room>,
        actor: PrimaryKey,
        target: PrimaryKey,
    ) -> Result<RoomMemberData, DjError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(DjError::Room)?;

        if !room.is_owner(actor) {
            return Err(DjError::NotOwner);
        }

        let member = room
            .member_by_user_id(target)
            .map_err(|_| DjError::TargetNotInRoom)?;

        self.cooldown_check(room, target).await?;
        self.transition_locked(room, Some(member.clone()), DjReason::OwnerSet)
            .await?;

        Ok(member)
    }

    /// Assignment decided by a finished election. The vote engine holds the
    /// room lock when calling this.
    pub(crate) async fn set_by_vote_locked(
        &self,
        room: &Arc<Room>,
        target: PrimaryKey,
    ) -> Result<RoomMemberData, DjError> {
        let member = room
            .member_by_user_id(target)
            .map_err(|_| DjError::TargetNotInRoom)?;

        self.cooldown_check(room, target).await?;
        self.transition_locked(room, Some(member.clone()), DjReason::Vote)
            .await?;

        Ok(member)
    }

    /// Hands the slot to a member picked uniformly at random, excluding the
    /// current DJ when other candidates exist. With no other candidate the
    /// call is a no-op returning the incumbent.
    pub async fn randomize(
        &self,
        room: &Arc<Room>,
        actor: PrimaryKey,
    ) -> Result<RoomMemberData, DjError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(DjError::Room)?;

        let current = self.slot.current(room.id()).await.map_err(DjError::Store)?;
        let is_dj = current.is_some_and(|dj| dj.user_id == actor);

        if !room.is_owner(actor) && !is_dj {
            return Err(DjError::NotAllowed);
        }

        let picked = self
            .pick_random_locked(room, current.map(|dj| dj.user_id))
            .await?;

        match picked {
            Some(member) => {
                self.transition_locked(room, Some(member.clone()), DjReason::Randomize)
                    .await?;

                Ok(member)
            }
            None => {
                // Only the incumbent remains as a candidate.
                let incumbent = current
                    .and_then(|dj| room.member_by_user_id(dj.user_id).ok())
                    .ok_or(DjError::TargetNotInRoom)?;

                Ok(incumbent)
            }
        }
    }

    /// Clears the slot. Stops playback when nobody takes over, and refills
    /// the slot randomly when the room asks for that.
    pub(crate) async fn remove_locked(
        &self,
        room: &Arc<Room>,
        reason: DjReason,
    ) -> Result<(), DjError> {
        let removed = self.slot.current(room.id()).await.map_err(DjError::Store)?;

        if removed.is_none() {
            return Ok(());
        }

        self.transition_locked(room, None, reason).await?;

        let successor = if room.settings().auto_randomize_dj {
            self.pick_random_locked(room, removed.map(|dj| dj.user_id))
                .await?
        } else {
            None
        };

        match successor {
            Some(member) => {
                self.transition_locked(room, Some(member), DjReason::Randomize)
                    .await?;
            }
            None => {
                self.playback
                    .stop_locked(room)
                    .await
                    .map_err(DjError::Playback)?;
            }
        }

        Ok(())
    }

    /// Rejects a candidate that was mutinied off within the room's cooldown.
    pub async fn cooldown_check(
        &self,
        room: &Arc<Room>,
        candidate: PrimaryKey,
    ) -> Result<(), DjError> {
        let on_cooldown: Option<bool> = self
            .context
            .store
            .get_as(&cooldown_key(room.id(), candidate))
            .await
            .map_err(DjError::Store)?;

        if on_cooldown.unwrap_or(false) {
            return Err(DjError::OnCooldown);
        }

        Ok(())
    }

    /// The single place the slot flips. Swaps the store value, updates both
    /// membership roles, writes the audit rows, and broadcasts the change.
    /// The caller must hold the room lock.
    async fn transition_locked(
        &self,
        room: &Arc<Room>,
        new_dj: Option<RoomMemberData>,
        reason: DjReason,
    ) -> Result<(), DjError> {
        let previous = self.slot.current(room.id()).await.map_err(DjError::Store)?;

        if previous.map(|dj| dj.user_id) == new_dj.as_ref().map(|m| m.user.id) {
            return Ok(());
        }

        let next = new_dj.as_ref().map(|m| DjSlotValue {
            user_id: m.user.id,
            since_ms: now_ms(),
        });

        let swapped = self
            .slot
            .swap(room.id(), previous, next)
            .await
            .map_err(DjError::Store)?;

        if !swapped {
            return Err(DjError::SlotContention);
        }

        if let Some(previous) = previous {
            self.context
                .database
                .update_member_role(room.id(), previous.user_id, MemberRole::Listener)
                .await
                .map_err(DjError::Database)?;

            room.set_member_role(previous.user_id, MemberRole::Listener);

            self.context
                .database
                .close_dj_tenure(room.id(), previous.user_id, reason)
                .await
                .map_err(DjError::Database)?;

            if reason == DjReason::Mutiny {
                self.start_cooldown(room, previous.user_id).await?;
            }
        }

        match new_dj {
            Some(member) => {
                self.context
                    .database
                    .update_member_role(room.id(), member.user.id, MemberRole::Dj)
                    .await
                    .map_err(DjError::Database)?;

                room.set_member_role(member.user.id, MemberRole::Dj);

                self.context
                    .database
                    .open_dj_tenure(room.id(), member.user.id)
                    .await
                    .map_err(DjError::Database)?;

                info!(
                    "{} is now the DJ of room {}",
                    member.user.display_name,
                    room.data().name
                );

                let mut updated = member.clone();
                updated.role = MemberRole::Dj;

                self.context.emit(
                    room.id(),
                    RoomEvent::DjChanged {
                        room_id: room.id(),
                        new_dj: updated,
                    },
                );
            }
            None => {
                info!("Room {} no longer has a DJ ({reason:?})", room.data().name);

                self.context.emit(
                    room.id(),
                    RoomEvent::DjRemoved {
                        room_id: room.id(),
                        reason,
                    },
                );
            }
        }

        Ok(())
    }

    /// Picks a random eligible member: not the excluded user, not on
    /// cooldown.
    async fn pick_random_locked(
        &self,
        room: &Arc<Room>,
        excluding: Option<PrimaryKey>,
    ) -> Result<Option<RoomMemberData>, DjError> {
        let mut candidates = vec![];

        for member in room.members() {
            if Some(member.user.id) == excluding {
                continue;
            }

            if self.cooldown_check(room, member.user.id).await.is_ok() {
                candidates.push(member);
            }
        }

        Ok(candidates.choose(&mut rand::thread_rng()).cloned())
    }

    async fn start_cooldown(&self, room: &Arc<Room>, user_id: PrimaryKey) -> Result<(), DjError> {
        let minutes = room.settings().dj_cooldown_minutes;

        if minutes == 0 {
            return Ok(());
        }

        self.context
            .store
            .put_as(
                &cooldown_key(room.id(), user_id),
                &true,
                Some(Duration::from_secs(minutes as u64 * 60)),
            )
            .await
            .map_err(DjError::Store)
    }
}

fn cooldown_key(room_id: PrimaryKey, user_id: PrimaryKey) -> String {
    format!("room:{room_id}:dj_cooldown:{user_id}")
}
