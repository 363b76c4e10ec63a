mod room;

use std::sync::Arc;

use argon2::{
    password_hash::{Encoding, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use log::info;
use rand::rngs::OsRng;
use thiserror::Error;
use uuid::Uuid;

pub use room::*;

use crate::{
    util::room_code, CollabContext, DatabaseError, NewRoom, NewRoomMember, PrimaryKey,
    RoomMemberData, RoomSettings,
};

/// How many code collisions are tolerated before giving up
const CODE_ATTEMPTS: usize = 10;

pub struct RoomManager {
    context: CollabContext,
    argon: Argon2<'static>,
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {0} does not exist")]
    RoomNotFound(String),
    #[error("Room is not active")]
    RoomNotActive,
    #[error("Room is at member capacity")]
    RoomFull,
    #[error("Room password is incorrect")]
    WrongPassword,
    #[error("User is not a member of this room")]
    UserNotInRoom,
    #[error("User is already a member of this room")]
    AlreadyMember,
    #[error("Could not generate an unused room code")]
    CodeSpaceExhausted,
    #[error("Room settings are invalid: {0}")]
    InvalidSettings(String),
    #[error("Failed to hash password: {0}")]
    HashError(String),
    #[error(transparent)]
    Database(DatabaseError),
}

/// What a new room should look like, before hashing and code generation
#[derive(Debug)]
pub struct NewRoomParams {
    pub name: String,
    pub password: Option<String>,
    /// The creating user, who becomes owner and first member
    pub user_id: PrimaryKey,
    pub settings: Option<RoomSettings>,
}

/// What happened as a result of a member leaving
#[derive(Debug, Default)]
pub struct LeaveOutcome {
    /// Ownership moved to this user
    pub new_owner: Option<PrimaryKey>,
    /// The room emptied out and was deactivated
    pub deactivated: bool,
}

impl RoomManager {
    pub fn new(context: &CollabContext) -> Self {
        Self {
            context: context.clone(),
            argon: Argon2::default(),
        }
    }

    /// Restores the active rooms from the database on init
    pub async fn restore(&self) -> Result<(), DatabaseError> {
        let rooms = self.context.database.list_active_rooms().await?;

        for data in rooms {
            let members = self.context.database.room_members(data.id).await?;
            let submissions = self.context.database.unplayed_submissions(data.id).await?;

            let room = Arc::new(Room::new(&self.context, data, members));
            room.set_submissions(submissions);

            self.context.rooms.insert(room.id(), room);
        }

        info!("Restored {} active rooms", self.context.rooms.len());

        Ok(())
    }

    /// Creates a new room, its creator becoming owner and first member
    pub async fn create_room(&self, params: NewRoomParams) -> Result<Arc<Room>, RoomError> {
        let settings = params
            .settings
            .unwrap_or_else(|| self.context.default_settings());

        validate_settings(&settings)?;

        let password = params
            .password
            .filter(|p| !p.is_empty())
            .map(|p| self.hash_password(&p))
            .transpose()?;

        let mut created = None;

        for _ in 0..CODE_ATTEMPTS {
            let result = self
                .context
                .database
                .create_room(NewRoom {
                    uuid: Uuid::new_v4(),
                    code: room_code(),
                    name: params.name.clone(),
                    password: password.clone(),
                    user_id: params.user_id,
                    settings: settings.clone(),
                })
                .await;

            match result {
                Ok(room) => {
                    created = Some(room);
                    break;
                }
                Err(DatabaseError::Conflict { .. }) => continue,
                Err(e) => return Err(RoomError::Database(e)),
            }
        }

        let data = created.ok_or(RoomError::CodeSpaceExhausted)?;

        let member = self
            .context
            .database
            .create_room_member(NewRoomMember {
                room_id: data.id,
                user_id: params.user_id,
                owner: true,
            })
            .await
            .map_err(RoomError::Database)?;

        info!("Room {} created with code {}", data.name, data.code);

        let room = Arc::new(Room::new(&self.context, data, vec![member]));
        self.context.rooms.insert(room.id(), room.clone());

        Ok(room)
    }

    /// Returns a room by id if it exists
    pub fn room_by_id(&self, room_id: RoomId) -> Result<Arc<Room>, RoomError> {
        self.context
            .rooms
            .get(&room_id)
            .map(|r| r.clone())
            .ok_or(RoomError::RoomNotFound(room_id.to_string()))
    }

    /// Returns an active room by its join code if it exists
    pub fn room_by_code(&self, code: &str) -> Result<Arc<Room>, RoomError> {
        self.context
            .rooms
            .iter()
            .find(|r| r.data().code == code && r.is_active())
            .map(|r| r.clone())
            .ok_or(RoomError::RoomNotFound(code.to_string()))
    }

    /// Get all active rooms in memory
    pub fn list_all(&self) -> Vec<Arc<Room>> {
        self.context
            .rooms
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.clone())
            .collect()
    }

    /// Adds a user to a room by its code
    pub async fn join_room(
        &self,
        user_id: PrimaryKey,
        code: &str,
        password: Option<&str>,
    ) -> Result<(Arc<Room>, RoomMemberData), RoomError> {
        let room = self.room_by_code(code)?;
        let _guard = room.lock().await;

        room.ensure_active()?;

        if room.member_by_user_id(user_id).is_ok() {
            return Err(RoomError::AlreadyMember);
        }

        if room.member_count() >= room.settings().max_members as usize {
            return Err(RoomError::RoomFull);
        }

        if let Some(hash) = room.data().password {
            let supplied = password.unwrap_or_default();
            self.verify_password(supplied, &hash)?;
        }

        let member = self
            .context
            .database
            .create_room_member(NewRoomMember {
                room_id: room.id(),
                user_id,
                owner: false,
            })
            .await
            .map_err(|e| match e {
                DatabaseError::Conflict { .. } => RoomError::AlreadyMember,
                e => RoomError::Database(e),
            })?;

        room.add_member(member.clone());

        info!(
            "User {} joined room {}",
            member.user.display_name,
            room.data().name
        );

        drop(_guard);
        Ok((room, member))
    }

    /// Removes a user's membership. Assumes the caller holds the room lock
    /// and has already dealt with the member's DJ role and open votes.
    ///
    /// Transfers ownership to the earliest-joined remaining member, and
    /// deactivates the room when nobody remains.
    pub async fn remove_member_locked(
        &self,
        room: &Arc<Room>,
        user_id: PrimaryKey,
    ) -> Result<LeaveOutcome, RoomError> {
        let member = room.member_by_user_id(user_id)?;
        let mut outcome = LeaveOutcome::default();

        self.context
            .database
            .delete_room_member(room.id(), user_id)
            .await
            .map_err(RoomError::Database)?;

        room.remove_member(user_id);

        if member.owner {
            let successor = room.earliest_joined_member(user_id);

            match successor {
                Some(successor) => {
                    self.context
                        .database
                        .update_member_ownership(room.id(), successor.user.id, true)
                        .await
                        .map_err(RoomError::Database)?;

                    self.context
                        .database
                        .set_room_owner(room.id(), Some(successor.user.id))
                        .await
                        .map_err(RoomError::Database)?;

                    room.set_owner(Some(successor.user.id));
                    outcome.new_owner = Some(successor.user.id);

                    self.context.emit(
                        room.id(),
                        crate::events::RoomEvent::OwnerChanged {
                            room_id: room.id(),
                            user_id: successor.user.id,
                        },
                    );
                }
                None => {
                    self.context
                        .database
                        .set_room_owner(room.id(), None)
                        .await
                        .map_err(RoomError::Database)?;

                    room.set_owner(None);
                }
            }
        }

        if room.member_count() == 0 {
            self.deactivate_locked(room).await?;
            outcome.deactivated = true;
        }

        Ok(outcome)
    }

    /// Marks the room inactive. Assumes the caller holds the room lock and
    /// has already torn down transient state.
    pub async fn deactivate_locked(&self, room: &Arc<Room>) -> Result<(), RoomError> {
        self.context
            .database
            .set_room_active(room.id(), false)
            .await
            .map_err(RoomError::Database)?;

        room.deactivate();
        info!("Room {} deactivated", room.data().name);

        Ok(())
    }

    /// Owner-only partial settings update
    pub async fn update_settings(
        &self,
        room: &Arc<Room>,
        settings: crate::UpdatedRoomSettings,
    ) -> Result<RoomSettings, RoomError> {
        let _guard = room.lock().await;

        let current = room.settings();

        let next = RoomSettings {
            max_members: settings.max_members.unwrap_or(current.max_members),
            mutiny_threshold: settings
                .mutiny_threshold
                .unwrap_or(current.mutiny_threshold),
            dj_cooldown_minutes: settings
                .dj_cooldown_minutes
                .unwrap_or(current.dj_cooldown_minutes),
            auto_randomize_dj: settings
                .auto_randomize_dj
                .unwrap_or(current.auto_randomize_dj),
        };

        validate_settings(&next)?;

        let updated = self
            .context
            .database
            .update_room_settings(room.id(), settings)
            .await
            .map_err(RoomError::Database)?;

        room.update_settings(updated.settings.clone());

        self.context.emit(
            room.id(),
            crate::events::RoomEvent::SettingsUpdated {
                room_id: room.id(),
                settings: updated.settings.clone(),
            },
        );

        Ok(updated.settings)
    }

    fn hash_password(&self, password: &str) -> Result<String, RoomError> {
        let salt = SaltString::generate(&mut OsRng);

        self.argon
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| RoomError::HashError(e.to_string()))
    }

    fn verify_password(&self, supplied: &str, hash: &str) -> Result<(), RoomError> {
        let parsed = PasswordHash::parse(hash, Encoding::default())
            .map_err(|e| RoomError::HashError(e.to_string()))?;

        self.argon
            .verify_password(supplied.as_bytes(), &parsed)
            .map_err(|_| RoomError::WrongPassword)
    }
}

fn validate_settings(settings: &RoomSettings) -> Result<(), RoomError> {
    if !(2..=100).contains(&settings.max_members) {
        return Err(RoomError::InvalidSettings(
            "max_members must be within 2..=100".to_string(),
        ));
    }

    if !(0.5..=1.0).contains(&settings.mutiny_threshold) {
        return Err(RoomError::InvalidSettings(
            "mutiny_threshold must be within 0.5..=1.0".to_string(),
        ));
    }

    if !(0..=60).contains(&settings.dj_cooldown_minutes) {
        return Err(RoomError::InvalidSettings(
            "dj_cooldown_minutes must be within 0..=60".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use crate::testutil::TestCollab;
    use crate::util::ROOM_CODE_ALPHABET;

    #[tokio::test]
    async fn test_create_room_shape() {
        let harness = TestCollab::new();
        let owner = harness.user("creator").await;

        let room = harness
            .collab
            .rooms
            .create_room(NewRoomParams {
                name: "Basement Set".to_string(),
                password: None,
                user_id: owner.id,
                settings: None,
            })
            .await
            .unwrap();

        let data = room.data();

        assert_eq!(data.code.len(), 6);
        assert!(data.code.chars().all(|c| ROOM_CODE_ALPHABET.contains(&c)));
        assert_eq!(data.owner_id, Some(owner.id));
        assert!(data.active);

        let member = room.member_by_user_id(owner.id).unwrap();
        assert!(member.owner, "the creator is owner and first member");
        assert_eq!(room.member_count(), 1);
    }

    #[tokio::test]
    async fn test_join_checks_capacity() {
        let harness = TestCollab::new();
        let owner = harness.user("cap-owner").await;

        let room = harness
            .collab
            .rooms
            .create_room(NewRoomParams {
                name: "Tiny".to_string(),
                password: None,
                user_id: owner.id,
                settings: Some(RoomSettings {
                    max_members: 2,
                    mutiny_threshold: 0.51,
                    dj_cooldown_minutes: 5,
                    auto_randomize_dj: false,
                }),
            })
            .await
            .unwrap();

        let code = room.data().code;

        let second = harness.user("cap-second").await;
        harness
            .collab
            .rooms
            .join_room(second.id, &code, None)
            .await
            .unwrap();

        let third = harness.user("cap-third").await;
        let result = harness.collab.rooms.join_room(third.id, &code, None).await;

        assert!(matches!(result, Err(RoomError::RoomFull)));
    }

    #[tokio::test]
    async fn test_join_checks_password() {
        let harness = TestCollab::new();
        let owner = harness.user("pw-owner").await;

        let room = harness
            .collab
            .rooms
            .create_room(NewRoomParams {
                name: "Secret Set".to_string(),
                password: Some("hunter2".to_string()),
                user_id: owner.id,
                settings: None,
            })
            .await
            .unwrap();

        let code = room.data().code;
        let joiner = harness.user("pw-joiner").await;

        let result = harness
            .collab
            .rooms
            .join_room(joiner.id, &code, Some("wrong"))
            .await;
        assert!(matches!(result, Err(RoomError::WrongPassword)));

        let result = harness.collab.rooms.join_room(joiner.id, &code, None).await;
        assert!(matches!(result, Err(RoomError::WrongPassword)));

        harness
            .collab
            .rooms
            .join_room(joiner.id, &code, Some("hunter2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_double_join_conflicts() {
        let harness = TestCollab::new();
        let (room, users) = harness.room_with_members(1).await;

        let result = harness
            .collab
            .rooms
            .join_room(users[1].id, &room.data().code, None)
            .await;

        assert!(matches!(result, Err(RoomError::AlreadyMember)));
    }

    #[tokio::test]
    async fn test_settings_update_is_validated() {
        let harness = TestCollab::new();
        let (room, _) = harness.room_with_members(0).await;

        let result = harness
            .collab
            .rooms
            .update_settings(
                &room,
                crate::UpdatedRoomSettings {
                    mutiny_threshold: Some(0.4),
                    ..Default::default()
                },
            )
            .await;

        assert!(matches!(result, Err(RoomError::InvalidSettings(_))));

        let updated = harness
            .collab
            .rooms
            .update_settings(
                &room,
                crate::UpdatedRoomSettings {
                    mutiny_threshold: Some(0.75),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.mutiny_threshold, 0.75);
        assert_eq!(room.settings().mutiny_threshold, 0.75);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_members: i32, threshold: f64, cooldown: i32) -> RoomSettings {
        RoomSettings {
            max_members,
            mutiny_threshold: threshold,
            dj_cooldown_minutes: cooldown,
            auto_randomize_dj: false,
        }
    }

    #[test]
    fn test_settings_bounds() {
        assert!(validate_settings(&settings(50, 0.51, 5)).is_ok());
        assert!(validate_settings(&settings(2, 0.5, 0)).is_ok());
        assert!(validate_settings(&settings(100, 1.0, 60)).is_ok());

        assert!(validate_settings(&settings(1, 0.51, 5)).is_err());
        assert!(validate_settings(&settings(101, 0.51, 5)).is_err());
        assert!(validate_settings(&settings(50, 0.49, 5)).is_err());
        assert!(validate_settings(&settings(50, 1.01, 5)).is_err());
        assert!(validate_settings(&settings(50, 0.51, 61)).is_err());
    }
}
