use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

mod data;
pub use data::*;

mod pg;
pub use pg::*;

pub type Result<T> = std::result::Result<T, DatabaseError>;
pub type BoxedDatabase = Box<dyn Database>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// An unknown or internal error happened with the database
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        /// The resource in question
        resource: &'static str,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A resource in the database doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: &'static str,
    },
}

/// Helper trait to reduce boilerplate
pub trait IntoDatabaseError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError;
    fn any(self) -> DatabaseError;
}

/// Helper trait to reduce boilerplate
pub trait DatabaseResult {
    /// Turns the Result into a conflict error if it's Ok()
    fn conflict_or_ok(self, resource: &'static str, field: &'static str, value: &str)
        -> Result<()>;
}

impl<T> DatabaseResult for Result<T> {
    fn conflict_or_ok(
        self,
        resource: &'static str,
        field: &'static str,
        value: &str,
    ) -> Result<()> {
        match self {
            Ok(_) => Err(DatabaseError::Conflict {
                resource,
                field,
                value: value.to_string(),
            }),
            Err(e) => match e {
                DatabaseError::NotFound {
                    resource: _,
                    identifier: _,
                } => Ok(()),
                e => Err(e),
            },
        }
    }
}

/// Represents a type that can fetch and persist jukebox data
#[async_trait]
pub trait Database: Send + Sync {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData>;
    async fn user_by_username(&self, username: &str) -> Result<UserData>;
    async fn create_user(&self, new_user: NewUser) -> Result<UserData>;

    async fn session_by_token(&self, token: &str) -> Result<SessionData>;
    async fn create_session(&self, new_session: NewSession) -> Result<SessionData>;
    async fn delete_session_by_token(&self, token: &str) -> Result<()>;
    async fn clear_expired_sessions(&self) -> Result<()>;

    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData>;
    /// Looks up an active room by its join code
    async fn active_room_by_code(&self, code: &str) -> Result<RoomData>;
    async fn list_active_rooms(&self) -> Result<Vec<RoomData>>;
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData>;
    async fn update_room_settings(
        &self,
        room_id: PrimaryKey,
        settings: UpdatedRoomSettings,
    ) -> Result<RoomData>;
    async fn set_room_owner(&self, room_id: PrimaryKey, owner_id: Option<PrimaryKey>)
        -> Result<()>;
    async fn set_room_active(&self, room_id: PrimaryKey, active: bool) -> Result<()>;

    async fn room_members(&self, room_id: PrimaryKey) -> Result<Vec<RoomMemberData>>;
    async fn create_room_member(&self, new_member: NewRoomMember) -> Result<RoomMemberData>;
    async fn delete_room_member(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()>;
    async fn update_member_role(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        role: MemberRole,
    ) -> Result<()>;
    async fn update_member_ownership(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        owner: bool,
    ) -> Result<()>;
    async fn touch_member(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()>;

    async fn submission_by_id(&self, submission_id: PrimaryKey) -> Result<SubmissionData>;
    async fn unplayed_submissions(&self, room_id: PrimaryKey) -> Result<Vec<SubmissionData>>;
    async fn create_submission(&self, new_submission: NewSubmission) -> Result<SubmissionData>;
    async fn mark_submission_played(&self, submission_id: PrimaryKey) -> Result<()>;
    async fn delete_submission(&self, submission_id: PrimaryKey) -> Result<()>;
    /// Upserts or clears one user's ballot on a submission and adjusts the
    /// vote counts in the same transaction. Returns the updated submission.
    async fn apply_submission_vote(
        &self,
        submission_id: PrimaryKey,
        user_id: PrimaryKey,
        vote: Option<i32>,
    ) -> Result<SubmissionData>;
    /// Returns the ballot a user has cast on a submission, if any.
    async fn submission_vote(
        &self,
        submission_id: PrimaryKey,
        user_id: PrimaryKey,
    ) -> Result<Option<i32>>;

    /// Starts a DJ tenure row for a user
    async fn open_dj_tenure(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()>;
    /// Ends the open DJ tenure row for a user, recording why
    async fn close_dj_tenure(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        reason: DjReason,
    ) -> Result<()>;
    async fn dj_history(&self, room_id: PrimaryKey) -> Result<Vec<DjHistoryData>>;

    async fn create_message(&self, new_message: NewMessage) -> Result<MessageData>;
}

#[derive(Debug)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug)]
pub struct NewSession {
    pub token: String,
    pub user_id: PrimaryKey,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewRoom {
    pub uuid: Uuid,
    pub code: String,
    pub name: String,
    /// Argon2 hash of the join password, if any
    pub password: Option<String>,
    /// The owner of the new room
    pub user_id: PrimaryKey,
    pub settings: RoomSettings,
}

#[derive(Debug, Default)]
pub struct UpdatedRoomSettings {
    pub max_members: Option<i32>,
    pub mutiny_threshold: Option<f64>,
    pub dj_cooldown_minutes: Option<i32>,
    pub auto_randomize_dj: Option<bool>,
}

#[derive(Debug)]
pub struct NewRoomMember {
    pub user_id: PrimaryKey,
    pub room_id: PrimaryKey,
    pub owner: bool,
}

#[derive(Debug)]
pub struct NewSubmission {
    pub room_id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub video_id: String,
    pub url: String,
    pub title: String,
    pub channel: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: i32,
}

#[derive(Debug)]
pub struct NewMessage {
    pub room_id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub body: String,
}
