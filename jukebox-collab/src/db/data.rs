use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The type used for primary keys in the database.
pub type PrimaryKey = i32;

/// A jukebox account
#[derive(Debug, Clone)]
pub struct UserData {
    pub id: PrimaryKey,
    pub username: String,
    pub password: String,
    pub display_name: String,
}

/// Login session data for authentication
#[derive(Debug, Clone)]
pub struct SessionData {
    pub id: PrimaryKey,
    /// The session token, or key if you will
    pub token: String,
    /// The user that is logged in
    pub user: UserData,
}

/// The tunable behavior of a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSettings {
    /// How many members the room accepts, within 2..=100
    pub max_members: i32,
    /// The yes-share required for a mutiny to pass, within 0.5..=1.0
    pub mutiny_threshold: f64,
    /// How long a mutinied-off DJ is barred from the slot, within 0..=60
    pub dj_cooldown_minutes: i32,
    /// Whether an emptied DJ slot is refilled with a random member
    pub auto_randomize_dj: bool,
}

/// A listening room
#[derive(Debug, Clone)]
pub struct RoomData {
    pub id: PrimaryKey,
    /// Public identity of the room
    pub uuid: Uuid,
    /// The 6-character human code used to join the room
    pub code: String,
    pub name: String,
    /// Argon2 hash of the join password, if the room has one
    pub password: Option<String>,
    /// The owning member's user, if any remain
    pub owner_id: Option<PrimaryKey>,
    pub settings: RoomSettings,
    /// An inactive room accepts no joins and holds no transient state
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// What a member may do in a room. Ownership is tracked separately, since the
/// owner can hold the DJ slot like anyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Dj,
    Listener,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dj => "dj",
            Self::Listener => "listener",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "dj" => Self::Dj,
            _ => Self::Listener,
        }
    }
}

/// A member of a room
#[derive(Debug, Clone)]
pub struct RoomMemberData {
    pub id: PrimaryKey,
    /// If this is true, the member has full control over the room
    pub owner: bool,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub user: UserData,
}

/// A track submitted to a room's queue
#[derive(Debug, Clone)]
pub struct SubmissionData {
    pub id: PrimaryKey,
    pub room_id: PrimaryKey,
    /// The submitting user. Weak: the submission outlives the membership.
    pub user_id: Option<PrimaryKey>,
    pub video_id: String,
    pub url: String,
    pub title: String,
    pub channel: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: i32,
    pub up_count: i32,
    pub down_count: i32,
    /// Set once the entry has been selected for playback; the score is frozen
    pub played: bool,
    pub created_at: DateTime<Utc>,
}

impl SubmissionData {
    /// The queue's ordering key
    pub fn net_score(&self) -> i32 {
        self.up_count - self.down_count
    }
}

/// Why a DJ tenure ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DjReason {
    Voluntary,
    Vote,
    Mutiny,
    Randomize,
    Timeout,
    OwnerSet,
}

impl DjReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voluntary => "voluntary",
            Self::Vote => "vote",
            Self::Mutiny => "mutiny",
            Self::Randomize => "randomize",
            Self::Timeout => "timeout",
            Self::OwnerSet => "owner_set",
        }
    }
}

/// One DJ tenure in a room. `removed_at` and `reason` are set when it ends.
#[derive(Debug, Clone)]
pub struct DjHistoryData {
    pub id: PrimaryKey,
    pub room_id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub became_dj_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// A chat message in a room
#[derive(Debug, Clone)]
pub struct MessageData {
    pub id: PrimaryKey,
    pub room_id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}
