//! All schemas that are exposed from endpoints and the gateway are defined
//! here along with the conversions from collab data.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use jukebox_collab::{
    DjHistoryData, MemberRole, PlaybackRecord, PlaybackSnapshot, PrimaryKey, QueueEntryView,
    RoomData, RoomMemberData, RoomSettings, RoomStateSnapshot, SessionData, SubmissionData,
    UserData, VoteChoice, VoteKind, VoteSession,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct User {
    pub id: PrimaryKey,
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResult {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Room {
    pub uuid: Uuid,
    pub code: String,
    pub name: String,
    pub owner_id: Option<PrimaryKey>,
    pub settings: RoomSettingsView,
    pub has_password: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomSettingsView {
    pub max_members: i32,
    pub mutiny_threshold: f64,
    pub dj_cooldown_minutes: i32,
    pub auto_randomize_dj: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomMember {
    pub user_id: PrimaryKey,
    pub username: String,
    pub display_name: String,
    pub owner: bool,
    pub role: &'static str,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueueEntry {
    pub id: PrimaryKey,
    pub video_id: String,
    pub url: String,
    pub title: String,
    pub channel: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: i32,
    pub submitted_by: Option<PrimaryKey>,
    pub up_count: i32,
    pub down_count: i32,
    pub net_score: i32,
    pub created_at: DateTime<Utc>,
    /// The requesting user's own ballot, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_vote: Option<i32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TrackRef {
    pub entry_id: PrimaryKey,
    pub video_id: String,
    pub title: String,
    pub duration_seconds: i32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Playback {
    pub playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at_server_time: Option<i64>,
    pub server_now_ms: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Vote {
    pub session_id: Uuid,
    pub kind: &'static str,
    pub initiator: PrimaryKey,
    pub target: Option<PrimaryKey>,
    pub threshold: f64,
    pub eligible: Vec<PrimaryKey>,
    pub ballots_cast: usize,
    pub yes_count: usize,
    pub no_count: usize,
    pub tallies: Vec<CandidateTally>,
    pub opened_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CandidateTally {
    pub user_id: PrimaryKey,
    pub ballots: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomState {
    pub room: Room,
    pub members: Vec<RoomMember>,
    pub dj_id: Option<PrimaryKey>,
    pub playback: Playback,
    pub queue: Vec<QueueEntry>,
    pub pending_vote: Option<Vote>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DjHistoryEntry {
    pub user_id: PrimaryKey,
    pub became_dj_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Helper trait to convert any type into a serialized version
pub trait ToSerialized<T>
where
    T: Serialize,
{
    fn to_serialized(&self) -> T;
}

impl<T, S> ToSerialized<Vec<S>> for Vec<T>
where
    T: ToSerialized<S>,
    S: Serialize,
{
    fn to_serialized(&self) -> Vec<S> {
        self.iter().map(|x| x.to_serialized()).collect()
    }
}

impl ToSerialized<User> for UserData {
    fn to_serialized(&self) -> User {
        User {
            id: self.id,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

impl ToSerialized<LoginResult> for SessionData {
    fn to_serialized(&self) -> LoginResult {
        LoginResult {
            token: self.token.clone(),
            user: self.user.to_serialized(),
        }
    }
}

impl ToSerialized<RoomSettingsView> for RoomSettings {
    fn to_serialized(&self) -> RoomSettingsView {
        RoomSettingsView {
            max_members: self.max_members,
            mutiny_threshold: self.mutiny_threshold,
            dj_cooldown_minutes: self.dj_cooldown_minutes,
            auto_randomize_dj: self.auto_randomize_dj,
        }
    }
}

impl ToSerialized<Room> for RoomData {
    fn to_serialized(&self) -> Room {
        Room {
            uuid: self.uuid,
            code: self.code.clone(),
            name: self.name.clone(),
            owner_id: self.owner_id,
            settings: self.settings.to_serialized(),
            has_password: self.password.is_some(),
            created_at: self.created_at,
        }
    }
}

impl ToSerialized<RoomMember> for RoomMemberData {
    fn to_serialized(&self) -> RoomMember {
        RoomMember {
            user_id: self.user.id,
            username: self.user.username.clone(),
            display_name: self.user.display_name.clone(),
            owner: self.owner,
            role: match self.role {
                MemberRole::Dj => "dj",
                MemberRole::Listener => "listener",
            },
            joined_at: self.joined_at,
        }
    }
}

impl ToSerialized<QueueEntry> for SubmissionData {
    fn to_serialized(&self) -> QueueEntry {
        QueueEntry {
            id: self.id,
            video_id: self.video_id.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            channel: self.channel.clone(),
            thumbnail: self.thumbnail.clone(),
            duration_seconds: self.duration_seconds,
            submitted_by: self.user_id,
            up_count: self.up_count,
            down_count: self.down_count,
            net_score: self.net_score(),
            created_at: self.created_at,
            user_vote: None,
        }
    }
}

impl ToSerialized<QueueEntry> for QueueEntryView {
    fn to_serialized(&self) -> QueueEntry {
        let mut entry = self.submission.to_serialized();
        entry.user_vote = self.user_vote;
        entry
    }
}

impl ToSerialized<TrackRef> for PlaybackRecord {
    fn to_serialized(&self) -> TrackRef {
        TrackRef {
            entry_id: self.entry_id,
            video_id: self.video_id.clone(),
            title: self.title.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}

impl ToSerialized<Playback> for PlaybackSnapshot {
    fn to_serialized(&self) -> Playback {
        Playback {
            playing: self.playing,
            track: self.record.as_ref().map(|r| r.to_serialized()),
            start_at_server_time: self.record.as_ref().map(|r| r.start_at_server_time),
            server_now_ms: self.server_now_ms,
        }
    }
}

impl ToSerialized<Vote> for VoteSession {
    fn to_serialized(&self) -> Vote {
        let mut tallies: Vec<CandidateTally> = vec![];

        for choice in self.ballots.values() {
            if let VoteChoice::Candidate(candidate) = choice {
                match tallies.iter_mut().find(|t| t.user_id == *candidate) {
                    Some(tally) => tally.ballots += 1,
                    None => tallies.push(CandidateTally {
                        user_id: *candidate,
                        ballots: 1,
                    }),
                }
            }
        }

        Vote {
            session_id: self.id,
            kind: match self.kind {
                VoteKind::DjElection => "dj_election",
                VoteKind::Mutiny => "mutiny",
            },
            initiator: self.initiator,
            target: self.target,
            threshold: self.threshold,
            eligible: self.eligible.iter().map(|v| v.user_id).collect(),
            ballots_cast: self.ballots.len(),
            yes_count: self.yes_count(),
            no_count: self.no_count(),
            tallies,
            opened_at_ms: self.opened_at_ms,
        }
    }
}

impl ToSerialized<RoomState> for RoomStateSnapshot {
    fn to_serialized(&self) -> RoomState {
        RoomState {
            room: self.room.to_serialized(),
            members: self.members.to_serialized(),
            dj_id: self.dj,
            playback: self.playback.to_serialized(),
            queue: self.queue.to_serialized(),
            pending_vote: self.pending_vote.as_ref().map(|v| v.to_serialized()),
        }
    }
}

impl ToSerialized<DjHistoryEntry> for DjHistoryData {
    fn to_serialized(&self) -> DjHistoryEntry {
        DjHistoryEntry {
            user_id: self.user_id,
            became_dj_at: self.became_dj_at,
            removed_at: self.removed_at,
            reason: self.reason.clone(),
        }
    }
}
