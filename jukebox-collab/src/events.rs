use crate::{
    DjReason, MessageData, PlaybackRecord, PrimaryKey, RoomMemberData, RoomSettings,
    RoomStateSnapshot, SubmissionData, UserData, VoteOutcome, VoteSession,
};

/// The fabric topic a room's events are published on.
pub fn room_topic(room_id: PrimaryKey) -> String {
    format!("room:{room_id}")
}

/// Events published on a room's topic. Everything a client can observe
/// happening in a room is one of these.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The full reconnect snapshot. Pushed directly to a joining connection,
    /// never broadcast.
    State(RoomStateSnapshot),
    /// A user became a member of the room
    MemberJoined {
        room_id: PrimaryKey,
        new_member: RoomMemberData,
    },
    /// A member left the room
    MemberLeft {
        room_id: PrimaryKey,
        user_id: PrimaryKey,
    },
    /// Ownership moved to another member
    OwnerChanged {
        room_id: PrimaryKey,
        user_id: PrimaryKey,
    },
    /// The room's settings were updated by the owner
    SettingsUpdated {
        room_id: PrimaryKey,
        settings: RoomSettings,
    },
    /// The queue changed; carries the full ordered queue
    QueueUpdated {
        room_id: PrimaryKey,
        entries: Vec<SubmissionData>,
        currently_playing: Option<PrimaryKey>,
    },
    /// An entry left the queue without being played
    QueueEntryRemoved {
        room_id: PrimaryKey,
        entry_id: PrimaryKey,
        reason: EntryRemovalReason,
    },
    /// Synchronized playback was scheduled
    PlaybackStarted {
        room_id: PrimaryKey,
        playback: PlaybackRecord,
        server_now_ms: i64,
    },
    PlaybackPaused {
        room_id: PrimaryKey,
    },
    PlaybackStopped {
        room_id: PrimaryKey,
    },
    /// A member took the DJ slot
    DjChanged {
        room_id: PrimaryKey,
        new_dj: RoomMemberData,
    },
    /// The DJ slot was cleared
    DjRemoved {
        room_id: PrimaryKey,
        reason: DjReason,
    },
    ElectionStarted {
        room_id: PrimaryKey,
        session: VoteSession,
    },
    MutinyStarted {
        room_id: PrimaryKey,
        session: VoteSession,
    },
    /// A ballot landed; carries the updated session
    VoteResultsUpdated {
        room_id: PrimaryKey,
        session: VoteSession,
    },
    /// A vote session reached a terminal state
    VoteComplete {
        room_id: PrimaryKey,
        session_id: uuid::Uuid,
        outcome: VoteOutcome,
    },
    MutinySucceeded {
        room_id: PrimaryKey,
    },
    MutinyFailed {
        room_id: PrimaryKey,
    },
    /// A chat message was sent
    ChatMessage {
        room_id: PrimaryKey,
        message: MessageData,
        author: UserData,
    },
}

/// Why a queue entry was removed without being played
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRemovalReason {
    /// The submitter or the owner removed it
    Requested,
    /// Its net score fell to the auto-removal threshold
    Downvoted,
}
