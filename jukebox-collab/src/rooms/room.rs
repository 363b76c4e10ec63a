use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use jukebox_core::ConnectionId;

use crate::{
    events::{room_topic, RoomEvent},
    CollabContext, MemberRole, PrimaryKey, RoomData, RoomMemberData, RoomSettings, SubmissionData,
};

use super::RoomError;

pub type RoomId = PrimaryKey;

/// A jukebox room: members, a voted queue, and the transient DJ/playback/vote
/// state living in the shared store.
///
/// All mutating operations on a room serialize through [Room::lock]; reads
/// don't contend on it.
pub struct Room {
    context: CollabContext,
    data: Mutex<RoomData>,
    members: Mutex<Vec<RoomMemberData>>,
    /// The room's unplayed submissions, mirrored from the database
    submissions: Mutex<Vec<SubmissionData>>,
    /// The sockets currently attached to this room
    connections: Mutex<Vec<RoomConnection>>,
    /// Pending DJ-disconnect grace timer, if any
    grace: Mutex<Option<GraceTimer>>,
    /// The per-room operation lock making room mutations linearizable
    op_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone, Copy)]
pub struct RoomConnection {
    pub id: ConnectionId,
    pub user_id: PrimaryKey,
}

struct GraceTimer {
    user_id: PrimaryKey,
    handle: JoinHandle<()>,
}

impl Room {
    pub fn new(context: &CollabContext, data: RoomData, members: Vec<RoomMemberData>) -> Self {
        Self {
            context: context.clone(),
            data: data.into(),
            members: members.into(),
            submissions: Default::default(),
            connections: Default::default(),
            grace: Default::default(),
            op_lock: Default::default(),
        }
    }

    /// Acquires the room's operation lock.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    pub fn data(&self) -> RoomData {
        self.data.lock().clone()
    }

    pub fn id(&self) -> RoomId {
        self.data.lock().id
    }

    pub fn topic(&self) -> String {
        room_topic(self.id())
    }

    pub fn settings(&self) -> RoomSettings {
        self.data.lock().settings.clone()
    }

    pub fn is_active(&self) -> bool {
        self.data.lock().active
    }

    pub fn owner_id(&self) -> Option<PrimaryKey> {
        self.data.lock().owner_id
    }

    /// Errors unless the room accepts operations.
    pub fn ensure_active(&self) -> Result<(), RoomError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(RoomError::RoomNotActive)
        }
    }

    pub fn members(&self) -> Vec<RoomMemberData> {
        self.members.lock().clone()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Returns the member if it exists in the room
    pub fn member_by_user_id(&self, user_id: PrimaryKey) -> Result<RoomMemberData, RoomError> {
        self.members
            .lock()
            .iter()
            .find(|m| m.user.id == user_id)
            .cloned()
            .ok_or(RoomError::UserNotInRoom)
    }

    /// True if the user is the room's owner
    pub fn is_owner(&self, user_id: PrimaryKey) -> bool {
        self.owner_id() == Some(user_id)
    }

    /// Registers an added member to the room
    pub fn add_member(&self, new_member: RoomMemberData) {
        self.members.lock().push(new_member.clone());

        self.context.emit(
            self.id(),
            RoomEvent::MemberJoined {
                room_id: self.id(),
                new_member,
            },
        );
    }

    /// Unregisters a member, emitting the departure
    pub fn remove_member(&self, user_id: PrimaryKey) {
        self.members.lock().retain(|m| m.user.id != user_id);

        self.context.emit(
            self.id(),
            RoomEvent::MemberLeft {
                room_id: self.id(),
                user_id,
            },
        );
    }

    /// Updates the in-memory role of a member
    pub fn set_member_role(&self, user_id: PrimaryKey, role: MemberRole) {
        let mut members = self.members.lock();

        if let Some(member) = members.iter_mut().find(|m| m.user.id == user_id) {
            member.role = role;
        }
    }

    /// Moves the in-memory ownership flag to the given member, if any
    pub fn set_owner(&self, user_id: Option<PrimaryKey>) {
        self.data.lock().owner_id = user_id;

        let mut members = self.members.lock();

        for member in members.iter_mut() {
            member.owner = Some(member.user.id) == user_id;
        }
    }

    /// The earliest-joined member, excluding the given user
    pub fn earliest_joined_member(&self, excluding: PrimaryKey) -> Option<RoomMemberData> {
        self.members
            .lock()
            .iter()
            .filter(|m| m.user.id != excluding)
            .min_by_key(|m| m.joined_at)
            .cloned()
    }

    pub fn update_settings(&self, settings: RoomSettings) {
        self.data.lock().settings = settings;
    }

    pub fn deactivate(&self) {
        self.data.lock().active = false;
    }

    // -- Queue mirror --------------------------------------------------------

    pub fn submissions(&self) -> Vec<SubmissionData> {
        self.submissions.lock().clone()
    }

    pub fn set_submissions(&self, submissions: Vec<SubmissionData>) {
        *self.submissions.lock() = submissions;
    }

    pub fn submission_by_id(&self, entry_id: PrimaryKey) -> Option<SubmissionData> {
        self.submissions
            .lock()
            .iter()
            .find(|s| s.id == entry_id)
            .cloned()
    }

    pub fn upsert_submission(&self, submission: SubmissionData) {
        let mut submissions = self.submissions.lock();

        match submissions.iter_mut().find(|s| s.id == submission.id) {
            Some(existing) => *existing = submission,
            None => submissions.push(submission),
        }
    }

    pub fn remove_submission(&self, entry_id: PrimaryKey) {
        self.submissions.lock().retain(|s| s.id != entry_id);
    }

    // -- Connections ---------------------------------------------------------

    pub fn add_connection(&self, connection: RoomConnection) {
        self.connections.lock().push(connection);
    }

    pub fn remove_connection(&self, connection_id: ConnectionId) {
        self.connections.lock().retain(|c| c.id != connection_id);
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().iter().map(|c| c.id).collect()
    }

    /// True if the user still has at least one socket attached
    pub fn user_is_connected(&self, user_id: PrimaryKey) -> bool {
        self.connections.lock().iter().any(|c| c.user_id == user_id)
    }

    // -- DJ grace timer ------------------------------------------------------

    /// Arms the DJ-disconnect grace timer, replacing any previous one.
    pub fn arm_grace(&self, user_id: PrimaryKey, handle: JoinHandle<()>) {
        let mut grace = self.grace.lock();

        if let Some(previous) = grace.take() {
            previous.handle.abort();
        }

        *grace = Some(GraceTimer { user_id, handle });
    }

    /// Cancels the grace timer if it is armed for the given user.
    pub fn disarm_grace(&self, user_id: PrimaryKey) {
        let mut grace = self.grace.lock();

        if grace.as_ref().is_some_and(|g| g.user_id == user_id) {
            if let Some(timer) = grace.take() {
                timer.handle.abort();
            }
        }
    }

    /// Clears the grace slot without aborting, used from inside the timer.
    pub fn clear_grace(&self) {
        self.grace.lock().take();
    }

    /// Returns the joined_at of a member, used for election tie-breaks
    pub fn joined_at(&self, user_id: PrimaryKey) -> Option<DateTime<Utc>> {
        self.members
            .lock()
            .iter()
            .find(|m| m.user.id == user_id)
            .map(|m| m.joined_at)
    }
}
