//! In-memory doubles and fixtures so engine tests run without Postgres or a
//! metadata upstream.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use jukebox_core::{Config, MemoryStore};

use crate::{
    Collab, Database, DatabaseError, DatabaseResult, DjHistoryData, DjReason, InputError,
    MemberRole, MessageData, Metadata, MetadataProvider, NewMessage, NewRoom, NewRoomMember,
    NewRoomParams, NewSession, NewSubmission, NewUser, PrimaryKey, Result, Room, RoomData,
    RoomMemberData, SessionData, SubmissionData, UpdatedRoomSettings, UserData,
};

/// A [Database] over plain vectors behind a mutex.
#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<DbState>,
}

#[derive(Default)]
struct DbState {
    next_id: PrimaryKey,
    users: Vec<UserData>,
    sessions: Vec<(String, PrimaryKey, DateTime<Utc>)>,
    rooms: Vec<RoomData>,
    members: Vec<(PrimaryKey, RoomMemberData)>,
    submissions: Vec<SubmissionData>,
    ballots: Vec<(PrimaryKey, PrimaryKey, i32)>,
    history: Vec<DjHistoryData>,
    messages: Vec<MessageData>,
}

impl DbState {
    fn next_id(&mut self) -> PrimaryKey {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData> {
        self.state
            .lock()
            .users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "user",
                identifier: "id",
            })
    }

    async fn user_by_username(&self, username: &str) -> Result<UserData> {
        self.state
            .lock()
            .users
            .iter()
            .find(|u| u.username == username)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "user",
                identifier: "username",
            })
    }

    async fn create_user(&self, new_user: NewUser) -> Result<UserData> {
        self.user_by_username(&new_user.username)
            .await
            .conflict_or_ok("user", "username", &new_user.username)?;

        let mut state = self.state.lock();
        let user = UserData {
            id: state.next_id(),
            username: new_user.username,
            password: new_user.password,
            display_name: new_user.display_name,
        };

        state.users.push(user.clone());
        Ok(user)
    }

    async fn session_by_token(&self, token: &str) -> Result<SessionData> {
        let (id, user_id) = {
            let state = self.state.lock();

            state
                .sessions
                .iter()
                .enumerate()
                .find(|(_, (t, _, expires_at))| t.as_str() == token && *expires_at > Utc::now())
                .map(|(i, (_, u, _))| (i as PrimaryKey, *u))
                .ok_or(DatabaseError::NotFound {
                    resource: "session",
                    identifier: "token",
                })?
        };

        Ok(SessionData {
            id,
            token: token.to_string(),
            user: self.user_by_id(user_id).await?,
        })
    }

    async fn create_session(&self, new_session: NewSession) -> Result<SessionData> {
        let user = self.user_by_id(new_session.user_id).await?;
        let mut state = self.state.lock();

        state.sessions.push((
            new_session.token.clone(),
            new_session.user_id,
            new_session.expires_at,
        ));

        Ok(SessionData {
            id: state.sessions.len() as PrimaryKey,
            token: new_session.token,
            user,
        })
    }

    async fn delete_session_by_token(&self, token: &str) -> Result<()> {
        self.state
            .lock()
            .sessions
            .retain(|(t, _, _)| t.as_str() != token);
        Ok(())
    }

    async fn clear_expired_sessions(&self) -> Result<()> {
        self.state
            .lock()
            .sessions
            .retain(|(_, _, expires_at)| *expires_at > Utc::now());
        Ok(())
    }

    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        self.state
            .lock()
            .rooms
            .iter()
            .find(|r| r.id == room_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            })
    }

    async fn active_room_by_code(&self, code: &str) -> Result<RoomData> {
        self.state
            .lock()
            .rooms
            .iter()
            .find(|r| r.code == code && r.active)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "code",
            })
    }

    async fn list_active_rooms(&self) -> Result<Vec<RoomData>> {
        Ok(self
            .state
            .lock()
            .rooms
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }

    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        self.active_room_by_code(&new_room.code)
            .await
            .conflict_or_ok("room", "code", &new_room.code)?;

        let mut state = self.state.lock();
        let room = RoomData {
            id: state.next_id(),
            uuid: new_room.uuid,
            code: new_room.code,
            name: new_room.name,
            password: new_room.password,
            owner_id: Some(new_room.user_id),
            settings: new_room.settings,
            active: true,
            created_at: Utc::now(),
        };

        state.rooms.push(room.clone());
        Ok(room)
    }

    async fn update_room_settings(
        &self,
        room_id: PrimaryKey,
        settings: UpdatedRoomSettings,
    ) -> Result<RoomData> {
        let mut state = self.state.lock();

        let room = state
            .rooms
            .iter_mut()
            .find(|r| r.id == room_id)
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            })?;

        if let Some(value) = settings.max_members {
            room.settings.max_members = value;
        }
        if let Some(value) = settings.mutiny_threshold {
            room.settings.mutiny_threshold = value;
        }
        if let Some(value) = settings.dj_cooldown_minutes {
            room.settings.dj_cooldown_minutes = value;
        }
        if let Some(value) = settings.auto_randomize_dj {
            room.settings.auto_randomize_dj = value;
        }

        Ok(room.clone())
    }

    async fn set_room_owner(
        &self,
        room_id: PrimaryKey,
        owner_id: Option<PrimaryKey>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(room) = state.rooms.iter_mut().find(|r| r.id == room_id) {
            room.owner_id = owner_id;
        }

        Ok(())
    }

    async fn set_room_active(&self, room_id: PrimaryKey, active: bool) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(room) = state.rooms.iter_mut().find(|r| r.id == room_id) {
            room.active = active;
        }

        Ok(())
    }

    async fn room_members(&self, room_id: PrimaryKey) -> Result<Vec<RoomMemberData>> {
        let mut members: Vec<_> = self
            .state
            .lock()
            .members
            .iter()
            .filter(|(r, _)| *r == room_id)
            .map(|(_, m)| m.clone())
            .collect();

        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn create_room_member(&self, new_member: NewRoomMember) -> Result<RoomMemberData> {
        let user = self.user_by_id(new_member.user_id).await?;
        let mut state = self.state.lock();

        let exists = state
            .members
            .iter()
            .any(|(r, m)| *r == new_member.room_id && m.user.id == new_member.user_id);

        if exists {
            return Err(DatabaseError::Conflict {
                resource: "room_member",
                field: "user_id",
                value: new_member.user_id.to_string(),
            });
        }

        let id = state.next_id();

        // Spread join instants out so join-order tie-breaks are deterministic
        // even when members are created in the same millisecond.
        let member = RoomMemberData {
            id,
            owner: new_member.owner,
            role: MemberRole::Listener,
            joined_at: Utc::now() + Duration::milliseconds(id as i64),
            last_active: Utc::now(),
            user,
        };

        state.members.push((new_member.room_id, member.clone()));
        Ok(member)
    }

    async fn delete_room_member(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()> {
        self.state
            .lock()
            .members
            .retain(|(r, m)| !(*r == room_id && m.user.id == user_id));
        Ok(())
    }

    async fn update_member_role(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        role: MemberRole,
    ) -> Result<()> {
        let mut state = self.state.lock();

        for (r, member) in state.members.iter_mut() {
            if *r == room_id && member.user.id == user_id {
                member.role = role;
            }
        }

        Ok(())
    }

    async fn update_member_ownership(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        owner: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();

        for (r, member) in state.members.iter_mut() {
            if *r == room_id && member.user.id == user_id {
                member.owner = owner;
            }
        }

        Ok(())
    }

    async fn touch_member(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()> {
        let mut state = self.state.lock();

        for (r, member) in state.members.iter_mut() {
            if *r == room_id && member.user.id == user_id {
                member.last_active = Utc::now();
            }
        }

        Ok(())
    }

    async fn submission_by_id(&self, submission_id: PrimaryKey) -> Result<SubmissionData> {
        self.state
            .lock()
            .submissions
            .iter()
            .find(|s| s.id == submission_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "submission",
                identifier: "id",
            })
    }

    async fn unplayed_submissions(&self, room_id: PrimaryKey) -> Result<Vec<SubmissionData>> {
        Ok(self
            .state
            .lock()
            .submissions
            .iter()
            .filter(|s| s.room_id == room_id && !s.played)
            .cloned()
            .collect())
    }

    async fn create_submission(&self, new_submission: NewSubmission) -> Result<SubmissionData> {
        let mut state = self.state.lock();
        let id = state.next_id();

        let submission = SubmissionData {
            id,
            room_id: new_submission.room_id,
            user_id: Some(new_submission.user_id),
            video_id: new_submission.video_id,
            url: new_submission.url,
            title: new_submission.title,
            channel: new_submission.channel,
            thumbnail: new_submission.thumbnail,
            duration_seconds: new_submission.duration_seconds,
            up_count: 0,
            down_count: 0,
            played: false,
            created_at: Utc::now() + Duration::milliseconds(id as i64),
        };

        state.submissions.push(submission.clone());
        Ok(submission)
    }

    async fn mark_submission_played(&self, submission_id: PrimaryKey) -> Result<()> {
        let mut state = self.state.lock();

        for submission in state.submissions.iter_mut() {
            if submission.id == submission_id {
                submission.played = true;
            }
        }

        Ok(())
    }

    async fn delete_submission(&self, submission_id: PrimaryKey) -> Result<()> {
        let mut state = self.state.lock();
        state.submissions.retain(|s| s.id != submission_id);
        state.ballots.retain(|(s, _, _)| *s != submission_id);
        Ok(())
    }

    async fn apply_submission_vote(
        &self,
        submission_id: PrimaryKey,
        user_id: PrimaryKey,
        vote: Option<i32>,
    ) -> Result<SubmissionData> {
        let mut state = self.state.lock();

        let previous = state
            .ballots
            .iter()
            .find(|(s, u, _)| *s == submission_id && *u == user_id)
            .map(|(_, _, value)| *value);

        state
            .ballots
            .retain(|(s, u, _)| !(*s == submission_id && *u == user_id));

        if let Some(value) = vote {
            state.ballots.push((submission_id, user_id, value));
        }

        let submission = state
            .submissions
            .iter_mut()
            .find(|s| s.id == submission_id)
            .ok_or(DatabaseError::NotFound {
                resource: "submission",
                identifier: "id",
            })?;

        submission.up_count += (vote == Some(1)) as i32 - (previous == Some(1)) as i32;
        submission.down_count += (vote == Some(-1)) as i32 - (previous == Some(-1)) as i32;

        Ok(submission.clone())
    }

    async fn submission_vote(
        &self,
        submission_id: PrimaryKey,
        user_id: PrimaryKey,
    ) -> Result<Option<i32>> {
        Ok(self
            .state
            .lock()
            .ballots
            .iter()
            .find(|(s, u, _)| *s == submission_id && *u == user_id)
            .map(|(_, _, value)| *value))
    }

    async fn open_dj_tenure(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.next_id();

        state.history.push(DjHistoryData {
            id,
            room_id,
            user_id,
            became_dj_at: Utc::now(),
            removed_at: None,
            reason: None,
        });

        Ok(())
    }

    async fn close_dj_tenure(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        reason: DjReason,
    ) -> Result<()> {
        let mut state = self.state.lock();

        for entry in state.history.iter_mut() {
            if entry.room_id == room_id && entry.user_id == user_id && entry.removed_at.is_none() {
                entry.removed_at = Some(Utc::now());
                entry.reason = Some(reason.as_str().to_string());
            }
        }

        Ok(())
    }

    async fn dj_history(&self, room_id: PrimaryKey) -> Result<Vec<DjHistoryData>> {
        Ok(self
            .state
            .lock()
            .history
            .iter()
            .filter(|h| h.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn create_message(&self, new_message: NewMessage) -> Result<MessageData> {
        let mut state = self.state.lock();
        let id = state.next_id();

        let message = MessageData {
            id,
            room_id: new_message.room_id,
            user_id: new_message.user_id,
            body: new_message.body,
            sent_at: Utc::now(),
        };

        state.messages.push(message.clone());
        Ok(message)
    }
}

/// A metadata provider that never leaves the process.
pub struct StubMetadata;

#[async_trait]
impl MetadataProvider for StubMetadata {
    async fn lookup(&self, video_id: &str) -> std::result::Result<Metadata, InputError> {
        if video_id == "gone4040404" {
            return Err(InputError::NotFound);
        }

        Ok(Metadata {
            video_id: video_id.to_string(),
            title: format!("Track {video_id}"),
            channel: "Test Channel".to_string(),
            thumbnail: None,
            duration_seconds: 180,
        })
    }
}

/// A fully-wired runtime over [MemoryDb] and [MemoryStore].
pub struct TestCollab {
    pub collab: Collab,
}

impl TestCollab {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let collab = Collab::with_parts(
            config,
            MemoryDb::new(),
            Arc::new(MemoryStore::new()),
            Arc::new(StubMetadata),
        );

        Self { collab }
    }

    pub async fn user(&self, username: &str) -> UserData {
        self.collab
            .context
            .database
            .create_user(NewUser {
                username: username.to_string(),
                password: "secret".to_string(),
                display_name: username.to_uppercase(),
            })
            .await
            .expect("user is created")
    }

    /// Creates a room owned by a fresh user, then joins `extra_members`
    /// additional fresh users. Returns the room and every member's user,
    /// owner first, in join order.
    pub async fn room_with_members(&self, extra_members: usize) -> (Arc<Room>, Vec<UserData>) {
        let owner = self.user(&format!("owner-{}", Uuid::new_v4())).await;

        let room = self
            .collab
            .rooms
            .create_room(NewRoomParams {
                name: "Listening Party".to_string(),
                password: None,
                user_id: owner.id,
                settings: None,
            })
            .await
            .expect("room is created");

        let mut users = vec![owner];

        for n in 0..extra_members {
            let user = self.user(&format!("member-{n}-{}", Uuid::new_v4())).await;

            self.collab
                .rooms
                .join_room(user.id, &room.data().code, None)
                .await
                .expect("member joins");

            users.push(user);
        }

        (room, users)
    }

    /// Queues a track submitted by the given user.
    pub async fn submit(&self, room: &Arc<Room>, user_id: PrimaryKey) -> SubmissionData {
        self.collab
            .queue
            .submit(room, user_id, "https://youtu.be/dQw4w9WgXcQ")
            .await
            .expect("submission is created")
    }
}
