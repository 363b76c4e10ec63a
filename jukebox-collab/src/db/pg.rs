use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, query, Error as SqlxError, PgPool, Row};

use crate::{
    Database, DatabaseError, DatabaseResult, DjHistoryData, DjReason, IntoDatabaseError,
    MemberRole, MessageData, NewMessage, NewRoom, NewRoomMember, NewSession, NewSubmission,
    NewUser, PrimaryKey, Result, RoomData, RoomMemberData, RoomSettings, SessionData,
    SubmissionData, UpdatedRoomSettings, UserData,
};

/// A postgres database implementation for jukebox
pub struct PgDatabase {
    pool: PgPool,
}

const MEMBER_COLUMNS: &str = "
    room_members.id,
    room_members.owner,
    room_members.role,
    room_members.joined_at,
    room_members.last_active,
    users.id AS u_id,
    users.username AS u_username,
    users.password AS u_password,
    users.display_name AS u_display_name
";

impl PgDatabase {
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))?;

        Ok(Self { pool })
    }

    async fn submission(&self, submission_id: PrimaryKey) -> Result<SubmissionData> {
        query("SELECT * FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("submission", "id"))
            .and_then(|row| map_submission(&row))
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData> {
        query("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("user", "id"))
            .and_then(|row| map_user(&row, ""))
    }

    async fn user_by_username(&self, username: &str) -> Result<UserData> {
        query("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("user", "username"))
            .and_then(|row| map_user(&row, ""))
    }

    async fn create_user(&self, new_user: NewUser) -> Result<UserData> {
        self.user_by_username(&new_user.username)
            .await
            .conflict_or_ok("user", "username", &new_user.username)?;

        query(
            "INSERT INTO users (username, password, display_name)
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&new_user.username)
        .bind(&new_user.password)
        .bind(&new_user.display_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
        .and_then(|row| map_user(&row, ""))
    }

    async fn session_by_token(&self, token: &str) -> Result<SessionData> {
        query(
            "SELECT
                sessions.id,
                sessions.token,
                users.id AS u_id,
                users.username AS u_username,
                users.password AS u_password,
                users.display_name AS u_display_name
             FROM sessions
                INNER JOIN users ON sessions.user_id = users.id
             WHERE token = $1 AND expires_at > now()",
        )
        .bind(token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("session", "token"))
        .and_then(|row| {
            Ok(SessionData {
                id: row.try_get("id").map_err(|e| e.any())?,
                token: row.try_get("token").map_err(|e| e.any())?,
                user: map_user(&row, "u_")?,
            })
        })
    }

    async fn create_session(&self, new_session: NewSession) -> Result<SessionData> {
        let user = self.user_by_id(new_session.user_id).await?;

        let row = query(
            "INSERT INTO sessions (token, user_id, expires_at)
             VALUES ($1, $2, $3) RETURNING id, token",
        )
        .bind(&new_session.token)
        .bind(new_session.user_id)
        .bind(new_session.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())?;

        Ok(SessionData {
            id: row.try_get("id").map_err(|e| e.any())?,
            token: row.try_get("token").map_err(|e| e.any())?,
            user,
        })
    }

    async fn delete_session_by_token(&self, token: &str) -> Result<()> {
        query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn clear_expired_sessions(&self) -> Result<()> {
        query("DELETE FROM sessions WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        query("SELECT * FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room", "id"))
            .and_then(|row| map_room(&row))
    }

    async fn active_room_by_code(&self, code: &str) -> Result<RoomData> {
        query("SELECT * FROM rooms WHERE code = $1 AND active = true")
            .bind(code)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room", "code"))
            .and_then(|row| map_room(&row))
    }

    async fn list_active_rooms(&self) -> Result<Vec<RoomData>> {
        query("SELECT * FROM rooms WHERE active = true ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())?
            .iter()
            .map(map_room)
            .collect()
    }

    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        self.active_room_by_code(&new_room.code)
            .await
            .conflict_or_ok("room", "code", &new_room.code)?;

        query(
            "INSERT INTO rooms
                (uuid, code, name, password, owner_id, max_members,
                 mutiny_threshold, dj_cooldown_minutes, auto_randomize_dj, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, true)
             RETURNING *",
        )
        .bind(new_room.uuid)
        .bind(&new_room.code)
        .bind(&new_room.name)
        .bind(&new_room.password)
        .bind(new_room.user_id)
        .bind(new_room.settings.max_members)
        .bind(new_room.settings.mutiny_threshold)
        .bind(new_room.settings.dj_cooldown_minutes)
        .bind(new_room.settings.auto_randomize_dj)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
        .and_then(|row| map_room(&row))
    }

    async fn update_room_settings(
        &self,
        room_id: PrimaryKey,
        settings: UpdatedRoomSettings,
    ) -> Result<RoomData> {
        let room = self.room_by_id(room_id).await?;

        query(
            "UPDATE rooms SET
                max_members = $1,
                mutiny_threshold = $2,
                dj_cooldown_minutes = $3,
                auto_randomize_dj = $4
             WHERE id = $5",
        )
        .bind(settings.max_members.unwrap_or(room.settings.max_members))
        .bind(
            settings
                .mutiny_threshold
                .unwrap_or(room.settings.mutiny_threshold),
        )
        .bind(
            settings
                .dj_cooldown_minutes
                .unwrap_or(room.settings.dj_cooldown_minutes),
        )
        .bind(
            settings
                .auto_randomize_dj
                .unwrap_or(room.settings.auto_randomize_dj),
        )
        .bind(room_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())?;

        self.room_by_id(room_id).await
    }

    async fn set_room_owner(
        &self,
        room_id: PrimaryKey,
        owner_id: Option<PrimaryKey>,
    ) -> Result<()> {
        query("UPDATE rooms SET owner_id = $1 WHERE id = $2")
            .bind(owner_id)
            .bind(room_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn set_room_active(&self, room_id: PrimaryKey, active: bool) -> Result<()> {
        query("UPDATE rooms SET active = $1 WHERE id = $2")
            .bind(active)
            .bind(room_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn room_members(&self, room_id: PrimaryKey) -> Result<Vec<RoomMemberData>> {
        query(&format!(
            "SELECT {MEMBER_COLUMNS}
             FROM room_members
                INNER JOIN users ON room_members.user_id = users.id
             WHERE room_id = $1
             ORDER BY room_members.joined_at ASC"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?
        .iter()
        .map(map_member)
        .collect()
    }

    async fn create_room_member(&self, new_member: NewRoomMember) -> Result<RoomMemberData> {
        let existing = query("SELECT id FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(new_member.room_id)
            .bind(new_member.user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room_member", "user_id"))
            .map(|_| ());

        existing.conflict_or_ok("room_member", "user_id", &new_member.user_id.to_string())?;

        query("INSERT INTO room_members (room_id, user_id, owner) VALUES ($1, $2, $3)")
            .bind(new_member.room_id)
            .bind(new_member.user_id)
            .bind(new_member.owner)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())?;

        let members = self.room_members(new_member.room_id).await?;

        members
            .into_iter()
            .find(|m| m.user.id == new_member.user_id)
            .ok_or(DatabaseError::NotFound {
                resource: "room_member",
                identifier: "user_id",
            })
    }

    async fn delete_room_member(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()> {
        query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn update_member_role(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        role: MemberRole,
    ) -> Result<()> {
        query("UPDATE room_members SET role = $1 WHERE room_id = $2 AND user_id = $3")
            .bind(role.as_str())
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn update_member_ownership(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        owner: bool,
    ) -> Result<()> {
        query("UPDATE room_members SET owner = $1 WHERE room_id = $2 AND user_id = $3")
            .bind(owner)
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn touch_member(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()> {
        query("UPDATE room_members SET last_active = now() WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn submission_by_id(&self, submission_id: PrimaryKey) -> Result<SubmissionData> {
        self.submission(submission_id).await
    }

    async fn unplayed_submissions(&self, room_id: PrimaryKey) -> Result<Vec<SubmissionData>> {
        query("SELECT * FROM submissions WHERE room_id = $1 AND played = false ORDER BY created_at ASC")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())?
            .iter()
            .map(map_submission)
            .collect()
    }

    async fn create_submission(&self, new_submission: NewSubmission) -> Result<SubmissionData> {
        query(
            "INSERT INTO submissions
                (room_id, user_id, video_id, url, title, channel, thumbnail, duration_seconds)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(new_submission.room_id)
        .bind(new_submission.user_id)
        .bind(&new_submission.video_id)
        .bind(&new_submission.url)
        .bind(&new_submission.title)
        .bind(&new_submission.channel)
        .bind(&new_submission.thumbnail)
        .bind(new_submission.duration_seconds)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
        .and_then(|row| map_submission(&row))
    }

    async fn mark_submission_played(&self, submission_id: PrimaryKey) -> Result<()> {
        query("UPDATE submissions SET played = true WHERE id = $1")
            .bind(submission_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn delete_submission(&self, submission_id: PrimaryKey) -> Result<()> {
        // Ensure the submission exists
        let _ = self.submission(submission_id).await?;

        query("DELETE FROM submissions WHERE id = $1")
            .bind(submission_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn apply_submission_vote(
        &self,
        submission_id: PrimaryKey,
        user_id: PrimaryKey,
        vote: Option<i32>,
    ) -> Result<SubmissionData> {
        let mut tx = self.pool.begin().await.map_err(|e| e.any())?;

        let previous: Option<i32> =
            query("SELECT value FROM submission_votes WHERE submission_id = $1 AND user_id = $2")
                .bind(submission_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| e.any())?
                .map(|row| row.try_get("value"))
                .transpose()
                .map_err(|e| e.any())?;

        match vote {
            Some(value) => {
                query(
                    "INSERT INTO submission_votes (submission_id, user_id, value)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (submission_id, user_id) DO UPDATE SET value = $3",
                )
                .bind(submission_id)
                .bind(user_id)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(|e| e.any())?;
            }
            None => {
                query("DELETE FROM submission_votes WHERE submission_id = $1 AND user_id = $2")
                    .bind(submission_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| e.any())?;
            }
        }

        let up_delta = delta(previous, vote, 1);
        let down_delta = delta(previous, vote, -1);

        let row = query(
            "UPDATE submissions
             SET up_count = up_count + $1, down_count = down_count + $2
             WHERE id = $3
             RETURNING *",
        )
        .bind(up_delta)
        .bind(down_delta)
        .bind(submission_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| e.not_found_or("submission", "id"))?;

        tx.commit().await.map_err(|e| e.any())?;

        map_submission(&row)
    }

    async fn submission_vote(
        &self,
        submission_id: PrimaryKey,
        user_id: PrimaryKey,
    ) -> Result<Option<i32>> {
        query("SELECT value FROM submission_votes WHERE submission_id = $1 AND user_id = $2")
            .bind(submission_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.any())?
            .map(|row| row.try_get("value").map_err(|e| e.any()))
            .transpose()
    }

    async fn open_dj_tenure(&self, room_id: PrimaryKey, user_id: PrimaryKey) -> Result<()> {
        query("INSERT INTO dj_history (room_id, user_id) VALUES ($1, $2)")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn close_dj_tenure(
        &self,
        room_id: PrimaryKey,
        user_id: PrimaryKey,
        reason: DjReason,
    ) -> Result<()> {
        query(
            "UPDATE dj_history SET removed_at = now(), reason = $1
             WHERE room_id = $2 AND user_id = $3 AND removed_at IS NULL",
        )
        .bind(reason.as_str())
        .bind(room_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn dj_history(&self, room_id: PrimaryKey) -> Result<Vec<DjHistoryData>> {
        query("SELECT * FROM dj_history WHERE room_id = $1 ORDER BY became_dj_at ASC")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())?
            .iter()
            .map(map_history)
            .collect()
    }

    async fn create_message(&self, new_message: NewMessage) -> Result<MessageData> {
        query(
            "INSERT INTO messages (room_id, user_id, body)
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(new_message.room_id)
        .bind(new_message.user_id)
        .bind(&new_message.body)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
        .and_then(|row| map_message(&row))
    }
}

/// How a ballot change shifts one polarity's count
fn delta(previous: Option<i32>, next: Option<i32>, polarity: i32) -> i32 {
    let had = previous == Some(polarity);
    let has = next == Some(polarity);

    has as i32 - had as i32
}

fn map_user(row: &PgRow, prefix: &str) -> Result<UserData> {
    let column = |name: &str| format!("{prefix}{name}");

    Ok(UserData {
        id: row.try_get(column("id").as_str()).map_err(|e| e.any())?,
        username: row
            .try_get(column("username").as_str())
            .map_err(|e| e.any())?,
        password: row
            .try_get(column("password").as_str())
            .map_err(|e| e.any())?,
        display_name: row
            .try_get(column("display_name").as_str())
            .map_err(|e| e.any())?,
    })
}

fn map_room(row: &PgRow) -> Result<RoomData> {
    Ok(RoomData {
        id: row.try_get("id").map_err(|e| e.any())?,
        uuid: row.try_get("uuid").map_err(|e| e.any())?,
        code: row.try_get("code").map_err(|e| e.any())?,
        name: row.try_get("name").map_err(|e| e.any())?,
        password: row.try_get("password").map_err(|e| e.any())?,
        owner_id: row.try_get("owner_id").map_err(|e| e.any())?,
        settings: RoomSettings {
            max_members: row.try_get("max_members").map_err(|e| e.any())?,
            mutiny_threshold: row.try_get("mutiny_threshold").map_err(|e| e.any())?,
            dj_cooldown_minutes: row.try_get("dj_cooldown_minutes").map_err(|e| e.any())?,
            auto_randomize_dj: row.try_get("auto_randomize_dj").map_err(|e| e.any())?,
        },
        active: row.try_get("active").map_err(|e| e.any())?,
        created_at: row.try_get("created_at").map_err(|e| e.any())?,
    })
}

fn map_member(row: &PgRow) -> Result<RoomMemberData> {
    let role: String = row.try_get("role").map_err(|e| e.any())?;

    Ok(RoomMemberData {
        id: row.try_get("id").map_err(|e| e.any())?,
        owner: row.try_get("owner").map_err(|e| e.any())?,
        role: MemberRole::from_str(&role),
        joined_at: row.try_get("joined_at").map_err(|e| e.any())?,
        last_active: row.try_get("last_active").map_err(|e| e.any())?,
        user: map_user(row, "u_")?,
    })
}

fn map_submission(row: &PgRow) -> Result<SubmissionData> {
    Ok(SubmissionData {
        id: row.try_get("id").map_err(|e| e.any())?,
        room_id: row.try_get("room_id").map_err(|e| e.any())?,
        user_id: row.try_get("user_id").map_err(|e| e.any())?,
        video_id: row.try_get("video_id").map_err(|e| e.any())?,
        url: row.try_get("url").map_err(|e| e.any())?,
        title: row.try_get("title").map_err(|e| e.any())?,
        channel: row.try_get("channel").map_err(|e| e.any())?,
        thumbnail: row.try_get("thumbnail").map_err(|e| e.any())?,
        duration_seconds: row.try_get("duration_seconds").map_err(|e| e.any())?,
        up_count: row.try_get("up_count").map_err(|e| e.any())?,
        down_count: row.try_get("down_count").map_err(|e| e.any())?,
        played: row.try_get("played").map_err(|e| e.any())?,
        created_at: row.try_get("created_at").map_err(|e| e.any())?,
    })
}

fn map_history(row: &PgRow) -> Result<DjHistoryData> {
    Ok(DjHistoryData {
        id: row.try_get("id").map_err(|e| e.any())?,
        room_id: row.try_get("room_id").map_err(|e| e.any())?,
        user_id: row.try_get("user_id").map_err(|e| e.any())?,
        became_dj_at: row.try_get("became_dj_at").map_err(|e| e.any())?,
        removed_at: row.try_get("removed_at").map_err(|e| e.any())?,
        reason: row.try_get("reason").map_err(|e| e.any())?,
    })
}

fn map_message(row: &PgRow) -> Result<MessageData> {
    Ok(MessageData {
        id: row.try_get("id").map_err(|e| e.any())?,
        room_id: row.try_get("room_id").map_err(|e| e.any())?,
        user_id: row.try_get("user_id").map_err(|e| e.any())?,
        body: row.try_get("body").map_err(|e| e.any())?,
        sent_at: row.try_get("sent_at").map_err(|e| e.any())?,
    })
}

impl IntoDatabaseError for SqlxError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError {
        match self {
            SqlxError::RowNotFound => DatabaseError::NotFound {
                resource,
                identifier,
            },
            e => DatabaseError::Internal(Box::new(e)),
        }
    }

    fn any(self) -> DatabaseError {
        DatabaseError::Internal(Box::new(self))
    }
}
