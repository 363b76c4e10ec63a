use axum::{
    extract::{Path, State},
    routing::{get, patch, post},
    Json,
};
use jukebox_collab::{NewRoomParams, UpdatedRoomSettings};

use crate::{
    auth::Session,
    context::ServerContext,
    errors::{ServerError, ServerResult},
    schemas::{CreateRoomSchema, JoinRoomSchema, UpdateSettingsSchema, ValidatedJson},
    serialized::{DjHistoryEntry, Room, RoomMember, RoomSettingsView, ToSerialized},
    Router,
};

#[utoipa::path(
    get,
    path = "/v1/rooms",
    tag = "rooms",
    responses((status = 200, body = [Room]))
)]
pub(crate) async fn list_rooms(_session: Session, State(context): State<ServerContext>) -> Json<Vec<Room>> {
    let rooms: Vec<_> = context
        .collab
        .rooms
        .list_all()
        .into_iter()
        .map(|r| r.data().to_serialized())
        .collect();

    Json(rooms)
}

#[utoipa::path(
    get,
    path = "/v1/rooms/{code}",
    tag = "rooms",
    responses((status = 200, body = Room))
)]
pub(crate) async fn room(
    _session: Session,
    State(context): State<ServerContext>,
    Path(code): Path<String>,
) -> ServerResult<Json<Room>> {
    let room = context.collab.rooms.room_by_code(&code)?;

    Ok(Json(room.data().to_serialized()))
}

#[utoipa::path(
    post,
    path = "/v1/rooms",
    tag = "rooms",
    request_body = CreateRoomSchema,
    responses((status = 200, body = Room))
)]
pub(crate) async fn create_room(
    session: Session,
    State(context): State<ServerContext>,
    ValidatedJson(body): ValidatedJson<CreateRoomSchema>,
) -> ServerResult<Json<Room>> {
    let defaults = context.collab.context.default_settings();

    let settings = jukebox_collab::RoomSettings {
        max_members: body.max_members.unwrap_or(defaults.max_members),
        mutiny_threshold: body.mutiny_threshold.unwrap_or(defaults.mutiny_threshold),
        dj_cooldown_minutes: body
            .dj_cooldown_minutes
            .unwrap_or(defaults.dj_cooldown_minutes),
        auto_randomize_dj: body
            .auto_randomize_dj
            .unwrap_or(defaults.auto_randomize_dj),
    };

    let room = context
        .collab
        .rooms
        .create_room(NewRoomParams {
            name: body.name,
            password: body.password,
            user_id: session.user().id,
            settings: Some(settings),
        })
        .await?;

    Ok(Json(room.data().to_serialized()))
}

#[utoipa::path(
    post,
    path = "/v1/rooms/{code}/join",
    tag = "rooms",
    request_body = JoinRoomSchema,
    responses((status = 200, body = RoomMember))
)]
pub(crate) async fn join_room(
    session: Session,
    State(context): State<ServerContext>,
    Path(code): Path<String>,
    ValidatedJson(body): ValidatedJson<JoinRoomSchema>,
) -> ServerResult<Json<RoomMember>> {
    let (_, member) = context
        .collab
        .rooms
        .join_room(session.user().id, &code, body.password.as_deref())
        .await?;

    Ok(Json(member.to_serialized()))
}

#[utoipa::path(
    post,
    path = "/v1/rooms/{code}/leave",
    tag = "rooms",
    responses((status = 200))
)]
pub(crate) async fn leave_room(
    session: Session,
    State(context): State<ServerContext>,
    Path(code): Path<String>,
) -> ServerResult<()> {
    let room = context.collab.rooms.room_by_code(&code)?;

    context
        .collab
        .controller
        .leave(&room, session.user().id)
        .await?;

    Ok(())
}

#[utoipa::path(
    patch,
    path = "/v1/rooms/{code}/settings",
    tag = "rooms",
    request_body = UpdateSettingsSchema,
    responses((status = 200, body = RoomSettingsView))
)]
pub(crate) async fn update_settings(
    session: Session,
    State(context): State<ServerContext>,
    Path(code): Path<String>,
    ValidatedJson(body): ValidatedJson<UpdateSettingsSchema>,
) -> ServerResult<Json<RoomSettingsView>> {
    let room = context.collab.rooms.room_by_code(&code)?;

    if !room.is_owner(session.user().id) {
        return Err(ServerError::Forbidden(
            "Only the owner can change room settings".to_string(),
        ));
    }

    let settings = context
        .collab
        .rooms
        .update_settings(
            &room,
            UpdatedRoomSettings {
                max_members: body.max_members,
                mutiny_threshold: body.mutiny_threshold,
                dj_cooldown_minutes: body.dj_cooldown_minutes,
                auto_randomize_dj: body.auto_randomize_dj,
            },
        )
        .await?;

    Ok(Json(settings.to_serialized()))
}

#[utoipa::path(
    get,
    path = "/v1/rooms/{code}/history",
    tag = "rooms",
    responses((status = 200, body = [DjHistoryEntry]))
)]
pub(crate) async fn dj_history(
    session: Session,
    State(context): State<ServerContext>,
    Path(code): Path<String>,
) -> ServerResult<Json<Vec<DjHistoryEntry>>> {
    let room = context.collab.rooms.room_by_code(&code)?;

    // The audit log is for members only.
    room.member_by_user_id(session.user().id)?;

    let history = context
        .collab
        .context
        .database
        .dj_history(room.id())
        .await?;

    Ok(Json(history.to_serialized()))
}

pub fn router() -> Router {
    Router::new()
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/:code", get(room))
        .route("/rooms/:code/join", post(join_room))
        .route("/rooms/:code/leave", post(leave_room))
        .route("/rooms/:code/settings", patch(update_settings))
        .route("/rooms/:code/history", get(dj_history))
}
