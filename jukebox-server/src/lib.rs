use std::{
    env,
    net::{Ipv6Addr, SocketAddr},
    sync::Arc,
};

use axum::{routing::get, Json};
use log::info;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use jukebox_collab::Collab;

mod auth;
mod context;
mod errors;
mod gateway;
mod rooms;
mod schemas;
mod serialized;

pub mod logging;

use context::ServerContext;

/// The default port the server will listen on.
pub const DEFAULT_PORT: u16 = 9050;

type Router = axum::Router<ServerContext>;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "jukebox API",
        description = "Exposes endpoints to interact with a jukebox server"
    ),
    paths(
        auth::user,
        auth::register,
        auth::login,
        auth::logout,
        rooms::list_rooms,
        rooms::room,
        rooms::create_room,
        rooms::join_room,
        rooms::leave_room,
        rooms::update_settings,
        rooms::dj_history,
    ),
    components(schemas(
        errors::ExceptionFrame,
        schemas::RegisterSchema,
        schemas::LoginSchema,
        schemas::CreateRoomSchema,
        schemas::JoinRoomSchema,
        schemas::UpdateSettingsSchema,
        serialized::User,
        serialized::LoginResult,
        serialized::Room,
        serialized::RoomSettingsView,
        serialized::RoomMember,
        serialized::QueueEntry,
        serialized::TrackRef,
        serialized::Playback,
        serialized::Vote,
        serialized::CandidateTally,
        serialized::RoomState,
        serialized::DjHistoryEntry,
        gateway::ServerEvent,
    ))
)]
struct ApiDoc;

/// Starts the jukebox server
pub async fn run_server(collab: Collab) {
    let context = ServerContext {
        collab: Arc::new(collab),
    };

    let port = env::var("JUKEBOX_SERVER_PORT")
        .map(|x| x.parse::<u16>().expect("Port must be a number"))
        .unwrap_or(DEFAULT_PORT);

    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let version_one_router = Router::new()
        .nest("/auth", auth::router())
        .merge(rooms::router())
        .merge(gateway::router());

    let root_router = Router::new()
        .nest("/v1", version_one_router)
        .route("/api.json", get(serve_api))
        .with_state(context)
        .layer(cors);

    let listener = TcpListener::bind(&addr).await.expect("listens on address");

    info!("Listening on port {port}");

    axum::serve(listener, root_router.into_make_service())
        .await
        .expect("server runs");
}

async fn serve_api() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
