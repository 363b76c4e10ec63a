mod auth;
mod controller;
mod db;
mod dj;
mod input;
mod playback;
mod queue;
mod rooms;
mod util;
mod votes;

pub mod events;

#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use events::{room_topic, RoomEvent};

pub use auth::*;
pub use controller::*;
pub use db::*;
pub use dj::*;
pub use input::*;
pub use playback::*;
pub use queue::*;
pub use rooms::*;
pub use votes::*;

use jukebox_core::{ClockSync, Config, Fabric, MemoryStore, StateStore};

/// How often the in-process state store drops expired entries
const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The jukebox room runtime: rooms, queues, votes, DJs, and synchronized
/// playback over one shared state store and broadcast fabric.
pub struct Collab {
    pub auth: Auth,
    pub rooms: Arc<RoomManager>,
    pub controller: RoomController,
    pub sync: Arc<ClockSync>,

    pub queue: Arc<QueueEngine>,
    pub playback: Arc<PlaybackCoordinator>,
    pub dj: Arc<DjStateMachine>,
    pub votes: Arc<VoteEngine>,

    pub context: CollabContext,
}

/// A type passed to the components of the collab system, to access state and
/// publish events.
#[derive(Clone)]
pub struct CollabContext {
    pub config: Config,
    pub database: Arc<dyn Database>,
    pub store: Arc<dyn StateStore>,
    pub fabric: Arc<Fabric<RoomEvent>>,
    pub sync: Arc<ClockSync>,
    pub rooms: Arc<DashMap<RoomId, Arc<Room>>>,
}

impl Collab {
    /// Connects to the database and assembles the runtime. Must be followed
    /// by [Collab::init].
    pub async fn new(
        config: Config,
        database_url: &str,
        provider: Arc<dyn MetadataProvider>,
    ) -> Self {
        let database = Arc::new(
            PgDatabase::new(database_url)
                .await
                .expect("database is created"),
        );

        let store = Arc::new(MemoryStore::new());
        spawn_store_sweeper(&store);

        Self::with_parts(config, database, store, provider)
    }

    /// Assembles the runtime from its parts. The component graph is wired
    /// explicitly: queue, then playback on top of it, then the DJ machine,
    /// then votes, with the controller composing all of them.
    pub fn with_parts(
        config: Config,
        database: Arc<dyn Database>,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn MetadataProvider>,
    ) -> Self {
        let fabric = Fabric::new();
        let sync = Arc::new(ClockSync::new(&config, store.clone()));

        let context = CollabContext {
            config: config.clone(),
            database: database.clone(),
            store: store.clone(),
            fabric,
            sync: sync.clone(),
            rooms: Default::default(),
        };

        let resolver = Arc::new(MediaResolver::new(&config, provider));
        let dj_slot = DjSlot::new(&store);
        let playback_slot = PlaybackSlot::new(&store);

        let rooms = Arc::new(RoomManager::new(&context));
        let auth = Auth::new(&database);

        let queue = Arc::new(QueueEngine::new(&context, resolver, playback_slot.clone()));

        let playback = Arc::new(PlaybackCoordinator::new(
            &context,
            queue.clone(),
            dj_slot.clone(),
            playback_slot,
        ));

        let dj = Arc::new(DjStateMachine::new(&context, playback.clone(), dj_slot));
        let votes = VoteEngine::new(&context, dj.clone());

        let controller = RoomController::new(
            &context,
            rooms.clone(),
            queue.clone(),
            playback.clone(),
            dj.clone(),
            votes.clone(),
        );

        Self {
            auth,
            rooms,
            controller,
            sync,
            queue,
            playback,
            dj,
            votes,
            context,
        }
    }

    /// Must be called after creation
    pub async fn init(&self) {
        self.rooms.restore().await.expect("rooms are restored");
    }
}

impl CollabContext {
    /// Publishes a single event on a room's topic.
    pub fn emit(&self, room_id: RoomId, event: RoomEvent) {
        self.fabric.publish(&room_topic(room_id), event);
    }

    /// Publishes a batch of events in one critical section, so every
    /// recipient observes them in this order.
    pub fn emit_all(&self, room_id: RoomId, events: Vec<RoomEvent>) {
        self.fabric.publish_all(&room_topic(room_id), events);
    }

    /// The settings a room starts out with
    pub fn default_settings(&self) -> RoomSettings {
        RoomSettings {
            max_members: self.config.max_members_default as i32,
            mutiny_threshold: self.config.mutiny_threshold_default,
            dj_cooldown_minutes: self.config.dj_cooldown_default_mins as i32,
            auto_randomize_dj: false,
        }
    }
}

fn spawn_store_sweeper(store: &Arc<MemoryStore>) {
    let store = store.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STORE_SWEEP_INTERVAL);

        loop {
            interval.tick().await;
            store.sweep();
        }
    });
}
