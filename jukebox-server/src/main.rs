use std::env;
use std::str::FromStr;
use std::sync::Arc;

use jukebox_collab::{Collab, YouTubeMetadata};
use jukebox_core::Config;
use jukebox_server::{logging, run_server};

#[tokio::main]
async fn main() {
    logging::init_logger();

    let database_url = env::var("JUKEBOX_DATABASE_URL").expect("JUKEBOX_DATABASE_URL is set");
    let api_key = env::var("JUKEBOX_YOUTUBE_API_KEY").expect("JUKEBOX_YOUTUBE_API_KEY is set");

    let provider = Arc::new(YouTubeMetadata::new(api_key));

    let collab = Collab::new(config_from_env(), &database_url, provider).await;
    collab.init().await;

    run_server(collab).await;
}

/// Builds the runtime config from `JUKEBOX_*` environment variables, falling
/// back to the documented defaults.
fn config_from_env() -> Config {
    let defaults = Config::default();

    Config {
        playback_lead_min_ms: env_or("JUKEBOX_PLAYBACK_LEAD_MIN_MS", defaults.playback_lead_min_ms),
        playback_lead_max_ms: env_or("JUKEBOX_PLAYBACK_LEAD_MAX_MS", defaults.playback_lead_max_ms),
        vote_timeout_ms: env_or("JUKEBOX_VOTE_TIMEOUT_MS", defaults.vote_timeout_ms),
        mutiny_cooldown_ms: env_or("JUKEBOX_MUTINY_COOLDOWN_MS", defaults.mutiny_cooldown_ms),
        dj_grace_ms: env_or("JUKEBOX_DJ_GRACE_MS", defaults.dj_grace_ms),
        dj_cooldown_default_mins: env_or(
            "JUKEBOX_DJ_COOLDOWN_DEFAULT_MINS",
            defaults.dj_cooldown_default_mins,
        ),
        metadata_cache_ttl_ms: env_or(
            "JUKEBOX_METADATA_CACHE_TTL_MS",
            defaults.metadata_cache_ttl_ms,
        ),
        metadata_request_timeout_ms: env_or(
            "JUKEBOX_METADATA_REQUEST_TIMEOUT_MS",
            defaults.metadata_request_timeout_ms,
        ),
        sync_offset_sanity_cap_ms: env_or(
            "JUKEBOX_SYNC_OFFSET_SANITY_CAP_MS",
            defaults.sync_offset_sanity_cap_ms,
        ),
        sync_record_ttl_ms: env_or("JUKEBOX_SYNC_RECORD_TTL_MS", defaults.sync_record_ttl_ms),
        max_members_default: env_or("JUKEBOX_MAX_MEMBERS_DEFAULT", defaults.max_members_default),
        mutiny_threshold_default: env_or(
            "JUKEBOX_MUTINY_THRESHOLD_DEFAULT",
            defaults.mutiny_threshold_default,
        ),
        queue_autoremove_threshold: env::var("JUKEBOX_QUEUE_AUTOREMOVE_THRESHOLD")
            .ok()
            .map(|v| {
                v.parse()
                    .expect("JUKEBOX_QUEUE_AUTOREMOVE_THRESHOLD must be a number")
            }),
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => panic!("{name} must be a number"),
        },
        Err(_) => default,
    }
}
