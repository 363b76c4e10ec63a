use std::time::Duration;

/// The configuration of the room runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// The minimum lead before a scheduled playback start, in milliseconds
    pub playback_lead_min_ms: u64,
    /// The maximum lead before a scheduled playback start, in milliseconds
    pub playback_lead_max_ms: u64,
    /// How long a vote session stays open before it fails, in milliseconds
    pub vote_timeout_ms: u64,
    /// How long a failed mutiny blocks a new mutiny against the same DJ, in milliseconds
    pub mutiny_cooldown_ms: u64,
    /// How long a disconnected DJ keeps the slot before removal, in milliseconds
    pub dj_grace_ms: u64,
    /// Default for a room's DJ cooldown after a mutiny removal, in minutes
    pub dj_cooldown_default_mins: u64,
    /// How long resolved media metadata is cached, in milliseconds
    pub metadata_cache_ttl_ms: u64,
    /// Hard timeout for a single metadata lookup, in milliseconds
    pub metadata_request_timeout_ms: u64,
    /// Clock offsets with an absolute value above this are discarded, in milliseconds
    pub sync_offset_sanity_cap_ms: i64,
    /// How long a per-connection sync record lives after its last update, in milliseconds
    pub sync_record_ttl_ms: u64,
    /// Default member capacity for new rooms
    pub max_members_default: u32,
    /// Default yes-share required for a mutiny to pass
    pub mutiny_threshold_default: f64,
    /// Net score at or below which a queue entry is removed, if enabled
    pub queue_autoremove_threshold: Option<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            playback_lead_min_ms: 500,
            playback_lead_max_ms: 2_000,
            vote_timeout_ms: 60_000,
            mutiny_cooldown_ms: 60_000,
            dj_grace_ms: 30_000,
            dj_cooldown_default_mins: 5,
            metadata_cache_ttl_ms: 3_600_000,
            metadata_request_timeout_ms: 10_000,
            sync_offset_sanity_cap_ms: 30_000,
            sync_record_ttl_ms: 3_600_000,
            max_members_default: 50,
            mutiny_threshold_default: 0.51,
            queue_autoremove_threshold: None,
        }
    }
}

impl Config {
    /// Clamps a raw lead to the configured bounds
    pub fn clamp_lead(&self, lead_ms: u64) -> u64 {
        lead_ms.clamp(self.playback_lead_min_ms, self.playback_lead_max_ms)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn mutiny_cooldown(&self) -> Duration {
        Duration::from_millis(self.mutiny_cooldown_ms)
    }

    pub fn dj_grace(&self) -> Duration {
        Duration::from_millis(self.dj_grace_ms)
    }

    pub fn metadata_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.metadata_cache_ttl_ms)
    }

    pub fn metadata_request_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_request_timeout_ms)
    }

    pub fn sync_record_ttl(&self) -> Duration {
        Duration::from_millis(self.sync_record_ttl_ms)
    }
}
