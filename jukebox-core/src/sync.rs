use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{now_ms, Config, Id, StateStore, StateStoreExt};

/// Kind marker for [ConnectionId].
pub enum ConnectionKind {}

/// Identifies one client connection for the lifetime of its socket.
pub type ConnectionId = Id<ConnectionKind>;

/// What the server knows about one connection's clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    /// `server_t1 - client_t0` of the most recent usable ping.
    pub clock_offset_ms: i64,
    /// The round-trip the client last reported, if any.
    pub last_rtt_ms: Option<u64>,
    pub last_updated_ms: i64,
}

/// The reply to a `sync:ping`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SyncPong {
    pub client_t0: i64,
    /// When the server began processing the ping.
    pub server_t1: i64,
    /// The instant just before the reply was sent.
    pub server_t2: i64,
}

/// Tracks per-connection clock offsets and round-trips.
///
/// Clients own their offset estimation; the server keeps these records for
/// observability and so the playback coordinator can size its start lead
/// from observed round-trips.
pub struct ClockSync {
    config: Config,
    store: Arc<dyn StateStore>,
}

impl ClockSync {
    pub fn new(config: &Config, store: Arc<dyn StateStore>) -> Self {
        Self {
            config: config.clone(),
            store,
        }
    }

    /// Answers a timing probe. The record update is best-effort: a store
    /// failure is logged and the pong is returned regardless.
    pub async fn ping(&self, connection_id: ConnectionId, client_t0: i64) -> SyncPong {
        let server_t1 = now_ms();
        let offset = server_t1 - client_t0;

        if offset.abs() <= self.config.sync_offset_sanity_cap_ms {
            self.update_record(connection_id, |record| {
                record.clock_offset_ms = offset;
            })
            .await;
        }

        SyncPong {
            client_t0,
            server_t1,
            server_t2: now_ms(),
        }
    }

    /// Stores the round-trip a client observed for itself.
    pub async fn report_rtt(&self, connection_id: ConnectionId, rtt_ms: u64) {
        self.update_record(connection_id, |record| {
            record.last_rtt_ms = Some(rtt_ms);
        })
        .await;
    }

    /// Returns the sync record for a connection, if one exists. Reads are
    /// non-critical; a store failure degrades to "unknown".
    pub async fn record(&self, connection_id: ConnectionId) -> Option<SyncRecord> {
        self.store
            .get_as(&record_key(connection_id))
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to read sync record for connection {connection_id}: {e}");
                None
            })
    }

    /// Drops the record for a disconnected socket.
    pub async fn forget(&self, connection_id: ConnectionId) {
        if let Err(e) = self.store.remove(&record_key(connection_id)).await {
            warn!("Failed to drop sync record for connection {connection_id}: {e}");
        }
    }

    /// Returns the given percentile of the last-reported round-trips among
    /// the given connections, or `None` when no round-trip is known at all.
    pub async fn rtt_percentile(
        &self,
        connection_ids: &[ConnectionId],
        percentile: f64,
    ) -> Option<u64> {
        let mut rtts = vec![];

        for &id in connection_ids {
            if let Some(rtt) = self.record(id).await.and_then(|r| r.last_rtt_ms) {
                rtts.push(rtt);
            }
        }

        if rtts.is_empty() {
            return None;
        }

        rtts.sort_unstable();

        let rank = (percentile * rtts.len() as f64).ceil() as usize;
        Some(rtts[rank.clamp(1, rtts.len()) - 1])
    }

    async fn update_record<F>(&self, connection_id: ConnectionId, apply: F)
    where
        F: FnOnce(&mut SyncRecord),
    {
        let key = record_key(connection_id);

        let mut record = self
            .store
            .get_as(&key)
            .await
            .ok()
            .flatten()
            .unwrap_or(SyncRecord {
                clock_offset_ms: 0,
                last_rtt_ms: None,
                last_updated_ms: 0,
            });

        apply(&mut record);
        record.last_updated_ms = now_ms();

        let result = self
            .store
            .put_as(&key, &record, Some(self.config.sync_record_ttl()))
            .await;

        if let Err(e) = result {
            warn!("Failed to store sync record for connection {connection_id}: {e}");
        }
    }
}

fn record_key(connection_id: ConnectionId) -> String {
    format!("socket:{}:sync", connection_id)
}
