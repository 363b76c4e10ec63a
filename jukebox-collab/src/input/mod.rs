use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use url::Url;

mod youtube;
pub use youtube::*;

use jukebox_core::Config;

lazy_static! {
    static ref WATCH_ID_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap();
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("Input is invalid: {0}")]
    Invalid(String),

    #[error("Input type is supported but resource was not found")]
    NotFound,

    #[error("Upstream refused the request due to rate limiting")]
    RateLimited,

    #[error("Upstream quota is exhausted")]
    QuotaExceeded,

    #[error("Upstream did not answer in time")]
    Timeout,

    #[error("Failed to fetch resource: {0}")]
    FetchError(String),

    #[error("Failed to parse resource: {0}")]
    ParseError(String),
}

/// Represents metadata of a submitted track
#[derive(Debug, Clone)]
pub struct Metadata {
    pub video_id: String,
    pub title: String,
    pub channel: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: i32,
}

/// Represents a type that can turn a video id into track metadata
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn lookup(&self, video_id: &str) -> Result<Metadata, InputError>;
}

struct CachedMetadata {
    metadata: Metadata,
    fetched_at: Instant,
}

/// Resolves submitted URLs into playable metadata, caching lookups per video
/// id so resubmissions within the TTL don't hit the upstream again.
pub struct MediaResolver {
    provider: Arc<dyn MetadataProvider>,
    cache: DashMap<String, CachedMetadata>,
    cache_ttl: Duration,
    request_timeout: Duration,
}

impl MediaResolver {
    pub fn new(config: &Config, provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            cache: Default::default(),
            cache_ttl: config.metadata_cache_ttl(),
            request_timeout: config.metadata_request_timeout(),
        }
    }

    /// Resolves a submitted URL. Failures come back classified; there are no
    /// automatic retries.
    pub async fn resolve_media(&self, url: &str) -> Result<Metadata, InputError> {
        let video_id = parse_video_id(url)?;

        if let Some(cached) = self.cache.get(&video_id) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.metadata.clone());
            }
        }

        let metadata = tokio::time::timeout(self.request_timeout, self.provider.lookup(&video_id))
            .await
            .map_err(|_| InputError::Timeout)??;

        self.cache.insert(
            video_id,
            CachedMetadata {
                metadata: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(metadata)
    }
}

/// Extracts the video id from the URL forms clients submit.
pub fn parse_video_id(raw: &str) -> Result<String, InputError> {
    let url = Url::parse(raw).map_err(|e| InputError::Invalid(e.to_string()))?;

    let host = url
        .host_str()
        .ok_or_else(|| InputError::Invalid("URL has no host".to_string()))?
        .trim_start_matches("www.")
        .trim_start_matches("music.");

    let candidate = match host {
        "youtu.be" => url.path().trim_start_matches('/').to_string(),
        "youtube.com" => {
            if url.path() == "/watch" {
                url.query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned())
                    .ok_or_else(|| InputError::Invalid("Missing v parameter".to_string()))?
            } else if let Some(id) = url
                .path()
                .strip_prefix("/v/")
                .or_else(|| url.path().strip_prefix("/embed/"))
            {
                id.to_string()
            } else {
                return Err(InputError::Invalid(format!(
                    "Unsupported path: {}",
                    url.path()
                )));
            }
        }
        other => return Err(InputError::Invalid(format!("Unsupported host: {other}"))),
    };

    if !WATCH_ID_REGEX.is_match(&candidate) {
        return Err(InputError::Invalid(format!(
            "Not a video id: {candidate}"
        )));
    }

    Ok(candidate)
}
