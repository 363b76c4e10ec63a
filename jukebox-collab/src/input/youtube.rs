use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{InputError, Metadata, MetadataProvider};

const VIDEOS_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/videos";

lazy_static! {
    // ISO 8601 durations as the Data API emits them, e.g. PT1H2M3S
    static ref DURATION_REGEX: Regex =
        Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?$").unwrap();
}

/// Resolves metadata through the YouTube Data API.
pub struct YouTubeMetadata {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    items: Vec<Video>,
}

#[derive(Debug, Deserialize)]
struct Video {
    id: String,
    snippet: Snippet,
    #[serde(rename = "contentDetails")]
    content_details: ContentDetails,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    title: String,
    #[serde(rename = "channelTitle")]
    channel_title: String,
    thumbnails: Thumbnails,
}

#[derive(Debug, Deserialize)]
struct Thumbnails {
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    duration: String,
}

impl YouTubeMetadata {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl MetadataProvider for YouTubeMetadata {
    async fn lookup(&self, video_id: &str) -> Result<Metadata, InputError> {
        let response = self
            .client
            .get(VIDEOS_ENDPOINT)
            .query(&[
                ("part", "snippet,contentDetails"),
                ("id", video_id),
                ("key", &self.api_key),
            ])
            .send()
            .await
            .map_err(|e| InputError::FetchError(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => return Err(InputError::QuotaExceeded),
            StatusCode::TOO_MANY_REQUESTS => return Err(InputError::RateLimited),
            status => return Err(InputError::FetchError(format!("Upstream returned {status}"))),
        }

        let listing: VideoListResponse = response
            .json()
            .await
            .map_err(|e| InputError::ParseError(e.to_string()))?;

        let video = listing.items.into_iter().next().ok_or(InputError::NotFound)?;

        video.try_into()
    }
}

impl TryFrom<Video> for Metadata {
    type Error = InputError;

    fn try_from(video: Video) -> Result<Self, Self::Error> {
        let duration_seconds = parse_iso8601_duration(&video.content_details.duration)?;

        let thumbnail = video
            .snippet
            .thumbnails
            .medium
            .or(video.snippet.thumbnails.default)
            .map(|t| t.url);

        Ok(Metadata {
            video_id: video.id,
            title: video.snippet.title,
            channel: video.snippet.channel_title,
            thumbnail,
            duration_seconds,
        })
    }
}

fn parse_iso8601_duration(raw: &str) -> Result<i32, InputError> {
    let captures = DURATION_REGEX
        .captures(raw)
        .ok_or_else(|| InputError::ParseError(format!("Bad duration: {raw}")))?;

    let part = |index: usize| {
        captures
            .get(index)
            .map(|m| m.as_str().parse::<i32>().unwrap_or_default())
            .unwrap_or_default()
    };

    Ok(part(1) * 3600 + part(2) * 60 + part(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_iso8601_duration("PT3M20S").unwrap(), 200);
        assert_eq!(parse_iso8601_duration("PT1H2M3S").unwrap(), 3723);
        assert_eq!(parse_iso8601_duration("PT45S").unwrap(), 45);
        assert_eq!(parse_iso8601_duration("PT2H").unwrap(), 7200);
        assert!(parse_iso8601_duration("3 minutes").is_err());
    }
}
