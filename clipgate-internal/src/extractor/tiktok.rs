//! Production extractor for TikTok video pages.
//!
//! TikTok web pages embed their full rehydration state as JSON inside a
//! `<script>` tag. Fetching the page with a desktop browser user agent and
//! parsing that state yields the direct media URL and all the metadata the
//! page knows about, without driving a headless browser.

use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};

use super::{
    ExtractOptions, ExtractionErrorKind, ExtractionFailure, ResolvedVideo, VideoExtractor,
    VideoMetadata,
};

/// Sent when no user agent is configured. TikTok only serves the rehydration
/// payload to desktop browsers.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Current page layout embeds state under this script id.
const UNIVERSAL_DATA_SCRIPT_ID: &str = "__UNIVERSAL_DATA_FOR_REHYDRATION__";
/// Older layout, still served to some user agents.
const SIGI_STATE_SCRIPT_ID: &str = "SIGI_STATE";

const VIDEO_DETAIL_POINTER: &str = "/__DEFAULT_SCOPE__/webapp.video-detail";

pub struct TikTokExtractor {
    client: Client,
    hashtag_re: Regex,
    mention_re: Regex,
}

impl TikTokExtractor {
    pub fn new(client: Client) -> Result<Self, Error> {
        Ok(Self {
            client,
            hashtag_re: compile_pattern(r"#(\w+)")?,
            mention_re: compile_pattern(r"@(\w+)")?,
        })
    }

    /// Parse a fetched page into a resolved video. Split out from the fetch
    /// so it can be tested on captured markup.
    fn parse_document(
        &self,
        html: &str,
        options: &ExtractOptions,
    ) -> Result<ResolvedVideo, ExtractionFailure> {
        let item = extract_item(html)?;

        let video = item.get("video");
        let video_url = video
            .and_then(|video| str_field(video, "playAddr").or_else(|| str_field(video, "downloadAddr")))
            .ok_or_else(|| {
                ExtractionFailure::new(ExtractionErrorKind::Unknown, "No video URL found")
            })?;

        let metadata = options
            .want_metadata
            .then(|| self.metadata_from_item(&item, options));

        Ok(ResolvedVideo {
            video_url,
            metadata,
        })
    }

    fn metadata_from_item(&self, item: &Value, options: &ExtractOptions) -> VideoMetadata {
        let description = str_field(item, "desc");
        let stats = item.get("stats");
        let video = item.get("video");
        let music = item.get("music");

        // Author is an object on video-detail pages but collapses to the
        // bare username in some SIGI payloads
        let (author, author_username, author_id, author_avatar, author_verified) =
            match item.get("author") {
                Some(profile @ Value::Object(_)) => (
                    str_field(profile, "nickname"),
                    str_field(profile, "uniqueId"),
                    str_field(profile, "id"),
                    str_field(profile, "avatarLarger")
                        .or_else(|| str_field(profile, "avatarThumb")),
                    bool_field(profile, "verified"),
                ),
                Some(Value::String(username)) => {
                    (None, Some(username.clone()), None, None, false)
                }
                _ => (None, None, None, None, false),
            };

        let mut hashtags: Vec<String> = item
            .get("challenges")
            .and_then(Value::as_array)
            .map(|challenges| {
                challenges
                    .iter()
                    .filter_map(|challenge| str_field(challenge, "title"))
                    .map(|title| title.trim_start_matches('#').to_string())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(desc) = &description {
            hashtags.extend(captures(&self.hashtag_re, desc));
        }
        let hashtags = dedup_preserving_order(hashtags);

        let mentions = description
            .as_ref()
            .map(|desc| dedup_preserving_order(captures(&self.mention_re, desc)))
            .unwrap_or_default();

        let created_at = item
            .get("createTime")
            .and_then(unix_seconds)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        let (country, region) = if options.want_country {
            (str_field(item, "locationCreated"), str_field(item, "region"))
        } else {
            (None, None)
        };

        let resolution = video.and_then(|video| {
            let width = video.get("width").and_then(Value::as_u64)?;
            let height = video.get("height").and_then(Value::as_u64)?;
            Some(format!("{width}x{height}"))
        });

        VideoMetadata {
            video_id: str_field(item, "id").unwrap_or_default(),
            title: description.clone(),
            description,
            author,
            author_username,
            author_id,
            author_avatar,
            author_verified,
            views: count(stats, "playCount"),
            likes: count(stats, "diggCount"),
            comments: count(stats, "commentCount"),
            shares: count(stats, "shareCount"),
            bookmarks: count(stats, "collectCount"),
            duration: video
                .and_then(|video| video.get("duration"))
                .and_then(Value::as_u64)
                .and_then(|secs| u32::try_from(secs).ok()),
            format: video.and_then(|video| str_field(video, "format")),
            resolution,
            aspect_ratio: video.and_then(|video| str_field(video, "ratio")),
            filesize: video
                .and_then(|video| video.get("dataSize"))
                .and_then(Value::as_u64),
            thumbnail: video.and_then(|video| str_field(video, "cover")),
            cover_image: video.and_then(|video| str_field(video, "originCover")),
            dynamic_cover: video.and_then(|video| str_field(video, "dynamicCover")),
            music: music.and_then(|music| str_field(music, "title")),
            music_author: music.and_then(|music| str_field(music, "authorName")),
            music_id: music.and_then(|music| str_field(music, "id")),
            music_url: music.and_then(|music| str_field(music, "playUrl")),
            original_sound: music
                .and_then(|music| music.get("original"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            hashtags,
            mentions,
            country,
            region,
            created_at,
            uploaded_at: created_at,
            is_ad: bool_field(item, "isAd"),
            is_commerce: bool_field(item, "isCommerce"),
            language: str_field(item, "textLanguage"),
        }
    }
}

#[async_trait]
impl VideoExtractor for TikTokExtractor {
    async fn extract(
        &self,
        url: &str,
        options: &ExtractOptions,
    ) -> Result<ResolvedVideo, ExtractionFailure> {
        // Short links (vm.tiktok.com, vt.tiktok.com) redirect to the
        // canonical page; the client follows them
        let response = self.client.get(url).send().await.map_err(|error| {
            if error.is_timeout() {
                ExtractionFailure::new(
                    ExtractionErrorKind::Timeout,
                    format!(
                        "Fetching video page timed out: {}",
                        DisplayOrDebugGateway::new(error)
                    ),
                )
            } else {
                ExtractionFailure::classify(format!(
                    "Failed to fetch video page: {}",
                    DisplayOrDebugGateway::new(error)
                ))
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ExtractionFailure::classify("Video not found (HTTP 404)"));
        }
        if status == StatusCode::GONE {
            return Err(ExtractionFailure::classify("Video has been removed (HTTP 410)"));
        }
        if !status.is_success() {
            return Err(ExtractionFailure::classify(format!(
                "Upstream responded with HTTP {status}"
            )));
        }

        let html = response.text().await.map_err(|error| {
            ExtractionFailure::classify(format!(
                "Failed to read video page: {}",
                DisplayOrDebugGateway::new(error)
            ))
        })?;

        self.parse_document(&html, options)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|error| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Invalid extraction pattern `{pattern}`: {error}"),
        })
    })
}

/// Locate the item struct for the page's video in either embedded state
/// layout, surfacing the page's own status code when the video is gone.
fn extract_item(html: &str) -> Result<Value, ExtractionFailure> {
    if let Some(state) = embedded_json(html, UNIVERSAL_DATA_SCRIPT_ID) {
        if let Some(detail) = state.pointer(VIDEO_DETAIL_POINTER) {
            check_detail_status(detail)?;
            if let Some(item) = detail.pointer("/itemInfo/itemStruct") {
                return Ok(item.clone());
            }
        }
    }

    if let Some(state) = embedded_json(html, SIGI_STATE_SCRIPT_ID) {
        if let Some(items) = state.get("ItemModule").and_then(Value::as_object) {
            if let Some(item) = items.values().next() {
                return Ok(item.clone());
            }
        }
    }

    Err(ExtractionFailure::new(
        ExtractionErrorKind::Unknown,
        "Failed to extract video information",
    ))
}

/// Map the video-detail status code to a classified failure. Zero means the
/// item is present; the non-zero codes here were observed on private and
/// deleted videos.
fn check_detail_status(detail: &Value) -> Result<(), ExtractionFailure> {
    let code = detail
        .get("statusCode")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if code == 0 {
        return Ok(());
    }

    Err(match code {
        10216 | 10222 => ExtractionFailure::classify("Video is private"),
        10202 | 10204 => ExtractionFailure::classify("Video not found"),
        _ => {
            let message = detail
                .get("statusMsg")
                .and_then(Value::as_str)
                .unwrap_or("item unavailable");
            ExtractionFailure::classify(format!("Upstream status {code}: {message}"))
        }
    })
}

/// Pull the JSON body out of `<script id="..." type="application/json">`.
fn embedded_json(html: &str, script_id: &str) -> Option<Value> {
    let marker = format!("<script id=\"{script_id}\" type=\"application/json\">");
    let start = html.find(&marker)? + marker.len();
    let end = html[start..].find("</script>")? + start;
    serde_json::from_str(&html[start..end]).ok()
}

fn captures(re: &Regex, text: &str) -> Vec<String> {
    re.captures_iter(text)
        .filter_map(|capture| capture.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Engagement counters are numbers in most payloads but strings in some.
fn count(stats: Option<&Value>, key: &str) -> u64 {
    match stats.and_then(|stats| stats.get(key)) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Upload timestamps appear as unix seconds, sometimes serialized as a
/// string.
fn unix_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn dedup_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}
