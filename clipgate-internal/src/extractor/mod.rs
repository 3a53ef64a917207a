pub mod tiktok;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config_parser::ExtractorConfig;
use crate::error::{Error, ErrorDetails};

/// Substrings that mark a URL as a TikTok video link. Matching is done on
/// the lowercased URL.
const VALID_URL_PATTERNS: [&str; 6] = [
    "tiktok.com/@",
    "tiktok.com/t/",
    "vm.tiktok.com/",
    "vt.tiktok.com/",
    "tiktok.com/video/",
    "m.tiktok.com/",
];

const MIN_URL_LENGTH: usize = 20;

/// Validate a video URL before any network call. Invalid input is rejected
/// here and never reaches an extractor.
pub fn validate_url(url: &str) -> Result<(), Error> {
    if url.is_empty() {
        return Err(Error::new(ErrorDetails::InvalidUrl {
            message: "URL cannot be empty".to_string(),
        }));
    }

    let lowered = url.to_lowercase();
    if !VALID_URL_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
    {
        return Err(Error::new(ErrorDetails::InvalidUrl {
            message: "Invalid TikTok URL format".to_string(),
        }));
    }

    if url.len() < MIN_URL_LENGTH {
        return Err(Error::new(ErrorDetails::InvalidUrl {
            message: "URL too short to be valid".to_string(),
        }));
    }

    if url.contains(' ') {
        return Err(Error::new(ErrorDetails::InvalidUrl {
            message: "URL contains spaces".to_string(),
        }));
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub want_metadata: bool,
    pub want_country: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            want_metadata: true,
            want_country: false,
        }
    }
}

/// Everything the source exposes about a video. Only the id is guaranteed;
/// the rest depends on what the page carried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub video_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub author_username: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_avatar: Option<String>,
    #[serde(default)]
    pub author_verified: bool,

    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub shares: u64,
    #[serde(default)]
    pub bookmarks: u64,

    /// Seconds.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    /// Bytes.
    #[serde(default)]
    pub filesize: Option<u64>,

    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub dynamic_cover: Option<String>,

    #[serde(default)]
    pub music: Option<String>,
    #[serde(default)]
    pub music_author: Option<String>,
    #[serde(default)]
    pub music_id: Option<String>,
    #[serde(default)]
    pub music_url: Option<String>,
    #[serde(default)]
    pub original_sound: bool,

    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub mentions: Vec<String>,

    /// Filled only when country detection was requested and entitled.
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub is_ad: bool,
    #[serde(default)]
    pub is_commerce: bool,
    #[serde(default)]
    pub language: Option<String>,
}

/// A successfully resolved video: the direct media URL plus whatever
/// metadata was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVideo {
    pub video_url: String,
    pub metadata: Option<VideoMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExtractionErrorKind {
    Private,
    NotFound,
    Removed,
    Timeout,
    Unknown,
}

/// A classified extraction failure. These are request outcomes, not gateway
/// errors: the envelope reports them with HTTP 200 and `success: false`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionFailure {
    pub kind: ExtractionErrorKind,
    pub message: String,
}

impl ExtractionFailure {
    pub fn new(kind: ExtractionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a failure from its message text.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        let kind = if lowered.contains("private") {
            ExtractionErrorKind::Private
        } else if lowered.contains("not found") || lowered.contains("404") {
            ExtractionErrorKind::NotFound
        } else if lowered.contains("removed") {
            ExtractionErrorKind::Removed
        } else {
            ExtractionErrorKind::Unknown
        };
        Self { kind, message }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            kind: ExtractionErrorKind::Timeout,
            message: format!("Extraction timed out after {}s", timeout.as_secs()),
        }
    }
}

impl std::fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExtractionFailure {}

/// The seam between the pipeline and the upstream source. Production uses
/// [`tiktok::TikTokExtractor`]; tests substitute scripted doubles.
#[async_trait]
pub trait VideoExtractor: Send + Sync {
    async fn extract(
        &self,
        url: &str,
        options: &ExtractOptions,
    ) -> Result<ResolvedVideo, ExtractionFailure>;
}

/// Drives an extractor with a per-attempt timeout and exponential backoff
/// between attempts. Attempts run on a spawned task, so a caller that stops
/// waiting (disconnect, timeout) never cancels an extraction mid-flight.
pub struct ExtractionRetrier {
    extractor: Arc<dyn VideoExtractor>,
    attempt_timeout: Duration,
    max_retries: u32,
}

impl ExtractionRetrier {
    pub fn new(extractor: Arc<dyn VideoExtractor>, config: &ExtractorConfig) -> Self {
        Self {
            extractor,
            attempt_timeout: Duration::from_secs(config.timeout_s),
            max_retries: config.max_retries,
        }
    }

    /// Backoff between attempts: 1s, 2s, 4s, ... `max_times` counts retries
    /// after the first attempt.
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_factor(2.0)
            .with_max_times(self.max_retries.saturating_sub(1) as usize)
    }

    async fn attempt(
        &self,
        url: &str,
        options: ExtractOptions,
    ) -> Result<ResolvedVideo, ExtractionFailure> {
        let extractor = Arc::clone(&self.extractor);
        let url = url.to_string();
        let handle = tokio::spawn(async move { extractor.extract(&url, &options).await });

        match tokio::time::timeout(self.attempt_timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(ExtractionFailure::new(
                ExtractionErrorKind::Unknown,
                format!("Extraction task failed: {join_error}"),
            )),
            // The spawned attempt keeps running; we just stop waiting for it
            Err(_) => Err(ExtractionFailure::timed_out(self.attempt_timeout)),
        }
    }

    /// Run the extraction with retries. The first success returns
    /// immediately; exhaustion returns the last failure.
    pub async fn extract(
        &self,
        url: &str,
        options: &ExtractOptions,
    ) -> Result<ResolvedVideo, ExtractionFailure> {
        // The endpoint rejects malformed URLs with 422 long before this
        // point; the guard keeps the no-network invariant for other callers.
        if let Err(error) = validate_url(url) {
            return Err(ExtractionFailure::new(
                ExtractionErrorKind::Unknown,
                error.to_string(),
            ));
        }

        let options = *options;
        (|| self.attempt(url, options))
            .retry(self.backoff())
            .notify(|failure: &ExtractionFailure, delay: Duration| {
                tracing::info!(
                    delay_s = delay.as_secs(),
                    "Extraction attempt failed ({failure}), retrying",
                );
            })
            .await
    }
}
