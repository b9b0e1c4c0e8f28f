//! Rate-limited announcement publisher
//!
//! Renders trust profiles into feed posts and sends them through a
//! [`FeedClient`], honoring the rolling hourly limit. In dry-run mode the
//! post is logged instead of sent, but still counts against the limit.

use crate::rate_limit::PostRateLimiter;
use crate::reputation::TrustProfile;
use crate::scoring::{char_len, format_announcement};
use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum PublishError {
    Transport(String),
    Rejected { status: StatusCode, body: String },
    MalformedResponse(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Transport(msg) => write!(f, "Transport error: {msg}"),
            PublishError::Rejected { status, body } => {
                write!(f, "Post rejected with {status}: {body}")
            }
            PublishError::MalformedResponse(msg) => write!(f, "Malformed response: {msg}"),
        }
    }
}

impl Error for PublishError {}

/// Something that can create a post and return its identifier
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn create_post(&self, text: &str) -> Result<String, PublishError>;
}

/// Configuration for the X feed client
#[derive(Clone, Debug)]
pub struct XFeedConfig {
    pub base_url: String,
    /// OAuth 2.0 user-context access token with write scope
    pub access_token: String,
    pub timeout: Duration,
}

impl Default for XFeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twitter.com".to_string(),
            access_token: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct CreatePostResponse {
    data: Option<CreatedPost>,
}

#[derive(Deserialize)]
struct CreatedPost {
    id: String,
}

/// Client for the X v2 create-post endpoint
#[derive(Clone)]
pub struct XFeedClient {
    client: Client,
    config: XFeedConfig,
}

impl XFeedClient {
    pub fn new(config: XFeedConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl FeedClient for XFeedClient {
    async fn create_post(&self, text: &str) -> Result<String, PublishError> {
        let url = format!("{}/2/tweets", self.config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected { status, body });
        }

        let parsed: CreatePostResponse = response
            .json()
            .await
            .map_err(|e| PublishError::MalformedResponse(e.to_string()))?;

        parsed
            .data
            .map(|post| post.id)
            .ok_or_else(|| PublishError::MalformedResponse("missing data.id".to_string()))
    }
}

/// Feed client that keeps posts in memory instead of sending them
#[derive(Default)]
pub struct RecordingFeed {
    posts: Mutex<Vec<String>>,
    reject_all: bool,
}

impl RecordingFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed that fails every post
    pub fn rejecting() -> Self {
        Self {
            posts: Mutex::new(Vec::new()),
            reject_all: true,
        }
    }

    pub fn posts(&self) -> Vec<String> {
        self.posts.lock().clone()
    }
}

#[async_trait]
impl FeedClient for RecordingFeed {
    async fn create_post(&self, text: &str) -> Result<String, PublishError> {
        if self.reject_all {
            return Err(PublishError::Rejected {
                status: StatusCode::FORBIDDEN,
                body: "rejected by recording feed".to_string(),
            });
        }
        let mut posts = self.posts.lock();
        posts.push(text.to_string());
        Ok(posts.len().to_string())
    }
}

/// Posts trust profile announcements under a rolling hourly limit
pub struct Publisher<C: Clock = DefaultClock> {
    feed: Option<Arc<dyn FeedClient>>,
    limiter: PostRateLimiter<C>,
    dry_run: bool,
    network: String,
}

impl Publisher<DefaultClock> {
    pub fn new(
        feed: Option<Arc<dyn FeedClient>>,
        max_per_hour: usize,
        dry_run: bool,
        network: impl Into<String>,
    ) -> Self {
        Self::with_limiter(feed, PostRateLimiter::new(max_per_hour), dry_run, network)
    }
}

impl<C: Clock> Publisher<C> {
    pub fn with_limiter(
        feed: Option<Arc<dyn FeedClient>>,
        limiter: PostRateLimiter<C>,
        dry_run: bool,
        network: impl Into<String>,
    ) -> Self {
        let network = network.into();
        info!(
            dry_run,
            network = %network,
            max_per_hour = limiter.max_per_hour(),
            has_feed = feed.is_some(),
            "Publisher initialized"
        );
        Self {
            feed,
            limiter,
            dry_run,
            network,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Posts left in the current window
    pub fn remaining(&mut self) -> usize {
        self.limiter.remaining()
    }

    /// Posts recorded in the current window
    pub fn recent_posts(&mut self) -> usize {
        self.limiter.recent()
    }

    pub fn render(&self, profile: &TrustProfile) -> String {
        format_announcement(profile, &self.network)
    }

    /// Announce a profile.
    ///
    /// Returns true when the post was published (or logged in dry-run mode),
    /// false when rate limited or when publishing failed. Failed attempts do
    /// not consume rate budget.
    pub async fn post(&mut self, profile: &TrustProfile) -> bool {
        if !self.limiter.check() {
            warn!(
                entity_id = profile.entity_id,
                recent_posts = self.limiter.recent(),
                "Announcement rate limited"
            );
            return false;
        }

        let text = self.render(profile);
        info!(
            entity_id = profile.entity_id,
            average_score = profile.average_score,
            dry_run = self.dry_run,
            length = char_len(&text),
            "Posting announcement"
        );

        if self.dry_run {
            info!(entity_id = profile.entity_id, text = %text, "Dry run, not posting");
            self.limiter.record();
            return true;
        }

        let Some(feed) = self.feed.as_ref() else {
            error!(entity_id = profile.entity_id, "No feed client configured");
            return false;
        };

        match feed.create_post(&text).await {
            Ok(post_id) => {
                info!(entity_id = profile.entity_id, post_id = %post_id, "Announcement posted");
                self.limiter.record();
                true
            }
            Err(e) => {
                error!(entity_id = profile.entity_id, error = %e, "Failed to post announcement");
                false
            }
        }
    }
}
