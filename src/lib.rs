pub mod checkpoint;
pub mod config;
pub mod publisher;
pub mod rate_limit;
pub mod registry;
pub mod registry_watcher;
pub mod reputation;
pub mod scoring;
pub mod sentinel;
pub mod trust_filter;

#[cfg(test)]
mod tests;

pub use checkpoint::{CheckpointError, WatcherCheckpoint};
pub use config::{AppConfig, Network};
pub use publisher::{FeedClient, PublishError, Publisher, RecordingFeed, XFeedClient, XFeedConfig};
pub use rate_limit::PostRateLimiter;
pub use registry::{
    EthersRegistryClient, EventSchema, RawSummary, RegistrationEvent, RegistryClient,
    RegistryError,
};
pub use registry_watcher::{PollOutcome, RegistryWatcher, RegistryWatcherConfig};
pub use reputation::{DimensionScore, ReputationSummary, TrustDimension, TrustProfile};
pub use scoring::{format_announcement, trust_bucket, trust_emoji, TrustBucket};
pub use sentinel::{Disposition, Sentinel, SentinelMetrics, SentinelMetricsSnapshot};
pub use trust_filter::{should_announce, AnnounceReason, TrustFilterConfig};
