//! Drives watcher output through the trust filter into the publisher

use crate::publisher::Publisher;
use crate::reputation::TrustProfile;
use crate::trust_filter::{evaluate, TrustFilterConfig};
use governor::clock::{Clock, DefaultClock};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A stats snapshot is logged every this many entities
const STATS_EVERY: u64 = 10;

#[derive(Default, Debug)]
pub struct SentinelMetrics {
    seen: AtomicU64,
    announced: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelMetricsSnapshot {
    pub seen: u64,
    pub announced: u64,
    pub filtered: u64,
    /// Rate limited or rejected by the feed
    pub failed: u64,
}

impl SentinelMetrics {
    pub fn snapshot(&self) -> SentinelMetricsSnapshot {
        SentinelMetricsSnapshot {
            seen: self.seen.load(AtomicOrdering::Relaxed),
            announced: self.announced.load(AtomicOrdering::Relaxed),
            filtered: self.filtered.load(AtomicOrdering::Relaxed),
            failed: self.failed.load(AtomicOrdering::Relaxed),
        }
    }
}

/// What happened to one profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Announced,
    Filtered,
    NotPosted,
}

pub struct Sentinel<C: Clock = DefaultClock> {
    filter: TrustFilterConfig,
    publisher: Publisher<C>,
    metrics: Arc<SentinelMetrics>,
}

impl<C: Clock> Sentinel<C> {
    pub fn new(filter: TrustFilterConfig, publisher: Publisher<C>) -> Self {
        Self {
            filter,
            publisher,
            metrics: Arc::new(SentinelMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<SentinelMetrics> {
        self.metrics.clone()
    }

    pub fn publisher_mut(&mut self) -> &mut Publisher<C> {
        &mut self.publisher
    }

    /// Filter one profile and announce it if it qualifies
    pub async fn handle(&mut self, profile: TrustProfile) -> Disposition {
        let seen = self.metrics.seen.fetch_add(1, AtomicOrdering::Relaxed) + 1;

        let disposition = match evaluate(&profile, &self.filter) {
            Some(reason) => {
                info!(
                    entity_id = profile.entity_id,
                    average_score = profile.average_score,
                    has_reputation = profile.has_reputation,
                    special_channel = profile.registered_via_special_channel,
                    reason = %reason,
                    "Announcing entity"
                );

                if self.publisher.post(&profile).await {
                    let announced = self.metrics.announced.fetch_add(1, AtomicOrdering::Relaxed) + 1;
                    info!(entity_id = profile.entity_id, total_announced = announced, "Entity announced");
                    Disposition::Announced
                } else {
                    self.metrics.failed.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(entity_id = profile.entity_id, "Announcement not posted");
                    Disposition::NotPosted
                }
            }
            None => {
                self.metrics.filtered.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(
                    entity_id = profile.entity_id,
                    average_score = profile.average_score,
                    min_trust_score = self.filter.min_trust_score,
                    "Entity filtered"
                );
                Disposition::Filtered
            }
        };

        if seen % STATS_EVERY == 0 {
            self.log_stats();
        }

        disposition
    }

    pub fn log_stats(&mut self) {
        let stats = self.metrics.snapshot();
        info!(
            total_seen = stats.seen,
            total_announced = stats.announced,
            total_filtered = stats.filtered,
            total_failed = stats.failed,
            posts_remaining = self.publisher.remaining(),
            "Sentinel stats"
        );
    }

    /// Consume profiles until the channel closes.
    ///
    /// Cancellation does not stop the loop on its own: profiles the watcher
    /// already marked seen are still handled until it drops its sender.
    pub async fn run(
        mut self,
        rx: flume::Receiver<TrustProfile>,
        cancellation_token: CancellationToken,
    ) -> SentinelMetricsSnapshot {
        info!("🦞 Sentinel is now watching the registry");
        let mut draining = false;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled(), if !draining => {
                    info!(pending = rx.len(), "Sentinel cancelled, draining pending profiles");
                    draining = true;
                }
                received = rx.recv_async() => {
                    match received {
                        Ok(profile) => {
                            self.handle(profile).await;
                        }
                        Err(_) => {
                            info!("Profile channel closed");
                            break;
                        }
                    }
                }
            }
        }

        self.log_stats();
        self.metrics.snapshot()
    }
}
