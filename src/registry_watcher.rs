//! Registry Watcher - Polls the identity registry for new registrations
//!
//! Each cycle scans the blocks added since the last checkpoint, drops
//! registrations that were already handed out, enriches the new ones with
//! reputation data and sends them downstream one by one. The checkpoint is
//! written once per cycle, after every entity of the cycle has been handled.

use crate::checkpoint::WatcherCheckpoint;
use crate::registry::{format_address, RegistrationEvent, RegistryClient, RegistryError};
use crate::reputation::{normalize, DimensionScore, ReputationSummary, TrustDimension, TrustProfile};
use crate::trust_filter::is_special_channel_registration;
use ethers::types::Address;
use futures_util::{stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the registry watcher
#[derive(Debug, Clone)]
pub struct RegistryWatcherConfig {
    /// Delay between poll cycles
    pub poll_interval: Duration,
    /// How far behind the head the very first scan starts
    pub lookback_blocks: u64,
    /// Path to checkpoint file
    pub state_file: PathBuf,
    /// Entities enriched in parallel within one cycle
    pub enrichment_concurrency: usize,
    /// Also fetch one tagged summary per reputation dimension
    pub fetch_dimension_scores: bool,
}

impl Default for RegistryWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            lookback_blocks: 1000,
            state_file: PathBuf::from("./data/sentinel_state.json"),
            enrichment_concurrency: 4,
            fetch_dimension_scores: false,
        }
    }
}

/// Result of a single poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Head has not moved past the checkpoint
    Idle { chain_head: u64 },
    /// Range scanned and checkpoint advanced
    Scanned {
        from_block: u64,
        to_block: u64,
        yielded: usize,
    },
    /// Head or log query failed; nothing advanced
    FetchFailed,
    /// Downstream receiver is gone; undelivered ids were unmarked and the
    /// checkpoint block was left where it was
    Disconnected,
}

/// Polls the registry and yields new trust profiles
pub struct RegistryWatcher {
    client: Arc<dyn RegistryClient>,
    config: RegistryWatcherConfig,
    checkpoint: WatcherCheckpoint,
}

impl RegistryWatcher {
    /// Create a watcher, resuming from the checkpoint file if one exists
    pub async fn new(client: Arc<dyn RegistryClient>, config: RegistryWatcherConfig) -> Self {
        let checkpoint = WatcherCheckpoint::load_or_default(&config.state_file).await;
        Self::with_checkpoint(client, config, checkpoint)
    }

    pub fn with_checkpoint(
        client: Arc<dyn RegistryClient>,
        config: RegistryWatcherConfig,
        checkpoint: WatcherCheckpoint,
    ) -> Self {
        info!(
            last_block = ?checkpoint.last_processed_block(),
            seen_count = checkpoint.seen_count(),
            poll_interval = ?config.poll_interval,
            "Registry watcher initialized"
        );
        Self {
            client,
            config,
            checkpoint,
        }
    }

    pub fn checkpoint(&self) -> &WatcherCheckpoint {
        &self.checkpoint
    }

    /// Poll until cancelled or until the receiving side goes away.
    ///
    /// Cancellation interrupts the sleep between cycles; a cycle that is
    /// already running finishes and persists its checkpoint first.
    pub async fn run(mut self, tx: flume::Sender<TrustProfile>, cancellation_token: CancellationToken) {
        info!(poll_interval = ?self.config.poll_interval, "🚀 Starting registry watcher");

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            if self.poll_once(&tx).await == PollOutcome::Disconnected {
                info!("Profile receiver closed, stopping registry watcher");
                break;
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Registry watcher cancelled");
                    break;
                }
                _ = sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Run a single poll cycle, sending each new profile as soon as it is built
    pub async fn poll_once(&mut self, tx: &flume::Sender<TrustProfile>) -> PollOutcome {
        let chain_head = match self.client.block_number().await {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "Failed to fetch chain head");
                return PollOutcome::FetchFailed;
            }
        };

        let Some(range) = self
            .checkpoint
            .next_scan_range(chain_head, self.config.lookback_blocks)
        else {
            debug!(chain_head, "No new blocks");
            return PollOutcome::Idle { chain_head };
        };
        let (from_block, to_block) = (*range.start(), *range.end());

        if self.checkpoint.last_processed_block().is_none() {
            info!(from_block, to_block, "Initial registry scan");
        } else {
            info!(
                from_block,
                to_block,
                seen_count = self.checkpoint.seen_count(),
                "Polling registry"
            );
        }

        let events = match self.client.registration_events(from_block, to_block).await {
            Ok(events) => events,
            Err(e) => {
                warn!(from_block, to_block, error = %e, "Failed to fetch registration events");
                return PollOutcome::FetchFailed;
            }
        };

        // Ids are marked seen before enrichment so a degraded fetch is never retried.
        let mut fresh = Vec::new();
        for event in events {
            if !event.is_mint() {
                continue;
            }
            if !self.checkpoint.mark_seen(event.entity_id) {
                debug!(entity_id = event.entity_id, "Registration already seen");
                continue;
            }
            fresh.push(event);
        }
        let fresh_ids: Vec<u64> = fresh.iter().map(|event| event.entity_id).collect();

        let client = self.client.clone();
        let fetch_dimensions = self.config.fetch_dimension_scores;
        let mut enriched = stream::iter(fresh)
            .map(|event| {
                let client = client.clone();
                async move { fetch_trust_profile(client.as_ref(), &event, fetch_dimensions).await }
            })
            .buffered(self.config.enrichment_concurrency.max(1));

        let mut yielded = 0;
        let mut disconnected = false;

        while let Some(profile) = enriched.next().await {
            info!(
                entity_id = profile.entity_id,
                owner = %profile.owner,
                average_score = profile.average_score,
                has_reputation = profile.has_reputation,
                "New entity observed"
            );
            if tx.send_async(profile).await.is_err() {
                disconnected = true;
                break;
            }
            yielded += 1;
        }
        drop(enriched);

        if disconnected {
            // Undelivered ids stay unseen and the range is rescanned on the next run
            for entity_id in &fresh_ids[yielded..] {
                self.checkpoint.forget(*entity_id);
            }
            warn!(
                from_block,
                delivered = yielded,
                returned = fresh_ids.len() - yielded,
                "Profile receiver closed mid-cycle, checkpoint not advanced"
            );
            if let Err(e) = self.checkpoint.save(&self.config.state_file).await {
                error!("Failed to save watcher checkpoint: {}", e);
            }
            return PollOutcome::Disconnected;
        }

        self.checkpoint.advance_to(to_block);
        if let Err(e) = self.checkpoint.save(&self.config.state_file).await {
            error!("Failed to save watcher checkpoint: {}", e);
        }

        PollOutcome::Scanned {
            from_block,
            to_block,
            yielded,
        }
    }

    /// Fetch the current trust profile of any entity, seen or not
    pub async fn fetch_profile(&self, entity_id: u64) -> TrustProfile {
        let event = RegistrationEvent {
            from: Address::zero(),
            to: Address::zero(),
            entity_id,
            tx_hash: None,
            block_number: None,
            uri: None,
        };
        fetch_trust_profile(
            self.client.as_ref(),
            &event,
            self.config.fetch_dimension_scores,
        )
        .await
    }
}

/// Build the trust profile of a registered entity.
///
/// Every lookup degrades on failure: the owner becomes the zero address and
/// URI, reputation and the registration transaction become empty values.
pub async fn fetch_trust_profile(
    client: &dyn RegistryClient,
    event: &RegistrationEvent,
    fetch_dimensions: bool,
) -> TrustProfile {
    let entity_id = event.entity_id;
    let owner = match client.owner_of(entity_id).await {
        Ok(owner) => owner,
        Err(e) => {
            debug!(entity_id, error = %e, "Failed to fetch owner");
            Address::zero()
        }
    };

    let uri = match &event.uri {
        Some(uri) => Some(uri.clone()),
        None => match client.token_uri(entity_id).await {
            Ok(uri) if !uri.is_empty() => Some(uri),
            Ok(_) => None,
            Err(e) => {
                debug!(entity_id, error = %e, "No token URI");
                None
            }
        },
    };

    let reputation = match fetch_reputation(client, entity_id, fetch_dimensions).await {
        Ok(summary) => Some(summary),
        Err(e) => {
            debug!(entity_id, error = %e, "Failed to fetch reputation");
            None
        }
    };

    let special_channel = match event.tx_hash {
        Some(tx_hash) => match client.transaction_input(tx_hash).await {
            Ok(input) => {
                let input = input.map(|bytes| bytes.to_vec()).unwrap_or_default();
                is_special_channel_registration(&input, uri.as_deref())
            }
            Err(e) => {
                debug!(entity_id, error = %e, "Failed to fetch registration transaction");
                is_special_channel_registration(&[], uri.as_deref())
            }
        },
        None => is_special_channel_registration(&[], uri.as_deref()),
    };

    let mut profile = TrustProfile::from_reputation(entity_id, format_address(&owner), reputation)
        .with_registration(event.block_number, event.tx_hash.map(|h| format!("{h:#x}")));
    profile.uri = uri;
    profile.registered_via_special_channel = special_channel;

    profile
}

/// Two-step reputation read: feedback givers first, then the summary over exactly them.
///
/// An empty client list means no feedback and the summary call is skipped,
/// since an empty address list would not aggregate anything.
pub async fn fetch_reputation(
    client: &dyn RegistryClient,
    entity_id: u64,
    fetch_dimensions: bool,
) -> Result<ReputationSummary, RegistryError> {
    let clients = client.clients(entity_id).await?;
    debug!(entity_id, client_count = clients.len(), "Fetched reputation clients");

    if clients.is_empty() {
        return Ok(ReputationSummary::default());
    }

    let raw = client.summary(entity_id, &clients, "", "").await?;
    let average = normalize(raw.value, raw.decimals as u32);
    debug!(
        entity_id,
        count = raw.count,
        raw_value = raw.value,
        decimals = raw.decimals,
        average,
        "Fetched reputation summary"
    );

    let mut dimensions = Vec::new();
    if fetch_dimensions {
        for dimension in TrustDimension::ALL {
            match client.summary(entity_id, &clients, dimension.as_str(), "").await {
                Ok(tagged) if tagged.count > 0 => dimensions.push(DimensionScore::from_contract(
                    dimension,
                    tagged.value,
                    tagged.decimals as u32,
                )),
                Ok(_) => {}
                Err(e) => {
                    debug!(entity_id, dimension = %dimension, error = %e, "Failed to fetch dimension");
                }
            }
        }
    }

    Ok(ReputationSummary {
        feedback_count: raw.count,
        average,
        dimensions,
    })
}
