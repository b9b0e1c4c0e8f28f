use crate::checkpoint::WatcherCheckpoint;
use crate::publisher::Publisher;
use crate::rate_limit::PostRateLimiter;
use crate::registry::{RawSummary, RegistrationEvent, RegistryClient, RegistryError};
use crate::registry_watcher::{
    fetch_reputation, fetch_trust_profile, PollOutcome, RegistryWatcher, RegistryWatcherConfig,
};
use crate::reputation::TrustDimension;
use crate::sentinel::Sentinel;
use crate::trust_filter::TrustFilterConfig;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use governor::clock::FakeRelativeClock;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockState {
    head: u64,
    events: Vec<RegistrationEvent>,
    fail_head: bool,
    fail_events: bool,
    missing_owners: HashSet<u64>,
    uris: HashMap<u64, String>,
    clients: HashMap<u64, Vec<Address>>,
    summaries: HashMap<(u64, String), RawSummary>,
    inputs: HashMap<H256, Bytes>,
    event_queries: Vec<(u64, u64)>,
    summary_calls: usize,
}

#[derive(Default)]
struct MockRegistry {
    state: Mutex<MockState>,
}

impl MockRegistry {
    fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    fn add_mint(&self, entity_id: u64, block: u64) {
        self.state.lock().events.push(mint(entity_id, block));
    }

    fn add_event(&self, event: RegistrationEvent) {
        self.state.lock().events.push(event);
    }

    fn set_reputation(&self, entity_id: u64, count: u64, value: i128, decimals: u8) {
        let mut state = self.state.lock();
        state
            .clients
            .insert(entity_id, vec![Address::from_low_u64_be(0xfeed)]);
        state.summaries.insert(
            (entity_id, String::new()),
            RawSummary {
                count,
                value,
                decimals,
            },
        );
    }
}

fn mint(entity_id: u64, block: u64) -> RegistrationEvent {
    RegistrationEvent {
        from: Address::zero(),
        to: Address::from_low_u64_be(0xaa),
        entity_id,
        tx_hash: Some(H256::from_low_u64_be(entity_id + 1)),
        block_number: Some(block),
        uri: None,
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn block_number(&self) -> Result<u64, RegistryError> {
        let state = self.state.lock();
        if state.fail_head {
            return Err(RegistryError::Rpc("head unavailable".to_string()));
        }
        Ok(state.head)
    }

    async fn registration_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RegistrationEvent>, RegistryError> {
        let mut state = self.state.lock();
        state.event_queries.push((from_block, to_block));
        if state.fail_events {
            return Err(RegistryError::Timeout {
                call: "Transfer logs",
                after: Duration::from_secs(30),
            });
        }
        Ok(state
            .events
            .iter()
            .filter(|e| {
                e.block_number
                    .map(|b| b >= from_block && b <= to_block)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn owner_of(&self, entity_id: u64) -> Result<Address, RegistryError> {
        if self.state.lock().missing_owners.contains(&entity_id) {
            return Err(RegistryError::Contract {
                call: "ownerOf",
                message: "execution reverted".to_string(),
            });
        }
        Ok(Address::from_low_u64_be(0xaa))
    }

    async fn token_uri(&self, entity_id: u64) -> Result<String, RegistryError> {
        self.state
            .lock()
            .uris
            .get(&entity_id)
            .cloned()
            .ok_or_else(|| RegistryError::Contract {
                call: "tokenURI",
                message: "no uri".to_string(),
            })
    }

    async fn clients(&self, entity_id: u64) -> Result<Vec<Address>, RegistryError> {
        Ok(self
            .state
            .lock()
            .clients
            .get(&entity_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn summary(
        &self,
        entity_id: u64,
        clients: &[Address],
        tag1: &str,
        _tag2: &str,
    ) -> Result<RawSummary, RegistryError> {
        let mut state = self.state.lock();
        state.summary_calls += 1;
        assert!(!clients.is_empty(), "summary must be scoped to known clients");
        Ok(state
            .summaries
            .get(&(entity_id, tag1.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn transaction_input(&self, tx_hash: H256) -> Result<Option<Bytes>, RegistryError> {
        Ok(self.state.lock().inputs.get(&tx_hash).cloned())
    }
}

fn config_in(temp_dir: &TempDir) -> RegistryWatcherConfig {
    RegistryWatcherConfig {
        poll_interval: Duration::from_millis(10),
        lookback_blocks: 100,
        state_file: temp_dir.path().join("state.json"),
        enrichment_concurrency: 4,
        fetch_dimension_scores: false,
    }
}

fn watcher(mock: &Arc<MockRegistry>, temp_dir: &TempDir) -> RegistryWatcher {
    RegistryWatcher::with_checkpoint(mock.clone(), config_in(temp_dir), WatcherCheckpoint::default())
}

fn drain(rx: &flume::Receiver<crate::reputation::TrustProfile>) -> Vec<u64> {
    rx.drain().map(|p| p.entity_id).collect()
}

#[tokio::test]
async fn test_first_poll_scans_lookback_window() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(1_000);
    mock.add_mint(1, 850);
    mock.add_mint(2, 950);
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, rx) = flume::unbounded();

    let outcome = watcher.poll_once(&tx).await;

    assert_eq!(
        outcome,
        PollOutcome::Scanned {
            from_block: 900,
            to_block: 1_000,
            yielded: 1
        }
    );
    assert_eq!(drain(&rx), vec![2]);
    assert_eq!(watcher.checkpoint().last_processed_block(), Some(1_000));
}

#[tokio::test]
async fn test_idle_when_head_has_not_moved() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(500);
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, _rx) = flume::unbounded();

    watcher.poll_once(&tx).await;
    let outcome = watcher.poll_once(&tx).await;

    assert_eq!(outcome, PollOutcome::Idle { chain_head: 500 });
    assert_eq!(mock.state.lock().event_queries.len(), 1);
}

#[tokio::test]
async fn test_subsequent_polls_resume_after_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(500);
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, _rx) = flume::unbounded();

    watcher.poll_once(&tx).await;
    mock.set_head(520);
    watcher.poll_once(&tx).await;

    assert_eq!(mock.state.lock().event_queries, vec![(400, 500), (501, 520)]);
}

#[tokio::test]
async fn test_duplicate_mints_yield_once() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    mock.add_mint(7, 90);
    mock.add_mint(7, 95);
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, rx) = flume::unbounded();

    watcher.poll_once(&tx).await;

    assert_eq!(drain(&rx), vec![7]);
}

#[tokio::test]
async fn test_restart_with_overlapping_range_does_not_reyield() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    mock.add_mint(7, 90);
    let (tx, rx) = flume::unbounded();

    let mut first = RegistryWatcher::new(mock.clone(), config_in(&temp_dir)).await;
    first.poll_once(&tx).await;
    assert_eq!(drain(&rx), vec![7]);

    // Restart with the seen set but no block progress, so the range overlaps
    let saved = WatcherCheckpoint::load(&temp_dir.path().join("state.json"))
        .await
        .unwrap();
    assert!(saved.is_seen(7));
    let mut checkpoint = WatcherCheckpoint::default();
    checkpoint.mark_seen(7);
    let mut second =
        RegistryWatcher::with_checkpoint(mock.clone(), config_in(&temp_dir), checkpoint);
    second.poll_once(&tx).await;

    assert!(drain(&rx).is_empty());
}

#[tokio::test]
async fn test_non_mint_transfers_are_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    mock.add_event(RegistrationEvent {
        from: Address::from_low_u64_be(0xbb),
        ..mint(9, 95)
    });
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, rx) = flume::unbounded();

    watcher.poll_once(&tx).await;

    assert!(drain(&rx).is_empty());
    assert!(!watcher.checkpoint().is_seen(9));
}

#[tokio::test]
async fn test_failed_event_fetch_does_not_advance() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, _rx) = flume::unbounded();

    watcher.poll_once(&tx).await;
    assert_eq!(watcher.checkpoint().last_processed_block(), Some(100));

    mock.set_head(150);
    mock.state.lock().fail_events = true;
    assert_eq!(watcher.poll_once(&tx).await, PollOutcome::FetchFailed);
    assert_eq!(watcher.checkpoint().last_processed_block(), Some(100));

    mock.state.lock().fail_events = false;
    watcher.poll_once(&tx).await;
    assert_eq!(watcher.checkpoint().last_processed_block(), Some(150));
    assert_eq!(
        mock.state.lock().event_queries,
        vec![(0, 100), (101, 150), (101, 150)]
    );
}

#[tokio::test]
async fn test_failed_head_fetch_is_not_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.state.lock().fail_head = true;
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, _rx) = flume::unbounded();

    assert_eq!(watcher.poll_once(&tx).await, PollOutcome::FetchFailed);
    assert_eq!(watcher.checkpoint().last_processed_block(), None);
}

#[tokio::test]
async fn test_checkpoint_is_monotonic() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, _rx) = flume::unbounded();

    let mut last = None;
    for head in [100, 120, 90, 130, 130, 200] {
        mock.set_head(head);
        watcher.poll_once(&tx).await;
        let current = watcher.checkpoint().last_processed_block();
        assert!(current >= last);
        last = current;
    }
    assert_eq!(last, Some(200));
}

#[tokio::test]
async fn test_owner_lookup_failure_yields_zero_owner() {
    let mock = MockRegistry::default();
    mock.state.lock().missing_owners.insert(5);
    mock.set_reputation(5, 2, 70, 0);

    let profile = fetch_trust_profile(&mock, &mint(5, 77), false).await;

    assert_eq!(profile.entity_id, 5);
    assert_eq!(profile.owner, "0x0000000000000000000000000000000000000000");
    assert_eq!(profile.average_score, 70);
}

#[tokio::test]
async fn test_degraded_entity_is_not_refetched() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    mock.add_mint(1, 95);
    mock.add_mint(2, 96);
    mock.state.lock().missing_owners.insert(1);
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, rx) = flume::unbounded();

    let outcome = watcher.poll_once(&tx).await;
    assert_eq!(
        outcome,
        PollOutcome::Scanned {
            from_block: 0,
            to_block: 100,
            yielded: 2
        }
    );
    let profiles: Vec<_> = rx.drain().collect();
    assert_eq!(profiles[0].entity_id, 1);
    assert_eq!(profiles[0].owner, "0x0000000000000000000000000000000000000000");
    assert!(watcher.checkpoint().is_seen(1));

    // The owner becomes readable, but the entity is never fetched again
    mock.state.lock().missing_owners.clear();
    mock.add_mint(1, 105);
    mock.set_head(110);
    watcher.poll_once(&tx).await;
    assert!(drain(&rx).is_empty());
}

#[tokio::test]
async fn test_profiles_arrive_in_event_order() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    for id in [5, 3, 8, 1] {
        mock.add_mint(id, 50 + id);
    }
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, rx) = flume::unbounded();

    watcher.poll_once(&tx).await;

    assert_eq!(drain(&rx), vec![5, 3, 8, 1]);
}

#[tokio::test]
async fn test_closed_receiver_leaves_entities_for_next_run() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    mock.add_mint(4, 99);
    mock.add_mint(6, 99);
    let mut watcher = watcher(&mock, &temp_dir);
    let (tx, rx) = flume::unbounded();
    drop(rx);

    assert_eq!(watcher.poll_once(&tx).await, PollOutcome::Disconnected);

    let saved = WatcherCheckpoint::load(&temp_dir.path().join("state.json"))
        .await
        .unwrap();
    assert_eq!(saved.last_processed_block(), None);
    assert!(!saved.is_seen(4));
    assert!(!saved.is_seen(6));

    let mut restarted = RegistryWatcher::new(mock.clone(), config_in(&temp_dir)).await;
    let (tx, rx) = flume::unbounded();
    restarted.poll_once(&tx).await;
    assert_eq!(drain(&rx), vec![4, 6]);
}

#[tokio::test]
async fn test_shutdown_handles_every_marked_entity() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    for id in 1..=5 {
        mock.add_mint(id, 90 + id);
    }
    let mut watcher = watcher(&mock, &temp_dir);

    let limiter = PostRateLimiter::with_clock(10, FakeRelativeClock::default());
    let publisher = Publisher::with_limiter(None, limiter, true, "mainnet");
    let sentinel = Sentinel::new(TrustFilterConfig::default(), publisher);
    let token = CancellationToken::new();
    token.cancel();

    let (tx, rx) = flume::bounded(2);
    let consumer = tokio::spawn(sentinel.run(rx, token));

    let outcome = watcher.poll_once(&tx).await;
    drop(tx);
    let stats = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(outcome, PollOutcome::Scanned { yielded: 5, .. }));
    assert_eq!(stats.seen, 5);
    assert_eq!(watcher.checkpoint().seen_count(), 5);
}

#[tokio::test]
async fn test_empty_clients_skip_summary() {
    let mock = MockRegistry::default();

    let summary = fetch_reputation(&mock, 42, true).await.unwrap();

    assert_eq!(summary.feedback_count, 0);
    assert_eq!(summary.average, 0);
    assert!(summary.dimensions.is_empty());
    assert_eq!(mock.state.lock().summary_calls, 0);
}

#[tokio::test]
async fn test_reputation_is_normalized() {
    let mock = MockRegistry::default();
    mock.set_reputation(42, 3, 8_750, 2);

    let summary = fetch_reputation(&mock, 42, false).await.unwrap();

    assert_eq!(summary.feedback_count, 3);
    assert_eq!(summary.average, 87);
    assert_eq!(mock.state.lock().summary_calls, 1);
}

#[tokio::test]
async fn test_dimension_scores_only_when_tagged_feedback_exists() {
    let mock = MockRegistry::default();
    mock.set_reputation(42, 3, 80, 0);
    mock.state.lock().summaries.insert(
        (42, "safety".to_string()),
        RawSummary {
            count: 2,
            value: 95,
            decimals: 0,
        },
    );

    let summary = fetch_reputation(&mock, 42, true).await.unwrap();

    assert_eq!(summary.dimensions.len(), 1);
    assert_eq!(summary.dimensions[0].dimension, TrustDimension::Safety);
    assert_eq!(summary.dimensions[0].value, 95);
    assert_eq!(mock.state.lock().summary_calls, 1 + TrustDimension::ALL.len());
}

#[tokio::test]
async fn test_profile_enrichment() {
    let mock = MockRegistry::default();
    mock.set_reputation(10, 1, 64, 0);
    mock.state
        .lock()
        .uris
        .insert(10, "ipfs://agent-10.json".to_string());

    let profile = fetch_trust_profile(&mock, &mint(10, 77), false).await;

    assert_eq!(profile.entity_id, 10);
    assert!(profile
        .owner
        .eq_ignore_ascii_case("0x00000000000000000000000000000000000000aa"));
    assert_eq!(profile.uri.as_deref(), Some("ipfs://agent-10.json"));
    assert_eq!(profile.average_score, 64);
    assert!(profile.has_reputation);
    assert!(!profile.registered_via_special_channel);
    assert_eq!(profile.registered_at_block, Some(77));
    assert!(profile.tx_hash.as_deref().unwrap().starts_with("0x"));
}

#[tokio::test]
async fn test_missing_uri_and_reputation_degrade() {
    let mock = MockRegistry::default();

    let profile = fetch_trust_profile(&mock, &mint(11, 77), false).await;

    assert!(profile.uri.is_none());
    assert_eq!(profile.average_score, 0);
    assert!(!profile.has_reputation);
}

#[tokio::test]
async fn test_special_channel_from_transaction_input() {
    let mock = MockRegistry::default();
    let event = mint(12, 77);
    let calldata = Bytes::from(b"\x00\x01register ChaosChain agent".to_vec());
    mock.state
        .lock()
        .inputs
        .insert(event.tx_hash.unwrap(), calldata);

    let profile = fetch_trust_profile(&mock, &event, false).await;

    assert!(profile.registered_via_special_channel);
}

#[tokio::test]
async fn test_event_uri_takes_precedence() {
    let mock = MockRegistry::default();
    mock.state
        .lock()
        .uris
        .insert(13, "ipfs://from-contract".to_string());
    let event = RegistrationEvent {
        uri: Some("https://chaoschain.example/13".to_string()),
        ..mint(13, 77)
    };

    let profile = fetch_trust_profile(&mock, &event, false).await;

    assert_eq!(profile.uri.as_deref(), Some("https://chaoschain.example/13"));
    assert!(profile.registered_via_special_channel);
}

#[tokio::test]
async fn test_fetch_profile_for_lookup() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_reputation(99, 5, 91, 0);
    let watcher = watcher(&mock, &temp_dir);

    let profile = watcher.fetch_profile(99).await;

    assert_eq!(profile.average_score, 91);
    assert!(!watcher.checkpoint().is_seen(99));
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockRegistry::default());
    mock.set_head(100);
    mock.add_mint(21, 99);
    let watcher = watcher(&mock, &temp_dir);
    let (tx, rx) = flume::unbounded();
    let token = CancellationToken::new();

    let handle = tokio::spawn(watcher.run(tx, token.clone()));
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.entity_id, 21);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
