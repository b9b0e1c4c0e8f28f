use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use trust_sentinel::{
    checkpoint::WatcherCheckpoint,
    config::AppConfig,
    reputation::{ReputationSummary, TrustProfile},
    scoring::{char_len, format_announcement, format_dimension_bars, format_trust_display},
    trust_filter::evaluate,
    EthersRegistryClient, FeedClient, Publisher, RegistryWatcher, RegistryWatcherConfig, Sentinel,
    TrustFilterConfig, XFeedClient, XFeedConfig,
};

/// Capacity of the watcher to sentinel channel
const PROFILE_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(
    name = "trust-sentinel",
    version,
    about = "Announce newly registered ERC-8004 agents that pass a trust filter"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the registry and publish announcements (default)
    Run {
        /// Log announcements instead of posting them
        #[arg(long)]
        dry_run: bool,

        /// Override the checkpoint file location
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
    /// Fetch and print the trust profile of one entity
    Lookup {
        /// Token id in the identity registry
        entity_id: u64,
    },
    /// Render the announcement for a synthetic profile without touching the chain
    Preview {
        entity_id: u64,

        /// Aggregate score, 0-100
        #[arg(long, default_value = "75")]
        score: u8,
    },
}

fn setup_tracing() {
    if std::env::var("TOKIO_CONSOLE").is_ok() {
        console_subscriber::init();
        info!("tokio-console enabled on port 6669");
    } else {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,trust_sentinel=debug"));
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}

fn exit_on_invalid(config: &AppConfig) {
    let errors = config.validate();
    if errors.is_empty() {
        return;
    }
    for problem in &errors {
        error!("Configuration error: {}", problem);
    }
    std::process::exit(1);
}

fn registry_client(config: &AppConfig) -> Result<EthersRegistryClient> {
    let ethereum = &config.ethereum;
    let client = EthersRegistryClient::new(
        ethereum.rpc_url(),
        &ethereum.identity_registry,
        &ethereum.reputation_registry,
        ethereum.event_schema,
        ethereum.rpc_timeout,
    )?;
    Ok(client)
}

fn filter_config(config: &AppConfig) -> TrustFilterConfig {
    TrustFilterConfig {
        min_trust_score: config.sentinel.min_trust_score,
        ..TrustFilterConfig::default()
    }
}

async fn run(mut config: AppConfig, dry_run: bool, state_file: Option<PathBuf>) -> Result<()> {
    config.sentinel.dry_run |= dry_run;
    if let Some(path) = state_file {
        config.sentinel.state_file = path;
    }
    exit_on_invalid(&config);

    let network = config.ethereum.network;
    let client = Arc::new(registry_client(&config)?);

    let feed: Option<Arc<dyn FeedClient>> = if config.sentinel.dry_run {
        None
    } else {
        let feed_config = XFeedConfig {
            base_url: config.feed.base_url.clone(),
            access_token: config.feed.access_token.clone().unwrap_or_default(),
            ..XFeedConfig::default()
        };
        let feed = XFeedClient::new(feed_config)
            .map_err(|e| anyhow::anyhow!("Failed to build feed client: {e}"))?;
        Some(Arc::new(feed))
    };

    let publisher = Publisher::new(
        feed,
        config.sentinel.max_posts_per_hour,
        config.sentinel.dry_run,
        network.as_str(),
    );
    let sentinel = Sentinel::new(filter_config(&config), publisher);

    let watcher_config = RegistryWatcherConfig {
        poll_interval: config.sentinel.poll_interval,
        lookback_blocks: config.sentinel.lookback_blocks,
        state_file: config.sentinel.state_file.clone(),
        enrichment_concurrency: config.sentinel.enrichment_concurrency,
        fetch_dimension_scores: config.sentinel.fetch_dimension_scores,
    };
    let watcher = RegistryWatcher::new(client, watcher_config).await;

    println!("\n🦞 Trust Sentinel starting");
    println!("\nNetwork: {network}");
    println!("RPC: {}", config.ethereum.rpc_url());
    println!("Identity registry: {}", config.ethereum.identity_registry);
    println!("Reputation registry: {}", config.ethereum.reputation_registry);
    println!("\nConfiguration:");
    println!("- Min trust score: {}", config.sentinel.min_trust_score);
    println!("- Poll interval: {:?}", config.sentinel.poll_interval);
    println!("- Max posts/hour: {}", config.sentinel.max_posts_per_hour);
    println!("- Dry run: {}", config.sentinel.dry_run);
    println!("- State: {}", config.sentinel.state_file.display());

    let cancellation_token = CancellationToken::new();
    let task_tracker = TaskTracker::new();
    let (tx, rx) = flume::bounded(PROFILE_CHANNEL_CAPACITY);

    let watcher_token = cancellation_token.clone();
    task_tracker.spawn(async move {
        watcher.run(tx, watcher_token).await;
    });

    let shutdown_token = cancellation_token.clone();
    task_tracker.spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Shutdown signal received, stopping services..."),
                    Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                }
                shutdown_token.cancel();
            }
            _ = shutdown_token.cancelled() => {}
        }
    });

    let stats = sentinel.run(rx, cancellation_token.clone()).await;
    cancellation_token.cancel();
    task_tracker.close();

    info!("Waiting for background tasks...");
    match tokio::time::timeout(Duration::from_secs(30), task_tracker.wait()).await {
        Ok(()) => info!("All background tasks completed successfully"),
        Err(_) => {
            error!("Timeout waiting for background tasks to complete");
            std::process::exit(1);
        }
    }

    info!(
        seen = stats.seen,
        announced = stats.announced,
        filtered = stats.filtered,
        failed = stats.failed,
        "Clean shutdown complete"
    );
    Ok(())
}

async fn lookup(config: AppConfig, entity_id: u64) -> Result<()> {
    if config.ethereum.mainnet_rpc_url.is_empty() {
        error!("ETH_MAINNET_RPC_URL is required");
        std::process::exit(1);
    }

    let client = Arc::new(registry_client(&config)?);
    let watcher_config = RegistryWatcherConfig {
        fetch_dimension_scores: true,
        ..RegistryWatcherConfig::default()
    };
    let watcher =
        RegistryWatcher::with_checkpoint(client, watcher_config, WatcherCheckpoint::default());

    let profile = watcher.fetch_profile(entity_id).await;

    println!("Agent #{} owned by {}", profile.entity_id, profile.owner);
    if let Some(uri) = &profile.uri {
        println!("URI: {uri}");
    }
    println!("Feedback: {}", profile.feedback_count);
    println!("{}", format_trust_display(&profile));
    println!("{}", format_dimension_bars(&profile));

    match evaluate(&profile, &filter_config(&config)) {
        Some(reason) => println!("\nWould announce ({reason}):"),
        None => println!("\nWould not announce. Announcement would read:"),
    }
    println!("\n{}", format_announcement(&profile, config.ethereum.network.as_str()));
    Ok(())
}

fn preview(config: AppConfig, entity_id: u64, score: u8) {
    let summary = ReputationSummary {
        feedback_count: 1,
        average: score,
        dimensions: Vec::new(),
    };
    let profile = TrustProfile::from_reputation(
        entity_id,
        "0x0000000000000000000000000000000000000000",
        Some(summary),
    );
    let text = format_announcement(&profile, config.ethereum.network.as_str());

    println!("{text}");
    println!("\n({} characters)", char_len(&text));
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    setup_tracing();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("Failed to read configuration")?;

    match cli.command.unwrap_or(Command::Run {
        dry_run: false,
        state_file: None,
    }) {
        Command::Run {
            dry_run,
            state_file,
        } => run(config, dry_run, state_file).await?,
        Command::Lookup { entity_id } => lookup(config, entity_id).await?,
        Command::Preview { entity_id, score } => {
            if score > 100 {
                warn!(score, "Score above 100 will be clamped");
            }
            preview(config, entity_id, score.min(100));
        }
    }

    Ok(())
}
