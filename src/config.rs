//! Environment configuration for the sentinel binary

use crate::registry::EventSchema;
use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Chain the sentinel watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Sepolia,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Sepolia => "sepolia",
        }
    }

    pub fn identity_registry(&self) -> &'static str {
        match self {
            Network::Mainnet => "0x8004A169FB4a3325136EB29fA0ceB6D2e539a432",
            Network::Sepolia => "0x8004A818BFB912233c491871b3d84c89A494BD9e",
        }
    }

    pub fn reputation_registry(&self) -> &'static str {
        match self {
            Network::Mainnet => "0x8004BAa17C55a88189AE136b182e5fdA19dE9b63",
            Network::Sepolia => "0x8004B663056A597Dffe9eCcC1965A193B7388713",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "sepolia" => Ok(Network::Sepolia),
            other => Err(anyhow!("unsupported network: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EthereumConfig {
    pub mainnet_rpc_url: String,
    pub sepolia_rpc_url: Option<String>,
    pub network: Network,
    pub identity_registry: String,
    pub reputation_registry: String,
    pub event_schema: EventSchema,
    pub rpc_timeout: Duration,
}

impl EthereumConfig {
    /// RPC endpoint for the selected network
    pub fn rpc_url(&self) -> &str {
        match (self.network, &self.sepolia_rpc_url) {
            (Network::Sepolia, Some(url)) if !url.is_empty() => url,
            _ => &self.mainnet_rpc_url,
        }
    }
}

#[derive(Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub access_token: Option<String>,
}

impl FeedConfig {
    pub fn is_configured(&self) -> bool {
        self.access_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("base_url", &self.base_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SentinelSettings {
    pub min_trust_score: u8,
    pub poll_interval: Duration,
    pub lookback_blocks: u64,
    pub max_posts_per_hour: usize,
    pub dry_run: bool,
    pub state_file: PathBuf,
    pub enrichment_concurrency: usize,
    pub fetch_dimension_scores: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ethereum: EthereumConfig,
    pub feed: FeedConfig,
    pub sentinel: SentinelSettings,
}

impl AppConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let network: Network = match get("SENTINEL_NETWORK") {
            Some(v) => v.parse()?,
            None => Network::default(),
        };

        let event_schema = match get("SENTINEL_EVENT_SCHEMA") {
            Some(v) => v.parse::<EventSchema>().map_err(|e| anyhow!(e))?,
            None => EventSchema::default(),
        };

        let ethereum = EthereumConfig {
            mainnet_rpc_url: get("ETH_MAINNET_RPC_URL").unwrap_or_default(),
            sepolia_rpc_url: get("ETH_SEPOLIA_RPC_URL"),
            network,
            identity_registry: get("SENTINEL_IDENTITY_REGISTRY")
                .unwrap_or_else(|| network.identity_registry().to_string()),
            reputation_registry: get("SENTINEL_REPUTATION_REGISTRY")
                .unwrap_or_else(|| network.reputation_registry().to_string()),
            event_schema,
            rpc_timeout: Duration::from_secs(parse_or(&get, "SENTINEL_RPC_TIMEOUT_SECS", 30)?),
        };

        let feed = FeedConfig {
            base_url: get("X_API_BASE_URL").unwrap_or_else(|| "https://api.twitter.com".to_string()),
            access_token: get("X_USER_ACCESS_TOKEN"),
        };

        let sentinel = SentinelSettings {
            min_trust_score: parse_or(&get, "SENTINEL_MIN_TRUST_SCORE", 60)?,
            poll_interval: Duration::from_secs(parse_or(&get, "SENTINEL_POLL_INTERVAL_SECS", 60)?),
            lookback_blocks: parse_or(&get, "SENTINEL_LOOKBACK_BLOCKS", 1000)?,
            max_posts_per_hour: parse_or(&get, "SENTINEL_MAX_POSTS_PER_HOUR", 10)?,
            dry_run: parse_bool(get("SENTINEL_DRY_RUN")),
            state_file: PathBuf::from(
                get("SENTINEL_STATE_FILE").unwrap_or_else(|| "./data/sentinel_state.json".to_string()),
            ),
            enrichment_concurrency: parse_or(&get, "SENTINEL_ENRICHMENT_CONCURRENCY", 4)?,
            fetch_dimension_scores: parse_bool(get("SENTINEL_FETCH_DIMENSIONS")),
        };

        Ok(Self {
            ethereum,
            feed,
            sentinel,
        })
    }

    /// Every problem that must stop startup
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ethereum.mainnet_rpc_url.is_empty() {
            errors.push("ETH_MAINNET_RPC_URL is required".to_string());
        }

        if self.ethereum.identity_registry.parse::<Address>().is_err() {
            errors.push(format!(
                "identity registry address is invalid: {}",
                self.ethereum.identity_registry
            ));
        }

        if self.ethereum.reputation_registry.parse::<Address>().is_err() {
            errors.push(format!(
                "reputation registry address is invalid: {}",
                self.ethereum.reputation_registry
            ));
        }

        if !self.sentinel.dry_run && !self.feed.is_configured() {
            errors.push(
                "X_USER_ACCESS_TOKEN is required (or set SENTINEL_DRY_RUN=true)".to_string(),
            );
        }

        if self.sentinel.min_trust_score > 100 {
            errors.push(format!(
                "SENTINEL_MIN_TRUST_SCORE must be 0-100, got {}",
                self.sentinel.min_trust_score
            ));
        }

        if self.sentinel.max_posts_per_hour == 0 {
            errors.push("SENTINEL_MAX_POSTS_PER_HOUR must be > 0".to_string());
        }

        if self.sentinel.poll_interval.is_zero() {
            errors.push("SENTINEL_POLL_INTERVAL_SECS must be > 0".to_string());
        }

        if self.ethereum.rpc_timeout.is_zero() {
            errors.push("SENTINEL_RPC_TIMEOUT_SECS must be > 0".to_string());
        }

        errors
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw}")),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}
