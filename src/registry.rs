//! On-chain access to the identity and reputation registries
//!
//! The watcher only sees the [`RegistryClient`] trait. [`EthersRegistryClient`]
//! implements it over JSON-RPC, decoding registrations with whichever
//! [`EventSchema`] the deployment emits.

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::utils::to_checksum;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

abigen!(
    IdentityRegistry,
    r#"[
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)
        event Registered(uint256 indexed agentId, string agentURI, address indexed owner)
        function ownerOf(uint256 tokenId) external view returns (address)
        function tokenURI(uint256 tokenId) external view returns (string)
    ]"#
);

abigen!(
    ReputationRegistry,
    r#"[
        function getClients(uint256 agentId) external view returns (address[])
        function getSummary(uint256 agentId, address[] clientAddresses, string tag1, string tag2) external view returns (uint64, int128, uint8)
    ]"#
);

#[derive(Debug)]
pub enum RegistryError {
    Rpc(String),
    Contract { call: &'static str, message: String },
    Timeout { call: &'static str, after: Duration },
    InvalidAddress(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Rpc(msg) => write!(f, "RPC error: {msg}"),
            RegistryError::Contract { call, message } => write!(f, "{call} failed: {message}"),
            RegistryError::Timeout { call, after } => write!(f, "{call} timed out after {after:?}"),
            RegistryError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
        }
    }
}

impl Error for RegistryError {}

/// Shape of the registration event emitted by the identity registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSchema {
    /// ERC-721 `Transfer(from, to, tokenId)`, a mint when `from` is zero
    #[default]
    Erc721Transfer,
    /// `Registered(agentId, agentURI, owner)`, always a mint
    Registered,
}

impl FromStr for EventSchema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transfer" | "erc721" => Ok(EventSchema::Erc721Transfer),
            "registered" => Ok(EventSchema::Registered),
            other => Err(format!("unknown event schema: {other}")),
        }
    }
}

/// Registration event decoded from a registry log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEvent {
    /// Previous holder; zero for a mint
    pub from: Address,
    pub to: Address,
    pub entity_id: u64,
    pub tx_hash: Option<H256>,
    pub block_number: Option<u64>,
    /// URI carried in the event itself, when the schema has one
    pub uri: Option<String>,
}

impl RegistrationEvent {
    pub fn is_mint(&self) -> bool {
        self.from.is_zero()
    }
}

/// Raw `getSummary` result before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawSummary {
    pub count: u64,
    pub value: i128,
    pub decimals: u8,
}

/// Read-only view of the registries
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, RegistryError>;

    /// Registration events in the inclusive block range
    async fn registration_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RegistrationEvent>, RegistryError>;

    async fn owner_of(&self, entity_id: u64) -> Result<Address, RegistryError>;

    async fn token_uri(&self, entity_id: u64) -> Result<String, RegistryError>;

    /// Addresses that have submitted feedback for the entity
    async fn clients(&self, entity_id: u64) -> Result<Vec<Address>, RegistryError>;

    /// Aggregate feedback scoped to exactly `clients`; empty tags match all tags
    async fn summary(
        &self,
        entity_id: u64,
        clients: &[Address],
        tag1: &str,
        tag2: &str,
    ) -> Result<RawSummary, RegistryError>;

    /// Calldata of a transaction, `None` if the node does not know it
    async fn transaction_input(&self, tx_hash: H256) -> Result<Option<Bytes>, RegistryError>;
}

/// Checksummed hex form of an address
pub fn format_address(address: &Address) -> String {
    to_checksum(address, None)
}

/// Registry client backed by an ethers HTTP provider
pub struct EthersRegistryClient {
    provider: Arc<Provider<Http>>,
    identity: IdentityRegistry<Provider<Http>>,
    reputation: ReputationRegistry<Provider<Http>>,
    schema: EventSchema,
    call_timeout: Duration,
}

impl EthersRegistryClient {
    pub fn new(
        rpc_url: &str,
        identity_registry: &str,
        reputation_registry: &str,
        schema: EventSchema,
        call_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| RegistryError::Rpc(format!("invalid rpc url {rpc_url}: {e}")))?;
        let provider = Arc::new(provider);

        let identity_address: Address = identity_registry
            .parse()
            .map_err(|_| RegistryError::InvalidAddress(identity_registry.to_string()))?;
        let reputation_address: Address = reputation_registry
            .parse()
            .map_err(|_| RegistryError::InvalidAddress(reputation_registry.to_string()))?;

        Ok(Self {
            identity: IdentityRegistry::new(identity_address, provider.clone()),
            reputation: ReputationRegistry::new(reputation_address, provider.clone()),
            provider,
            schema,
            call_timeout,
        })
    }

    pub fn schema(&self) -> EventSchema {
        self.schema
    }

    async fn timed<T, E, F>(&self, call: &'static str, fut: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RegistryError::Contract {
                call,
                message: e.to_string(),
            }),
            Err(_) => Err(RegistryError::Timeout {
                call,
                after: self.call_timeout,
            }),
        }
    }

    async fn transfer_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RegistrationEvent>, RegistryError> {
        let query = self
            .identity
            .transfer_filter()
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.timed("Transfer logs", query.query_with_meta()).await?;

        Ok(logs
            .into_iter()
            .filter_map(|(event, meta)| {
                let entity_id = entity_id_from_u256(event.token_id)?;
                Some(RegistrationEvent {
                    from: event.from,
                    to: event.to,
                    entity_id,
                    tx_hash: Some(meta.transaction_hash),
                    block_number: Some(meta.block_number.as_u64()),
                    uri: None,
                })
            })
            .collect())
    }

    async fn registered_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RegistrationEvent>, RegistryError> {
        let query = self
            .identity
            .registered_filter()
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.timed("Registered logs", query.query_with_meta()).await?;

        Ok(logs
            .into_iter()
            .filter_map(|(event, meta)| {
                let entity_id = entity_id_from_u256(event.agent_id)?;
                Some(RegistrationEvent {
                    from: Address::zero(),
                    to: event.owner,
                    entity_id,
                    tx_hash: Some(meta.transaction_hash),
                    block_number: Some(meta.block_number.as_u64()),
                    uri: Some(event.agent_uri).filter(|u| !u.is_empty()),
                })
            })
            .collect())
    }
}

fn entity_id_from_u256(id: U256) -> Option<u64> {
    if id > U256::from(u64::MAX) {
        warn!(entity_id = %id, "Entity id does not fit in 64 bits, skipping");
        return None;
    }
    Some(id.as_u64())
}

#[async_trait]
impl RegistryClient for EthersRegistryClient {
    async fn block_number(&self) -> Result<u64, RegistryError> {
        let block = self
            .timed("eth_blockNumber", self.provider.get_block_number())
            .await?;
        Ok(block.as_u64())
    }

    async fn registration_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RegistrationEvent>, RegistryError> {
        debug!(from_block, to_block, schema = ?self.schema, "Querying registration logs");
        match self.schema {
            EventSchema::Erc721Transfer => self.transfer_events(from_block, to_block).await,
            EventSchema::Registered => self.registered_events(from_block, to_block).await,
        }
    }

    async fn owner_of(&self, entity_id: u64) -> Result<Address, RegistryError> {
        let call = self.identity.owner_of(U256::from(entity_id));
        self.timed("ownerOf", call.call()).await
    }

    async fn token_uri(&self, entity_id: u64) -> Result<String, RegistryError> {
        let call = self.identity.token_uri(U256::from(entity_id));
        self.timed("tokenURI", call.call()).await
    }

    async fn clients(&self, entity_id: u64) -> Result<Vec<Address>, RegistryError> {
        let call = self.reputation.get_clients(U256::from(entity_id));
        self.timed("getClients", call.call()).await
    }

    async fn summary(
        &self,
        entity_id: u64,
        clients: &[Address],
        tag1: &str,
        tag2: &str,
    ) -> Result<RawSummary, RegistryError> {
        let call = self.reputation.get_summary(
            U256::from(entity_id),
            clients.to_vec(),
            tag1.to_string(),
            tag2.to_string(),
        );
        let (count, value, decimals) = self.timed("getSummary", call.call()).await?;
        Ok(RawSummary {
            count,
            value,
            decimals,
        })
    }

    async fn transaction_input(&self, tx_hash: H256) -> Result<Option<Bytes>, RegistryError> {
        let tx = self
            .timed("eth_getTransactionByHash", self.provider.get_transaction(tx_hash))
            .await?;
        Ok(tx.map(|tx| tx.input))
    }
}
