//! Process configuration, loaded entirely from the environment.
//!
//! `.env` parsing and CLI argument handling are explicitly out of
//! scope for the core (see spec §1) — by the time `Config::from_env`
//! runs, the process environment is assumed to already be populated.

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Testnet,
    Mainnet,
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "testnet" => Ok(Network::Testnet),
            "mainnet" => Ok(Network::Mainnet),
            other => anyhow::bail!("invalid NETWORK {other:?}, expected testnet or mainnet"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Ecdsa,
    Ed25519,
}

impl std::str::FromStr for KeyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ECDSA" => Ok(KeyType::Ecdsa),
            "ED25519" => Ok(KeyType::Ed25519),
            other => anyhow::bail!("invalid KEY_TYPE {other:?}, expected ECDSA or Ed25519"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the RPCDispatcher/ControlAPI HTTP server listens on.
    pub port: u16,

    /// Path to the persisted routing/store document.
    pub db_file: String,

    /// Target network for the consensus-log adapter.
    pub network: Network,

    /// Fallback backend when no route matches the decoded `to` address.
    pub default_backend: String,

    /// Consensus-log topic this proxy subscribes to and publishes on.
    pub topic_id: String,

    /// Consensus-log account identifier used to submit messages.
    pub account_id: String,

    /// Consensus-log account private key (secret — never logged).
    pub private_key: String,

    /// Key algorithm backing `private_key`.
    pub key_type: KeyType,

    /// Challenge round-trip deadline (`T_chal`), default 30s.
    pub challenge_timeout_secs: u64,

    /// Chunk-reassembly TTL (`T_chunk`), default 60s.
    pub chunk_ttl_secs: u64,

    /// Graceful-shutdown drain deadline (`T_drain`), default 30s.
    pub drain_timeout_secs: u64,

    /// Max concurrently Pending challenges across distinct addresses.
    pub challenge_fanout: usize,

    /// Per-request reverse-proxy timeout, default 30s.
    pub proxy_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8545".into())
                .parse()
                .context("invalid PORT")?,
            db_file: std::env::var("DB_FILE")
                .or_else(|_| std::env::var("DATA_FOLDER").map(|d| format!("{d}/store.json")))
                .unwrap_or_else(|_| "./data/store.json".into()),
            network: std::env::var("NETWORK")
                .unwrap_or_else(|_| "testnet".into())
                .parse()
                .context("invalid NETWORK")?,
            default_backend: std::env::var("DEFAULT_BACKEND")
                .unwrap_or_else(|_| "https://testnet.hashio.io/api".into()),
            topic_id: std::env::var("TOPIC_ID").unwrap_or_default(),
            account_id: std::env::var("ACCOUNT_ID").unwrap_or_default(),
            private_key: std::env::var("PRIVATE_KEY").unwrap_or_default(),
            key_type: std::env::var("KEY_TYPE")
                .unwrap_or_else(|_| "ECDSA".into())
                .parse()
                .context("invalid KEY_TYPE")?,
            challenge_timeout_secs: std::env::var("CHALLENGE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .unwrap_or(30),
            chunk_ttl_secs: std::env::var("CHUNK_TTL_SECS")
                .unwrap_or_else(|_| "60".into())
                .parse()
                .unwrap_or(60),
            drain_timeout_secs: std::env::var("DRAIN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .unwrap_or(30),
            challenge_fanout: std::env::var("CHALLENGE_FANOUT")
                .unwrap_or_else(|_| "16".into())
                .parse()
                .unwrap_or(16),
            proxy_timeout_secs: std::env::var("PROXY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .unwrap_or(30),
        })
    }
}
