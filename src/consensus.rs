//! The consensus-log boundary.
//!
//! The concrete substrate (Hedera Consensus Service, reached through
//! `hedera-sdk-rust`) is out of scope for the core — topic creation,
//! fee quoting, and credential handling belong to the CLI/bootstrap
//! layer. The core only depends on this narrow trait, so it can be
//! driven by a real HCS-backed adapter in production or an in-memory
//! fake in tests, the same way the teacher stack keeps `alloy-provider`
//! behind an optional, swappable dependency.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("subscription lost: {0}")]
    SubscriptionLost(String),
    #[error("submit failed: {0}")]
    SubmitFailed(String),
}

/// One message observed on a topic, in strictly increasing `sequence_number`.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub sequence_number: u64,
    pub payload: Vec<u8>,
    /// Present when the message is one chunk of a larger reassembled
    /// payload.
    pub chunk_info: Option<ChunkInfo>,
}

#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub transaction_valid_start: String,
    pub index: u32,
    pub total: u32,
}

/// A trust-minimized append-only, topic-based messaging substrate with
/// per-message sequence numbers.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Subscribes to `topic`, yielding messages starting at
    /// `from_sequence` (inclusive) in strictly increasing order.
    async fn subscribe(
        &self,
        topic: &str,
        from_sequence: u64,
    ) -> Result<tokio::sync::mpsc::Receiver<LogMessage>, ConsensusError>;

    /// Submits `bytes` as a new message on `topic`, returning its
    /// assigned sequence number.
    async fn submit(&self, topic: &str, bytes: &[u8]) -> Result<u64, ConsensusError>;
}
