//! Subscribes to the consensus log, reassembles chunked payloads, and
//! advances the per-topic watermark only once a message's fate
//! (installed, rejected, or permanently abandoned) is settled.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::challenge;
use crate::consensus::{ConsensusLog, LogMessage};
use crate::crypto::RsaKeyPair;
use crate::store::Store;
use crate::validator::{self, ValidRoute};

struct ChunkGroup {
    total: u32,
    chunks: Vec<Option<Vec<u8>>>,
    seqs: Vec<u64>,
    first_seen: Instant,
}

impl ChunkGroup {
    fn new(total: u32) -> Self {
        Self { total, chunks: vec![None; total as usize], seqs: Vec::new(), first_seen: Instant::now() }
    }

    fn received(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    fn concat(&self) -> Vec<u8> {
        self.chunks.iter().flatten().flat_map(|c| c.iter().copied()).collect()
    }
}

pub struct LogIngestor {
    consensus: Arc<dyn ConsensusLog>,
    store: Arc<RwLock<Store>>,
    rsa_keys: Arc<RsaKeyPair>,
    route_tx: mpsc::Sender<ValidRoute>,
    http: reqwest::Client,
    topic: String,
    chunk_ttl: Duration,
    groups: Mutex<std::collections::HashMap<String, ChunkGroup>>,
    /// Sequence numbers whose fate is settled but that arrived out of
    /// order (e.g. via chunk reassembly), waiting to become contiguous
    /// with the persisted watermark before it advances.
    settled: Mutex<BTreeSet<u64>>,
    /// Cooperative shutdown signal: once cancelled, the subscribe loop
    /// stops accepting new log events after the message in flight.
    cancel: CancellationToken,
}

impl LogIngestor {
    pub fn new(
        consensus: Arc<dyn ConsensusLog>,
        store: Arc<RwLock<Store>>,
        rsa_keys: Arc<RsaKeyPair>,
        route_tx: mpsc::Sender<ValidRoute>,
        topic: String,
        chunk_ttl: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            consensus,
            store,
            rsa_keys,
            route_tx,
            http: reqwest::Client::new(),
            topic,
            chunk_ttl,
            groups: Mutex::new(std::collections::HashMap::new()),
            settled: Mutex::new(BTreeSet::new()),
            cancel,
        }
    }

    /// Runs the subscribe loop and the chunk-TTL sweep concurrently
    /// until the consensus-log subscription ends or shutdown is signalled.
    /// Stops accepting new log events as soon as `cancel` fires; a
    /// message already being processed is allowed to finish.
    pub async fn run(self: Arc<Self>) {
        let from = self.store.read().await.watermark(&self.topic) + 1;
        let mut receiver = match self.consensus.subscribe(&self.topic, from).await {
            Ok(r) => r,
            Err(err) => {
                warn!(topic = %self.topic, error = %err, "failed to subscribe to consensus log");
                return;
            }
        };

        let sweeper = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.sweep_expired_chunks().await })
        };

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(topic = %self.topic, "log ingestion stopped, draining in-flight work");
                    break;
                }
                message = receiver.recv() => {
                    match message {
                        Some(message) => self.process_message(message).await,
                        None => break,
                    }
                }
            }
        }
        sweeper.abort();
    }

    async fn sweep_expired_chunks(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let mut expired = Vec::new();
            {
                let mut groups = self.groups.lock().await;
                let ttl = self.chunk_ttl;
                let now = Instant::now();
                groups.retain(|key, group| {
                    if now.duration_since(group.first_seen) > ttl {
                        expired.push((key.clone(), group.seqs.clone()));
                        false
                    } else {
                        true
                    }
                });
            }
            for (key, seqs) in expired {
                warn!(topic = %self.topic, tx_valid_start = %key, "chunk group expired before reassembly, abandoning");
                self.mark_settled(seqs).await;
            }
        }
    }

    async fn process_message(&self, message: LogMessage) {
        match message.chunk_info {
            Some(ref info) if info.total > 1 => {
                let complete = {
                    let mut groups = self.groups.lock().await;
                    let group = groups
                        .entry(info.transaction_valid_start.clone())
                        .or_insert_with(|| ChunkGroup::new(info.total));
                    if (info.index as usize) < group.chunks.len() {
                        group.chunks[info.index as usize] = Some(message.payload.clone());
                    }
                    group.seqs.push(message.sequence_number);
                    if group.received() == group.total as usize {
                        Some((group.concat(), group.seqs.clone()))
                    } else {
                        None
                    }
                };
                if let Some((payload, seqs)) = complete {
                    self.groups.lock().await.remove(&info.transaction_valid_start);
                    self.handle_payload(&payload, seqs).await;
                }
            }
            _ => {
                self.handle_payload(&message.payload, vec![message.sequence_number]).await;
            }
        }
    }

    async fn handle_payload(&self, payload: &[u8], seqs: Vec<u64>) {
        match validator::validate_payload(&self.rsa_keys.private_key, payload) {
            Ok(outcome) => {
                // Each invalid route is one announced route that never reaches
                // the challenge engine — it still owes the prover exactly one
                // failure confirmation, per the "no short-circuit" batch contract.
                for invalid in &outcome.invalid {
                    warn!(addr = %invalid.raw.addr, error = %invalid.error, "route rejected");
                    challenge::send_confirmation(&self.http, &invalid.raw.url, &invalid.raw.addr, false).await;
                }
                if !self.enqueue_all(outcome.valid).await {
                    // Backpressure: the challenge queue is saturated. Leave this
                    // message's sequence numbers unsettled so the watermark does
                    // not advance past it; it will be retried on a future poll.
                    return;
                }
            }
            Err(err) => {
                // Malformed payload / wrong key is a deterministic rejection —
                // it will never succeed on retry, so the watermark still advances.
                warn!(error = %err, "message failed to decrypt, treating as deterministic rejection");
            }
        }
        self.mark_settled(seqs).await;
    }

    /// Attempts to enqueue every valid route for the challenge engine,
    /// retrying with bounded backoff if the bounded queue is full.
    /// Returns false if the queue is still saturated after all retries.
    async fn enqueue_all(&self, routes: Vec<ValidRoute>) -> bool {
        const MAX_ATTEMPTS: u32 = 5;
        for route in routes {
            let mut sent = false;
            for attempt in 0..MAX_ATTEMPTS {
                match self.route_tx.try_send(route.clone()) {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            if !sent {
                warn!(addr = %route.addr, "challenge queue saturated, applying backpressure");
                return false;
            }
        }
        true
    }

    async fn mark_settled(&self, seqs: Vec<u64>) {
        let mut settled = self.settled.lock().await;
        settled.extend(seqs);

        let mut next_expected = self.store.read().await.watermark(&self.topic) + 1;
        let mut advanced_to = None;
        while settled.remove(&next_expected) {
            advanced_to = Some(next_expected);
            next_expected += 1;
        }
        drop(settled);

        if let Some(seq) = advanced_to {
            if let Err(err) = self.store.write().await.advance_watermark(&self.topic, seq) {
                warn!(topic = %self.topic, error = %err, "failed to persist watermark advance");
            } else {
                info!(topic = %self.topic, watermark = seq, "watermark advanced");
            }
        }
    }
}
