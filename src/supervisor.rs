//! Wires the components together in dependency order and owns the
//! graceful-shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::challenge::ChallengeEngine;
use crate::config::Config;
use crate::consensus::{ConsensusError, ConsensusLog, LogMessage};
use crate::crypto::RsaKeyPair;
use crate::dispatch::{self, AppState};
use crate::ingestor::LogIngestor;
use crate::store::Store;

/// A consensus-log adapter that never yields messages and rejects
/// submissions — used when no real substrate credentials are
/// configured, so the proxy still boots and serves the dispatcher.
pub struct NullConsensusLog;

#[async_trait::async_trait]
impl ConsensusLog for NullConsensusLog {
    async fn subscribe(&self, _topic: &str, _from_sequence: u64) -> Result<mpsc::Receiver<LogMessage>, ConsensusError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn submit(&self, _topic: &str, _bytes: &[u8]) -> Result<u64, ConsensusError> {
        Err(ConsensusError::SubmitFailed("no consensus-log adapter configured".into()))
    }
}

pub struct Supervisor {
    config: Arc<Config>,
    store: Arc<RwLock<Store>>,
    ingestor: Arc<LogIngestor>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Store -> CryptoCore (generates an RSA pair if absent) -> LogIngestor -> ChallengeEngine.
    pub async fn init(config: Config, consensus: Arc<dyn ConsensusLog>) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let mut store = Store::load(&config.db_file)?;

        let rsa_keys = match store.rsa_keys() {
            Some(material) => Arc::new(RsaKeyPair::from_pem(&material.private_key)?),
            None => {
                info!("no RSA key material persisted, generating a new pair");
                let keys = RsaKeyPair::generate()?;
                store.set_rsa_keys(&keys)?;
                // Advertise the public key as the first message on the topic so
                // provers can discover it without a prior out-of-band fetch. Fee
                // quoting for this submission is out of scope; best-effort only.
                match consensus.submit(&config.topic_id, keys.public_pem()?.as_bytes()).await {
                    Ok(seq) => info!(sequence = seq, "published public key to consensus topic"),
                    Err(err) => error!(error = %err, "failed to publish public key to consensus topic"),
                }
                Arc::new(keys)
            }
        };

        let store = Arc::new(RwLock::new(store));

        let challenge = Arc::new(ChallengeEngine::new(
            Arc::clone(&store),
            Arc::clone(&rsa_keys),
            Duration::from_secs(config.challenge_timeout_secs),
            config.challenge_fanout,
        ));

        let cancel = CancellationToken::new();

        let (route_tx, route_rx) = mpsc::channel(config.challenge_fanout * 4);
        let ingestor = Arc::new(LogIngestor::new(
            consensus,
            Arc::clone(&store),
            Arc::clone(&rsa_keys),
            route_tx,
            config.topic_id.clone(),
            Duration::from_secs(config.chunk_ttl_secs),
            cancel.clone(),
        ));

        Self::spawn_challenge_consumer(challenge, route_rx);

        Ok(Self { config, store, ingestor, cancel })
    }

    fn spawn_challenge_consumer(challenge: Arc<ChallengeEngine>, mut route_rx: mpsc::Receiver<crate::validator::ValidRoute>) {
        tokio::spawn(async move {
            while let Some(route) = route_rx.recv().await {
                challenge.submit(route).await;
            }
        });
    }

    /// Starts the ingestor and the HTTP dispatcher, and runs until SIGINT.
    pub async fn run(self) -> anyhow::Result<()> {
        let ingestor = Arc::clone(&self.ingestor);
        let ingestor_task = tokio::spawn(async move { ingestor.run().await });

        let state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            http: reqwest::Client::new(),
        });
        let app = dispatch::router(state);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(port = self.config.port, "RPCDispatcher listening");

        let server = axum::serve(listener, app);
        tokio::select! {
            result = server => {
                if let Err(err) = result {
                    error!(error = %err, "http server exited with error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, draining in-flight work");
            }
        }

        // Stop accepting new log events immediately; let whatever message
        // or challenge round is already in flight run to completion.
        self.cancel.cancel();
        let drain = Duration::from_secs(self.config.drain_timeout_secs);
        if tokio::time::timeout(drain, ingestor_task).await.is_err() {
            tracing::warn!("ingestor did not stop within the drain window, abandoning it");
        }
        // Store writes are always synchronous (write -> fsync -> rename on
        // every mutation), so there is nothing buffered left to flush here;
        // the drain window above is what gives in-flight challenge rounds a
        // chance to reach a terminal state before the process exits.

        info!("shutdown complete");
        Ok(())
    }
}
