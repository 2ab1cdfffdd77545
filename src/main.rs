use std::sync::Arc;

use rpc_relay_proxy::config::Config;
use rpc_relay_proxy::supervisor::{NullConsensusLog, Supervisor};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::from_env()?;
    let supervisor = Supervisor::init(config, Arc::new(NullConsensusLog)).await?;
    supervisor.run().await
}
