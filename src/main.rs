//! CLI entry point for the blockchain consensus simulator: builds a
//! `SimulationConfig` from flags, starts a `SimulationDriver`, and runs
//! it for a configured duration or until Ctrl-C.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use nexuschain::config::{
    AttackConfig, ConsensusAlgorithm as CoreConsensusAlgorithm, NodeEndpoint, SimulationConfig,
};
use nexuschain::monitoring::TracingMonitor;
use nexuschain::simulation::SimulationDriver;

/// Which consensus engine to run. Mirrors `nexuschain::config::ConsensusAlgorithm`;
/// kept as a separate `clap`-friendly enum so `--consensus` gets a plain
/// lowercase `value_enum` without leaking serde's `rename_all` choice.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ConsensusArg {
    Pbft,
    Poa,
    Pos,
}

impl From<ConsensusArg> for CoreConsensusAlgorithm {
    fn from(arg: ConsensusArg) -> Self {
        match arg {
            ConsensusArg::Pbft => CoreConsensusAlgorithm::Pbft,
            ConsensusArg::Poa => CoreConsensusAlgorithm::Poa,
            ConsensusArg::Pos => CoreConsensusAlgorithm::Pos,
        }
    }
}

/// Multi-node blockchain consensus simulator (PBFT / PoA / PoS).
#[derive(Parser, Debug)]
#[command(name = "nexuschain", version, about)]
struct Cli {
    /// Number of simulated nodes.
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Base TCP port; node `i` listens on `base_port + i`.
    #[arg(long, default_value_t = 5000)]
    base_port: u16,

    /// Consensus engine to run.
    #[arg(long, value_enum, default_value_t = ConsensusArg::Pbft)]
    consensus: ConsensusArg,

    /// How long to run the simulation, in seconds. Ctrl-C stops early.
    #[arg(long, default_value_t = 120)]
    duration_secs: u64,

    /// Transactions generated per node per driver tick.
    #[arg(long, default_value_t = 2)]
    transaction_rate: u32,

    /// Block time for PoA, in seconds.
    #[arg(long, default_value_t = 5)]
    poa_block_time_secs: u64,

    /// Probability in [0, 1] that the fault injector drops an inbound message.
    #[arg(long, default_value_t = 0.0)]
    attack_drop_rate: f64,

    /// Comma-separated node ids to partition away from the rest of the network.
    #[arg(long, value_delimiter = ',')]
    attack_partition: Vec<u64>,

    /// Enables replay capture/rebroadcast of dropped or delayed messages.
    #[arg(long, default_value_t = false)]
    attack_replay: bool,

    /// Log filter, passed straight to `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

impl Cli {
    fn into_simulation_config(self) -> SimulationConfig {
        let nodes: Vec<NodeEndpoint> = (0..self.nodes as u64)
            .map(|i| NodeEndpoint {
                node_id: i,
                ip: "127.0.0.1".to_string(),
                port: self.base_port + i as u16,
            })
            .collect();
        let staking_balances: HashMap<u64, u64> = (0..self.nodes as u64).map(|i| (i, 10)).collect();
        let validators_poa: Vec<u64> = (0..self.nodes as u64).collect();

        let attack_config = AttackConfig {
            enabled: self.attack_drop_rate > 0.0 || !self.attack_partition.is_empty() || self.attack_replay,
            drop_rate: self.attack_drop_rate,
            delay_range: (0.0, 0.0),
            partition_nodes: self.attack_partition,
            replay_enabled: self.attack_replay,
        };

        let mut config = SimulationConfig::default();
        config.nodes = nodes;
        config.consensus_algorithm = self.consensus.into();
        config.simulation_duration_secs = self.duration_secs;
        config.transaction_rate = self.transaction_rate;
        config.staking_balances = staking_balances;
        config.validators_poa = validators_poa;
        config.poa_block_time_secs = self.poa_block_time_secs;
        config.attack_config = attack_config;
        config
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_filter = cli.log_filter.clone();
    let duration_secs = cli.duration_secs;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_filter))
        .init();

    let config = cli.into_simulation_config();
    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(config, duration_secs).await {
        eprintln!("fatal error: {err}");
        std::process::exit(1);
    }
}

async fn run(config: SimulationConfig, duration_secs: u64) -> Result<(), nexuschain::error::CoreError> {
    let monitoring = Arc::new(TracingMonitor::new());
    let driver = Arc::new(SimulationDriver::setup(config, monitoring).await?);
    driver.start().await;

    tracing::info!(duration_secs, "simulation running");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {
            tracing::info!("simulation duration elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, stopping");
        }
    }

    driver.stop().await;
    Ok(())
}
