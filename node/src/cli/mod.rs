//! CLI and config handling.

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHAIN_LENGTH: u64 = 4096;
pub const DEFAULT_PEERS: usize = 3;
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_TIP_THRESHOLD: u64 = 128;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_FINALITY_INTERVAL: u64 = 64;

/// Block-sync node configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "blocksync-node", about = "Peer block-sync node v0.1")]
pub struct NodeConfig {
    /// Length of the simulated canonical chain to sync.
    #[arg(long, default_value_t = DEFAULT_CHAIN_LENGTH)]
    pub chain_length: u64,
    /// Number of simulated peers serving the chain.
    #[arg(long, default_value_t = DEFAULT_PEERS)]
    pub peers: usize,
    /// Maximum number of parallel sync workers.
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,
    /// Distance from the sync target at which tip mode engages.
    #[arg(long, default_value_t = DEFAULT_TIP_THRESHOLD)]
    pub tip_threshold: u64,
    /// Seconds between sync maintenance ticks.
    #[arg(long, default_value_t = DEFAULT_TICK_INTERVAL_SECS)]
    pub tick_interval_secs: u64,
    /// Finalize the chain every this many imported blocks.
    #[arg(long, default_value_t = DEFAULT_FINALITY_INTERVAL)]
    pub finality_interval: u64,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbosity: u8,
}

impl NodeConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }
}
