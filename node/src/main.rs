mod chain;
mod cli;
mod metrics;
mod p2p;
mod sim;
mod sync;

use chain::{Block, BlockState, MemoryBlockState};
use cli::NodeConfig;
use eyre::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use metrics::{lag_to_target, rate_per_sec};
use p2p::{BlockAnnounceMessage, Network};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync::{chain_sync, SyncConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_args();
    init_tracing(config.verbosity);

    info!(
        chain_length = config.chain_length,
        peers = config.peers,
        max_workers = config.max_workers,
        "starting block-sync node"
    );

    let blocks = sim::generate_chain(config.chain_length);
    let network = Arc::new(sim::SimNetwork::new(blocks.clone(), config.peers));
    let target = network.target_number();
    let state = Arc::new(MemoryBlockState::new(blocks[0].header.clone()));
    drop(blocks);

    let (stop_tx, stop_rx) = watch::channel(false);
    let sync_config = SyncConfig {
        max_workers: config.max_workers,
        tip_threshold: config.tip_threshold,
        tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
        ..SyncConfig::default()
    };
    let (driver, handle, mut ready_rx) = chain_sync(
        sync_config,
        Arc::clone(&state) as Arc<dyn BlockState>,
        Arc::clone(&network) as Arc<dyn Network>,
        stop_rx,
    );
    let driver_handle = tokio::spawn(driver.run());

    let progress = if std::io::stderr().is_terminal() {
        let bar = ProgressBar::new(target);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        let style = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} | {elapsed_precise} | {msg}",
        )
        .expect("progress style");
        bar.set_style(style);
        bar.set_message("importing blocks");
        Some(bar)
    } else {
        None
    };

    // block processor: drain the ready stream, import in arrival order, and
    // advance finality periodically
    let processor_state = Arc::clone(&state);
    let processor_network = Arc::clone(&network);
    let finality_interval = config.finality_interval.max(1);
    let processor = tokio::spawn(async move {
        let mut imported = 0u64;
        while let Some(block_data) = ready_rx.recv().await {
            let (Some(header), Some(body)) = (block_data.header, block_data.body) else {
                warn!(hash = %block_data.hash, "ready block missing header or body");
                continue;
            };
            let number = header.number;
            if let Err(err) = processor_state.import_block(Block {
                header: header.clone(),
                body,
            }) {
                warn!(error = %err, number, "failed to import block");
                continue;
            }
            imported += 1;
            if let Some(bar) = progress.as_ref() {
                bar.inc(1);
            }
            if number % finality_interval == 0 {
                processor_state.finalize_up_to(number.saturating_sub(finality_interval));
            }
            if number == target {
                processor_network.gossip_message(BlockAnnounceMessage {
                    header,
                    best_block: true,
                });
                break;
            }
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        imported
    });

    let sync_started = Instant::now();
    for (who, best_hash, best_number) in network.peer_heads() {
        if let Err(err) = handle.set_peer_head(who, best_hash, best_number).await {
            warn!(error = %err, peer = %who, "failed to set peer head");
        }
    }

    tokio::select! {
        imported = processor => {
            let imported = imported.unwrap_or(0);
            let elapsed = sync_started.elapsed();
            let head = state.best_block_header()?.number;
            info!(
                imported,
                head,
                lag_blocks = lag_to_target(target, head),
                blocks_per_sec = ?rate_per_sec(imported, elapsed),
                elapsed_ms = elapsed.as_millis() as u64,
                mode = ?handle.sync_mode(),
                "sync complete"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
        }
    }

    let _ = stop_tx.send(true);
    let _ = driver_handle.await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let (global, local) = match verbosity {
                0 => ("warn", "info"),
                1 => ("warn", "debug"),
                _ => ("info", "trace"),
            };
            EnvFilter::new(format!("{global},blocksync_node={local}"))
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
