//! Work handler for bootstrap mode: serial ascending catch-up.

use crate::chain::BlockState;
use crate::p2p::{
    Direction, REQUESTED_DATA_BODY, REQUESTED_DATA_HEADER, REQUESTED_DATA_JUSTIFICATION,
};
use crate::sync::worker::Worker;
use crate::sync::PeerState;
use eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Data requested while catching up: everything.
pub const BOOTSTRAP_REQUEST_DATA: u8 =
    REQUESTED_DATA_HEADER | REQUESTED_DATA_BODY | REQUESTED_DATA_JUSTIFICATION;

/// Bootstrap-mode handler. Keeps a single worker racing from just above the
/// local head to the best peer-reported block.
pub struct BootstrapSyncer {
    block_state: Arc<dyn BlockState>,
}

impl BootstrapSyncer {
    pub fn new(block_state: Arc<dyn BlockState>) -> Self {
        Self { block_state }
    }

    /// A peer reporting a higher head than ours starts a catch-up worker.
    pub fn handle_new_peer_state(&self, peer: &PeerState) -> Result<Option<Worker>> {
        let head = self.block_state.best_block_header()?;
        if peer.best_number <= head.number {
            return Ok(None);
        }
        Ok(Some(Worker {
            id: 0,
            start_hash: None,
            start_number: Some(head.number + 1),
            target_hash: Some(peer.best_hash),
            target_number: Some(peer.best_number),
            request_data: BOOTSTRAP_REQUEST_DATA,
            direction: Direction::Ascending,
            duration: Duration::ZERO,
            err: None,
        }))
    }

    /// A failed worker is retried from wherever the head has advanced to,
    /// keeping the original target.
    pub fn handle_worker_result(&self, result: &Worker) -> Result<Option<Worker>> {
        if result.err.is_none() {
            return Ok(None);
        }
        let head = self.block_state.best_block_header()?;
        let Some(target_number) = result.target_number else {
            return Ok(None);
        };
        if target_number <= head.number {
            return Ok(None);
        }
        Ok(Some(Worker {
            id: 0,
            start_hash: None,
            start_number: Some(head.number + 1),
            target_hash: result.target_hash,
            target_number: result.target_number,
            request_data: result.request_data,
            direction: result.direction,
            duration: Duration::ZERO,
            err: None,
        }))
    }

    /// One worker at a time while bootstrapping.
    pub fn has_current_worker(&self, _proposed: &Worker, workers: &HashMap<u64, Worker>) -> bool {
        !workers.is_empty()
    }

    pub fn handle_tick(&self) -> Result<Option<Worker>> {
        Ok(None)
    }
}
