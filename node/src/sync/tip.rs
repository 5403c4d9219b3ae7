//! Work handler for tip mode: fork-aware fetch driven by the pending set.

use crate::chain::BlockState;
use crate::p2p::{Direction, REQUESTED_DATA_BODY};
use crate::sync::bootstrap::BOOTSTRAP_REQUEST_DATA;
use crate::sync::pending::DisjointBlockSet;
use crate::sync::ready::ReadyQueue;
use crate::sync::worker::Worker;
use crate::sync::{drain_completed, PeerState};
use eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Tip-mode handler. Peer heads land in the pending set via announcements;
/// the periodic tick walks that set and requests whatever is still missing.
pub struct TipSyncer {
    block_state: Arc<dyn BlockState>,
    pending: Arc<DisjointBlockSet>,
    ready: ReadyQueue,
}

impl TipSyncer {
    pub fn new(
        block_state: Arc<dyn BlockState>,
        pending: Arc<DisjointBlockSet>,
        ready: ReadyQueue,
    ) -> Self {
        Self {
            block_state,
            pending,
            ready,
        }
    }

    /// Peer heads aggregate into the pending set instead of starting work.
    pub fn handle_new_peer_state(&self, _peer: &PeerState) -> Result<Option<Worker>> {
        Ok(None)
    }

    /// A finished worker may have completed blocks whose descendants are now
    /// ready; drain them.
    pub async fn handle_worker_result(&self, result: &Worker) -> Result<Option<Worker>> {
        if result.is_failed() {
            return Ok(None);
        }
        drain_completed(self.block_state.as_ref(), &self.pending, &self.ready).await?;
        Ok(None)
    }

    /// Forks are fetched in parallel; admission is bounded only by the
    /// worker-table cap.
    pub fn has_current_worker(&self, _proposed: &Worker, _workers: &HashMap<u64, Worker>) -> bool {
        false
    }

    /// Walk the pending set and emit a worker for the first block that still
    /// needs something: the full block, its body, or its ancestors.
    pub async fn handle_tick(&self) -> Result<Option<Worker>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let finalized = self.block_state.highest_finalized_header()?;

        for block in self.pending.blocks() {
            if block.number <= finalized.number {
                // stale entry, dropped on the next finality notification
                continue;
            }
            let Some(header) = block.header.clone() else {
                // only hash and number known: fetch the whole block
                return Ok(Some(Worker {
                    id: 0,
                    start_hash: Some(block.hash),
                    start_number: Some(block.number),
                    target_hash: Some(block.hash),
                    target_number: Some(block.number),
                    request_data: BOOTSTRAP_REQUEST_DATA,
                    direction: Direction::Ascending,
                    duration: Duration::ZERO,
                    err: None,
                }));
            };
            if block.body.is_none() {
                // header known, body missing
                return Ok(Some(Worker {
                    id: 0,
                    start_hash: Some(block.hash),
                    start_number: Some(block.number),
                    target_hash: Some(block.hash),
                    target_number: Some(block.number),
                    request_data: REQUESTED_DATA_BODY,
                    direction: Direction::Ascending,
                    duration: Duration::ZERO,
                    err: None,
                }));
            }
            // complete block: either its parent became known in the meantime,
            // or we need to fetch ancestors down to known history
            let parent_known = self.block_state.has_header(header.parent_hash)?
                || self.ready.contains(header.parent_hash);
            if parent_known {
                drain_completed(self.block_state.as_ref(), &self.pending, &self.ready).await?;
                continue;
            }
            return Ok(Some(Worker {
                id: 0,
                start_hash: Some(block.hash),
                start_number: Some(block.number),
                target_hash: None,
                target_number: Some(finalized.number + 1),
                request_data: BOOTSTRAP_REQUEST_DATA,
                direction: Direction::Descending,
                duration: Duration::ZERO,
                err: None,
            }));
        }

        Ok(None)
    }
}
