//! Sync workers and their outcomes.

use crate::p2p::{Direction, PeerId};
use alloy_primitives::B256;
use std::sync::Arc;
use std::time::Duration;

/// One logical fetch plan: sync from a start block to a target block,
/// possibly spanning several wire requests. `start_hash` is set only when the
/// start is addressed by hash (tip mode); bootstrap workers address by
/// number.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: u64,
    pub start_hash: Option<B256>,
    pub start_number: Option<u64>,
    pub target_hash: Option<B256>,
    pub target_number: Option<u64>,
    pub request_data: u8,
    pub direction: Direction,
    pub duration: Duration,
    pub err: Option<WorkerError>,
}

impl Worker {
    pub fn is_failed(&self) -> bool {
        self.err.is_some()
    }
}

/// Error produced while executing a worker, attributed to the peer whose
/// response caused it, if any.
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub error: Arc<eyre::Report>,
    pub who: Option<PeerId>,
}

impl WorkerError {
    pub fn new(error: eyre::Report, who: Option<PeerId>) -> Self {
        Self {
            error: Arc::new(error),
            who,
        }
    }

    /// Downcast the underlying error to a concrete kind.
    pub fn kind<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.who {
            Some(who) => write!(f, "{} (peer {who})", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}
