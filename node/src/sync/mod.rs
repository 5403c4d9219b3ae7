//! Chain synchronization engine.
//!
//! Peer head reports flow into a work queue; the driver turns them into
//! bounded parallel fetch workers via the mode-specific handler (bootstrap or
//! tip). Worker tasks expand their plan into wire requests, pre-validate the
//! responses, and route blocks either to the ready queue (parent known,
//! parent-first order) or into the pending set (parent unknown). Worker
//! outcomes come back over the result queue for retry decisions.

mod bootstrap;
mod pending;
mod ready;
mod requests;
mod tip;
mod validate;
mod worker;

pub use bootstrap::{BootstrapSyncer, BOOTSTRAP_REQUEST_DATA};
pub use pending::{DisjointBlockSet, PendingBlock};
pub use ready::{ready_queue, ReadyQueue};
pub use requests::{worker_to_requests, RequestError};
pub use tip::TipSyncer;
pub use validate::{validate_block_data, validate_response, ValidationError};
pub use worker::{Worker, WorkerError};

use crate::chain::{Block, BlockData, BlockState, Header};
use crate::metrics::median;
use crate::p2p::{reputation, BlockHashOrNumber, BlockRequestMessage, Network, PeerId};
use alloy_primitives::B256;
use eyre::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// Maximum number of concurrently dispatched workers.
pub const MAX_WORKERS: usize = 4;

/// Distance from the sync target at which the engine runs in tip mode.
pub const TIP_THRESHOLD: u64 = 128;

/// Sync target reported while no peer heads are known. Large enough to keep
/// the engine in bootstrap until peers show up.
const NO_PEERS_TARGET: u64 = (1 << 33) - 1;

const WORK_QUEUE_CAPACITY: usize = 1024;
const RESULT_QUEUE_CAPACITY: usize = 1024;

/// Operating mode of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Far behind the network head: serial ascending catch-up.
    Bootstrap,
    /// Near the head: parallel fork-aware fetch.
    Tip,
}

/// A peer's self-advertised best block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    pub who: PeerId,
    pub best_hash: B256,
    pub best_number: u64,
}

/// Engine-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// No connected peer can serve the request.
    NoPeers,
    /// Peer advertised a block inconsistent with finalized history.
    PeerOnInvalidFork(PeerId),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPeers => write!(f, "no peers available to sync from"),
            Self::PeerOnInvalidFork(who) => {
                write!(f, "peer {who} is on an invalid fork")
            }
        }
    }
}

impl std::error::Error for SyncError {}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_workers: usize,
    pub tip_threshold: u64,
    pub tick_interval: Duration,
    pub ready_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: MAX_WORKERS,
            tip_threshold: TIP_THRESHOLD,
            tick_interval: Duration::from_secs(60),
            ready_queue_capacity: crate::p2p::MAX_RESPONSE_SIZE as usize,
        }
    }
}

/// Shared references handed to each spawned worker task.
struct WorkerContext {
    block_state: Arc<dyn BlockState>,
    network: Arc<dyn Network>,
    peer_state: Arc<RwLock<HashMap<PeerId, PeerState>>>,
    pending: Arc<DisjointBlockSet>,
    ready: ReadyQueue,
    result_tx: mpsc::Sender<Worker>,
}

/// Mode-specific work handler; the set of modes is closed.
enum WorkHandler {
    Bootstrap(BootstrapSyncer),
    Tip(TipSyncer),
}

impl WorkHandler {
    fn handle_new_peer_state(&self, peer: &PeerState) -> Result<Option<Worker>> {
        match self {
            Self::Bootstrap(syncer) => syncer.handle_new_peer_state(peer),
            Self::Tip(syncer) => syncer.handle_new_peer_state(peer),
        }
    }

    async fn handle_worker_result(&self, result: &Worker) -> Result<Option<Worker>> {
        match self {
            Self::Bootstrap(syncer) => syncer.handle_worker_result(result),
            Self::Tip(syncer) => syncer.handle_worker_result(result).await,
        }
    }

    fn has_current_worker(&self, proposed: &Worker, workers: &HashMap<u64, Worker>) -> bool {
        match self {
            Self::Bootstrap(syncer) => syncer.has_current_worker(proposed, workers),
            Self::Tip(syncer) => syncer.has_current_worker(proposed, workers),
        }
    }

    async fn handle_tick(&self) -> Result<Option<Worker>> {
        match self {
            Self::Bootstrap(syncer) => syncer.handle_tick(),
            Self::Tip(syncer) => syncer.handle_tick().await,
        }
    }
}

/// Externally-facing handle: peer events in, mode out.
#[derive(Clone)]
pub struct SyncHandle {
    block_state: Arc<dyn BlockState>,
    network: Arc<dyn Network>,
    peer_state: Arc<RwLock<HashMap<PeerId, PeerState>>>,
    pending: Arc<DisjointBlockSet>,
    work_tx: mpsc::Sender<PeerState>,
    mode_rx: watch::Receiver<SyncMode>,
}

impl SyncHandle {
    /// Record a peer's best block. A head above ours becomes sync work; one
    /// at or below is checked against our chain, demoting peers whose view
    /// contradicts finalized history.
    pub async fn set_peer_head(&self, who: PeerId, best_hash: B256, best_number: u64) -> Result<()> {
        let peer = PeerState {
            who,
            best_hash,
            best_number,
        };
        self.peer_state.write().insert(who, peer);

        let head = self.block_state.best_block_header()?;
        if best_number > head.number {
            self.pending.add_hash_and_number(best_hash, best_number);
            self.work_tx
                .send(peer)
                .await
                .map_err(|_| eyre::eyre!("sync driver stopped"))?;
            return Ok(());
        }

        if self.block_state.get_hash_by_number(best_number)? == Some(best_hash) {
            return Ok(());
        }

        let finalized = self.block_state.highest_finalized_header()?;
        if finalized.number >= best_number {
            self.peer_state.write().remove(&who);
            self.network.report_peer(who, reputation::INVALID_FORK);
            return Err(SyncError::PeerOnInvalidFork(who).into());
        }

        if self.block_state.has_header(best_hash)? {
            return Ok(());
        }

        // fork below our head but above finality: track it, no work yet
        self.pending.add_hash_and_number(best_hash, best_number);
        Ok(())
    }

    /// Record an announced block header if we do not have it yet.
    pub fn set_block_announce(&self, from: PeerId, header: Header) -> Result<()> {
        if self.block_state.has_header(header.hash())? {
            return Ok(());
        }
        tracing::debug!(peer = %from, number = header.number, "block announcement added to pending set");
        self.pending.add_header(header);
        Ok(())
    }

    /// Current operating mode.
    pub fn sync_mode(&self) -> SyncMode {
        *self.mode_rx.borrow()
    }
}

/// The sync driver. Owns the worker table and mode; everything else reaches
/// it through the work and result queues.
pub struct ChainSync {
    config: SyncConfig,
    block_state: Arc<dyn BlockState>,
    pending: Arc<DisjointBlockSet>,
    ready: ReadyQueue,
    peer_state: Arc<RwLock<HashMap<PeerId, PeerState>>>,
    work_rx: mpsc::Receiver<PeerState>,
    result_rx: mpsc::Receiver<Worker>,
    finalized_rx: mpsc::UnboundedReceiver<Header>,
    mode_tx: watch::Sender<SyncMode>,
    stop_rx: watch::Receiver<bool>,
    workers: HashMap<u64, Worker>,
    next_worker: u64,
    handler: WorkHandler,
    ctx: Arc<WorkerContext>,
}

/// Build the engine. Returns the driver, the handle for peer events, and the
/// receiver end of the ready-block stream for the block processor.
pub fn chain_sync(
    config: SyncConfig,
    block_state: Arc<dyn BlockState>,
    network: Arc<dyn Network>,
    stop_rx: watch::Receiver<bool>,
) -> (ChainSync, SyncHandle, mpsc::Receiver<BlockData>) {
    let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
    let (result_tx, result_rx) = mpsc::channel(RESULT_QUEUE_CAPACITY);
    let capacity = config
        .ready_queue_capacity
        .max(crate::p2p::MAX_RESPONSE_SIZE as usize);
    let (ready, ready_rx) = ready_queue(capacity);

    let (finalized_tx, finalized_rx) = mpsc::unbounded_channel();
    block_state.register_finalized_channel(finalized_tx);

    let peer_state = Arc::new(RwLock::new(HashMap::new()));
    let pending = Arc::new(DisjointBlockSet::new());
    let (mode_tx, mode_rx) = watch::channel(SyncMode::Bootstrap);

    let ctx = Arc::new(WorkerContext {
        block_state: Arc::clone(&block_state),
        network: Arc::clone(&network),
        peer_state: Arc::clone(&peer_state),
        pending: Arc::clone(&pending),
        ready: ready.clone(),
        result_tx,
    });

    let handle = SyncHandle {
        block_state: Arc::clone(&block_state),
        network,
        peer_state: Arc::clone(&peer_state),
        pending: Arc::clone(&pending),
        work_tx,
        mode_rx,
    };

    let driver = ChainSync {
        handler: WorkHandler::Bootstrap(BootstrapSyncer::new(Arc::clone(&block_state))),
        config,
        block_state,
        pending,
        ready,
        peer_state,
        work_rx,
        result_rx,
        finalized_rx,
        mode_tx,
        stop_rx,
        workers: HashMap::new(),
        next_worker: 0,
        ctx,
    };

    (driver, handle, ready_rx)
}

impl ChainSync {
    /// Drive the engine until the stop signal flips.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; burn the first tick so the engine
        // starts reacting to peers, not to an empty view
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    // a dropped stop sender also means shutdown
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                Some(peer) = self.work_rx.recv() => {
                    if let Err(err) = self.handle_work(&peer) {
                        tracing::error!(error = %err, peer = %peer.who, "failed to handle sync work");
                    }
                }
                Some(result) = self.result_rx.recv() => {
                    if let Err(err) = self.handle_result(result).await {
                        tracing::error!(error = %err, "failed to handle worker result");
                    }
                }
                Some(finalized) = self.finalized_rx.recv() => {
                    self.pending.remove_lower_blocks(finalized.number);
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.handle_tick().await {
                        tracing::error!(error = %err, "sync tick failed");
                    }
                }
            }
        }
        tracing::debug!("sync driver stopped");
    }

    fn handle_work(&mut self, peer: &PeerState) -> Result<()> {
        tracing::debug!(peer = %peer.who, best_number = peer.best_number, "handling sync work");
        if let Some(worker) = self.handler.handle_new_peer_state(peer)? {
            self.try_dispatch_worker(worker);
        }
        Ok(())
    }

    async fn handle_result(&mut self, result: Worker) -> Result<()> {
        self.workers.remove(&result.id);
        match &result.err {
            Some(err) => tracing::warn!(
                worker = result.id,
                error = %err,
                elapsed_ms = result.duration.as_millis() as u64,
                "worker errored"
            ),
            None => tracing::debug!(
                worker = result.id,
                elapsed_ms = result.duration.as_millis() as u64,
                "worker finished"
            ),
        }
        if let Some(worker) = self.handler.handle_worker_result(&result).await? {
            self.try_dispatch_worker(worker);
        }
        Ok(())
    }

    async fn handle_tick(&mut self) -> Result<()> {
        self.reevaluate_mode()?;
        if let Some(worker) = self.handler.handle_tick().await? {
            self.try_dispatch_worker(worker);
        }
        Ok(())
    }

    /// Median of peer-reported best numbers, or a sentinel with no peers.
    fn get_target(&self) -> u64 {
        let peers = self.peer_state.read();
        let numbers: Vec<u64> = peers.values().map(|peer| peer.best_number).collect();
        median(&numbers).unwrap_or(NO_PEERS_TARGET)
    }

    fn reevaluate_mode(&mut self) -> Result<()> {
        let target = self.get_target();
        let head = self.block_state.best_block_header()?.number;
        let mode = if target.abs_diff(head) <= self.config.tip_threshold {
            SyncMode::Tip
        } else {
            SyncMode::Bootstrap
        };
        if *self.mode_tx.borrow() == mode {
            return Ok(());
        }
        tracing::info!(?mode, target, head, "sync mode changed");
        self.handler = match mode {
            SyncMode::Bootstrap => {
                WorkHandler::Bootstrap(BootstrapSyncer::new(Arc::clone(&self.block_state)))
            }
            SyncMode::Tip => WorkHandler::Tip(TipSyncer::new(
                Arc::clone(&self.block_state),
                Arc::clone(&self.pending),
                self.ready.clone(),
            )),
        };
        let _ = self.mode_tx.send(mode);
        Ok(())
    }

    fn try_dispatch_worker(&mut self, worker: Worker) {
        if self.workers.len() >= self.config.max_workers {
            tracing::debug!(workers = self.workers.len(), "worker table full, not dispatching");
            return;
        }
        if self.handler.has_current_worker(&worker, &self.workers) {
            return;
        }
        self.dispatch_worker(worker);
    }

    fn dispatch_worker(&mut self, mut worker: Worker) {
        worker.id = self.next_worker;
        self.next_worker += 1;
        tracing::debug!(
            worker = worker.id,
            start = ?worker.start_number,
            target = ?worker.target_number,
            direction = ?worker.direction,
            "dispatching worker"
        );
        self.workers.insert(worker.id, worker.clone());
        tokio::spawn(execute_worker(Arc::clone(&self.ctx), worker));
    }
}

/// Execute one worker: expand it into requests and run them in order. The
/// worker, stamped with its duration and any error, always lands on the
/// result queue.
async fn execute_worker(ctx: Arc<WorkerContext>, mut worker: Worker) {
    let started = Instant::now();
    match worker_to_requests(&worker) {
        Ok(requests) => {
            for request in requests {
                if let Err(err) = do_sync(&ctx, request).await {
                    worker.err = Some(err);
                    break;
                }
            }
        }
        Err(err) => worker.err = Some(WorkerError::new(err.into(), None)),
    }
    worker.duration = started.elapsed();
    let _ = ctx.result_tx.send(worker).await;
}

/// Issue one wire request against the first eligible peer, validate the
/// response, and route every returned block.
async fn do_sync(ctx: &WorkerContext, request: BlockRequestMessage) -> Result<(), WorkerError> {
    let peers = determine_sync_peers(&ctx.peer_state, &request);
    let Some(&who) = peers.first() else {
        return Err(WorkerError::new(SyncError::NoPeers.into(), None));
    };

    let mut response = match ctx.network.do_block_request(who, request.clone()).await {
        Ok(response) => response,
        Err(err) => return Err(WorkerError::new(err, Some(who))),
    };

    if let Err(err) = validate_response(&request, &mut response, &ctx.pending) {
        ctx.network.report_peer(who, reputation::BAD_BLOCK_RESPONSE);
        return Err(WorkerError::new(err.into(), Some(who)));
    }

    for block_data in response.block_data {
        if let Err(err) =
            handle_ready_block(ctx.block_state.as_ref(), &ctx.pending, &ctx.ready, block_data).await
        {
            return Err(WorkerError::new(err, None));
        }
    }
    Ok(())
}

/// Peers that can plausibly serve the request: best number at or above the
/// requested start. Ordered best-first, ties broken by peer id, so selection
/// is stable within a call.
fn determine_sync_peers(
    peer_state: &RwLock<HashMap<PeerId, PeerState>>,
    request: &BlockRequestMessage,
) -> Vec<PeerId> {
    let start_number = match request.starting_block {
        BlockHashOrNumber::Number(number) => Some(number),
        BlockHashOrNumber::Hash(_) => None,
    };
    let peers = peer_state.read();
    let mut candidates: Vec<(u64, PeerId)> = peers
        .values()
        .filter(|peer| start_number.is_none_or(|number| peer.best_number >= number))
        .map(|peer| (peer.best_number, peer.who))
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    candidates.into_iter().map(|(_, who)| who).collect()
}

/// Route one block: into the ready queue if its parent is known (locally
/// stored or emitted earlier), into the pending set otherwise. Readying a
/// block transitively drains its completed descendants from the pending set.
pub(crate) async fn handle_ready_block(
    block_state: &dyn BlockState,
    pending: &DisjointBlockSet,
    ready: &ReadyQueue,
    block_data: BlockData,
) -> Result<()> {
    let (header, block_data) = match block_data.header.clone() {
        Some(header) => (header, block_data),
        None => {
            // headerless payload (body-only request): merge with the pending
            // entry it belongs to, if any
            let Some(known) = pending.get_block(block_data.hash) else {
                return Ok(());
            };
            let Some(header) = known.header else {
                return Ok(());
            };
            let merged = BlockData {
                hash: block_data.hash,
                header: Some(header.clone()),
                body: block_data.body.or(known.body),
                justification: block_data.justification,
            };
            (header, merged)
        }
    };

    let parent = header.parent_hash;
    let parent_known = block_state.has_header(parent)? || ready.contains(parent);
    if !parent_known {
        match block_data.body {
            Some(body) => pending.add_block(Block { header, body }),
            None => pending.add_header(header),
        }
        return Ok(());
    }

    if block_state.has_header(block_data.hash)? || ready.contains(block_data.hash) {
        // already imported or emitted, e.g. by an overlapping retry
        pending.remove_block(block_data.hash);
        return Ok(());
    }

    let hash = block_data.hash;
    ready.push(block_data).await?;
    pending.remove_block(hash);
    drain_descendants(pending, ready, hash).await
}

/// Breadth-first drain of completed pending blocks below a newly-known
/// ancestor, in parent-first order.
async fn drain_descendants(
    pending: &DisjointBlockSet,
    ready: &ReadyQueue,
    ancestor: B256,
) -> Result<()> {
    let mut frontier = VecDeque::from([ancestor]);
    while let Some(parent) = frontier.pop_front() {
        for block in pending.blocks() {
            let Some(header) = block.header.clone() else {
                continue;
            };
            if header.parent_hash != parent || !block.is_complete() {
                continue;
            }
            if !ready.contains(block.hash) {
                ready
                    .push(BlockData {
                        hash: block.hash,
                        header: Some(header),
                        body: block.body.clone(),
                        justification: None,
                    })
                    .await?;
            }
            pending.remove_block(block.hash);
            frontier.push_back(block.hash);
        }
    }
    Ok(())
}

/// Move every completed pending block whose parent is known into the ready
/// queue, along with its completed descendants.
pub(crate) async fn drain_completed(
    block_state: &dyn BlockState,
    pending: &DisjointBlockSet,
    ready: &ReadyQueue,
) -> Result<()> {
    for block in pending.blocks() {
        let Some(header) = block.header.clone() else {
            continue;
        };
        if !block.is_complete() {
            continue;
        }
        let parent_known =
            block_state.has_header(header.parent_hash)? || ready.contains(header.parent_hash);
        if !parent_known {
            continue;
        }
        if !ready.contains(block.hash) && !block_state.has_header(block.hash)? {
            ready
                .push(BlockData {
                    hash: block.hash,
                    header: Some(header),
                    body: block.body.clone(),
                    justification: None,
                })
                .await?;
        }
        pending.remove_block(block.hash);
        drain_descendants(pending, ready, block.hash).await?;
    }
    Ok(())
}
