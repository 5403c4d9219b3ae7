//! Block primitives and chain state tracking.

use alloy_primitives::{Bytes, B256};
use eyre::Result;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

/// Block header. `digest` carries opaque consensus data.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    pub parent_hash: B256,
    pub number: u64,
    pub state_root: B256,
    pub extrinsics_root: B256,
    pub digest: Bytes,
}

impl Header {
    /// Hash of the header's canonical byte encoding.
    pub fn hash(&self) -> B256 {
        let mut hasher = Sha256::new();
        hasher.update(b"blocksync-header-v1\n");
        hasher.update(self.parent_hash);
        hasher.update(self.number.to_le_bytes());
        hasher.update(self.state_root);
        hasher.update(self.extrinsics_root);
        hasher.update((self.digest.len() as u64).to_le_bytes());
        hasher.update(&self.digest);
        B256::from_slice(&hasher.finalize())
    }
}

/// Block body: the list of opaque extrinsics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Body {
    pub extrinsics: Vec<Bytes>,
}

/// A complete block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

/// Per-block payload of a sync response. Fields other than `hash` are present
/// only when the requester asked for them and the server had them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockData {
    pub hash: B256,
    pub header: Option<Header>,
    pub body: Option<Body>,
    pub justification: Option<Bytes>,
}

/// Errors for block import into chain state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    UnknownParent(B256),
    NonContiguousNumber { expected: u64, got: u64 },
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownParent(hash) => write!(f, "unknown parent {hash}"),
            Self::NonContiguousNumber { expected, got } => {
                write!(f, "non-contiguous block number: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for ChainError {}

/// Read access to the locally stored chain, shared across sync tasks.
pub trait BlockState: Send + Sync {
    /// Header of the current best (highest) block.
    fn best_block_header(&self) -> Result<Header>;

    /// Whether a header with the given hash is stored locally.
    fn has_header(&self, hash: B256) -> Result<bool>;

    /// Canonical hash at the given number, if the chain reaches it.
    fn get_hash_by_number(&self, number: u64) -> Result<Option<B256>>;

    /// Header of the highest finalized block.
    fn highest_finalized_header(&self) -> Result<Header>;

    /// Register a channel that receives every newly finalized header.
    /// Returns a subscription id.
    fn register_finalized_channel(&self, tx: mpsc::UnboundedSender<Header>) -> u64;
}

#[derive(Debug, Default)]
struct MemoryBlockStateInner {
    headers: HashMap<B256, Header>,
    bodies: HashMap<B256, Body>,
    canonical: BTreeMap<u64, B256>,
    best: Option<Header>,
    finalized: Option<Header>,
    finalized_subs: Vec<mpsc::UnboundedSender<Header>>,
}

/// In-memory chain state with canonical tracking and finality notifications.
#[derive(Debug, Default)]
pub struct MemoryBlockState {
    inner: RwLock<MemoryBlockStateInner>,
}

impl MemoryBlockState {
    /// Create a state seeded with the given genesis header. Genesis starts
    /// out both best and finalized.
    pub fn new(genesis: Header) -> Self {
        let state = Self::default();
        {
            let mut inner = state.inner.write();
            let hash = genesis.hash();
            inner.headers.insert(hash, genesis.clone());
            inner.canonical.insert(genesis.number, hash);
            inner.best = Some(genesis.clone());
            inner.finalized = Some(genesis);
        }
        state
    }

    /// Import a block on top of the current best. The sync engine only hands
    /// over blocks in parent-first order, so anything else is rejected.
    pub fn import_block(&self, block: Block) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        let header = block.header;
        let hash = header.hash();
        match inner.best.clone() {
            Some(best) if header.parent_hash == best.hash() => {
                let expected = best.number + 1;
                if header.number != expected {
                    return Err(ChainError::NonContiguousNumber {
                        expected,
                        got: header.number,
                    });
                }
            }
            Some(_) => return Err(ChainError::UnknownParent(header.parent_hash)),
            None => {}
        }
        inner.canonical.insert(header.number, hash);
        inner.headers.insert(hash, header.clone());
        inner.bodies.insert(hash, block.body);
        inner.best = Some(header);
        Ok(())
    }

    /// Mark the canonical block at `number` as finalized and notify
    /// subscribers of the new highest finalized header.
    pub fn finalize_up_to(&self, number: u64) {
        let mut inner = self.inner.write();
        let already = inner.finalized.as_ref().map(|h| h.number).unwrap_or(0);
        if number <= already {
            return;
        }
        let Some(hash) = inner.canonical.get(&number).copied() else {
            return;
        };
        let Some(header) = inner.headers.get(&hash).cloned() else {
            return;
        };
        inner.finalized = Some(header.clone());
        inner
            .finalized_subs
            .retain(|tx| tx.send(header.clone()).is_ok());
    }
}

impl BlockState for MemoryBlockState {
    fn best_block_header(&self) -> Result<Header> {
        let inner = self.inner.read();
        inner
            .best
            .clone()
            .ok_or_else(|| eyre::eyre!("chain state has no blocks"))
    }

    fn has_header(&self, hash: B256) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner.headers.contains_key(&hash))
    }

    fn get_hash_by_number(&self, number: u64) -> Result<Option<B256>> {
        let inner = self.inner.read();
        Ok(inner.canonical.get(&number).copied())
    }

    fn highest_finalized_header(&self) -> Result<Header> {
        let inner = self.inner.read();
        inner
            .finalized
            .clone()
            .ok_or_else(|| eyre::eyre!("chain state has no finalized block"))
    }

    fn register_finalized_channel(&self, tx: mpsc::UnboundedSender<Header>) -> u64 {
        let mut inner = self.inner.write();
        inner.finalized_subs.push(tx);
        inner.finalized_subs.len() as u64 - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis_header() -> Header {
        Header {
            parent_hash: B256::ZERO,
            number: 0,
            state_root: B256::ZERO,
            extrinsics_root: B256::ZERO,
            digest: Bytes::new(),
        }
    }

    fn child_of(parent: &Header) -> Header {
        Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            state_root: B256::ZERO,
            extrinsics_root: B256::ZERO,
            digest: Bytes::new(),
        }
    }

    #[test]
    fn header_hash_commits_to_fields() {
        let a = genesis_header();
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.number = 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn import_extends_canonical() {
        let genesis = genesis_header();
        let state = MemoryBlockState::new(genesis.clone());
        let one = child_of(&genesis);
        let two = child_of(&one);

        state
            .import_block(Block {
                header: one.clone(),
                body: Body::default(),
            })
            .expect("import one");
        state
            .import_block(Block {
                header: two.clone(),
                body: Body::default(),
            })
            .expect("import two");

        assert_eq!(state.best_block_header().unwrap(), two);
        assert_eq!(state.get_hash_by_number(1).unwrap(), Some(one.hash()));
        assert!(state.has_header(two.hash()).unwrap());
        assert!(!state.has_header(B256::repeat_byte(0xab)).unwrap());
    }

    #[test]
    fn import_rejects_unknown_parent() {
        let genesis = genesis_header();
        let state = MemoryBlockState::new(genesis);
        let orphan = Header {
            parent_hash: B256::repeat_byte(0x11),
            number: 5,
            state_root: B256::ZERO,
            extrinsics_root: B256::ZERO,
            digest: Bytes::new(),
        };
        assert_eq!(
            state.import_block(Block {
                header: orphan,
                body: Body::default(),
            }),
            Err(ChainError::UnknownParent(B256::repeat_byte(0x11)))
        );
    }

    #[test]
    fn finalize_notifies_subscribers() {
        let genesis = genesis_header();
        let state = MemoryBlockState::new(genesis.clone());
        let one = child_of(&genesis);
        state
            .import_block(Block {
                header: one.clone(),
                body: Body::default(),
            })
            .expect("import");

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register_finalized_channel(tx);
        state.finalize_up_to(1);

        let notified = rx.try_recv().expect("finality notification");
        assert_eq!(notified, one);
        assert_eq!(state.highest_finalized_header().unwrap(), one);

        // finalizing backwards is a no-op
        state.finalize_up_to(0);
        assert!(rx.try_recv().is_err());
    }
}
