//! Disjoint set of partially-known blocks.

use crate::chain::{Block, Body, Header};
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A block we know of but cannot process yet. At minimum the hash and number
/// are known; the header and body fill in as responses arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlock {
    pub hash: B256,
    pub number: u64,
    pub header: Option<Header>,
    pub body: Option<Body>,
}

impl PendingBlock {
    /// Whether both header and body are known.
    pub fn is_complete(&self) -> bool {
        self.header.is_some() && self.body.is_some()
    }
}

/// Pool of pending blocks keyed by hash. Entries are created by
/// announcements, fork heads, and responses whose parent is unknown, and
/// leave the set once routed to the ready queue or finalized past.
#[derive(Debug, Default)]
pub struct DisjointBlockSet {
    blocks: RwLock<HashMap<B256, PendingBlock>>,
}

impl DisjointBlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a block with this hash and number exists. Never clobbers
    /// richer fields of an existing entry.
    pub fn add_hash_and_number(&self, hash: B256, number: u64) {
        let mut blocks = self.blocks.write();
        blocks.entry(hash).or_insert(PendingBlock {
            hash,
            number,
            header: None,
            body: None,
        });
    }

    /// Record a block's header, deriving hash and number from it.
    pub fn add_header(&self, header: Header) {
        let mut blocks = self.blocks.write();
        let hash = header.hash();
        let entry = blocks.entry(hash).or_insert(PendingBlock {
            hash,
            number: header.number,
            header: None,
            body: None,
        });
        entry.number = header.number;
        entry.header = Some(header);
    }

    /// Record a complete block.
    pub fn add_block(&self, block: Block) {
        let mut blocks = self.blocks.write();
        let hash = block.header.hash();
        let entry = blocks.entry(hash).or_insert(PendingBlock {
            hash,
            number: block.header.number,
            header: None,
            body: None,
        });
        entry.number = block.header.number;
        entry.header = Some(block.header);
        entry.body = Some(block.body);
    }

    pub fn remove_block(&self, hash: B256) {
        let mut blocks = self.blocks.write();
        blocks.remove(&hash);
    }

    /// Drop every entry at or below `number`. Called when finality advances.
    pub fn remove_lower_blocks(&self, number: u64) {
        let mut blocks = self.blocks.write();
        blocks.retain(|_, block| block.number > number);
    }

    pub fn has_block(&self, hash: B256) -> bool {
        let blocks = self.blocks.read();
        blocks.contains_key(&hash)
    }

    pub fn get_block(&self, hash: B256) -> Option<PendingBlock> {
        let blocks = self.blocks.read();
        blocks.get(&hash).cloned()
    }

    pub fn len(&self) -> usize {
        let blocks = self.blocks.read();
        blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, ordered by block number.
    pub fn blocks(&self) -> Vec<PendingBlock> {
        let blocks = self.blocks.read();
        let mut snapshot: Vec<PendingBlock> = blocks.values().cloned().collect();
        snapshot.sort_by_key(|block| block.number);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    fn header(number: u64, parent_hash: B256) -> Header {
        Header {
            parent_hash,
            number,
            state_root: B256::ZERO,
            extrinsics_root: B256::ZERO,
            digest: Bytes::new(),
        }
    }

    #[test]
    fn add_hash_and_number_is_idempotent() {
        let set = DisjointBlockSet::new();
        let hash = B256::repeat_byte(0x01);
        set.add_hash_and_number(hash, 7);
        set.add_hash_and_number(hash, 7);
        assert_eq!(set.len(), 1);
        let block = set.get_block(hash).expect("entry");
        assert_eq!(block.number, 7);
        assert!(block.header.is_none());
    }

    #[test]
    fn add_hash_and_number_keeps_richer_fields() {
        let set = DisjointBlockSet::new();
        let header = header(3, B256::repeat_byte(0x02));
        let hash = header.hash();
        set.add_header(header.clone());
        set.add_hash_and_number(hash, 3);
        let block = set.get_block(hash).expect("entry");
        assert_eq!(block.header, Some(header));
    }

    #[test]
    fn add_block_completes_existing_entry() {
        let set = DisjointBlockSet::new();
        let header = header(9, B256::repeat_byte(0x03));
        let hash = header.hash();
        set.add_hash_and_number(hash, 9);
        assert!(!set.get_block(hash).unwrap().is_complete());

        set.add_block(Block {
            header,
            body: Body {
                extrinsics: vec![Bytes::from(vec![0xaa])],
            },
        });
        let block = set.get_block(hash).expect("entry");
        assert!(block.is_complete());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_lower_blocks_prunes_finalized_range() {
        let set = DisjointBlockSet::new();
        for number in 1..=5u64 {
            set.add_hash_and_number(B256::repeat_byte(number as u8), number);
        }
        set.remove_lower_blocks(3);
        assert_eq!(set.len(), 2);
        assert!(!set.has_block(B256::repeat_byte(3)));
        assert!(set.has_block(B256::repeat_byte(4)));
    }

    #[test]
    fn snapshot_is_ordered_by_number() {
        let set = DisjointBlockSet::new();
        set.add_hash_and_number(B256::repeat_byte(0x0a), 12);
        set.add_hash_and_number(B256::repeat_byte(0x0b), 4);
        set.add_hash_and_number(B256::repeat_byte(0x0c), 8);
        let numbers: Vec<u64> = set.blocks().iter().map(|block| block.number).collect();
        assert_eq!(numbers, vec![4, 8, 12]);
    }
}
