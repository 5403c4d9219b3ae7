//! In-process simulated peer network for driving the sync engine end to end.

use crate::chain::{Block, BlockData, Body, Header};
use crate::p2p::{
    BlockAnnounceMessage, BlockHashOrNumber, BlockRequestMessage, BlockResponseMessage, Direction,
    Network, PeerId, ReputationChange, MAX_RESPONSE_SIZE, REQUESTED_DATA_BODY,
    REQUESTED_DATA_HEADER, REQUESTED_DATA_JUSTIFICATION,
};
use alloy_primitives::{Bytes, B256, B512};
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Blocks carrying a synthesized finality proof, one per this many blocks.
const JUSTIFICATION_INTERVAL: u64 = 32;

/// Deterministic canonical chain: genesis plus `len` descendants.
pub fn generate_chain(len: u64) -> Vec<Block> {
    let genesis = Header {
        parent_hash: B256::ZERO,
        number: 0,
        state_root: B256::ZERO,
        extrinsics_root: B256::ZERO,
        digest: Bytes::new(),
    };
    let mut chain = Vec::with_capacity(len as usize + 1);
    chain.push(Block {
        header: genesis,
        body: Body::default(),
    });
    for number in 1..=len {
        let parent = &chain[number as usize - 1];
        let body = Body {
            extrinsics: vec![Bytes::from(number.to_le_bytes().to_vec())],
        };
        let header = Header {
            parent_hash: parent.header.hash(),
            number,
            state_root: B256::with_last_byte((number % 251) as u8),
            extrinsics_root: B256::with_last_byte((number % 241) as u8),
            digest: Bytes::new(),
        };
        chain.push(Block { header, body });
    }
    chain
}

/// The view a simulated peer advertises.
#[derive(Debug, Clone, Copy)]
pub struct SimPeer {
    pub id: PeerId,
    pub best_number: u64,
}

/// A [`Network`] serving ranged requests from a fixed canonical chain on
/// behalf of a configurable set of peers. Reputation reports and gossiped
/// announcements are recorded for inspection.
pub struct SimNetwork {
    chain: Vec<Block>,
    by_hash: HashMap<B256, u64>,
    peers: Vec<SimPeer>,
    reports: RwLock<Vec<(PeerId, ReputationChange)>>,
    announces: RwLock<Vec<BlockAnnounceMessage>>,
}

impl SimNetwork {
    /// All peers serve and advertise the full chain.
    pub fn new(chain: Vec<Block>, peer_count: usize) -> Self {
        let best = chain.len() as u64 - 1;
        Self::with_peer_heads(chain, vec![best; peer_count])
    }

    /// Peers advertise the given best numbers (each clamped to the chain).
    pub fn with_peer_heads(chain: Vec<Block>, heads: Vec<u64>) -> Self {
        let top = chain.len() as u64 - 1;
        let by_hash = chain
            .iter()
            .map(|block| (block.header.hash(), block.header.number))
            .collect();
        let peers = heads
            .into_iter()
            .enumerate()
            .map(|(i, best_number)| SimPeer {
                id: B512::repeat_byte(i as u8 + 1),
                best_number: best_number.min(top),
            })
            .collect();
        Self {
            chain,
            by_hash,
            peers,
            reports: RwLock::new(Vec::new()),
            announces: RwLock::new(Vec::new()),
        }
    }

    /// Peer heads to announce to the sync engine at startup.
    pub fn peer_heads(&self) -> Vec<(PeerId, B256, u64)> {
        self.peers
            .iter()
            .map(|peer| {
                let hash = self.chain[peer.best_number as usize].header.hash();
                (peer.id, hash, peer.best_number)
            })
            .collect()
    }

    pub fn target_number(&self) -> u64 {
        self.chain.len() as u64 - 1
    }

    pub fn reports(&self) -> Vec<(PeerId, ReputationChange)> {
        self.reports.read().clone()
    }

    pub fn announces(&self) -> Vec<BlockAnnounceMessage> {
        self.announces.read().clone()
    }

    fn block_data(&self, number: u64, requested_data: u8) -> BlockData {
        let block = &self.chain[number as usize];
        let justification = (requested_data & REQUESTED_DATA_JUSTIFICATION != 0
            && number > 0
            && number % JUSTIFICATION_INTERVAL == 0)
            .then(|| Bytes::from(number.to_be_bytes().to_vec()));
        BlockData {
            hash: block.header.hash(),
            header: (requested_data & REQUESTED_DATA_HEADER != 0).then(|| block.header.clone()),
            body: (requested_data & REQUESTED_DATA_BODY != 0).then(|| block.body.clone()),
            justification,
        }
    }
}

#[async_trait]
impl Network for SimNetwork {
    async fn do_block_request(
        &self,
        who: PeerId,
        request: BlockRequestMessage,
    ) -> Result<BlockResponseMessage> {
        if !self.peers.iter().any(|peer| peer.id == who) {
            return Err(eyre!("unknown peer {who}"));
        }
        let start = match request.starting_block {
            BlockHashOrNumber::Number(number) => number,
            BlockHashOrNumber::Hash(hash) => *self
                .by_hash
                .get(&hash)
                .ok_or_else(|| eyre!("unknown starting block {hash}"))?,
        };
        if start as usize >= self.chain.len() {
            return Err(eyre!("starting block {start} is past our head"));
        }

        let cap = request
            .max
            .unwrap_or(MAX_RESPONSE_SIZE)
            .min(MAX_RESPONSE_SIZE) as u64;
        let mut block_data = Vec::new();
        let mut number = start;
        loop {
            block_data.push(self.block_data(number, request.requested_data));
            if block_data.len() as u64 == cap {
                break;
            }
            if request
                .end_block_hash
                .is_some_and(|end| self.chain[number as usize].header.hash() == end)
            {
                break;
            }
            number = match request.direction {
                Direction::Ascending => number + 1,
                Direction::Descending => match number.checked_sub(1) {
                    Some(number) => number,
                    None => break,
                },
            };
            if number as usize >= self.chain.len() {
                break;
            }
        }
        Ok(BlockResponseMessage { block_data })
    }

    fn report_peer(&self, who: PeerId, change: ReputationChange) {
        tracing::debug!(peer = %who, value = change.value, reason = change.reason, "peer reported");
        self.reports.write().push((who, change));
    }

    fn gossip_message(&self, message: BlockAnnounceMessage) {
        self.announces.write().push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_chain_is_parent_linked() {
        let chain = generate_chain(10);
        assert_eq!(chain.len(), 11);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].header.parent_hash, pair[0].header.hash());
            assert_eq!(pair[1].header.number, pair[0].header.number + 1);
        }
    }

    #[tokio::test]
    async fn serves_ascending_ranges_up_to_cap() {
        let network = SimNetwork::new(generate_chain(300), 1);
        let peer = network.peer_heads()[0].0;
        let response = network
            .do_block_request(
                peer,
                BlockRequestMessage {
                    requested_data: REQUESTED_DATA_HEADER | REQUESTED_DATA_BODY,
                    starting_block: BlockHashOrNumber::Number(1),
                    end_block_hash: None,
                    direction: Direction::Ascending,
                    max: None,
                },
            )
            .await
            .expect("response");
        assert_eq!(response.block_data.len(), 128);
        assert_eq!(response.block_data[0].header.as_ref().unwrap().number, 1);
        assert_eq!(response.block_data[127].header.as_ref().unwrap().number, 128);
    }

    #[tokio::test]
    async fn honors_explicit_max_and_end_hash() {
        let chain = generate_chain(50);
        let end_hash = chain[10].header.hash();
        let network = SimNetwork::new(chain, 1);
        let peer = network.peer_heads()[0].0;
        let response = network
            .do_block_request(
                peer,
                BlockRequestMessage {
                    requested_data: REQUESTED_DATA_HEADER,
                    starting_block: BlockHashOrNumber::Number(5),
                    end_block_hash: Some(end_hash),
                    direction: Direction::Ascending,
                    max: Some(20),
                },
            )
            .await
            .expect("response");
        let numbers: Vec<u64> = response
            .block_data
            .iter()
            .map(|bd| bd.header.as_ref().unwrap().number)
            .collect();
        assert_eq!(numbers, (5..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn serves_descending_ranges_by_hash() {
        let chain = generate_chain(20);
        let start_hash = chain[15].header.hash();
        let network = SimNetwork::new(chain, 1);
        let peer = network.peer_heads()[0].0;
        let response = network
            .do_block_request(
                peer,
                BlockRequestMessage {
                    requested_data: REQUESTED_DATA_HEADER,
                    starting_block: BlockHashOrNumber::Hash(start_hash),
                    end_block_hash: None,
                    direction: Direction::Descending,
                    max: Some(4),
                },
            )
            .await
            .expect("response");
        let numbers: Vec<u64> = response
            .block_data
            .iter()
            .map(|bd| bd.header.as_ref().unwrap().number)
            .collect();
        assert_eq!(numbers, vec![15, 14, 13, 12]);
    }

    #[test]
    fn records_reports_and_announcements() {
        let chain = generate_chain(3);
        let announce = BlockAnnounceMessage {
            header: chain[3].header.clone(),
            best_block: true,
        };
        let network = SimNetwork::new(chain, 2);
        let peer = network.peer_heads()[0].0;

        network.report_peer(peer, crate::p2p::reputation::BAD_BLOCK_RESPONSE);
        network.gossip_message(announce.clone());

        assert_eq!(network.reports(), vec![(peer, crate::p2p::reputation::BAD_BLOCK_RESPONSE)]);
        assert_eq!(network.announces(), vec![announce]);
    }

    #[tokio::test]
    async fn rejects_requests_past_the_head() {
        let network = SimNetwork::new(generate_chain(5), 1);
        let peer = network.peer_heads()[0].0;
        let err = network
            .do_block_request(
                peer,
                BlockRequestMessage {
                    requested_data: REQUESTED_DATA_HEADER,
                    starting_block: BlockHashOrNumber::Number(6),
                    end_block_hash: None,
                    direction: Direction::Ascending,
                    max: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("past our head"));
    }
}
