//! Sync wire protocol and network abstraction.

use crate::chain::{BlockData, Header};
use alloy_primitives::{B256, B512};
use async_trait::async_trait;
use eyre::Result;

/// Identifier for a remote peer (its session public key).
pub type PeerId = B512;

/// Maximum number of blocks a single wire response may carry. Requests
/// without an explicit `max` are capped to this by the serving side.
pub const MAX_RESPONSE_SIZE: u32 = 128;

/// Bits of [`BlockRequestMessage::requested_data`].
pub const REQUESTED_DATA_HEADER: u8 = 1;
pub const REQUESTED_DATA_BODY: u8 = 2;
pub const REQUESTED_DATA_JUSTIFICATION: u8 = 4;

/// Order in which a ranged request walks the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Direction {
    Ascending = 0,
    Descending = 1,
}

/// Start of a ranged request, addressed by number or by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockHashOrNumber {
    Hash(B256),
    Number(u64),
}

/// Request for a range of blocks starting at `starting_block` and walking in
/// `direction`. `end_block_hash` bounds the range when the target hash is
/// known; `max` caps the response size below the server's own cap.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockRequestMessage {
    pub requested_data: u8,
    pub starting_block: BlockHashOrNumber,
    pub end_block_hash: Option<B256>,
    pub direction: Direction,
    pub max: Option<u32>,
}

/// Response to a [`BlockRequestMessage`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockResponseMessage {
    pub block_data: Vec<BlockData>,
}

/// Announcement of a new block, gossiped to the peer set.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockAnnounceMessage {
    pub header: Header,
    pub best_block: bool,
}

/// A reputation adjustment applied to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationChange {
    pub value: i32,
    pub reason: &'static str,
}

pub mod reputation {
    use super::ReputationChange;

    /// Peer sent a response that failed pre-validation.
    pub const BAD_BLOCK_RESPONSE: ReputationChange = ReputationChange {
        value: -(1 << 16),
        reason: "bad block response",
    };

    /// Peer advertised a head inconsistent with finalized history.
    pub const INVALID_FORK: ReputationChange = ReputationChange {
        value: -(1 << 18),
        reason: "peer on invalid fork",
    };
}

/// Handle to the peer-to-peer layer used by the sync engine.
#[async_trait]
pub trait Network: Send + Sync {
    /// Send a block request to `who` and wait for its response. Transport
    /// timeouts surface as errors.
    async fn do_block_request(
        &self,
        who: PeerId,
        request: BlockRequestMessage,
    ) -> Result<BlockResponseMessage>;

    /// Apply a reputation change to a peer.
    fn report_peer(&self, who: PeerId, change: ReputationChange);

    /// Gossip a block announcement to the peer set.
    fn gossip_message(&self, message: BlockAnnounceMessage);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_data_bits_compose() {
        let bootstrap =
            REQUESTED_DATA_HEADER | REQUESTED_DATA_BODY | REQUESTED_DATA_JUSTIFICATION;
        assert_eq!(bootstrap, 0b111);
        assert_eq!(bootstrap & REQUESTED_DATA_BODY, REQUESTED_DATA_BODY);
        assert_eq!(REQUESTED_DATA_HEADER & REQUESTED_DATA_JUSTIFICATION, 0);
    }
}
