//! Pre-validation of block responses.

use crate::chain::Block;
use crate::p2p::{
    BlockRequestMessage, BlockResponseMessage, Direction, REQUESTED_DATA_BODY,
    REQUESTED_DATA_HEADER,
};
use crate::sync::pending::DisjointBlockSet;

/// Protocol violations detected in a response before routing its blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    EmptyBlockData,
    NilHeaderInResponse,
    NilBodyInResponse,
    ResponseIsNotChain,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyBlockData => write!(f, "response contains no block data"),
            Self::NilHeaderInResponse => write!(f, "expected header in response, got none"),
            Self::NilBodyInResponse => write!(f, "expected body in response, got none"),
            Self::ResponseIsNotChain => write!(f, "response blocks do not form a chain"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check that a single response entry carries every field the request asked
/// for. Justifications are exempt: most blocks legitimately have none.
pub fn validate_block_data(
    request: &BlockRequestMessage,
    block_data: &crate::chain::BlockData,
) -> Result<(), ValidationError> {
    if request.requested_data & REQUESTED_DATA_HEADER != 0 && block_data.header.is_none() {
        return Err(ValidationError::NilHeaderInResponse);
    }
    if request.requested_data & REQUESTED_DATA_BODY != 0 && block_data.body.is_none() {
        return Err(ValidationError::NilBodyInResponse);
    }
    Ok(())
}

/// Validate a response against its request: non-empty, all requested fields
/// present, and the blocks form a chain in the requested direction. On a
/// broken link the salvageable tail is parked in the pending set. Descending
/// responses are reversed in place so downstream routing always sees
/// parent-first order.
pub fn validate_response(
    request: &BlockRequestMessage,
    response: &mut BlockResponseMessage,
    pending: &DisjointBlockSet,
) -> Result<(), ValidationError> {
    if response.block_data.is_empty() {
        return Err(ValidationError::EmptyBlockData);
    }

    for block_data in &response.block_data {
        validate_block_data(request, block_data)?;
    }

    if request.requested_data & REQUESTED_DATA_HEADER != 0 {
        let mut prev = response.block_data[0]
            .header
            .as_ref()
            .map(|header| (header.number, header.hash(), header.parent_hash));
        for (i, block_data) in response.block_data.iter().enumerate().skip(1) {
            let Some(header) = block_data.header.as_ref() else {
                continue;
            };
            let Some((prev_number, prev_hash, prev_parent)) = prev else {
                prev = Some((header.number, header.hash(), header.parent_hash));
                continue;
            };
            let linked = match request.direction {
                Direction::Ascending => {
                    header.number == prev_number + 1 && header.parent_hash == prev_hash
                }
                Direction::Descending => {
                    prev_number == header.number + 1 && prev_parent == header.hash()
                }
            };
            if !linked {
                park_tail(pending, &response.block_data[i..]);
                return Err(ValidationError::ResponseIsNotChain);
            }
            prev = Some((header.number, header.hash(), header.parent_hash));
        }
    }

    if request.direction == Direction::Descending {
        response.block_data.reverse();
    }

    Ok(())
}

/// Park whatever we can identify from a broken response in the pending set.
fn park_tail(pending: &DisjointBlockSet, tail: &[crate::chain::BlockData]) {
    for block_data in tail {
        match (block_data.header.clone(), block_data.body.clone()) {
            (Some(header), Some(body)) => pending.add_block(Block { header, body }),
            (Some(header), None) => pending.add_header(header),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockData;
    use crate::p2p::{BlockHashOrNumber, REQUESTED_DATA_JUSTIFICATION};
    use crate::sim::generate_chain;

    const BOOTSTRAP_DATA: u8 =
        REQUESTED_DATA_HEADER | REQUESTED_DATA_BODY | REQUESTED_DATA_JUSTIFICATION;

    fn request(direction: Direction, requested_data: u8) -> BlockRequestMessage {
        BlockRequestMessage {
            requested_data,
            starting_block: BlockHashOrNumber::Number(1),
            end_block_hash: None,
            direction,
            max: None,
        }
    }

    fn full_data(block: &crate::chain::Block) -> BlockData {
        BlockData {
            hash: block.header.hash(),
            header: Some(block.header.clone()),
            body: Some(block.body.clone()),
            justification: None,
        }
    }

    #[test]
    fn empty_response_is_rejected() {
        let pending = DisjointBlockSet::new();
        let mut response = BlockResponseMessage { block_data: vec![] };
        assert_eq!(
            validate_response(&request(Direction::Ascending, BOOTSTRAP_DATA), &mut response, &pending),
            Err(ValidationError::EmptyBlockData)
        );
    }

    #[test]
    fn missing_requested_fields_are_rejected() {
        let chain = generate_chain(3);
        let pending = DisjointBlockSet::new();

        let mut headerless = full_data(&chain[1]);
        headerless.header = None;
        let mut response = BlockResponseMessage {
            block_data: vec![headerless],
        };
        assert_eq!(
            validate_response(&request(Direction::Ascending, BOOTSTRAP_DATA), &mut response, &pending),
            Err(ValidationError::NilHeaderInResponse)
        );

        let mut bodyless = full_data(&chain[1]);
        bodyless.body = None;
        let mut response = BlockResponseMessage {
            block_data: vec![bodyless],
        };
        assert_eq!(
            validate_response(&request(Direction::Ascending, BOOTSTRAP_DATA), &mut response, &pending),
            Err(ValidationError::NilBodyInResponse)
        );
    }

    #[test]
    fn missing_justification_is_allowed() {
        let chain = generate_chain(2);
        let pending = DisjointBlockSet::new();
        let mut response = BlockResponseMessage {
            block_data: vec![full_data(&chain[1]), full_data(&chain[2])],
        };
        validate_response(
            &request(Direction::Ascending, BOOTSTRAP_DATA),
            &mut response,
            &pending,
        )
        .expect("justifications are optional");
    }

    #[test]
    fn ascending_chain_passes() {
        let chain = generate_chain(4);
        let pending = DisjointBlockSet::new();
        let mut response = BlockResponseMessage {
            block_data: chain[1..].iter().map(full_data).collect(),
        };
        validate_response(
            &request(Direction::Ascending, BOOTSTRAP_DATA),
            &mut response,
            &pending,
        )
        .expect("valid chain");
        let numbers: Vec<u64> = response
            .block_data
            .iter()
            .map(|bd| bd.header.as_ref().unwrap().number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn broken_link_parks_tail_in_pending() {
        let chain = generate_chain(5);
        let pending = DisjointBlockSet::new();
        // skip block 3: 1, 2, 4, 5
        let mut response = BlockResponseMessage {
            block_data: vec![
                full_data(&chain[1]),
                full_data(&chain[2]),
                full_data(&chain[4]),
                full_data(&chain[5]),
            ],
        };
        assert_eq!(
            validate_response(&request(Direction::Ascending, BOOTSTRAP_DATA), &mut response, &pending),
            Err(ValidationError::ResponseIsNotChain)
        );
        assert!(pending.has_block(chain[4].header.hash()));
        assert!(pending.has_block(chain[5].header.hash()));
        assert!(!pending.has_block(chain[2].header.hash()));
    }

    #[test]
    fn descending_chain_is_reversed_to_parent_first() {
        let chain = generate_chain(3);
        let pending = DisjointBlockSet::new();
        let mut response = BlockResponseMessage {
            block_data: vec![full_data(&chain[3]), full_data(&chain[2])],
        };
        validate_response(
            &request(Direction::Descending, BOOTSTRAP_DATA),
            &mut response,
            &pending,
        )
        .expect("valid descending chain");
        let numbers: Vec<u64> = response
            .block_data
            .iter()
            .map(|bd| bd.header.as_ref().unwrap().number)
            .collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn descending_broken_link_is_rejected() {
        let chain = generate_chain(4);
        let pending = DisjointBlockSet::new();
        // 4 then 2: not parent-linked
        let mut response = BlockResponseMessage {
            block_data: vec![full_data(&chain[4]), full_data(&chain[2])],
        };
        assert_eq!(
            validate_response(&request(Direction::Descending, BOOTSTRAP_DATA), &mut response, &pending),
            Err(ValidationError::ResponseIsNotChain)
        );
    }
}
