//! Expansion of workers into wire requests.

use crate::p2p::{BlockHashOrNumber, BlockRequestMessage, Direction, MAX_RESPONSE_SIZE};
use crate::sync::worker::Worker;

/// Errors for malformed workers. These indicate handler bugs and never
/// leave the dispatch boundary as anything but a failed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    MissingStartNumber,
    MissingTargetNumber,
    InvalidDirection,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingStartNumber => write!(f, "worker has no start number"),
            Self::MissingTargetNumber => write!(f, "worker has no target number"),
            Self::InvalidDirection => {
                write!(f, "worker direction disagrees with start and target")
            }
        }
    }
}

impl std::error::Error for RequestError {}

/// Convert a worker into the wire requests that cover its range, splitting at
/// the 128-block response cap. All requests but the last leave `max` unset
/// and rely on the server cap; the last carries the remainder explicitly.
/// `end_block_hash` is set only on the request covering the target, and only
/// when the target hash is known.
pub fn worker_to_requests(worker: &Worker) -> Result<Vec<BlockRequestMessage>, RequestError> {
    let start = worker.start_number.ok_or(RequestError::MissingStartNumber)?;
    let target = worker.target_number.ok_or(RequestError::MissingTargetNumber)?;

    match worker.direction {
        Direction::Ascending if target < start => return Err(RequestError::InvalidDirection),
        Direction::Descending if start < target => return Err(RequestError::InvalidDirection),
        _ => {}
    }

    let diff = start.abs_diff(target);
    let max = u64::from(MAX_RESPONSE_SIZE);
    let (count, last_max) = if diff == 0 {
        (1u64, 1u32)
    } else {
        let full = diff / max;
        let rem = diff % max;
        if rem > 0 {
            (full + 1, (rem + 1) as u32)
        } else {
            (full, MAX_RESPONSE_SIZE)
        }
    };

    let mut requests = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * max;
        let number = match worker.direction {
            Direction::Ascending => start.saturating_add(offset),
            Direction::Descending => start.saturating_sub(offset),
        };
        let starting_block = match worker.start_hash {
            // only the first request may address by hash; the rest continue
            // from computed numbers
            Some(hash) if i == 0 => BlockHashOrNumber::Hash(hash),
            _ => BlockHashOrNumber::Number(number),
        };
        let is_last = i + 1 == count;
        requests.push(BlockRequestMessage {
            requested_data: worker.request_data,
            starting_block,
            end_block_hash: if is_last { worker.target_hash } else { None },
            direction: worker.direction,
            max: if is_last { Some(last_max) } else { None },
        });
    }

    Ok(requests)
}
