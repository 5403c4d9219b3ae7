//! Ready-block queue: parent-first stream into the block processor.

use crate::chain::BlockData;
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender side of the ready-block stream. Bounded: `push` suspends when the
/// processor falls behind. Tracks the hashes it has emitted so readiness
/// checks can treat not-yet-imported predecessors as known.
#[derive(Debug, Clone)]
pub struct ReadyQueue {
    tx: mpsc::Sender<BlockData>,
    seen: Arc<RwLock<HashSet<B256>>>,
}

/// Create a ready queue with the given capacity, returning the sender and
/// the processor's receiver.
pub fn ready_queue(capacity: usize) -> (ReadyQueue, mpsc::Receiver<BlockData>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ReadyQueue {
            tx,
            seen: Arc::new(RwLock::new(HashSet::new())),
        },
        rx,
    )
}

impl ReadyQueue {
    /// Enqueue a block for processing. Callers must only push blocks whose
    /// parent is locally known or was pushed earlier.
    pub async fn push(&self, block_data: BlockData) -> eyre::Result<()> {
        {
            let mut seen = self.seen.write();
            seen.insert(block_data.hash);
        }
        self.tx
            .send(block_data)
            .await
            .map_err(|_| eyre::eyre!("ready-block receiver dropped"))
    }

    /// Whether a block with this hash was enqueued during this run.
    pub fn contains(&self, hash: B256) -> bool {
        let seen = self.seen.read();
        seen.contains(&hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_data(byte: u8) -> BlockData {
        BlockData {
            hash: B256::repeat_byte(byte),
            header: None,
            body: None,
            justification: None,
        }
    }

    #[tokio::test]
    async fn push_preserves_order_and_tracks_hashes() {
        let (queue, mut rx) = ready_queue(4);
        queue.push(block_data(1)).await.expect("push");
        queue.push(block_data(2)).await.expect("push");

        assert!(queue.contains(B256::repeat_byte(1)));
        assert!(!queue.contains(B256::repeat_byte(9)));

        assert_eq!(rx.recv().await.unwrap().hash, B256::repeat_byte(1));
        assert_eq!(rx.recv().await.unwrap().hash, B256::repeat_byte(2));
    }

    #[tokio::test]
    async fn push_suspends_until_processor_drains() {
        let (queue, mut rx) = ready_queue(1);
        queue.push(block_data(1)).await.expect("push");

        let queue_clone = queue.clone();
        let pusher = tokio::spawn(async move { queue_clone.push(block_data(2)).await });
        tokio::task::yield_now().await;
        assert!(!pusher.is_finished());

        assert_eq!(rx.recv().await.unwrap().hash, B256::repeat_byte(1));
        pusher.await.expect("join").expect("push");
        assert_eq!(rx.recv().await.unwrap().hash, B256::repeat_byte(2));
    }
}
