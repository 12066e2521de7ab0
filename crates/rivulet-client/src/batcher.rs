//! Request coalescing and batching.
//!
//! Lookups queue per partition until the coalescing window closes or the
//! queue is full, then go out as one batch. A lookup that is already queued
//! or in flight gains another waiter instead of a second request, but only
//! within the session epoch it was sent in.

use std::collections::HashMap;

use rivulet_net::Partition;
use rivulet_shared::protocol::BatchItem;

/// What the caller must do after [`Batcher::enqueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// The same lookup is already pending; nothing to send.
    Attached,
    /// First item of a fresh queue: arm the window timer for `generation`.
    Scheduled { generation: u64 },
    /// Added to a queue whose timer is already running.
    Queued,
    /// The queue reached the batch limit: send these now.
    Flush(Vec<BatchItem>),
}

struct Queue {
    items: Vec<BatchItem>,
    generation: u64,
}

pub struct Batcher<W> {
    max: usize,
    generations: u64,
    queues: HashMap<Partition, Queue>,
    waiting: HashMap<(u64, BatchItem), Vec<W>>,
}

impl<W> Batcher<W> {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            generations: 0,
            queues: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    pub fn enqueue(
        &mut self,
        epoch: u64,
        partition: Partition,
        item: BatchItem,
        waiter: W,
    ) -> Enqueued {
        if let Some(waiters) = self.waiting.get_mut(&(epoch, item.clone())) {
            waiters.push(waiter);
            return Enqueued::Attached;
        }
        self.waiting.insert((epoch, item.clone()), vec![waiter]);

        let fresh = !self.queues.contains_key(&partition);
        if fresh {
            self.generations += 1;
        }
        let generation = self.generations;
        let queue = self.queues.entry(partition.clone()).or_insert_with(|| Queue {
            items: Vec::new(),
            generation,
        });
        queue.items.push(item);

        if queue.items.len() >= self.max {
            let items = self
                .queues
                .remove(&partition)
                .map(|q| q.items)
                .unwrap_or_default();
            return Enqueued::Flush(items);
        }
        if fresh {
            Enqueued::Scheduled { generation }
        } else {
            Enqueued::Queued
        }
    }

    /// The window for `generation` closed. Returns the queue if it is still
    /// the one that timer was armed for.
    pub fn flush_due(&mut self, partition: &Partition, generation: u64) -> Option<Vec<BatchItem>> {
        match self.queues.get(partition) {
            Some(queue) if queue.generation == generation => {
                self.queues.remove(partition).map(|q| q.items)
            }
            _ => None,
        }
    }

    /// Empty every queue so the items go out under the epoch they were
    /// queued in. Their window timers find nothing when they fire.
    pub fn drain(&mut self) -> Vec<(Partition, Vec<BatchItem>)> {
        self.queues
            .drain()
            .map(|(partition, queue)| (partition, queue.items))
            .collect()
    }

    /// The result for `item` sent in `epoch` arrived; hand back everyone
    /// waiting on it.
    pub fn complete(&mut self, epoch: u64, item: BatchItem) -> Vec<W> {
        self.waiting.remove(&(epoch, item)).unwrap_or_default()
    }

    pub fn in_flight(&self, epoch: u64, item: &BatchItem) -> bool {
        self.waiting.contains_key(&(epoch, item.clone()))
    }

    pub fn pending(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_shared::types::StreamKey;

    fn message(n: u64) -> BatchItem {
        BatchItem::Message {
            key: StreamKey::new("u1", "chat/1").unwrap(),
            ordinal: n,
        }
    }

    #[test]
    fn test_identical_lookups_coalesce() {
        let mut batcher = Batcher::new(10);
        let p = Partition::new("http://a");
        assert_eq!(
            batcher.enqueue(0, p.clone(), message(1), "first"),
            Enqueued::Scheduled { generation: 1 }
        );
        assert_eq!(batcher.enqueue(0, p.clone(), message(1), "second"), Enqueued::Attached);
        assert_eq!(batcher.enqueue(0, p.clone(), message(2), "third"), Enqueued::Queued);

        assert_eq!(batcher.flush_due(&p, 1), Some(vec![message(1), message(2)]));
        assert_eq!(batcher.complete(0, message(1)), vec!["first", "second"]);
        assert_eq!(batcher.complete(0, message(2)), vec!["third"]);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_full_queue_flushes_and_stale_timer_is_ignored() {
        let mut batcher = Batcher::new(2);
        let p = Partition::new("http://a");
        batcher.enqueue(0, p.clone(), message(1), ());
        assert_eq!(
            batcher.enqueue(0, p.clone(), message(2), ()),
            Enqueued::Flush(vec![message(1), message(2)])
        );
        assert!(batcher.in_flight(0, &message(1)));

        assert_eq!(
            batcher.enqueue(0, p.clone(), message(3), ()),
            Enqueued::Scheduled { generation: 2 }
        );
        // The first window's timer fires late.
        assert_eq!(batcher.flush_due(&p, 1), None);
        assert_eq!(batcher.flush_due(&p, 2), Some(vec![message(3)]));
    }

    #[test]
    fn test_partitions_never_merge() {
        let mut batcher = Batcher::new(10);
        let a = Partition::new("http://a");
        let b = Partition::new("http://b");
        batcher.enqueue(0, a.clone(), message(1), ());
        let other = BatchItem::Avatar {
            user_id: rivulet_shared::types::UserId::new("u2").unwrap(),
        };
        assert!(matches!(
            batcher.enqueue(0, b.clone(), other.clone(), ()),
            Enqueued::Scheduled { .. }
        ));
        assert_eq!(batcher.flush_due(&a, 1), Some(vec![message(1)]));
        assert_eq!(batcher.flush_due(&b, 2), Some(vec![other]));
    }

    #[test]
    fn test_new_epoch_does_not_attach_to_old_request() {
        let mut batcher = Batcher::new(10);
        let p = Partition::new("http://a");
        batcher.enqueue(0, p.clone(), message(1), "before");
        let drained = batcher.drain();
        assert_eq!(drained, vec![(p.clone(), vec![message(1)])]);
        assert!(batcher.in_flight(0, &message(1)));

        assert_eq!(
            batcher.enqueue(1, p.clone(), message(1), "after"),
            Enqueued::Scheduled { generation: 2 }
        );
        assert_eq!(batcher.flush_due(&p, 1), None);
        assert_eq!(batcher.complete(0, message(1)), vec!["before"]);
        assert_eq!(batcher.complete(1, message(1)), vec!["after"]);
    }
}
