//! In-memory intake queue for pending personal best updates.
//!
//! The queue is the only object mutated from multiple call sites (the broker
//! subscriber enqueues, the worker drains), so it is the sole point of
//! in-process locking. Everything else relies on store transaction isolation.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// A request to recompute the personal best for one (participant, level) pair.
///
/// Duplicates may coexist in the queue; the worker collapses them before
/// dispatch, since recomputation reads current store state rather than
/// replaying individual events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub participant_id: i64,
    pub level_id: i64,
}

/// Mutex-guarded buffer of pending update requests.
///
/// All three operations take the lock for O(1)-ish critical sections. A drain
/// returns an exact snapshot while atomically emptying the buffer: the union
/// of all drains partitions every enqueued request exactly once.
#[derive(Debug, Default)]
pub struct IntakeQueue {
    pending: Mutex<Vec<UpdateRequest>>,
}

impl IntakeQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request. No side effect beyond the append.
    pub fn enqueue(&self, request: UpdateRequest) {
        self.lock().push(request);
    }

    /// Scheduling hint only: a concurrent enqueue may race this check.
    pub fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Atomically take the full contents, leaving the queue empty.
    pub fn drain_all(&self) -> Vec<UpdateRequest> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UpdateRequest>> {
        // A poisoned lock means a holder panicked mid-operation; the Vec is
        // still structurally sound, so recover rather than propagate.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn request(participant_id: i64, level_id: i64) -> UpdateRequest {
        UpdateRequest {
            participant_id,
            level_id,
        }
    }

    #[test]
    fn test_enqueue_then_drain() {
        let queue = IntakeQueue::new();
        assert!(!queue.has_pending());

        queue.enqueue(request(7, 3));
        queue.enqueue(request(7, 3));
        queue.enqueue(request(9, 1));
        assert!(queue.has_pending());

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 3);
        assert!(!queue.has_pending());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_duplicates_are_kept() {
        let queue = IntakeQueue::new();
        for _ in 0..5 {
            queue.enqueue(request(1, 1));
        }
        assert_eq!(queue.drain_all().len(), 5);
    }

    /// Interleave enqueues from several threads with concurrent drains and
    /// verify the multiset union of all drains equals the multiset enqueued.
    #[test]
    fn test_no_loss_no_duplication_under_contention() {
        const THREADS: i64 = 8;
        const PER_THREAD: i64 = 200;

        let queue = Arc::new(IntakeQueue::new());
        let mut producers = Vec::new();

        for participant_id in 0..THREADS {
            let queue = Arc::clone(&queue);
            producers.push(thread::spawn(move || {
                for level_id in 0..PER_THREAD {
                    queue.enqueue(request(participant_id, level_id));
                }
            }));
        }

        // Drain concurrently while producers are running.
        let drainer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..50 {
                    seen.extend(queue.drain_all());
                    thread::yield_now();
                }
                seen
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen = drainer.join().unwrap();
        seen.extend(queue.drain_all());

        assert_eq!(seen.len() as i64, THREADS * PER_THREAD);

        let mut counts: HashMap<UpdateRequest, usize> = HashMap::new();
        for item in seen {
            *counts.entry(item).or_default() += 1;
        }
        for participant_id in 0..THREADS {
            for level_id in 0..PER_THREAD {
                assert_eq!(counts.get(&request(participant_id, level_id)), Some(&1));
            }
        }
    }
}
