//! # Admission Queue
//!
//! Bounded priority queue of job ids waiting for a worker.
//!
//! ## Ordering:
//! Higher `priority` dequeues first; within one priority, jobs leave in
//! admission order. Order is decided at dequeue time, so a late
//! high-priority job overtakes everything still waiting.
//!
//! ## Backpressure:
//! Admission first takes a `Reservation`. The job record is only created
//! once a slot is reserved, so a full queue rejects a request without ever
//! leaving a job behind. An uncommitted reservation frees its slot on drop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::jobs::error::JobError;
use crate::jobs::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedJob {
    job_id: JobId,
    priority: i32,
    seq: u64,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: bigger priority wins, then smaller seq.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueuedJob>,
    reserved: usize,
    next_seq: u64,
    closed: bool,
}

impl QueueInner {
    fn push(&mut self, job_id: JobId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob { job_id, priority, seq });
    }
}

/// A job handed to a worker, with the priority it waited at so the worker
/// can put it back in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub job_id: JobId,
    pub priority: i32,
}

pub struct AdmissionQueue {
    inner: Mutex<QueueInner>,
    available: Notify,
    max_depth: usize,
}

impl AdmissionQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            available: Notify::new(),
            max_depth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Claim a slot for a job that is about to be created.
    pub fn reserve(&self) -> Result<Reservation<'_>, JobError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(JobError::ShuttingDown);
        }
        if inner.heap.len() + inner.reserved >= self.max_depth {
            return Err(JobError::Capacity {
                max_depth: self.max_depth,
            });
        }
        inner.reserved += 1;
        Ok(Reservation {
            queue: self,
            committed: false,
        })
    }

    /// Put an already-admitted job back in line: one recovered at startup,
    /// or one a worker could not start. Ignores the depth limit.
    pub fn restore(&self, job_id: JobId, priority: i32) {
        self.lock().push(job_id, priority);
        self.available.notify_one();
    }

    /// Wait for the next job. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Dequeued> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(next) = inner.heap.pop() {
                    if !inner.heap.is_empty() {
                        // Pass the baton so a second idle worker wakes too.
                        self.available.notify_one();
                    }
                    return Some(Dequeued {
                        job_id: next.job_id,
                        priority: next.priority,
                    });
                }
            }

            notified.await;
        }
    }

    /// Drop a waiting job from the queue (it was cancelled).
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut inner = self.lock();
        let before = inner.heap.len();
        inner.heap.retain(|queued| queued.job_id != job_id);
        inner.heap.len() != before
    }

    /// 1-based position the job would dequeue at right now.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        let inner = self.lock();
        let target = inner.heap.iter().find(|queued| queued.job_id == job_id)?;
        let ahead = inner.heap.iter().filter(|queued| *queued > target).count();
        Some(ahead + 1)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out work. Waiting workers wake up and see `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }
}

/// A held queue slot. Either `commit` it or let it drop.
pub struct Reservation<'a> {
    queue: &'a AdmissionQueue,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self, job_id: JobId, priority: i32) {
        {
            let mut inner = self.queue.lock();
            inner.reserved -= 1;
            inner.push(job_id, priority);
        }
        self.committed = true;
        self.queue.available.notify_one();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.queue.lock().reserved -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn admit(queue: &AdmissionQueue, priority: i32) -> JobId {
        let id = JobId::new();
        queue.reserve().unwrap().commit(id, priority);
        id
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = AdmissionQueue::new(10);
        let first_low = admit(&queue, 1);
        let high = admit(&queue, 5);
        let second_low = admit(&queue, 1);

        assert_eq!(queue.pop().await.map(|next| next.job_id), Some(high));
        assert_eq!(queue.pop().await.map(|next| next.job_id), Some(first_low));
        assert_eq!(
            queue.pop().await,
            Some(Dequeued {
                job_id: second_low,
                priority: 1
            })
        );
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let queue = AdmissionQueue::new(2);
        admit(&queue, 0);
        let held = queue.reserve().unwrap();

        assert!(matches!(queue.reserve(), Err(JobError::Capacity { max_depth: 2 })));

        drop(held);
        assert!(queue.reserve().is_ok());
    }

    #[tokio::test]
    async fn test_position_and_remove() {
        let queue = AdmissionQueue::new(10);
        let a = admit(&queue, 0);
        let b = admit(&queue, 0);
        let urgent = admit(&queue, 9);

        assert_eq!(queue.position(urgent), Some(1));
        assert_eq!(queue.position(a), Some(2));
        assert_eq!(queue.position(b), Some(3));

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(queue.position(b), Some(2));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_requeues_past_depth_limit() {
        let queue = AdmissionQueue::new(1);
        let admitted = admit(&queue, 0);
        let retried = JobId::new();
        queue.restore(retried, 3);

        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.pop().await,
            Some(Dequeued {
                job_id: retried,
                priority: 3
            })
        );
        assert_eq!(queue.pop().await.map(|next| next.job_id), Some(admitted));
    }

    #[tokio::test]
    async fn test_pop_waits_for_commit() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = admit(&queue, 0);
        assert_eq!(waiter.await.unwrap().map(|next| next.job_id), Some(id));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_blocks_admission() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(waiter.await.unwrap(), None);
        assert!(matches!(queue.reserve(), Err(JobError::ShuttingDown)));
    }
}
