//! Event delivery for change-feed and condition-feed records.
//!
//! Queues are bounded. Producers choose between [`EventQueue::publish`],
//! which never blocks and drops (with a log line and a counter) when the queue
//! is full, and [`EventQueue::publish_wait`], which waits for capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::full_sync_cond::FullSyncCond;

const METRIC_EVENT_DROPPED: &str = "rescache_event_dropped_total";
const METRIC_EVENT_QUEUE_LEN: &str = "rescache_event_queue_len";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// An event with idempotency and ordering metadata.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub timestamp: OffsetDateTime,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(epoch: Epoch, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            timestamp: OffsetDateTime::now_utc(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

/// One record from the primary store's change feed.
///
/// For deletions `data` carries the record as it was before removal.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub oid: String,
    pub data: Value,
}

impl ChangeEvent {
    pub fn insert(oid: impl Into<String>, data: Value) -> Self {
        Self {
            operation: Operation::Insert,
            oid: oid.into(),
            data,
        }
    }

    pub fn update(oid: impl Into<String>, data: Value) -> Self {
        Self {
            operation: Operation::Update,
            oid: oid.into(),
            data,
        }
    }

    pub fn delete(oid: impl Into<String>, data: Value) -> Self {
        Self {
            operation: Operation::Delete,
            oid: oid.into(),
            data,
        }
    }
}

/// One record from the full-sync-condition feed.
#[derive(Debug, Clone)]
pub enum CondEvent {
    /// Startup snapshot replacing everything known so far.
    Init(Vec<FullSyncCond>),
    Upsert(Vec<FullSyncCond>),
    Delete(Vec<FullSyncCond>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("event queue `{queue}` is full")]
    Full { queue: &'static str },
    #[error("event queue `{queue}` is closed")]
    Closed { queue: &'static str },
}

/// Producer side of a bounded event queue.
pub struct EventQueue<T> {
    name: &'static str,
    sender: mpsc::Sender<Envelope<T>>,
    epoch_counter: Arc<AtomicU64>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            epoch_counter: Arc::clone(&self.epoch_counter),
        }
    }
}

/// Consumer side of a bounded event queue.
pub struct EventReceiver<T> {
    name: &'static str,
    receiver: mpsc::Receiver<Envelope<T>>,
}

/// Create a bounded queue named `name` holding at most `capacity` events.
pub fn channel<T>(name: &'static str, capacity: usize) -> (EventQueue<T>, EventReceiver<T>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        EventQueue {
            name,
            sender,
            epoch_counter: Arc::new(AtomicU64::new(0)),
        },
        EventReceiver { name, receiver },
    )
}

impl<T> EventQueue<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn envelope(&self, payload: T) -> Envelope<T> {
        Envelope::new(self.next_epoch(), payload)
    }

    /// Enqueue without waiting. A full queue drops the event.
    pub fn publish(&self, payload: T) -> Result<Epoch, QueueError> {
        let event = self.envelope(payload);
        let (event_id, epoch) = (event.id, event.epoch);

        match self.sender.try_send(event) {
            Ok(()) => {
                debug!(queue = self.name, event_id = %event_id, event_epoch = epoch, "Event enqueued");
                self.record_len();
                Ok(epoch)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    queue = self.name,
                    event_id = %event_id,
                    event_epoch = epoch,
                    "Event queue full, dropping event"
                );
                counter!(METRIC_EVENT_DROPPED, "queue" => self.name).increment(1);
                Err(QueueError::Full { queue: self.name })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(queue = self.name, event_id = %event_id, "Event queue closed");
                Err(QueueError::Closed { queue: self.name })
            }
        }
    }

    /// Enqueue, waiting for capacity when the queue is full.
    pub async fn publish_wait(&self, payload: T) -> Result<Epoch, QueueError> {
        let event = self.envelope(payload);
        let epoch = event.epoch;
        self.sender
            .send(event)
            .await
            .map_err(|_| QueueError::Closed { queue: self.name })?;
        self.record_len();
        Ok(epoch)
    }

    /// Number of events waiting to be consumed.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_len(&self) {
        gauge!(METRIC_EVENT_QUEUE_LEN, "queue" => self.name).set(self.len() as f64);
    }
}

impl<T> EventReceiver<T> {
    /// Wait for at least one event and drain up to `limit` in FIFO order.
    ///
    /// Returns an empty batch once every producer is gone.
    pub async fn next_batch(&mut self, limit: usize) -> Vec<Envelope<T>> {
        let mut batch = Vec::with_capacity(limit.max(1));
        self.receiver.recv_many(&mut batch, limit.max(1)).await;
        gauge!(METRIC_EVENT_QUEUE_LEN, "queue" => self.name).set(self.receiver.len() as f64);
        batch
    }

    /// Drain up to `limit` already-queued events without waiting.
    pub fn drain(&mut self, limit: usize) -> Vec<Envelope<T>> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            match self.receiver.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (queue, mut receiver) = channel::<ChangeEvent>("test", 2);
        assert_eq!(queue.publish(ChangeEvent::insert("a", json!({}))), Ok(0));
        assert_eq!(queue.publish(ChangeEvent::insert("b", json!({}))), Ok(1));
        assert_eq!(
            queue.publish(ChangeEvent::insert("c", json!({}))),
            Err(QueueError::Full { queue: "test" })
        );
        assert_eq!(queue.len(), 2);

        let batch = receiver.next_batch(10).await;
        let oids: Vec<_> = batch.iter().map(|e| e.payload.oid.as_str()).collect();
        assert_eq!(oids, vec!["a", "b"]);
        assert!(batch[0].epoch < batch[1].epoch);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn publish_wait_applies_backpressure() {
        let (queue, mut receiver) = channel::<u32>("test", 1);
        queue.publish_wait(1).await.expect("first fits");

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.publish_wait(2).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(receiver.next_batch(1).await[0].payload, 1);
        producer.await.expect("join").expect("second fits");
        assert_eq!(receiver.next_batch(1).await[0].payload, 2);
    }

    #[tokio::test]
    async fn batches_end_when_producers_are_gone() {
        let (queue, mut receiver) = channel::<u32>("test", 4);
        queue.publish(7).expect("enqueue");
        drop(queue);
        assert_eq!(receiver.next_batch(10).await.len(), 1);
        assert!(receiver.next_batch(10).await.is_empty());
    }
}
