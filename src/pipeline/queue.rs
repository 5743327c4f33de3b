//! Queue source: envelopes naming messages to moderate.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// Default in-memory queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Dead letters kept for inspection before the oldest are dropped.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

/// Opaque pointer to a message on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub team_id: String,
    pub channel_id: String,
    pub message_id: String,
}

/// One received envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    /// Queue-assigned id used for ack and dead-letter.
    pub id: Uuid,
    pub envelope: QueueEnvelope,
    pub enqueued_at: DateTime<Utc>,
}

/// An envelope that could not be processed.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub delivery: Delivery,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A source of message envelopes.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Up to `max` deliveries, waiting at most `wait` for the first one.
    /// An empty batch means nothing arrived in time.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Mark a delivery as handled.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Move a delivery aside for inspection.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

/// In-process queue fed by the change-notification endpoint.
///
/// Deliveries leave the queue on receive, so `ack` only logs. Dead letters
/// are kept in memory, oldest first, up to a fixed capacity, and listed
/// through the HTTP API.
pub struct InMemoryQueue {
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    dead_letters: StdMutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
}

impl InMemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_dead_letter_capacity(capacity, DEFAULT_DEAD_LETTER_CAPACITY)
    }

    pub fn with_dead_letter_capacity(capacity: usize, dead_letter_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dead_letter_capacity = dead_letter_capacity.max(1);
        Self {
            tx,
            rx: Mutex::new(rx),
            dead_letters: StdMutex::new(VecDeque::new()),
            dead_letter_capacity,
        }
    }

    /// Enqueue without waiting. Fails with `Full` when at capacity.
    pub fn enqueue(&self, envelope: QueueEnvelope) -> Result<Uuid, QueueError> {
        let delivery = Delivery {
            id: Uuid::new_v4(),
            envelope,
            enqueued_at: Utc::now(),
        };
        let id = delivery.id;
        self.tx.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        debug!(delivery_id = %id, "Envelope enqueued");
        Ok(id)
    }

    /// Retained dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut rx = self.rx.lock().await;

        let first = match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Err(QueueError::Closed),
            Err(_) => return Ok(Vec::new()),
        };

        let mut batch = vec![first];
        while batch.len() < max {
            match rx.try_recv() {
                Ok(delivery) => batch.push(delivery),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        debug!(delivery_id = %delivery.id, "Delivery acknowledged");
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        warn!(
            delivery_id = %delivery.id,
            message_id = %delivery.envelope.message_id,
            channel_id = %delivery.envelope.channel_id,
            reason,
            "Delivery dead-lettered"
        );
        let mut dead_letters = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        while dead_letters.len() >= self.dead_letter_capacity {
            if let Some(dropped) = dead_letters.pop_front() {
                debug!(
                    delivery_id = %dropped.delivery.id,
                    "Dead letter capacity reached, dropping oldest"
                );
            }
        }
        dead_letters.push_back(DeadLetter {
            delivery: delivery.clone(),
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }
}
