/*!
 * # Message Queue
 *
 * Bus abstraction carrying raw payment-provider events, and the ingress that
 * decodes them and feeds the event pipeline's worker pool.
 */

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::events::{EventPipeline, ExternalEvent, WorkerPool};

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("Queue is full")]
    QueueFull,
    #[error("Unknown message {0}")]
    UnknownMessage(Uuid),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<MessageQueueError> for ServiceError {
    fn from(err: MessageQueueError) -> Self {
        ServiceError::QueueError(err.to_string())
    }
}

/// Message envelope for queue items
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub subject: String,
    pub payload: Bytes,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub delivery_count: u32,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            payload: payload.into(),
            timestamp: chrono::Utc::now(),
            delivery_count: 0,
        }
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError>;
    /// Next message on any subject matching `pattern`, if one is waiting.
    async fn poll(&self, pattern: &str) -> Result<Option<Message>, MessageQueueError>;
    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
    /// Puts an unacknowledged message back at the front of its subject.
    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
}

/// NATS-style subject matching: `*` matches one token, `>` the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Default)]
struct QueueState {
    subjects: HashMap<String, VecDeque<Message>>,
    in_flight: HashMap<Uuid, Message>,
}

/// In-memory message queue implementation
pub struct InMemoryMessageQueue {
    state: Mutex<QueueState>,
    max_size: usize,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::with_max_size(1000)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_size,
        }
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.subjects.values().map(VecDeque::len).sum()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let mut state = self.state.lock().await;
        let queue = state.subjects.entry(message.subject.clone()).or_default();

        if queue.len() >= self.max_size {
            return Err(MessageQueueError::QueueFull);
        }

        queue.push_back(message);
        Ok(())
    }

    async fn poll(&self, pattern: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut state = self.state.lock().await;
        let next = state
            .subjects
            .iter()
            .filter(|(subject, _)| subject_matches(pattern, subject))
            .filter_map(|(_, queue)| queue.front().map(|m| (m.timestamp, m.id)))
            .min();
        let Some((_, id)) = next else {
            return Ok(None);
        };

        let mut message = None;
        for queue in state.subjects.values_mut() {
            if queue.front().map(|m| m.id) == Some(id) {
                message = queue.pop_front();
                break;
            }
        }
        let Some(mut message) = message else {
            return Ok(None);
        };
        message.delivery_count += 1;
        state.in_flight.insert(message.id, message.clone());
        Ok(Some(message))
    }

    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(message_id)
            .map(|_| ())
            .ok_or(MessageQueueError::UnknownMessage(*message_id))
    }

    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let mut state = self.state.lock().await;
        let message = state
            .in_flight
            .remove(message_id)
            .ok_or(MessageQueueError::UnknownMessage(*message_id))?;
        state
            .subjects
            .entry(message.subject.clone())
            .or_default()
            .push_front(message);
        Ok(())
    }
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// Parses the provider envelope `{id, type, data: {object}}`.
pub fn decode_event(payload: &[u8]) -> Result<ExternalEvent, MessageQueueError> {
    let envelope: Envelope =
        serde_json::from_slice(payload).map_err(|e| MessageQueueError::Decode(e.to_string()))?;
    if envelope.id.is_empty() {
        return Err(MessageQueueError::Decode("event id is empty".to_string()));
    }
    Ok(ExternalEvent::new(
        envelope.id,
        envelope.event_type,
        envelope.data.object,
    ))
}

/// Moves events from the bus into the pipeline's worker pool.
pub struct BusIngress {
    queue: Arc<dyn MessageQueue>,
    pipeline: EventPipeline,
    pool: Arc<WorkerPool>,
    subject: String,
    idle_wait: Duration,
}

impl BusIngress {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        pipeline: EventPipeline,
        pool: Arc<WorkerPool>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            pipeline,
            pool,
            subject: subject.into(),
            idle_wait: Duration::from_millis(50),
        }
    }

    /// Submits every waiting message and returns how many were submitted.
    ///
    /// Undecodable messages are acked and dropped. A message whose submission
    /// fails is nacked and the drain stops.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let mut submitted = 0;
        while let Some(message) = self.queue.poll(&self.subject).await? {
            let event = match decode_event(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        subject = %message.subject,
                        error = %e,
                        "dropping undecodable message"
                    );
                    self.queue.ack(&message.id).await?;
                    continue;
                }
            };

            debug!(event_id = %event.id, event_type = %event.event_type, "submitting event");
            if let Err(e) = self.pipeline.enqueue(&self.pool, event).await {
                self.queue.nack(&message.id).await?;
                return Err(e);
            }
            self.queue.ack(&message.id).await?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Drains repeatedly until `stop` flips to `true` or its sender is dropped.
    pub async fn run_until(&self, mut stop: watch::Receiver<bool>) -> Result<(), ServiceError> {
        info!(subject = %self.subject, "Bus ingress started");
        loop {
            if *stop.borrow() {
                break;
            }
            if self.drain_once().await? == 0 {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.idle_wait) => {}
                }
            }
        }
        info!("Bus ingress stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn wildcards_follow_nats_rules() {
        assert!(subject_matches("payment.service.event.>", "payment.service.event.charge"));
        assert!(subject_matches(
            "payment.service.event.>",
            "payment.service.event.charge.refunded"
        ));
        assert!(!subject_matches("payment.service.event.>", "payment.service.event"));
        assert!(subject_matches("payment.*.event", "payment.service.event"));
        assert!(!subject_matches("payment.*.event", "payment.service.other"));
        assert!(!subject_matches("payment.service", "payment.service.event"));
        assert!(subject_matches("a.b", "a.b"));
    }

    #[tokio::test]
    async fn poll_ack_and_nack() {
        let queue = InMemoryMessageQueue::new();
        queue
            .publish(Message::new("payment.service.event.a", &b"one"[..]))
            .await
            .unwrap();
        queue
            .publish(Message::new("other.subject", &b"two"[..]))
            .await
            .unwrap();

        let first = queue.poll("payment.service.event.>").await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(first.delivery_count, 1);
        assert!(queue.poll("payment.service.event.>").await.unwrap().is_none());

        queue.nack(&first.id).await.unwrap();
        let again = queue.poll("payment.service.event.>").await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 2);

        queue.ack(&again.id).await.unwrap();
        assert_matches!(
            queue.ack(&again.id).await,
            Err(MessageQueueError::UnknownMessage(_))
        );
        assert_eq!(queue.pending().await, 1);
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn publish_rejects_when_full() {
        let queue = InMemoryMessageQueue::with_max_size(1);
        queue.publish(Message::new("s", &b"1"[..])).await.unwrap();
        assert_matches!(
            queue.publish(Message::new("s", &b"2"[..])).await,
            Err(MessageQueueError::QueueFull)
        );
    }

    #[test]
    fn decodes_the_provider_envelope() {
        let raw = br#"{"id":"evt_1","type":"charge.refunded","data":{"object":{"id":"ch_1"}}}"#;
        let event = decode_event(raw).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "charge.refunded");
        assert_eq!(event.payload["id"], "ch_1");

        assert_matches!(decode_event(b"not json"), Err(MessageQueueError::Decode(_)));
        assert_matches!(
            decode_event(br#"{"id":"","type":"x","data":{"object":{}}}"#),
            Err(MessageQueueError::Decode(_))
        );
    }
}
