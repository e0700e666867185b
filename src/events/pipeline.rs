//! Idempotent entry point for external events.
//!
//! An event id is claimed in `processed_events` before its handler runs and
//! flipped to processed once the handler succeeds. A failing handler gives
//! the claim back so a redelivery is retried. A claim left at
//! `processed = false` means the process died mid-handler; such ids are
//! skipped on redelivery and listed by [`EventPipeline::list_unprocessed`].

use metrics::counter;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::dispatcher::EventDispatcher;
use super::worker_pool::WorkerPool;
use super::ExternalEvent;
use crate::entities::processed_event;
use crate::errors::ServiceError;
use crate::repositories::processed_event_repository::{Claim, ProcessedEventRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The handler ran and succeeded.
    Handled,
    /// The id was seen before; nothing ran.
    Duplicate,
}

#[derive(Clone)]
pub struct EventPipeline {
    db: Arc<DatabaseConnection>,
    dispatcher: EventDispatcher,
    events: ProcessedEventRepository,
}

impl EventPipeline {
    pub fn new(db: Arc<DatabaseConnection>, dispatcher: EventDispatcher) -> Self {
        Self {
            db,
            dispatcher,
            events: ProcessedEventRepository,
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn process_event(&self, event: &ExternalEvent) -> Result<EventOutcome, ServiceError> {
        let conn = self.db.as_ref();

        if self.events.find(conn, &event.id).await?.is_some() {
            counter!("commerce.events.duplicate", 1);
            info!("Event already seen, skipping");
            return Ok(EventOutcome::Duplicate);
        }

        // Unknown types leave no dedup row behind.
        if !self.dispatcher.is_registered(&event.event_type) {
            counter!("commerce.events.failed", 1, "reason" => "unhandled");
            warn!("No handler registered for event type");
            return Err(ServiceError::UnhandledEvent(event.event_type.clone()));
        }

        if self.events.claim(conn, &event.id, &event.event_type).await? == Claim::AlreadySeen {
            counter!("commerce.events.duplicate", 1);
            info!("Event claimed concurrently by another delivery, skipping");
            return Ok(EventOutcome::Duplicate);
        }

        match self.dispatcher.dispatch(event).await {
            Ok(()) => {
                if let Err(err) = self.events.mark_processed(conn, &event.id).await {
                    error!(
                        error = %err,
                        "Handler committed but the event could not be marked processed"
                    );
                    return Err(err);
                }
                counter!("commerce.events.processed", 1);
                info!("Event processed");
                Ok(EventOutcome::Handled)
            }
            Err(err) => {
                counter!("commerce.events.failed", 1, "reason" => "handler");
                error!(error = %err, "Event handler failed");
                if let Err(release_err) = self.events.release(conn, &event.id).await {
                    error!(error = %release_err, "failed to release event claim");
                }
                Err(err)
            }
        }
    }

    /// Hands the event to the pool. The outcome is logged by the worker.
    pub async fn enqueue(
        &self,
        pool: &WorkerPool,
        event: ExternalEvent,
    ) -> Result<(), ServiceError> {
        let pipeline = self.clone();
        pool.submit(async move {
            pipeline.process_logged(&event).await;
        })
        .await
    }

    /// Runs `process_event` and records a failure with the event's identity.
    pub async fn process_logged(&self, event: &ExternalEvent) -> Option<EventOutcome> {
        match self.process_event(event).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "Event processing failed"
                );
                None
            }
        }
    }

    /// Claims never completed, oldest first.
    pub async fn list_unprocessed(
        &self,
        limit: u64,
    ) -> Result<Vec<processed_event::Model>, ServiceError> {
        self.events.list_unprocessed(self.db.as_ref(), limit).await
    }
}
