use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{EventKind, ExternalEvent};
use crate::errors::ServiceError;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ExternalEvent) -> Result<(), ServiceError>;
}

#[derive(Default)]
pub struct EventDispatcherBuilder {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl EventDispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations for the same kind replace earlier ones.
    pub fn register(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        if self.handlers.insert(kind, handler).is_some() {
            warn!(event_type = %kind, "replacing previously registered handler");
        }
        self
    }

    pub fn build(self) -> EventDispatcher {
        EventDispatcher {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Immutable map from event kind to handler, fixed at startup.
#[derive(Clone)]
pub struct EventDispatcher {
    handlers: Arc<HashMap<EventKind, Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub fn builder() -> EventDispatcherBuilder {
        EventDispatcherBuilder::new()
    }

    pub fn resolve(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        let kind: EventKind = event_type.parse().ok()?;
        self.handlers.get(&kind).cloned()
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.resolve(event_type).is_some()
    }

    pub fn registered_kinds(&self) -> Vec<EventKind> {
        self.handlers.keys().copied().collect()
    }

    pub async fn dispatch(&self, event: &ExternalEvent) -> Result<(), ServiceError> {
        let handler = self
            .resolve(&event.event_type)
            .ok_or_else(|| ServiceError::UnhandledEvent(event.event_type.clone()))?;
        debug!(event_id = %event.id, event_type = %event.event_type, "dispatching event");
        handler.handle(event).await
    }
}
