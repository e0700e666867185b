use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::ServiceError;

pub mod dispatcher;
pub mod handlers;
pub mod pipeline;
pub mod worker_pool;

pub use dispatcher::{EventDispatcher, EventDispatcherBuilder, EventHandler};
pub use handlers::payment_dispatcher;
pub use pipeline::{EventOutcome, EventPipeline};
pub use worker_pool::WorkerPool;

/// Payment lifecycle event types this service reacts to.
///
/// The set is closed: a type tag outside it has no handler and is rejected
/// before any bookkeeping happens.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum EventKind {
    #[strum(serialize = "payment_intent.succeeded")]
    PaymentIntentSucceeded,
    #[strum(serialize = "payment_intent.payment_failed")]
    PaymentIntentPaymentFailed,
    #[strum(serialize = "payment_intent.canceled")]
    PaymentIntentCanceled,
    #[strum(serialize = "charge.refunded")]
    ChargeRefunded,
    #[strum(serialize = "charge.dispute.created")]
    ChargeDisputeCreated,
    #[strum(serialize = "checkout.session.completed")]
    CheckoutSessionCompleted,
    #[strum(serialize = "invoice.payment_succeeded")]
    InvoicePaymentSucceeded,
    #[strum(serialize = "invoice.payment_failed")]
    InvoicePaymentFailed,
    #[strum(serialize = "customer.subscription.created")]
    SubscriptionCreated,
    #[strum(serialize = "customer.subscription.updated")]
    SubscriptionUpdated,
    #[strum(serialize = "customer.subscription.deleted")]
    SubscriptionDeleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// An event as delivered by the payment provider.
///
/// `payload` is the provider's `data.object`; handlers pick the fields they
/// need out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl ExternalEvent {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// `None` for type tags outside [`EventKind`].
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_str(&self.event_type).ok()
    }

    /// Decodes the payload into a handler's view of the provider object.
    pub fn object<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        T::deserialize(&self.payload).map_err(|e| {
            ServiceError::EventError(format!(
                "event {} ({}) has an unexpected payload: {}",
                self.id, self.event_type, e
            ))
        })
    }
}
