//! Payment lifecycle handlers.
//!
//! Each handler decodes the fields it needs from the provider object, then
//! runs one repeatable-read transaction through the order workflow. Cache
//! invalidation happens only after that transaction commits.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::ConnectionTrait;
use serde::Deserialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::dispatcher::{EventDispatcher, EventHandler};
use super::{EventKind, ExternalEvent};
use crate::db::IsolationProfile;
use crate::entities::order;
use crate::errors::ServiceError;
use crate::models::{OrderStatus, PaidOrder};
use crate::repositories::OrderRepository;
use crate::services::{OrderWorkflow, StatusChange};

/// A reference the provider sends either as a bare id or as the expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn id(&self) -> &str {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChargeObject {
    id: String,
    payment_intent: Option<Expandable>,
    #[serde(default)]
    amount_refunded: i64,
    #[serde(default)]
    refunds: Option<RefundList>,
}

#[derive(Debug, Deserialize)]
struct RefundList {
    #[serde(default)]
    data: Vec<RefundObject>,
}

#[derive(Debug, Deserialize)]
struct RefundObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DisputeObject {
    id: String,
    payment_intent: Option<Expandable>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    payment_intent: Option<Expandable>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    customer: Expandable,
    currency: String,
    total: i64,
    subscription: Option<Expandable>,
    payment_intent: Option<Expandable>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Expandable,
    status: String,
    items: SubscriptionItems,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    price: Price,
}

#[derive(Debug, Deserialize)]
struct Price {
    unit_amount: Option<i64>,
    currency: String,
}

/// Provider amounts are minor units.
fn from_minor_units(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

/// What a handler's transaction changed.
#[derive(Default)]
struct Effect {
    changes: Vec<StatusChange>,
    created: Vec<order::Model>,
}

impl Effect {
    fn changed(change: Option<StatusChange>) -> Self {
        Self {
            changes: change.into_iter().collect(),
            created: Vec::new(),
        }
    }

    fn created(order: order::Model) -> Self {
        Self {
            changes: Vec::new(),
            created: vec![order],
        }
    }

    async fn report(self, workflow: &OrderWorkflow, event: &ExternalEvent) {
        if self.changes.is_empty() && self.created.is_empty() {
            debug!(event_id = %event.id, "event left every order unchanged");
        }
        for change in &self.changes {
            workflow.finish(change).await;
        }
        for order in &self.created {
            workflow.after_commit(&[order.id], &[]).await;
            info!(
                event_id = %event.id,
                order_id = %order.id,
                total = %order.total,
                "Paid order created from event"
            );
        }
    }
}

fn require<'a>(
    reference: &'a Option<Expandable>,
    what: &str,
    event: &ExternalEvent,
) -> Result<&'a str, ServiceError> {
    reference.as_ref().map(Expandable::id).ok_or_else(|| {
        ServiceError::EventError(format!(
            "event {} ({}) carries no {}",
            event.id, event.event_type, what
        ))
    })
}

async fn order_by_payment_intent<C: ConnectionTrait>(
    conn: &C,
    payment_intent_id: &str,
) -> Result<order::Model, ServiceError> {
    OrderRepository
        .find_by_payment_intent(conn, payment_intent_id)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "No order for payment intent {}",
                payment_intent_id
            ))
        })
}

/// Moves the order paid through `payment_intent_id` to `status`.
async fn advance_by_payment_intent(
    workflow: &OrderWorkflow,
    payment_intent_id: &str,
    status: OrderStatus,
) -> Result<Effect, ServiceError> {
    workflow
        .transactions()
        .run_retrying(IsolationProfile::RepeatableRead, |txn| async move {
            let order = order_by_payment_intent(&*txn, payment_intent_id).await?;
            let change = workflow
                .advance_status_in(&*txn, order, status, None)
                .await?;
            Ok(Effect::changed(change))
        })
        .await
}

/// `payment_intent.succeeded`, `payment_intent.payment_failed`, `payment_intent.canceled`.
pub struct PaymentIntentHandler {
    workflow: OrderWorkflow,
}

impl PaymentIntentHandler {
    pub fn new(workflow: OrderWorkflow) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl EventHandler for PaymentIntentHandler {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn handle(&self, event: &ExternalEvent) -> Result<(), ServiceError> {
        let status = match event.kind() {
            Some(EventKind::PaymentIntentSucceeded) => OrderStatus::Paid,
            Some(EventKind::PaymentIntentPaymentFailed) => OrderStatus::Failed,
            Some(EventKind::PaymentIntentCanceled) => OrderStatus::Cancelled,
            _ => return Err(ServiceError::UnhandledEvent(event.event_type.clone())),
        };
        let intent: PaymentIntentObject = event.object()?;
        advance_by_payment_intent(&self.workflow, &intent.id, status)
            .await?
            .report(&self.workflow, event)
            .await;
        Ok(())
    }
}

/// `charge.refunded` and `charge.dispute.created`.
pub struct ChargeHandler {
    workflow: OrderWorkflow,
}

impl ChargeHandler {
    pub fn new(workflow: OrderWorkflow) -> Self {
        Self { workflow }
    }

    async fn refunded(&self, event: &ExternalEvent) -> Result<Effect, ServiceError> {
        let charge: ChargeObject = event.object()?;
        let payment_intent_id = require(&charge.payment_intent, "payment intent", event)?;
        let refund_id = charge
            .refunds
            .as_ref()
            .and_then(|refunds| refunds.data.first())
            .map(|refund| refund.id.clone())
            .unwrap_or_else(|| charge.id.clone());
        let refunded = from_minor_units(charge.amount_refunded);
        let workflow = &self.workflow;
        let refund_id = refund_id.as_str();

        workflow
            .transactions()
            .run_retrying(IsolationProfile::RepeatableRead, |txn| async move {
                let order = order_by_payment_intent(&*txn, payment_intent_id).await?;
                let status = match refunded.cmp(&order.total) {
                    Ordering::Equal => OrderStatus::Refunded,
                    Ordering::Less => OrderStatus::PartiallyRefunded,
                    Ordering::Greater => {
                        return Err(ServiceError::EventError(format!(
                            "refund of {} exceeds order {} total of {}",
                            refunded, order.id, order.total
                        )));
                    }
                };
                let change = workflow
                    .advance_status_in(&*txn, order, status, Some(refund_id))
                    .await?;
                Ok(Effect::changed(change))
            })
            .await
    }

    async fn disputed(&self, event: &ExternalEvent) -> Result<Effect, ServiceError> {
        let dispute: DisputeObject = event.object()?;
        let payment_intent_id = require(&dispute.payment_intent, "payment intent", event)?;
        debug!(dispute_id = %dispute.id, "dispute opened");
        advance_by_payment_intent(&self.workflow, payment_intent_id, OrderStatus::Dispute).await
    }
}

#[async_trait]
impl EventHandler for ChargeHandler {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn handle(&self, event: &ExternalEvent) -> Result<(), ServiceError> {
        let effect = match event.kind() {
            Some(EventKind::ChargeRefunded) => self.refunded(event).await?,
            Some(EventKind::ChargeDisputeCreated) => self.disputed(event).await?,
            _ => return Err(ServiceError::UnhandledEvent(event.event_type.clone())),
        };
        effect.report(&self.workflow, event).await;
        Ok(())
    }
}

/// `checkout.session.completed`.
pub struct CheckoutSessionHandler {
    workflow: OrderWorkflow,
}

impl CheckoutSessionHandler {
    pub fn new(workflow: OrderWorkflow) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl EventHandler for CheckoutSessionHandler {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn handle(&self, event: &ExternalEvent) -> Result<(), ServiceError> {
        let session: CheckoutSessionObject = event.object()?;
        let payment_intent_id = require(&session.payment_intent, "payment intent", event)?;
        debug!(session_id = %session.id, "checkout session completed");
        advance_by_payment_intent(&self.workflow, payment_intent_id, OrderStatus::Paid)
            .await?
            .report(&self.workflow, event)
            .await;
        Ok(())
    }
}

/// `invoice.payment_succeeded` and `invoice.payment_failed`.
pub struct InvoiceHandler {
    workflow: OrderWorkflow,
}

impl InvoiceHandler {
    pub fn new(workflow: OrderWorkflow) -> Self {
        Self { workflow }
    }

    async fn succeeded(&self, invoice: &InvoiceObject) -> Result<Effect, ServiceError> {
        let workflow = &self.workflow;
        workflow
            .transactions()
            .run_retrying(IsolationProfile::RepeatableRead, |txn| async move {
                match OrderRepository.find_by_invoice(&*txn, &invoice.id).await? {
                    Some(order) => {
                        let change = workflow
                            .advance_status_in(&*txn, order, OrderStatus::Paid, None)
                            .await?;
                        Ok(Effect::changed(change))
                    }
                    None => {
                        let order = workflow
                            .create_paid_order_in(
                                &*txn,
                                PaidOrder {
                                    customer_id: invoice.customer.id().to_string(),
                                    currency: invoice.currency.clone(),
                                    total: from_minor_units(invoice.total),
                                    payment_intent_id: invoice
                                        .payment_intent
                                        .as_ref()
                                        .map(|p| p.id().to_string()),
                                    subscription_id: invoice
                                        .subscription
                                        .as_ref()
                                        .map(|s| s.id().to_string()),
                                    invoice_id: Some(invoice.id.clone()),
                                },
                            )
                            .await?;
                        Ok(Effect::created(order))
                    }
                }
            })
            .await
    }

    async fn failed(&self, invoice: &InvoiceObject) -> Result<Effect, ServiceError> {
        let workflow = &self.workflow;
        workflow
            .transactions()
            .run_retrying(IsolationProfile::RepeatableRead, |txn| async move {
                match OrderRepository.find_by_invoice(&*txn, &invoice.id).await? {
                    Some(order) => {
                        let change = workflow
                            .advance_status_in(&*txn, order, OrderStatus::Failed, None)
                            .await?;
                        Ok(Effect::changed(change))
                    }
                    None => {
                        debug!(invoice_id = %invoice.id, "no order for failed invoice");
                        Ok(Effect::default())
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl EventHandler for InvoiceHandler {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn handle(&self, event: &ExternalEvent) -> Result<(), ServiceError> {
        let kind = event.kind();
        if !matches!(
            kind,
            Some(EventKind::InvoicePaymentSucceeded | EventKind::InvoicePaymentFailed)
        ) {
            return Err(ServiceError::UnhandledEvent(event.event_type.clone()));
        }
        let invoice: InvoiceObject = event.object()?;
        let effect = if kind == Some(EventKind::InvoicePaymentSucceeded) {
            self.succeeded(&invoice).await?
        } else {
            self.failed(&invoice).await?
        };
        effect.report(&self.workflow, event).await;
        Ok(())
    }
}

/// `customer.subscription.created`, `.updated` and `.deleted`.
pub struct SubscriptionHandler {
    workflow: OrderWorkflow,
}

impl SubscriptionHandler {
    pub fn new(workflow: OrderWorkflow) -> Self {
        Self { workflow }
    }

    /// Creates the subscription's paid order unless one already exists.
    async fn ensure_order(
        &self,
        subscription: &SubscriptionObject,
        event: &ExternalEvent,
    ) -> Result<Effect, ServiceError> {
        let price = subscription
            .items
            .data
            .first()
            .map(|item| &item.price)
            .ok_or_else(|| {
                ServiceError::EventError(format!(
                    "subscription {} in event {} has no items",
                    subscription.id, event.id
                ))
            })?;
        let paid = PaidOrder {
            customer_id: subscription.customer.id().to_string(),
            currency: price.currency.clone(),
            total: from_minor_units(price.unit_amount.unwrap_or_default()),
            payment_intent_id: None,
            subscription_id: Some(subscription.id.clone()),
            invoice_id: None,
        };

        let workflow = &self.workflow;
        workflow
            .transactions()
            .run_retrying(IsolationProfile::RepeatableRead, |txn| {
                let paid = paid.clone();
                async move {
                    let existing = OrderRepository
                        .find_by_customer_subscription(
                            &*txn,
                            &paid.customer_id,
                            paid.subscription_id.as_deref().unwrap_or_default(),
                        )
                        .await?;
                    if let Some(order) = existing {
                        debug!(order_id = %order.id, "subscription already has an order");
                        return Ok(Effect::default());
                    }
                    let order = workflow.create_paid_order_in(&*txn, paid).await?;
                    Ok(Effect::created(order))
                }
            })
            .await
    }

    /// Cancels every order of the subscription that still permits it.
    async fn cancel_all(&self, subscription: &SubscriptionObject) -> Result<Effect, ServiceError> {
        let workflow = &self.workflow;
        let subscription_id = subscription.id.as_str();
        workflow
            .transactions()
            .run_retrying(IsolationProfile::RepeatableRead, |txn| async move {
                let mut effect = Effect::default();
                for order in OrderRepository
                    .find_by_subscription(&*txn, subscription_id)
                    .await?
                {
                    let (order_id, status) = (order.id, order.status);
                    match workflow.cancel_in(&*txn, order).await? {
                        Some(change) => effect.changes.push(change),
                        None => info!(
                            order_id = %order_id,
                            status = %status,
                            "order cannot be cancelled, skipping"
                        ),
                    }
                }
                Ok(effect)
            })
            .await
    }
}

#[async_trait]
impl EventHandler for SubscriptionHandler {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn handle(&self, event: &ExternalEvent) -> Result<(), ServiceError> {
        let kind = event.kind();
        let subscription: SubscriptionObject = match kind {
            Some(
                EventKind::SubscriptionCreated
                | EventKind::SubscriptionUpdated
                | EventKind::SubscriptionDeleted,
            ) => event.object()?,
            _ => return Err(ServiceError::UnhandledEvent(event.event_type.clone())),
        };

        let effect = match kind {
            Some(EventKind::SubscriptionCreated) => self.ensure_order(&subscription, event).await?,
            Some(EventKind::SubscriptionUpdated) if subscription.status == "active" => {
                self.ensure_order(&subscription, event).await?
            }
            Some(EventKind::SubscriptionUpdated) => {
                debug!(status = %subscription.status, "subscription not active, nothing to do");
                Effect::default()
            }
            _ => self.cancel_all(&subscription).await?,
        };
        effect.report(&self.workflow, event).await;
        Ok(())
    }
}

/// Builds the dispatcher with every payment lifecycle handler registered.
pub fn payment_dispatcher(workflow: OrderWorkflow) -> EventDispatcher {
    let payment_intent: Arc<dyn EventHandler> =
        Arc::new(PaymentIntentHandler::new(workflow.clone()));
    let charge: Arc<dyn EventHandler> = Arc::new(ChargeHandler::new(workflow.clone()));
    let checkout: Arc<dyn EventHandler> = Arc::new(CheckoutSessionHandler::new(workflow.clone()));
    let invoice: Arc<dyn EventHandler> = Arc::new(InvoiceHandler::new(workflow.clone()));
    let subscription: Arc<dyn EventHandler> = Arc::new(SubscriptionHandler::new(workflow));

    EventDispatcher::builder()
        .register(EventKind::PaymentIntentSucceeded, payment_intent.clone())
        .register(EventKind::PaymentIntentPaymentFailed, payment_intent.clone())
        .register(EventKind::PaymentIntentCanceled, payment_intent)
        .register(EventKind::ChargeRefunded, charge.clone())
        .register(EventKind::ChargeDisputeCreated, charge)
        .register(EventKind::CheckoutSessionCompleted, checkout)
        .register(EventKind::InvoicePaymentSucceeded, invoice.clone())
        .register(EventKind::InvoicePaymentFailed, invoice)
        .register(EventKind::SubscriptionCreated, subscription.clone())
        .register(EventKind::SubscriptionUpdated, subscription.clone())
        .register(EventKind::SubscriptionDeleted, subscription)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expandable_references_accept_ids_and_objects() {
        let bare: ChargeObject =
            serde_json::from_value(json!({"id": "ch_1", "payment_intent": "pi_1"})).unwrap();
        let expanded: ChargeObject = serde_json::from_value(
            json!({"id": "ch_2", "payment_intent": {"id": "pi_2", "amount": 100}}),
        )
        .unwrap();
        assert_eq!(bare.payment_intent.unwrap().id(), "pi_1");
        assert_eq!(expanded.payment_intent.unwrap().id(), "pi_2");
        assert_eq!(bare.amount_refunded, 0);
    }

    #[test]
    fn minor_units_become_decimals() {
        assert_eq!(from_minor_units(1999), Decimal::new(1999, 2));
        assert_eq!(from_minor_units(1999).to_string(), "19.99");
    }

    #[test]
    fn subscription_payload_reads_first_price() {
        let sub: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "items": {"data": [{"price": {"unit_amount": 500, "currency": "usd"}}]}
        }))
        .unwrap();
        assert_eq!(sub.customer.id(), "cus_1");
        assert_eq!(sub.items.data[0].price.unit_amount, Some(500));
    }
}
