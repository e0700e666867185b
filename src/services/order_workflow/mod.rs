//! Order workflow
//!
//! Composes the transaction manager, the stock ledger and the order/cart
//! repositories. Every public operation is one transaction; stock is always
//! read through the ledger inside that transaction before it is mutated.

mod cart;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, Set};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, instrument};
use uuid::Uuid;

pub use cart::CartView;

use crate::cache::{order_key, AdvisoryCache};
use crate::db::{now_token, IsolationProfile, TransactionManager};
use crate::entities::{order, order_item, stock};
use crate::errors::ServiceError;
use crate::models::{
    allow_change_status, can_cancel, CartStatus, MovementType, NewOrder, OrderFilter,
    OrderStatus, PaidOrder, ReferenceType,
};
use crate::repositories::{CartRepository, OrderRepository};
use crate::services::stock_ledger::{
    NewStockMovement, StockAdjustment, StockLedger, StockReduction,
};

/// Time-based knobs of the workflow.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowSettings {
    pub cart_ttl: chrono::Duration,
    pub cancel_window: chrono::Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            cart_ttl: chrono::Duration::days(7),
            cancel_window: chrono::Duration::hours(24),
        }
    }
}

/// An order together with its frozen line items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Outcome of a committed-to-be status write.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub order: order::Model,
    pub previous: OrderStatus,
    /// Stock rows whose on-hand quantity was restored.
    pub restored_stock_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct OrderWorkflow {
    tx: TransactionManager,
    ledger: StockLedger,
    cache: AdvisoryCache,
    orders: OrderRepository,
    carts: CartRepository,
    settings: WorkflowSettings,
}

impl OrderWorkflow {
    pub fn new(
        tx: TransactionManager,
        ledger: StockLedger,
        cache: AdvisoryCache,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            tx,
            ledger,
            cache,
            orders: OrderRepository,
            carts: CartRepository,
            settings,
        }
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.tx
    }

    /// Turns an active cart into a pending order, consuming its reservations.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn convert_cart_to_order(&self, cart_id: Uuid) -> Result<OrderView, ServiceError> {
        let (view, stock_ids) = self
            .tx
            .run_retrying(IsolationProfile::Serializable, move |txn| async move {
                self.convert_cart_in(&*txn, cart_id).await
            })
            .await?;

        self.after_commit(&[view.order.id], &stock_ids).await;
        counter!("commerce.orders.created", 1, "source" => "cart");
        info!(order_id = %view.order.id, cart_id = %cart_id, "Cart converted to order");
        Ok(view)
    }

    async fn convert_cart_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<(OrderView, Vec<Uuid>), ServiceError> {
        let cart = self.carts.get(conn, cart_id).await?;
        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} is {} and cannot be converted",
                cart_id, cart.status
            )));
        }
        let lines = self.carts.items(conn, cart_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "Cart {} has no items",
                cart_id
            )));
        }

        let now = now_token();
        let order = self
            .orders
            .insert(
                conn,
                order::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    customer_id: Set(cart.customer_id.clone()),
                    cart_id: Set(Some(cart.id)),
                    status: Set(OrderStatus::Pending),
                    currency: Set(cart.currency.clone()),
                    subtotal: Set(cart.subtotal),
                    tax: Set(cart.tax),
                    discount: Set(cart.discount),
                    total: Set(cart.total),
                    payment_intent_id: Set(None),
                    subscription_id: Set(None),
                    invoice_id: Set(None),
                    refund_id: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                },
            )
            .await?;

        let snapshot = lines
            .iter()
            .map(|line| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                price_id: Set(line.price_id.clone()),
                stock_id: Set(line.stock_id),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                subtotal: Set(Decimal::from(line.quantity) * line.unit_price),
                created_at: Set(now),
            })
            .collect();
        self.orders.insert_items(conn, snapshot).await?;

        let demand: Vec<(Uuid, i64)> = lines.iter().map(|l| (l.stock_id, l.quantity)).collect();
        let stocks = self.load_stocks(conn, &demand).await?;
        for (stock_id, quantity) in total_by_stock(&demand) {
            let stock = &stocks[&stock_id];
            if stock.reserved_quantity < quantity || stock.quantity < quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "Stock {} holds {} reserved of {} on hand, {} required",
                    stock_id, stock.reserved_quantity, stock.quantity, quantity
                )));
            }
        }

        let reductions: Vec<StockReduction> = demand
            .iter()
            .map(|(stock_id, quantity)| StockReduction {
                stock_id: *stock_id,
                quantity: *quantity,
                expected_updated_at: stocks[stock_id].updated_at,
                from_reservation: true,
            })
            .collect();
        self.ledger
            .reduce_stock(conn, &reductions)
            .await?
            .ensure_applied()?;
        self.ledger
            .create_stock_movements(
                conn,
                &movements(&demand, MovementType::Out, ReferenceType::Order, order.id),
            )
            .await?;

        self.carts
            .update_status(conn, cart_id, CartStatus::Converted)
            .await?;

        let items = self.orders.items(conn, order.id).await?;
        Ok((OrderView { order, items }, stock_ids(&demand)))
    }

    /// Creates an order outside the cart flow. Stock is taken directly from
    /// what is available, not from a reservation.
    #[instrument(skip(self, new_order), fields(customer_id = %new_order.customer_id))]
    pub async fn create_order(&self, new_order: NewOrder) -> Result<OrderView, ServiceError> {
        new_order.check()?;

        let (view, stock_ids) = self
            .tx
            .run_retrying(IsolationProfile::RepeatableRead, |txn| {
                let new_order = new_order.clone();
                async move { self.create_order_in(&*txn, new_order).await }
            })
            .await?;

        self.after_commit(&[view.order.id], &stock_ids).await;
        counter!("commerce.orders.created", 1, "source" => "manual");
        info!(order_id = %view.order.id, "Order created");
        Ok(view)
    }

    async fn create_order_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        new_order: NewOrder,
    ) -> Result<(OrderView, Vec<Uuid>), ServiceError> {
        let demand: Vec<(Uuid, i64)> = new_order
            .items
            .iter()
            .map(|item| (item.stock_id, item.quantity))
            .collect();
        let stocks = self.load_stocks(conn, &demand).await?;
        for (stock_id, quantity) in total_by_stock(&demand) {
            let available = stocks[&stock_id].available();
            if available < quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "Stock {} has {} available, {} required",
                    stock_id, available, quantity
                )));
            }
        }

        let now = now_token();
        let order = self
            .orders
            .insert(
                conn,
                order::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    customer_id: Set(new_order.customer_id.clone()),
                    cart_id: Set(None),
                    status: Set(OrderStatus::Pending),
                    currency: Set(new_order.currency.to_lowercase()),
                    subtotal: Set(new_order.subtotal),
                    tax: Set(new_order.tax),
                    discount: Set(new_order.discount),
                    total: Set(new_order.total),
                    payment_intent_id: Set(new_order.payment_intent_id.clone()),
                    subscription_id: Set(new_order.subscription_id.clone()),
                    invoice_id: Set(new_order.invoice_id.clone()),
                    refund_id: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                },
            )
            .await?;

        let items = new_order
            .items
            .iter()
            .map(|item| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(item.product_id),
                price_id: Set(item.price_id.clone()),
                stock_id: Set(item.stock_id),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                subtotal: Set(item.subtotal),
                created_at: Set(now),
            })
            .collect();
        self.orders.insert_items(conn, items).await?;

        let reductions: Vec<StockReduction> = demand
            .iter()
            .map(|(stock_id, quantity)| StockReduction {
                stock_id: *stock_id,
                quantity: *quantity,
                expected_updated_at: stocks[stock_id].updated_at,
                from_reservation: false,
            })
            .collect();
        self.ledger
            .reduce_stock(conn, &reductions)
            .await?
            .ensure_applied()?;
        self.ledger
            .create_stock_movements(
                conn,
                &movements(&demand, MovementType::Out, ReferenceType::Order, order.id),
            )
            .await?;

        let order = self.orders.update_totals(conn, &order).await?;
        let items = self.orders.items(conn, order.id).await?;
        Ok((OrderView { order, items }, stock_ids(&demand)))
    }

    /// Reads through the advisory cache.
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let key = order_key(order_id);
        if let Some(view) = self.cache.get_json::<OrderView>(&key).await {
            return Ok(view);
        }
        let conn = self.tx.connection();
        let order = self.orders.get(conn, order_id).await?;
        let items = self.orders.items(conn, order_id).await?;
        let view = OrderView { order, items };
        self.cache.put_json(&key, &view).await;
        Ok(view)
    }

    pub async fn list_orders(
        &self,
        filter: &OrderFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<order::Model>, ServiceError> {
        self.orders
            .list(self.tx.connection(), filter, limit, offset)
            .await
    }

    /// Moves an order along the transition table. Entering `cancelled` or
    /// `refunded` puts the order's stock back on hand.
    #[instrument(skip(self), fields(order_id = %order_id, status = %status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let change = self
            .tx
            .run_retrying(IsolationProfile::RepeatableRead, move |txn| async move {
                let order = self.orders.get(&*txn, order_id).await?;
                self.apply_status_in(&*txn, order, status, None).await
            })
            .await?;

        self.finish(&change).await;
        Ok(change.order)
    }

    /// Cancels a pending order, or a processing one still inside the
    /// cancellation window, restoring its stock.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let window = self.settings.cancel_window;
        let change = self
            .tx
            .run_retrying(IsolationProfile::RepeatableRead, move |txn| async move {
                let order = self.orders.get(&*txn, order_id).await?;
                if !can_cancel(order.status, order.created_at, Utc::now(), window) {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Order {} in status {} can no longer be cancelled",
                        order.id, order.status
                    )));
                }
                self.transition_in(&*txn, order, OrderStatus::Cancelled, None)
                    .await
            })
            .await?;

        self.finish(&change).await;
        Ok(change.order)
    }

    /// Checked status write for use inside an open transaction.
    pub async fn apply_status_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: order::Model,
        status: OrderStatus,
        refund_id: Option<&str>,
    ) -> Result<StatusChange, ServiceError> {
        if !allow_change_status(order.status, status) {
            return Err(ServiceError::InvalidStatusTransition {
                from: order.status,
                to: status,
            });
        }
        self.transition_in(conn, order, status, refund_id).await
    }

    /// Like [`apply_status_in`](Self::apply_status_in), but an order already in
    /// `status` is left alone and `None` is returned.
    pub async fn advance_status_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: order::Model,
        status: OrderStatus,
        refund_id: Option<&str>,
    ) -> Result<Option<StatusChange>, ServiceError> {
        if order.status == status {
            return Ok(None);
        }
        self.apply_status_in(conn, order, status, refund_id)
            .await
            .map(Some)
    }

    /// Cancellation inside an open transaction, accepting any order the
    /// transition table or the cancellation window allows.
    pub async fn cancel_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: order::Model,
    ) -> Result<Option<StatusChange>, ServiceError> {
        let allowed = allow_change_status(order.status, OrderStatus::Cancelled)
            || can_cancel(
                order.status,
                order.created_at,
                Utc::now(),
                self.settings.cancel_window,
            );
        if !allowed {
            return Ok(None);
        }
        self.transition_in(conn, order, OrderStatus::Cancelled, None)
            .await
            .map(Some)
    }

    async fn transition_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: order::Model,
        status: OrderStatus,
        refund_id: Option<&str>,
    ) -> Result<StatusChange, ServiceError> {
        let previous = order.status;
        let updated = self
            .orders
            .update_status(conn, &order, status, refund_id)
            .await?;
        let restored_stock_ids = if status.restores_stock() {
            self.restore_order_stock(conn, &updated).await?
        } else {
            Vec::new()
        };
        Ok(StatusChange {
            order: updated,
            previous,
            restored_stock_ids,
        })
    }

    /// Returns every item's quantity to on-hand stock, one `in` movement per item.
    async fn restore_order_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &order::Model,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let items = self.orders.items(conn, order.id).await?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let demand: Vec<(Uuid, i64)> = items.iter().map(|i| (i.stock_id, i.quantity)).collect();
        let stocks = self.load_stocks(conn, &demand).await?;

        let adjustments: Vec<StockAdjustment> = demand
            .iter()
            .map(|(stock_id, quantity)| {
                StockAdjustment::restock(*stock_id, *quantity, stocks[stock_id].updated_at)
            })
            .collect();
        self.ledger
            .adjust_stock(conn, &adjustments)
            .await?
            .ensure_applied()?;
        self.ledger
            .create_stock_movements(
                conn,
                &movements(&demand, MovementType::In, ReferenceType::Order, order.id),
            )
            .await?;
        Ok(stock_ids(&demand))
    }

    /// Records an already-paid order that has no cart or items behind it.
    pub async fn create_paid_order_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        paid: PaidOrder,
    ) -> Result<order::Model, ServiceError> {
        let now = now_token();
        self.orders
            .insert(
                conn,
                order::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    customer_id: Set(paid.customer_id),
                    cart_id: Set(None),
                    status: Set(OrderStatus::Paid),
                    currency: Set(paid.currency.to_lowercase()),
                    subtotal: Set(paid.total),
                    tax: Set(Decimal::ZERO),
                    discount: Set(Decimal::ZERO),
                    total: Set(paid.total),
                    payment_intent_id: Set(paid.payment_intent_id),
                    subscription_id: Set(paid.subscription_id),
                    invoice_id: Set(paid.invoice_id),
                    refund_id: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                },
            )
            .await
    }

    /// Cache invalidation for a committed status change.
    pub async fn finish(&self, change: &StatusChange) {
        self.after_commit(&[change.order.id], &change.restored_stock_ids)
            .await;
        info!(
            order_id = %change.order.id,
            from = %change.previous,
            to = %change.order.status,
            restored = change.restored_stock_ids.len(),
            "Order status updated"
        );
    }

    /// Drops cached copies of rows a committed transaction touched.
    pub async fn after_commit(&self, order_ids: &[Uuid], stock_ids: &[Uuid]) {
        self.cache
            .invalidate(order_ids.iter().copied().map(order_key))
            .await;
        self.ledger.invalidate(stock_ids.iter().copied()).await;
    }

    /// Reads each distinct stock row once inside the current transaction.
    async fn load_stocks<C: ConnectionTrait>(
        &self,
        conn: &C,
        demand: &[(Uuid, i64)],
    ) -> Result<HashMap<Uuid, stock::Model>, ServiceError> {
        let mut stocks = HashMap::new();
        for (stock_id, _) in demand {
            if !stocks.contains_key(stock_id) {
                let stock = self.ledger.get_stock(conn, *stock_id).await?;
                stocks.insert(*stock_id, stock);
            }
        }
        Ok(stocks)
    }
}

/// Sums quantities per stock id, keeping first-seen order.
fn total_by_stock(demand: &[(Uuid, i64)]) -> Vec<(Uuid, i64)> {
    let mut totals: Vec<(Uuid, i64)> = Vec::new();
    for (stock_id, quantity) in demand {
        match totals.iter_mut().find(|(id, _)| id == stock_id) {
            Some((_, total)) => *total += quantity,
            None => totals.push((*stock_id, *quantity)),
        }
    }
    totals
}

fn stock_ids(demand: &[(Uuid, i64)]) -> Vec<Uuid> {
    total_by_stock(demand).into_iter().map(|(id, _)| id).collect()
}

fn movements(
    demand: &[(Uuid, i64)],
    movement_type: MovementType,
    reference_type: ReferenceType,
    reference_id: Uuid,
) -> Vec<NewStockMovement> {
    demand
        .iter()
        .map(|(stock_id, quantity)| NewStockMovement {
            stock_id: *stock_id,
            quantity: *quantity,
            movement_type,
            reference_type,
            reference_id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_grouped_per_stock() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            total_by_stock(&[(a, 2), (b, 1), (a, 3)]),
            vec![(a, 5), (b, 1)]
        );
        assert_eq!(stock_ids(&[(a, 2), (a, 1)]), vec![a]);
    }
}
