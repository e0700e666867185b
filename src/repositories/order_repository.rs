use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use uuid::Uuid;

use crate::db::next_token;
use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, Model as OrderModel,
};
use crate::entities::order_item::{
    self, ActiveModel as OrderItemActiveModel, Entity as OrderItem, Model as OrderItemModel,
};
use crate::errors::ServiceError;
use crate::models::{OrderFilter, OrderStatus};

/// Repository for order operations
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderRepository;

impl OrderRepository {
    /// Find an order by ID
    pub async fn find_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Like [`find_by_id`](Self::find_by_id) but a miss is an error.
    pub async fn get<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<OrderModel, ServiceError> {
        self.find_by_id(conn, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))
    }

    pub async fn find_by_payment_intent<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_intent_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::PaymentIntentId.eq(payment_intent_id))
            .order_by_desc(Column::CreatedAt)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find_by_invoice<C: ConnectionTrait>(
        &self,
        conn: &C,
        invoice_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::InvoiceId.eq(invoice_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find_by_customer_subscription<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::CustomerId.eq(customer_id))
            .filter(Column::SubscriptionId.eq(subscription_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find_by_subscription<C: ConnectionTrait>(
        &self,
        conn: &C,
        subscription_id: &str,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::SubscriptionId.eq(subscription_id))
            .order_by_asc(Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Orders newest first.
    pub async fn list<C: ConnectionTrait>(
        &self,
        conn: &C,
        filter: &OrderFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        let mut query = Order::find();
        if let Some(customer_id) = &filter.customer_id {
            query = query.filter(Column::CustomerId.eq(customer_id.as_str()));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }
        query
            .order_by_desc(Column::CreatedAt)
            .limit(limit)
            .offset(offset)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: OrderActiveModel,
    ) -> Result<OrderModel, ServiceError> {
        let id = match &order.id {
            sea_orm::ActiveValue::Set(id) | sea_orm::ActiveValue::Unchanged(id) => *id,
            sea_orm::ActiveValue::NotSet => {
                return Err(ServiceError::InternalError("order id not set".to_string()))
            }
        };
        Order::insert(order)
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::db_error)?;
        self.get(conn, id).await
    }

    pub async fn insert_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        items: Vec<OrderItemActiveModel>,
    ) -> Result<(), ServiceError> {
        if items.is_empty() {
            return Ok(());
        }
        OrderItem::insert_many(items)
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    pub async fn items<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<OrderItemModel>, ServiceError> {
        OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .order_by_asc(order_item::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Writes `status` (and `refund_id` when given) only if the row still carries
    /// `order.updated_at`. A stale read surfaces as `ConcurrentModification`.
    pub async fn update_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &OrderModel,
        status: OrderStatus,
        refund_id: Option<&str>,
    ) -> Result<OrderModel, ServiceError> {
        let token = next_token(order.updated_at);
        let mut update = Order::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::UpdatedAt, Expr::value(token));
        if let Some(refund_id) = refund_id {
            update = update.col_expr(Column::RefundId, Expr::value(refund_id));
        }
        let result = update
            .filter(Column::Id.eq(order.id))
            .filter(Column::UpdatedAt.eq(order.updated_at))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }
        self.get(conn, order.id).await
    }

    /// Re-derives subtotal and total from the stored items.
    pub async fn update_totals<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &OrderModel,
    ) -> Result<OrderModel, ServiceError> {
        let items = self.items(conn, order.id).await?;
        let subtotal: Decimal = items.iter().map(|item| item.subtotal).sum();
        let total = subtotal + order.tax - order.discount;
        let token: DateTime<Utc> = next_token(order.updated_at);

        let result = Order::update_many()
            .col_expr(Column::Subtotal, Expr::value(subtotal))
            .col_expr(Column::Total, Expr::value(total))
            .col_expr(Column::UpdatedAt, Expr::value(token))
            .filter(Column::Id.eq(order.id))
            .filter(Column::UpdatedAt.eq(order.updated_at))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }
        self.get(conn, order.id).await
    }
}
