use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

use crate::db::now_token;
use crate::entities::cart::{self, Entity as Cart, Model as CartModel};
use crate::entities::cart_item::{self, Entity as CartItem, Model as CartItemModel};
use crate::errors::ServiceError;
use crate::models::CartStatus;

/// Repository for carts and their lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct CartRepository;

impl CartRepository {
    pub async fn get<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        Cart::find_by_id(id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", id)))
    }

    /// Newest active cart of the customer, if any.
    pub async fn find_active_by_customer<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: &str,
    ) -> Result<Option<CartModel>, ServiceError> {
        Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .order_by_desc(cart::Column::CreatedAt)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find_expired_active<C: ConnectionTrait>(
        &self,
        conn: &C,
        now: DateTime<Utc>,
    ) -> Result<Vec<CartModel>, ServiceError> {
        Cart::find()
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .filter(cart::Column::ExpiresAt.lt(now))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: &str,
        currency: &str,
        ttl: chrono::Duration,
    ) -> Result<CartModel, ServiceError> {
        let now = now_token();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id.to_string()),
            status: Set(CartStatus::Active),
            currency: Set(currency.to_lowercase()),
            subtotal: Set(Decimal::ZERO),
            tax: Set(Decimal::ZERO),
            discount: Set(Decimal::ZERO),
            total: Set(Decimal::ZERO),
            created_at: Set(now),
            updated_at: Set(now),
            expires_at: Set(now + ttl),
        };
        cart.insert(conn).await.map_err(ServiceError::db_error)
    }

    pub async fn items<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<Vec<CartItemModel>, ServiceError> {
        CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .order_by_asc(cart_item::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn item<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartItemModel, ServiceError> {
        CartItem::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Item {} not found in cart {}", item_id, cart_id))
            })
    }

    pub async fn item_by_product<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<CartItemModel>, ServiceError> {
        CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn insert_item<C: ConnectionTrait>(
        &self,
        conn: &C,
        item: cart_item::ActiveModel,
    ) -> Result<CartItemModel, ServiceError> {
        item.insert(conn).await.map_err(ServiceError::db_error)
    }

    pub async fn set_item_quantity<C: ConnectionTrait>(
        &self,
        conn: &C,
        item: &CartItemModel,
        quantity: i64,
    ) -> Result<CartItemModel, ServiceError> {
        let mut active: cart_item::ActiveModel = item.clone().into();
        active.quantity = Set(quantity);
        active.subtotal = Set(Decimal::from(quantity) * item.unit_price);
        active.updated_at = Set(now_token());
        active.update(conn).await.map_err(ServiceError::db_error)
    }

    pub async fn remove_item<C: ConnectionTrait>(
        &self,
        conn: &C,
        item_id: Uuid,
    ) -> Result<(), ServiceError> {
        CartItem::delete_by_id(item_id)
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    pub async fn clear_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let result = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(result.rows_affected)
    }

    pub async fn update_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        status: CartStatus,
    ) -> Result<(), ServiceError> {
        Cart::update_many()
            .col_expr(cart::Column::Status, Expr::value(status))
            .col_expr(cart::Column::UpdatedAt, Expr::value(now_token()))
            .filter(cart::Column::Id.eq(cart_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Recomputes `subtotal` from the lines and `total = subtotal + tax - discount`.
    pub async fn refresh_totals<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        let cart = self.get(conn, cart_id).await?;
        let subtotal: Decimal = self
            .items(conn, cart_id)
            .await?
            .iter()
            .map(|item| item.subtotal)
            .sum();

        let mut active: cart::ActiveModel = cart.clone().into();
        active.subtotal = Set(subtotal);
        active.total = Set(subtotal + cart.tax - cart.discount);
        active.updated_at = Set(now_token());
        active.update(conn).await.map_err(ServiceError::db_error)
    }
}
