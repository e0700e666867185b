use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ConnectionTrait, Set};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{movements, stock_ids, total_by_stock, OrderWorkflow};
use crate::db::{now_token, IsolationProfile};
use crate::entities::{cart, cart_item};
use crate::errors::ServiceError;
use crate::models::{CartItemInput, CartStatus, MovementType, ReferenceType};
use crate::services::stock_ledger::{StockAdjustment, StockRelease};

/// A cart with its current lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartView {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
}

impl OrderWorkflow {
    #[instrument(skip(self))]
    pub async fn create_cart(
        &self,
        customer_id: &str,
        currency: &str,
    ) -> Result<cart::Model, ServiceError> {
        check_customer(customer_id, currency)?;
        let ttl = self.settings.cart_ttl;
        let cart = self
            .tx
            .run(IsolationProfile::RepeatableRead, |txn| async move {
                self.carts.create(&*txn, customer_id, currency, ttl).await
            })
            .await?;
        counter!("commerce.carts.created", 1);
        Ok(cart)
    }

    /// The customer's active cart, created when there is none.
    #[instrument(skip(self))]
    pub async fn get_or_create_active_cart(
        &self,
        customer_id: &str,
        currency: &str,
    ) -> Result<cart::Model, ServiceError> {
        check_customer(customer_id, currency)?;
        self.tx
            .run_retrying(IsolationProfile::RepeatableRead, |txn| async move {
                self.active_cart_in(&*txn, customer_id, currency).await
            })
            .await
    }

    async fn active_cart_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: &str,
        currency: &str,
    ) -> Result<cart::Model, ServiceError> {
        match self.carts.find_active_by_customer(conn, customer_id).await? {
            Some(cart) => Ok(cart),
            None => {
                self.carts
                    .create(conn, customer_id, currency, self.settings.cart_ttl)
                    .await
            }
        }
    }

    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartView, ServiceError> {
        self.cart_view(self.tx.connection(), cart_id).await
    }

    async fn cart_view<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let cart = self.carts.get(conn, cart_id).await?;
        let items = self.carts.items(conn, cart_id).await?;
        Ok(CartView { cart, items })
    }

    /// Reserves stock for each requested line and merges it into the cart.
    ///
    /// Availability is checked for the whole request before anything is
    /// written, so either every line is reserved or none is. A cart that is no
    /// longer active is swapped for the customer's active cart.
    #[instrument(skip(self, items), fields(cart_id = %cart_id, items = items.len()))]
    pub async fn add_items_to_cart(
        &self,
        cart_id: Uuid,
        items: Vec<CartItemInput>,
    ) -> Result<CartView, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "at least one item is required".to_string(),
            ));
        }
        for item in &items {
            item.check()?;
        }

        let (view, touched) = self
            .tx
            .run_retrying(IsolationProfile::RepeatableRead, |txn| {
                let items = &items;
                async move { self.add_items_in(&*txn, cart_id, items).await }
            })
            .await?;

        self.after_commit(&[], &touched).await;
        info!(cart_id = %view.cart.id, lines = view.items.len(), "Items added to cart");
        Ok(view)
    }

    async fn add_items_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        items: &[CartItemInput],
    ) -> Result<(CartView, Vec<Uuid>), ServiceError> {
        let requested = self.carts.get(conn, cart_id).await?;
        let cart = if requested.status == CartStatus::Active {
            requested
        } else {
            warn!(
                cart_id = %cart_id,
                status = %requested.status,
                "cart is not active, using the customer's active cart"
            );
            self.active_cart_in(conn, &requested.customer_id, &requested.currency)
                .await?
        };

        let demand: Vec<(Uuid, i64)> = items.iter().map(|i| (i.stock_id, i.quantity)).collect();
        let stocks = self.load_stocks(conn, &demand).await?;
        for (stock_id, quantity) in total_by_stock(&demand) {
            let available = stocks[&stock_id].available();
            if available < quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "Stock {} has {} available, {} requested",
                    stock_id, available, quantity
                )));
            }
        }

        let now = now_token();
        for item in items {
            match self
                .carts
                .item_by_product(conn, cart.id, item.product_id)
                .await?
            {
                Some(line) if line.stock_id != item.stock_id => {
                    return Err(ServiceError::ValidationError(format!(
                        "product {} is already in the cart from stock {}",
                        item.product_id, line.stock_id
                    )));
                }
                Some(line) => {
                    self.carts
                        .set_item_quantity(conn, &line, line.quantity + item.quantity)
                        .await?;
                }
                None => {
                    self.carts
                        .insert_item(
                            conn,
                            cart_item::ActiveModel {
                                id: Set(Uuid::new_v4()),
                                cart_id: Set(cart.id),
                                product_id: Set(item.product_id),
                                price_id: Set(item.price_id.clone()),
                                stock_id: Set(item.stock_id),
                                quantity: Set(item.quantity),
                                unit_price: Set(item.unit_price),
                                subtotal: Set(item.subtotal()),
                                created_at: Set(now),
                                updated_at: Set(now),
                            },
                        )
                        .await?;
                }
            }
        }

        let reservations: Vec<StockAdjustment> = demand
            .iter()
            .map(|(stock_id, quantity)| {
                StockAdjustment::reserve(*stock_id, *quantity, stocks[stock_id].updated_at)
            })
            .collect();
        self.ledger
            .adjust_stock(conn, &reservations)
            .await?
            .ensure_applied()?;
        self.ledger
            .create_stock_movements(
                conn,
                &movements(&demand, MovementType::Reserve, ReferenceType::Cart, cart.id),
            )
            .await?;

        let cart = self.carts.refresh_totals(conn, cart.id).await?;
        let items = self.carts.items(conn, cart.id).await?;
        Ok((CartView { cart, items }, stock_ids(&demand)))
    }

    /// Drops a line and releases its reservation.
    #[instrument(skip(self))]
    pub async fn remove_item_from_cart(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let (view, touched) = self
            .tx
            .run_retrying(IsolationProfile::RepeatableRead, move |txn| async move {
                self.remove_item_in(&*txn, cart_id, item_id).await
            })
            .await?;
        self.after_commit(&[], &touched).await;
        Ok(view)
    }

    async fn remove_item_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<(CartView, Vec<Uuid>), ServiceError> {
        let cart = self.carts.get(conn, cart_id).await?;
        ensure_active(&cart)?;
        let line = self.carts.item(conn, cart_id, item_id).await?;

        self.release_lines(conn, cart_id, &[(line.stock_id, line.quantity)])
            .await?;
        self.carts.remove_item(conn, line.id).await?;

        let cart = self.carts.refresh_totals(conn, cart_id).await?;
        let items = self.carts.items(conn, cart_id).await?;
        Ok((CartView { cart, items }, vec![line.stock_id]))
    }

    /// Sets a line's quantity, reserving or releasing the difference. Zero
    /// removes the line.
    #[instrument(skip(self))]
    pub async fn update_cart_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<CartView, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "quantity cannot be negative".to_string(),
            ));
        }
        let (view, touched) = self
            .tx
            .run_retrying(IsolationProfile::RepeatableRead, move |txn| async move {
                if quantity == 0 {
                    self.remove_item_in(&*txn, cart_id, item_id).await
                } else {
                    self.set_quantity_in(&*txn, cart_id, item_id, quantity)
                        .await
                }
            })
            .await?;
        self.after_commit(&[], &touched).await;
        Ok(view)
    }

    async fn set_quantity_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<(CartView, Vec<Uuid>), ServiceError> {
        let cart = self.carts.get(conn, cart_id).await?;
        ensure_active(&cart)?;
        let line = self.carts.item(conn, cart_id, item_id).await?;
        let delta = quantity - line.quantity;

        if delta > 0 {
            let stock = self.ledger.get_stock(conn, line.stock_id).await?;
            if stock.available() < delta {
                return Err(ServiceError::InsufficientStock(format!(
                    "Stock {} has {} available, {} more requested",
                    stock.id,
                    stock.available(),
                    delta
                )));
            }
            self.ledger
                .adjust_stock(
                    conn,
                    &[StockAdjustment::reserve(stock.id, delta, stock.updated_at)],
                )
                .await?
                .ensure_applied()?;
            self.ledger
                .create_stock_movements(
                    conn,
                    &movements(
                        &[(stock.id, delta)],
                        MovementType::Reserve,
                        ReferenceType::Cart,
                        cart_id,
                    ),
                )
                .await?;
        } else if delta < 0 {
            self.release_lines(conn, cart_id, &[(line.stock_id, -delta)])
                .await?;
        }

        if delta != 0 {
            self.carts.set_item_quantity(conn, &line, quantity).await?;
        }
        let cart = self.carts.refresh_totals(conn, cart_id).await?;
        let items = self.carts.items(conn, cart_id).await?;
        Ok((CartView { cart, items }, vec![line.stock_id]))
    }

    /// Releases every reservation, empties the cart and moves it to `status`,
    /// which must be `active` or `abandoned`.
    #[instrument(skip(self))]
    pub async fn clear_cart(
        &self,
        cart_id: Uuid,
        status: CartStatus,
    ) -> Result<CartView, ServiceError> {
        if status == CartStatus::Converted {
            return Err(ServiceError::ValidationError(
                "a cart can only be converted through checkout".to_string(),
            ));
        }
        let (view, touched) = self
            .tx
            .run_retrying(IsolationProfile::RepeatableRead, move |txn| async move {
                self.clear_cart_in(&*txn, cart_id, status).await
            })
            .await?;
        self.after_commit(&[], &touched).await;
        Ok(view)
    }

    async fn clear_cart_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        status: CartStatus,
    ) -> Result<(CartView, Vec<Uuid>), ServiceError> {
        let cart = self.carts.get(conn, cart_id).await?;
        ensure_active(&cart)?;
        let lines = self.carts.items(conn, cart_id).await?;
        let held: Vec<(Uuid, i64)> = lines.iter().map(|l| (l.stock_id, l.quantity)).collect();

        self.release_lines(conn, cart_id, &held).await?;
        self.carts.clear_items(conn, cart_id).await?;
        if status != cart.status {
            self.carts.update_status(conn, cart_id, status).await?;
        }

        let cart = self.carts.refresh_totals(conn, cart_id).await?;
        Ok((
            CartView {
                cart,
                items: Vec::new(),
            },
            stock_ids(&held),
        ))
    }

    /// Abandons every active cart whose `expires_at` is before `now`,
    /// releasing its reservations. Each cart is its own transaction; one that
    /// fails is logged and skipped.
    #[instrument(skip(self))]
    pub async fn abandon_expired_carts(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let expired = self
            .carts
            .find_expired_active(self.tx.connection(), now)
            .await?;

        let mut abandoned = 0;
        for cart in expired {
            match self.clear_cart(cart.id, CartStatus::Abandoned).await {
                Ok(_) => abandoned += 1,
                Err(e) => warn!(cart_id = %cart.id, error = %e, "failed to abandon expired cart"),
            }
        }
        if abandoned > 0 {
            counter!("commerce.carts.abandoned", abandoned as u64);
            info!(count = abandoned, "Expired carts abandoned");
        }
        Ok(abandoned)
    }

    /// Returns reserved units to availability, one `release` movement per line.
    async fn release_lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart_id: Uuid,
        held: &[(Uuid, i64)],
    ) -> Result<(), ServiceError> {
        if held.is_empty() {
            return Ok(());
        }
        let stocks = self.load_stocks(conn, held).await?;
        let releases: Vec<StockRelease> = held
            .iter()
            .map(|(stock_id, quantity)| StockRelease {
                stock_id: *stock_id,
                quantity: *quantity,
                expected_updated_at: stocks[stock_id].updated_at,
            })
            .collect();
        self.ledger
            .release_stock(conn, &releases)
            .await?
            .ensure_applied()?;
        self.ledger
            .create_stock_movements(
                conn,
                &movements(held, MovementType::Release, ReferenceType::Cart, cart_id),
            )
            .await
    }
}

fn ensure_active(cart: &cart::Model) -> Result<(), ServiceError> {
    if cart.status == CartStatus::Active {
        Ok(())
    } else {
        Err(ServiceError::InvalidOperation(format!(
            "Cart {} is {}",
            cart.id, cart.status
        )))
    }
}

fn check_customer(customer_id: &str, currency: &str) -> Result<(), ServiceError> {
    if customer_id.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "customer id is required".to_string(),
        ));
    }
    if currency.len() != 3 {
        return Err(ServiceError::ValidationError(format!(
            "currency {:?} is not a three-letter code",
            currency
        )));
    }
    Ok(())
}
