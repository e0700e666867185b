//! Stock ledger
//!
//! Owns `stocks` and `stock_movements`. Every quantity mutation is batched and
//! optimistic: an item only applies when the row still carries the
//! `updated_at` token the caller read, otherwise it is reported as stale.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cache::{stock_key, AdvisoryCache};
use crate::db::{next_token, now_token};
use crate::entities::stock::{self, Entity as Stock, Model as StockModel};
use crate::entities::stock_movement::{self, Entity as StockMovement, Model as MovementModel};
use crate::errors::ServiceError;
use crate::models::{MovementType, ReferenceType};

/// Change of reservation (and optionally on-hand quantity) for one stock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockAdjustment {
    pub stock_id: Uuid,
    /// Added to `reserved_quantity`; may be negative.
    pub delta_reserved: i64,
    /// Added to `quantity`; zero for pure reservation changes.
    pub delta_quantity: i64,
    pub expected_updated_at: DateTime<Utc>,
}

impl StockAdjustment {
    pub fn reserve(stock_id: Uuid, quantity: i64, expected_updated_at: DateTime<Utc>) -> Self {
        Self {
            stock_id,
            delta_reserved: quantity,
            delta_quantity: 0,
            expected_updated_at,
        }
    }

    /// Puts `quantity` units back on hand.
    pub fn restock(stock_id: Uuid, quantity: i64, expected_updated_at: DateTime<Utc>) -> Self {
        Self {
            stock_id,
            delta_reserved: 0,
            delta_quantity: quantity,
            expected_updated_at,
        }
    }
}

/// Decrement of `reserved_quantity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockRelease {
    pub stock_id: Uuid,
    pub quantity: i64,
    pub expected_updated_at: DateTime<Utc>,
}

/// Permanent removal of on-hand stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockReduction {
    pub stock_id: Uuid,
    pub quantity: i64,
    pub expected_updated_at: DateTime<Utc>,
    /// Consume a reservation too (cart conversion), or only on-hand stock.
    pub from_reservation: bool,
}

#[derive(Debug, Clone)]
pub struct NewStockMovement {
    pub stock_id: Uuid,
    pub quantity: i64,
    pub movement_type: MovementType,
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
}

/// Per-item result of a batched mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Applied {
        stock_id: Uuid,
        updated_at: DateTime<Utc>,
    },
    /// The row's token no longer matched; nothing was written for this item.
    Stale { stock_id: Uuid },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub items: Vec<ItemOutcome>,
}

impl BatchOutcome {
    pub fn stale_ids(&self) -> Vec<Uuid> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ItemOutcome::Stale { stock_id } => Some(*stock_id),
                ItemOutcome::Applied { .. } => None,
            })
            .collect()
    }

    pub fn is_fully_applied(&self) -> bool {
        self.stale_ids().is_empty()
    }

    /// Turns the first stale item into a `ConcurrentModification` error.
    pub fn ensure_applied(self) -> Result<Self, ServiceError> {
        match self.stale_ids().first() {
            Some(stock_id) => {
                counter!("commerce.stock.conflicts", 1);
                Err(ServiceError::ConcurrentModification(*stock_id))
            }
            None => Ok(self),
        }
    }

    /// Newest token written per stock id.
    pub fn tokens(&self) -> HashMap<Uuid, DateTime<Utc>> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ItemOutcome::Applied {
                    stock_id,
                    updated_at,
                } => Some((*stock_id, *updated_at)),
                ItemOutcome::Stale { .. } => None,
            })
            .collect()
    }
}

/// Snapshot kept in the advisory cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockSnapshot {
    pub id: Uuid,
    pub product_id: Uuid,
    pub quantity: i64,
    pub reserved_quantity: i64,
    pub location: String,
    pub updated_at: DateTime<Utc>,
}

impl From<StockModel> for StockSnapshot {
    fn from(model: StockModel) -> Self {
        Self {
            id: model.id,
            product_id: model.product_id,
            quantity: model.quantity,
            reserved_quantity: model.reserved_quantity,
            location: model.location,
            updated_at: model.updated_at,
        }
    }
}

/// Threads tokens through a batch so several items for the same row chain
/// onto each other instead of conflicting with themselves.
#[derive(Default)]
struct TokenChain {
    written: HashMap<Uuid, (DateTime<Utc>, DateTime<Utc>)>,
}

impl TokenChain {
    fn expected(&self, stock_id: Uuid, caller_token: DateTime<Utc>) -> DateTime<Utc> {
        match self.written.get(&stock_id) {
            Some((read, written)) if *read == caller_token => *written,
            _ => caller_token,
        }
    }

    fn record(&mut self, stock_id: Uuid, caller_token: DateTime<Utc>, written: DateTime<Utc>) {
        let read = self
            .written
            .get(&stock_id)
            .map(|(read, _)| *read)
            .unwrap_or(caller_token);
        self.written.insert(stock_id, (read, written));
    }
}

#[derive(Clone)]
pub struct StockLedger {
    cache: AdvisoryCache,
}

impl StockLedger {
    pub fn new(cache: AdvisoryCache) -> Self {
        Self { cache }
    }

    /// Creates a stock row with nothing reserved.
    #[instrument(skip(self, conn))]
    pub async fn create_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        location: &str,
        quantity: i64,
    ) -> Result<StockModel, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "initial stock quantity cannot be negative".to_string(),
            ));
        }
        let now = now_token();
        stock::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            quantity: Set(quantity),
            reserved_quantity: Set(0),
            location: Set(location.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    /// Point lookup. The returned `updated_at` is the token for the next mutation.
    pub async fn get_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        stock_id: Uuid,
    ) -> Result<StockModel, ServiceError> {
        Stock::find_by_id(stock_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Stock {} not found", stock_id)))
    }

    /// Cache-aside read for callers outside a transaction. Never use the
    /// result as a concurrency token.
    pub async fn stock_snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        stock_id: Uuid,
    ) -> Result<StockSnapshot, ServiceError> {
        let key = stock_key(stock_id);
        if let Some(snapshot) = self.cache.get_json::<StockSnapshot>(&key).await {
            return Ok(snapshot);
        }
        let snapshot = StockSnapshot::from(self.get_stock(conn, stock_id).await?);
        self.cache.put_json(&key, &snapshot).await;
        Ok(snapshot)
    }

    /// Drops cached snapshots after a committed mutation.
    pub async fn invalidate(&self, stock_ids: impl IntoIterator<Item = Uuid>) {
        self.cache
            .invalidate(stock_ids.into_iter().map(stock_key))
            .await;
    }

    /// Adds `delta_reserved` to `reserved_quantity` and `delta_quantity` to
    /// `quantity` for every item whose token still matches.
    #[instrument(skip(self, conn, items), fields(items = items.len()))]
    pub async fn adjust_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        items: &[StockAdjustment],
    ) -> Result<BatchOutcome, ServiceError> {
        let mut chain = TokenChain::default();
        let mut outcome = BatchOutcome::default();

        for item in items {
            let expected = chain.expected(item.stock_id, item.expected_updated_at);
            let token = next_token(expected);
            let result = Stock::update_many()
                .col_expr(
                    stock::Column::ReservedQuantity,
                    Expr::col(stock::Column::ReservedQuantity).add(item.delta_reserved),
                )
                .col_expr(
                    stock::Column::Quantity,
                    Expr::col(stock::Column::Quantity).add(item.delta_quantity),
                )
                .col_expr(stock::Column::UpdatedAt, Expr::value(token))
                .filter(stock::Column::Id.eq(item.stock_id))
                .filter(stock::Column::UpdatedAt.eq(expected))
                .exec(conn)
                .await
                .map_err(ServiceError::db_error)?;

            outcome.items.push(Self::record(
                &mut chain,
                item.stock_id,
                item.expected_updated_at,
                token,
                result.rows_affected,
            ));
        }
        Ok(outcome)
    }

    /// Decrements `reserved_quantity` for every item whose token still matches.
    #[instrument(skip(self, conn, items), fields(items = items.len()))]
    pub async fn release_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        items: &[StockRelease],
    ) -> Result<BatchOutcome, ServiceError> {
        let mut chain = TokenChain::default();
        let mut outcome = BatchOutcome::default();

        for item in items {
            let expected = chain.expected(item.stock_id, item.expected_updated_at);
            let token = next_token(expected);
            let result = Stock::update_many()
                .col_expr(
                    stock::Column::ReservedQuantity,
                    Expr::col(stock::Column::ReservedQuantity).sub(item.quantity),
                )
                .col_expr(stock::Column::UpdatedAt, Expr::value(token))
                .filter(stock::Column::Id.eq(item.stock_id))
                .filter(stock::Column::UpdatedAt.eq(expected))
                .exec(conn)
                .await
                .map_err(ServiceError::db_error)?;

            outcome.items.push(Self::record(
                &mut chain,
                item.stock_id,
                item.expected_updated_at,
                token,
                result.rows_affected,
            ));
        }
        Ok(outcome)
    }

    /// Decrements `quantity`, and `reserved_quantity` as well for items taken
    /// from a reservation.
    #[instrument(skip(self, conn, items), fields(items = items.len()))]
    pub async fn reduce_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        items: &[StockReduction],
    ) -> Result<BatchOutcome, ServiceError> {
        let mut chain = TokenChain::default();
        let mut outcome = BatchOutcome::default();

        for item in items {
            let expected = chain.expected(item.stock_id, item.expected_updated_at);
            let token = next_token(expected);
            let reserved_delta = if item.from_reservation {
                item.quantity
            } else {
                0
            };
            let result = Stock::update_many()
                .col_expr(
                    stock::Column::Quantity,
                    Expr::col(stock::Column::Quantity).sub(item.quantity),
                )
                .col_expr(
                    stock::Column::ReservedQuantity,
                    Expr::col(stock::Column::ReservedQuantity).sub(reserved_delta),
                )
                .col_expr(stock::Column::UpdatedAt, Expr::value(token))
                .filter(stock::Column::Id.eq(item.stock_id))
                .filter(stock::Column::UpdatedAt.eq(expected))
                .exec(conn)
                .await
                .map_err(ServiceError::db_error)?;

            outcome.items.push(Self::record(
                &mut chain,
                item.stock_id,
                item.expected_updated_at,
                token,
                result.rows_affected,
            ));
        }
        Ok(outcome)
    }

    fn record(
        chain: &mut TokenChain,
        stock_id: Uuid,
        caller_token: DateTime<Utc>,
        written: DateTime<Utc>,
        rows_affected: u64,
    ) -> ItemOutcome {
        if rows_affected == 0 {
            warn!(stock_id = %stock_id, "stale stock token, item skipped");
            ItemOutcome::Stale { stock_id }
        } else {
            chain.record(stock_id, caller_token, written);
            ItemOutcome::Applied {
                stock_id,
                updated_at: written,
            }
        }
    }

    /// Appends one audit row per item. Must run in the same transaction as the
    /// mutation it describes.
    #[instrument(skip(self, conn, items), fields(items = items.len()))]
    pub async fn create_stock_movements<C: ConnectionTrait>(
        &self,
        conn: &C,
        items: &[NewStockMovement],
    ) -> Result<(), ServiceError> {
        if items.is_empty() {
            return Ok(());
        }
        let now = now_token();
        let rows = items.iter().map(|item| stock_movement::ActiveModel {
            id: Set(Uuid::new_v4()),
            stock_id: Set(item.stock_id),
            quantity: Set(item.quantity),
            movement_type: Set(item.movement_type),
            reference_type: Set(item.reference_type),
            reference_id: Set(item.reference_id),
            created_at: Set(now),
        });
        StockMovement::insert_many(rows)
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::db_error)?;
        debug!(count = items.len(), "stock movements recorded");
        Ok(())
    }

    /// Movements newest first.
    pub async fn list_stock_movements<C: ConnectionTrait>(
        &self,
        conn: &C,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<MovementModel>, ServiceError> {
        StockMovement::find()
            .order_by_desc(stock_movement::Column::CreatedAt)
            .order_by_desc(stock_movement::Column::Id)
            .limit(limit)
            .offset(offset)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn movements_by_reference<C: ConnectionTrait>(
        &self,
        conn: &C,
        reference_type: ReferenceType,
        reference_id: Uuid,
    ) -> Result<Vec<MovementModel>, ServiceError> {
        StockMovement::find()
            .filter(stock_movement::Column::ReferenceType.eq(reference_type))
            .filter(stock_movement::Column::ReferenceId.eq(reference_id))
            .order_by_asc(stock_movement::Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn movements_for_stock<C: ConnectionTrait>(
        &self,
        conn: &C,
        stock_id: Uuid,
    ) -> Result<Vec<MovementModel>, ServiceError> {
        StockMovement::find()
            .filter(stock_movement::Column::StockId.eq(stock_id))
            .order_by_asc(stock_movement::Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, sync_schema, DbConfig};
    use assert_matches::assert_matches;
    use chrono::Duration as ChronoDuration;
    use sea_orm::DatabaseConnection;
    use std::time::Duration;

    async fn setup() -> (DatabaseConnection, StockLedger) {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .expect("connect");
        sync_schema(&db).await.expect("schema");
        (db, StockLedger::new(AdvisoryCache::in_memory(Duration::from_secs(60))))
    }

    #[tokio::test]
    async fn adjust_applies_with_fresh_token() {
        let (db, ledger) = setup().await;
        let stock = ledger
            .create_stock(&db, Uuid::new_v4(), "main", 10)
            .await
            .unwrap();

        let outcome = ledger
            .adjust_stock(&db, &[StockAdjustment::reserve(stock.id, 3, stock.updated_at)])
            .await
            .unwrap()
            .ensure_applied()
            .unwrap();

        let after = ledger.get_stock(&db, stock.id).await.unwrap();
        assert_eq!((after.quantity, after.reserved_quantity), (10, 3));
        assert!(after.updated_at > stock.updated_at);
        assert_eq!(outcome.tokens().get(&stock.id), Some(&after.updated_at));
    }

    #[tokio::test]
    async fn stale_tokens_leave_rows_untouched() {
        let (db, ledger) = setup().await;
        let stock = ledger
            .create_stock(&db, Uuid::new_v4(), "main", 10)
            .await
            .unwrap();
        let stale = stock.updated_at - ChronoDuration::seconds(1);

        let adjust = ledger
            .adjust_stock(&db, &[StockAdjustment::reserve(stock.id, 2, stale)])
            .await
            .unwrap();
        assert_eq!(adjust.stale_ids(), vec![stock.id]);
        assert_matches!(
            adjust.ensure_applied(),
            Err(ServiceError::ConcurrentModification(id)) if id == stock.id
        );

        let release = ledger
            .release_stock(
                &db,
                &[StockRelease {
                    stock_id: stock.id,
                    quantity: 1,
                    expected_updated_at: stale,
                }],
            )
            .await
            .unwrap();
        assert!(!release.is_fully_applied());

        let reduce = ledger
            .reduce_stock(
                &db,
                &[StockReduction {
                    stock_id: stock.id,
                    quantity: 1,
                    expected_updated_at: stale,
                    from_reservation: false,
                }],
            )
            .await
            .unwrap();
        assert!(!reduce.is_fully_applied());

        let after = ledger.get_stock(&db, stock.id).await.unwrap();
        assert_eq!(after, stock);
    }

    #[tokio::test]
    async fn repeated_stock_ids_chain_within_a_batch() {
        let (db, ledger) = setup().await;
        let stock = ledger
            .create_stock(&db, Uuid::new_v4(), "main", 10)
            .await
            .unwrap();

        ledger
            .adjust_stock(
                &db,
                &[
                    StockAdjustment::reserve(stock.id, 2, stock.updated_at),
                    StockAdjustment::reserve(stock.id, 3, stock.updated_at),
                ],
            )
            .await
            .unwrap()
            .ensure_applied()
            .unwrap();

        let after = ledger.get_stock(&db, stock.id).await.unwrap();
        assert_eq!(after.reserved_quantity, 5);
    }

    #[tokio::test]
    async fn reduce_from_reservation_consumes_both_counters() {
        let (db, ledger) = setup().await;
        let stock = ledger
            .create_stock(&db, Uuid::new_v4(), "main", 10)
            .await
            .unwrap();
        let reserved = ledger
            .adjust_stock(&db, &[StockAdjustment::reserve(stock.id, 4, stock.updated_at)])
            .await
            .unwrap()
            .ensure_applied()
            .unwrap();
        let token = reserved.tokens()[&stock.id];

        ledger
            .reduce_stock(
                &db,
                &[StockReduction {
                    stock_id: stock.id,
                    quantity: 4,
                    expected_updated_at: token,
                    from_reservation: true,
                }],
            )
            .await
            .unwrap()
            .ensure_applied()
            .unwrap();

        let after = ledger.get_stock(&db, stock.id).await.unwrap();
        assert_eq!((after.quantity, after.reserved_quantity), (6, 0));
    }

    #[tokio::test]
    async fn movements_are_queryable_by_reference() {
        let (db, ledger) = setup().await;
        let stock = ledger
            .create_stock(&db, Uuid::new_v4(), "main", 10)
            .await
            .unwrap();
        let cart_id = Uuid::new_v4();

        ledger
            .create_stock_movements(
                &db,
                &[
                    NewStockMovement {
                        stock_id: stock.id,
                        quantity: 2,
                        movement_type: MovementType::Reserve,
                        reference_type: ReferenceType::Cart,
                        reference_id: cart_id,
                    },
                    NewStockMovement {
                        stock_id: stock.id,
                        quantity: 5,
                        movement_type: MovementType::In,
                        reference_type: ReferenceType::Adjustment,
                        reference_id: Uuid::new_v4(),
                    },
                ],
            )
            .await
            .unwrap();

        let for_cart = ledger
            .movements_by_reference(&db, ReferenceType::Cart, cart_id)
            .await
            .unwrap();
        assert_eq!(for_cart.len(), 1);
        assert_eq!(for_cart[0].movement_type, MovementType::Reserve);

        assert_eq!(ledger.list_stock_movements(&db, 10, 0).await.unwrap().len(), 2);
        assert_eq!(ledger.list_stock_movements(&db, 10, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshots_are_invalidated() {
        let (db, ledger) = setup().await;
        let stock = ledger
            .create_stock(&db, Uuid::new_v4(), "main", 10)
            .await
            .unwrap();
        assert_eq!(ledger.stock_snapshot(&db, stock.id).await.unwrap().quantity, 10);

        ledger
            .adjust_stock(&db, &[StockAdjustment::restock(stock.id, 5, stock.updated_at)])
            .await
            .unwrap()
            .ensure_applied()
            .unwrap();
        // Still served from cache until invalidated.
        assert_eq!(ledger.stock_snapshot(&db, stock.id).await.unwrap().quantity, 10);

        ledger.invalidate([stock.id]).await;
        assert_eq!(ledger.stock_snapshot(&db, stock.id).await.unwrap().quantity, 15);
    }
}
