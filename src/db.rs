pub mod transaction;

use crate::config::AppConfig;
use crate::entities::{cart, cart_item, order, order_item, processed_event, stock, stock_movement};
use crate::errors::ServiceError;
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use metrics::{counter, gauge};
use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema,
};
use std::time::Duration;
use tracing::{debug, error, info};

pub use transaction::{IsolationProfile, RetryPolicy, TransactionManager};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connections older than this are recycled
    pub max_lifetime: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            max_lifetime: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: 1,
            max_lifetime: Duration::from_secs(cfg.db_max_lifetime_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool to the database with custom configuration
///
/// # Errors
/// Returns a `ServiceError` if the connection cannot be established
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(config.max_lifetime)
        .acquire_timeout(config.acquire_timeout)
        .sqlx_logging(false);

    gauge!("commerce.db.max_connections", config.max_connections as f64);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt).await.map_err(|e| {
        error!("Database connection failed: {}", e);
        counter!("commerce.db.connection_failures", 1);
        ServiceError::db_error(e)
    })?;

    info!("Database connection pool established successfully");
    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Creates every table and lookup index that does not exist yet.
pub async fn sync_schema(db: &DbPool) -> Result<(), ServiceError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let tables = [
        schema.create_table_from_entity(stock::Entity),
        schema.create_table_from_entity(stock_movement::Entity),
        schema.create_table_from_entity(cart::Entity),
        schema.create_table_from_entity(cart_item::Entity),
        schema.create_table_from_entity(order::Entity),
        schema.create_table_from_entity(order_item::Entity),
        schema.create_table_from_entity(processed_event::Entity),
    ];
    for mut table in tables {
        table.if_not_exists();
        db.execute(backend.build(&table))
            .await
            .map_err(ServiceError::db_error)?;
    }

    for index in lookup_indexes() {
        db.execute(backend.build(&index))
            .await
            .map_err(ServiceError::db_error)?;
    }

    info!("Database schema is in sync");
    Ok(())
}

fn lookup_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name("idx_stock_movements_reference")
            .table(stock_movement::Entity)
            .col(stock_movement::Column::ReferenceType)
            .col(stock_movement::Column::ReferenceId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_carts_customer_status")
            .table(cart::Entity)
            .col(cart::Column::CustomerId)
            .col(cart::Column::Status)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_cart_items_cart")
            .table(cart_item::Entity)
            .col(cart_item::Column::CartId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_orders_payment_intent")
            .table(order::Entity)
            .col(order::Column::PaymentIntentId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_orders_invoice")
            .table(order::Entity)
            .col(order::Column::InvoiceId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_orders_subscription")
            .table(order::Entity)
            .col(order::Column::CustomerId)
            .col(order::Column::SubscriptionId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_order_items_order")
            .table(order_item::Entity)
            .col(order_item::Column::OrderId)
            .if_not_exists()
            .to_owned(),
    ]
}

/// Current time at the precision the store keeps for concurrency tokens.
pub fn now_token() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Token written by a mutation that observed `previous`.
///
/// Always strictly later than `previous`, so two writes inside the same
/// microsecond still invalidate each other's reads.
pub fn next_token(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_token();
    let bumped = previous + ChronoDuration::microseconds(1);
    if now > bumped {
        now
    } else {
        bumped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_token_always_moves_forward() {
        let future = Utc::now().trunc_subsecs(6) + ChronoDuration::seconds(60);
        assert_eq!(next_token(future), future + ChronoDuration::microseconds(1));

        let past = now_token() - ChronoDuration::seconds(60);
        let token = next_token(past);
        assert!(token > past);
        assert_eq!(token, token.trunc_subsecs(6));
    }
}
