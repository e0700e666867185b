#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use tempfile::TempDir;
use stateset_commerce::{
    cache::AdvisoryCache,
    config::AppConfig,
    db,
    entities::{stock, stock_movement},
    events::ExternalEvent,
    models::{CartItemInput, NewOrder, NewOrderItem, OrderStatus},
    services::{OrderView, OrderWorkflow},
    AppState,
};
use uuid::Uuid;

/// Application state over a private SQLite database.
pub struct TestApp {
    pub state: AppState,
    _dir: Option<TempDir>,
}

impl TestApp {
    /// In-memory database behind a single connection.
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:");
        // One connection keeps every query on the same in-memory database.
        cfg.db_max_connections = 1;
        Self::with_config(cfg, None).await
    }

    /// File-backed database shared by `connections` pooled connections, so
    /// transactions really overlap.
    pub async fn with_connections(connections: u32) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("commerce.db").display()
        );
        let mut cfg = AppConfig::new(&url);
        cfg.db_max_connections = connections;
        Self::with_config(cfg, Some(dir)).await
    }

    async fn with_config(mut cfg: AppConfig, dir: Option<TempDir>) -> Self {
        cfg.tx_backoff_ms = 1;
        cfg.worker_pool_size = 4;
        cfg.task_queue_capacity = 16;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::sync_schema(&pool)
            .await
            .expect("failed to create test schema");

        let cache = AdvisoryCache::in_memory(Duration::from_secs(60));
        Self {
            state: AppState::with_cache(Arc::new(pool), cfg, cache),
            _dir: dir,
        }
    }

    pub fn workflow(&self) -> &OrderWorkflow {
        &self.state.workflow
    }

    pub async fn seed_stock(&self, quantity: i64) -> stock::Model {
        self.state
            .ledger
            .create_stock(self.state.db.as_ref(), Uuid::new_v4(), "main", quantity)
            .await
            .expect("failed to seed stock")
    }

    pub async fn stock(&self, stock_id: Uuid) -> stock::Model {
        self.state
            .ledger
            .get_stock(self.state.db.as_ref(), stock_id)
            .await
            .expect("stock should exist")
    }

    pub async fn movements(&self, stock_id: Uuid) -> Vec<stock_movement::Model> {
        self.state
            .ledger
            .movements_for_stock(self.state.db.as_ref(), stock_id)
            .await
            .expect("failed to list movements")
    }

    /// A pending order for `quantity` units of `stock`, paid through `payment_intent`,
    /// then moved to `paid`.
    pub async fn paid_order(
        &self,
        stock: &stock::Model,
        quantity: i64,
        unit_price: Decimal,
        payment_intent: &str,
    ) -> OrderView {
        let view = self
            .workflow()
            .create_order(new_order(stock, quantity, unit_price, Some(payment_intent)))
            .await
            .expect("failed to create order");
        self.workflow()
            .update_order_status(view.order.id, OrderStatus::Paid)
            .await
            .expect("failed to mark order paid");
        self.workflow()
            .get_order(view.order.id)
            .await
            .expect("order should exist")
    }
}

pub fn line(stock: &stock::Model, quantity: i64, unit_price: Decimal) -> CartItemInput {
    CartItemInput {
        product_id: stock.product_id,
        price_id: format!("price_{}", stock.product_id.simple()),
        stock_id: stock.id,
        quantity,
        unit_price,
    }
}

pub fn new_order(
    stock: &stock::Model,
    quantity: i64,
    unit_price: Decimal,
    payment_intent: Option<&str>,
) -> NewOrder {
    let subtotal = Decimal::from(quantity) * unit_price;
    NewOrder {
        customer_id: "cus_test".to_string(),
        currency: "usd".to_string(),
        subtotal,
        tax: Decimal::ZERO,
        discount: Decimal::ZERO,
        total: subtotal,
        payment_intent_id: payment_intent.map(str::to_string),
        subscription_id: None,
        invoice_id: None,
        items: vec![NewOrderItem {
            product_id: stock.product_id,
            price_id: format!("price_{}", stock.product_id.simple()),
            stock_id: stock.id,
            quantity,
            unit_price,
            subtotal,
        }],
    }
}

pub fn event(id: &str, event_type: &str, object: Value) -> ExternalEvent {
    ExternalEvent::new(id, event_type, object)
}

/// The raw provider envelope as it arrives on the bus.
pub fn envelope(id: &str, event_type: &str, object: Value) -> Vec<u8> {
    json!({ "id": id, "type": event_type, "data": { "object": object } })
        .to_string()
        .into_bytes()
}

pub fn charge_refunded(payment_intent: &str, amount_refunded: i64) -> Value {
    json!({
        "id": format!("ch_{}", payment_intent),
        "object": "charge",
        "payment_intent": payment_intent,
        "amount_refunded": amount_refunded,
        "refunds": { "data": [ { "id": format!("re_{}", payment_intent) } ] }
    })
}

pub fn payment_intent(id: &str) -> Value {
    json!({ "id": id, "object": "payment_intent" })
}
