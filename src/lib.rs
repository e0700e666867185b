//! StateSet Commerce Core
//!
//! Transactional stock ledger, order and cart workflow, and the idempotent
//! payment-event pipeline that drives them.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod message_queue;
pub mod models;
pub mod repositories;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::cache::AdvisoryCache;
use crate::config::AppConfig;
use crate::db::{RetryPolicy, TransactionManager};
use crate::events::{payment_dispatcher, EventPipeline, WorkerPool};
use crate::services::{OrderWorkflow, StockLedger, WorkflowSettings};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub transactions: TransactionManager,
    pub ledger: StockLedger,
    pub workflow: OrderWorkflow,
    pub pipeline: EventPipeline,
}

impl AppState {
    /// Wires every service over one connection pool.
    pub fn new(db: Arc<DatabaseConnection>, config: AppConfig) -> Self {
        let cache = AdvisoryCache::new(
            cache::build_backend(config.redis_url.as_deref()),
            config.cache_ttl(),
        );
        Self::with_cache(db, config, cache)
    }

    pub fn with_cache(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
        cache: AdvisoryCache,
    ) -> Self {
        let transactions = TransactionManager::new(
            Arc::clone(&db),
            RetryPolicy {
                max_attempts: config.tx_max_attempts,
                backoff_unit: config.tx_backoff(),
            },
        );
        let ledger = StockLedger::new(cache.clone());
        let workflow = OrderWorkflow::new(
            transactions.clone(),
            ledger.clone(),
            cache,
            WorkflowSettings {
                cart_ttl: config.cart_ttl(),
                cancel_window: config.cancel_window(),
            },
        );
        let pipeline = EventPipeline::new(Arc::clone(&db), payment_dispatcher(workflow.clone()));

        Self {
            db,
            config,
            transactions,
            ledger,
            workflow,
            pipeline,
        }
    }

    /// A worker pool sized from configuration. Must be called inside a Tokio runtime.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(self.config.worker_pool_size, self.config.task_queue_capacity)
    }
}
