//! Unit-of-work helpers: isolation profiles, commit/rollback discipline and
//! bounded retry for transient conflicts.

use futures::FutureExt;
use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, IsolationLevel, TransactionTrait};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::errors::ServiceError;

/// Isolation levels used by the workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum IsolationProfile {
    /// Default for workflows and event handlers.
    RepeatableRead,
    /// Cart conversion, where concurrent carts of one customer race the hardest.
    Serializable,
}

impl IsolationProfile {
    fn level(self) -> IsolationLevel {
        match self {
            IsolationProfile::RepeatableRead => IsolationLevel::RepeatableRead,
            IsolationProfile::Serializable => IsolationLevel::Serializable,
        }
    }
}

/// Attempt budget and linear backoff unit for [`TransactionManager::run_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// Runs closures inside database transactions.
///
/// The closure receives a shared handle to the open transaction. It must not
/// keep that handle past the returned future; the manager reclaims it to
/// commit or roll back.
#[derive(Clone)]
pub struct TransactionManager {
    db: Arc<DatabaseConnection>,
    retry: RetryPolicy,
}

impl TransactionManager {
    pub fn new(db: Arc<DatabaseConnection>, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Begins a transaction at `isolation`, runs `f` and commits on `Ok`.
    ///
    /// An `Err` rolls back and is returned unchanged. A panic inside `f` rolls
    /// back first and then resumes unwinding.
    pub async fn run<T, F, Fut>(&self, isolation: IsolationProfile, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(Arc<DatabaseTransaction>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let txn = self
            .db
            .begin_with_config(Some(isolation.level()), None)
            .await
            .map_err(ServiceError::db_error)?;
        let txn = Arc::new(txn);

        let outcome = AssertUnwindSafe(f(Arc::clone(&txn))).catch_unwind().await;

        let txn = match Arc::try_unwrap(txn) {
            Ok(txn) => txn,
            Err(_) => {
                // Dropping the last handle rolls back inside sea-orm.
                error!("transaction handle outlived its unit of work");
                return match outcome {
                    Err(fault) => panic::resume_unwind(fault),
                    Ok(_) => Err(ServiceError::InternalError(
                        "transaction handle outlived its unit of work".to_string(),
                    )),
                };
            }
        };

        match outcome {
            Ok(Ok(value)) => {
                txn.commit().await.map_err(ServiceError::db_error)?;
                debug!(isolation = %isolation, "transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
            Err(fault) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(error = %rollback_err, "rollback after panic failed");
                }
                panic::resume_unwind(fault)
            }
        }
    }

    /// [`run`](Self::run) repeated while the error is a transient conflict.
    ///
    /// Sleeps `attempt * backoff_unit` between attempts. Once the budget is
    /// spent the last conflict is wrapped in [`ServiceError::RetriesExhausted`].
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        isolation: IsolationProfile,
        max_attempts: u32,
        mut f: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(Arc<DatabaseTransaction>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run(isolation, &mut f).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    counter!("commerce.tx.conflicts", 1);
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %err, "transaction retries exhausted");
                        return Err(ServiceError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient conflict, retrying transaction"
                    );
                    counter!("commerce.tx.retries", 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// [`run_with_retry`](Self::run_with_retry) with the configured attempt budget.
    pub async fn run_retrying<T, F, Fut>(
        &self,
        isolation: IsolationProfile,
        f: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(Arc<DatabaseTransaction>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.run_with_retry(isolation, self.retry.max_attempts, f)
            .await
    }
}
