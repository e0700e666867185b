use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr,
};

use crate::db::now_token;
use crate::entities::processed_event::{self, Entity as ProcessedEvent, Model};
use crate::errors::ServiceError;

/// Result of claiming an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller inserted the dedup row and owns the dispatch.
    Acquired,
    /// Another delivery of the same id got there first.
    AlreadySeen,
}

/// Dedup bookkeeping for external events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessedEventRepository;

impl ProcessedEventRepository {
    pub async fn find<C: ConnectionTrait>(
        &self,
        conn: &C,
        event_id: &str,
    ) -> Result<Option<Model>, ServiceError> {
        ProcessedEvent::find_by_id(event_id.to_string())
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Inserts the row with `processed = false`. A primary-key collision means
    /// another worker claimed the id concurrently.
    pub async fn claim<C: ConnectionTrait>(
        &self,
        conn: &C,
        event_id: &str,
        event_type: &str,
    ) -> Result<Claim, ServiceError> {
        let now = now_token();
        let row = processed_event::ActiveModel {
            id: Set(event_id.to_string()),
            event_type: Set(event_type.to_string()),
            processed: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        };
        match row.insert(conn).await {
            Ok(_) => Ok(Claim::Acquired),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Ok(Claim::AlreadySeen)
            }
            Err(err) => Err(ServiceError::db_error(err)),
        }
    }

    pub async fn mark_processed<C: ConnectionTrait>(
        &self,
        conn: &C,
        event_id: &str,
    ) -> Result<(), ServiceError> {
        ProcessedEvent::update_many()
            .col_expr(processed_event::Column::Processed, Expr::value(true))
            .col_expr(processed_event::Column::UpdatedAt, Expr::value(now_token()))
            .filter(processed_event::Column::Id.eq(event_id))
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Drops the claim so a redelivery of the same id is dispatched again.
    pub async fn release<C: ConnectionTrait>(
        &self,
        conn: &C,
        event_id: &str,
    ) -> Result<(), ServiceError> {
        ProcessedEvent::delete_by_id(event_id.to_string())
            .exec(conn)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Claims never completed, oldest first.
    pub async fn list_unprocessed<C: ConnectionTrait>(
        &self,
        conn: &C,
        limit: u64,
    ) -> Result<Vec<Model>, ServiceError> {
        ProcessedEvent::find()
            .filter(processed_event::Column::Processed.eq(false))
            .order_by_asc(processed_event::Column::CreatedAt)
            .limit(limit)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }
}
