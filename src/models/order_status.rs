//! Order lifecycle states and the rules for moving between them.

use chrono::{DateTime, Duration, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Enum representing the possible statuses of an order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "dispute")]
    Dispute,
    #[sea_orm(string_value = "awaiting_stock")]
    AwaitingStock,
}

impl OrderStatus {
    /// Statuses reachable from `self` through a regular status update.
    pub fn allowed_transitions(self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[Paid, Cancelled, Failed],
            Paid => &[Completed, Refunded, PartiallyRefunded, Dispute],
            Failed => &[Pending],
            PartiallyRefunded => &[Refunded],
            Dispute => &[Paid, Refunded],
            Processing | AwaitingStock | Completed | Cancelled | Refunded => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Entering one of these puts the order's stock back on hand.
    pub fn restores_stock(self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }
}

/// Returns true iff `requested` is listed among `current`'s outbound transitions.
pub fn allow_change_status(current: OrderStatus, requested: OrderStatus) -> bool {
    current.allowed_transitions().contains(&requested)
}

/// Cancellation is narrower than the transition table: pending orders always,
/// processing orders only inside `window` since creation.
pub fn can_cancel(
    status: OrderStatus,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    match status {
        OrderStatus::Pending => true,
        OrderStatus::Processing => now - created_at < window,
        _ => false,
    }
}
