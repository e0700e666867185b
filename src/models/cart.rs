use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Enum representing the lifecycle of a cart.
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
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CartStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "abandoned")]
    Abandoned,
    /// Terminal; a converted cart is never reactivated.
    #[sea_orm(string_value = "converted")]
    Converted,
}

/// A line requested for a cart.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CartItemInput {
    pub product_id: Uuid,
    #[validate(length(min = 1))]
    pub price_id: String,
    pub stock_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i64,
    pub unit_price: Decimal,
}

impl CartItemInput {
    pub fn check(&self) -> Result<(), crate::errors::ServiceError> {
        self.validate()?;
        if self.unit_price <= Decimal::ZERO {
            return Err(crate::errors::ServiceError::ValidationError(format!(
                "unit price for product {} must be positive",
                self.product_id
            )));
        }
        Ok(())
    }

    pub fn subtotal(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_price
    }
}
