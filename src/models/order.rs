use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::OrderStatus;
use crate::errors::ServiceError;

/// Manually created order, validated before any stock is touched.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrder {
    #[validate(length(min = 1))]
    pub customer_id: String,
    #[validate(length(min = 3, max = 3))]
    pub currency: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub payment_intent_id: Option<String>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    #[validate(length(min = 1))]
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    #[validate(length(min = 1))]
    pub price_id: String,
    pub stock_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i64,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

impl NewOrder {
    /// Field rules plus the arithmetic invariant `total == subtotal + tax - discount`.
    pub fn check(&self) -> Result<(), ServiceError> {
        self.validate()?;

        if self.subtotal <= Decimal::ZERO || self.total <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "order subtotal and total must be positive".to_string(),
            ));
        }
        if self.tax < Decimal::ZERO || self.discount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "order tax and discount cannot be negative".to_string(),
            ));
        }
        if self.total != self.subtotal + self.tax - self.discount {
            return Err(ServiceError::ValidationError(format!(
                "order total {} does not equal subtotal {} + tax {} - discount {}",
                self.total, self.subtotal, self.tax, self.discount
            )));
        }
        for item in &self.items {
            item.check()?;
        }
        Ok(())
    }
}

impl NewOrderItem {
    pub fn check(&self) -> Result<(), ServiceError> {
        self.validate()?;
        if self.unit_price <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "unit price for product {} must be positive",
                self.product_id
            )));
        }
        if self.subtotal != Decimal::from(self.quantity) * self.unit_price {
            return Err(ServiceError::ValidationError(format!(
                "item subtotal {} for product {} does not equal {} x {}",
                self.subtotal, self.product_id, self.quantity, self.unit_price
            )));
        }
        Ok(())
    }
}

/// An order created in response to a payment event rather than a checkout.
#[derive(Debug, Clone, Default)]
pub struct PaidOrder {
    pub customer_id: String,
    pub currency: String,
    pub total: Decimal,
    pub payment_intent_id: Option<String>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
}

/// Filter accepted by order listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub customer_id: Option<String>,
    pub status: Option<OrderStatus>,
}
