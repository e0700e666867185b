//! Domain enums, validated inputs and the order state machine.

pub mod cart;
pub mod inventory;
pub mod order;
pub mod order_status;

pub use cart::{CartItemInput, CartStatus};
pub use inventory::{MovementType, ReferenceType};
pub use order::{NewOrder, NewOrderItem, OrderFilter, PaidOrder};
pub use order_status::{allow_change_status, can_cancel, OrderStatus};
