pub mod cart;
pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod processed_event;
pub mod stock;
pub mod stock_movement;
