// Stock quantities, reservations and the movement audit trail
pub mod stock_ledger;

// Cart and order lifecycle on top of the ledger
pub mod order_workflow;

pub use order_workflow::{CartView, OrderView, OrderWorkflow, StatusChange, WorkflowSettings};
pub use stock_ledger::StockLedger;
