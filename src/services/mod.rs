pub mod case_provisioner;
pub mod order_manager;
pub mod price_catalog;
pub mod reconciler;
pub mod state_machine;
