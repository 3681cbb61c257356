pub mod health;
pub mod payment_webhooks;
pub mod payments;

pub use crate::AppState;
