pub mod payment_audit_log;
pub mod payment_order;
