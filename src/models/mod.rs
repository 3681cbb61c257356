pub mod audit;
pub mod observation;
pub mod payment_order;

pub use audit::{AuditEvent, NewAuditEntry, PaymentAuditLogEntry};
pub use observation::{Observation, ObservationSource, ObservedState};
pub use payment_order::{
    generate_merchant_order_id, CustomerInfo, OrderStatusView, PaymentMethod, PaymentOrder,
    PaymentStatus, RefundRecord, SelectedItem,
};
