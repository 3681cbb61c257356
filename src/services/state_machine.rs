//! The single transition function for payment orders.
//!
//! [`apply`] is pure: it takes the current projection and one normalised
//! observation and returns the next projection plus what the caller has to do
//! with it. Every entry point (initiation, webhook, poll, expiry) goes through
//! here, so delivery order and duplicate delivery cannot move an order
//! backwards.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{
    AuditEvent, Observation, ObservationSource, ObservedState, PaymentAuditLogEntry, PaymentOrder,
    PaymentStatus, RefundRecord,
};

pub const EXPIRED_REASON: &str = "expired without confirmation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Status moved forward.
    Applied,
    /// Same status, but the observation filled in gateway details.
    Enriched,
    /// Informational event (refund accepted or failed); nothing changes.
    Recorded,
    /// Regressive, duplicate or irrelevant observation; nothing changes.
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    /// First arrival at `Completed` without a case: provision after commit.
    pub provision_case: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub event: AuditEvent,
    pub outcome: Outcome,
    pub description: String,
    /// Next projection; equal to the input unless the row must be written.
    pub next: PaymentOrder,
    pub effects: SideEffects,
}

impl Transition {
    /// Whether the order row changes, i.e. needs a compare-and-swap commit.
    pub fn writes_row(&self) -> bool {
        matches!(self.outcome, Outcome::Applied | Outcome::Enriched)
    }
}

fn target_status(state: &ObservedState) -> Option<PaymentStatus> {
    match state {
        ObservedState::Accepted => Some(PaymentStatus::Initiated),
        ObservedState::Attempted => Some(PaymentStatus::Processing),
        ObservedState::Completed => Some(PaymentStatus::Completed),
        ObservedState::Failed | ObservedState::Expired => Some(PaymentStatus::Failed),
        ObservedState::Cancelled => Some(PaymentStatus::Cancelled),
        ObservedState::RefundAccepted { .. }
        | ObservedState::RefundCompleted { .. }
        | ObservedState::RefundFailed { .. } => None,
    }
}

fn applied_event(to: PaymentStatus) -> AuditEvent {
    match to {
        PaymentStatus::Pending | PaymentStatus::Initiated => AuditEvent::PaymentInitiated,
        PaymentStatus::Processing => AuditEvent::PaymentProcessing,
        PaymentStatus::Completed => AuditEvent::PaymentSuccess,
        PaymentStatus::Failed => AuditEvent::PaymentFailed,
        PaymentStatus::Cancelled => AuditEvent::PaymentCancelled,
        PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded => AuditEvent::RefundCompleted,
    }
}

fn observation_event(source: ObservationSource) -> AuditEvent {
    match source {
        ObservationSource::Webhook => AuditEvent::WebhookReceived,
        ObservationSource::Poll | ObservationSource::Manual => AuditEvent::StatusCheck,
    }
}

/// Copies gateway details onto `order`. Returns true if anything changed.
fn enrich(order: &mut PaymentOrder, observation: &Observation) -> bool {
    let mut changed = false;
    if order.gateway_order_id.is_none() && observation.gateway_order_id.is_some() {
        order.gateway_order_id = observation.gateway_order_id.clone();
        changed = true;
    }
    if let Some(method) = observation.payment_method {
        if order.payment_method != Some(method) {
            order.payment_method = Some(method);
            changed = true;
        }
    }
    if let Some(txn) = &observation.transaction_id {
        if order.gateway_transaction_id.as_ref() != Some(txn) {
            order.gateway_transaction_id = Some(txn.clone());
            changed = true;
        }
    }
    if let (ObservedState::Accepted, Some(expire_at)) = (&observation.state, observation.expire_at) {
        if order.expire_at != expire_at {
            order.expire_at = expire_at;
            changed = true;
        }
    }
    changed
}

struct Builder<'a> {
    order: &'a PaymentOrder,
    observation: &'a Observation,
}

impl<'a> Builder<'a> {
    fn unchanged(&self, outcome: Outcome, event: AuditEvent, description: String) -> Transition {
        Transition {
            from: self.order.status,
            to: self.order.status,
            event,
            outcome,
            description,
            next: self.order.clone(),
            effects: SideEffects::default(),
        }
    }

    fn discard(&self, description: String) -> Transition {
        self.unchanged(
            Outcome::Discarded,
            observation_event(self.observation.source),
            description,
        )
    }
}

/// Evaluates `observation` against `order`.
pub fn apply(order: &PaymentOrder, observation: &Observation, now: DateTime<Utc>) -> Transition {
    let builder = Builder { order, observation };
    let from = order.status;

    match &observation.state {
        ObservedState::RefundAccepted { refund_id } | ObservedState::RefundFailed { refund_id } => {
            if !matches!(from, PaymentStatus::Completed | PaymentStatus::PartiallyRefunded) {
                return builder.discard(format!(
                    "refund {} reported for order in status {}",
                    refund_id, from
                ));
            }
            let (event, verb) = match observation.state {
                ObservedState::RefundAccepted { .. } => (AuditEvent::RefundInitiated, "accepted"),
                _ => (AuditEvent::RefundFailed, "failed"),
            };
            builder.unchanged(
                Outcome::Recorded,
                event,
                format!("refund {} {} by gateway", refund_id, verb),
            )
        }

        ObservedState::RefundCompleted { refund_id, amount } => {
            if !matches!(from, PaymentStatus::Completed | PaymentStatus::PartiallyRefunded) {
                return builder.discard(format!(
                    "refund {} completed for order in status {}",
                    refund_id, from
                ));
            }
            if order.refunds.iter().any(|r| &r.refund_id == refund_id) {
                return builder.discard(format!("duplicate refund {}", refund_id));
            }
            if *amount <= 0 {
                return builder.discard(format!(
                    "refund {} has non-positive amount {}",
                    refund_id, amount
                ));
            }
            let refunded = match order.refunded_amount().checked_add(*amount) {
                Some(total) if total <= order.amount => total,
                _ => {
                    return builder.discard(format!(
                        "refund {} of {} does not fit order amount {} (already refunded {})",
                        refund_id,
                        amount,
                        order.amount,
                        order.refunded_amount()
                    ))
                }
            };
            let to = if refunded >= order.amount {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
            let mut next = order.clone();
            next.refunds.push(RefundRecord {
                refund_id: refund_id.clone(),
                amount: *amount,
                completed_at: now,
            });
            next.status = to;
            next.updated_at = now;
            Transition {
                from,
                to,
                event: AuditEvent::RefundCompleted,
                outcome: Outcome::Applied,
                description: format!("refund {} of {} completed", refund_id, amount),
                next,
                effects: SideEffects::default(),
            }
        }

        state => {
            let Some(to) = target_status(state) else {
                return builder.discard("observation carries no payment state".to_string());
            };

            if !from.is_open() {
                return builder.discard(format!(
                    "order already {}; ignoring {} via {}",
                    from, to, observation.source
                ));
            }

            let mut next = order.clone();
            if to == from {
                return if enrich(&mut next, observation) {
                    next.updated_at = now;
                    Transition {
                        from,
                        to,
                        event: observation_event(observation.source),
                        outcome: Outcome::Enriched,
                        description: format!("gateway details updated while {}", from),
                        next,
                        effects: SideEffects::default(),
                    }
                } else {
                    builder.discard(format!("duplicate {} observation", to))
                };
            }

            if !from.can_transition_to(to) {
                return builder.discard(format!(
                    "would regress from {} to {}",
                    from, to
                ));
            }

            enrich(&mut next, observation);
            next.status = to;
            next.updated_at = now;

            let provision_case = to == PaymentStatus::Completed && next.case_id.is_none();
            if provision_case {
                next.provisioning_pending = true;
            }

            let description = match state {
                ObservedState::Expired => EXPIRED_REASON.to_string(),
                _ => format!("{} -> {} via {}", from, to, observation.source),
            };

            Transition {
                from,
                to,
                event: applied_event(to),
                outcome: Outcome::Applied,
                description,
                next,
                effects: SideEffects { provision_case },
            }
        }
    }
}

/// State reconstructed from an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReplayedState {
    pub status: Option<PaymentStatus>,
    pub case_id: Option<String>,
    /// Entries whose recorded status change is not a legal edge.
    pub violations: usize,
}

impl ReplayedState {
    pub fn matches(&self, order: &PaymentOrder) -> bool {
        self.violations == 0 && self.status == Some(order.status) && self.case_id == order.case_id
    }
}

/// Rebuilds `(status, case_id)` from entries in `created_at` order.
pub fn replay(entries: &[PaymentAuditLogEntry]) -> ReplayedState {
    let mut state = ReplayedState {
        status: None,
        case_id: None,
        violations: 0,
    };

    for entry in entries {
        match entry.event {
            AuditEvent::OrderCreated => {
                if state.status.is_some() {
                    state.violations += 1;
                }
                state.status = Some(entry.resulting_status);
            }
            AuditEvent::CaseLinked => {
                let case_id = entry
                    .metadata
                    .get("case_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                if state.case_id.is_some() || case_id.is_none() {
                    state.violations += 1;
                } else {
                    state.case_id = case_id;
                }
            }
            AuditEvent::PaymentInitiated
            | AuditEvent::PaymentProcessing
            | AuditEvent::PaymentSuccess
            | AuditEvent::PaymentFailed
            | AuditEvent::PaymentCancelled
            | AuditEvent::RefundCompleted => match state.status {
                Some(current) if current.can_transition_to(entry.resulting_status) => {
                    state.status = Some(entry.resulting_status);
                }
                _ => state.violations += 1,
            },
            AuditEvent::RefundInitiated
            | AuditEvent::RefundFailed
            | AuditEvent::WebhookReceived
            | AuditEvent::StatusCheck
            | AuditEvent::ErrorOccurred => {}
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CustomerInfo, NewAuditEntry, PaymentMethod};
    use chrono::Duration;
    use rstest::rstest;
    use serde_json::json;

    fn order_in(status: PaymentStatus) -> PaymentOrder {
        let now = Utc::now();
        let mut order = PaymentOrder::new(
            "ORDER_1700000000000_ABC123".into(),
            CustomerInfo {
                name: "Ravi".into(),
                email: "ravi@example.com".into(),
                phone: "+919812345678".into(),
            },
            vec![],
            now + Duration::minutes(20),
            now,
        );
        order.amount = 50_000;
        order.status = status;
        order
    }

    fn observe(state: ObservedState) -> Observation {
        Observation::new(ObservationSource::Webhook, state)
    }

    #[rstest]
    #[case(PaymentStatus::Pending, ObservedState::Accepted, PaymentStatus::Initiated, Outcome::Applied)]
    #[case(PaymentStatus::Pending, ObservedState::Completed, PaymentStatus::Completed, Outcome::Applied)]
    #[case(PaymentStatus::Initiated, ObservedState::Attempted, PaymentStatus::Processing, Outcome::Applied)]
    #[case(PaymentStatus::Processing, ObservedState::Accepted, PaymentStatus::Processing, Outcome::Discarded)]
    #[case(PaymentStatus::Processing, ObservedState::Cancelled, PaymentStatus::Cancelled, Outcome::Applied)]
    #[case(PaymentStatus::Initiated, ObservedState::Expired, PaymentStatus::Failed, Outcome::Applied)]
    #[case(PaymentStatus::Completed, ObservedState::Failed, PaymentStatus::Completed, Outcome::Discarded)]
    #[case(PaymentStatus::Completed, ObservedState::Completed, PaymentStatus::Completed, Outcome::Discarded)]
    #[case(PaymentStatus::Failed, ObservedState::Completed, PaymentStatus::Failed, Outcome::Discarded)]
    #[case(PaymentStatus::Cancelled, ObservedState::Attempted, PaymentStatus::Cancelled, Outcome::Discarded)]
    #[case(PaymentStatus::Refunded, ObservedState::Completed, PaymentStatus::Refunded, Outcome::Discarded)]
    fn payment_state_transitions(
        #[case] from: PaymentStatus,
        #[case] observed: ObservedState,
        #[case] expected: PaymentStatus,
        #[case] outcome: Outcome,
    ) {
        let order = order_in(from);
        let transition = apply(&order, &observe(observed), Utc::now());
        assert_eq!(transition.to, expected);
        assert_eq!(transition.next.status, expected);
        assert_eq!(transition.outcome, outcome);
    }

    #[test]
    fn first_completion_requests_provisioning() {
        let order = order_in(PaymentStatus::Initiated);
        let observation = observe(ObservedState::Completed)
            .with_transaction(Some("T1".into()), Some(PaymentMethod::UpiIntent));
        let transition = apply(&order, &observation, Utc::now());

        assert_eq!(transition.event, AuditEvent::PaymentSuccess);
        assert!(transition.effects.provision_case);
        assert!(transition.next.provisioning_pending);
        assert_eq!(transition.next.payment_method, Some(PaymentMethod::UpiIntent));
        assert_eq!(transition.next.gateway_transaction_id.as_deref(), Some("T1"));
    }

    #[test]
    fn duplicate_completion_is_a_no_op() {
        let mut order = order_in(PaymentStatus::Completed);
        order.case_id = Some("CASE-1".into());
        let transition = apply(&order, &observe(ObservedState::Completed), Utc::now());
        assert_eq!(transition.outcome, Outcome::Discarded);
        assert_eq!(transition.event, AuditEvent::WebhookReceived);
        assert!(!transition.effects.provision_case);
        assert_eq!(transition.next, order);
    }

    #[test]
    fn expiry_uses_distinct_reason() {
        let order = order_in(PaymentStatus::Initiated);
        let transition = apply(
            &order,
            &Observation::new(ObservationSource::Poll, ObservedState::Expired),
            Utc::now(),
        );
        assert_eq!(transition.description, EXPIRED_REASON);
        assert_eq!(transition.event, AuditEvent::PaymentFailed);
    }

    #[test]
    fn same_status_with_new_details_is_enrichment() {
        let order = order_in(PaymentStatus::Processing);
        let observation = Observation::new(ObservationSource::Poll, ObservedState::Attempted)
            .with_transaction(Some("T7".into()), Some(PaymentMethod::Card));
        let transition = apply(&order, &observation, Utc::now());
        assert_eq!(transition.outcome, Outcome::Enriched);
        assert_eq!(transition.event, AuditEvent::StatusCheck);
        assert!(transition.writes_row());

        let again = apply(&transition.next, &observation, Utc::now());
        assert_eq!(again.outcome, Outcome::Discarded);
        assert!(!again.writes_row());
    }

    #[test]
    fn payment_method_never_regresses_to_none() {
        let mut order = order_in(PaymentStatus::Processing);
        order.payment_method = Some(PaymentMethod::Wallet);
        let transition = apply(&order, &observe(ObservedState::Completed), Utc::now());
        assert_eq!(transition.next.payment_method, Some(PaymentMethod::Wallet));
    }

    #[test]
    fn gateway_order_id_is_set_once() {
        let mut order = order_in(PaymentStatus::Initiated);
        order.gateway_order_id = Some("OMO1".into());
        let observation = observe(ObservedState::Attempted).with_gateway_order(Some("OMO2".into()), None);
        let transition = apply(&order, &observation, Utc::now());
        assert_eq!(transition.next.gateway_order_id.as_deref(), Some("OMO1"));
    }

    #[test]
    fn partial_then_full_refund() {
        let order = order_in(PaymentStatus::Completed);
        let partial = apply(
            &order,
            &observe(ObservedState::RefundCompleted {
                refund_id: "R1".into(),
                amount: 20_000,
            }),
            Utc::now(),
        );
        assert_eq!(partial.to, PaymentStatus::PartiallyRefunded);

        let duplicate = apply(
            &partial.next,
            &observe(ObservedState::RefundCompleted {
                refund_id: "R1".into(),
                amount: 20_000,
            }),
            Utc::now(),
        );
        assert_eq!(duplicate.outcome, Outcome::Discarded);

        let rest = apply(
            &partial.next,
            &observe(ObservedState::RefundCompleted {
                refund_id: "R2".into(),
                amount: 30_000,
            }),
            Utc::now(),
        );
        assert_eq!(rest.to, PaymentStatus::Refunded);
        assert_eq!(rest.next.refunded_amount(), 50_000);
    }

    #[test]
    fn refund_larger_than_remaining_is_discarded() {
        let order = order_in(PaymentStatus::Completed);
        let transition = apply(
            &order,
            &observe(ObservedState::RefundCompleted {
                refund_id: "R9".into(),
                amount: 60_000,
            }),
            Utc::now(),
        );
        assert_eq!(transition.outcome, Outcome::Discarded);
    }

    #[test]
    fn oversized_refund_after_partial_refund_is_discarded() {
        let order = order_in(PaymentStatus::Completed);
        let partial = apply(
            &order,
            &observe(ObservedState::RefundCompleted {
                refund_id: "R1".into(),
                amount: 1,
            }),
            Utc::now(),
        );
        assert_eq!(partial.to, PaymentStatus::PartiallyRefunded);

        let transition = apply(
            &partial.next,
            &observe(ObservedState::RefundCompleted {
                refund_id: "R2".into(),
                amount: i64::MAX,
            }),
            Utc::now(),
        );
        assert_eq!(transition.outcome, Outcome::Discarded);
        assert_eq!(transition.to, PaymentStatus::PartiallyRefunded);
        assert_eq!(transition.next.refunded_amount(), 1);
    }

    #[rstest]
    #[case(0)]
    #[case(-500)]
    #[case(i64::MIN)]
    fn non_positive_refund_is_discarded(#[case] amount: i64) {
        let order = order_in(PaymentStatus::Completed);
        let transition = apply(
            &order,
            &observe(ObservedState::RefundCompleted {
                refund_id: "R1".into(),
                amount,
            }),
            Utc::now(),
        );
        assert_eq!(transition.outcome, Outcome::Discarded);
        assert!(transition.next.refunds.is_empty());
    }

    #[test]
    fn refund_events_before_payment_are_discarded() {
        let order = order_in(PaymentStatus::Initiated);
        let transition = apply(
            &order,
            &observe(ObservedState::RefundAccepted {
                refund_id: "R1".into(),
            }),
            Utc::now(),
        );
        assert_eq!(transition.outcome, Outcome::Discarded);

        let paid = order_in(PaymentStatus::Completed);
        let transition = apply(
            &paid,
            &observe(ObservedState::RefundFailed {
                refund_id: "R1".into(),
            }),
            Utc::now(),
        );
        assert_eq!(transition.outcome, Outcome::Recorded);
        assert_eq!(transition.event, AuditEvent::RefundFailed);
    }

    fn entry(order: &PaymentOrder, event: AuditEvent, status: PaymentStatus) -> PaymentAuditLogEntry {
        NewAuditEntry::new(order.id, event, status, "", json!({})).into_entry()
    }

    #[test]
    fn replay_reconstructs_status_and_case() {
        let mut order = order_in(PaymentStatus::Completed);
        order.case_id = Some("CASE-42".into());
        let mut linked = entry(&order, AuditEvent::CaseLinked, PaymentStatus::Completed);
        linked.metadata = json!({"case_id": "CASE-42"});
        let entries = vec![
            entry(&order, AuditEvent::OrderCreated, PaymentStatus::Pending),
            entry(&order, AuditEvent::PaymentInitiated, PaymentStatus::Initiated),
            entry(&order, AuditEvent::WebhookReceived, PaymentStatus::Initiated),
            entry(&order, AuditEvent::PaymentSuccess, PaymentStatus::Completed),
            entry(&order, AuditEvent::WebhookReceived, PaymentStatus::Completed),
            linked,
        ];
        let replayed = replay(&entries);
        assert_eq!(replayed.status, Some(PaymentStatus::Completed));
        assert_eq!(replayed.case_id.as_deref(), Some("CASE-42"));
        assert!(replayed.matches(&order));
    }

    #[test]
    fn replay_flags_illegal_edges() {
        let order = order_in(PaymentStatus::Completed);
        let entries = vec![
            entry(&order, AuditEvent::OrderCreated, PaymentStatus::Pending),
            entry(&order, AuditEvent::PaymentFailed, PaymentStatus::Failed),
            entry(&order, AuditEvent::PaymentSuccess, PaymentStatus::Completed),
        ];
        let replayed = replay(&entries);
        assert_eq!(replayed.violations, 1);
        assert!(!replayed.matches(&order));
    }
}
