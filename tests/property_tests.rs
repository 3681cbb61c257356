//! Property-based tests for the payment order transition function.
//!
//! Arbitrary interleavings of webhook and poll observations are fed through
//! `apply` the way the order manager does, checking that status never moves
//! backwards, final states stick, duplicates are harmless and the audit trail
//! replays to the stored projection.

use chrono::{Duration, Utc};
use proptest::prelude::*;
use serde_json::json;

use payment_orders::models::{
    AuditEvent, CustomerInfo, NewAuditEntry, Observation, ObservationSource, ObservedState,
    PaymentAuditLogEntry, PaymentMethod, PaymentOrder, PaymentStatus,
};
use payment_orders::services::state_machine::{apply, replay, Outcome};

const ORDER_AMOUNT: i64 = 50_000;

fn fresh_order() -> PaymentOrder {
    let now = Utc::now();
    let mut order = PaymentOrder::new(
        "ORDER_1700000000000_PROPTS".into(),
        CustomerInfo {
            name: "Asha".into(),
            email: "asha@example.com".into(),
            phone: "+919800000000".into(),
        },
        vec![],
        now + Duration::minutes(20),
        now,
    );
    order.amount = ORDER_AMOUNT;
    order
}

fn refund_id_strategy() -> impl Strategy<Value = String> {
    prop_oneof!["R1", "R2", "R3"].prop_map(|s| s.to_string())
}

fn state_strategy() -> impl Strategy<Value = ObservedState> {
    prop_oneof![
        Just(ObservedState::Accepted),
        Just(ObservedState::Attempted),
        Just(ObservedState::Completed),
        Just(ObservedState::Failed),
        Just(ObservedState::Cancelled),
        Just(ObservedState::Expired),
        refund_id_strategy().prop_map(|refund_id| ObservedState::RefundAccepted { refund_id }),
        refund_id_strategy().prop_map(|refund_id| ObservedState::RefundFailed { refund_id }),
        (refund_id_strategy(), prop_oneof![1i64..60_000, Just(i64::MAX)])
            .prop_map(|(refund_id, amount)| ObservedState::RefundCompleted { refund_id, amount }),
    ]
}

fn observation_strategy() -> impl Strategy<Value = Observation> {
    (
        prop_oneof![Just(ObservationSource::Webhook), Just(ObservationSource::Poll)],
        state_strategy(),
        proptest::option::of("T[0-9]{1,3}"),
        proptest::option::of(prop_oneof![
            Just(PaymentMethod::UpiIntent),
            Just(PaymentMethod::Card),
            Just(PaymentMethod::NetBanking),
        ]),
    )
        .prop_map(|(source, state, txn, method)| {
            Observation::new(source, state)
                .with_transaction(txn, method)
                .with_gateway_order(Some("OMO-PROPTS".into()), None)
        })
}

/// Observation families that never conflict with each other, in ascending weight.
const SUCCESS_PATH: [ObservedState; 3] = [
    ObservedState::Accepted,
    ObservedState::Attempted,
    ObservedState::Completed,
];
const FAILURE_PATH: [ObservedState; 3] = [
    ObservedState::Accepted,
    ObservedState::Attempted,
    ObservedState::Failed,
];

/// A shuffled multiset drawn from one family, with duplicates.
fn delivery_pattern_strategy() -> impl Strategy<Value = (bool, Vec<(usize, ObservationSource)>)> {
    (
        any::<bool>(),
        prop::collection::vec(
            (
                0usize..3,
                prop_oneof![Just(ObservationSource::Webhook), Just(ObservationSource::Poll)],
            ),
            1..16,
        ),
    )
        .prop_flat_map(|(success, picks)| (Just(success), Just(picks).prop_shuffle()))
}

fn entry(order: &PaymentOrder, event: AuditEvent, metadata: serde_json::Value) -> PaymentAuditLogEntry {
    NewAuditEntry::new(order.id, event, order.status, "generated", metadata).into_entry()
}

/// Applies observations in order, linking a case when asked, and returns the
/// final projection, its audit trail and every outcome seen.
fn drive(observations: &[Observation]) -> (PaymentOrder, Vec<PaymentAuditLogEntry>, Vec<Outcome>) {
    let mut order = fresh_order();
    let mut trail = vec![entry(&order, AuditEvent::OrderCreated, json!({}))];
    let mut outcomes = Vec::new();

    for (i, observation) in observations.iter().enumerate() {
        let transition = apply(&order, observation, Utc::now());
        trail.push(
            NewAuditEntry::new(
                order.id,
                transition.event,
                transition.to,
                transition.description.clone(),
                json!({"outcome": transition.outcome}),
            )
            .into_entry(),
        );
        outcomes.push(transition.outcome);
        order = transition.next;
        if transition.effects.provision_case {
            let case_id = format!("CASE-{}", i);
            order.case_id = Some(case_id.clone());
            order.provisioning_pending = false;
            trail.push(entry(&order, AuditEvent::CaseLinked, json!({"case_id": case_id})));
        }
    }
    (order, trail, outcomes)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn status_only_moves_along_legal_edges(observations in prop::collection::vec(observation_strategy(), 0..24)) {
        let mut order = fresh_order();
        for observation in &observations {
            let transition = apply(&order, observation, Utc::now());
            if transition.outcome == Outcome::Applied {
                prop_assert!(
                    order.status.can_transition_to(transition.to),
                    "illegal edge {} -> {}", order.status, transition.to
                );
                prop_assert!(transition.to.weight() >= order.status.weight());
            } else {
                prop_assert_eq!(transition.to, order.status);
            }
            if order.status.is_final() {
                prop_assert_eq!(transition.next.status, order.status);
                prop_assert!(!transition.writes_row());
            }
            order = transition.next;
        }
    }

    #[test]
    fn repeating_an_observation_changes_nothing(
        prefix in prop::collection::vec(observation_strategy(), 0..12),
        observation in observation_strategy(),
    ) {
        let (order, _, _) = drive(&prefix);
        let first = apply(&order, &observation, Utc::now());
        let second = apply(&first.next, &observation, Utc::now());
        prop_assert!(!second.writes_row(), "second delivery wrote the row: {:?}", second.outcome);
        prop_assert_eq!(&second.next, &first.next);
        prop_assert!(!second.effects.provision_case);
    }

    #[test]
    fn at_most_one_case_is_provisioned(observations in prop::collection::vec(observation_strategy(), 0..24)) {
        let (order, trail, _) = drive(&observations);
        let linked = trail.iter().filter(|e| e.event == AuditEvent::CaseLinked).count();
        prop_assert!(linked <= 1);
        prop_assert_eq!(linked == 1, order.case_id.is_some());
        if order.case_id.is_some() {
            prop_assert!(order.status.is_paid());
        }
    }

    #[test]
    fn refunds_never_exceed_the_order_amount(observations in prop::collection::vec(observation_strategy(), 0..24)) {
        let (order, _, _) = drive(&observations);
        prop_assert!(order.refunded_amount() <= order.amount);
        match order.status {
            PaymentStatus::Refunded => prop_assert_eq!(order.refunded_amount(), order.amount),
            PaymentStatus::PartiallyRefunded => prop_assert!(order.refunded_amount() < order.amount),
            _ => prop_assert!(order.refunds.is_empty()),
        }
    }

    #[test]
    fn audit_trail_replays_to_the_projection(observations in prop::collection::vec(observation_strategy(), 0..24)) {
        let (order, trail, outcomes) = drive(&observations);
        let replayed = replay(&trail);
        prop_assert!(replayed.matches(&order), "replay {:?} vs {} / {:?}", replayed, order.status, order.case_id);
        prop_assert_eq!(trail.len(), 1 + outcomes.len() + usize::from(order.case_id.is_some()));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn final_status_is_that_of_the_heaviest_observation(pattern in delivery_pattern_strategy()) {
        let (success, picks) = pattern;
        let family = if success { &SUCCESS_PATH } else { &FAILURE_PATH };
        let observations: Vec<Observation> = picks
            .iter()
            .map(|(i, source)| Observation::new(*source, family[*i].clone()))
            .collect();

        let heaviest = picks.iter().map(|(i, _)| *i).max().unwrap();
        let expected = apply(
            &fresh_order(),
            &Observation::new(ObservationSource::Webhook, family[heaviest].clone()),
            Utc::now(),
        )
        .to;

        let mut order = fresh_order();
        let mut provisioned = 0;
        for observation in &observations {
            let transition = apply(&order, observation, Utc::now());
            if transition.effects.provision_case {
                provisioned += 1;
            }
            order = transition.next;
        }

        prop_assert_eq!(order.status, expected);
        prop_assert!(provisioned <= 1);
        prop_assert_eq!(provisioned == 1, expected == PaymentStatus::Completed);
    }
}
