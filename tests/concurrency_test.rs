mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{order_webhook, signed_headers, TestApp};
use payment_orders::models::{AuditEvent, ObservedState, PaymentMethod, PaymentStatus};
use payment_orders::repositories::PaymentOrderRepository;
use payment_orders::services::state_machine::replay;
use payment_orders::webhooks::{WebhookAck, WebhookDisposition};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webhook_and_poll_racing_provision_once() {
    let app = TestApp::new();
    let created = app.create_order().await;
    let moid = created.merchant_order_id.clone();
    app.gateway
        .set_remote_state(&moid, ObservedState::Completed, Some("T1"), Some(PaymentMethod::UpiIntent));
    app.gateway.set_poll_delay(Duration::from_millis(50));

    let reconciler = app.reconciler.clone();
    let poll_moid = moid.clone();
    let poll = tokio::spawn(async move { reconciler.check_status(&poll_moid).await });

    let handler = app.webhooks.clone();
    let body = order_webhook("ORDER_COMPLETED", &moid, "T1", "UPI_INTENT").to_string();
    let webhook = tokio::spawn(async move { handler.handle(&signed_headers(), body.as_bytes()).await });

    let view = poll.await.unwrap().unwrap();
    let ack = webhook.await.unwrap();
    assert_eq!(view.status, PaymentStatus::Completed);
    assert!(matches!(ack, WebhookAck::Accepted { .. }));

    let (order, trail) = app.manager.audit_trail(&moid).await.unwrap();
    assert_eq!(order.status, PaymentStatus::Completed);
    assert!(order.case_id.is_some());
    assert_eq!(app.provisioner.invocations(), 1);
    assert_eq!(
        trail.iter().filter(|e| e.event == AuditEvent::PaymentSuccess).count(),
        1
    );
    assert_eq!(
        trail.iter().filter(|e| e.event == AuditEvent::CaseLinked).count(),
        1
    );
    assert!(replay(&trail).matches(&order));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_webhooks_apply_once() {
    const DELIVERIES: usize = 16;
    let app = TestApp::new();
    let created = app.create_order().await;
    let body = order_webhook("ORDER_COMPLETED", &created.merchant_order_id, "T7", "CARD").to_string();

    let mut tasks = vec![];
    for _ in 0..DELIVERIES {
        let handler = app.webhooks.clone();
        let body = body.clone();
        tasks.push(tokio::spawn(async move {
            handler.handle(&signed_headers(), body.as_bytes()).await
        }));
    }

    let mut applied = 0;
    let mut discarded = 0;
    for task in tasks {
        match task.await.unwrap() {
            WebhookAck::Accepted { disposition: WebhookDisposition::Applied } => applied += 1,
            WebhookAck::Accepted { disposition: WebhookDisposition::Discarded } => discarded += 1,
            other => panic!("unexpected acknowledgement {:?}", other),
        }
    }
    assert_eq!(applied, 1, "exactly one delivery should win; got {}", applied);
    assert_eq!(discarded, DELIVERIES - 1);
    assert_eq!(app.provisioner.invocations(), 1);

    let (order, trail) = app
        .manager
        .audit_trail(&created.merchant_order_id)
        .await
        .unwrap();
    // created, initiated, one success, one link, the rest recorded as no-ops
    assert_eq!(trail.len(), 4 + DELIVERIES - 1);
    assert!(replay(&trail).matches(&order));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creations_get_distinct_ids() {
    let app = Arc::new(TestApp::new());

    let mut tasks = vec![];
    for _ in 0..32 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move { app.create_order().await.merchant_order_id }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        assert!(ids.insert(task.await.unwrap()), "duplicate merchant order id");
    }
    assert_eq!(ids.len(), 32);
    assert_eq!(app.gateway.initiations(), 32);

    let now = chrono::Utc::now();
    let open = app
        .repo
        .find_reconcilable(now + chrono::Duration::hours(1), now, 100)
        .await
        .unwrap();
    assert_eq!(open.len(), 32);
    assert!(open.iter().all(|o| o.status == PaymentStatus::Initiated));
}
