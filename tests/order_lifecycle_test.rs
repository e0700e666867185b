mod common;

use assert_matches::assert_matches;
use rstest::rstest;
use rust_decimal_macros::dec;
use stateset_commerce::{
    errors::ServiceError,
    models::{allow_change_status, MovementType, OrderFilter, OrderStatus, ReferenceType},
};
use uuid::Uuid;

use common::{new_order, TestApp};
use stateset_commerce::models::OrderStatus::*;

/// Statuses an order can actually reach, with the path that gets it there.
const REACHABLE: &[(OrderStatus, &[OrderStatus])] = &[
    (Pending, &[]),
    (Paid, &[Paid]),
    (Failed, &[Failed]),
    (Cancelled, &[Cancelled]),
    (Completed, &[Paid, Completed]),
    (Refunded, &[Paid, Refunded]),
    (PartiallyRefunded, &[Paid, PartiallyRefunded]),
    (Dispute, &[Paid, Dispute]),
];

const ALL: &[OrderStatus] = &[
    Pending,
    Paid,
    Processing,
    Completed,
    Cancelled,
    Refunded,
    PartiallyRefunded,
    Failed,
    Dispute,
    AwaitingStock,
];

async fn order_at(app: &TestApp, quantity: i64, path: &[OrderStatus]) -> (Uuid, Uuid) {
    let stock = app.seed_stock(10).await;
    let view = app
        .workflow()
        .create_order(new_order(&stock, quantity, dec!(5.00), None))
        .await
        .unwrap();
    for status in path {
        app.workflow()
            .update_order_status(view.order.id, *status)
            .await
            .unwrap();
    }
    (view.order.id, stock.id)
}

#[tokio::test]
async fn status_updates_follow_the_transition_table() {
    let app = TestApp::new().await;

    for (from, path) in REACHABLE {
        for to in ALL {
            let (order_id, _) = order_at(&app, 1, path).await;
            let result = app.workflow().update_order_status(order_id, *to).await;

            if allow_change_status(*from, *to) {
                let order = result.unwrap_or_else(|e| panic!("{} -> {} failed: {}", from, to, e));
                assert_eq!(order.status, *to);
            } else {
                assert_matches!(
                    result,
                    Err(ServiceError::InvalidStatusTransition { from: f, to: t })
                        if f == *from && t == *to,
                    "{} -> {} should be rejected",
                    from,
                    to
                );
                let current = app.workflow().get_order(order_id).await.unwrap();
                assert_eq!(current.order.status, *from);
            }
        }
    }
}

#[rstest]
#[case::cancel_pending(&[], Cancelled, 10)]
#[case::refund_paid(&[Paid], Refunded, 10)]
#[case::refund_after_partial(&[Paid, PartiallyRefunded], Refunded, 10)]
#[case::refund_dispute(&[Paid, Dispute], Refunded, 10)]
#[case::complete(&[Paid], Completed, 8)]
#[case::fail(&[], Failed, 8)]
#[case::partial_refund(&[Paid], PartiallyRefunded, 8)]
#[tokio::test]
async fn only_cancellation_and_full_refund_restore_stock(
    #[case] path: &[OrderStatus],
    #[case] target: OrderStatus,
    #[case] on_hand: i64,
) {
    let app = TestApp::new().await;
    let (order_id, stock_id) = order_at(&app, 2, path).await;
    assert_eq!(app.stock(stock_id).await.quantity, 8);

    app.workflow()
        .update_order_status(order_id, target)
        .await
        .unwrap();

    assert_eq!(app.stock(stock_id).await.quantity, on_hand);
    let ins: Vec<_> = app
        .movements(stock_id)
        .await
        .into_iter()
        .filter(|m| m.movement_type == MovementType::In)
        .collect();
    assert_eq!(ins.len(), if on_hand == 10 { 1 } else { 0 });
    for movement in ins {
        assert_eq!(movement.reference_type, ReferenceType::Order);
        assert_eq!(movement.reference_id, order_id);
        assert_eq!(movement.quantity, 2);
    }
}

#[tokio::test]
async fn manual_orders_take_available_stock() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(10).await;

    let view = app
        .workflow()
        .create_order(new_order(&stock, 4, dec!(2.50), Some("pi_manual")))
        .await
        .unwrap();
    assert_eq!(view.order.status, OrderStatus::Pending);
    assert_eq!(view.order.total, dec!(10.00));
    assert_eq!(view.order.payment_intent_id.as_deref(), Some("pi_manual"));
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].quantity, 4);
    assert_eq!(view.items[0].subtotal, dec!(10.00));

    let after = app.stock(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (6, 0));
    let movements = app.movements(stock.id).await;
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].movement_type, MovementType::Out);
    assert_eq!(movements[0].reference_id, view.order.id);

    let fetched = app.workflow().get_order(view.order.id).await.unwrap();
    assert_eq!(fetched.items, view.items);
}

#[tokio::test]
async fn invalid_or_unfillable_orders_change_nothing() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(3).await;

    let mut bad_total = new_order(&stock, 1, dec!(2.00), None);
    bad_total.total = dec!(3.00);
    assert_matches!(
        app.workflow().create_order(bad_total).await,
        Err(ServiceError::ValidationError(_))
    );

    assert_matches!(
        app.workflow()
            .create_order(new_order(&stock, 4, dec!(2.00), None))
            .await,
        Err(ServiceError::InsufficientStock(_))
    );

    let after = app.stock(stock.id).await;
    assert_eq!(after.quantity, 3);
    assert_eq!(after.updated_at, stock.updated_at);
    assert!(app.movements(stock.id).await.is_empty());
    let orders = app
        .workflow()
        .list_orders(&OrderFilter::default(), 10, 0)
        .await
        .unwrap();
    assert!(orders.is_empty());
}

#[tokio::test]
async fn cancelling_a_pending_order_restores_its_stock() {
    let app = TestApp::new().await;
    let (order_id, stock_id) = order_at(&app, 3, &[]).await;
    assert_eq!(app.stock(stock_id).await.quantity, 7);

    let order = app.workflow().cancel_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(app.stock(stock_id).await.quantity, 10);

    assert_matches!(
        app.workflow().cancel_order(order_id).await,
        Err(ServiceError::InvalidOperation(_))
    );
    assert_eq!(app.stock(stock_id).await.quantity, 10);
}

#[tokio::test]
async fn paid_orders_cannot_be_cancelled() {
    let app = TestApp::new().await;
    let (order_id, stock_id) = order_at(&app, 1, &[Paid]).await;

    assert_matches!(
        app.workflow().cancel_order(order_id).await,
        Err(ServiceError::InvalidOperation(_))
    );
    assert_eq!(app.stock(stock_id).await.quantity, 9);
}

#[tokio::test]
async fn cached_orders_are_invalidated_after_a_status_change() {
    let app = TestApp::new().await;
    let (order_id, _) = order_at(&app, 1, &[]).await;

    let cached = app.workflow().get_order(order_id).await.unwrap();
    assert_eq!(cached.order.status, OrderStatus::Pending);

    app.workflow()
        .update_order_status(order_id, OrderStatus::Paid)
        .await
        .unwrap();
    let fresh = app.workflow().get_order(order_id).await.unwrap();
    assert_eq!(fresh.order.status, OrderStatus::Paid);
}

#[tokio::test]
async fn orders_are_listed_by_filter() {
    let app = TestApp::new().await;
    let (paid, _) = order_at(&app, 1, &[Paid]).await;
    let (pending, _) = order_at(&app, 1, &[]).await;

    let by_status = app
        .workflow()
        .list_orders(
            &OrderFilter {
                status: Some(OrderStatus::Paid),
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].id, paid);

    let all = app
        .workflow()
        .list_orders(
            &OrderFilter {
                customer_id: Some("cus_test".to_string()),
                status: None,
            },
            10,
            0,
        )
        .await
        .unwrap();
    let ids: Vec<_> = all.iter().map(|o| o.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&paid) && ids.contains(&pending));

    assert!(app
        .workflow()
        .get_order(Uuid::new_v4())
        .await
        .is_err_and(|e| matches!(e, ServiceError::NotFound(_))));
}
