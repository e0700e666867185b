mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use stateset_commerce::{
    errors::ServiceError,
    models::{CartStatus, MovementType, OrderStatus, ReferenceType},
};
use tokio::sync::Barrier;

use common::{line, TestApp};

#[tokio::test]
async fn reserving_then_checking_out_moves_stock_through_the_ledger() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(10).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();

    let view = app
        .workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 3, dec!(12.50))])
        .await
        .unwrap();
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.cart.subtotal, dec!(37.50));
    assert_eq!(view.cart.total, dec!(37.50));

    let reserved = app.stock(stock.id).await;
    assert_eq!((reserved.quantity, reserved.reserved_quantity), (10, 3));
    let movements = app.movements(stock.id).await;
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].movement_type, MovementType::Reserve);
    assert_eq!(movements[0].reference_type, ReferenceType::Cart);
    assert_eq!(movements[0].reference_id, cart.id);
    assert_eq!(movements[0].quantity, 3);

    let order = app.workflow().convert_cart_to_order(cart.id).await.unwrap();
    assert_eq!(order.order.status, OrderStatus::Pending);
    assert_eq!(order.order.cart_id, Some(cart.id));
    assert_eq!(order.order.total, dec!(37.50));
    assert_eq!(order.items.len(), view.items.len());
    for (ordered, carted) in order.items.iter().zip(&view.items) {
        assert_eq!(ordered.order_id, order.order.id);
        assert_eq!(ordered.product_id, carted.product_id);
        assert_eq!(ordered.price_id, carted.price_id);
        assert_eq!(ordered.stock_id, carted.stock_id);
        assert_eq!(ordered.quantity, carted.quantity);
        assert_eq!(ordered.unit_price, carted.unit_price);
        assert_eq!(ordered.subtotal, carted.subtotal);
        assert_eq!(
            ordered.subtotal,
            Decimal::from(ordered.quantity) * ordered.unit_price
        );
    }

    let after = app.stock(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (7, 0));
    assert!(after.updated_at > reserved.updated_at);

    let outs: Vec<_> = app
        .movements(stock.id)
        .await
        .into_iter()
        .filter(|m| m.movement_type == MovementType::Out)
        .collect();
    assert_eq!(outs.len(), 1);
    assert_eq!(outs[0].reference_type, ReferenceType::Order);
    assert_eq!(outs[0].reference_id, order.order.id);
    assert_eq!(outs[0].quantity, 3);

    let cart = app.workflow().get_cart(cart.id).await.unwrap();
    assert_eq!(cart.cart.status, CartStatus::Converted);
}

#[tokio::test]
async fn a_short_line_rolls_back_the_whole_request() {
    let app = TestApp::new().await;
    let plenty = app.seed_stock(5).await;
    let scarce = app.seed_stock(1).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();

    let result = app
        .workflow()
        .add_items_to_cart(
            cart.id,
            vec![line(&plenty, 2, dec!(4.00)), line(&scarce, 2, dec!(4.00))],
        )
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));

    let plenty_after = app.stock(plenty.id).await;
    assert_eq!(plenty_after.reserved_quantity, 0);
    assert_eq!(plenty_after.updated_at, plenty.updated_at);
    assert!(app.movements(plenty.id).await.is_empty());
    assert!(app.movements(scarce.id).await.is_empty());

    let cart = app.workflow().get_cart(cart.id).await.unwrap();
    assert!(cart.items.is_empty());
    assert_eq!(cart.cart.subtotal, dec!(0));
}

#[tokio::test]
async fn concurrent_carts_never_oversell_the_last_unit() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(1).await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let workflow = app.workflow().clone();
        let item = line(&stock, 1, dec!(3.00));
        handles.push(tokio::spawn(async move {
            let cart = workflow
                .create_cart(&format!("cus_{}", i), "usd")
                .await
                .expect("cart");
            workflow.add_items_to_cart(cart.id, vec![item]).await
        }));
    }

    let mut success = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => success += 1,
            Err(e) => assert_matches!(
                e,
                ServiceError::InsufficientStock(_) | ServiceError::RetriesExhausted { .. }
            ),
        }
    }

    assert_eq!(success, 1, "exactly one cart should get the last unit");
    let after = app.stock(stock.id).await;
    assert_eq!(after.reserved_quantity, 1);
    assert!(after.reserved_quantity <= after.quantity);
}

#[tokio::test]
async fn overlapping_transactions_never_oversell_the_last_unit() {
    let app = TestApp::with_connections(5).await;
    let stock = app.seed_stock(1).await;

    let mut carts = Vec::new();
    for i in 0..5 {
        let cart = app
            .workflow()
            .create_cart(&format!("cus_{}", i), "usd")
            .await
            .unwrap();
        carts.push(cart.id);
    }

    let barrier = Arc::new(Barrier::new(carts.len()));
    let mut handles = Vec::new();
    for cart_id in carts.iter().copied() {
        let workflow = app.workflow().clone();
        let barrier = Arc::clone(&barrier);
        let item = line(&stock, 1, dec!(3.00));
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            workflow.add_items_to_cart(cart_id, vec![item]).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(view) => winners.push(view.cart.id),
            Err(e) => assert_matches!(
                e,
                ServiceError::InsufficientStock(_) | ServiceError::RetriesExhausted { .. }
            ),
        }
    }

    assert_eq!(winners.len(), 1, "exactly one cart should get the last unit");
    let after = app.stock(stock.id).await;
    assert_eq!((after.quantity, after.reserved_quantity), (1, 1));
    let movements = app.movements(stock.id).await;
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].reference_id, winners[0]);

    for cart_id in carts.into_iter().filter(|id| *id != winners[0]) {
        assert!(app.workflow().get_cart(cart_id).await.unwrap().items.is_empty());
    }
}

#[tokio::test]
async fn adding_the_same_product_twice_merges_the_line() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(10).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();

    app.workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 2, dec!(5.00))])
        .await
        .unwrap();
    let view = app
        .workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 2, dec!(5.00))])
        .await
        .unwrap();

    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].quantity, 4);
    assert_eq!(view.cart.subtotal, dec!(20.00));
    assert_eq!(app.stock(stock.id).await.reserved_quantity, 4);
    assert_eq!(app.movements(stock.id).await.len(), 2);
}

#[tokio::test]
async fn quantity_updates_reserve_or_release_the_difference() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(6).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();
    let view = app
        .workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 2, dec!(1.50))])
        .await
        .unwrap();
    let item_id = view.items[0].id;

    let view = app
        .workflow()
        .update_cart_item_quantity(cart.id, item_id, 5)
        .await
        .unwrap();
    assert_eq!(view.items[0].quantity, 5);
    assert_eq!(view.cart.subtotal, dec!(7.50));
    assert_eq!(app.stock(stock.id).await.reserved_quantity, 5);

    assert_matches!(
        app.workflow()
            .update_cart_item_quantity(cart.id, item_id, 7)
            .await,
        Err(ServiceError::InsufficientStock(_))
    );
    assert_matches!(
        app.workflow()
            .update_cart_item_quantity(cart.id, item_id, -1)
            .await,
        Err(ServiceError::ValidationError(_))
    );

    app.workflow()
        .update_cart_item_quantity(cart.id, item_id, 1)
        .await
        .unwrap();
    assert_eq!(app.stock(stock.id).await.reserved_quantity, 1);

    let view = app
        .workflow()
        .update_cart_item_quantity(cart.id, item_id, 0)
        .await
        .unwrap();
    assert!(view.items.is_empty());
    assert_eq!(app.stock(stock.id).await.reserved_quantity, 0);

    let kinds: Vec<_> = app
        .movements(stock.id)
        .await
        .into_iter()
        .map(|m| (m.movement_type, m.quantity))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (MovementType::Reserve, 2),
            (MovementType::Reserve, 3),
            (MovementType::Release, 4),
            (MovementType::Release, 1),
        ]
    );
}

#[tokio::test]
async fn removing_a_line_releases_its_reservation() {
    let app = TestApp::new().await;
    let first = app.seed_stock(4).await;
    let second = app.seed_stock(4).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();
    let view = app
        .workflow()
        .add_items_to_cart(
            cart.id,
            vec![line(&first, 1, dec!(2.00)), line(&second, 3, dec!(1.00))],
        )
        .await
        .unwrap();
    let second_line = view
        .items
        .iter()
        .find(|item| item.stock_id == second.id)
        .unwrap()
        .id;

    let view = app
        .workflow()
        .remove_item_from_cart(cart.id, second_line)
        .await
        .unwrap();
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.cart.subtotal, dec!(2.00));
    assert_eq!(app.stock(first.id).await.reserved_quantity, 1);
    assert_eq!(app.stock(second.id).await.reserved_quantity, 0);
}

#[tokio::test]
async fn clearing_a_cart_releases_everything_and_keeps_it_open() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(5).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();
    app.workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 4, dec!(1.00))])
        .await
        .unwrap();

    assert_matches!(
        app.workflow()
            .clear_cart(cart.id, CartStatus::Converted)
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let view = app
        .workflow()
        .clear_cart(cart.id, CartStatus::Active)
        .await
        .unwrap();
    assert!(view.items.is_empty());
    assert_eq!(view.cart.status, CartStatus::Active);
    assert_eq!(view.cart.total, dec!(0));
    assert_eq!(app.stock(stock.id).await.reserved_quantity, 0);
}

#[tokio::test]
async fn expired_carts_are_abandoned_and_new_items_go_to_a_fresh_cart() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(5).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();
    app.workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 2, dec!(1.00))])
        .await
        .unwrap();

    assert_eq!(app.workflow().abandon_expired_carts(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + Duration::days(8);
    assert_eq!(app.workflow().abandon_expired_carts(later).await.unwrap(), 1);

    let abandoned = app.workflow().get_cart(cart.id).await.unwrap();
    assert_eq!(abandoned.cart.status, CartStatus::Abandoned);
    assert_eq!(app.stock(stock.id).await.reserved_quantity, 0);

    let view = app
        .workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 1, dec!(1.00))])
        .await
        .unwrap();
    assert_ne!(view.cart.id, cart.id);
    assert_eq!(view.cart.status, CartStatus::Active);
    assert_eq!(view.cart.customer_id, "cus_1");
}

#[tokio::test]
async fn only_active_carts_with_items_convert() {
    let app = TestApp::new().await;
    let stock = app.seed_stock(5).await;
    let cart = app.workflow().create_cart("cus_1", "usd").await.unwrap();

    assert_matches!(
        app.workflow().convert_cart_to_order(cart.id).await,
        Err(ServiceError::ValidationError(_))
    );

    app.workflow()
        .add_items_to_cart(cart.id, vec![line(&stock, 1, dec!(1.00))])
        .await
        .unwrap();
    app.workflow().convert_cart_to_order(cart.id).await.unwrap();
    assert_matches!(
        app.workflow().convert_cart_to_order(cart.id).await,
        Err(ServiceError::InvalidOperation(_))
    );
    assert_eq!(app.stock(stock.id).await.quantity, 4);
}

#[tokio::test]
async fn one_active_cart_per_customer() {
    let app = TestApp::new().await;
    let first = app
        .workflow()
        .get_or_create_active_cart("cus_1", "usd")
        .await
        .unwrap();
    let again = app
        .workflow()
        .get_or_create_active_cart("cus_1", "usd")
        .await
        .unwrap();
    assert_eq!(first.id, again.id);

    assert_matches!(
        app.workflow().create_cart("cus_1", "dollars").await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        app.workflow().create_cart("  ", "usd").await,
        Err(ServiceError::ValidationError(_))
    );
}
