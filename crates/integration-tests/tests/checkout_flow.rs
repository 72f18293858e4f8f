//! Checkout submission, payment and confirmation through the router.

#![allow(clippy::unwrap_used)]

use axum::http::StatusCode;
use serde_json::Value;

use composable_core::{CartId, CheckoutStage, CustomerId, OrderId};
use composable_integration_tests::{FailPoint, TestApp, account_form, guest_form};
use composable_storefront::commerce::{CartItemKind, CheckoutCustomer, Order};
use composable_storefront::session::cookies::names;

fn order_of(app: &TestApp, data: &Value) -> Order {
    let order_id = OrderId::new(data["order_id"].as_str().unwrap());
    app.commerce.order(&order_id).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let response = app.get("/health").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(app.get("/health/ready").await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_guest_checkout_end_to_end() {
    let app = TestApp::new();
    let cart_id = app.start_cart(&[("i1", 2, 1000), ("i2", 1, 500)]);

    let response = app.post("/api/checkout", guest_form("standard")).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());

    let data = response.data();
    assert_eq!(data["status"], "completed");
    assert_eq!(data["redirect_url"], "/checkout/confirmation");

    let order = order_of(&app, &data);
    assert_eq!(order.contact.email, "ada@example.com");
    assert!(order.items.iter().all(|i| i.kind != CartItemKind::CustomItem));
    assert_eq!(app.commerce.calls_named("confirm_payment"), 1);
    assert_eq!(app.processor.confirmations(), 1);

    let new_cart = response.set_cookie(names::CART).unwrap();
    assert_ne!(new_cart, cart_id.as_str());
    assert!(app.commerce.cart(&cart_id).unwrap().items.is_empty());
    assert!(app.commerce.cart(&CartId::new(new_cart)).is_some());

    let record = app.store.only().unwrap();
    assert_eq!(record.stage, CheckoutStage::Fulfilled);

    let page = app.get("/checkout/confirmation").await;
    assert_eq!(page.status, StatusCode::OK);
    let html = page.text();
    assert!(html.contains("Thank you for your order"));
    assert!(html.contains(&order.id.to_string()));
    assert!(html.contains("ada@example.com"));
}

#[tokio::test]
async fn test_standard_shipping_adds_no_line() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000)]);

    let data = app.post("/api/checkout", guest_form("standard")).await.data();
    let order = order_of(&app, &data);
    assert_eq!(order.items.len(), 1);
    assert_eq!(app.commerce.calls_named("add_custom_item"), 0);
}

#[tokio::test]
async fn test_express_shipping_adds_one_priced_line() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000)]);

    let data = app.post("/api/checkout", guest_form("express")).await.data();
    let order = order_of(&app, &data);

    let shipping: Vec<_> = order
        .items
        .iter()
        .filter(|i| i.kind == CartItemKind::CustomItem)
        .collect();
    assert_eq!(shipping.len(), 1);
    assert_eq!(shipping[0].name, "Shipping");
    assert_eq!(shipping[0].unit_price.amount, 599);
    assert_eq!(shipping[0].quantity, 1);

    let html = app.get("/checkout/confirmation").await.text();
    assert!(html.contains("Express: $5.99"));
}

#[tokio::test]
async fn test_account_checkout() {
    let app = TestApp::new();
    app.commerce
        .seed_account("acc-1", "Analytical Engines", Some("cus_1"));
    app.start_cart(&[("i1", 1, 1000)]);
    app.sign_in();

    let defaults = app.get("/api/checkout/defaults").await.data();
    assert_eq!(defaults["identity"]["kind"], "account");
    assert_eq!(defaults["identity"]["name"], "Analytical Engines");

    let response = app.post("/api/checkout", account_form("express")).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    let order = order_of(&app, &response.data());

    let (request, member) = app.commerce.last_checkout().unwrap();
    assert!(matches!(request.customer, CheckoutCustomer::Account { .. }));
    assert_eq!(member.as_deref(), Some("mem-1"));

    let shipping: Vec<_> = order
        .items
        .iter()
        .filter(|i| i.kind == CartItemKind::CustomItem)
        .collect();
    assert_eq!(shipping.len(), 1);
    assert_eq!(shipping[0].unit_price.amount, 599);

    let payment = app.commerce.last_payment().unwrap();
    assert_eq!(payment.options.customer, Some(CustomerId::new("cus_1")));
    assert_eq!(app.processor.attached().len(), 1);
}

#[tokio::test]
async fn test_guest_card_is_charged() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000)]);
    let mut form = guest_form("standard");
    form["card_token"] = "tok_visa".into();

    let response = app.post("/api/checkout", form).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    assert_eq!(response.data()["status"], "completed");

    let payment = app.commerce.last_payment().unwrap();
    let method = payment.options.payment_method.unwrap();
    assert!(payment.options.customer.is_none());
    assert_eq!(app.processor.confirmed_with(), vec![Some(method)]);
    assert!(app.processor.attached().is_empty());
}

#[tokio::test]
async fn test_guest_identity_rejected_when_signed_in() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000)]);
    app.sign_in();

    let response = app.post("/api/checkout", guest_form("standard")).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(response.json()["fields"]["identity"].is_string());
    assert_eq!(app.commerce.calls_named("checkout"), 0);
}

#[tokio::test]
async fn test_declined_payment_shows_error_and_keeps_cart() {
    let app = TestApp::new();
    let cart_id = app.start_cart(&[("i1", 1, 1000)]);
    app.commerce
        .fail_on(FailPoint::CreatePayment("Card declined".into()));

    let response = app.post("/api/checkout", guest_form("standard")).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.json()["error"], "Card declined");
    assert!(response.set_cookie(names::CART).is_none());

    assert_eq!(app.commerce.calls_named("confirm_payment"), 0);
    assert_eq!(app.processor.confirmations(), 0);
    assert_eq!(app.cookie(names::CART).as_deref(), Some(cart_id.as_str()));
    assert_eq!(app.commerce.cart(&cart_id).unwrap().items.len(), 1);

    let html = app.get("/checkout/confirmation").await.text();
    assert!(html.contains("No recent order"));
}

#[tokio::test]
async fn test_unassigned_items_block_checkout() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000), ("i2", 1, 500)]);
    app.enable_shipping_groups();

    let response = app.post("/api/checkout", guest_form("standard")).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        response.json()["error"],
        "2 items still need a delivery address"
    );
    assert_eq!(app.commerce.calls_named("checkout"), 0);
}

#[tokio::test]
async fn test_checkout_without_cart() {
    let app = TestApp::new();
    let response = app.post("/api/checkout", guest_form("standard")).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.json()["error"], "Your cart is empty");
}

#[tokio::test]
async fn test_action_required_then_resume() {
    let app = TestApp::new();
    let cart_id = app.start_cart(&[("i1", 1, 1000)]);
    app.processor.require_action("https://bank.test/3ds");

    let data = app.post("/api/checkout", guest_form("standard")).await.data();
    assert_eq!(data["status"], "action_required");
    assert_eq!(data["redirect_url"], "https://bank.test/3ds");
    let checkout_id = data["checkout_id"].as_str().unwrap().to_string();
    assert_eq!(app.cookie(names::CART).as_deref(), Some(cart_id.as_str()));
    assert_eq!(app.commerce.calls_named("confirm_payment"), 0);

    app.processor.succeed();
    let response = app
        .post(&format!("/api/checkout/{checkout_id}/resume"), Value::Null)
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    let data = response.data();
    assert_eq!(data["status"], "completed");
    assert_eq!(data["checkout_id"], checkout_id.as_str());

    assert_eq!(app.commerce.calls_named("checkout"), 1);
    assert_eq!(app.commerce.calls_named("create_payment"), 1);
    assert_eq!(app.commerce.calls_named("confirm_payment"), 1);
    assert_eq!(app.processor.status_checks(), 1);
    assert_ne!(app.cookie(names::CART).as_deref(), Some(cart_id.as_str()));
}

#[tokio::test]
async fn test_return_from_authentication_completes_on_confirmation_page() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000)]);
    app.processor.require_action("https://bank.test/3ds");

    let data = app.post("/api/checkout", guest_form("standard")).await.data();
    let checkout_id = data["checkout_id"].as_str().unwrap().to_string();

    app.processor.succeed();
    let page = app
        .get(&format!("/checkout/confirmation?checkout={checkout_id}"))
        .await;
    assert_eq!(page.status, StatusCode::OK);
    assert!(page.text().contains("Thank you for your order"));
    assert!(page.set_cookie(names::CART).is_some());
    assert_eq!(app.store.only().unwrap().stage, CheckoutStage::Fulfilled);

    // A reload shows the stored confirmation without resuming again.
    let reload = app
        .get(&format!("/checkout/confirmation?checkout={checkout_id}"))
        .await;
    assert!(reload.text().contains("Thank you for your order"));
    assert_eq!(app.processor.status_checks(), 1);
}

#[tokio::test]
async fn test_return_while_still_unauthenticated() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000)]);
    app.processor.require_action("https://bank.test/3ds");

    let data = app.post("/api/checkout", guest_form("standard")).await.data();
    let checkout_id = data["checkout_id"].as_str().unwrap().to_string();

    let html = app
        .get(&format!("/checkout/confirmation?checkout={checkout_id}"))
        .await
        .text();
    assert!(html.contains("Payment not completed"));
    assert!(html.contains("still needs to be authorised"));
}

#[tokio::test]
async fn test_resume_from_another_session_is_not_found() {
    let app = TestApp::new();
    app.start_cart(&[("i1", 1, 1000)]);
    app.processor.require_action("https://bank.test/3ds");

    let data = app.post("/api/checkout", guest_form("standard")).await.data();
    let checkout_id = data["checkout_id"].as_str().unwrap().to_string();

    app.start_cart(&[("other", 1, 100)]);
    let response = app
        .post(&format!("/api/checkout/{checkout_id}/resume"), Value::Null)
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()["error"], "Checkout not found");
}

#[tokio::test]
async fn test_confirmation_page_without_order() {
    let app = TestApp::new();
    let page = app.get("/checkout/confirmation").await;
    assert_eq!(page.status, StatusCode::OK);
    assert!(page.text().contains("No recent order"));
}
