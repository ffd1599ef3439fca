//! Gateway round trips against mocked provider APIs: initiate at checkout,
//! then confirm through the callback endpoint exactly once.

mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, TestApp};
use hmac::{Hmac, Mac};
use marketplace_api::config::{PaymentsConfig, PaymobConfig, PaypalConfig, StripeConfig};
use marketplace_api::entities::invoice;
use marketplace_api::entities::order::OrderStatus;
use marketplace_api::entities::payment::PaymentStatus;
use marketplace_api::events::Event;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WEBHOOK_SECRET: &str = "whsec_integration";

fn stripe_payments(server: &MockServer) -> PaymentsConfig {
    PaymentsConfig {
        stripe: Some(StripeConfig {
            secret_key: "sk_test_integration".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            api_base: server.uri(),
            currency: None,
            webhook_tolerance_secs: 300,
        }),
        ..PaymentsConfig::default()
    }
}

fn stripe_signature(payload: &str) -> String {
    let ts = chrono::Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{ts}.").as_bytes());
    mac.update(payload.as_bytes());
    format!("t={},v1={}", ts, hex::encode(mac.finalize().into_bytes()))
}

async fn invoice_count(app: &TestApp, order_id: Uuid) -> u64 {
    invoice::Entity::find()
        .filter(invoice::Column::OrderId.eq(order_id))
        .count(app.db())
        .await
        .unwrap()
}

/// Places an order for one unit through the HTTP surface and returns its id.
async fn place_order(app: &TestApp, user_id: Uuid, variant_id: Uuid, method: &str) -> (Uuid, Value) {
    let address = app.seed_address(user_id).await;
    app.add_to_cart(user_id, variant_id, 1).await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(&app.token(user_id)),
            Some(json!({ "shipping_address_id": address.id, "payment_method": method })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    let order_id = body["data"]["order"]["id"].as_str().unwrap().parse().unwrap();
    (order_id, body)
}

async fn post_callback(app: &TestApp, gateway: &str, payload: &str, headers: &[(&str, &str)]) -> axum::response::Response {
    let mut builder = axum::http::Request::builder()
        .method(Method::POST)
        .uri(format!("/api/v1/payments/callback/{gateway}"))
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    app.send(builder.body(axum::body::Body::from(payload.to_string())).unwrap())
        .await
}

#[tokio::test]
async fn stripe_checkout_is_confirmed_once_by_signed_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .and(header("authorization", "Bearer sk_test_integration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_test_123",
            "url": "https://checkout.stripe.test/pay/cs_test_123"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_payments(stripe_payments(&server)).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(25), 3).await;
    let (order_id, placed) = place_order(&app, user_id, variant.id, "stripe").await;

    assert_eq!(placed["data"]["payment"]["status"], "pending");
    assert_eq!(
        placed["data"]["payment_action"]["redirect_url"],
        "https://checkout.stripe.test/pay/cs_test_123"
    );
    assert!(placed["data"].get("invoice").is_none());
    assert_eq!(app.variant(variant.id).await.stock, 3, "stock waits for payment");

    let payload = json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_test_123",
            "payment_status": "paid",
            "payment_intent": "pi_123",
            "metadata": { "order_id": order_id.to_string() }
        }}
    })
    .to_string();

    let response = post_callback(&app, "stripe", &payload, &[("Stripe-Signature", &stripe_signature(&payload))]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "processed");
    assert_eq!(body["order_id"], order_id.to_string());

    assert_eq!(app.order(order_id).await.status, OrderStatus::Paid);
    let payment = app.payment_for(order_id).await;
    assert_eq!(payment.status, PaymentStatus::Success);
    assert_eq!(payment.transaction_id.as_deref(), Some("pi_123"));
    assert_eq!(app.variant(variant.id).await.stock, 2);
    assert_eq!(invoice_count(&app, order_id).await, 1);

    // Stripe retries deliveries; a replay must not touch stock or invoices.
    let replay = post_callback(&app, "stripe", &payload, &[("Stripe-Signature", &stripe_signature(&payload))]).await;
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(response_json(replay).await["status"], "already_processed");
    assert_eq!(app.variant(variant.id).await.stock, 2);
    assert_eq!(invoice_count(&app, order_id).await, 1);

    let confirmations = app
        .drain_events()
        .await
        .into_iter()
        .filter(|e| matches!(e, Event::OrderConfirmed { .. }))
        .count();
    assert_eq!(confirmations, 1);
}

#[tokio::test]
async fn stripe_webhook_with_bad_signature_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "cs_bad", "url": null })))
        .mount(&server)
        .await;

    let app = TestApp::with_payments(stripe_payments(&server)).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(10), 1).await;
    let (order_id, _) = place_order(&app, user_id, variant.id, "stripe").await;

    let payload = json!({
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_bad", "metadata": { "order_id": order_id.to_string() } } }
    })
    .to_string();
    let forged = format!("t={},v1={}", chrono::Utc::now().timestamp(), "00".repeat(32));

    let response = post_callback(&app, "stripe", &payload, &[("Stripe-Signature", &forged)]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let unsigned = post_callback(&app, "stripe", &payload, &[]).await;
    assert_eq!(unsigned.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.order(order_id).await.status, OrderStatus::Pending);
    assert_eq!(app.payment_for(order_id).await.status, PaymentStatus::Pending);
    assert_eq!(app.variant(variant.id).await.stock, 1);
}

#[tokio::test]
async fn stripe_failed_payment_is_recorded_without_confirming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "cs_fail", "url": "https://x.test" })))
        .mount(&server)
        .await;

    let app = TestApp::with_payments(stripe_payments(&server)).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(10), 4).await;
    let (order_id, _) = place_order(&app, user_id, variant.id, "stripe").await;

    let payload = json!({
        "type": "payment_intent.payment_failed",
        "data": { "object": { "id": "pi_fail", "metadata": { "order_id": order_id.to_string() } } }
    })
    .to_string();
    let response = post_callback(&app, "stripe", &payload, &[("Stripe-Signature", &stripe_signature(&payload))]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "recorded");

    assert_eq!(app.order(order_id).await.status, OrderStatus::Pending);
    assert_eq!(app.payment_for(order_id).await.status, PaymentStatus::Failed);
    assert_eq!(app.variant(variant.id).await.stock, 4);
    assert_eq!(invoice_count(&app, order_id).await, 0);
    assert!(app
        .drain_events()
        .await
        .iter()
        .any(|e| matches!(e, Event::PaymentFailed { .. })));
}

#[tokio::test]
async fn unrelated_stripe_events_are_ignored() {
    let server = MockServer::start().await;
    let app = TestApp::with_payments(stripe_payments(&server)).await;
    let payload = json!({ "type": "customer.created", "data": { "object": { "id": "cus_1" } } }).to_string();
    let response = post_callback(&app, "stripe", &payload, &[("Stripe-Signature", &stripe_signature(&payload))]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "ignored");
}

#[tokio::test]
async fn callback_for_unconfigured_gateway_is_rejected() {
    let app = TestApp::new().await;
    let response = post_callback(&app, "paymob", "{}", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn paypal_return_captures_and_confirms_the_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A21-test",
            "token_type": "Bearer",
            "expires_in": 32400
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .and(header("authorization", "Bearer A21-test"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "PP-ORDER-1",
            "status": "PAYER_ACTION_REQUIRED",
            "links": [
                { "href": "https://api.paypal.test/v2/checkout/orders/PP-ORDER-1", "rel": "self" },
                { "href": "https://paypal.test/checkoutnow?token=PP-ORDER-1", "rel": "payer-action" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/PP-ORDER-1/capture"))
        .and(header("PayPal-Request-Id", "capture-PP-ORDER-1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "PP-ORDER-1",
            "status": "COMPLETED",
            "purchase_units": [{ "payments": { "captures": [{ "id": "CAPTURE-9", "status": "COMPLETED" }] } }]
        })))
        .mount(&server)
        .await;

    let payments = PaymentsConfig {
        paypal: Some(PaypalConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            api_base: server.uri(),
            currency: None,
        }),
        ..PaymentsConfig::default()
    };
    let app = TestApp::with_payments(payments).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(12.50), 2).await;
    let (order_id, placed) = place_order(&app, user_id, variant.id, "paypal").await;

    assert_eq!(
        placed["data"]["payment_action"]["redirect_url"],
        "https://paypal.test/checkoutnow?token=PP-ORDER-1"
    );
    assert_eq!(placed["data"]["payment"]["gateway_order_id"], "PP-ORDER-1");
    assert_eq!(placed["data"]["payment"]["provider"], "PayPal");

    let response = app
        .request(
            Method::GET,
            "/api/v1/payments/callback/paypal?token=PP-ORDER-1&PayerID=PAYER1",
            None,
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "processed");

    let payment = app.payment_for(order_id).await;
    assert_eq!(payment.status, PaymentStatus::Success);
    assert_eq!(payment.transaction_id.as_deref(), Some("CAPTURE-9"));
    assert_eq!(app.order(order_id).await.status, OrderStatus::Paid);
    assert_eq!(app.variant(variant.id).await.stock, 1);
}

/// Paymob sandbox with auth, invoice creation (order 9001) and the given transactions.
async fn paymob_server(transactions: &[(&str, bool)]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/tokens"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "token": "paymob-auth" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ecommerce/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 9001,
            "url": "https://accept.paymob.test/invoice/9001"
        })))
        .mount(&server)
        .await;
    for (id, success) in transactions {
        Mock::given(method("GET"))
            .and(path(format!("/api/acceptance/transactions/{id}")))
            .and(header("authorization", "Bearer paymob-auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": id.parse::<i64>().unwrap(),
                "success": success,
                "pending": false,
                "order": { "id": 9001 }
            })))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/acceptance/transactions/.+$"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "detail": "Not found." })))
        .with_priority(10)
        .mount(&server)
        .await;
    server
}

fn paymob_payments(server: &MockServer) -> PaymentsConfig {
    PaymentsConfig {
        paymob: Some(PaymobConfig {
            api_key: "paymob-key".to_string(),
            api_base: server.uri(),
            currency: Some("EGP".to_string()),
            integrations: vec![4242],
            token_ttl_secs: 3000,
        }),
        ..PaymentsConfig::default()
    }
}

#[tokio::test]
async fn paymob_webhook_confirms_and_late_failure_does_not_downgrade() {
    let server = paymob_server(&[("777001", true), ("777002", false)]).await;
    let app = TestApp::with_payments(paymob_payments(&server)).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(300), 5).await;
    let (order_id, placed) = place_order(&app, user_id, variant.id, "paymob").await;
    assert_eq!(placed["data"]["payment"]["gateway_order_id"], "9001");

    let webhook = json!({
        "type": "TRANSACTION",
        "obj": { "id": 777001, "success": true, "order": { "id": 9001 } }
    })
    .to_string();
    let response = post_callback(&app, "paymob", &webhook, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "processed");
    assert_eq!(app.variant(variant.id).await.stock, 4);

    let late = app
        .request(
            Method::GET,
            "/api/v1/payments/callback/paymob?success=false&order=9001&id=777002",
            None,
            None,
        )
        .await;
    assert_eq!(late.status(), StatusCode::OK);
    assert_eq!(response_json(late).await["status"], "already_processed");

    let payment = app.payment_for(order_id).await;
    assert_eq!(payment.status, PaymentStatus::Success);
    assert_eq!(payment.transaction_id.as_deref(), Some("777001"));
    assert_eq!(app.order(order_id).await.status, OrderStatus::Paid);
    assert_eq!(app.variant(variant.id).await.stock, 4);
}

#[tokio::test]
async fn paymob_callback_claims_are_checked_against_paymob() {
    let server = paymob_server(&[("777003", false)]).await;
    let app = TestApp::with_payments(paymob_payments(&server)).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(40), 5).await;
    let (order_id, _) = place_order(&app, user_id, variant.id, "paymob").await;

    // Paymob has never heard of this transaction.
    let forged = app
        .request(
            Method::GET,
            "/api/v1/payments/callback/paymob?success=true&order=9001&id=31337",
            None,
            None,
        )
        .await;
    assert_eq!(forged.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.order(order_id).await.status, OrderStatus::Pending);
    assert_eq!(app.payment_for(order_id).await.status, PaymentStatus::Pending);
    assert_eq!(app.variant(variant.id).await.stock, 5);

    // A real transaction that declined, reported as a success.
    let lying = app
        .request(
            Method::GET,
            "/api/v1/payments/callback/paymob?success=true&order=9001&id=777003",
            None,
            None,
        )
        .await;
    assert_eq!(lying.status(), StatusCode::OK);
    assert_eq!(response_json(lying).await["status"], "recorded");
    assert_eq!(app.payment_for(order_id).await.status, PaymentStatus::Failed);
    assert_eq!(app.order(order_id).await.status, OrderStatus::Pending);
    assert_eq!(app.variant(variant.id).await.stock, 5);
    assert_eq!(invoice_count(&app, order_id).await, 0);
}

#[tokio::test]
async fn captured_payment_survives_stock_shortage_at_confirmation() {
    let server = paymob_server(&[("777001", true)]).await;
    let app = TestApp::with_payments(paymob_payments(&server)).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(300), 5).await;
    let (order_id, _) = place_order(&app, user_id, variant.id, "paymob").await;

    // Sold elsewhere while the shopper was on the payment page.
    app.update_variant(variant.id, Some(0), None).await;

    let callback = "/api/v1/payments/callback/paymob?success=true&order=9001&id=777001";
    let response = app.request(Method::GET, callback, None, None).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let payment = app.payment_for(order_id).await;
    assert_eq!(payment.status, PaymentStatus::Success);
    assert_eq!(payment.transaction_id.as_deref(), Some("777001"));
    assert_eq!(app.order(order_id).await.status, OrderStatus::Pending);
    assert_eq!(app.variant(variant.id).await.stock, 0);
    assert_eq!(invoice_count(&app, order_id).await, 0);

    // Once restocked, the gateway's retry completes the confirmation.
    app.update_variant(variant.id, Some(2), None).await;
    let retry = app.request(Method::GET, callback, None, None).await;
    assert_eq!(retry.status(), StatusCode::OK);
    assert_eq!(response_json(retry).await["status"], "processed");
    assert_eq!(app.order(order_id).await.status, OrderStatus::Paid);
    assert_eq!(app.variant(variant.id).await.stock, 1);
    assert_eq!(invoice_count(&app, order_id).await, 1);
}

#[tokio::test]
async fn paypal_rejected_token_is_refreshed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A21-stale",
            "expires_in": 32400
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A21-fresh",
            "expires_in": 32400
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "PP-ORDER-2",
            "links": [{ "href": "https://paypal.test/checkoutnow?token=PP-ORDER-2", "rel": "payer-action" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/PP-ORDER-2/capture"))
        .and(header("authorization", "Bearer A21-stale"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "invalid_token" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/PP-ORDER-2/capture"))
        .and(header("authorization", "Bearer A21-fresh"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "PP-ORDER-2",
            "status": "COMPLETED",
            "purchase_units": [{ "payments": { "captures": [{ "id": "CAPTURE-2" }] } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let payments = PaymentsConfig {
        paypal: Some(PaypalConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            api_base: server.uri(),
            currency: None,
        }),
        ..PaymentsConfig::default()
    };
    let app = TestApp::with_payments(payments).await;
    let user_id = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(20), 2).await;
    let (order_id, _) = place_order(&app, user_id, variant.id, "paypal").await;

    let create = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path() == "/v2/checkout/orders")
        .expect("create request");
    assert_eq!(
        create.headers.get("paypal-request-id").unwrap().to_str().unwrap(),
        format!("create-{order_id}")
    );

    let response = app
        .request(Method::GET, "/api/v1/payments/callback/paypal?token=PP-ORDER-2", None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "processed");
    assert_eq!(
        app.payment_for(order_id).await.transaction_id.as_deref(),
        Some("CAPTURE-2")
    );
}

#[tokio::test]
async fn callback_for_unknown_payment_is_not_found() {
    let server = MockServer::start().await;
    let app = TestApp::with_payments(stripe_payments(&server)).await;
    let payload = json!({
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_ghost", "metadata": { "order_id": Uuid::new_v4().to_string() } } }
    })
    .to_string();
    let response = post_callback(&app, "stripe", &payload, &[("Stripe-Signature", &stripe_signature(&payload))]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
