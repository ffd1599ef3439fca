//! Guest and user carts over HTTP, including the cookie handshake and the
//! merge that runs after login.

mod common;

use axum::http::{Method, StatusCode};
use common::{decimal, response_json, set_cookie_pair, TestApp};
use marketplace_api::services::commerce::CartOwner;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn guest_receives_cookie_and_keeps_cart_across_requests() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(Uuid::new_v4(), dec!(9.99), 5).await;

    let first = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            None,
            Some(json!({ "variant_id": variant.id })),
        )
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    let cookie = set_cookie_pair(&first).expect("guest cookie issued");
    assert!(cookie.starts_with("guest_cart="));
    let raw_cookie = first.headers()["set-cookie"].to_str().unwrap().to_string();
    assert!(raw_cookie.contains("HttpOnly"));
    assert!(raw_cookie.contains("Max-Age=2592000"));

    let second = app
        .request_with_headers(
            Method::POST,
            "/api/v1/cart/items",
            None,
            Some(json!({ "variant_id": variant.id })),
            &[("cookie", &cookie)],
        )
        .await;
    assert_eq!(second.status(), StatusCode::OK);
    assert!(set_cookie_pair(&second).is_none(), "existing cart keeps its cookie");

    let body = response_json(second).await;
    assert_eq!(body["data"]["items_count"], 2);
    assert_eq!(body["data"]["items"][0]["quantity"], 2);
    assert_eq!(decimal(&body["data"]["subtotal"]), dec!(19.98));
}

#[tokio::test]
async fn quantity_never_exceeds_stock() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let token = app.token(user_id);
    let variant = app.seed_variant(Uuid::new_v4(), dec!(4), 2).await;

    for _ in 0..4 {
        let response = app
            .request(
                Method::POST,
                "/api/v1/cart/items",
                Some(&token),
                Some(json!({ "variant_id": variant.id })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let cart = response_json(app.request(Method::GET, "/api/v1/cart", Some(&token), None).await).await;
    assert_eq!(cart["data"]["items"][0]["quantity"], 2);
    let item_id = cart["data"]["items"][0]["id"].as_str().unwrap().to_string();

    let increment = app
        .request(
            Method::POST,
            &format!("/api/v1/cart/items/{item_id}/increment"),
            Some(&token),
            None,
        )
        .await;
    let body = response_json(increment).await;
    assert_eq!(body["data"]["items"][0]["quantity"], 2);
}

#[tokio::test]
async fn out_of_stock_variant_cannot_be_added() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(Uuid::new_v4(), dec!(4), 0).await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(&app.token(Uuid::new_v4())),
            Some(json!({ "variant_id": variant.id })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let missing = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(&app.token(Uuid::new_v4())),
            Some(json!({ "variant_id": Uuid::new_v4() })),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn decrement_to_zero_removes_the_line() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let token = app.token(user_id);
    let variant = app.seed_variant(Uuid::new_v4(), dec!(3), 10).await;
    app.add_to_cart(user_id, variant.id, 2).await;

    let cart = response_json(app.request(Method::GET, "/api/v1/cart", Some(&token), None).await).await;
    let item_id = cart["data"]["items"][0]["id"].as_str().unwrap().to_string();
    let path = format!("/api/v1/cart/items/{item_id}/decrement");

    let once = response_json(app.request(Method::POST, &path, Some(&token), None).await).await;
    assert_eq!(once["data"]["items"][0]["quantity"], 1);

    let twice = response_json(app.request(Method::POST, &path, Some(&token), None).await).await;
    assert_eq!(twice["data"]["items"].as_array().map(Vec::len), Some(0));
    assert_eq!(decimal(&twice["data"]["subtotal"]), dec!(0));
}

#[tokio::test]
async fn items_of_other_carts_are_not_reachable() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let variant = app.seed_variant(Uuid::new_v4(), dec!(3), 10).await;
    app.add_to_cart(owner, variant.id, 1).await;
    let cart = app
        .state
        .services
        .cart
        .get_or_create(CartOwner::User(owner))
        .await
        .unwrap();
    let item_id = cart.items[0].id;

    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/cart/items/{item_id}"),
            Some(&app.token(Uuid::new_v4())),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let still_there = app
        .state
        .services
        .cart
        .get_or_create(CartOwner::User(owner))
        .await
        .unwrap();
    assert_eq!(still_there.items_count, 1);
}

#[tokio::test]
async fn login_merges_guest_cart_and_clears_cookie() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let token = app.token(user_id);
    let shared = app.seed_variant(Uuid::new_v4(), dec!(10), 3).await;
    let guest_only = app.seed_variant(Uuid::new_v4(), dec!(5), 4).await;
    let sold_out = app.seed_variant(Uuid::new_v4(), dec!(7), 1).await;

    // The user already has two of `shared`.
    app.add_to_cart(user_id, shared.id, 2).await;

    let guest = app
        .state
        .services
        .cart
        .add_item(CartOwner::Guest(None), shared.id)
        .await
        .unwrap();
    let guest_token = guest.issued_guest_token.expect("guest token");
    let guest_owner = CartOwner::Guest(Some(guest_token));
    app.state.services.cart.add_item(guest_owner, shared.id).await.unwrap();
    app.state.services.cart.add_item(guest_owner, guest_only.id).await.unwrap();
    app.state.services.cart.add_item(guest_owner, sold_out.id).await.unwrap();

    // Sold out between the guest visit and the login.
    use sea_orm::{ActiveModelTrait, Set};
    let mut active: marketplace_api::entities::commerce::product_variant::ActiveModel =
        app.variant(sold_out.id).await.into();
    active.stock = Set(0);
    active.update(app.db()).await.unwrap();

    let cookie = format!("guest_cart={guest_token}");
    let response = app
        .request_with_headers(Method::POST, "/api/v1/cart/merge", Some(&token), None, &[("cookie", &cookie)])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cleared = response.headers()["set-cookie"].to_str().unwrap().to_string();
    assert!(cleared.starts_with("guest_cart=;"));
    assert!(cleared.contains("Max-Age=0"));

    let body = response_json(response).await;
    assert_eq!(body["data"]["merged"]["merged"], 2);
    assert_eq!(body["data"]["merged"]["skipped_out_of_stock"], 1);

    let items = body["data"]["cart"]["items"].as_array().unwrap().clone();
    let quantity_of = |variant_id: Uuid| {
        items
            .iter()
            .find(|i| i["variant_id"] == variant_id.to_string())
            .map(|i| i["quantity"].as_i64().unwrap())
    };
    assert_eq!(quantity_of(shared.id), Some(3), "capped at stock");
    assert_eq!(quantity_of(guest_only.id), Some(1));
    assert_eq!(quantity_of(sold_out.id), None);

    // The guest cart is gone; the old token now gets a fresh cart.
    let fresh = app
        .state
        .services
        .cart
        .get_or_create(guest_owner)
        .await
        .unwrap();
    assert_eq!(fresh.items_count, 0);
    assert!(fresh.issued_guest_token.is_some());
}

#[tokio::test]
async fn merge_without_guest_cookie_is_a_no_op() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let response = app
        .request(Method::POST, "/api/v1/cart/merge", Some(&app.token(user_id)), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["merged"]["merged"], 0);
    assert_eq!(body["data"]["cart"]["items_count"], 0);
}

#[tokio::test]
async fn merge_requires_login_and_bad_tokens_are_rejected() {
    let app = TestApp::new().await;
    let response = app.request(Method::POST, "/api/v1/cart/merge", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = app
        .request(Method::GET, "/api/v1/cart", Some("not-a-jwt"), None)
        .await;
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn merge_skips_deleted_variants_and_still_drops_guest_cart() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let kept = app.seed_variant(Uuid::new_v4(), dec!(6), 5).await;
    let discontinued = app.seed_variant(Uuid::new_v4(), dec!(8), 5).await;

    let guest = app
        .state
        .services
        .cart
        .add_item(CartOwner::Guest(None), discontinued.id)
        .await
        .unwrap();
    let guest_token = guest.issued_guest_token.expect("guest token");
    let guest_owner = CartOwner::Guest(Some(guest_token));
    app.state.services.cart.add_item(guest_owner, kept.id).await.unwrap();

    app.delete_variant_leaving_references(discontinued.id).await;

    let cookie = format!("guest_cart={guest_token}");
    let response = app
        .request_with_headers(
            Method::POST,
            "/api/v1/cart/merge",
            Some(&app.token(user_id)),
            None,
            &[("cookie", &cookie)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["merged"]["merged"], 1);
    assert_eq!(body["data"]["merged"]["skipped_unavailable"], 1);
    assert_eq!(body["data"]["cart"]["items_count"], 1);
    assert_eq!(body["data"]["cart"]["items"][0]["variant_id"], kept.id.to_string());

    let fresh = app
        .state
        .services
        .cart
        .get_or_create(guest_owner)
        .await
        .unwrap();
    assert_eq!(fresh.items_count, 0);
    assert!(fresh.issued_guest_token.is_some(), "guest cart was deleted");
}
