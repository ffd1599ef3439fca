#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use marketplace_api::{
    auth::issue_token,
    config::{AppConfig, PaymentsConfig},
    db,
    entities::{
        commerce::{product, product_variant},
        coupon::{self, DiscountType},
        order, payment, shipping_address,
        tax::{self, TaxType},
    },
    events::{Event, EventSender},
    services::addresses::CreateAddressInput,
    services::commerce::CartOwner,
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration_test_secret_with_enough_length";

/// Application backed by a throwaway SQLite file with migrations applied.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    events: Mutex<mpsc::Receiver<Event>>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_payments(PaymentsConfig::default()).await
    }

    pub async fn with_payments(payments: PaymentsConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("marketplace_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        cfg.db_max_connections = 4;
        cfg.db_min_connections = 1;
        cfg.payments = payments;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let state = AppState::new(Arc::new(pool), cfg, EventSender::new(event_tx))
            .expect("test state");

        Self {
            router: marketplace_api::app_router(state.clone()),
            state,
            events: Mutex::new(event_rx),
            _dir: dir,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    pub fn token(&self, user_id: Uuid) -> String {
        issue_token(JWT_SECRET, user_id, &[], chrono::Duration::hours(1)).expect("token")
    }

    pub fn vendor_token(&self, vendor_id: Uuid) -> String {
        issue_token(JWT_SECRET, vendor_id, &["vendor"], chrono::Duration::hours(1))
            .expect("token")
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        self.request_with_headers(method, path, token, body, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("request")).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    /// Events emitted so far, oldest first
    pub async fn drain_events(&self) -> Vec<Event> {
        let mut rx = self.events.lock().await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Creates an active product with one variant for `vendor_id`.
    pub async fn seed_variant(
        &self,
        vendor_id: Uuid,
        price: Decimal,
        stock: i32,
    ) -> product_variant::Model {
        let product_id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(product_id),
            vendor_id: Set(vendor_id),
            name: Set(format!("Product {}", &product_id.to_string()[..8])),
            slug: Set(format!("product-{}", product_id)),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert product");

        let variant_id = Uuid::new_v4();
        product_variant::ActiveModel {
            id: Set(variant_id),
            product_id: Set(product_id),
            sku: Set(format!("SKU-{}", &variant_id.to_string()[..8])),
            price: Set(price),
            discounted_price: Set(None),
            stock: Set(stock),
            is_default: Set(true),
            updated_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert variant")
    }

    pub async fn seed_tax(&self, name: &str, tax_type: TaxType, value: Decimal) -> tax::Model {
        tax::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            tax_type: Set(tax_type),
            value: Set(value),
            is_active: Set(true),
        }
        .insert(self.db())
        .await
        .expect("insert tax")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        min_order_amount: Decimal,
        first_order_only: bool,
    ) -> coupon::Model {
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            discount_type: Set(discount_type),
            value: Set(value),
            valid_from: Set(None),
            valid_to: Set(None),
            min_order_amount: Set(min_order_amount),
            first_order_only: Set(first_order_only),
            is_public: Set(true),
            is_active: Set(true),
            max_uses: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert coupon")
    }

    pub async fn seed_address(&self, user_id: Uuid) -> shipping_address::Model {
        self.state
            .services
            .addresses
            .create(
                user_id,
                CreateAddressInput {
                    full_name: "Ada Lovelace".to_string(),
                    phone_number: "+201000000000".to_string(),
                    address_line_1: "12 Analytical St".to_string(),
                    address_line_2: None,
                    city: "Cairo".to_string(),
                    state: None,
                    postal_code: Some("11511".to_string()),
                    country: "EG".to_string(),
                    instructions: None,
                    is_default: false,
                },
            )
            .await
            .expect("insert address")
    }

    /// Adds `quantity` units of a variant to the user's cart.
    pub async fn add_to_cart(&self, user_id: Uuid, variant_id: Uuid, quantity: i32) {
        for _ in 0..quantity {
            self.state
                .services
                .cart
                .add_item(CartOwner::User(user_id), variant_id)
                .await
                .expect("add to cart");
        }
    }

    pub async fn variant(&self, variant_id: Uuid) -> product_variant::Model {
        product_variant::Entity::find_by_id(variant_id)
            .one(self.db())
            .await
            .expect("query variant")
            .expect("variant exists")
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(self.db())
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn payment_for(&self, order_id: Uuid) -> payment::Model {
        payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(self.db())
            .await
            .expect("query payment")
            .expect("payment exists")
    }

    /// Deletes a variant as an external catalog write would, leaving any cart
    /// lines that point at it. Uses one connection so the pragma applies.
    pub async fn delete_variant_leaving_references(&self, variant_id: Uuid) {
        let mut options = sea_orm::ConnectOptions::new(self.state.config.database_url.clone());
        options.max_connections(1).min_connections(1).sqlx_logging(false);
        let conn = sea_orm::Database::connect(options)
            .await
            .expect("side connection");
        conn.execute_unprepared("PRAGMA foreign_keys = OFF")
            .await
            .expect("disable foreign keys");
        product_variant::Entity::delete_by_id(variant_id)
            .exec(&conn)
            .await
            .expect("delete variant");
        conn.close().await.expect("close side connection");
    }

    /// Sets a variant's stock or price directly, as the catalog service would.
    pub async fn update_variant(&self, variant_id: Uuid, stock: Option<i32>, price: Option<Decimal>) {
        let mut active: product_variant::ActiveModel = self.variant(variant_id).await.into();
        if let Some(stock) = stock {
            active.stock = Set(stock);
        }
        if let Some(price) = price {
            active.price = Set(price);
        }
        active.update(self.db()).await.expect("update variant");
    }

    pub async fn order_count(&self, user_id: Uuid) -> usize {
        order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .all(self.db())
            .await
            .expect("query orders")
            .len()
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(response.status(), expected, "unexpected status");
}

/// Cookie value pair (`name=value`) from the first `Set-Cookie` header
pub fn set_cookie_pair(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|pair| pair.trim().to_string())
}

/// Reads a decimal serialized as a JSON string or number.
pub fn decimal(value: &Value) -> Decimal {
    use std::str::FromStr;
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}
