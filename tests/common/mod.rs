//! Shared test harness.
//!
//! Boots the real application stack against an in-memory SQLite database:
//! the same router, services, and migrations the binary wires up. Each
//! `TestApp` holds a pool of exactly one connection, so every test gets a
//! private database that disappears when the app is dropped.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use tradebook_api::config::AppConfig;
use tradebook_api::db::{establish_connection_from_app_config, run_migrations};
use tradebook_api::entities::stock_movement::MovementType;
use tradebook_api::events::{process_events, EventSender};
use tradebook_api::handlers::AppServices;
use tradebook_api::services::parties::{CreateCustomerRequest, CreateSupplierRequest};
use tradebook_api::services::products::CreateProductRequest;
use tradebook_api::services::stock::StockUpdateInput;
use tradebook_api::AppState;

pub struct TestApp {
    router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        // A single connection keeps the in-memory database alive and private
        // to this TestApp for the whole test.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let db = establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to open in-memory database");
        run_migrations(&db).await.expect("migrations failed");
        let db = Arc::new(db);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(process_events(event_rx));

        let services = AppServices::new(db.clone(), Some(event_sender.clone()), &cfg);
        let state = AppState {
            db,
            config: cfg,
            event_sender,
            services,
        };

        let router = Router::new()
            .route("/health", get(tradebook_api::health_check))
            .nest("/api/v1", tradebook_api::api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request_as(method, uri, body, None).await
    }

    pub async fn request_as(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        actor: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        if let Some(actor) = actor {
            builder = builder.header("x-actor-id", actor);
        }
        let request = builder
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .expect("failed to build request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router call failed")
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> Response {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn put(&self, uri: &str, body: Value) -> Response {
        self.request(Method::PUT, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> Response {
        self.request(Method::DELETE, uri, None).await
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response body was not JSON")
}

pub fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

pub async fn seed_customer(app: &TestApp, name: &str, credit_limit: i64) -> Uuid {
    let customer = app
        .state
        .services
        .parties
        .create_customer(CreateCustomerRequest {
            name: name.to_string(),
            email: None,
            phone: None,
            credit_limit: Some(dec(credit_limit)),
        })
        .await
        .expect("failed to seed customer");
    customer.id
}

pub async fn seed_supplier(app: &TestApp, name: &str, credit_limit: i64) -> Uuid {
    let supplier = app
        .state
        .services
        .parties
        .create_supplier(CreateSupplierRequest {
            name: name.to_string(),
            company_name: None,
            email: None,
            phone: None,
            credit_limit: Some(dec(credit_limit)),
        })
        .await
        .expect("failed to seed supplier");
    supplier.id
}

pub async fn seed_product(app: &TestApp, sku: &str, unit_price: i64, unit_cost: i64) -> Uuid {
    let product = app
        .state
        .services
        .products
        .create_product(CreateProductRequest {
            sku: sku.to_string(),
            name: format!("Product {}", sku),
            category: None,
            unit_price: dec(unit_price),
            unit_cost: dec(unit_cost),
        })
        .await
        .expect("failed to seed product");
    product.id
}

/// Brings `quantity` units into stock at `unit_cost`, the way an opening
/// balance would be captured before any documents exist.
pub async fn seed_stock(app: &TestApp, product_id: Uuid, quantity: i64, unit_cost: i64) {
    app.state
        .services
        .stock
        .update_stock(StockUpdateInput {
            product_id,
            movement_type: MovementType::In,
            quantity: dec(quantity),
            unit_cost: Some(dec(unit_cost)),
            reason: "opening stock".to_string(),
            reference_type: None,
            reference_id: None,
            performed_by: "seed".to_string(),
        })
        .await
        .expect("failed to seed stock");
}
