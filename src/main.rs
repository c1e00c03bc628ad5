use std::sync::Arc;

use axum::{routing::get, Router};
use http::HeaderValue;
use tokio::{signal, sync::mpsc};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use tradebook_api as api;
use tradebook_api::config::AppConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&pool).await.map_err(|e| {
            error!("Startup migration run failed: {}", e);
            e
        })?;
    }
    let db = Arc::new(pool);

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    let services = api::handlers::AppServices::new(db.clone(), Some(event_sender.clone()), &cfg);
    let state = api::AppState {
        db: db.clone(),
        config: cfg.clone(),
        event_sender,
        services,
    };

    let cors = cors_layer(&cfg).ok_or(
        "CORS is unconfigured: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true",
    )?;
    let app = build_router(cors).with_state(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 tradebook-api ready at http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped; closing database pool");
    match Arc::try_unwrap(db) {
        Ok(pool) => api::db::close_pool(pool).await?,
        Err(_) => info!("Database pool still shared at shutdown; leaving it to drop"),
    }

    Ok(())
}

/// The full middleware stack wrapped around the v1 API: tracing, response
/// compression, CORS, request logging, request metrics and request ids,
/// applied outermost-last.
fn build_router(cors: CorsLayer) -> Router<api::AppState> {
    Router::new()
        .route("/", get(|| async { "tradebook-api up" }))
        .route("/health", get(api::health_check))
        .nest("/api/v1", api::api_v1_routes())
        .merge(api::metrics::metrics_routes())
        .merge(api::openapi::openapi_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(axum::middleware::from_fn(api::request_logging_middleware))
        .layer(axum::middleware::from_fn(api::metrics::track_requests))
        .layer(axum::middleware::from_fn(
            api::request_id::propagate_request_id,
        ))
}

/// The CORS posture the config calls for, or `None` when origins are
/// required but absent. Explicit origins always win over the permissive
/// fallback.
fn cors_layer(cfg: &AppConfig) -> Option<CorsLayer> {
    if let Some(origins) = explicit_origins(cfg) {
        return Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_credentials(cfg.cors_allow_credentials),
        );
    }

    if cfg.should_allow_permissive_cors() {
        let reason = if cfg.is_development() {
            "development profile"
        } else {
            "any-origin override"
        };
        info!("No explicit CORS origins; staying permissive ({})", reason);
        return Some(CorsLayer::permissive());
    }

    error!("Refusing to start without CORS origins outside development");
    None
}

/// Parses the comma-separated origin list, dropping blanks and anything
/// that is not a valid header value.
fn explicit_origins(cfg: &AppConfig) -> Option<Vec<HeaderValue>> {
    let raw = cfg.cors_allowed_origins.as_deref()?;
    let origins: Vec<HeaderValue> = raw
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if origins.is_empty() {
        None
    } else {
        Some(origins)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Ctrl+C handler installation failed");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        signal(SignalKind::terminate())
            .expect("SIGTERM handler installation failed")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received; shutting down"),
        _ = sigterm => info!("SIGTERM received; shutting down"),
    }
}
