//! HTTP server implementation using Axum.

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    routing::{get, post},
};
use coursehub_core::CallerIdentity;
use coursehub_core::config::GatewayConfig;
use coursehub_queue::JobQueue;
use coursehub_scheduler::NotificationWorker;
use coursehub_tracker::ActivityLogService;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

pub const ROLE_HEADER: &str = "x-caller-role";
pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ActivityLogService>,
    pub worker: Arc<NotificationWorker>,
    pub queue: Arc<JobQueue>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(service: Arc<ActivityLogService>, worker: Arc<NotificationWorker>, queue: Arc<JobQueue>) -> Self {
        Self {
            service,
            worker,
            queue,
            start_time: std::time::Instant::now(),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn caller_from_headers(headers: &HeaderMap) -> Result<CallerIdentity, String> {
    let role = header(headers, ROLE_HEADER).ok_or_else(|| format!("Missing {ROLE_HEADER} header"))?;
    let id = header(headers, CALLER_ID_HEADER).ok_or_else(|| format!("Missing {CALLER_ID_HEADER} header"))?;
    CallerIdentity::from_parts(role, id, header(headers, USER_ID_HEADER)).map_err(|e| e.to_string())
}

/// Caller identity middleware. Rejects requests without a resolvable caller.
async fn require_caller(mut req: Request<Body>, next: Next) -> Response {
    match caller_from_headers(req.headers()) {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(msg) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"ok": false, "error": format!("Unauthorized: {msg}")})),
        )
            .into_response(),
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    // Protected routes: require a caller identity
    let protected = Router::new()
        .route(
            "/api/v1/activity-logs",
            get(routes::list_logs).post(routes::create_log),
        )
        .route("/api/v1/activity-logs/bulk", post(routes::bulk_create))
        .route("/api/v1/activity-logs/mine", get(routes::my_logs))
        .route("/api/v1/activity-logs/stats", get(routes::activity_stats))
        .route("/api/v1/activity-logs/overdue", get(routes::overdue_logs))
        .route(
            "/api/v1/activity-logs/compliance",
            get(routes::compliance_report),
        )
        .route(
            "/api/v1/activity-logs/{id}",
            get(routes::get_log)
                .put(routes::update_log)
                .delete(routes::delete_log),
        )
        .route(
            "/api/v1/notifications/status",
            get(routes::notification_status),
        )
        .route("/api/v1/notifications/sweep", post(routes::trigger_sweep))
        .route_layer(axum::middleware::from_fn(require_caller));

    // Public routes
    let public = Router::new().route("/health", get(routes::health_check));

    protected
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: COURSEHUB_CORS_ORIGINS=https://lms.example.edu
            if let Ok(origins_str) = std::env::var("COURSEHUB_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until `shutdown` resolves.
pub async fn start(
    config: &GatewayConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
