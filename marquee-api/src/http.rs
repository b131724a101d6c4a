//! HTTP server for the recommendation API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use marquee_metrics::{DEFAULT_BUCKETS, SharedRegistry};

use crate::recommender::{RecommendError, Recommender};

/// Request counter, labelled by `method`, `route` and `status`.
pub const REQUESTS_METRIC: &str = "http_requests_total";
/// Request latency histogram in seconds, labelled by `route`.
pub const DURATION_METRIC: &str = "http_request_duration_seconds";

/// Default number of recommendations.
pub const DEFAULT_RECOMMENDATIONS: usize = 10;
/// Largest number of recommendations a client may ask for.
pub const MAX_RECOMMENDATIONS: usize = 50;

/// Route label for requests that matched no route.
const UNMATCHED_ROUTE: &str = "unmatched";

/// Records per-request metrics into the shared registry.
#[derive(Clone)]
struct HttpMetrics {
    registry: SharedRegistry,
}

impl HttpMetrics {
    fn record(&self, method: &Method, route: &str, status: StatusCode, elapsed: Duration) {
        let status = status.as_u16().to_string();
        if let Ok(counter) = self.registry.counter(
            REQUESTS_METRIC,
            &[
                ("method", method.as_str()),
                ("route", route),
                ("status", &status),
            ],
        ) {
            counter.inc();
        }

        if let Ok(histogram) =
            self.registry
                .histogram(DURATION_METRIC, &[("route", route)], &DEFAULT_BUCKETS)
        {
            histogram.observe(elapsed.as_secs_f64());
        }
    }
}

/// Application state shared across handlers.
struct AppState<R> {
    recommender: Arc<R>,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            recommender: self.recommender.clone(),
        }
    }
}

/// Errors returned to API clients as `{"detail": ...}`.
#[derive(Debug)]
enum ApiError {
    Validation(String),
    NotFound(String),
    Upstream,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Upstream => (
                StatusCode::BAD_GATEWAY,
                "Recommendation backend unavailable".to_string(),
            ),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Create the HTTP router.
pub fn create_router<R: Recommender>(recommender: Arc<R>, registry: SharedRegistry) -> Router {
    let metrics = HttpMetrics { registry };
    let state = AppState { recommender };

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route(
            "/api/v1/recommendations/by-title",
            get(recommend_by_title_handler::<R>),
        )
        .route_layer(middleware::from_fn_with_state(
            metrics.clone(),
            track_requests,
        ))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(metrics, track_unmatched))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Record metrics for matched routes.
async fn track_requests(
    State(metrics): State<HttpMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    metrics.record(&method, &route, response.status(), start.elapsed());
    response
}

/// Record metrics for requests no route matched.
async fn track_unmatched(
    State(metrics): State<HttpMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let start = Instant::now();
    let response = next.run(request).await;

    if response.extensions().get::<Unmatched>().is_some() {
        metrics.record(&method, UNMATCHED_ROUTE, response.status(), start.elapsed());
    }
    response
}

/// Marks fallback responses for [`track_unmatched`].
#[derive(Clone, Copy)]
struct Unmatched;

async fn not_found_handler() -> Response {
    let mut response =
        (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not Found" }))).into_response();
    response.extensions_mut().insert(Unmatched);
    response
}

/// Handler for the / endpoint.
async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Welcome to the Movie Recommendation API!",
    }))
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Validated query for the by-title endpoint.
#[derive(Debug, PartialEq)]
struct ByTitleQuery {
    title: String,
    count: usize,
}

impl ByTitleQuery {
    fn from_params(params: &HashMap<String, String>) -> Result<Self, ApiError> {
        let title = params
            .get("title")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Validation("Query parameter 'title' is required".into()))?
            .clone();

        let count = match params.get("n_recommendations") {
            None => DEFAULT_RECOMMENDATIONS,
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| (1..=MAX_RECOMMENDATIONS).contains(n))
                .ok_or_else(|| {
                    ApiError::Validation(format!(
                        "n_recommendations must be an integer between 1 and {}",
                        MAX_RECOMMENDATIONS
                    ))
                })?,
        };

        Ok(Self { title, count })
    }
}

/// Handler for /api/v1/recommendations/by-title.
async fn recommend_by_title_handler<R: Recommender>(
    State(state): State<AppState<R>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let query = ByTitleQuery::from_params(&params)?;
    info!(title = %query.title, count = query.count, "Recommendation request");

    match state
        .recommender
        .recommend_by_title(&query.title, query.count)
        .await
    {
        Ok(recommendations) => Ok(Json(recommendations).into_response()),
        Err(e @ RecommendError::NotFound(_)) => Err(ApiError::NotFound(e.to_string())),
        Err(e) => {
            error!(title = %query.title, error = %e, "Recommendation failed");
            Err(ApiError::Upstream)
        }
    }
}

/// HTTP server configuration.
pub struct HttpServer<R> {
    recommender: Arc<R>,
    registry: SharedRegistry,
    listen_addr: SocketAddr,
}

impl<R: Recommender> HttpServer<R> {
    /// Create a new HTTP server.
    pub fn new(recommender: Arc<R>, registry: SharedRegistry, listen_addr: SocketAddr) -> Self {
        Self {
            recommender,
            registry,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.recommender, self.registry);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
