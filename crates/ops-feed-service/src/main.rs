use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ops_feed_api::{FetchLimits, MigrateResult, OperationsApi, API_CONTRACT_VERSION, DEFAULT_FETCH_LIMIT};
use ops_feed_core::{FeedPage, FeedQuery, RawFeedParams};
use ops_feed_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: OperationsApi,
    operator_token: Option<Arc<str>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

/// The feed is served flat so `items` and `total` sit next to the contract versions.
#[derive(Debug, Clone, Serialize)]
struct FeedEnvelope {
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    #[serde(flatten)]
    page: FeedPage,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "ops-feed-service")]
#[command(about = "Local HTTP service for the admin operations feed")]
struct Args {
    #[arg(long, default_value = "./ops_feed.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT, value_parser = parse_limit)]
    order_limit: usize,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT, value_parser = parse_limit)]
    rental_limit: usize,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT, value_parser = parse_limit)]
    application_limit: usize,
    /// Bearer token required on `/v1/admin/*`. Without it an upstream gate is assumed.
    #[arg(long)]
    operator_token: Option<String>,
}

fn parse_limit(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("limit must be at least 1".to_string()),
        Ok(value) => Ok(value),
        Err(err) => Err(err.to_string()),
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn internal(err: &anyhow::Error) -> ServiceError {
        tracing::error!("request failed: {err:#}");
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ServiceError> {
        let Some(expected) = self.operator_token.as_deref() else {
            return Ok(());
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented == Some(expected) {
            Ok(())
        } else {
            tracing::warn!("rejected admin request without a valid operator token");
            Err(Self::error(StatusCode::UNAUTHORIZED, "operator authorization required"))
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

async fn blocking<T, F>(work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ServiceState::internal(&err)),
        Err(err) => Err(ServiceState::internal(&anyhow::Error::new(err))),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/admin/operations", get(admin_operations))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let limits = FetchLimits {
        orders: args.order_limit,
        rentals: args.rental_limit,
        applications: args.application_limit,
    };
    let state = ServiceState {
        api: OperationsApi::new(args.db).with_limits(limits),
        operator_token: args.operator_token.map(Arc::from),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, gated = state.operator_token.is_some(), "ops feed service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn admin_operations(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<RawFeedParams>,
) -> Result<Json<FeedEnvelope>, ServiceError> {
    state.authorize(&headers)?;
    let query = FeedQuery::from_params(&params);
    let api = state.api.clone();
    let page = blocking(move || api.operations_feed(&query)).await?;
    Ok(Json(FeedEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        page,
    }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let api = state.api.clone();
    let status = blocking(move || api.schema_status()).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let api = state.api.clone();
    let result = blocking(move || api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use ops_feed_core::{
        ApplicationId, Customer, Dataset, GoodsKind, LineItem, Order, OrderId, ServiceApplication,
    };
    use time::{Duration, OffsetDateTime};
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("ops-feed-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn state(db_path: PathBuf, token: Option<&str>) -> ServiceState {
        ServiceState { api: OperationsApi::new(db_path), operator_token: token.map(Arc::from) }
    }

    fn at(minutes: i64) -> Option<OffsetDateTime> {
        Some(OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_772_352_000) + Duration::minutes(minutes))
    }

    fn seed(api: &OperationsApi) {
        let dataset = Dataset {
            orders: vec![
                Order {
                    id: OrderId::from("O1"),
                    created_at: at(20),
                    status: "paid".to_string(),
                    payment_status: "paid".to_string(),
                    total_amount: 180_000,
                    items: vec![LineItem {
                        name: "Pure Aero".to_string(),
                        kind: GoodsKind::Racket,
                        quantity: 1,
                        unit_price: 180_000,
                    }],
                    customer: Customer::new("Han", "han@example.com"),
                    linked_application_id: Some(ApplicationId::from("A1")),
                    service_claimed_applied: true,
                },
                Order {
                    id: OrderId::from("O2"),
                    created_at: at(10),
                    status: "paid".to_string(),
                    payment_status: "paid".to_string(),
                    total_amount: 30_000,
                    items: Vec::new(),
                    customer: Customer::new("Seo", "seo@example.com"),
                    linked_application_id: Some(ApplicationId::from("A9")),
                    service_claimed_applied: true,
                },
            ],
            applications: vec![ServiceApplication {
                id: ApplicationId::from("A1"),
                created_at: at(25),
                status: "received".to_string(),
                payment_status: Some("paid".to_string()),
                total_price: 20_000,
                order_id: Some(OrderId::from("O1")),
                rental_id: None,
                customer: Customer::new("Han", "han@example.com"),
            }],
            ..Dataset::default()
        };
        if let Err(err) = api.import_dataset(&dataset) {
            panic!("failed to seed dataset: {err:#}");
        }
    }

    async fn send(router: Router, request: Request<axum::body::Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<axum::body::Body> {
        let mut builder = Request::builder().uri(uri).method("GET");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn item_ids(value: &serde_json::Value) -> Vec<String> {
        value
            .get("items")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing items array: {value}"))
            .iter()
            .filter_map(|item| item.get("id").and_then(serde_json::Value::as_str))
            .map(str::to_string)
            .collect()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(state(unique_temp_db_path(), None));
        let response = send(router, get_request("/v1/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("data").and_then(|data| data.get("status")).and_then(serde_json::Value::as_str),
            Some("ok")
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn operations_feed_serves_flat_page_with_reasons() {
        let db_path = unique_temp_db_path();
        let state = state(db_path.clone(), None);
        seed(&state.api);
        let router = app(state);

        let response = send(router, get_request("/v1/admin/operations", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;

        assert_eq!(
            value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
        assert_eq!(value.get("total").and_then(serde_json::Value::as_u64), Some(3));
        assert_eq!(item_ids(&value), vec!["A1", "O1", "O2"]);

        let o2 = value
            .get("items")
            .and_then(serde_json::Value::as_array)
            .and_then(|items| items.iter().find(|item| item.get("id") == Some(&serde_json::json!("O2"))))
            .unwrap_or_else(|| panic!("O2 missing: {value}"));
        let warn_count = o2
            .get("warnReasons")
            .and_then(serde_json::Value::as_array)
            .map_or(0, Vec::len);
        assert!(warn_count > 0, "dangling claim must warn: {o2}");

        cleanup(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn warn_filter_and_bad_params_are_normalised() {
        let db_path = unique_temp_db_path();
        let state = state(db_path.clone(), None);
        seed(&state.api);
        let router = app(state);

        let response = send(
            router.clone(),
            get_request("/v1/admin/operations?warn=1&page=-4&pageSize=abc&flow=99", None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(item_ids(&value), vec!["O2"]);
        assert_eq!(value.get("total").and_then(serde_json::Value::as_u64), Some(1));

        let response =
            send(router, get_request("/v1/admin/operations?kind=order&pageSize=1&page=2", None)).await;
        let value = response_json(response).await;
        assert_eq!(value.get("total").and_then(serde_json::Value::as_u64), Some(2));
        assert_eq!(item_ids(&value), vec!["O2"]);

        cleanup(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn operator_token_gates_admin_routes_only() {
        let db_path = unique_temp_db_path();
        let state = state(db_path.clone(), Some("s3cret"));
        seed(&state.api);
        let router = app(state);

        let denied = send(router.clone(), get_request("/v1/admin/operations", None)).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        let value = response_json(denied).await;
        assert!(value.get("error").and_then(serde_json::Value::as_str).is_some());

        let wrong = send(router.clone(), get_request("/v1/admin/operations", Some("nope"))).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let allowed = send(router.clone(), get_request("/v1/admin/operations", Some("s3cret"))).await;
        assert_eq!(allowed.status(), StatusCode::OK);

        let health = send(router, get_request("/v1/health", None)).await;
        assert_eq!(health.status(), StatusCode::OK);

        cleanup(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn migrate_dry_run_reports_pending_versions() {
        let db_path = unique_temp_db_path();
        let router = app(state(db_path.clone(), None));

        let response = send(
            router,
            Request::builder()
                .uri("/v1/db/migrate")
                .method("POST")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(serde_json::json!({ "dry_run": true }).to_string()))
                .unwrap_or_else(|err| panic!("failed to build migrate request: {err}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let data = value.get("data").unwrap_or_else(|| panic!("missing data: {value}"));
        assert_eq!(data.get("dry_run").and_then(serde_json::Value::as_bool), Some(true));
        assert!(data
            .get("would_apply_versions")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|versions| !versions.is_empty()));

        cleanup(&db_path);
    }

    #[test]
    fn zero_fetch_limit_is_rejected() {
        assert!(parse_limit("0").is_err());
        assert_eq!(parse_limit("25"), Ok(25));
    }
}
