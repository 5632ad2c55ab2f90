// HTTP read model plus control endpoints. Every handler validates input,
// makes one Store or StatsEngine call and serialises the result; errors
// all share the `{error, detail, status_code}` body.

use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::bot::{LinkState, OutboundQueue};
use crate::metrics::{Metrics, RuntimeHealth};
use crate::scheduler::JobRegistry;
use crate::stats::StatsEngine;
use crate::store::{GatewayObservation, GroupedPacket, PacketRecord, Store, StoreError};
use crate::subscriptions::{SubscriptionSvc, Variant};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;
const STATIC_DIR: &str = "static";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub stats: Arc<StatsEngine>,
    pub subs: Arc<SubscriptionSvc>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<RuntimeHealth>,
    pub jobs: Arc<JobRegistry>,
    pub queue: Arc<OutboundQueue>,
}

// --- error shape -----------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
    status_code: u16,
}

pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            detail: detail.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy(_) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: "store_busy",
                detail: "database is busy, retry shortly".into(),
            },
            other => {
                error!(error = %other, "store failure surfaced to http");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    error: "internal",
                    detail: "internal error".into(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error.to_string(),
            detail: self.detail,
            status_code: self.status.as_u16(),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// --- param plumbing --------------------------------------------------------

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

fn checked_limit(limit: Option<usize>) -> ApiResult<usize> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    Ok(limit)
}

/// Node ids arrive as decimal or the canonical `!hex8` form.
fn parse_node_id(raw: &str) -> ApiResult<u32> {
    if let Some(hex_part) = raw.strip_prefix('!') {
        u32::from_str_radix(hex_part, 16)
            .map_err(|_| ApiError::bad_request(format!("`{raw}` is not a node id")))
    } else {
        raw.parse()
            .map_err(|_| ApiError::bad_request(format!("`{raw}` is not a node id")))
    }
}

fn parse_date(raw: &str) -> ApiResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("`{raw}` is not a YYYY-MM-DD date")))
}

// --- routes ----------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stats/last", get(stats_last))
        .route("/stats/last/:n", get(stats_last_n))
        .route("/stats/today", get(stats_today))
        .route("/stats/today/detailed", get(stats_today_detailed))
        .route("/stats/comparisons", get(stats_comparisons))
        .route("/stats/rolling", get(stats_rolling))
        .route("/stats/user/:node_id/last", get(stats_user_last))
        .route("/stats/user/:node_id/last/:n", get(stats_user_last_n))
        .route("/stats/:date", get(stats_for_date))
        .route("/users/:node_id/messages", get(user_messages))
        .route("/users/:node_id/gateways", get(user_gateways))
        .route("/users/:node_id/gateway_percentiles", get(user_gateway_percentiles))
        .route("/messages/recent", get(messages_recent))
        .route("/messages/detailed", get(messages_detailed))
        .route("/subscriptions", get(subscriptions_list))
        .route("/subscribe/:node_id/:variant", post(subscribe))
        .route("/subscribe/:node_id", delete(unsubscribe))
        .route("/network/stats", get(network_stats))
        .route("/bot/stats", get(bot_stats))
        .route("/bot/commands/recent", get(bot_commands_recent))
        .route("/bot/commands/user/:node_id", get(bot_commands_user))
        .route("/health", get(health))
        .route("/admin/database/info", get(database_info))
        .route("/admin/database/expire", delete(database_expire))
        .route("/mock/message", post(mock_message))
        .route("/mock/user", post(mock_user))
        .route("/metrics", get(prometheus_metrics))
        .fallback_service(ServeDir::new(STATIC_DIR))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            reject_during_shutdown,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// New requests get 503 once the shutdown signal has fired.
async fn reject_during_shutdown(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if state.health.shutting_down.load(Ordering::Relaxed) {
        return ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: "shutting_down",
            detail: "server is shutting down".into(),
        }
        .into_response();
    }
    next.run(request).await
}

async fn stats_last(State(state): State<AppState>) -> ApiResult<Json<PacketRecord>> {
    state
        .store
        .newest_packets(1)?
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no packets stored yet"))
}

fn parse_count(raw: &str) -> ApiResult<usize> {
    let n: usize = raw
        .parse()
        .map_err(|_| ApiError::bad_request(format!("`{raw}` is not a count")))?;
    if !(1..=100).contains(&n) {
        return Err(ApiError::bad_request("n must be between 1 and 100"));
    }
    Ok(n)
}

async fn stats_last_n(
    State(state): State<AppState>,
    Path(n): Path<String>,
) -> ApiResult<Json<Vec<PacketRecord>>> {
    let n = parse_count(&n)?;
    Ok(Json(state.store.newest_packets(n)?))
}

async fn stats_today(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.stats.today()?))
}

#[derive(Serialize)]
struct DetailedDay {
    #[serde(flatten)]
    day: crate::stats::DayStat,
    hours: Vec<crate::stats::HourStat>,
    top_senders: Vec<crate::store::TopSender>,
    histogram: Vec<crate::stats::HistogramBucket>,
}

async fn stats_today_detailed(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let day = state.stats.today()?;
    let hours = state.stats.hourly_stat(day.date)?.hours;
    let top_senders = state.stats.top_senders(day.date, 10)?;
    let histogram = state.stats.gateway_histogram(day.date, 10)?;
    Ok(Json(DetailedDay {
        day,
        hours,
        top_senders,
        histogram,
    }))
}

async fn stats_for_date(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let date = parse_date(&date)?;
    Ok(Json(state.stats.day_stat(date)?))
}

async fn stats_comparisons(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.stats.comparisons()?))
}

async fn stats_rolling(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.stats.rolling()?))
}

async fn stats_user_last(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<PacketRecord>> {
    let node_id = parse_node_id(&node_id)?;
    state
        .store
        .newest_packets_for_user(node_id, 1)?
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no packets for this node"))
}

async fn stats_user_last_n(
    State(state): State<AppState>,
    Path((node_id, n)): Path<(String, String)>,
) -> ApiResult<Json<Vec<PacketRecord>>> {
    let node_id = parse_node_id(&node_id)?;
    let n = parse_count(&n)?;
    Ok(Json(state.store.newest_packets_for_user(node_id, n)?))
}

async fn user_messages(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let node_id = parse_node_id(&node_id)?;
    let limit = checked_limit(q.limit)?;
    Ok(Json(state.store.newest_packets_for_user(node_id, limit)?))
}

async fn user_gateways(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let node_id = parse_node_id(&node_id)?;
    let limit = checked_limit(q.limit)?;
    Ok(Json(state.store.gateways_for_user(node_id, limit)?))
}

async fn user_gateway_percentiles(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let node_id = parse_node_id(&node_id)?;
    let limit = checked_limit(q.limit)?;
    Ok(Json(state.stats.gateway_percentiles_for_user(node_id, limit)?))
}

async fn messages_recent(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = checked_limit(q.limit)?;
    Ok(Json(state.store.newest_packets(limit)?))
}

#[derive(Serialize)]
struct DetailedPacket {
    #[serde(flatten)]
    packet: PacketRecord,
    gateways: Vec<crate::store::RelayRow>,
}

async fn messages_detailed(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = checked_limit(q.limit)?;
    let packets = state.store.newest_packets(limit)?;
    let mut out = Vec::with_capacity(packets.len());
    for packet in packets {
        let gateways = state.store.relays_for_packet(packet.packet_id)?;
        out.push(DetailedPacket { packet, gateways });
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
struct SubscriptionsQuery {
    subscription_type: Option<String>,
}

async fn subscriptions_list(
    State(state): State<AppState>,
    Query(q): Query<SubscriptionsQuery>,
) -> ApiResult<impl IntoResponse> {
    let variant = q
        .subscription_type
        .map(|v| v.parse::<Variant>().map_err(ApiError::bad_request))
        .transpose()?;
    Ok(Json(state.subs.list(variant)?))
}

async fn subscribe(
    State(state): State<AppState>,
    Path((node_id, variant)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let node_id = parse_node_id(&node_id)?;
    let variant = variant.parse::<Variant>().map_err(ApiError::bad_request)?;
    Ok(Json(state.subs.subscribe(node_id, variant)?))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let node_id = parse_node_id(&node_id)?;
    if !state.subs.unsubscribe(node_id)? {
        return Err(ApiError::not_found("no active subscription for this node"));
    }
    Ok(Json(serde_json::json!({ "status": "unsubscribed" })))
}

async fn network_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.stats.network()?))
}

#[derive(Deserialize)]
struct DaysQuery {
    days: Option<u32>,
}

async fn bot_stats(
    State(state): State<AppState>,
    Query(q): Query<DaysQuery>,
) -> ApiResult<impl IntoResponse> {
    let days = q.days.unwrap_or(7);
    if !(1..=365).contains(&days) {
        return Err(ApiError::bad_request("days must be between 1 and 365"));
    }
    Ok(Json(state.store.command_day_counts(days)?))
}

async fn bot_commands_recent(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = checked_limit(q.limit)?;
    Ok(Json(state.store.recent_command_logs(limit)?))
}

async fn bot_commands_user(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let node_id = parse_node_id(&node_id)?;
    let limit = checked_limit(q.limit)?;
    Ok(Json(state.store.command_logs_for_user(node_id, limit)?))
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    uptime_seconds: u64,
    database_latency_ms: Option<f64>,
    mqtt_connected: bool,
    bot_state: &'static str,
    bot_connected: bool,
    outbound_queue: usize,
    scheduler: Vec<crate::scheduler::JobReport>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let latency = state.store.ping().ok();
    let bot_state = LinkState::from_u8(state.health.bot_state.load(Ordering::Relaxed));
    let report = HealthReport {
        status: if latency.is_some() { "ok" } else { "degraded" },
        uptime_seconds: state.health.uptime_seconds(),
        database_latency_ms: latency.map(|d| d.as_secs_f64() * 1000.0),
        mqtt_connected: state.health.mqtt_connected.load(Ordering::Relaxed),
        bot_state: bot_state.as_str(),
        bot_connected: bot_state.is_connected(),
        outbound_queue: state.queue.len(),
        scheduler: state.jobs.snapshot(),
    };
    let status = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn database_info(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.database_info()?))
}

async fn database_expire(
    State(state): State<AppState>,
    Query(q): Query<DaysQuery>,
) -> ApiResult<impl IntoResponse> {
    let days = q
        .days
        .ok_or_else(|| ApiError::bad_request("days query parameter is required"))?;
    if !(1..=3650).contains(&days) {
        return Err(ApiError::bad_request("days must be between 1 and 3650"));
    }
    Ok(Json(state.store.expire_older_than(days, Utc::now())?))
}

// --- test affordances ------------------------------------------------------

#[derive(Deserialize)]
struct MockMessage {
    packet_id: Option<u32>,
    from_node_id: u32,
    payload: String,
    gateways: Option<Vec<String>>,
    sent_at: Option<DateTime<Utc>>,
    rssi: Option<i32>,
    snr: Option<f32>,
}

/// Inserts through the production grouped-insert path so mock data obeys
/// every invariant real traffic does.
async fn mock_message(
    State(state): State<AppState>,
    Json(body): Json<MockMessage>,
) -> ApiResult<impl IntoResponse> {
    let sent_at = body.sent_at.unwrap_or_else(Utc::now);
    let packet_id = body.packet_id.unwrap_or_else(rand::random);
    let gateways = body
        .gateways
        .unwrap_or_else(|| vec!["!00000001".to_string()]);
    if gateways.is_empty() {
        return Err(ApiError::bad_request("at least one gateway is required"));
    }
    let group = GroupedPacket {
        packet_id,
        sender: body.from_node_id,
        sent_at,
        payload: body.payload,
        rssi: body.rssi,
        snr: body.snr,
        hop_start: None,
        hop_limit: None,
        gateways: gateways
            .into_iter()
            .map(|gateway_id| GatewayObservation {
                gateway_id,
                observed_at: sent_at,
            })
            .collect(),
        fingerprints: vec![rand::random::<[u8; 32]>()],
    };
    state.store.insert_grouped_packet(&group, Utc::now())?;
    Ok(Json(serde_json::json!({ "status": "inserted", "packet_id": packet_id })))
}

#[derive(Deserialize)]
struct MockUser {
    node_id: u32,
    long_name: Option<String>,
    short_name: Option<String>,
    mesh_id: Option<String>,
    role: Option<String>,
}

async fn mock_user(
    State(state): State<AppState>,
    Json(body): Json<MockUser>,
) -> ApiResult<impl IntoResponse> {
    state.store.upsert_node(
        body.node_id,
        body.long_name.as_deref(),
        body.short_name.as_deref(),
        body.mesh_id.as_deref(),
        body.role.as_deref(),
        Utc::now(),
    )?;
    Ok(Json(serde_json::json!({ "status": "upserted", "node_id": body.node_id })))
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::util::ServiceExt;

    fn test_state() -> AppState {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(Store::open_in_memory(metrics.clone()).unwrap());
        let stats = Arc::new(StatsEngine::new(store.clone(), metrics.clone()));
        let subs = Arc::new(SubscriptionSvc::new(store.clone()));
        let scheduler = crate::scheduler::Scheduler::new(
            crate::config::ScheduleConfig {
                subscription_hour: 9,
                subscription_minute: 0,
                broadcast_enabled: false,
                broadcast_hour: 21,
                broadcast_minute: 0,
                broadcast_channel: 0,
            },
            stats.clone(),
            subs.clone(),
            Arc::new(OutboundQueue::new(8)),
            metrics.clone(),
        );
        AppState {
            store,
            stats,
            subs,
            metrics,
            health: Arc::new(RuntimeHealth::new()),
            jobs: scheduler.registry(),
            queue: Arc::new(OutboundQueue::new(8)),
        }
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn stats_last_is_404_when_empty_then_returns_packet() {
        let state = test_state();
        let router = build_router(state.clone());

        let (status, body) = call(&router, get_req("/stats/last")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["status_code"], 404);

        let (status, _) = call(
            &router,
            post_json(
                "/mock/message",
                serde_json::json!({
                    "packet_id": 7001,
                    "from_node_id": 0xa1,
                    "payload": "hello",
                    "gateways": ["!aabbccdd"],
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&router, get_req("/stats/last")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["packet_id"], 7001);
        assert_eq!(body["sender_id"], "!000000a1");
        assert_eq!(body["gateway_count"], 1);
    }

    #[tokio::test]
    async fn stats_last_n_validates_range() {
        let router = build_router(test_state());
        let (status, body) = call(&router, get_req("/stats/last/0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
        let (status, _) = call(&router, get_req("/stats/last/101")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = call(&router, get_req("/stats/last/5")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn date_route_rejects_garbage() {
        let router = build_router(test_state());
        let (status, _) = call(&router, get_req("/stats/not-a-date")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = call(&router, get_req("/stats/2026-07-01")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["date"], "2026-07-01");
        assert_eq!(body["message_count"], 0);
    }

    #[tokio::test]
    async fn subscribe_flow_over_http() {
        let router = build_router(test_state());
        let (status, body) = call(
            &router,
            Request::builder()
                .method("POST")
                .uri("/subscribe/161/avg")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["variant"], "avg");

        let (status, body) = call(&router, get_req("/subscriptions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = call(&router, get_req("/subscriptions?subscription_type=low")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = call(
            &router,
            Request::builder()
                .method("DELETE")
                .uri("/subscribe/161")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &router,
            Request::builder()
                .method("DELETE")
                .uri("/subscribe/161")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn node_ids_accept_canonical_hex_form() {
        let router = build_router(test_state());
        let (status, body) = call(&router, get_req("/users/!000000a1/messages")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
        let (status, _) = call(&router, get_req("/users/zzz/messages")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_shape() {
        let router = build_router(test_state());
        let (status, body) = call(&router, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mqtt_connected"], false);
        assert_eq!(body["bot_state"], "disconnected");
        assert!(body["database_latency_ms"].is_number());
    }

    #[tokio::test]
    async fn shutdown_returns_503_to_new_requests() {
        let state = test_state();
        state.health.shutting_down.store(true, Ordering::Relaxed);
        let router = build_router(state);
        let (status, body) = call(&router, get_req("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let router = build_router(test_state());
        let response = router
            .clone()
            .oneshot(get_req("/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("meshcover_envelopes_received_total"));
        assert!(text.contains("# TYPE meshcover_gateways_per_packet histogram"));
    }

    #[tokio::test]
    async fn detailed_messages_include_relays() {
        let router = build_router(test_state());
        let (status, _) = call(
            &router,
            post_json(
                "/mock/message",
                serde_json::json!({
                    "packet_id": 7002,
                    "from_node_id": 0xb2,
                    "payload": "three relays",
                    "gateways": ["!00000011", "!00000022", "!00000033"],
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&router, get_req("/messages/detailed?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        let first = &body.as_array().unwrap()[0];
        assert_eq!(first["gateway_count"], 3);
        assert_eq!(first["gateways"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn expire_requires_days() {
        let router = build_router(test_state());
        let (status, _) = call(
            &router,
            Request::builder()
                .method("DELETE")
                .uri("/admin/database/expire")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = call(
            &router,
            Request::builder()
                .method("DELETE")
                .uri("/admin/database/expire?days=30")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["packets"], 0);
    }

    #[tokio::test]
    async fn mock_user_then_network_stats() {
        let router = build_router(test_state());
        let (status, _) = call(
            &router,
            post_json(
                "/mock/user",
                serde_json::json!({ "node_id": 0xc3, "long_name": "Test Node", "role": "router" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&router, get_req("/network/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_nodes"], 1);
    }
}
