//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::db;
use crate::errors::{LedgerError, Result};
use crate::ledger;
use crate::recovery::{self, SchedulerState};
use crate::referral::{self, ReferralBonuses};
use crate::webhook::{self, SettlementEvent, SIGNATURE_HEADER};

const DEFAULT_LEDGER_LIMIT: i64 = 50;
const MAX_LEDGER_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
}

impl ApiState {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/razorpay", post(settlement_webhook))
        .route("/users/:uid", post(ensure_user).get(get_user))
        .route("/users/:uid/ledger", get(get_ledger))
        .route("/users/:uid/bills", post(register_bill))
        .route("/users/:uid/redeem", post(redeem))
        .route("/users/:uid/vouchers", post(create_voucher).get(list_vouchers))
        .route("/users/:uid/vouchers/:voucher_id/use", post(mark_voucher_used))
        .route("/users/:uid/games/entry", post(charge_entry_fee))
        .route("/users/:uid/games/win", post(award_game_win))
        .route("/users/:uid/daily-reward", post(daily_reward))
        .route("/users/:uid/referral", post(apply_referral).get(referral_stats))
        .route("/admin/recovery/run", post(run_recovery))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct BillRequest {
    pub bill_id: String,
    pub amount: i64,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub amount: i64,
    #[serde(default)]
    pub note: String,
}

#[derive(Deserialize)]
pub struct VoucherRequest {
    pub value_paise: i64,
}

/// Game operations take the game's own event id when the client has one.
#[derive(Deserialize)]
pub struct GameRequest {
    pub amount: i64,
    pub key: Option<String>,
}

#[derive(Deserialize)]
pub struct ReferralRequest {
    pub code: String,
}

// ─────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────

fn status_for(e: &LedgerError) -> StatusCode {
    match e {
        LedgerError::InsufficientFunds { .. } | LedgerError::AlreadyUsed => StatusCode::CONFLICT,
        LedgerError::InvalidAmount(_)
        | LedgerError::InvalidUser(_)
        | LedgerError::SelfReferral => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::SignatureInvalid => StatusCode::UNAUTHORIZED,
        LedgerError::Json(_) | LedgerError::EventParse(_) => StatusCode::BAD_REQUEST,
        LedgerError::Database(_) | LedgerError::Migrate(_) | LedgerError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(e: LedgerError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {e}");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => error_response(e),
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /webhooks/razorpay`
///
/// Authenticates the raw body before parsing it. Processing failures answer
/// 5xx so the gateway redelivers; every step is idempotent.
pub async fn settlement_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if let Err(e) = webhook::verify_signature(state.config.webhook_secret.as_bytes(), &body, signature)
    {
        warn!("Rejected webhook with invalid signature");
        return error_response(e);
    }

    let event = match SettlementEvent::parse(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejected unparseable webhook: {e}");
            return error_response(e);
        }
    };
    respond(webhook::process(&state.pool, &state.config, &event, state.now()).await)
}

/// `POST /users/:uid`
pub async fn ensure_user(State(state): State<Arc<ApiState>>, Path(uid): Path<String>) -> Response {
    respond(db::ensure_user(&state.pool, &uid, state.now()).await)
}

/// `GET /users/:uid`
pub async fn get_user(State(state): State<Arc<ApiState>>, Path(uid): Path<String>) -> Response {
    respond(db::get_user(&state.pool, &uid).await)
}

/// `GET /users/:uid/ledger?limit=N`
pub async fn get_ledger(
    State(state): State<Arc<ApiState>>,
    Path(uid): Path<String>,
    Query(query): Query<LedgerQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEDGER_LIMIT)
        .clamp(1, MAX_LEDGER_LIMIT);
    respond(ledger::list_entries(&state.pool, &uid, limit).await)
}

/// `POST /users/:uid/bills`
pub async fn register_bill(
    State(state): State<Arc<ApiState>>,
    Path(uid): Path<String>,
    Json(req): Json<BillRequest>,
) -> Response {
    respond(db::register_bill(&state.pool, &uid, &req.bill_id, req.amount, req.due_at).await)
}

/// `POST /users/:uid/redeem`
pub async fn redeem(
    State(state): State<Arc<ApiState>>,
    Path(uid): Path<String>,
    Json(req): Json<RedeemRequest>,
) -> Response {
    respond(ledger::redeem(&state.pool, &uid, req.amount, &req.note, state.now()).await)
}

/// `POST /users/:uid/vouchers`
pub async fn create_voucher(
    State(state): State<Arc<ApiState>>,
    Path(uid): Path<String>,
    Json(req): Json<VoucherRequest>,
) -> Response {
    respond(ledger::create_voucher(&state.pool, &uid, req.value_paise, state.now()).await)
}

/// `GET /users/:uid/vouchers`
pub async fn list_vouchers(State(state): State<Arc<ApiState>>, Path(uid): Path<String>) -> Response {
    respond(ledger::list_vouchers(&state.pool, &uid).await)
}

/// `POST /users/:uid/vouchers/:voucher_id/use`
pub async fn mark_voucher_used(
    State(state): State<Arc<ApiState>>,
    Path((uid, voucher_id)): Path<(String, String)>,
) -> Response {
    respond(ledger::mark_voucher_used(&state.pool, &uid, &voucher_id, state.now()).await)
}

/// `POST /users/:uid/games/entry`
pub async fn charge_entry_fee(
    State(state): State<Arc<ApiState>>,
    Path(uid): Path<String>,
    Json(req): Json<GameRequest>,
) -> Response {
    let now = state.now();
    let key = req
        .key
        .unwrap_or_else(|| ledger::fresh_key("game_entry", now));
    respond(ledger::charge_entry_fee(&state.pool, &uid, &key, req.amount, now).await)
}

/// `POST /users/:uid/games/win`
pub async fn award_game_win(
    State(state): State<Arc<ApiState>>,
    Path(uid): Path<String>,
    Json(req): Json<GameRequest>,
) -> Response {
    let now = state.now();
    let key = req.key.unwrap_or_else(|| ledger::fresh_key("game_win", now));
    respond(ledger::award_game_win(&state.pool, &uid, &key, req.amount, now).await)
}

/// `POST /users/:uid/daily-reward`
pub async fn daily_reward(State(state): State<Arc<ApiState>>, Path(uid): Path<String>) -> Response {
    let config = &state.config;
    respond(
        ledger::award_daily_reward(
            &state.pool,
            &uid,
            config.daily_reward_min,
            config.daily_reward_max,
            config.daily_reward_cooldown_hours,
            state.now(),
        )
        .await,
    )
}

/// `POST /users/:uid/referral`
pub async fn apply_referral(
    State(state): State<Arc<ApiState>>,
    Path(uid): Path<String>,
    Json(req): Json<ReferralRequest>,
) -> Response {
    let bonuses = ReferralBonuses {
        referrer: state.config.referrer_bonus,
        referee: state.config.referee_bonus,
    };
    respond(referral::apply_referral_code(&state.pool, &uid, &req.code, bonuses, state.now()).await)
}

/// `GET /users/:uid/referral`
pub async fn referral_stats(State(state): State<Arc<ApiState>>, Path(uid): Path<String>) -> Response {
    respond(referral::referral_stats(&state.pool, &uid).await)
}

/// `POST /admin/recovery/run`
///
/// Entry point for an external cron; runs one scheduler tick synchronously.
pub async fn run_recovery(State(state): State<Arc<ApiState>>) -> Response {
    let scheduler = SchedulerState {
        pool: state.pool.clone(),
        config: state.config.clone(),
        clock: state.clock.clone(),
    };
    respond(recovery::tick(&scheduler).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{Duration, TimeZone};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
    }

    async fn app() -> (Router, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let state = Arc::new(ApiState {
            pool: db::test_pool().await,
            config: Config::for_tests(),
            clock: clock.clone(),
        });
        (router(state), clock)
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_post(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn webhook_request(payload: &Value, signature: Option<String>) -> Request<Body> {
        let raw = payload.to_string();
        let mut builder = Request::post("/webhooks/razorpay").header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        builder.body(Body::from(raw)).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = app().await;
        let (status, body) = call(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature() {
        let (app, _) = app().await;
        let payload = json!({
            "event": "payment.captured",
            "payload": { "payment": { "entity": {
                "id": "pay_1", "amount": 20_000, "created_at": t0().timestamp(),
                "notes": { "userId": "alice" }
            } } }
        });

        let (status, body) = call(&app, webhook_request(&payload, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "signature_invalid");

        let bad = webhook::sign(b"wrong", payload.to_string().as_bytes()).unwrap();
        let (status, _) = call(&app, webhook_request(&payload, Some(bad))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, get("/users/alice")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let good = webhook::sign(b"test_secret", payload.to_string().as_bytes()).unwrap();
        for _ in 0..2 {
            let (status, body) = call(&app, webhook_request(&payload, Some(good.clone()))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "processed");
        }

        let (_, user) = call(&app, get("/users/alice")).await;
        assert_eq!(user["coin_balance"], 200);
        assert_eq!(user["pci_streak_days"], 1);
    }

    #[tokio::test]
    async fn ledger_operations_map_errors_to_statuses() {
        let (app, _) = app().await;
        call(&app, empty_post("/users/alice")).await;

        let (status, body) = call(&app, post_json("/users/alice/redeem", json!({ "amount": 10 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "insufficient_funds");

        let (status, _) = call(
            &app,
            post_json("/users/alice/games/win", json!({ "amount": 2_000, "key": "game_win_r1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, post_json("/users/alice/vouchers", json!({ "value_paise": 50 }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "invalid_amount");

        let (status, voucher) =
            call(&app, post_json("/users/alice/vouchers", json!({ "value_paise": 100 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(voucher["status"], "active");

        let uri = format!("/users/alice/vouchers/{}/use", voucher["id"].as_str().unwrap());
        let (status, used) = call(&app, empty_post(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(used["status"], "used");

        let (status, _) = call(&app, empty_post("/users/alice/vouchers/nope/use")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, empty_post("/users/%20")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "invalid_user");

        let (_, entries) = call(&app, get("/users/alice/ledger?limit=10")).await;
        assert_eq!(entries.as_array().unwrap().len(), 2);
        let (_, user) = call(&app, get("/users/alice")).await;
        assert_eq!(user["coin_balance"], 1_000);
    }

    #[tokio::test]
    async fn daily_reward_cooldown_over_http() {
        let (app, clock) = app().await;
        call(&app, empty_post("/users/alice")).await;

        let (_, first) = call(&app, empty_post("/users/alice/daily-reward")).await;
        assert_eq!(first["status"], "granted");
        let (_, second) = call(&app, empty_post("/users/alice/daily-reward")).await;
        assert_eq!(second["status"], "not_eligible");

        clock.advance(Duration::hours(24));
        let (_, third) = call(&app, empty_post("/users/alice/daily-reward")).await;
        assert_eq!(third["status"], "granted");
    }

    #[tokio::test]
    async fn referral_flow_over_http() {
        let (app, _) = app().await;
        let (_, referrer) = call(&app, empty_post("/users/ref")).await;
        call(&app, empty_post("/users/new")).await;
        let code = referrer["referral_code"].as_str().unwrap().to_string();

        let (status, body) =
            call(&app, post_json("/users/ref/referral", json!({ "code": code }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "self_referral");

        let (status, _) = call(&app, post_json("/users/new/referral", json!({ "code": code }))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) =
            call(&app, post_json("/users/new/referral", json!({ "code": code }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already_used");

        let (_, stats) = call(&app, get("/users/ref/referral")).await;
        assert_eq!(stats["total_referrals"], 1);
        assert_eq!(stats["bonus_coins_earned"], 100);
    }

    #[tokio::test]
    async fn admin_recovery_runs_a_batch() {
        let (app, clock) = app().await;
        let payload = json!({
            "event": "payment.failed",
            "payload": { "payment": { "entity": {
                "id": "pay_f", "amount": 1_000, "created_at": t0().timestamp(),
                "notes": { "userId": "alice" }
            } } }
        });
        let sig = webhook::sign(b"test_secret", payload.to_string().as_bytes()).unwrap();
        call(&app, webhook_request(&payload, Some(sig))).await;

        clock.advance(Duration::days(2));
        let (status, report) = call(&app, empty_post("/admin/recovery/run")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["scanned"], 1);
        assert_eq!(report["recovered"], 1);
    }
}
