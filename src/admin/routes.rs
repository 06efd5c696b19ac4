//! Axum routes for the admin API.

use super::AppState;
use crate::error::Result;
use crate::health::{HealthReport, QueueStatsEntry, ServiceStatus};
use crate::lock::DEFAULT_LOCK_TTL_MS;
use crate::store::StoreStats;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

// ─── Route builder ───────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let health = Router::new()
        .route("/", get(composite_health))
        .route("/store", get(store_health_detail))
        .route("/queue", get(queue_health_detail));

    let queue = Router::new()
        .route("/stats", get(all_queue_stats))
        .route("/stats/:queue", get(queue_stats))
        .route("/health", get(queue_health))
        .route("/publish", post(publish))
        .route("/purge/:queue", axum::routing::delete(purge));

    let store = Router::new()
        .route("/stats", get(store_stats))
        .route("/health", get(store_health))
        .route("/keys", get(keys))
        .route("/cache", post(set_cache))
        .route("/cache/:key", get(get_cache).delete(delete_cache))
        .route("/lock/acquire", post(acquire_lock))
        .route("/lock/release", post(release_lock));

    Router::new()
        .nest("/api/health", health)
        .nest("/api/queue", queue)
        .nest("/api/store", store)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn ok_or_error(healthy: bool) -> Value {
    json!({ "healthy": healthy, "status": if healthy { "OK" } else { "ERROR" } })
}

// ─── Health ──────────────────────────────────────────────────────

async fn composite_health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.aggregate_health().await)
}

async fn store_health_detail(State(state): State<AppState>) -> Json<Value> {
    let healthy = state.store.is_healthy().await;
    let stats = if healthy {
        state.store.stats().await.ok()
    } else {
        None
    };
    Json(json!({ "status": ServiceStatus::from(healthy), "stats": stats }))
}

async fn queue_health_detail(State(state): State<AppState>) -> Json<Value> {
    let healthy = state.broker.is_healthy();
    let queues = if healthy {
        Some(state.health.all_queue_stats().await)
    } else {
        None
    };
    Json(json!({ "status": ServiceStatus::from(healthy), "queues": queues }))
}

// ─── Queue ───────────────────────────────────────────────────────

async fn all_queue_stats(State(state): State<AppState>) -> Json<Vec<QueueStatsEntry>> {
    Json(state.health.all_queue_stats().await)
}

async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Json<QueueStatsEntry> {
    Json(state.health.queue_stats(&queue).await)
}

async fn queue_health(State(state): State<AppState>) -> Json<Value> {
    Json(ok_or_error(state.broker.is_healthy()))
}

#[derive(Deserialize)]
struct PublishRequest {
    queue: String,
    message: Value,
}

async fn publish(State(state): State<AppState>, Json(body): Json<PublishRequest>) -> Json<Value> {
    let success = state.broker.publish(&body.queue, &body.message).await;
    Json(json!({ "success": success, "queue": body.queue }))
}

async fn purge(State(state): State<AppState>, Path(queue): Path<String>) -> Json<Value> {
    match state.broker.purge(&queue).await {
        Ok(purged) => Json(json!({ "queue": queue, "purgedCount": purged })),
        Err(e) => Json(json!({ "queue": queue, "error": e.to_string() })),
    }
}

// ─── Store ───────────────────────────────────────────────────────

async fn store_stats(State(state): State<AppState>) -> Result<Json<StoreStats>> {
    Ok(Json(state.store.stats().await?))
}

async fn store_health(State(state): State<AppState>) -> Json<Value> {
    Json(ok_or_error(state.store.is_healthy().await))
}

#[derive(Deserialize)]
struct KeysQuery {
    pattern: Option<String>,
}

async fn keys(State(state): State<AppState>, Query(query): Query<KeysQuery>) -> Result<Json<Value>> {
    let pattern = query.pattern.unwrap_or_else(|| "*".to_string());
    let keys = state.store.keys(&pattern).await?;
    Ok(Json(json!({ "count": keys.len(), "keys": keys })))
}

async fn get_cache(State(state): State<AppState>, Path(key): Path<String>) -> Result<Json<Value>> {
    let value = state.store.get(&key).await?;
    let exists = state.store.exists(&key).await?;
    let ttl = state.store.ttl(&key).await?;
    Ok(Json(json!({ "key": key, "value": value, "exists": exists, "ttl": ttl })))
}

#[derive(Deserialize)]
struct SetCacheRequest {
    key: String,
    value: String,
    ttl: Option<u64>,
}

async fn set_cache(
    State(state): State<AppState>,
    Json(body): Json<SetCacheRequest>,
) -> Result<Json<Value>> {
    state.store.set(&body.key, &body.value, body.ttl).await?;
    Ok(Json(json!({ "success": true, "key": body.key })))
}

async fn delete_cache(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>> {
    state.store.del(&key).await?;
    Ok(Json(json!({ "success": true, "key": key })))
}

#[derive(Deserialize)]
struct AcquireRequest {
    key: String,
    ttl: Option<u64>,
}

async fn acquire_lock(
    State(state): State<AppState>,
    Json(body): Json<AcquireRequest>,
) -> Json<Value> {
    // A zero ttl would create an already-expired lock.
    let ttl = body.ttl.filter(|&ttl| ttl > 0).unwrap_or(DEFAULT_LOCK_TTL_MS);
    match state.locks.acquire(&body.key, ttl).await {
        Ok(Some(guard)) => Json(json!({ "acquired": true, "key": body.key, "token": guard.token })),
        Ok(None) => Json(json!({ "acquired": false, "key": body.key })),
        Err(e) => Json(json!({ "acquired": false, "key": body.key, "error": e.to_string() })),
    }
}

#[derive(Deserialize)]
struct ReleaseRequest {
    key: String,
    /// Without a token the lock is removed whoever holds it.
    token: Option<String>,
}

async fn release_lock(
    State(state): State<AppState>,
    Json(body): Json<ReleaseRequest>,
) -> Json<Value> {
    let released = match body.token {
        Some(ref token) => state.locks.release_token(&body.key, token).await,
        None => state.locks.force_release(&body.key).await,
    };
    match released {
        Ok(released) => Json(json!({ "released": released, "key": body.key })),
        Err(e) => Json(json!({ "released": false, "key": body.key, "error": e.to_string() })),
    }
}
