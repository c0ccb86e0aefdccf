//! Registration and acknowledgement HTTP endpoints.
//!
//! Clients are flexible about how they send parameters, so every endpoint
//! accepts GET or POST and reads each parameter from the query string or a
//! JSON body, whichever carries it.  Responses are always
//! `{ code, message }`: code 1 for success, 0 for a missing parameter.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::dispatch::{NormalDispatcher, SilentDispatcher};
use crate::fetch::expiration_from_value;

#[derive(Clone)]
pub struct AppState {
    pub normal: Arc<NormalDispatcher>,
    pub silent: Arc<SilentDispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/register", get(register).post(register))
        .route(
            "/acknowledge_message_delivery",
            get(acknowledge).post(acknowledge),
        )
        .route("/health", get(health))
        .with_state(state)
}

fn success() -> Json<Value> {
    Json(json!({ "code": 1, "message": "Success" }))
}

fn missing_parameter() -> Json<Value> {
    Json(json!({ "code": 0, "message": "Missing parameter" }))
}

/// A parameter from the query string, falling back to the JSON body.
/// Body values may be strings or numbers.
fn param(query: &HashMap<String, String>, body: &Option<Json<Value>>, key: &str) -> Option<String> {
    if let Some(value) = query.get(key) {
        return Some(value.clone());
    }
    let value = body.as_ref()?.get(key)?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Register a device token.  With a `pubKey` the token joins the normal
/// dispatch registry; without one it joins the silent wake-up list.  Either
/// way the token leaves the other registry.
async fn register(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> Json<Value> {
    let Some(token) = param(&query, &body, "token") else {
        return missing_parameter();
    };
    match param(&query, &body, "pubKey") {
        Some(session_id) => {
            state.normal.register_token(&session_id, &token);
            state.silent.disable_token(&token);
        }
        None => {
            state.silent.register_token(&token);
            state.normal.disable_token(&token);
        }
    }
    success()
}

/// Client-side delivery confirmation; advances the identity's cursor so the
/// confirmed message is not fetched again.
async fn acknowledge(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> Json<Value> {
    let Some(session_id) = param(&query, &body, "pubKey") else {
        return missing_parameter();
    };
    let Some(last_hash) = param(&query, &body, "lastHash") else {
        return missing_parameter();
    };
    let Some(expiration) = param(&query, &body, "expiration")
        .and_then(|raw| expiration_from_value(&Value::String(raw)))
    else {
        return missing_parameter();
    };
    state.normal.acknowledge(&session_id, &last_hash, expiration);
    success()
}

async fn health() -> &'static str {
    "OK"
}
