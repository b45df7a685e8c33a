//! Admin API handlers
//!
//! Every endpoint answers with the uniform `{success, data, error}`
//! envelope. Read endpoints need the statistics database and return
//! 503 without it; enable/disable go through the user gate so they
//! keep working when statistics are off.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Reply = (StatusCode, Json<ApiResponse>);

fn ok(data: impl Serialize) -> Reply {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            error: None,
        }),
    )
}

fn fail(status: StatusCode, message: impl Into<String>) -> Reply {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
        }),
    )
}

fn store_unavailable() -> Reply {
    fail(StatusCode::SERVICE_UNAVAILABLE, "Stats database not available")
}

pub async fn overview(State(state): State<Arc<AppState>>) -> Reply {
    let Some(db) = &state.db else {
        return store_unavailable();
    };
    match db.get_overview().await {
        Ok(overview) => ok(overview),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn users(State(state): State<Arc<AppState>>) -> Reply {
    let Some(db) = &state.db else {
        return store_unavailable();
    };
    match db.get_all_users().await {
        Ok(users) => ok(users),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn user(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Reply {
    let Some(db) = &state.db else {
        return store_unavailable();
    };
    match db.get_user(&name).await {
        Ok(Some(user)) => ok(user),
        Ok(None) => fail(StatusCode::NOT_FOUND, "user not found"),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct DomainsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub user: String,
}

fn default_limit() -> i64 {
    50
}

pub async fn domains(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DomainsQuery>,
) -> Reply {
    let Some(db) = &state.db else {
        return store_unavailable();
    };
    let limit = if query.limit > 0 { query.limit } else { default_limit() };
    match db.get_top_domains(limit, &query.user).await {
        Ok(domains) => ok(domains),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct TrendsQuery {
    #[serde(default = "default_range")]
    pub range: String,
}

fn default_range() -> String {
    "1h".to_string()
}

pub async fn trends(State(state): State<Arc<AppState>>, Query(query): Query<TrendsQuery>) -> Reply {
    let Some(db) = &state.db else {
        return store_unavailable();
    };
    match db.get_trends(&query.range).await {
        Ok(points) => ok(points),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn countries(State(state): State<Arc<AppState>>) -> Reply {
    let Some(db) = &state.db else {
        return store_unavailable();
    };
    match db.get_country_stats().await {
        Ok(countries) => ok(countries),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn config_snapshot(State(state): State<Arc<AppState>>) -> Reply {
    ok(state.snapshot.clone())
}

pub async fn disable_user(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Reply {
    set_disabled(&state, name, true).await
}

pub async fn enable_user(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Reply {
    set_disabled(&state, name, false).await
}

async fn set_disabled(state: &AppState, name: String, disabled: bool) -> Reply {
    match state.gate.set_disabled(&name, disabled).await {
        Ok(changed) => ok(json!({
            "username": name,
            "enabled": !disabled,
            "changed": changed,
        })),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn home() -> &'static str {
    "certproxy admin endpoint. The JSON API lives at /overview, /users, /domains, /trends and /countries.\n"
}
