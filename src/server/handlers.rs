use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::Html,
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::engine::InvocationOutcome;
use crate::error::KeeperError;
use crate::server::AppState;
use crate::server::status_page;
use crate::storage::{HistoryRecord, ProviderStats};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(status))
        .route("/status", get(status))
        .route("/invoke/{index}", get(invoke_one))
        .route("/invoke-all", get(invoke_all))
        .route("/api/data", get(api_data))
        .route("/api/clear-history", post(clear_history))
        .route("/api/update-configs", post(update_configs))
        .route("/debug-cron", get(debug_cron))
}

// 对外暴露统计时掩码 API Key
pub(crate) fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "****".to_string();
    }
    let (start, end) = (&key[..4], &key[key.len() - 4..]);
    format!("{}****{}", start, end)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiConfigOut {
    pub name: String,
    pub api_name: String,
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProviderStatsOut {
    pub total_calls: i64,
    pub success_calls: i64,
    pub failed_calls: i64,
    pub last_call: Option<DateTime<Utc>>,
    pub next_scheduled_call: Option<DateTime<Utc>>,
    pub api_config: ApiConfigOut,
}

impl ProviderStatsOut {
    pub(crate) fn from_stats(stats: &ProviderStats) -> Self {
        Self {
            total_calls: stats.total_calls,
            success_calls: stats.success_calls,
            failed_calls: stats.failed_calls,
            last_call: stats.last_call,
            next_scheduled_call: stats.next_scheduled_call,
            api_config: ApiConfigOut {
                name: stats.config.name.clone(),
                api_name: stats.config.model.clone(),
                url: stats.config.url.clone(),
                api_key: mask_key(&stats.config.api_key),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DataResponse {
    api_stats: Vec<ProviderStatsOut>,
    history: Vec<HistoryRecord>,
    total_calls: i64,
    total_success: i64,
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Html<String>, KeeperError> {
    let stats = state.engine.snapshot().await?;
    let history = state.history_store.recent(50).await?;
    Ok(Html(status_page::render(&stats, &history)))
}

async fn invoke_one(
    Path(index): Path<usize>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<InvocationOutcome>, KeeperError> {
    let snapshot = state.engine.snapshot().await?;
    if index >= snapshot.len() {
        return Err(KeeperError::Config("无效的API索引".into()));
    }
    let outcome = state.engine.invoke_one(index).await?;
    Ok(Json(outcome))
}

async fn invoke_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InvocationOutcome>>, KeeperError> {
    let outcomes = state.engine.invoke_all().await?;
    Ok(Json(outcomes))
}

async fn api_data(State(state): State<Arc<AppState>>) -> Result<Json<DataResponse>, KeeperError> {
    let stats = state.engine.snapshot().await?;
    let history = state.history_store.recent(10).await?;

    let total_calls = stats.iter().map(|s| s.total_calls).sum();
    let total_success = stats.iter().map(|s| s.success_calls).sum();
    let api_stats = stats.iter().map(ProviderStatsOut::from_stats).collect();

    Ok(Json(DataResponse {
        api_stats,
        history,
        total_calls,
        total_success,
    }))
}

async fn clear_history(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, KeeperError> {
    state.history_store.clear().await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn update_configs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, KeeperError> {
    state.engine.resync_providers(&state.config.providers).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "API配置已更新"
    })))
}

async fn debug_cron(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<HistoryRecord>>, KeeperError> {
    let one_hour_ago = Utc::now() - Duration::hours(1);
    let recent = state.history_store.recent_since(one_hour_ago, 20).await?;
    Ok(Json(recent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_key_hides_the_middle() {
        assert_eq!(mask_key("sk-1234567890abcdef"), "sk-1****cdef");
        assert_eq!(mask_key("short"), "****");
    }
}
