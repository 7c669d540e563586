use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API请求失败: {0}")]
    UpstreamStatus(u16),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, KeeperError>;

impl KeeperError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            KeeperError::Config(_) => StatusCode::BAD_REQUEST,
            KeeperError::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// 统一的 JSON 错误响应，供页面脚本直接展示 error 字段
impl IntoResponse for KeeperError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_map_to_bad_request() {
        assert_eq!(
            KeeperError::Config("无效的API索引".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            KeeperError::UpstreamStatus(503).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
