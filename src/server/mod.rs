pub mod handlers;
pub(crate) mod status_page;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::engine::KeeperEngine;
use crate::storage::HistoryStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Settings,
    pub engine: Arc<KeeperEngine>,
    pub history_store: Arc<dyn HistoryStore>,
}

pub fn create_app(state: AppState) -> Router {
    handlers::routes()
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}
