mod config;
mod engine;
mod error;
mod scheduler;
mod server;
mod storage;

use std::sync::Arc;

use tracing_subscriber::fmt;

use storage::DatabaseStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt::init();

    let settings = config::Settings::load()?;

    let store = Arc::new(
        DatabaseStore::new(
            &settings.storage.database_path,
            settings.keepalive.history_limit,
        )
        .await?,
    );
    // 启动时把配置文件里的 Provider 同步进数据库（保留已有计数器）
    store.sync_providers(&settings.providers).await?;

    let engine = Arc::new(engine::KeeperEngine::new(
        &settings,
        store.clone(),
        store.clone(),
    ));

    scheduler::spawn(engine.clone(), store.clone(), settings.keepalive.interval_secs);
    tracing::info!(
        "保活定时任务已启动, 间隔 {}s",
        settings.keepalive.interval_secs
    );

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let app = server::create_app(server::AppState {
        config: settings,
        engine,
        history_store: store,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Keeper server running on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
