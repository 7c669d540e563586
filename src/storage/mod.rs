pub mod database;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::config::settings::ProviderConfig;
use crate::engine::stats::StatsDelta;

pub use database::{DatabaseStore, HistoryRecord, ProviderStats};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// 统计存储抽象（当前由 SQLite 实现，可替换为 Postgres 等）
pub trait StatsStore: Send + Sync {
    fn get_all_stats(&self) -> BoxFuture<'_, rusqlite::Result<Vec<ProviderStats>>>;
    fn apply_deltas<'a>(&'a self, deltas: &'a [StatsDelta]) -> BoxFuture<'a, rusqlite::Result<()>>;
    fn sync_providers<'a>(
        &'a self,
        configs: &'a [ProviderConfig],
    ) -> BoxFuture<'a, rusqlite::Result<()>>;
}

// 调用历史存储抽象；保留多少条历史由实现自己决定
pub trait HistoryStore: Send + Sync {
    fn append<'a>(&'a self, items: &'a [HistoryRecord]) -> BoxFuture<'a, rusqlite::Result<()>>;
    fn recent(&self, limit: i64) -> BoxFuture<'_, rusqlite::Result<Vec<HistoryRecord>>>;
    fn recent_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> BoxFuture<'_, rusqlite::Result<Vec<HistoryRecord>>>;
    fn clear(&self) -> BoxFuture<'_, rusqlite::Result<()>>;
}

impl StatsStore for DatabaseStore {
    fn get_all_stats(&self) -> BoxFuture<'_, rusqlite::Result<Vec<ProviderStats>>> {
        Box::pin(async move { self.get_all_stats().await })
    }

    fn apply_deltas<'a>(&'a self, deltas: &'a [StatsDelta]) -> BoxFuture<'a, rusqlite::Result<()>> {
        Box::pin(async move { self.apply_deltas(deltas).await })
    }

    fn sync_providers<'a>(
        &'a self,
        configs: &'a [ProviderConfig],
    ) -> BoxFuture<'a, rusqlite::Result<()>> {
        Box::pin(async move { self.sync_providers(configs).await })
    }
}

impl HistoryStore for DatabaseStore {
    fn append<'a>(&'a self, items: &'a [HistoryRecord]) -> BoxFuture<'a, rusqlite::Result<()>> {
        Box::pin(async move { self.append_history(items).await })
    }

    fn recent(&self, limit: i64) -> BoxFuture<'_, rusqlite::Result<Vec<HistoryRecord>>> {
        Box::pin(async move { self.recent_history(limit).await })
    }

    fn recent_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> BoxFuture<'_, rusqlite::Result<Vec<HistoryRecord>>> {
        Box::pin(async move { self.recent_history_since(cutoff, limit).await })
    }

    fn clear(&self) -> BoxFuture<'_, rusqlite::Result<()>> {
        Box::pin(async move { self.clear_history().await })
    }
}
