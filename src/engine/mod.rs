pub mod stats;
pub mod stream;

mod dispatcher;
mod invoker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::Settings;
use crate::config::settings::{ProviderConfig, RetryPolicy};
use crate::error::{KeeperError, Result};
use crate::storage::{HistoryStore, ProviderStats, StatsStore};

use dispatcher::BatchOutput;

/// 一次完整调用（成功或重试耗尽）的不可变结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationOutcome {
    pub api_index: usize,
    pub api_name: String,
    pub model: String,
    pub url: String,
    pub question: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration")]
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
    pub stream_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl InvocationOutcome {
    pub(crate) fn failure(
        api_index: usize,
        api_name: String,
        model: String,
        url: String,
        question: String,
        error: String,
        duration_ms: i64,
    ) -> Self {
        Self {
            api_index,
            api_name,
            model,
            url,
            question,
            success: false,
            answer: None,
            error: Some(error),
            duration_ms,
            timestamp: Utc::now(),
            stream_chunks: 0,
            raw_response: None,
        }
    }
}

struct Snapshot {
    stats: Arc<Vec<ProviderStats>>,
    fetched_at: Instant,
}

/// 保活引擎：持有 HTTP 客户端、问题池、重试策略与统计快照缓存。
/// 快照只会整体替换，读者看到的要么是旧的、要么是完整的新的。
pub struct KeeperEngine {
    client: reqwest::Client,
    questions: Arc<Vec<String>>,
    retry: RetryPolicy,
    reschedule_secs: i64,
    cache_ttl: Duration,
    stats_store: Arc<dyn StatsStore>,
    history_store: Arc<dyn HistoryStore>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl KeeperEngine {
    pub fn new(
        settings: &Settings,
        stats_store: Arc<dyn StatsStore>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            questions: Arc::new(settings.keepalive.questions.clone()),
            retry: settings.keepalive.retry_policy(),
            reschedule_secs: settings.keepalive.reschedule_secs,
            cache_ttl: Duration::from_secs(settings.keepalive.cache_ttl_secs),
            stats_store,
            history_store,
            snapshot: RwLock::new(None),
        }
    }

    /// 带 TTL 的读穿透快照；过期后从存储整体换新
    pub async fn snapshot(&self) -> Result<Arc<Vec<ProviderStats>>> {
        {
            let guard = self.snapshot.read().await;
            if let Some(snap) = guard.as_ref()
                && snap.fetched_at.elapsed() < self.cache_ttl
            {
                return Ok(snap.stats.clone());
            }
        }

        let stats = Arc::new(self.stats_store.get_all_stats().await?);
        let mut guard = self.snapshot.write().await;
        *guard = Some(Snapshot {
            stats: stats.clone(),
            fetched_at: Instant::now(),
        });
        Ok(stats)
    }

    pub async fn invalidate_snapshot(&self) {
        *self.snapshot.write().await = None;
    }

    /// 调用单个 Provider 并落库。无效索引是配置错误，直接报错
    pub async fn invoke_one(&self, index: usize) -> Result<InvocationOutcome> {
        let snapshot = self.snapshot().await?;
        if index >= snapshot.len() {
            return Err(KeeperError::Config("无效的API索引".into()));
        }
        let mut batch = self.dispatch(&snapshot, &[index]).await;
        self.persist(&batch).await?;
        Ok(batch.outcomes.remove(0))
    }

    /// 并发调用全部 Provider 并落库；部分失败不报错，只有存储失败才向上传播
    pub async fn invoke_all(&self) -> Result<Vec<InvocationOutcome>> {
        let snapshot = self.snapshot().await?;
        let indices: Vec<usize> = (0..snapshot.len()).collect();
        let batch = self.dispatch(&snapshot, &indices).await;
        self.persist(&batch).await?;
        Ok(batch.outcomes)
    }

    /// 用当前配置重建 Provider 行（保留计数器），并使快照失效
    pub async fn resync_providers(&self, configs: &[ProviderConfig]) -> Result<()> {
        self.stats_store.sync_providers(configs).await?;
        self.invalidate_snapshot().await;
        Ok(())
    }

    async fn dispatch(&self, snapshot: &Arc<Vec<ProviderStats>>, indices: &[usize]) -> BatchOutput {
        dispatcher::dispatch_batch(
            &self.client,
            snapshot,
            &self.questions,
            self.retry,
            self.reschedule_secs,
            indices,
        )
        .await
    }

    async fn persist(&self, batch: &BatchOutput) -> Result<()> {
        if !batch.history.is_empty() {
            self.history_store.append(&batch.history).await?;
        }
        if !batch.updates.is_empty() {
            let deltas = stats::aggregate(&batch.updates, Utc::now());
            self.stats_store.apply_deltas(&deltas).await?;
            self.invalidate_snapshot().await;
        }
        Ok(())
    }
}
