use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, Result};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::settings::ProviderConfig;
use crate::engine::InvocationOutcome;
use crate::engine::stats::StatsDelta;

/// 存储层视角的单个 Provider 统计快照
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub total_calls: i64,
    pub success_calls: i64,
    pub failed_calls: i64,
    pub last_call: Option<DateTime<Utc>>,
    pub next_scheduled_call: Option<DateTime<Utc>>,
    pub config: ProviderConfig,
}

/// 一条调用历史，字段名序列化成页面脚本期望的 camelCase
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(skip_serializing)]
    pub id: Option<i64>,
    pub api_index: i64,
    pub api_name: String,
    pub question: String,
    pub answer: String,
    pub success: bool,
    pub error: String,
    #[serde(rename = "duration")]
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

impl HistoryRecord {
    pub(crate) fn from_outcome(outcome: &InvocationOutcome) -> Self {
        Self {
            id: None,
            api_index: outcome.api_index as i64,
            api_name: outcome.api_name.clone(),
            question: outcome.question.clone(),
            answer: outcome.answer.clone().unwrap_or_default(),
            success: outcome.success,
            error: outcome.error.clone().unwrap_or_default(),
            duration_ms: outcome.duration_ms,
            timestamp: outcome.timestamp,
        }
    }
}

#[derive(Clone)]
pub struct DatabaseStore {
    connection: Arc<Mutex<Connection>>,
    history_limit: i64,
}

impl DatabaseStore {
    pub async fn new(database_path: &str, history_limit: i64) -> Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("Failed to create directory: {}", e)),
                    ));
                }
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_stats (
                api_index INTEGER PRIMARY KEY,
                api_name TEXT NOT NULL,
                api_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_model TEXT NOT NULL,
                total_calls INTEGER DEFAULT 0,
                success_calls INTEGER DEFAULT 0,
                failed_calls INTEGER DEFAULT 0,
                last_call TEXT,
                next_scheduled_call TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_index INTEGER NOT NULL,
                api_name TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT,
                success INTEGER NOT NULL,
                error TEXT,
                duration INTEGER,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
            history_limit,
        })
    }

    /// 按配置重建 Provider 行：新索引插入，已有索引只刷新配置列，计数器不动
    pub async fn sync_providers(&self, configs: &[ProviderConfig]) -> Result<()> {
        let conn = self.connection.lock().await;

        let existing: HashSet<i64> = {
            let mut stmt = conn.prepare("SELECT api_index FROM api_stats")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut set = HashSet::new();
            for r in rows {
                set.insert(r?);
            }
            set
        };

        let next_time = (Utc::now() + Duration::seconds(60)).to_rfc3339();
        for (i, config) in configs.iter().enumerate() {
            let index = i as i64;
            if existing.contains(&index) {
                conn.execute(
                    "UPDATE api_stats
                     SET api_name = ?1, api_url = ?2, api_key = ?3, api_model = ?4
                     WHERE api_index = ?5",
                    (&config.name, &config.url, &config.api_key, &config.model, index),
                )?;
            } else {
                conn.execute(
                    "INSERT INTO api_stats
                     (api_index, api_name, api_url, api_key, api_model,
                      total_calls, success_calls, failed_calls, next_scheduled_call)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, ?6)",
                    (index, &config.name, &config.url, &config.api_key, &config.model, &next_time),
                )?;
            }
        }
        Ok(())
    }

    pub async fn get_all_stats(&self) -> Result<Vec<ProviderStats>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT api_index, api_name, api_url, api_key, api_model,
                    total_calls, success_calls, failed_calls, last_call, next_scheduled_call
             FROM api_stats
             ORDER BY api_index ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let name: String = row.get(1)?;
            let url: String = row.get(2)?;
            let api_key: String = row.get(3)?;
            let model: String = row.get(4)?;
            Ok(ProviderStats {
                total_calls: row.get(5)?,
                success_calls: row.get(6)?,
                failed_calls: row.get(7)?,
                last_call: parse_optional_timestamp(row.get(8)?),
                next_scheduled_call: parse_optional_timestamp(row.get(9)?),
                config: ProviderConfig { name, model, url, api_key },
            })
        })?;

        let mut stats = Vec::new();
        for s in rows {
            stats.push(s?);
        }
        Ok(stats)
    }

    /// 应用一批计数器增量；单条失败只记日志，不回滚其他条目
    pub async fn apply_deltas(&self, deltas: &[StatsDelta]) -> Result<()> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "UPDATE api_stats
             SET total_calls = total_calls + ?1,
                 success_calls = success_calls + ?2,
                 failed_calls = failed_calls + ?3,
                 last_call = ?4,
                 next_scheduled_call = ?5
             WHERE api_index = ?6",
        )?;
        for delta in deltas {
            if let Err(e) = stmt.execute((
                delta.total_inc,
                delta.success_inc,
                delta.failed_inc,
                delta.last_call.to_rfc3339(),
                delta.next_call.to_rfc3339(),
                delta.api_index as i64,
            )) {
                tracing::error!("更新API统计失败: {}", e);
            }
        }
        Ok(())
    }

    pub async fn append_history(&self, items: &[HistoryRecord]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let conn = self.connection.lock().await;
        {
            let mut stmt = conn.prepare(
                "INSERT INTO api_history
                 (api_index, api_name, question, answer, success, error, duration, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for item in items {
                if let Err(e) = stmt.execute((
                    item.api_index,
                    &item.api_name,
                    &item.question,
                    &item.answer,
                    item.success as i64,
                    &item.error,
                    item.duration_ms,
                    item.timestamp.to_rfc3339(),
                )) {
                    tracing::error!("添加历史记录项失败: {}", e);
                }
            }
        }

        // 裁剪到上限，只保留最新的 history_limit 条
        conn.execute(
            "DELETE FROM api_history
             WHERE id NOT IN (
                 SELECT id FROM api_history
                 ORDER BY timestamp DESC
                 LIMIT ?1
             )",
            [self.history_limit],
        )?;
        Ok(())
    }

    pub async fn recent_history(&self, limit: i64) -> Result<Vec<HistoryRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, api_index, api_name, question, answer, success, error, duration, timestamp
             FROM api_history
             ORDER BY timestamp DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], map_history_row)?;
        let mut history = Vec::new();
        for item in rows {
            history.push(item?);
        }
        Ok(history)
    }

    pub async fn recent_history_since(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, api_index, api_name, question, answer, success, error, duration, timestamp
             FROM api_history
             WHERE timestamp > ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map((cutoff.to_rfc3339(), limit), map_history_row)?;
        let mut history = Vec::new();
        for item in rows {
            history.push(item?);
        }
        Ok(history)
    }

    pub async fn clear_history(&self) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute("DELETE FROM api_history", [])?;
        Ok(())
    }
}

fn parse_optional_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn map_history_row(row: &rusqlite::Row<'_>) -> Result<HistoryRecord> {
    let success: i64 = row.get(5)?;
    let timestamp: String = row.get(8)?;
    Ok(HistoryRecord {
        id: Some(row.get(0)?),
        api_index: row.get(1)?,
        api_name: row.get(2)?,
        question: row.get(3)?,
        answer: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        success: success != 0,
        error: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        duration_ms: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stats::{StatsUpdate, aggregate};
    use tempfile::tempdir;

    fn config(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            model: "test-model".to_string(),
            url: format!("https://example.com/{}", name),
            api_key: "sk-test".to_string(),
        }
    }

    fn record(api_index: i64, success: bool, timestamp: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord {
            id: None,
            api_index,
            api_name: format!("api-{}", api_index),
            question: "Hi".to_string(),
            answer: if success { "ok".to_string() } else { String::new() },
            success,
            error: if success { String::new() } else { "boom".to_string() },
            duration_ms: 12,
            timestamp,
        }
    }

    async fn store(history_limit: i64) -> (DatabaseStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keeper.db");
        let store = DatabaseStore::new(path.to_str().unwrap(), history_limit)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn sync_creates_dense_indexed_rows() {
        let (store, _dir) = store(50).await;
        store
            .sync_providers(&[config("a"), config("b"), config("c")])
            .await
            .unwrap();

        let stats = store.get_all_stats().await.unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].config.name, "a");
        assert_eq!(stats[2].config.name, "c");
        for s in &stats {
            assert_eq!(s.total_calls, 0);
            assert!(s.last_call.is_none());
            assert!(s.next_scheduled_call.is_some());
        }
    }

    #[tokio::test]
    async fn resync_updates_config_but_keeps_counters() {
        let (store, _dir) = store(50).await;
        store.sync_providers(&[config("old")]).await.unwrap();

        let now = Utc::now();
        let deltas = aggregate(
            &[StatsUpdate { api_index: 0, success: true, next_call_time: now }],
            now,
        );
        store.apply_deltas(&deltas).await.unwrap();

        let mut renamed = config("old");
        renamed.name = "renamed".to_string();
        store.sync_providers(&[renamed]).await.unwrap();

        let stats = store.get_all_stats().await.unwrap();
        assert_eq!(stats[0].config.name, "renamed");
        assert_eq!(stats[0].total_calls, 1);
        assert_eq!(stats[0].success_calls, 1);
    }

    #[tokio::test]
    async fn deltas_accumulate_instead_of_overwriting() {
        let (store, _dir) = store(50).await;
        store
            .sync_providers(&[config("a"), config("b"), config("c"), config("d")])
            .await
            .unwrap();

        let now = Utc::now();
        let next = now + Duration::seconds(60);
        let updates = vec![
            StatsUpdate { api_index: 3, success: true, next_call_time: next },
            StatsUpdate { api_index: 3, success: false, next_call_time: next },
        ];
        store.apply_deltas(&aggregate(&updates, now)).await.unwrap();

        let stats = store.get_all_stats().await.unwrap();
        assert_eq!(stats[3].total_calls, 2);
        assert_eq!(stats[3].success_calls, 1);
        assert_eq!(stats[3].failed_calls, 1);
        assert!(stats[3].last_call.is_some());
        // 其他 Provider 不受影响
        assert_eq!(stats[0].total_calls, 0);
    }

    #[tokio::test]
    async fn history_is_trimmed_to_limit_newest_first() {
        let (store, _dir) = store(5).await;
        let base = Utc::now();
        let items: Vec<HistoryRecord> = (0..8)
            .map(|i| record(i, true, base + Duration::seconds(i)))
            .collect();
        store.append_history(&items).await.unwrap();

        let history = store.recent_history(50).await.unwrap();
        assert_eq!(history.len(), 5);
        // 最新在前，最老的 3 条被裁掉
        assert_eq!(history[0].api_index, 7);
        assert_eq!(history[4].api_index, 3);
    }

    #[tokio::test]
    async fn recent_since_filters_by_cutoff() {
        let (store, _dir) = store(50).await;
        let now = Utc::now();
        let items = vec![
            record(0, true, now - Duration::hours(2)),
            record(1, false, now - Duration::minutes(10)),
        ];
        store.append_history(&items).await.unwrap();

        let recent = store
            .recent_history_since(now - Duration::hours(1), 20)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].api_index, 1);
        assert!(!recent[0].success);
        assert_eq!(recent[0].error, "boom");
    }

    #[tokio::test]
    async fn clear_history_empties_the_table() {
        let (store, _dir) = store(50).await;
        store
            .append_history(&[record(0, true, Utc::now())])
            .await
            .unwrap();
        store.clear_history().await.unwrap();
        assert!(store.recent_history(10).await.unwrap().is_empty());
    }
}
