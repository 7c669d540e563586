use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::KeeperEngine;
use crate::storage::{HistoryRecord, HistoryStore};

/// 启动后台保活循环：每隔 interval_secs 调用一次全部 API。
/// 任何一轮的失败只记日志，不会终止循环。
pub fn spawn(
    engine: Arc<KeeperEngine>,
    history_store: Arc<dyn HistoryStore>,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即完成，先消费掉，启动时不立刻打一轮
        ticker.tick().await;

        loop {
            ticker.tick().await;
            run_once(&engine, &history_store).await;
        }
    })
}

async fn run_once(engine: &KeeperEngine, history_store: &Arc<dyn HistoryStore>) {
    let started = Utc::now();
    match engine.invoke_all().await {
        Ok(outcomes) => {
            let success = outcomes.iter().filter(|o| o.success).count();
            let total = outcomes.len();
            tracing::info!("API调用完成: 成功 {}/{}", success, total);

            // 额外写一条标记记录，/debug-cron 靠它确认定时任务在跑
            let marker = HistoryRecord {
                id: None,
                api_index: 0,
                api_name: "CRON-TASK".to_string(),
                question: "定时任务自动调用".to_string(),
                answer: format!("调用了{}个API, 成功{}个", total, success),
                success: true,
                error: String::new(),
                duration_ms: (Utc::now() - started).num_milliseconds(),
                timestamp: Utc::now(),
            };
            if let Err(err) = history_store.append(std::slice::from_ref(&marker)).await {
                tracing::error!("写入定时任务标记失败: {}", err);
            }
        }
        Err(err) => {
            tracing::error!("定时任务执行失败: {}", err);
        }
    }
}
