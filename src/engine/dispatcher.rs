use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::settings::RetryPolicy;
use crate::storage::{HistoryRecord, ProviderStats};

use super::InvocationOutcome;
use super::invoker::{call_provider, placeholder_name};
use super::stats::StatsUpdate;

/// 一次批量调用的全部产物：结果、历史记录、统计更新
pub(crate) struct BatchOutput {
    pub outcomes: Vec<InvocationOutcome>,
    pub history: Vec<HistoryRecord>,
    pub updates: Vec<StatsUpdate>,
}

/// 并发调用一组 Provider。每个索引一个独立任务，全部结束后才返回；
/// 结果顺序与请求的索引顺序一致，与完成先后无关。
pub(crate) async fn dispatch_batch(
    client: &reqwest::Client,
    snapshot: &Arc<Vec<ProviderStats>>,
    questions: &Arc<Vec<String>>,
    retry: RetryPolicy,
    reschedule_secs: i64,
    indices: &[usize],
) -> BatchOutput {
    tracing::info!(count = indices.len(), "并行调用API");

    let handles: Vec<_> = indices
        .iter()
        .map(|&index| {
            tokio::spawn(call_provider(
                client.clone(),
                snapshot.clone(),
                questions.clone(),
                retry,
                index,
            ))
        })
        .collect();

    let mut outcomes = Vec::with_capacity(indices.len());
    for (handle, &index) in handles.into_iter().zip(indices) {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                // 任务层面的失败（panic 等）也折算成失败结果，不影响其他任务
                tracing::error!(index, error = %e, "API调用任务异常");
                let api_name = snapshot
                    .get(index)
                    .map(|s| s.config.name.clone())
                    .unwrap_or_else(|| placeholder_name(index));
                InvocationOutcome::failure(
                    index,
                    api_name,
                    String::new(),
                    String::new(),
                    "调用过程异常".to_string(),
                    e.to_string(),
                    0,
                )
            }
        };
        outcomes.push(outcome);
    }

    // 无论成败都把下次调用排在 reschedule_secs 之后，失败的 Provider 不会被饿死
    let next_call_time = Utc::now() + Duration::seconds(reschedule_secs);
    let history = outcomes.iter().map(HistoryRecord::from_outcome).collect();
    let updates = outcomes
        .iter()
        .map(|o| StatsUpdate {
            api_index: o.api_index,
            success: o.success,
            next_call_time,
        })
        .collect();

    BatchOutput {
        outcomes,
        history,
        updates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ProviderConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn stats_for(server_uri: &str, names_and_paths: &[(&str, &str)]) -> Arc<Vec<ProviderStats>> {
        let stats = names_and_paths
            .iter()
            .map(|(name, p)| ProviderStats {
                total_calls: 0,
                success_calls: 0,
                failed_calls: 0,
                last_call: None,
                next_scheduled_call: None,
                config: ProviderConfig {
                    name: name.to_string(),
                    model: "test-model".to_string(),
                    url: format!("{}{}", server_uri, p),
                    api_key: "sk-test".to_string(),
                },
            })
            .collect();
        Arc::new(stats)
    }

    fn sse_body(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\ndata: [DONE]\n\n",
            content
        )
    }

    #[tokio::test]
    async fn batch_preserves_requested_order_and_isolates_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p0"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        for p in ["/p1", "/p2"] {
            Mock::given(method("POST"))
                .and(path(p))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_raw(sse_body(p.trim_start_matches('/')), "text/event-stream"),
                )
                .mount(&server)
                .await;
        }

        let snapshot = stats_for(&server.uri(), &[("零号", "/p0"), ("一号", "/p1"), ("二号", "/p2")]);
        let questions = Arc::new(vec!["Hi".to_string()]);
        let retry = RetryPolicy { max_retries: 0, base_delay_ms: 1 };

        let batch = dispatch_batch(
            &reqwest::Client::new(),
            &snapshot,
            &questions,
            retry,
            60,
            &[2, 0, 1],
        )
        .await;

        let indices: Vec<usize> = batch.outcomes.iter().map(|o| o.api_index).collect();
        assert_eq!(indices, vec![2, 0, 1]);
        assert!(batch.outcomes[0].success);
        assert!(!batch.outcomes[1].success);
        assert!(batch.outcomes[2].success);
        assert_eq!(batch.outcomes[0].answer.as_deref(), Some("p2"));
        assert_eq!(batch.outcomes[2].answer.as_deref(), Some("p1"));

        // 每次尝试都产生历史与统计更新，失败的也要重新排期
        assert_eq!(batch.history.len(), 3);
        assert_eq!(batch.updates.len(), 3);
        let now = Utc::now();
        for update in &batch.updates {
            let secs = (update.next_call_time - now).num_seconds();
            assert!((50..=61).contains(&secs), "next call must be ~60s out, got {}", secs);
        }
        assert!(!batch.updates[1].success);
    }

    #[tokio::test]
    async fn out_of_range_index_yields_synthetic_failure() {
        let snapshot: Arc<Vec<ProviderStats>> = Arc::new(Vec::new());
        let questions = Arc::new(vec!["Hi".to_string()]);
        let retry = RetryPolicy { max_retries: 0, base_delay_ms: 1 };

        let batch = dispatch_batch(
            &reqwest::Client::new(),
            &snapshot,
            &questions,
            retry,
            60,
            &[5],
        )
        .await;

        assert_eq!(batch.outcomes.len(), 1);
        assert!(!batch.outcomes[0].success);
        assert_eq!(batch.outcomes[0].api_name, "未知API-5");
        assert_eq!(batch.updates.len(), 1);
    }
}
