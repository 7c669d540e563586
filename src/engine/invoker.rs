use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use rand::Rng;

use crate::config::settings::{ProviderConfig, RetryPolicy};
use crate::error::KeeperError;
use crate::storage::ProviderStats;

use super::InvocationOutcome;
use super::stream::{DecodedAnswer, StreamDecoder};

/// 快照解析不出名字时的占位显示名
pub(crate) fn placeholder_name(index: usize) -> String {
    format!("未知API-{}", index)
}

fn pick_question(questions: &[String]) -> String {
    let idx = rand::rng().random_range(0..questions.len());
    questions[idx].clone()
}

/// 第 attempt 次重试前的等待时长：base * 2^attempt，无抖动
pub(crate) fn backoff_delay(base_delay_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_delay_ms.saturating_mul(2u64.saturating_pow(attempt)))
}

/// 单个 Provider 的端到端调用：发请求、流式解码、失败重试。
/// 任何失败都收敛为一条失败 Outcome，绝不向批次抛错。
pub(crate) async fn call_provider(
    client: reqwest::Client,
    snapshot: Arc<Vec<ProviderStats>>,
    questions: Arc<Vec<String>>,
    retry: RetryPolicy,
    index: usize,
) -> InvocationOutcome {
    let Some(stats) = snapshot.get(index) else {
        // 配置缺失属于调用方错误：立即失败，不消耗重试
        tracing::error!(index, "API配置未找到");
        return InvocationOutcome::failure(
            index,
            placeholder_name(index),
            String::new(),
            String::new(),
            "调用过程异常".to_string(),
            format!("API配置 {} 未找到", index),
            0,
        );
    };
    let config = &stats.config;

    let mut attempt: u32 = 0;
    loop {
        // 每次尝试独立随机选题，重试换题是可接受的
        let question = pick_question(&questions);
        let start = Instant::now();
        tracing::info!(provider = %config.name, attempt, "调用API（流式模式）");

        match attempt_call(&client, config, &question).await {
            Ok(decoded) => {
                let duration_ms = start.elapsed().as_millis() as i64;
                tracing::debug!(
                    provider = %config.name,
                    chunks = decoded.chunks,
                    skipped = decoded.skipped_fragments,
                    answer_len = decoded.answer.len(),
                    "流式响应完成"
                );
                return InvocationOutcome {
                    api_index: index,
                    api_name: config.name.clone(),
                    model: config.model.clone(),
                    url: config.url.clone(),
                    question,
                    success: true,
                    answer: Some(decoded.answer),
                    error: None,
                    duration_ms,
                    timestamp: Utc::now(),
                    stream_chunks: decoded.chunks,
                    raw_response: Some(decoded.raw_preview),
                };
            }
            Err(e) => {
                if attempt >= retry.max_retries {
                    tracing::error!(provider = %config.name, error = %e, "调用失败，重试次数已用尽");
                    return InvocationOutcome::failure(
                        index,
                        config.name.clone(),
                        config.model.clone(),
                        config.url.clone(),
                        question,
                        e.to_string(),
                        start.elapsed().as_millis() as i64,
                    );
                }
                let delay = backoff_delay(retry.base_delay_ms, attempt);
                tracing::warn!(
                    provider = %config.name,
                    retry = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "调用失败，准备重试"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// 一次网络尝试：HTTP 请求 + 整条流交给解码器消费
async fn attempt_call(
    client: &reqwest::Client,
    config: &ProviderConfig,
    question: &str,
) -> Result<DecodedAnswer, KeeperError> {
    let body = serde_json::json!({
        "messages": [{ "role": "user", "content": question }],
        "model": config.model,
        "max_tokens": 50,
        "temperature": 0.3,
        "stream": true,
    });

    let response = client
        .post(&config.url)
        .header("Authorization", format!("Bearer {}", config.api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(KeeperError::UpstreamStatus(status.as_u16()));
    }

    let mut decoder = StreamDecoder::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        decoder.push_chunk(&chunk?);
        if decoder.is_finished() {
            // [DONE] 之后不再读取剩余分块
            break;
        }
    }
    Ok(decoder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(backoff_delay(1000, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1000, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(1000, 3), Duration::from_millis(8000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let d = backoff_delay(u64::MAX, 63);
        assert_eq!(d, Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn missing_config_fails_immediately_without_retry() {
        let snapshot = Arc::new(Vec::new());
        let questions = Arc::new(vec!["Hi".to_string()]);
        let retry = RetryPolicy { max_retries: 3, base_delay_ms: 60_000 };

        // base_delay 很大：若误走了重试路径，测试会超时
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            call_provider(reqwest::Client::new(), snapshot, questions, retry, 7),
        )
        .await
        .expect("config error must not consume retries");

        assert!(!outcome.success);
        assert_eq!(outcome.api_name, "未知API-7");
        assert!(outcome.error.unwrap().contains("未找到"));
    }
}
