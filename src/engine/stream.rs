use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// SSE 数据行前缀（固定 6 个字符）
const DATA_PREFIX: &str = "data: ";
/// 流结束哨兵
const DONE_SENTINEL: &str = "[DONE]";
/// 所有兜底策略都取不到内容时的占位回答；这仍算一次成功调用
pub const EMPTY_ANSWER: &str = "无响应内容";

const RAW_PREVIEW_CHARS: usize = 200;

static CONTENT_FALLBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""content":\s*"([^"]*?)""#).unwrap());

type Extractor = fn(&Value) -> Option<String>;

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

fn delta_content(v: &Value) -> Option<String> {
    non_empty(v.pointer("/choices/0/delta/content")?.as_str()?)
}

fn message_content(v: &Value) -> Option<String> {
    non_empty(v.pointer("/choices/0/message/content")?.as_str()?)
}

fn choice_text(v: &Value) -> Option<String> {
    non_empty(v.pointer("/choices/0/text")?.as_str()?)
}

fn response_field(v: &Value) -> Option<String> {
    non_empty(v.get("response")?.as_str()?)
}

fn bare_content(v: &Value) -> Option<String> {
    non_empty(v.get("content")?.as_str()?)
}

// 流式片段的取值优先级：delta 内容 -> 完整消息内容 -> 顶层 content，先命中者生效
const STREAM_EXTRACTORS: &[Extractor] = &[delta_content, message_content, bare_content];
// 整体响应体兜底时的扩展优先级
const BODY_EXTRACTORS: &[Extractor] = &[message_content, choice_text, response_field, bare_content];

fn extract_first(v: &Value, extractors: &[Extractor]) -> Option<String> {
    extractors.iter().find_map(|extract| extract(v))
}

/// 一次解码尝试的最终产物
#[derive(Debug)]
pub struct DecodedAnswer {
    pub answer: String,
    pub chunks: usize,
    pub skipped_fragments: usize,
    pub raw_preview: String,
}

/// 增量式 SSE 解码器：按字节块喂入，跨块的半行（包括被截断的 UTF-8
/// 序列）保留在缓冲区，与下一块拼接后再按行切分。
#[derive(Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    raw: Vec<u8>,
    answer: String,
    chunks: usize,
    skipped_fragments: usize,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已遇到 [DONE] 哨兵；之后喂入的数据一律忽略
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        if self.finished {
            return;
        }
        self.chunks += 1;
        self.raw.extend_from_slice(chunk);
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..line.len() - 1]);
            if self.finished {
                break;
            }
        }
    }

    fn process_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            self.finished = true;
            return;
        }
        if payload.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(v) => {
                if let Some(content) = extract_first(&v, STREAM_EXTRACTORS) {
                    self.answer.push_str(&content);
                }
            }
            Err(e) => {
                // 单个坏片段只计数跳过，不中断整次解码
                self.skipped_fragments += 1;
                tracing::debug!("解析流式数据失败: {}", e);
            }
        }
    }

    /// 流结束后调用：冲洗残留的半行，再走兜底阶梯
    pub fn finish(mut self) -> DecodedAnswer {
        if !self.finished && !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.process_line(&tail);
        }

        if self.answer.is_empty() && !self.raw.is_empty() {
            let full = String::from_utf8_lossy(&self.raw).into_owned();

            if let Ok(v) = serde_json::from_str::<Value>(&full)
                && let Some(content) = extract_first(&v, BODY_EXTRACTORS)
            {
                self.answer = content;
            }

            if self.answer.is_empty()
                && let Some(caps) = CONTENT_FALLBACK_RE.captures(&full)
            {
                self.answer = caps[1].to_string();
            }
        }

        let raw = String::from_utf8_lossy(&self.raw);
        let raw_preview = if raw.chars().count() > RAW_PREVIEW_CHARS {
            let head: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
            format!("{}...", head)
        } else {
            raw.into_owned()
        };

        let answer = if self.answer.is_empty() {
            EMPTY_ANSWER.to_string()
        } else {
            self.answer
        };

        DecodedAnswer {
            answer,
            chunks: self.chunks,
            skipped_fragments: self.skipped_fragments,
            raw_preview,
        }
    }
}
