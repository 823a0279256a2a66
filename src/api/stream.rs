use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::types::ChatCompletionChunk;
use crate::error::ChatError;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// 每一条 `data:` 行解析出的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    /// 无法解析的原始行，不会中断整个流
    ParseError(String),
}

/// 解码器状态：`Idle -> Streaming -> {Completed | Cancelled | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

/// 一次流式请求结束后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub phase: StreamPhase,
    /// 已累积的完整文本；取消时为部分内容
    pub text: String,
    pub malformed: Vec<String>,
}

impl StreamOutcome {
    pub fn failed() -> Self {
        Self {
            phase: StreamPhase::Failed,
            text: String::new(),
            malformed: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase == StreamPhase::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase == StreamPhase::Cancelled
    }
}

/// 增量 UTF-8 解码，跨块的多字节字符会被缓存到下一次读取
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(err) => {
                    let (valid, invalid) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &invalid[len..];
                        }
                        // 末尾是不完整的字符，留到下一块
                        None => {
                            rest = invalid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        text
    }

    fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// 把字节块重新组装成 SSE 行并解析成 [`StreamEvent`]
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    partial_line: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 处理一个字节块，返回其中所有完整行产生的事件
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let text = self.utf8.decode(chunk);
        self.partial_line.push_str(&text);

        let mut events = Vec::new();
        while let Some(pos) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// 流自然结束时调用，处理最后一行没有换行符的数据
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let tail = self.utf8.finish();
        self.partial_line.push_str(&tail);
        let line = std::mem::take(&mut self.partial_line);
        parse_line(&line).into_iter().collect()
    }
}

/// 解析单行 SSE 数据
///
/// 空行和非 `data: ` 开头的行返回 `None`；没有内容的增量同样返回 `None`。
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
    if line.trim().is_empty() {
        return None;
    }

    let payload = line.strip_prefix(DATA_PREFIX)?;
    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<ChatCompletionChunk>(payload) {
        Ok(chunk) => chunk.into_content().map(StreamEvent::Delta),
        Err(_) => Some(StreamEvent::ParseError(line.to_string())),
    }
}

/// 单次请求独占的状态
#[derive(Debug, Default)]
struct StreamState {
    full_text: String,
    decoder: SseDecoder,
    malformed: Vec<String>,
}

enum Read<T> {
    Cancelled,
    Item(Option<T>),
}

/// 流式响应解码器，每个请求使用一个新实例
#[derive(Debug)]
pub struct StreamDecoder {
    state: StreamState,
    phase: StreamPhase,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            state: StreamState::default(),
            phase: StreamPhase::Idle,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// 读取响应体直到 `[DONE]`、流结束、出错或被取消
    ///
    /// `on_done` 与 `on_error` 最多各调用一次且互斥；取消时两者都不会调用。
    /// 解码器只能使用一次，结束后再次调用不读取流也不触发回调。
    pub async fn consume<S, B, E, D, F, R>(
        &mut self,
        stream: S,
        cancel: &CancellationToken,
        mut on_delta: D,
        on_done: F,
        on_error: R,
    ) -> StreamOutcome
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<ChatError>,
        D: FnMut(&str, &str),
        F: FnOnce(&str),
        R: FnOnce(ChatError),
    {
        if self.phase != StreamPhase::Idle {
            return StreamOutcome {
                phase: self.phase,
                text: String::new(),
                malformed: Vec::new(),
            };
        }

        self.phase = StreamPhase::Streaming;
        let mut stream = std::pin::pin!(stream);

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => Read::Cancelled,
                item = stream.next() => Read::Item(item),
            };

            match read {
                Read::Cancelled => return self.finish(StreamPhase::Cancelled),
                Read::Item(Some(Ok(chunk))) => {
                    let events = self.state.decoder.feed(chunk.as_ref());
                    if self.apply(events, &mut on_delta) {
                        on_done(&self.state.full_text);
                        return self.finish(StreamPhase::Completed);
                    }
                }
                Read::Item(Some(Err(err))) => {
                    on_error(err.into());
                    return self.finish(StreamPhase::Failed);
                }
                Read::Item(None) => {
                    let events = self.state.decoder.finish();
                    self.apply(events, &mut on_delta);
                    on_done(&self.state.full_text);
                    return self.finish(StreamPhase::Completed);
                }
            }
        }
    }

    /// 依次应用事件，遇到 `[DONE]` 时返回 `true` 并丢弃其后的事件
    fn apply<D>(&mut self, events: Vec<StreamEvent>, on_delta: &mut D) -> bool
    where
        D: FnMut(&str, &str),
    {
        for event in events {
            match event {
                StreamEvent::Delta(content) => {
                    self.state.full_text.push_str(&content);
                    on_delta(&content, &self.state.full_text);
                }
                StreamEvent::Done => return true,
                StreamEvent::ParseError(line) => self.state.malformed.push(line),
            }
        }
        false
    }

    fn finish(&mut self, phase: StreamPhase) -> StreamOutcome {
        self.phase = phase;
        StreamOutcome {
            phase,
            text: std::mem::take(&mut self.state.full_text),
            malformed: std::mem::take(&mut self.state.malformed),
        }
    }
}

/// 使用一个新的 [`StreamDecoder`] 读取整个响应体
pub async fn consume<S, B, E, D, F, R>(
    stream: S,
    cancel: &CancellationToken,
    on_delta: D,
    on_done: F,
    on_error: R,
) -> StreamOutcome
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ChatError>,
    D: FnMut(&str, &str),
    F: FnOnce(&str),
    R: FnOnce(ChatError),
{
    let mut decoder = StreamDecoder::new();
    decoder
        .consume(stream, cancel, on_delta, on_done, on_error)
        .await
}
