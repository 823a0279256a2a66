use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::stream::{StreamDecoder, StreamOutcome, StreamPhase};
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ConnectionStatus, Message, RoleDraft,
};
use crate::config::{ChatSettings, CONNECT_TIMEOUT};
use crate::error::{ChatError, Result};

pub const ROLE_GENERATION_PROMPT: &str = r#"你是一个角色生成助手。根据用户提供的关键词，生成一个有趣的AI角色人设。

要求：
1. 返回JSON格式：{"name": "角色名称", "description": "角色描述", "personality": "性格特点", "prompt": "完整的系统提示词"}
2. 系统提示词要详细描述角色的背景、性格、说话风格等
3. 角色要有趣、有个性，符合关键词描述
4. 提示词长度在200-500字之间

示例关键词：猫咪、程序员
返回示例：
{
  "name": "程序猫小码",
  "description": "一只热爱编程的橘色小猫咪",
  "personality": "聪明、幽默、有点强迫症",
  "prompt": "你是程序猫小码，一只精通各种编程语言的橘色小猫咪。你有着程序员的严谨和猫咪的可爱。说话时偶尔会用'喵'结尾，喜欢用代码比喻解释问题。你对代码有强迫症，追求完美和优雅。性格幽默风趣，但在技术问题上非常认真。"
}"#;

/// 当前进行中的流式请求
type ActiveRequest = Option<(u64, CancellationToken)>;

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    settings: ChatSettings,
    active: Arc<Mutex<ActiveRequest>>,
    next_request: Arc<AtomicU64>,
}

enum Connect {
    Cancelled,
    Failed(ChatError),
    Ready(reqwest::Response),
}

impl ApiClient {
    pub fn new(settings: ChatSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            settings,
            active: Arc::new(Mutex::new(None)),
            next_request: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// 更新设置；进行中的请求仍可通过任一克隆取消
    pub fn update_settings(&mut self, settings: ChatSettings) {
        self.settings = settings;
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.settings.api_key.trim()))?,
        );
        Ok(headers)
    }

    pub fn request_body<'a>(
        &'a self,
        messages: &'a [Message],
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.settings.model,
            messages,
            stream,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    /// 发送请求，非 2xx 状态转换为错误
    async fn post(&self, messages: &[Message], stream: bool) -> Result<reqwest::Response> {
        if !self.settings.has_api_key() {
            return Err(ChatError::MissingApiKey);
        }

        let response = self
            .client
            .post(&self.settings.api_url)
            .headers(self.headers()?)
            .json(&self.request_body(messages, stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status, &body));
        }
        Ok(response)
    }

    /// 是否有进行中的流式请求
    pub async fn has_active_request(&self) -> bool {
        self.active.lock().await.is_some()
    }

    async fn register(&self) -> (u64, CancellationToken) {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *self.active.lock().await = Some((id, token.clone()));
        (id, token)
    }

    async fn release(&self, id: u64) {
        let mut active = self.active.lock().await;
        if matches!(&*active, Some((current, _)) if *current == id) {
            *active = None;
        }
    }

    /// 发送流式请求，增量内容通过回调返回
    ///
    /// 所有失败都只通过 `on_error` 报告一次；被 [`ApiClient::cancel_request`]
    /// 取消时不调用任何结束回调。无法解析的行记录在返回值中。
    pub async fn stream_chat<D, F, R>(
        &self,
        messages: &[Message],
        on_delta: D,
        on_done: F,
        on_error: R,
    ) -> StreamOutcome
    where
        D: FnMut(&str, &str),
        F: FnOnce(&str),
        R: FnOnce(ChatError),
    {
        if !self.settings.has_api_key() {
            on_error(ChatError::MissingApiKey);
            return StreamOutcome::failed();
        }

        let (request_id, cancel) = self.register().await;

        let connect = tokio::select! {
            biased;
            _ = cancel.cancelled() => Connect::Cancelled,
            result = self.post(messages, true) => match result {
                Ok(response) => Connect::Ready(response),
                Err(e) => Connect::Failed(e),
            },
        };

        let outcome = match connect {
            Connect::Cancelled => StreamOutcome {
                phase: StreamPhase::Cancelled,
                text: String::new(),
                malformed: Vec::new(),
            },
            Connect::Failed(e) => {
                on_error(e);
                StreamOutcome::failed()
            }
            Connect::Ready(response) => {
                let mut decoder = StreamDecoder::new();
                decoder
                    .consume(response.bytes_stream(), &cancel, on_delta, on_done, on_error)
                    .await
            }
        };

        self.release(request_id).await;
        outcome
    }

    /// 非流式请求，返回 `choices[0].message.content`
    pub async fn send_message(&self, messages: &[Message]) -> Result<String> {
        let response = self.post(messages, false).await?;
        let raw = response.text().await?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&raw)
            .map_err(|e| ChatError::InvalidResponse(format!("{e}: {raw}")))?;
        Ok(parsed.into_content())
    }

    /// 取消当前的流式请求，没有进行中的请求时返回 `false`
    pub async fn cancel_request(&self) -> bool {
        match self.active.lock().await.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn test_connection(&self) -> ConnectionStatus {
        match self.send_message(&[Message::user("你好")]).await {
            Ok(_) => ConnectionStatus {
                success: true,
                message: "连接成功".to_string(),
            },
            Err(e) => ConnectionStatus {
                success: false,
                message: e.to_string(),
            },
        }
    }

    /// 根据关键词生成角色人设
    pub async fn generate_role(&self, keywords: &str) -> Result<RoleDraft> {
        let messages = [
            Message::system(ROLE_GENERATION_PROMPT),
            Message::user(&format!("关键词：{}", keywords)),
        ];

        let reply = self.send_message(&messages).await.map_err(|e| match e {
            ChatError::RoleGeneration(_) => e,
            other => ChatError::RoleGeneration(other.to_string()),
        })?;
        parse_role_draft(&reply)
    }
}

/// 从模型回复中截取最外层的 JSON 对象并校验
pub fn parse_role_draft(reply: &str) -> Result<RoleDraft> {
    let object = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => return Err(ChatError::RoleGeneration("无法解析角色数据".to_string())),
    };

    let draft: RoleDraft =
        serde_json::from_str(object).map_err(|e| ChatError::RoleGeneration(e.to_string()))?;

    if draft.name.is_empty() || draft.prompt.is_empty() {
        return Err(ChatError::RoleGeneration("角色数据不完整".to_string()));
    }
    Ok(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn client(api_key: &str) -> ApiClient {
        ApiClient::new(ChatSettings {
            api_key: api_key.to_string(),
            ..ChatSettings::default()
        })
        .unwrap()
    }

    fn local_client(addr: std::net::SocketAddr) -> ApiClient {
        ApiClient::new(ChatSettings {
            api_key: "sk-test".to_string(),
            api_url: format!("http://{addr}/v1/chat/completions"),
            ..ChatSettings::default()
        })
        .unwrap()
    }

    /// 读完请求头和请求体
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    /// 对第一个连接返回固定响应
    async fn serve_once(status: &'static str, body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        addr
    }

    /// 接受连接但永不响应
    async fn serve_silently() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(socket);
        });
        addr
    }

    async fn wait_for_active(client: &ApiClient) {
        for _ in 0..200 {
            if client.has_active_request().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request never became active");
    }

    #[test]
    fn request_body_uses_settings() {
        let mut client = client("sk-test");
        client.update_settings(ChatSettings {
            api_key: "sk-test".to_string(),
            model: "deepseek-reasoner".to_string(),
            max_tokens: 100,
            temperature: 1.0,
            ..ChatSettings::default()
        });

        let messages = [Message::user("hi")];
        let body = client.request_body(&messages, false);
        assert_eq!(body.model, "deepseek-reasoner");
        assert_eq!(body.max_tokens, 100);
        assert!(!body.stream);
    }

    #[test]
    fn bearer_header_is_set() {
        let headers = client(" sk-test ").headers().unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer sk-test");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn missing_key_reports_error_once() {
        let client = client("  ");
        let mut errors = Vec::new();
        let mut done = 0;
        let outcome = client
            .stream_chat(
                &[Message::user("hi")],
                |_, _| {},
                |_| done += 1,
                |e| errors.push(e),
            )
            .await;

        assert_eq!(outcome.phase, StreamPhase::Failed);
        assert_eq!(done, 0);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ChatError::MissingApiKey));
    }

    #[tokio::test]
    async fn blocking_request_without_key_fails() {
        let status = client("").test_connection().await;
        assert!(!status.success);
        assert_eq!(status.message, "请先设置DeepSeek API密钥");
    }

    #[tokio::test]
    async fn cancel_without_active_request_is_noop() {
        assert!(!client("sk-test").cancel_request().await);
    }

    #[tokio::test]
    async fn error_status_reports_body_message_once() {
        let addr = serve_once(
            "401 Unauthorized",
            r#"{"error":{"message":"Authentication Fails"}}"#,
        )
        .await;
        let client = local_client(addr);

        let mut done = 0;
        let mut errors = Vec::new();
        let outcome = client
            .stream_chat(
                &[Message::user("hi")],
                |_, _| {},
                |_| done += 1,
                |e| errors.push(e),
            )
            .await;

        assert_eq!(outcome.phase, StreamPhase::Failed);
        assert_eq!(done, 0);
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            ChatError::Status { status, message } => {
                assert_eq!(status.as_u16(), 401);
                assert_eq!(message, "Authentication Fails");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!client.has_active_request().await);
    }

    #[tokio::test]
    async fn streamed_body_completes_and_releases_request() {
        let addr = serve_once(
            "200 OK",
            "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\ndata: [DONE]\n\n",
        )
        .await;
        let client = local_client(addr);

        let mut done = Vec::new();
        let outcome = client
            .stream_chat(
                &[Message::user("hi")],
                |_, _| {},
                |full| done.push(full.to_string()),
                |e| panic!("unexpected error: {e}"),
            )
            .await;

        assert!(outcome.is_completed());
        assert_eq!(done, vec!["你好".to_string()]);
        assert!(!client.has_active_request().await);
        assert!(!client.cancel_request().await);
    }

    #[tokio::test]
    async fn cancel_while_connecting_fires_no_callback() {
        let addr = serve_silently().await;
        let client = local_client(addr);

        let running = client.clone();
        let request = tokio::spawn(async move {
            let mut done = 0;
            let mut failed = 0;
            let outcome = running
                .stream_chat(
                    &[Message::user("hi")],
                    |_, _| {},
                    |_| done += 1,
                    |_| failed += 1,
                )
                .await;
            (outcome, done + failed)
        });

        wait_for_active(&client).await;
        assert!(client.cancel_request().await);

        let (outcome, calls) = tokio::time::timeout(Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(calls, 0);
        assert!(!client.has_active_request().await);
    }

    #[tokio::test]
    async fn updated_settings_keep_the_active_request_cancellable() {
        let addr = serve_silently().await;
        let mut client = local_client(addr);

        let running = client.clone();
        let request = tokio::spawn(async move {
            running
                .stream_chat(&[Message::user("hi")], |_, _| {}, |_| {}, |_| {})
                .await
        });
        wait_for_active(&client).await;

        let settings = ChatSettings {
            model: "deepseek-reasoner".to_string(),
            ..client.settings().clone()
        };
        client.update_settings(settings);
        assert!(client.cancel_request().await);

        let outcome = tokio::time::timeout(Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_cancelled());
    }

    #[test]
    fn role_draft_is_extracted_from_prose() {
        let reply = "好的，这是角色：\n```json\n{\"name\": \"程序猫小码\", \"description\": \"橘猫\", \"personality\": \"幽默\", \"prompt\": \"你是程序猫小码\"}\n```";
        let draft = parse_role_draft(reply).unwrap();
        assert_eq!(draft.name, "程序猫小码");
        assert_eq!(draft.prompt, "你是程序猫小码");
    }

    #[test]
    fn role_draft_rejects_bad_replies() {
        assert!(matches!(
            parse_role_draft("抱歉，我无法生成"),
            Err(ChatError::RoleGeneration(_))
        ));
        assert!(parse_role_draft("{\"name\": \"x\"}").is_err());
        assert!(parse_role_draft(
            "{\"name\": \"\", \"description\": \"\", \"personality\": \"\", \"prompt\": \"p\"}"
        )
        .is_err());
    }
}
