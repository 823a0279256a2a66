use serde::{Deserialize, Serialize};

/// 对话消息角色
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// 消息结构
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: &str) -> Self {
        Self::new(Role::System, content)
    }
}

/// 请求体
#[derive(Serialize, Debug)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// DeepSeek API 流式响应中的选择项
#[derive(Deserialize, Debug)]
pub struct Choice {
    #[serde(default)]
    pub delta: Option<Delta>,
}

/// 消息增量（用于流式响应）
#[derive(Deserialize, Debug)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

/// 流式响应数据块
#[derive(Deserialize, Debug)]
pub struct ChatCompletionChunk {
    pub choices: Vec<Choice>,
}

impl ChatCompletionChunk {
    /// `choices[0].delta.content`，空字符串视为没有内容
    pub fn into_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())
    }
}

/// 非流式响应
#[derive(Deserialize, Debug)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
}

#[derive(Deserialize, Debug)]
pub struct ResponseChoice {
    #[serde(default)]
    pub message: Option<ResponseMessage>,
}

#[derive(Deserialize, Debug)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    pub fn into_content(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default()
    }
}

/// 模型生成的角色人设
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RoleDraft {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub prompt: String,
}

/// 连接测试结果
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionStatus {
    pub success: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_body_matches_wire_format() {
        let messages = vec![Message::system("be brief"), Message::user("hi")];
        let body = ChatCompletionRequest {
            model: "deepseek-chat",
            messages: &messages,
            stream: true,
            max_tokens: 2048,
            temperature: 0.5,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "model": "deepseek-chat",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ],
                "stream": true,
                "max_tokens": 2048,
                "temperature": 0.5
            })
        );
    }

    #[test]
    fn chunk_content_takes_first_choice_only() {
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"a"}},{"delta":{"content":"b"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.into_content().as_deref(), Some("a"));
    }

    #[test]
    fn chunk_without_content_yields_none() {
        for raw in [
            r#"{"choices":[{"delta":{}}]}"#,
            r#"{"choices":[{"delta":{"content":""}}]}"#,
            r#"{"choices":[{"delta":{"role":"assistant","content":null}}]}"#,
            r#"{"choices":[]}"#,
            r#"{"choices":[{"finish_reason":"stop"}]}"#,
        ] {
            let chunk: ChatCompletionChunk = serde_json::from_str(raw).unwrap();
            assert_eq!(chunk.into_content(), None, "{raw}");
        }
    }

    #[test]
    fn chunk_without_choices_is_rejected() {
        assert!(serde_json::from_str::<ChatCompletionChunk>(r#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn response_content_defaults_to_empty() {
        let full: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#)
                .unwrap();
        assert_eq!(full.into_content(), "ok");

        let empty: ChatCompletionResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(empty.into_content(), "");
    }
}
