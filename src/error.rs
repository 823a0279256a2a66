use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// 插件内部统一错误类型
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("请先设置DeepSeek API密钥")]
    MissingApiKey,

    #[error("网络请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API 请求失败 ({status}): {message}")]
    Status { status: StatusCode, message: String },

    #[error("无效的请求头: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("无效的响应: {0}")]
    InvalidResponse(String),

    #[error("角色生成失败: {0}")]
    RoleGeneration(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 处理失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("配置解析失败: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("配置序列化失败: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

impl ChatError {
    /// 根据非 2xx 响应构造错误，优先使用响应体中的 `error.message`
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .and_then(|e| e.message)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                )
            });
        ChatError::Status { status, message }
    }
}
