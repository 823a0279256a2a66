use plugin_interfaces::{log_error, log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{ChatError, Result};

pub const DEFAULT_API_URL: &str = "https://api.deepseek.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// 用户配置结构
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserConfig {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub preserve_context: Option<bool>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: Some(DEFAULT_API_URL.to_string()),
            model: Some(DEFAULT_MODEL.to_string()),
            max_tokens: None,
            temperature: None,
            preserve_context: None,
        }
    }
}

impl UserConfig {
    /// 空白字符串按未设置处理
    fn normalized(&self) -> Self {
        fn non_blank(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        Self {
            api_key: non_blank(&self.api_key),
            api_url: non_blank(&self.api_url),
            model: non_blank(&self.model),
            ..self.clone()
        }
    }
}

/// 完整配置结构
#[derive(Serialize, Deserialize, Debug)]
pub struct Config {
    #[serde(default = "empty_table")]
    pub plugin: toml::Value,
    pub user: Option<UserConfig>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// 合并默认值后的运行时设置
#[derive(Clone, Debug, PartialEq)]
pub struct ChatSettings {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub preserve_context: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from(UserConfig::default())
    }
}

impl From<UserConfig> for ChatSettings {
    fn from(config: UserConfig) -> Self {
        let config = config.normalized();
        Self {
            api_key: config.api_key.unwrap_or_default(),
            api_url: config
                .api_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            model: config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            preserve_context: config.preserve_context.unwrap_or(false),
        }
    }
}

impl ChatSettings {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn to_user_config(&self) -> UserConfig {
        UserConfig {
            api_key: Some(self.api_key.clone()),
            api_url: Some(self.api_url.clone()),
            model: Some(self.model.clone()),
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            preserve_context: Some(self.preserve_context),
        }
        .normalized()
    }
}

#[derive(Clone, Debug)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// 从config.toml文件加载配置
    pub fn load_config(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Err(ChatError::NotFound(format!(
                "config file {}",
                self.config_path.display()
            )));
        }

        let config_content = fs::read_to_string(&self.config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        Ok(config)
    }

    /// 加载用户配置
    pub fn load_user_config(&self) -> UserConfig {
        match self.load_config() {
            Ok(config) => {
                if let Some(user_config) = config.user {
                    log_info!("Loaded user configuration from {}", self.config_path.display());
                    user_config
                } else {
                    log_info!("No user configuration found, using defaults");
                    UserConfig::default()
                }
            }
            Err(e) => {
                log_warn!("Failed to load user config: {}", e);
                UserConfig::default()
            }
        }
    }

    pub fn load_settings(&self) -> ChatSettings {
        ChatSettings::from(self.load_user_config())
    }

    /// 写入用户配置，保留文件中其余部分
    pub fn write_user_config(&self, user_config: &UserConfig) -> Result<()> {
        // 读取失败时从空配置开始
        let mut config = self.load_config().unwrap_or_else(|_| Config {
            plugin: empty_table(),
            user: None,
        });

        config.user = Some(user_config.normalized());

        let toml_string = toml::to_string_pretty(&config)?;
        fs::write(&self.config_path, toml_string)?;
        Ok(())
    }

    /// 保存用户配置到config.toml文件
    pub fn save_user_config(&self, user_config: &UserConfig) {
        match self.write_user_config(user_config) {
            Ok(()) => {
                log_info!(
                    "User configuration saved successfully to {}",
                    self.config_path.display()
                );
            }
            Err(e) => {
                log_error!(
                    "Failed to save config to {}: {}",
                    self.config_path.display(),
                    e
                );
            }
        }
    }
}
