use plugin_interfaces::{
    log_error, log_info, log_warn,
    pluginui::{Context, Ui},
    PluginHandler, PluginInstanceContext,
};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;

use crate::api::{ApiClient, Message, StreamPhase};
use crate::config::{ChatSettings, ConfigManager};
use crate::history::{HistoryProcessor, RECENT_HISTORY_LIMIT};
use crate::storage::{ChatRecord, ChatStore, JsonStore, RecordKind, RoleLibrary, RoleQuery};

const CONFIG_PATH: &str = "user.toml";
const DATA_DIR: &str = "deepseek_data";

type PluginResult<T> = Result<T, Box<dyn std::error::Error>>;

/// 聊天指令
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Stop,
    Clear,
    Retry,
    Test,
    Roles,
    Role(&'a str),
    Generate(&'a str),
    Favorite(&'a str),
    Rate(&'a str, &'a str),
    CopyRole(&'a str),
    DeleteRole(&'a str),
    Export(&'a str),
    Import(&'a str),
    Chat(&'a str),
}

impl<'a> Command<'a> {
    fn parse(input: &'a str) -> Self {
        let input = input.trim();
        let (head, rest) = match input.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (input, ""),
        };
        match head {
            "/stop" => Command::Stop,
            "/clear" => Command::Clear,
            "/retry" => Command::Retry,
            "/test" => Command::Test,
            "/roles" => Command::Roles,
            "/role" if !rest.is_empty() => Command::Role(rest),
            "/gen" if !rest.is_empty() => Command::Generate(rest),
            "/fav" if !rest.is_empty() => Command::Favorite(rest),
            "/rate" => match rest.rsplit_once(char::is_whitespace) {
                Some((key, rating)) => Command::Rate(key.trim(), rating),
                None => Command::Chat(input),
            },
            "/copyrole" if !rest.is_empty() => Command::CopyRole(rest),
            "/delrole" if !rest.is_empty() => Command::DeleteRole(rest),
            "/export" if !rest.is_empty() => Command::Export(rest),
            "/import" if !rest.is_empty() => Command::Import(rest),
            _ => Command::Chat(input),
        }
    }
}

/// DeepSeek 对话插件
#[derive(Clone)]
pub struct ChatPlugin {
    runtime: Option<Arc<Runtime>>,

    // 配置
    settings: ChatSettings,

    // 组件
    api_client: Option<ApiClient>,
    config_manager: ConfigManager,
    chat_store: Option<ChatStore>,
    roles: Option<Arc<Mutex<RoleLibrary>>>,

    // 界面显示用的状态
    live_reply: Arc<Mutex<String>>,
    role_name: Arc<Mutex<Option<String>>>,
}

impl Default for ChatPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatPlugin {
    pub fn new() -> Self {
        Self {
            runtime: None,
            settings: ChatSettings::default(),
            api_client: None,
            config_manager: ConfigManager::new(CONFIG_PATH),
            chat_store: None,
            roles: None,
            live_reply: Arc::new(Mutex::new(String::new())),
            role_name: Arc::new(Mutex::new(None)),
        }
    }

    /// 保存配置；已有客户端时原地更新设置，进行中的请求仍可停止
    fn update_config(&mut self) {
        self.config_manager
            .save_user_config(&self.settings.to_user_config());

        if let Some(client) = self.api_client.as_mut() {
            client.update_settings(self.settings.clone());
            return;
        }

        match ApiClient::new(self.settings.clone()) {
            Ok(client) => {
                self.api_client = Some(client);
                log_info!("HTTP client initialized");
            }
            Err(e) => {
                log_error!("Failed to initialize HTTP client: {}", e);
            }
        }
    }

    /// 打开本地存储
    fn open_storage(&mut self) {
        let store = match JsonStore::open(DATA_DIR) {
            Ok(store) => store,
            Err(e) => {
                log_error!("Failed to open local storage {}: {}", DATA_DIR, e);
                return;
            }
        };

        match RoleLibrary::open(store.clone()) {
            Ok(mut library) => {
                if library.roles().is_empty() {
                    if let Err(e) = library.add_preset_roles() {
                        log_warn!("Failed to add preset roles: {}", e);
                    }
                }
                log_info!("Loaded {} roles", library.roles().len());
                self.roles = Some(Arc::new(Mutex::new(library)));
            }
            Err(e) => {
                log_warn!("Failed to load role library: {}", e);
            }
        }
        let chat_store = ChatStore::new(store);
        if let Ok(Some(role)) = chat_store.current_role() {
            set_role_name(&self.role_name, &role.name);
        }
        self.chat_store = Some(chat_store);
    }

    fn chat_store(&self) -> PluginResult<&ChatStore> {
        Ok(self.chat_store.as_ref().ok_or("本地存储未初始化")?)
    }

    fn api_client(&self) -> PluginResult<&ApiClient> {
        Ok(self.api_client.as_ref().ok_or("API 客户端未初始化")?)
    }

    fn runtime(&self) -> PluginResult<&Arc<Runtime>> {
        Ok(self.runtime.as_ref().ok_or("运行时未初始化")?)
    }

    fn role_prompt(&self) -> Option<String> {
        let store = self.chat_store.as_ref()?;
        match store.current_role() {
            Ok(role) => role.map(|r| r.prompt),
            Err(e) => {
                log_warn!("Failed to read current role: {}", e);
                None
            }
        }
    }

    /// 构建消息列表，宿主有历史记录时优先使用
    fn build_messages(
        &self,
        message: &str,
        local_history: &[ChatRecord],
        plugin_ctx: &PluginInstanceContext,
    ) -> Vec<Message> {
        let role_prompt = self.role_prompt();

        if let Some(history_vec) = plugin_ctx.get_history() {
            let mut messages = Vec::new();
            if let Some(prompt) = role_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
                messages.push(Message::system(prompt));
            }
            messages.extend(HistoryProcessor::extract_recent_completed_messages(
                history_vec.clone(),
                RECENT_HISTORY_LIMIT,
            ));
            messages.push(Message::user(message));
            return messages;
        }

        log_info!("No host history available, using local history");
        HistoryProcessor::build_message_history(role_prompt.as_deref(), local_history, message)
    }

    /// 在后台发送流式请求，结束后写入本地记录
    fn spawn_reply(&self, messages: Vec<Message>) -> PluginResult<()> {
        let runtime = self.runtime()?;
        let client = self.api_client()?.clone();
        let store = self.chat_store()?.clone();
        let error_store = store.clone();
        let live_reply = self.live_reply.clone();

        log_info!(
            "Sending {} total messages to AI (including current message)",
            messages.len()
        );

        if let Ok(mut live) = live_reply.lock() {
            live.clear();
        }

        runtime.spawn(async move {
            let outcome = client
                .stream_chat(
                    &messages,
                    |_delta, full| {
                        if let Ok(mut live) = live_reply.lock() {
                            live.clear();
                            live.push_str(full);
                        }
                    },
                    |full| {
                        if let Err(e) = store.save_message(RecordKind::Assistant, full) {
                            log_warn!("Failed to save assistant reply: {}", e);
                        }
                    },
                    |e| {
                        log_error!("Streaming request failed: {}", e);
                        let content = format!("错误: {}", e);
                        if let Err(e) = error_store.save_message(RecordKind::Error, &content) {
                            log_warn!("Failed to save error record: {}", e);
                        }
                    },
                )
                .await;

            for line in &outcome.malformed {
                log_warn!("Failed to parse stream line: {}", line);
            }
            match outcome.phase {
                StreamPhase::Completed => {
                    log_info!("Stream completed with {} chars", outcome.text.chars().count());
                }
                StreamPhase::Cancelled => {
                    log_info!(
                        "Request was cancelled by user after {} chars",
                        outcome.text.chars().count()
                    );
                }
                _ => {}
            }
        });
        Ok(())
    }

    fn chat(&self, message: &str, plugin_ctx: &PluginInstanceContext) -> PluginResult<String> {
        if !self.settings.has_api_key() {
            return Err("请先在插件配置中设置 API Key".into());
        }

        let store = self.chat_store()?;
        let local_history = store.chat_history()?;
        let messages = self.build_messages(message, &local_history, plugin_ctx);
        store.save_message(RecordKind::User, message)?;

        self.spawn_reply(messages)?;
        Ok("正在处理您的请求...".to_string())
    }

    fn retry(&self) -> PluginResult<String> {
        let Some((history, last)) = self.chat_store()?.last_user_turn()? else {
            return Ok("没有可以重试的消息".to_string());
        };
        let role_prompt = self.role_prompt();
        let messages =
            HistoryProcessor::build_message_history(role_prompt.as_deref(), &history, &last.content);

        self.spawn_reply(messages)?;
        Ok("正在重试...".to_string())
    }

    fn stop(&self) -> PluginResult<String> {
        let runtime = self.runtime()?;
        let client = self.api_client()?.clone();
        runtime.spawn(async move {
            if client.cancel_request().await {
                log_info!("Cancelling active request");
            } else {
                log_info!("No active request to cancel");
            }
        });
        Ok("已停止生成".to_string())
    }

    fn test_connection(&self) -> PluginResult<String> {
        let runtime = self.runtime()?;
        let client = self.api_client()?.clone();
        runtime.spawn(async move {
            let status = client.test_connection().await;
            if status.success {
                log_info!("Connection test succeeded: {}", status.message);
            } else {
                log_warn!("Connection test failed: {}", status.message);
            }
        });
        Ok("正在测试连接...".to_string())
    }

    fn library(&self) -> PluginResult<std::sync::MutexGuard<'_, RoleLibrary>> {
        let roles = self.roles.as_ref().ok_or("角色库未初始化")?;
        Ok(roles.lock().map_err(|_| "角色库不可用")?)
    }

    fn role_id(library: &RoleLibrary, key: &str) -> PluginResult<String> {
        Ok(library
            .find(key)
            .map(|role| role.id.clone())
            .ok_or_else(|| format!("未找到角色: {}", key))?)
    }

    fn toggle_favorite(&self, key: &str) -> PluginResult<String> {
        let mut library = self.library()?;
        let id = Self::role_id(&library, key)?;
        if library.toggle_favorite(&id)? {
            Ok(format!("已收藏角色：{}", key))
        } else {
            Ok(format!("已取消收藏角色：{}", key))
        }
    }

    fn rate_role(&self, key: &str, rating: &str) -> PluginResult<String> {
        let rating: i32 = rating
            .parse()
            .map_err(|_| format!("无效的评分: {}", rating))?;
        let mut library = self.library()?;
        let id = Self::role_id(&library, key)?;
        library.set_rating(&id, rating)?;
        Ok(format!("已为角色 {} 评分：{}", key, rating.clamp(0, 5)))
    }

    fn duplicate_role(&self, key: &str) -> PluginResult<String> {
        let mut library = self.library()?;
        let id = Self::role_id(&library, key)?;
        let copy = library
            .duplicate_role(&id)?
            .ok_or_else(|| format!("未找到角色: {}", key))?;
        Ok(format!("已复制角色：{}", copy.name))
    }

    fn delete_role(&self, key: &str) -> PluginResult<String> {
        let mut library = self.library()?;
        let id = Self::role_id(&library, key)?;
        library.delete_role(&id)?;
        log_info!("Deleted role {}", key);
        Ok(format!("已删除角色：{}", key))
    }

    fn export_roles(&self, path: &str) -> PluginResult<String> {
        let content = self.library()?.export_json()?;
        std::fs::write(path, content)?;
        log_info!("Exported roles to {}", path);
        Ok(format!("角色已导出到 {}", path))
    }

    fn import_roles(&self, path: &str) -> PluginResult<String> {
        let content = std::fs::read_to_string(path)?;
        let count = self.library()?.import_json(&content)?;
        log_info!("Imported {} roles from {}", count, path);
        Ok(format!("已导入 {} 个角色", count))
    }

    fn list_roles(&self) -> PluginResult<String> {
        let library = self.library()?;

        let lines: Vec<String> = library
            .filter(&RoleQuery::default())
            .into_iter()
            .map(|role| format!("{} - {}", role.name, role.description))
            .collect();

        if lines.is_empty() {
            Ok("角色库为空".to_string())
        } else {
            Ok(lines.join("\n"))
        }
    }

    fn use_role(&self, key: &str) -> PluginResult<String> {
        let mut library = self.library()?;

        let role = library
            .find(key)
            .cloned()
            .ok_or_else(|| format!("未找到角色: {}", key))?;
        library.increment_usage(&role.id)?;
        self.chat_store()?
            .switch_role(&role, self.settings.preserve_context)?;

        set_role_name(&self.role_name, &role.name);
        log_info!("Switched to role {}", role.name);
        Ok(format!("已切换到角色：{}", role.name))
    }

    fn generate_role(&self, keywords: &str) -> PluginResult<String> {
        let runtime = self.runtime()?;
        let client = self.api_client()?.clone();
        let store = self.chat_store()?.clone();
        let roles = self.roles.clone().ok_or("角色库未初始化")?;
        let role_name = self.role_name.clone();
        let preserve_context = self.settings.preserve_context;
        let keywords = keywords.to_string();

        runtime.spawn(async move {
            let draft = match client.generate_role(&keywords).await {
                Ok(draft) => draft,
                Err(e) => {
                    log_error!("{}", e);
                    return;
                }
            };

            let saved = match roles.lock() {
                Ok(mut library) => library.save_draft(draft),
                Err(_) => {
                    log_error!("Role library lock poisoned");
                    return;
                }
            };

            match saved.and_then(|role| {
                store.switch_role(&role, preserve_context)?;
                Ok(role)
            }) {
                Ok(role) => {
                    set_role_name(&role_name, &role.name);
                    log_info!("Generated and applied role {}", role.name);
                }
                Err(e) => {
                    log_error!("Failed to apply generated role: {}", e);
                }
            }
        });
        Ok("正在生成角色...".to_string())
    }

    fn log_metadata(&self, event: &str, plugin_ctx: &PluginInstanceContext) {
        let metadata = plugin_ctx.get_metadata();
        log_info!(
            "{}. Metadata: id={}, name={}, version={}, instance_id={}",
            event,
            metadata.id,
            metadata.name,
            metadata.version,
            metadata.instance_id.clone().unwrap_or("None".to_string())
        );
    }
}

fn set_role_name(slot: &Mutex<Option<String>>, name: &str) {
    if let Ok(mut current) = slot.lock() {
        *current = Some(name.to_string());
    }
}

impl PluginHandler for ChatPlugin {
    fn update_ui(&mut self, _ctx: &Context, ui: &mut Ui, _plugin_ctx: &PluginInstanceContext) {
        ui.label("DeepSeek AI 配置");

        let mut changed = false;

        // API Key 输入
        ui.horizontal(|ui| {
            ui.label("API Key:");
            if ui.text_edit_singleline(&mut self.settings.api_key).changed() {
                log_info!("API Key updated");
                changed = true;
            }
        });

        // API URL 输入
        ui.horizontal(|ui| {
            ui.label("API URL:");
            if ui.text_edit_singleline(&mut self.settings.api_url).changed() {
                log_info!("API URL updated");
                changed = true;
            }
        });

        // 模型输入
        ui.horizontal(|ui| {
            ui.label("Model:");
            if ui.text_edit_singleline(&mut self.settings.model).changed() {
                log_info!("Model updated");
                changed = true;
            }
        });

        if changed {
            self.update_config();
        }

        // 状态显示
        if !self.settings.has_api_key() || self.settings.api_url.trim().is_empty() {
            ui.label("状态: 请设置 API Key 和 URL");
        } else {
            ui.label("状态: 已配置，可以开始对话");
        }

        let role_name = self.role_name.lock().ok().and_then(|name| name.clone());
        if let Some(name) = role_name {
            ui.label(format!("当前角色: {}", name).as_str());
        }

        let live = self
            .live_reply
            .lock()
            .map(|live| live.clone())
            .unwrap_or_default();
        if !live.is_empty() {
            ui.label(live.as_str());
        }
    }

    fn on_mount(&mut self, plugin_ctx: &PluginInstanceContext) -> PluginResult<()> {
        let metadata = plugin_ctx.get_metadata();
        log_info!("[{}] Plugin mount successfully", metadata.name);
        self.log_metadata("Config loaded", plugin_ctx);

        // 加载用户配置
        self.settings = self.config_manager.load_settings();
        self.open_storage();

        // 初始化 tokio 异步运行时
        match Runtime::new() {
            Ok(runtime) => {
                self.runtime = Some(Arc::new(runtime));
                log_info!("Tokio runtime initialized successfully");
                self.update_config();
            }
            Err(e) => {
                log_warn!("Failed to initialize tokio runtime: {}", e);
            }
        }

        Ok(())
    }

    fn on_dispose(&mut self, plugin_ctx: &PluginInstanceContext) -> PluginResult<()> {
        self.log_metadata("Plugin disposed successfully", plugin_ctx);

        // 关闭 tokio 异步运行时
        if let Some(runtime) = self.runtime.take() {
            match Arc::try_unwrap(runtime) {
                Ok(runtime) => {
                    runtime.shutdown_timeout(std::time::Duration::from_millis(10));
                    log_info!("Tokio runtime shutdown successfully");
                }
                Err(_) => {
                    log_warn!("Cannot shutdown runtime: other references still exist");
                }
            }
        } else {
            log_warn!("Tokio runtime not initialized, cannot shutdown");
        }
        Ok(())
    }

    fn on_connect(&mut self, plugin_ctx: &PluginInstanceContext) -> PluginResult<()> {
        self.log_metadata("Plugin connect successfully", plugin_ctx);

        // 校验是否配置了 api 和 key
        if !self.settings.has_api_key() || self.settings.api_url.trim().is_empty() {
            log_warn!("API Key not configured, please set in plugin settings");
            return Err("API Key not configured".into());
        }

        Ok(())
    }

    fn on_disconnect(&mut self, plugin_ctx: &PluginInstanceContext) -> PluginResult<()> {
        self.log_metadata("Plugin disconnect successfully", plugin_ctx);
        Ok(())
    }

    fn handle_message(
        &mut self,
        message: &str,
        plugin_ctx: &PluginInstanceContext,
    ) -> PluginResult<String> {
        self.log_metadata("Plugin Receive Message", plugin_ctx);

        match Command::parse(message) {
            Command::Stop => self.stop(),
            Command::Clear => {
                self.chat_store()?.clear_chat_history()?;
                Ok("已清空聊天记录".to_string())
            }
            Command::Retry => self.retry(),
            Command::Test => self.test_connection(),
            Command::Roles => self.list_roles(),
            Command::Role(key) => self.use_role(key),
            Command::Generate(keywords) => self.generate_role(keywords),
            Command::Favorite(key) => self.toggle_favorite(key),
            Command::Rate(key, rating) => self.rate_role(key, rating),
            Command::CopyRole(key) => self.duplicate_role(key),
            Command::DeleteRole(key) => self.delete_role(key),
            Command::Export(path) => self.export_roles(path),
            Command::Import(path) => self.import_roles(path),
            Command::Chat(text) if text.is_empty() => Err("消息不能为空".into()),
            Command::Chat(text) => self.chat(text, plugin_ctx),
        }
    }
}
