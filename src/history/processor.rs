use crate::api::types::{Message, Role};
use crate::storage::{ChatRecord, RecordKind};
use plugin_interfaces::{log_info, log_warn, HistoryMessage};

/// 发送给模型的最近对话条数
pub const RECENT_HISTORY_LIMIT: usize = 10;

pub struct HistoryProcessor;

impl HistoryProcessor {
    /// 宿主历史记录中的角色映射为模型角色，未知角色返回 `None`
    pub fn map_host_role(role: &str) -> Option<Role> {
        match role {
            "user" => Some(Role::User),
            "plugin" => Some(Role::Assistant), // 插件回复作为助手回复
            "system" => Some(Role::System),
            _ => None,
        }
    }

    fn to_message(history_msg: &HistoryMessage) -> Option<Message> {
        if history_msg.content.trim().is_empty() {
            return None;
        }

        let role = Self::map_host_role(&history_msg.role).unwrap_or_else(|| {
            log_warn!(
                "Unknown role '{}' in history message, treating as user",
                history_msg.role
            );
            Role::User
        });

        Some(Message::new(role, &history_msg.content))
    }

    /// 从历史记录中提取已完成的消息
    pub fn extract_completed_messages(history: Vec<HistoryMessage>) -> Vec<Message> {
        let completed_messages: Vec<&HistoryMessage> = history
            .iter()
            .filter(|msg| msg.status == "completed")
            .collect();

        log_info!(
            "Found {} completed messages out of {} total history messages",
            completed_messages.len(),
            history.len()
        );

        completed_messages
            .into_iter()
            .filter_map(Self::to_message)
            .collect()
    }

    /// 从历史记录中提取最近的N条已完成消息
    pub fn extract_recent_completed_messages(
        history: Vec<HistoryMessage>,
        limit: usize,
    ) -> Vec<Message> {
        let mut completed_messages: Vec<&HistoryMessage> = history
            .iter()
            .filter(|msg| msg.status == "completed")
            .collect();

        // 最新的在前，截取后再恢复时间顺序
        completed_messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut recent_messages: Vec<&HistoryMessage> =
            completed_messages.into_iter().take(limit).collect();
        recent_messages.reverse();

        log_info!(
            "Extracted {} recent completed messages from {} total history messages",
            recent_messages.len(),
            history.len()
        );

        recent_messages
            .into_iter()
            .filter_map(Self::to_message)
            .collect()
    }

    /// 构建本次请求的消息列表：角色提示词、最近的对话、当前用户消息
    pub fn build_message_history(
        role_prompt: Option<&str>,
        history: &[ChatRecord],
        user_message: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        if let Some(prompt) = role_prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(Message::system(prompt));
        }

        let start = history.len().saturating_sub(RECENT_HISTORY_LIMIT);
        for record in &history[start..] {
            match record.kind {
                RecordKind::User => messages.push(Message::user(&record.content)),
                RecordKind::Assistant => messages.push(Message::assistant(&record.content)),
                RecordKind::System | RecordKind::Error => {}
            }
        }

        messages.push(Message::user(user_message));
        messages
    }
}
