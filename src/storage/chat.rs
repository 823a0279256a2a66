use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{now_millis, JsonStore, RoleProfile, CHAT_HISTORY_KEY, CURRENT_ROLE_KEY};
use crate::error::Result;

/// 本地保存的聊天记录上限
pub const MAX_HISTORY: usize = 1000;

const TITLE_MAX_CHARS: usize = 30;
const DEFAULT_TITLE: &str = "新对话";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    User,
    Assistant,
    System,
    Error,
}

/// 一条本地聊天记录
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub content: String,
    pub timestamp: i64,
}

impl ChatRecord {
    pub fn new(kind: RecordKind, content: &str) -> Self {
        Self {
            kind,
            content: content.to_string(),
            timestamp: now_millis(),
        }
    }
}

/// 按系统消息切分出的一段对话
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSession {
    pub id: String,
    pub title: String,
    pub timestamp: i64,
    pub messages: Vec<ChatRecord>,
}

/// 聊天记录存储；克隆出的实例共享同一把写锁
#[derive(Clone, Debug)]
pub struct ChatStore {
    store: JsonStore,
    write_lock: Arc<Mutex<()>>,
}

impl ChatStore {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // 锁内没有需要恢复的数据，中毒后继续使用
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 在写锁内读取、修改并写回整个历史
    fn modify_history<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<ChatRecord>),
    {
        let _guard = self.lock();
        self.modify_history_locked(f)
    }

    fn modify_history_locked<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<ChatRecord>),
    {
        let mut history = self.chat_history()?;
        f(&mut history);

        if history.len() > MAX_HISTORY {
            let overflow = history.len() - MAX_HISTORY;
            history.drain(..overflow);
        }

        self.store.set(CHAT_HISTORY_KEY, &history)
    }

    /// 追加一条记录并返回带时间戳的副本
    pub fn save_message(&self, kind: RecordKind, content: &str) -> Result<ChatRecord> {
        let record = ChatRecord::new(kind, content);
        self.append(record.clone())?;
        Ok(record)
    }

    pub fn append(&self, record: ChatRecord) -> Result<()> {
        self.modify_history(|history| history.push(record))
    }

    pub fn chat_history(&self) -> Result<Vec<ChatRecord>> {
        Ok(self.store.get(CHAT_HISTORY_KEY)?.unwrap_or_default())
    }

    pub fn clear_chat_history(&self) -> Result<()> {
        let _guard = self.lock();
        self.store.remove(CHAT_HISTORY_KEY)?;
        Ok(())
    }

    pub fn save_current_role(&self, role: &RoleProfile) -> Result<()> {
        let _guard = self.lock();
        self.store.set(CURRENT_ROLE_KEY, role)
    }

    pub fn current_role(&self) -> Result<Option<RoleProfile>> {
        self.store.get(CURRENT_ROLE_KEY)
    }

    /// 切换角色且不保留上下文时调用，只留下系统消息
    pub fn retain_system_records(&self) -> Result<()> {
        self.modify_history(|history| history.retain(|r| r.kind == RecordKind::System))
    }

    /// 切换当前角色并记录系统消息；不保留上下文时清掉之前的对话
    pub fn switch_role(&self, role: &RoleProfile, preserve_context: bool) -> Result<()> {
        let _guard = self.lock();
        self.store.set(CURRENT_ROLE_KEY, role)?;

        let switched = ChatRecord::new(
            RecordKind::System,
            &format!("已切换到角色: {} - {}", role.name, role.description),
        );
        self.modify_history_locked(|history| {
            history.push(switched);
            if !preserve_context {
                history.push(ChatRecord::new(
                    RecordKind::System,
                    "已清空之前的对话上下文，开始新的对话",
                ));
                history.retain(|r| r.kind == RecordKind::System);
            }
        })
    }

    /// 最后一条用户消息及其之前的记录，用于重试
    pub fn last_user_turn(&self) -> Result<Option<(Vec<ChatRecord>, ChatRecord)>> {
        let mut history = self.chat_history()?;
        let Some(pos) = history.iter().rposition(|r| r.kind == RecordKind::User) else {
            return Ok(None);
        };
        history.truncate(pos + 1);
        let last = history.pop();
        Ok(last.map(|record| (history, record)))
    }

    /// 会话列表，最新的在前
    pub fn conversation_sessions(&self) -> Result<Vec<ConversationSession>> {
        let mut sessions: Vec<ConversationSession> = Vec::new();

        for record in self.chat_history()? {
            let starts_session = record.kind == RecordKind::System || sessions.is_empty();
            if starts_session {
                sessions.push(ConversationSession {
                    id: uuid::Uuid::new_v4().to_string(),
                    title: session_title(&record),
                    timestamp: record.timestamp,
                    messages: Vec::new(),
                });
            }
            if let Some(current) = sessions.last_mut() {
                current.messages.push(record);
            }
        }

        sessions.reverse();
        Ok(sessions)
    }
}

pub(crate) fn session_title(first: &ChatRecord) -> String {
    if first.content.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if first.content.chars().count() > TITLE_MAX_CHARS {
        let head: String = first.content.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        first.content.clone()
    }
}
