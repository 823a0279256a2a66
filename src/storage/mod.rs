use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::error::Result;

mod chat;
mod roles;

pub use chat::{ChatRecord, ChatStore, ConversationSession, RecordKind, MAX_HISTORY};
pub use roles::{
    CategoryFilter, RoleCategory, RoleExport, RoleLibrary, RoleProfile, RoleQuery, SortKey,
    SortOrder,
};

pub const CHAT_HISTORY_KEY: &str = "chat_history";
pub const CURRENT_ROLE_KEY: &str = "current_role";
pub const ROLES_KEY: &str = "ai_roles";
pub const CATEGORIES_KEY: &str = "role_categories";

/// 基于目录的键值存储，每个键对应一个 JSON 文件
#[derive(Clone, Debug)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// 读取键值，不存在时返回 `None`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match fs::read_to_string(self.path(key)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 读取失败或不存在时返回默认值
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).ok().flatten().unwrap_or(default)
    }

    /// 先写临时文件再重命名，读取方不会看到写了一半的文件
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let tmp = self
            .dir
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, content)?;
        if let Err(e) = fs::rename(&tmp, self.path(key)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// 删除键，返回之前是否存在
    pub fn remove(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
