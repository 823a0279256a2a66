use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::{now_millis, JsonStore, CATEGORIES_KEY, ROLES_KEY};
use crate::api::types::RoleDraft;
use crate::error::Result;

const DEFAULT_CATEGORY: &str = "custom";
const DEFAULT_AUTHOR: &str = "user";
const DEFAULT_VERSION: &str = "1.0";
const MAX_RATING: u8 = 5;

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_author() -> String {
    DEFAULT_AUTHOR.to_string()
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// 角色人设
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RoleProfile {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    pub prompt: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub rating: u8,
    #[serde(default)]
    pub usage: u32,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    #[serde(default = "default_author")]
    pub author: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub imported: bool,
}

impl RoleProfile {
    pub fn new(name: &str, prompt: &str) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            description: String::new(),
            personality: String::new(),
            prompt: prompt.to_string(),
            category: default_category(),
            tags: Vec::new(),
            rating: 0,
            usage: 0,
            favorite: false,
            created: 0,
            updated: 0,
            author: default_author(),
            version: default_version(),
            imported: false,
        }
    }

    fn matches(&self, query: &str) -> bool {
        self.name.to_lowercase().contains(query)
            || self.description.to_lowercase().contains(query)
            || self.tags.iter().any(|t| t.to_lowercase().contains(query))
    }
}

impl From<RoleDraft> for RoleProfile {
    fn from(draft: RoleDraft) -> Self {
        Self {
            description: draft.description,
            personality: draft.personality,
            ..Self::new(&draft.name, &draft.prompt)
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RoleCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: String,
}

impl RoleCategory {
    fn new(id: &str, name: &str, icon: &str, color: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            icon: icon.to_string(),
            color: color.to_string(),
        }
    }
}

fn default_categories() -> Vec<RoleCategory> {
    vec![
        RoleCategory::new("work", "工作助手", "💼", "#3b82f6"),
        RoleCategory::new("study", "学习教育", "📚", "#10b981"),
        RoleCategory::new("creative", "创意写作", "✍️", "#8b5cf6"),
        RoleCategory::new("entertainment", "娱乐休闲", "🎮", "#f59e0b"),
        RoleCategory::new("life", "生活服务", "🏠", "#ef4444"),
        RoleCategory::new("tech", "技术开发", "💻", "#06b6d4"),
        RoleCategory::new("health", "健康医疗", "🏥", "#84cc16"),
        RoleCategory::new("custom", "自定义", "⭐", "#6b7280"),
    ]
}

fn preset_roles() -> Vec<RoleProfile> {
    let mut advisor = RoleProfile::new(
        "生活顾问",
        "你是一个贴心的生活顾问，擅长提供实用的生活建议和问题解决方案。请从实际角度出发，给出具体可行的建议。",
    );
    advisor.description = "贴心的生活建议和问题解决助手".to_string();
    advisor.personality = "贴心、实用、细致入微".to_string();
    advisor.category = "life".to_string();
    advisor.tags = ["生活", "建议", "实用", "解决方案"]
        .iter()
        .map(|t| t.to_string())
        .collect();
    advisor.author = "system".to_string();
    advisor.rating = MAX_RATING;
    vec![advisor]
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum CategoryFilter {
    #[default]
    All,
    Favorites,
    Category(String),
}

impl From<&str> for CategoryFilter {
    fn from(value: &str) -> Self {
        match value {
            "all" | "" => CategoryFilter::All,
            "favorites" => CategoryFilter::Favorites,
            other => CategoryFilter::Category(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Name,
    Created,
    Rating,
    Usage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// 角色列表的过滤与排序条件
#[derive(Clone, Debug, Default)]
pub struct RoleQuery {
    pub category: CategoryFilter,
    pub search: String,
    pub sort_by: SortKey,
    pub order: SortOrder,
}

/// 导出文件格式
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RoleExport {
    pub roles: Vec<RoleProfile>,
    #[serde(default)]
    pub categories: Vec<RoleCategory>,
    #[serde(default)]
    pub export_date: String,
    #[serde(default = "default_version")]
    pub version: String,
}

/// 角色库，所有修改立即写回存储
#[derive(Debug)]
pub struct RoleLibrary {
    store: JsonStore,
    roles: Vec<RoleProfile>,
    categories: Vec<RoleCategory>,
}

impl RoleLibrary {
    pub fn open(store: JsonStore) -> Result<Self> {
        let roles = store.get(ROLES_KEY)?.unwrap_or_default();
        let categories: Vec<RoleCategory> = store.get(CATEGORIES_KEY)?.unwrap_or_default();

        let mut library = Self {
            store,
            roles,
            categories,
        };
        if library.categories.is_empty() {
            library.categories = default_categories();
            library.save_categories()?;
        }
        Ok(library)
    }

    pub fn roles(&self) -> &[RoleProfile] {
        &self.roles
    }

    pub fn categories(&self) -> &[RoleCategory] {
        &self.categories
    }

    pub fn get(&self, id: &str) -> Option<&RoleProfile> {
        self.roles.iter().find(|r| r.id == id)
    }

    /// 按 id 或名称（不区分大小写）查找
    pub fn find(&self, key: &str) -> Option<&RoleProfile> {
        let key = key.trim();
        self.get(key).or_else(|| {
            let lower = key.to_lowercase();
            self.roles.iter().find(|r| r.name.to_lowercase() == lower)
        })
    }

    /// 新增或按 id 替换角色
    pub fn save_role(&mut self, mut role: RoleProfile) -> Result<RoleProfile> {
        let now = now_millis();
        if role.id.is_empty() {
            role.id = generate_id();
        }
        if role.created == 0 {
            role.created = now;
        }
        role.updated = now;
        if role.category.trim().is_empty() {
            role.category = default_category();
        }
        if role.author.trim().is_empty() {
            role.author = default_author();
        }
        if role.version.trim().is_empty() {
            role.version = default_version();
        }
        role.rating = role.rating.min(MAX_RATING);

        match self.roles.iter_mut().find(|r| r.id == role.id) {
            Some(existing) => *existing = role.clone(),
            None => self.roles.push(role.clone()),
        }
        self.save_roles()?;
        Ok(role)
    }

    pub fn save_draft(&mut self, draft: RoleDraft) -> Result<RoleProfile> {
        self.save_role(RoleProfile::from(draft))
    }

    pub fn delete_role(&mut self, id: &str) -> Result<bool> {
        let before = self.roles.len();
        self.roles.retain(|r| r.id != id);
        if self.roles.len() == before {
            return Ok(false);
        }
        self.save_roles()?;
        Ok(true)
    }

    pub fn duplicate_role(&mut self, id: &str) -> Result<Option<RoleProfile>> {
        let Some(original) = self.get(id) else {
            return Ok(None);
        };

        let now = now_millis();
        let duplicate = RoleProfile {
            id: generate_id(),
            name: format!("{} (副本)", original.name),
            created: now,
            updated: now,
            usage: 0,
            rating: 0,
            ..original.clone()
        };
        self.roles.push(duplicate.clone());
        self.save_roles()?;
        Ok(Some(duplicate))
    }

    pub fn increment_usage(&mut self, id: &str) -> Result<bool> {
        self.update(id, |role| role.usage += 1)
    }

    pub fn set_rating(&mut self, id: &str, rating: i32) -> Result<bool> {
        let rating = rating.clamp(0, MAX_RATING as i32) as u8;
        self.update(id, |role| role.rating = rating)
    }

    /// 切换收藏状态，返回新的状态；角色不存在时返回 `false`
    pub fn toggle_favorite(&mut self, id: &str) -> Result<bool> {
        let mut favorite = false;
        self.update(id, |role| {
            role.favorite = !role.favorite;
            favorite = role.favorite;
        })?;
        Ok(favorite)
    }

    fn update<F>(&mut self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut RoleProfile),
    {
        let Some(role) = self.roles.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        f(role);
        role.updated = now_millis();
        self.save_roles()?;
        Ok(true)
    }

    pub fn filter(&self, query: &RoleQuery) -> Vec<&RoleProfile> {
        let search = query.search.trim().to_lowercase();
        let mut roles: Vec<&RoleProfile> = self
            .roles
            .iter()
            .filter(|role| match &query.category {
                CategoryFilter::All => true,
                CategoryFilter::Favorites => role.favorite,
                CategoryFilter::Category(id) => &role.category == id,
            })
            .filter(|role| search.is_empty() || role.matches(&search))
            .collect();

        roles.sort_by(|a, b| {
            let ordering = compare_by(a, b, query.sort_by);
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        roles
    }

    pub fn export(&self) -> RoleExport {
        RoleExport {
            roles: self.roles.clone(),
            categories: self.categories.clone(),
            export_date: chrono::Utc::now().to_rfc3339(),
            version: default_version(),
        }
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    /// 导入角色：重新分配 id 避免冲突，并合并未知分类；返回导入数量
    pub fn import_json(&mut self, content: &str) -> Result<usize> {
        let data: RoleExport = serde_json::from_str(content)?;
        let now = now_millis();
        let count = data.roles.len();

        for mut role in data.roles {
            role.id = generate_id();
            role.imported = true;
            role.created = now;
            role.rating = role.rating.min(MAX_RATING);
            self.roles.push(role);
        }
        self.save_roles()?;

        let mut categories_changed = false;
        for category in data.categories {
            if !self.categories.iter().any(|c| c.id == category.id) {
                self.categories.push(category);
                categories_changed = true;
            }
        }
        if categories_changed {
            self.save_categories()?;
        }

        Ok(count)
    }

    pub fn add_preset_roles(&mut self) -> Result<usize> {
        let now = now_millis();
        let presets = preset_roles();
        let count = presets.len();
        for mut role in presets {
            role.id = generate_id();
            role.created = now;
            role.updated = now;
            self.roles.push(role);
        }
        self.save_roles()?;
        Ok(count)
    }

    fn save_roles(&self) -> Result<()> {
        self.store.set(ROLES_KEY, &self.roles)
    }

    fn save_categories(&self) -> Result<()> {
        self.store.set(CATEGORIES_KEY, &self.categories)
    }
}

fn compare_by(a: &RoleProfile, b: &RoleProfile, key: SortKey) -> Ordering {
    match key {
        SortKey::Name => a.name.cmp(&b.name),
        SortKey::Created => a.created.cmp(&b.created),
        SortKey::Rating => a.rating.cmp(&b.rating),
        SortKey::Usage => a.usage.cmp(&b.usage),
    }
}

fn generate_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("role_{}_{}", now_millis(), &suffix[..9])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, RoleLibrary) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let library = RoleLibrary::open(store).unwrap();
        (dir, library)
    }

    fn role(name: &str, category: &str) -> RoleProfile {
        RoleProfile {
            category: category.to_string(),
            ..RoleProfile::new(name, &format!("你是{name}"))
        }
    }

    #[test]
    fn default_categories_are_seeded_once() {
        let (dir, library) = open();
        assert_eq!(library.categories().len(), 8);

        let reopened = RoleLibrary::open(JsonStore::open(dir.path()).unwrap()).unwrap();
        assert_eq!(reopened.categories(), library.categories());
    }

    #[test]
    fn save_assigns_id_and_replaces_by_id() {
        let (dir, mut library) = open();
        let saved = library.save_role(role("猫咪", "")).unwrap();
        assert!(saved.id.starts_with("role_"));
        assert_eq!(saved.category, "custom");
        assert!(saved.created > 0);

        let mut edited = saved.clone();
        edited.prompt = "喵".to_string();
        library.save_role(edited).unwrap();
        assert_eq!(library.roles().len(), 1);

        let reopened = RoleLibrary::open(JsonStore::open(dir.path()).unwrap()).unwrap();
        assert_eq!(reopened.get(&saved.id).unwrap().prompt, "喵");
    }

    #[test]
    fn duplicate_resets_usage_and_rating() {
        let (_dir, mut library) = open();
        let saved = library.save_role(role("码农", "tech")).unwrap();
        library.increment_usage(&saved.id).unwrap();
        library.set_rating(&saved.id, 9).unwrap();
        assert_eq!(library.get(&saved.id).unwrap().rating, 5);
        assert_eq!(library.get(&saved.id).unwrap().usage, 1);

        let copy = library.duplicate_role(&saved.id).unwrap().unwrap();
        assert_eq!(copy.name, "码农 (副本)");
        assert_ne!(copy.id, saved.id);
        assert_eq!(copy.usage, 0);
        assert_eq!(copy.rating, 0);
        assert_eq!(copy.category, "tech");

        assert!(library.duplicate_role("missing").unwrap().is_none());
    }

    #[test]
    fn favorite_toggles_and_delete_removes() {
        let (_dir, mut library) = open();
        let saved = library.save_role(role("诗人", "creative")).unwrap();

        assert!(library.toggle_favorite(&saved.id).unwrap());
        assert!(!library.toggle_favorite(&saved.id).unwrap());
        assert!(!library.toggle_favorite("missing").unwrap());

        assert!(library.delete_role(&saved.id).unwrap());
        assert!(!library.delete_role(&saved.id).unwrap());
        assert!(library.roles().is_empty());
    }

    #[test]
    fn filter_by_category_search_and_sort() {
        let (_dir, mut library) = open();
        let mut b = role("Beta Coder", "tech");
        b.tags = vec!["Rust".to_string()];
        b.usage = 7;
        library.save_role(b).unwrap();
        let mut a = role("Alpha Writer", "creative");
        a.usage = 3;
        let a = library.save_role(a).unwrap();
        library.save_role(role("Gamma Coder", "tech")).unwrap();
        library.toggle_favorite(&a.id).unwrap();

        let all = library.filter(&RoleQuery::default());
        let names: Vec<&str> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha Writer", "Beta Coder", "Gamma Coder"]);

        let tech = library.filter(&RoleQuery {
            category: CategoryFilter::from("tech"),
            sort_by: SortKey::Usage,
            order: SortOrder::Desc,
            ..RoleQuery::default()
        });
        let names: Vec<&str> = tech.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Beta Coder", "Gamma Coder"]);

        let by_tag = library.filter(&RoleQuery {
            search: "rust".to_string(),
            ..RoleQuery::default()
        });
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].name, "Beta Coder");

        let favorites = library.filter(&RoleQuery {
            category: CategoryFilter::from("favorites"),
            ..RoleQuery::default()
        });
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].id, a.id);
    }

    #[test]
    fn import_assigns_new_ids_and_merges_categories() {
        let (_dir, mut library) = open();
        let existing = library.save_role(role("原有", "life")).unwrap();

        let mut exported = library.export();
        exported.categories.push(RoleCategory::new("games", "游戏", "🎲", "#000000"));
        let json = serde_json::to_string(&exported).unwrap();

        let imported = library.import_json(&json).unwrap();
        assert_eq!(imported, 1);
        assert_eq!(library.roles().len(), 2);

        let copy = &library.roles()[1];
        assert_ne!(copy.id, existing.id);
        assert!(copy.imported);
        assert_eq!(library.categories().len(), 9);
    }

    #[test]
    fn import_rejects_invalid_json() {
        let (_dir, mut library) = open();
        assert!(library.import_json("{\"categories\": []}").is_err());
        assert!(library.import_json("not json").is_err());
    }

    #[test]
    fn find_by_name_and_presets() {
        let (_dir, mut library) = open();
        assert_eq!(library.add_preset_roles().unwrap(), 1);

        let advisor = library.find("生活顾问").unwrap();
        assert_eq!(advisor.rating, 5);
        assert_eq!(advisor.author, "system");
        assert_eq!(library.find(&advisor.id.clone()).unwrap().name, "生活顾问");
    }

    #[test]
    fn drafts_become_custom_roles() {
        let (_dir, mut library) = open();
        let draft = RoleDraft {
            name: "程序猫小码".to_string(),
            description: "一只热爱编程的橘色小猫咪".to_string(),
            personality: "聪明、幽默".to_string(),
            prompt: "你是程序猫小码".to_string(),
        };
        let saved = library.save_draft(draft).unwrap();
        assert_eq!(saved.category, "custom");
        assert_eq!(saved.personality, "聪明、幽默");
        assert_eq!(library.find("程序猫小码").unwrap().id, saved.id);
    }
}
