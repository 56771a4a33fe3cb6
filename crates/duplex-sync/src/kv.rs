//! 本地 KV 存储 - 基于 sled
//!
//! 落盘三类小数据：
//! - 鉴权 token（重启后免登录）
//! - 每会话草稿
//! - 搜索历史（最多保留 20 条，去重、新的在前）

use std::path::Path;
use std::sync::Arc;

use sled::{Db, Tree};
use tracing::info;

use crate::error::{DuplexError, Result};

const TREE_AUTH: &str = "auth";
const TREE_DRAFTS: &str = "drafts";
const TREE_SEARCH: &str = "search";

const KEY_TOKEN: &str = "token";
const KEY_SEARCH_HISTORY: &str = "history";

/// 搜索历史上限
const SEARCH_HISTORY_LIMIT: usize = 20;

/// 本地 KV 存储
#[derive(Debug, Clone)]
pub struct KvStore {
    db: Arc<Db>,
    auth: Tree,
    drafts: Tree,
    search: Tree,
}

impl KvStore {
    /// 打开（或创建）KV 存储
    pub fn open(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        std::fs::create_dir_all(&kv_path)
            .map_err(|e| DuplexError::Io(format!("创建 KV 存储目录失败: {}", e)))?;

        let db = sled::open(&kv_path)
            .map_err(|e| DuplexError::KvStore(format!("打开 sled 数据库失败: {}", e)))?;
        let auth = db.open_tree(TREE_AUTH)?;
        let drafts = db.open_tree(TREE_DRAFTS)?;
        let search = db.open_tree(TREE_SEARCH)?;

        info!("KV 存储已就绪: {}", kv_path.display());
        Ok(Self {
            db: Arc::new(db),
            auth,
            drafts,
            search,
        })
    }

    // ---- 鉴权 token ----

    pub fn save_token(&self, token: &str) -> Result<()> {
        self.auth.insert(KEY_TOKEN, token.as_bytes())?;
        self.auth.flush()?;
        Ok(())
    }

    pub fn load_token(&self) -> Result<Option<String>> {
        let value = self.auth.get(KEY_TOKEN)?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn clear_token(&self) -> Result<()> {
        self.auth.remove(KEY_TOKEN)?;
        self.auth.flush()?;
        Ok(())
    }

    // ---- 会话草稿 ----

    pub fn save_draft(&self, conversation_id: &str, draft: &str) -> Result<()> {
        if draft.is_empty() {
            self.drafts.remove(conversation_id)?;
        } else {
            self.drafts.insert(conversation_id, draft.as_bytes())?;
        }
        Ok(())
    }

    pub fn load_draft(&self, conversation_id: &str) -> Result<Option<String>> {
        let value = self.drafts.get(conversation_id)?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn clear_draft(&self, conversation_id: &str) -> Result<()> {
        self.drafts.remove(conversation_id)?;
        Ok(())
    }

    // ---- 搜索历史 ----

    /// 记录一条搜索词：去重后插到最前，超出上限截断
    pub fn push_search_term(&self, term: &str) -> Result<Vec<String>> {
        let term = term.trim();
        let mut history = self.search_history()?;
        history.retain(|t| t != term);
        history.insert(0, term.to_string());
        history.truncate(SEARCH_HISTORY_LIMIT);

        let encoded = serde_json::to_vec(&history)?;
        self.search.insert(KEY_SEARCH_HISTORY, encoded)?;
        Ok(history)
    }

    pub fn search_history(&self) -> Result<Vec<String>> {
        match self.search.get(KEY_SEARCH_HISTORY)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn clear_search_history(&self) -> Result<()> {
        self.search.remove(KEY_SEARCH_HISTORY)?;
        Ok(())
    }

    /// 落盘全部脏页（退出前调用）
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (KvStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_token_roundtrip() {
        let (store, _dir) = open_store();
        assert!(store.load_token().unwrap().is_none());

        store.save_token("t0k3n").unwrap();
        assert_eq!(store.load_token().unwrap().as_deref(), Some("t0k3n"));

        store.clear_token().unwrap();
        assert!(store.load_token().unwrap().is_none());
    }

    #[test]
    fn test_drafts_per_conversation() {
        let (store, _dir) = open_store();
        store.save_draft("c1", "还没发出去的话").unwrap();
        store.save_draft("c2", "另一条").unwrap();

        assert_eq!(
            store.load_draft("c1").unwrap().as_deref(),
            Some("还没发出去的话")
        );

        // 空草稿等价于删除
        store.save_draft("c1", "").unwrap();
        assert!(store.load_draft("c1").unwrap().is_none());
        assert!(store.load_draft("c2").unwrap().is_some());
    }

    #[test]
    fn test_search_history_dedup_and_limit() {
        let (store, _dir) = open_store();
        for i in 0..25 {
            store.push_search_term(&format!("term{}", i)).unwrap();
        }
        let history = store.search_history().unwrap();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0], "term24");

        // 重复搜索提到最前，不产生重复项
        store.push_search_term("term10").unwrap();
        let history = store.search_history().unwrap();
        assert_eq!(history[0], "term10");
        assert_eq!(
            history.iter().filter(|t| t.as_str() == "term10").count(),
            1
        );
        assert_eq!(history.len(), 20);
    }
}
