//! Shared raw tool cache file.
//!
//! The bridge writes every provider's unfiltered `tools/list` here so the
//! admin UI can display and manage tools without a live hub connection.
//! Writers rewrite the whole file atomically (tempfile then rename); racing
//! writers are last-write-wins.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type CachedTools = BTreeMap<String, Vec<Value>>;

#[derive(Clone)]
pub struct ToolsCacheFile {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Arc<Mutex<()>>,
}

impl ToolsCacheFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole cache. A missing or unreadable file is an empty map.
    #[must_use]
    pub fn load(&self) -> CachedTools {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return CachedTools::new();
        };
        serde_json::from_str(&text).unwrap_or_default()
    }

    /// Replace one provider's raw tool list.
    pub fn put(&self, provider: &str, tools: Vec<Value>) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();
        let mut cache = self.load();
        let count = tools.len();
        cache.insert(provider.to_string(), tools);
        self.write_atomic(&cache)?;
        tracing::info!(provider = %provider, tools = count, "cached raw tool list");
        Ok(())
    }

    /// Drop a provider's entry (provider disabled or deleted).
    pub fn remove(&self, provider: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();
        let mut cache = self.load();
        if cache.remove(provider).is_some() {
            self.write_atomic(&cache)?;
            tracing::info!(provider = %provider, "removed provider from tool cache");
        }
        Ok(())
    }

    fn write_atomic(&self, cache: &CachedTools) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(cache).expect("cache serializes");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_and_remove_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ToolsCacheFile::new(dir.path().join("tools_cache.json"));

        cache
            .put("p1", vec![json!({"name": "echo", "description": "echoes"})])
            .expect("put");
        cache
            .put("p2", vec![json!({"name": "search"})])
            .expect("put");

        let loaded = cache.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["p1"][0]["name"], json!("echo"));

        cache.remove("p1").expect("remove");
        let loaded = cache.load();
        assert!(!loaded.contains_key("p1"));
        assert!(loaded.contains_key("p2"));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ToolsCacheFile::new(dir.path().join("absent.json"));
        assert!(cache.load().is_empty());
        // Removing from an absent cache is a no-op, not an error.
        cache.remove("p1").expect("remove");
    }

    #[test]
    fn put_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ToolsCacheFile::new(dir.path().join("data/nested/tools_cache.json"));
        cache.put("p1", vec![json!({"name": "echo"})]).expect("put");
        assert_eq!(cache.load()["p1"].len(), 1);
    }
}
