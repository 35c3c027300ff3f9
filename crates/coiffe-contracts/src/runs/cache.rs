use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// JSON-file cache of finished retouches, keyed by a stable request hash.
///
/// Reads always refresh from disk and writes merge only the keys this
/// instance touched, so two engines sharing a run directory do not clobber
/// each other.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    entries: Map<String, Value>,
    dirty_keys: Vec<String>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Map::new(),
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Option<Map<String, Value>> {
        self.refresh();
        self.entries.get(key).and_then(Value::as_object).cloned()
    }

    pub fn set(&mut self, key: &str, value: Map<String, Value>) -> anyhow::Result<()> {
        self.refresh();
        let snapshot = Value::Object(value);
        if self.entries.get(key) == Some(&snapshot) {
            return Ok(());
        }
        self.entries.insert(key.to_string(), snapshot);
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if on_disk.remove(key).is_some() {
            write_json_object(&self.path, &on_disk)?;
        }
        self.entries = on_disk;
        self.dirty_keys.retain(|existing| existing != key);
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.entries.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.entries = on_disk;
        self.dirty_keys.clear();
        Ok(())
    }

    fn refresh(&mut self) {
        let mut fresh = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.entries.get(key) {
                fresh.insert(key.clone(), value.clone());
            }
        }
        self.entries = fresh;
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::CacheStore;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn cache_round_trips_an_entry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut cache = CacheStore::new(temp.path().join("cache.json"));
        cache.set("abc", obj(json!({"image_path": "retouch-01.jpg"})))?;
        assert_eq!(
            cache.get("abc"),
            Some(obj(json!({"image_path": "retouch-01.jpg"})))
        );
        assert_eq!(cache.get("missing"), None);
        Ok(())
    }

    #[test]
    fn cache_merges_writes_from_two_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache_a = CacheStore::new(&path);
        let mut cache_b = CacheStore::new(&path);

        cache_a.set("a", obj(json!({"value": 1})))?;
        cache_b.set("b", obj(json!({"value": 2})))?;
        cache_a.set("c", obj(json!({"value": 3})))?;

        let mut reloaded = CacheStore::new(path);
        assert_eq!(reloaded.get("a"), Some(obj(json!({"value": 1}))));
        assert_eq!(reloaded.get("b"), Some(obj(json!({"value": 2}))));
        assert_eq!(reloaded.get("c"), Some(obj(json!({"value": 3}))));
        Ok(())
    }

    #[test]
    fn cache_set_is_not_skipped_on_stale_snapshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache_a = CacheStore::new(&path);
        let mut cache_b = CacheStore::new(&path);

        cache_a.set("key", obj(json!({"value": 1})))?;
        cache_b.set("key", obj(json!({"value": 2})))?;
        cache_a.set("key", obj(json!({"value": 1})))?;

        let mut reloaded = CacheStore::new(path);
        assert_eq!(reloaded.get("key"), Some(obj(json!({"value": 1}))));
        Ok(())
    }

    #[test]
    fn cache_remove_drops_entry_on_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut cache = CacheStore::new(&path);
        cache.set("stale", obj(json!({"image_path": "gone.jpg"})))?;
        cache.remove("stale")?;

        let mut reloaded = CacheStore::new(path);
        assert_eq!(reloaded.get("stale"), None);
        Ok(())
    }
}
