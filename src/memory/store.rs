use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Whole-document key-value persistence for state kept between runs.
pub trait KvStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Value>>;
    fn save(&self, key: &str, value: &Value) -> Result<()>;
}

pub fn load_as<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.load(key)? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .with_context(|| format!("stored `{key}` has an unexpected shape")),
        None => Ok(None),
    }
}

pub fn save_as<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    store.save(key, &value)
}

/// One pretty-printed `<key>.json` per key under `base`, rewritten on every save.
pub struct JsonFileStore {
    base: PathBuf,
}

impl JsonFileStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl KvStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read `{}`", path.display()))?;
        let value = serde_json::from_str(&text)
            .with_context(|| format!("`{}` is not valid JSON", path.display()))?;
        Ok(Some(value))
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        fs::create_dir_all(&self.base)
            .with_context(|| format!("failed to create `{}`", self.base.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("failed to write `{}`", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("failed to replace `{}`", path.display()))
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct InMemoryStore {
    entries: std::sync::Mutex<std::collections::HashMap<String, Value>>,
    saves: std::sync::Mutex<std::collections::HashMap<String, usize>>,
}

#[cfg(test)]
impl InMemoryStore {
    pub fn save_count(&self, key: &str) -> usize {
        self.saves.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
impl KvStore for InMemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        *self.saves.lock().unwrap().entry(key.to_string()).or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_key_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("preferences").unwrap().is_none());
    }

    #[test]
    fn save_rewrites_the_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("memory"));
        store.save("skill_stats", &json!({"totalRuns": 1})).unwrap();
        store.save("skill_stats", &json!({"totalRuns": 2})).unwrap();

        assert_eq!(
            store.load("skill_stats").unwrap(),
            Some(json!({"totalRuns": 2}))
        );
        let on_disk = fs::read_to_string(dir.path().join("memory/skill_stats.json")).unwrap();
        assert!(on_disk.contains("\n"), "expected pretty-printed JSON");
        assert!(!dir.path().join("memory/skill_stats.json.tmp").exists());
    }

    #[test]
    fn typed_helpers_round_trip_through_a_store() {
        let store = InMemoryStore::default();
        save_as(&store, "history", &vec![1u32, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = load_as(&store, "history").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert_eq!(store.save_count("history"), 1);
    }
}
