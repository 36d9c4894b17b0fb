//! Daily recommendation cache: an in-memory map in front of a JSON file.
//!
//! Keys start with the calendar date, so entries expire at midnight. Every
//! write drops entries from other days, in memory and on disk. Disk writes
//! from this process are serialized through one writer lock and land
//! atomically (temp file + rename). Two processes sharing the file can still
//! lose each other's updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use super::Recommendation;

pub const CACHE_FILE: &str = "reco_cache.json";

/// `YYYY-MM-DD:<digest>`, the digest covering the sorted labels and the
/// date. Label order does not matter.
pub fn cache_key(labels: &[String], date: NaiveDate) -> String {
    let mut sorted: Vec<&str> = labels.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let day = date.format("%Y-%m-%d").to_string();
    let raw = format!("{}:{day}", sorted.join(","));

    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{day}:{hex}")
}

fn key_day(key: &str) -> Option<&str> {
    key.split_once(':').map(|(day, _)| day)
}

pub struct RecommendationCache {
    path: PathBuf,
    memory: Mutex<HashMap<String, Recommendation>>,
    writer: tokio::sync::Mutex<()>,
}

impl RecommendationCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(CACHE_FILE),
            memory: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Memory first, then disk. Disk hits are promoted into memory.
    pub fn get(&self, key: &str) -> Option<Recommendation> {
        if let Ok(memory) = self.memory.lock() {
            if let Some(hit) = memory.get(key) {
                return Some(hit.clone());
            }
        }

        let hit = self.read_disk().remove(key)?;
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key.to_string(), hit.clone());
        }
        Some(hit)
    }

    /// Write-through to memory and disk, dropping entries of other days.
    /// Disk failures are logged, not returned.
    pub async fn put(&self, key: &str, value: Recommendation) {
        let day = key_day(key);
        if let Ok(mut memory) = self.memory.lock() {
            memory.retain(|k, _| key_day(k) == day);
            memory.insert(key.to_string(), value.clone());
        }

        let _guard = self.writer.lock().await;
        let mut entries = self.read_disk();
        let before = entries.len();
        entries.retain(|k, _| key_day(k) == day);
        if entries.len() < before {
            log::debug!("pruned {} stale cache entries", before - entries.len());
        }
        entries.insert(key.to_string(), value);
        if let Err(e) = self.write_disk(&entries) {
            log::warn!("failed to persist recommendation cache: {e}");
        }
    }

    fn read_disk(&self) -> HashMap<String, Recommendation> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("ignoring unreadable recommendation cache: {e}");
                HashMap::new()
            }
        }
    }

    fn write_disk(&self, entries: &HashMap<String, Recommendation>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, serde_json::to_string_pretty(entries)?)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> Recommendation {
        Recommendation {
            title: "An essay".into(),
            source: "Aeon".into(),
            url: "https://aeon.co/essays/x".into(),
            image_url: String::new(),
            date: None,
        }
    }

    #[test]
    fn test_cache_key_stable_and_order_independent() {
        let d = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let k1 = cache_key(&labels(&["a", "b", "c"]), d);
        let k2 = cache_key(&labels(&["a", "b", "c"]), d);
        let k3 = cache_key(&labels(&["c", "a", "b"]), d);
        assert_eq!(k1, k2);
        assert_eq!(k1, k3);
        assert!(k1.starts_with("2025-03-04:"));
        assert_eq!(k1.len(), 11 + 64);
    }

    #[test]
    fn test_cache_key_changes_with_date() {
        let l = labels(&["a", "b", "c"]);
        let d1 = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        assert_ne!(cache_key(&l, d1), cache_key(&l, d2));
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RecommendationCache::new(dir.path());
        cache.put("k", sample()).await;
        assert_eq!(cache.get("k"), Some(sample()));
        assert_eq!(cache.get("missing"), None);
    }

    #[tokio::test]
    async fn test_disk_layer_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        RecommendationCache::new(dir.path()).put("k", sample()).await;

        let fresh = RecommendationCache::new(dir.path());
        assert_eq!(fresh.get("k"), Some(sample()));

        let raw = std::fs::read_to_string(fresh.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["k"]["source"], "Aeon");
        assert!(parsed["k"].get("date").is_none());
    }

    #[tokio::test]
    async fn test_put_prunes_other_days() {
        let dir = tempfile::tempdir().unwrap();
        let l = labels(&["a", "b", "c"]);
        let yesterday = cache_key(&l, NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());
        let today = cache_key(&l, NaiveDate::from_ymd_opt(2025, 3, 5).unwrap());
        let other = cache_key(&labels(&["x", "y", "z"]), NaiveDate::from_ymd_opt(2025, 3, 5).unwrap());

        let cache = RecommendationCache::new(dir.path());
        cache.put(&yesterday, sample()).await;
        cache.put(&today, sample()).await;
        cache.put(&other, sample()).await;

        assert_eq!(cache.get(&yesterday), None);
        assert_eq!(cache.get(&today), Some(sample()));

        let raw = std::fs::read_to_string(cache.path()).unwrap();
        let parsed: HashMap<String, serde_json::Value> = serde_json::from_str(&raw).unwrap();
        let mut keys: Vec<&String> = parsed.keys().collect();
        keys.sort();
        let mut expected = vec![&other, &today];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), "{broken").unwrap();

        let cache = RecommendationCache::new(dir.path());
        assert_eq!(cache.get("k"), None);
        cache.put("k", sample()).await;
        assert_eq!(RecommendationCache::new(dir.path()).get("k"), Some(sample()));
    }
}
