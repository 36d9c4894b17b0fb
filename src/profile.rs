//! Read-only access to a saved user profile.

use std::path::{Path, PathBuf};

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Profile file written by `analyze --out`. Entries are parsed leniently:
/// the file is user-editable and only `t1_ranked` is ever consumed.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Value, ProfileError> {
        if !self.path.exists() {
            return Err(ProfileError::NotFound(self.path.clone()));
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Up to `n` distinct child labels from the ranked child list.
    pub fn top_child_labels(&self, n: usize) -> Result<Vec<String>, ProfileError> {
        Ok(top_child_labels(&self.read()?, n))
    }
}

/// Extract up to `n` distinct child names from `t1_ranked`.
///
/// Entries look like `["Parent > Child", count]`; a label without ` > ` is
/// used whole. Entries that are not lists or whose first element is not a
/// string are skipped.
pub fn top_child_labels(profile: &Value, n: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    let Some(ranked) = profile.get("t1_ranked").and_then(Value::as_array) else {
        return out;
    };

    for entry in ranked {
        if out.len() >= n {
            break;
        }
        let Some(label) = entry
            .as_array()
            .and_then(|items| items.first())
            .and_then(Value::as_str)
        else {
            continue;
        };

        let child = match label.split_once(" > ") {
            Some((_, child)) => child.trim(),
            None => label.trim(),
        };

        if !child.is_empty() && !out.iter().any(|c| c == child) {
            out.push(child.to_string());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_child_labels_parses_and_dedups() {
        let profile = json!({
            "t1_ranked": [
                ["Science > Physics", 4],
                "garbage",
                [42, 3],
                ["Economics > Physics", 2],
                ["Chemistry", 2],
                ["Art > Painting", 1],
                ["Art > Sculpture", 1]
            ]
        });
        assert_eq!(
            top_child_labels(&profile, 3),
            vec!["Physics", "Chemistry", "Painting"]
        );
    }

    #[test]
    fn test_missing_ranked_list() {
        assert!(top_child_labels(&json!({"user_id": "u"}), 3).is_empty());
        assert!(top_child_labels(&json!({"t1_ranked": "nope"}), 3).is_empty());
    }

    #[test]
    fn test_store_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, r#"{"t1_ranked": [["A > B", 1]]}"#).unwrap();

        let store = ProfileStore::new(path);
        assert_eq!(store.top_child_labels(3).unwrap(), vec!["B"]);
    }

    #[test]
    fn test_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("absent.json"));
        assert!(matches!(
            store.top_child_labels(3),
            Err(ProfileError::NotFound(_))
        ));
    }
}
