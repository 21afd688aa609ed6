//! Client preferences persisted between sessions.
//!
//! Values live in a flat JSON object keyed by name, so the file stays
//! readable and unknown keys written by other tools survive a save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Root directory of the last indexing run.
pub const KEY_ROOT: &str = "idx.root";

/// Comma-separated directory names excluded from the last run.
pub const KEY_EXCLUDE_DIRS: &str = "idx.excludeDirs";

/// Comma-separated path patterns excluded from the last run.
pub const KEY_EXCLUDE_GLOBS: &str = "idx.excludeGlobs";

/// Past search queries, most recent first.
pub const KEY_RECENT_QUERIES: &str = "search:recent";

/// Maximum number of remembered search queries.
pub const MAX_RECENT_QUERIES: usize = 10;

/// Parameters for starting an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub root: Option<String>,
    pub exclude_dirs: Vec<String>,
    pub exclude_globs: Vec<String>,
}

impl JobParams {
    /// Build parameters from free-text inputs, where both exclusion lists
    /// are comma-separated.
    pub fn from_inputs(root: &str, exclude_dirs: &str, exclude_globs: &str) -> Self {
        let root = root.trim();
        Self {
            root: (!root.is_empty()).then(|| root.to_string()),
            exclude_dirs: split_csv(exclude_dirs),
            exclude_globs: split_csv(exclude_globs),
        }
    }
}

/// Split a comma-separated list, trimming entries and dropping blanks.
pub fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Named key/value preferences, optionally backed by a file.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    path: Option<PathBuf>,
    values: BTreeMap<String, serde_json::Value>,
}

impl Preferences {
    /// Preferences that are never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load preferences from `path`. A missing file yields empty
    /// preferences that will be created on the first save.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| {
                CoreError::PreferencesFormat {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(CoreError::PreferencesIo { path, source }),
        };
        Ok(Self {
            path: Some(path),
            values,
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write preferences to the backing file. No-op for in-memory
    /// preferences.
    pub fn save(&self) -> Result<(), CoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| CoreError::PreferencesIo {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(&self.values).map_err(|source| {
            CoreError::PreferencesFormat {
                path: path.clone(),
                source,
            }
        })?;
        std::fs::write(path, text).map_err(io_err)
    }

    /// Parameters of the last indexing run.
    pub fn job_params(&self) -> JobParams {
        JobParams::from_inputs(
            self.get_str(KEY_ROOT),
            self.get_str(KEY_EXCLUDE_DIRS),
            self.get_str(KEY_EXCLUDE_GLOBS),
        )
    }

    /// Remember the parameters of an indexing run.
    pub fn set_job_params(&mut self, params: &JobParams) {
        self.set_str(KEY_ROOT, params.root.as_deref().unwrap_or_default());
        self.set_str(KEY_EXCLUDE_DIRS, &params.exclude_dirs.join(", "));
        self.set_str(KEY_EXCLUDE_GLOBS, &params.exclude_globs.join(", "));
    }

    /// Past search queries, most recent first.
    pub fn recent_queries(&self) -> Vec<String> {
        let mut queries: Vec<String> = self
            .values
            .get(KEY_RECENT_QUERIES)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        queries.truncate(MAX_RECENT_QUERIES);
        queries
    }

    /// Move `query` to the front of the recent list. Blank queries are
    /// ignored. Returns the updated list.
    pub fn push_recent_query(&mut self, query: &str) -> Vec<String> {
        let query = query.trim();
        let mut queries = self.recent_queries();
        if query.is_empty() {
            return queries;
        }
        queries.retain(|q| q != query);
        queries.insert(0, query.to_string());
        queries.truncate(MAX_RECENT_QUERIES);
        self.values.insert(
            KEY_RECENT_QUERIES.to_string(),
            serde_json::Value::from(queries.clone()),
        );
        queries
    }

    // ---- private helpers ----

    fn get_str(&self, key: &str) -> &str {
        self.values
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    fn set_str(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_string(), serde_json::Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn csv_inputs_are_trimmed() {
        let params = JobParams::from_inputs("  /src ", "node_modules, .git,, target ", "");
        assert_eq!(params.root.as_deref(), Some("/src"));
        assert_eq!(params.exclude_dirs, vec!["node_modules", ".git", "target"]);
        assert!(params.exclude_globs.is_empty());
    }

    #[test]
    fn blank_root_is_none() {
        assert!(JobParams::from_inputs("   ", "", "").root.is_none());
    }

    #[test]
    fn recent_queries_are_deduplicated_and_capped() {
        let mut prefs = Preferences::in_memory();
        for i in 0..12 {
            prefs.push_recent_query(&format!("q{i}"));
        }
        let list = prefs.push_recent_query("q5");

        assert_eq!(list.len(), MAX_RECENT_QUERIES);
        assert_eq!(list[0], "q5");
        assert_eq!(list.iter().filter(|q| *q == "q5").count(), 1);
        assert_eq!(list[1], "q11");
    }

    #[test]
    fn blank_query_is_ignored() {
        let mut prefs = Preferences::in_memory();
        prefs.push_recent_query("parser");
        let list = prefs.push_recent_query("   ");
        assert_eq!(list, vec!["parser"]);
    }

    #[test]
    fn params_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.json");

        let mut prefs = Preferences::load(&path).unwrap();
        assert_eq!(prefs.job_params(), JobParams::default());

        let params = JobParams {
            root: Some("/work/repo".into()),
            exclude_dirs: vec!["target".into(), ".git".into()],
            exclude_globs: vec!["**/*.min.js".into()],
        };
        prefs.set_job_params(&params);
        prefs.push_recent_query("indexer");
        prefs.save().unwrap();

        let restored = Preferences::load(&path).unwrap();
        assert_eq!(restored.job_params(), params);
        assert_eq!(restored.recent_queries(), vec!["indexer"]);
    }

    #[test]
    fn unknown_keys_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, r#"{"graph:prefs":{"layout":"dagre"}}"#).unwrap();

        let mut prefs = Preferences::load(&path).unwrap();
        prefs.push_recent_query("x");
        prefs.save().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("graph:prefs"));
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_matches!(
            Preferences::load(&path),
            Err(CoreError::PreferencesFormat { .. })
        );
    }

    #[test]
    fn in_memory_save_is_noop() {
        assert!(Preferences::in_memory().save().is_ok());
    }
}
