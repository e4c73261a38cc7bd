// ABOUTME: Configuration loading for replication jobs from a JSON file
// ABOUTME: Validates keys strictly, tolerating /*-prefixed comment entries

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Filter settings for a single replicated table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilteredTable {
    /// SQL predicate limiting which source rows are replicated.
    #[serde(rename = "where", default)]
    pub where_clause: String,
    /// Alternative to `where`: predicate fragments joined by whitespace.
    #[serde(default)]
    pub wheres: Vec<String>,
    /// Tables this filter depends on; they are validated first.
    #[serde(default)]
    pub uses: Vec<String>,
}

/// Main configuration for a replication job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub filtered_tables: HashMap<String, FilteredTable>,
    #[serde(default = "default_update_chunk_size")]
    pub update_chunk_size: u32,
    #[serde(default = "default_delete_chunk_size")]
    pub delete_chunk_size: u32,
    #[serde(default = "default_min_delete_chunk_size")]
    pub min_delete_chunk_size: u32,
    #[serde(default = "default_throttle_percentage")]
    pub throttle_percentage: f64,
    #[serde(rename = "stateTable", default = "default_state_table")]
    pub state_table_name: String,
    #[serde(default = "default_true")]
    pub sync_updates: bool,
    #[serde(default = "default_true")]
    pub sync_deletes: bool,
    #[serde(default)]
    pub resync_on_schema_change: bool,
    #[serde(default = "default_full_copy_threshold")]
    pub full_copy_threshold: f64,
    /// Pause between runs in continuous mode, in seconds.
    #[serde(default = "default_wait_between_jobs")]
    pub wait_between_jobs: u64,
}

fn default_update_chunk_size() -> u32 {
    1000
}

fn default_delete_chunk_size() -> u32 {
    1000
}

fn default_min_delete_chunk_size() -> u32 {
    100
}

fn default_throttle_percentage() -> f64 {
    80.0
}

fn default_state_table() -> String {
    "__sslr_state".to_string()
}

fn default_true() -> bool {
    true
}

fn default_full_copy_threshold() -> f64 {
    0.5
}

fn default_wait_between_jobs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("empty config deserializes")
    }
}

const KNOWN_KEYS: &[&str] = &[
    "source",
    "target",
    "tables",
    "filteredTables",
    "updateChunkSize",
    "deleteChunkSize",
    "minDeleteChunkSize",
    "throttlePercentage",
    "stateTable",
    "syncUpdates",
    "syncDeletes",
    "resyncOnSchemaChange",
    "fullCopyThreshold",
    "waitBetweenJobs",
];

const KNOWN_FILTERED_KEYS: &[&str] = &["where", "wheres", "uses"];

/// Load a JSON config file, validating it against the recognized fields.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let json_data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;

    validate_keys(&json_data)?;

    let mut config: Config = serde_json::from_str(&json_data)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;

    normalize_filters(&mut config)?;
    validate_uses(&config)?;

    Ok(config)
}

/// Reject unknown settings before typed deserialization. Keys starting with
/// "/*" are tolerated as comments.
fn validate_keys(json_data: &str) -> Result<()> {
    let parsed: serde_json::Value =
        serde_json::from_str(json_data).context("Config file is not valid JSON")?;
    let Some(object) = parsed.as_object() else {
        bail!("Config file must contain a JSON object");
    };

    for key in object.keys() {
        if key.starts_with("/*") {
            continue;
        }
        if !KNOWN_KEYS.contains(&key.as_str()) {
            bail!("Unknown setting {:?}", key);
        }
    }

    if let Some(filtered) = object.get("filteredTables").and_then(|v| v.as_object()) {
        for entry in filtered.values() {
            let Some(entry) = entry.as_object() else {
                bail!("Filtered table entries must be JSON objects");
            };
            for key in entry.keys() {
                if key.starts_with("/*") {
                    continue;
                }
                if !KNOWN_FILTERED_KEYS.contains(&key.as_str()) {
                    bail!("Unknown filtered table setting {:?}", key);
                }
            }
        }
    }

    Ok(())
}

/// Fold `wheres` fragments into `where`. Setting both is an error.
fn normalize_filters(config: &mut Config) -> Result<()> {
    for (table, settings) in config.filtered_tables.iter_mut() {
        if !settings.wheres.is_empty() {
            if !settings.where_clause.is_empty() {
                bail!("cannot set both 'where' and 'wheres' for table {:?}", table);
            }
            settings.where_clause = settings.wheres.join(" ");
        }
    }
    Ok(())
}

/// Every `uses` entry must reference a configured table.
fn validate_uses(config: &Config) -> Result<()> {
    let has_table = |needle: &str| {
        config.tables.iter().any(|t| t == needle)
            || config.filtered_tables.contains_key(needle)
    };

    for settings in config.filtered_tables.values() {
        for used in &settings.uses {
            if !has_table(used) {
                bail!("unknown table {:?} in uses list", used);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_from_str(json: &str) -> Result<Config> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        load_config(file.path())
    }

    #[test]
    fn test_defaults() {
        let config = load_from_str(r#"{"source": "s", "target": "t"}"#).unwrap();
        assert_eq!(config.update_chunk_size, 1000);
        assert_eq!(config.delete_chunk_size, 1000);
        assert_eq!(config.min_delete_chunk_size, 100);
        assert_eq!(config.throttle_percentage, 80.0);
        assert_eq!(config.state_table_name, "__sslr_state");
        assert!(config.sync_updates);
        assert!(config.sync_deletes);
        assert!(!config.resync_on_schema_change);
        assert_eq!(config.full_copy_threshold, 0.5);
        assert_eq!(config.wait_between_jobs, 5);
    }

    #[test]
    fn test_unknown_setting_rejected() {
        let err = load_from_str(r#"{"source": "s", "bogus": 1}"#).unwrap_err();
        assert!(err.to_string().contains("Unknown setting"));
    }

    #[test]
    fn test_comment_keys_tolerated() {
        let config = load_from_str(
            r#"{"/* note": "throttle is low on purpose", "source": "s", "throttlePercentage": 10}"#,
        )
        .unwrap();
        assert_eq!(config.throttle_percentage, 10.0);
    }

    #[test]
    fn test_unknown_filtered_setting_rejected() {
        let err = load_from_str(
            r#"{"filteredTables": {"public.t": {"where": "x > 1", "nope": true}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown filtered table setting"));
    }

    #[test]
    fn test_wheres_joined_by_whitespace() {
        let config = load_from_str(
            r#"{"filteredTables": {"public.t": {"wheres": ["a = 1", "and b = 2"]}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.filtered_tables["public.t"].where_clause,
            "a = 1 and b = 2"
        );
    }

    #[test]
    fn test_where_and_wheres_conflict() {
        let err = load_from_str(
            r#"{"filteredTables": {"public.t": {"where": "a = 1", "wheres": ["b = 2"]}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot set both"));
    }

    #[test]
    fn test_unknown_uses_reference_rejected() {
        let err = load_from_str(
            r#"{"tables": ["public.a"], "filteredTables": {"public.t": {"uses": ["public.missing"]}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown table"));
    }

    #[test]
    fn test_uses_may_reference_plain_and_filtered_tables() {
        let config = load_from_str(
            r#"{
                "tables": ["public.a"],
                "filteredTables": {
                    "public.b": {"where": "id > 0"},
                    "public.t": {"uses": ["public.a", "public.b"]}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.filtered_tables["public.t"].uses.len(), 2);
    }
}
