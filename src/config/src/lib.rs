//! Hierarchical string-keyed configuration for test environments.
//!
//! Configuration is stored as nested maps. Dotted-path keys resolve through
//! the nesting: for `databases.presto.host` the outer map is consulted for
//! `databases`, the nested map for `presto` and so on. A flat key containing
//! dots takes precedence over traversal when present at the current level,
//! so files mixing both styles behave predictably.

use std::collections::BTreeSet;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde_json::{Map, Value};
use thiserror::Error;

/// File consulted by [`Configuration::load`], relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stagehand.toml";

/// Environment variables prefixed with this override file values.
/// `STAGEHAND__DATABASES__PRESTO__PORT=8080` maps to `databases.presto.port`.
pub const ENV_PREFIX: &str = "STAGEHAND__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration key: {0}")]
    MissingKey(String),

    #[error("configuration key {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Read-only configuration consumed by requirement providers and fulfillers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Configuration {
    root: Map<String, Value>,
}

impl Configuration {
    /// An empty configuration.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// Parse an inline TOML document. Mostly useful in tests.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let root = Figment::from(Toml::string(toml))
            .extract::<Map<String, Value>>()
            .map_err(Box::new)?;
        Ok(Self { root })
    }

    /// Load configuration from `stagehand.toml` merged with `STAGEHAND__`
    /// prefixed environment variables (double underscore separates key parts).
    pub fn load() -> Result<Self, ConfigError> {
        let root = Figment::from(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract::<Map<String, Value>>()
            .map_err(Box::new)?;

        log::debug!("loaded configuration with {} top level key(s)", root.len());
        Ok(Self { root })
    }

    /// Look up a leaf value by dotted key. Keys resolving to a nested scope
    /// rather than a leaf read as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match lookup(&self.root, key) {
            Some(Value::Object(_)) | None => None,
            leaf => leaf,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(string_value)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(int_value)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(bool_value)
    }

    pub fn get_string_mandatory(&self, key: &str) -> Result<String, ConfigError> {
        string_value(self.mandatory(key)?).ok_or_else(|| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: "string",
        })
    }

    pub fn get_int_mandatory(&self, key: &str) -> Result<i64, ConfigError> {
        int_value(self.mandatory(key)?).ok_or_else(|| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: "integer",
        })
    }

    pub fn get_bool_mandatory(&self, key: &str) -> Result<bool, ConfigError> {
        bool_value(self.mandatory(key)?).ok_or_else(|| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: "boolean",
        })
    }

    fn mandatory(&self, key: &str) -> Result<&Value, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// All fully qualified leaf keys, in lexical order.
    pub fn list_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        collect_keys(&self.root, None, &mut keys);
        keys
    }

    /// Top level key parts present in this configuration.
    pub fn list_prefixes(&self) -> Vec<String> {
        self.root.keys().cloned().collect()
    }

    /// The nested scope under `key_prefix`, or an empty configuration if the
    /// prefix is absent or names a leaf.
    pub fn subconfiguration(&self, key_prefix: &str) -> Configuration {
        match lookup(&self.root, key_prefix) {
            Some(Value::Object(nested)) => Configuration { root: nested.clone() },
            _ => Configuration::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(key) {
        return Some(value);
    }

    let parts: Vec<&str> = key.split('.').collect();
    for prefix_len in 1..parts.len() {
        let prefix = parts[..prefix_len].join(".");
        if let Some(Value::Object(nested)) = map.get(&prefix) {
            let remaining = parts[prefix_len..].join(".");
            return lookup(nested, &remaining);
        }
    }
    None
}

fn collect_keys(map: &Map<String, Value>, prefix: Option<&str>, acc: &mut BTreeSet<String>) {
    for (part, value) in map {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{part}"),
            None => part.clone(),
        };
        match value {
            Value::Object(nested) => collect_keys(nested, Some(&key), acc),
            _ => {
                acc.insert(key);
            }
        }
    }
}

fn string_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn bool_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        Configuration::from_toml_str(
            r#"
            [databases.presto]
            host = "localhost"
            port = 8080
            https = false

            [hdfs]
            username = "hdfs"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_nested_lookup() {
        let config = sample();

        assert_eq!(
            config.get_string("databases.presto.host"),
            Some("localhost".to_string())
        );
        assert_eq!(config.get_int("databases.presto.port"), Some(8080));
        assert_eq!(config.get_bool("databases.presto.https"), Some(false));
        assert_eq!(config.get_string("databases.presto.missing"), None);
    }

    #[test]
    fn test_scope_keys_read_as_absent() {
        let config = sample();

        // "databases" names a nested scope, not a leaf.
        assert!(config.get("databases").is_none());
        assert!(config.get("databases.presto").is_none());
    }

    #[test]
    fn test_flat_key_wins_over_traversal() {
        let mut root = Map::new();
        root.insert("a.b".to_string(), Value::from(1));
        let mut nested = Map::new();
        nested.insert("b".to_string(), Value::from(2));
        root.insert("a".to_string(), Value::Object(nested));

        let config = Configuration::from_map(root);
        assert_eq!(config.get_int("a.b"), Some(1));
    }

    #[test]
    fn test_mandatory_errors() {
        let config = sample();

        let err = config.get_string_mandatory("databases.presto.missing");
        assert!(matches!(err, Err(ConfigError::MissingKey(key)) if key == "databases.presto.missing"));

        let err = config.get_int_mandatory("databases.presto.host");
        assert!(matches!(err, Err(ConfigError::TypeMismatch { expected: "integer", .. })));
    }

    #[test]
    fn test_list_keys() {
        let config = sample();

        let keys: Vec<String> = config.list_keys().into_iter().collect();
        assert_eq!(
            keys,
            vec![
                "databases.presto.host".to_string(),
                "databases.presto.https".to_string(),
                "databases.presto.port".to_string(),
                "hdfs.username".to_string(),
            ]
        );
        assert_eq!(config.list_prefixes(), vec!["databases", "hdfs"]);
    }

    #[test]
    fn test_subconfiguration() {
        let config = sample();

        let presto = config.subconfiguration("databases.presto");
        assert_eq!(presto.get_string("host"), Some("localhost".to_string()));

        assert!(config.subconfiguration("databases.hive").is_empty());
        // A leaf prefix yields an empty scope as well.
        assert!(config.subconfiguration("hdfs.username").is_empty());
    }

    #[test]
    fn test_load_merges_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [databases.presto]
                host = "localhost"
                port = 8080
                "#,
            )?;
            jail.set_env("STAGEHAND__DATABASES__PRESTO__PORT", "9090");

            let config = Configuration::load().unwrap();
            assert_eq!(
                config.get_string("databases.presto.host"),
                Some("localhost".to_string())
            );
            assert_eq!(config.get_int("databases.presto.port"), Some(9090));
            Ok(())
        });
    }

    #[test]
    fn test_load_without_file() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("STAGEHAND__HDFS__USERNAME", "hdfs");

            let config = Configuration::load().unwrap();
            assert_eq!(config.get_string("hdfs.username"), Some("hdfs".to_string()));
            Ok(())
        });
    }
}
