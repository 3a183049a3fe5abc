//! TOML configuration parsing.
//!
//! The server config carries the bind address, retrieval knobs, the access
//! gate setup, and the per-kind backend defaults that the
//! [`BackendSelector`](crate::selector::BackendSelector) merges caller
//! parameters over. Defaults are layered: built-in values, then the TOML
//! file, then environment variables.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Flat string parameters for one backend kind.
pub type Params = BTreeMap<String, String>;

/// Per-kind parameter tables for one backend family (`kind -> params`).
pub type KindTable = BTreeMap<String, Params>;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_label")]
    pub default_label: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            default_label: default_label(),
        }
    }
}

fn default_label() -> String {
    crate::models::DEFAULT_LABEL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            history_turns: default_history_turns(),
            chunk_max_chars: default_chunk_max_chars(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_history_turns() -> usize {
    6
}
fn default_chunk_max_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_auth_provider")]
    pub provider: String,
    /// Supabase project URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Supabase anon/service key sent as the `apikey` header.
    #[serde(default)]
    pub api_key: Option<String>,
    /// HS256 secret for the `jwt` provider.
    #[serde(default)]
    pub secret: Option<String>,
    /// `user_type -> labels` table for the `jwt` provider.
    #[serde(default)]
    pub user_types: HashMap<String, Vec<String>>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: default_auth_provider(),
            url: None,
            api_key: None,
            secret: None,
            user_types: HashMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_auth_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Server-side backend defaults, looked up by the already-resolved kind.
#[derive(Debug, Deserialize, Clone)]
pub struct DefaultsConfig {
    #[serde(default = "default_store_kind")]
    pub store_kind: String,
    #[serde(default = "default_embedding_kind")]
    pub embedding_kind: String,
    #[serde(default = "default_framework_kind")]
    pub framework_kind: String,
    #[serde(default, deserialize_with = "deserialize_kind_table")]
    pub store: KindTable,
    #[serde(default, deserialize_with = "deserialize_kind_table")]
    pub embedding: KindTable,
    #[serde(default, deserialize_with = "deserialize_kind_table")]
    pub generation: KindTable,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            store_kind: default_store_kind(),
            embedding_kind: default_embedding_kind(),
            framework_kind: default_framework_kind(),
            store: KindTable::new(),
            embedding: KindTable::new(),
            generation: KindTable::new(),
        }
    }
}

fn default_store_kind() -> String {
    "sqlite".to_string()
}
fn default_embedding_kind() -> String {
    "openai".to_string()
}
fn default_framework_kind() -> String {
    "openai-vanilla".to_string()
}

/// Accepts string, integer, float, and boolean leaves so `port = 5432`
/// and `port = "5432"` both work.
fn deserialize_kind_table<'de, D>(deserializer: D) -> std::result::Result<KindTable, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, BTreeMap<String, toml::Value>> = BTreeMap::deserialize(deserializer)?;
    let mut table = KindTable::new();
    for (kind, values) in raw {
        let mut params = Params::new();
        for (key, value) in values {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "defaults.{}.{} must be a scalar, got {}",
                        kind,
                        key,
                        other.type_str()
                    )))
                }
            };
            params.insert(key, text);
        }
        table.insert(kind.to_lowercase(), params);
    }
    Ok(table)
}

fn builtin(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl DefaultsConfig {
    /// Built-in values for every known kind; file and env values override these.
    fn builtins() -> (KindTable, KindTable, KindTable) {
        let mut store = KindTable::new();
        store.insert(
            "sqlite".into(),
            builtin(&[
                ("path", "./data/assistant.sqlite"),
                ("collection", "adotb_collection"),
            ]),
        );
        store.insert(
            "postgres".into(),
            builtin(&[
                ("host", "localhost"),
                ("port", "5432"),
                ("user", "admin"),
                ("database", "adotbcollection"),
                ("collection", "adotb_collection"),
            ]),
        );

        let mut embedding = KindTable::new();
        embedding.insert(
            "openai".into(),
            builtin(&[
                ("base_url", "https://api.openai.com/v1"),
                ("model", "text-embedding-ada-002"),
                ("dims", "1536"),
            ]),
        );
        embedding.insert(
            "ollama".into(),
            builtin(&[
                ("base_url", "http://localhost:11434"),
                ("model", "nomic-embed-text"),
                ("dims", "768"),
            ]),
        );
        embedding.insert(
            "local".into(),
            builtin(&[("model", "all-minilm-l6-v2"), ("dims", "384")]),
        );

        let mut generation = KindTable::new();
        for kind in ["openai-vanilla", "openai-condense"] {
            generation.insert(
                kind.into(),
                builtin(&[
                    ("base_url", "https://api.openai.com/v1"),
                    ("model", "gpt-3.5-turbo"),
                    ("temperature", "0.0"),
                    ("max_tokens", "512"),
                ]),
            );
        }

        (store, embedding, generation)
    }

    /// Layer the file values over the built-ins.
    fn with_builtins(mut self) -> Self {
        let (store, embedding, generation) = Self::builtins();
        self.store = layer(store, self.store);
        self.embedding = layer(embedding, self.embedding);
        self.generation = layer(generation, self.generation);
        self
    }

    /// Apply environment overrides using `lookup` (usually `std::env::var`).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |table: &mut KindTable, kind: &str, key: &str, var: &str| {
            if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
                table
                    .entry(kind.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
        };

        set(&mut self.store, "sqlite", "path", "SQLITE_DB_PATH");
        set(&mut self.store, "sqlite", "collection", "DB_COLLECTION_NAME");
        set(&mut self.store, "postgres", "host", "POSTGRES_DB_HOST");
        set(&mut self.store, "postgres", "port", "POSTGRES_DB_PORT");
        set(&mut self.store, "postgres", "user", "POSTGRES_DB_USER");
        set(&mut self.store, "postgres", "password", "POSTGRES_DB_PASSWORD");
        set(&mut self.store, "postgres", "database", "POSTGRES_DB_NAME");
        set(&mut self.store, "postgres", "collection", "DB_COLLECTION_NAME");
        set(&mut self.embedding, "openai", "api_key", "OPENAI_API_KEY");
        set(&mut self.embedding, "ollama", "base_url", "OLLAMA_BASE_URL");
        set(&mut self.generation, "openai-vanilla", "api_key", "OPENAI_API_KEY");
        set(&mut self.generation, "openai-condense", "api_key", "OPENAI_API_KEY");
    }

    pub fn store_defaults(&self, kind: &str) -> Params {
        self.store.get(kind).cloned().unwrap_or_default()
    }

    pub fn embedding_defaults(&self, kind: &str) -> Params {
        self.embedding.get(kind).cloned().unwrap_or_default()
    }

    pub fn generation_defaults(&self, kind: &str) -> Params {
        self.generation.get(kind).cloned().unwrap_or_default()
    }
}

fn layer(mut base: KindTable, over: KindTable) -> KindTable {
    for (kind, params) in over {
        base.entry(kind).or_default().extend(params);
    }
    base
}

impl Config {
    /// Built-in defaults with environment overrides; used when no file is given.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.defaults = config.defaults.with_builtins();
        config.defaults.apply_env_with(|k| std::env::var(k).ok());
        config
    }

    /// Built-in defaults only (no environment). Handy for tests.
    pub fn builtin() -> Self {
        let mut config = Config::default();
        config.defaults = config.defaults.with_builtins();
        config
    }
}

/// Parse a config from TOML text, layering built-ins under it. No env lookup.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.defaults = config.defaults.with_builtins();
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.defaults.apply_env_with(|k| std::env::var(k).ok());
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.chunk_max_chars == 0 {
        bail!("retrieval.chunk_max_chars must be > 0");
    }

    match config.auth.provider.as_str() {
        "disabled" => {}
        "supabase" => {
            if config.auth.url.is_none() || config.auth.api_key.is_none() {
                bail!("auth.url and auth.api_key are required when provider is 'supabase'");
            }
        }
        "jwt" => {
            if config.auth.secret.as_deref().map_or(true, str::is_empty) {
                bail!("auth.secret is required when provider is 'jwt'");
            }
        }
        other => bail!(
            "Unknown auth provider: '{}'. Must be disabled, supabase, or jwt.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
bind = "127.0.0.1:9000"
"#;

    #[test]
    fn test_minimal_config_gets_builtins() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.server.default_label, "open-access");
        assert_eq!(
            config.defaults.store_defaults("sqlite").get("collection").map(String::as_str),
            Some("adotb_collection")
        );
        assert!(!config.auth.is_enabled());
    }

    #[test]
    fn test_file_values_override_builtins() {
        let config = parse_config(
            r#"
[server]
bind = "0.0.0.0:8000"

[defaults.store.postgres]
host = "db.internal"
port = 6543
"#,
        )
        .unwrap();
        let pg = config.defaults.store_defaults("postgres");
        assert_eq!(pg["host"], "db.internal");
        assert_eq!(pg["port"], "6543");
        // untouched built-in survives
        assert_eq!(pg["user"], "admin");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.defaults.apply_env_with(|k| match k {
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "POSTGRES_DB_PASSWORD" => Some("hunter2".to_string()),
            _ => None,
        });
        assert_eq!(config.defaults.embedding_defaults("openai")["api_key"], "sk-test");
        assert_eq!(
            config.defaults.generation_defaults("openai-condense")["api_key"],
            "sk-test"
        );
        assert_eq!(config.defaults.store_defaults("postgres")["password"], "hunter2");
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let err = parse_config(
            r#"
[server]
bind = "127.0.0.1:9000"
[retrieval]
top_k = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("top_k"));
    }

    #[test]
    fn test_rejects_unknown_auth_provider() {
        let err = parse_config(
            r#"
[server]
bind = "127.0.0.1:9000"
[auth]
provider = "ldap"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ldap"));
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/assistant.example.toml")).unwrap();
        assert_eq!(config.auth.user_types["admin"], vec!["bible", "open-access"]);
        assert_eq!(config.defaults.embedding_defaults("ollama")["dims"], "768");
        assert_eq!(config.defaults.store_defaults("postgres")["port"], "5432");
    }

    #[test]
    fn test_jwt_provider_requires_secret() {
        assert!(parse_config(
            r#"
[server]
bind = "127.0.0.1:9000"
[auth]
provider = "jwt"
"#,
        )
        .is_err());
    }
}
