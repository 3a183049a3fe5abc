//! Backend selector: configuration descriptor → concrete backend specs.
//!
//! The selector decides *which* backend to build and *with what*; it never
//! connects to anything. Each family has a closed kind enum parsed
//! case-insensitively from the caller's string. The effective parameter set
//! for a kind is the server default for that kind with every non-empty
//! caller value laid over it. Required keys missing after the merge fail
//! with [`RagError::MissingConfiguration`].
//!
//! | Family | Kinds | Required keys |
//! |--------|-------|---------------|
//! | store | `sqlite` | `path`, `collection` |
//! | store | `postgres` | `host`, `port`, `user`, `password`, `database`, `collection` |
//! | embedding | `openai` | `api_key`, `model`, `base_url` |
//! | embedding | `ollama` | `model`, `base_url` |
//! | embedding | `local` | `model` |
//! | generation | `openai-condense`, `openai-vanilla` | `api_key`, `model`, `base_url` |

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::config::{Config, DefaultsConfig, Params, RetrievalConfig};
use crate::embedding::{EmbeddingBackend, EmbeddingSettings, OllamaEmbedder, OpenAiEmbedder};
use crate::error::{BackendFamily, RagError, RagResult};
use crate::generation::{
    CondenseFramework, GenerationBackend, GenerationSettings, VanillaFramework,
};
use crate::store::StoreSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    OpenAi,
    Ollama,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkKind {
    Condense,
    Vanilla,
}

impl StoreKind {
    pub const ALL: [StoreKind; 2] = [StoreKind::Sqlite, StoreKind::Postgres];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Sqlite => "sqlite",
            StoreKind::Postgres => "postgres",
        }
    }
}

impl EmbeddingKind {
    pub const ALL: [EmbeddingKind; 3] = [EmbeddingKind::OpenAi, EmbeddingKind::Ollama, EmbeddingKind::Local];

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingKind::OpenAi => "openai",
            EmbeddingKind::Ollama => "ollama",
            EmbeddingKind::Local => "local",
        }
    }
}

impl FrameworkKind {
    pub const ALL: [FrameworkKind; 2] = [FrameworkKind::Condense, FrameworkKind::Vanilla];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameworkKind::Condense => "openai-condense",
            FrameworkKind::Vanilla => "openai-vanilla",
        }
    }
}

fn unsupported(family: BackendFamily, value: &str) -> RagError {
    RagError::UnsupportedBackendKind {
        family,
        value: value.to_string(),
    }
}

impl FromStr for StoreKind {
    type Err = RagError;

    fn from_str(s: &str) -> RagResult<Self> {
        StoreKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| unsupported(BackendFamily::Store, s))
    }
}

impl FromStr for EmbeddingKind {
    type Err = RagError;

    fn from_str(s: &str) -> RagResult<Self> {
        EmbeddingKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| unsupported(BackendFamily::Embedding, s))
    }
}

impl FromStr for FrameworkKind {
    type Err = RagError;

    fn from_str(s: &str) -> RagResult<Self> {
        FrameworkKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| unsupported(BackendFamily::Generation, s))
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EmbeddingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FrameworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend choices and credentials a client sends with a request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDescriptor {
    pub vectordb_type: Option<String>,
    /// `host:port`.
    pub db_hostn_port: Option<String>,
    pub db_path: Option<String>,
    pub collection_name: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub embedding_type: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model_name: Option<String>,
    pub llm_framework_type: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model_name: Option<String>,
}

fn put(params: &mut Params, key: &str, value: &Option<String>) {
    if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        params.insert(key.to_string(), v.to_string());
    }
}

impl PipelineDescriptor {
    pub fn store_params(&self) -> Params {
        let mut params = Params::new();
        if let Some(hp) = self.db_hostn_port.as_deref().filter(|s| !s.trim().is_empty()) {
            match hp.trim().rsplit_once(':') {
                Some((host, port)) => {
                    params.insert("host".into(), host.to_string());
                    params.insert("port".into(), port.to_string());
                }
                None => {
                    params.insert("host".into(), hp.trim().to_string());
                }
            }
        }
        put(&mut params, "path", &self.db_path);
        put(&mut params, "collection", &self.collection_name);
        put(&mut params, "user", &self.db_user);
        put(&mut params, "password", &self.db_password);
        params
    }

    pub fn embedding_params(&self) -> Params {
        let mut params = Params::new();
        put(&mut params, "api_key", &self.embedding_api_key);
        put(&mut params, "model", &self.embedding_model_name);
        params
    }

    pub fn generation_params(&self) -> Params {
        let mut params = Params::new();
        put(&mut params, "api_key", &self.llm_api_key);
        put(&mut params, "model", &self.llm_model_name);
        params
    }
}

/// An embedding backend to construct.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSpec {
    pub kind: EmbeddingKind,
    pub settings: EmbeddingSettings,
}

impl EmbeddingSpec {
    pub fn build(self) -> RagResult<EmbeddingBackend> {
        match self.kind {
            EmbeddingKind::OpenAi => Ok(EmbeddingBackend::OpenAi(OpenAiEmbedder::new(self.settings)?)),
            EmbeddingKind::Ollama => Ok(EmbeddingBackend::Ollama(OllamaEmbedder::new(self.settings)?)),
            #[cfg(feature = "local-embeddings")]
            EmbeddingKind::Local => Ok(EmbeddingBackend::Local(
                crate::embedding::LocalEmbedder::new(self.settings)?,
            )),
            #[cfg(not(feature = "local-embeddings"))]
            EmbeddingKind::Local => Err(RagError::connection(
                "local",
                "this build has no local embedding support (enable the `local-embeddings` feature)",
            )),
        }
    }
}

/// A generation framework to construct.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSpec {
    pub kind: FrameworkKind,
    pub settings: GenerationSettings,
}

impl GenerationSpec {
    pub fn build(self) -> RagResult<GenerationBackend> {
        match self.kind {
            FrameworkKind::Condense => Ok(GenerationBackend::Condense(CondenseFramework::new(self.settings)?)),
            FrameworkKind::Vanilla => Ok(GenerationBackend::Vanilla(VanillaFramework::new(self.settings)?)),
        }
    }
}

/// Result of the family-polymorphic [`BackendSelector::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendHandle {
    Store(StoreSpec),
    Embedding(EmbeddingSpec),
    Generation(GenerationSpec),
}

/// Everything a conversation session needs, resolved up front.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPipeline {
    pub store: StoreSpec,
    pub embedding: EmbeddingSpec,
    pub generation: GenerationSpec,
}

#[derive(Debug, Clone)]
pub struct BackendSelector {
    defaults: DefaultsConfig,
    retrieval: RetrievalConfig,
}

impl BackendSelector {
    pub fn new(config: &Config) -> Self {
        Self {
            defaults: config.defaults.clone(),
            retrieval: config.retrieval.clone(),
        }
    }

    /// Resolve one backend of `family`. `kind = None` uses the configured default kind.
    pub fn resolve(
        &self,
        family: BackendFamily,
        kind: Option<&str>,
        params: &Params,
    ) -> RagResult<BackendHandle> {
        match family {
            BackendFamily::Store => self.resolve_store(kind, params).map(BackendHandle::Store),
            BackendFamily::Embedding => self
                .resolve_embedding(kind, params)
                .map(BackendHandle::Embedding),
            BackendFamily::Generation => self
                .resolve_generation(kind, params)
                .map(BackendHandle::Generation),
        }
    }

    pub fn resolve_store(&self, kind: Option<&str>, params: &Params) -> RagResult<StoreSpec> {
        let kind: StoreKind = kind.unwrap_or(self.defaults.store_kind.as_str()).parse()?;
        let merged = merge(self.defaults.store_defaults(kind.as_str()), params);
        let p = Required::new(BackendFamily::Store, kind.as_str(), &merged);

        match kind {
            StoreKind::Sqlite => Ok(StoreSpec::Sqlite {
                path: p.get("path")?.into(),
                collection: p.get("collection")?.to_string(),
            }),
            StoreKind::Postgres => Ok(StoreSpec::Postgres {
                host: p.get("host")?.to_string(),
                port: p.parse("port")?,
                user: p.get("user")?.to_string(),
                password: p.get("password")?.to_string(),
                database: p.get("database")?.to_string(),
                collection: p.get("collection")?.to_string(),
            }),
        }
    }

    pub fn resolve_embedding(&self, kind: Option<&str>, params: &Params) -> RagResult<EmbeddingSpec> {
        let kind: EmbeddingKind = kind.unwrap_or(self.defaults.embedding_kind.as_str()).parse()?;
        let merged = merge(self.defaults.embedding_defaults(kind.as_str()), params);
        let p = Required::new(BackendFamily::Embedding, kind.as_str(), &merged);

        let (base_url, api_key) = match kind {
            EmbeddingKind::OpenAi => (Some(p.get("base_url")?.to_string()), Some(p.get("api_key")?.to_string())),
            EmbeddingKind::Ollama => (Some(p.get("base_url")?.to_string()), None),
            EmbeddingKind::Local => (None, None),
        };

        Ok(EmbeddingSpec {
            kind,
            settings: EmbeddingSettings {
                model: p.get("model")?.to_string(),
                dims: p.parse("dims")?,
                base_url,
                api_key,
                batch_size: p.parse_or("batch_size", 64)?,
                max_retries: p.parse_or("max_retries", 3)?,
                timeout_secs: p.parse_or("timeout_secs", 30)?,
            },
        })
    }

    pub fn resolve_generation(&self, kind: Option<&str>, params: &Params) -> RagResult<GenerationSpec> {
        let kind: FrameworkKind = kind.unwrap_or(self.defaults.framework_kind.as_str()).parse()?;
        let merged = merge(self.defaults.generation_defaults(kind.as_str()), params);
        let p = Required::new(BackendFamily::Generation, kind.as_str(), &merged);

        Ok(GenerationSpec {
            kind,
            settings: GenerationSettings {
                model: p.get("model")?.to_string(),
                api_key: p.get("api_key")?.to_string(),
                base_url: p.get("base_url")?.to_string(),
                temperature: p.parse_or("temperature", 0.0)?,
                max_tokens: p.parse_or("max_tokens", 512)?,
                history_turns: self.retrieval.history_turns,
                timeout_secs: p.parse_opt("timeout_secs")?,
            },
        })
    }

    /// Resolve all three families from a client descriptor.
    pub fn resolve_pipeline(&self, d: &PipelineDescriptor) -> RagResult<ResolvedPipeline> {
        Ok(ResolvedPipeline {
            store: self.resolve_store(d.vectordb_type.as_deref(), &d.store_params())?,
            embedding: self.resolve_embedding(d.embedding_type.as_deref(), &d.embedding_params())?,
            generation: self
                .resolve_generation(d.llm_framework_type.as_deref(), &d.generation_params())?,
        })
    }

    /// Embedding for an ingestion request.
    ///
    /// An explicit `embeddingType` must resolve. Without one, the default
    /// kind is used when it is fully configured; otherwise `None`, and only
    /// pre-embedded documents can be written.
    pub fn resolve_upload_embedding(&self, d: &PipelineDescriptor) -> RagResult<Option<EmbeddingSpec>> {
        match d.embedding_type.as_deref() {
            Some(kind) => self.resolve_embedding(Some(kind), &d.embedding_params()).map(Some),
            None => match self.resolve_embedding(None, &d.embedding_params()) {
                Ok(spec) => Ok(Some(spec)),
                Err(RagError::MissingConfiguration { key, .. }) => {
                    tracing::debug!(key = %key, "default embedding not configured; expecting pre-embedded documents");
                    Ok(None)
                }
                Err(e) => Err(e),
            },
        }
    }

    pub fn top_k(&self) -> usize {
        self.retrieval.top_k
    }
}

/// Caller values over defaults; empty caller values do not clear defaults.
fn merge(mut defaults: Params, caller: &Params) -> Params {
    for (k, v) in caller {
        if !v.trim().is_empty() {
            defaults.insert(k.clone(), v.clone());
        }
    }
    defaults
}

struct Required<'a> {
    family: BackendFamily,
    kind: &'a str,
    params: &'a Params,
}

impl<'a> Required<'a> {
    fn new(family: BackendFamily, kind: &'a str, params: &'a Params) -> Self {
        Self {
            family,
            kind,
            params,
        }
    }

    fn get(&self, key: &str) -> RagResult<&'a str> {
        self.params
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| RagError::MissingConfiguration {
                family: self.family,
                key: key.to_string(),
            })
    }

    fn parse<T: FromStr>(&self, key: &str) -> RagResult<T> {
        let raw = self.get(key)?;
        raw.trim().parse().map_err(|_| {
            RagError::connection(self.kind, format!("invalid value for '{}': '{}'", key, raw))
        })
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> RagResult<T> {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn parse_opt<T: FromStr>(&self, key: &str) -> RagResult<Option<T>> {
        match self.params.get(key).filter(|v| !v.trim().is_empty()) {
            Some(_) => self.parse(key).map(Some),
            None => Ok(None),
        }
    }
}
