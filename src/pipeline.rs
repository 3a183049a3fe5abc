//! Pipelines that bind resolved backends to work.
//!
//! [`DataUploadPipeline`] wraps one vector store for one-shot ingestion.
//! [`ConversationPipeline`] owns one chat session: its store, its generation
//! backend, and its growing history. The session moves through
//!
//! ```text
//! Constructed --set_vectordb + set_llm_framework--> Ready --run--> Active --disconnect--> Closed
//! ```
//!
//! and flushes its store exactly once on the way to `Closed`.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::{RagError, RagResult};
use crate::generation::{Generation, Generator, RetrievalSource};
use crate::ingest::{csv_to_documents, text_to_documents, CsvDelimiter};
use crate::models::{BotResponse, ChatTurn, Document};
use crate::selector::{BackendSelector, PipelineDescriptor};
use crate::store::{StoreBackend, VectorStore};

/// Reply sent when a single turn fails.
pub const TURN_FAILED_MESSAGE: &str = "Sorry, something went wrong. Try again.";

/// Resolve and open the store named by `descriptor`, with its embedder attached.
pub async fn open_store(
    selector: &BackendSelector,
    descriptor: &PipelineDescriptor,
    embedding_required: bool,
) -> RagResult<StoreBackend> {
    let store_spec =
        selector.resolve_store(descriptor.vectordb_type.as_deref(), &descriptor.store_params())?;
    let embedding_spec = if embedding_required {
        Some(selector.resolve_embedding(
            descriptor.embedding_type.as_deref(),
            &descriptor.embedding_params(),
        )?)
    } else {
        selector.resolve_upload_embedding(descriptor)?
    };

    let embedder: Option<Arc<dyn Embedder>> = match embedding_spec {
        Some(spec) => Some(Arc::new(spec.build()?)),
        None => None,
    };
    StoreBackend::open(&store_spec, embedder).await
}

// ============ Data upload ============

#[derive(Default)]
pub struct DataUploadPipeline {
    vectordb: Option<Arc<dyn VectorStore>>,
}

impl DataUploadPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_vectordb(&mut self, store: Arc<dyn VectorStore>) {
        self.vectordb = Some(store);
    }

    /// Resolve the descriptor and open its store.
    pub async fn from_descriptor(
        selector: &BackendSelector,
        descriptor: &PipelineDescriptor,
    ) -> RagResult<Self> {
        let store = open_store(selector, descriptor, false).await?;
        let mut pipeline = Self::new();
        pipeline.set_vectordb(Arc::new(store));
        Ok(pipeline)
    }

    fn store(&self) -> RagResult<&dyn VectorStore> {
        self.vectordb
            .as_deref()
            .ok_or_else(|| RagError::InvalidRequest("no vector store attached".into()))
    }

    /// Write a batch and flush. Returns the number of documents written.
    pub async fn add_documents(&self, docs: Vec<Document>) -> RagResult<usize> {
        let store = self.store()?;
        let count = docs.len();
        store.add_documents(docs).await?;
        store.flush().await?;
        Ok(count)
    }

    pub async fn add_text_file(
        &self,
        file_name: &str,
        text: &str,
        label: &str,
        max_chars: usize,
    ) -> RagResult<usize> {
        let docs = text_to_documents(file_name, text, label, max_chars)?;
        self.add_documents(docs).await
    }

    pub async fn add_csv_file(&self, data: &[u8], delimiter: CsvDelimiter) -> RagResult<usize> {
        let docs = csv_to_documents(data, delimiter)?;
        self.add_documents(docs).await
    }

    pub async fn labels(&self) -> RagResult<BTreeSet<String>> {
        self.store()?.list_labels().await
    }
}

// ============ Conversation ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Ready,
    Active,
    Closed,
}

/// What the chat channel yielded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Question(String),
    Disconnected,
    /// A frame that is not a text question.
    Malformed(String),
}

/// The client side of a chat session.
#[async_trait]
pub trait ChatChannel: Send {
    async fn recv(&mut self) -> Inbound;

    /// Push one message; an error means the client is gone.
    async fn send(&mut self, message: &BotResponse) -> RagResult<()>;
}

pub struct ConversationPipeline {
    session_id: Uuid,
    user: String,
    label: String,
    /// Retrieval filter; `None` searches every label.
    labels: Option<BTreeSet<String>>,
    top_k: usize,
    state: SessionState,
    vectordb: Option<Arc<dyn VectorStore>>,
    llm_framework: Option<Arc<dyn Generator>>,
    pub chat_history: Vec<ChatTurn>,
}

impl ConversationPipeline {
    pub fn new(user: impl Into<String>, label: impl Into<String>, top_k: usize) -> Self {
        let label = label.into();
        Self {
            session_id: Uuid::new_v4(),
            user: user.into(),
            labels: Some(BTreeSet::from([label.clone()])),
            label,
            top_k: top_k.max(1),
            state: SessionState::Constructed,
            vectordb: None,
            llm_framework: None,
            chat_history: Vec::new(),
        }
    }

    /// Replace the retrieval filter (e.g. the session label narrowed by permissions).
    pub fn with_label_filter(mut self, labels: Option<BTreeSet<String>>) -> Self {
        self.labels = labels;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_vectordb(&mut self, store: Arc<dyn VectorStore>) -> RagResult<()> {
        self.ensure_configurable()?;
        self.vectordb = Some(store);
        self.refresh_ready();
        Ok(())
    }

    pub fn set_llm_framework(&mut self, framework: Arc<dyn Generator>) -> RagResult<()> {
        self.ensure_configurable()?;
        self.llm_framework = Some(framework);
        self.refresh_ready();
        Ok(())
    }

    fn ensure_configurable(&self) -> RagResult<()> {
        match self.state {
            SessionState::Constructed | SessionState::Ready => Ok(()),
            other => Err(RagError::InvalidRequest(format!(
                "cannot rebind backends of a session in state {:?}",
                other
            ))),
        }
    }

    fn refresh_ready(&mut self) {
        if self.vectordb.is_some() && self.llm_framework.is_some() {
            self.state = SessionState::Ready;
        }
    }

    /// Resolve the descriptor, open every backend, and return a ready session.
    ///
    /// Nothing is left half-wired: any failure drops what was opened.
    pub async fn from_descriptor(
        selector: &BackendSelector,
        descriptor: &PipelineDescriptor,
        user: &str,
        label: &str,
    ) -> RagResult<Self> {
        let resolved = selector.resolve_pipeline(descriptor)?;
        let generator = resolved.generation.build()?;
        let embedder: Arc<dyn Embedder> = Arc::new(resolved.embedding.build()?);
        let store = StoreBackend::open(&resolved.store, Some(embedder)).await?;

        let mut pipeline = Self::new(user, label, selector.top_k());
        pipeline.set_vectordb(Arc::new(store))?;
        pipeline.set_llm_framework(Arc::new(generator))?;
        Ok(pipeline)
    }

    /// One question/answer turn. History grows only on success.
    pub async fn ask(&mut self, question: &str) -> RagResult<Generation> {
        let (Some(store), Some(llm)) = (self.vectordb.as_deref(), self.llm_framework.as_deref())
        else {
            return Err(RagError::InvalidRequest("session has no backends attached".into()));
        };

        let source = RetrievalSource {
            store,
            labels: self.labels.as_ref(),
            top_k: self.top_k,
        };
        let generation = llm.generate(question, &self.chat_history, source).await?;
        self.chat_history
            .push(ChatTurn::new(question, generation.answer.clone()));
        Ok(generation)
    }

    /// Serve the receive/respond loop until the channel ends, then close.
    pub async fn run<C: ChatChannel>(&mut self, channel: &mut C) -> RagResult<()> {
        if self.state != SessionState::Ready {
            return Err(RagError::InvalidRequest(format!(
                "session must be ready to run, is {:?}",
                self.state
            )));
        }
        self.state = SessionState::Active;
        tracing::info!(session = %self.session_id, user = %self.user, label = %self.label, "chat session active");

        loop {
            let question = match channel.recv().await {
                Inbound::Question(q) => q,
                Inbound::Disconnected => {
                    tracing::info!(session = %self.session_id, "chat client disconnected");
                    break;
                }
                Inbound::Malformed(why) => {
                    tracing::warn!(session = %self.session_id, reason = %why, "malformed chat frame");
                    break;
                }
            };

            let reply = match self.ask(&question).await {
                Ok(generation) => {
                    tracing::debug!(
                        session = %self.session_id,
                        sources = generation.used_documents.len(),
                        "turn answered"
                    );
                    BotResponse::answer(
                        generation.answer.clone(),
                        generation.sources(),
                        generation.media(),
                    )
                }
                Err(e) => {
                    tracing::warn!(session = %self.session_id, error = %e, code = e.error_code(), "turn failed");
                    BotResponse::error(TURN_FAILED_MESSAGE)
                }
            };

            if channel.send(&reply).await.is_err() {
                tracing::info!(session = %self.session_id, "chat client gone before reply");
                break;
            }
        }

        self.close().await
    }

    /// Move to `Closed` and flush the store. Later calls do nothing.
    pub async fn close(&mut self) -> RagResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        if let Some(store) = self.vectordb.as_deref() {
            store.flush().await.inspect_err(|e| {
                tracing::error!(session = %self.session_id, error = %e, "store flush failed");
            })?;
        }
        tracing::info!(session = %self.session_id, turns = self.chat_history.len(), "chat session closed");
        Ok(())
    }
}
