//! Generation backends: retrieve context, call the language model, cite sources.
//!
//! Both frameworks speak the OpenAI-compatible chat protocol through
//! [`openai::ChatClient`] and differ only in how history reaches the model:
//!
//! - **condense** rewrites the follow-up question into a standalone one
//!   (first call), retrieves with the rewritten question, then answers it
//!   (second call). With no history the rewrite step is skipped.
//! - **vanilla** retrieves with the raw question and sends recent history
//!   as alternating user/assistant messages in a single call.
//!
//! Every failure, including a retrieval failure, surfaces as
//! [`RagError::GenerationBackendError`]. Nothing is retried here.

pub mod openai;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::{RagError, RagResult};
use crate::models::{ChatTurn, Document};
use crate::store::VectorStore;
use openai::{ChatClient, ChatMessage};

const QA_SYSTEM_PROMPT: &str = "Use the following pieces of context to answer the user's question. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

const CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language.";

/// Where and how much to retrieve for one turn.
#[derive(Clone, Copy)]
pub struct RetrievalSource<'a> {
    pub store: &'a dyn VectorStore,
    /// `None` searches every label.
    pub labels: Option<&'a BTreeSet<String>>,
    pub top_k: usize,
}

/// Answer text plus the documents that were placed in the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub answer: String,
    pub used_documents: Vec<Document>,
}

impl Generation {
    /// Links of the used documents, first occurrence order, duplicates removed.
    pub fn sources(&self) -> Vec<String> {
        dedup(self.used_documents.iter().flat_map(|d| d.links.iter()))
    }

    pub fn media(&self) -> Vec<String> {
        dedup(self.used_documents.iter().flat_map(|d| d.media.iter()))
    }
}

fn dedup<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .filter(|s| seen.insert(s.to_string()))
        .cloned()
        .collect()
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn generate(
        &self,
        question: &str,
        history: &[ChatTurn],
        source: RetrievalSource<'_>,
    ) -> RagResult<Generation>;
}

/// Provider settings resolved by the selector.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Most recent turns forwarded to the model.
    pub history_turns: usize,
    /// Per-call timeout; `None` means generation calls are not bounded.
    pub timeout_secs: Option<u64>,
}

/// Closed set of generation frameworks.
pub enum GenerationBackend {
    Condense(CondenseFramework),
    Vanilla(VanillaFramework),
}

#[async_trait]
impl Generator for GenerationBackend {
    fn kind(&self) -> &'static str {
        match self {
            GenerationBackend::Condense(g) => g.kind(),
            GenerationBackend::Vanilla(g) => g.kind(),
        }
    }

    async fn generate(
        &self,
        question: &str,
        history: &[ChatTurn],
        source: RetrievalSource<'_>,
    ) -> RagResult<Generation> {
        match self {
            GenerationBackend::Condense(g) => g.generate(question, history, source).await,
            GenerationBackend::Vanilla(g) => g.generate(question, history, source).await,
        }
    }
}

fn recent(history: &[ChatTurn], n: usize) -> &[ChatTurn] {
    &history[history.len().saturating_sub(n)..]
}

async fn retrieve(source: RetrievalSource<'_>, query: &str) -> RagResult<Vec<Document>> {
    source
        .store
        .similarity_search(query, source.labels, source.top_k)
        .await
        .map_err(|e| match e {
            RagError::GenerationBackendError { .. } => e,
            other => RagError::generation(None, format!("retrieval failed: {}", other)),
        })
}

fn context_prompt(docs: &[Document]) -> String {
    let context = docs
        .iter()
        .map(|d| d.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{}\n\n----------------\n{}", QA_SYSTEM_PROMPT, context)
}

pub struct CondenseFramework {
    client: ChatClient,
    settings: GenerationSettings,
}

impl CondenseFramework {
    pub fn new(settings: GenerationSettings) -> RagResult<Self> {
        let client = ChatClient::new(&settings.base_url, &settings.api_key, settings.timeout_secs)?;
        Ok(Self { client, settings })
    }

    async fn standalone_question(&self, question: &str, history: &[ChatTurn]) -> RagResult<String> {
        let turns = recent(history, self.settings.history_turns);
        if turns.is_empty() {
            return Ok(question.to_string());
        }

        let transcript = turns
            .iter()
            .map(|t| format!("Human: {}\nAssistant: {}", t.question, t.answer))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{}\n\nChat History:\n{}\nFollow Up Input: {}\nStandalone question:",
            CONDENSE_PROMPT, transcript, question
        );

        let rewritten = self
            .client
            .chat_completion(
                &[ChatMessage::user(prompt)],
                &self.settings.model,
                0.0,
                self.settings.max_tokens,
            )
            .await?;
        Ok(rewritten.trim().to_string())
    }
}

#[async_trait]
impl Generator for CondenseFramework {
    fn kind(&self) -> &'static str {
        "openai-condense"
    }

    async fn generate(
        &self,
        question: &str,
        history: &[ChatTurn],
        source: RetrievalSource<'_>,
    ) -> RagResult<Generation> {
        let standalone = self.standalone_question(question, history).await?;
        tracing::debug!(question, standalone = %standalone, "condensed question");

        let docs = retrieve(source, &standalone).await?;
        let messages = vec![
            ChatMessage::system(context_prompt(&docs)),
            ChatMessage::user(standalone),
        ];
        let answer = self
            .client
            .chat_completion(
                &messages,
                &self.settings.model,
                self.settings.temperature,
                self.settings.max_tokens,
            )
            .await?;

        Ok(Generation {
            answer,
            used_documents: docs,
        })
    }
}

pub struct VanillaFramework {
    client: ChatClient,
    settings: GenerationSettings,
}

impl VanillaFramework {
    pub fn new(settings: GenerationSettings) -> RagResult<Self> {
        let client = ChatClient::new(&settings.base_url, &settings.api_key, settings.timeout_secs)?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl Generator for VanillaFramework {
    fn kind(&self) -> &'static str {
        "openai-vanilla"
    }

    async fn generate(
        &self,
        question: &str,
        history: &[ChatTurn],
        source: RetrievalSource<'_>,
    ) -> RagResult<Generation> {
        let docs = retrieve(source, question).await?;

        let mut messages = vec![ChatMessage::system(context_prompt(&docs))];
        for turn in recent(history, self.settings.history_turns) {
            messages.push(ChatMessage::user(turn.question.clone()));
            messages.push(ChatMessage::assistant(turn.answer.clone()));
        }
        messages.push(ChatMessage::user(question));

        let answer = self
            .client
            .chat_completion(
                &messages,
                &self.settings.model,
                self.settings.temperature,
                self.settings.max_tokens,
            )
            .await?;

        Ok(Generation {
            answer,
            used_documents: docs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use httpmock::prelude::*;
    use serde_json::json;

    struct CannedStore(Vec<Document>);

    #[async_trait]
    impl VectorStore for CannedStore {
        fn kind(&self) -> &'static str {
            "canned"
        }
        async fn add_documents(&self, _docs: Vec<Document>) -> RagResult<()> {
            Ok(())
        }
        async fn similarity_search(
            &self,
            _query: &str,
            _labels: Option<&BTreeSet<String>>,
            top_k: usize,
        ) -> RagResult<Vec<Document>> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
        async fn list_labels(&self) -> RagResult<BTreeSet<String>> {
            Ok(BTreeSet::new())
        }
        async fn flush(&self) -> RagResult<()> {
            Ok(())
        }
    }

    fn settings(base_url: String) -> GenerationSettings {
        GenerationSettings {
            model: "gpt-3.5-turbo".into(),
            api_key: "sk-test".into(),
            base_url,
            temperature: 0.0,
            max_tokens: 64,
            history_turns: 2,
            timeout_secs: None,
        }
    }

    fn store() -> CannedStore {
        CannedStore(vec![
            Document::new("D1", "Jesus is the Son of God")
                .with_links(vec!["https://example.org/john".into()]),
            Document::new("D2", "In the beginning was the Word")
                .with_links(vec!["https://example.org/john".into(), "https://example.org/gen".into()]),
        ])
    }

    #[test]
    fn test_sources_dedup_in_order() {
        let g = Generation {
            answer: "x".into(),
            used_documents: store().0,
        };
        assert_eq!(
            g.sources(),
            vec!["https://example.org/john".to_string(), "https://example.org/gen".to_string()]
        );
    }

    #[test]
    fn test_recent_keeps_tail() {
        let h = vec![ChatTurn::new("q1", "a1"), ChatTurn::new("q2", "a2"), ChatTurn::new("q3", "a3")];
        assert_eq!(recent(&h, 2)[0].question, "q2");
        assert_eq!(recent(&h, 10).len(), 3);
        assert!(recent(&h, 0).is_empty());
    }

    #[tokio::test]
    async fn test_vanilla_single_call_with_history() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions").is_true(|req| {
                let body = String::from_utf8_lossy(req.body().as_ref());
                body.contains("Who was Moses?") && body.contains("Son of God")
            });
            then.status(200).json_body(json!({
                "choices": [ { "message": { "role": "assistant", "content": "The Son of God." } } ]
            }));
        });

        let framework = VanillaFramework::new(settings(server.base_url())).unwrap();
        let store = store();
        let history = vec![ChatTurn::new("Who was Moses?", "A prophet.")];
        let out = framework
            .generate(
                "Who is Jesus?",
                &history,
                RetrievalSource {
                    store: &store,
                    labels: None,
                    top_k: 1,
                },
            )
            .await
            .unwrap();

        assert_eq!(out.answer, "The Son of God.");
        assert_eq!(out.used_documents.len(), 1);
        assert_eq!(out.used_documents[0].doc_id, "D1");
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_condense_skips_rewrite_without_history() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [ { "message": { "role": "assistant", "content": "answer" } } ]
            }));
        });

        let framework = CondenseFramework::new(settings(server.base_url())).unwrap();
        let store = store();
        framework
            .generate(
                "Who is Jesus?",
                &[],
                RetrievalSource {
                    store: &store,
                    labels: None,
                    top_k: 2,
                },
            )
            .await
            .unwrap();
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_condense_two_calls_with_history() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [ { "message": { "role": "assistant", "content": "Who is Jesus?" } } ]
            }));
        });

        let framework = CondenseFramework::new(settings(server.base_url())).unwrap();
        let store = store();
        let history = vec![ChatTurn::new("Tell me about Jesus", "He taught in Galilee.")];
        framework
            .generate(
                "Who is he?",
                &history,
                RetrievalSource {
                    store: &store,
                    labels: None,
                    top_k: 2,
                },
            )
            .await
            .unwrap();
        mock.assert_calls(2);
    }

    #[tokio::test]
    async fn test_provider_error_is_generation_error() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(500).body("upstream down");
        });

        let framework = VanillaFramework::new(settings(server.base_url())).unwrap();
        let store = store();
        let err = framework
            .generate(
                "Who is Jesus?",
                &[],
                RetrievalSource {
                    store: &store,
                    labels: None,
                    top_k: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RagError::GenerationBackendError { status: Some(500), .. }
        ));
    }
}
