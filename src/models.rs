//! Core data models exchanged between clients, pipelines, and backends.
//!
//! [`Document`] is the unit of stored knowledge. [`BotResponse`] is the
//! message shape pushed over the chat channel. Field names on the wire
//! stay camelCase because that is what existing clients send.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Label applied to documents uploaded without one.
pub const DEFAULT_LABEL: &str = "open-access";

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

/// A piece of text plus the metadata needed to cite and filter it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Caller-assigned unique identifier.
    #[serde(rename = "docId")]
    pub doc_id: String,
    pub text: String,
    /// Precomputed vector; filled in by the embedding backend when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Access/retrieval domain.
    #[serde(default = "default_label")]
    pub label: String,
    /// Citeable source URLs.
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            text: text.into(),
            embedding: None,
            label: default_label(),
            links: Vec::new(),
            media: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_links(mut self, links: Vec<String>) -> Self {
        self.links = links;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// One completed question/answer exchange in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub question: String,
    pub answer: String,
}

impl ChatTurn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderType {
    #[serde(rename = "You")]
    User,
    #[serde(rename = "Bot")]
    Bot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Question,
    Answer,
    Error,
}

/// Message pushed from the server over the duplex chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotResponse {
    pub sender: SenderType,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub media: Vec<String>,
}

impl BotResponse {
    pub fn answer(message: impl Into<String>, sources: Vec<String>, media: Vec<String>) -> Self {
        Self {
            sender: SenderType::Bot,
            message: message.into(),
            kind: ResponseType::Answer,
            sources,
            media,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            sender: SenderType::Bot,
            message: message.into(),
            kind: ResponseType::Error,
            sources: Vec::new(),
            media: Vec::new(),
        }
    }
}

/// Acknowledgement body for successful requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiInfoResponse {
    pub message: String,
    #[serde(rename = "jobId", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
}

/// Structured error body: `{ "error": ..., "details": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub details: String,
}
