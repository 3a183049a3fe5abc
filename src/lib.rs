//! # Assistant RAG
//!
//! A conversational retrieval-augmented-generation backend.
//!
//! Clients upload labelled documents, then open a WebSocket chat session.
//! Each question is answered by a language model grounded in the most
//! similar stored documents, and the answer carries the links of the
//! documents it used. The vector store, embedding provider, and generation
//! framework are chosen per request from a closed set of kinds.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Uploads   │──▶│  Embedding   │──▶│ Vector store │
//! │ JSON/Text/ │   │ OpenAI/Ollama│   │ SQLite / PG  │
//! │    CSV     │   │   /local     │   └──────┬───────┘
//! └────────────┘   └──────────────┘          │ top-k
//!                                            ▼
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ WebSocket  │◀─▶│ Conversation │──▶│  Generation  │
//! │   /chat    │   │   pipeline   │   │ condense/    │
//! └────────────┘   └──────────────┘   │ vanilla      │
//!                                     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! arag init                                     # create the default collection
//! arag upload sermon.txt --label bible          # ingest a text file
//! arag serve                                    # start HTTP + WebSocket server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment defaults |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Documents and wire messages |
//! | [`selector`] | Backend kinds and descriptor resolution |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | Vector store contract and backends |
//! | [`generation`] | Generation frameworks |
//! | [`auth`] | Access gate and identity providers |
//! | [`chunk`] | Text chunking |
//! | [`ingest`] | Text and CSV ingestion adapters |
//! | [`jobs`] | Ingestion job tracking |
//! | [`pipeline`] | Upload and conversation pipelines |
//! | [`server`] | HTTP and WebSocket server |

pub mod auth;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod selector;
pub mod server;
pub mod store;
