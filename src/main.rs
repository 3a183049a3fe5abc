//! # Assistant RAG CLI (`arag`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `arag serve` | Start the HTTP + WebSocket server |
//! | `arag init` | Create the default store's collection schema |
//! | `arag labels` | Print the labels stored in the default store |
//! | `arag upload <file>` | Ingest a text or CSV file into the default store |
//!
//! ## Examples
//!
//! ```bash
//! arag --config ./config/assistant.toml serve
//! arag upload ./data/bible.csv --format csv --delimiter tab
//! arag upload ./sermons/easter.txt --label sermons --embedding ollama
//! ```
//!
//! Without `--config`, built-in defaults and environment variables are used.
//! A `.env` file in the working directory is loaded first.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use assistant_rag::config::{self, Config, Params};
use assistant_rag::ingest::CsvDelimiter;
use assistant_rag::pipeline::DataUploadPipeline;
use assistant_rag::selector::{BackendSelector, PipelineDescriptor};
use assistant_rag::server;
use assistant_rag::store::{StoreBackend, VectorStore};

#[derive(Parser)]
#[command(
    name = "arag",
    about = "Assistant RAG: conversational retrieval-augmented generation backend",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server.
    Serve,

    /// Create the default store's schema. Safe to run repeatedly.
    Init,

    /// Print the distinct labels in the default store.
    Labels,

    /// Ingest a file through the upload pipeline.
    Upload {
        file: PathBuf,

        /// Label for text files (CSV rows carry their own).
        #[arg(long, default_value = "")]
        label: String,

        /// File format; inferred from the extension when omitted.
        #[arg(long, value_enum)]
        format: Option<UploadFormat>,

        /// CSV column delimiter: comma or tab.
        #[arg(long, default_value = "comma")]
        delimiter: String,

        /// Embedding kind (openai, ollama, local). Defaults to the configured kind.
        #[arg(long)]
        embedding: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum UploadFormat {
    Text,
    Csv,
}

fn load(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => Ok(Config::from_env()),
    }
}

async fn open_default_store(cfg: &Config) -> anyhow::Result<StoreBackend> {
    let selector = BackendSelector::new(cfg);
    let spec = selector.resolve_store(None, &Params::new())?;
    let store = StoreBackend::open(&spec, None)
        .await
        .with_context(|| format!("Failed to open {} collection", spec.collection()))?;
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("assistant_rag=info,arag=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Init => {
            let store = open_default_store(&cfg).await?;
            store.flush().await?;
            println!("Store initialized ({}).", store.kind());
        }
        Commands::Labels => {
            let store = open_default_store(&cfg).await?;
            for label in store.list_labels().await? {
                println!("{}", label);
            }
        }
        Commands::Upload {
            file,
            label,
            format,
            delimiter,
            embedding,
        } => {
            let format = format.unwrap_or_else(|| {
                match file.extension().and_then(|e| e.to_str()) {
                    Some(ext) if ext.eq_ignore_ascii_case("csv") || ext.eq_ignore_ascii_case("tsv") => {
                        UploadFormat::Csv
                    }
                    _ => UploadFormat::Text,
                }
            });
            let descriptor = PipelineDescriptor {
                embedding_type: embedding,
                ..PipelineDescriptor::default()
            };
            let selector = BackendSelector::new(&cfg);
            let pipeline = DataUploadPipeline::from_descriptor(&selector, &descriptor).await?;

            let count = match format {
                UploadFormat::Text => {
                    let text = std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))?;
                    let name = file
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("upload.txt");
                    pipeline
                        .add_text_file(name, &text, &label, cfg.retrieval.chunk_max_chars)
                        .await?
                }
                UploadFormat::Csv => {
                    let data = std::fs::read(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))?;
                    let delimiter: CsvDelimiter = delimiter.parse()?;
                    pipeline.add_csv_file(&data, delimiter).await?
                }
            };
            println!("Uploaded {} documents from {}.", count, file.display());
        }
    }

    Ok(())
}
