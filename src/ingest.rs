//! File ingestion adapters: raw text and CSV into [`Document`]s.
//!
//! Text files are chunked on paragraph boundaries (see [`crate::chunk`]);
//! chunk `i` of `sermon.txt` becomes document `sermon_i`.
//!
//! CSV files carry one document per row with columns
//! `id, text, label, links, medialinks`. The header row is optional and is
//! recognised by a first field equal to `id`. Link columns hold URLs
//! separated by commas or whitespace.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::str::FromStr;

use crate::chunk::chunk_text;
use crate::error::{RagError, RagResult};
use crate::models::{Document, DEFAULT_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CsvDelimiter {
    #[default]
    Comma,
    Tab,
}

impl CsvDelimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            CsvDelimiter::Comma => b',',
            CsvDelimiter::Tab => b'\t',
        }
    }
}

impl FromStr for CsvDelimiter {
    type Err = RagError;

    fn from_str(s: &str) -> RagResult<Self> {
        if s == "\t" {
            return Ok(CsvDelimiter::Tab);
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "comma" | "," => Ok(CsvDelimiter::Comma),
            "tab" | "\t" => Ok(CsvDelimiter::Tab),
            other => Err(RagError::InvalidRequest(format!(
                "unknown column delimiter '{}': use comma or tab",
                other
            ))),
        }
    }
}

/// Name used as the document id prefix: the file name without its extension.
pub fn document_prefix(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document")
        .to_string()
}

/// Chunk a text file into labelled documents.
pub fn text_to_documents(
    file_name: &str,
    text: &str,
    label: &str,
    max_chars: usize,
) -> RagResult<Vec<Document>> {
    let prefix = document_prefix(file_name);
    let label = if label.trim().is_empty() {
        DEFAULT_LABEL
    } else {
        label.trim()
    };

    let docs: Vec<Document> = chunk_text(text, max_chars)
        .into_iter()
        .map(|chunk| {
            let mut metadata = Map::new();
            metadata.insert("sourceFile".into(), Value::String(file_name.to_string()));
            metadata.insert("chunkIndex".into(), Value::from(chunk.index));
            metadata.insert("hash".into(), Value::String(chunk.hash));
            Document {
                metadata,
                ..Document::new(format!("{}_{}", prefix, chunk.index), chunk.text)
                    .with_label(label)
            }
        })
        .collect();

    if docs.is_empty() {
        return Err(RagError::InvalidRequest(format!(
            "'{}' contains no text",
            file_name
        )));
    }
    Ok(docs)
}

/// Split a link cell on commas and whitespace.
pub fn split_links(cell: &str) -> Vec<String> {
    cell.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse CSV rows `id, text, label, links, medialinks` into documents.
pub fn csv_to_documents(data: &[u8], delimiter: CsvDelimiter) -> RagResult<Vec<Document>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter.as_byte())
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let mut docs = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let line = row + 1;
        let record = record
            .map_err(|e| RagError::InvalidRequest(format!("CSV row {}: {}", line, e)))?;

        if row == 0 && record.get(0).is_some_and(|f| f.eq_ignore_ascii_case("id")) {
            continue;
        }

        let field = |i: usize| record.get(i).unwrap_or("");
        let id = field(0);
        let text = field(1);
        if id.is_empty() || text.is_empty() {
            return Err(RagError::InvalidRequest(format!(
                "CSV row {}: id and text are required",
                line
            )));
        }

        let label = match field(2) {
            "" => DEFAULT_LABEL,
            l => l,
        };

        let mut doc = Document::new(id, text)
            .with_label(label)
            .with_links(split_links(field(3)));
        doc.media = split_links(field(4));
        docs.push(doc);
    }

    if docs.is_empty() {
        return Err(RagError::InvalidRequest("CSV file has no rows".into()));
    }
    Ok(docs)
}
