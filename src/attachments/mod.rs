//! Attachment classification and extraction.

pub mod classify;
pub mod extractors;
pub mod pipeline;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use classify::{
    Classification, FilenameSanitizer, classify, decode_encoded_words, extension_for_mime,
    extension_of,
};
pub use extractors::{Extracted, Extractor};
pub use pipeline::AttachmentPipeline;

use crate::config::{env_or, env_secs};
use crate::error::ConfigError;

/// Which handler family processes an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorFamily {
    /// pdf, doc, docx
    Document,
    /// xls, xlsx, csv
    Spreadsheet,
    /// png, jpg, jpeg (OCR)
    Image,
    /// txt
    Text,
}

impl ExtractorFamily {
    /// Family for a lowercase extension without the dot.
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" | "doc" | "docx" => Some(Self::Document),
            "xls" | "xlsx" | "csv" => Some(Self::Spreadsheet),
            "png" | "jpg" | "jpeg" => Some(Self::Image),
            "txt" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Spreadsheet => "spreadsheet",
            Self::Image => "image",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for ExtractorFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Ok,
    /// Unsupported extension; logged, not a failure.
    Skipped,
    Error,
}

/// Per-attachment extraction output, persisted under `extracted/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub filename: String,
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<ExtractorFamily>,
    pub status: ExtractionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionRecord {
    /// Whether the attachment counts as processed for acknowledgment.
    pub fn succeeded(&self) -> bool {
        self.status != ExtractionStatus::Error
    }
}

/// External command lines and limits for the extractor families.
///
/// Commands are whitespace-separated; the `{input}` token is replaced by the
/// attachment path. The rasterizer also gets `{output}`, a path prefix for the
/// page images it writes when a pdf has no text layer.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub pdf_command: String,
    pub pdf_raster_command: String,
    pub word_command: String,
    pub ocr_command: String,
    pub timeout: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            pdf_command: "pdftotext -layout {input} -".into(),
            pdf_raster_command: "pdftoppm -r 300 -png {input} {output}".into(),
            word_command: "pandoc -t plain {input}".into(),
            ocr_command: "tesseract {input} stdout".into(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl ExtractionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            pdf_command: env_or("INTAKE_PDF_COMMAND", &defaults.pdf_command),
            pdf_raster_command: env_or("INTAKE_PDF_RASTER_COMMAND", &defaults.pdf_raster_command),
            word_command: env_or("INTAKE_WORD_COMMAND", &defaults.word_command),
            ocr_command: env_or("INTAKE_OCR_COMMAND", &defaults.ocr_command),
            timeout: env_secs("INTAKE_EXTRACT_TIMEOUT_SECS", defaults.timeout.as_secs())?,
        })
    }
}
