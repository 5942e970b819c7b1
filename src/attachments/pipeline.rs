//! Per-attachment dispatch, extraction, and output placement.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info, warn};

use super::extractors::{
    CommandTemplate, DocumentExtractor, Extractor, ImageExtractor, ScannedPdf,
    SpreadsheetExtractor, TextExtractor,
};
use super::{ExtractionConfig, ExtractionRecord, ExtractionStatus, ExtractorFamily};
use crate::bundle::Bundle;
use crate::error::ConfigError;

/// Routes each attachment to its family's extractor.
pub struct AttachmentPipeline {
    extractors: HashMap<ExtractorFamily, Arc<dyn Extractor>>,
}

impl AttachmentPipeline {
    /// Pipeline with no extractors; every attachment is skipped.
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Standard extractors configured from `config`.
    pub fn new(config: &ExtractionConfig) -> Result<Self, ConfigError> {
        let template = |key: &str, line: &str| {
            CommandTemplate::parse(line).ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: "empty command".into(),
            })
        };
        let pdf = template("INTAKE_PDF_COMMAND", &config.pdf_command)?;
        let raster = template("INTAKE_PDF_RASTER_COMMAND", &config.pdf_raster_command)?;
        let word = template("INTAKE_WORD_COMMAND", &config.word_command)?;
        let ocr = template("INTAKE_OCR_COMMAND", &config.ocr_command)?;
        let documents = DocumentExtractor::new(pdf, word, config.timeout)
            .with_scanned_pdf(ScannedPdf::new(raster, ocr.clone()));

        Ok(Self::empty()
            .with_extractor(Arc::new(documents))
            .with_extractor(Arc::new(SpreadsheetExtractor))
            .with_extractor(Arc::new(ImageExtractor::new(ocr, config.timeout)))
            .with_extractor(Arc::new(TextExtractor)))
    }

    /// Register (or replace) the extractor for its family.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.insert(extractor.family(), extractor);
        self
    }

    /// Extract one file. Never fails: unsupported extensions produce a
    /// `skipped` record, extractor errors and panics an `error` record.
    pub async fn extract(&self, path: &Path, extension: &str) -> ExtractionRecord {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();

        let mut record = ExtractionRecord {
            filename,
            extension: extension.clone(),
            family: None,
            status: ExtractionStatus::Skipped,
            content: None,
            metadata: serde_json::Value::Null,
            error: None,
        };

        let Some(family) = ExtractorFamily::for_extension(&extension) else {
            warn!(file = %record.filename, extension = %extension, "Unsupported file format, skipping");
            return record;
        };
        record.family = Some(family);

        let Some(extractor) = self.extractors.get(&family) else {
            warn!(file = %record.filename, family = %family, "No extractor registered, skipping");
            return record;
        };

        let outcome = AssertUnwindSafe(extractor.extract(path, &extension))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(extracted)) => {
                record.status = ExtractionStatus::Ok;
                record.content = Some(extracted.content);
                record.metadata = extracted.metadata;
            }
            Ok(Err(e)) => {
                error!(file = %record.filename, family = %family, error = %e, "Extraction failed");
                record.status = ExtractionStatus::Error;
                record.error = Some(e.to_string());
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(file = %record.filename, family = %family, reason = %reason, "Extractor panicked");
                record.status = ExtractionStatus::Error;
                record.error = Some(format!("extractor panicked: {reason}"));
            }
        }
        record
    }

    /// Extract and persist the record into `bundle`. A record that cannot be
    /// persisted is reported as an error.
    pub async fn extract_into(&self, bundle: &Bundle, path: &Path, extension: &str) -> ExtractionRecord {
        let mut record = self.extract(path, extension).await;
        match bundle.write_extraction(&record).await {
            Ok(out) => {
                info!(
                    file = %record.filename,
                    status = ?record.status,
                    output = %out.display(),
                    "Attachment processed"
                );
            }
            Err(e) => {
                error!(file = %record.filename, error = %e, "Failed to persist extraction output");
                record.status = ExtractionStatus::Error;
                record.error = Some(e.to_string());
            }
        }
        record
    }
}
