//! Extractor families.
//!
//! Documents and OCR run external commands; spreadsheets and plain text are
//! read in-process. Every extractor reports failure through [`ExtractError`];
//! the pipeline turns that into an error record.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use calamine::{Data, Reader, open_workbook_auto};
use serde_json::{Map, Value, json};
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::ExtractorFamily;
use crate::error::ExtractError;

/// Maximum extracted text kept per attachment.
const MAX_CONTENT_SIZE: usize = 512 * 1024;

/// Text and metadata pulled out of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub content: String,
    pub metadata: Value,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn family(&self) -> ExtractorFamily;

    /// Extract `path`, whose lowercase extension is `extension`.
    async fn extract(&self, path: &Path, extension: &str) -> Result<Extracted, ExtractError>;
}

// ── Command runner ──────────────────────────────────────────────────

/// A command line with an `{input}` placeholder and, for commands that write
/// files, an `{output}` path prefix.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run against `input`, returning stdout.
    pub async fn run(&self, input: &Path, timeout: Duration) -> Result<String, ExtractError> {
        self.execute(input, None, timeout).await
    }

    /// Run against `input`, writing files under the `output` prefix.
    pub async fn run_with_output(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<String, ExtractError> {
        self.execute(input, Some(output), timeout).await
    }

    async fn execute(&self, input: &Path, output: Option<&Path>, timeout: Duration) -> Result<String, ExtractError> {
        let input = input.to_string_lossy();
        let output = output.map(|p| p.to_string_lossy()).unwrap_or_default();
        let mut command = Command::new(&self.program);
        command
            .args(
                self.args
                    .iter()
                    .map(|a| a.replace("{input}", &input).replace("{output}", &output)),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| ExtractError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ExtractError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::CommandFailed {
                program: self.program.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: truncate(stderr.trim(), 2048).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn cap_content(mut content: String) -> (String, bool) {
    if content.len() <= MAX_CONTENT_SIZE {
        return (content, false);
    }
    let end = truncate(&content, MAX_CONTENT_SIZE).len();
    content.truncate(end);
    (content, true)
}

// ── Document ────────────────────────────────────────────────────────

/// pdf through one command, doc/docx through another. A pdf without a text
/// layer is rasterized and run through OCR when [`ScannedPdf`] is set.
pub struct DocumentExtractor {
    pdf: CommandTemplate,
    word: CommandTemplate,
    scanned: Option<ScannedPdf>,
    timeout: Duration,
}

impl DocumentExtractor {
    pub fn new(pdf: CommandTemplate, word: CommandTemplate, timeout: Duration) -> Self {
        Self {
            pdf,
            word,
            scanned: None,
            timeout,
        }
    }

    pub fn with_scanned_pdf(mut self, scanned: ScannedPdf) -> Self {
        self.scanned = Some(scanned);
        self
    }
}

/// Rasterize a pdf into page images, then OCR each page.
#[derive(Debug, Clone)]
pub struct ScannedPdf {
    rasterize: CommandTemplate,
    ocr: CommandTemplate,
}

impl ScannedPdf {
    /// `rasterize` writes `<output>-<page>.png` files; `ocr` prints the text of one image.
    pub fn new(rasterize: CommandTemplate, ocr: CommandTemplate) -> Self {
        Self { rasterize, ocr }
    }

    /// OCR text of every page, and the page count.
    async fn read(&self, pdf: &Path, timeout: Duration) -> Result<(String, usize), ExtractError> {
        let work = std::env::temp_dir().join(format!("mail-intake-ocr-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work).await?;
        let result = self.read_pages(pdf, &work, timeout).await;
        if let Err(e) = tokio::fs::remove_dir_all(&work).await {
            debug!(dir = %work.display(), error = %e, "Could not remove page images");
        }
        result
    }

    async fn read_pages(&self, pdf: &Path, work: &Path, timeout: Duration) -> Result<(String, usize), ExtractError> {
        self.rasterize.run_with_output(pdf, &work.join("page"), timeout).await?;

        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(work).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("png")) {
                pages.push(path);
            }
        }
        if pages.is_empty() {
            return Err(ExtractError::Unreadable {
                format: "pdf".into(),
                reason: format!("{} produced no page images", self.rasterize.program()),
            });
        }
        // Page numbers are zero-padded to a common width.
        pages.sort();

        let mut texts = Vec::with_capacity(pages.len());
        for page in &pages {
            texts.push(self.ocr.run(page, timeout).await?.trim().to_string());
        }
        Ok((texts.join("\n\n"), pages.len()))
    }
}

#[async_trait]
impl Extractor for DocumentExtractor {
    fn family(&self) -> ExtractorFamily {
        ExtractorFamily::Document
    }

    async fn extract(&self, path: &Path, extension: &str) -> Result<Extracted, ExtractError> {
        let command = if extension == "pdf" { &self.pdf } else { &self.word };
        let raw = command.run(path, self.timeout).await?;

        if extension == "pdf" && raw.trim().is_empty() {
            if let Some(scanned) = &self.scanned {
                info!(file = %path.display(), "No text layer, falling back to OCR");
                let (text, pages) = scanned.read(path, self.timeout).await?;
                let (content, truncated) = cap_content(text);
                let mut metadata = Map::new();
                metadata.insert("pages".into(), json!(pages));
                metadata.insert("chars".into(), json!(content.chars().count()));
                metadata.insert("tool".into(), json!(scanned.ocr.program()));
                metadata.insert("ocr".into(), json!(true));
                if truncated {
                    metadata.insert("truncated".into(), json!(true));
                }
                return Ok(Extracted {
                    content,
                    metadata: Value::Object(metadata),
                });
            }
        }

        let mut metadata = Map::new();
        if extension == "pdf" {
            // pdftotext ends every page with a form feed.
            let pages = raw.matches('\x0c').count().max(1);
            metadata.insert("pages".into(), json!(pages));
        }
        let text = raw.replace('\x0c', "\n");
        let (content, truncated) = cap_content(text.trim().to_string());
        metadata.insert("chars".into(), json!(content.chars().count()));
        metadata.insert("tool".into(), json!(command.program()));
        if truncated {
            metadata.insert("truncated".into(), json!(true));
        }
        Ok(Extracted {
            content,
            metadata: Value::Object(metadata),
        })
    }
}

// ── Spreadsheet ─────────────────────────────────────────────────────

/// First sheet, first row as header, one JSON object per remaining row.
pub struct SpreadsheetExtractor;

fn cell_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty => None,
        Data::Int(i) => Some(json!(i)),
        Data::Float(f) => Some(json!(f)),
        Data::Bool(b) => Some(json!(b)),
        Data::String(s) if s.trim().is_empty() => None,
        Data::String(s) => Some(json!(s)),
        other => Some(json!(other.to_string())),
    }
}

/// Turn a header row plus data rows into JSON objects. Empty cells are
/// omitted; unnamed columns are named `__EMPTY_<i>`.
fn rows_to_objects<I, R>(mut rows: I) -> (Vec<String>, Vec<Value>)
where
    I: Iterator<Item = R>,
    R: IntoIterator<Item = Option<Value>>,
{
    let Some(header_row) = rows.next() else {
        return (Vec::new(), Vec::new());
    };
    let headers: Vec<String> = header_row
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => other.to_string(),
            None => format!("__EMPTY_{i}"),
        })
        .collect();

    let objects = rows
        .filter_map(|row| {
            let mut obj = Map::new();
            for (i, cell) in row.into_iter().enumerate() {
                if let (Some(value), Some(key)) = (cell, headers.get(i)) {
                    obj.insert(key.clone(), value);
                }
            }
            (!obj.is_empty()).then_some(Value::Object(obj))
        })
        .collect();
    (headers, objects)
}

fn read_workbook(path: &Path) -> Result<(String, Vec<String>, Vec<Value>), ExtractError> {
    let unreadable = |reason: String| ExtractError::Unreadable {
        format: "spreadsheet".into(),
        reason,
    };
    let mut workbook = open_workbook_auto(path).map_err(|e| unreadable(e.to_string()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| unreadable("workbook has no sheets".into()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| unreadable(e.to_string()))?;
    let (headers, rows) =
        rows_to_objects(range.rows().map(|r| r.iter().map(cell_value).collect::<Vec<_>>()));
    Ok((sheet, headers, rows))
}

fn csv_cell(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(json!(i));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Some(json!(f));
    }
    Some(json!(trimmed))
}

/// Rows may have differing lengths; quoted fields may span lines.
fn read_csv(raw: &str) -> Result<(Vec<String>, Vec<Value>), ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ExtractError::Unreadable {
            format: "csv".into(),
            reason: e.to_string(),
        })?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        rows.push(record.iter().map(csv_cell).collect::<Vec<_>>());
    }
    Ok(rows_to_objects(rows.into_iter()))
}

#[async_trait]
impl Extractor for SpreadsheetExtractor {
    fn family(&self) -> ExtractorFamily {
        ExtractorFamily::Spreadsheet
    }

    async fn extract(&self, path: &Path, extension: &str) -> Result<Extracted, ExtractError> {
        let (sheet, headers, rows) = if extension == "csv" {
            let bytes = tokio::fs::read(path).await?;
            let (headers, rows) = read_csv(&String::from_utf8_lossy(&bytes))?;
            (None, headers, rows)
        } else {
            let owned: PathBuf = path.to_path_buf();
            let (sheet, headers, rows) = tokio::task::spawn_blocking(move || read_workbook(&owned))
                .await
                .map_err(|e| ExtractError::Panicked(e.to_string()))??;
            (Some(sheet), headers, rows)
        };

        let content = serde_json::to_string_pretty(&rows).map_err(|e| ExtractError::Unreadable {
            format: extension.to_string(),
            reason: e.to_string(),
        })?;
        let (content, truncated) = cap_content(content);

        let mut metadata = Map::new();
        if let Some(sheet) = sheet {
            metadata.insert("sheet".into(), json!(sheet));
        }
        metadata.insert("columns".into(), json!(headers));
        metadata.insert("rows".into(), json!(rows.len()));
        if truncated {
            metadata.insert("truncated".into(), json!(true));
        }
        Ok(Extracted {
            content,
            metadata: Value::Object(metadata),
        })
    }
}

// ── Image ───────────────────────────────────────────────────────────

/// Image dimensions plus OCR text.
pub struct ImageExtractor {
    ocr: CommandTemplate,
    timeout: Duration,
}

impl ImageExtractor {
    pub fn new(ocr: CommandTemplate, timeout: Duration) -> Self {
        Self { ocr, timeout }
    }
}

#[async_trait]
impl Extractor for ImageExtractor {
    fn family(&self) -> ExtractorFamily {
        ExtractorFamily::Image
    }

    async fn extract(&self, path: &Path, _extension: &str) -> Result<Extracted, ExtractError> {
        let owned = path.to_path_buf();
        let (width, height, format) = tokio::task::spawn_blocking(move || {
            let (w, h) = image::image_dimensions(&owned).map_err(|e| ExtractError::Unreadable {
                format: "image".into(),
                reason: e.to_string(),
            })?;
            let format = image::ImageFormat::from_path(&owned)
                .ok()
                .map(|f| format!("{f:?}").to_lowercase());
            Ok::<_, ExtractError>((w, h, format))
        })
        .await
        .map_err(|e| ExtractError::Panicked(e.to_string()))??;

        let text = self.ocr.run(path, self.timeout).await?;
        let (content, _) = cap_content(text.trim().to_string());
        Ok(Extracted {
            metadata: json!({
                "width": width,
                "height": height,
                "format": format,
                "ocr_chars": content.chars().count(),
            }),
            content,
        })
    }
}

// ── Text ────────────────────────────────────────────────────────────

pub struct TextExtractor;

#[async_trait]
impl Extractor for TextExtractor {
    fn family(&self) -> ExtractorFamily {
        ExtractorFamily::Text
    }

    async fn extract(&self, path: &Path, _extension: &str) -> Result<Extracted, ExtractError> {
        let bytes = tokio::fs::read(path).await?;
        let (content, truncated) = cap_content(String::from_utf8_lossy(&bytes).into_owned());
        let mut metadata = Map::new();
        metadata.insert("bytes".into(), json!(bytes.len()));
        if truncated {
            metadata.insert("truncated".into(), json!(true));
        }
        Ok(Extracted {
            content,
            metadata: Value::Object(metadata),
        })
    }
}
