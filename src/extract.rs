use std::{
    fmt, fs,
    io::{ErrorKind, Write},
    process::Command,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use tempfile::NamedTempFile;
use tokio::task;

const MIN_TEXT_LENGTH: usize = 50;

/// Turns an uploaded file into plain text for validation and embedding.
#[async_trait]
pub trait TextExtractor: Send + Sync + 'static {
    async fn extract(&self, bytes: &[u8], content_type: Option<&str>) -> Result<String>;
}

/// Default extractor: PDF text layer via pdfium, `ocrmypdf` sidecar fallback
/// for scanned PDFs, UTF-8 decode for everything else.
pub struct PdfiumTextExtractor;

impl PdfiumTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfiumTextExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextExtractor for PdfiumTextExtractor {
    async fn extract(&self, bytes: &[u8], content_type: Option<&str>) -> Result<String> {
        if !is_pdf(content_type) {
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|_| anyhow!("unsupported file type or encoding for non-PDF file"))?;
            if text.trim().is_empty() {
                return Err(anyhow!("no extractable text found in document"));
            }
            return Ok(text);
        }

        let bytes = bytes.to_vec();
        let extracted = task::spawn_blocking(move || extract_from_pdf(&bytes))
            .await
            .map_err(|join_err| anyhow!("extraction task panicked: {join_err}"))??;

        Ok(extracted)
    }
}

fn is_pdf(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.eq_ignore_ascii_case("application/pdf"))
        .unwrap_or(false)
}

fn extract_from_pdf(bytes: &[u8]) -> Result<String> {
    if let Ok(text) = extract_pdf_text(bytes) {
        if text.trim().chars().count() >= MIN_TEXT_LENGTH {
            return Ok(text);
        }
    }

    // Text layer too thin; the document is likely scanned.
    match run_ocr(bytes) {
        Ok(Some(text)) => Ok(text),
        Ok(None) => Err(anyhow!("no extractable text found in document")),
        Err(OcrError::BinaryMissing) => {
            Err(anyhow!("ocrmypdf not installed; cannot OCR scanned PDF"))
        }
        Err(err) => Err(anyhow!("{err}")),
    }
}

fn extract_pdf_text(bytes: &[u8]) -> Result<String, String> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|err| format!("load pdf: {err}"))?;

    let mut combined = String::new();
    let pages = document.pages();
    for page_index in 0..pages.len() {
        let page = pages
            .get(page_index)
            .map_err(|err| format!("load page {page_index}: {err}"))?;
        if let Ok(page_text) = page.text() {
            for segment in page_text.segments().iter() {
                combined.push_str(&segment.text());
                combined.push('\n');
            }
        };
    }

    Ok(combined)
}

#[derive(Debug)]
enum OcrError {
    BinaryMissing,
    Failed(String),
}

impl fmt::Display for OcrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrError::BinaryMissing => write!(f, "ocrmypdf binary not found"),
            OcrError::Failed(msg) => write!(f, "ocr failed: {msg}"),
        }
    }
}

fn run_ocr(bytes: &[u8]) -> Result<Option<String>, OcrError> {
    let mut input = NamedTempFile::new().map_err(|err| OcrError::Failed(err.to_string()))?;
    input
        .write_all(bytes)
        .map_err(|err| OcrError::Failed(err.to_string()))?;
    input
        .flush()
        .map_err(|err| OcrError::Failed(err.to_string()))?;

    let output_pdf = NamedTempFile::new().map_err(|err| OcrError::Failed(err.to_string()))?;
    let sidecar = NamedTempFile::new().map_err(|err| OcrError::Failed(err.to_string()))?;

    let status = Command::new("ocrmypdf")
        .arg("--sidecar")
        .arg(sidecar.path())
        .arg("--skip-text")
        .arg(input.path())
        .arg(output_pdf.path())
        .output();

    match status {
        Ok(output) => {
            if !output.status.success() {
                return Err(OcrError::Failed(format!(
                    "ocrmypdf failed: exit={} stderr={}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            let text = fs::read_to_string(sidecar.path())
                .map_err(|err| OcrError::Failed(err.to_string()))?;
            if text.trim().chars().count() >= MIN_TEXT_LENGTH {
                Ok(Some(text))
            } else {
                Ok(None)
            }
        }
        Err(err) => {
            if err.kind() == ErrorKind::NotFound {
                Err(OcrError::BinaryMissing)
            } else {
                Err(OcrError::Failed(err.to_string()))
            }
        }
    }
}
