//! Text extraction for uploaded documents (PDF, plain text).
//!
//! Plain text is decoded leniently. PDFs go through `pdf-extract`; when that
//! yields almost nothing the file is assumed to be a scan and each page is
//! rasterized and run through OCR. Extraction problems never abort a parse:
//! the worst outcome is empty text.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{RagError, Result};

/// Below this many characters of extracted text a PDF is treated as scanned.
pub const MIN_PDF_TEXT_CHARS: usize = 100;

/// Formats accepted by [`DocumentParser::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PlainText,
}

impl DocumentFormat {
    /// Detect the format from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(DocumentFormat::Pdf),
            "txt" => Ok(DocumentFormat::PlainText),
            "" => Err(RagError::UnsupportedFormat(path.display().to_string())),
            other => Err(RagError::UnsupportedFormat(format!(".{}", other))),
        }
    }
}

/// Whether a filename has an extension the parser accepts.
pub fn is_supported(filename: &str) -> bool {
    DocumentFormat::from_path(Path::new(filename)).is_ok()
}

/// Optical character recognition over the pages of a PDF file.
pub trait OcrEngine: Send + Sync {
    /// Return the recognised text of every page, in page order.
    fn recognize_pdf(&self, path: &Path) -> Result<String>;
}

/// OCR disabled: every call fails, so the parser keeps the extracted text.
pub struct NoOcr;

impl OcrEngine for NoOcr {
    fn recognize_pdf(&self, _path: &Path) -> Result<String> {
        Err(RagError::ParseFailure("OCR is disabled".to_string()))
    }
}

/// OCR via the poppler `pdftoppm` and `tesseract` command-line tools.
pub struct TesseractOcr {
    pdftoppm: String,
    tesseract: String,
    dpi: u32,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            pdftoppm: "pdftoppm".to_string(),
            tesseract: "tesseract".to_string(),
            dpi: 200,
        }
    }
}

impl TesseractOcr {
    fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let prefix = out_dir.join("page");
        let output = Command::new(&self.pdftoppm)
            .args(["-png", "-r", &self.dpi.to_string()])
            .arg(pdf)
            .arg(&prefix)
            .output()
            .map_err(|e| {
                RagError::ParseFailure(format!(
                    "failed to execute '{}' (is poppler installed?): {}",
                    self.pdftoppm, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RagError::ParseFailure(format!(
                "pdftoppm failed: {}",
                stderr.trim()
            )));
        }

        let mut pages: Vec<PathBuf> = std::fs::read_dir(out_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "png").unwrap_or(false))
            .collect();
        // pdftoppm zero-pads page numbers to a common width, so lexical order is page order.
        pages.sort();
        Ok(pages)
    }

    fn recognize_image(&self, image: &Path) -> Result<String> {
        let output = Command::new(&self.tesseract)
            .arg(image)
            .arg("stdout")
            .output()
            .map_err(|e| {
                RagError::ParseFailure(format!(
                    "failed to execute '{}' (is tesseract installed?): {}",
                    self.tesseract, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RagError::ParseFailure(format!(
                "tesseract failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize_pdf(&self, path: &Path) -> Result<String> {
        let scratch = tempfile::tempdir()?;
        let pages = self.rasterize(path, scratch.path())?;
        if pages.is_empty() {
            return Err(RagError::ParseFailure(
                "pdftoppm produced no page images".to_string(),
            ));
        }

        let mut texts = Vec::with_capacity(pages.len());
        for page in &pages {
            texts.push(self.recognize_image(page)?);
        }
        Ok(texts.join("\n"))
    }
}

/// Extracts raw text from PDF and plain-text files.
#[derive(Clone)]
pub struct DocumentParser {
    ocr: Arc<dyn OcrEngine>,
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self::new(Arc::new(TesseractOcr::default()))
    }
}

impl DocumentParser {
    pub fn new(ocr: Arc<dyn OcrEngine>) -> Self {
        Self { ocr }
    }

    /// Parser without OCR fallback.
    pub fn without_ocr() -> Self {
        Self::new(Arc::new(NoOcr))
    }

    /// Extract the text of the file at `path`.
    ///
    /// # Errors
    ///
    /// [`RagError::UnsupportedFormat`] for anything but `.pdf` / `.txt`, and
    /// [`RagError::Io`] if the file cannot be read at all.
    pub fn parse(&self, path: &Path) -> Result<String> {
        match DocumentFormat::from_path(path)? {
            DocumentFormat::PlainText => read_text(path),
            DocumentFormat::Pdf => self.read_pdf(path),
        }
    }

    fn read_pdf(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)?;
        let text = match extract_pdf_text(&bytes) {
            Ok(t) => t.trim().to_string(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "PDF text extraction failed");
                String::new()
            }
        };

        if text.chars().count() >= MIN_PDF_TEXT_CHARS {
            return Ok(text);
        }

        debug!(
            path = %path.display(),
            chars = text.chars().count(),
            "little text extracted, trying OCR"
        );
        match self.ocr.recognize_pdf(path) {
            Ok(ocr_text) => {
                info!(path = %path.display(), chars = ocr_text.len(), "OCR fallback used");
                Ok(ocr_text)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "OCR failed, keeping extracted text");
                Ok(text)
            }
        }
    }
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn extract_pdf_text(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| RagError::ParseFailure(e.to_string()))
}
