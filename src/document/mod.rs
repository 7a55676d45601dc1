use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use regex::{Regex, RegexBuilder};
use scraper::Html;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Date layout used on every certificate.
pub const DATE_FORMAT: &str = "%d/%m/%Y";

/// Reads certificate PDFs through the poppler `pdftotext` binary.
#[derive(Debug, Clone)]
pub struct DocumentParser {
    pdftotext: PathBuf,
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self::new("pdftotext")
    }
}

impl DocumentParser {
    pub fn new(pdftotext: impl Into<PathBuf>) -> Self {
        Self {
            pdftotext: pdftotext.into(),
        }
    }

    /// Text of every page, layout preserved.
    pub fn pdf_text(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.pdftotext)
            .arg("-layout")
            .arg(path)
            .arg("-")
            .output();

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("pdftotext not found (install poppler-utils)")
            }
            Err(e) => return Err(e).context("Failed to run pdftotext"),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("pdftotext failed on {:?}: {}", path, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Validity date printed in the PDF, if the pattern finds one.
    pub fn validity(&self, path: &Path, pattern: &Regex) -> Result<Option<NaiveDate>> {
        let text = self.pdf_text(path)?;
        debug!("Extracted {} chars from {:?}", text.len(), path);
        Ok(extract_validity(&text, pattern))
    }
}

/// Compile a validity pattern; matching ignores case.
pub fn validity_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("Invalid validity pattern: {}", pattern))
}

/// First capture group of `pattern` parsed as `dd/mm/yyyy`.
pub fn extract_validity(text: &str, pattern: &Regex) -> Option<NaiveDate> {
    let caps = pattern.captures(text)?;
    let raw = caps.get(1)?.as_str();
    match NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        Ok(date) => Some(date),
        Err(e) => {
            warn!("Ignoring malformed validity date '{}': {}", raw, e);
            None
        }
    }
}

/// Text content of an HTML page, one text node per line.
pub fn html_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `<prefix>_<document>_<yyyymmdd>.pdf`, or `erro_<document>.pdf` without a date.
pub fn certificate_file_name(prefix: &str, document: &str, validity: Option<NaiveDate>) -> String {
    match validity {
        Some(date) => format!("{}_{}_{}.pdf", prefix, document, date.format("%Y%m%d")),
        None => format!("erro_{}.pdf", document),
    }
}

/// Move a downloaded certificate into `out_dir` under its final name.
pub fn file_certificate(
    downloaded: &Path,
    out_dir: &Path,
    prefix: &str,
    document: &str,
    validity: Option<NaiveDate>,
) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).context("Failed to create output directory")?;
    let destination = out_dir.join(certificate_file_name(prefix, document, validity));
    if fs::rename(downloaded, &destination).is_err() {
        // rename fails across filesystems
        fs::copy(downloaded, &destination)
            .with_context(|| format!("Failed to copy {:?} to {:?}", downloaded, destination))?;
        fs::remove_file(downloaded).ok();
    }
    Ok(destination)
}
