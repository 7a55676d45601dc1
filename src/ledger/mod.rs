use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::portal::normalize_document;

pub const COL_DOCUMENT: &str = "CNPJ";
pub const COL_VALIDITY: &str = "VALIDADE CERTIDÃO";
pub const COL_NAME: &str = "RAZÃO SOCIAL";

/// One company (or person) to fetch a certificate for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub document: String,
    pub name: Option<String>,
    pub validity: Option<String>,
}

/// The certificate spreadsheet, kept as a CSV file with a header row.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    document_col: usize,
    validity_col: usize,
    name_col: Option<usize>,
}

impl Ledger {
    /// Load the sheet. A missing validity column is added on the right.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("Failed to open ledger {:?}", path))?;
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);

        let mut headers: Vec<String> = reader
            .headers()
            .context("Failed to read ledger header")?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let Some(document_col) = find_column(&headers, COL_DOCUMENT) else {
            bail!("Column {} not found in {:?}", COL_DOCUMENT, path);
        };
        let name_col = find_column(&headers, COL_NAME);
        let validity_col = match find_column(&headers, COL_VALIDITY) {
            Some(col) => col,
            None => {
                warn!("Column {} missing, adding it", COL_VALIDITY);
                headers.push(COL_VALIDITY.to_string());
                headers.len() - 1
            }
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("Failed to read ledger row")?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }
        debug!("Loaded {} rows from {:?}", rows.len(), path);

        Ok(Self {
            path,
            headers,
            rows,
            document_col,
            validity_col,
            name_col,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct documents in sheet order; blank and invalid ones are skipped.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = Vec::new();
        for row in &self.rows {
            let raw = row[self.document_col].trim();
            if raw.is_empty() {
                continue;
            }
            let document = match normalize_document(raw) {
                Ok(id) => id.digits().to_string(),
                Err(e) => {
                    warn!("{} → skipped: {}", raw, e);
                    continue;
                }
            };
            if entries.iter().any(|e| e.document == document) {
                continue;
            }
            entries.push(LedgerEntry {
                document,
                name: self
                    .name_col
                    .map(|col| row[col].trim().to_string())
                    .filter(|n| !n.is_empty()),
                validity: Some(row[self.validity_col].trim().to_string())
                    .filter(|v| !v.is_empty()),
            });
        }
        entries
    }

    /// Write `value` into the validity cell of the first row holding `document`.
    pub fn set_validity(&mut self, document: &str, value: &str) -> bool {
        let Ok(target) = normalize_document(document) else {
            return false;
        };
        let document_col = self.document_col;
        let row = self.rows.iter_mut().find(|row| {
            normalize_document(&row[document_col])
                .map(|id| id == target)
                .unwrap_or(false)
        });
        match row {
            Some(row) => {
                row[self.validity_col] = value.to_string();
                true
            }
            None => false,
        }
    }

    pub fn save(&self) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to write ledger {:?}", self.path))?;
        let mut wtr = csv::Writer::from_writer(file);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Update and persist right away, so an interrupted run keeps its progress.
    pub fn record(&mut self, document: &str, value: &str) -> Result<bool> {
        if !self.set_validity(document, value) {
            warn!("{} not found in ledger", document);
            return Ok(false);
        }
        self.save()?;
        info!("📝 {} → {}", document, value);
        Ok(true)
    }
}

/// Upper-case, accent-free, single-spaced header key.
fn header_key(value: &str) -> String {
    value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn find_column(headers: &[String], name: &str) -> Option<usize> {
    let wanted = header_key(name);
    headers.iter().position(|h| header_key(h) == wanted)
}
