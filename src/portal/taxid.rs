use anyhow::{bail, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Cpf,
    Cnpj,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Cpf => write!(f, "CPF"),
            DocumentKind::Cnpj => write!(f, "CNPJ"),
        }
    }
}

/// A CPF or CNPJ reduced to its digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxId {
    digits: String,
    kind: DocumentKind,
}

impl TaxId {
    pub fn digits(&self) -> &str {
        &self.digits
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digits)
    }
}

/// Strip punctuation and restore leading zeros lost by spreadsheets.
///
/// 9-11 digits are read as a CPF, 12-14 as a CNPJ; check digits must match.
pub fn normalize_document(raw: &str) -> Result<TaxId> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let (kind, width) = match digits.len() {
        9..=11 => (DocumentKind::Cpf, 11),
        12..=14 => (DocumentKind::Cnpj, 14),
        n => bail!("'{}' has {} digits, not a CPF or CNPJ", raw.trim(), n),
    };
    let digits = format!("{:0>width$}", digits, width = width);

    let values: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if values.iter().all(|d| *d == values[0]) {
        bail!("'{}' is not a valid {}", raw.trim(), kind);
    }
    let valid = match kind {
        DocumentKind::Cpf => cpf_check_digits_ok(&values),
        DocumentKind::Cnpj => cnpj_check_digits_ok(&values),
    };
    if !valid {
        bail!("'{}' has invalid {} check digits", raw.trim(), kind);
    }

    Ok(TaxId { digits, kind })
}

fn check_digit(values: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = values.iter().zip(weights).map(|(v, w)| v * w).sum();
    match sum % 11 {
        0 | 1 => 0,
        r => 11 - r,
    }
}

fn cpf_check_digits_ok(values: &[u32]) -> bool {
    let first = check_digit(&values[..9], &[10, 9, 8, 7, 6, 5, 4, 3, 2]);
    let second = check_digit(&values[..10], &[11, 10, 9, 8, 7, 6, 5, 4, 3, 2]);
    values[9] == first && values[10] == second
}

fn cnpj_check_digits_ok(values: &[u32]) -> bool {
    let first = check_digit(&values[..12], &[5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]);
    let second = check_digit(&values[..13], &[6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]);
    values[12] == first && values[13] == second
}
