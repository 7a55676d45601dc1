use anyhow::{anyhow, bail, Context, Result};
use image::GrayImage;
use std::path::PathBuf;
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::debug;

use super::recognition::{RawRead, Recognizer};
use crate::config::SegmentationMode;

/// Runs the `tesseract` command-line binary with TSV output.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    executable: PathBuf,
    language: String,
    tessdata_dir: Option<PathBuf>,
}

impl TesseractCli {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            language: "eng".to_string(),
            tessdata_dir: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_tessdata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tessdata_dir = Some(dir.into());
        self
    }

    /// Find the binary from `TESSERACT_PATH` or the `PATH`.
    pub fn locate() -> Result<Self> {
        if let Ok(path) = std::env::var("TESSERACT_PATH") {
            let path = PathBuf::from(path.trim());
            if path.exists() {
                let mut cli = Self::new(path);
                if let Ok(dir) = std::env::var("TESSDATA_PREFIX") {
                    cli = cli.with_tessdata_dir(dir);
                }
                return Ok(cli);
            }
            bail!("TESSERACT_PATH points to a missing file: {}", path.display());
        }

        let output = Command::new("tesseract")
            .arg("--version")
            .output()
            .context("Tesseract not found in PATH (install it or set TESSERACT_PATH)")?;
        if !output.status.success() {
            bail!("`tesseract --version` exited with {}", output.status);
        }
        Ok(Self::new("tesseract"))
    }
}

impl Recognizer for TesseractCli {
    fn recognize(
        &self,
        image: &GrayImage,
        mode: SegmentationMode,
        charset: &str,
    ) -> Result<RawRead> {
        let input = NamedTempFile::with_suffix(".png")?;
        image
            .save(input.path())
            .context("Failed to write variant for tesseract")?;

        let mut command = Command::new(&self.executable);
        command
            .arg(input.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("--oem")
            .arg("3")
            .arg("--psm")
            .arg(mode.psm().to_string())
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={}", charset));
        if let Some(dir) = &self.tessdata_dir {
            command.arg("--tessdata-dir").arg(dir);
        }
        command.arg("tsv");

        let output = command.output().context("Failed to run tesseract")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Tesseract failed: {}", stderr.trim()));
        }

        let read = parse_tsv_words(&String::from_utf8_lossy(&output.stdout), charset);
        debug!("tesseract {} -> {:?} ({:.1})", mode, read.text, read.confidence);
        Ok(read)
    }
}

/// Concatenates the word-level entries of Tesseract TSV output.
///
/// Confidence is the mean over words that carry one; text keeps only
/// characters from `charset`.
pub fn parse_tsv_words(tsv: &str, charset: &str) -> RawRead {
    let mut text = String::new();
    let mut confidences = Vec::new();

    // level page block par line word left top width height conf text
    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 || fields[0] != "5" {
            continue;
        }
        let word = fields[11].trim();
        let conf: f64 = match fields[10].trim().parse() {
            Ok(conf) => conf,
            Err(_) => continue,
        };
        if word.is_empty() || conf < 0.0 {
            continue;
        }
        text.extend(word.chars().filter(|c| charset.contains(*c)));
        confidences.push(conf);
    }

    let confidence = if confidences.is_empty() {
        -1.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    RawRead { text, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CHARSET;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_words_joins_and_averages() {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t168\t67\t-1\t\n\
             4\t1\t1\t1\t1\t0\t10\t10\t140\t40\t-1\t\n\
             5\t1\t1\t1\t1\t1\t10\t10\t60\t40\t90\tAB3\n\
             5\t1\t1\t1\t1\t2\t80\t10\t60\t40\t70.5\tX7\n"
        );
        let read = parse_tsv_words(&tsv, DEFAULT_CHARSET);
        assert_eq!(read.text, "AB3X7");
        assert!((read.confidence - 80.25).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_words_strips_foreign_symbols() {
        let tsv = format!("{HEADER}\n5\t1\t1\t1\t1\t1\t0\t0\t1\t1\t88\tA.b-3!\n");
        let read = parse_tsv_words(&tsv, DEFAULT_CHARSET);
        assert_eq!(read.text, "Ab3");
    }

    #[test]
    fn test_parse_tsv_words_empty_output() {
        let read = parse_tsv_words(HEADER, DEFAULT_CHARSET);
        assert_eq!(read.text, "");
        assert_eq!(read.confidence, -1.0);
    }

    #[test]
    fn test_builder() {
        let cli = TesseractCli::new("/usr/bin/tesseract")
            .with_language("por")
            .with_tessdata_dir("/usr/share/tessdata");
        assert_eq!(cli.language, "por");
        assert_eq!(cli.tessdata_dir, Some(PathBuf::from("/usr/share/tessdata")));
    }
}
