pub mod aggregate;
pub mod controller;
mod error;
pub mod preprocess;
pub mod recognition;
pub mod remote_solver;
pub mod strategy;
pub mod tesseract;

use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::config::SegmentationMode;

pub use aggregate::CandidateAggregator;
pub use controller::{AcceptancePolicy, SolveController, SolveOutcome};
pub use error::CaptchaError;
pub use preprocess::ImagePreprocessor;
pub use recognition::{RecognitionEngine, Recognizer};
pub use remote_solver::{Challenge, RemoteSolverClient};
pub use strategy::{CaptchaStrategy, ConfiguredSolver, HybridSolver, LocalSolver, RemoteSolver};

/// A captcha rendering as captured from the page.
///
/// Immutable once captured; owned by the attempt that captured it.
#[derive(Debug, Clone)]
pub struct CaptchaImage {
    pixels: DynamicImage,
    encoded: Vec<u8>,
    captured_at: DateTime<Utc>,
}

impl CaptchaImage {
    /// Decode an encoded image (PNG, JPEG, GIF...) as returned by an element screenshot.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CaptchaError> {
        let pixels = image::load_from_memory(&bytes)
            .map_err(|e| CaptchaError::InvalidImage(e.to_string()))?;
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(CaptchaError::InvalidImage("empty image".to_string()));
        }
        Ok(Self {
            pixels,
            encoded: bytes,
            captured_at: Utc::now(),
        })
    }

    /// Wrap an in-memory raster; it is PNG-encoded for remote submission.
    pub fn from_pixels(pixels: DynamicImage) -> Result<Self, CaptchaError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(CaptchaError::InvalidImage("empty image".to_string()));
        }
        let mut encoded = Vec::new();
        pixels
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .map_err(|e| CaptchaError::InvalidImage(e.to_string()))?;
        Ok(Self {
            pixels,
            encoded,
            captured_at: Utc::now(),
        })
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    /// The encoded bytes, as sent to the remote solver.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.pixels.width(), self.pixels.height())
    }
}

/// Identifies the transformation chain that produced a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineId {
    EqualizedOtsuLines,
    EqualizedOtsuInverted,
    Adaptive,
    OtsuLines,
    MedianAdaptive,
    SmoothedOtsu,
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineId::EqualizedOtsuLines => "equalized-otsu-lines",
            PipelineId::EqualizedOtsuInverted => "equalized-otsu-inverted",
            PipelineId::Adaptive => "adaptive",
            PipelineId::OtsuLines => "otsu-lines",
            PipelineId::MedianAdaptive => "median-adaptive",
            PipelineId::SmoothedOtsu => "smoothed-otsu",
        };
        f.write_str(name)
    }
}

/// Two-level derivative of a [`CaptchaImage`]: ink is 0, background 255.
#[derive(Debug, Clone)]
pub struct ImageVariant {
    pub pixels: GrayImage,
    pub pipeline: PipelineId,
}

impl ImageVariant {
    pub fn ink_pixels(&self) -> usize {
        self.pixels.pixels().filter(|p| p[0] == preprocess::INK).count()
    }
}

/// One OCR read of one variant under one segmentation mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionCandidate {
    pub text: String,
    /// 0..=100
    pub confidence: f64,
    pub mode: SegmentationMode,
    pub pipeline: String,
}

impl RecognitionCandidate {
    pub fn new(
        text: impl Into<String>,
        confidence: f64,
        mode: SegmentationMode,
        pipeline: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 100.0),
            mode,
            pipeline: pipeline.into(),
        }
    }
}

/// Where a guess came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuessSource {
    Local,
    Remote,
}

/// Best answer of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredGuess {
    pub text: String,
    /// Summed, floored per-candidate score of `text`.
    pub aggregate_score: f64,
    /// Best single-read confidence of `text`.
    pub confidence: f64,
    pub source: GuessSource,
}

impl ScoredGuess {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            aggregate_score: 0.0,
            confidence: 0.0,
            source: GuessSource::Local,
        }
    }

    /// A final answer from the remote service, always treated as maximal confidence.
    pub fn remote(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            aggregate_score: 100.0,
            confidence: 100.0,
            source: GuessSource::Remote,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Running state of one solve session.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveAttempt {
    pub attempt_number: u32,
    pub best: Option<ScoredGuess>,
}

impl SolveAttempt {
    pub fn new() -> Self {
        Self {
            attempt_number: 0,
            best: None,
        }
    }

    pub fn best_text(&self) -> &str {
        self.best.as_ref().map(|g| g.text.as_str()).unwrap_or("")
    }

    pub fn best_confidence(&self) -> f64 {
        self.best.as_ref().map(|g| g.confidence).unwrap_or(-1.0)
    }

    /// Keep `guess` as the fallback if it beats everything seen so far.
    pub fn record(&mut self, guess: &ScoredGuess) {
        if guess.confidence > self.best_confidence() {
            self.best = Some(guess.clone());
        }
    }
}

impl Default for SolveAttempt {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Ready,
    Failed,
}

/// A job submitted to the remote solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: String,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    #[test]
    fn test_captcha_image_roundtrips_pixels() {
        let gray: GrayImage = ImageBuffer::from_fn(12, 8, |x, _| Luma([(x * 20) as u8]));
        let image = CaptchaImage::from_pixels(DynamicImage::ImageLuma8(gray)).unwrap();
        assert_eq!(image.dimensions(), (12, 8));
        assert!(!image.encoded().is_empty());

        let decoded = CaptchaImage::from_bytes(image.encoded().to_vec()).unwrap();
        assert_eq!(decoded.pixels().to_luma8().get_pixel(3, 0)[0], 60);
    }

    #[test]
    fn test_captcha_image_rejects_garbage() {
        let result = CaptchaImage::from_bytes(b"not an image".to_vec());
        assert!(matches!(result, Err(CaptchaError::InvalidImage(_))));
    }

    #[test]
    fn test_solve_attempt_keeps_highest_confidence() {
        let mut attempt = SolveAttempt::new();
        assert_eq!(attempt.best_text(), "");

        let low = ScoredGuess {
            text: "AB12".into(),
            aggregate_score: 40.0,
            confidence: 40.0,
            source: GuessSource::Local,
        };
        let high = ScoredGuess {
            text: "AB123".into(),
            aggregate_score: 70.0,
            confidence: 70.0,
            source: GuessSource::Local,
        };

        attempt.record(&low);
        attempt.record(&high);
        attempt.record(&low);
        assert_eq!(attempt.best_text(), "AB123");
        assert_eq!(attempt.best_confidence(), 70.0);
    }

    #[test]
    fn test_candidate_confidence_is_clamped() {
        let c = RecognitionCandidate::new("AB", 140.0, SegmentationMode::SingleWord, "adaptive");
        assert_eq!(c.confidence, 100.0);
        let c = RecognitionCandidate::new("AB", -1.0, SegmentationMode::SingleWord, "adaptive");
        assert_eq!(c.confidence, 0.0);
    }
}
