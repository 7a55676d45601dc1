use anyhow::Result;
use image::GrayImage;
use tracing::debug;

use super::{CaptchaError, ImageVariant, RecognitionCandidate};
use crate::config::{SegmentationMode, SolverConfig};

/// Text and mean confidence of one backend read. Confidence is negative
/// when the backend reported none.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRead {
    pub text: String,
    pub confidence: f64,
}

/// An OCR backend restricted to a character whitelist.
pub trait Recognizer {
    fn recognize(&self, image: &GrayImage, mode: SegmentationMode, charset: &str)
        -> Result<RawRead>;
}

impl<R: Recognizer + ?Sized> Recognizer for &R {
    fn recognize(
        &self,
        image: &GrayImage,
        mode: SegmentationMode,
        charset: &str,
    ) -> Result<RawRead> {
        (**self).recognize(image, mode, charset)
    }
}

/// Reads every variant under every configured segmentation mode.
pub struct RecognitionEngine<R> {
    recognizer: R,
    modes: Vec<SegmentationMode>,
    charset: String,
}

impl<R: Recognizer> RecognitionEngine<R> {
    pub fn new(recognizer: R, modes: Vec<SegmentationMode>, charset: impl Into<String>) -> Self {
        Self {
            recognizer,
            modes,
            charset: charset.into(),
        }
    }

    pub fn from_config(recognizer: R, config: &SolverConfig) -> Self {
        Self::new(
            recognizer,
            config.segmentation_modes.clone(),
            config.recognizer_charset(),
        )
    }

    /// A single read. Empty or failed reads come back as `RecognitionMiss`.
    pub fn read(
        &self,
        variant: &ImageVariant,
        mode: SegmentationMode,
    ) -> Result<RecognitionCandidate, CaptchaError> {
        let miss = |reason: String| CaptchaError::RecognitionMiss {
            pipeline: variant.pipeline.to_string(),
            mode,
            reason,
        };

        let raw = self
            .recognizer
            .recognize(&variant.pixels, mode, &self.charset)
            .map_err(|e| miss(e.to_string()))?;

        let text: String = raw
            .text
            .chars()
            .filter(|c| self.charset.contains(*c))
            .collect();
        if text.is_empty() {
            return Err(miss("empty read".to_string()));
        }

        Ok(RecognitionCandidate::new(
            text,
            raw.confidence,
            mode,
            variant.pipeline.to_string(),
        ))
    }

    /// All usable candidates across variants and modes; misses are dropped.
    pub fn candidates(&self, variants: &[ImageVariant]) -> Vec<RecognitionCandidate> {
        let mut candidates = Vec::with_capacity(variants.len() * self.modes.len());
        for variant in variants {
            for &mode in &self.modes {
                match self.read(variant, mode) {
                    Ok(candidate) => {
                        debug!(
                            "[{} {}] read '{}' ({:.1})",
                            candidate.pipeline, mode, candidate.text, candidate.confidence
                        );
                        candidates.push(candidate);
                    }
                    Err(e) => debug!("{}", e),
                }
            }
        }
        candidates
    }
}
