use std::time::Duration;
use thiserror::Error;

use crate::config::SegmentationMode;

/// Failure kinds of the captcha solving core.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("Could not capture captcha image: {0}")]
    CaptureFailure(String),

    #[error("No usable read from pipeline {pipeline} with {mode}: {reason}")]
    RecognitionMiss {
        pipeline: String,
        mode: SegmentationMode,
        reason: String,
    },

    #[error("Invalid captcha image: {0}")]
    InvalidImage(String),

    #[error("Remote solver rejected the submission: {0}")]
    SubmissionError(String),

    #[error("Remote solver failed: {0}")]
    SolverError(String),

    #[error("Remote solver still not ready after {polls} polls")]
    NotReadyTimeout { polls: u32 },

    #[error("Remote solver is not configured (set TWOCAPTCHA_API_KEY)")]
    RemoteUnavailable,

    #[error("Captcha session exceeded its {0:?} budget")]
    SessionTimeout(Duration),
}

impl CaptchaError {
    /// Errors that only spoil the current attempt and count against the
    /// retry budget. Everything else ends the session.
    pub fn is_attempt_level(&self) -> bool {
        matches!(
            self,
            CaptchaError::RecognitionMiss { .. }
                | CaptchaError::InvalidImage(_)
                | CaptchaError::SubmissionError(_)
                | CaptchaError::SolverError(_)
                | CaptchaError::NotReadyTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_level_classification() {
        assert!(CaptchaError::SubmissionError("ERROR_ZERO_BALANCE".into()).is_attempt_level());
        assert!(CaptchaError::SolverError("ERROR_CAPTCHA_UNSOLVABLE".into()).is_attempt_level());
        assert!(CaptchaError::NotReadyTimeout { polls: 40 }.is_attempt_level());
        assert!(!CaptchaError::CaptureFailure("element not found".into()).is_attempt_level());
        assert!(!CaptchaError::RemoteUnavailable.is_attempt_level());
        assert!(!CaptchaError::SessionTimeout(Duration::from_secs(60)).is_attempt_level());
    }

    #[test]
    fn test_error_messages() {
        let err = CaptchaError::NotReadyTimeout { polls: 3 };
        assert_eq!(err.to_string(), "Remote solver still not ready after 3 polls");
    }
}
