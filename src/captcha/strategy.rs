use anyhow::Result;
use tracing::{debug, info, warn};

use super::controller::AcceptancePolicy;
use super::recognition::Recognizer;
use super::remote_solver::{HttpTransport, SolverTransport};
use super::tesseract::TesseractCli;
use super::{
    CandidateAggregator, CaptchaError, CaptchaImage, Challenge, ImagePreprocessor,
    RecognitionEngine, RemoteSolverClient, ScoredGuess,
};
use crate::config::{RemoteConfig, SolverConfig, Strategy};

/// Turns one captured image into one guess.
#[allow(async_fn_in_trait)]
pub trait CaptchaStrategy {
    async fn attempt(&self, image: &CaptchaImage) -> Result<ScoredGuess, CaptchaError>;
}

/// Preprocess, recognize and aggregate on this machine.
pub struct LocalSolver<R> {
    preprocessor: ImagePreprocessor,
    engine: RecognitionEngine<R>,
    aggregator: CandidateAggregator,
}

impl<R: Recognizer> LocalSolver<R> {
    pub fn new(
        preprocessor: ImagePreprocessor,
        engine: RecognitionEngine<R>,
        aggregator: CandidateAggregator,
    ) -> Self {
        Self {
            preprocessor,
            engine,
            aggregator,
        }
    }

    pub fn from_config(recognizer: R, config: &SolverConfig) -> Self {
        Self::new(
            ImagePreprocessor::from_config(config),
            RecognitionEngine::from_config(recognizer, config),
            CandidateAggregator::from_config(config),
        )
    }

    /// Runs synchronously; an image nothing can be read from gives an empty guess.
    pub fn solve_image(&self, image: &CaptchaImage) -> ScoredGuess {
        let variants = self.preprocessor.variants(image);
        let candidates = self.engine.candidates(&variants);
        debug!(
            "{} candidates from {} variants",
            candidates.len(),
            variants.len()
        );
        self.aggregator.aggregate(&candidates)
    }
}

impl<R: Recognizer> CaptchaStrategy for LocalSolver<R> {
    async fn attempt(&self, image: &CaptchaImage) -> Result<ScoredGuess, CaptchaError> {
        Ok(self.solve_image(image))
    }
}

/// Sends the image to the 2Captcha service.
pub struct RemoteSolver<T = HttpTransport> {
    client: RemoteSolverClient<T>,
}

impl RemoteSolver<HttpTransport> {
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        Ok(Self::new(RemoteSolverClient::new(config)?))
    }
}

impl<T: SolverTransport> RemoteSolver<T> {
    pub fn new(client: RemoteSolverClient<T>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RemoteSolverClient<T> {
        &self.client
    }
}

impl<T: SolverTransport> CaptchaStrategy for RemoteSolver<T> {
    async fn attempt(&self, image: &CaptchaImage) -> Result<ScoredGuess, CaptchaError> {
        let answer = self.client.solve(&Challenge::image(image)).await?;
        Ok(ScoredGuess::remote(answer))
    }
}

/// Local first; the same image goes to the remote service when the local
/// guess would be rejected.
pub struct HybridSolver<R, T = HttpTransport> {
    local: LocalSolver<R>,
    remote: RemoteSolver<T>,
    policy: AcceptancePolicy,
}

impl<R: Recognizer, T: SolverTransport> HybridSolver<R, T> {
    pub fn new(local: LocalSolver<R>, remote: RemoteSolver<T>, policy: AcceptancePolicy) -> Self {
        Self {
            local,
            remote,
            policy,
        }
    }
}

impl<R: Recognizer, T: SolverTransport> CaptchaStrategy for HybridSolver<R, T> {
    async fn attempt(&self, image: &CaptchaImage) -> Result<ScoredGuess, CaptchaError> {
        let guess = self.local.solve_image(image);
        if self.policy.accepts(&guess) {
            return Ok(guess);
        }
        info!(
            "Local guess '{}' ({:.1}) not good enough, falling back to 2Captcha",
            guess.text, guess.confidence
        );
        match self.remote.attempt(image).await {
            Ok(remote) => Ok(remote),
            // the rejected local read still competes for best guess
            Err(e) if e.is_attempt_level() => {
                warn!("2Captcha failed ({}), keeping local guess '{}'", e, guess.text);
                Ok(guess)
            }
            Err(e) => Err(e),
        }
    }
}

/// The strategy selected by [`SolverConfig::strategy`].
pub enum ConfiguredSolver<R = TesseractCli> {
    Local(LocalSolver<R>),
    Remote(RemoteSolver),
    Hybrid(HybridSolver<R>),
}

impl ConfiguredSolver<TesseractCli> {
    /// Locates tesseract only when the strategy recognizes locally.
    pub fn from_config(config: &SolverConfig, remote: Option<&RemoteConfig>) -> Result<Self> {
        match config.strategy {
            Strategy::Remote => Ok(Self::Remote(RemoteSolver::from_config(require_remote(
                remote,
            )?)?)),
            Strategy::Local | Strategy::Hybrid => {
                Self::with_recognizer(TesseractCli::locate()?, config, remote)
            }
        }
    }
}

impl<R: Recognizer> ConfiguredSolver<R> {
    pub fn with_recognizer(
        recognizer: R,
        config: &SolverConfig,
        remote: Option<&RemoteConfig>,
    ) -> Result<Self> {
        let solver = match config.strategy {
            Strategy::Local => Self::Local(LocalSolver::from_config(recognizer, config)),
            Strategy::Remote => {
                Self::Remote(RemoteSolver::from_config(require_remote(remote)?)?)
            }
            Strategy::Hybrid => Self::Hybrid(HybridSolver::new(
                LocalSolver::from_config(recognizer, config),
                RemoteSolver::from_config(require_remote(remote)?)?,
                AcceptancePolicy::from_config(config),
            )),
        };
        Ok(solver)
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::Local(_) => Strategy::Local,
            Self::Remote(_) => Strategy::Remote,
            Self::Hybrid(_) => Strategy::Hybrid,
        }
    }
}

impl<R: Recognizer> CaptchaStrategy for ConfiguredSolver<R> {
    async fn attempt(&self, image: &CaptchaImage) -> Result<ScoredGuess, CaptchaError> {
        match self {
            Self::Local(solver) => solver.attempt(image).await,
            Self::Remote(solver) => solver.attempt(image).await,
            Self::Hybrid(solver) => solver.attempt(image).await,
        }
    }
}

fn require_remote(remote: Option<&RemoteConfig>) -> Result<&RemoteConfig, CaptchaError> {
    remote
        .filter(|config| !config.api_key.trim().is_empty())
        .ok_or(CaptchaError::RemoteUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::recognition::RawRead;
    use crate::captcha::GuessSource;
    use crate::config::SegmentationMode;
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use std::cell::Cell;

    struct ConstRecognizer {
        text: &'static str,
        confidence: f64,
    }

    impl Recognizer for ConstRecognizer {
        fn recognize(&self, _: &GrayImage, _: SegmentationMode, _: &str) -> Result<RawRead> {
            Ok(RawRead {
                text: self.text.to_string(),
                confidence: self.confidence,
            })
        }
    }

    struct CountingTransport {
        fetches: Cell<u32>,
    }

    impl SolverTransport for CountingTransport {
        async fn submit(&self, _: &[(&'static str, String)]) -> Result<String> {
            Ok(r#"{"status":1,"request":"42"}"#.to_string())
        }

        async fn fetch(&self, _: &[(&'static str, String)]) -> Result<String> {
            self.fetches.set(self.fetches.get() + 1);
            Ok(r#"{"status":1,"request":"rEm07"}"#.to_string())
        }
    }

    /// 2Captcha refuses every job.
    struct BrokeTransport;

    impl SolverTransport for BrokeTransport {
        async fn submit(&self, _: &[(&'static str, String)]) -> Result<String> {
            Ok(r#"{"status":0,"request":"ERROR_ZERO_BALANCE"}"#.to_string())
        }

        async fn fetch(&self, _: &[(&'static str, String)]) -> Result<String> {
            unreachable!("nothing was submitted")
        }
    }

    fn captcha() -> CaptchaImage {
        // dark glyph-ish blocks on white
        let gray: GrayImage = ImageBuffer::from_fn(60, 24, |x, y| {
            if (8..12).contains(&y) || (x % 12 < 3 && (4..20).contains(&y)) {
                Luma([20])
            } else {
                Luma([235])
            }
        });
        CaptchaImage::from_pixels(DynamicImage::ImageLuma8(gray)).unwrap()
    }

    fn remote_client() -> RemoteSolverClient<CountingTransport> {
        let config = RemoteConfig {
            poll_interval: std::time::Duration::from_millis(1),
            ..RemoteConfig::new("k")
        };
        RemoteSolverClient::with_transport(
            &config,
            CountingTransport {
                fetches: Cell::new(0),
            },
        )
    }

    #[tokio::test]
    async fn test_local_solver_aggregates_all_reads() {
        let config = SolverConfig::default();
        let solver = LocalSolver::from_config(
            ConstRecognizer {
                text: "AB3X7",
                confidence: 88.0,
            },
            &config,
        );
        let guess = solver.attempt(&captcha()).await.unwrap();
        assert_eq!(guess.text, "AB3X7");
        assert_eq!(guess.confidence, 88.0);
        assert_eq!(guess.source, GuessSource::Local);
        assert!(guess.aggregate_score > 88.0);
    }

    #[tokio::test]
    async fn test_remote_guess_is_maximal() {
        let solver = RemoteSolver::new(remote_client());
        let guess = solver.attempt(&captcha()).await.unwrap();
        assert_eq!(guess.text, "rEm07");
        assert_eq!(guess.confidence, 100.0);
        assert_eq!(guess.source, GuessSource::Remote);
    }

    #[tokio::test]
    async fn test_hybrid_keeps_good_local_guess() {
        let config = SolverConfig::default();
        let local = LocalSolver::from_config(
            ConstRecognizer {
                text: "AB3X7",
                confidence: 90.0,
            },
            &config,
        );
        let hybrid = HybridSolver::new(
            local,
            RemoteSolver::new(remote_client()),
            AcceptancePolicy::from_config(&config),
        );
        let guess = hybrid.attempt(&captcha()).await.unwrap();
        assert_eq!(guess.text, "AB3X7");
        assert_eq!(hybrid.remote.client().transport().fetches.get(), 0);
    }

    #[tokio::test]
    async fn test_hybrid_falls_back_on_weak_local_guess() {
        let config = SolverConfig::default();
        let local = LocalSolver::from_config(
            ConstRecognizer {
                text: "AB3",
                confidence: 40.0,
            },
            &config,
        );
        let hybrid = HybridSolver::new(
            local,
            RemoteSolver::new(remote_client()),
            AcceptancePolicy::from_config(&config),
        );
        let guess = hybrid.attempt(&captcha()).await.unwrap();
        assert_eq!(guess.text, "rEm07");
        assert_eq!(guess.source, GuessSource::Remote);
    }

    #[tokio::test]
    async fn test_hybrid_keeps_weak_local_guess_when_remote_fails() {
        let config = SolverConfig::default();
        let local = LocalSolver::from_config(
            ConstRecognizer {
                text: "AB3X7",
                confidence: 50.0,
            },
            &config,
        );
        let remote = RemoteSolverClient::with_transport(&RemoteConfig::new("k"), BrokeTransport);
        let hybrid = HybridSolver::new(
            local,
            RemoteSolver::new(remote),
            AcceptancePolicy::from_config(&config),
        );

        let guess = hybrid.attempt(&captcha()).await.unwrap();

        assert_eq!(guess.text, "AB3X7");
        assert_eq!(guess.confidence, 50.0);
        assert_eq!(guess.source, GuessSource::Local);
    }

    #[test]
    fn test_remote_strategy_requires_api_key() {
        let config = SolverConfig {
            strategy: Strategy::Remote,
            ..SolverConfig::default()
        };
        let recognizer = ConstRecognizer {
            text: "",
            confidence: 0.0,
        };
        let err = ConfiguredSolver::with_recognizer(recognizer, &config, None)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<CaptchaError>(),
            Some(CaptchaError::RemoteUnavailable)
        ));
    }

    #[test]
    fn test_local_strategy_ignores_remote_config() {
        let recognizer = ConstRecognizer {
            text: "",
            confidence: 0.0,
        };
        let solver =
            ConfiguredSolver::with_recognizer(recognizer, &SolverConfig::default(), None).unwrap();
        assert_eq!(solver.strategy(), Strategy::Local);
    }
}
