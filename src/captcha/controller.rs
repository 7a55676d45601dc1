use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::strategy::CaptchaStrategy;
use super::{CaptchaError, ScoredGuess, SolveAttempt};
use crate::config::SolverConfig;
use crate::driver::PageDriver;

/// When a guess is good enough to submit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptancePolicy {
    pub expected_length: Option<usize>,
    pub min_confidence: f64,
}

impl AcceptancePolicy {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            expected_length: config.expected_length.filter(|l| *l > 0),
            min_confidence: config.min_confidence,
        }
    }

    pub fn accepts(&self, guess: &ScoredGuess) -> bool {
        !guess.is_empty()
            && self
                .expected_length
                .map_or(true, |len| guess.text.chars().count() == len)
            && guess.confidence >= self.min_confidence
    }
}

/// How a solve session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    Accepted { guess: ScoredGuess, attempts: u32 },
    /// Every attempt was used; carries the most confident guess seen, if any.
    Exhausted {
        best: Option<ScoredGuess>,
        attempts: u32,
    },
}

impl SolveOutcome {
    /// The text to type into the form, possibly empty.
    pub fn answer(&self) -> &str {
        match self {
            SolveOutcome::Accepted { guess, .. } => &guess.text,
            SolveOutcome::Exhausted { best, .. } => {
                best.as_ref().map(|g| g.text.as_str()).unwrap_or("")
            }
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SolveOutcome::Accepted { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            SolveOutcome::Accepted { attempts, .. } | SolveOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Capture, solve, evaluate and refresh until a guess is accepted or the
/// attempt budget runs out.
pub struct SolveController<'a, D, S> {
    driver: &'a D,
    strategy: &'a S,
    policy: AcceptancePolicy,
    max_attempts: u32,
    refresh_delay: Duration,
    refresh_jitter_ms: u64,
}

impl<'a, D: PageDriver, S: CaptchaStrategy> SolveController<'a, D, S> {
    pub fn new(driver: &'a D, strategy: &'a S, config: &SolverConfig) -> Self {
        Self {
            driver,
            strategy,
            policy: AcceptancePolicy::from_config(config),
            max_attempts: config.max_attempts.max(1),
            refresh_delay: config.refresh_delay(),
            refresh_jitter_ms: config.refresh_jitter_ms,
        }
    }

    pub fn policy(&self) -> &AcceptancePolicy {
        &self.policy
    }

    /// Only a failed capture aborts the session; every other failure costs
    /// one attempt.
    pub async fn solve(&self) -> Result<SolveOutcome, CaptchaError> {
        let session = Uuid::new_v4();
        let span = info_span!("captcha", session = %session);
        self.run().instrument(span).await
    }

    /// [`solve`](Self::solve) bounded by a wall-clock deadline for the whole session.
    pub async fn solve_within(&self, deadline: Duration) -> Result<SolveOutcome, CaptchaError> {
        timeout(deadline, self.solve())
            .await
            .map_err(|_| CaptchaError::SessionTimeout(deadline))?
    }

    async fn run(&self) -> Result<SolveOutcome, CaptchaError> {
        let mut state = SolveAttempt::new();

        for attempt in 1..=self.max_attempts {
            state.attempt_number = attempt;
            info!("🔐 Captcha attempt {}/{}", attempt, self.max_attempts);

            match self.driver.capture().await {
                Ok(image) => match self.strategy.attempt(&image).await {
                    Ok(guess) => {
                        state.record(&guess);
                        if self.policy.accepts(&guess) {
                            info!(
                                "✅ Accepted '{}' ({:.1}) on attempt {}",
                                guess.text, guess.confidence, attempt
                            );
                            return Ok(SolveOutcome::Accepted {
                                guess,
                                attempts: attempt,
                            });
                        }
                        warn!(
                            "Rejected '{}' ({:.1}) on attempt {}",
                            guess.text, guess.confidence, attempt
                        );
                    }
                    Err(e) if e.is_attempt_level() => {
                        warn!("Attempt {} failed: {}", attempt, e);
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_attempt_level() => {
                    warn!("Attempt {} produced no usable image: {}", attempt, e);
                }
                Err(e) => return Err(e),
            }

            if attempt < self.max_attempts {
                self.refresh().await;
            }
        }

        warn!(
            "❌ No guess accepted after {} attempts, best so far '{}' ({:.1})",
            self.max_attempts,
            state.best_text(),
            state.best_confidence()
        );
        Ok(SolveOutcome::Exhausted {
            best: state.best,
            attempts: self.max_attempts,
        })
    }

    async fn refresh(&self) {
        if let Err(e) = self.driver.refresh().await {
            warn!("Captcha refresh failed: {:#}", e);
        }
        let jitter = if self.refresh_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.refresh_jitter_ms)
        } else {
            0
        };
        sleep(self.refresh_delay + Duration::from_millis(jitter)).await;
    }
}
