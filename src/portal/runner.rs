use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use super::{normalize_document, CertificateSource, ChallengeKind, PortalProfile, TaxId};
use crate::captcha::remote_solver::extract_site_key;
use crate::captcha::{
    CaptchaError, Challenge, ConfiguredSolver, RemoteSolverClient, SolveController,
};
use crate::config::{RemoteConfig, SolverConfig};
use crate::document::{self, DocumentParser, DATE_FORMAT};
use crate::driver::{BrowserSession, PageDriver, WebDriverPage};
use crate::ledger::Ledger;

/// Result of fetching one certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub document: String,
    pub validity: Option<NaiveDate>,
    pub pdf_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl RecordOutcome {
    pub fn success(document: &str, validity: NaiveDate, pdf_path: Option<PathBuf>) -> Self {
        Self {
            document: document.to_string(),
            validity: Some(validity),
            pdf_path,
            error: None,
        }
    }

    pub fn failure(document: &str, error: impl Into<String>) -> Self {
        Self {
            document: document.to_string(),
            validity: None,
            pdf_path: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.validity.is_some() && self.error.is_none()
    }
}

/// Counts for the end-of-run report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: &[RecordOutcome]) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            processed: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed: {}, success: {}, failed: {}",
            self.processed, self.succeeded, self.failed
        )
    }
}

/// Drives one portal for every document in a ledger.
pub struct PortalRunner<'a> {
    session: &'a BrowserSession,
    profile: PortalProfile,
    config: SolverConfig,
    solver: Option<ConfiguredSolver>,
    remote: Option<RemoteSolverClient>,
    parser: DocumentParser,
    validity: Regex,
    out_dir: PathBuf,
    record_attempts: u32,
    download_timeout: Duration,
    session_deadline: Duration,
}

impl<'a> PortalRunner<'a> {
    pub fn new(
        session: &'a BrowserSession,
        profile: PortalProfile,
        config: SolverConfig,
        remote: Option<&RemoteConfig>,
        out_dir: PathBuf,
    ) -> Result<Self> {
        config.validate()?;
        let solver = match &profile.challenge {
            ChallengeKind::Image(_) => Some(ConfiguredSolver::from_config(&config, remote)?),
            _ => None,
        };
        let remote = match (&profile.challenge, remote) {
            (ChallengeKind::ReCaptcha | ChallengeKind::HCaptcha, Some(rc)) => {
                Some(RemoteSolverClient::new(rc)?)
            }
            (ChallengeKind::ReCaptcha | ChallengeKind::HCaptcha, None) => {
                return Err(CaptchaError::RemoteUnavailable.into())
            }
            _ => None,
        };

        Ok(Self {
            validity: profile.validity_pattern()?,
            session,
            profile,
            config,
            solver,
            remote,
            parser: DocumentParser::default(),
            out_dir,
            record_attempts: 3,
            download_timeout: Duration::from_secs(60),
            session_deadline: Duration::from_secs(300),
        })
    }

    pub fn with_parser(mut self, parser: DocumentParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_record_attempts(mut self, attempts: u32) -> Self {
        self.record_attempts = attempts.max(1);
        self
    }

    /// Process every ledger entry, writing validity dates back as they come.
    pub async fn run(&self, ledger: &mut Ledger) -> Result<RunSummary> {
        let entries = ledger.entries();
        info!(
            "🚀 {}: {} document(s) from {:?}",
            self.profile.name,
            entries.len(),
            ledger.path()
        );

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = self.process(&entry.document).await;
            if let Some(date) = outcome.validity {
                ledger.record(&outcome.document, &date.format(DATE_FORMAT).to_string())?;
            }
            outcomes.push(outcome);
        }

        let summary = RunSummary::from_outcomes(&outcomes);
        info!("🏁 {} finished ({})", self.profile.name, summary);
        Ok(summary)
    }

    /// Fetch one certificate, retrying the whole form a few times.
    pub async fn process(&self, document: &str) -> RecordOutcome {
        let id = match normalize_document(document) {
            Ok(id) => id,
            Err(e) => return RecordOutcome::failure(document, e.to_string()),
        };
        if !self.profile.accepts(&id) {
            return RecordOutcome::failure(
                id.digits(),
                format!("{} does not issue certificates for a {}", self.profile.name, id.kind()),
            );
        }

        let mut last_error = anyhow!("no attempt made");
        for attempt in 1..=self.record_attempts {
            info!(
                "Querying {} {} (attempt {}/{})",
                id.kind(),
                id,
                attempt,
                self.record_attempts
            );
            match self.fetch(&id).await {
                Ok(outcome) => {
                    match &outcome.validity {
                        Some(date) => info!("✅ {} → valid until {}", id, date.format(DATE_FORMAT)),
                        None => warn!("{} → certificate saved without a validity date", id),
                    }
                    return outcome;
                }
                Err(e) => {
                    warn!("{} → attempt {} failed: {:#}", id, attempt, e);
                    last_error = e;
                }
            }
        }

        error!("{} → ERROR: {:#}", id, last_error);
        RecordOutcome::failure(id.digits(), format!("{:#}", last_error))
    }

    async fn fetch(&self, id: &TaxId) -> Result<RecordOutcome> {
        let started = SystemTime::now();
        self.session.goto(self.profile.url).await?;
        for selector in &self.profile.prepare {
            self.session.click(selector).await?;
        }
        self.session
            .fill(self.profile.document_field, id.digits())
            .await?;
        sleep(Duration::from_millis(1500)).await;

        match &self.profile.challenge {
            ChallengeKind::None => self.session.click(self.profile.submit).await?,
            ChallengeKind::Image(selectors) => {
                let page = WebDriverPage::new(self.session, selectors)
                    .with_refill(self.profile.document_field, id.digits());
                self.solve_image(&page).await?;
            }
            kind @ (ChallengeKind::ReCaptcha | ChallengeKind::HCaptcha) => {
                self.solve_token(kind).await?;
                self.session.click(self.profile.submit).await?;
            }
        }

        sleep(Duration::from_secs(3)).await;
        for selector in &self.profile.follow_up {
            self.session.click(selector).await?;
            sleep(Duration::from_secs(2)).await;
        }

        match self.profile.source {
            CertificateSource::Download => {
                let downloaded = self
                    .session
                    .wait_for_download(started, self.download_timeout)
                    .await?;
                // an unreadable PDF is still filed, as erro_<doc>.pdf
                let validity = match self.parser.validity(&downloaded, &self.validity) {
                    Ok(validity) => validity,
                    Err(e) => {
                        warn!("Could not read {:?}: {:#}", downloaded, e);
                        None
                    }
                };
                let filed = document::file_certificate(
                    &downloaded,
                    &self.out_dir,
                    self.profile.file_prefix,
                    id.digits(),
                    validity,
                )?;
                Ok(match validity {
                    Some(date) => RecordOutcome::success(id.digits(), date, Some(filed)),
                    None => RecordOutcome {
                        pdf_path: Some(filed),
                        ..RecordOutcome::failure(id.digits(), "validity date not found in PDF")
                    },
                })
            }
            CertificateSource::Page => {
                let text = self.session.page_text().await?;
                let validity = document::extract_validity(&text, &self.validity)
                    .context("validity date not found on result page")?;
                Ok(RecordOutcome::success(id.digits(), validity, None))
            }
        }
    }

    async fn solve_image(&self, page: &WebDriverPage<'_>) -> Result<()> {
        let solver = self
            .solver
            .as_ref()
            .context("no captcha solver configured")?;
        let controller = SolveController::new(page, solver, &self.config);
        let outcome = controller.solve_within(self.session_deadline).await?;

        let answer = outcome.answer();
        if answer.is_empty() {
            bail!("Captcha not solved after {} attempts", outcome.attempts());
        }
        if !outcome.is_accepted() {
            warn!("Submitting best unconfirmed guess '{}'", answer);
        }
        page.submit_answer(answer).await
    }

    async fn solve_token(&self, kind: &ChallengeKind) -> Result<()> {
        let remote = self.remote.as_ref().ok_or(CaptchaError::RemoteUnavailable)?;
        let field = kind
            .response_field()
            .context("challenge has no response field")?;

        let html = self.session.source().await?;
        let site_key = extract_site_key(&html).context("Site key not found on page")?;
        let page_url = self.session.current_url().await?;
        info!("Found site key: {}", site_key);

        let challenge = match kind {
            ChallengeKind::HCaptcha => Challenge::HCaptcha { site_key, page_url },
            _ => Challenge::ReCaptcha { site_key, page_url },
        };
        let token = remote.solve(&challenge).await?;
        self.session.inject_token(field, &token).await?;
        sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}
