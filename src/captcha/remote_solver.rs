use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{CaptchaError, CaptchaImage, JobStatus, RemoteJob};
use crate::config::RemoteConfig;

const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Response from the 2Captcha `in.php` / `res.php` endpoints
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiResponse {
    pub status: i32,
    pub request: String,
}

impl ApiResponse {
    /// Accepts both the `json=1` payload and the legacy `OK|<value>` text form.
    pub fn parse(body: &str) -> Self {
        let body = body.trim();
        if let Ok(response) = serde_json::from_str::<ApiResponse>(body) {
            return response;
        }
        match body.strip_prefix("OK|") {
            Some(value) => Self {
                status: 1,
                request: value.to_string(),
            },
            None => Self {
                status: 0,
                request: body.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 1
    }
}

/// What gets sent to the solving service.
#[derive(Debug, Clone, PartialEq)]
pub enum Challenge {
    /// Base64 encoded captcha image.
    Image { body: String },
    ReCaptcha { site_key: String, page_url: String },
    HCaptcha { site_key: String, page_url: String },
}

impl Challenge {
    pub fn image(image: &CaptchaImage) -> Self {
        Challenge::Image {
            body: BASE64.encode(image.encoded()),
        }
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Challenge::Image { body } => vec![
                ("method", "base64".to_string()),
                ("body", body.clone()),
            ],
            Challenge::ReCaptcha { site_key, page_url } => vec![
                ("method", "userrecaptcha".to_string()),
                ("googlekey", site_key.clone()),
                ("pageurl", page_url.clone()),
            ],
            Challenge::HCaptcha { site_key, page_url } => vec![
                ("method", "hcaptcha".to_string()),
                ("sitekey", site_key.clone()),
                ("pageurl", page_url.clone()),
            ],
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Challenge::Image { .. } => "image",
            Challenge::ReCaptcha { .. } => "reCAPTCHA",
            Challenge::HCaptcha { .. } => "hCaptcha",
        }
    }
}

/// Wire access to the solving service; returns raw response bodies.
#[allow(async_fn_in_trait)]
pub trait SolverTransport {
    async fn submit(&self, form: &[(&'static str, String)]) -> Result<String>;
    async fn fetch(&self, query: &[(&'static str, String)]) -> Result<String>;
}

/// reqwest transport against `<base_url>/in.php` and `<base_url>/res.php`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl SolverTransport for HttpTransport {
    async fn submit(&self, form: &[(&'static str, String)]) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    async fn fetch(&self, query: &[(&'static str, String)]) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/res.php", self.base_url))
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

/// 2Captcha API client: submit a challenge, then poll until it is solved.
pub struct RemoteSolverClient<T = HttpTransport> {
    api_key: String,
    transport: T,
    poll_interval: Duration,
    max_polls: u32,
}

impl RemoteSolverClient<HttpTransport> {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.base_url, config.request_timeout)?;
        Ok(Self::with_transport(config, transport))
    }

    /// Create from environment variables; `None` when no API key is set.
    pub fn from_env() -> Result<Option<Self>> {
        match RemoteConfig::from_env()? {
            Some(config) => Ok(Some(Self::new(&config)?)),
            None => Ok(None),
        }
    }
}

impl<T: SolverTransport> RemoteSolverClient<T> {
    pub fn with_transport(config: &RemoteConfig, transport: T) -> Self {
        Self {
            api_key: config.api_key.clone(),
            transport,
            poll_interval: config.poll_interval,
            max_polls: config.max_polls,
        }
    }

    pub fn max_polls(&self) -> u32 {
        self.max_polls
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn submit(&self, challenge: &Challenge) -> Result<RemoteJob, CaptchaError> {
        let mut form = vec![("key", self.api_key.clone()), ("json", "1".to_string())];
        form.extend(challenge.fields());

        debug!("Submitting {} captcha to 2Captcha...", challenge.kind());
        let body = self
            .transport
            .submit(&form)
            .await
            .map_err(|e| CaptchaError::SubmissionError(e.to_string()))?;

        let response = ApiResponse::parse(&body);
        if !response.is_ok() {
            return Err(CaptchaError::SubmissionError(response.request));
        }

        info!("Captcha submitted, ID: {}", response.request);
        Ok(RemoteJob {
            id: response.request,
            submitted_at: Utc::now(),
            status: JobStatus::Queued,
        })
    }

    /// Waits `poll_interval` before each status query, at most `max_polls` times.
    pub async fn poll(&self, job_id: &str) -> Result<String, CaptchaError> {
        let query = vec![
            ("key", self.api_key.clone()),
            ("action", "get".to_string()),
            ("id", job_id.to_string()),
            ("json", "1".to_string()),
        ];

        for attempt in 1..=self.max_polls {
            sleep(self.poll_interval).await;

            let body = self
                .transport
                .fetch(&query)
                .await
                .map_err(|e| CaptchaError::SolverError(e.to_string()))?;
            let response = ApiResponse::parse(&body);

            if response.is_ok() {
                info!(
                    "✅ Captcha {} solved (poll {}/{})",
                    job_id, attempt, self.max_polls
                );
                return Ok(response.request.trim().to_string());
            }
            if response.request != NOT_READY {
                warn!("Unexpected response from 2Captcha: {}", response.request);
                return Err(CaptchaError::SolverError(response.request));
            }
            debug!(
                "Captcha not ready yet, waiting... (poll {}/{})",
                attempt, self.max_polls
            );
        }

        Err(CaptchaError::NotReadyTimeout {
            polls: self.max_polls,
        })
    }

    /// Submit then poll; returns the answer text or token.
    pub async fn solve(&self, challenge: &Challenge) -> Result<String, CaptchaError> {
        info!("🤖 Solving {} using 2Captcha API...", challenge.kind());
        let mut job = self.submit(challenge).await?;
        match self.poll(&job.id).await {
            Ok(answer) => {
                job.status = JobStatus::Ready;
                debug!(
                    "Job {} ready after {}s",
                    job.id,
                    (Utc::now() - job.submitted_at).num_seconds()
                );
                Ok(answer)
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                debug!("Job {} ended as {:?}: {}", job.id, job.status, e);
                Err(e)
            }
        }
    }

    /// Check account balance
    pub async fn balance(&self) -> Result<f64> {
        let query = vec![
            ("key", self.api_key.clone()),
            ("action", "getbalance".to_string()),
            ("json", "1".to_string()),
        ];
        let body = self.transport.fetch(&query).await?;
        let response = ApiResponse::parse(&body);
        let value = if response.is_ok() {
            response.request
        } else {
            body.trim().to_string()
        };
        value
            .parse::<f64>()
            .with_context(|| format!("Failed to parse balance: {}", value))
    }
}

/// Get the reCAPTCHA / hCaptcha site key from page HTML
pub fn extract_site_key(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    if let Ok(selector) = Selector::parse("[data-sitekey]") {
        let key = document
            .select(&selector)
            .filter_map(|el| el.value().attr("data-sitekey"))
            .map(str::trim)
            .find(|key| !key.is_empty());
        if let Some(key) = key {
            return Some(key.to_string());
        }
    }

    // Alternative pattern: grecaptcha.execute('SITE_KEY')
    let pattern = Regex::new(r#"grecaptcha\.execute\(\s*['"]([^'"]+)['"]"#).ok()?;
    pattern
        .captures(html)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    #[test]
    fn test_extract_site_key() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LdTest1234567890"></div>"#;
        let site_key = extract_site_key(html);
        assert_eq!(site_key, Some("6LdTest1234567890".to_string()));
    }

    #[test]
    fn test_extract_site_key_hcaptcha() {
        let html = r#"<form><div class="h-captcha" data-sitekey="93b08d40-d46c-400a-ba07-6f91cda815b9"></div></form>"#;
        assert_eq!(
            extract_site_key(html).as_deref(),
            Some("93b08d40-d46c-400a-ba07-6f91cda815b9")
        );
    }

    #[test]
    fn test_extract_site_key_alternative() {
        let html = r#"<script>grecaptcha.execute('6LdAlternative123');</script>"#;
        let site_key = extract_site_key(html);
        assert_eq!(site_key, Some("6LdAlternative123".to_string()));
    }

    #[test]
    fn test_extract_site_key_missing() {
        assert_eq!(extract_site_key("<html><body></body></html>"), None);
    }

    #[test]
    fn test_parse_json_response() {
        let ok = ApiResponse::parse(r#"{"status":1,"request":"2122988149"}"#);
        assert!(ok.is_ok());
        assert_eq!(ok.request, "2122988149");

        let not_ready = ApiResponse::parse(r#"{"status":0,"request":"CAPCHA_NOT_READY"}"#);
        assert!(!not_ready.is_ok());
        assert_eq!(not_ready.request, NOT_READY);
    }

    #[test]
    fn test_parse_text_response() {
        assert_eq!(
            ApiResponse::parse("OK|xYz12\n"),
            ApiResponse {
                status: 1,
                request: "xYz12".to_string()
            }
        );
        assert_eq!(ApiResponse::parse("ERROR_WRONG_USER_KEY").request, "ERROR_WRONG_USER_KEY");
    }

    #[test]
    fn test_challenge_fields() {
        let challenge = Challenge::HCaptcha {
            site_key: "abc".into(),
            page_url: "https://sso.acesso.gov.br/login".into(),
        };
        let fields = challenge.fields();
        assert!(fields.contains(&("method", "hcaptcha".to_string())));
        assert!(fields.contains(&("sitekey", "abc".to_string())));

        let recaptcha = Challenge::ReCaptcha {
            site_key: "6Lc".into(),
            page_url: "https://consultasaj.tjam.jus.br".into(),
        };
        assert!(recaptcha.fields().contains(&("googlekey", "6Lc".to_string())));
    }

    /// Replays canned bodies; `fetch` repeats the last one when exhausted.
    struct ScriptedTransport {
        submit_body: String,
        fetch_bodies: RefCell<VecDeque<String>>,
        fetches: Cell<u32>,
        last_query: RefCell<Vec<(&'static str, String)>>,
    }

    impl ScriptedTransport {
        fn new(submit_body: &str, fetch_bodies: &[&str]) -> Self {
            Self {
                submit_body: submit_body.to_string(),
                fetch_bodies: RefCell::new(fetch_bodies.iter().map(|b| b.to_string()).collect()),
                fetches: Cell::new(0),
                last_query: RefCell::new(Vec::new()),
            }
        }
    }

    impl SolverTransport for ScriptedTransport {
        async fn submit(&self, _form: &[(&'static str, String)]) -> Result<String> {
            Ok(self.submit_body.clone())
        }

        async fn fetch(&self, query: &[(&'static str, String)]) -> Result<String> {
            self.fetches.set(self.fetches.get() + 1);
            *self.last_query.borrow_mut() = query.to_vec();
            let mut bodies = self.fetch_bodies.borrow_mut();
            let body = if bodies.len() > 1 {
                bodies.pop_front()
            } else {
                bodies.front().cloned()
            };
            Ok(body.unwrap_or_default())
        }
    }

    fn config(max_polls: u32) -> RemoteConfig {
        RemoteConfig {
            poll_interval: Duration::from_secs(5),
            max_polls,
            ..RemoteConfig::new("secret-key")
        }
    }

    const PENDING: &str = r#"{"status":0,"request":"CAPCHA_NOT_READY"}"#;

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_between_queries_until_ready() {
        let transport = ScriptedTransport::new(
            r#"{"status":1,"request":"777"}"#,
            &[PENDING, PENDING, PENDING, r#"{"status":1,"request":"xYz12"}"#],
        );
        let client = RemoteSolverClient::with_transport(&config(40), transport);

        let start = tokio::time::Instant::now();
        let answer = client
            .solve(&Challenge::Image { body: "aGk=".into() })
            .await
            .unwrap();

        assert_eq!(answer, "xYz12");
        assert_eq!(client.transport.fetches.get(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        let query = client.transport.last_query.borrow();
        assert!(query.contains(&("id", "777".to_string())));
        assert!(query.contains(&("action", "get".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_after_max_polls() {
        let transport = ScriptedTransport::new(r#"{"status":1,"request":"1"}"#, &[PENDING]);
        let client = RemoteSolverClient::with_transport(&config(3), transport);

        let result = client.poll("1").await;
        assert!(matches!(result, Err(CaptchaError::NotReadyTimeout { polls: 3 })));
        assert_eq!(client.transport.fetches.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_status() {
        let transport = ScriptedTransport::new("OK|1", &["ERROR_CAPTCHA_UNSOLVABLE"]);
        let client = RemoteSolverClient::with_transport(&config(10), transport);

        match client.poll("1").await {
            Err(CaptchaError::SolverError(reason)) => {
                assert_eq!(reason, "ERROR_CAPTCHA_UNSOLVABLE")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(client.transport.fetches.get(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let transport = ScriptedTransport::new(r#"{"status":0,"request":"ERROR_ZERO_BALANCE"}"#, &[]);
        let client = RemoteSolverClient::with_transport(&config(10), transport);

        let result = client.submit(&Challenge::Image { body: "aGk=".into() }).await;
        assert!(matches!(result, Err(CaptchaError::SubmissionError(ref r)) if r == "ERROR_ZERO_BALANCE"));
    }

    #[tokio::test]
    async fn test_balance() {
        let transport = ScriptedTransport::new("", &[r#"{"status":1,"request":"3.8452"}"#]);
        let client = RemoteSolverClient::with_transport(&config(10), transport);
        assert_eq!(client.balance().await.unwrap(), 3.8452);

        let plain = ScriptedTransport::new("", &["12.5"]);
        let client = RemoteSolverClient::with_transport(&config(10), plain);
        assert_eq!(client.balance().await.unwrap(), 12.5);
    }
}
