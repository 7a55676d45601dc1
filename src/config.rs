use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Case-sensitive alphanumeric set accepted from the recognizer.
pub const DEFAULT_CHARSET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Extra symbols allowed when arithmetic challenges are enabled.
pub const ARITHMETIC_SYMBOLS: &str = "+-xX*=";

pub const DEFAULT_REMOTE_BASE_URL: &str = "http://2captcha.com";

/// Layout hint handed to the recognition backend.
///
/// The discriminants are Tesseract page segmentation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// Treat the image as a single text line (psm 7).
    SingleLine,
    /// Treat the image as a single word (psm 8).
    SingleWord,
    /// Raw line, bypassing Tesseract-specific layout hacks (psm 13).
    RawLine,
}

impl SegmentationMode {
    pub const ALL: [SegmentationMode; 3] = [
        SegmentationMode::SingleLine,
        SegmentationMode::SingleWord,
        SegmentationMode::RawLine,
    ];

    pub fn psm(self) -> u8 {
        match self {
            SegmentationMode::SingleLine => 7,
            SegmentationMode::SingleWord => 8,
            SegmentationMode::RawLine => 13,
        }
    }

    pub fn from_psm(psm: u8) -> Option<Self> {
        match psm {
            7 => Some(SegmentationMode::SingleLine),
            8 => Some(SegmentationMode::SingleWord),
            13 => Some(SegmentationMode::RawLine),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "psm{}", self.psm())
    }
}

/// Which solving strategy a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Self-hosted preprocessing + OCR ensemble.
    Local,
    /// Outsourced to the remote solving service.
    Remote,
    /// Local first, remote when the local guess would be rejected.
    Hybrid,
}

impl Strategy {
    pub fn needs_remote(self) -> bool {
        matches!(self, Strategy::Remote | Strategy::Hybrid)
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "ocr" => Ok(Strategy::Local),
            "remote" | "2captcha" => Ok(Strategy::Remote),
            "hybrid" => Ok(Strategy::Hybrid),
            other => Err(anyhow!("Unknown captcha strategy: {}", other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Local => "local",
            Strategy::Remote => "remote",
            Strategy::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

/// Tunables for one captcha solve session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Known answer length; `None` disables every length heuristic.
    pub expected_length: Option<usize>,
    pub charset: String,
    pub segmentation_modes: Vec<SegmentationMode>,
    pub max_pipelines: usize,
    pub upscale: f32,
    pub deskew: bool,
    pub min_confidence: f64,
    pub length_penalty: f64,
    pub score_floor: f64,
    pub max_attempts: u32,
    /// Evaluate `<int><op><int>[=]` answers instead of returning them literally.
    pub arithmetic: bool,
    pub strategy: Strategy,
    pub refresh_delay_ms: u64,
    pub refresh_jitter_ms: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            expected_length: Some(5),
            charset: DEFAULT_CHARSET.to_string(),
            segmentation_modes: SegmentationMode::ALL.to_vec(),
            max_pipelines: 6,
            upscale: 2.8,
            deskew: true,
            min_confidence: 65.0,
            length_penalty: 2.0,
            score_floor: -50.0,
            max_attempts: 5,
            arithmetic: false,
            strategy: Strategy::Local,
            refresh_delay_ms: 800,
            refresh_jitter_ms: 600,
        }
    }
}

impl SolverConfig {
    /// Default configuration with `CAPTCHA_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(len) = env_parse::<i64>("CAPTCHA_EXPECTED_LEN")? {
            config.expected_length = usize::try_from(len).ok().filter(|l| *l > 0);
        }
        if let Some(charset) = env_string("CAPTCHA_CHARSET") {
            config.charset = charset;
        }
        if let Some(modes) = env_string("CAPTCHA_PSMS") {
            config.segmentation_modes = parse_modes(&modes)?;
        }
        if let Some(value) = env_parse("CAPTCHA_MIN_CONFIDENCE")? {
            config.min_confidence = value;
        }
        if let Some(value) = env_parse("CAPTCHA_LENGTH_PENALTY")? {
            config.length_penalty = value;
        }
        if let Some(value) = env_parse("CAPTCHA_MAX_ATTEMPTS")? {
            config.max_attempts = value;
        }
        if let Some(value) = env_parse("CAPTCHA_MAX_PIPELINES")? {
            config.max_pipelines = value;
        }
        if let Some(value) = env_parse("CAPTCHA_ARITHMETIC")? {
            config.arithmetic = value;
        }
        if let Some(value) = env_string("CAPTCHA_STRATEGY") {
            config.strategy = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.segmentation_modes.is_empty() {
            bail!("At least one segmentation mode is required");
        }
        if self.max_pipelines == 0 {
            bail!("max_pipelines must be at least 1");
        }
        if !(self.upscale.is_finite() && self.upscale >= 1.0) {
            bail!("upscale factor must be >= 1.0, got {}", self.upscale);
        }
        if self.charset.is_empty() {
            bail!("charset cannot be empty");
        }
        Ok(())
    }

    /// Character whitelist handed to the recognizer.
    pub fn recognizer_charset(&self) -> String {
        let mut charset = self.charset.clone();
        if self.arithmetic {
            for symbol in ARITHMETIC_SYMBOLS.chars() {
                if !charset.contains(symbol) {
                    charset.push(symbol);
                }
            }
        }
        charset
    }

    pub fn expected_len(&self) -> usize {
        self.expected_length.unwrap_or(0)
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

/// Connection settings for the remote solving service.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub api_key: String,
    pub base_url: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub request_timeout: Duration,
}

// Keeps the api key out of logs.
impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("poll_interval", &self.poll_interval)
            .field("max_polls", &self.max_polls)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_REMOTE_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(5),
            max_polls: 40,
            request_timeout: Duration::from_secs(40),
        }
    }

    /// Check if 2Captcha API key is configured
    pub fn is_available() -> bool {
        env_string("TWOCAPTCHA_API_KEY").is_some()
    }

    /// Create from environment variables; `None` when no API key is set.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(api_key) = env_string("TWOCAPTCHA_API_KEY") else {
            return Ok(None);
        };

        let mut config = Self::new(api_key);
        if let Some(base_url) = env_string("TWOCAPTCHA_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(secs) = env_parse::<u64>("CAPTCHA_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(max_polls) = env_parse("CAPTCHA_MAX_POLLS")? {
            config.max_polls = max_polls;
        }
        Ok(Some(config))
    }
}

/// Parses a comma separated list of psm numbers, e.g. `7,8,13`.
pub fn parse_modes(value: &str) -> Result<Vec<SegmentationMode>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let psm: u8 = s
                .parse()
                .with_context(|| format!("Invalid segmentation mode: {}", s))?;
            SegmentationMode::from_psm(psm)
                .ok_or_else(|| anyhow!("Unsupported segmentation mode: psm {}", psm))
        })
        .collect()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(None),
    }
}
