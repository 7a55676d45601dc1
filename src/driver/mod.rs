pub mod webdriver;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::captcha::{CaptchaError, CaptchaImage};

pub use webdriver::{BrowserSession, WebDriverPage};

/// What the solve loop needs from a browser page.
#[allow(async_fn_in_trait)]
pub trait PageDriver {
    /// The captcha as currently rendered. Errors other than
    /// [`CaptchaError::InvalidImage`] end the solve session.
    async fn capture(&self) -> Result<CaptchaImage, CaptchaError>;

    /// Ask for a new challenge: refresh control if there is one, else reload.
    async fn refresh(&self) -> Result<()>;

    /// Type the answer and advance the form.
    async fn submit_answer(&self, answer: &str) -> Result<()>;
}

/// CSS selectors locating an image captcha on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaSelectors {
    pub image: String,
    pub input: String,
    /// Clicking it renders a new challenge.
    pub refresh: Option<String>,
    pub submit: Option<String>,
}

impl CaptchaSelectors {
    pub fn new(image: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            input: input.into(),
            refresh: None,
            submit: None,
        }
    }

    pub fn with_refresh(mut self, selector: impl Into<String>) -> Self {
        self.refresh = Some(selector.into());
        self
    }

    pub fn with_submit(mut self, selector: impl Into<String>) -> Self {
        self.submit = Some(selector.into());
        self
    }
}
