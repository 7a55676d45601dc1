use anyhow::{bail, Context, Result};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thirtyfour::prelude::*;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use super::{CaptchaSelectors, PageDriver};
use crate::captcha::{CaptchaError, CaptchaImage};

/// Suffixes Chrome uses for downloads still in progress.
const PARTIAL_SUFFIXES: [&str; 2] = ["crdownload", "tmp"];

/// A Chrome session behind a WebDriver server, downloading into one directory.
pub struct BrowserSession {
    driver: WebDriver,
    download_dir: PathBuf,
}

impl BrowserSession {
    pub async fn launch(webdriver_url: &str, headless: bool, download_dir: &Path) -> Result<Self> {
        fs::create_dir_all(download_dir).context("Failed to create download directory")?;
        let download_dir = download_dir
            .canonicalize()
            .context("Failed to resolve download directory")?;

        let mut caps = DesiredCapabilities::chrome();
        if headless {
            caps.add_chrome_arg("--headless")?;
        }
        caps.add_chrome_arg("--no-sandbox")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--disable-gpu")?;
        caps.add_chrome_arg("--window-size=1920,1080")?;
        caps.add_chrome_arg("--user-agent=Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")?;

        // Save PDFs instead of opening them in the viewer
        caps.add_chrome_option(
            "prefs",
            json!({
                "download.default_directory": download_dir.to_string_lossy(),
                "download.prompt_for_download": false,
                "plugins.always_open_pdf_externally": true,
            }),
        )?;

        let driver = WebDriver::new(webdriver_url, caps)
            .await
            .context("Failed to connect to WebDriver")?;
        info!("🌐 Browser ready, downloads go to {:?}", download_dir);

        Ok(Self {
            driver,
            download_dir,
        })
    }

    pub fn driver(&self) -> &WebDriver {
        &self.driver
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        self.driver
            .goto(url)
            .await
            .with_context(|| format!("Failed to open {}", url))?;
        sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    pub async fn find(&self, selector: &str) -> Result<WebElement> {
        self.driver
            .find(By::Css(selector))
            .await
            .with_context(|| format!("Element not found: {}", selector))
    }

    pub async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        let field = self.find(selector).await?;
        field.clear().await?;
        field.send_keys(value).await?;
        debug!("Filled {}", selector);
        Ok(())
    }

    pub async fn click(&self, selector: &str) -> Result<()> {
        self.find(selector).await?.click().await?;
        debug!("Clicked {}", selector);
        Ok(())
    }

    pub async fn source(&self) -> Result<String> {
        Ok(self.driver.source().await?)
    }

    pub async fn current_url(&self) -> Result<String> {
        Ok(self.driver.current_url().await?.to_string())
    }

    /// Visible text of the page body.
    pub async fn page_text(&self) -> Result<String> {
        Ok(self.find("body").await?.text().await?)
    }

    /// Write a solved token into the hidden response textarea and fire the
    /// events and callbacks the widget listens to.
    pub async fn inject_token(&self, field_name: &str, token: &str) -> Result<()> {
        let script = r#"
            var name = arguments[0];
            var token = arguments[1];
            var fields = document.querySelectorAll(
                "textarea[name='" + name + "'], textarea#" + name
            );
            fields.forEach(function (el) {
                el.style.display = 'block';
                el.innerHTML = token;
                el.value = token;
                el.dispatchEvent(new Event('input', { bubbles: true }));
                el.dispatchEvent(new Event('change', { bubbles: true }));
            });

            if (typeof ___grecaptcha_cfg !== 'undefined') {
                for (var id in ___grecaptcha_cfg.clients) {
                    var client = ___grecaptcha_cfg.clients[id];
                    if (client && typeof client.callback === 'function') {
                        try { client.callback(token); } catch (e) { console.log('Callback error:', e); }
                    }
                }
            }
            return fields.length;
        "#;

        let result = self
            .driver
            .execute(script, vec![json!(field_name), json!(token)])
            .await?;
        let injected: u64 = result.convert().unwrap_or(0);
        if injected == 0 {
            bail!("No '{}' field to receive the token", field_name);
        }
        info!("✅ Token injected into {} field(s) '{}'", injected, field_name);
        Ok(())
    }

    /// Wait for a finished PDF that appeared in the download directory after `since`.
    pub async fn wait_for_download(&self, since: SystemTime, timeout: Duration) -> Result<PathBuf> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(path) = latest_download(&self.download_dir, since)? {
                info!("📄 Downloaded {:?}", path);
                return Ok(path);
            }
            if Instant::now() >= deadline {
                bail!("Timeout waiting for a download after {}s", timeout.as_secs());
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn quit(self) -> Result<()> {
        self.driver.quit().await?;
        Ok(())
    }
}

/// Newest finished PDF in `dir` modified at or after `since`.
pub fn latest_download(dir: &Path, since: SystemTime) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))? {
        let entry = entry?;
        let path = entry.path();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some(ext) if PARTIAL_SUFFIXES.contains(&ext) => continue,
            Some("pdf") => {}
            _ => continue,
        }

        let modified = entry.metadata()?.modified()?;
        if modified < since {
            continue;
        }
        if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// The image captcha of a [`BrowserSession`] page.
pub struct WebDriverPage<'a> {
    session: &'a BrowserSession,
    selectors: &'a CaptchaSelectors,
    /// Fields to fill again after a full page reload.
    refill: Vec<(String, String)>,
}

impl<'a> WebDriverPage<'a> {
    pub fn new(session: &'a BrowserSession, selectors: &'a CaptchaSelectors) -> Self {
        Self {
            session,
            selectors,
            refill: Vec::new(),
        }
    }

    pub fn with_refill(mut self, selector: impl Into<String>, value: impl Into<String>) -> Self {
        self.refill.push((selector.into(), value.into()));
        self
    }

    async fn reload(&self) -> Result<()> {
        self.session.driver.refresh().await?;
        sleep(Duration::from_secs(2)).await;
        for (selector, value) in &self.refill {
            self.session.fill(selector, value).await?;
        }
        Ok(())
    }
}

impl PageDriver for WebDriverPage<'_> {
    async fn capture(&self) -> Result<CaptchaImage, CaptchaError> {
        let element = self
            .session
            .driver
            .find(By::Css(self.selectors.image.as_str()))
            .await
            .map_err(|e| CaptchaError::CaptureFailure(format!("{}: {}", self.selectors.image, e)))?;
        let png = element
            .screenshot_as_png()
            .await
            .map_err(|e| CaptchaError::CaptureFailure(e.to_string()))?;
        CaptchaImage::from_bytes(png)
    }

    async fn refresh(&self) -> Result<()> {
        if let Some(selector) = &self.selectors.refresh {
            match self.session.click(selector).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Refresh control unusable ({:#}), reloading page", e),
            }
        }
        self.reload().await
    }

    async fn submit_answer(&self, answer: &str) -> Result<()> {
        self.session.fill(&self.selectors.input, answer).await?;
        if let Some(submit) = &self.selectors.submit {
            sleep(Duration::from_millis(600)).await;
            self.session.click(submit).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_latest_download_ignores_partial_and_old_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.pdf"), b"%PDF-old").unwrap();
        let since = SystemTime::now() - StdDuration::from_secs(60);

        fs::write(dir.path().join("certidao.pdf.crdownload"), b"partial").unwrap();
        fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        assert!(latest_download(dir.path(), SystemTime::now() + StdDuration::from_secs(60))
            .unwrap()
            .is_none());

        let found = latest_download(dir.path(), since).unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "old.pdf");
    }

    #[test]
    fn test_latest_download_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_download(dir.path(), SystemTime::UNIX_EPOCH)
            .unwrap()
            .is_none());
    }
}
