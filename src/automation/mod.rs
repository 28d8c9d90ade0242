//! Browser automation seam.
//!
//! Runners talk to the browser exclusively through [`AutomationSession`]. The
//! production implementation drives a WebDriver endpoint; tests use a scripted
//! in-memory page.

pub mod cancel;
pub mod webdriver;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AutomationError;
use crate::model::WorkerId;

pub use cancel::{CancelToken, Deadline};
pub use webdriver::WebDriverFactory;

/// XPath expression identifying an element on the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn xpath(expr: impl Into<String>) -> Self {
        Locator(expr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an element can be clicked right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actionability {
    Enabled,
    Disabled,
    NotFound,
}

/// Outcome of uploading a file and waiting for its preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Timeout,
    Stopped,
    Error(AutomationError),
}

/// One blocking, stateful browser session. Never shared between runners.
pub trait AutomationSession: Send {
    fn navigate(&mut self, url: &str) -> Result<(), AutomationError>;

    fn current_url(&mut self) -> Option<String>;

    /// Attach `file` to `input` and wait until `confirmation` shows a new image
    /// source. The wait polls `cancel` and never exceeds `timeout`.
    fn upload_and_await_confirmation(
        &mut self,
        input: &Locator,
        file: &Path,
        confirmation: &Locator,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> UploadOutcome;

    fn is_actionable(&mut self, locator: &Locator) -> Actionability;

    fn click(&mut self, locator: &Locator) -> Result<(), AutomationError>;

    fn find_text(&mut self, locator: &Locator) -> Option<String>;

    fn find_attribute(&mut self, locator: &Locator, name: &str) -> Option<String>;

    fn element_visible(&mut self, locator: &Locator) -> bool;

    /// Clear local storage, session storage and cookies.
    fn clear_site_data(&mut self) -> Result<(), AutomationError>;

    fn refresh(&mut self) -> Result<(), AutomationError>;

    /// Discard the underlying browser and start a fresh one in place.
    fn hard_restart_session(&mut self) -> Result<(), AutomationError>;

    /// Download a resource the page produced (`http(s)` or `data:` URL).
    fn fetch_resource(&mut self, url: &str, timeout: Duration) -> Result<Vec<u8>, AutomationError>;

    /// Handle that can tear the session down from another thread.
    fn kill_handle(&self) -> Arc<dyn SessionKill>;

    fn close(&mut self);
}

/// Forcible teardown used by `kill()`; in-flight calls on the session fail afterwards.
pub trait SessionKill: Send + Sync {
    fn terminate(&self);
}

/// Creates sessions for runners.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        worker: &WorkerId,
        headless: bool,
    ) -> Result<Box<dyn AutomationSession>, AutomationError>;
}

/// An image `src` the page has actually loaded.
pub fn is_loaded_image_src(src: &str) -> bool {
    src.starts_with("blob:") || src.starts_with("http") || src.starts_with("data:image")
}

/// Page URL and element locators of the face-swap tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub url: String,
    /// Present once the page is usable.
    pub ready: Locator,
    pub face_input: Locator,
    pub face_thumbnail: Locator,
    pub source_input: Locator,
    pub source_thumbnail: Locator,
    pub trigger: Locator,
    pub progress_percentage: Locator,
    pub result_image: Locator,
    pub rate_limit_title: Locator,
    pub rate_limit_dismiss: Locator,
}

const PANE: &str = "//div[@id='pane-1']";

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            url: "https://pixnova.ai/ai-face-swap/#playground".to_string(),
            ready: Locator::xpath(PANE),
            face_input: Locator::xpath(format!(
                "{PANE}//div[@id='faceImage']//input[@type='file']"
            )),
            face_thumbnail: Locator::xpath(format!(
                "{PANE}//div[@id='faceImage']/preceding-sibling::span[contains(@class,'el-avatar')]/img[@src]"
            )),
            source_input: Locator::xpath(format!(
                "{PANE}//div[@id='sourceImage']//input[@type='file']"
            )),
            source_thumbnail: Locator::xpath(format!(
                "{PANE}//div[@id='sourceImage']/preceding-sibling::span[contains(@class,'el-avatar')]/img[@src]"
            )),
            trigger: Locator::xpath(format!(
                "{PANE}//button[.//span[normalize-space()='Start face swapping']]"
            )),
            progress_percentage: Locator::xpath(format!(
                "{PANE}//div[contains(@class, 'loading-container')]//p/span[contains(@class, 'fs-3')]"
            )),
            result_image: Locator::xpath(format!(
                "{PANE}//div[contains(@class, 'result-container')]//img[contains(@class, 'el-image__inner') and @src]"
            )),
            rate_limit_title: Locator::xpath(
                "//h2[@id='swal2-title' and contains(text(), 'Too many requests')]",
            ),
            rate_limit_dismiss: Locator::xpath(
                "//div[contains(@class, 'swal2-popup')]//button[contains(@class, 'swal2-confirm')]",
            ),
        }
    }
}

/// Parse a progress label such as `" 42% "`.
pub fn parse_percentage(text: &str) -> Option<u32> {
    text.trim().trim_end_matches('%').trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percentage() {
        assert_eq!(parse_percentage("42%"), Some(42));
        assert_eq!(parse_percentage(" 7 % "), Some(7));
        assert_eq!(parse_percentage("loading"), None);
        assert_eq!(parse_percentage(""), None);
    }

    #[test]
    fn test_loaded_image_src() {
        assert!(is_loaded_image_src("blob:https://site/abc"));
        assert!(is_loaded_image_src("https://cdn/result.webp"));
        assert!(!is_loaded_image_src(""));
        assert!(!is_loaded_image_src("about:blank"));
    }

    #[test]
    fn test_site_profile_roundtrips_through_toml() {
        let profile = SiteProfile::default();
        let text = toml::to_string(&profile).unwrap();
        let parsed: SiteProfile = toml::from_str(&text).unwrap();
        assert_eq!(parsed, profile);
    }
}
