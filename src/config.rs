use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::automation::SiteProfile;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub run: RunSettings,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub site: SiteProfile,

    #[serde(default)]
    pub webdriver: WebDriverConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root holding `Faces/`, `SourceImages/` and `Temp/`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swapflow")
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
    ]
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            image_extensions: default_image_extensions(),
        }
    }
}

impl LibraryConfig {
    pub fn faces_dir(&self) -> PathBuf {
        self.root.join("Faces")
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join("SourceImages")
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.source_dir().join("Completed")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("Temp")
    }

    pub fn review_queue_path(&self) -> PathBuf {
        self.root.join("PendingReview.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Maximum number of live browser sessions.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_true")]
    pub headless: bool,

    /// Archive a source image once every selected person is done with it.
    #[serde(default = "default_true")]
    pub move_on_completion: bool,
}

fn default_concurrency() -> usize {
    6
}

fn default_true() -> bool {
    true
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            headless: true,
            move_on_completion: true,
        }
    }
}

/// Every wait a runner performs is bounded by one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_upload_ms")]
    pub upload_ms: u64,

    /// Give up when no progress percentage ever shows up.
    #[serde(default = "default_no_progress_ms")]
    pub no_progress_ms: u64,

    /// Give up when the percentage stops changing.
    #[serde(default = "default_stall_ms")]
    pub stall_ms: u64,

    #[serde(default = "default_overall_ms")]
    pub overall_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_upload_poll_ms")]
    pub upload_poll_ms: u64,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_dismiss_delay_ms")]
    pub dismiss_delay_ms: u64,

    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    #[serde(default = "default_fetch_ms")]
    pub fetch_ms: u64,
}

fn default_upload_ms() -> u64 {
    180_000
}

fn default_no_progress_ms() -> u64 {
    60_000
}

fn default_stall_ms() -> u64 {
    30_000
}

fn default_overall_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_upload_poll_ms() -> u64 {
    500
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_dismiss_delay_ms() -> u64 {
    3_000
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_fetch_ms() -> u64 {
    30_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upload_ms: default_upload_ms(),
            no_progress_ms: default_no_progress_ms(),
            stall_ms: default_stall_ms(),
            overall_ms: default_overall_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            upload_poll_ms: default_upload_poll_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            dismiss_delay_ms: default_dismiss_delay_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            fetch_ms: default_fetch_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn upload(&self) -> Duration {
        Duration::from_millis(self.upload_ms)
    }

    pub fn no_progress(&self) -> Duration {
        Duration::from_millis(self.no_progress_ms)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }

    pub fn overall(&self) -> Duration {
        Duration::from_millis(self.overall_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn upload_poll(&self) -> Duration {
        Duration::from_millis(self.upload_poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dismiss_delay(&self) -> Duration {
        Duration::from_millis(self.dismiss_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_millis(self.fetch_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed attempts allowed per work item. `None` keeps retrying until stopped.
    #[serde(default)]
    pub max_item_attempts: Option<u32>,

    #[serde(default = "default_face_upload_attempts")]
    pub face_upload_attempts: u32,

    #[serde(default = "default_session_create_attempts")]
    pub session_create_attempts: u32,

    #[serde(default = "default_navigate_attempts")]
    pub navigate_attempts: u32,
}

fn default_face_upload_attempts() -> u32 {
    3
}

fn default_session_create_attempts() -> u32 {
    3
}

fn default_navigate_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_item_attempts: None,
            face_upload_attempts: default_face_upload_attempts(),
            session_create_attempts: default_session_create_attempts(),
            navigate_attempts: default_navigate_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDriverConfig {
    #[serde(default = "default_webdriver_endpoint")]
    pub endpoint: String,

    /// Extra browser command-line switches.
    #[serde(default = "default_browser_args")]
    pub args: Vec<String>,
}

fn default_webdriver_endpoint() -> String {
    "http://127.0.0.1:9515".to_string()
}

fn default_browser_args() -> Vec<String> {
    vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
    ]
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: default_webdriver_endpoint(),
            args: default_browser_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_quality() -> u8 {
    75
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("swapflow")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SWAPFLOW_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [run]
            concurrency = 2

            [retry]
            max_item_attempts = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.run.concurrency, 2);
        assert!(config.run.headless);
        assert_eq!(config.retry.max_item_attempts, Some(4));
        assert_eq!(config.retry.face_upload_attempts, 3);
        assert_eq!(config.timeouts.upload(), Duration::from_secs(180));
        assert_eq!(config.output.jpeg_quality, 75);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.library.root = dir.path().join("root");
        config.timeouts.stall_ms = 1234;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.library.root, dir.path().join("root"));
        assert_eq!(loaded.timeouts.stall_ms, 1234);
        assert_eq!(loaded.retry.max_item_attempts, None);
    }

    #[test]
    fn test_library_layout() {
        let library = LibraryConfig {
            root: PathBuf::from("/ai"),
            image_extensions: default_image_extensions(),
        };
        assert_eq!(library.completed_dir(), PathBuf::from("/ai/SourceImages/Completed"));
        assert_eq!(library.output_dir(), PathBuf::from("/ai/Temp"));
    }
}
