//! Scripted in-memory page used by runner and scheduler tests.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    Actionability, AutomationSession, CancelToken, Locator, SessionFactory, SessionKill,
    SiteProfile, UploadOutcome,
};
use crate::error::AutomationError;
use crate::model::WorkerId;

/// How the fake page behaves for one session.
#[derive(Debug, Clone)]
pub(crate) struct FakeScript {
    /// Consumed one per source upload; `source_default` afterwards.
    pub source_uploads: VecDeque<UploadOutcome>,
    pub source_default: UploadOutcome,
    pub face_upload_failures: u32,
    pub trigger_disabled_checks: u32,
    pub click_failures: u32,
    /// Clicks answered with the rate-limit popup.
    pub popup_on_click: u32,
    /// Times the popup interrupts a running swap.
    pub popup_during_await: u32,
    pub result_after_polls: u32,
    pub never_result: bool,
    pub progress_text: Option<String>,
    /// Report a new percentage on every poll instead of `progress_text`.
    pub progress_climbs: bool,
    pub fetch_failures: u32,
    pub navigate_failures: u32,
    pub create_failures: u32,
    pub restart_fails: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            source_uploads: VecDeque::new(),
            source_default: UploadOutcome::Success,
            face_upload_failures: 0,
            trigger_disabled_checks: 0,
            click_failures: 0,
            popup_on_click: 0,
            popup_during_await: 0,
            result_after_polls: 1,
            never_result: false,
            progress_text: Some("50%".to_string()),
            progress_climbs: false,
            fetch_failures: 0,
            navigate_failures: 0,
            create_failures: 0,
            restart_fails: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeStats {
    pub created: u32,
    pub closed: u32,
    pub live: u32,
    pub max_live: u32,
    pub refreshes: u32,
    pub clears: u32,
    pub hard_restarts: u32,
    pub terminated: u32,
    pub face_uploads: u32,
    pub source_uploads: u32,
    pub trigger_clicks: u32,
    pub dismissals: u32,
}

pub(crate) struct FakeFactory {
    site: SiteProfile,
    default_script: FakeScript,
    per_person: Mutex<HashMap<String, FakeScript>>,
    stats: Arc<Mutex<FakeStats>>,
}

impl FakeFactory {
    pub fn new(default_script: FakeScript) -> Self {
        Self {
            site: SiteProfile::default(),
            default_script,
            per_person: Mutex::new(HashMap::new()),
            stats: Arc::new(Mutex::new(FakeStats::default())),
        }
    }

    pub fn with_person(self, person: &str, script: FakeScript) -> Self {
        self.per_person
            .lock()
            .unwrap()
            .insert(person.to_string(), script);
        self
    }

    pub fn stats(&self) -> FakeStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn session(&self, script: FakeScript) -> FakeSession {
        let mut stats = self.stats.lock().unwrap();
        stats.created += 1;
        stats.live += 1;
        stats.max_live = stats.max_live.max(stats.live);
        drop(stats);

        FakeSession {
            site: self.site.clone(),
            script,
            stats: self.stats.clone(),
            terminated: Arc::new(AtomicBool::new(false)),
            url: None,
            face_present: false,
            swapping: false,
            polls: 0,
            popup_visible: false,
            last_result: None,
            results: 0,
            closed: false,
        }
    }
}

impl SessionFactory for FakeFactory {
    fn create(
        &self,
        worker: &WorkerId,
        _headless: bool,
    ) -> Result<Box<dyn AutomationSession>, AutomationError> {
        let script = {
            let mut per_person = self.per_person.lock().unwrap();
            match per_person.get_mut(worker.person()) {
                Some(script) => {
                    if script.create_failures > 0 {
                        script.create_failures -= 1;
                        return Err(AutomationError::SessionLost("browser did not start".into()));
                    }
                    script.clone()
                }
                None => self.default_script.clone(),
            }
        };
        Ok(Box::new(self.session(script)))
    }
}

pub(crate) struct FakeSession {
    site: SiteProfile,
    script: FakeScript,
    stats: Arc<Mutex<FakeStats>>,
    terminated: Arc<AtomicBool>,
    url: Option<String>,
    face_present: bool,
    swapping: bool,
    polls: u32,
    popup_visible: bool,
    last_result: Option<String>,
    results: u32,
    closed: bool,
}

impl FakeSession {
    fn dead(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn lost() -> AutomationError {
        AutomationError::SessionLost("terminated".into())
    }

    fn advance_swap(&mut self) {
        if !self.swapping {
            return;
        }
        self.polls += 1;
        if self.script.popup_during_await > 0 {
            self.script.popup_during_await -= 1;
            self.popup_visible = true;
            self.swapping = false;
        } else if !self.script.never_result && self.polls > self.script.result_after_polls {
            self.results += 1;
            self.last_result = Some(format!("https://fake.test/result/{}.webp", self.results));
            self.swapping = false;
        }
    }
}

impl AutomationSession for FakeSession {
    fn navigate(&mut self, url: &str) -> Result<(), AutomationError> {
        if self.dead() {
            return Err(Self::lost());
        }
        if self.script.navigate_failures > 0 {
            self.script.navigate_failures -= 1;
            return Err(AutomationError::Timeout("page did not load".into()));
        }
        self.url = Some(url.to_string());
        Ok(())
    }

    fn current_url(&mut self) -> Option<String> {
        if self.dead() {
            return None;
        }
        self.url.clone()
    }

    fn upload_and_await_confirmation(
        &mut self,
        input: &Locator,
        _file: &Path,
        _confirmation: &Locator,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> UploadOutcome {
        if self.dead() {
            return UploadOutcome::Error(Self::lost());
        }
        let outcome = if *input == self.site.face_input {
            self.stats.lock().unwrap().face_uploads += 1;
            if self.script.face_upload_failures > 0 {
                self.script.face_upload_failures -= 1;
                UploadOutcome::Timeout
            } else {
                self.face_present = true;
                UploadOutcome::Success
            }
        } else {
            self.stats.lock().unwrap().source_uploads += 1;
            self.script
                .source_uploads
                .pop_front()
                .unwrap_or_else(|| self.script.source_default.clone())
        };

        if outcome == UploadOutcome::Timeout && cancel.wait_timeout(timeout) {
            return UploadOutcome::Stopped;
        }
        outcome
    }

    fn is_actionable(&mut self, locator: &Locator) -> Actionability {
        if self.dead() || *locator != self.site.trigger {
            return Actionability::NotFound;
        }
        if self.script.trigger_disabled_checks > 0 {
            self.script.trigger_disabled_checks -= 1;
            return Actionability::Disabled;
        }
        Actionability::Enabled
    }

    fn click(&mut self, locator: &Locator) -> Result<(), AutomationError> {
        if self.dead() {
            return Err(Self::lost());
        }
        if *locator == self.site.rate_limit_dismiss {
            if !self.popup_visible {
                return Err(AutomationError::NotFound("dismiss button".into()));
            }
            self.popup_visible = false;
            self.stats.lock().unwrap().dismissals += 1;
            return Ok(());
        }
        if *locator != self.site.trigger {
            return Err(AutomationError::NotFound(locator.to_string()));
        }

        self.stats.lock().unwrap().trigger_clicks += 1;
        if self.popup_visible {
            return Err(AutomationError::ClickIntercepted("popup".into()));
        }
        if self.script.popup_on_click > 0 {
            self.script.popup_on_click -= 1;
            self.popup_visible = true;
            return Err(AutomationError::ClickIntercepted("popup".into()));
        }
        if self.script.click_failures > 0 {
            self.script.click_failures -= 1;
            return Err(AutomationError::ClickIntercepted("overlay".into()));
        }
        self.swapping = true;
        self.polls = 0;
        Ok(())
    }

    fn find_text(&mut self, locator: &Locator) -> Option<String> {
        if self.dead() || !self.swapping || *locator != self.site.progress_percentage {
            return None;
        }
        if self.script.progress_climbs {
            return Some(format!("{}%", self.polls % 100));
        }
        self.script.progress_text.clone()
    }

    fn find_attribute(&mut self, locator: &Locator, name: &str) -> Option<String> {
        if self.dead() || name != "src" {
            return None;
        }
        if *locator == self.site.face_thumbnail {
            return self.face_present.then(|| "blob:https://fake.test/face".to_string());
        }
        if *locator == self.site.result_image {
            self.advance_swap();
            return self.last_result.clone();
        }
        None
    }

    fn element_visible(&mut self, locator: &Locator) -> bool {
        if self.dead() {
            return false;
        }
        if *locator == self.site.rate_limit_title {
            return self.popup_visible;
        }
        *locator == self.site.result_image && self.last_result.is_some()
    }

    fn clear_site_data(&mut self) -> Result<(), AutomationError> {
        if self.dead() {
            return Err(Self::lost());
        }
        self.stats.lock().unwrap().clears += 1;
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), AutomationError> {
        if self.dead() {
            return Err(Self::lost());
        }
        self.stats.lock().unwrap().refreshes += 1;
        self.face_present = false;
        self.swapping = false;
        self.popup_visible = false;
        Ok(())
    }

    fn hard_restart_session(&mut self) -> Result<(), AutomationError> {
        self.stats.lock().unwrap().hard_restarts += 1;
        if self.script.restart_fails || self.dead() {
            return Err(AutomationError::SessionLost("restart failed".into()));
        }
        self.url = None;
        self.face_present = false;
        self.swapping = false;
        self.popup_visible = false;
        Ok(())
    }

    fn fetch_resource(&mut self, url: &str, _timeout: Duration) -> Result<Vec<u8>, AutomationError> {
        if self.dead() {
            return Err(Self::lost());
        }
        if self.script.fetch_failures > 0 {
            self.script.fetch_failures -= 1;
            return Err(AutomationError::Transport(format!("GET {} failed", url)));
        }
        Ok(png_bytes())
    }

    fn kill_handle(&self) -> Arc<dyn SessionKill> {
        Arc::new(FakeKill {
            terminated: self.terminated.clone(),
            stats: self.stats.clone(),
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut stats = self.stats.lock().unwrap();
        stats.closed += 1;
        stats.live = stats.live.saturating_sub(1);
    }
}

struct FakeKill {
    terminated: Arc<AtomicBool>,
    stats: Arc<Mutex<FakeStats>>,
}

impl SessionKill for FakeKill {
    fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.stats.lock().unwrap().terminated += 1;
        }
    }
}

/// Small translucent PNG, standing in for a downloaded result.
pub(crate) fn png_bytes() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 10, 10, 128]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Timeouts small enough for tests.
pub(crate) fn fast_timeouts() -> crate::config::TimeoutConfig {
    crate::config::TimeoutConfig {
        upload_ms: 20,
        no_progress_ms: 200,
        stall_ms: 100,
        overall_ms: 2_000,
        poll_interval_ms: 2,
        upload_poll_ms: 2,
        retry_delay_ms: 2,
        dismiss_delay_ms: 1,
        kill_grace_ms: 2_000,
        fetch_ms: 100,
    }
}
