//! Per-(person, face) state machine.
//!
//! A runner owns one browser session and applies its face to every source
//! image in order. A source image is retried at the same index until it
//! succeeds; the runner only leaves the loop on cancellation, when every
//! source is done, or when the browser cannot be brought back.

mod swap;

use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::artifact;
use crate::automation::{
    is_loaded_image_src, Actionability, AutomationSession, CancelToken, SessionFactory,
    SiteProfile, UploadOutcome,
};
use crate::config::{RetryConfig, TimeoutConfig};
use crate::model::{Face, RunConfig, SourceImage, WorkItem, WorkerId};
use crate::tasks::{LogLevel, RunnerEvent, RunnerOutcome};

/// Shared, read-only inputs every runner of a run receives.
#[derive(Clone)]
pub struct RunnerContext {
    pub factory: Arc<dyn SessionFactory>,
    pub site: SiteProfile,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub headless: bool,
    pub jpeg_quality: u8,
    pub output_dir: PathBuf,
    pub cancel: CancelToken,
    pub events: Sender<RunnerEvent>,
}

impl RunnerContext {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        config: &RunConfig,
        cancel: CancelToken,
        events: Sender<RunnerEvent>,
    ) -> Self {
        Self {
            factory,
            site: config.site.clone(),
            timeouts: config.timeouts.clone(),
            retry: config.retry.clone(),
            headless: config.headless,
            jpeg_quality: config.jpeg_quality,
            output_dir: config.output_dir.clone(),
            cancel,
            events,
        }
    }
}

/// States of the runner. `Stopped` and `Done` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    NavigateReady,
    CheckFacePresent,
    UploadFace { attempt: u32 },
    UploadSource,
    CheckTriggerReady,
    Swapping,
    AwaitResult {
        previous: Option<String>,
        retriggered: bool,
    },
    SaveResult { url: String },
    NeedsRefresh,
    SoftRecover,
    HardRecover,
    Stopped,
    Done,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Done)
    }
}

/// Why a blocking helper gave up.
enum Halt {
    Stopped,
    Failed(String),
}

/// Logs to tracing and to the operator stream at the same time.
struct Reporter {
    id: WorkerId,
    events: Sender<RunnerEvent>,
}

impl Reporter {
    fn log(&self, level: LogLevel, step: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(worker = %self.id, step, "{}", message),
            LogLevel::Info => tracing::info!(worker = %self.id, step, "{}", message),
            LogLevel::Warn => tracing::warn!(worker = %self.id, step, "{}", message),
            LogLevel::Error => tracing::error!(worker = %self.id, step, "{}", message),
        }
        let _ = self.events.send(RunnerEvent::Log {
            worker: self.id.clone(),
            level,
            message: format!("[{}][{}] {}", self.id, step, message),
        });
    }

    fn send(&self, event: RunnerEvent) {
        let _ = self.events.send(event);
    }
}

pub struct Runner {
    person: String,
    face: Face,
    sources: Vec<SourceImage>,
    ctx: RunnerContext,
    reporter: Reporter,
    index: usize,
    /// Failed attempts on the current source image.
    attempts: u32,
    fatal: Option<String>,
}

impl Runner {
    pub fn new(person: &str, face: Face, sources: Vec<SourceImage>, ctx: RunnerContext) -> Self {
        let id = WorkerId::new(person, &face);
        let reporter = Reporter {
            id,
            events: ctx.events.clone(),
        };
        Self {
            person: person.to_string(),
            face,
            sources,
            ctx,
            reporter,
            index: 0,
            attempts: 0,
            fatal: None,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.reporter.id
    }

    /// Drive the state machine to a terminal state, release the browser, and
    /// report `Finished`.
    pub fn run(mut self) -> RunnerOutcome {
        self.reporter.log(LogLevel::Info, "run", "Runner started.");

        let mut browser: Option<Box<dyn AutomationSession>> = None;
        let mut state = RunnerState::Init;

        while !state.is_terminal() {
            if self.ctx.cancel.is_cancelled() {
                self.reporter.log(LogLevel::Info, "run", "Stop signal detected.");
                state = RunnerState::Stopped;
                break;
            }

            if matches!(state, RunnerState::Init) {
                state = match self.open_session() {
                    Ok(session) => {
                        browser = Some(session);
                        RunnerState::NavigateReady
                    }
                    Err(Halt::Stopped) => RunnerState::Stopped,
                    Err(Halt::Failed(reason)) => self.abort(reason),
                };
                continue;
            }

            let Some(session) = browser.as_deref_mut() else {
                state = self.abort("browser session missing".to_string());
                continue;
            };
            let next = self.step(state, session);
            tracing::trace!(worker = %self.reporter.id, state = ?next, "Runner transition");
            state = next;
        }

        let outcome = match (&state, self.fatal.take()) {
            (_, Some(reason)) => RunnerOutcome::Aborted(reason),
            (RunnerState::Stopped, None) => RunnerOutcome::Stopped,
            _ => RunnerOutcome::Completed,
        };

        self.cleanup(browser);
        self.reporter.log(
            LogLevel::Info,
            "run",
            &format!("Runner finished ({}).", outcome),
        );
        self.reporter.send(RunnerEvent::Finished {
            worker: self.reporter.id.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }

    fn step(&mut self, state: RunnerState, session: &mut dyn AutomationSession) -> RunnerState {
        match state {
            RunnerState::NavigateReady => match self.guarantee_page(session) {
                Ok(()) => RunnerState::CheckFacePresent,
                Err(Halt::Stopped) => RunnerState::Stopped,
                Err(Halt::Failed(reason)) => {
                    self.reporter.log(LogLevel::Warn, "navigate", &reason);
                    RunnerState::NeedsRefresh
                }
            },
            RunnerState::CheckFacePresent => self.check_face_present(session),
            RunnerState::UploadFace { attempt } => self.upload_face(session, attempt),
            RunnerState::UploadSource => self.upload_source(session),
            RunnerState::CheckTriggerReady => self.check_trigger_ready(session),
            RunnerState::Swapping => self.trigger_swap(session),
            RunnerState::AwaitResult {
                previous,
                retriggered,
            } => self.await_result(session, previous, retriggered),
            RunnerState::SaveResult { url } => self.save_result(session, &url),
            RunnerState::NeedsRefresh => RunnerState::SoftRecover,
            RunnerState::SoftRecover => self.soft_recover(session),
            RunnerState::HardRecover => self.hard_recover(session),
            RunnerState::Init | RunnerState::Stopped | RunnerState::Done => state,
        }
    }

    fn current_source(&self) -> Option<&SourceImage> {
        self.sources.get(self.index)
    }

    fn current_item(&self) -> Option<WorkItem> {
        self.current_source()
            .map(|source| WorkItem::new(&self.person, &self.face, source, &self.ctx.output_dir))
    }

    fn task_label(&self) -> String {
        self.current_source()
            .map(|s| format!("Task ({})", s.filename))
            .unwrap_or_else(|| "Task (none)".to_string())
    }

    fn abort(&mut self, reason: String) -> RunnerState {
        self.reporter
            .log(LogLevel::Error, "abort", &format!("Critical failure: {}", reason));
        self.fatal = Some(reason);
        RunnerState::Done
    }

    /// Sleep between retries; `true` means stop was requested meanwhile.
    fn pause(&self, duration: std::time::Duration) -> bool {
        self.ctx.cancel.wait_timeout(duration)
    }

    fn open_session(&self) -> Result<Box<dyn AutomationSession>, Halt> {
        let attempts = self.ctx.retry.session_create_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if self.ctx.cancel.is_cancelled() {
                return Err(Halt::Stopped);
            }
            let step = format!("create_browser][attempt_{}", attempt);
            match self.ctx.factory.create(&self.reporter.id, self.ctx.headless) {
                Ok(session) => {
                    self.reporter
                        .log(LogLevel::Info, &step, "Browser session created.");
                    self.reporter.send(RunnerEvent::SessionOpened {
                        worker: self.reporter.id.clone(),
                        kill: session.kill_handle(),
                    });
                    return Ok(session);
                }
                Err(e) => {
                    self.reporter.log(
                        LogLevel::Warn,
                        &step,
                        &format!("Browser session could not be created: {}", e),
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts && self.pause(self.ctx.timeouts.retry_delay()) {
                return Err(Halt::Stopped);
            }
        }

        Err(Halt::Failed(format!(
            "cannot create browser session after {} attempts: {}",
            attempts, last_error
        )))
    }

    /// Make sure the session shows the tool's page, navigating if needed.
    fn guarantee_page(&self, session: &mut dyn AutomationSession) -> Result<(), Halt> {
        let url = &self.ctx.site.url;
        if session
            .current_url()
            .is_some_and(|current| current.contains(url.as_str()))
        {
            self.reporter
                .log(LogLevel::Debug, "guarantee_page", "Already on tool page.");
            return Ok(());
        }

        let attempts = self.ctx.retry.navigate_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if self.ctx.cancel.is_cancelled() {
                return Err(Halt::Stopped);
            }
            let step = format!("guarantee_page][attempt_{}", attempt);
            self.reporter
                .log(LogLevel::Info, &step, &format!("Navigating to {}", url));
            match session.navigate(url) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.reporter
                        .log(LogLevel::Warn, &step, &format!("Navigation failed: {}", e));
                    last_error = e.to_string();
                }
            }
            if attempt < attempts && self.pause(self.ctx.timeouts.retry_delay()) {
                return Err(Halt::Stopped);
            }
        }
        Err(Halt::Failed(format!("navigation failed: {}", last_error)))
    }

    fn check_face_present(&mut self, session: &mut dyn AutomationSession) -> RunnerState {
        if self.index >= self.sources.len() {
            self.reporter
                .log(LogLevel::Info, "all_done", "All source images processed.");
            return RunnerState::Done;
        }
        self.reporter.log(
            LogLevel::Info,
            "next_task",
            &format!("{} Starting processing.", self.task_label()),
        );

        let present = session
            .find_attribute(&self.ctx.site.face_thumbnail, "src")
            .is_some_and(|src| is_loaded_image_src(&src));
        if present {
            self.reporter
                .log(LogLevel::Debug, "face_check", "Face thumbnail present.");
            RunnerState::UploadSource
        } else {
            self.reporter.log(
                LogLevel::Info,
                "face_check",
                "Face image not present, ensuring upload.",
            );
            RunnerState::UploadFace { attempt: 1 }
        }
    }

    fn upload_face(&mut self, session: &mut dyn AutomationSession, attempt: u32) -> RunnerState {
        let step = format!("face_upload][attempt_{}", attempt);
        self.reporter.log(
            LogLevel::Info,
            &step,
            &format!("Uploading face: {}", self.face.filename),
        );

        let outcome = session.upload_and_await_confirmation(
            &self.ctx.site.face_input,
            &self.face.path,
            &self.ctx.site.face_thumbnail,
            self.ctx.timeouts.upload(),
            &self.ctx.cancel,
        );

        match outcome {
            UploadOutcome::Success => {
                self.reporter.log(LogLevel::Info, &step, "Face upload successful.");
                RunnerState::UploadSource
            }
            UploadOutcome::Stopped => RunnerState::Stopped,
            failure => {
                let limit = self.ctx.retry.face_upload_attempts.max(1);
                if attempt >= limit {
                    self.reporter.log(
                        LogLevel::Warn,
                        &step,
                        &format!(
                            "Face upload failed {} times ({:?}), requesting refresh.",
                            attempt, failure
                        ),
                    );
                    return RunnerState::NeedsRefresh;
                }
                self.reporter.log(
                    LogLevel::Warn,
                    &step,
                    &format!("Face upload failed ({:?}). Refreshing page.", failure),
                );
                if let Err(e) = session.refresh() {
                    self.reporter
                        .log(LogLevel::Warn, &step, &format!("Refresh failed: {}", e));
                }
                if self.pause(self.ctx.timeouts.retry_delay()) {
                    return RunnerState::Stopped;
                }
                RunnerState::UploadFace {
                    attempt: attempt + 1,
                }
            }
        }
    }

    fn upload_source(&mut self, session: &mut dyn AutomationSession) -> RunnerState {
        let Some(source) = self.current_source().cloned() else {
            return RunnerState::Done;
        };
        let task = self.task_label();

        let outcome = session.upload_and_await_confirmation(
            &self.ctx.site.source_input,
            &source.path,
            &self.ctx.site.source_thumbnail,
            self.ctx.timeouts.upload(),
            &self.ctx.cancel,
        );

        match outcome {
            UploadOutcome::Success => {
                self.reporter.log(
                    LogLevel::Info,
                    "source_upload",
                    &format!("{} Source upload successful.", task),
                );
                RunnerState::CheckTriggerReady
            }
            UploadOutcome::Stopped => RunnerState::Stopped,
            failure => {
                self.reporter.log(
                    LogLevel::Warn,
                    "source_upload",
                    &format!("{} Source upload failed ({:?}), requesting refresh.", task, failure),
                );
                RunnerState::NeedsRefresh
            }
        }
    }

    fn check_trigger_ready(&mut self, session: &mut dyn AutomationSession) -> RunnerState {
        match session.is_actionable(&self.ctx.site.trigger) {
            Actionability::Enabled => RunnerState::Swapping,
            state => {
                self.reporter.log(
                    LogLevel::Warn,
                    "trigger_check",
                    &format!(
                        "{} Trigger not ready ({:?}), requesting refresh.",
                        self.task_label(),
                        state
                    ),
                );
                if self.pause(self.ctx.timeouts.retry_delay()) {
                    return RunnerState::Stopped;
                }
                RunnerState::NeedsRefresh
            }
        }
    }

    fn save_result(&mut self, session: &mut dyn AutomationSession, url: &str) -> RunnerState {
        let Some(item) = self.current_item() else {
            return RunnerState::Done;
        };
        let output_path = item.output_path();

        self.reporter.log(
            LogLevel::Info,
            "save_result",
            &format!("{} Fetching result image.", self.task_label()),
        );
        let saved = session
            .fetch_resource(url, self.ctx.timeouts.fetch())
            .map_err(anyhow::Error::from)
            .and_then(|bytes| artifact::save_as_jpeg(&bytes, &output_path, self.ctx.jpeg_quality));

        match saved {
            Ok(()) => {
                self.reporter.log(
                    LogLevel::Info,
                    "save_result",
                    &format!("Saved result to {}", output_path.display()),
                );
                self.reporter.send(RunnerEvent::ItemSucceeded {
                    item,
                    output_path,
                });
                self.index += 1;
                self.attempts = 0;
                RunnerState::CheckFacePresent
            }
            Err(e) => self.item_failed(format!("failed to save result: {:#}", e)),
        }
    }

    /// Report a failed attempt on the current item and head for recovery.
    fn item_failed(&mut self, reason: String) -> RunnerState {
        let Some(item) = self.current_item() else {
            return RunnerState::Done;
        };
        self.attempts += 1;
        self.reporter.log(
            LogLevel::Warn,
            "swap_fail",
            &format!("{} {}, requesting refresh.", self.task_label(), reason),
        );

        let exhausted = self
            .ctx
            .retry
            .max_item_attempts
            .is_some_and(|limit| self.attempts >= limit);

        let reason = if exhausted {
            format!("{} (retry limit reached after {} attempts)", reason, self.attempts)
        } else {
            reason
        };
        self.reporter.send(RunnerEvent::ItemFailed { item, reason });

        if exhausted {
            self.reporter.log(
                LogLevel::Error,
                "swap_fail",
                &format!("{} Giving up on this source image.", self.task_label()),
            );
            self.index += 1;
            self.attempts = 0;
        }
        RunnerState::NeedsRefresh
    }

    fn soft_recover(&mut self, session: &mut dyn AutomationSession) -> RunnerState {
        let step = "soft_recover";
        self.reporter.log(
            LogLevel::Info,
            step,
            &format!("{} Refresh needed, attempting recovery.", self.task_label()),
        );
        if self.pause(self.ctx.timeouts.retry_delay()) {
            return RunnerState::Stopped;
        }

        if let Err(e) = session.clear_site_data() {
            self.reporter
                .log(LogLevel::Warn, step, &format!("Clearing site data failed: {}", e));
        }
        if let Err(e) = session.refresh() {
            self.reporter
                .log(LogLevel::Warn, step, &format!("Refresh failed: {}", e));
        }

        match self.guarantee_page(session) {
            Ok(()) => RunnerState::CheckFacePresent,
            Err(Halt::Stopped) => RunnerState::Stopped,
            Err(Halt::Failed(reason)) => {
                self.reporter.log(
                    LogLevel::Warn,
                    step,
                    &format!("Soft recovery failed ({}), restarting browser.", reason),
                );
                RunnerState::HardRecover
            }
        }
    }

    fn hard_recover(&mut self, session: &mut dyn AutomationSession) -> RunnerState {
        let step = "hard_recover";
        self.reporter
            .log(LogLevel::Warn, step, "Attempting to kill and restart browser.");

        if let Err(e) = session.hard_restart_session() {
            return self.abort(format!("cannot restart browser: {}", e));
        }
        self.reporter.send(RunnerEvent::SessionOpened {
            worker: self.reporter.id.clone(),
            kill: session.kill_handle(),
        });

        match self.guarantee_page(session) {
            Ok(()) => {
                self.reporter
                    .log(LogLevel::Info, step, "Browser restarted and navigated.");
                RunnerState::CheckFacePresent
            }
            Err(Halt::Stopped) => RunnerState::Stopped,
            Err(Halt::Failed(reason)) => {
                self.abort(format!("navigation after browser restart failed: {}", reason))
            }
        }
    }

    fn cleanup(&self, browser: Option<Box<dyn AutomationSession>>) {
        let Some(mut session) = browser else {
            self.reporter
                .log(LogLevel::Debug, "cleanup", "No browser session to clean up.");
            return;
        };
        if self.ctx.headless {
            self.reporter
                .log(LogLevel::Info, "cleanup", "Closing browser session.");
            session.close();
        } else {
            self.reporter.log(
                LogLevel::Info,
                "cleanup",
                "Leaving visible browser open for manual inspection.",
            );
        }
    }
}
