//! Triggering a swap and waiting for its result.

use crate::automation::{is_loaded_image_src, parse_percentage, AutomationSession, Deadline};
use crate::tasks::LogLevel;

use super::{Runner, RunnerState};

/// What the result poll observed.
enum Poll {
    Result(String),
    RateLimited,
    Timeout(String),
    Stopped,
}

impl Runner {
    /// Note the current result so a stale image is never mistaken for the new
    /// one, then click the trigger, getting past one rate-limit popup.
    pub(super) fn trigger_swap(&mut self, session: &mut dyn AutomationSession) -> RunnerState {
        let previous = session
            .find_attribute(&self.ctx.site.result_image, "src")
            .filter(|src| is_loaded_image_src(src));

        self.reporter.log(
            LogLevel::Info,
            "swap_trigger",
            &format!("{} Clicking trigger.", self.task_label()),
        );
        let first = match session.click(&self.ctx.site.trigger) {
            Ok(()) => {
                return RunnerState::AwaitResult {
                    previous,
                    retriggered: false,
                }
            }
            Err(e) => e,
        };

        if !self.dismiss_rate_limit(session) {
            return self.item_failed(format!("trigger click failed: {}", first));
        }
        if self.pause(self.ctx.timeouts.dismiss_delay()) {
            return RunnerState::Stopped;
        }
        match session.click(&self.ctx.site.trigger) {
            Ok(()) => RunnerState::AwaitResult {
                previous,
                retriggered: false,
            },
            Err(e) => self.item_failed(format!(
                "rate limited: trigger click failed after dismissing popup: {}",
                e
            )),
        }
    }

    pub(super) fn await_result(
        &mut self,
        session: &mut dyn AutomationSession,
        previous: Option<String>,
        retriggered: bool,
    ) -> RunnerState {
        match self.poll_for_result(session, previous.as_deref()) {
            Poll::Result(url) => RunnerState::SaveResult { url },
            Poll::Stopped => RunnerState::Stopped,
            Poll::Timeout(reason) => self.item_failed(format!("timeout: {}", reason)),
            Poll::RateLimited if retriggered => {
                self.dismiss_rate_limit(session);
                self.item_failed("rate limited again after re-trigger".to_string())
            }
            Poll::RateLimited => {
                self.reporter.log(
                    LogLevel::Warn,
                    "swap_wait",
                    &format!("{} Rate-limit popup during swap, re-triggering.", self.task_label()),
                );
                if !self.dismiss_rate_limit(session) {
                    return self.item_failed("rate-limit popup could not be dismissed".to_string());
                }
                if self.pause(self.ctx.timeouts.dismiss_delay()) {
                    return RunnerState::Stopped;
                }
                match session.click(&self.ctx.site.trigger) {
                    Ok(()) => RunnerState::AwaitResult {
                        previous,
                        retriggered: true,
                    },
                    Err(e) => self.item_failed(format!(
                        "trigger click failed after rate limit: {}",
                        e
                    )),
                }
            }
        }
    }

    /// Poll until a new result appears, the popup shows up, or a timer runs out.
    fn poll_for_result(
        &self,
        session: &mut dyn AutomationSession,
        previous: Option<&str>,
    ) -> Poll {
        let timeouts = &self.ctx.timeouts;
        let site = &self.ctx.site;
        let overall = Deadline::after(timeouts.overall());
        let mut stall = Deadline::after(timeouts.stall());
        let mut last_progress: Option<u32> = None;

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Poll::Stopped;
            }
            if overall.expired() {
                return Poll::Timeout(format!(
                    "no result after {}s",
                    timeouts.overall().as_secs()
                ));
            }

            if let Some(src) = session.find_attribute(&site.result_image, "src") {
                if is_loaded_image_src(&src) && previous != Some(src.as_str()) {
                    self.reporter.log(
                        LogLevel::Info,
                        "swap_wait",
                        &format!("{} Result image ready.", self.task_label()),
                    );
                    return Poll::Result(src);
                }
            }

            if session.element_visible(&site.rate_limit_title) {
                return Poll::RateLimited;
            }

            match session.find_text(&site.progress_percentage).as_deref().and_then(parse_percentage) {
                Some(percent) if last_progress != Some(percent) => {
                    self.reporter.log(
                        LogLevel::Debug,
                        "swap_wait",
                        &format!("{} Progress {}%", self.task_label(), percent),
                    );
                    last_progress = Some(percent);
                    stall.reset();
                }
                Some(percent) => {
                    if stall.expired() {
                        return Poll::Timeout(format!("progress stalled at {}%", percent));
                    }
                }
                None => {
                    // A percentage that vanishes after being seen leaves only the overall timer.
                    if last_progress.is_none() && overall.elapsed() >= timeouts.no_progress() {
                        return Poll::Timeout("no progress reported".to_string());
                    }
                }
            }

            if self.pause(timeouts.poll_interval()) {
                return Poll::Stopped;
            }
        }
    }

    /// Dismiss the rate-limit popup if it is showing. Returns whether it was.
    fn dismiss_rate_limit(&self, session: &mut dyn AutomationSession) -> bool {
        if !session.element_visible(&self.ctx.site.rate_limit_title) {
            return false;
        }
        self.reporter.log(
            LogLevel::Warn,
            "rate_limit",
            "Rate-limit popup detected, dismissing.",
        );
        if let Err(e) = session.click(&self.ctx.site.rate_limit_dismiss) {
            self.reporter.log(
                LogLevel::Warn,
                "rate_limit",
                &format!("Dismiss click failed: {}", e),
            );
        }
        true
    }
}
