//! Run orchestration: runner events, run events, and shared run state.
//!
//! Runners report to the scheduler over one channel; the scheduler folds
//! those reports into the shared state and the ledger, then republishes
//! them to subscribers as [`RunEvent`]s.

pub mod ledger;
pub mod manager;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::automation::{CancelToken, SessionKill};
use crate::model::{WorkItem, WorkerId};

pub use ledger::{CompletionUpdate, LedgerSnapshot, ProgressLedger};
pub use manager::Scheduler;

/// Severity of an operator log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.pad(label)
    }
}

/// How a runner ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerOutcome {
    Completed,
    Stopped,
    Aborted(String),
}

impl fmt::Display for RunnerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerOutcome::Completed => f.write_str("completed"),
            RunnerOutcome::Stopped => f.write_str("stopped"),
            RunnerOutcome::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

/// Messages a runner sends to the scheduler.
pub enum RunnerEvent {
    /// A browser session exists; `kill` can terminate it from another thread.
    SessionOpened {
        worker: WorkerId,
        kill: Arc<dyn SessionKill>,
    },
    Log {
        worker: WorkerId,
        level: LogLevel,
        message: String,
    },
    ItemSucceeded {
        item: WorkItem,
        output_path: PathBuf,
    },
    ItemFailed {
        item: WorkItem,
        reason: String,
    },
    /// Always the last message of a runner.
    Finished {
        worker: WorkerId,
        outcome: RunnerOutcome,
    },
}

/// Messages published to run subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Total number of runners per person.
    RunStarted { totals: BTreeMap<String, usize> },
    RunProgress {
        person: String,
        completed: usize,
        total: usize,
    },
    ItemSucceeded {
        item: WorkItem,
        output_path: PathBuf,
    },
    ItemFailed {
        item: WorkItem,
        reason: String,
    },
    Log {
        worker: Option<WorkerId>,
        level: LogLevel,
        message: String,
    },
    RunFinished(RunSummary),
    RunKilled,
}

/// Outcome of a run that ended without a kill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub stopped: bool,
    pub succeeded: usize,
    pub failed: usize,
    /// Sources some selected person never fully completed.
    pub undrained_sources: Vec<PathBuf>,
}

impl RunSummary {
    pub fn message(&self) -> String {
        let head = if self.stopped {
            "Run stopped"
        } else {
            "All tasks completed"
        };
        let mut message = format!(
            "{}: {} succeeded, {} failed attempts.",
            head, self.succeeded, self.failed
        );
        if !self.undrained_sources.is_empty() {
            message.push_str(&format!(
                " {} source image(s) not fully processed.",
                self.undrained_sources.len()
            ));
        }
        message
    }
}

/// Runner counts for one person.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersonProgress {
    pub completed: usize,
    pub total: usize,
}

impl PersonProgress {
    /// Progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.completed as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// A runner that has been spawned and not yet finished.
pub(crate) struct ActiveRunner {
    pub person: String,
    pub handle: Option<JoinHandle<()>>,
    pub kill: Option<Arc<dyn SessionKill>>,
}

/// Shared state of the current run. Reset whenever a run ends or is killed.
#[derive(Default)]
pub(crate) struct RunState {
    pub is_running: bool,
    pub cancel: CancelToken,
    pub active: BTreeMap<WorkerId, ActiveRunner>,
    pub progress: BTreeMap<String, PersonProgress>,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunState {
    pub fn reset(&mut self) {
        *self = RunState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_person_progress_percent() {
        assert_eq!(PersonProgress::default().percent(), 0);
        let progress = PersonProgress {
            completed: 1,
            total: 4,
        };
        assert_eq!(progress.percent(), 25);
    }

    #[test]
    fn test_summary_message() {
        let summary = RunSummary {
            stopped: false,
            succeeded: 4,
            failed: 1,
            undrained_sources: vec![PathBuf::from("/ai/SourceImages/a.jpg")],
        };
        assert_eq!(
            summary.message(),
            "All tasks completed: 4 succeeded, 1 failed attempts. 1 source image(s) not fully processed."
        );

        let stopped = RunSummary {
            stopped: true,
            ..RunSummary::default()
        };
        assert!(stopped.message().starts_with("Run stopped"));
    }
}
