//! Batch face swapping through a web tool, driven by a bounded pool of
//! browser sessions.
//!
//! Every (person, face) pair gets a [`runner::Runner`] that applies the face
//! to every source image. The [`tasks::Scheduler`] limits how many runners
//! are alive, tracks completions in a [`tasks::ProgressLedger`], and hands
//! finished work to a [`review::ResultSink`].

pub mod artifact;
pub mod automation;
pub mod config;
pub mod error;
pub mod library;
pub mod logging;
pub mod model;
pub mod review;
pub mod runner;
pub mod tasks;

pub use config::Config;
pub use error::{AutomationError, StartError};
pub use model::{Face, Person, RunConfig, SourceImage, WorkItem, WorkerId};
pub use tasks::{RunEvent, Scheduler};
