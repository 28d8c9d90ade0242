//! Scheduler: runs a bounded pool of runners and folds their reports into
//! run state and the progress ledger.
//!
//! A single dispatcher thread owns the pending queue and is the only writer
//! of run state and ledger. The public handle only reads them, flips the
//! cancel token, or asks the dispatcher to kill the run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    ActiveRunner, LedgerSnapshot, LogLevel, PersonProgress, ProgressLedger, RunEvent, RunState,
    RunSummary, RunnerEvent, RunnerOutcome,
};
use crate::automation::{CancelToken, Deadline, SessionFactory, SessionKill};
use crate::error::StartError;
use crate::model::{Face, Person, RunConfig, SourceImage, WorkItem, WorkerId};
use crate::review::ResultSink;
use crate::runner::{Runner, RunnerContext};

/// How long the dispatcher blocks on runner events before checking control.
const DISPATCH_TICK: Duration = Duration::from_millis(25);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Control {
    Kill(Sender<()>),
}

type Subscribers = Arc<Mutex<Vec<Sender<RunEvent>>>>;

fn publish(subscribers: &Subscribers, event: RunEvent) {
    lock(subscribers).retain(|tx| tx.send(event.clone()).is_ok());
}

fn publish_log(subscribers: &Subscribers, level: LogLevel, message: String) {
    publish(
        subscribers,
        RunEvent::Log {
            worker: None,
            level,
            message,
        },
    );
}

/// Copy of `person` keeping only the first face of each stem. Runner ids,
/// ledger entries and output names are all keyed by stem.
fn unique_faces(person: &Person, subscribers: &Subscribers) -> Person {
    let mut stems = BTreeSet::new();
    let mut faces = Vec::with_capacity(person.faces.len());
    for face in &person.faces {
        if stems.insert(face.stem()) {
            faces.push(face.clone());
        } else {
            tracing::warn!(person = %person.name, face = %face.filename, "Skipping face with duplicate stem");
            publish_log(
                subscribers,
                LogLevel::Warn,
                format!(
                    "Skipping face '{}' of '{}': another face has the same name.",
                    face.filename, person.name
                ),
            );
        }
    }
    Person::new(person.name.clone(), person.directory.clone(), faces)
}

pub struct Scheduler {
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn ResultSink>,
    state: Arc<Mutex<RunState>>,
    ledger: Arc<Mutex<ProgressLedger>>,
    subscribers: Subscribers,
    control: Mutex<Option<Sender<Control>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(factory: Arc<dyn SessionFactory>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            factory,
            sink,
            state: Arc::new(Mutex::new(RunState::default())),
            ledger: Arc::new(Mutex::new(ProgressLedger::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            control: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Receive every run event published from now on.
    pub fn subscribe(&self) -> Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Validate the selection and start a run in the background.
    pub fn start(&self, people: &[Person], config: RunConfig) -> Result<(), StartError> {
        if self.is_running() {
            return Err(StartError::AlreadyRunning);
        }
        // The previous dispatcher has already reset state; reap it.
        if let Some(previous) = lock(&self.dispatcher).take() {
            let _ = previous.join();
        }

        let mut state = lock(&self.state);
        if state.is_running {
            return Err(StartError::AlreadyRunning);
        }
        if config.selected_persons.is_empty() {
            return Err(StartError::NoPersonsSelected);
        }
        if config.source_images.is_empty() {
            return Err(StartError::NoSourceImages);
        }

        let mut selected = Vec::new();
        let mut seen = BTreeSet::new();
        for name in &config.selected_persons {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match people.iter().find(|p| &p.name == name) {
                Some(person) if person.has_faces() => {
                    selected.push(unique_faces(person, &self.subscribers))
                }
                Some(_) => publish_log(
                    &self.subscribers,
                    LogLevel::Warn,
                    format!("Skipping person '{}': no face images found.", name),
                ),
                None => publish_log(
                    &self.subscribers,
                    LogLevel::Warn,
                    format!("Skipping person '{}': not found in library.", name),
                ),
            }
        }
        if selected.is_empty() {
            return Err(StartError::NoFaces);
        }

        fs::create_dir_all(&config.output_dir).map_err(|source| StartError::OutputDir {
            path: config.output_dir.clone(),
            source,
        })?;

        let mut pending = VecDeque::new();
        let mut totals = BTreeMap::new();
        for person in &selected {
            totals.insert(person.name.clone(), person.faces.len());
            for face in &person.faces {
                pending.push_back((person.name.clone(), face.clone()));
            }
        }

        *lock(&self.ledger) = ProgressLedger::seeded(&selected, &config.source_images);

        state.reset();
        state.is_running = true;
        state.progress = totals
            .iter()
            .map(|(name, total)| {
                (
                    name.clone(),
                    PersonProgress {
                        completed: 0,
                        total: *total,
                    },
                )
            })
            .collect();
        let cancel = state.cancel.clone();
        drop(state);

        tracing::info!(
            persons = selected.len(),
            runners = pending.len(),
            sources = config.source_images.len(),
            concurrency = config.concurrency,
            "Starting run"
        );
        publish(&self.subscribers, RunEvent::RunStarted { totals });

        let (control_tx, control_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let context = RunnerContext::new(self.factory.clone(), &config, cancel.clone(), events_tx);

        let dispatcher = Dispatcher {
            config,
            context,
            cancel,
            pending,
            events: events_rx,
            control: control_rx,
            state: self.state.clone(),
            ledger: self.ledger.clone(),
            subscribers: self.subscribers.clone(),
            sink: self.sink.clone(),
        };

        let spawned = thread::Builder::new()
            .name("swap-scheduler".to_string())
            .spawn(move || dispatcher.run());
        match spawned {
            Ok(handle) => {
                *lock(&self.dispatcher) = Some(handle);
                *lock(&self.control) = Some(control_tx);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to spawn scheduler thread: {}", e);
                lock(&self.state).reset();
                lock(&self.ledger).clear();
                Err(StartError::Spawn(e.to_string()))
            }
        }
    }

    /// Ask every runner to wind down. Returns `false` if no run is active or
    /// a stop was already requested.
    pub fn stop(&self) -> bool {
        let state = lock(&self.state);
        if !state.is_running {
            return false;
        }
        let first = state.cancel.cancel();
        drop(state);
        if first {
            tracing::info!("Stop requested");
            publish_log(
                &self.subscribers,
                LogLevel::Info,
                "Stop requested, waiting for runners to finish.".to_string(),
            );
        }
        first
    }

    /// Terminate the run immediately, force-closing every browser session.
    /// Blocks until the run state is reset. Returns `false` if nothing ran.
    pub fn kill(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(control) = lock(&self.control).clone() else {
            return false;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if control.send(Control::Kill(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv().is_ok()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_running
    }

    /// Block until the current run (if any) has ended.
    pub fn wait(&self) {
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Scheduler thread panicked");
            }
        }
    }

    pub fn active_worker_ids(&self) -> Vec<WorkerId> {
        lock(&self.state).active.keys().cloned().collect()
    }

    pub fn active_worker_ids_for_person(&self, person: &str) -> Vec<WorkerId> {
        lock(&self.state)
            .active
            .iter()
            .filter(|(_, runner)| runner.person == person)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn progress(&self) -> BTreeMap<String, PersonProgress> {
        lock(&self.state).progress.clone()
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        lock(&self.ledger).snapshot()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill();
        }
        self.wait();
    }
}

/// Owns one run from start to its final event.
struct Dispatcher {
    config: RunConfig,
    context: RunnerContext,
    cancel: CancelToken,
    pending: VecDeque<(String, Face)>,
    events: Receiver<RunnerEvent>,
    control: Receiver<Control>,
    state: Arc<Mutex<RunState>>,
    ledger: Arc<Mutex<ProgressLedger>>,
    subscribers: Subscribers,
    sink: Arc<dyn ResultSink>,
}

impl Dispatcher {
    fn run(mut self) {
        self.promote();
        loop {
            if let Ok(Control::Kill(ack)) = self.control.try_recv() {
                self.kill();
                let _ = ack.send(());
                return;
            }
            if self.drained() {
                self.finish();
                return;
            }
            match self.events.recv_timeout(DISPATCH_TICK) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::error!("Runner channel closed unexpectedly");
                    self.finish();
                    return;
                }
            }
        }
    }

    fn drained(&self) -> bool {
        lock(&self.state).active.is_empty()
            && (self.pending.is_empty() || self.cancel.is_cancelled())
    }

    /// Spawn runners from the queue up to the concurrency ceiling.
    fn promote(&mut self) {
        let ceiling = self.config.concurrency.max(1);
        while !self.cancel.is_cancelled() && lock(&self.state).active.len() < ceiling {
            let Some((person, face)) = self.pending.pop_front() else {
                break;
            };
            self.spawn_runner(person, face);
        }
    }

    fn spawn_runner(&mut self, person: String, face: Face) {
        let runner = Runner::new(
            &person,
            face,
            self.config.source_images.clone(),
            self.context.clone(),
        );
        let id = runner.id().clone();

        let spawned = thread::Builder::new()
            .name(format!("runner-{}", id))
            .spawn(move || {
                runner.run();
            });

        match spawned {
            Ok(handle) => {
                tracing::debug!(worker = %id, "Runner spawned");
                lock(&self.state).active.insert(
                    id,
                    ActiveRunner {
                        person,
                        handle: Some(handle),
                        kill: None,
                    },
                );
            }
            Err(e) => {
                tracing::error!(worker = %id, "Failed to spawn runner: {}", e);
                publish_log(
                    &self.subscribers,
                    LogLevel::Error,
                    format!("[{}] Failed to start runner: {}", id, e),
                );
                self.count_finished(&person);
            }
        }
    }

    fn handle(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::SessionOpened { worker, kill } => {
                if let Some(runner) = lock(&self.state).active.get_mut(&worker) {
                    runner.kill = Some(kill);
                }
            }
            RunnerEvent::Log {
                worker,
                level,
                message,
            } => publish(
                &self.subscribers,
                RunEvent::Log {
                    worker: Some(worker),
                    level,
                    message,
                },
            ),
            RunnerEvent::ItemSucceeded { item, output_path } => {
                lock(&self.state).succeeded += 1;
                publish(
                    &self.subscribers,
                    RunEvent::ItemSucceeded {
                        item: item.clone(),
                        output_path: output_path.clone(),
                    },
                );
                self.record_success(&item, &output_path);
            }
            RunnerEvent::ItemFailed { item, reason } => {
                lock(&self.state).failed += 1;
                self.sink.item_failed(&item, &reason);
                publish(&self.subscribers, RunEvent::ItemFailed { item, reason });
            }
            RunnerEvent::Finished { worker, outcome } => {
                let finished = lock(&self.state).active.remove(&worker);
                let Some(runner) = finished else {
                    return;
                };
                if let Some(handle) = runner.handle {
                    if handle.join().is_err() {
                        tracing::error!(worker = %worker, "Runner thread panicked");
                    }
                }
                if let RunnerOutcome::Aborted(reason) = &outcome {
                    publish(
                        &self.subscribers,
                        RunEvent::Log {
                            worker: Some(worker.clone()),
                            level: LogLevel::Error,
                            message: format!("[{}] Runner aborted: {}", worker, reason),
                        },
                    );
                }
                self.count_finished(&runner.person);
                self.promote();
            }
        }
    }

    fn count_finished(&mut self, person: &str) {
        let progress = {
            let mut state = lock(&self.state);
            let entry = state.progress.entry(person.to_string()).or_default();
            entry.completed += 1;
            *entry
        };
        publish(
            &self.subscribers,
            RunEvent::RunProgress {
                person: person.to_string(),
                completed: progress.completed,
                total: progress.total,
            },
        );
    }

    /// Apply a success to the ledger and hand transitions to the sink.
    fn record_success(&mut self, item: &WorkItem, output_path: &Path) {
        let update = lock(&self.ledger).record_face_complete(
            &item.source.path,
            &item.person,
            &item.face.stem(),
            output_path,
        );
        if !update.accepted {
            tracing::warn!(item = %item, "Result for untracked source or face ignored");
            return;
        }

        if update.person_done_for_source {
            tracing::info!(
                person = %item.person,
                source = %item.source.filename,
                "Person finished source"
            );
            match self
                .sink
                .person_done(&item.source, &item.person, &update.results)
            {
                Ok(()) => publish_log(
                    &self.subscribers,
                    LogLevel::Info,
                    format!(
                        "All faces of {} finished {}; queued for review.",
                        item.person, item.source.filename
                    ),
                ),
                Err(e) => self.report_sink_error("queue review", &item.source, &e),
            }
        }

        if update.source_fully_done {
            if let Err(e) = self
                .sink
                .source_done(&item.source, self.config.move_on_completion)
            {
                self.report_sink_error("archive source", &item.source, &e);
            }
            lock(&self.ledger).remove_source(&item.source.path);
            publish_log(
                &self.subscribers,
                LogLevel::Info,
                format!("Source {} fully processed.", item.source.filename),
            );
        }
    }

    fn report_sink_error(&self, action: &str, source: &SourceImage, error: &anyhow::Error) {
        tracing::error!(source = %source.filename, "Failed to {}: {:#}", action, error);
        publish_log(
            &self.subscribers,
            LogLevel::Error,
            format!("Failed to {} for {}: {:#}", action, source.filename, error),
        );
    }

    fn finish(&mut self) {
        let undrained_sources = {
            let mut ledger = lock(&self.ledger);
            let pending = ledger.pending_sources();
            ledger.clear();
            pending
        };
        let summary = {
            let mut state = lock(&self.state);
            let summary = RunSummary {
                stopped: self.cancel.is_cancelled(),
                succeeded: state.succeeded,
                failed: state.failed,
                undrained_sources,
            };
            state.reset();
            summary
        };
        tracing::info!(
            stopped = summary.stopped,
            succeeded = summary.succeeded,
            failed = summary.failed,
            undrained = summary.undrained_sources.len(),
            "Run finished"
        );
        publish(&self.subscribers, RunEvent::RunFinished(summary));
    }

    fn kill(&mut self) {
        tracing::warn!("Kill requested, terminating all browser sessions");
        self.cancel.cancel();

        let mut handles = Vec::new();
        let mut kills: Vec<Arc<dyn SessionKill>> = Vec::new();
        {
            let mut state = lock(&self.state);
            for (id, runner) in state.active.iter_mut() {
                if let Some(handle) = runner.handle.take() {
                    handles.push((id.clone(), handle));
                }
                kills.extend(runner.kill.take());
            }
        }
        for kill in &kills {
            kill.terminate();
        }

        let grace = Deadline::after(self.config.timeouts.kill_grace());
        loop {
            // Sessions opened while we were collecting handles.
            while let Ok(event) = self.events.try_recv() {
                if let RunnerEvent::SessionOpened { kill, .. } = event {
                    kill.terminate();
                }
            }
            let (done, running): (Vec<_>, Vec<_>) =
                handles.into_iter().partition(|(_, h)| h.is_finished());
            for (id, handle) in done {
                if handle.join().is_err() {
                    tracing::error!(worker = %id, "Runner thread panicked");
                }
            }
            handles = running;
            if handles.is_empty() || grace.expired() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        for (id, _) in &handles {
            tracing::warn!(worker = %id, "Runner did not exit within grace period, detaching");
        }
        drop(handles);

        lock(&self.ledger).clear();
        lock(&self.state).reset();
        publish(&self.subscribers, RunEvent::RunKilled);
    }
}
