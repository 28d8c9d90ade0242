//! Where finished work goes: the review queue and the completed-sources archive.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LibraryConfig;
use crate::model::{SourceImage, WorkItem};

pub const PENDING_REVIEW_FILENAME: &str = "PendingReview.json";

/// Receives ledger transitions from the scheduler. Called outside any lock,
/// from the scheduler thread.
pub trait ResultSink: Send + Sync {
    /// Every face of `person` finished `source`.
    fn person_done(&self, source: &SourceImage, person: &str, results: &[PathBuf]) -> Result<()>;

    /// Every selected person finished `source`. `archive` asks for the source
    /// to be moved out of the inbox.
    fn source_done(&self, source: &SourceImage, archive: bool) -> Result<()>;

    fn item_failed(&self, _item: &WorkItem, _reason: &str) {}
}

/// One person's results for one source, awaiting human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub source_path: PathBuf,
    pub person: String,
    pub result_paths: Vec<PathBuf>,
    pub queued_at: DateTime<Utc>,
}

/// File-backed review queue at `<root>/PendingReview.json`.
pub struct ReviewQueue {
    path: PathBuf,
    completed_dir: PathBuf,
    entries: Mutex<Vec<ReviewEntry>>,
}

impl ReviewQueue {
    pub fn open(library: &LibraryConfig) -> Result<Self> {
        Self::open_at(library.review_queue_path(), library.completed_dir())
    }

    pub fn open_at(path: PathBuf, completed_dir: PathBuf) -> Result<Self> {
        let entries = load_entries(&path)?;
        tracing::info!(
            path = %path.display(),
            count = entries.len(),
            "Loaded review queue"
        );
        Ok(Self {
            path,
            completed_dir,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Vec<ReviewEntry> {
        self.lock().clone()
    }

    /// Queue an entry. Returns `false` if (source, person) is already queued.
    pub fn add(&self, entry: ReviewEntry) -> Result<bool> {
        let mut entries = self.lock();
        if entries
            .iter()
            .any(|e| e.source_path == entry.source_path && e.person == entry.person)
        {
            tracing::warn!(
                source = %entry.source_path.display(),
                person = %entry.person,
                "Duplicate review entry ignored"
            );
            return Ok(false);
        }
        entries.push(entry);
        save_entries(&self.path, &entries)?;
        Ok(true)
    }

    /// Drop a reviewed entry. Returns whether one was removed.
    pub fn remove(&self, source: &Path, person: &str) -> Result<bool> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !(e.source_path == source && e.person == person));
        if entries.len() == before {
            return Ok(false);
        }
        save_entries(&self.path, &entries)?;
        Ok(true)
    }

    /// Move a finished source into the completed folder.
    pub fn archive(&self, source: &Path) -> Result<PathBuf> {
        let file_name = source
            .file_name()
            .with_context(|| format!("No file name in {}", source.display()))?;
        fs::create_dir_all(&self.completed_dir)
            .with_context(|| format!("Failed to create {}", self.completed_dir.display()))?;
        let target = self.completed_dir.join(file_name);
        move_file(source, &target)?;
        tracing::info!(
            source = %source.display(),
            target = %target.display(),
            "Archived completed source"
        );
        Ok(target)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ReviewEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResultSink for ReviewQueue {
    fn person_done(&self, source: &SourceImage, person: &str, results: &[PathBuf]) -> Result<()> {
        let mut result_paths = results.to_vec();
        result_paths.sort();
        self.add(ReviewEntry {
            source_path: source.path.clone(),
            person: person.to_string(),
            result_paths,
            queued_at: Utc::now(),
        })?;
        Ok(())
    }

    fn source_done(&self, source: &SourceImage, archive: bool) -> Result<()> {
        if archive {
            self.archive(&source.path)?;
        }
        Ok(())
    }

    fn item_failed(&self, item: &WorkItem, reason: &str) {
        tracing::debug!(item = %item, reason, "Item attempt failed");
    }
}

fn load_entries(path: &Path) -> Result<Vec<ReviewEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str(&content) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            let backup = backup_corrupt(path)?;
            tracing::error!(
                path = %path.display(),
                backup = %backup.display(),
                "Review queue is corrupt, starting fresh: {}",
                e
            );
            Ok(Vec::new())
        }
    }
}

fn backup_corrupt(path: &Path) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let backup = path.with_extension(format!("json.corrupt_{}", stamp));
    fs::copy(path, &backup).with_context(|| format!("Failed to back up {}", path.display()))?;
    Ok(backup)
}

fn save_entries(path: &Path, entries: &[ReviewEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Rename, or copy and delete when crossing filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("Failed to remove {}", from.display()))?;
    Ok(())
}

/// Sink that only records calls.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub person_done: Mutex<Vec<(PathBuf, String, Vec<PathBuf>)>>,
    pub source_done: Mutex<Vec<(PathBuf, bool)>>,
    pub failures: Mutex<Vec<String>>,
}

#[cfg(test)]
impl ResultSink for RecordingSink {
    fn person_done(&self, source: &SourceImage, person: &str, results: &[PathBuf]) -> Result<()> {
        self.person_done
            .lock()
            .unwrap()
            .push((source.path.clone(), person.to_string(), results.to_vec()));
        Ok(())
    }

    fn source_done(&self, source: &SourceImage, archive: bool) -> Result<()> {
        self.source_done
            .lock()
            .unwrap()
            .push((source.path.clone(), archive));
        Ok(())
    }

    fn item_failed(&self, item: &WorkItem, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .push(format!("{}: {}", item, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue(root: &Path) -> ReviewQueue {
        ReviewQueue::open_at(
            root.join(PENDING_REVIEW_FILENAME),
            root.join("SourceImages/Completed"),
        )
        .unwrap()
    }

    #[test]
    fn test_person_done_persists_and_dedups() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        let source = SourceImage::new(dir.path().join("SourceImages/beach.jpg"));
        let results = vec![dir.path().join("Temp/b.jpg"), dir.path().join("Temp/a.jpg")];

        q.person_done(&source, "Alice", &results).unwrap();
        q.person_done(&source, "Alice", &results).unwrap();
        q.person_done(&source, "Bob", &results[..1]).unwrap();

        let reopened = queue(dir.path());
        let entries = reopened.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].person, "Alice");
        assert_eq!(
            entries[0].result_paths,
            vec![dir.path().join("Temp/a.jpg"), dir.path().join("Temp/b.jpg")]
        );

        assert!(reopened.remove(&source.path, "Alice").unwrap());
        assert!(!reopened.remove(&source.path, "Alice").unwrap());
        assert_eq!(queue(dir.path()).entries().len(), 1);
    }

    #[test]
    fn test_corrupt_queue_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PENDING_REVIEW_FILENAME);
        fs::write(&path, "{ not json").unwrap();

        let q = queue(dir.path());
        assert!(q.entries().is_empty());

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".json.corrupt_"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), "{ not json");
    }

    #[test]
    fn test_source_done_archives_when_asked() {
        let dir = tempdir().unwrap();
        let inbox = dir.path().join("SourceImages");
        fs::create_dir_all(&inbox).unwrap();
        let kept = SourceImage::new(inbox.join("keep.jpg"));
        let moved = SourceImage::new(inbox.join("move.jpg"));
        fs::write(&kept.path, b"x").unwrap();
        fs::write(&moved.path, b"y").unwrap();

        let q = queue(dir.path());
        q.source_done(&kept, false).unwrap();
        q.source_done(&moved, true).unwrap();

        assert!(kept.path.exists());
        assert!(!moved.path.exists());
        assert_eq!(
            fs::read(inbox.join("Completed/move.jpg")).unwrap(),
            b"y".to_vec()
        );
    }

    #[test]
    fn test_archive_missing_source_fails() {
        let dir = tempdir().unwrap();
        let q = queue(dir.path());
        assert!(q.archive(&dir.path().join("gone.jpg")).is_err());
    }
}
