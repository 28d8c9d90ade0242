//! Cross-runner bookkeeping of which faces finished which source images.
//!
//! A source image is fully done once every selected person (with at least
//! one face) has completed every one of their faces on it. Completion of a
//! single person triggers review queueing; full completion triggers
//! archiving.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::model::{Person, SourceImage};

/// Progress of one source image across all persons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceProgress {
    total_faces: BTreeMap<String, usize>,
    completed: BTreeMap<String, BTreeSet<String>>,
    results: BTreeMap<String, BTreeSet<PathBuf>>,
    persons_done: BTreeSet<String>,
}

impl SourceProgress {
    pub fn total_faces(&self, person: &str) -> usize {
        self.total_faces.get(person).copied().unwrap_or(0)
    }

    pub fn completed_faces(&self, person: &str) -> usize {
        self.completed.get(person).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn is_person_done(&self, person: &str) -> bool {
        self.persons_done.contains(person)
    }

    pub fn is_fully_done(&self) -> bool {
        self.total_faces
            .keys()
            .all(|person| self.persons_done.contains(person))
    }

    pub fn persons(&self) -> impl Iterator<Item = &str> {
        self.total_faces.keys().map(String::as_str)
    }

    pub fn results_for(&self, person: &str) -> Vec<PathBuf> {
        self.results
            .get(person)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Effect of recording one completed face.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionUpdate {
    /// False when the source or face is unknown and nothing changed.
    pub accepted: bool,
    /// True only on the transition that completed the person.
    pub person_done_for_source: bool,
    pub source_fully_done: bool,
    /// The person's results on this source so far.
    pub results: Vec<PathBuf>,
}

/// Per-person counts for one source in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonCount {
    pub person: String,
    pub completed: usize,
    pub total: usize,
}

/// Read-only copy of the ledger for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub sources: BTreeMap<PathBuf, Vec<PersonCount>>,
}

#[derive(Debug, Default)]
pub struct ProgressLedger {
    sources: BTreeMap<PathBuf, SourceProgress>,
    /// Valid face stems per person for the current run.
    face_stems: BTreeMap<String, BTreeSet<String>>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh ledger with one entry per (source, person with faces).
    pub fn seeded(persons: &[Person], sources: &[SourceImage]) -> Self {
        let mut ledger = Self::new();
        ledger.seed(persons, sources);
        ledger
    }

    /// Replace all contents with entries for this run.
    pub fn seed(&mut self, persons: &[Person], sources: &[SourceImage]) {
        self.clear();
        for person in persons.iter().filter(|p| p.has_faces()) {
            self.face_stems.insert(
                person.name.clone(),
                person.faces.iter().map(|f| f.stem()).collect(),
            );
        }

        for source in sources {
            let mut progress = SourceProgress::default();
            for (name, stems) in &self.face_stems {
                progress.total_faces.insert(name.clone(), stems.len());
                progress.completed.insert(name.clone(), BTreeSet::new());
                progress.results.insert(name.clone(), BTreeSet::new());
            }
            if !progress.total_faces.is_empty() {
                self.sources.insert(source.path.clone(), progress);
            }
        }
    }

    /// Record that `face_stem` of `person` finished `source`.
    ///
    /// Recording the same face twice is harmless; the completion transition
    /// fires only once per (source, person).
    pub fn record_face_complete(
        &mut self,
        source: &Path,
        person: &str,
        face_stem: &str,
        output_path: &Path,
    ) -> CompletionUpdate {
        let known_face = self
            .face_stems
            .get(person)
            .is_some_and(|stems| stems.contains(face_stem));
        let Some(progress) = self.sources.get_mut(source) else {
            return CompletionUpdate::default();
        };
        if !known_face {
            return CompletionUpdate::default();
        }

        progress
            .completed
            .entry(person.to_string())
            .or_default()
            .insert(face_stem.to_string());
        progress
            .results
            .entry(person.to_string())
            .or_default()
            .insert(output_path.to_path_buf());

        let mut person_done_for_source = false;
        if !progress.persons_done.contains(person)
            && progress.completed_faces(person) >= progress.total_faces(person)
        {
            progress.persons_done.insert(person.to_string());
            person_done_for_source = true;
        }

        CompletionUpdate {
            accepted: true,
            person_done_for_source,
            source_fully_done: progress.is_fully_done(),
            results: progress.results_for(person),
        }
    }

    pub fn get(&self, source: &Path) -> Option<&SourceProgress> {
        self.sources.get(source)
    }

    pub fn contains(&self, source: &Path) -> bool {
        self.sources.contains_key(source)
    }

    pub fn remove_source(&mut self, source: &Path) -> Option<SourceProgress> {
        self.sources.remove(source)
    }

    /// Number of tracked source images.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Number of (source, person) entries.
    pub fn entry_count(&self) -> usize {
        self.sources.values().map(|p| p.total_faces.len()).sum()
    }

    pub fn pending_sources(&self) -> Vec<PathBuf> {
        self.sources.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.sources.clear();
        self.face_stems.clear();
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let sources = self
            .sources
            .iter()
            .map(|(path, progress)| {
                let counts = progress
                    .persons()
                    .map(|person| PersonCount {
                        person: person.to_string(),
                        completed: progress.completed_faces(person),
                        total: progress.total_faces(person),
                    })
                    .collect();
                (path.clone(), counts)
            })
            .collect();
        LedgerSnapshot { sources }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Face;

    fn person(name: &str, faces: &[&str]) -> Person {
        Person::new(
            name,
            format!("/ai/Faces/{}", name),
            faces
                .iter()
                .map(|f| Face::new(format!("/ai/Faces/{}/{}.jpg", name, f)))
                .collect(),
        )
    }

    fn source(name: &str) -> SourceImage {
        SourceImage::new(format!("/ai/SourceImages/{}", name))
    }

    fn out(name: &str) -> PathBuf {
        PathBuf::from(format!("/ai/Temp/{}.jpg", name))
    }

    #[test]
    fn test_seed_skips_persons_without_faces() {
        let persons = vec![
            person("Alice", &["a", "b"]),
            person("Bob", &["x"]),
            person("Nobody", &[]),
        ];
        let sources = vec![source("1.jpg"), source("2.jpg"), source("3.jpg")];

        let ledger = ProgressLedger::seeded(&persons, &sources);

        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.entry_count(), 6);
        let progress = ledger.get(&sources[0].path).unwrap();
        assert_eq!(progress.total_faces("Alice"), 2);
        assert_eq!(progress.total_faces("Nobody"), 0);
    }

    #[test]
    fn test_nobody_with_faces_seeds_nothing() {
        let ledger = ProgressLedger::seeded(&[person("Nobody", &[])], &[source("1.jpg")]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_person_done_fires_once() {
        let src = source("1.jpg");
        let mut ledger = ProgressLedger::seeded(
            &[person("Alice", &["a", "b"]), person("Bob", &["x"])],
            &[src.clone()],
        );

        let first = ledger.record_face_complete(&src.path, "Alice", "a", &out("Aa"));
        assert!(first.accepted);
        assert!(!first.person_done_for_source);
        assert!(!first.source_fully_done);

        let second = ledger.record_face_complete(&src.path, "Alice", "b", &out("Ab"));
        assert!(second.person_done_for_source);
        assert!(!second.source_fully_done);
        assert_eq!(second.results, vec![out("Aa"), out("Ab")]);

        let again = ledger.record_face_complete(&src.path, "Alice", "b", &out("Ab"));
        assert!(again.accepted);
        assert!(!again.person_done_for_source);

        let bob = ledger.record_face_complete(&src.path, "Bob", "x", &out("Bx"));
        assert!(bob.person_done_for_source);
        assert!(bob.source_fully_done);
    }

    #[test]
    fn test_completion_order_does_not_matter() {
        let persons = [person("Alice", &["a", "b"]), person("Bob", &["x", "y"])];
        let src = source("1.jpg");
        let records = [("Alice", "a"), ("Bob", "x"), ("Alice", "b"), ("Bob", "y")];

        // Every rotation of the same completions reaches the same end state.
        for shift in 0..records.len() {
            let mut ledger = ProgressLedger::seeded(&persons, &[src.clone()]);
            let mut done_events = 0;
            let mut fully_done_at = None;
            for i in 0..records.len() {
                let (p, f) = records[(i + shift) % records.len()];
                let update = ledger.record_face_complete(&src.path, p, f, &out(f));
                if update.person_done_for_source {
                    done_events += 1;
                }
                if update.source_fully_done && fully_done_at.is_none() {
                    fully_done_at = Some(i);
                }
            }
            assert_eq!(done_events, 2);
            assert_eq!(fully_done_at, Some(records.len() - 1));
        }
    }

    #[test]
    fn test_unknown_inputs_are_ignored() {
        let src = source("1.jpg");
        let mut ledger = ProgressLedger::seeded(&[person("Alice", &["a"])], &[src.clone()]);

        let foreign = ledger.record_face_complete(&src.path, "Alice", "zzz", &out("x"));
        assert!(!foreign.accepted);
        assert_eq!(ledger.get(&src.path).unwrap().completed_faces("Alice"), 0);

        let untracked = ledger.record_face_complete(Path::new("/elsewhere.jpg"), "Alice", "a", &out("x"));
        assert_eq!(untracked, CompletionUpdate::default());
    }

    #[test]
    fn test_remove_and_snapshot() {
        let a = source("a.jpg");
        let b = source("b.jpg");
        let mut ledger = ProgressLedger::seeded(&[person("Alice", &["f"])], &[a.clone(), b.clone()]);
        ledger.record_face_complete(&a.path, "Alice", "f", &out("af"));

        let snapshot = ledger.snapshot();
        assert_eq!(
            snapshot.sources[&a.path],
            vec![PersonCount {
                person: "Alice".to_string(),
                completed: 1,
                total: 1
            }]
        );

        assert!(ledger.remove_source(&a.path).is_some());
        assert!(ledger.remove_source(&a.path).is_none());
        assert_eq!(ledger.pending_sources(), vec![b.path.clone()]);
    }
}
