//! Run-scoped data model. Everything here is immutable once a run starts.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{RetryConfig, TimeoutConfig};
use crate::automation::SiteProfile;

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name_of(path))
}

/// A single face image of a person.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Face {
    pub path: PathBuf,
    pub filename: String,
}

impl Face {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = file_name_of(&path);
        Self { path, filename }
    }

    /// Filename without extension; identifies the face within its person.
    pub fn stem(&self) -> String {
        stem_of(&self.path)
    }
}

/// A person and their face images. The name is the unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub name: String,
    pub directory: PathBuf,
    pub faces: Vec<Face>,
}

impl Person {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, faces: Vec<Face>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            faces,
        }
    }

    pub fn has_faces(&self) -> bool {
        !self.faces.is_empty()
    }
}

/// A photograph the faces are applied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceImage {
    pub path: PathBuf,
    pub filename: String,
}

impl SourceImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = file_name_of(&path);
        Self { path, filename }
    }

    pub fn stem(&self) -> String {
        stem_of(&self.path)
    }
}

/// One (person, face, source) unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub person: String,
    pub face: Face,
    pub source: SourceImage,
    pub output_dir: PathBuf,
}

impl WorkItem {
    pub fn new(person: &str, face: &Face, source: &SourceImage, output_dir: &Path) -> Self {
        Self {
            person: person.to_string(),
            face: face.clone(),
            source: source.clone(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Deterministic result location: `<output>/<person> <face-stem> <source-stem>.jpg`.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{} {} {}.jpg",
            self.person,
            self.face.stem(),
            self.source.stem()
        ))
    }

    pub fn worker_id(&self) -> WorkerId {
        WorkerId::new(&self.person, &self.face)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} on {}", self.person, self.face.filename, self.source.filename)
    }
}

/// Stable identifier of a runner: person name plus face stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(person: &str, face: &Face) -> Self {
        WorkerId(format!("{}/{}", person, face.stem()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Person component of the id.
    pub fn person(&self) -> &str {
        self.0.rsplit_once('/').map(|(p, _)| p).unwrap_or(&self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a run needs, fixed at `start()`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub selected_persons: Vec<String>,
    pub source_images: Vec<SourceImage>,
    pub output_dir: PathBuf,
    pub headless: bool,
    pub move_on_completion: bool,
    pub concurrency: usize,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub site: SiteProfile,
    pub jpeg_quality: u8,
}

impl RunConfig {
    pub fn new(
        selected_persons: Vec<String>,
        source_images: Vec<SourceImage>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            selected_persons,
            source_images,
            output_dir: output_dir.into(),
            headless: true,
            move_on_completion: true,
            concurrency: 6,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            site: SiteProfile::default(),
            jpeg_quality: 75,
        }
    }

    pub fn from_config(
        config: &crate::config::Config,
        selected_persons: Vec<String>,
        source_images: Vec<SourceImage>,
    ) -> Self {
        Self {
            selected_persons,
            source_images,
            output_dir: config.library.output_dir(),
            headless: config.run.headless,
            move_on_completion: config.run.move_on_completion,
            concurrency: config.run.concurrency,
            timeouts: config.timeouts.clone(),
            retry: config.retry.clone(),
            site: config.site.clone(),
            jpeg_quality: config.output.jpeg_quality,
        }
    }
}
