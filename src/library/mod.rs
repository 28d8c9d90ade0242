//! Discovery of persons, faces and source images under the library root.
//!
//! Layout: `<root>/Faces/<person>/<face images>` and
//! `<root>/SourceImages/<images>`, where `SourceImages/Completed/` holds
//! archived sources and is never scanned.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::LibraryConfig;
use crate::model::{Face, Person, SourceImage};

fn is_image(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| e.to_lowercase() == ext))
}

/// Image files directly inside `directory`, sorted by path.
fn images_in(directory: &Path, extensions: &[String]) -> Vec<std::path::PathBuf> {
    let mut images: Vec<_> = WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_image(e.path(), extensions))
        .map(|e| e.into_path())
        .collect();
    images.sort();
    images
}

/// One [`Person`] per subdirectory of `Faces/`, including those without faces.
pub fn scan_people(library: &LibraryConfig) -> Result<Vec<Person>> {
    let faces_dir = library.faces_dir();
    if !faces_dir.is_dir() {
        tracing::warn!(dir = %faces_dir.display(), "Faces directory not found");
        return Ok(Vec::new());
    }

    let mut people = Vec::new();
    let entries = fs::read_dir(&faces_dir)
        .with_context(|| format!("Failed to read {}", faces_dir.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let faces = images_in(&path, &library.image_extensions)
            .into_iter()
            .map(Face::new)
            .collect();
        people.push(Person::new(name, path, faces));
    }
    people.sort_by(|a, b| a.name.cmp(&b.name));

    tracing::debug!(count = people.len(), "Scanned people");
    Ok(people)
}

/// Source images waiting in the inbox.
pub fn scan_sources(library: &LibraryConfig) -> Result<Vec<SourceImage>> {
    let source_dir = library.source_dir();
    if !source_dir.is_dir() {
        tracing::warn!(dir = %source_dir.display(), "Source image directory not found");
        return Ok(Vec::new());
    }
    let sources: Vec<_> = images_in(&source_dir, &library.image_extensions)
        .into_iter()
        .map(SourceImage::new)
        .collect();
    tracing::debug!(count = sources.len(), "Scanned source images");
    Ok(sources)
}

/// Create the library folders that a run writes into.
pub fn ensure_layout(library: &LibraryConfig) -> Result<()> {
    for dir in [
        library.faces_dir(),
        library.source_dir(),
        library.completed_dir(),
        library.output_dir(),
    ] {
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}
