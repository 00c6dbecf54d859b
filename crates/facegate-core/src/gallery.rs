//! Enrolled face gallery: enrollment from a labeled directory tree and
//! the on-disk storage artifact.
//!
//! The artifact is a single JSON object with parallel arrays:
//!
//! ```text
//! { "labels": ["alice", "alice", "bob"], "embeddings": [[...], [...], [...]] }
//! ```

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::{Embedding, GalleryEntry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("failed to read enrollment directory {path}: {source}")]
    EnrollmentRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("embedding provider failed on {path}: {source}")]
    Provider {
        path: PathBuf,
        #[source]
        source: ProviderError,
    },
    #[error("enrolled embeddings disagree on dimensionality: {label} has {found}, expected {expected}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        found: usize,
    },
    #[error("failed to write gallery {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serialized form of a [`Gallery`].
#[derive(Serialize, Deserialize)]
struct GalleryBlob {
    labels: Vec<String>,
    embeddings: Vec<Embedding>,
}

/// Ordered set of enrolled `(label, embedding)` entries.
///
/// Built once by enrollment and read-only afterwards; re-enrollment
/// replaces the whole gallery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimensionality shared by every entry, if any are enrolled.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    /// Labels with their entry counts, in first-enrolled order.
    pub fn label_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for entry in &self.entries {
            match counts.iter_mut().find(|(label, _)| *label == entry.label) {
                Some((_, n)) => *n += 1,
                None => counts.push((entry.label.clone(), 1)),
            }
        }
        counts
    }

    /// Enroll every image under `root/<label>/`.
    ///
    /// One entry is appended per face the provider returns; images with no
    /// face are skipped. Directories and files are visited in name order so
    /// rebuilding from the same tree yields the same gallery.
    pub fn build<P: EmbeddingProvider + ?Sized>(
        root: &Path,
        provider: &mut P,
    ) -> Result<Self, GalleryError> {
        let mut entries = Vec::new();
        let mut skipped = 0usize;

        for label_dir in sorted_children(root)? {
            if !label_dir.is_dir() {
                continue;
            }
            let Some(label) = label_dir.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %label_dir.display(), "skipping non-UTF-8 label directory");
                continue;
            };

            for image_path in sorted_children(&label_dir)? {
                if !is_image_file(&image_path) {
                    continue;
                }
                let faces = provider
                    .embed(&image_path)
                    .map_err(|source| GalleryError::Provider {
                        path: image_path.clone(),
                        source,
                    })?;
                if faces.is_empty() {
                    skipped += 1;
                    tracing::debug!(path = %image_path.display(), "no face found; skipping");
                    continue;
                }
                for face in faces {
                    entries.push(GalleryEntry {
                        label: label.to_string(),
                        embedding: face.embedding,
                    });
                }
            }
        }

        let gallery = Self { entries };
        gallery.check_dimensions()?;
        tracing::info!(
            entries = gallery.len(),
            labels = gallery.label_counts().len(),
            skipped,
            "enrollment complete"
        );
        Ok(gallery)
    }

    /// Load a previously saved gallery.
    ///
    /// A missing, unreadable or inconsistent artifact is reported as
    /// [`GalleryError::Unavailable`].
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let unavailable = |reason: String| GalleryError::Unavailable {
            path: path.to_path_buf(),
            reason,
        };

        let data = fs::read(path).map_err(|e| unavailable(e.to_string()))?;
        let blob: GalleryBlob =
            serde_json::from_slice(&data).map_err(|e| unavailable(format!("corrupt gallery: {e}")))?;

        if blob.labels.len() != blob.embeddings.len() {
            return Err(unavailable(format!(
                "{} labels but {} embeddings",
                blob.labels.len(),
                blob.embeddings.len()
            )));
        }

        let gallery = Self {
            entries: blob
                .labels
                .into_iter()
                .zip(blob.embeddings)
                .map(|(label, embedding)| GalleryEntry { label, embedding })
                .collect(),
        };
        gallery
            .check_dimensions()
            .map_err(|e| unavailable(e.to_string()))?;

        tracing::info!(path = %path.display(), entries = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    /// Atomically write the gallery to `path`, replacing any previous artifact.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let write_err = |source: io::Error| GalleryError::Write {
            path: path.to_path_buf(),
            source,
        };

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(write_err)?;

        let blob = GalleryBlob {
            labels: self.entries.iter().map(|e| e.label.clone()).collect(),
            embeddings: self.entries.iter().map(|e| e.embedding.clone()).collect(),
        };
        let serialized = serde_json::to_vec(&blob)?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
        tmp.write_all(&serialized).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;

        tracing::info!(path = %path.display(), entries = self.len(), "gallery saved");
        Ok(())
    }

    fn check_dimensions(&self) -> Result<(), GalleryError> {
        let Some(expected) = self.dim() else {
            return Ok(());
        };
        match self.entries.iter().find(|e| e.embedding.dim() != expected) {
            Some(bad) => Err(GalleryError::DimensionMismatch {
                label: bad.label.clone(),
                expected,
                found: bad.embedding.dim(),
            }),
            None => Ok(()),
        }
    }
}

fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let read_err = |source: io::Error| GalleryError::EnrollmentRead {
        path: dir.to_path_buf(),
        source,
    };
    let mut children = fs::read_dir(dir)
        .map_err(read_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    children.sort();
    Ok(children)
}

fn is_image_file(path: &Path) -> bool {
    path.is_file() && image::ImageFormat::from_path(path).is_ok()
}
