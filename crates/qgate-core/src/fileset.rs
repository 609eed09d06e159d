//! Target file sets and per-file fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::error::{QgateError, Result};

/// Digest recorded for a file that does not exist.
pub const MISSING_FILE_DIGEST: &str = "missing";

/// Extensions that feed a cargo build: sources, manifests and `Cargo.lock`.
pub const CARGO_INPUT_EXTENSIONS: &[&str] = &["rs", "toml", "lock"];

/// How a file's state is summarized for cache keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    /// SHA-256 of file contents.
    #[default]
    Content,
    /// Modification time and size; cheaper, less precise.
    Metadata,
}

/// Fingerprint of one file, relative to the file set root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub digest: String,
}

/// An ordered, deduplicated set of files under a root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl FileSet {
    /// Build a file set. Absolute paths under `root` are made relative;
    /// the list is sorted and deduplicated.
    pub fn new(root: impl Into<PathBuf>, files: impl IntoIterator<Item = PathBuf>) -> Self {
        let root = root.into();
        let mut files: Vec<PathBuf> = files
            .into_iter()
            .map(|p| relativize(&root, &p))
            .collect();
        files.sort();
        files.dedup();
        Self { root, files }
    }

    /// An empty file set, for project-wide checks.
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Vec::new(),
        }
    }

    /// Walk `root` collecting files whose extension is in `extensions`
    /// (all files when empty). Hidden entries and `target/` are skipped.
    pub fn discover(root: impl Into<PathBuf>, extensions: &[&str]) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(QgateError::MissingRoot(root));
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !(name.starts_with('.') || (e.file_type().is_dir() && name == "target"))
        });
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = extensions.is_empty()
                || entry
                    .path()
                    .extension()
                    .map(|ext| extensions.iter().any(|want| ext == *want))
                    .unwrap_or(false);
            if matches {
                files.push(entry.path().to_path_buf());
            }
        }

        Ok(Self::new(root, files))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths, sorted.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Express `path` relative to this set's root.
    pub fn relativize(&self, path: &Path) -> PathBuf {
        relativize(&self.root, path)
    }

    /// Whether `path` (relative or absolute) is a member of this set.
    pub fn contains(&self, path: &Path) -> bool {
        let rel = self.relativize(path);
        self.files.binary_search(&rel).is_ok()
    }

    /// Fingerprint every file in the set, in order.
    pub fn fingerprints(&self, mode: FingerprintMode) -> Result<Vec<FileFingerprint>> {
        fingerprint_paths(&self.root, &self.files, mode)
    }
}

/// Fingerprint `paths` (relative to `root`) in the given mode.
pub fn fingerprint_paths(
    root: &Path,
    paths: &[PathBuf],
    mode: FingerprintMode,
) -> Result<Vec<FileFingerprint>> {
    paths
        .iter()
        .map(|path| {
            Ok(FileFingerprint {
                path: path.clone(),
                digest: fingerprint_file(&root.join(path), mode)?,
            })
        })
        .collect()
}

/// Fingerprint a single file. A missing file gets [`MISSING_FILE_DIGEST`].
pub fn fingerprint_file(path: &Path, mode: FingerprintMode) -> Result<String> {
    match mode {
        FingerprintMode::Content => match fs::read(path) {
            Ok(bytes) => Ok(hex::encode(Sha256::digest(&bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(MISSING_FILE_DIGEST.to_string()),
            Err(e) => Err(e.into()),
        },
        FingerprintMode::Metadata => match fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                Ok(format!("{}:{}", mtime, meta.len()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(MISSING_FILE_DIGEST.to_string()),
            Err(e) => Err(e.into()),
        },
    }
}

fn relativize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        if let Ok(rel) = path.strip_prefix(root) {
            return rel.to_path_buf();
        }
    }
    path.strip_prefix("./").unwrap_or(path).to_path_buf()
}
