//! Cache key derivation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::check::CheckDefinition;
use crate::error::Result;
use crate::fileset::{FileFingerprint, FileSet, FingerprintMode};

/// Fingerprint of (check identity, input file set, input content).
///
/// The key keeps its constituent parts so that entries can be validated
/// against disk and invalidated by path.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    digest: String,
    check_name: String,
    check_version: u32,
    command: Vec<String>,
    fingerprints: Vec<FileFingerprint>,
}

impl CacheKey {
    /// Compute the key for running `check` over `files` as they are on disk now.
    pub fn compute(check: &CheckDefinition, files: &FileSet, mode: FingerprintMode) -> Result<Self> {
        let fingerprints = files.fingerprints(mode)?;
        let command = check.render_command(files.root(), files.files());
        Ok(Self::from_parts(
            check.name.clone(),
            check.version,
            command,
            fingerprints,
        ))
    }

    /// Assemble a key from already-computed parts. Fingerprints are sorted by path.
    pub fn from_parts(
        check_name: String,
        check_version: u32,
        command: Vec<String>,
        mut fingerprints: Vec<FileFingerprint>,
    ) -> Self {
        fingerprints.sort_by(|a, b| a.path.cmp(&b.path));
        let digest = derive_digest(&check_name, check_version, &command, &fingerprints);
        Self {
            digest,
            check_name,
            check_version,
            command,
            fingerprints,
        }
    }

    /// Hex SHA-256 digest identifying this key.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn check_name(&self) -> &str {
        &self.check_name
    }

    pub fn check_version(&self) -> u32 {
        self.check_version
    }

    pub fn fingerprints(&self) -> &[FileFingerprint] {
        &self.fingerprints
    }

    /// Paths this key depends on, relative to the file set root.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.fingerprints.iter().map(|f| f.path.as_path())
    }

    pub fn references(&self, path: &Path) -> bool {
        self.paths().any(|p| p == path)
    }

    /// Whether the stored digest still derives from the key's own fields.
    pub fn is_consistent(&self) -> bool {
        self.digest
            == derive_digest(
                &self.check_name,
                self.check_version,
                &self.command,
                &self.fingerprints,
            )
    }

    /// Relative paths as owned values.
    pub fn path_list(&self) -> Vec<PathBuf> {
        self.paths().map(Path::to_path_buf).collect()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheKey({}@v{}, {}, {} files)",
            self.check_name,
            self.check_version,
            &self.digest[..12.min(self.digest.len())],
            self.fingerprints.len()
        )
    }
}

fn derive_digest(
    check_name: &str,
    check_version: u32,
    command: &[String],
    fingerprints: &[FileFingerprint],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(check_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(check_version.to_le_bytes());
    hasher.update(b"\0");
    for arg in command {
        hasher.update(arg.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(b"\0");
    for fp in fingerprints {
        hasher.update(fp.path.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(fp.digest.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}
