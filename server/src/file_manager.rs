//! Process-wide digest registry over the flat file store.
//!
//! Files live directly under the base directory, named by their MD5 hex
//! digest. The in-memory set is a cache: seeded from directory contents at
//! startup, consulted first, with a filesystem probe on miss. The lock is
//! held only across set operations — never across I/O.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Suffix for uploads still in flight. Staged files are invisible to
/// `contains` and to the startup scan; completion renames them into place.
const STAGING_SUFFIX: &str = ".part";

pub struct FileManager {
    base_dir: PathBuf,
    known: Mutex<HashSet<String>>,
}

impl FileManager {
    /// Open the store, creating the base directory if absent and seeding
    /// the digest set from its contents. Leftover staging files from
    /// interrupted uploads are not digests and are skipped.
    pub fn open(base_dir: impl Into<PathBuf>) -> io::Result<FileManager> {
        let base_dir = base_dir.into();
        if !base_dir.is_dir() {
            std::fs::create_dir_all(&base_dir)?;
        }
        let mut known = HashSet::new();
        for entry in std::fs::read_dir(&base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(STAGING_SUFFIX) {
                    tracing::debug!(file = %name, "skipping interrupted upload");
                    continue;
                }
                tracing::debug!(file = %name, "known digest");
                known.insert(name);
            }
        }
        tracing::info!(dir = %base_dir.display(), files = known.len(), "file store opened");
        Ok(FileManager {
            base_dir,
            known: Mutex::new(known),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Where a completed digest lives.
    pub fn path_for(&self, digest: &str) -> PathBuf {
        self.base_dir.join(digest)
    }

    /// Where an in-flight upload is written before publication.
    pub fn staging_path_for(&self, digest: &str) -> PathBuf {
        self.base_dir.join(format!("{digest}{STAGING_SUFFIX}"))
    }

    /// Move a finished staging file into place and record the digest.
    pub fn publish(&self, digest: &str) -> io::Result<()> {
        std::fs::rename(self.staging_path_for(digest), self.path_for(digest))?;
        self.known.lock().insert(digest.to_string());
        Ok(())
    }

    /// Cache first, filesystem probe on miss; a positive probe populates
    /// the cache.
    pub fn contains(&self, digest: &str) -> bool {
        if self.known.lock().contains(digest) {
            return true;
        }
        if self.path_for(digest).is_file() {
            self.known.lock().insert(digest.to_string());
            return true;
        }
        false
    }

    /// Record a completed upload.
    pub fn insert(&self, digest: &str) {
        self.known.lock().insert(digest.to_string());
    }

    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.lock().is_empty()
    }
}
