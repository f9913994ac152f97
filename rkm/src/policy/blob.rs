use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use super::PolicyStoreError;

const LOCK_FILE: &str = "policy.lock";

/// Keyed blobs stored as files of one namespace directory.
///
/// Every process that opens the same directory observes the same state.
/// Writes replace a blob atomically, so readers never see a torn value.
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PolicyStoreError> {
        let dir = dir.into();
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&dir)
            .map_err(|source| PolicyStoreError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `Ok(None)` when the key was never written.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PolicyStoreError> {
        let path = self.dir.join(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PolicyStoreError::Io { path, source }),
        }
    }

    pub fn write(&self, key: &str, data: &[u8]) -> Result<(), PolicyStoreError> {
        let path = self.dir.join(key);
        let tmp = self
            .dir
            .join(format!(".{key}.{}.tmp", std::process::id()));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&tmp)
            .map_err(io_error(&tmp))?;
        file.write_all(data).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
        drop(file);

        std::fs::rename(&tmp, &path).map_err(io_error(&path))
    }

    /// Block until this process holds the namespace's exclusive lock.
    pub fn lock(&self) -> Result<Flock<File>, PolicyStoreError> {
        let lock_file = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_file)
            .map_err(|source| PolicyStoreError::Io {
                path: lock_file,
                source,
            })?;

        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, e)| PolicyStoreError::Lock(e))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PolicyStoreError {
    let path = path.to_path_buf();
    move |source| PolicyStoreError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_missing_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(temp_dir.path()).unwrap();
        assert!(blobs.read("DefaultMountMode").unwrap().is_none());
    }

    #[test]
    fn test_write_replaces_blob() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(temp_dir.path().join("nested")).unwrap();

        blobs.write("key", b"first").unwrap();
        blobs.write("key", b"second").unwrap();
        assert_eq!(blobs.read("key").unwrap().unwrap(), b"second");

        // only the blob and no leftover temp file
        let entries: Vec<_> = std::fs::read_dir(blobs.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("key")]);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(temp_dir.path()).unwrap();

        let lock = blobs.lock().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(temp_dir.path().join(LOCK_FILE))
            .unwrap();
        assert!(Flock::lock(file, FlockArg::LockExclusiveNonblock).is_err());

        drop(lock);
        let relock = blobs.lock().unwrap();
        drop(relock);
    }
}
