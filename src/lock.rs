//! Advisory file locks: the daemon singleton lock and the request id counter.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, WavaError};

/// Held by the running daemon for its whole lifetime.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    path: PathBuf,
}

impl DaemonLock {
    /// Take the lock without blocking; fails if another daemon holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = open_lock_file(path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Err(WavaError::AlreadyRunning(path.display().to_string()));
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(path = %path.display(), "Daemon lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// True when some process holds the daemon lock at `path`.
pub fn is_locked(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).open(path) else {
        return false;
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

/// Allocate the next request id from the shared counter file.
///
/// Blocks until the counter lock is available. Ids start at 1.
pub fn next_request_id(path: &Path) -> Result<u64> {
    let mut file = open_lock_file(path)?;
    file.lock_exclusive()?;

    let result = bump_counter(&mut file);
    let _ = FileExt::unlock(&file);
    result
}

fn bump_counter(file: &mut File) -> Result<u64> {
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    let current = match text.trim() {
        "" => 0,
        value => value
            .parse::<u64>()
            .map_err(|e| WavaError::Internal(format!("corrupt request counter {value:?}: {e}")))?,
    };
    let next = current + 1;

    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    write!(file, "{next}")?;
    file.sync_data()?;
    Ok(next)
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}
