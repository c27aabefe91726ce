use crate::error::ArchiverError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Exclusive single-instance lock. The file holds the owner's PID and the
/// lock is released when the guard is dropped.
#[derive(Debug)]
pub struct RunLock {
    file: fs::File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| ArchiverError::io(path, err))?;
        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(path).unwrap_or_default();
            let holder = holder.trim();
            let label = if holder.is_empty() {
                path.display().to_string()
            } else {
                format!("{} (pid {holder})", path.display())
            };
            return Err(ArchiverError::AlreadyRunning(label).into());
        }
        file.set_len(0).map_err(|err| ArchiverError::io(path, err))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|err| ArchiverError::io(path, err))?;
        writeln!(file, "{}", std::process::id()).map_err(|err| ArchiverError::io(path, err))?;
        file.flush().map_err(|err| ArchiverError::io(path, err))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(lock = %self.path.display(), "released run lock");
    }
}
