// Named pipes backing the multi-sink output mode

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::error::StageError;
use super::types::OutputId;

/// One named pipe per output, living in a directory created for a single
/// activation. Everything is removed on drop.
#[derive(Debug)]
pub struct FifoSet {
    dir: PathBuf,
    owns_dir: bool,
    pipes: Vec<(OutputId, PathBuf)>,
}

impl FifoSet {
    /// Create the pipes under `parent`, or under a fresh temp directory.
    pub fn create(parent: Option<&Path>, ids: &[OutputId]) -> Result<Self, StageError> {
        let (dir, owns_dir) = match parent {
            Some(dir) => (dir.to_path_buf(), false),
            None => (
                std::env::temp_dir().join(format!("ffladder-{}", Uuid::new_v4().simple())),
                true,
            ),
        };

        fs::create_dir_all(&dir).map_err(|source| StageError::Fifo {
            path: dir.clone(),
            source,
        })?;

        let mut set = Self {
            dir,
            owns_dir,
            pipes: Vec::with_capacity(ids.len()),
        };

        for id in ids {
            let path = set.dir.join(format!("{}.fifo", id));
            make_fifo(&path).map_err(|source| StageError::Fifo {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(output = %id, path = %path.display(), "created named pipe");
            set.pipes.push((*id, path));
        }

        Ok(set)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pipe paths in registration order
    pub fn paths(&self) -> Vec<PathBuf> {
        self.pipes.iter().map(|(_, path)| path.clone()).collect()
    }

    pub fn path_for(&self, id: OutputId) -> Option<&Path> {
        self.pipes
            .iter()
            .find(|(pipe_id, _)| *pipe_id == id)
            .map(|(_, path)| path.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = (OutputId, &Path)> {
        self.pipes.iter().map(|(id, path)| (*id, path.as_path()))
    }
}

impl Drop for FifoSet {
    fn drop(&mut self) {
        for (_, path) in &self.pipes {
            let _ = fs::remove_file(path);
        }
        if self.owns_dir {
            let _ = fs::remove_dir(&self.dir);
        }
    }
}

/// Create a named pipe at `path`, replacing whatever a previous run left there
pub fn make_fifo(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a directory occupies the pipe path",
            ));
        }
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn is_fifo(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

/// Release a reader parked in `open` on `path`.
///
/// Opens the write side without blocking and closes it at once, so the
/// reader sees end of stream. Fails with ENXIO when nobody has the read side
/// open, which is harmless.
pub fn unblock(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map(drop)
}
