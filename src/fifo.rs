use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, warn};

use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeId {
    Primary,
    Secondary,
}

struct WriteEnd {
    parked: Option<File>,
    read_gone: bool,
}

/// One report FIFO, exclusively owned by the supervisor.
///
/// The supervisor opens the read end first (nonblocking, so it cannot wait on
/// a writer that doesn't exist yet) and then parks a write handle of its own.
/// The parked handle guarantees the child's open never blocks and that the
/// reader cannot see EOF while child writers come and go. Sentinel emission
/// and read-end disposal are mutually exclusive under one lock: writing into
/// a FIFO with no reader raises EPIPE.
pub struct ReportPipe {
    id: PipeId,
    path: PathBuf,
    read: Mutex<Option<File>>,
    write: Mutex<WriteEnd>,
}

fn clear_nonblock(fd: i32) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl ReportPipe {
    pub fn create(path: PathBuf, id: PipeId) -> Result<Self> {
        mkfifo(&path, Mode::from_bits_truncate(0o600))?;

        let read = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&path)
            .map_err(WardenError::Pipe)?;
        // a reader now exists, so this cannot block
        let parked = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(WardenError::Pipe)?;
        // the reader loop wants blocking reads from here on
        clear_nonblock(read.as_raw_fd()).map_err(WardenError::Pipe)?;

        Ok(Self {
            id,
            path,
            read: Mutex::new(Some(read)),
            write: Mutex::new(WriteEnd {
                parked: Some(parked),
                read_gone: false,
            }),
        })
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the read end to the reader loop. Callable once.
    pub fn take_read(&self) -> Option<File> {
        self.read.lock().unwrap().take()
    }

    /// Reader is done: drop its handle under the write lock so no sentinel
    /// write can race into a readerless pipe.
    pub fn retire_read(&self, handle: File) {
        let mut write = self.write.lock().unwrap();
        write.read_gone = true;
        drop(handle);
    }

    /// Write a 4-byte sentinel frame. Under PIPE_BUF, so the write is atomic
    /// and cannot block on a full pipe. Returns false if the read end is
    /// already gone or the parked writer was closed.
    pub fn write_sentinel(&self, sentinel: i32) -> bool {
        let mut write = self.write.lock().unwrap();
        if write.read_gone {
            return false;
        }
        let Some(parked) = write.parked.as_mut() else {
            return false;
        };
        match parked.write_all(&sentinel.to_le_bytes()) {
            Ok(()) => {
                debug!(pipe = ?self.id, sentinel, "wrote sentinel");
                true
            }
            Err(err) => {
                warn!(pipe = ?self.id, sentinel, ?err, "sentinel write failed");
                false
            }
        }
    }

    /// Cancellation path: drop the parked writer so the reader can reach EOF
    /// once the child writers are gone.
    pub fn close_parked_writer(&self) {
        let mut write = self.write.lock().unwrap();
        write.parked = None;
    }
}

impl Drop for ReportPipe {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), ?err, "failed to unlink fifo");
            }
        }
    }
}
