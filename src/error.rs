use std::io;

/// Error taxonomy for one sandboxed task.
///
/// Record-level noise (a field that doesn't map to a known enum value) is
/// logged and dropped at the parse site; everything here concerns the channel
/// or the task as a whole.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("report pipe error")]
    Pipe(#[source] io::Error),

    #[error("failed to launch sandboxed process")]
    Launch {
        transient: bool,
        #[source]
        source: io::Error,
    },

    #[error("task exceeded its timeout")]
    Timeout,

    #[error("task was cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WardenError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Launch failures worth retrying: the interposer injection path can fail
    /// transiently while the library file is still being written out, and the
    /// kernel can return EAGAIN under fork pressure.
    pub fn launch(source: io::Error) -> Self {
        let transient = matches!(
            source.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::ETXTBSY) | Some(libc::ENOMEM)
        );
        Self::Launch { transient, source }
    }

    pub fn is_transient_launch(&self) -> bool {
        matches!(self, Self::Launch { transient: true, .. })
    }
}

impl From<nix::errno::Errno> for WardenError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Pipe(io::Error::from_raw_os_error(e as i32))
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
