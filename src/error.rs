//! The error taxonomy surfaced by the core.

/// Errors produced by the inode graph, room sessions, and the client
/// contract.
///
/// Filesystem-facing callers translate these to an errno with
/// [`Error::errno`]; everything else is logged where it occurs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no entry named {0:?}")]
    NotFound(String),

    #[error("operation not supported")]
    NotSupported,

    #[error("offset {offset} is beyond the end of the buffer ({len})")]
    OffsetOutOfRange { offset: u64, len: u64 },

    #[error("duplicate entry {0:?}")]
    Duplicate(String),

    #[error("inodes {0} and {1} share no common ancestor")]
    NoCommonAncestor(u64, u64),

    #[error("transport: {0}")]
    Transport(String),

    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(..) => libc::ENOENT,
            Error::NotSupported => libc::ENOSYS,
            Error::OffsetOutOfRange { .. } => libc::EIO,
            Error::Duplicate(..) => libc::EEXIST,
            Error::NoCommonAncestor(..) => libc::EIO,
            Error::Transport(..) => libc::EIO,
            Error::Malformed(..) => libc::EIO,
            Error::Interrupted => libc::EINTR,
        }
    }
}
