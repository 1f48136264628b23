//! Error types for device discovery and port I/O.
//!
//! Native error codes never cross the public API: every platform backend
//! translates them into this taxonomy at the boundary where the native call
//! happens, so callers can match on intent (gone, forbidden, broken, misused)
//! instead of on OS-specific numbers.

use thiserror::Error;

/// Errors surfaced by the registry and port operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device is absent or has been disconnected.
    ///
    /// Also returned when a transfer discovers mid-I/O that the underlying
    /// resource is gone; the owning device is marked disconnected first.
    #[error("device '{0}' not found or disconnected")]
    NotFound(String),

    /// The OS refused access to the device node.
    #[error("access denied to '{0}'")]
    AccessDenied(String),

    /// A native transfer or enumeration failure not attributable to
    /// disconnection.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation was attempted in a state that does not support it
    /// (stopped monitor, write-only port, read already in flight, ...).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// Translate an `std::io::Error` raised while touching `path`.
    ///
    /// Kinds that identify a missing or revoked device node map to
    /// [`Error::NotFound`], permission failures to [`Error::AccessDenied`],
    /// everything else stays an [`Error::Io`].
    pub(crate) fn from_io(path: &str, source: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match source.kind() {
            ErrorKind::NotFound => Error::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => Error::AccessDenied(path.to_string()),
            _ => {
                #[cfg(unix)]
                if let Some(code) = source.raw_os_error()
                    && (code == nix::libc::ENODEV || code == nix::libc::ENXIO)
                {
                    return Error::NotFound(path.to_string());
                }
                Error::Io {
                    path: path.to_string(),
                    source,
                }
            }
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
