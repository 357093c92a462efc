//! Library error types

use std::collections::TryReserveError;
use thiserror::Error;

/// Errors reported by the library
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value is unusable; the string names the offending
    /// argument or field.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A port number beyond the number of ports of this controller.
    #[error("{0} out of range")]
    OutOfRange(&'static str),

    /// The kernel delivered a work record the library does not model.
    #[error("malformed event from kernel: unknown {0}")]
    BadMessage(&'static str),

    /// The kernel discarded the URB while we were still working on it.
    #[error("urb canceled by the kernel")]
    Canceled,

    /// Buffer allocation failed.
    #[error("allocation failure: {0}")]
    Alloc(#[from] TryReserveError),

    /// Configuration error (log filter syntax and the like).
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error from the character device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
