//! Utilities dealing with error handling in this crate.

use failure::Fail;

/// Errors produced by this crate.
#[derive(Debug, Fail)]
pub enum Error {
    /// Errors originating from calls to `std::io::*`.
    #[fail(display = "IO Error - {}", _0)]
    IO(#[cause] std::io::Error),
    /// Errors originating from calls to `libc` or other system utilities.
    ///
    /// Failed `open`/`mmap`/`ioctl` calls against the Mali device are
    /// reported verbatim through this variant.
    #[fail(display = "System Error - {}", _0)]
    System(#[cause] nix::Error),
    /// Caused by malformed input: an unknown GPU product id, an unknown
    /// back-end name, or an invalid counters configuration.
    #[fail(display = "Invalid argument - {}", _0)]
    InvalidArgument(&'static str),
    /// Caused when an operation or device is not supported: no usable
    /// back-end for this kernel/GPU pair, or an operation that is invalid
    /// for the current sampler mode.
    #[fail(display = "Not supported - {}", _0)]
    NotSupported(&'static str),
    /// Caused when the kernel produced counter data that disagrees with the
    /// advertised layout.
    #[fail(display = "Protocol violation - {}", _0)]
    Protocol(&'static str),
}

impl Error {
    /// Create a new instance of error from the `errno` variable.
    #[inline]
    pub fn from_errno() -> Self {
        Error::System(nix::Error::Sys(nix::errno::Errno::last()))
    }

    /// Get the `errno` value of a system error, if this is one.
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            Error::System(nix::Error::Sys(errno)) => Some(*errno),
            _ => None,
        }
    }
}

macro_rules! error_from {
    ($et: ty => $cet: expr) => {
        impl From<$et> for Error {
            #[inline]
            fn from(err: $et) -> Self {
                $cet(err)
            }
        }
    };
}

error_from!(std::io::Error => Error::IO);
error_from!(nix::Error => Error::System);

/// Result type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;
