//! Stable error codes shared by the store and the event queue.
//!
//! Events carry raw `i32` codes (`ev_error`) across completion propagation,
//! so every variant maps to a fixed negative code that survives the trip
//! through callbacks and back.

use thiserror::Error;

/// Errors returned by every fallible operation in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Operation violates the current state, e.g. launching an event that is
    /// not in the init state.
    #[error("operation not permitted")]
    NoPerm,
    /// Malformed argument.
    #[error("invalid parameter")]
    Inval,
    /// The target entity (handle, key, anchor) does not exist.
    #[error("no such entity")]
    Nonexist,
    /// Allocation failure, volatile or persistent.
    #[error("out of memory")]
    Nomem,
    /// Destroy refused because work is still queued.
    #[error("resource busy")]
    Busy,
    /// Malformed I/O descriptor: record size mismatch, sink underflow, or an
    /// unsupported epoch range on the write path.
    #[error("invalid I/O descriptor")]
    IoInval,
    /// Library routine called before `eq_lib_init`.
    #[error("library not initialised")]
    Uninit,
    /// Poll deadline expired.
    #[error("timed out")]
    Timedout,
    /// Stale or foreign handle cookie.
    #[error("invalid handle")]
    NoHdl,
}

impl Error {
    /// Stable negative code, for storage in `ev_error` and for collaborators
    /// that speak numeric codes.
    pub fn code(self) -> i32 {
        match self {
            Error::NoPerm => -1001,
            Error::Inval => -1002,
            Error::Nonexist => -1003,
            Error::Nomem => -1004,
            Error::Busy => -1005,
            Error::IoInval => -1006,
            Error::Uninit => -1007,
            Error::Timedout => -1008,
            Error::NoHdl => -1009,
        }
    }

    /// Inverse of [`Error::code`]. Unknown codes map to `Inval`.
    pub fn from_code(code: i32) -> Option<Error> {
        match code {
            0 => None,
            -1001 => Some(Error::NoPerm),
            -1002 => Some(Error::Inval),
            -1003 => Some(Error::Nonexist),
            -1004 => Some(Error::Nomem),
            -1005 => Some(Error::Busy),
            -1006 => Some(Error::IoInval),
            -1007 => Some(Error::Uninit),
            -1008 => Some(Error::Timedout),
            -1009 => Some(Error::NoHdl),
            _ => Some(Error::Inval),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for err in [
            Error::NoPerm,
            Error::Inval,
            Error::Nonexist,
            Error::Nomem,
            Error::Busy,
            Error::IoInval,
            Error::Uninit,
            Error::Timedout,
            Error::NoHdl,
        ] {
            assert_eq!(Error::from_code(err.code()), Some(err));
        }
        assert_eq!(Error::from_code(0), None);
    }
}
