//! Error types for the crate.

use thiserror::Error;

/// An error produced while allocating bandwidth or configuring limits.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Tried to set a per-connection limit above the shared limit.
    #[error("per-connection limit of {requested} B/s is greater than the shared limit of {global} B/s")]
    LocalOverGlobal {
        /// The rejected per-connection limit.
        requested: u64,
        /// The shared limit in force at the time.
        global: u64,
    },

    /// The shared bucket refused a reservation outright.
    ///
    /// This happens when the clamped request is still larger than the shared
    /// bucket's burst capacity, so no amount of waiting would satisfy it.
    #[error("could not reserve {requested} bytes from the shared bucket (burst capacity {burst})")]
    GlobalReservation {
        /// How many bytes we asked the shared bucket for.
        requested: u64,
        /// The shared bucket's burst capacity.
        burst: u64,
    },

    /// The effective limit is zero, so no request can ever be granted.
    #[error("a limit of zero can never grant bandwidth")]
    ZeroLimit,

    /// The allocator has been closed; all further allocations fail.
    #[error("allocator is closed")]
    Closed,

    /// An I/O error from the underlying transport.
    #[error("transport I/O failed")]
    Io(#[from] std::io::Error),
}
