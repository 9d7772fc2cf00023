#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
//!
//! # Architecture
//!
//! ```text
//!  ThrottledListener ─────────── set_local_limit / set_global_limit ──┐
//!       │ accept()                                                    │
//!       ▼                                                             ▼
//!  Throttled<S> ──── allocate(n) ────▶ Allocator ───┬──▶ local TokenBucket
//!  (one per connection)          (one per connection)│
//!                                                    └──▶ shared TokenBucket
//!                                                         (one per listener)
//! ```
//!
//! Every read and write asks its connection's [`Allocator`] for a grant.
//! The allocator charges the grant to the connection's own bucket and to
//! the listener-wide bucket, waits until both have accrued it, and only
//! then lets the I/O proceed.

mod alloc;
mod bucket;
mod conn;
mod err;
mod listener;
mod net;

pub use alloc::Allocator;
pub use bucket::{Reservation, TokenBucket, Unsatisfiable};
pub use conn::Throttled;
pub use err::Error;
pub use listener::{listen, ThrottledListener};
pub use net::{local_addr, peer_addr, NetListener, TcpListener, TcpStream};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
