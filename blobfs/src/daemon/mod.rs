//! Background workers for a mounted filesystem
//!
//! Responsibilities:
//! - Keep the write lease of every open handle alive while the handle is open.
//! - Apply invalidations published by peer mounts to the local caches.
//! - Stop cleanly when the shared `CancellationToken` fires.
//!
//! Submodules:
//! - `worker`: `LeaseRenewer` and `InvalidationListener`
pub mod worker;

pub use worker::{InvalidationListener, LeaseRenewer};
