//! Buffered streams over chunked blob transfers
//!
//! Submodules:
//! - `reader`: `ReadStream`, seekable reads served from a download buffer
//! - `writer`: `WriteStream`, leased uploads through append blocks or a committed block list
//!
//! Each stream serializes its own calls behind a `tokio::sync::Mutex`; separate streams
//! proceed in parallel.

pub mod reader;
pub mod writer;

pub use reader::ReadStream;
pub use writer::WriteStream;
