// Library crate for blobfs: a POSIX-like filesystem over blob containers, mounted through FUSE.

pub mod bus;
pub mod cache;
pub mod cadapter;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fuse;
pub mod stream;
pub mod vfs;
