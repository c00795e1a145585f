//! Read-only access to ISO-9660 optical disc images with Joliet names,
//! optionally wrapped in a block-indexed LZ4 container.
//!
//! The crate mounts an archive as a virtual filesystem: directories can
//! be enumerated and files read at arbitrary offsets without unpacking
//! anything to disk. Directory trees are held in a prefix-compressed
//! in-memory index, so archives with tens of thousands of entries cost a
//! few hundred kilobytes; compressed archives are accessed one LZ4 block
//! at a time through an offset sidecar embedded in a skippable frame.
//!
//! # Known limitations
//!
//! Only the Joliet supplementary volume descriptor is consumed (no Rock
//! Ridge, El Torito or multi-session support), name matching is
//! case-sensitive, and LZ4 is the only supported container codec.

pub mod dir;
pub mod directory;
pub mod file;
pub mod fs;
pub mod io;
pub mod lz4;
pub mod string_diff;
pub mod util;

use std::io as stdio;

pub use dir::{Dirent, IsoDir};
pub use file::IsoFile;
pub use fs::ISO9660;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] stdio::Error),
    #[error("malformed archive: {0}")]
    Malformed(&'static str),
    #[error("path not found")]
    NotFound,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("invalid path: {0}")]
    InvalidPath(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
