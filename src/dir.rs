//! Directory enumeration handle.

use std::sync::Arc;

use crate::directory::{Directory, NAME_BUF};
use crate::string_diff;
use crate::FileKind;

/// One enumerated directory entry.
///
/// The name borrows a buffer inside the [`IsoDir`] and is valid until
/// the next [`IsoDir::next_entry`] call.
#[derive(Debug)]
pub struct Dirent<'a> {
    pub name: &'a str,
    pub kind: FileKind,
}

/// An open directory, enumerating its entries in sorted order.
///
/// The handle either shares a directory the filesystem has loaded or
/// owns one loaded privately for its lifetime; both cases behave the
/// same.
pub struct IsoDir {
    directory: Arc<Directory>,
    index: usize,
    name_buf: Box<[u8; NAME_BUF]>,
}

impl IsoDir {
    pub(crate) fn new(directory: Arc<Directory>) -> IsoDir {
        IsoDir {
            directory,
            index: 0,
            name_buf: Box::new([0u8; NAME_BUF]),
        }
    }

    /// Number of entries in this directory.
    pub fn entry_count(&self) -> usize {
        self.directory.entry_count()
    }

    /// Next entry, or `None` at the end of the directory.
    pub fn next_entry(&mut self) -> Option<Dirent<'_>> {
        if self.index >= self.directory.entry_count() {
            return None;
        }

        let index = self.index;
        self.index += 1;

        let len = string_diff::reconstruct(
            &mut self.name_buf[..],
            &self.directory.table,
            &self.directory.entries,
            index,
        )
        .ok()?;

        let kind = if self.directory.entry(index).loc.directory {
            FileKind::Directory
        } else {
            FileKind::File
        };

        // names were produced by the UTF-16 decoder, so they are UTF-8
        let name = std::str::from_utf8(&self.name_buf[..len]).ok()?;

        Some(Dirent { name, kind })
    }
}
