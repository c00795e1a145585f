//! File handle over a mounted archive.

use std::io::{self, Read, Seek, SeekFrom};

use crate::directory::Location;
use crate::fs::ISO9660;
use crate::io::{Io, SECTOR_SIZE};

/// An open file inside an archive.
///
/// Holds its own I/O handle from the filesystem's pool, so independent
/// file handles can read concurrently. The handle is returned to the
/// pool on drop.
pub struct IsoFile<'fs> {
    fs: &'fs ISO9660,
    io: Option<Io>,
    start: u64,
    end: u64,
    offset: u64,
}

impl<'fs> IsoFile<'fs> {
    pub(crate) fn new(fs: &'fs ISO9660, io: Io, loc: Location) -> IsoFile<'fs> {
        let start = loc.sector as u64 * SECTOR_SIZE as u64;

        IsoFile {
            fs,
            io: Some(io),
            start,
            end: start + loc.length as u64,
            offset: 0,
        }
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// The filesystem this file was opened from.
    pub fn filesystem(&self) -> &'fs ISO9660 {
        self.fs
    }
}

impl Read for IsoFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size().saturating_sub(self.offset);
        let wanted = (buf.len() as u64).min(remaining) as usize;

        if wanted == 0 {
            return Ok(0);
        }

        let io = match self.io.as_mut() {
            Some(io) => io,
            None => return Ok(0),
        };

        let got = io.read_direct(&mut buf[..wanted], self.start + self.offset);
        self.offset += got as u64;

        Ok(got)
    }
}

impl Seek for IsoFile<'_> {
    /// Seeks within the file. `offset == size` is a valid position (a
    /// following read returns 0); anything negative or past the end is
    /// rejected.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size() as i64;

        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.offset as i64 + delta,
            SeekFrom::End(delta) => size + delta,
        };

        if target < 0 || target > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the file",
            ));
        }

        self.offset = target as u64;
        Ok(self.offset)
    }
}

impl Drop for IsoFile<'_> {
    fn drop(&mut self) {
        if let Some(io) = self.io.take() {
            self.fs.release_io(io);
        }
    }
}
