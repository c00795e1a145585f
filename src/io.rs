//! Sector-oriented and byte-range reads over an archive file.
//!
//! Two variants share one interface: plain uncompressed images are read
//! straight through a small sector buffer, while LZ4 containers go
//! through the block index, decompressing only the block that covers the
//! requested range. Each handle owns its buffers, so independent handles
//! can serve concurrent readers.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::sync::Arc;

use log::{debug, warn};
use lz4_flex::block::decompress_into;

use crate::lz4::BlockIndex;
use crate::util::first_pow2;
use crate::{Error, Result};

pub const SECTOR_SIZE: usize = 2048;

const POS_INVALID: u64 = u64::MAX;

/// An open archive handle with its decode state.
pub enum Io {
    Plain(PlainIo),
    Lz4(Lz4Io),
}

impl Io {
    pub fn from_file(file: File, index: Option<Arc<BlockIndex>>) -> Io {
        match index {
            None => Io::Plain(PlainIo::new(file)),
            Some(index) => Io::Lz4(Lz4Io::new(file, index)),
        }
    }

    /// Reads the 2048-byte sector `sector`. The returned slice stays
    /// valid until the next call on this handle.
    pub fn read_sector(&mut self, sector: u32) -> Result<&[u8]> {
        match self {
            Io::Plain(io) => io.read_sector(sector),
            Io::Lz4(io) => io.read_sector(sector),
        }
    }

    /// Copies `dest.len()` bytes starting at byte `offset` of the
    /// (logical) image. Returns the number of bytes actually copied;
    /// short counts signal EOF or a read failure.
    pub fn read_direct(&mut self, dest: &mut [u8], offset: u64) -> usize {
        match self {
            Io::Plain(io) => io.read_direct(dest, offset),
            Io::Lz4(io) => io.read_direct(dest, offset),
        }
    }
}

/// Direct reads on an uncompressed image.
pub struct PlainIo {
    file: File,
    file_pos: u64,
    buffer: Box<[u8; SECTOR_SIZE]>,
}

impl PlainIo {
    fn new(file: File) -> PlainIo {
        PlainIo {
            file,
            file_pos: POS_INVALID,
            buffer: Box::new([0u8; SECTOR_SIZE]),
        }
    }

    fn read_sector(&mut self, sector: u32) -> Result<&[u8]> {
        let target = sector as u64 * SECTOR_SIZE as u64;

        if self.file_pos != target {
            if let Err(err) = self.file.seek(SeekFrom::Start(target)) {
                self.file_pos = POS_INVALID;
                return Err(err.into());
            }
        }

        match self.file.read_exact(&mut self.buffer[..]) {
            Ok(()) => {
                self.file_pos = target + SECTOR_SIZE as u64;
                Ok(&self.buffer[..])
            }
            Err(err) => {
                self.file_pos = POS_INVALID;
                Err(err.into())
            }
        }
    }

    fn read_direct(&mut self, dest: &mut [u8], offset: u64) -> usize {
        if self.file_pos != offset {
            if self.file.seek(SeekFrom::Start(offset)).is_err() {
                self.file_pos = POS_INVALID;
                return 0;
            }
            self.file_pos = offset;
        }

        let mut done = 0usize;

        while done < dest.len() {
            match self.file.read(&mut dest[done..]) {
                Ok(0) => break,
                Ok(n) => {
                    done += n;
                    self.file_pos += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("direct read failed at {}: {err}", offset + done as u64);
                    self.file_pos = POS_INVALID;
                    break;
                }
            }
        }

        done
    }
}

/// Where the decoded bytes of the current block live.
enum PublicBuffer {
    /// No block decoded.
    None,
    /// The decompression buffer.
    Decompressed,
    /// A stored (uncompressed) block inside the file window, at this
    /// window offset.
    Window(usize),
}

/// Random access into an LZ4 container through the block index.
pub struct Lz4Io {
    file: File,
    index: Arc<BlockIndex>,

    /// Physical file position, `POS_INVALID` when unknown.
    file_pos: u64,

    /// Compressed-side window: a span of the archive file starting at
    /// `file_buffer_pos`, holding `file_buffer_length` valid bytes.
    file_buffer: Vec<u8>,
    file_buffer_pos: u64,
    file_buffer_length: usize,

    /// Logical position and length of the currently decoded block.
    buffer_logical_pos: u64,
    buffer_length: usize,

    decompression_buffer: Vec<u8>,
    public: PublicBuffer,
}

impl Lz4Io {
    fn new(file: File, index: Arc<BlockIndex>) -> Lz4Io {
        let block_size = index.block_size as usize;

        Lz4Io {
            file,
            index,
            file_pos: POS_INVALID,
            file_buffer: vec![0u8; block_size + 4],
            file_buffer_pos: 0,
            file_buffer_length: 0,
            buffer_logical_pos: 0,
            buffer_length: 0,
            decompression_buffer: vec![0u8; block_size],
            public: PublicBuffer::None,
        }
    }

    fn invalidate_block(&mut self) {
        self.buffer_length = 0;
        self.public = PublicBuffer::None;
    }

    fn public_slice(&self) -> &[u8] {
        match self.public {
            PublicBuffer::None => &[],
            PublicBuffer::Decompressed => &self.decompression_buffer[..self.buffer_length],
            PublicBuffer::Window(at) => &self.file_buffer[at..at + self.buffer_length],
        }
    }

    /// Makes the block containing `logical_pos` available in the public
    /// buffer, prefetching the compressed span of every block the
    /// `wanted`-byte request touches.
    fn prepare(&mut self, logical_pos: u64, wanted: usize) -> Result<()> {
        if logical_pos >= self.buffer_logical_pos
            && logical_pos < self.buffer_logical_pos + self.buffer_length as u64
        {
            return Ok(());
        }

        let block_size = self.index.block_size as u64;
        let block_count = self.index.block_count as usize;
        // worst-case compressed span of one block: length prefix + stored data
        let block_span_bound = 4 + block_size;

        let block = (logical_pos / block_size) as usize;
        if block >= block_count {
            self.invalidate_block();
            return Err(Error::Malformed("read past the last block"));
        }

        let read_start = self.index.block_offsets[block] as u64;
        let min_bytes = if block + 1 < block_count {
            self.index.block_offsets[block + 1] as u64 - read_start
        } else {
            block_span_bound
        };

        let covered = read_start >= self.file_buffer_pos
            && read_start + min_bytes <= self.file_buffer_pos + self.file_buffer_length as u64;

        if !covered {
            // fetch through the end of the last block the request touches
            let last_logical = logical_pos + wanted.saturating_sub(1) as u64;
            let end_block = ((last_logical / block_size) as usize).min(block_count - 1);
            let end_offset = if end_block + 1 < block_count {
                self.index.block_offsets[end_block + 1] as u64
            } else {
                self.index.block_offsets[end_block] as u64 + block_span_bound
            };
            let want_bytes = (end_offset.saturating_sub(read_start)) as usize;

            if want_bytes > self.file_buffer.len() {
                self.file_buffer.resize(first_pow2(want_bytes), 0);
            }

            if self.file_pos != read_start {
                if let Err(err) = self.file.seek(SeekFrom::Start(read_start)) {
                    self.file_pos = POS_INVALID;
                    self.file_buffer_length = 0;
                    self.invalidate_block();
                    return Err(err.into());
                }
            }

            let mut got = 0usize;
            while got < want_bytes {
                match self.file.read(&mut self.file_buffer[got..want_bytes]) {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        self.file_pos = POS_INVALID;
                        self.file_buffer_length = 0;
                        self.invalidate_block();
                        return Err(err.into());
                    }
                }
            }

            self.file_pos = read_start + got as u64;
            self.file_buffer_pos = read_start;
            self.file_buffer_length = got;
        }

        let rel = (read_start - self.file_buffer_pos) as usize;

        if self.file_buffer_length < rel + 4 {
            self.invalidate_block();
            return Err(Error::Malformed("truncated block header"));
        }

        let raw = u32::from_le_bytes(self.file_buffer[rel..rel + 4].try_into().unwrap());
        let stored_uncompressed = raw & 0x8000_0000 != 0;
        let compressed_length = (raw & 0x7FFF_FFFF) as usize;

        if compressed_length == 0 || compressed_length > self.index.block_size as usize {
            self.invalidate_block();
            return Err(Error::Malformed("block length out of range"));
        }

        if self.file_buffer_length < rel + 4 + compressed_length {
            self.invalidate_block();
            return Err(Error::Malformed("truncated block"));
        }

        let data = rel + 4;

        let decoded_length = if stored_uncompressed {
            self.public = PublicBuffer::Window(data);
            compressed_length
        } else {
            match decompress_into(
                &self.file_buffer[data..data + compressed_length],
                &mut self.decompression_buffer,
            ) {
                Ok(n) if n > 0 => {
                    self.public = PublicBuffer::Decompressed;
                    n
                }
                Ok(_) | Err(_) => {
                    warn!("block {block} failed to decompress");
                    self.invalidate_block();
                    return Err(Error::Malformed("undecodable block"));
                }
            }
        };

        self.buffer_logical_pos = block as u64 * block_size;
        self.buffer_length = decoded_length;

        // an underlong block cannot satisfy a position inside its range
        if logical_pos >= self.buffer_logical_pos + self.buffer_length as u64 {
            self.invalidate_block();
            return Err(Error::Malformed("block shorter than its position"));
        }

        Ok(())
    }

    fn read_sector(&mut self, sector: u32) -> Result<&[u8]> {
        let offset = sector as u64 * SECTOR_SIZE as u64;

        self.prepare(offset, SECTOR_SIZE)?;

        if offset + SECTOR_SIZE as u64 > self.buffer_logical_pos + self.buffer_length as u64 {
            return Err(Error::Malformed("sector crosses a short block"));
        }

        let start = (offset - self.buffer_logical_pos) as usize;
        Ok(&self.public_slice()[start..start + SECTOR_SIZE])
    }

    fn read_direct(&mut self, dest: &mut [u8], offset: u64) -> usize {
        let wanted = dest.len();
        let mut done = 0usize;

        while done < wanted {
            let pos = offset + done as u64;

            if let Err(err) = self.prepare(pos, wanted - done) {
                debug!("direct read stopped at {pos}: {err}");
                break;
            }

            let start = (pos - self.buffer_logical_pos) as usize;
            let can_read = (self.buffer_length - start).min(wanted - done);

            dest[done..done + can_read]
                .copy_from_slice(&self.public_slice()[start..start + can_read]);
            done += can_read;
        }

        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn plain_io(bytes: &[u8]) -> Io {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        Io::from_file(tmp.reopen().unwrap(), None)
    }

    #[test]
    fn test_plain_read_sector() {
        let mut image = vec![0u8; 3 * SECTOR_SIZE];
        image[SECTOR_SIZE] = 0xAB;
        image[2 * SECTOR_SIZE - 1] = 0xCD;

        let mut io = plain_io(&image);

        let sector = io.read_sector(1).unwrap();
        assert_eq!(sector.len(), SECTOR_SIZE);
        assert_eq!(sector[0], 0xAB);
        assert_eq!(sector[SECTOR_SIZE - 1], 0xCD);

        // sequential read skips the seek, but must still be correct
        assert_eq!(io.read_sector(2).unwrap()[0], 0);
        assert_eq!(io.read_sector(0).unwrap()[0], 0);
    }

    #[test]
    fn test_plain_read_sector_past_end() {
        let image = vec![0u8; SECTOR_SIZE + 100];
        let mut io = plain_io(&image);

        assert!(io.read_sector(0).is_ok());
        assert!(io.read_sector(1).is_err());
        // the handle recovers after a failed read
        assert!(io.read_sector(0).is_ok());
    }

    #[test]
    fn test_plain_read_direct() {
        let image: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut io = plain_io(&image);

        let mut buf = vec![0u8; 1000];
        assert_eq!(io.read_direct(&mut buf, 12_345), 1000);
        assert_eq!(&buf[..], &image[12_345..13_345]);

        // reads are clipped at EOF
        let mut tail = vec![0u8; 100];
        assert_eq!(io.read_direct(&mut tail, 39_950), 50);
        assert_eq!(&tail[..50], &image[39_950..]);
    }
}
