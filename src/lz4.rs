//! Block-offset sidecar of the LZ4 container format.
//!
//! A packed archive opens with a truncated LZ4 frame that conventional
//! decoders parse and skip, followed by a skippable frame carrying the
//! uncompressed size, the block size and one compressed-file offset per
//! block. The real LZ4 frame with the data blocks starts after the
//! sidecar, so standard tools still see a valid archive while the offset
//! table gives O(1) mapping from a logical position to its block.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use log::debug;

/// LZ4 frame magic at offset 0.
pub const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

/// File offset of the sidecar's little-endian inner length field.
const SIDECAR_LENGTH_OFFSET: u64 = 0x0F;

/// Decoded sidecar: block geometry plus one file offset per block, each
/// pointing at a 4-byte block-length prefix in the compressed file.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    pub block_size: u32,
    pub block_count: u32,
    pub block_offsets: Vec<u32>,
}

fn read_u32(file: &mut File, big_endian: bool) -> Option<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf).ok()?;

    if big_endian {
        Some(u32::from_be_bytes(buf))
    } else {
        Some(u32::from_le_bytes(buf))
    }
}

impl BlockIndex {
    /// Attempts to read the sidecar from the start of `file`.
    ///
    /// Returns `None` when the file is not an LZ4 container (or the
    /// sidecar is inconsistent); the caller then treats the archive as a
    /// plain uncompressed image.
    pub fn probe(file: &mut File) -> Option<BlockIndex> {
        let mut magic = [0u8; 4];
        if file.seek(SeekFrom::Start(0)).is_err() || file.read_exact(&mut magic).is_err() {
            return None;
        }

        if magic != LZ4_MAGIC {
            return None;
        }

        if file.seek(SeekFrom::Start(SIDECAR_LENGTH_OFFSET)).is_err() {
            return None;
        }

        let inner_length = read_u32(file, false)?;

        // the sidecar tag doubles as the endianness selector
        let mut tag = [0u8; 4];
        file.read_exact(&mut tag).ok()?;

        if tag[0] != b'M' || tag[1] != b'I' || tag[3] != b'E' {
            debug!("LZ4 magic without an offset sidecar tag");
            return None;
        }

        let big_endian = match tag[2] {
            b'L' => false,
            b'B' => true,
            _ => {
                debug!("unknown sidecar endianness selector {:#x}", tag[2]);
                return None;
            }
        };

        let file_size = read_u32(file, big_endian)?;
        let block_size = read_u32(file, big_endian)?;

        if block_size > 64 * 1024 || block_size < 2048 || block_size % 2048 != 0 {
            debug!("sidecar block size {block_size} out of range");
            return None;
        }

        let block_count = file_size.div_ceil(block_size);

        if inner_length != 12 + block_count * 4 {
            debug!(
                "sidecar length {inner_length} does not match {} blocks",
                block_count
            );
            return None;
        }

        let mut block_offsets = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            block_offsets.push(read_u32(file, big_endian)?);
        }

        debug!(
            "LZ4 container: {file_size} bytes in {block_count} blocks of {block_size}"
        );

        Some(BlockIndex {
            block_size,
            block_count,
            block_offsets,
        })
    }
}
