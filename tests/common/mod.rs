//! Synthesizes tiny ISO-9660 (Joliet) images and LZ4 containers for the
//! integration tests.

// not every test binary uses every helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;

pub const SECTOR: usize = 2048;

/// A node of the tree to lay out in the image.
#[derive(Clone)]
pub enum Node {
    File(String, Vec<u8>),
    Dir(String, Vec<Node>),
    /// A directory record pointing at an arbitrary extent; used to craft
    /// cyclic references.
    DirRef(String, u32, u32),
}

pub fn file(name: &str, data: &[u8]) -> Node {
    Node::File(name.to_string(), data.to_vec())
}

pub fn dir(name: &str, children: Vec<Node>) -> Node {
    Node::Dir(name.to_string(), children)
}

fn node_name(node: &Node) -> &str {
    match node {
        Node::File(name, _) => name,
        Node::Dir(name, _) => name,
        Node::DirRef(name, _, _) => name,
    }
}

pub fn utf16be(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()
}

/// Renders one directory record. `name` is the raw name-field bytes
/// (UTF-16BE for real names, `[0x00]`/`[0x01]` for the dot entries).
pub fn record(name: &[u8], sector: u32, length: u32, directory: bool) -> Vec<u8> {
    let mut record_length = 33 + name.len();
    if record_length % 2 == 1 {
        record_length += 1;
    }

    let mut rec = vec![0u8; record_length];
    rec[0] = record_length as u8;
    rec[2..6].copy_from_slice(&sector.to_le_bytes());
    rec[6..10].copy_from_slice(&sector.to_be_bytes());
    rec[10..14].copy_from_slice(&length.to_le_bytes());
    rec[14..18].copy_from_slice(&length.to_be_bytes());
    rec[25] = if directory { 0x02 } else { 0x00 };
    rec[28] = 1;
    rec[31] = 1;
    rec[32] = name.len() as u8;
    rec[33..33 + name.len()].copy_from_slice(name);
    rec
}

/// Packs records into sectors: a record never crosses a sector boundary
/// and the content is padded to whole sectors.
pub fn layout_records(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();

    for rec in records {
        let remaining = SECTOR - out.len() % SECTOR;
        if rec.len() > remaining {
            out.resize(out.len() + remaining, 0);
        }
        out.extend_from_slice(rec);
    }

    let pad = (SECTOR - out.len() % SECTOR) % SECTOR;
    out.resize(out.len() + pad, 0);
    out
}

pub fn build_iso(root: &[Node]) -> Vec<u8> {
    build_iso_at(root, 16)
}

/// Builds a complete image with the Joliet descriptor at `svd_sector`
/// (sectors 16..svd_sector are filled with primary-descriptor dummies).
/// Directory extents start at `svd_sector + 2`.
pub fn build_iso_at(root: &[Node], svd_sector: u32) -> Vec<u8> {
    struct Flat<'a> {
        children: &'a [Node],
        parent: usize,
        child_dirs: Vec<usize>,
        sector: u32,
        length: u32,
    }

    // flatten the directory tree, breadth-first, root at index 0
    let mut flat: Vec<Flat> = vec![Flat {
        children: root,
        parent: 0,
        child_dirs: Vec::new(),
        sector: 0,
        length: 0,
    }];

    let mut i = 0;
    while i < flat.len() {
        let children = flat[i].children;
        let parent = i;
        let mut ids = Vec::new();

        for node in children {
            if let Node::Dir(_, grandchildren) = node {
                flat.push(Flat {
                    children: grandchildren,
                    parent,
                    child_dirs: Vec::new(),
                    sector: 0,
                    length: 0,
                });
                ids.push(flat.len() - 1);
            }
        }

        flat[i].child_dirs = ids;
        i += 1;
    }

    // directory sizes are independent of the locations they reference
    for f in flat.iter_mut() {
        let mut records = vec![record(&[0x00], 0, 0, true), record(&[0x01], 0, 0, true)];
        for node in f.children {
            records.push(record(&utf16be(node_name(node)), 0, 0, false));
        }
        f.length = layout_records(&records).len() as u32;
    }

    // assign extents: directories first, then file data
    let mut next = svd_sector + 2;
    for f in flat.iter_mut() {
        f.sector = next;
        next += f.length / SECTOR as u32;
    }

    let mut file_locs: HashMap<(usize, usize), (u32, u32)> = HashMap::new();
    for (fi, f) in flat.iter().enumerate() {
        for (ci, node) in f.children.iter().enumerate() {
            if let Node::File(_, data) = node {
                file_locs.insert((fi, ci), (next, data.len() as u32));
                next += (data.len() as u32).div_ceil(SECTOR as u32);
            }
        }
    }

    let mut image = vec![0u8; next as usize * SECTOR];

    // dummy primary descriptors before the supplementary one
    for s in 16..svd_sector {
        let at = s as usize * SECTOR;
        image[at] = 1;
        image[at + 1..at + 6].copy_from_slice(b"CD001");
    }

    // Joliet supplementary volume descriptor
    {
        let at = svd_sector as usize * SECTOR;
        image[at] = 2;
        image[at + 1..at + 6].copy_from_slice(b"CD001");
        image[at + 88] = 0x25;
        image[at + 89] = 0x2F;
        image[at + 90] = 0x45;
        image[at + 881] = 1;

        let root_rec = record(&[0x00], flat[0].sector, flat[0].length, true);
        image[at + 156..at + 156 + root_rec.len()].copy_from_slice(&root_rec);
    }

    // volume descriptor set terminator
    {
        let at = (svd_sector + 1) as usize * SECTOR;
        image[at] = 255;
        image[at + 1..at + 6].copy_from_slice(b"CD001");
    }

    // directory extents
    for (fi, f) in flat.iter().enumerate() {
        let parent = &flat[f.parent];

        let mut records = vec![
            record(&[0x00], f.sector, f.length, true),
            record(&[0x01], parent.sector, parent.length, true),
        ];

        let mut dir_ids = f.child_dirs.iter();
        for (ci, node) in f.children.iter().enumerate() {
            let rec = match node {
                Node::File(name, _) => {
                    let (sector, length) = file_locs[&(fi, ci)];
                    record(&utf16be(name), sector, length, false)
                }
                Node::Dir(name, _) => {
                    let child = &flat[*dir_ids.next().unwrap()];
                    record(&utf16be(name), child.sector, child.length, true)
                }
                Node::DirRef(name, sector, length) => record(&utf16be(name), *sector, *length, true),
            };
            records.push(rec);
        }

        let bytes = layout_records(&records);
        let at = f.sector as usize * SECTOR;
        image[at..at + bytes.len()].copy_from_slice(&bytes);
    }

    // file data
    for (fi, f) in flat.iter().enumerate() {
        for (ci, node) in f.children.iter().enumerate() {
            if let Node::File(_, data) = node {
                let (sector, _) = file_locs[&(fi, ci)];
                let at = sector as usize * SECTOR;
                image[at..at + data.len()].copy_from_slice(data);
            }
        }
    }

    image
}

/// Wraps `data` in the LZ4 container: a fake frame, the offset sidecar
/// in a skippable frame, then length-prefixed blocks. Blocks that
/// compress worse than 50% are stored raw with the high bit set. The
/// trailing content checksum is left zero (the reader never checks it).
pub fn lz4_pack(data: &[u8], block_size: usize, big_endian: bool) -> Vec<u8> {
    let block_count = data.len().div_ceil(block_size);

    let put32 = |out: &mut Vec<u8>, value: u32| {
        if big_endian {
            out.extend_from_slice(&value.to_be_bytes());
        } else {
            out.extend_from_slice(&value.to_le_bytes());
        }
    };

    let mut out = Vec::new();
    out.extend_from_slice(&[0x04, 0x22, 0x4D, 0x18, 0x60, 0x40, 0x82]); // fake frame header
    out.extend_from_slice(&[0u8; 4]); // its endmark

    out.extend_from_slice(&[0x50, 0x2A, 0x4D, 0x18]); // skippable frame
    out.extend_from_slice(&((12 + block_count * 4) as u32).to_le_bytes());
    out.push(b'M');
    out.push(b'I');
    out.push(if big_endian { b'B' } else { b'L' });
    out.push(b'E');
    put32(&mut out, data.len() as u32);
    put32(&mut out, block_size as u32);

    let table_at = out.len();
    out.resize(out.len() + block_count * 4, 0);

    out.extend_from_slice(&[0x04, 0x22, 0x4D, 0x18, 0x64, 0x40, 0xA7]); // real frame header

    let mut offsets = Vec::with_capacity(block_count);
    for chunk in data.chunks(block_size) {
        offsets.push(out.len() as u32);

        let compressed = lz4_flex::block::compress(chunk);
        if compressed.len() > chunk.len() * 5 / 10 {
            out.extend_from_slice(&((chunk.len() as u32) | 0x8000_0000).to_le_bytes());
            out.extend_from_slice(chunk);
        } else {
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
        }
    }

    out.extend_from_slice(&[0u8; 4]); // endmark
    out.extend_from_slice(&[0u8; 4]); // content checksum

    for (i, offset) in offsets.iter().enumerate() {
        let bytes = if big_endian {
            offset.to_be_bytes()
        } else {
            offset.to_le_bytes()
        };
        out[table_at + i * 4..table_at + i * 4 + 4].copy_from_slice(&bytes);
    }

    out
}

/// Writes an image to a temp file and returns its self-deleting path.
pub fn write_archive(bytes: &[u8]) -> tempfile::TempPath {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f.into_temp_path()
}
