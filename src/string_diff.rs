//! Prefix-sharing storage for sorted name lists.
//!
//! Every directory keeps its entry names in one shared byte table. After
//! compaction each entry's [`NameFrag`] describes only the bytes that
//! differ from the preceding entry, plus a clip flag marking where the
//! name ends. A name is rebuilt by walking the `last_effective_entry`
//! chain and overlaying each fragment's byte range, which keeps a tree
//! with tens of thousands of entries in a few hundred kilobytes.

use crate::directory::DirEntry;
use crate::{Error, Result};

/// Chain terminator: all ones in the 19-bit entry-index field.
pub const NULL_REF: u32 = 0x7FFFF;

const LEE_BITS: u64 = 19;
const OFFSET_BITS: u64 = 24;
const POS_BITS: u64 = 10;

const CLIP_SHIFT: u64 = LEE_BITS;
const OFFSET_SHIFT: u64 = LEE_BITS + 1;
const BEGIN_SHIFT: u64 = OFFSET_SHIFT + OFFSET_BITS;
const END_SHIFT: u64 = BEGIN_SHIFT + POS_BITS;

/// Bit-packed name fragment, 64 bits total.
///
/// Field widths bound the directory shape: 19-bit entry indices
/// (524 287 entries), a 24-bit table offset (16 MiB of name bytes) and
/// 10-bit substitution positions (1023-byte names).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameFrag(u64);

impl NameFrag {
    pub fn new(
        last_effective_entry: u32,
        clip_end: bool,
        table_offset: usize,
        subst_begin: usize,
        subst_end: usize,
    ) -> NameFrag {
        debug_assert!(last_effective_entry <= NULL_REF);
        debug_assert!(table_offset < (1usize << OFFSET_BITS));
        debug_assert!(subst_begin < (1usize << POS_BITS));
        debug_assert!(subst_end < (1usize << POS_BITS));

        NameFrag(
            (last_effective_entry as u64 & (NULL_REF as u64))
                | ((clip_end as u64) << CLIP_SHIFT)
                | ((table_offset as u64 & 0xFF_FFFF) << OFFSET_SHIFT)
                | ((subst_begin as u64 & 0x3FF) << BEGIN_SHIFT)
                | ((subst_end as u64 & 0x3FF) << END_SHIFT),
        )
    }

    pub fn last_effective_entry(&self) -> u32 {
        (self.0 & NULL_REF as u64) as u32
    }

    pub fn clip_end(&self) -> bool {
        self.0 & (1u64 << CLIP_SHIFT) != 0
    }

    pub fn table_offset(&self) -> usize {
        ((self.0 >> OFFSET_SHIFT) & 0xFF_FFFF) as usize
    }

    pub fn subst_begin(&self) -> usize {
        ((self.0 >> BEGIN_SHIFT) & 0x3FF) as usize
    }

    pub fn subst_end(&self) -> usize {
        ((self.0 >> END_SHIFT) & 0x3FF) as usize
    }

    pub fn with_last_effective_entry(self, last_effective_entry: u32) -> NameFrag {
        debug_assert!(last_effective_entry <= NULL_REF);
        NameFrag((self.0 & !(NULL_REF as u64)) | last_effective_entry as u64)
    }
}

/// Rebuilds the name of `top_entry` into `buffer` by walking its
/// fragment chain. Returns the name length; `buffer` holds the name
/// followed by a NUL.
///
/// Positions past the current clip are never written, and positions no
/// fragment covers stay zero, terminating the name early when two
/// neighbours share a prefix shorter than the buffer.
pub fn reconstruct(
    buffer: &mut [u8],
    table: &[u8],
    entries: &[DirEntry],
    top_entry: usize,
) -> Result<usize> {
    let mut clip_at = usize::MAX;
    let mut last_effective_entry = top_entry;
    let mut string_size = 0usize;
    let mut name_end: Option<usize> = None;

    while last_effective_entry < entries.len() {
        let frag = entries[last_effective_entry].frag;

        let end_effective = frag.subst_end().min(clip_at);

        // extend the zero-initialised region if needed
        if end_effective + 1 > string_size {
            if end_effective + 1 > buffer.len() {
                return Err(Error::Malformed("name does not fit reconstruction buffer"));
            }

            buffer[string_size..end_effective + 1].fill(0);
            string_size = end_effective + 1;
        }

        // fill any position a fragment closer to the entry has not claimed
        for i in frag.subst_begin()..end_effective {
            if buffer[i] == 0 {
                buffer[i] = table[frag.table_offset() + (i - frag.subst_begin())];
            }
        }

        if frag.clip_end() {
            if name_end.is_none() {
                name_end = Some(end_effective);
            }
            clip_at = end_effective;
        }

        last_effective_entry = frag.last_effective_entry() as usize;
    }

    let bound = name_end.unwrap_or_else(|| string_size.saturating_sub(1));
    let len = buffer[..bound]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(bound);

    Ok(len)
}

/// Rewrites a freshly-built entry list, in which every fragment is still
/// self-contained, so that each fragment only stores the byte range where
/// the entry differs from its predecessor. The table is replaced by the
/// packed difference bytes.
///
/// Input entries must be sorted; two identical names are a hard error.
pub fn compact(table: &mut Vec<u8>, entries: &mut [DirEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let old_table = std::mem::take(table);
    let mut new_table: Vec<u8> = Vec::with_capacity(old_table.len());

    let restore = |table: &mut Vec<u8>, old: Vec<u8>| {
        *table = old;
    };

    let first = entries[0].frag;
    if !first.clip_end() || first.subst_begin() != 0 {
        restore(table, old_table);
        return Err(Error::Malformed("first entry is not self-contained"));
    }

    let mut last_index = 0usize;
    let mut last_diff_begin = 0usize;
    let mut last_diff_end = first.subst_end();
    let mut last_clip_end = true;

    for e in 1..entries.len() {
        let frag = entries[e].frag;
        if !frag.clip_end() || frag.subst_begin() != 0 {
            restore(table, old_table);
            return Err(Error::Malformed("entry is not self-contained"));
        }

        let last_frag = entries[last_index].frag;
        let cur_len = frag.subst_end();
        let last_len = last_frag.subst_end();

        // locate the minimal range of differing bytes
        let mut diff_begin = 0usize;
        let mut diff_end = 0usize;
        let mut clip_end = false;

        let cur_name = &old_table[frag.table_offset()..];
        let last_name = &old_table[last_frag.table_offset()..];

        for i in 0..cur_len.min(last_len) {
            if cur_name[i] == last_name[i] {
                continue;
            }

            if diff_end == 0 {
                diff_begin = i;
            }

            diff_end = i + 1;
        }

        // a length mismatch counts as a difference
        if cur_len < last_len {
            if diff_end == 0 {
                diff_begin = cur_len;
            }

            diff_end = cur_len;
            clip_end = true;
        } else if cur_len > last_len {
            if diff_end == 0 {
                diff_begin = last_len;
            }

            diff_end = cur_len;
            clip_end = true;
        } else {
            if diff_end == 0 {
                restore(table, old_table);
                return Err(Error::Malformed("duplicate name in directory"));
            }

            if diff_end == cur_len {
                clip_end = true;
            }
        }

        // the previous entry has now been compared on both sides, so its
        // stored range can shrink to its own difference window
        let src_offset = entries[last_index].frag.table_offset();
        let new_offset = new_table.len();
        new_table
            .extend_from_slice(&old_table[src_offset + last_diff_begin..src_offset + last_diff_end]);
        entries[last_index].frag = NameFrag::new(
            entries[last_index].frag.last_effective_entry(),
            last_clip_end,
            new_offset,
            last_diff_begin,
            last_diff_end,
        );

        last_index = e;
        last_diff_begin = diff_begin;
        last_diff_end = diff_end;
        last_clip_end = clip_end;

        let mut last_effective_entry = if diff_begin == 0 && clip_end {
            NULL_REF
        } else {
            (e - 1) as u32
        };

        // collapse the chain while the referenced predecessor's range is
        // shadowed by this entry's own difference window
        let mut clip_at = cur_len;

        while (last_effective_entry as usize) < entries.len() {
            let other = entries[last_effective_entry as usize].frag;

            let other_eff_end = other.subst_end().min(clip_at);

            if other.subst_begin() < diff_begin || other_eff_end > diff_end {
                break;
            }

            if other.clip_end() {
                clip_at = other_eff_end;
            }

            last_effective_entry = other.last_effective_entry();
        }

        entries[e].frag = entries[e].frag.with_last_effective_entry(last_effective_entry);
    }

    // the very last entry keeps its full difference window
    let src_offset = entries[last_index].frag.table_offset();
    let new_offset = new_table.len();
    new_table
        .extend_from_slice(&old_table[src_offset + last_diff_begin..src_offset + last_diff_end]);
    entries[last_index].frag = NameFrag::new(
        entries[last_index].frag.last_effective_entry(),
        last_clip_end,
        new_offset,
        last_diff_begin,
        last_diff_end,
    );

    *table = new_table;

    Ok(())
}

/// Byte of `top_entry`'s name at `pos`, or `None` when the name ends at
/// or before `pos`.
fn chain_byte_at(table: &[u8], entries: &[DirEntry], top_entry: usize, pos: usize) -> Option<u8> {
    let mut clip_at = usize::MAX;
    let mut last_effective_entry = top_entry;

    while last_effective_entry < entries.len() {
        let frag = entries[last_effective_entry].frag;

        let end_effective = frag.subst_end().min(clip_at);

        if frag.clip_end() && end_effective <= pos {
            return None;
        }

        if frag.subst_begin() <= pos && pos < end_effective {
            return Some(table[frag.table_offset() + (pos - frag.subst_begin())]);
        }

        if frag.clip_end() {
            clip_at = end_effective;
        }

        last_effective_entry = frag.last_effective_entry() as usize;
    }

    None
}

/// Binary search over diff-encoded entries without materialising any
/// name off the search path.
///
/// `begin_ge` and `end_le` track how much of the query is already known
/// to match the reconstruction at the respective boundary; everything
/// between the boundaries shares at least the shorter of the two
/// prefixes, so each midpoint comparison starts at that byte and walks
/// the midpoint's chain only for the bytes it actually inspects.
pub fn lookup(table: &[u8], entries: &[DirEntry], name: &[u8]) -> Option<usize> {
    let mut begin = 0usize;
    let mut end = entries.len();

    let mut begin_ge = 0usize;
    let mut end_le = 0usize;

    while begin != end {
        let mid = begin + (end - begin) / 2;
        let mut cmp_char = begin_ge.min(end_le);

        loop {
            match chain_byte_at(table, entries, mid, cmp_char) {
                None => {
                    // mid's name ends here
                    if name.len() == cmp_char {
                        return Some(mid);
                    }

                    begin = mid + 1;
                    begin_ge = cmp_char;
                    break;
                }
                Some(byte) => {
                    if cmp_char == name.len() {
                        // the query is a strict prefix of mid's name
                        end = mid;
                        end_le = cmp_char;
                        break;
                    }

                    if byte == name[cmp_char] {
                        cmp_char += 1;
                        continue;
                    }

                    if byte < name[cmp_char] {
                        begin = mid + 1;
                        begin_ge = cmp_char;
                    } else {
                        end = mid;
                        end_le = cmp_char;
                    }
                    break;
                }
            }
        }
    }

    None
}
