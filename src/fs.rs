//! The mounted filesystem: volume discovery, the directory array, path
//! resolution and the I/O handle pool.
//!
//! Directories are promoted into memory lazily: a `Location` whose
//! length is zero points at a loaded directory by index, everything else
//! still lives on disc. Path resolution promotes directories as it
//! traverses them and falls back to streamed on-disc lookups when a
//! directory cannot be loaded.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::dir::IsoDir;
use crate::directory::{self, read_dir_record, Directory, Location, RawEntry};
use crate::file::IsoFile;
use crate::io::Io;
use crate::lz4::BlockIndex;
use crate::{Error, FileKind, Result};

/// Maximum number of raw `/`-separated segments in a path.
const MAX_SEGMENTS: usize = 16;

/// Maximum directory depth expanded by a full scan.
const MAX_SCAN_DEPTH: usize = 16;

/// A mounted ISO-9660 (Joliet) archive.
///
/// The handle can be shared between threads; path resolution is
/// serialized internally and every open file draws its own I/O handle
/// from a pool.
pub struct ISO9660 {
    archive_path: PathBuf,
    lz4_index: Option<Arc<BlockIndex>>,

    /// Directory tree state, guarded by the lookup lock: resolution may
    /// append to the directory array, and searches walk entry arrays
    /// that must not move underneath them.
    state: Mutex<FsState>,

    /// Idle I/O handles; never held across disc I/O.
    io_pool: Mutex<IoPool>,
}

struct FsState {
    /// Grow-only: a directory's index is its stable handle.
    directories: Vec<Arc<Directory>>,
    root: Location,
    fully_scanned: bool,
}

#[derive(Default)]
struct IoPool {
    idle: Vec<Io>,
    leased: usize,
}

/// Where a `Location` is stored, so promotions can write back through
/// indices rather than pointers into the growing directory array.
#[derive(Clone, Copy)]
enum LocRef {
    Root,
    Entry { dir: u32, entry: u32 },
}

fn loc_of(state: &FsState, place: LocRef) -> Location {
    match place {
        LocRef::Root => state.root,
        LocRef::Entry { dir, entry } => state.directories[dir as usize].entry(entry as usize).loc,
    }
}

fn set_loc(state: &mut FsState, place: LocRef, loc: Location) {
    match place {
        LocRef::Root => state.root = loc,
        LocRef::Entry { dir, entry } => {
            // clone-on-write only if a directory handle shares this one
            let directory = Arc::make_mut(&mut state.directories[dir as usize]);
            directory.entries[entry as usize].loc = loc;
        }
    }
}

/// Loads the directory at `loc` and appends it to the directory array,
/// returning its index.
fn load_location(state: &mut FsState, io: &mut Io, loc: Location) -> Result<u32> {
    let mut directory = Directory::new();
    directory.load(io, loc.sector, loc.length)?;

    state.directories.push(Arc::new(directory));
    Ok((state.directories.len() - 1) as u32)
}

/// Scans the volume descriptor set for the Joliet supplementary
/// descriptor and returns the root directory location.
fn find_joliet_root(io: &mut Io) -> Result<Location> {
    let mut entry = RawEntry::new();
    let mut try_sector = 16u32;

    loop {
        let buffer = io.read_sector(try_sector)?;

        // 255 terminates the descriptor set
        if buffer[0] == 255 {
            return Err(Error::Malformed("no Joliet descriptor in the volume set"));
        }

        if buffer[0] == 2 // supplementary volume descriptor
            && &buffer[1..6] == b"CD001"
            && buffer[88] == 0x25 && buffer[89] == 0x2F && buffer[90] == 0x45 // UCS-2 level 3 escape
            && buffer[881] == 1
        {
            read_dir_record(&mut entry, &buffer[156..190])?;

            if !entry.loc.directory {
                return Err(Error::Malformed("root record is not a directory"));
            }

            debug!(
                "Joliet root at sector {}, {} bytes (descriptor in sector {try_sector})",
                entry.loc.sector, entry.loc.length
            );

            return Ok(Location {
                sector: entry.loc.sector,
                length: entry.loc.length,
                directory: true,
            });
        }

        if try_sector == 31 {
            return Err(Error::Malformed("no Joliet descriptor in sectors 16..=31"));
        }

        try_sector += 1;
    }
}

/// Splits `path` at `/`, dropping empty and `.` segments and resolving
/// `..` against the segments seen so far. `..` at the root is invalid.
fn normalize_path(path: &str) -> Result<Vec<&str>> {
    let mut segments: Vec<&str> = Vec::new();
    let mut raw_parts = 0usize;

    for segment in path.split('/') {
        raw_parts += 1;
        if raw_parts > MAX_SEGMENTS {
            return Err(Error::InvalidPath("too many path segments"));
        }

        if segment.is_empty() || segment == "." {
            continue;
        }

        if segment == ".." {
            if segments.pop().is_none() {
                return Err(Error::InvalidPath("`..` above the root"));
            }
            continue;
        }

        segments.push(segment);
    }

    Ok(segments)
}

impl ISO9660 {
    /// Opens an archive, auto-detecting the LZ4 container wrapping.
    ///
    /// With `full_scan` the whole directory tree is indexed up front;
    /// otherwise directories load as path resolution first touches them.
    pub fn open(path: impl AsRef<Path>, full_scan: bool) -> Result<ISO9660> {
        let archive_path = path.as_ref().to_path_buf();

        let mut probe = File::open(&archive_path)?;
        let lz4_index = BlockIndex::probe(&mut probe).map(Arc::new);

        debug!(
            "opening {} ({})",
            archive_path.display(),
            if lz4_index.is_some() {
                "LZ4 container"
            } else {
                "uncompressed image"
            }
        );

        let fs = ISO9660 {
            archive_path,
            lz4_index,
            state: Mutex::new(FsState {
                directories: Vec::new(),
                root: Location::default(),
                fully_scanned: false,
            }),
            io_pool: Mutex::new(IoPool::default()),
        };

        // recycle the probe handle instead of reopening the file
        {
            let index = fs.lz4_index.clone();
            let mut pool = fs.lock_pool();
            pool.idle.push(Io::from_file(probe, index));
        }

        let mut io = fs.reserve_io()?;

        let setup = find_joliet_root(&mut io).and_then(|root| {
            fs.lock_state().root = root;

            if full_scan {
                let mut state = fs.lock_state();
                Self::full_scan(&mut state, &mut io)
            } else {
                Ok(())
            }
        });

        fs.release_io(io);
        setup?;

        Ok(fs)
    }

    /// Indexes the entire directory tree (a no-op if already done).
    pub fn scan(&self) -> Result<()> {
        let mut io = self.reserve_io()?;

        let result = {
            let mut state = self.lock_state();
            Self::full_scan(&mut state, &mut io)
        };

        self.release_io(io);
        result
    }

    /// Number of directories currently indexed in memory.
    pub fn loaded_directory_count(&self) -> usize {
        self.lock_state().directories.len()
    }

    /// Whether `path` names a file or a directory in the archive.
    pub fn exists(&self, path: &str) -> Option<FileKind> {
        match self.lookup(path) {
            Ok(loc) if loc.directory => Some(FileKind::Directory),
            Ok(_) => Some(FileKind::File),
            Err(_) => None,
        }
    }

    /// Opens a file for reading.
    pub fn open_file(&self, path: &str) -> Result<IsoFile<'_>> {
        let loc = self.lookup(path)?;

        if loc.directory {
            return Err(Error::IsDirectory);
        }

        let io = self.reserve_io()?;
        Ok(IsoFile::new(self, io, loc))
    }

    /// Opens a directory for enumeration.
    ///
    /// A directory that resolution left on disc is loaded privately for
    /// the lifetime of the returned handle.
    pub fn open_dir(&self, path: &str) -> Result<IsoDir> {
        let loc = self.lookup(path)?;

        if !loc.directory {
            return Err(Error::NotDirectory);
        }

        if let Some(index) = loc.loaded_index() {
            let state = self.lock_state();
            let directory = state
                .directories
                .get(index as usize)
                .cloned()
                .ok_or(Error::NotFound)?;
            return Ok(IsoDir::new(directory));
        }

        let mut io = self.reserve_io()?;
        let mut directory = Directory::new();
        let loaded = directory.load(&mut io, loc.sector, loc.length);
        self.release_io(io);
        loaded?;

        Ok(IsoDir::new(Arc::new(directory)))
    }

    /// Resolves `path` to a location, promoting directories into memory
    /// along the way when possible.
    pub(crate) fn lookup(&self, path: &str) -> Result<Location> {
        let segments = normalize_path(path)?;

        let mut state = self.lock_state();
        let mut io: Option<Io> = None;

        let mut cur = state.root;
        let mut cur_ref: Option<LocRef> = Some(LocRef::Root);
        let mut on_disc = false;

        let mut result: Result<()> = Ok(());

        'walk: for segment in &segments {
            let name = segment.as_bytes();

            loop {
                if let Some(dir_index) = cur.loaded_index() {
                    let dir_index = dir_index as usize;

                    // partially or incorrectly loaded directory
                    if dir_index >= state.directories.len() {
                        result = Err(Error::NotFound);
                        break 'walk;
                    }

                    let dir = &state.directories[dir_index];
                    match dir.lookup(name) {
                        Some(entry_index) => {
                            cur = dir.entry(entry_index).loc;
                            cur_ref = Some(LocRef::Entry {
                                dir: dir_index as u32,
                                entry: entry_index as u32,
                            });
                            break;
                        }
                        None => {
                            result = Err(Error::NotFound);
                            break 'walk;
                        }
                    }
                } else if cur.directory {
                    if io.is_none() {
                        match self.reserve_io() {
                            Ok(handle) => io = Some(handle),
                            Err(err) => {
                                result = Err(err);
                                break 'walk;
                            }
                        }
                    }
                    let handle = io.as_mut().expect("I/O handle reserved above");

                    // promote the directory, then retry this segment
                    if !on_disc {
                        match load_location(&mut state, handle, cur) {
                            Ok(new_index) => {
                                let loaded = Location {
                                    sector: new_index,
                                    length: 0,
                                    directory: true,
                                };
                                if let Some(place) = cur_ref {
                                    set_loc(&mut state, place, loaded);
                                }
                                cur = loaded;
                                continue;
                            }
                            Err(err) => {
                                debug!("resolving on disc from here: {err}");
                                on_disc = true;
                            }
                        }
                    }

                    match directory::lookup_unloaded(handle, cur.sector, cur.length, name) {
                        Ok(Some(loc)) => {
                            cur = loc;
                            cur_ref = None;
                            break;
                        }
                        Ok(None) => {
                            result = Err(Error::NotFound);
                            break 'walk;
                        }
                        Err(err) => {
                            result = Err(err);
                            break 'walk;
                        }
                    }
                } else {
                    // a file in the middle of the path
                    result = Err(Error::NotDirectory);
                    break 'walk;
                }
            }
        }

        // prefer to hand back a loaded directory (best effort)
        if result.is_ok() && cur.directory && cur.length != 0 {
            if let Some(place) = cur_ref {
                if io.is_none() {
                    io = self.reserve_io().ok();
                }
                if let Some(handle) = io.as_mut() {
                    if let Ok(new_index) = load_location(&mut state, handle, cur) {
                        let loaded = Location {
                            sector: new_index,
                            length: 0,
                            directory: true,
                        };
                        set_loc(&mut state, place, loaded);
                        cur = loaded;
                    }
                }
            }
        }

        drop(state);

        if let Some(handle) = io.take() {
            self.release_io(handle);
        }

        result.map(|()| cur)
    }

    /// Iterative depth-first expansion of the whole tree with an
    /// explicit bounded stack. Subtrees that fail to load or exceed the
    /// depth limit are skipped; the scan itself still completes, which
    /// also bounds archives with cyclic directory references.
    fn full_scan(state: &mut FsState, io: &mut Io) -> Result<()> {
        if state.fully_scanned {
            return Ok(());
        }

        if !state.root.directory {
            return Err(Error::Malformed("root directory not located"));
        }

        struct Frame {
            loc: LocRef,
            next_child: u32,
        }

        let mut stack: Vec<Frame> = Vec::with_capacity(MAX_SCAN_DEPTH);
        stack.push(Frame {
            loc: LocRef::Root,
            next_child: 0,
        });

        while let Some(top) = stack.len().checked_sub(1) {
            let place = stack[top].loc;
            let loc = loc_of(state, place);

            let dir_index = match loc.loaded_index() {
                Some(index) => index,
                None => match load_location(state, io, loc) {
                    Ok(index) => {
                        set_loc(
                            state,
                            place,
                            Location {
                                sector: index,
                                length: 0,
                                directory: true,
                            },
                        );
                        index
                    }
                    Err(err) => {
                        warn!("skipping unreadable subtree: {err}");
                        stack.pop();
                        continue;
                    }
                },
            } as usize;

            if dir_index >= state.directories.len() {
                return Err(Error::Malformed("directory index out of range"));
            }

            let child = stack[top].next_child as usize;
            let dir = &state.directories[dir_index];

            if child >= dir.entry_count() {
                stack.pop();
                continue;
            }

            stack[top].next_child += 1;

            let child_loc = dir.entry(child).loc;

            if !child_loc.directory {
                continue;
            }

            if stack.len() >= MAX_SCAN_DEPTH {
                debug!("scan depth limit reached, skipping subtree");
                continue;
            }

            stack.push(Frame {
                loc: LocRef::Entry {
                    dir: dir_index as u32,
                    entry: child as u32,
                },
                next_child: 0,
            });
        }

        state.fully_scanned = true;

        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pool(&self) -> MutexGuard<'_, IoPool> {
        self.io_pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes an idle I/O handle from the pool or opens a new one.
    pub(crate) fn reserve_io(&self) -> Result<Io> {
        let mut pool = self.lock_pool();

        if let Some(io) = pool.idle.pop() {
            pool.leased += 1;
            return Ok(io);
        }

        let file = File::open(&self.archive_path)?;
        pool.leased += 1;

        Ok(Io::from_file(file, self.lz4_index.clone()))
    }

    pub(crate) fn release_io(&self, io: Io) {
        let mut pool = self.lock_pool();

        debug_assert!(pool.leased > 0);
        pool.leased = pool.leased.saturating_sub(1);
        pool.idle.push(io);
    }
}
