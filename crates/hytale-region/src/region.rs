//! The indexed region file: many zstd-compressed blobs packed into one
//! fixed-header file, keyed by slot index.
//!
//! Layout: a 32-byte header (`magic | version:u32 | blobCount:u32 |
//! segmentSize:u32`, big-endian), then `blobCount` big-endian `u32` index
//! entries, then segment storage. Segments are numbered from 1; an index
//! entry of 0 means the slot is empty, any other value is the first segment
//! of the blob's contiguous run. Each blob starts with
//! `srcLen:u32 | compLen:u32` (big-endian) followed by `compLen` bytes of
//! zstd stream.
//!
//! The header and index table are memory-mapped; index entries are single
//! aligned 32-bit stores, so a reader sees either the previous or the new
//! first-segment value, never a torn one. Writers serialize per slot
//! through [`StampedLock`]s; readers run optimistically and only fall back
//! to the slot's read lock when a writer raced them. Segment ownership is
//! claimed in the allocator before any payload byte is written, so writers
//! to different slots proceed in parallel whenever their runs are disjoint.

use crate::migration;
use crate::stamped::StampedLock;
use log::debug;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// File identifier, exactly these 20 bytes.
pub const MAGIC: &[u8; 20] = b"HytaleIndexedStorage";
/// Size of the fixed file header.
pub const HEADER_LEN: u64 = 32;
/// Current format version.
pub const FORMAT_VERSION: u32 = 1;
/// The chained-segment layout migrated away from on open.
pub const LEGACY_VERSION: u32 = 0;
pub const DEFAULT_BLOB_COUNT: u32 = 1024;
pub const DEFAULT_SEGMENT_SIZE: u32 = 4096;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;
/// Per-blob `srcLen | compLen` prefix.
pub(crate) const BLOB_HEADER_LEN: usize = 8;

/// How [`RegionFile::open`] treats the path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file; fail if it does not exist.
    Open,
    /// Open if present (an empty file is initialized), create otherwise.
    Create,
    /// Create a new file; fail if one already exists.
    CreateNew,
}

/// Open-time settings. `blob_count` and `segment_size` only apply when a
/// new file is initialized; an existing header always wins.
#[derive(Clone, Debug)]
pub struct RegionOptions {
    pub blob_count: u32,
    pub segment_size: u32,
    pub mode: OpenMode,
    /// Flush payload and index on every write and remove.
    pub flush_on_write: bool,
    /// zstd level, in `[1, 22]`.
    pub compression_level: i32,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            blob_count: DEFAULT_BLOB_COUNT,
            segment_size: DEFAULT_SEGMENT_SIZE,
            mode: OpenMode::Create,
            flush_on_write: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl RegionOptions {
    fn validate(&self) -> io::Result<()> {
        if self.blob_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "blob count must be positive",
            ));
        }
        if self.segment_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size must be positive",
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "compression level {} outside [1, 22]",
                    self.compression_level
                ),
            ));
        }
        Ok(())
    }
}

/// Free/used state of the segment storage area. Segment numbers are
/// 1-based on the wire; bit `n - 1` tracks segment `n`. Marking a run used
/// inside the allocator lock is what gives a writer exclusive ownership of
/// those bytes.
#[derive(Debug)]
struct SegmentTable {
    used: Vec<u64>,
    len: usize,
}

impl SegmentTable {
    fn with_len(len: usize) -> Self {
        Self { used: vec![0; len.div_ceil(64)], len }
    }

    fn is_used(&self, bit: usize) -> bool {
        self.used[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize, used: bool) {
        if used {
            self.used[bit / 64] |= 1 << (bit % 64);
        } else {
            self.used[bit / 64] &= !(1 << (bit % 64));
        }
    }

    /// Lowest-numbered run of `need` free segments, if one exists.
    fn find_free_run(&self, need: usize) -> Option<usize> {
        let mut run = 0usize;
        for bit in 0..self.len {
            if self.is_used(bit) {
                run = 0;
            } else {
                run += 1;
                if run == need {
                    return Some(bit + 2 - need);
                }
            }
        }
        None
    }

    fn trailing_free(&self) -> usize {
        (0..self.len).rev().take_while(|&bit| !self.is_used(bit)).count()
    }

    fn grow(&mut self, new_len: usize) {
        self.used.resize(new_len.div_ceil(64), 0);
        self.len = new_len;
    }

    fn mark(&mut self, first: usize, count: usize) {
        for segment in first..first + count {
            self.set(segment - 1, true);
        }
    }

    fn clear(&mut self, first: usize, count: usize) {
        for segment in first..first + count {
            self.set(segment - 1, false);
        }
    }
}

/// An open region file. All operations take `&self`; the handle is safe to
/// share across threads.
#[derive(Debug)]
pub struct RegionFile {
    file: File,
    /// Maps `[0, 32 + 4 * blob_count)`: header plus index table.
    map: MmapMut,
    path: PathBuf,
    blob_count: u32,
    segment_size: u32,
    flush_on_write: bool,
    compression_level: i32,
    file_len: AtomicU64,
    slots: Vec<StampedLock>,
    segments: Mutex<SegmentTable>,
}

impl RegionFile {
    /// Open or create the region file at `path` per `options`. A version-0
    /// file is migrated to the current layout before this returns.
    pub fn open(path: &Path, options: &RegionOptions) -> io::Result<Self> {
        options.validate()?;
        let file = match options.mode {
            OpenMode::Open => OpenOptions::new().read(true).write(true).open(path)?,
            OpenMode::Create => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
            OpenMode::CreateNew => OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?,
        };
        let len = file.metadata()?.len();
        if options.mode == OpenMode::CreateNew || (options.mode == OpenMode::Create && len == 0) {
            return Self::initialize(file, path, options);
        }
        Self::open_existing(file, path, options)
    }

    fn initialize(file: File, path: &Path, options: &RegionOptions) -> io::Result<Self> {
        let index_end = HEADER_LEN + 4 * u64::from(options.blob_count);
        file.set_len(index_end)?;
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        header.extend_from_slice(&options.blob_count.to_be_bytes());
        header.extend_from_slice(&options.segment_size.to_be_bytes());
        write_all_at(&file, &header, 0)?;
        debug!(
            "created region file {} ({} slots, {}-byte segments)",
            path.display(),
            options.blob_count,
            options.segment_size
        );
        Self::finish_open(file, path, options.blob_count, options.segment_size, options)
    }

    fn open_existing(file: File, path: &Path, options: &RegionOptions) -> io::Result<Self> {
        let mut header = [0u8; HEADER_LEN as usize];
        read_exact_at(&file, &mut header, 0)?;
        if &header[..20] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a region file (bad magic)", path.display()),
            ));
        }
        let version = u32::from_be_bytes(header[20..24].try_into().unwrap());
        let blob_count = i32::from_be_bytes(header[24..28].try_into().unwrap());
        let segment_size = i32::from_be_bytes(header[28..32].try_into().unwrap());
        if blob_count <= 0 || segment_size <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "region header has non-positive dimensions: blob_count={blob_count} segment_size={segment_size}"
                ),
            ));
        }
        match version {
            FORMAT_VERSION => {
                Self::finish_open(file, path, blob_count as u32, segment_size as u32, options)
            }
            LEGACY_VERSION => {
                drop(file);
                migration::migrate_legacy_file(path, options.compression_level)?;
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                Self::open_existing(file, path, options)
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported region file version {other}"),
            )),
        }
    }

    fn finish_open(
        file: File,
        path: &Path,
        blob_count: u32,
        segment_size: u32,
        options: &RegionOptions,
    ) -> io::Result<Self> {
        let index_end = HEADER_LEN + 4 * u64::from(blob_count);
        let file_len = file.metadata()?.len();
        if file_len < index_end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "region file truncated: {} bytes, index table ends at {index_end}",
                    file_len
                ),
            ));
        }
        let map = unsafe { MmapOptions::new().len(index_end as usize).map_mut(&file)? };

        // Rebuild the used-segment table by walking the occupied slots.
        let segment_count = ((file_len - index_end) / u64::from(segment_size)) as usize;
        let mut table = SegmentTable::with_len(segment_count);
        for key in 0..blob_count as usize {
            let at = HEADER_LEN as usize + 4 * key;
            let first = u32::from_be_bytes(map[at..at + 4].try_into().unwrap()) as usize;
            if first == 0 {
                continue;
            }
            if first > segment_count {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("slot {key} references segment {first} beyond the file"),
                ));
            }
            let mut blob_header = [0u8; BLOB_HEADER_LEN];
            let pos = index_end + (first as u64 - 1) * u64::from(segment_size);
            read_exact_at(&file, &mut blob_header, pos)?;
            let comp_len = u32::from_be_bytes(blob_header[4..8].try_into().unwrap()) as usize;
            let need = (BLOB_HEADER_LEN + comp_len).div_ceil(segment_size as usize);
            if first - 1 + need > segment_count {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("slot {key} blob extends past the end of the file"),
                ));
            }
            for segment in first..first + need {
                if table.is_used(segment - 1) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("segment {segment} is claimed by more than one slot"),
                    ));
                }
            }
            table.mark(first, need);
        }

        debug!(
            "opened region file {} ({blob_count} slots, {segment_size}-byte segments, {segment_count} segments)",
            path.display()
        );
        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            blob_count,
            segment_size,
            flush_on_write: options.flush_on_write,
            compression_level: options.compression_level,
            file_len: AtomicU64::new(file_len),
            slots: (0..blob_count).map(|_| StampedLock::new()).collect(),
            segments: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blob_count(&self) -> u32 {
        self.blob_count
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn index_end(&self) -> u64 {
        HEADER_LEN + 4 * u64::from(self.blob_count)
    }

    fn segment_pos(&self, segment: u32) -> u64 {
        self.index_end() + u64::from(segment - 1) * u64::from(self.segment_size)
    }

    /// The index entry for `key`, viewed as an atomic. The map is
    /// page-aligned and entries sit at multiples of four, so the cast is
    /// always aligned; going through an atomic keeps the entry store a
    /// single word visible to concurrent readers.
    fn index_atom(&self, key: u32) -> &AtomicU32 {
        let offset = HEADER_LEN as usize + 4 * key as usize;
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn load_entry(&self, key: u32) -> u32 {
        u32::from_be(self.index_atom(key).load(Ordering::Acquire))
    }

    fn store_entry(&self, key: u32, first_segment: u32) {
        self.index_atom(key).store(first_segment.to_be(), Ordering::Release);
    }

    fn flush_index_entry(&self, key: u32) -> io::Result<()> {
        self.map
            .flush_range(HEADER_LEN as usize + 4 * key as usize, 4)
    }

    fn check_key(&self, key: u32) {
        assert!(
            key < self.blob_count,
            "blob key {key} out of bounds for {} slots",
            self.blob_count
        );
    }

    /// Read and decompress the blob at `key`. Returns `None` for an empty
    /// slot. Lock-free against writers in the common case.
    pub fn read_blob(&self, key: u32) -> io::Result<Option<Vec<u8>>> {
        self.check_key(key);
        let slot = &self.slots[key as usize];

        if let Some(stamp) = slot.optimistic() {
            let first = self.load_entry(key);
            if first == 0 {
                if slot.validate(stamp) {
                    return Ok(None);
                }
            } else if let Ok((src_len, compressed)) = self.read_raw(first) {
                if slot.validate(stamp) {
                    return self.decode_blob(src_len, &compressed).map(Some);
                }
            }
            // A writer raced us (or we chased a stale segment); retry under
            // the real read lock.
        }

        let guard = slot.read();
        let first = self.load_entry(key);
        if first == 0 {
            return Ok(None);
        }
        let (src_len, compressed) = self.read_raw(first)?;
        drop(guard);
        self.decode_blob(src_len, &compressed).map(Some)
    }

    fn read_raw(&self, first: u32) -> io::Result<(u32, Vec<u8>)> {
        let pos = self.segment_pos(first);
        let mut header = [0u8; BLOB_HEADER_LEN];
        read_exact_at(&self.file, &mut header, pos)?;
        let src_len = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let comp_len = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let end = pos + BLOB_HEADER_LEN as u64 + u64::from(comp_len);
        if end > self.file_len.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("blob at segment {first} extends past the end of the file"),
            ));
        }
        let mut compressed = vec![0u8; comp_len as usize];
        read_exact_at(&self.file, &mut compressed, pos + BLOB_HEADER_LEN as u64)?;
        Ok((src_len, compressed))
    }

    fn decode_blob(&self, src_len: u32, compressed: &[u8]) -> io::Result<Vec<u8>> {
        let data = zstd::bulk::decompress(compressed, src_len as usize).map_err(|error| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("zstd decode failed: {error}"),
            )
        })?;
        if data.len() != src_len as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "decompressed length mismatch: header says {src_len}, got {}",
                    data.len()
                ),
            ));
        }
        Ok(data)
    }

    /// Compress `data` and store it at `key`, replacing any previous blob.
    /// The new payload is fully written before the index flips, so
    /// concurrent readers see either the old blob or the new one.
    pub fn write_blob(&self, key: u32, data: &[u8]) -> io::Result<()> {
        self.check_key(key);
        let src_len = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "blob larger than 4 GiB")
        })?;
        let compressed = zstd::bulk::compress(data, self.compression_level)?;
        let comp_len = u32::try_from(compressed.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "compressed blob larger than 4 GiB")
        })?;
        let mut blob = Vec::with_capacity(BLOB_HEADER_LEN + compressed.len());
        blob.extend_from_slice(&src_len.to_be_bytes());
        blob.extend_from_slice(&comp_len.to_be_bytes());
        blob.extend_from_slice(&compressed);
        let need = blob.len().div_ceil(self.segment_size as usize);

        let slot = &self.slots[key as usize];
        let _guard = slot.write();
        let old_first = self.load_entry(key);
        let old_run = if old_first != 0 {
            Some((old_first, self.blob_segment_count(old_first)?))
        } else {
            None
        };
        let new_first = self.allocate(need)?;
        if let Err(error) = self.write_payload(new_first, &blob) {
            // The index still points at the old blob; just give the fresh
            // run back.
            self.release(new_first, need);
            return Err(error);
        }
        self.store_entry(key, new_first);
        if let Some((first, count)) = old_run {
            self.release(first, count);
        }
        if self.flush_on_write {
            self.flush_index_entry(key)?;
        }
        Ok(())
    }

    fn write_payload(&self, first: u32, blob: &[u8]) -> io::Result<()> {
        write_all_at(&self.file, blob, self.segment_pos(first))?;
        if self.flush_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Segments occupied by the blob whose run starts at `first`, from its
    /// on-disk compressed length.
    fn blob_segment_count(&self, first: u32) -> io::Result<usize> {
        let mut header = [0u8; BLOB_HEADER_LEN];
        read_exact_at(&self.file, &mut header, self.segment_pos(first))?;
        let comp_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
        Ok((BLOB_HEADER_LEN + comp_len).div_ceil(self.segment_size as usize))
    }

    /// Claim a contiguous run of `need` free segments, extending the file
    /// at the tail when nothing inside fits. Returns the 1-based first
    /// segment; the run belongs to the caller until released.
    fn allocate(&self, need: usize) -> io::Result<u32> {
        let mut table = self.segments.lock();
        if let Some(first) = table.find_free_run(need) {
            table.mark(first, need);
            return Ok(first as u32);
        }
        let first = table.len - table.trailing_free() + 1;
        let new_len = first - 1 + need;
        let new_file_len = self.index_end() + new_len as u64 * u64::from(self.segment_size);
        self.file.set_len(new_file_len)?;
        self.file_len.store(new_file_len, Ordering::Release);
        table.grow(new_len);
        table.mark(first, need);
        Ok(first as u32)
    }

    fn release(&self, first: u32, count: usize) {
        self.segments.lock().clear(first as usize, count);
    }

    /// Empty the slot at `key`. The freed segments keep their bytes; they
    /// are only reclaimed for later writes, never wiped.
    pub fn remove_blob(&self, key: u32) -> io::Result<()> {
        self.check_key(key);
        let slot = &self.slots[key as usize];
        let _guard = slot.write();
        let first = self.load_entry(key);
        if first == 0 {
            return Ok(());
        }
        let count = self.blob_segment_count(first)?;
        self.store_entry(key, 0);
        self.release(first, count);
        if self.flush_on_write {
            self.flush_index_entry(key)?;
        }
        Ok(())
    }

    /// Keys of the currently occupied slots. A best-effort snapshot: a
    /// concurrent writer or remover may be missed.
    pub fn keys(&self) -> Vec<u32> {
        (0..self.blob_count)
            .filter(|&key| self.load_entry(key) != 0)
            .collect()
    }

    /// Flush the mapped index and the file channel. With `metadata`, file
    /// metadata (length, timestamps) is synced too.
    pub fn force(&self, metadata: bool) -> io::Result<()> {
        self.map.flush()?;
        if metadata {
            self.file.sync_all()
        } else {
            self.file.sync_data()
        }
    }

    /// Flush and close, unmapping the index table before the file handle
    /// goes away. Dropping a `RegionFile` also unmaps, but this path
    /// surfaces flush errors and guarantees the unmap happens before the
    /// handle closes, which some platforms need before the file can be
    /// renamed or deleted.
    pub fn close(self) -> io::Result<()> {
        let Self { file, map, .. } = self;
        map.flush()?;
        drop(map);
        file.sync_all()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}
