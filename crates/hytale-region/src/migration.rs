//! One-shot rewrite of version-0 region files into the current layout.
//!
//! The legacy format chains segments: every segment opens with a
//! big-endian `i32` link (0 = unallocated, `i32::MIN` = end of chain,
//! positive = next segment), the first segment of a blob additionally
//! carries `srcLen | compLen` after the link, and a chain may hop around
//! the file freely. A second "temp" index table sits behind the primary
//! one; the primary is authoritative and a disagreement is only logged.
//!
//! Migration renames the file to `<path>.old`, streams every chained blob
//! out of it, and rewrites the blobs through a fresh current-format file at
//! the original path, which also makes every surviving blob contiguous.
//! The `.old` file is deleted only after the last blob landed; any failure
//! leaves it in place untouched as the recovery artifact.

use crate::region::{OpenMode, RegionFile, RegionOptions, HEADER_LEN, LEGACY_VERSION, MAGIC};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const CHAIN_END: i32 = i32::MIN;
/// Per-segment link header.
const LINK_LEN: usize = 4;
/// Link plus `srcLen | compLen` on a blob's first segment.
const FIRST_SEGMENT_HEADER_LEN: usize = 12;

pub(crate) fn migrate_legacy_file(path: &Path, compression_level: i32) -> io::Result<()> {
    let mut old_path = path.as_os_str().to_os_string();
    old_path.push(".old");
    let old_path = PathBuf::from(old_path);
    fs::rename(path, &old_path)?;
    debug!(
        "migrating legacy region file {} (source preserved at {})",
        path.display(),
        old_path.display()
    );

    let legacy = LegacyRegion::open(&old_path)?;
    legacy.warn_on_temp_table_disagreement();

    let region = RegionFile::open(
        path,
        &RegionOptions {
            blob_count: legacy.blob_count,
            segment_size: legacy.segment_size,
            mode: OpenMode::CreateNew,
            flush_on_write: false,
            compression_level,
        },
    )?;
    let mut migrated = 0usize;
    for key in 0..legacy.blob_count {
        let first = legacy.primary[key as usize];
        if first == 0 {
            continue;
        }
        let data = legacy.read_blob(first)?;
        region.write_blob(key, &data)?;
        migrated += 1;
    }
    region.close()?;
    drop(legacy);
    fs::remove_file(&old_path)?;
    debug!("migrated {migrated} blobs in {}", path.display());
    Ok(())
}

/// Read-only view of a version-0 file.
struct LegacyRegion {
    file: File,
    path: PathBuf,
    blob_count: u32,
    segment_size: u32,
    file_len: u64,
    primary: Vec<u32>,
    temp: Vec<u32>,
}

impl LegacyRegion {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let file_len = file.metadata()?.len();

        let mut header = [0u8; HEADER_LEN as usize];
        read_exact_at(&file, &mut header, 0)?;
        if &header[..20] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a region file (bad magic)", path.display()),
            ));
        }
        let version = u32::from_be_bytes(header[20..24].try_into().unwrap());
        if version != LEGACY_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected a version-0 file, found version {version}"),
            ));
        }
        let blob_count = i32::from_be_bytes(header[24..28].try_into().unwrap());
        let segment_size = i32::from_be_bytes(header[28..32].try_into().unwrap());
        if blob_count <= 0 || segment_size <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "legacy header has non-positive dimensions: blob_count={blob_count} segment_size={segment_size}"
                ),
            ));
        }
        let blob_count = blob_count as u32;
        let segment_size = segment_size as u32;

        let mut tables = vec![0u8; 8 * blob_count as usize];
        read_exact_at(&file, &mut tables, HEADER_LEN)?;
        let read_table = |offset: usize| -> Vec<u32> {
            (0..blob_count as usize)
                .map(|key| {
                    let at = offset + 4 * key;
                    u32::from_be_bytes(tables[at..at + 4].try_into().unwrap())
                })
                .collect()
        };
        let primary = read_table(0);
        let temp = read_table(4 * blob_count as usize);

        Ok(Self {
            file,
            path: path.to_path_buf(),
            blob_count,
            segment_size,
            file_len,
            primary,
            temp,
        })
    }

    fn warn_on_temp_table_disagreement(&self) {
        for (key, (&primary, &temp)) in self.primary.iter().zip(&self.temp).enumerate() {
            if primary != temp {
                warn!(
                    "legacy region {}: temp index disagrees at slot {key} (primary={primary}, temp={temp}); keeping primary",
                    self.path.display()
                );
            }
        }
    }

    fn segments_base(&self) -> u64 {
        HEADER_LEN + 8 * u64::from(self.blob_count)
    }

    fn segment_pos(&self, segment: u32) -> u64 {
        self.segments_base() + u64::from(segment - 1) * u64::from(self.segment_size)
    }

    /// Follow the chain starting at `first` and return the decompressed
    /// payload.
    fn read_blob(&self, first: u32) -> io::Result<Vec<u8>> {
        let max_chain =
            ((self.file_len.saturating_sub(self.segments_base())) / u64::from(self.segment_size))
                as usize;
        let mut segment = first;
        let mut visited = 0usize;
        let mut src_len = 0u32;
        let mut compressed: Vec<u8> = Vec::new();
        let mut comp_len = 0usize;

        loop {
            visited += 1;
            if visited > max_chain {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("segment chain starting at {first} does not terminate"),
                ));
            }
            let pos = self.segment_pos(segment);
            if segment == 0 || pos + u64::from(self.segment_size) > self.file_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("segment chain starting at {first} leaves the file at segment {segment}"),
                ));
            }

            let mut link_buf = [0u8; LINK_LEN];
            read_exact_at(&self.file, &mut link_buf, pos)?;
            let link = i32::from_be_bytes(link_buf);

            let (data_pos, capacity) = if visited == 1 {
                let mut lengths = [0u8; 8];
                read_exact_at(&self.file, &mut lengths, pos + LINK_LEN as u64)?;
                src_len = u32::from_be_bytes(lengths[0..4].try_into().unwrap());
                comp_len = u32::from_be_bytes(lengths[4..8].try_into().unwrap()) as usize;
                if comp_len as u64 > self.file_len {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("blob at segment {first} declares {comp_len} compressed bytes"),
                    ));
                }
                compressed.reserve(comp_len);
                (
                    pos + FIRST_SEGMENT_HEADER_LEN as u64,
                    (self.segment_size as usize).saturating_sub(FIRST_SEGMENT_HEADER_LEN),
                )
            } else {
                (
                    pos + LINK_LEN as u64,
                    (self.segment_size as usize).saturating_sub(LINK_LEN),
                )
            };

            let take = capacity.min(comp_len - compressed.len());
            let start = compressed.len();
            compressed.resize(start + take, 0);
            read_exact_at(&self.file, &mut compressed[start..], data_pos)?;
            if compressed.len() == comp_len {
                break;
            }

            segment = match link {
                CHAIN_END => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "segment chain starting at {first} ends with {} of {comp_len} compressed bytes",
                            compressed.len()
                        ),
                    ))
                }
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("segment chain starting at {first} links to an unallocated segment"),
                    ))
                }
                next if next > 0 => next as u32,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("segment chain starting at {first} has invalid link {other}"),
                    ))
                }
            };
        }

        let data = zstd::bulk::decompress(&compressed, src_len as usize).map_err(|error| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("zstd decode failed in legacy blob at segment {first}: {error}"),
            )
        })?;
        if data.len() != src_len as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "legacy blob at segment {first} decompressed to {} bytes, header says {src_len}",
                    data.len()
                ),
            ));
        }
        Ok(data)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
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
