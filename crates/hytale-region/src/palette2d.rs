//! Dictionary-compressed 32x32 grids: the heightmap and biome-tint layers
//! of a chunk column.
//!
//! Wire layout (all little-endian, unlike the section and region framing):
//! `count:u16 | entries[count] | packed_len:u32 | packed[packed_len]`, where
//! `packed` is a [`BitFieldArray`] of 1024 ten-bit palette indices. Height
//! entries are `u16`; tint entries are `u32` holding 24-bit RGB.

use crate::bitfield::BitFieldArray;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Grid edge length in cells.
pub const GRID_DIM: usize = 32;
/// Cells per grid.
pub const GRID_CELLS: usize = GRID_DIM * GRID_DIM;
/// Bits per packed palette index.
const INDEX_BITS: u32 = 10;
/// Serialized size of the packed index field.
pub const PACKED_BYTES: usize = GRID_CELLS * INDEX_BITS as usize / 8;
/// Palette capacity; reaching it triggers recompaction, exceeding it after
/// recompaction is fatal.
const PALETTE_CAPACITY: usize = 1 << INDEX_BITS;

/// A value that can live in a 2D palette. Sealed to the two wire widths.
pub trait GridValue: Copy + Eq + Hash {
    /// Serialized entry width in bytes.
    const WIDTH: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
}

impl GridValue for u16 {
    const WIDTH: usize = 2;

    fn read_le(bytes: &[u8]) -> Self {
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl GridValue for u32 {
    const WIDTH: usize = 4;

    fn read_le(bytes: &[u8]) -> Self {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// Heightmap layer: one `u16` per column.
pub type HeightPalette = Palette2d<u16>;
/// Biome-tint layer: one packed RGB `u32` per column.
pub type TintPalette = Palette2d<u32>;

/// Pack an RGB triple into a tint entry: `(r << 16) | (g << 8) | b`.
pub fn pack_tint(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

/// Split a tint entry back into its RGB channels.
pub fn unpack_tint(tint: u32) -> (u8, u8, u8) {
    (
        ((tint >> 16) & 0xFF) as u8,
        ((tint >> 8) & 0xFF) as u8,
        (tint & 0xFF) as u8,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Palette2dCodecError {
    Truncated { needed: usize, available: usize },
    PackedLengthMismatch { expected: usize, actual: usize },
    IndexOutOfRange { index: u32, palette_len: usize },
    TrailingBytes { count: usize },
}

impl fmt::Display for Palette2dCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "palette truncated: needed {needed} bytes, {available} available")
            }
            Self::PackedLengthMismatch { expected, actual } => write!(
                f,
                "packed index field length mismatch: expected {expected}, got {actual}"
            ),
            Self::IndexOutOfRange { index, palette_len } => write!(
                f,
                "packed index {index} out of range for palette length {palette_len}"
            ),
            Self::TrailingBytes { count } => {
                write!(f, "{count} trailing bytes after palette payload")
            }
        }
    }
}

impl std::error::Error for Palette2dCodecError {}

fn take<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    n: usize,
) -> Result<&'a [u8], Palette2dCodecError> {
    let start = *cursor;
    let end = start
        .checked_add(n)
        .filter(|end| *end <= bytes.len())
        .ok_or(Palette2dCodecError::Truncated {
            needed: n,
            available: bytes.len() - start,
        })?;
    *cursor = end;
    Ok(&bytes[start..end])
}

/// A 32x32 grid of values stored as a palette plus 10-bit indices.
///
/// Entries keep their insertion order, so an untouched grid serializes back
/// to the exact bytes it was read from.
#[derive(Clone, Debug)]
pub struct Palette2d<V: GridValue> {
    entries: Vec<V>,
    lookup: HashMap<V, u32>,
    indices: BitFieldArray,
}

impl<V: GridValue> Palette2d<V> {
    /// A grid with every cell set to `value`.
    pub fn filled(value: V) -> Self {
        let mut lookup = HashMap::new();
        lookup.insert(value, 0);
        Self {
            entries: vec![value],
            lookup,
            indices: BitFieldArray::new(INDEX_BITS, GRID_CELLS),
        }
    }

    /// Build from a dense row-major grid of exactly [`GRID_CELLS`] values.
    pub fn from_cells(cells: &[V]) -> Self {
        assert_eq!(cells.len(), GRID_CELLS, "grid must have {GRID_CELLS} cells");
        let mut palette = Self::filled(cells[0]);
        for (i, value) in cells.iter().enumerate() {
            palette.set_flat(i, *value);
        }
        palette
    }

    pub fn palette_len(&self) -> usize {
        self.entries.len()
    }

    fn flat(x: usize, z: usize) -> usize {
        assert!(x < GRID_DIM && z < GRID_DIM, "cell ({x}, {z}) out of bounds");
        x + GRID_DIM * z
    }

    /// Read the value at `(x, z)`.
    pub fn get(&self, x: usize, z: usize) -> V {
        self.entries[self.indices.get(Self::flat(x, z)) as usize]
    }

    /// Write `value` at `(x, z)`, extending the palette as needed.
    pub fn set(&mut self, x: usize, z: usize, value: V) {
        self.set_flat(Self::flat(x, z), value);
    }

    fn set_flat(&mut self, flat: usize, value: V) {
        let index = match self.lookup.get(&value) {
            Some(index) => *index,
            None => {
                if self.entries.len() == PALETTE_CAPACITY {
                    self.recompact();
                    assert!(
                        self.entries.len() < PALETTE_CAPACITY,
                        "2D palette overflow: more than {PALETTE_CAPACITY} live values"
                    );
                    // The recompaction may have moved the value we are
                    // about to overwrite; the lookup is rebuilt, so retry.
                    if let Some(index) = self.lookup.get(&value) {
                        *index
                    } else {
                        self.push_entry(value)
                    }
                } else {
                    self.push_entry(value)
                }
            }
        };
        self.indices.set(flat, index);
    }

    fn push_entry(&mut self, value: V) -> u32 {
        let index = self.entries.len() as u32;
        self.entries.push(value);
        self.lookup.insert(value, index);
        index
    }

    /// Rebuild the palette keeping only values still referenced by the
    /// grid, reassigning indices in first-reference order.
    fn recompact(&mut self) {
        let mut entries = Vec::new();
        let mut lookup = HashMap::new();
        let mut indices = BitFieldArray::new(INDEX_BITS, GRID_CELLS);
        for flat in 0..GRID_CELLS {
            let value = self.entries[self.indices.get(flat) as usize];
            let index = match lookup.get(&value) {
                Some(index) => *index,
                None => {
                    let index = entries.len() as u32;
                    entries.push(value);
                    lookup.insert(value, index);
                    index
                }
            };
            indices.set(flat, index);
        }
        self.entries = entries;
        self.lookup = lookup;
        self.indices = indices;
    }

    /// Serialize to the little-endian wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(2 + self.entries.len() * V::WIDTH + 4 + PACKED_BYTES);
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for entry in &self.entries {
            entry.write_le(&mut out);
        }
        out.extend_from_slice(&(PACKED_BYTES as u32).to_le_bytes());
        out.extend_from_slice(self.indices.as_bytes());
        out
    }

    /// Parse a palette from the start of `bytes`, returning it together
    /// with the number of bytes consumed.
    pub fn read_from(bytes: &[u8]) -> Result<(Self, usize), Palette2dCodecError> {
        let mut cursor = 0usize;

        let count = u16::from_le_bytes(take(bytes, &mut cursor, 2)?.try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut lookup = HashMap::new();
        for _ in 0..count {
            let value = V::read_le(take(bytes, &mut cursor, V::WIDTH)?);
            lookup.entry(value).or_insert(entries.len() as u32);
            entries.push(value);
        }

        let packed_len =
            u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap()) as usize;
        if packed_len != PACKED_BYTES {
            return Err(Palette2dCodecError::PackedLengthMismatch {
                expected: PACKED_BYTES,
                actual: packed_len,
            });
        }
        let packed = take(bytes, &mut cursor, packed_len)?.to_vec();
        let indices = BitFieldArray::from_bytes(INDEX_BITS, GRID_CELLS, packed);

        for flat in 0..GRID_CELLS {
            let index = indices.get(flat);
            if index as usize >= entries.len() {
                return Err(Palette2dCodecError::IndexOutOfRange {
                    index,
                    palette_len: entries.len(),
                });
            }
        }

        Ok((Self { entries, lookup, indices }, cursor))
    }

    /// Parse a palette that spans the whole of `bytes`.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Palette2dCodecError> {
        let (palette, consumed) = Self::read_from(bytes)?;
        if consumed != bytes.len() {
            return Err(Palette2dCodecError::TrailingBytes {
                count: bytes.len() - consumed,
            });
        }
        Ok(palette)
    }
}

/// The per-column block data of a chunk: physics flag, heightmap, and
/// biome tints, in their little-endian wire order.
#[derive(Clone, Debug)]
pub struct BlockChunkData {
    pub needs_physics: bool,
    pub heights: HeightPalette,
    pub tints: TintPalette,
}

impl BlockChunkData {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![u8::from(self.needs_physics)];
        out.extend_from_slice(&self.heights.serialize());
        out.extend_from_slice(&self.tints.serialize());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Palette2dCodecError> {
        if bytes.is_empty() {
            return Err(Palette2dCodecError::Truncated { needed: 1, available: 0 });
        }
        let needs_physics = bytes[0] != 0;
        let mut cursor = 1usize;
        let (heights, consumed) = HeightPalette::read_from(&bytes[cursor..])?;
        cursor += consumed;
        let (tints, consumed) = TintPalette::read_from(&bytes[cursor..])?;
        cursor += consumed;
        if cursor != bytes.len() {
            return Err(Palette2dCodecError::TrailingBytes {
                count: bytes.len() - cursor,
            });
        }
        Ok(Self { needs_physics, heights, tints })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_heights_round_trip() {
        let heights: Vec<u16> = (0..GRID_CELLS)
            .map(|i| {
                let (x, z) = (i % GRID_DIM, i / GRID_DIM);
                match (x + z) % 3 {
                    0 => 60,
                    1 => 64,
                    _ => 72,
                }
            })
            .collect();
        let palette = HeightPalette::from_cells(&heights);
        assert_eq!(palette.palette_len(), 3);

        let bytes = palette.serialize();
        // count + 3 entries + packed_len + 1280 packed bytes
        assert_eq!(bytes.len(), 2 + 3 * 2 + 4 + PACKED_BYTES);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 3);
        let packed_len_at = 2 + 3 * 2;
        assert_eq!(
            u32::from_le_bytes(bytes[packed_len_at..packed_len_at + 4].try_into().unwrap()),
            PACKED_BYTES as u32
        );

        let decoded = HeightPalette::deserialize(&bytes).expect("decode heights");
        for z in 0..GRID_DIM {
            for x in 0..GRID_DIM {
                assert_eq!(decoded.get(x, z), heights[x + GRID_DIM * z]);
            }
        }
    }

    #[test]
    fn tint_entries_are_packed_rgb() {
        let mut palette = TintPalette::filled(pack_tint(0, 0, 0));
        palette.set(3, 7, pack_tint(0x67, 0xB6, 0x2D));
        let bytes = palette.serialize();
        let decoded = TintPalette::deserialize(&bytes).expect("decode tints");
        assert_eq!(unpack_tint(decoded.get(3, 7)), (0x67, 0xB6, 0x2D));
        assert_eq!(unpack_tint(decoded.get(0, 0)), (0, 0, 0));
    }

    #[test]
    fn stale_entries_are_dropped_on_recompaction() {
        let mut palette = HeightPalette::filled(0);
        // Churn a single cell through many values; only the last survives
        // as a live reference.
        for value in 1..1023u16 {
            palette.set(5, 5, value);
        }
        assert_eq!(palette.palette_len(), 1023);
        // The next two fresh values hit capacity and trigger recompaction
        // down to {0, 1022} before growing again.
        palette.set(6, 5, 2000);
        palette.set(7, 5, 2001);
        assert!(palette.palette_len() <= 4);
        assert_eq!(palette.get(5, 5), 1022);
        assert_eq!(palette.get(6, 5), 2000);
        assert_eq!(palette.get(7, 5), 2001);
        assert_eq!(palette.get(0, 0), 0);
    }

    #[test]
    fn rejects_bad_packed_length() {
        let mut bytes = HeightPalette::filled(9).serialize();
        // Corrupt the packed_len field.
        bytes[4] = 0xFF;
        let err = HeightPalette::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, Palette2dCodecError::PackedLengthMismatch { .. }));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut bytes = HeightPalette::filled(9).serialize();
        // One palette entry, so any non-zero packed index is invalid.
        let packed_start = 2 + 2 + 4;
        bytes[packed_start] = 0x01;
        let err = HeightPalette::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, Palette2dCodecError::IndexOutOfRange { .. }));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = HeightPalette::filled(9).serialize();
        bytes.push(0);
        let err = HeightPalette::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, Palette2dCodecError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn block_chunk_data_round_trips() {
        let mut heights = HeightPalette::filled(64);
        heights.set(0, 0, 72);
        let mut tints = TintPalette::filled(pack_tint(0x22, 0x8B, 0x22));
        tints.set(31, 31, pack_tint(0xEE, 0xD6, 0xAF));
        let data = BlockChunkData { needs_physics: true, heights, tints };

        let decoded = BlockChunkData::deserialize(&data.serialize()).expect("decode column");
        assert!(decoded.needs_physics);
        assert_eq!(decoded.heights.get(0, 0), 72);
        assert_eq!(decoded.heights.get(1, 0), 64);
        assert_eq!(decoded.tints.get(31, 31), pack_tint(0xEE, 0xD6, 0xAF));
    }
}
