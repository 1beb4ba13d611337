//! Block-section palette codec: a 32x32x32 voxel grid whose cells name
//! blocks through a small dictionary.
//!
//! Wire layout (big-endian framing throughout):
//! `migrationCount:u32 | paletteType:u8 | paletteSize:u16`, then
//! `paletteSize` entries of `internalId | nameLen:u16 | name | count:u16`
//! (the ID is one byte, except two big-endian bytes under the Short type),
//! then the voxel array at the width fixed by the palette type.
//!
//! The voxel array stores internal IDs directly at that width; lookup is a
//! plain array read, never a bit-packed decode. The palette type is kept
//! minimal: inserts promote to the next width when the dictionary outgrows
//! the current one, and [`BlockSection::compact`] garbage-collects the
//! dictionary and demotes once the live set shrinks far enough below a
//! tier boundary to not flutter back.

use std::collections::HashMap;
use std::fmt;

/// Section edge length in voxels.
pub const SECTION_DIM: usize = 32;
/// Voxels per section.
pub const SECTION_VOLUME: usize = SECTION_DIM * SECTION_DIM * SECTION_DIM;
/// The block name that denotes air / absence.
pub const AIR: &str = "Empty";

// Demotion triggers sit two below the tier capacity.
const BYTE_DEMOTION_MAX: usize = 14;
const SHORT_DEMOTION_MAX: usize = 254;

/// Flat voxel index: Y-major, then Z, then X.
#[inline]
pub fn flat_index(x: usize, y: usize, z: usize) -> usize {
    ((y & 31) << 10) | ((z & 31) << 5) | (x & 31)
}

/// Storage shape of a section's voxel array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaletteKind {
    /// No voxel array; the section is uniformly the single (air) entry.
    Empty,
    /// Four bits per voxel, low nibble at even flat indices.
    HalfByte,
    /// One byte per voxel.
    Byte,
    /// Two big-endian bytes per voxel.
    Short,
}

impl PaletteKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::HalfByte => 1,
            Self::Byte => 2,
            Self::Short => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Empty),
            1 => Some(Self::HalfByte),
            2 => Some(Self::Byte),
            3 => Some(Self::Short),
            _ => None,
        }
    }

    /// Serialized voxel-array size in bytes.
    pub fn voxel_bytes(self) -> usize {
        match self {
            Self::Empty => 0,
            Self::HalfByte => SECTION_VOLUME / 2,
            Self::Byte => SECTION_VOLUME,
            Self::Short => SECTION_VOLUME * 2,
        }
    }

    /// Number of distinct internal IDs this shape can represent.
    pub fn capacity(self) -> usize {
        match self {
            Self::Empty => 1,
            Self::HalfByte => 16,
            Self::Byte => 256,
            Self::Short => 65536,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionCodecError {
    Truncated { needed: usize, available: usize },
    UnknownPaletteKind(u8),
    EmptyPaletteSize(usize),
    DuplicatePaletteId(u16),
    InvalidName(std::str::Utf8Error),
    TrailingBytes { count: usize },
}

impl fmt::Display for SectionCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "section truncated: needed {needed} bytes, {available} available")
            }
            Self::UnknownPaletteKind(tag) => write!(f, "unknown palette type tag {tag}"),
            Self::EmptyPaletteSize(size) => write!(
                f,
                "empty palette type requires exactly one (air) entry, got {size}"
            ),
            Self::DuplicatePaletteId(id) => write!(f, "duplicate palette entry id {id}"),
            Self::InvalidName(error) => write!(f, "palette entry name is not UTF-8: {error}"),
            Self::TrailingBytes { count } => {
                write!(f, "{count} trailing bytes after section payload")
            }
        }
    }
}

impl std::error::Error for SectionCodecError {}

#[derive(Clone, Debug)]
struct PaletteEntry {
    id: u16,
    name: String,
    count: u16,
}

#[derive(Clone, Debug)]
enum Voxels {
    Empty,
    HalfByte(Vec<u8>),
    Byte(Vec<u8>),
    Short(Vec<u16>),
}

/// A decoded block section.
#[derive(Clone, Debug)]
pub struct BlockSection {
    migration_count: u32,
    entries: Vec<PaletteEntry>,
    by_id: HashMap<u16, usize>,
    by_name: HashMap<String, u16>,
    voxels: Voxels,
}

impl Default for BlockSection {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockSection {
    /// A fresh all-air section.
    pub fn new() -> Self {
        let mut section = Self {
            migration_count: 0,
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            voxels: Voxels::Empty,
        };
        section.push_entry(0, AIR.to_string(), 0);
        section
    }

    pub fn kind(&self) -> PaletteKind {
        match self.voxels {
            Voxels::Empty => PaletteKind::Empty,
            Voxels::HalfByte(_) => PaletteKind::HalfByte,
            Voxels::Byte(_) => PaletteKind::Byte,
            Voxels::Short(_) => PaletteKind::Short,
        }
    }

    pub fn migration_count(&self) -> u32 {
        self.migration_count
    }

    pub fn palette_len(&self) -> usize {
        self.entries.len()
    }

    fn push_entry(&mut self, id: u16, name: String, count: u16) {
        self.by_id.insert(id, self.entries.len());
        self.by_name.insert(name.clone(), id);
        self.entries.push(PaletteEntry { id, name, count });
    }

    fn raw_id(&self, flat: usize) -> u16 {
        match &self.voxels {
            Voxels::Empty => self.entries.first().map(|entry| entry.id).unwrap_or(0),
            Voxels::HalfByte(data) => {
                let byte = data[flat / 2];
                if flat % 2 == 0 {
                    u16::from(byte & 0x0F)
                } else {
                    u16::from(byte >> 4)
                }
            }
            Voxels::Byte(data) => u16::from(data[flat]),
            Voxels::Short(data) => data[flat],
        }
    }

    fn write_id(&mut self, flat: usize, id: u16) {
        match &mut self.voxels {
            Voxels::Empty => unreachable!("empty sections have no voxel array"),
            Voxels::HalfByte(data) => {
                let byte = &mut data[flat / 2];
                if flat % 2 == 0 {
                    *byte = (*byte & 0xF0) | (id as u8 & 0x0F);
                } else {
                    *byte = (*byte & 0x0F) | ((id as u8 & 0x0F) << 4);
                }
            }
            Voxels::Byte(data) => data[flat] = id as u8,
            Voxels::Short(data) => data[flat] = id,
        }
    }

    /// Name of the block at `(x, y, z)`. Coordinates are masked to the
    /// section, matching the flat-index formula. IDs without a palette
    /// entry read as air.
    pub fn get(&self, x: usize, y: usize, z: usize) -> &str {
        match &self.voxels {
            Voxels::Empty => self
                .entries
                .first()
                .map(|entry| entry.name.as_str())
                .unwrap_or(AIR),
            _ => {
                let id = self.raw_id(flat_index(x, y, z));
                self.by_id
                    .get(&id)
                    .map(|&slot| self.entries[slot].name.as_str())
                    .unwrap_or(AIR)
            }
        }
    }

    /// Place `name` at `(x, y, z)`, growing the palette and promoting the
    /// storage shape as needed.
    pub fn set(&mut self, x: usize, y: usize, z: usize, name: &str) {
        let id = self.ensure_entry(name);
        if matches!(self.voxels, Voxels::Empty) {
            // Writing the sole entry of an Empty section changes nothing.
            return;
        }
        let flat = flat_index(x, y, z);
        let old = self.raw_id(flat);
        if old == id {
            return;
        }
        self.write_id(flat, id);
        if let Some(&slot) = self.by_id.get(&old) {
            self.entries[slot].count = self.entries[slot].count.saturating_sub(1);
        }
        if let Some(&slot) = self.by_id.get(&id) {
            self.entries[slot].count = self.entries[slot].count.saturating_add(1);
        }
    }

    /// Look up `name`, interning it with a fresh internal ID if absent.
    fn ensure_entry(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        assert!(
            self.entries.len() < u16::MAX as usize,
            "section palette exhausted"
        );
        let needed = self.entries.len() + 1;
        if needed > self.kind().capacity() {
            self.promote(self.promotion_target(needed));
        }
        let id = self.lowest_free_id();
        self.push_entry(id, name.to_string(), 0);
        id
    }

    fn lowest_free_id(&self) -> u16 {
        (0..=u16::MAX)
            .find(|id| !self.by_id.contains_key(id))
            .expect("section palette exhausted")
    }

    /// Smallest shape that holds `needed` entries and can represent every
    /// ID already in the palette.
    fn promotion_target(&self, needed: usize) -> PaletteKind {
        let max_id = self
            .entries
            .iter()
            .map(|entry| usize::from(entry.id))
            .max()
            .unwrap_or(0);
        for kind in [PaletteKind::HalfByte, PaletteKind::Byte, PaletteKind::Short] {
            if kind.capacity() >= needed && max_id < kind.capacity() {
                return kind;
            }
        }
        panic!("section palette overflow: {needed} entries");
    }

    fn promote(&mut self, target: PaletteKind) {
        let fill = self.entries.first().map(|entry| entry.id).unwrap_or(0);
        self.voxels = match (&self.voxels, target) {
            (Voxels::Empty, PaletteKind::HalfByte) => {
                let nibble = fill as u8 & 0x0F;
                Voxels::HalfByte(vec![(nibble << 4) | nibble; SECTION_VOLUME / 2])
            }
            (Voxels::Empty, PaletteKind::Byte) => Voxels::Byte(vec![fill as u8; SECTION_VOLUME]),
            (Voxels::Empty, PaletteKind::Short) => Voxels::Short(vec![fill; SECTION_VOLUME]),
            (Voxels::HalfByte(data), PaletteKind::Byte) => {
                Voxels::Byte(expand_nibbles(data).collect())
            }
            (Voxels::HalfByte(data), PaletteKind::Short) => {
                Voxels::Short(expand_nibbles(data).map(u16::from).collect())
            }
            (Voxels::Byte(data), PaletteKind::Short) => {
                Voxels::Short(data.iter().map(|&id| u16::from(id)).collect())
            }
            (_, target) => unreachable!("promotion to {target:?} from {:?}", self.kind()),
        };
    }

    /// Drop palette entries no voxel references, reassign IDs densely, and
    /// demote the storage shape once the live set is comfortably below a
    /// tier boundary.
    pub fn compact(&mut self) {
        if matches!(self.voxels, Voxels::Empty) {
            return;
        }

        let mut live_counts: HashMap<u16, u32> = HashMap::new();
        for flat in 0..SECTION_VOLUME {
            *live_counts.entry(self.raw_id(flat)).or_default() += 1;
        }

        // IDs with no palette entry read as air; fold them into a real air
        // entry so the rewrite below can express them.
        let orphaned: u32 = live_counts
            .iter()
            .filter(|(id, _)| !self.by_id.contains_key(id))
            .map(|(_, count)| *count)
            .sum();

        // Retained entries keep their relative order; `old_id` is None for
        // an air entry synthesized to absorb orphaned IDs.
        let mut retained: Vec<(Option<u16>, String, u32)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let count = live_counts.get(&entry.id).copied().unwrap_or(0);
                let count = if entry.name == AIR { count + orphaned } else { count };
                (count > 0).then(|| (Some(entry.id), entry.name.clone(), count))
            })
            .collect();
        if orphaned > 0 && !retained.iter().any(|(_, name, _)| name == AIR) {
            retained.push((None, AIR.to_string(), orphaned));
        }

        let air_only = retained.len() == 1 && retained[0].1 == AIR;
        let target = if air_only {
            PaletteKind::Empty
        } else {
            demoted_kind(self.kind(), retained.len())
        };

        // Dense reassignment in retained order.
        let remap: HashMap<u16, u16> = retained
            .iter()
            .enumerate()
            .filter_map(|(new_id, (old_id, _, _))| old_id.map(|old| (old, new_id as u16)))
            .collect();
        let air_new_id = retained
            .iter()
            .position(|(_, name, _)| name == AIR)
            .map(|slot| slot as u16);

        let voxels = if target == PaletteKind::Empty {
            Voxels::Empty
        } else {
            let mut rewritten = match target {
                PaletteKind::HalfByte => Voxels::HalfByte(vec![0u8; SECTION_VOLUME / 2]),
                PaletteKind::Byte => Voxels::Byte(vec![0u8; SECTION_VOLUME]),
                PaletteKind::Short => Voxels::Short(vec![0u16; SECTION_VOLUME]),
                PaletteKind::Empty => unreachable!(),
            };
            for flat in 0..SECTION_VOLUME {
                let old = self.raw_id(flat);
                let new = remap
                    .get(&old)
                    .copied()
                    .or(air_new_id)
                    .expect("every live id maps into the retained palette");
                write_raw(&mut rewritten, flat, new);
            }
            rewritten
        };

        self.entries.clear();
        self.by_id.clear();
        self.by_name.clear();
        self.voxels = voxels;
        for (new_id, (_, name, count)) in retained.into_iter().enumerate() {
            let count = count.min(u32::from(u16::MAX)) as u16;
            self.push_entry(new_id as u16, name, count);
        }
    }

    /// Serialize to the big-endian wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let kind = self.kind();
        let mut out = Vec::with_capacity(7 + self.entries.len() * 12 + kind.voxel_bytes());
        out.extend_from_slice(&self.migration_count.to_be_bytes());
        out.push(kind.tag());
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for entry in &self.entries {
            if kind == PaletteKind::Short {
                out.extend_from_slice(&entry.id.to_be_bytes());
            } else {
                out.push(entry.id as u8);
            }
            assert!(entry.name.len() <= u16::MAX as usize, "block name too long");
            out.extend_from_slice(&(entry.name.len() as u16).to_be_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&entry.count.to_be_bytes());
        }
        match &self.voxels {
            Voxels::Empty => {}
            Voxels::HalfByte(data) | Voxels::Byte(data) => out.extend_from_slice(data),
            Voxels::Short(data) => {
                for id in data {
                    out.extend_from_slice(&id.to_be_bytes());
                }
            }
        }
        out
    }

    /// Decode a section payload. The slice must contain exactly one
    /// section.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, SectionCodecError> {
        let mut cursor = 0usize;

        let migration_count =
            u32::from_be_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap());
        let tag = take(bytes, &mut cursor, 1)?[0];
        let kind = PaletteKind::from_tag(tag).ok_or(SectionCodecError::UnknownPaletteKind(tag))?;
        let palette_size =
            u16::from_be_bytes(take(bytes, &mut cursor, 2)?.try_into().unwrap()) as usize;
        if kind == PaletteKind::Empty && palette_size != 1 {
            return Err(SectionCodecError::EmptyPaletteSize(palette_size));
        }

        let mut section = Self {
            migration_count,
            entries: Vec::with_capacity(palette_size),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            voxels: Voxels::Empty,
        };
        for _ in 0..palette_size {
            let id = if kind == PaletteKind::Short {
                u16::from_be_bytes(take(bytes, &mut cursor, 2)?.try_into().unwrap())
            } else {
                u16::from(take(bytes, &mut cursor, 1)?[0])
            };
            let name_len =
                u16::from_be_bytes(take(bytes, &mut cursor, 2)?.try_into().unwrap()) as usize;
            let name = std::str::from_utf8(take(bytes, &mut cursor, name_len)?)
                .map_err(SectionCodecError::InvalidName)?
                .to_string();
            let count = u16::from_be_bytes(take(bytes, &mut cursor, 2)?.try_into().unwrap());
            if section.by_id.contains_key(&id) {
                return Err(SectionCodecError::DuplicatePaletteId(id));
            }
            section.push_entry(id, name, count);
        }

        let voxel_bytes = take(bytes, &mut cursor, kind.voxel_bytes())?;
        section.voxels = match kind {
            PaletteKind::Empty => Voxels::Empty,
            PaletteKind::HalfByte => Voxels::HalfByte(voxel_bytes.to_vec()),
            PaletteKind::Byte => Voxels::Byte(voxel_bytes.to_vec()),
            PaletteKind::Short => Voxels::Short(
                voxel_bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            ),
        };

        if cursor != bytes.len() {
            return Err(SectionCodecError::TrailingBytes {
                count: bytes.len() - cursor,
            });
        }
        Ok(section)
    }
}

fn expand_nibbles(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    data.iter().flat_map(|byte| [byte & 0x0F, byte >> 4])
}

fn write_raw(voxels: &mut Voxels, flat: usize, id: u16) {
    match voxels {
        Voxels::Empty => unreachable!("empty sections have no voxel array"),
        Voxels::HalfByte(data) => {
            let byte = &mut data[flat / 2];
            if flat % 2 == 0 {
                *byte = (*byte & 0xF0) | (id as u8 & 0x0F);
            } else {
                *byte = (*byte & 0x0F) | ((id as u8 & 0x0F) << 4);
            }
        }
        Voxels::Byte(data) => data[flat] = id as u8,
        Voxels::Short(data) => data[flat] = id,
    }
}

fn demoted_kind(current: PaletteKind, live: usize) -> PaletteKind {
    match current {
        PaletteKind::Short if live <= BYTE_DEMOTION_MAX => PaletteKind::HalfByte,
        PaletteKind::Short if live <= SHORT_DEMOTION_MAX => PaletteKind::Byte,
        PaletteKind::Byte if live <= BYTE_DEMOTION_MAX => PaletteKind::HalfByte,
        _ => current,
    }
}

fn take<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    n: usize,
) -> Result<&'a [u8], SectionCodecError> {
    let start = *cursor;
    let end = start
        .checked_add(n)
        .filter(|end| *end <= bytes.len())
        .ok_or(SectionCodecError::Truncated {
            needed: n,
            available: bytes.len() - start,
        })?;
    *cursor = end;
    Ok(&bytes[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_is_y_z_x_major() {
        assert_eq!(flat_index(0, 0, 0), 0);
        assert_eq!(flat_index(31, 0, 0), 31);
        assert_eq!(flat_index(0, 0, 31), 31 << 5);
        assert_eq!(flat_index(0, 31, 0), 31 << 10);
        assert_eq!(flat_index(5, 7, 9), (7 << 10) | (9 << 5) | 5);
        // Coordinates wrap into the section.
        assert_eq!(flat_index(32, 33, 34), flat_index(0, 1, 2));
    }

    #[test]
    fn fresh_section_is_empty_air() {
        let section = BlockSection::new();
        assert_eq!(section.kind(), PaletteKind::Empty);
        assert_eq!(section.get(3, 4, 5), AIR);
        let bytes = section.serialize();
        assert_eq!(bytes[4], 0);
        // No voxel array follows the single air entry.
        assert_eq!(bytes.len(), 7 + 1 + 2 + AIR.len() + 2);
    }

    #[test]
    fn half_and_half_round_trips_as_half_byte() {
        let mut section = BlockSection::new();
        for y in 0..SECTION_DIM {
            for z in 0..SECTION_DIM {
                for x in 0..SECTION_DIM {
                    if (x + y + z) % 2 == 0 {
                        section.set(x, y, z, "Rock_Stone");
                    }
                }
            }
        }
        assert_eq!(section.kind(), PaletteKind::HalfByte);

        let bytes = section.serialize();
        assert_eq!(bytes[4], 1);
        let header_and_palette = 7 + (1 + 2 + AIR.len() + 2) + (1 + 2 + "Rock_Stone".len() + 2);
        assert_eq!(bytes.len(), header_and_palette + SECTION_VOLUME / 2);

        let decoded = BlockSection::deserialize(&bytes).expect("decode section");
        for y in 0..SECTION_DIM {
            for z in 0..SECTION_DIM {
                for x in 0..SECTION_DIM {
                    let expected = if (x + y + z) % 2 == 0 { "Rock_Stone" } else { AIR };
                    assert_eq!(decoded.get(x, y, z), expected, "({x}, {y}, {z})");
                }
            }
        }
    }

    #[test]
    fn seventeenth_name_promotes_to_byte() {
        let mut section = BlockSection::new();
        // Air plus fifteen names fill the half-byte palette exactly.
        for i in 0..15 {
            section.set(i, 0, 0, &format!("Block_{i}"));
        }
        assert_eq!(section.kind(), PaletteKind::HalfByte);
        assert_eq!(section.palette_len(), 16);

        section.set(20, 0, 0, "Block_15");
        assert_eq!(section.kind(), PaletteKind::Byte);
        assert_eq!(section.palette_len(), 17);
        assert_eq!(section.serialize()[4], 2);

        for i in 0..15 {
            assert_eq!(section.get(i, 0, 0), format!("Block_{i}"));
        }
        assert_eq!(section.get(20, 0, 0), "Block_15");
        assert_eq!(section.get(0, 13, 0), AIR);
    }

    #[test]
    fn short_palette_uses_wide_entry_ids() {
        let mut section = BlockSection::new();
        for i in 0..300usize {
            let (x, z) = (i % SECTION_DIM, (i / SECTION_DIM) % SECTION_DIM);
            let y = i / (SECTION_DIM * SECTION_DIM);
            section.set(x, y, z, &format!("Block_{i}"));
        }
        assert_eq!(section.kind(), PaletteKind::Short);

        let bytes = section.serialize();
        assert_eq!(bytes[4], 3);
        let decoded = BlockSection::deserialize(&bytes).expect("decode short section");
        assert_eq!(decoded.kind(), PaletteKind::Short);
        for i in 0..300usize {
            let (x, z) = (i % SECTION_DIM, (i / SECTION_DIM) % SECTION_DIM);
            let y = i / (SECTION_DIM * SECTION_DIM);
            assert_eq!(decoded.get(x, y, z), format!("Block_{i}"));
        }
    }

    #[test]
    fn compact_drops_dead_entries_and_demotes() {
        let mut section = BlockSection::new();
        for i in 0..20 {
            section.set(i, 0, 0, &format!("Block_{i}"));
        }
        assert_eq!(section.kind(), PaletteKind::Byte);

        // Overwrite all but three names; the dictionary still holds 21.
        for i in 3..20 {
            section.set(i, 0, 0, "Block_0");
        }
        assert_eq!(section.palette_len(), 21);

        section.compact();
        assert_eq!(section.kind(), PaletteKind::HalfByte);
        // Air, Block_0, Block_1, Block_2 survive.
        assert_eq!(section.palette_len(), 4);
        assert_eq!(section.get(0, 0, 0), "Block_0");
        assert_eq!(section.get(1, 0, 0), "Block_1");
        assert_eq!(section.get(2, 0, 0), "Block_2");
        assert_eq!(section.get(7, 0, 0), "Block_0");
        assert_eq!(section.get(0, 1, 0), AIR);
    }

    #[test]
    fn compact_collapses_all_air_to_empty() {
        let mut section = BlockSection::new();
        section.set(1, 2, 3, "Soil_Dirt");
        section.set(1, 2, 3, AIR);
        section.compact();
        assert_eq!(section.kind(), PaletteKind::Empty);
        assert_eq!(section.palette_len(), 1);
        assert_eq!(section.get(1, 2, 3), AIR);
    }

    #[test]
    fn serialize_deserialize_agree_everywhere() {
        let mut section = BlockSection::new();
        let names = ["Soil_Grass", "Soil_Dirt", "Rock_Stone", "Water"];
        for y in 0..SECTION_DIM {
            for z in 0..SECTION_DIM {
                for x in 0..SECTION_DIM {
                    if (x * 7 + y * 3 + z) % 5 != 0 {
                        section.set(x, y, z, names[(x + y + z) % names.len()]);
                    }
                }
            }
        }
        let decoded = BlockSection::deserialize(&section.serialize()).expect("decode");
        assert_eq!(decoded.kind(), section.kind());
        assert_eq!(decoded.migration_count(), section.migration_count());
        for y in 0..SECTION_DIM {
            for z in 0..SECTION_DIM {
                for x in 0..SECTION_DIM {
                    assert_eq!(decoded.get(x, y, z), section.get(x, y, z), "({x}, {y}, {z})");
                }
            }
        }
    }

    #[test]
    fn unattributed_ids_read_as_air() {
        let mut section = BlockSection::new();
        section.set(0, 0, 0, "Rock_Stone");
        let mut bytes = section.serialize();
        // Point a voxel at an id with no palette entry.
        let voxel_start = bytes.len() - SECTION_VOLUME / 2;
        bytes[voxel_start + 1] = 0x0F;
        let decoded = BlockSection::deserialize(&bytes).expect("decode");
        assert_eq!(decoded.get(2, 0, 0), AIR);
    }

    #[test]
    fn rejects_malformed_payloads() {
        let section = BlockSection::new();
        let bytes = section.serialize();

        let mut bad_tag = bytes.clone();
        bad_tag[4] = 9;
        assert!(matches!(
            BlockSection::deserialize(&bad_tag),
            Err(SectionCodecError::UnknownPaletteKind(9))
        ));

        assert!(matches!(
            BlockSection::deserialize(&bytes[..bytes.len() - 1]),
            Err(SectionCodecError::Truncated { .. })
        ));

        let mut trailing = bytes.clone();
        trailing.push(0xAA);
        assert!(matches!(
            BlockSection::deserialize(&trailing),
            Err(SectionCodecError::TrailingBytes { count: 1 })
        ));
    }
}
