//! Storage for Hytale-style voxel worlds: the indexed region file that
//! packs compressed chunk blobs into fixed-size segments, and the palette
//! codecs for the block sections and 2D layers those blobs contain.
//!
//! The region file ([`RegionFile`]) owns the on-disk layout and the
//! concurrency discipline: a memory-mapped index of `blobCount` slots over
//! a contiguous segment heap, with per-slot optimistic locking so readers
//! stay lock-free while disjoint writers run in parallel. Chunk payloads
//! decode through [`BlockSection`] (32x32x32 voxels, big-endian framing)
//! and [`Palette2d`] (32x32 heightmap/tint layers, little-endian framing).
//! Version-0 files with chained segments are migrated in place on open.

pub mod bitfield;
pub mod coords;
mod migration;
pub mod palette2d;
pub mod region;
pub mod section;
mod stamped;

pub use bitfield::BitFieldArray;
pub use palette2d::{BlockChunkData, HeightPalette, Palette2d, TintPalette};
pub use region::{OpenMode, RegionFile, RegionOptions};
pub use section::{BlockSection, PaletteKind};
