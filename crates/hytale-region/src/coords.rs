//! Chunk-to-region addressing.
//!
//! A region file covers a 32x32 grid of chunk columns. Chunks map onto it
//! with floored (euclidean) arithmetic, so negative coordinates behave the
//! same way the game's own save paths do: chunk (-1, 0) lands in region
//! (-1, 0) at key 31.

/// Chunk columns per region edge.
pub const REGION_DIM_CHUNKS: i32 = 32;

/// Region coordinates containing the given chunk column.
pub fn region_coords(chunk_x: i32, chunk_z: i32) -> (i32, i32) {
    (
        chunk_x.div_euclid(REGION_DIM_CHUNKS),
        chunk_z.div_euclid(REGION_DIM_CHUNKS),
    )
}

/// Blob-index key of the chunk column inside its region file.
pub fn blob_key(chunk_x: i32, chunk_z: i32) -> u32 {
    let x = chunk_x.rem_euclid(REGION_DIM_CHUNKS);
    let z = chunk_z.rem_euclid(REGION_DIM_CHUNKS);
    (x + z * REGION_DIM_CHUNKS) as u32
}

/// File name of a region, as the game lays saves out on disk.
pub fn region_file_name(region_x: i32, region_z: i32) -> String {
    format!("{region_x}.{region_z}.region.bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_chunks_map_into_region_zero() {
        assert_eq!(region_coords(0, 0), (0, 0));
        assert_eq!(region_coords(31, 31), (0, 0));
        assert_eq!(region_coords(32, 0), (1, 0));
        assert_eq!(blob_key(0, 0), 0);
        assert_eq!(blob_key(5, 2), 5 + 2 * 32);
        assert_eq!(blob_key(31, 31), 1023);
    }

    #[test]
    fn negative_chunks_use_floored_division() {
        assert_eq!(region_coords(-1, 0), (-1, 0));
        assert_eq!(region_coords(-32, -33), (-1, -2));
        assert_eq!(blob_key(-1, 0), 31);
        assert_eq!(blob_key(-1, -1), 31 + 31 * 32);
    }

    #[test]
    fn file_names_match_save_layout() {
        assert_eq!(region_file_name(-1, 0), "-1.0.region.bin");
        assert_eq!(region_file_name(3, -7), "3.-7.region.bin");
    }
}
