use anyhow::ensure;
use anyhow::Error;

use crate::raw::RawSuperblock;
use crate::unsupported_geometry;
use crate::Timestamp;
use crate::DESCRIPTOR_SIZE;

/// Everything derived from the superblock's logical values: sizes and
/// absolute byte offsets of the index and data areas, plus the superblock's
/// own timestamps and write positions. Immutable once computed.
///
/// All products are taken in 64 bits; on realistic disks
/// `fragment_bytes * fragment_count` does not fit a `u32`.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Disk block size in bytes, typically 512.
    pub block_size: u32,
    /// Fragment size in disk blocks.
    pub fragment_blocks: u32,
    /// Number of fragments (and of index-area slots).
    pub fragment_count: u32,
    /// Leading fragments reserved by the recorder.
    pub reserved_fragments: u32,

    pub fragment_bytes: u64,
    pub total_fragment_bytes: u64,
    pub reserved_fragment_bytes: u64,
    pub used_fragment_bytes: u64,

    pub index_area_start_block: u32,
    pub index_area_offset: u64,
    pub index_area_total_bytes: u64,
    pub index_area_reserved_bytes: u64,
    pub index_area_used_bytes: u64,
    /// One past the last slot.
    pub index_area_end: u64,
    /// First slot past the reserved run.
    pub index_area_first_usable: u64,

    pub data_area_start_block: u32,
    pub data_area_offset: u64,
    /// First fragment past the reserved run.
    pub data_area_first_usable: u64,
    /// One past the last fragment.
    pub data_area_end: u64,

    /// Index-area slot last written by the recorder.
    pub last_written_slot: u32,
    /// First valid slot after the slots the ring will rewrite next.
    pub rewrite_slot: u32,

    pub ts_last_in_data: Timestamp,
    pub ts_last_write: Timestamp,
    pub ts_first_rewrite: Timestamp,
    pub ts_first_video: Timestamp,
}

impl Geometry {
    pub(crate) fn from_superblock(sb: &RawSuperblock) -> Result<Geometry, Error> {
        let block_size = u64::from(sb.block_size);

        let fragment_bytes = u64::from(sb.fragment_blocks) * block_size;
        let total_fragment_bytes = fragment_bytes * u64::from(sb.fragment_count);
        let reserved_fragment_bytes = fragment_bytes * u64::from(sb.reserved_fragments);

        let index_area_offset = block_size * u64::from(sb.index_area_start_block);
        let index_area_total_bytes = DESCRIPTOR_SIZE * u64::from(sb.fragment_count);
        ensure!(
            index_area_total_bytes <= u64::from(u32::MAX),
            unsupported_geometry(format!(
                "index area of {} bytes does not fit a single read",
                index_area_total_bytes
            ))
        );
        let index_area_reserved_bytes = DESCRIPTOR_SIZE * u64::from(sb.reserved_fragments);

        let data_area_offset = block_size * u64::from(sb.data_area_start_block);

        Ok(Geometry {
            block_size: sb.block_size,
            fragment_blocks: sb.fragment_blocks,
            fragment_count: sb.fragment_count,
            reserved_fragments: sb.reserved_fragments,
            fragment_bytes,
            total_fragment_bytes,
            reserved_fragment_bytes,
            used_fragment_bytes: total_fragment_bytes - reserved_fragment_bytes,
            index_area_start_block: sb.index_area_start_block,
            index_area_offset,
            index_area_total_bytes,
            index_area_reserved_bytes,
            index_area_used_bytes: index_area_total_bytes - index_area_reserved_bytes,
            index_area_end: index_area_offset + index_area_total_bytes,
            index_area_first_usable: index_area_offset + index_area_reserved_bytes,
            data_area_start_block: sb.data_area_start_block,
            data_area_offset,
            data_area_first_usable: data_area_offset + reserved_fragment_bytes,
            data_area_end: data_area_offset + total_fragment_bytes,
            last_written_slot: sb.last_written_slot,
            rewrite_slot: sb.rewrite_slot,
            ts_last_in_data: Timestamp::from_raw(sb.ts_last_in_data),
            ts_last_write: Timestamp::from_raw(sb.ts_last_write),
            ts_first_rewrite: Timestamp::from_raw(sb.ts_first_rewrite),
            ts_first_video: Timestamp::from_raw(sb.ts_first_video),
        })
    }

    /// Absolute offset of an index-area slot.
    pub fn descriptor_offset(&self, slot: u32) -> u64 {
        self.index_area_offset + u64::from(slot) * DESCRIPTOR_SIZE
    }

    /// Absolute offset of a fragment in the data area.
    pub fn fragment_offset(&self, slot: u32) -> u64 {
        self.data_area_offset + u64::from(slot) * self.fragment_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::Geometry;
    use crate::raw::RawSuperblock;
    use crate::WfsError;

    fn superblock() -> RawSuperblock {
        RawSuperblock {
            ts_last_in_data: 0,
            ts_last_write: 0,
            last_written_slot: 3,
            rewrite_slot: 0,
            fragment_count: 4,
            ts_first_rewrite: 0,
            ts_first_video: 0,
            block_size: 512,
            fragment_blocks: 2,
            reserved_fragments: 1,
            index_area_start_block: 12,
            data_area_start_block: 20,
            trailer: crate::raw::SUPERBLOCK_TRAILER,
        }
    }

    #[test]
    fn small_volume() {
        let geometry = Geometry::from_superblock(&superblock()).unwrap();
        assert_eq!(1024, geometry.fragment_bytes);
        assert_eq!(4096, geometry.total_fragment_bytes);
        assert_eq!(1024, geometry.reserved_fragment_bytes);
        assert_eq!(3072, geometry.used_fragment_bytes);
        assert_eq!(0x1800, geometry.index_area_offset);
        assert_eq!(128, geometry.index_area_total_bytes);
        assert_eq!(0x1880, geometry.index_area_end);
        assert_eq!(0x2800, geometry.data_area_offset);
        assert_eq!(0x2800 + 1024, geometry.data_area_first_usable);
        assert_eq!(0x1800 + 2 * 32, geometry.descriptor_offset(2));
        assert_eq!(0x2800 + 3 * 1024, geometry.fragment_offset(3));
    }

    #[test]
    fn giant_index_area_rejected() {
        let mut sb = superblock();
        // 2^27 slots of 32 bytes is exactly 4 GiB of index area
        sb.fragment_count = 1 << 27;
        let err = Geometry::from_superblock(&sb).unwrap_err();
        match err.downcast_ref::<WfsError>() {
            Some(WfsError::UnsupportedGeometry { .. }) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn products_are_64_bit() {
        let mut sb = superblock();
        // 2 TB data area: 2048-block fragments, 2^21 of them
        sb.fragment_blocks = 2048;
        sb.fragment_count = 1 << 21;
        sb.reserved_fragments = 0;
        let geometry = Geometry::from_superblock(&sb).unwrap();
        assert_eq!(1 << 20, geometry.fragment_bytes);
        assert_eq!(1u64 << 41, geometry.total_fragment_bytes);
    }
}
