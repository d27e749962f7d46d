use std::convert::TryInto;

use crate::read_le16;
use crate::read_le32;

pub const HEADER_LEN: usize = 512;
pub const SUPERBLOCK_LEN: usize = 332;
pub const DESCRIPTOR_LEN: usize = 32;

/// "WFS0.4" / "WFS0.5"
pub const HEADER_SIGNATURES: [&[u8; 6]; 2] = [b"WFS0.4", b"WFS0.5"];
/// "XM"
pub const HEADER_END_MARKER: [u8; 2] = *b"XM";
/// On disk: DE BC 9A 78.
pub const SUPERBLOCK_TRAILER: u32 = 0x789a_bcde;

/// Continuation of a video stream.
pub const TAG_SECONDARY: u8 = 0x01;
/// Head of a video stream; both values occur in the wild.
pub const TAG_MAIN: u8 = 0x02;
pub const TAG_MAIN_ALT: u8 = 0x03;
/// A slot that was formatted but never written.
pub const TAG_RESERVED: u8 = 0xfe;

pub struct RawHeader {
    /* Filesystem signature */
    pub signature: [u8; 6],
    /* End-of-header marker; 504 bytes of zero padding sit in between */
    pub end_marker: [u8; 2],
}

impl RawHeader {
    pub fn from_slice(data: &[u8]) -> Self {
        assert!(data.len() >= HEADER_LEN);
        Self {
            signature: data[0x000..0x006].try_into().expect("sliced"),
            end_marker: data[0x1fe..0x200].try_into().expect("sliced"),
        }
    }

    pub fn signature_known(&self) -> bool {
        HEADER_SIGNATURES.iter().any(|sig| **sig == self.signature)
    }
}

pub struct RawSuperblock {
    /* Timestamp of the last video written to the data area */
    pub ts_last_in_data: u32,
    /* Timestamp of the last video written by the recorder */
    pub ts_last_write: u32,
    /* Index-area slot last written by the recorder */
    pub last_written_slot: u32,
    /* First valid slot after the slots the ring will rewrite next */
    pub rewrite_slot: u32,
    /* Total number of video fragments */
    pub fragment_count: u32,
    /* Timestamp of the first fragment due for rewrite */
    pub ts_first_rewrite: u32,
    /* Timestamp of the first video in the data area */
    pub ts_first_video: u32,
    /* Disk block size in bytes */
    pub block_size: u32,
    /* Fragment size in disk blocks */
    pub fragment_blocks: u32,
    /* Number of reserved fragments */
    pub reserved_fragments: u32,
    /* Index area start, in disk blocks */
    pub index_area_start_block: u32,
    /* Data area start, in disk blocks */
    pub data_area_start_block: u32,
    /* End-of-superblock signature */
    pub trailer: u32,
}

impl RawSuperblock {
    pub fn from_slice(data: &[u8]) -> Self {
        assert!(data.len() >= SUPERBLOCK_LEN);
        Self {
            // 0x00..0x10: zero padding and two reserved words
            ts_last_in_data: read_le32(&data[0x10..]),
            ts_last_write: read_le32(&data[0x14..]),
            last_written_slot: read_le32(&data[0x18..]),
            rewrite_slot: read_le32(&data[0x1c..]),
            fragment_count: read_le32(&data[0x20..]),
            ts_first_rewrite: read_le32(&data[0x24..]),
            ts_first_video: read_le32(&data[0x28..]),
            block_size: read_le32(&data[0x2c..]),
            fragment_blocks: read_le32(&data[0x30..]),
            // 0x34: reserved
            reserved_fragments: read_le32(&data[0x38..]),
            // 0x3c..0x44: reserved
            index_area_start_block: read_le32(&data[0x44..]),
            data_area_start_block: read_le32(&data[0x48..]),
            // 0x4c..0x148: reserved
            trailer: read_le32(&data[0x148..]),
        }
    }
}

pub struct RawMainDescriptor {
    /* Descriptor type, 0x02 or 0x03 */
    pub tag: u8,
    /* Number of secondary descriptors in the chain */
    pub secondary_count: u16,
    /* Slot of the preceding descriptor; always zero in a main */
    pub prev_index: u32,
    /* Slot of the first secondary, 0xFFFFFFFF when the chain has none */
    pub next_index: u32,
    /* Stream start timestamp */
    pub ts_start: u32,
    /* Stream end timestamp */
    pub ts_end: u32,
    /* Size of the last fragment, in disk blocks */
    pub last_fragment_blocks: u16,
    /* Slot of this descriptor itself */
    pub self_index: u32,
    /* Order the stream was recorded in */
    pub record_order: u8,
    /* Camera byte, 0x02 + 0x04 per camera */
    pub camera_raw: u8,
}

impl RawMainDescriptor {
    pub fn from_slice(data: &[u8]) -> Self {
        assert!(data.len() >= DESCRIPTOR_LEN);
        Self {
            // 0x00: zero padding
            tag: data[0x01],
            secondary_count: read_le16(&data[0x02..]),
            prev_index: read_le32(&data[0x04..]),
            next_index: read_le32(&data[0x08..]),
            ts_start: read_le32(&data[0x0c..]),
            ts_end: read_le32(&data[0x10..]),
            // 0x14: reserved
            last_fragment_blocks: read_le16(&data[0x16..]),
            self_index: read_le32(&data[0x18..]),
            // 0x1c: reserved
            record_order: data[0x1e],
            camera_raw: data[0x1f],
        }
    }
}

pub struct RawSecondaryDescriptor {
    /* Descriptor type, 0x01 */
    pub tag: u8,
    /* Position of this fragment within the chain, one-based */
    pub relative_order: u16,
    /* Slot of the preceding descriptor; the main for the first secondary */
    pub prev_index: u32,
    /* Slot of the next descriptor; zero in the last one */
    pub next_index: u32,
    /* Fragment start timestamp */
    pub ts_start: u32,
    /* Fragment end timestamp */
    pub ts_end: u32,
    /* Size of the last fragment, in disk blocks; zero mid-chain */
    pub last_fragment_blocks: u16,
    /* Slot of the owning main descriptor */
    pub main_index: u32,
    /* Zero in secondaries */
    pub record_order: u8,
    /* Camera byte, 0x02 + 0x04 per camera */
    pub camera_raw: u8,
}

impl RawSecondaryDescriptor {
    pub fn from_slice(data: &[u8]) -> Self {
        assert!(data.len() >= DESCRIPTOR_LEN);
        Self {
            // 0x00: zero padding
            tag: data[0x01],
            relative_order: read_le16(&data[0x02..]),
            prev_index: read_le32(&data[0x04..]),
            next_index: read_le32(&data[0x08..]),
            ts_start: read_le32(&data[0x0c..]),
            ts_end: read_le32(&data[0x10..]),
            // 0x14: reserved
            last_fragment_blocks: read_le16(&data[0x16..]),
            main_index: read_le32(&data[0x18..]),
            // 0x1c: reserved
            record_order: data[0x1e],
            camera_raw: data[0x1f],
        }
    }
}
