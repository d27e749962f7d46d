use std::collections::BTreeMap;

use crate::camera_number;
use crate::geometry::Geometry;
use crate::note;
use crate::raw;
use crate::Anomaly;
use crate::Timestamp;

/// The on-disk "no next descriptor" sentinel. Never a slot number.
pub const NO_LINK: u32 = 0xffff_ffff;

// Zero-byte bounds worked out by reverse engineering: corruption usually
// zeroes most of a slot but leaves the tag byte alive, so the tag alone is
// not to be trusted. A live main carries at least 10 non-zero bytes, a live
// secondary at least 13.
const MAIN_MAX_ZERO_BYTES: usize = 22;
const SECONDARY_MAX_ZERO_BYTES: usize = 19;

/// A main descriptor lifted out of the index area, or synthesized for a
/// recovered chain, plus its reconstruction state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainRecord {
    /// Index-area slot this record sits in (or was synthesized for).
    pub slot: u32,
    /// Absolute offset of the descriptor itself.
    pub offset: u64,
    pub secondary_count: u16,
    /// Slot of the first secondary; [`NO_LINK`] or zero when there is none.
    pub next_index: u32,
    /// Absolute offset of the first secondary, zero when there is none.
    pub next_offset: u64,
    /// Unset on a synthesized record until the fill-in sweep bounds it.
    pub ts_start: Option<Timestamp>,
    pub ts_end: Option<Timestamp>,
    /// Size of the chain's final fragment in disk blocks, zero for "full".
    pub last_fragment_blocks: u16,
    pub record_order: u8,
    /// `None` when the camera byte was corrupt or the record synthesized.
    pub camera: Option<u8>,
    /// Linked into some chain during reconstruction.
    pub claimed: bool,
    /// The on-disk main was gone; this record was rebuilt from its orphans.
    pub synthesized: bool,
    pub(crate) raw: [u8; raw::DESCRIPTOR_LEN],
}

impl MainRecord {
    pub(crate) fn synthesized(slot: u32, offset: u64) -> MainRecord {
        MainRecord {
            slot,
            offset,
            secondary_count: 0,
            next_index: NO_LINK,
            next_offset: 0,
            ts_start: None,
            ts_end: None,
            last_fragment_blocks: 0,
            record_order: 0,
            camera: None,
            claimed: true,
            synthesized: true,
            raw: [0u8; raw::DESCRIPTOR_LEN],
        }
    }
}

/// A secondary descriptor lifted out of the index area, plus its
/// reconstruction state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryRecord {
    /// Index-area slot this record sits in.
    pub slot: u32,
    /// Absolute offset of the descriptor itself.
    pub offset: u64,
    /// Position within the chain, one-based.
    pub relative_order: u16,
    /// Slot of the preceding descriptor; the main for the first secondary.
    pub prev_index: u32,
    /// Slot of the next descriptor; zero in the last one.
    pub next_index: u32,
    pub ts_start: Timestamp,
    pub ts_end: Timestamp,
    /// Size of this fragment in disk blocks when it ends a chain, else zero.
    pub last_fragment_blocks: u16,
    /// Slot of the owning main descriptor.
    pub main_index: u32,
    pub record_order: u8,
    /// `None` when the camera byte was corrupt.
    pub camera: Option<u8>,
    /// Linked into some chain during reconstruction.
    pub claimed: bool,
    /// Adopted during recovery rather than the intact-chain walk.
    pub recovered: bool,
}

/// How the classifier binned the index area. The four buckets always sum to
/// the superblock's fragment count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorCounts {
    pub mains: u32,
    pub secondaries: u32,
    pub reserved: u32,
    pub other: u32,
}

impl DescriptorCounts {
    pub fn total(self) -> u32 {
        self.mains + self.secondaries + self.reserved + self.other
    }
}

pub(crate) struct Classified {
    pub mains: BTreeMap<u32, MainRecord>,
    pub secondaries: BTreeMap<u32, SecondaryRecord>,
    pub counts: DescriptorCounts,
    pub anomalies: Vec<Anomaly>,
}

/// Walk every slot of the index area, binning each as main, secondary,
/// reserved or other. Permissive on the tag byte, strict on the content: a
/// plausible tag over an implausible body is logged and binned as "other"
/// rather than trusted.
pub(crate) fn classify(area: &[u8], geometry: &Geometry) -> Classified {
    assert!(area.len() as u64 >= geometry.index_area_total_bytes);

    let mut mains = BTreeMap::new();
    let mut secondaries = BTreeMap::new();
    let mut counts = DescriptorCounts::default();
    let mut anomalies = Vec::new();

    for slot in 0..geometry.fragment_count {
        let start = slot as usize * raw::DESCRIPTOR_LEN;
        let data = &area[start..start + raw::DESCRIPTOR_LEN];
        let offset = geometry.descriptor_offset(slot);

        match data[1] {
            raw::TAG_MAIN | raw::TAG_MAIN_ALT => match check_main(slot, data) {
                Ok(desc) => {
                    counts.mains += 1;
                    let camera = camera_number(desc.camera_raw);
                    if camera.is_none() {
                        note(
                            &mut anomalies,
                            Some(offset),
                            format!(
                                "main descriptor in slot {} has camera byte {:#04x} below 0x02",
                                slot, desc.camera_raw
                            ),
                        );
                    }
                    let next_offset = if NO_LINK == desc.next_index {
                        0
                    } else {
                        geometry.descriptor_offset(desc.next_index)
                    };
                    let mut stored = [0u8; raw::DESCRIPTOR_LEN];
                    stored.copy_from_slice(data);
                    mains.insert(
                        slot,
                        MainRecord {
                            slot,
                            offset,
                            secondary_count: desc.secondary_count,
                            next_index: desc.next_index,
                            next_offset,
                            ts_start: Some(Timestamp::from_raw(desc.ts_start)),
                            ts_end: Some(Timestamp::from_raw(desc.ts_end)),
                            last_fragment_blocks: desc.last_fragment_blocks,
                            record_order: desc.record_order,
                            camera,
                            claimed: false,
                            synthesized: false,
                            raw: stored,
                        },
                    );
                }
                Err(reason) => {
                    counts.other += 1;
                    note(
                        &mut anomalies,
                        Some(offset),
                        format!(
                            "slot {} tagged as main descriptor but {}{}",
                            slot,
                            reason,
                            hex_lines(data)
                        ),
                    );
                }
            },
            raw::TAG_SECONDARY => match check_secondary(data) {
                Ok(desc) => {
                    counts.secondaries += 1;
                    let camera = camera_number(desc.camera_raw);
                    if camera.is_none() {
                        note(
                            &mut anomalies,
                            Some(offset),
                            format!(
                                "secondary descriptor in slot {} has camera byte {:#04x} below 0x02",
                                slot, desc.camera_raw
                            ),
                        );
                    }
                    secondaries.insert(
                        slot,
                        SecondaryRecord {
                            slot,
                            offset,
                            relative_order: desc.relative_order,
                            prev_index: desc.prev_index,
                            next_index: desc.next_index,
                            ts_start: Timestamp::from_raw(desc.ts_start),
                            ts_end: Timestamp::from_raw(desc.ts_end),
                            last_fragment_blocks: desc.last_fragment_blocks,
                            main_index: desc.main_index,
                            record_order: desc.record_order,
                            camera,
                            claimed: false,
                            recovered: false,
                        },
                    );
                }
                Err(reason) => {
                    counts.other += 1;
                    note(
                        &mut anomalies,
                        Some(offset),
                        format!(
                            "slot {} tagged as secondary descriptor but {}{}",
                            slot,
                            reason,
                            hex_lines(data)
                        ),
                    );
                }
            },
            raw::TAG_RESERVED => {
                // the tag must be the only live byte of the 32
                if 1 == non_zero_bytes(data) {
                    counts.reserved += 1;
                } else {
                    counts.other += 1;
                    note(
                        &mut anomalies,
                        Some(offset),
                        format!(
                            "slot {} tagged as reserved but has stray bytes{}",
                            slot,
                            hex_lines(data)
                        ),
                    );
                }
            }
            tag => {
                counts.other += 1;
                note(
                    &mut anomalies,
                    Some(offset),
                    format!(
                        "slot {} has unknown descriptor tag {:#04x}{}",
                        slot,
                        tag,
                        hex_lines(data)
                    ),
                );
            }
        }
    }

    Classified {
        mains,
        secondaries,
        counts,
        anomalies,
    }
}

fn non_zero_bytes(data: &[u8]) -> usize {
    data.iter().filter(|b| 0 != **b).count()
}

fn check_main(slot: u32, data: &[u8]) -> Result<raw::RawMainDescriptor, String> {
    let live = non_zero_bytes(data);
    if raw::DESCRIPTOR_LEN - live > MAIN_MAX_ZERO_BYTES {
        return Err(format!("only {} bytes are non-zero", live));
    }

    let desc = raw::RawMainDescriptor::from_slice(data);

    if desc.self_index != slot {
        return Err(format!(
            "records its own slot as {}, not {}",
            desc.self_index, slot
        ));
    }
    let ts_start = Timestamp::from_raw(desc.ts_start);
    if !ts_start.is_valid() {
        return Err(format!("stream start time {} is implausible", ts_start));
    }
    let ts_end = Timestamp::from_raw(desc.ts_end);
    if !ts_end.is_valid() {
        return Err(format!("stream end time {} is implausible", ts_end));
    }
    if 0 != desc.prev_index {
        return Err(format!(
            "claims a preceding descriptor at slot {}",
            desc.prev_index
        ));
    }

    Ok(desc)
}

fn check_secondary(data: &[u8]) -> Result<raw::RawSecondaryDescriptor, String> {
    let live = non_zero_bytes(data);
    if raw::DESCRIPTOR_LEN - live > SECONDARY_MAX_ZERO_BYTES {
        return Err(format!("only {} bytes are non-zero", live));
    }

    let desc = raw::RawSecondaryDescriptor::from_slice(data);

    let ts_start = Timestamp::from_raw(desc.ts_start);
    if !ts_start.is_valid() {
        return Err(format!("fragment start time {} is implausible", ts_start));
    }
    let ts_end = Timestamp::from_raw(desc.ts_end);
    if !ts_end.is_valid() {
        return Err(format!("fragment end time {} is implausible", ts_end));
    }

    Ok(desc)
}

/// Render bytes as indented hex-dump lines, for inclusion in a diagnostic.
pub(crate) fn hex_lines(data: &[u8]) -> String {
    let mut out = String::new();
    for line in hexdump::hexdump_iter(data) {
        out.push('\n');
        out.push('\t');
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::classify;
    use crate::geometry::Geometry;
    use crate::raw;
    use crate::raw::RawSuperblock;
    use crate::Timestamp;

    fn geometry(fragment_count: u32) -> Geometry {
        Geometry::from_superblock(&RawSuperblock {
            ts_last_in_data: 0,
            ts_last_write: 0,
            last_written_slot: 0,
            rewrite_slot: 0,
            fragment_count,
            ts_first_rewrite: 0,
            ts_first_video: 0,
            block_size: 512,
            fragment_blocks: 2,
            reserved_fragments: 0,
            index_area_start_block: 12,
            data_area_start_block: 20,
            trailer: raw::SUPERBLOCK_TRAILER,
        })
        .unwrap()
    }

    fn ts() -> u32 {
        Timestamp {
            year: 2023,
            month: 2,
            day: 4,
            hour: 12,
            minute: 31,
            second: 40,
        }
        .to_raw()
    }

    fn main_desc(slot: u32) -> [u8; 32] {
        let mut d = [0u8; 32];
        d[0x01] = raw::TAG_MAIN;
        d[0x02..0x04].copy_from_slice(&1u16.to_le_bytes());
        d[0x08..0x0c].copy_from_slice(&7u32.to_le_bytes());
        d[0x0c..0x10].copy_from_slice(&ts().to_le_bytes());
        d[0x10..0x14].copy_from_slice(&ts().to_le_bytes());
        d[0x16..0x18].copy_from_slice(&1u16.to_le_bytes());
        d[0x18..0x1c].copy_from_slice(&slot.to_le_bytes());
        d[0x1c..0x1e].copy_from_slice(&1u16.to_le_bytes());
        d[0x1f] = 0x06;
        d
    }

    fn area(slots: &[[u8; 32]]) -> Vec<u8> {
        let mut area = Vec::with_capacity(32 * slots.len());
        for slot in slots {
            area.extend_from_slice(slot);
        }
        area
    }

    #[test]
    fn accepts_plausible_main() {
        let scan = classify(&area(&[main_desc(0)]), &geometry(1));
        assert_eq!(1, scan.counts.mains);
        assert_eq!(1, scan.counts.total());
        assert!(scan.anomalies.is_empty());
        let main = &scan.mains[&0];
        assert_eq!(7, main.next_index);
        assert_eq!(0x1800 + 7 * 32, main.next_offset);
        assert_eq!(Some(2), main.camera);
    }

    #[test]
    fn rejects_main_with_wrong_self_index() {
        let mut d = main_desc(0);
        d[0x18] = 9;
        let scan = classify(&area(&[d]), &geometry(1));
        assert_eq!(0, scan.counts.mains);
        assert_eq!(1, scan.counts.other);
        assert_eq!(1, scan.anomalies.len());
        assert!(scan.anomalies[0].message.contains("slot"));
    }

    #[test]
    fn rejects_main_with_bad_timestamp() {
        let mut d = main_desc(0);
        d[0x0c..0x10].copy_from_slice(&0u32.to_le_bytes());
        let scan = classify(&area(&[d]), &geometry(1));
        assert_eq!(0, scan.counts.mains);
        assert_eq!(1, scan.counts.other);
    }

    #[test]
    fn zeroed_main_body_fails_the_zero_count() {
        // tag alone survives; typical of a slot the ring has wiped
        let mut d = [0u8; 32];
        d[0x01] = raw::TAG_MAIN;
        let scan = classify(&area(&[d]), &geometry(1));
        assert_eq!(0, scan.counts.mains);
        assert_eq!(1, scan.counts.other);
    }

    #[test]
    fn main_zero_count_boundary() {
        // exactly 10 live bytes passes the count gate, 9 does not
        let mut d = main_desc(0);
        d[0x02..0x04].copy_from_slice(&0u16.to_le_bytes()); // count
        d[0x08..0x0c].copy_from_slice(&0u32.to_le_bytes()); // next
        d[0x16..0x18].copy_from_slice(&0u16.to_le_bytes()); // last size
        d[0x1c..0x1e].copy_from_slice(&0u16.to_le_bytes()); // reserved
        d[0x1f] = 0x02;
        assert_eq!(10, d.iter().filter(|b| 0 != **b).count());
        let scan = classify(&area(&[d]), &geometry(1));
        assert_eq!(1, scan.counts.mains);

        d[0x1f] = 0x00; // 9 live bytes left, and a camera anomaly dodged
        let scan = classify(&area(&[d]), &geometry(1));
        assert_eq!(0, scan.counts.mains);
        assert_eq!(1, scan.counts.other);
    }

    #[test]
    fn reserved_slots() {
        let mut good = [0u8; 32];
        good[0x01] = raw::TAG_RESERVED;
        let mut bad = [0u8; 32];
        bad[0x01] = raw::TAG_RESERVED;
        bad[0x10] = 0xaa;
        let scan = classify(&area(&[good, bad]), &geometry(2));
        assert_eq!(1, scan.counts.reserved);
        assert_eq!(1, scan.counts.other);
        assert_eq!(1, scan.anomalies.len());
    }

    #[test]
    fn unknown_tag_is_other() {
        let mut d = [0u8; 32];
        d[0x01] = 0x7f;
        let scan = classify(&area(&[d]), &geometry(1));
        assert_eq!(1, scan.counts.other);
        assert_eq!(1, scan.counts.total());
    }
}
