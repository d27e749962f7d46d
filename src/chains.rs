use std::collections::BTreeMap;

use crate::geometry::Geometry;
use crate::index::hex_lines;
use crate::index::MainRecord;
use crate::index::SecondaryRecord;
use crate::index::NO_LINK;
use crate::note;
use crate::Anomaly;

/// One recording: the slot of its main descriptor plus the slots of its
/// secondaries, keyed by their position within the chain. Positions are
/// one-based, straight from the on-disk relative order; the main's own
/// fragment sits in front of position 1.
///
/// Chains do not own descriptor records; the volume's two maps do. Look the
/// slots up there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentChain {
    pub main_slot: u32,
    /// position -> secondary slot
    pub fragments: BTreeMap<u16, u32>,
}

impl FragmentChain {
    fn new(main_slot: u32) -> FragmentChain {
        FragmentChain {
            main_slot,
            fragments: BTreeMap::new(),
        }
    }

    /// Fragments in this chain, counting the main's own.
    pub fn fragment_count(&self) -> usize {
        1 + self.fragments.len()
    }
}

pub(crate) struct Reconstruction {
    pub valid: BTreeMap<u32, FragmentChain>,
    pub incomplete: BTreeMap<u32, FragmentChain>,
    pub anomalies: Vec<Anomaly>,
}

/// Rebuild every chain the index area still describes.
///
/// Pass A walks the next-links out of each surviving main descriptor and
/// claims the secondaries it meets. Pass B adopts the leftovers: a secondary
/// nobody claimed names its main's slot, so it either joins that main's
/// chain late or becomes evidence for a chain whose main the ring has
/// already overwritten. Nothing here fails; every oddity is logged and
/// reconstruction continues with what can still be trusted.
pub(crate) fn reconstruct(
    mains: &mut BTreeMap<u32, MainRecord>,
    secondaries: &mut BTreeMap<u32, SecondaryRecord>,
    geometry: &Geometry,
) -> Reconstruction {
    let mut valid = BTreeMap::new();
    let mut incomplete = BTreeMap::new();
    let mut anomalies = Vec::new();

    rebuild_intact(mains, secondaries, geometry, &mut valid, &mut anomalies);
    adopt_orphans(
        mains,
        secondaries,
        geometry,
        &mut valid,
        &mut incomplete,
        &mut anomalies,
    );
    fill_in_synthesized(mains, secondaries, &incomplete, &mut anomalies);

    let unclaimed = secondaries.values().filter(|s| !s.claimed).count();
    if 0 != unclaimed {
        log::info!("{} secondary descriptors remain outside every chain", unclaimed);
        anomalies.push(Anomaly {
            offset: None,
            message: format!(
                "{} secondary descriptors remain outside every chain",
                unclaimed
            ),
        });
    }

    Reconstruction {
        valid,
        incomplete,
        anomalies,
    }
}

/// Pass A: every accepted main gets a chain, then the next-links are walked
/// for as long as they hold together.
fn rebuild_intact(
    mains: &mut BTreeMap<u32, MainRecord>,
    secondaries: &mut BTreeMap<u32, SecondaryRecord>,
    geometry: &Geometry,
    valid: &mut BTreeMap<u32, FragmentChain>,
    anomalies: &mut Vec<Anomaly>,
) {
    let main_slots: Vec<u32> = mains.keys().copied().collect();

    for slot in main_slots {
        let (count, next, camera, offset, dump) = match mains.get(&slot) {
            Some(m) => (
                m.secondary_count,
                m.next_index,
                m.camera,
                m.offset,
                hex_lines(&m.raw),
            ),
            None => continue,
        };

        let chain = valid.entry(slot).or_insert_with(|| FragmentChain::new(slot));

        if 0 == count && (0 == next || NO_LINK == next) {
            // a recording short enough to fit one fragment
            if let Some(m) = mains.get_mut(&slot) {
                m.claimed = true;
            }
            continue;
        }

        if !(next > 0 && next <= geometry.fragment_count) {
            note(
                anomalies,
                Some(offset),
                format!(
                    "main descriptor in slot {} references secondary {:#x} out of range{}",
                    slot, next, dump
                ),
            );
            continue;
        }

        // the head secondary is described by the main itself; the rest of
        // the walk trusts the links between secondaries
        let cursor = match secondaries.get_mut(&next) {
            None => {
                note(
                    anomalies,
                    Some(offset),
                    format!(
                        "main descriptor in slot {}: first secondary {} was not classified{}",
                        slot, next, dump
                    ),
                );
                continue;
            }
            Some(head) => {
                if head.slot != next {
                    note(
                        anomalies,
                        Some(offset),
                        format!(
                            "main descriptor in slot {}: secondary map is inconsistent at {}{}",
                            slot, next, dump
                        ),
                    );
                    continue;
                }
                if head.prev_index != slot {
                    note(
                        anomalies,
                        Some(offset),
                        format!(
                            "main descriptor in slot {}: head secondary {} points back at {}{}",
                            slot, next, head.prev_index, dump
                        ),
                    );
                    continue;
                }
                if head.camera != camera {
                    note(
                        anomalies,
                        Some(head.offset),
                        format!(
                            "inconsistent camera numbers in chain {}: main {:?}, secondary {} {:?}",
                            slot, camera, next, head.camera
                        ),
                    );
                }
                head.claimed = true;
                chain.fragments.insert(1, head.slot);
                head.next_index
            }
        };

        walk_links(slot, count, camera, cursor, secondaries, chain, anomalies);

        if let Some(m) = mains.get_mut(&slot) {
            m.claimed = true;
        }
    }
}

/// Follow next-links from the second position to the declared end of the
/// chain. A missing link stops the walk; a link whose relative order is off
/// is skipped but still steered through.
fn walk_links(
    main_slot: u32,
    count: u16,
    camera: Option<u8>,
    mut cursor: u32,
    secondaries: &mut BTreeMap<u32, SecondaryRecord>,
    chain: &mut FragmentChain,
    anomalies: &mut Vec<Anomaly>,
) {
    for position in 2..=count {
        let (slot, order, next, sec_camera, offset) = match secondaries.get(&cursor) {
            None => {
                note(
                    anomalies,
                    None,
                    format!(
                        "broken chain {}: position {} of {} should be in slot {}, which was not classified",
                        main_slot, position, count, cursor
                    ),
                );
                break;
            }
            Some(s) => (s.slot, s.relative_order, s.next_index, s.camera, s.offset),
        };

        if order != position {
            note(
                anomalies,
                Some(offset),
                format!(
                    "chain {}: slot {} carries relative order {} where {} was expected \
                     ({} of {} fragments linked so far); skipping it",
                    main_slot,
                    slot,
                    order,
                    position,
                    chain.fragments.len(),
                    count
                ),
            );
            cursor = next;
            continue;
        }

        if sec_camera != camera {
            note(
                anomalies,
                Some(offset),
                format!(
                    "inconsistent camera numbers in chain {}: main {:?}, secondary {} {:?}",
                    main_slot, camera, slot, sec_camera
                ),
            );
        }

        if let Some(s) = secondaries.get_mut(&cursor) {
            s.claimed = true;
        }
        chain.fragments.insert(position, slot);
        cursor = next;
    }
}

/// Pass B: deal every unclaimed secondary into the chain its main-slot field
/// names, synthesizing mains the ring overwrote.
fn adopt_orphans(
    mains: &mut BTreeMap<u32, MainRecord>,
    secondaries: &mut BTreeMap<u32, SecondaryRecord>,
    geometry: &Geometry,
    valid: &mut BTreeMap<u32, FragmentChain>,
    incomplete: &mut BTreeMap<u32, FragmentChain>,
    anomalies: &mut Vec<Anomaly>,
) {
    let secondary_slots: Vec<u32> = secondaries.keys().copied().collect();

    for slot in secondary_slots {
        let (claimed, main_slot, order, offset) = match secondaries.get(&slot) {
            Some(s) => (s.claimed, s.main_index, s.relative_order, s.offset),
            None => continue,
        };
        if claimed {
            continue;
        }

        let chain = if let Some(chain) = valid.get_mut(&main_slot) {
            // stray secondary whose main still exists; it joins late
            chain
        } else {
            if !mains.contains_key(&main_slot) {
                mains.insert(
                    main_slot,
                    MainRecord::synthesized(main_slot, geometry.descriptor_offset(main_slot)),
                );
            }
            incomplete
                .entry(main_slot)
                .or_insert_with(|| FragmentChain::new(main_slot))
        };

        if chain.fragments.contains_key(&order) {
            // first claim wins; intact chains are not disturbed by recovery
            note(
                anomalies,
                Some(offset),
                format!(
                    "secondary in slot {} also claims position {} of chain {}; keeping the earlier one",
                    slot, order, main_slot
                ),
            );
        } else {
            chain.fragments.insert(order, slot);
        }

        if let Some(s) = secondaries.get_mut(&slot) {
            s.claimed = true;
            s.recovered = true;
        }
    }
}

/// After recovery, bound each synthesized main by its adopted secondaries:
/// chain length from the highest position seen, camera and time range only
/// when the secondaries agree on the camera.
fn fill_in_synthesized(
    mains: &mut BTreeMap<u32, MainRecord>,
    secondaries: &BTreeMap<u32, SecondaryRecord>,
    incomplete: &BTreeMap<u32, FragmentChain>,
    anomalies: &mut Vec<Anomaly>,
) {
    for (main_slot, chain) in incomplete {
        let mut camera = None;
        let mut consistent = true;
        let mut first = true;
        let mut ts_start = None;
        let mut ts_end = None;
        let mut highest = 0u16;

        for (&position, slot) in &chain.fragments {
            let sec = match secondaries.get(slot) {
                Some(sec) => sec,
                None => continue,
            };
            if first {
                camera = sec.camera;
                first = false;
            } else if sec.camera != camera {
                consistent = false;
            }
            if ts_start.map_or(true, |t| sec.ts_start < t) {
                ts_start = Some(sec.ts_start);
            }
            if ts_end.map_or(true, |t| sec.ts_end > t) {
                ts_end = Some(sec.ts_end);
            }
            highest = highest.max(position);
        }

        let main = match mains.get_mut(main_slot) {
            Some(main) => main,
            None => continue,
        };
        main.secondary_count = highest;
        if consistent {
            main.camera = camera;
            main.ts_start = ts_start;
            main.ts_end = ts_end;
        } else {
            note(
                anomalies,
                Some(main.offset),
                format!(
                    "recovered chain {}: secondaries disagree on the camera number",
                    main_slot
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::reconstruct;
    use crate::geometry::Geometry;
    use crate::index::MainRecord;
    use crate::index::SecondaryRecord;
    use crate::index::NO_LINK;
    use crate::raw;
    use crate::raw::RawSuperblock;
    use crate::Timestamp;

    fn geometry() -> Geometry {
        Geometry::from_superblock(&RawSuperblock {
            ts_last_in_data: 0,
            ts_last_write: 0,
            last_written_slot: 0,
            rewrite_slot: 0,
            fragment_count: 16,
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

    fn ts(second: u8) -> Timestamp {
        Timestamp {
            year: 2023,
            month: 2,
            day: 4,
            hour: 12,
            minute: 31,
            second,
        }
    }

    fn main(slot: u32, count: u16, next: u32) -> MainRecord {
        MainRecord {
            slot,
            offset: 0x1800 + u64::from(slot) * 32,
            secondary_count: count,
            next_index: next,
            next_offset: 0,
            ts_start: Some(ts(0)),
            ts_end: Some(ts(10)),
            last_fragment_blocks: 0,
            record_order: 0,
            camera: Some(1),
            claimed: false,
            synthesized: false,
            raw: [0u8; 32],
        }
    }

    fn secondary(slot: u32, order: u16, prev: u32, next: u32, main_index: u32) -> SecondaryRecord {
        SecondaryRecord {
            slot,
            offset: 0x1800 + u64::from(slot) * 32,
            relative_order: order,
            prev_index: prev,
            next_index: next,
            ts_start: ts(0),
            ts_end: ts(10),
            last_fragment_blocks: 0,
            main_index,
            record_order: 0,
            camera: Some(1),
            claimed: false,
            recovered: false,
        }
    }

    fn maps(
        mains: Vec<MainRecord>,
        secondaries: Vec<SecondaryRecord>,
    ) -> (BTreeMap<u32, MainRecord>, BTreeMap<u32, SecondaryRecord>) {
        (
            mains.into_iter().map(|m| (m.slot, m)).collect(),
            secondaries.into_iter().map(|s| (s.slot, s)).collect(),
        )
    }

    #[test]
    fn single_fragment_chain() {
        let (mut mains, mut secondaries) = maps(vec![main(3, 0, NO_LINK)], vec![]);
        let rebuilt = reconstruct(&mut mains, &mut secondaries, &geometry());
        assert_eq!(1, rebuilt.valid.len());
        assert_eq!(1, rebuilt.valid[&3].fragment_count());
        assert!(rebuilt.incomplete.is_empty());
        assert!(rebuilt.anomalies.is_empty());
        assert!(mains[&3].claimed);
    }

    #[test]
    fn three_links_walked_in_order() {
        let (mut mains, mut secondaries) = maps(
            vec![main(0, 3, 1)],
            vec![
                secondary(1, 1, 0, 4, 0),
                secondary(4, 2, 1, 9, 0),
                secondary(9, 3, 4, 0, 0),
            ],
        );
        let rebuilt = reconstruct(&mut mains, &mut secondaries, &geometry());
        let chain = &rebuilt.valid[&0];
        assert_eq!(4, chain.fragment_count());
        assert_eq!(
            vec![(1, 1), (2, 4), (3, 9)],
            chain
                .fragments
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect::<Vec<_>>()
        );
        assert!(rebuilt.anomalies.is_empty());
        assert!(secondaries.values().all(|s| s.claimed && !s.recovered));
    }

    #[test]
    fn order_mismatch_is_skipped_but_walk_continues() {
        // slot 4 says it is position 5; the walk drops it and follows its
        // next pointer to slot 9, which really is position 3
        let (mut mains, mut secondaries) = maps(
            vec![main(0, 3, 1)],
            vec![
                secondary(1, 1, 0, 4, 0),
                secondary(4, 5, 1, 9, 0),
                secondary(9, 3, 4, 0, 0),
            ],
        );
        let rebuilt = reconstruct(&mut mains, &mut secondaries, &geometry());
        let chain = &rebuilt.valid[&0];
        assert_eq!(None, chain.fragments.get(&2));
        assert_eq!(Some(&9), chain.fragments.get(&3));
        assert!(rebuilt
            .anomalies
            .iter()
            .any(|a| a.message.contains("relative order")));
        // the mismatched secondary was never claimed in pass A, so pass B
        // adopts it back into the same chain at its declared position
        assert!(secondaries[&4].recovered);
        assert_eq!(Some(&4), chain.fragments.get(&5));
    }

    #[test]
    fn orphans_synthesize_a_main() {
        let (mut mains, mut secondaries) = maps(
            vec![],
            vec![secondary(5, 1, 2, 6, 2), secondary(6, 2, 5, 0, 2)],
        );
        let rebuilt = reconstruct(&mut mains, &mut secondaries, &geometry());
        assert!(rebuilt.valid.is_empty());
        let chain = &rebuilt.incomplete[&2];
        assert_eq!(3, chain.fragment_count());
        let synthesized = &mains[&2];
        assert!(synthesized.synthesized);
        assert_eq!(2, synthesized.secondary_count);
        assert_eq!(Some(1), synthesized.camera);
        assert_eq!(Some(ts(0)), synthesized.ts_start);
        assert_eq!(Some(ts(10)), synthesized.ts_end);
    }

    #[test]
    fn camera_disagreement_leaves_main_unset() {
        let mut orphan_a = secondary(5, 1, 2, 6, 2);
        orphan_a.camera = Some(1);
        let mut orphan_b = secondary(6, 2, 5, 0, 2);
        orphan_b.camera = Some(3);
        let (mut mains, mut secondaries) = maps(vec![], vec![orphan_a, orphan_b]);
        let rebuilt = reconstruct(&mut mains, &mut secondaries, &geometry());
        let synthesized = &mains[&2];
        assert_eq!(None, synthesized.camera);
        assert_eq!(None, synthesized.ts_start);
        assert_eq!(2, synthesized.secondary_count);
        assert!(rebuilt
            .anomalies
            .iter()
            .any(|a| a.message.contains("disagree")));
    }

    #[test]
    fn reconstruction_is_idempotent() {
        let build = || {
            maps(
                vec![main(0, 2, 1), main(7, 0, NO_LINK)],
                vec![
                    secondary(1, 1, 0, 3, 0),
                    secondary(3, 2, 1, 0, 0),
                    secondary(5, 1, 2, 0, 2),
                    secondary(6, 4, 0, 0, 0),
                ],
            )
        };

        let (mut mains, mut secondaries) = build();
        let first = reconstruct(&mut mains, &mut secondaries, &geometry());

        // clear the bookkeeping bits and run again over the same records
        for m in mains.values_mut() {
            m.claimed = false;
        }
        for s in secondaries.values_mut() {
            s.claimed = false;
            s.recovered = false;
        }
        let incomplete_slots: Vec<u32> = first.incomplete.keys().copied().collect();
        for slot in incomplete_slots {
            mains.remove(&slot);
        }
        let second = reconstruct(&mut mains, &mut secondaries, &geometry());

        assert_eq!(first.valid, second.valid);
        assert_eq!(first.incomplete, second.incomplete);
    }
}
