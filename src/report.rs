use std::fmt::Write;

use positioned_io::ReadAt;

use crate::chains::FragmentChain;
use crate::Volume;

const RULE: &str = "---------------------------------------------------------------------";

/// The post-reconstruction summary: geometry in decimal and hex, superblock
/// timestamps, classifier counters, and every accumulated anomaly.
pub(crate) fn render<R: ReadAt>(volume: &Volume<R>) -> String {
    let g = &volume.geometry;
    let counts = volume.counts;
    let mut out = String::new();

    section(&mut out, "SuperBlock information");
    let _ = writeln!(out, "{} - first video in the data area", g.ts_first_video);
    let _ = writeln!(
        out,
        "{} - last video written to the data area",
        g.ts_last_in_data
    );
    let _ = writeln!(out, "{} - last video written by the recorder", g.ts_last_write);
    let _ = writeln!(
        out,
        "{} - first video the ring will rewrite next",
        g.ts_first_rewrite
    );
    value(&mut out, u64::from(g.fragment_count), "video fragments in total");
    value(
        &mut out,
        u64::from(g.reserved_fragments),
        "video fragments reserved",
    );
    value(&mut out, u64::from(g.block_size), "disk block size (bytes)");
    value(
        &mut out,
        u64::from(g.fragment_blocks),
        "fragment size (disk blocks)",
    );
    value(&mut out, g.fragment_bytes, "fragment size (bytes)");
    value(&mut out, g.total_fragment_bytes, "all fragments (bytes)");
    value(&mut out, g.used_fragment_bytes, "usable fragments (bytes)");
    value(
        &mut out,
        g.reserved_fragment_bytes,
        "reserved fragments (bytes)",
    );

    section(&mut out, "IndexArea information");
    value(
        &mut out,
        u64::from(g.index_area_start_block),
        "index area start (disk blocks)",
    );
    value(&mut out, g.index_area_offset, "index area start (bytes)");
    value(
        &mut out,
        g.index_area_first_usable,
        "first descriptor past the reserved run (bytes)",
    );
    value(&mut out, g.index_area_end, "index area end (bytes)");
    value(&mut out, g.index_area_total_bytes, "all descriptors (bytes)");
    value(
        &mut out,
        g.index_area_reserved_bytes,
        "reserved descriptors (bytes)",
    );
    value(&mut out, g.index_area_used_bytes, "usable descriptors (bytes)");
    value(
        &mut out,
        u64::from(g.last_written_slot),
        "slot last written by the recorder",
    );
    value(
        &mut out,
        u64::from(g.rewrite_slot),
        "first valid slot after the rewrite point",
    );

    section(&mut out, "Descriptor counts after classification");
    let _ = writeln!(out, "{:<6} - main descriptors", counts.mains);
    let _ = writeln!(out, "{:<6} - secondary descriptors", counts.secondaries);
    let _ = writeln!(out, "{:<6} - reserved descriptors", counts.reserved);
    let _ = writeln!(out, "{:<6} - other data in the index area", counts.other);
    let _ = writeln!(out, "{:<6} - slots in total", counts.total());

    section(&mut out, "DataArea information");
    value(
        &mut out,
        u64::from(g.data_area_start_block),
        "data area start (disk blocks)",
    );
    value(&mut out, g.data_area_offset, "data area start (bytes)");
    value(
        &mut out,
        g.data_area_first_usable,
        "first fragment past the reserved run (bytes)",
    );
    value(&mut out, g.data_area_end, "data area end (bytes)");

    if !volume.anomalies.is_empty() {
        section(&mut out, "Anomalies");
        for anomaly in &volume.anomalies {
            let _ = writeln!(out, "{}", anomaly);
        }
    }

    out
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "{}", title);
    let _ = writeln!(out, "{}", RULE);
}

fn value(out: &mut String, v: u64, label: &str) {
    let _ = writeln!(out, "{:#012x} {:13} - {}", v, v, label);
}

/// One chain as a tree of index-area slots. A hole the walk could not fill
/// prints as `X`; a synthesized main prints as `X` itself, and only the
/// recovered positions are listed under it.
pub(crate) fn chain_tree<R: ReadAt>(volume: &Volume<R>, chain: &FragmentChain) -> String {
    let mut out = String::new();

    let main = volume.mains.get(&chain.main_slot);
    let synthesized = main.map_or(true, |m| m.synthesized);
    let count = main.map_or(0, |m| m.secondary_count);

    if synthesized {
        let _ = writeln!(out, "[ ] - X (main slot {})", chain.main_slot);
        for (position, slot) in &chain.fragments {
            let _ = writeln!(out, "\t[{}] - {}", position, slot);
        }
    } else {
        let _ = writeln!(out, "[ ] - {}", chain.main_slot);
        for position in 1..=count {
            match chain.fragments.get(&position) {
                Some(slot) => {
                    let _ = writeln!(out, "\t[{}] - {}", position, slot);
                }
                None => {
                    let _ = writeln!(out, "\t[{}] - X", position);
                }
            }
        }
    }

    out
}
