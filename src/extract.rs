use std::cmp::min;
use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Error;
use positioned_io::ReadAt;

use crate::chains::FragmentChain;
use crate::geometry::Geometry;
use crate::index::MainRecord;
use crate::index::SecondaryRecord;
use crate::read_fully;
use crate::sink_failed;

const COPY_CHUNK: u64 = 64 * 1024;

/// Stream a chain to `out`: the main's fragment, then every present
/// secondary in position order. The chain's declared final position is cut
/// to its recorded last-fragment size, when it recorded one; holes left by
/// broken links are simply skipped.
pub(crate) fn chain<R: ReadAt, W: Write>(
    inner: &R,
    geometry: &Geometry,
    main: &MainRecord,
    chain: &FragmentChain,
    secondaries: &BTreeMap<u32, SecondaryRecord>,
    mut out: W,
) -> Result<u64, Error> {
    let mut written = copy_fragment(inner, geometry, main.slot, geometry.fragment_bytes, &mut out)?;

    for position in 1..=main.secondary_count {
        let slot = match chain.fragments.get(&position) {
            Some(slot) => *slot,
            None => continue,
        };
        let sec = match secondaries.get(&slot) {
            Some(sec) => sec,
            None => continue,
        };
        let len = if position == main.secondary_count && sec.last_fragment_blocks > 0 {
            u64::from(sec.last_fragment_blocks) * u64::from(geometry.block_size)
        } else {
            geometry.fragment_bytes
        };
        written += copy_fragment(inner, geometry, slot, len, &mut out)?;
    }

    Ok(written)
}

/// Stream one secondary's fragment to `out`. A recorded last-fragment size
/// trims it; zero means the fragment is full.
pub(crate) fn secondary<R: ReadAt, W: Write>(
    inner: &R,
    geometry: &Geometry,
    sec: &SecondaryRecord,
    mut out: W,
) -> Result<u64, Error> {
    let len = if 0 == sec.last_fragment_blocks {
        geometry.fragment_bytes
    } else {
        u64::from(sec.last_fragment_blocks) * u64::from(geometry.block_size)
    };
    copy_fragment(inner, geometry, sec.slot, len, &mut out)
}

fn copy_fragment<R: ReadAt, W: Write>(
    inner: &R,
    geometry: &Geometry,
    slot: u32,
    len: u64,
    out: &mut W,
) -> Result<u64, Error> {
    let mut pos = geometry.fragment_offset(slot);
    let mut remaining = len;
    let mut buf = vec![0u8; min(COPY_CHUNK, len) as usize];

    while remaining > 0 {
        let take = min(COPY_CHUNK, remaining) as usize;
        read_fully(inner, pos, &mut buf[..take])?;
        out.write_all(&buf[..take]).map_err(sink_failed)?;
        pos += take as u64;
        remaining -= take as u64;
    }

    Ok(len)
}
