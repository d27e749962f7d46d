/*!

Read metadata from WFS filesystem images, the proprietary on-disk format of a
family of DVR appliances, and recover the video chains recorded on them.

A [`Volume`] is built over anything implementing `positioned_io::ReadAt`
(a `File`, a byte buffer, ...). Construction validates the header and
superblock, derives the volume geometry, classifies every slot of the index
area, and reconstructs the recording chains in two passes: first the chains
whose main descriptor survived, then the partial chains whose main descriptor
was recycled by the recorder's ring-buffer overwrite. Descriptor-level damage
is never fatal; it is accumulated as [`Anomaly`] values and reconstruction
carries on with whatever is left.

```no_run
let file = std::fs::File::open("dvr.dd")?;
let volume = wfs::Volume::new(file)?;
for (slot, chain) in volume.valid_chains() {
    let out = std::fs::File::create(format!("chain_main_desc_{}.dav", slot))?;
    volume.export_chain(chain, out)?;
}
# Ok::<(), anyhow::Error>(())
```
*/

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::io::Write;

use anyhow::bail;
use anyhow::Error;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error as ThisError;

mod chains;
mod extract;
mod geometry;
mod index;
mod raw;
mod report;

pub use crate::chains::FragmentChain;
pub use crate::geometry::Geometry;
pub use crate::index::DescriptorCounts;
pub use crate::index::MainRecord;
pub use crate::index::SecondaryRecord;
pub use crate::index::NO_LINK;
pub use positioned_io::ReadAt;

/// Both descriptor flavours are exactly this long.
pub const DESCRIPTOR_SIZE: u64 = 32;

const SUPERBLOCK_OFFSET: u64 = 0x3000;

#[derive(Debug, ThisError)]
pub enum WfsError {
    /// The header signature or end marker is wrong; this is not a WFS volume.
    #[error("not a wfs image: {reason}")]
    NotWfsImage { reason: String },
    /// The superblock's trailing signature is wrong.
    #[error("superblock rejected: {reason}")]
    BadSuperBlock { reason: String },
    /// The superblock is plausible but describes a volume this code cannot
    /// hold, e.g. an index area past 4 GiB.
    #[error("unsupported geometry: {reason}")]
    UnsupportedGeometry { reason: String },
    /// The backing store ended before the requested range.
    #[error("short read: wanted {wanted} bytes at offset {offset:#x}")]
    ShortRead { offset: u64, wanted: usize },
    /// The backing store could not be positioned.
    #[error("seek to offset {offset:#x} failed")]
    SeekFailed { offset: u64 },
    #[error("i/o error at offset {offset:#x}: {cause}")]
    IoError { offset: u64, cause: io::Error },
    /// Writing extracted fragment bytes to the output failed. The volume
    /// remains usable.
    #[error("sink write failed: {cause}")]
    SinkWriteFailed { cause: io::Error },
}

pub(crate) fn not_wfs<S: ToString>(reason: S) -> Error {
    WfsError::NotWfsImage {
        reason: reason.to_string(),
    }
    .into()
}

pub(crate) fn bad_superblock<S: ToString>(reason: S) -> Error {
    WfsError::BadSuperBlock {
        reason: reason.to_string(),
    }
    .into()
}

pub(crate) fn unsupported_geometry<S: ToString>(reason: S) -> Error {
    WfsError::UnsupportedGeometry {
        reason: reason.to_string(),
    }
    .into()
}

pub(crate) fn sink_failed(cause: io::Error) -> Error {
    WfsError::SinkWriteFailed { cause }.into()
}

pub(crate) fn read_le16(from: &[u8]) -> u16 {
    LittleEndian::read_u16(from)
}

pub(crate) fn read_le32(from: &[u8]) -> u32 {
    LittleEndian::read_u32(from)
}

/// Fill `buf` from `offset`, mapping a premature end of the backing store to
/// [`WfsError::ShortRead`].
pub(crate) fn read_fully<R: ReadAt>(inner: &R, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
    inner.read_exact_at(offset, buf).map_err(|e| {
        if io::ErrorKind::UnexpectedEof == e.kind() {
            WfsError::ShortRead {
                offset,
                wanted: buf.len(),
            }
            .into()
        } else {
            WfsError::IoError { offset, cause: e }.into()
        }
    })
}

/// A decoded recorder timestamp.
///
/// On disk this is a little-endian `u32` packing, from the most significant
/// bit down: year (6 bits, counted from 2000), month (4), day (5), hour (5),
/// minute (6), second (6). Any word decodes to *some* tuple; [`is_valid`]
/// says whether the tuple is a calendar-plausible one, which is what the
/// index-area heuristics lean on.
///
/// [`is_valid`]: Timestamp::is_valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    pub fn from_raw(raw: u32) -> Timestamp {
        Timestamp {
            year: 2000 + ((raw >> 26) & 0x3f) as u16,
            month: ((raw >> 22) & 0x0f) as u8,
            day: ((raw >> 17) & 0x1f) as u8,
            hour: ((raw >> 12) & 0x1f) as u8,
            minute: ((raw >> 6) & 0x3f) as u8,
            second: (raw & 0x3f) as u8,
        }
    }

    pub fn to_raw(self) -> u32 {
        (u32::from(self.year.saturating_sub(2000)) & 0x3f) << 26
            | (u32::from(self.month) & 0x0f) << 22
            | (u32::from(self.day) & 0x1f) << 17
            | (u32::from(self.hour) & 0x1f) << 12
            | (u32::from(self.minute) & 0x3f) << 6
            | (u32::from(self.second) & 0x3f)
    }

    pub fn is_valid(self) -> bool {
        (2000..=2099).contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour <= 23
            && self.minute <= 59
            && self.second <= 59
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02}.{:02}.{:04} {:02}:{:02}:{:02}",
            self.day, self.month, self.year, self.hour, self.minute, self.second
        )
    }
}

/// Decode the recorder's camera byte: `0x02` is camera 1, `0x06` camera 2,
/// `0x0a` camera 3, and so on in steps of four. Bytes below `0x02` come from
/// corrupt records and decode to `None`.
pub fn camera_number(raw: u8) -> Option<u8> {
    if raw < 0x02 {
        return None;
    }
    Some((raw - 0x02) / 0x04 + 1)
}

/// A non-fatal diagnostic accumulated while parsing or reconstructing.
#[derive(Debug, Clone)]
pub struct Anomaly {
    /// Absolute image offset the event refers to, when there is one.
    pub offset: Option<u64>,
    pub message: String,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{:#x}: {}", offset, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

pub(crate) fn note(anomalies: &mut Vec<Anomaly>, offset: Option<u64>, message: String) {
    log::warn!("{}", message);
    anomalies.push(Anomaly { offset, message });
}

/// A parsed WFS volume: geometry, descriptor maps, and the reconstructed
/// recording chains.
#[derive(Debug)]
pub struct Volume<R> {
    inner: R,
    geometry: Geometry,
    mains: BTreeMap<u32, MainRecord>,
    secondaries: BTreeMap<u32, SecondaryRecord>,
    valid_chains: BTreeMap<u32, FragmentChain>,
    incomplete_chains: BTreeMap<u32, FragmentChain>,
    counts: DescriptorCounts,
    anomalies: Vec<Anomaly>,
}

impl<R: ReadAt> Volume<R> {
    /// Open a volume: validate the header and superblock, derive the
    /// geometry, classify the index area, and reconstruct the chains.
    ///
    /// Structural problems (`NotWfsImage`, `BadSuperBlock`,
    /// `UnsupportedGeometry`) and I/O failures abort construction;
    /// descriptor-level damage never does.
    pub fn new(inner: R) -> Result<Volume<R>, Error> {
        let mut header = [0u8; raw::HEADER_LEN];
        read_fully(&inner, 0, &mut header)?;
        let header = raw::RawHeader::from_slice(&header);

        if !header.signature_known() {
            return Err(not_wfs(format!(
                "unknown signature {:02x?}",
                header.signature
            )));
        }
        if raw::HEADER_END_MARKER != header.end_marker {
            return Err(not_wfs(format!(
                "bad end-of-header marker {:02x?}",
                header.end_marker
            )));
        }

        let mut superblock = [0u8; raw::SUPERBLOCK_LEN];
        read_fully(&inner, SUPERBLOCK_OFFSET, &mut superblock)?;
        let superblock = raw::RawSuperblock::from_slice(&superblock);

        if raw::SUPERBLOCK_TRAILER != superblock.trailer {
            return Err(bad_superblock(format!(
                "trailing signature {:#010x}",
                superblock.trailer
            )));
        }

        let geometry = Geometry::from_superblock(&superblock)?;

        let (mut mains, mut secondaries, counts, mut anomalies) = {
            // the whole index area in one go; dropped as soon as the slots
            // have been lifted into records
            let mut area = vec![0u8; geometry.index_area_total_bytes as usize];
            read_fully(&inner, geometry.index_area_offset, &mut area)?;
            let scan = index::classify(&area, &geometry);
            (scan.mains, scan.secondaries, scan.counts, scan.anomalies)
        };

        let rebuilt = chains::reconstruct(&mut mains, &mut secondaries, &geometry);
        anomalies.extend(rebuilt.anomalies);

        Ok(Volume {
            inner,
            geometry,
            mains,
            secondaries,
            valid_chains: rebuilt.valid,
            incomplete_chains: rebuilt.incomplete,
            counts,
            anomalies,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn counts(&self) -> DescriptorCounts {
        self.counts
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn main(&self, slot: u32) -> Option<&MainRecord> {
        self.mains.get(&slot)
    }

    pub fn secondary(&self, slot: u32) -> Option<&SecondaryRecord> {
        self.secondaries.get(&slot)
    }

    /// Every classified secondary descriptor, keyed by its index-area slot.
    pub fn secondaries(&self) -> impl Iterator<Item = (u32, &SecondaryRecord)> + '_ {
        self.secondaries.iter().map(|(slot, sec)| (*slot, sec))
    }

    /// Chains whose main descriptor was found in the index area, keyed by
    /// its slot.
    pub fn valid_chains(&self) -> impl Iterator<Item = (u32, &FragmentChain)> + '_ {
        self.valid_chains.iter().map(|(slot, chain)| (*slot, chain))
    }

    /// Chains recovered from orphaned secondaries; the main descriptor was
    /// overwritten by the ring and has been synthesized.
    pub fn incomplete_chains(&self) -> impl Iterator<Item = (u32, &FragmentChain)> + '_ {
        self.incomplete_chains
            .iter()
            .map(|(slot, chain)| (*slot, chain))
    }

    /// Stream a whole chain, in order, to `out`: the main fragment first,
    /// then each present secondary. The final position of the chain is cut
    /// to its recorded last-fragment size when one is recorded.
    ///
    /// Returns the number of bytes written. A failure leaves the volume
    /// usable for further exports.
    pub fn export_chain<W: Write>(&self, chain: &FragmentChain, out: W) -> Result<u64, Error> {
        let main = match self.mains.get(&chain.main_slot) {
            Some(main) => main,
            None => bail!("chain references unknown main slot {}", chain.main_slot),
        };
        extract::chain(
            &self.inner,
            &self.geometry,
            main,
            chain,
            &self.secondaries,
            out,
        )
    }

    /// Write the single fragment belonging to `sec` to `out`, cut to the
    /// recorded last-fragment size when one is recorded.
    pub fn export_secondary<W: Write>(&self, sec: &SecondaryRecord, out: W) -> Result<u64, Error> {
        extract::secondary(&self.inner, &self.geometry, sec, out)
    }

    /// Human-readable summary: geometry, superblock timestamps, descriptor
    /// counts, and every anomaly met on the way.
    pub fn report(&self) -> String {
        report::render(self)
    }

    /// One chain as an indented tree of index-area slots.
    pub fn chain_tree(&self, chain: &FragmentChain) -> String {
        report::chain_tree(self, chain)
    }
}

#[cfg(test)]
mod tests {
    use super::camera_number;
    use super::Timestamp;

    #[test]
    fn documented_example_word() {
        // 0x5c88c7e8 is the worked example from the format notes
        let ts = Timestamp::from_raw(0x5c88_c7e8);
        assert_eq!(
            Timestamp {
                year: 2023,
                month: 2,
                day: 4,
                hour: 12,
                minute: 31,
                second: 40,
            },
            ts
        );
        assert!(ts.is_valid());
        assert_eq!("04.02.2023 12:31:40", ts.to_string());
        assert_eq!(0x5c88_c7e8, ts.to_raw());
    }

    #[test]
    fn validity() {
        assert!(!Timestamp::from_raw(0).is_valid()); // month and day zero
        let ts = Timestamp {
            year: 2010,
            month: 12,
            day: 31,
            hour: 23,
            minute: 59,
            second: 59,
        };
        assert!(ts.is_valid());
        assert!(!Timestamp { month: 13, ..ts }.is_valid());
        assert!(!Timestamp { day: 0, ..ts }.is_valid());
        assert!(!Timestamp { hour: 24, ..ts }.is_valid());
    }

    #[test]
    fn cameras() {
        assert_eq!(Some(1), camera_number(0x02));
        assert_eq!(Some(2), camera_number(0x06));
        assert_eq!(Some(3), camera_number(0x0a));
        assert_eq!(Some(4), camera_number(0x0e));
        assert_eq!(None, camera_number(0x00));
        assert_eq!(None, camera_number(0x01));
    }
}
