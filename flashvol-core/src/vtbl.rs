// vim: tw=80
//! On-media table codec.
//!
//! Two fixed-size record arrays persist this layer's state: the volume
//! table (one record per volume slot) and the range table (one record per
//! compacted PEB run).  Both live in the layout volume as two redundant
//! copies.  Fields are big-endian; every record carries a CRC-32 over all
//! bytes before the checksum field.
//!
//! Tables are kept in RAM as raw byte buffers, exactly as they are
//! written, so copy comparison and rewrite are byte-exact.  Records are
//! decoded on demand and re-encoded (checksum included) on every change.
//!
//! A checksum mismatch and a structural-rule violation are distinct
//! outcomes.  The recovery protocol treats them identically (the copy is
//! unusable), but the former points at the media and the latter at a bug
//! or tampering, so they must be distinguishable in diagnostics.

use byteorder::{BigEndian, ByteOrder};
use num_enum::TryFromPrimitive;

use crate::compact::PebRun;
use crate::geometry::Geometry;
use crate::types::*;
use crate::util::*;

/// On-media size of one volume record.
pub const VTBL_RECORD_SIZE: usize = 172;
/// Bytes of a volume record covered by its CRC.
const VTBL_RECORD_CRC_BYTES: usize = 168;
/// On-media size of one range record.
pub const PTBL_RECORD_SIZE: usize = 24;
/// Bytes of a range record covered by its CRC.
const PTBL_RECORD_CRC_BYTES: usize = 20;

/// Longest permitted volume name, in bytes.
pub const VOL_NAME_MAX: usize = 127;
const NAME_FIELD_LEN: usize = VOL_NAME_MAX + 1;

/// Hard cap on volume-table slots, regardless of eraseblock size.
pub const MAX_VOLUMES: usize = 128;
/// Hard cap on range-table slots, regardless of eraseblock size.
pub const MAX_RANGES: usize = 1024;

/// Range-record flag: the run is mapped and in use.
const RANGE_INUSE: u8 = 0x01;
/// Range-record flag: the run covers bad blocks.
const RANGE_BAD: u8 = 0x02;

/// Volume-record flag: grow this volume into all remaining space at
/// attach.  At most one volume may carry it.
const VTBL_AUTORESIZE: u8 = 0x01;

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// A volume's on-media type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum VolumeKind {
    /// Arbitrarily rewritable; the whole reservation counts as used.
    Dynamic = 1,
    /// Written once via the update protocol.
    Static = 2,
}

/// Decoded view of a non-empty volume-table record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRecord {
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub kind: VolumeKind,
    pub upd_marker: bool,
    pub autoresize: bool,
    pub name: String,
}

impl VolumeRecord {
    fn encode(&self, slot: &mut [u8]) {
        debug_assert_eq!(slot.len(), VTBL_RECORD_SIZE);
        debug_assert!(self.name.len() <= VOL_NAME_MAX);
        debug_assert!(self.reserved_pebs > 0);
        slot.fill(0);
        BigEndian::write_u32(&mut slot[0..4], self.reserved_pebs);
        BigEndian::write_u32(&mut slot[4..8], self.alignment);
        BigEndian::write_u32(&mut slot[8..12], self.data_pad);
        slot[12] = self.kind as u8;
        slot[13] = self.upd_marker as u8;
        BigEndian::write_u16(&mut slot[14..16], self.name.len() as u16);
        slot[16..16 + self.name.len()]
            .copy_from_slice(self.name.as_bytes());
        slot[144] = if self.autoresize { VTBL_AUTORESIZE } else { 0 };
        let crc = crc32(&slot[..VTBL_RECORD_CRC_BYTES]);
        BigEndian::write_u32(&mut slot[168..172], crc);
    }

    fn decode(slot: &[u8], index: usize) -> Result<Option<Self>> {
        check_crc(slot, VTBL_RECORD_CRC_BYTES, Table::Volume, index)?;
        let reserved_pebs = BigEndian::read_u32(&slot[0..4]);
        if reserved_pebs == 0 {
            return Ok(None);
        }
        let kind = VolumeKind::try_from(slot[12]).map_err(|_| {
            Error::Inconsistent {
                table: Table::Volume,
                slot: index,
                reason: "unknown volume type",
            }
        })?;
        let name_len = BigEndian::read_u16(&slot[14..16]) as usize;
        if name_len == 0 || name_len > VOL_NAME_MAX {
            return Err(Error::Inconsistent {
                table: Table::Volume,
                slot: index,
                reason: "bad name length",
            });
        }
        let name = std::str::from_utf8(&slot[16..16 + name_len])
            .map_err(|_| Error::Inconsistent {
                table: Table::Volume,
                slot: index,
                reason: "volume name is not UTF-8",
            })?
            .to_owned();
        Ok(Some(VolumeRecord {
            reserved_pebs,
            alignment: BigEndian::read_u32(&slot[4..8]),
            data_pad: BigEndian::read_u32(&slot[8..12]),
            kind,
            upd_marker: slot[13] != 0,
            autoresize: slot[144] & VTBL_AUTORESIZE != 0,
            name,
        }))
    }
}

fn check_crc(
    slot: &[u8],
    covered: usize,
    table: Table,
    index: usize,
) -> Result<()> {
    let computed = crc32(&slot[..covered]);
    let found = BigEndian::read_u32(&slot[covered..covered + 4]);
    if found == computed {
        Ok(())
    } else {
        Err(Error::Corrupt { table, slot: index, found, computed })
    }
}

/// Write the canonical empty record (zeroes plus a valid CRC) into a
/// slot.
fn encode_empty(slot: &mut [u8], covered: usize) {
    slot.fill(0);
    let crc = crc32(&slot[..covered]);
    BigEndian::write_u32(&mut slot[covered..covered + 4], crc);
}

fn is_canonical_empty(slot: &[u8], covered: usize) -> bool {
    all_bytes(&slot[..covered], 0)
        && BigEndian::read_u32(&slot[covered..covered + 4])
            == crc32(&slot[..covered])
}

/// Slot counts and byte sizes of both tables, fixed by the geometry.
///
/// Each table fills as many record slots as one eraseblock can hold, up
/// to a hard cap, and is padded to the minimum I/O unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableShape {
    pub vtbl_slots: usize,
    pub ptbl_slots: usize,
    pub vtbl_size: usize,
    pub ptbl_size: usize,
}

impl TableShape {
    pub fn new(geometry: &Geometry) -> Result<Self> {
        let vtbl_slots =
            (geometry.eb_size / VTBL_RECORD_SIZE).min(MAX_VOLUMES);
        let ptbl_slots =
            (geometry.eb_size / PTBL_RECORD_SIZE).min(MAX_RANGES);
        if vtbl_slots == 0 || ptbl_slots == 0 {
            return Err(Error::Geometry(
                "eraseblock too small for a table record",
            ));
        }
        let vtbl_size = align_up(vtbl_slots * VTBL_RECORD_SIZE,
            geometry.min_io_size);
        let ptbl_size = align_up(ptbl_slots * PTBL_RECORD_SIZE,
            geometry.min_io_size);
        let fits = if geometry.ebs_per_copy() >= 2 {
            vtbl_size <= geometry.eb_size && ptbl_size <= geometry.eb_size
        } else {
            // Both tables share the copy's single LEB.
            vtbl_size + ptbl_size <= geometry.eb_size
        };
        if !fits {
            return Err(Error::Geometry(
                "tables do not fit the layout volume's eraseblocks",
            ));
        }
        Ok(TableShape { vtbl_slots, ptbl_slots, vtbl_size, ptbl_size })
    }
}

/// The volume table: a raw working copy of one on-media table, byte-exact
/// with what is written.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeTable {
    slots: usize,
    bytes: Vec<u8>,
}

impl VolumeTable {
    pub fn new_empty(shape: &TableShape) -> Self {
        let mut t = VolumeTable {
            slots: shape.vtbl_slots,
            bytes: vec![0; shape.vtbl_size],
        };
        for i in 0..t.slots {
            encode_empty(t.slot_mut(i), VTBL_RECORD_CRC_BYTES);
        }
        t
    }

    pub fn from_bytes(bytes: Vec<u8>, shape: &TableShape) -> Self {
        debug_assert_eq!(bytes.len(), shape.vtbl_size);
        VolumeTable { slots: shape.vtbl_slots, bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn slot(&self, i: usize) -> &[u8] {
        &self.bytes[i * VTBL_RECORD_SIZE..(i + 1) * VTBL_RECORD_SIZE]
    }

    fn slot_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.bytes[i * VTBL_RECORD_SIZE..(i + 1) * VTBL_RECORD_SIZE]
    }

    /// Decode slot `i`.  `None` means an empty slot.
    pub fn record(&self, i: usize) -> Result<Option<VolumeRecord>> {
        VolumeRecord::decode(self.slot(i), i)
    }

    /// Encode `rec` into slot `i`, refreshing its CRC.  `None` writes the
    /// canonical empty record.
    pub fn set_record(&mut self, i: usize, rec: Option<&VolumeRecord>) {
        match rec {
            Some(r) => r.encode(self.slot_mut(i)),
            None => encode_empty(self.slot_mut(i), VTBL_RECORD_CRC_BYTES),
        }
    }

    /// Check every record for corruption and structural sanity.
    ///
    /// `good_pebs` bounds any single volume's reservation: a record
    /// reserving more PEBs than the device has good ones cannot be
    /// honest.
    pub fn validate(
        &self,
        geometry: &Geometry,
        good_pebs: u32,
    ) -> Result<()> {
        let mut autoresize_seen = false;
        for i in 0..self.slots {
            let slot = self.slot(i);
            check_crc(slot, VTBL_RECORD_CRC_BYTES, Table::Volume, i)?;
            let bad = |reason| Error::Inconsistent {
                table: Table::Volume,
                slot: i,
                reason,
            };
            let reserved_pebs = BigEndian::read_u32(&slot[0..4]);
            if reserved_pebs == 0 {
                if !is_canonical_empty(slot, VTBL_RECORD_CRC_BYTES) {
                    return Err(bad("empty record is not canonical"));
                }
                continue;
            }
            let alignment = BigEndian::read_u32(&slot[4..8]) as usize;
            let data_pad = BigEndian::read_u32(&slot[8..12]) as usize;
            let name_len = BigEndian::read_u16(&slot[14..16]) as usize;
            if alignment == 0 || alignment > geometry.eb_size {
                return Err(bad("bad alignment"));
            }
            if alignment != 1 && alignment % geometry.min_io_size != 0 {
                return Err(bad(
                    "alignment not a multiple of the minimum I/O size"));
            }
            if data_pad != geometry.eb_size % alignment {
                return Err(bad("bad data_pad"));
            }
            if VolumeKind::try_from(slot[12]).is_err() {
                return Err(bad("unknown volume type"));
            }
            if slot[13] > 1 {
                return Err(bad("bad update marker"));
            }
            if reserved_pebs > good_pebs {
                tracing::error!(
                    "volume record {i}: reserved {reserved_pebs} PEBs, \
                     only {good_pebs} good ones exist");
                return Err(bad("reserved PEBs exceed good PEB count"));
            }
            if name_len == 0 || name_len > VOL_NAME_MAX {
                return Err(bad("bad name length"));
            }
            let name = &slot[16..16 + NAME_FIELD_LEN];
            if name[..name_len].contains(&0)
                || !all_bytes(&name[name_len..], 0)
            {
                return Err(bad("name length does not match its content"));
            }
            if slot[144] & !VTBL_AUTORESIZE != 0 {
                return Err(bad("unknown flag bits"));
            }
            if slot[144] & VTBL_AUTORESIZE != 0 {
                if autoresize_seen {
                    return Err(bad("more than one auto-resize volume"));
                }
                autoresize_seen = true;
            }
        }

        // All names must be unique.
        for i in 0..self.slots - 1 {
            for j in i + 1..self.slots {
                let (a, b) = (self.slot(i), self.slot(j));
                let len = BigEndian::read_u16(&a[14..16]) as usize;
                if BigEndian::read_u32(&a[0..4]) == 0
                    || BigEndian::read_u32(&b[0..4]) == 0
                {
                    continue;
                }
                if len == BigEndian::read_u16(&b[14..16]) as usize
                    && a[16..16 + len] == b[16..16 + len]
                {
                    tracing::error!(
                        "volume records {i} and {j} share a name");
                    return Err(Error::Inconsistent {
                        table: Table::Volume,
                        slot: j,
                        reason: "duplicate volume name",
                    });
                }
            }
        }
        Ok(())
    }
}

/// The range table: the on-media projection of the compacted PEB map.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeTable {
    slots: usize,
    bytes: Vec<u8>,
}

impl RangeTable {
    pub fn new_empty(shape: &TableShape) -> Self {
        let mut t = RangeTable {
            slots: shape.ptbl_slots,
            bytes: vec![0; shape.ptbl_size],
        };
        for i in 0..t.slots {
            encode_empty(t.slot_mut(i), PTBL_RECORD_CRC_BYTES);
        }
        t
    }

    pub fn from_bytes(bytes: Vec<u8>, shape: &TableShape) -> Self {
        debug_assert_eq!(bytes.len(), shape.ptbl_size);
        RangeTable { slots: shape.ptbl_slots, bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn slot(&self, i: usize) -> &[u8] {
        &self.bytes[i * PTBL_RECORD_SIZE..(i + 1) * PTBL_RECORD_SIZE]
    }

    fn slot_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.bytes[i * PTBL_RECORD_SIZE..(i + 1) * PTBL_RECORD_SIZE]
    }

    /// Decode slot `i`.  `None` means an empty slot.
    pub fn record(&self, i: usize) -> Result<Option<PebRun>> {
        let slot = self.slot(i);
        check_crc(slot, PTBL_RECORD_CRC_BYTES, Table::Range, i)?;
        let len = BigEndian::read_u32(&slot[8..12]);
        if len == 0 {
            return Ok(None);
        }
        let raw_vol = BigEndian::read_u32(&slot[12..16]);
        let owner = if raw_vol == VolId::NONE_ON_MEDIA {
            None
        } else {
            Some(VolId(raw_vol))
        };
        Ok(Some(PebRun {
            first_pnum: BigEndian::read_u32(&slot[0..4]),
            first_lnum: BigEndian::read_u32(&slot[4..8]),
            len,
            owner,
            bad: slot[16] & RANGE_BAD != 0,
        }))
    }

    /// Encode `run` into slot `i`, refreshing its CRC.  `None` writes the
    /// canonical empty record.
    pub fn set_record(&mut self, i: usize, run: Option<&PebRun>) {
        let slot = self.slot_mut(i);
        match run {
            Some(r) => {
                debug_assert!(r.len > 0);
                slot.fill(0);
                BigEndian::write_u32(&mut slot[0..4], r.first_pnum);
                BigEndian::write_u32(&mut slot[4..8], r.first_lnum);
                BigEndian::write_u32(&mut slot[8..12], r.len);
                BigEndian::write_u32(&mut slot[12..16],
                    r.owner.map_or(VolId::NONE_ON_MEDIA, |v| v.0));
                slot[16] = if r.bad { RANGE_BAD } else { RANGE_INUSE };
                let crc = crc32(&slot[..PTBL_RECORD_CRC_BYTES]);
                BigEndian::write_u32(&mut slot[20..24], crc);
            }
            None => encode_empty(slot, PTBL_RECORD_CRC_BYTES),
        }
    }

    /// Decode every non-empty slot, in slot order.
    pub fn runs(&self) -> Result<Vec<PebRun>> {
        let mut v = Vec::new();
        for i in 0..self.slots {
            if let Some(run) = self.record(i)? {
                v.push(run);
            }
        }
        Ok(v)
    }

    /// Replace the whole table with `stored`, emptying the remaining
    /// slots.  Fails with a capacity error, writing nothing, if the runs
    /// outnumber the slots.
    pub fn fill(&mut self, stored: &[PebRun]) -> Result<()> {
        if stored.len() > self.slots {
            tracing::error!(
                "device too fragmented: {} ranges, {} slots",
                stored.len(), self.slots);
            return Err(Error::TooFragmented {
                ranges: stored.len(),
                slots: self.slots,
            });
        }
        for (i, run) in stored.iter().enumerate() {
            self.set_record(i, Some(run));
        }
        for i in stored.len()..self.slots {
            self.set_record(i, None);
        }
        Ok(())
    }

    /// Check every record for corruption and structural sanity.
    pub fn validate(
        &self,
        geometry: &Geometry,
        vtbl_slots: usize,
    ) -> Result<()> {
        for i in 0..self.slots {
            let slot = self.slot(i);
            check_crc(slot, PTBL_RECORD_CRC_BYTES, Table::Range, i)?;
            let bad = |reason| Error::Inconsistent {
                table: Table::Range,
                slot: i,
                reason,
            };
            let len = BigEndian::read_u32(&slot[8..12]);
            if len == 0 {
                if !is_canonical_empty(slot, PTBL_RECORD_CRC_BYTES) {
                    return Err(bad("empty record is not canonical"));
                }
                continue;
            }
            let peb = BigEndian::read_u32(&slot[0..4]);
            let leb = BigEndian::read_u32(&slot[4..8]);
            let raw_vol = BigEndian::read_u32(&slot[12..16]);
            let flags = slot[16];
            if flags & !(RANGE_INUSE | RANGE_BAD) != 0 {
                return Err(bad("unknown flag bits"));
            }
            if flags != RANGE_INUSE && flags != RANGE_BAD {
                return Err(bad("flags must be exactly in-use or bad"));
            }
            if peb.checked_add(len)
                .map_or(true, |end| end > geometry.peb_count)
            {
                return Err(bad("physical span exceeds the device"));
            }
            if leb.checked_add(len).is_none() {
                return Err(bad("logical span overflows"));
            }
            if raw_vol == VolId::NONE_ON_MEDIA {
                if flags != RANGE_BAD {
                    return Err(bad("ownerless range not marked bad"));
                }
            } else if raw_vol as usize >= vtbl_slots
                && VolId(raw_vol) != VolId::LAYOUT
            {
                return Err(bad("unknown owning volume"));
            }
        }
        Ok(())
    }

    /// Good and bad PEB totals recorded in the table.
    pub fn peb_tally(&self, geometry: &Geometry) -> Result<(u32, u32)> {
        let mut bad = 0;
        for run in self.runs()? {
            if run.bad {
                bad += run.len;
            }
        }
        Ok((geometry.peb_count.saturating_sub(bad), bad))
    }
}

// LCOV_EXCL_STOP
