// vim: tw=80
//! The two-copy durability protocol.
//!
//! Both on-media tables live in the layout volume as copy 0 and copy 1.
//! Updates always rewrite copy 0 completely, then copy 1, in that order.
//! Power loss between the two writes leaves copy 0 with the new state and
//! copy 1 with the old (or a mangled) one; attach prefers copy 0 whenever
//! it validates and otherwise falls back to copy 1, which is guaranteed
//! to be the previous cleanly-committed state.  That turns a multi-block
//! write into a crash-safe two-phase update without a journal.
//!
//! With two LEBs per copy, the volume table and the range table get one
//! LEB each.  With a single LEB per copy they share it at consecutive
//! min-I/O-aligned offsets.

use crate::compact;
use crate::flash::{LebIo, ReadQuality};
use crate::geometry::Geometry;
use crate::pmap::PebMap;
use crate::types::*;
use crate::vtbl::{RangeTable, TableShape, VolumeTable};

/// In-memory working copy of both tables, byte-exact with the media.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tables {
    pub vtbl: VolumeTable,
    pub ptbl: RangeTable,
}

impl Tables {
    pub fn byte_eq(&self, other: &Tables) -> bool {
        self.vtbl.as_bytes() == other.vtbl.as_bytes()
            && self.ptbl.as_bytes() == other.ptbl.as_bytes()
    }
}

/// Where one table of one copy lives inside the layout volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Site {
    lnum: LebNum,
    offset: usize,
}

/// Locations of the volume and range tables of `copy`.
fn sites(geometry: &Geometry, shape: &TableShape, copy: CopyNum)
    -> (Site, Site)
{
    let epc = geometry.ebs_per_copy();
    let first = copy * epc;
    if epc >= 2 {
        (Site { lnum: first, offset: 0 },
         Site { lnum: first + 1, offset: 0 })
    } else {
        (Site { lnum: first, offset: 0 },
         Site { lnum: first, offset: shape.vtbl_size })
    }
}

/// Read one copy's tables.  A hard read failure makes the whole copy
/// unreadable; recovery proceeds through the other copy.
fn read_copy(
    io: &dyn LebIo,
    geometry: &Geometry,
    shape: &TableShape,
    copy: CopyNum,
) -> Option<Tables> {
    let (vsite, psite) = sites(geometry, shape, copy);
    let mut vbytes = vec![0u8; shape.vtbl_size];
    let mut pbytes = vec![0u8; shape.ptbl_size];
    let vres = io.read_leb(VolId::LAYOUT, vsite.lnum, &mut vbytes,
        vsite.offset);
    let pres = io.read_leb(VolId::LAYOUT, psite.lnum, &mut pbytes,
        psite.offset);
    match (vres, pres) {
        (Ok(vq), Ok(pq)) => {
            if vq == ReadQuality::BitFlips || pq == ReadQuality::BitFlips {
                tracing::warn!(
                    "bit flips while reading table copy {copy}; data \
                     recovered");
            }
            Some(Tables {
                vtbl: VolumeTable::from_bytes(vbytes, shape),
                ptbl: RangeTable::from_bytes(pbytes, shape),
            })
        }
        (v, p) => {
            tracing::warn!("failed to read table copy {copy}: {:?}",
                v.and(p).err());
            None
        }
    }
}

/// Write one copy: erase-equivalent unmap of its LEBs, then full-table
/// programming.
fn write_copy(
    io: &dyn LebIo,
    geometry: &Geometry,
    shape: &TableShape,
    copy: CopyNum,
    tables: &Tables,
) -> Result<()> {
    let (vsite, psite) = sites(geometry, shape, copy);
    io.unmap_leb(VolId::LAYOUT, vsite.lnum)?;
    if psite.lnum != vsite.lnum {
        io.unmap_leb(VolId::LAYOUT, psite.lnum)?;
    }
    io.write_leb(VolId::LAYOUT, vsite.lnum, tables.vtbl.as_bytes(),
        vsite.offset)?;
    io.write_leb(VolId::LAYOUT, psite.lnum, tables.ptbl.as_bytes(),
        psite.offset)?;
    Ok(())
}

/// Validate one copy: range table first, whose tally then bounds the
/// volume reservations.
fn validate_copy(
    tables: &Tables,
    geometry: &Geometry,
    shape: &TableShape,
) -> Result<()> {
    tables.ptbl.validate(geometry, shape.vtbl_slots)?;
    let (good, _bad) = tables.ptbl.peb_tally(geometry)?;
    tables.vtbl.validate(geometry, good)
}

/// Erased or never-written flash reads back uniform.  Only a copy that
/// was actually readable can be called blank; unreadable is a different
/// state.
fn copy_is_blank(tables: &Tables) -> bool {
    let uniform = |bytes: &[u8]| {
        crate::util::all_bytes(bytes, 0x00)
            || crate::util::all_bytes(bytes, 0xff)
    };
    uniform(tables.vtbl.as_bytes()) && uniform(tables.ptbl.as_bytes())
}

fn log_invalid(copy: CopyNum, e: &Error) {
    match e {
        Error::Corrupt { .. } =>
            tracing::warn!("table copy {copy} is corrupted: {e}"),
        _ => tracing::warn!("table copy {copy} is inconsistent: {e}"),
    }
}

/// Build the first-use tables: an all-empty volume table and a range
/// table holding the map's current contents, i.e. the layout volume
/// pinned to the device prefix plus any bad blocks the placement scan
/// found.
fn create_empty(shape: &TableShape, map: &PebMap) -> Result<Tables> {
    let mut runs = compact::runs(map).collect::<Vec<_>>();
    compact::normalize(&mut runs);
    let mut ptbl = RangeTable::new_empty(shape);
    ptbl.fill(&runs)?;
    Ok(Tables { vtbl: VolumeTable::new_empty(shape), ptbl })
}

/// Read, reconcile, and adopt the on-media tables, formatting an empty
/// pair on a blank device.  Runs before any concurrent access exists.
pub fn attach(
    io: &dyn LebIo,
    geometry: &Geometry,
    shape: &TableShape,
    map: &PebMap,
) -> Result<Tables> {
    tracing::debug!("checking layout volume");
    let copy_a = read_copy(io, geometry, shape, 0);
    let copy_b = read_copy(io, geometry, shape, 1);

    let a_valid = match &copy_a {
        Some(t) => match validate_copy(t, geometry, shape) {
            Ok(()) => true,
            Err(e) => {
                log_invalid(0, &e);
                false
            }
        },
        None => false,
    };

    if a_valid {
        let a = copy_a.unwrap();
        let b_matches =
            copy_b.as_ref().map_or(false, |b| a.byte_eq(b));
        if !b_matches {
            tracing::warn!("table copy 1 is stale; restoring from copy 0");
            write_copy(io, geometry, shape, 1, &a)?;
            tracing::info!("table copy 1 was restored");
        }
        return Ok(a);
    }

    let b_valid = match &copy_b {
        Some(t) => match validate_copy(t, geometry, shape) {
            Ok(()) => true,
            Err(e) => {
                log_invalid(1, &e);
                false
            }
        },
        None => false,
    };
    if b_valid {
        let b = copy_b.unwrap();
        tracing::warn!("table copy 0 is corrupted; restoring from copy 1");
        write_copy(io, geometry, shape, 0, &b)?;
        tracing::info!("table copy 0 was restored");
        return Ok(b);
    }

    let both_blank = matches!(
        (&copy_a, &copy_b),
        (Some(a), Some(b)) if copy_is_blank(a) && copy_is_blank(b)
    );
    if both_blank {
        tracing::info!("empty device; creating volume tables");
        let tables = create_empty(shape, map)?;
        for copy in 0..geometry.layout_copies {
            write_copy(io, geometry, shape, copy, &tables)?;
        }
        return Ok(tables);
    }

    tracing::error!("both volume table copies are corrupted");
    Err(Error::BothCopiesBad)
}

/// Make the current in-memory state durable.
///
/// Re-derives the range table from the live map (rejecting an allocation
/// too fragmented for the fixed slot count before anything is written),
/// then rewrites copy 0 and copy 1, in that order.  The caller must hold
/// the commit exclusion for the whole call.
pub fn commit(
    io: &dyn LebIo,
    geometry: &Geometry,
    shape: &TableShape,
    tables: &mut Tables,
    map: &PebMap,
) -> Result<()> {
    let runs = compact::runs(map).collect::<Vec<_>>();
    tables.ptbl.fill(&runs)?;
    for copy in 0..geometry.layout_copies {
        write_copy(io, geometry, shape, copy, tables)?;
    }
    Ok(())
}

// LCOV_EXCL_STOP
