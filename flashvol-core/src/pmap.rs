// vim: tw=80
//! The PEB map: the in-memory table of physical-eraseblock allocation.
//!
//! One entry per physical erase block records which volume and logical
//! index currently own it, and whether it is in use or has gone bad.  The
//! map is never persisted entry-by-entry; only its compacted-range
//! projection reaches the media (see `compact` and `layout`).
//!
//! Lookups are linear scans bounded by a volume's reserved area.  The map
//! is small enough that this is sub-millisecond; callers wanting
//! sub-linear lookup should index above this layer.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::ops::Range;

use crate::geometry::Geometry;
use crate::types::*;

/// State of one physical erase block.
///
/// Invariants: `bad` implies `!in_use`; at most one entry carries a given
/// `(owner, lnum)` pair with `in_use` set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PebEntry {
    pub owner: Option<VolId>,
    pub lnum: LebNum,
    pub in_use: bool,
    pub bad: bool,
}

impl PebEntry {
    /// Free entries may be claimed by any volume whose reserved area
    /// covers them.
    pub fn is_free(&self) -> bool {
        !self.in_use && !self.bad
    }

    /// In use or bad; either way the entry belongs in the on-media range
    /// table.
    pub fn is_occupied(&self) -> bool {
        self.in_use || self.bad
    }
}

/// The per-device PEB allocation table.
///
/// Created once at attach, sized to the device PEB count, mutated by
/// allocate/resize/mark-bad operations for the device's lifetime.
#[derive(Clone, Debug)]
pub struct PebMap {
    entries: Vec<PebEntry>,
    geometry: Geometry,
}

impl PebMap {
    pub fn new(geometry: Geometry) -> Self {
        let entries = vec![PebEntry::default(); geometry.peb_count as usize];
        PebMap { entries, geometry }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn peb_count(&self) -> PebNum {
        self.entries.len() as PebNum
    }

    /// A copy of one entry.  The map never hands out entry references.
    pub fn entry(&self, pnum: PebNum) -> PebEntry {
        self.entries[pnum as usize]
    }

    /// Find the PEB backing `lnum` of `vol`.
    ///
    /// Two matches would mean the uniqueness invariant is broken, which is
    /// a logic fault, not a lookup miss.
    pub fn lookup(&self, vol: VolId, lnum: LebNum) -> Option<PebNum> {
        let mut found = None;
        for pnum in self.geometry.area_of(vol) {
            let e = &self.entries[pnum as usize];
            if e.owner == Some(vol) && e.lnum == lnum && e.in_use && !e.bad {
                assert!(found.is_none(),
                    "duplicate mapping for volume {} LEB {}: PEB {} and {}",
                    vol, lnum, found.unwrap(), pnum);
                found = Some(pnum);
            }
        }
        found
    }

    /// How many PEBs does `vol` currently hold?
    pub fn volume_peb_count(&self, vol: VolId) -> usize {
        self.geometry.area_of(vol)
            .filter(|&pnum| {
                let e = &self.entries[pnum as usize];
                e.owner == Some(vol) && e.in_use && !e.bad
            }).count()
    }

    /// Count distinct volume ids holding at least one valid in-use,
    /// non-bad entry.
    pub fn volume_count(&self) -> usize {
        self.entries.iter()
            .filter(|e| e.in_use && !e.bad)
            .filter_map(|e| e.owner)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// The reserved area an allocation for `owner` must stay inside.
    fn area_for(&self, owner: Option<VolId>) -> Range<PebNum> {
        match owner {
            Some(vol) => self.geometry.area_of(vol),
            // Ownerless ranges only ever describe bad blocks, which may
            // sit anywhere.
            None => self.geometry.whole_device(),
        }
    }

    /// Assign `count` consecutive physical entries starting at `first_pnum`
    /// to consecutive logical indices starting at `first_lnum`.
    ///
    /// With `bad` set the entries are marked bad (not in use) instead;
    /// re-marking an already-bad entry is a no-op, so replaying stored bad
    /// ranges over an already-scanned map converges.  All checks happen
    /// before any mutation, so a rejected call leaves the map untouched
    /// and is idempotent to retry.
    pub fn allocate_range(
        &mut self,
        owner: Option<VolId>,
        first_pnum: PebNum,
        first_lnum: LebNum,
        count: u32,
        bad: bool,
    ) -> Result<()> {
        assert!(owner.is_some() || bad, "ownerless ranges must be bad");
        let area = self.area_for(owner);
        let end = first_pnum.checked_add(count)
            .filter(|&end| first_pnum >= area.start && end <= area.end)
            .ok_or(Error::OutOfArea {
                first: first_pnum,
                count,
                area_start: area.start,
                area_end: area.end,
            })?;
        for pnum in first_pnum..end {
            let e = &self.entries[pnum as usize];
            if bad && e.bad {
                continue;
            }
            if e.is_occupied() {
                return Err(Error::Collision { pnum });
            }
        }
        for (i, pnum) in (first_pnum..end).enumerate() {
            self.entries[pnum as usize] = if bad {
                PebEntry { owner: None, lnum: 0, in_use: false, bad: true }
            } else {
                PebEntry {
                    owner,
                    lnum: first_lnum + i as LebNum,
                    in_use: true,
                    bad: false,
                }
            };
        }
        Ok(())
    }

    /// Grow or shrink `vol` to exactly `target` PEBs.
    ///
    /// Growth claims free entries in ascending physical order, extending
    /// the volume's contiguous logical prefix; if the reserved area cannot
    /// satisfy the target, nothing is claimed at all.  Shrink frees the
    /// highest logical indices first, so the in-use indices always remain
    /// exactly `0..count`.  A target of zero deletes the volume's entire
    /// allocation.
    pub fn resize_volume(&mut self, vol: VolId, target: u32) -> Result<()> {
        let current = self.volume_peb_count(vol) as u32;
        if target == current {
            return Ok(());
        }
        if target == 0 {
            for pnum in self.geometry.area_of(vol) {
                let e = &mut self.entries[pnum as usize];
                if e.owner == Some(vol) && !e.bad {
                    *e = PebEntry::default();
                }
            }
            return Ok(());
        }
        if target > current {
            let needed = (target - current) as usize;
            let claims = self.geometry.area_of(vol)
                .filter(|&pnum| self.entries[pnum as usize].is_free())
                .take(needed)
                .collect::<Vec<_>>();
            if claims.len() < needed {
                tracing::warn!(
                    "volume {vol}: grow to {target} PEBs needs {needed} \
                     free, found {}", claims.len());
                return Err(Error::NoSpace { vol });
            }
            for (i, pnum) in claims.into_iter().enumerate() {
                self.entries[pnum as usize] = PebEntry {
                    owner: Some(vol),
                    lnum: current + i as LebNum,
                    in_use: true,
                    bad: false,
                };
            }
        } else {
            // Free the logical tail so the remaining indices stay a
            // contiguous prefix.  Only this volume's entries are ever
            // considered.
            for lnum in (target..current).rev() {
                let pnum = self.lookup(vol, lnum).unwrap_or_else(|| {
                    panic!("volume {vol} LEB {lnum} unmapped during shrink")
                });
                self.entries[pnum as usize] = PebEntry::default();
            }
        }
        Ok(())
    }

    /// Mark `pnum` bad and migrate its assignment to a fresh PEB.
    ///
    /// Returns the replacement's physical number, or `pnum` itself if the
    /// entry held no live assignment.  When the entry was in use and the
    /// owner's reserved area has no free block, the entry is left bad and
    /// unreplaced and the space error reports the data loss.
    pub fn mark_bad_and_replace(&mut self, pnum: PebNum) -> Result<PebNum> {
        let prev = self.entries[pnum as usize];
        if prev.bad {
            return Ok(pnum);
        }
        self.entries[pnum as usize] =
            PebEntry { owner: None, lnum: 0, in_use: false, bad: true };
        if !prev.in_use {
            return Ok(pnum);
        }
        let vol = prev.owner
            .unwrap_or_else(|| panic!("in-use PEB {pnum} has no owner"));
        let replacement = self.geometry.area_of(vol)
            .find(|&p| self.entries[p as usize].is_free());
        match replacement {
            Some(new_pnum) => {
                self.entries[new_pnum as usize] = PebEntry {
                    owner: Some(vol),
                    lnum: prev.lnum,
                    in_use: true,
                    bad: false,
                };
                tracing::info!(
                    "volume {vol}: LEB {} moved from bad PEB {pnum} to \
                     PEB {new_pnum}", prev.lnum);
                Ok(new_pnum)
            }
            None => {
                tracing::error!(
                    "volume {vol}: PEB {pnum} went bad and no replacement \
                     is available; LEB {} is lost", prev.lnum);
                Err(Error::NoSpace { vol })
            }
        }
    }
}

impl Display for PebMap {
    /// Print a human-readable summary of the map, for debugging.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let used = self.entries.iter().filter(|e| e.in_use).count();
        let bad = self.entries.iter().filter(|e| e.bad).count();
        writeln!(f, "PebMap: {} PEBs: {} used, {} bad, {} free",
            self.entries.len(), used, bad,
            self.entries.len() - used - bad)?;
        for (pnum, e) in self.entries.iter().enumerate() {
            if !e.is_occupied() {
                continue;
            }
            match (e.bad, e.owner) {
                (true, _) => writeln!(f, "{pnum:>6} | bad")?,
                (false, Some(vol)) =>
                    writeln!(f, "{pnum:>6} | {vol:>8} {:>6}", e.lnum)?,
                (false, None) => writeln!(f, "{pnum:>6} | ???")?,
            }
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
