// vim: tw=80
//! Range compaction: the bridge between the live PEB map and the
//! fixed-slot on-media range table.
//!
//! Normal allocation order keeps a volume's PEBs physically contiguous,
//! so thousands of entries collapse into a handful of
//! (first PEB, first LEB, length) runs.  Extraction is a lazy iterator
//! consumed once per commit; reconstruction replays stored runs through
//! the map's own allocator at attach time.

use crate::pmap::PebMap;
use crate::types::*;

/// One contiguous run of identically-flagged PEBs.
///
/// The in-memory equivalent of an on-media range record.  `owner` is
/// `None` only for bad runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PebRun {
    pub first_pnum: PebNum,
    pub first_lnum: LebNum,
    pub len: u32,
    pub owner: Option<VolId>,
    pub bad: bool,
}

impl PebRun {
    /// Can `next` extend this run?  Physical adjacency is implied by the
    /// scan; in-use runs additionally require the logical index to follow
    /// on.
    fn accepts(&self, next: &crate::pmap::PebEntry) -> bool {
        next.owner == self.owner && next.bad == self.bad
            && (self.bad || next.lnum == self.first_lnum + self.len)
    }
}

/// Lazy iterator over the map's maximal runs, in ascending physical
/// order.
pub struct Runs<'a> {
    map: &'a PebMap,
    pnum: PebNum,
}

impl Iterator for Runs<'_> {
    type Item = PebRun;

    fn next(&mut self) -> Option<PebRun> {
        let count = self.map.peb_count();
        while self.pnum < count && !self.map.entry(self.pnum).is_occupied()
        {
            self.pnum += 1;
        }
        if self.pnum >= count {
            return None;
        }
        let first = self.map.entry(self.pnum);
        let mut run = PebRun {
            first_pnum: self.pnum,
            first_lnum: first.lnum,
            len: 1,
            owner: first.owner,
            bad: first.bad,
        };
        self.pnum += 1;
        while self.pnum < count {
            let e = self.map.entry(self.pnum);
            if !e.is_occupied() || !run.accepts(&e) {
                break;
            }
            run.len += 1;
            self.pnum += 1;
        }
        Some(run)
    }
}

/// Iterate over the map's compacted runs.
pub fn runs(map: &PebMap) -> Runs<'_> {
    Runs { map, pnum: 0 }
}

/// Merge runs that border each other on both the physical and the logical
/// axis, repeating until no merge applies.
///
/// The extraction scan already produces maximal runs; this is for
/// hand-built tables (first-format time) whose slots were filled out of
/// order.
pub fn normalize(runs: &mut Vec<PebRun>) {
    loop {
        let mut merged = None;
        'outer: for i in 0..runs.len() {
            for j in 0..runs.len() {
                if i != j && mergeable(&runs[i], &runs[j]) {
                    merged = Some((i, j));
                    break 'outer;
                }
            }
        }
        match merged {
            Some((i, j)) => {
                runs[i].len += runs[j].len;
                runs.remove(j);
            }
            None => break,
        }
    }
}

/// Does `b` directly follow `a` with the same owner and flags?
fn mergeable(a: &PebRun, b: &PebRun) -> bool {
    a.owner == b.owner && a.bad == b.bad
        && b.first_pnum == a.first_pnum + a.len
        && (a.bad || b.first_lnum == a.first_lnum + a.len)
}

/// Rebuild a map from stored runs by replaying each through the
/// allocator, in slot order.  The inverse of [`runs`].
pub fn reconstruct<I>(stored: I, map: &mut PebMap) -> Result<()>
    where I: IntoIterator<Item = PebRun>
{
    for run in stored {
        map.allocate_range(run.owner, run.first_pnum, run.first_lnum,
            run.len, run.bad)?;
    }
    Ok(())
}

// LCOV_EXCL_STOP
