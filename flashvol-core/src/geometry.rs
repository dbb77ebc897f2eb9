// vim: tw=80
//! Device geometry and reserved-area configuration.
//!
//! The geometry is supplied once at construction by the attach
//! orchestrator.  It fixes the PEB index space, the eraseblock and minimum
//! I/O sizes, and how many PEBs at the start of the device are reserved
//! for the layout volume.  Every volume class maps to an explicit
//! contiguous reserved area: the layout volume owns the device prefix,
//! every other volume is confined to the remaining suffix.

use std::ops::Range;

use crate::types::*;

/// Physical shape of the flash device, plus the layout-volume reservation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Total number of physical erase blocks.
    pub peb_count: PebNum,
    /// Size of one eraseblock in bytes.  Logical eraseblocks have the same
    /// payload size at this layer.
    pub eb_size: usize,
    /// Minimum unit the flash can program.  On-media tables are padded to
    /// a multiple of this.
    pub min_io_size: usize,
    /// Number of PEBs at the start of the device reserved for the layout
    /// volume.  This is both the layout volume's size and the extent of
    /// its reserved area.
    pub layout_pebs: PebNum,
    /// Number of redundant on-media table copies.  The recovery protocol
    /// is written for exactly two.
    pub layout_copies: u32,
}

impl Geometry {
    pub fn new(
        peb_count: PebNum,
        eb_size: usize,
        min_io_size: usize,
        layout_pebs: PebNum,
        layout_copies: u32,
    ) -> Result<Self> {
        if layout_copies != 2 {
            return Err(Error::Geometry("exactly two table copies required"));
        }
        if layout_pebs == 0 || layout_pebs % layout_copies != 0 {
            return Err(Error::Geometry(
                "layout reservation must split evenly across copies",
            ));
        }
        if peb_count <= layout_pebs {
            return Err(Error::Geometry(
                "device smaller than the layout reservation",
            ));
        }
        if min_io_size == 0 || !min_io_size.is_power_of_two() {
            return Err(Error::Geometry(
                "minimum I/O size must be a power of two",
            ));
        }
        if eb_size == 0 || eb_size % min_io_size != 0 {
            return Err(Error::Geometry(
                "eraseblock size must be a multiple of the minimum I/O size",
            ));
        }
        Ok(Geometry {
            peb_count,
            eb_size,
            min_io_size,
            layout_pebs,
            layout_copies,
        })
    }

    /// How many LEBs each table copy occupies.
    pub fn ebs_per_copy(&self) -> u32 {
        self.layout_pebs / self.layout_copies
    }

    /// The contiguous PEB range a volume is confined to.  All allocation,
    /// lookup, resize, and replacement for the volume happen inside this
    /// range.
    pub fn area_of(&self, vol: VolId) -> Range<PebNum> {
        if vol == VolId::LAYOUT {
            0..self.layout_pebs
        } else {
            self.layout_pebs..self.peb_count
        }
    }

    /// Reserved area for ranges with no owning volume (bad blocks found
    /// outside any reservation): the whole device.
    pub fn whole_device(&self) -> Range<PebNum> {
        0..self.peb_count
    }
}

// LCOV_EXCL_STOP
