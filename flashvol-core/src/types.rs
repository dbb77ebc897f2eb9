// vim: tw=80
//! Common type definitions used throughout flashvol

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

/// Indexes a physical erase block on the device.
pub type PebNum = u32;

/// Indexes a logical erase block within a volume.
pub type LebNum = u32;

/// Identifies a volume.
///
/// Ordinary volumes use ids equal to their volume-table slot.  Internal
/// volumes live in a reserved id range above [`VolId::INTERNAL_START`] and
/// have no table slot.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VolId(pub u32);

impl VolId {
    /// First id of the internal-volume range.
    pub const INTERNAL_START: u32 = 0x7fff_0000;

    /// The layout volume, holding both on-media table copies.
    pub const LAYOUT: VolId = VolId(0x7fff_efff);

    /// On-media encoding for "no owning volume".
    pub const NONE_ON_MEDIA: u32 = 0xffff_ffff;

    pub fn is_internal(self) -> bool {
        self.0 >= Self::INTERNAL_START
    }
}

impl Display for VolId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if *self == VolId::LAYOUT {
            "layout".fmt(f)
        } else {
            self.0.fmt(f)
        }
    }
}

/// Identifies one of the two on-media table copies.
pub type CopyNum = u32;

/// Which on-media table an error refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Table {
    Volume,
    Range,
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Table::Volume => "volume".fmt(f),
            Table::Range => "range".fmt(f),
        }
    }
}

/// flashvol's error type.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A record's checksum did not match.  The copy holding it is
    /// unreadable; recovery falls back to the other copy.
    #[error("bad CRC in {table} table record {slot}: {found:#010x}, not \
             {computed:#010x}")]
    Corrupt {
        table: Table,
        slot: usize,
        found: u32,
        computed: u32,
    },

    /// A record passed its checksum but violated a structural rule.
    /// Treated like `Corrupt` for recovery, logged differently.
    #[error("{table} table record {slot} is inconsistent: {reason}")]
    Inconsistent {
        table: Table,
        slot: usize,
        reason: &'static str,
    },

    /// The live map compacts into more ranges than the on-media table has
    /// slots.  Nothing was written.
    #[error("PEB map too fragmented: {ranges} ranges exceed {slots} table \
             slots")]
    TooFragmented { ranges: usize, slots: usize },

    /// A volume's reserved area has no free PEB left for growth or
    /// bad-block replacement.
    #[error("no free PEB available for volume {vol}")]
    NoSpace { vol: VolId },

    /// An allocation targeted an entry that is already claimed.
    #[error("PEB {pnum} is already allocated")]
    Collision { pnum: PebNum },

    /// An allocation span fell outside the owning volume's reserved area.
    #[error("PEB span {first}+{count} outside reserved area \
             [{area_start}, {area_end})")]
    OutOfArea {
        first: PebNum,
        count: u32,
        area_start: PebNum,
        area_end: PebNum,
    },

    /// The named volume does not exist.
    #[error("no such volume {0}")]
    NoVolume(VolId),

    /// The volume table and the rebuilt PEB map disagree despite both
    /// passing their own validation.
    #[error("volume {vol} disagrees with the PEB map: {reason}")]
    Mismatch { vol: VolId, reason: &'static str },

    /// Both on-media table copies failed validation.  The device cannot
    /// attach.
    #[error("both layout table copies are corrupted")]
    BothCopiesBad,

    /// The device geometry cannot host the on-media tables.
    #[error("invalid device geometry: {0}")]
    Geometry(&'static str),

    /// Volume attributes rejected before any mutation.
    #[error("invalid volume attributes: {0}")]
    BadAttrs(&'static str),

    /// A flash I/O collaborator call failed hard.  Propagated
    /// uninterpreted; retry policy belongs to the collaborator.
    #[error("flash I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// LCOV_EXCL_STOP
