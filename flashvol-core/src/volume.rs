// vim: tw=80
//! In-memory volume descriptors, derived from volume-table records plus
//! live map state at attach or volume creation.

use crate::geometry::Geometry;
use crate::types::*;
use crate::vtbl::{VolumeKind, VolumeRecord};

/// Runtime description of one volume.
///
/// Owned exclusively by the device aggregate; created when a non-empty
/// record is decoded or a volume is created, destroyed with the volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    pub id: VolId,
    pub name: String,
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub kind: VolumeKind,
    pub upd_marker: bool,
    pub autoresize: bool,
    /// Payload bytes per LEB after alignment padding.
    pub usable_leb_size: usize,
    pub used_ebs: u32,
    pub used_bytes: u64,
    /// Set when the update marker was found set at attach: an interrupted
    /// volume update left the contents damaged.
    pub corrupted: bool,
}

impl Volume {
    pub fn from_record(
        id: VolId,
        rec: &VolumeRecord,
        geometry: &Geometry,
    ) -> Self {
        let usable_leb_size = geometry.eb_size - rec.data_pad as usize;
        // A dynamic volume's fill level is unknown to this layer, so the
        // whole reservation counts as used.  A static volume's true data
        // size lives with the update protocol; until written it reports
        // empty.
        let used_ebs = match rec.kind {
            VolumeKind::Dynamic => rec.reserved_pebs,
            VolumeKind::Static => 0,
        };
        Volume {
            id,
            name: rec.name.clone(),
            reserved_pebs: rec.reserved_pebs,
            alignment: rec.alignment,
            data_pad: rec.data_pad,
            kind: rec.kind,
            upd_marker: rec.upd_marker,
            autoresize: rec.autoresize,
            usable_leb_size,
            used_ebs,
            used_bytes: u64::from(used_ebs) * usable_leb_size as u64,
            corrupted: rec.upd_marker,
        }
    }

    /// The record this volume serializes to.
    pub fn to_record(&self) -> VolumeRecord {
        VolumeRecord {
            reserved_pebs: self.reserved_pebs,
            alignment: self.alignment,
            data_pad: self.data_pad,
            kind: self.kind,
            upd_marker: self.upd_marker,
            autoresize: self.autoresize,
            name: self.name.clone(),
        }
    }
}

// LCOV_EXCL_STOP
