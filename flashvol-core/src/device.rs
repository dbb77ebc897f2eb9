// vim: tw=80
//! The attached-device aggregate.
//!
//! Owns the PEB map behind a single-writer lock, the in-memory volume
//! descriptors, and the working table copies.  Every externally visible
//! mutation runs map update and commit under the table lock, so the
//! A-then-B write ordering of the durability protocol is never
//! interleaved.  Lookups only take the map's read lock.

use std::sync::{Mutex, RwLock};

use crate::compact::{self, PebRun};
use crate::flash::{BadBlock, LebIo};
use crate::geometry::Geometry;
use crate::layout::{self, Tables};
use crate::pmap::PebMap;
use crate::types::*;
use crate::volume::Volume;
use crate::vtbl::{TableShape, VolumeKind, VolumeRecord, VOL_NAME_MAX};

/// Attributes supplied when creating or resizing a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttrs {
    pub name: String,
    pub alignment: u32,
    pub kind: VolumeKind,
    pub autoresize: bool,
}

/// One entry of a batch rename request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Rename {
    To(String),
    Remove,
}

struct State {
    map: PebMap,
    /// One slot per volume-table record.
    volumes: Vec<Option<Volume>>,
    layout_vol: Volume,
    bad_pebs: u32,
}

/// An attached device: the sole owner of this layer's runtime state.
pub struct Device {
    geometry: Geometry,
    shape: TableShape,
    io: Box<dyn LebIo>,
    state: RwLock<State>,
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("geometry", &self.geometry)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Attach: place the layout volume, run the two-copy recovery
    /// protocol, rebuild the map from the winning range table, and
    /// cross-check the result.  A failure leaves nothing attached.
    pub fn attach(
        geometry: Geometry,
        io: Box<dyn LebIo>,
        bad_block: &dyn BadBlock,
    ) -> Result<Device> {
        let shape = TableShape::new(&geometry)?;
        let mut map = PebMap::new(geometry);
        place_layout_volume(&mut map, &geometry, bad_block)?;
        let layout_vol = layout_volume_descriptor(&geometry);

        let tables = layout::attach(io.as_ref(), &geometry, &shape, &map)?;

        let stored = tables.ptbl.runs()?
            .into_iter()
            .filter_map(|run| clamp_stored_run(&geometry, run));
        compact::reconstruct(stored, &mut map)?;

        let mut volumes: Vec<Option<Volume>> = vec![None; shape.vtbl_slots];
        let mut reserved_total = geometry.layout_pebs;
        for (i, slot) in volumes.iter_mut().enumerate() {
            if let Some(rec) = tables.vtbl.record(i)? {
                let vol = Volume::from_record(VolId(i as u32), &rec,
                    &geometry);
                if vol.corrupted {
                    tracing::warn!(
                        "volume {}: interrupted update; contents are \
                         damaged", vol.id);
                }
                reserved_total += vol.reserved_pebs;
                *slot = Some(vol);
            }
        }

        let bad_pebs = (0..map.peb_count())
            .filter(|&pnum| map.entry(pnum).bad)
            .count() as u32;
        let good_pebs = geometry.peb_count - bad_pebs;
        if reserved_total > good_pebs {
            tracing::warn!(
                "not enough PEBs: {reserved_total} reserved, \
                 {good_pebs} good");
        }

        check_volume_map(&mut map, &mut volumes, &shape)?;

        tracing::info!(
            "attached: {} PEBs, {} volumes, {bad_pebs} bad blocks",
            geometry.peb_count, map.volume_count());
        Ok(Device {
            geometry,
            shape,
            io,
            state: RwLock::new(State {
                map,
                volumes,
                layout_vol,
                bad_pebs,
            }),
            tables: Mutex::new(tables),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Which PEB currently backs `lnum` of `vol`?
    pub fn lookup_pnum(&self, vol: VolId, lnum: LebNum) -> Option<PebNum> {
        self.state.read().unwrap().map.lookup(vol, lnum)
    }

    /// A copy of the named volume's descriptor.
    pub fn volume(&self, vol: VolId) -> Option<Volume> {
        let state = self.state.read().unwrap();
        if vol == VolId::LAYOUT {
            return Some(state.layout_vol.clone());
        }
        self.slot_of(vol).ok()
            .and_then(|slot| state.volumes[slot].clone())
    }

    /// How many PEBs the volume currently holds in the map.
    pub fn volume_peb_count(&self, vol: VolId) -> usize {
        self.state.read().unwrap().map.volume_peb_count(vol)
    }

    /// Good and bad PEB totals.
    pub fn peb_counts(&self) -> (u32, u32) {
        let state = self.state.read().unwrap();
        (self.geometry.peb_count - state.bad_pebs, state.bad_pebs)
    }

    /// Dump the PEB map in human-readable form, for debugging purposes.
    #[doc(hidden)]
    pub fn dump_map(&self) -> String {
        format!("{}", self.state.read().unwrap().map)
    }

    /// Create `vol` with the given attributes, or resize it, to exactly
    /// `target_pebs` blocks, and make the result durable.
    ///
    /// On a commit failure the map already reflects the resize; the
    /// caller decides whether to retry or roll back.
    pub fn create_or_resize_volume(
        &self,
        vol: VolId,
        attrs: &VolumeAttrs,
        target_pebs: u32,
    ) -> Result<()> {
        let slot = self.slot_of(vol)?;
        if target_pebs == 0 {
            return Err(Error::BadAttrs(
                "zero-size volume; use remove_volume",
            ));
        }
        self.validate_attrs(attrs)?;
        let mut tables = self.tables.lock().unwrap();
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        for (i, other) in state.volumes.iter().enumerate() {
            if let Some(other) = other {
                if i != slot && other.name == attrs.name {
                    return Err(Error::BadAttrs("duplicate volume name"));
                }
            }
        }
        state.map.resize_volume(vol, target_pebs)?;
        let rec = VolumeRecord {
            reserved_pebs: target_pebs,
            alignment: attrs.alignment,
            data_pad: (self.geometry.eb_size
                % attrs.alignment as usize) as u32,
            kind: attrs.kind,
            upd_marker: false,
            autoresize: attrs.autoresize,
            name: attrs.name.clone(),
        };
        tables.vtbl.set_record(slot, Some(&rec));
        state.volumes[slot] =
            Some(Volume::from_record(vol, &rec, &self.geometry));
        self.commit(&mut tables, &state.map)
    }

    /// Delete `vol`: clear its map entries, empty its record, commit.
    pub fn remove_volume(&self, vol: VolId) -> Result<()> {
        let slot = self.slot_of(vol)?;
        let mut tables = self.tables.lock().unwrap();
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        if state.volumes[slot].is_none() {
            return Err(Error::NoVolume(vol));
        }
        state.map.resize_volume(vol, 0)?;
        tables.vtbl.set_record(slot, None);
        state.volumes[slot] = None;
        self.commit(&mut tables, &state.map)
    }

    /// Rename or remove several volumes in one durable step.  The map
    /// only changes for removals.
    pub fn rename_volumes(&self, list: &[(VolId, Rename)]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        for (vol, op) in list {
            let slot = self.slot_of(*vol)?;
            if state.volumes[slot].is_none() {
                return Err(Error::NoVolume(*vol));
            }
            match op {
                Rename::Remove => {
                    state.map.resize_volume(*vol, 0)?;
                    tables.vtbl.set_record(slot, None);
                    state.volumes[slot] = None;
                }
                Rename::To(name) => {
                    if name.is_empty() || name.len() > VOL_NAME_MAX {
                        return Err(Error::BadAttrs("bad name length"));
                    }
                    let taken = state.volumes.iter().enumerate().any(
                        |(i, v)| {
                            i != slot && v.as_ref()
                                .map_or(false, |v| v.name == *name)
                        });
                    if taken {
                        return Err(Error::BadAttrs(
                            "duplicate volume name"));
                    }
                    let volume = state.volumes[slot].as_mut().unwrap();
                    volume.name = name.clone();
                    tables.vtbl.set_record(slot,
                        Some(&volume.to_record()));
                }
            }
        }
        self.commit(&mut tables, &state.map)
    }

    /// Mark `pnum` bad, migrate its assignment if it held one, and make
    /// the new state durable.
    ///
    /// Even when no replacement space exists the bad marking is still
    /// committed, so the block is never re-allocated after a reboot, and
    /// the space error reporting the data loss is returned.
    pub fn replace_bad_peb(&self, pnum: PebNum) -> Result<PebNum> {
        if pnum >= self.geometry.peb_count {
            return Err(Error::OutOfArea {
                first: pnum,
                count: 1,
                area_start: 0,
                area_end: self.geometry.peb_count,
            });
        }
        let mut tables = self.tables.lock().unwrap();
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        let was_bad = state.map.entry(pnum).bad;
        let result = state.map.mark_bad_and_replace(pnum);
        if !was_bad {
            state.bad_pebs += 1;
        }
        match result {
            Ok(new_pnum) => {
                self.commit(&mut tables, &state.map)?;
                Ok(new_pnum)
            }
            Err(e) => {
                // The data is lost but the marking must survive reboot.
                if let Err(ce) = self.commit(&mut tables, &state.map) {
                    tracing::error!(
                        "failed to commit bad-block mark for PEB \
                         {pnum}: {ce}");
                }
                Err(e)
            }
        }
    }

    fn commit(&self, tables: &mut Tables, map: &PebMap) -> Result<()> {
        layout::commit(self.io.as_ref(), &self.geometry, &self.shape,
            tables, map)
    }

    /// Map a volume id to its table slot.
    fn slot_of(&self, vol: VolId) -> Result<usize> {
        if vol.is_internal() || vol.0 as usize >= self.shape.vtbl_slots {
            return Err(Error::NoVolume(vol));
        }
        Ok(vol.0 as usize)
    }

    fn validate_attrs(&self, attrs: &VolumeAttrs) -> Result<()> {
        if attrs.name.is_empty() || attrs.name.len() > VOL_NAME_MAX {
            return Err(Error::BadAttrs("bad name length"));
        }
        let alignment = attrs.alignment as usize;
        if alignment == 0 || alignment > self.geometry.eb_size {
            return Err(Error::BadAttrs("bad alignment"));
        }
        if alignment != 1 && alignment % self.geometry.min_io_size != 0 {
            return Err(Error::BadAttrs(
                "alignment not a multiple of the minimum I/O size",
            ));
        }
        Ok(())
    }
}

/// Claim the device prefix for the layout volume, consulting the
/// bad-block detector.  A bad block inside the prefix has nowhere to go,
/// since the layout volume may not leave its reserved area, so it is
/// fatal.
fn place_layout_volume(
    map: &mut PebMap,
    geometry: &Geometry,
    bad_block: &dyn BadBlock,
) -> Result<()> {
    map.resize_volume(VolId::LAYOUT, geometry.layout_pebs)?;
    for pnum in 0..geometry.layout_pebs {
        if bad_block.is_bad(pnum)? {
            map.mark_bad_and_replace(pnum).map_err(|e| {
                tracing::error!(
                    "no good PEBs available for the layout volume");
                e
            })?;
        }
    }
    Ok(())
}

fn layout_volume_descriptor(geometry: &Geometry) -> Volume {
    let rec = VolumeRecord {
        reserved_pebs: geometry.layout_pebs,
        alignment: 1,
        data_pad: 0,
        kind: VolumeKind::Dynamic,
        upd_marker: false,
        autoresize: false,
        name: "layout volume".to_owned(),
    };
    Volume::from_record(VolId::LAYOUT, &rec, geometry)
}

/// Decide how much of one stored range to replay into the freshly-placed
/// map.
///
/// Layout-volume ranges are dropped (the placement scan has already
/// claimed the prefix) and bad ranges are clamped past it, since prefix
/// badness is re-derived by that same scan.
fn clamp_stored_run(geometry: &Geometry, mut run: PebRun)
    -> Option<PebRun>
{
    if run.owner == Some(VolId::LAYOUT) {
        return None;
    }
    if run.bad && run.first_pnum < geometry.layout_pebs {
        let skipped = geometry.layout_pebs - run.first_pnum;
        if skipped >= run.len {
            return None;
        }
        tracing::debug!(
            "bad range at PEB {}: skipping {skipped} blocks inside the \
             layout prefix", run.first_pnum);
        run.first_pnum = geometry.layout_pebs;
        run.len -= skipped;
    }
    Some(run)
}

/// Cross-check the rebuilt map against the volume table.
///
/// On-media checksums protect against bit rot, not against logic bugs or
/// tampering, so the two views must agree before anything is exposed.
fn check_volume_map(
    map: &mut PebMap,
    volumes: &mut [Option<Volume>],
    shape: &TableShape,
) -> Result<()> {
    // Range validation bounds every owner id, so the distinct-owner count
    // cannot exceed the table slots plus the layout volume.
    debug_assert!(map.volume_count() <= shape.vtbl_slots + 1);
    for (i, slot) in volumes.iter_mut().enumerate() {
        let vol = VolId(i as u32);
        let count = map.volume_peb_count(vol);
        match slot {
            None => {
                if count > 0 {
                    // An unclean reboot interrupted a volume removal.
                    tracing::info!("finishing removal of volume {vol}");
                    map.resize_volume(vol, 0)?;
                }
            }
            Some(v) => {
                if count == 0 {
                    // Interrupted creation; the next resize repairs it.
                    continue;
                }
                if count > v.reserved_pebs as usize {
                    tracing::error!(
                        "volume {vol}: {count} mapped PEBs, {} reserved",
                        v.reserved_pebs);
                    return Err(Error::Mismatch {
                        vol,
                        reason: "more PEBs mapped than reserved",
                    });
                }
                if count < v.reserved_pebs as usize {
                    // Blocks went bad without replacement; their LEBs are
                    // gone.
                    tracing::warn!(
                        "volume {vol} misses {} LEBs; contents are \
                         damaged", v.reserved_pebs as usize - count);
                    v.corrupted = true;
                    continue;
                }
                for lnum in 0..v.reserved_pebs {
                    if map.lookup(vol, lnum).is_none() {
                        return Err(Error::Mismatch {
                            vol,
                            reason: "a reserved LEB has no mapping",
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

// LCOV_EXCL_STOP
