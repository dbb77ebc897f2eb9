// vim: tw=80
//! End-to-end persistence tests, driving an attached device over a
//! RAM-backed flash fake with fault injection.

use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};

use flashvol_core::device::{Device, Rename, VolumeAttrs};
use flashvol_core::flash::NoBadBlocks;
use flashvol_core::geometry::Geometry;
use flashvol_core::types::*;
use flashvol_core::vtbl::{TableShape, VolumeKind, VolumeTable};

use super::RamFlash;

const V: VolId = VolId(0);
const W: VolId = VolId(1);

/// Ten PEBs, layout volume at PEBs 0-1 (one LEB per copy, tables sharing
/// it), general area at PEBs 2-9.
fn geom() -> Geometry {
    Geometry::new(10, 65536, 512, 2, 2).unwrap()
}

fn attrs(name: &str) -> VolumeAttrs {
    VolumeAttrs {
        name: name.to_owned(),
        alignment: 1,
        kind: VolumeKind::Dynamic,
        autoresize: false,
    }
}

fn attach(flash: &RamFlash) -> Device {
    Device::attach(geom(), Box::new(flash.clone()), &NoBadBlocks).unwrap()
}

#[fixture]
fn dev() -> (Device, RamFlash) {
    let flash = RamFlash::new(65536);
    let device = attach(&flash);
    (device, flash)
}

/// Both table copies, as raw bytes.  With one LEB per copy, copy 0 is
/// LEB 0 and copy 1 is LEB 1 of the layout volume.
fn copies(flash: &RamFlash) -> (Vec<u8>, Vec<u8>) {
    (flash.leb(VolId::LAYOUT, 0).expect("copy 0 unmapped"),
     flash.leb(VolId::LAYOUT, 1).expect("copy 1 unmapped"))
}

#[rstest]
fn first_use_formats_both_copies(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    let (a, b) = copies(&flash);
    assert_eq!(a, b);
    let layout = device.volume(VolId::LAYOUT).unwrap();
    assert_eq!(layout.reserved_pebs, 2);
    assert_eq!(device.lookup_pnum(VolId::LAYOUT, 0), Some(0));
    assert_eq!(device.lookup_pnum(VolId::LAYOUT, 1), Some(1));
    assert_eq!(device.peb_counts(), (10, 0));
}

#[rstest]
fn scenario_a_create(dev: (Device, RamFlash)) {
    let (device, _flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    assert_eq!(device.lookup_pnum(V, 0), Some(2));
    assert_eq!(device.lookup_pnum(V, 1), Some(3));
    assert_eq!(device.lookup_pnum(V, 2), Some(4));
    assert_eq!(device.volume_peb_count(V), 3);
    let vol = device.volume(V).unwrap();
    assert_eq!(vol.name, "v");
    assert_eq!(vol.reserved_pebs, 3);
    assert_eq!(vol.usable_leb_size, 65536);
}

#[rstest]
fn scenario_b_shrink(dev: (Device, RamFlash)) {
    let (device, _flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    device.create_or_resize_volume(V, &attrs("v"), 1).unwrap();
    assert_eq!(device.lookup_pnum(V, 0), Some(2));
    assert_eq!(device.lookup_pnum(V, 1), None);
    assert_eq!(device.lookup_pnum(V, 2), None);
    assert_eq!(device.volume_peb_count(V), 1);
    // The freed blocks are reusable by another volume.
    device.create_or_resize_volume(W, &attrs("w"), 2).unwrap();
    assert_eq!(device.lookup_pnum(W, 0), Some(3));
    assert_eq!(device.lookup_pnum(W, 1), Some(4));
}

#[rstest]
fn scenario_c_bad_block_replacement(dev: (Device, RamFlash)) {
    let (device, _flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    assert_eq!(device.replace_bad_peb(3).unwrap(), 5);
    assert_eq!(device.lookup_pnum(V, 1), Some(5));
    assert_eq!(device.volume_peb_count(V), 3);
    assert_eq!(device.peb_counts(), (9, 1));
}

#[rstest]
fn scenario_d_corrupt_copy_0_adopts_copy_1(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    drop(device);
    let (_, b_before) = copies(&flash);
    // Flip a bit inside the first volume record's checksum field.
    flash.flip_bit(VolId::LAYOUT, 0, 168, 3);
    let device = attach(&flash);
    // Copy 1 won, and copy 0 was rewritten to match it exactly.
    let (a, b) = copies(&flash);
    assert_eq!(b, b_before);
    assert_eq!(a, b);
    assert_eq!(device.lookup_pnum(V, 0), Some(2));
    assert_eq!(device.volume(V).unwrap().name, "v");
}

#[rstest]
fn dual_copy_convergence_after_every_commit(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    let (a, b) = copies(&flash);
    assert_eq!(a, b);
    device.create_or_resize_volume(V, &attrs("v"), 5).unwrap();
    let (a, b) = copies(&flash);
    assert_eq!(a, b);
    device.replace_bad_peb(2).unwrap();
    let (a, b) = copies(&flash);
    assert_eq!(a, b);
}

#[rstest]
fn power_loss_between_copies_prefers_copy_0(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 2).unwrap();
    let (_, old_b) = copies(&flash);
    // Commit a newer state, then roll copy 1 back to the old bytes,
    // simulating power loss between the two copy writes.
    device.create_or_resize_volume(V, &attrs("v"), 4).unwrap();
    drop(device);
    flash.restore(VolId::LAYOUT, 1, old_b);
    let device = attach(&flash);
    // Copy 0 carries the newer state and wins; copy 1 was rewritten.
    assert_eq!(device.volume(V).unwrap().reserved_pebs, 4);
    assert_eq!(device.volume_peb_count(V), 4);
    let (a, b) = copies(&flash);
    assert_eq!(a, b);
}

#[rstest]
fn unreadable_copy_0_recovers_from_copy_1(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    drop(device);
    flash.break_reads(VolId::LAYOUT, 0);
    let device = attach(&flash);
    assert_eq!(device.lookup_pnum(V, 2), Some(4));
    drop(device);
    // The rewrite went to the (still failing) copy 0; once reads work
    // again both copies match.
    flash.fix_reads(VolId::LAYOUT, 0);
    let (a, b) = copies(&flash);
    assert_eq!(a, b);
}

#[test_log::test]
fn both_copies_corrupt_is_fatal() {
    let flash = RamFlash::new(65536);
    let device = attach(&flash);
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    drop(device);
    flash.flip_bit(VolId::LAYOUT, 0, 7, 0);
    flash.flip_bit(VolId::LAYOUT, 1, 7, 0);
    let err = Device::attach(geom(), Box::new(flash.clone()),
        &NoBadBlocks).unwrap_err();
    assert_eq!(err, Error::BothCopiesBad);
}

#[rstest]
fn state_survives_reattach(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    device.create_or_resize_volume(W, &attrs("w"), 2).unwrap();
    device.replace_bad_peb(3).unwrap();
    device.create_or_resize_volume(V, &attrs("v"), 2).unwrap();
    let before = (0..10)
        .map(|lnum| (device.lookup_pnum(V, lnum),
                     device.lookup_pnum(W, lnum)))
        .collect::<Vec<_>>();
    drop(device);

    let device = attach(&flash);
    let after = (0..10)
        .map(|lnum| (device.lookup_pnum(V, lnum),
                     device.lookup_pnum(W, lnum)))
        .collect::<Vec<_>>();
    assert_eq!(before, after);
    assert_eq!(device.peb_counts(), (9, 1));
    assert_eq!(device.volume(V).unwrap().reserved_pebs, 2);
    assert_eq!(device.volume(W).unwrap().name, "w");
}

#[rstest]
fn remove_volume_frees_its_blocks(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    device.remove_volume(V).unwrap();
    assert_eq!(device.volume(V), None);
    assert_eq!(device.volume_peb_count(V), 0);
    drop(device);
    let device = attach(&flash);
    assert_eq!(device.volume(V), None);
    // The freed prefix is the first thing a new volume claims.
    device.create_or_resize_volume(W, &attrs("w"), 1).unwrap();
    assert_eq!(device.lookup_pnum(W, 0), Some(2));
}

#[rstest]
fn rename_volumes_batch(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 2).unwrap();
    device.create_or_resize_volume(W, &attrs("w"), 1).unwrap();
    device.rename_volumes(&[
        (V, Rename::To("volume-zero".to_owned())),
        (W, Rename::Remove),
    ]).unwrap();
    assert_eq!(device.volume(V).unwrap().name, "volume-zero");
    assert_eq!(device.volume(W), None);
    // The map did not change for the renamed volume.
    assert_eq!(device.lookup_pnum(V, 0), Some(2));
    drop(device);
    let device = attach(&flash);
    assert_eq!(device.volume(V).unwrap().name, "volume-zero");
    assert_eq!(device.volume(W), None);
}

#[rstest]
fn duplicate_names_rejected(dev: (Device, RamFlash)) {
    let (device, _flash) = dev;
    device.create_or_resize_volume(V, &attrs("twin"), 1).unwrap();
    assert_eq!(
        device.create_or_resize_volume(W, &attrs("twin"), 1).unwrap_err(),
        Error::BadAttrs("duplicate volume name"));
    assert_eq!(
        device.rename_volumes(
            &[(V, Rename::To("twin".to_owned()))]),
        Ok(()));
}

#[rstest]
fn growth_without_space_fails(dev: (Device, RamFlash)) {
    let (device, _flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 8).unwrap();
    assert_eq!(
        device.create_or_resize_volume(W, &attrs("w"), 1).unwrap_err(),
        Error::NoSpace { vol: W });
}

#[rstest]
fn replacement_exhaustion_reports_data_loss(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    device.create_or_resize_volume(V, &attrs("v"), 8).unwrap();
    assert_eq!(device.replace_bad_peb(4).unwrap_err(),
        Error::NoSpace { vol: V });
    // The bad marking was still committed; after reboot the block stays
    // quarantined, the volume is one LEB short and comes back flagged
    // corrupted.
    drop(device);
    let device = attach(&flash);
    assert_eq!(device.peb_counts(), (9, 1));
    assert_eq!(device.lookup_pnum(V, 2), None);
    assert_eq!(device.volume_peb_count(V), 7);
    assert!(device.volume(V).unwrap().corrupted);
}

/// An unclean reboot can leave map entries for a volume whose table
/// record was already emptied.  Attach finishes the removal.
#[test_log::test]
fn interrupted_removal_is_finished_at_attach() {
    let flash = RamFlash::new(65536);
    let device = attach(&flash);
    device.create_or_resize_volume(V, &attrs("v"), 3).unwrap();
    drop(device);

    // Empty V's record in both copies, leaving its ranges in place.
    let shape = TableShape::new(&geom()).unwrap();
    for copy in 0..2 {
        let leb = flash.leb(VolId::LAYOUT, copy).unwrap();
        let mut vtbl = VolumeTable::from_bytes(
            leb[..shape.vtbl_size].to_vec(), &shape);
        vtbl.set_record(0, None);
        let mut patched = leb.clone();
        patched[..shape.vtbl_size].copy_from_slice(vtbl.as_bytes());
        flash.restore(VolId::LAYOUT, copy, patched);
    }

    let device = attach(&flash);
    assert_eq!(device.volume(V), None);
    assert_eq!(device.volume_peb_count(V), 0);
    // The orphaned blocks are free again.
    device.create_or_resize_volume(W, &attrs("w"), 1).unwrap();
    assert_eq!(device.lookup_pnum(W, 0), Some(2));
}

/// A set update marker means an interrupted volume update; the volume
/// comes back flagged corrupted.
#[test_log::test]
fn update_marker_flags_volume_corrupted() {
    let flash = RamFlash::new(65536);
    let device = attach(&flash);
    device.create_or_resize_volume(V, &attrs("v"), 2).unwrap();
    drop(device);

    let shape = TableShape::new(&geom()).unwrap();
    for copy in 0..2 {
        let leb = flash.leb(VolId::LAYOUT, copy).unwrap();
        let mut vtbl = VolumeTable::from_bytes(
            leb[..shape.vtbl_size].to_vec(), &shape);
        let mut rec = vtbl.record(0).unwrap().unwrap();
        rec.upd_marker = true;
        vtbl.set_record(0, Some(&rec));
        let mut patched = leb.clone();
        patched[..shape.vtbl_size].copy_from_slice(vtbl.as_bytes());
        flash.restore(VolId::LAYOUT, copy, patched);
    }

    let device = attach(&flash);
    let vol = device.volume(V).unwrap();
    assert!(vol.upd_marker);
    assert!(vol.corrupted);
}

#[rstest]
fn static_volume_attributes(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    let a = VolumeAttrs {
        name: "firmware".to_owned(),
        alignment: 2048,
        kind: VolumeKind::Static,
        autoresize: true,
    };
    device.create_or_resize_volume(V, &a, 2).unwrap();
    drop(device);
    let device = attach(&flash);
    let vol = device.volume(V).unwrap();
    assert_eq!(vol.kind, VolumeKind::Static);
    assert_eq!(vol.alignment, 2048);
    assert_eq!(vol.data_pad, 0);
    assert!(vol.autoresize);
    assert_eq!(vol.used_ebs, 0);
}

#[rstest]
fn bad_attrs_rejected_before_any_mutation(dev: (Device, RamFlash)) {
    let (device, flash) = dev;
    let (a_before, b_before) = copies(&flash);
    let mut bad = attrs("v");
    bad.alignment = 0;
    assert_eq!(
        device.create_or_resize_volume(V, &bad, 1).unwrap_err(),
        Error::BadAttrs("bad alignment"));
    bad.alignment = 100;
    assert_eq!(
        device.create_or_resize_volume(V, &bad, 1).unwrap_err(),
        Error::BadAttrs(
            "alignment not a multiple of the minimum I/O size"));
    assert_eq!(
        device.create_or_resize_volume(V, &attrs(""), 1).unwrap_err(),
        Error::BadAttrs("bad name length"));
    assert_eq!(
        device.create_or_resize_volume(V, &attrs("v"), 0).unwrap_err(),
        Error::BadAttrs("zero-size volume; use remove_volume"));
    assert_eq!(
        device.create_or_resize_volume(VolId(9999), &attrs("v"), 1)
            .unwrap_err(),
        Error::NoVolume(VolId(9999)));
    // Nothing was committed.
    assert_eq!(copies(&flash), (a_before, b_before));
    assert_eq!(device.volume_peb_count(V), 0);
}
