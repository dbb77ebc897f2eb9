// vim: tw=80
mod device;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use flashvol_core::flash::{LebIo, ReadQuality};
use flashvol_core::types::*;

/// A RAM-backed logical-eraseblock store with fault injection, standing
/// in for the eraseblock-association layer.
#[derive(Clone)]
pub struct RamFlash {
    inner: Arc<Inner>,
}

struct Inner {
    leb_size: usize,
    lebs: Mutex<HashMap<(VolId, LebNum), Vec<u8>>>,
    failing: Mutex<HashSet<(VolId, LebNum)>>,
}

impl RamFlash {
    pub fn new(leb_size: usize) -> Self {
        RamFlash {
            inner: Arc::new(Inner {
                leb_size,
                lebs: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Snapshot one LEB's bytes; `None` if it is unmapped.
    pub fn leb(&self, vol: VolId, lnum: LebNum) -> Option<Vec<u8>> {
        self.inner.lebs.lock().unwrap().get(&(vol, lnum)).cloned()
    }

    /// Restore a previously snapshotted LEB, bypassing the device.
    pub fn restore(&self, vol: VolId, lnum: LebNum, bytes: Vec<u8>) {
        assert_eq!(bytes.len(), self.inner.leb_size);
        self.inner.lebs.lock().unwrap().insert((vol, lnum), bytes);
    }

    /// Flip one bit of a mapped LEB, simulating media corruption.
    pub fn flip_bit(&self, vol: VolId, lnum: LebNum, byte: usize, bit: u8)
    {
        let mut lebs = self.inner.lebs.lock().unwrap();
        let data = lebs.get_mut(&(vol, lnum)).expect("LEB is unmapped");
        data[byte] ^= 1 << bit;
    }

    /// Make every read of this LEB fail hard until restored.
    pub fn break_reads(&self, vol: VolId, lnum: LebNum) {
        self.inner.failing.lock().unwrap().insert((vol, lnum));
    }

    pub fn fix_reads(&self, vol: VolId, lnum: LebNum) {
        self.inner.failing.lock().unwrap().remove(&(vol, lnum));
    }
}

impl LebIo for RamFlash {
    fn read_leb(
        &self,
        vol: VolId,
        lnum: LebNum,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<ReadQuality> {
        if self.inner.failing.lock().unwrap().contains(&(vol, lnum)) {
            return Err(Error::Io("uncorrectable ECC error".to_owned()));
        }
        let lebs = self.inner.lebs.lock().unwrap();
        match lebs.get(&(vol, lnum)) {
            Some(data) => {
                buf.copy_from_slice(&data[offset..offset + buf.len()]);
            }
            // An unmapped LEB reads back as erased flash.
            None => buf.fill(0xff),
        }
        Ok(ReadQuality::Clean)
    }

    fn write_leb(
        &self,
        vol: VolId,
        lnum: LebNum,
        buf: &[u8],
        offset: usize,
    ) -> Result<()> {
        let mut lebs = self.inner.lebs.lock().unwrap();
        let data = lebs.entry((vol, lnum))
            .or_insert_with(|| vec![0xff; self.inner.leb_size]);
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn unmap_leb(&self, vol: VolId, lnum: LebNum) -> Result<()> {
        self.inner.lebs.lock().unwrap().remove(&(vol, lnum));
        Ok(())
    }
}
