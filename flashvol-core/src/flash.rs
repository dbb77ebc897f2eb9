// vim: tw=80
//! External collaborator seams.
//!
//! This layer never touches raw flash.  It consumes two narrow synchronous
//! interfaces: logical-eraseblock I/O, and the hardware bad-block
//! detector.  Every call may block the calling thread for the duration of
//! an erase or program cycle; the caller tolerates that synchronously.
//! No retries happen here; retry policy belongs to the implementations.

#[cfg(test)]
use mockall::automock;

use crate::types::*;

/// Outcome of a successful LEB read.
///
/// `BitFlips` signals a recoverable ECC correction: the data is good, but
/// the block should be scrubbed.  Hard failures are reported as `Err`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadQuality {
    Clean,
    BitFlips,
}

/// Logical-eraseblock I/O, provided by the eraseblock-association layer.
#[cfg_attr(test, automock)]
pub trait LebIo {
    /// Read `buf.len()` bytes from `lnum` of `vol`, starting at `offset`.
    /// An unmapped LEB reads back as erased flash (all 0xFF).
    fn read_leb(
        &self,
        vol: VolId,
        lnum: LebNum,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<ReadQuality>;

    /// Program `buf` into `lnum` of `vol` at `offset`.  The LEB must have
    /// been unmapped (erased) first if the span was previously written.
    fn write_leb(
        &self,
        vol: VolId,
        lnum: LebNum,
        buf: &[u8],
        offset: usize,
    ) -> Result<()>;

    /// Unmap (erase-equivalent) `lnum` of `vol`.
    fn unmap_leb(&self, vol: VolId, lnum: LebNum) -> Result<()>;
}

/// Hardware bad-block detection, consulted only while placing the layout
/// volume during attach.
#[cfg_attr(test, automock)]
pub trait BadBlock {
    fn is_bad(&self, pnum: PebNum) -> Result<bool>;
}

/// A device that is never bad.  Convenient default for media without
/// factory bad-block marks.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBadBlocks;

impl BadBlock for NoBadBlocks {
    fn is_bad(&self, _pnum: PebNum) -> Result<bool> {
        Ok(false)
    }
}
