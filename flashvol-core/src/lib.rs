// vim: tw=80

//! flashvol: the volume-metadata layer of a flash translation layer.
//!
//! Tracks which physical erase block backs which logical erase block of
//! which volume, and persists that mapping, along with per-volume
//! attributes, across power loss using two redundant, checksummed
//! on-media table copies.

pub mod compact;
pub mod device;
pub mod flash;
pub mod geometry;
pub mod layout;
pub mod pmap;
pub mod types;
pub mod util;
pub mod volume;
pub mod vtbl;

pub use crate::types::*;
