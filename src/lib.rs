// vim: tw=80
//! User-space management of Zoned Block Devices.
//!
//! A zoned block device divides its logical address space into fixed-size
//! zones.  Some zones are conventional and accept random writes; others are
//! sequential-write-required and only accept writes at the zone's write
//! pointer.  This crate hides the transport dialects used to talk to such
//! devices (SCSI/ZBC, ATA/ZAC, the Linux zoned-block ioctls, and a
//! file-backed emulator) behind a single [`device::Device`] handle.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// I suppose I should probably fix this some day, but I just don't like the
// look of e.g. "Cdb" as opposed to "CDB".
#![allow(clippy::upper_case_acronyms)]

pub mod backend;
pub mod device;
pub mod types;
pub mod zone;

pub use crate::device::{
    is_zoned,
    Device,
    DeviceInfo,
    DeviceType,
    ZoneModel,
};
pub use crate::types::*;
pub use crate::zone::{
    ReportingOptions,
    Zone,
    ZoneCondition,
    ZoneOp,
    ZoneOpFlags,
    ZoneType,
};
