// vim: tw=80
//! Transport backends
//!
//! Every transport dialect implements [`Backend`], and [`DRIVERS`] lists
//! them in the order the dispatcher probes them.  A backend's `open`
//! declines a device it cannot speak to with `ENXIO`, which tells the
//! dispatcher to try the next entry; any other error aborts the probe.

use crate::{
    device::DeviceInfo,
    types::{OpenFlags, Result, SectorT, SenseInfo},
    zone::{Zone, ZoneOp, ZoneOpFlags},
};
#[cfg(test)] use mockall::mock;
use std::{
    io::{IoSlice, IoSliceMut},
    path::Path,
};

pub mod ata;
#[cfg(target_os = "linux")]
pub mod block;
pub mod cdb;
pub mod fake;
pub mod scsi;
pub mod sg;

/// The operations every transport backend provides.
///
/// Sector arguments are always in 512-byte units; backends convert to
/// logical blocks at the wire boundary.  Buffer lengths are in bytes and the
/// I/O return values count 512-byte sectors.
pub trait Backend {
    /// Device identity and geometry, fixed at open time
    fn info(&self) -> &DeviceInfo;

    /// Sense data decoded from the most recent CHECK CONDITION, if any.
    /// Only commands that actually return sense update this.
    fn sense(&self) -> Option<SenseInfo>;

    /// Test-mode backends skip alignment and capacity validation in the
    /// upper layers.
    fn test_mode(&self) -> bool {
        false
    }

    /// Read zone information starting from `start`.
    ///
    /// With `zones == None` this is a count query: `*nr_zones` receives the
    /// total number of zones from `start` to the end of the device matching
    /// the filter in `ro`.  Otherwise at most `zones.len()` descriptors are
    /// filled and `*nr_zones` receives the number written.
    fn report_zones(&mut self, start: SectorT, ro: u8,
                    zones: Option<&mut [Zone]>, nr_zones: &mut u32)
        -> Result;

    /// Execute a zone management operation
    fn zone_op(&mut self, sector: SectorT, op: ZoneOp, flags: ZoneOpFlags)
        -> Result;

    /// Vectored read; returns sectors transferred, which may be short
    fn preadv(&mut self, bufs: &mut [IoSliceMut<'_>], sector: SectorT)
        -> Result<u64>;

    /// Vectored write; returns sectors transferred, which may be short
    fn pwritev(&mut self, bufs: &[IoSlice<'_>], sector: SectorT)
        -> Result<u64>;

    /// Drain the device's write cache
    fn flush(&mut self) -> Result;

    /// Release the device, surfacing any teardown failure.  Dropping the
    /// backend also releases it, silently.
    fn close(&mut self) -> Result {
        Ok(())
    }

    /// Configure the zones of an emulated device
    fn set_zones(&mut self, conv_size: SectorT, zone_size: SectorT)
        -> Result
    {
        let _ = (conv_size, zone_size);
        Err(crate::types::Error::EOPNOTSUPP)
    }

    /// Move the write pointer of an emulated device's zone
    fn set_write_pointer(&mut self, sector: SectorT, wp: SectorT) -> Result {
        let _ = (sector, wp);
        Err(crate::types::Error::EOPNOTSUPP)
    }
}

/// One entry in the backend probe order
pub(crate) struct Driver {
    /// The `OpenFlags` bit that selects this backend
    pub flag: OpenFlags,
    pub open: fn(&Path, OpenFlags) -> Result<Box<dyn Backend>>,
}

/// The fixed probe order.  The native block backend only exists where the
/// kernel offers the zoned-block ioctls.
pub(crate) const DRIVERS: &[Driver] = &[
    #[cfg(target_os = "linux")]
    Driver { flag: OpenFlags::DRV_BLOCK, open: block::open },
    Driver { flag: OpenFlags::DRV_SCSI, open: scsi::open },
    Driver { flag: OpenFlags::DRV_ATA, open: ata::open },
    Driver { flag: OpenFlags::DRV_FAKE, open: fake::open },
];

// LCOV_EXCL_START
#[cfg(test)]
mock! {
    pub Backend {}
    impl Backend for Backend {
        fn info(&self) -> &DeviceInfo;
        fn sense(&self) -> Option<SenseInfo>;
        fn test_mode(&self) -> bool;
        fn report_zones<'a>(&mut self, start: SectorT, ro: u8,
                            zones: Option<&'a mut [Zone]>,
                            nr_zones: &mut u32) -> Result;
        fn zone_op(&mut self, sector: SectorT, op: ZoneOp,
                   flags: ZoneOpFlags) -> Result;
        fn preadv<'a, 'b>(&mut self, bufs: &'a mut [IoSliceMut<'b>],
                          sector: SectorT) -> Result<u64>;
        fn pwritev<'a, 'b>(&mut self, bufs: &'a [IoSlice<'b>],
                           sector: SectorT) -> Result<u64>;
        fn flush(&mut self) -> Result;
        fn close(&mut self) -> Result;
        fn set_zones(&mut self, conv_size: SectorT, zone_size: SectorT)
            -> Result;
        fn set_write_pointer(&mut self, sector: SectorT, wp: SectorT)
            -> Result;
    }
}
// LCOV_EXCL_STOP
