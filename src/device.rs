// vim: tw=80
//! Device handles and the operations callers see
//!
//! A [`Device`] is obtained from [`Device::open`], which probes the
//! transport backends in a fixed order until one accepts the target.  All
//! further operations dispatch through the chosen backend.
//!
//! A handle is exclusively owned.  Operations take `&mut self`, so Rust's
//! ownership rules already serialise access from safe code; wrap a handle in
//! a mutex before sharing it between threads.  Distinct handles, even to the
//! same device, may be used concurrently without coordination.

use crate::{
    backend::{Backend, DRIVERS},
    types::*,
    zone::{ReportingOptions, Zone, ZoneOp, ZoneOpFlags, RO_PARTIAL},
};
use enum_primitive_derive::Primitive;
use lazy_static::lazy_static;
use nix::unistd::{sysconf, SysconfVar};
use std::{
    fmt::{self, Display, Formatter},
    io::{IoSlice, IoSliceMut},
    path::{Path, PathBuf},
};
use tracing::{debug, error};

lazy_static! {
    /// The longest I/O vector the kernel will accept
    static ref IOV_MAX: usize = {
        sysconf(SysconfVar::IOV_MAX)
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(1024)
    };
}

/// Which transport backend a device was opened through
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Primitive)]
pub enum DeviceType {
    #[default]
    Unknown = 0x00,
    /// Kernel zoned-block-device ioctls
    Block   = 0x01,
    /// SCSI device implementing ZBC
    Scsi    = 0x02,
    /// ATA device implementing ZAC, driven through SCSI pass-through
    Ata     = 0x03,
    /// File-backed emulated device
    Fake    = 0x04,
}

/// How a device exposes (or hides) its zones
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Primitive)]
pub enum ZoneModel {
    #[default]
    Unknown       = 0x00,
    /// Zoned, but tolerates non-sequential writes to sequential zones
    HostAware     = 0x01,
    /// Zoned; non-sequential writes to sequential zones are rejected
    HostManaged   = 0x02,
    /// Zoned internally, but hides it.  Rejected by this library.
    DeviceManaged = 0x03,
    /// An ordinary, non-zoned block device
    Standard      = 0x04,
}

/// Sentinel: the device reports no limit on open sequential zones
pub const NO_LIMIT: u32 = u32::MAX;

/// Sentinel: the device does not report this value
pub const NOT_REPORTED: u32 = u32::MAX;

/// Capability flag: reads may cross the write pointer and zone boundaries
pub const UNRESTRICTED_READ: u32 = 0x0000_0001;

/// Identity, geometry and capabilities of an open device.
///
/// Populated by the backend at open time and immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    /// Vendor identification, at most 8 significant characters
    pub vendor_id:       String,
    pub dev_type:        DeviceType,
    pub model:           ZoneModel,
    /// Total capacity in 512-byte sectors
    pub sectors:         SectorT,
    /// Total capacity in logical blocks
    pub lblocks:         u64,
    /// Total capacity in physical blocks
    pub pblocks:         u64,
    /// Logical block size in bytes; a power-of-two multiple of 512
    pub lblock_size:     u32,
    /// Physical block size in bytes; a power-of-two multiple of 512
    pub pblock_size:     u32,
    /// Capability flag bitset ([`UNRESTRICTED_READ`], ...)
    pub flags:           u32,
    /// Largest single command transfer, in 512-byte sectors
    pub max_rw_sectors:  SectorT,
    /// Host-managed only: limit on concurrently open sequential zones
    pub max_nr_open_seq_req: u32,
    /// Host-aware only: optimal number of open sequential-preferred zones
    pub opt_nr_open_seq_pref: u32,
    /// Host-aware only: optimal number of non-sequentially written
    /// sequential-preferred zones
    pub opt_nr_non_seq_write_seq_pref: u32,
}

impl DeviceInfo {
    /// Sectors per logical block
    pub fn lblock_sectors(&self) -> SectorT {
        (self.lblock_size >> SECTOR_SHIFT) as SectorT
    }

    /// Sectors per physical block
    pub fn pblock_sectors(&self) -> SectorT {
        (self.pblock_size >> SECTOR_SHIFT) as SectorT
    }

    /// Is the sector value aligned to the logical block size?
    pub fn laligned(&self, v: SectorT) -> bool {
        v % self.lblock_sectors() == 0
    }

    /// Is the sector value aligned to the physical block size?
    pub fn paligned(&self, v: SectorT) -> bool {
        v % self.pblock_sectors() == 0
    }
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            DeviceType::Block => "Zoned block device",
            DeviceType::Scsi => "SCSI ZBC device",
            DeviceType::Ata => "ATA ZAC device",
            DeviceType::Fake => "Emulated zoned block device",
            DeviceType::Unknown => "Unknown-device-type",
        };
        s.fmt(f)
    }
}

impl Display for ZoneModel {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ZoneModel::HostAware => "Host-aware",
            ZoneModel::HostManaged => "Host-managed",
            ZoneModel::DeviceManaged => "Device-managed",
            ZoneModel::Standard => "Standard block device",
            ZoneModel::Unknown => "Unknown-device-model",
        };
        s.fmt(f)
    }
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "    Vendor ID: {}", self.vendor_id)?;
        if self.model == ZoneModel::Standard {
            writeln!(f, "    {} interface, standard block device",
                     self.dev_type)?;
        } else {
            writeln!(f, "    {} interface, {} zone model", self.dev_type,
                     self.model)?;
        }
        writeln!(f, "    {} 512-bytes sectors", self.sectors)?;
        writeln!(f, "    {} logical blocks of {} B", self.lblocks,
                 self.lblock_size)?;
        writeln!(f, "    {} physical blocks of {} B", self.pblocks,
                 self.pblock_size)?;
        writeln!(f, "    {:.3} GB capacity",
                 (self.sectors << SECTOR_SHIFT) as f64 / 1e9)?;
        if matches!(self.model, ZoneModel::HostManaged | ZoneModel::HostAware)
        {
            writeln!(f, "    Read commands are {}",
                     if self.flags & UNRESTRICTED_READ != 0 {
                         "unrestricted"
                     } else {
                         "restricted"
                     })?;
        }
        writeln!(f, "    {} KiB max R/W size",
                 (self.max_rw_sectors << SECTOR_SHIFT) / 1024)?;
        if self.model == ZoneModel::HostManaged {
            if self.max_nr_open_seq_req == NO_LIMIT {
                writeln!(f, "    Maximum number of open sequential write \
                             required zones: unlimited")?;
            } else {
                writeln!(f, "    Maximum number of open sequential write \
                             required zones: {}",
                         self.max_nr_open_seq_req)?;
            }
        } else if self.model == ZoneModel::HostAware {
            if self.opt_nr_open_seq_pref == NOT_REPORTED {
                writeln!(f, "    Optimal number of open sequential write \
                             preferred zones: not reported")?;
            } else {
                writeln!(f, "    Optimal number of open sequential write \
                             preferred zones: {}",
                         self.opt_nr_open_seq_pref)?;
            }
            if self.opt_nr_non_seq_write_seq_pref == NOT_REPORTED {
                writeln!(f, "    Optimal number of non-sequentially written \
                             sequential write preferred zones: not reported")?;
            } else {
                writeln!(f, "    Optimal number of non-sequentially written \
                             sequential write preferred zones: {}",
                         self.opt_nr_non_seq_write_seq_pref)?;
            }
        }
        Ok(())
    }
}

/// An open zoned block device.
///
/// The handle exclusively owns its backend and file descriptor; both are
/// released by [`Device::close`] or by dropping the handle.  All operations
/// take `&mut self`: a handle is a single-threaded object, and the last
/// decoded sense data ([`Device::last_error`]) is part of its state.
pub struct Device {
    path:    PathBuf,
    backend: Box<dyn Backend>,
}

impl Device {
    /// Open the zoned block device at `path`.
    ///
    /// Symlinks are resolved first, so device-mapper names work.  Backends
    /// are then probed in a fixed order (native block, SCSI, ATA, emulator)
    /// until one accepts the device.  The `DRV_*` bits of `flags` restrict
    /// the probe set; the emulator backend is only ever probed when
    /// [`OpenFlags::DRV_FAKE`] is set explicitly.
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Device> {
        let path = path.as_ref();
        let canonical = path.canonicalize()
            .map_err(|e| {
                error!("{}: Failed to get real path: {}", path.display(), e);
                Error::from(e)
            })?;

        let mut allowed = flags.drv_mask();
        if allowed == 0 {
            allowed = u32::MAX;
        }

        for drv in DRIVERS {
            if allowed & drv.flag.bits() == 0 {
                continue;
            }
            match (drv.open)(&canonical, flags) {
                Ok(backend) => {
                    debug!("{}: opened as {}", canonical.display(),
                           backend.info().dev_type);
                    return Ok(Device { path: canonical, backend });
                }
                // This backend can't speak to the device; try the next
                Err(Error::ENXIO) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::ENODEV)
    }

    /// Release the device, surfacing any teardown failure
    pub fn close(mut self) -> Result {
        self.backend.close()
    }

    /// The resolved path this device was opened from
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Identity and geometry collected when the device was opened
    pub fn info(&self) -> &DeviceInfo {
        self.backend.info()
    }

    /// Sense data from the most recent command the device failed with
    /// CHECK CONDITION.  Local validation failures (`EINVAL` and friends)
    /// never change this.
    pub fn last_error(&self) -> Option<SenseInfo> {
        self.backend.sense()
    }

    /// Count the zones from `start` to the end of the device that match the
    /// `ro` filter
    pub fn report_nr_zones(&mut self, start: SectorT, ro: ReportingOptions)
        -> Result<u32>
    {
        if !self.backend.test_mode() && start >= self.info().sectors {
            // No zones to report beyond the device capacity
            return Ok(0);
        }
        let mut nr_zones = 0;
        self.backend.report_zones(start, ro.mask(), None, &mut nr_zones)?;
        Ok(nr_zones)
    }

    /// Fill `zones` with descriptors of the zones from `start` matching the
    /// `ro` filter, in ascending sector order.  Returns the number of
    /// descriptors written, which is smaller than `zones.len()` when the
    /// end of the device is reached first.
    pub fn report_zones(&mut self, start: SectorT, ro: ReportingOptions,
                        zones: &mut [Zone]) -> Result<u32>
    {
        let capacity = self.info().sectors;
        if !self.backend.test_mode() && start >= capacity {
            return Ok(0);
        }

        let max = zones.len() as u32;
        let mut nz: u32 = 0;
        let mut sector = start;
        while nz < max {
            let mut n = max - nz;
            self.backend.report_zones(sector, ro.mask() | RO_PARTIAL,
                                      Some(&mut zones[nz as usize..]),
                                      &mut n)
                .map_err(|e| {
                    error!("{}: Get zones from sector {} failed: {:?}",
                           self.path.display(), sector, e);
                    e
                })?;
            if n == 0 {
                break;
            }
            nz += n;

            let last = &zones[nz as usize - 1];
            let last_sector = last.start + last.length;
            if last_sector >= capacity {
                break;
            }
            sector = last_sector;
        }
        Ok(nz)
    }

    /// Report every matching zone from `start`, in a freshly allocated
    /// buffer sized by a count query.
    pub fn list_zones(&mut self, start: SectorT, ro: ReportingOptions)
        -> Result<Vec<Zone>>
    {
        let nr_zones = self.report_nr_zones(start, ro)?;
        if nr_zones == 0 {
            return Ok(Vec::new());
        }
        debug!("{}: {} zones", self.path.display(), nr_zones);
        let mut zones = vec![Zone::default(); nr_zones as usize];
        let n = self.report_zones(start, ro, &mut zones)?;
        zones.truncate(n as usize);
        Ok(zones)
    }

    /// Execute a zone management operation on the zone containing `sector`,
    /// or on all applicable zones with [`ZoneOpFlags::ALL_ZONES`].
    pub fn zone_op(&mut self, sector: SectorT, op: ZoneOp,
                   flags: ZoneOpFlags) -> Result
    {
        if !self.backend.test_mode() &&
            !flags.all_zones() &&
            !self.info().laligned(sector)
        {
            return Err(Error::EINVAL);
        }
        self.backend.zone_op(sector, op, flags)
    }

    /// Rewind the write pointer of the zone containing `sector`
    pub fn reset_zone(&mut self, sector: SectorT, flags: ZoneOpFlags)
        -> Result
    {
        self.zone_op(sector, ZoneOp::Reset, flags)
    }

    /// Explicitly open the zone containing `sector`
    pub fn open_zone(&mut self, sector: SectorT, flags: ZoneOpFlags)
        -> Result
    {
        self.zone_op(sector, ZoneOp::Open, flags)
    }

    /// Close the open zone containing `sector`
    pub fn close_zone(&mut self, sector: SectorT, flags: ZoneOpFlags)
        -> Result
    {
        self.zone_op(sector, ZoneOp::Close, flags)
    }

    /// Transition the zone containing `sector` to Full
    pub fn finish_zone(&mut self, sector: SectorT, flags: ZoneOpFlags)
        -> Result
    {
        self.zone_op(sector, ZoneOp::Finish, flags)
    }

    /// Read sectors into a scatter-gather list of buffers.
    ///
    /// `sector` and the summed buffer length must be logical-block aligned.
    /// Reads extending past the end of the device are clamped.  Returns the
    /// number of sectors read.
    pub fn preadv(&mut self, bufs: &mut [IoSliceMut<'_>], sector: SectorT)
        -> Result<u64>
    {
        let total = sglist_bytes(bufs.iter().map(|b| b.len()))?;
        if bufs.is_empty() || bufs.len() > *IOV_MAX {
            return Err(Error::EINVAL);
        }
        let count = self.io_prepare(total, sector, false)?;
        debug!("{}: Read {} sectors at sector {}, {} vectors",
               self.path.display(), count, sector, bufs.len());

        let max_rw = self.info().max_rw_sectors;
        let mut done: SectorT = 0;
        while done < count {
            let window = (count - done).min(max_rw);
            let mut scratch = carve_mut(bufs, (done as usize) << SECTOR_SHIFT,
                                        (window as usize) << SECTOR_SHIFT);
            let ret = self.backend.preadv(&mut scratch, sector + done)
                .map_err(|e| {
                    error!("{}: Read {} sectors at sector {} failed: {:?}",
                           self.path.display(), window, sector + done, e);
                    e
                })?;
            if ret == 0 {
                return Err(Error::EIO);
            }
            // The transfer may be short; just keep going from where it
            // stopped
            done += ret;
        }
        Ok(count)
    }

    /// Read sectors into one contiguous buffer
    pub fn pread(&mut self, buf: &mut [u8], sector: SectorT) -> Result<u64> {
        let mut iov = [IoSliceMut::new(buf)];
        self.preadv(&mut iov, sector)
    }

    /// Write sectors from a scatter-gather list of buffers.
    ///
    /// `sector` and the summed buffer length must be physical-block
    /// aligned; devices may accept sub-physical reads but not sub-physical
    /// writes.  Writes extending past the end of the device are clamped.
    /// Returns the number of sectors written.
    pub fn pwritev(&mut self, bufs: &[IoSlice<'_>], sector: SectorT)
        -> Result<u64>
    {
        let total = sglist_bytes(bufs.iter().map(|b| b.len()))?;
        if bufs.is_empty() || bufs.len() > *IOV_MAX {
            return Err(Error::EINVAL);
        }
        let count = self.io_prepare(total, sector, true)?;
        debug!("{}: Write {} sectors at sector {}, {} vectors",
               self.path.display(), count, sector, bufs.len());

        let max_rw = self.info().max_rw_sectors;
        let mut done: SectorT = 0;
        while done < count {
            let window = (count - done).min(max_rw);
            let scratch = carve(bufs, (done as usize) << SECTOR_SHIFT,
                                (window as usize) << SECTOR_SHIFT);
            let ret = self.backend.pwritev(&scratch, sector + done)
                .map_err(|e| {
                    error!("{}: Write {} sectors at sector {} failed: {:?}",
                           self.path.display(), window, sector + done, e);
                    e
                })?;
            if ret == 0 {
                return Err(Error::EIO);
            }
            done += ret;
        }
        Ok(count)
    }

    /// Write sectors from one contiguous buffer
    pub fn pwrite(&mut self, buf: &[u8], sector: SectorT) -> Result<u64> {
        let iov = [IoSlice::new(buf)];
        self.pwritev(&iov, sector)
    }

    /// Drain the device's write cache
    pub fn flush(&mut self) -> Result {
        self.backend.flush()
    }

    /// Partition an emulated device into `conv_size` sectors of
    /// conventional space followed by sequential-write-required zones of
    /// `zone_size` sectors each.  `EOPNOTSUPP` on real devices.
    pub fn set_zones(&mut self, conv_size: SectorT, zone_size: SectorT)
        -> Result
    {
        if !self.info().paligned(conv_size) ||
            !self.info().paligned(zone_size)
        {
            return Err(Error::EINVAL);
        }
        self.backend.set_zones(conv_size, zone_size)
    }

    /// Forcibly move the write pointer of an emulated device's zone.
    /// `EOPNOTSUPP` on real devices.
    pub fn set_write_pointer(&mut self, sector: SectorT, wp: SectorT)
        -> Result
    {
        if !self.info().paligned(sector) || !self.info().paligned(wp) {
            return Err(Error::EINVAL);
        }
        self.backend.set_write_pointer(sector, wp)
    }

    /// Validate an I/O request and clamp it to the device capacity.
    /// Returns the sector count to transfer.
    fn io_prepare(&self, total_bytes: usize, sector: SectorT, write: bool)
        -> Result<SectorT>
    {
        if total_bytes as u64 > isize::MAX as u64 {
            return Err(Error::EINVAL);
        }
        if total_bytes % SECTOR_SIZE != 0 {
            return Err(Error::EINVAL);
        }
        let mut count = (total_bytes >> SECTOR_SHIFT) as SectorT;

        if self.backend.test_mode() {
            if count == 0 {
                error!("{}: zero-length transfer at sector {}",
                       self.path.display(), sector);
                return Err(Error::EINVAL);
            }
            return Ok(count);
        }

        let info = self.info();
        let aligned = if write {
            info.paligned(count) && info.paligned(sector)
        } else {
            info.laligned(count) && info.laligned(sector)
        };
        if !aligned {
            error!("{}: Unaligned {} of {} sectors at sector {}",
                   self.path.display(),
                   if write { "write" } else { "read" }, count, sector);
            return Err(Error::EINVAL);
        }

        if sector >= info.sectors {
            return Ok(0);
        }
        if sector + count > info.sectors {
            count = info.sectors - sector;
        }
        Ok(count)
    }
}

/// Test if the device at `path` is zoned.
///
/// Equivalent to an open-then-close probe.  Emulated devices only count as
/// zoned when `fake_ok` is set.
pub fn is_zoned<P: AsRef<Path>>(path: P, fake_ok: bool) -> Result<bool> {
    let flags = OpenFlags::RDONLY | OpenFlags::DRV_BLOCK |
        OpenFlags::DRV_SCSI | OpenFlags::DRV_ATA | OpenFlags::DRV_FAKE;
    match Device::open(path, flags) {
        Ok(dev) => {
            let zoned = dev.info().dev_type != DeviceType::Fake || fake_ok;
            dev.close()?;
            Ok(zoned)
        }
        Err(Error::ENODEV) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Split a flat buffer into a scatter-gather list of `iovlen`-sector
/// entries, for driving the vectored I/O paths.
pub fn map_iov(buf: &[u8], iovlen: SectorT) -> Result<Vec<IoSlice<'_>>> {
    if buf.is_empty() || iovlen == 0 || buf.len() % SECTOR_SIZE != 0 {
        return Err(Error::EINVAL);
    }
    let chunk = (iovlen as usize) << SECTOR_SHIFT;
    Ok(buf.chunks(chunk).map(IoSlice::new).collect())
}

/// Mutable version of [`map_iov`], for reads
pub fn map_iov_mut(buf: &mut [u8], iovlen: SectorT)
    -> Result<Vec<IoSliceMut<'_>>>
{
    if buf.is_empty() || iovlen == 0 || buf.len() % SECTOR_SIZE != 0 {
        return Err(Error::EINVAL);
    }
    let chunk = (iovlen as usize) << SECTOR_SHIFT;
    Ok(buf.chunks_mut(chunk).map(IoSliceMut::new).collect())
}

/// Sum buffer lengths, guarding against overflow
fn sglist_bytes<I: Iterator<Item = usize>>(lens: I) -> Result<usize> {
    let mut total = 0usize;
    for l in lens {
        total = total.checked_add(l).ok_or(Error::EINVAL)?;
    }
    Ok(total)
}

/// Borrow the byte range `[skip, skip + len)` out of a scatter-gather list
/// as a new list.  The result has at most as many entries as the input.
fn carve<'a>(bufs: &'a [IoSlice<'_>], mut skip: usize, mut len: usize)
    -> Vec<IoSlice<'a>>
{
    let mut out = Vec::with_capacity(bufs.len());
    for b in bufs {
        if len == 0 {
            break;
        }
        let blen = b.len();
        if skip >= blen {
            skip -= blen;
            continue;
        }
        let take = (blen - skip).min(len);
        out.push(IoSlice::new(&b[skip..skip + take]));
        skip = 0;
        len -= take;
    }
    out
}

/// Mutable version of [`carve`], for reads
fn carve_mut<'a>(bufs: &'a mut [IoSliceMut<'_>], mut skip: usize,
                 mut len: usize) -> Vec<IoSliceMut<'a>>
{
    let mut out = Vec::with_capacity(bufs.len());
    for b in bufs.iter_mut() {
        if len == 0 {
            break;
        }
        let blen = b.len();
        if skip >= blen {
            skip -= blen;
            continue;
        }
        let take = (blen - skip).min(len);
        out.push(IoSliceMut::new(&mut b[skip..skip + take]));
        skip = 0;
        len -= take;
    }
    out
}

// LCOV_EXCL_STOP
