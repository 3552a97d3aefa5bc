// vim: tw=80
//! Native Linux zoned-block-device backend
//!
//! When the kernel already knows a device is zoned, its blkzoned ioctls are
//! the cheapest transport: no CDBs, no sense decoding, and the kernel
//! serialises zone operations against in-flight I/O.  The kernel reuses the
//! ZBC ordinals for zone types and conditions, so conversion is direct.

use crate::{
    backend::Backend,
    device::{
        DeviceInfo,
        DeviceType,
        ZoneModel,
        NO_LIMIT,
        UNRESTRICTED_READ,
    },
    types::*,
    zone::{zone_matches, Zone, ZoneCondition, ZoneOp, ZoneOpFlags, ZoneType},
};
use num_traits::FromPrimitive;
use std::{
    fs::{self, File, OpenOptions},
    io::{IoSlice, IoSliceMut},
    mem,
    os::unix::{
        fs::{FileTypeExt, MetadataExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
};
use tracing::debug;

/// Zones fetched per BLKREPORTZONE call
const REPORT_CHUNK: u32 = 1024;

/// FFI definitions for the kernel's zoned-block ioctls.  These can't go in
/// libc because the wrappers use Nix's macros.
#[doc(hidden)]
mod ffi {
    use nix::{ioctl_read, ioctl_read_bad, ioctl_readwrite, ioctl_write_ptr};

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct blk_zone {
        pub start:    u64,
        pub len:      u64,
        pub wp:       u64,
        pub type_:    u8,
        pub cond:     u8,
        pub non_seq:  u8,
        pub reset:    u8,
        pub resv:     [u8; 4],
        pub capacity: u64,
        pub reserved: [u8; 24],
    }

    #[repr(C)]
    pub struct blk_zone_report {
        pub sector:   u64,
        pub nr_zones: u32,
        pub reserved: [u8; 4],
        // followed by nr_zones packed blk_zone structs
    }

    #[repr(C)]
    pub struct blk_zone_range {
        pub sector:     u64,
        pub nr_sectors: u64,
    }

    ioctl_read!(blkgetsize64, 0x12, 114, u64);
    ioctl_read_bad!(blksszget, 0x1268, libc::c_int);
    ioctl_read_bad!(blkpbszget, 0x127b, libc::c_int);
    ioctl_readwrite!(blkreportzone, 0x12, 130, blk_zone_report);
    ioctl_write_ptr!(blkresetzone, 0x12, 131, blk_zone_range);
    ioctl_read!(blkgetzonesz, 0x12, 132, u32);
    ioctl_read!(blkgetnrzones, 0x12, 133, u32);
    ioctl_write_ptr!(blkopenzone, 0x12, 134, blk_zone_range);
    ioctl_write_ptr!(blkclosezone, 0x12, 135, blk_zone_range);
    ioctl_write_ptr!(blkfinishzone, 0x12, 136, blk_zone_range);
}

pub struct BlockBackend {
    file: File,
    info: DeviceInfo,
}

/// Probe entry point used by the dispatcher
pub(crate) fn open(path: &Path, flags: OpenFlags)
    -> Result<Box<dyn Backend>>
{
    BlockBackend::open(path, flags)
        .map(|b| Box::new(b) as Box<dyn Backend>)
}

/// The kernel's queue/zoned attribute names the zone model
fn parse_zoned_attr(attr: &str) -> Option<ZoneModel> {
    match attr.trim() {
        "host-managed" => Some(ZoneModel::HostManaged),
        "host-aware" => Some(ZoneModel::HostAware),
        _ => None,
    }
}

fn convert_zone(raw: &ffi::blk_zone) -> Result<Zone> {
    // The kernel reuses the ZBC ordinals
    let zone_type = ZoneType::from_u8(raw.type_).unwrap_or(ZoneType::Unknown);
    let cond = ZoneCondition::from_u8(raw.cond).ok_or(Error::EIO)?;
    Ok(Zone {
        zone_type,
        cond,
        start: raw.start,
        length: raw.len,
        write_pointer: raw.wp,
        need_reset: raw.reset != 0,
        non_seq: raw.non_seq != 0,
    })
}

impl BlockBackend {
    fn open(path: &Path, flags: OpenFlags) -> Result<BlockBackend> {
        let md = fs::metadata(path).map_err(Error::from)?;
        if !md.file_type().is_block_device() {
            return Err(Error::ENXIO);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(flags.writable())
            .open(path)
            .map_err(Error::from)?;
        let fd = file.as_raw_fd();

        // A zero zone size means the kernel doesn't consider the device
        // zoned; let the SCSI/ATA backends have a look at it instead
        let mut zone_sectors = 0u32;
        unsafe { ffi::blkgetzonesz(fd, &mut zone_sectors) }
            .map_err(|_| Error::ENXIO)?;
        if zone_sectors == 0 {
            return Err(Error::ENXIO);
        }

        let rdev = md.rdev();
        let sysfs = PathBuf::from(format!("/sys/dev/block/{}:{}",
            // Safe: pure arithmetic on the device number
            unsafe { libc::major(rdev) }, unsafe { libc::minor(rdev) }));
        let model = fs::read_to_string(sysfs.join("queue/zoned"))
            .ok()
            .and_then(|s| parse_zoned_attr(&s))
            .ok_or(Error::ENXIO)?;

        let mut bytes = 0u64;
        unsafe { ffi::blkgetsize64(fd, &mut bytes) }.map_err(Error::from)?;
        let mut lblock_size: libc::c_int = 0;
        unsafe { ffi::blksszget(fd, &mut lblock_size) }
            .map_err(Error::from)?;
        let mut pblock_size: libc::c_int = 0;
        unsafe { ffi::blkpbszget(fd, &mut pblock_size) }
            .map_err(Error::from)?;
        if lblock_size < SECTOR_SIZE as libc::c_int || pblock_size <
            SECTOR_SIZE as libc::c_int
        {
            return Err(Error::EINVAL);
        }

        let max_rw_sectors = fs::read_to_string(
                sysfs.join("queue/max_sectors_kb"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|kb| kb * 2)
            .unwrap_or(1024);
        let max_nr_open_seq_req = fs::read_to_string(
                sysfs.join("queue/max_open_zones"))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|&n| n != 0)
            .unwrap_or(NO_LIMIT);
        let vendor_id = fs::read_to_string(sysfs.join("device/vendor"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let sectors = bytes >> SECTOR_SHIFT;
        let info = DeviceInfo {
            vendor_id,
            dev_type: DeviceType::Block,
            model,
            sectors,
            lblocks: bytes / lblock_size as u64,
            pblocks: bytes / pblock_size as u64,
            lblock_size: lblock_size as u32,
            pblock_size: pblock_size as u32,
            flags: UNRESTRICTED_READ,
            max_rw_sectors,
            max_nr_open_seq_req,
            opt_nr_open_seq_pref: crate::device::NOT_REPORTED,
            opt_nr_non_seq_write_seq_pref: crate::device::NOT_REPORTED,
        };
        debug!("{}: native zoned block device, {} sectors, {} sectors/zone",
               path.display(), sectors, zone_sectors);

        Ok(BlockBackend { file, info })
    }

    /// One BLKREPORTZONE call, fetching up to `max` raw zones from
    /// `sector`
    fn fetch(&self, sector: SectorT, max: u32) -> Result<Vec<Zone>> {
        let hdr_len = mem::size_of::<ffi::blk_zone_report>();
        let zone_len = mem::size_of::<ffi::blk_zone>();
        let mut buf = vec![0u8; hdr_len + max as usize * zone_len];
        // Safe because the buffer is sized for the header plus max zones,
        // and the kernel writes back at most the nr_zones it was given
        unsafe {
            let hdr = buf.as_mut_ptr() as *mut ffi::blk_zone_report;
            (*hdr).sector = sector;
            (*hdr).nr_zones = max;
            ffi::blkreportzone(self.file.as_raw_fd(), hdr)
                .map_err(Error::from)?;
            let n = (*hdr).nr_zones as usize;
            let zones = buf.as_ptr().add(hdr_len) as *const ffi::blk_zone;
            (0..n).map(|i| convert_zone(&*zones.add(i))).collect()
        }
    }

    /// The range argument for a zone operation: the whole device for ALL,
    /// otherwise exactly the zone containing `sector`
    fn op_range(&self, sector: SectorT, all: bool)
        -> Result<ffi::blk_zone_range>
    {
        if all {
            return Ok(ffi::blk_zone_range {
                sector: 0,
                nr_sectors: self.info.sectors,
            });
        }
        let zones = self.fetch(sector, 1)?;
        match zones.first() {
            Some(z) => Ok(ffi::blk_zone_range {
                sector: z.start,
                nr_sectors: z.length,
            }),
            None => Err(Error::EINVAL),
        }
    }
}

impl Backend for BlockBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn sense(&self) -> Option<SenseInfo> {
        // The kernel doesn't expose sense data through the blkzoned
        // interface
        None
    }

    fn report_zones(&mut self, start: SectorT, ro: u8,
                    zones: Option<&mut [Zone]>, nr_zones: &mut u32)
        -> Result
    {
        // The kernel reports every zone; the option filter is applied here
        // so that callers get the same behaviour from every backend
        let mut out = zones;
        let mut matched: u32 = 0;
        let mut sector = start;
        'chunks: while sector < self.info.sectors {
            let chunk = self.fetch(sector, REPORT_CHUNK)?;
            if chunk.is_empty() {
                break;
            }
            for z in &chunk {
                if zone_matches(z, ro)? {
                    match out {
                        None => matched += 1,
                        Some(ref mut slots) => {
                            slots[matched as usize] = *z;
                            matched += 1;
                            if matched as usize == slots.len() {
                                break 'chunks;
                            }
                        }
                    }
                }
            }
            sector = chunk.last().unwrap().end();
        }
        *nr_zones = matched;
        Ok(())
    }

    fn zone_op(&mut self, sector: SectorT, op: ZoneOp, flags: ZoneOpFlags)
        -> Result
    {
        let range = self.op_range(sector, flags.all_zones())?;
        let fd = self.file.as_raw_fd();
        // Safe because range outlives the ioctl
        unsafe {
            match op {
                ZoneOp::Reset => ffi::blkresetzone(fd, &range),
                ZoneOp::Open => ffi::blkopenzone(fd, &range),
                ZoneOp::Close => ffi::blkclosezone(fd, &range),
                ZoneOp::Finish => ffi::blkfinishzone(fd, &range),
            }
        }.map_err(Error::from)?;
        Ok(())
    }

    fn preadv(&mut self, bufs: &mut [IoSliceMut<'_>], sector: SectorT)
        -> Result<u64>
    {
        let off = (sector << SECTOR_SHIFT) as libc::off_t;
        let n = nix::sys::uio::preadv(&self.file, bufs, off)
            .map_err(Error::from)?;
        Ok((n >> SECTOR_SHIFT) as u64)
    }

    fn pwritev(&mut self, bufs: &[IoSlice<'_>], sector: SectorT)
        -> Result<u64>
    {
        let off = (sector << SECTOR_SHIFT) as libc::off_t;
        let n = nix::sys::uio::pwritev(&self.file, bufs, off)
            .map_err(Error::from)?;
        Ok((n >> SECTOR_SHIFT) as u64)
    }

    fn flush(&mut self) -> Result {
        self.file.sync_all().map_err(Error::from)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn zoned_attr() {
    assert_eq!(parse_zoned_attr("host-managed\n"),
               Some(ZoneModel::HostManaged));
    assert_eq!(parse_zoned_attr("host-aware\n"),
               Some(ZoneModel::HostAware));
    assert_eq!(parse_zoned_attr("none\n"), None);
    assert_eq!(parse_zoned_attr(""), None);
}

#[test]
fn kernel_zone_conversion() {
    let raw = ffi::blk_zone {
        start: 262144,
        len: 131072,
        wp: 266240,
        type_: 0x02,
        cond: 0x02,
        non_seq: 0,
        reset: 1,
        resv: [0; 4],
        capacity: 131072,
        reserved: [0; 24],
    };
    let z = convert_zone(&raw).unwrap();
    assert_eq!(z.zone_type, ZoneType::SequentialReq);
    assert_eq!(z.cond, ZoneCondition::ImpOpen);
    assert_eq!(z.start, 262144);
    assert_eq!(z.length, 131072);
    assert_eq!(z.write_pointer, 266240);
    assert!(z.need_reset);

    let raw = ffi::blk_zone { cond: 0x08, ..raw };
    assert_eq!(convert_zone(&raw), Err(Error::EIO));
}

#[test]
fn struct_sizes() {
    // The kernel ABI fixes these layouts
    assert_eq!(mem::size_of::<ffi::blk_zone>(), 64);
    assert_eq!(mem::size_of::<ffi::blk_zone_report>(), 16);
    assert_eq!(mem::size_of::<ffi::blk_zone_range>(), 16);
}

#[test]
fn filter_table() {
    let z = Zone {
        zone_type: ZoneType::SequentialReq,
        cond: ZoneCondition::Closed,
        start: 0,
        length: 8,
        write_pointer: 4,
        need_reset: true,
        non_seq: false,
    };
    assert_eq!(zone_matches(&z, 0x00), Ok(true));
    assert_eq!(zone_matches(&z, 0x04), Ok(true));
    assert_eq!(zone_matches(&z, 0x01), Ok(false));
    assert_eq!(zone_matches(&z, 0x08), Ok(true));
    assert_eq!(zone_matches(&z, 0x09), Ok(false));
    assert_eq!(zone_matches(&z, 0x0c), Err(Error::EINVAL));
    // The partial bit doesn't disturb the filter
    assert_eq!(zone_matches(&z, 0x84), Ok(true));
}

}
// LCOV_EXCL_STOP
