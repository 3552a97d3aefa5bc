// vim: tw=80
//! SCSI/ZBC backend
//!
//! Drives host-managed and host-aware SCSI devices with the ZBC command
//! set: REPORT ZONES through ZBC IN, zone operations through ZBC OUT, and
//! READ(16)/WRITE(16) for data.  SCSI wire fields are big-endian, unlike
//! the ATA log pages.

use crate::{
    backend::{
        cdb::{get_be_dword, get_be_qword, put_be_dword, put_be_qword,
              CDB_LEN},
        sg::{SgCmd, Xfer},
        Backend,
    },
    device::{
        DeviceInfo,
        DeviceType,
        ZoneModel,
        NOT_REPORTED,
        NO_LIMIT,
        UNRESTRICTED_READ,
    },
    types::*,
    zone::{Zone, ZoneCondition, ZoneOp, ZoneOpFlags, ZoneType},
};
use num_traits::FromPrimitive;
use std::{
    fs::{File, OpenOptions},
    io::{IoSlice, IoSliceMut},
    os::unix::{fs::FileTypeExt, io::AsRawFd},
    path::Path,
};
use tracing::debug;

const SCSI_INQUIRY: u8 = 0x12;
const SCSI_READ_CAPACITY_16: u8 = 0x9E;
const SCSI_READ_CAPACITY_SA: u8 = 0x10;
const SCSI_READ_16: u8 = 0x88;
const SCSI_WRITE_16: u8 = 0x8A;
const SCSI_SYNCHRONIZE_CACHE_16: u8 = 0x91;
const SCSI_ZBC_IN: u8 = 0x95;
const SCSI_ZBC_OUT: u8 = 0x94;

const ZBC_SA_REPORT_ZONES: u8 = 0x00;
const ZBC_SA_CLOSE_ZONE: u8 = 0x01;
const ZBC_SA_FINISH_ZONE: u8 = 0x02;
const ZBC_SA_OPEN_ZONE: u8 = 0x03;
const ZBC_SA_RESET_WP: u8 = 0x04;

/// Host-managed ZBC peripheral device type from INQUIRY
const SCSI_PDT_HOST_MANAGED: u8 = 0x14;
/// Ordinary direct-access device; may still be host-aware
const SCSI_PDT_DIRECT_ACCESS: u8 = 0x00;

const SCSI_INQUIRY_LEN: usize = 96;
const SCSI_VPD_BLOCK_LIMITS: u8 = 0xB0;
const SCSI_VPD_BLOCK_DEV_CHARS: u8 = 0xB1;
const SCSI_VPD_ZONED_CHARS: u8 = 0xB6;

/// Size of one zone descriptor in a REPORT ZONES reply
const ZBC_ZONE_DESCRIPTOR_LEN: usize = 64;
/// Bytes in a REPORT ZONES reply before the first descriptor
const ZBC_ZONE_HEADER_LEN: usize = 64;

/// Largest REPORT ZONES allocation per command
const ZBC_REPORT_MAX_BYTES: usize = 512 * 1024;

/// Fallback transfer cap when the device doesn't report one, in sectors
const SCSI_DEFAULT_MAX_RW_SECTORS: SectorT = 65536;

pub struct ScsiBackend {
    file:  File,
    info:  DeviceInfo,
    sense: Option<SenseInfo>,
}

/// Probe entry point used by the dispatcher
pub(crate) fn open(path: &Path, flags: OpenFlags)
    -> Result<Box<dyn Backend>>
{
    ScsiBackend::open(path, flags)
        .map(|b| Box::new(b) as Box<dyn Backend>)
}

fn inquiry_cdb(evpd: bool, page: u8, alloc: u16) -> [u8; 6] {
    [SCSI_INQUIRY, evpd as u8, page, (alloc >> 8) as u8, alloc as u8, 0]
}

fn read_capacity16_cdb() -> [u8; CDB_LEN] {
    let mut cdb = [0u8; CDB_LEN];
    cdb[0] = SCSI_READ_CAPACITY_16;
    cdb[1] = SCSI_READ_CAPACITY_SA;
    put_be_dword(&mut cdb[10..14], 32);
    cdb
}

fn report_zones_cdb(lba: u64, alloc: u32, ro: u8) -> [u8; CDB_LEN] {
    let mut cdb = [0u8; CDB_LEN];
    cdb[0] = SCSI_ZBC_IN;
    cdb[1] = ZBC_SA_REPORT_ZONES;
    put_be_qword(&mut cdb[2..10], lba);
    put_be_dword(&mut cdb[10..14], alloc);
    cdb[14] = ro;
    cdb
}

fn zbc_out_cdb(op: ZoneOp, lba: u64, all: bool) -> [u8; CDB_LEN] {
    let mut cdb = [0u8; CDB_LEN];
    cdb[0] = SCSI_ZBC_OUT;
    cdb[1] = match op {
        ZoneOp::Reset => ZBC_SA_RESET_WP,
        ZoneOp::Open => ZBC_SA_OPEN_ZONE,
        ZoneOp::Close => ZBC_SA_CLOSE_ZONE,
        ZoneOp::Finish => ZBC_SA_FINISH_ZONE,
    };
    if !all {
        put_be_qword(&mut cdb[2..10], lba);
    }
    cdb[14] = all as u8;
    cdb
}

fn rw16_cdb(opcode: u8, lba: u64, lba_count: u32) -> [u8; CDB_LEN] {
    let mut cdb = [0u8; CDB_LEN];
    cdb[0] = opcode;
    put_be_qword(&mut cdb[2..10], lba);
    put_be_dword(&mut cdb[10..14], lba_count);
    cdb
}

/// Decode one 64-byte zone descriptor from a REPORT ZONES reply.  LBA
/// fields are converted to 512-byte sectors.
fn parse_zone(buf: &[u8], lblock_sectors: SectorT) -> Result<Zone> {
    if buf.len() < ZBC_ZONE_DESCRIPTOR_LEN {
        return Err(Error::EIO);
    }
    let zone_type = ZoneType::from_u8(buf[0] & 0x0f)
        .unwrap_or(ZoneType::Unknown);
    let cond = ZoneCondition::from_u8((buf[1] >> 4) & 0x0f)
        .ok_or(Error::EIO)?;
    Ok(Zone {
        zone_type,
        cond,
        length: get_be_qword(&buf[8..16]) * lblock_sectors,
        start: get_be_qword(&buf[16..24]) * lblock_sectors,
        write_pointer: get_be_qword(&buf[24..32]) * lblock_sectors,
        need_reset: buf[1] & 0x01 != 0,
        non_seq: buf[1] & 0x02 != 0,
    })
}

/// Standard INQUIRY data, for probing
pub(crate) fn inquiry(fd: i32) -> Result<[u8; SCSI_INQUIRY_LEN]> {
    let mut buf = [0u8; SCSI_INQUIRY_LEN];
    let cdb = inquiry_cdb(false, 0, SCSI_INQUIRY_LEN as u16);
    let mut sg = SgCmd::new(&cdb, Xfer::FromDev);
    sg.exec_from_dev(fd, &mut buf)?;
    Ok(buf)
}

/// The vendor identification field of the standard INQUIRY data
pub(crate) fn inquiry_vendor(fd: i32) -> Result<String> {
    let buf = inquiry(fd)?;
    Ok(vendor_from_inquiry(&buf))
}

fn vendor_from_inquiry(buf: &[u8]) -> String {
    String::from_utf8_lossy(&buf[8..16]).trim_end().to_string()
}

/// READ CAPACITY (16): returns (logical blocks, logical block size,
/// log2(logical blocks per physical block)).  The reply is big-endian.
pub(crate) fn read_capacity16(fd: i32) -> Result<(u64, u32, u32)> {
    let mut buf = [0u8; 32];
    let mut sg = SgCmd::new(&read_capacity16_cdb(), Xfer::FromDev);
    sg.exec_from_dev(fd, &mut buf)?;
    let lblocks = get_be_qword(&buf[0..8]) + 1;
    let lblock_size = get_be_dword(&buf[8..12]);
    let lpp_exp = (buf[13] & 0x0f) as u32;
    Ok((lblocks, lblock_size, lpp_exp))
}

/// Read one EVPD page; returns the number of valid bytes
fn inquiry_vpd(fd: i32, page: u8, buf: &mut [u8]) -> Result<usize> {
    let cdb = inquiry_cdb(true, page, buf.len() as u16);
    let mut sg = SgCmd::new(&cdb, Xfer::FromDev);
    sg.exec_from_dev(fd, buf)?;
    Ok(buf.len() - sg.resid() as usize)
}

impl ScsiBackend {
    fn open(path: &Path, flags: OpenFlags) -> Result<ScsiBackend> {
        let md = std::fs::metadata(path).map_err(Error::from)?;
        let ft = md.file_type();
        if !ft.is_char_device() && !ft.is_block_device() {
            return Err(Error::ENXIO);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(flags.writable())
            .open(path)
            .map_err(Error::from)?;
        let fd = file.as_raw_fd();

        let inq = match inquiry(fd) {
            Ok(inq) => inq,
            // Not a SCSI device at all
            Err(_) => return Err(Error::ENXIO),
        };
        let model = match inq[0] & 0x1f {
            SCSI_PDT_HOST_MANAGED => ZoneModel::HostManaged,
            SCSI_PDT_DIRECT_ACCESS => {
                // May still be host-aware; the Block Device
                // Characteristics VPD page says
                let mut vpd = [0u8; 64];
                match inquiry_vpd(fd, SCSI_VPD_BLOCK_DEV_CHARS, &mut vpd) {
                    Ok(n) if n > 8 && (vpd[8] >> 4) & 0x3 == 0x1 =>
                        ZoneModel::HostAware,
                    _ => return Err(Error::ENXIO),
                }
            }
            _ => return Err(Error::ENXIO),
        };
        let vendor_id = vendor_from_inquiry(&inq);

        let (lblocks, lblock_size, lpp_exp) = read_capacity16(fd)?;
        if lblock_size < SECTOR_SIZE as u32 || lblocks == 0 {
            return Err(Error::EINVAL);
        }
        let lblock_sectors = (lblock_size >> SECTOR_SHIFT) as u64;

        // Block Limits VPD: per-command transfer cap
        let mut max_rw_sectors = SCSI_DEFAULT_MAX_RW_SECTORS;
        let mut vpd = [0u8; 64];
        if let Ok(n) = inquiry_vpd(fd, SCSI_VPD_BLOCK_LIMITS, &mut vpd) {
            if n >= 12 {
                let max_xfer = get_be_dword(&vpd[8..12]) as u64;
                if max_xfer != 0 {
                    max_rw_sectors = max_xfer * lblock_sectors;
                }
            }
        }

        // Zoned Block Device Characteristics VPD: capabilities and open
        // zone limits
        let mut flags_ = 0;
        let mut max_nr_open_seq_req = NO_LIMIT;
        let mut opt_nr_open_seq_pref = NOT_REPORTED;
        let mut opt_nr_non_seq_write_seq_pref = NOT_REPORTED;
        let mut vpd = [0u8; 64];
        if let Ok(n) = inquiry_vpd(fd, SCSI_VPD_ZONED_CHARS, &mut vpd) {
            if n >= 20 {
                if vpd[4] & 0x01 != 0 {
                    flags_ |= UNRESTRICTED_READ;
                }
                let opt_open = get_be_dword(&vpd[8..12]);
                if opt_open != 0 {
                    opt_nr_open_seq_pref = opt_open;
                }
                let opt_non_seq = get_be_dword(&vpd[12..16]);
                if opt_non_seq != 0 {
                    opt_nr_non_seq_write_seq_pref = opt_non_seq;
                }
                max_nr_open_seq_req = get_be_dword(&vpd[16..20]);
            }
        }

        let info = DeviceInfo {
            vendor_id,
            dev_type: DeviceType::Scsi,
            model,
            sectors: lblocks * lblock_sectors,
            lblocks,
            pblocks: lblocks >> lpp_exp,
            lblock_size,
            pblock_size: lblock_size << lpp_exp,
            flags: flags_,
            max_rw_sectors,
            max_nr_open_seq_req,
            opt_nr_open_seq_pref,
            opt_nr_non_seq_write_seq_pref,
        };
        debug!("{}: SCSI ZBC device, {} sectors, {}", path.display(),
               info.sectors, info.model);

        Ok(ScsiBackend {
            file,
            info,
            sense: None,
        })
    }

    fn exec(&mut self, sg: &mut SgCmd, f: impl FnOnce(&mut SgCmd, i32)
            -> Result) -> Result
    {
        let fd = self.file.as_raw_fd();
        let r = f(sg, fd);
        if let Some(si) = sg.sense_info() {
            self.sense = Some(si);
        }
        r
    }
}

impl Backend for ScsiBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn sense(&self) -> Option<SenseInfo> {
        self.sense
    }

    fn report_zones(&mut self, start: SectorT, ro: u8,
                    zones: Option<&mut [Zone]>, nr_zones: &mut u32)
        -> Result
    {
        let lblock_sectors = self.info.lblock_sectors();
        let lba = start / lblock_sectors;

        let alloc = match &zones {
            // A count query only needs the reply header
            None => ZBC_ZONE_HEADER_LEN,
            Some(out) => {
                (ZBC_ZONE_HEADER_LEN + out.len() * ZBC_ZONE_DESCRIPTOR_LEN)
                    .min(ZBC_REPORT_MAX_BYTES)
            }
        };
        let mut buf = vec![0u8; alloc];
        let cdb = report_zones_cdb(lba, alloc as u32, ro);
        let mut sg = SgCmd::new(&cdb, Xfer::FromDev);
        self.exec(&mut sg, |sg, fd| sg.exec_from_dev(fd, &mut buf))?;

        let valid = alloc - sg.resid() as usize;
        if valid < ZBC_ZONE_HEADER_LEN {
            return Err(Error::EIO);
        }
        // Zone list length is in bytes of descriptors
        let listed = get_be_dword(&buf[0..4]) as usize
            / ZBC_ZONE_DESCRIPTOR_LEN;

        match zones {
            None => *nr_zones = listed as u32,
            Some(out) => {
                let avail = (valid - ZBC_ZONE_HEADER_LEN)
                    / ZBC_ZONE_DESCRIPTOR_LEN;
                let n = listed.min(avail).min(out.len());
                for (i, slot) in out[..n].iter_mut().enumerate() {
                    let off = ZBC_ZONE_HEADER_LEN +
                        i * ZBC_ZONE_DESCRIPTOR_LEN;
                    *slot = parse_zone(&buf[off..], lblock_sectors)?;
                }
                *nr_zones = n as u32;
            }
        }
        Ok(())
    }

    fn zone_op(&mut self, sector: SectorT, op: ZoneOp, flags: ZoneOpFlags)
        -> Result
    {
        let lba = sector / self.info.lblock_sectors();
        let cdb = zbc_out_cdb(op, lba, flags.all_zones());
        let mut sg = SgCmd::new(&cdb, Xfer::None);
        self.exec(&mut sg, |sg, fd| sg.exec_none(fd))
    }

    fn preadv(&mut self, bufs: &mut [IoSliceMut<'_>], sector: SectorT)
        -> Result<u64>
    {
        let bytes: usize = bufs.iter().map(|b| b.len()).sum();
        let lba_count = (bytes / self.info.lblock_size as usize) as u32;
        let cdb = rw16_cdb(SCSI_READ_16,
                           sector / self.info.lblock_sectors(), lba_count);
        let mut sg = SgCmd::new(&cdb, Xfer::FromDev);
        self.exec(&mut sg, |sg, fd| sg.exec_readv(fd, bufs))?;
        Ok(((bytes - sg.resid() as usize) >> SECTOR_SHIFT) as u64)
    }

    fn pwritev(&mut self, bufs: &[IoSlice<'_>], sector: SectorT)
        -> Result<u64>
    {
        let bytes: usize = bufs.iter().map(|b| b.len()).sum();
        let lba_count = (bytes / self.info.lblock_size as usize) as u32;
        let cdb = rw16_cdb(SCSI_WRITE_16,
                           sector / self.info.lblock_sectors(), lba_count);
        let mut sg = SgCmd::new(&cdb, Xfer::ToDev);
        self.exec(&mut sg, |sg, fd| sg.exec_writev(fd, bufs))?;
        Ok(((bytes - sg.resid() as usize) >> SECTOR_SHIFT) as u64)
    }

    fn flush(&mut self) -> Result {
        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = SCSI_SYNCHRONIZE_CACHE_16;
        let mut sg = SgCmd::new(&cdb, Xfer::None);
        self.exec(&mut sg, |sg, fd| sg.exec_none(fd))
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use byteorder::{BigEndian, ByteOrder};
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn inquiry_wire_format() {
    assert_eq!(inquiry_cdb(false, 0, 96), [0x12, 0, 0, 0, 96, 0]);
    assert_eq!(inquiry_cdb(true, 0xB6, 64), [0x12, 1, 0xB6, 0, 64, 0]);
}

#[test]
fn read_capacity_wire_format() {
    let cdb = read_capacity16_cdb();
    assert_eq!(cdb[0], 0x9E);
    assert_eq!(cdb[1], 0x10);
    assert_eq!(&cdb[10..14], &[0, 0, 0, 32]);
}

#[test]
fn report_zones_wire_format() {
    let cdb = report_zones_cdb(0x1_0000_0000, 65536, 0x81);
    assert_eq!(cdb[0], 0x95);
    assert_eq!(cdb[1], 0x00);
    assert_eq!(BigEndian::read_u64(&cdb[2..10]), 0x1_0000_0000);
    assert_eq!(BigEndian::read_u32(&cdb[10..14]), 65536);
    assert_eq!(cdb[14], 0x81);
}

#[test]
fn zone_op_wire_format() {
    let cdb = zbc_out_cdb(ZoneOp::Reset, 262144, false);
    assert_eq!(cdb[0], 0x94);
    assert_eq!(cdb[1], 0x04);
    assert_eq!(BigEndian::read_u64(&cdb[2..10]), 262144);
    assert_eq!(cdb[14], 0x00);

    let cdb = zbc_out_cdb(ZoneOp::Finish, 0, true);
    assert_eq!(cdb[1], 0x02);
    assert_eq!(cdb[14], 0x01);

    assert_eq!(zbc_out_cdb(ZoneOp::Open, 0, true)[1], 0x03);
    assert_eq!(zbc_out_cdb(ZoneOp::Close, 0, true)[1], 0x01);
}

#[test]
fn rw16_wire_format() {
    let cdb = rw16_cdb(SCSI_READ_16, 0xDEADBEEF, 2048);
    assert_eq!(cdb[0], 0x88);
    assert_eq!(BigEndian::read_u64(&cdb[2..10]), 0xDEADBEEF);
    assert_eq!(BigEndian::read_u32(&cdb[10..14]), 2048);
    assert_eq!(rw16_cdb(SCSI_WRITE_16, 0, 1)[0], 0x8A);
}

#[test]
fn zone_descriptor() {
    let mut desc = [0u8; 64];
    desc[0] = 0x02;
    desc[1] = (0x4 << 4) | 0x02;  // closed, non_seq
    BigEndian::write_u64(&mut desc[8..16], 16384);   // length in lblocks
    BigEndian::write_u64(&mut desc[16..24], 32768);  // start lba
    BigEndian::write_u64(&mut desc[24..32], 33792);  // wp lba
    // 4096-byte logical blocks: eight sectors per block
    let z = parse_zone(&desc, 8).unwrap();
    assert_eq!(z.zone_type, ZoneType::SequentialReq);
    assert_eq!(z.cond, ZoneCondition::Closed);
    assert_eq!(z.length, 131072);
    assert_eq!(z.start, 262144);
    assert_eq!(z.write_pointer, 270336);
    assert!(z.non_seq);
    assert!(!z.need_reset);
}

#[test]
fn zone_descriptor_malformed() {
    assert_eq!(parse_zone(&[0u8; 16], 1), Err(Error::EIO));
    let mut desc = [0u8; 64];
    desc[1] = 0x6 << 4;  // reserved condition
    assert_eq!(parse_zone(&desc, 1), Err(Error::EIO));
}

#[test]
fn vendor_trimming() {
    let mut inq = [0u8; SCSI_INQUIRY_LEN];
    inq[8..16].copy_from_slice(b"WDC     ");
    assert_eq!(vendor_from_inquiry(&inq), "WDC");
}

}
// LCOV_EXCL_STOP
