// vim: tw=80
//! ATA/ZAC backend
//!
//! ZAC drives are driven through SCSI ATA PASS-THROUGH (16): every command
//! here is an [`AtaCmd`] serialized into a 16-byte CDB and shipped through
//! the SG transport.  Zone information comes from the Report Zones log page
//! (0x1A) read with READ LOG DMA EXT.

use crate::{
    backend::{
        cdb::*,
        scsi,
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
    zone::{Zone, ZoneOp, ZoneOpFlags},
};
use std::{
    fs::{File, OpenOptions},
    io::{IoSlice, IoSliceMut},
    os::unix::{fs::FileTypeExt, io::AsRawFd},
    path::Path,
};
use tracing::debug;

/// Largest Report Zones log read, in bytes
const ATA_LOG_SIZE: usize = 65536;

/// DMA EXT commands carry a 16-bit sector count, where zero means 65536
const ATA_MAX_RW_SECTORS: SectorT = 65536;

// ZM actions for ZONE MANAGEMENT OUT, in features(7:0)
const ZM_CLOSE_ZONE: u16 = 0x01;
const ZM_FINISH_ZONE: u16 = 0x02;
const ZM_OPEN_ZONE: u16 = 0x03;
const ZM_RESET_WRITE_POINTER: u16 = 0x04;

/// The ALL bit of a zone management command, in features(15:8)
const ZM_ALL: u16 = 0x100;

pub struct AtaBackend {
    file:  File,
    info:  DeviceInfo,
    sense: Option<SenseInfo>,
}

/// Probe entry point used by the dispatcher
pub(crate) fn open(path: &Path, flags: OpenFlags)
    -> Result<Box<dyn Backend>>
{
    AtaBackend::open(path, flags)
        .map(|b| Box::new(b) as Box<dyn Backend>)
}

/// Interpret the signature register file of a just-reset ATA device.
///
/// `(0xCD, 0xAB)` in the LBA mid/high registers is the ZAC host-managed
/// signature.  The standard signature `(0x00, 0x00)` may still be a
/// host-aware drive, which is decided by whether the Report Zones log
/// exists; `log_pages` performs that (transport) query only when needed.
fn classify_signature<F>(lba_mid: u8, lba_high: u8, log_pages: F)
    -> Result<ZoneModel>
    where F: FnOnce() -> Result<u16>
{
    match (lba_mid, lba_high) {
        (0xCD, 0xAB) => {
            debug!("ZAC signature detected");
            Ok(ZoneModel::HostManaged)
        }
        (0x00, 0x00) => {
            debug!("Standard ATA signature detected");
            if log_pages()? > 0 {
                Ok(ZoneModel::HostAware)
            } else {
                // Standard or drive-managed disk; nothing to manage here
                Err(Error::ENXIO)
            }
        }
        _ => {
            debug!("Unsupported device (signature {lba_mid:02x}:\
                    {lba_high:02x})");
            Err(Error::ENXIO)
        }
    }
}

impl AtaBackend {
    fn open(path: &Path, flags: OpenFlags) -> Result<AtaBackend> {
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

        let model = AtaBackend::classify(fd)?;

        let (lblocks, lblock_size, lpp_exp) = scsi::read_capacity16(fd)
            .map_err(|_| Error::ENXIO)?;
        if lblock_size < SECTOR_SIZE as u32 || lblocks == 0 {
            return Err(Error::EINVAL);
        }
        let lblock_sectors = (lblock_size >> SECTOR_SHIFT) as u64;
        let vendor_id = scsi::inquiry_vendor(fd)
            .unwrap_or_else(|_| "ATA".to_string());

        let info = DeviceInfo {
            vendor_id,
            dev_type: DeviceType::Ata,
            model,
            sectors: lblocks * lblock_sectors,
            lblocks,
            pblocks: lblocks >> lpp_exp,
            lblock_size,
            pblock_size: lblock_size << lpp_exp,
            flags: UNRESTRICTED_READ,
            max_rw_sectors: ATA_MAX_RW_SECTORS,
            max_nr_open_seq_req: NO_LIMIT,
            opt_nr_open_seq_pref: NOT_REPORTED,
            opt_nr_non_seq_write_seq_pref: NOT_REPORTED,
        };
        debug!("{}: ATA ZAC device, {} sectors, {}", path.display(),
               info.sectors, info.model);

        Ok(AtaBackend {
            file,
            info,
            sense: None,
        })
    }

    /// Detect the device's zone model from its diagnostic signature.
    ///
    /// EXECUTE DEVICE DIAGNOSTIC is issued with `ck_cond` so the SAT layer
    /// returns the ATA register file in the sense descriptors; bytes 9 and
    /// 11 of the descriptor hold the LBA mid/high signature registers.
    fn classify(fd: i32) -> Result<ZoneModel> {
        let cmd = AtaCmd {
            protocol: ATA_PROTO_NON_DATA,
            ext: true,
            ck_cond: true,
            command: ATA_EXEC_DEV_DIAGNOSTIC,
            ..Default::default()
        };
        let mut sg = SgCmd::new(&cmd.cdb(), Xfer::None);
        if sg.exec_none(fd).is_err() {
            // Whatever this is, it doesn't speak ATA pass-through
            return Err(Error::ENXIO);
        }
        let sense = sg.sense_data();
        if sense.len() < 8 + 12 {
            return Err(Error::ENXIO);
        }
        let desc = &sense[8..];
        classify_signature(desc[9], desc[11],
                           || AtaBackend::report_zones_log_pages(fd))
    }

    /// The number of pages in the Report Zones log, from the log directory.
    /// Zero means the device has no zones at all.
    fn report_zones_log_pages(fd: i32) -> Result<u16> {
        let mut buf = [0u8; 512];
        AtaBackend::read_log_fd(fd, ATA_LOG_DIRECTORY, 0, 0, &mut buf)?;
        Ok(get_word(&buf[ATA_REPORT_ZONES_LOG as usize * 2..]))
    }

    /// Build the READ LOG DMA EXT command for `sectors * 512` bytes of log
    /// `log` starting at 512-byte page `page`
    fn read_log_cmd(log: u8, page: u16, opt: u8, sectors: u16) -> AtaCmd {
        AtaCmd {
            protocol: ATA_PROTO_DMA,
            ext: true,
            t_dir: true,
            byt_blk: true,
            t_length: ATA_TLEN_COUNT,
            features: opt as u16,
            count: sectors,
            // Log address in LBA(7:0); page number in LBA(15:8) and
            // LBA(39:32)
            lba: log as u64
                | ((page & 0xff) as u64) << 8
                | ((page >> 8) as u64) << 32,
            command: ATA_READ_LOG_DMA_EXT,
            ..Default::default()
        }
    }

    /// Open-time log read, before the backend exists
    fn read_log_fd(fd: i32, log: u8, page: u16, opt: u8, buf: &mut [u8])
        -> Result
    {
        debug_assert_eq!(buf.len() % 512, 0);
        let cmd = AtaBackend::read_log_cmd(log, page, opt,
                                           (buf.len() / 512) as u16);
        let mut sg = SgCmd::new(&cmd.cdb(), Xfer::FromDev);
        sg.exec_from_dev(fd, buf)?;
        if sg.resid() != 0 {
            return Err(Error::EIO);
        }
        Ok(())
    }

    fn read_log(&mut self, log: u8, page: u16, opt: u8, buf: &mut [u8])
        -> Result
    {
        debug_assert_eq!(buf.len() % 512, 0);
        let cmd = AtaBackend::read_log_cmd(log, page, opt,
                                           (buf.len() / 512) as u16);
        let mut sg = SgCmd::new(&cmd.cdb(), Xfer::FromDev);
        self.exec(&mut sg, |sg, fd| sg.exec_from_dev(fd, buf))?;
        if sg.resid() != 0 {
            // The device shorted a log read; the payload can't be trusted
            return Err(Error::EIO);
        }
        Ok(())
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

impl Backend for AtaBackend {
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
        // First log page: 64-byte header plus the first descriptors
        let mut buf = vec![0u8; 512];
        self.read_log(ATA_REPORT_ZONES_LOG, 0, ro & 0x0f, &mut buf)?;
        let total = ata_report_zones_count(&buf)? as usize;

        let mut out = zones;
        let mut remaining = total;
        let mut matched: u32 = 0;
        let mut page: u16 = 0;
        let mut desc_off = ATA_ZONE_HEADER_LEN;
        'pages: loop {
            while remaining > 0 &&
                desc_off + ATA_ZONE_DESCRIPTOR_LEN <= buf.len()
            {
                let z = ata_parse_zone(&buf[desc_off..])?;
                desc_off += ATA_ZONE_DESCRIPTOR_LEN;
                remaining -= 1;
                if z.end() <= start {
                    // Before the requested start sector
                    continue;
                }
                match out {
                    None => matched += 1,
                    Some(ref mut slots) => {
                        if (matched as usize) < slots.len() {
                            slots[matched as usize] = z;
                            matched += 1;
                        }
                        if matched as usize == slots.len() {
                            break 'pages;
                        }
                    }
                }
            }
            if remaining == 0 {
                break;
            }

            // Advance past the pages already read, then size the next read
            // for the rest of the log
            page += (buf.len() / 512) as u16;
            let mut next = remaining * ATA_ZONE_DESCRIPTOR_LEN;
            next = next.div_ceil(512) * 512;
            next = next.clamp(512, ATA_LOG_SIZE);
            buf.resize(next, 0);
            self.read_log(ATA_REPORT_ZONES_LOG, page, ro & 0x0f, &mut buf)?;
            // Only page 0 carries the header
            desc_off = 0;
        }
        *nr_zones = matched;
        Ok(())
    }

    fn zone_op(&mut self, sector: SectorT, op: ZoneOp, flags: ZoneOpFlags)
        -> Result
    {
        let action = match op {
            ZoneOp::Reset => ZM_RESET_WRITE_POINTER,
            ZoneOp::Open => ZM_OPEN_ZONE,
            ZoneOp::Close => ZM_CLOSE_ZONE,
            ZoneOp::Finish => ZM_FINISH_ZONE,
        };
        let all = flags.all_zones();
        let cmd = AtaCmd {
            protocol: ATA_PROTO_NON_DATA,
            ext: true,
            features: action | if all { ZM_ALL } else { 0 },
            lba: if all {
                0
            } else {
                sector / self.info.lblock_sectors()
            },
            device: 1 << 6,
            command: ATA_ZONE_MGMT_OUT,
            ..Default::default()
        };
        let mut sg = SgCmd::new(&cmd.cdb(), Xfer::None);
        self.exec(&mut sg, |sg, fd| sg.exec_none(fd))
    }

    fn preadv(&mut self, bufs: &mut [IoSliceMut<'_>], sector: SectorT)
        -> Result<u64>
    {
        let bytes: usize = bufs.iter().map(|b| b.len()).sum();
        let lba_count = bytes / self.info.lblock_size as usize;
        let cmd = AtaCmd {
            protocol: ATA_PROTO_DMA,
            ext: true,
            t_type: true,
            t_dir: true,
            byt_blk: true,
            t_length: ATA_TLEN_COUNT,
            // 16-bit field; 65536 blocks are encoded as zero
            count: (lba_count & 0xffff) as u16,
            lba: sector / self.info.lblock_sectors(),
            device: 1 << 6,
            command: ATA_READ_DMA_EXT,
            ..Default::default()
        };
        let mut sg = SgCmd::new(&cmd.cdb(), Xfer::FromDev);
        self.exec(&mut sg, |sg, fd| sg.exec_readv(fd, bufs))?;
        Ok(((bytes - sg.resid() as usize) >> SECTOR_SHIFT) as u64)
    }

    fn pwritev(&mut self, bufs: &[IoSlice<'_>], sector: SectorT)
        -> Result<u64>
    {
        let bytes: usize = bufs.iter().map(|b| b.len()).sum();
        let lba_count = bytes / self.info.lblock_size as usize;
        let cmd = AtaCmd {
            protocol: ATA_PROTO_DMA,
            ext: true,
            t_type: true,
            byt_blk: true,
            t_length: ATA_TLEN_COUNT,
            count: (lba_count & 0xffff) as u16,
            lba: sector / self.info.lblock_sectors(),
            device: 1 << 6,
            command: ATA_WRITE_DMA_EXT,
            ..Default::default()
        };
        let mut sg = SgCmd::new(&cmd.cdb(), Xfer::ToDev);
        self.exec(&mut sg, |sg, fd| sg.exec_writev(fd, bufs))?;
        Ok(((bytes - sg.resid() as usize) >> SECTOR_SHIFT) as u64)
    }

    fn flush(&mut self) -> Result {
        let cmd = AtaCmd {
            protocol: ATA_PROTO_NON_DATA,
            ext: true,
            command: ATA_FLUSH_CACHE_EXT,
            ..Default::default()
        };
        let mut sg = SgCmd::new(&cmd.cdb(), Xfer::None);
        self.exec(&mut sg, |sg, fd| sg.exec_none(fd))
    }
}

// LCOV_EXCL_STOP
