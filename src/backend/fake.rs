// vim: tw=80
//! File-backed emulation of a host-managed zoned device
//!
//! The emulator keeps its zone table in a sidecar file next to the backing
//! file, so the backing file's address space maps 1:1 to device sectors.
//! A backing file without a sidecar opens as an unpartitioned standard
//! device that accepts nothing but `set_zones`.
//!
//! Opting in is explicit: this backend declines every open that doesn't
//! carry [`OpenFlags::DRV_FAKE`], so ordinary files never masquerade as
//! zoned devices by accident.

use crate::{
    backend::Backend,
    device::{
        DeviceInfo,
        DeviceType,
        ZoneModel,
        NOT_REPORTED,
        NO_LIMIT,
        UNRESTRICTED_READ,
    },
    types::*,
    zone::{zone_matches, Zone, ZoneCondition, ZoneOp, ZoneOpFlags, ZoneType},
};
use serde_derive::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{IoSlice, IoSliceMut, Read, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Identifies (and versions) a zone-table sidecar file
const META_MAGIC: &[u8; 8] = b"ZBDEMU1\0";

/// Largest single emulated transfer, in sectors
const FAKE_MAX_RW_SECTORS: SectorT = 65536;

const FAKE_LBLOCK_SIZE: u32 = 512;
const FAKE_PBLOCK_SIZE: u32 = 4096;

/// The persistent state: just the zone table
#[derive(Debug, Default, Deserialize, Serialize)]
struct Meta {
    zones: Vec<Zone>,
}

pub struct FakeBackend {
    file:      File,
    path:      PathBuf,
    meta_path: PathBuf,
    info:      DeviceInfo,
    zones:     Vec<Zone>,
    sense:     Option<SenseInfo>,
}

/// Probe entry point used by the dispatcher
pub(crate) fn open(path: &Path, flags: OpenFlags)
    -> Result<Box<dyn Backend>>
{
    FakeBackend::open(path, flags)
        .map(|b| Box::new(b) as Box<dyn Backend>)
}

impl FakeBackend {
    fn open(path: &Path, flags: OpenFlags) -> Result<FakeBackend> {
        if !flags.contains(OpenFlags::DRV_FAKE) {
            // Not opted in
            return Err(Error::ENXIO);
        }

        let md = fs::metadata(path).map_err(Error::from)?;
        if !md.is_file() {
            // Character and block devices belong to the real backends
            return Err(Error::ENXIO);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(flags.writable())
            .open(path)
            .map_err(Error::from)?;
        let sectors = md.len() >> SECTOR_SHIFT;

        let meta_path = {
            let mut os = path.as_os_str().to_owned();
            os.push(".zones");
            PathBuf::from(os)
        };
        let zones = match FakeBackend::load_meta(&meta_path)? {
            Some(meta) => meta.zones,
            None => Vec::new(),
        };

        let model = if zones.is_empty() {
            ZoneModel::Standard
        } else {
            ZoneModel::HostManaged
        };
        debug!("{}: emulated device, {} sectors, {} zones", path.display(),
               sectors, zones.len());

        let info = DeviceInfo {
            vendor_id: "FAKE".to_string(),
            dev_type: DeviceType::Fake,
            model,
            sectors,
            lblocks: sectors / (FAKE_LBLOCK_SIZE >> SECTOR_SHIFT) as u64,
            pblocks: sectors / (FAKE_PBLOCK_SIZE >> SECTOR_SHIFT) as u64,
            lblock_size: FAKE_LBLOCK_SIZE,
            pblock_size: FAKE_PBLOCK_SIZE,
            flags: UNRESTRICTED_READ,
            max_rw_sectors: FAKE_MAX_RW_SECTORS,
            max_nr_open_seq_req: NO_LIMIT,
            opt_nr_open_seq_pref: NOT_REPORTED,
            opt_nr_non_seq_write_seq_pref: NOT_REPORTED,
        };

        Ok(FakeBackend {
            file,
            path: path.to_path_buf(),
            meta_path,
            info,
            zones,
            sense: None,
        })
    }

    fn load_meta(meta_path: &Path) -> Result<Option<Meta>> {
        let mut f = match File::open(meta_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(Error::from(e)),
        };
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(Error::from)?;
        if buf.len() < META_MAGIC.len() || &buf[..META_MAGIC.len()] !=
            &META_MAGIC[..]
        {
            warn!("{}: corrupt zone table", meta_path.display());
            return Err(Error::EINVAL);
        }
        bincode::deserialize(&buf[META_MAGIC.len()..])
            .map(Some)
            .map_err(|e| {
                warn!("{}: corrupt zone table: {}", meta_path.display(), e);
                Error::EINVAL
            })
    }

    fn save_meta(&self) -> Result {
        let meta = Meta { zones: self.zones.clone() };
        let body = bincode::serialize(&meta).map_err(|_| Error::ENOMEM)?;
        let mut f = File::create(&self.meta_path).map_err(Error::from)?;
        f.write_all(META_MAGIC).map_err(Error::from)?;
        f.write_all(&body).map_err(Error::from)?;
        Ok(())
    }

    /// Index of the zone containing `sector`
    fn zone_index(&self, sector: SectorT) -> Option<usize> {
        self.zones.iter().position(|z| z.contains(sector))
    }

    /// Record sense data for a failed command and return the library's
    /// device-error code
    fn fail(&mut self, sk: SenseKey, asc: AscAscq) -> Error {
        self.sense = Some(SenseInfo::new(sk, asc));
        Error::EDEVERR
    }

    /// Apply one operation to one sequential zone, in place.  Returns the
    /// sense pair of the state machine violation, if any.
    fn apply_op(zone: &mut Zone, op: ZoneOp)
        -> std::result::Result<(), (SenseKey, AscAscq)>
    {
        use ZoneCondition::*;

        match zone.cond {
            Rdonly => {
                return Err((SenseKey::DataProtect, AscAscq::ZoneIsReadOnly));
            }
            Offline => {
                return Err((SenseKey::IllegalRequest,
                            AscAscq::InvalidFieldInCdb));
            }
            _ => ()
        }
        match op {
            ZoneOp::Reset => {
                zone.cond = Empty;
                zone.write_pointer = zone.start;
                zone.need_reset = false;
                zone.non_seq = false;
            }
            ZoneOp::Open => match zone.cond {
                Empty | ImpOpen | Closed | ExpOpen => zone.cond = ExpOpen,
                _ => return Err((SenseKey::IllegalRequest,
                                 AscAscq::InvalidFieldInCdb)),
            },
            ZoneOp::Close => match zone.cond {
                ImpOpen | ExpOpen | Closed => zone.cond = Closed,
                _ => return Err((SenseKey::IllegalRequest,
                                 AscAscq::InvalidFieldInCdb)),
            },
            ZoneOp::Finish => match zone.cond {
                Empty | ImpOpen | ExpOpen | Closed | Full => {
                    zone.cond = Full;
                    zone.write_pointer = zone.end();
                }
                _ => return Err((SenseKey::IllegalRequest,
                                 AscAscq::InvalidFieldInCdb)),
            },
        }
        Ok(())
    }

    /// Validate a write against the zone state machine.  Returns the sense
    /// pair to report, if the write is illegal.
    fn check_write(&self, sector: SectorT, count: SectorT)
        -> std::result::Result<(), (SenseKey, AscAscq)>
    {
        let idx = match self.zone_index(sector) {
            Some(idx) => idx,
            None => return Err((SenseKey::IllegalRequest,
                                AscAscq::LbaOutOfRange)),
        };
        let zone = &self.zones[idx];

        if zone.is_conventional() {
            // Writes may span adjacent conventional zones, but never leak
            // into sequential space
            let mut end = zone.end();
            for z in &self.zones[idx + 1..] {
                if !z.is_conventional() {
                    break;
                }
                end = z.end();
            }
            if sector + count > end {
                return Err((SenseKey::IllegalRequest,
                            AscAscq::WriteBoundaryViolation));
            }
            return Ok(());
        }

        match zone.cond {
            ZoneCondition::Rdonly => {
                return Err((SenseKey::DataProtect, AscAscq::ZoneIsReadOnly));
            }
            ZoneCondition::Offline => {
                return Err((SenseKey::DataProtect,
                            AscAscq::InvalidFieldInCdb));
            }
            _ => ()
        }
        if sector + count > zone.end() {
            return Err((SenseKey::IllegalRequest,
                        AscAscq::WriteBoundaryViolation));
        }
        if sector != zone.write_pointer {
            // Also covers writes to Full zones
            return Err((SenseKey::IllegalRequest, AscAscq::UnalignedWrite));
        }
        Ok(())
    }
}

impl Backend for FakeBackend {
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
        if self.zones.is_empty() {
            // Unpartitioned: nothing to report
            *nr_zones = 0;
            return Ok(());
        }
        let it = self.zones.iter().filter(|z| z.end() > start);
        match zones {
            None => {
                let mut n = 0;
                for z in it {
                    if zone_matches(z, ro)? {
                        n += 1;
                    }
                }
                *nr_zones = n;
            }
            Some(out) => {
                let mut n = 0;
                for z in it {
                    if n == out.len() {
                        break;
                    }
                    if zone_matches(z, ro)? {
                        out[n] = *z;
                        n += 1;
                    }
                }
                *nr_zones = n as u32;
            }
        }
        Ok(())
    }

    fn zone_op(&mut self, sector: SectorT, op: ZoneOp, flags: ZoneOpFlags)
        -> Result
    {
        if self.zones.is_empty() {
            return Err(Error::EINVAL);
        }

        if flags.all_zones() {
            // Conventional zones are unaffected; absorbing conditions are
            // skipped rather than failed
            for zone in self.zones.iter_mut() {
                if !zone.is_sequential() ||
                    matches!(zone.cond,
                             ZoneCondition::Rdonly | ZoneCondition::Offline)
                {
                    continue;
                }
                // Opening or closing every zone only touches the ones the
                // operation makes sense for
                let skip = match op {
                    ZoneOp::Open => zone.cond == ZoneCondition::Full,
                    ZoneOp::Close => !zone.is_open(),
                    _ => false,
                };
                if !skip {
                    FakeBackend::apply_op(zone, op).expect(
                        "filtered conditions can't fail the state machine");
                }
            }
            return self.save_meta();
        }

        let idx = match self.zone_index(sector) {
            Some(idx) => idx,
            None => {
                return Err(self.fail(SenseKey::IllegalRequest,
                                     AscAscq::LbaOutOfRange));
            }
        };
        if self.zones[idx].start != sector ||
            self.zones[idx].is_conventional()
        {
            return Err(self.fail(SenseKey::IllegalRequest,
                                 AscAscq::InvalidFieldInCdb));
        }
        match FakeBackend::apply_op(&mut self.zones[idx], op) {
            Ok(()) => self.save_meta(),
            Err((sk, asc)) => Err(self.fail(sk, asc)),
        }
    }

    fn preadv(&mut self, bufs: &mut [IoSliceMut<'_>], sector: SectorT)
        -> Result<u64>
    {
        if self.zones.is_empty() {
            return Err(Error::EINVAL);
        }
        // The emulated device reports unrestricted reads, so there is no
        // write-pointer check here
        let off = (sector << SECTOR_SHIFT) as libc::off_t;
        let n = nix::sys::uio::preadv(&self.file, bufs, off)
            .map_err(Error::from)?;
        Ok((n >> SECTOR_SHIFT) as u64)
    }

    fn pwritev(&mut self, bufs: &[IoSlice<'_>], sector: SectorT)
        -> Result<u64>
    {
        if self.zones.is_empty() {
            return Err(Error::EINVAL);
        }
        let bytes: usize = bufs.iter().map(|b| b.len()).sum();
        let count = (bytes >> SECTOR_SHIFT) as SectorT;

        if let Err((sk, asc)) = self.check_write(sector, count) {
            return Err(self.fail(sk, asc));
        }

        let off = (sector << SECTOR_SHIFT) as libc::off_t;
        let n = nix::sys::uio::pwritev(&self.file, bufs, off)
            .map_err(Error::from)?;
        let done = (n >> SECTOR_SHIFT) as SectorT;

        let idx = self.zone_index(sector).unwrap();
        let mut dirty = false;
        {
            let zone = &mut self.zones[idx];
            if zone.is_sequential() && done > 0 {
                zone.write_pointer = sector + done;
                if zone.write_pointer == zone.end() {
                    zone.cond = ZoneCondition::Full;
                } else if matches!(zone.cond, ZoneCondition::Empty |
                                   ZoneCondition::Closed)
                {
                    zone.cond = ZoneCondition::ImpOpen;
                }
                dirty = true;
            }
        }
        if dirty {
            self.save_meta()?;
        }
        Ok(done)
    }

    fn flush(&mut self) -> Result {
        self.file.sync_all().map_err(Error::from)?;
        if !self.zones.is_empty() {
            self.save_meta()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result {
        self.flush()
    }

    fn set_zones(&mut self, conv_size: SectorT, zone_size: SectorT)
        -> Result
    {
        let capacity = self.info.sectors;
        if zone_size == 0 || conv_size >= capacity ||
            zone_size > capacity - conv_size
        {
            return Err(Error::EINVAL);
        }

        let mut zones = Vec::new();
        if conv_size > 0 {
            zones.push(Zone {
                zone_type: ZoneType::Conventional,
                cond: ZoneCondition::NotWp,
                start: 0,
                length: conv_size,
                write_pointer: 0,
                need_reset: false,
                non_seq: false,
            });
        }
        let mut sector = conv_size;
        while sector < capacity {
            let length = zone_size.min(capacity - sector);
            zones.push(Zone {
                zone_type: ZoneType::SequentialReq,
                cond: ZoneCondition::Empty,
                start: sector,
                length,
                write_pointer: sector,
                need_reset: false,
                non_seq: false,
            });
            sector += length;
        }
        debug!("{}: partitioned into {} zones", self.path.display(),
               zones.len());

        self.zones = zones;
        self.info.model = ZoneModel::HostManaged;
        self.save_meta()
    }

    fn set_write_pointer(&mut self, sector: SectorT, wp: SectorT) -> Result {
        let idx = self.zone_index(sector).ok_or(Error::EINVAL)?;
        let zone = &mut self.zones[idx];
        if !zone.is_sequential() || wp < zone.start || wp > zone.end() {
            return Err(Error::EINVAL);
        }
        zone.write_pointer = wp;
        zone.cond = if wp == zone.start {
            ZoneCondition::Empty
        } else if wp == zone.end() {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImpOpen
        };
        self.save_meta()
    }
}

// LCOV_EXCL_STOP
