// vim: tw=80

use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use std::fs;
use tempfile::{Builder, TempDir};
use zbd::{
    is_zoned,
    Device,
    DeviceType,
    Error,
    OpenFlags,
    ReportingOptions,
    AscAscq,
    SenseKey,
    ZoneCondition,
    ZoneModel,
    ZoneOpFlags,
    ZoneType,
    SECTOR_SHIFT,
};

/// One 128 MiB conventional zone
const CONV: u64 = 262144;
/// Fifteen 64 MiB sequential-write-required zones
const ZLEN: u64 = 131072;
const NZONES: usize = 16;
const CAPACITY: u64 = CONV + 15 * ZLEN;

struct Harness {
    dev: Device,
    path: std::path::PathBuf,
    _tempdir: TempDir,
}

#[fixture]
fn harness() -> Harness {
    let tempdir = Builder::new()
        .prefix("test_emulator")
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("zbd");
    let f = fs::File::create(&path).unwrap();
    f.set_len(CAPACITY << SECTOR_SHIFT).unwrap();
    drop(f);

    let mut dev = Device::open(&path, OpenFlags::RDWR | OpenFlags::DRV_FAKE)
        .unwrap();
    dev.set_zones(CONV, ZLEN).unwrap();
    Harness { dev, path, _tempdir: tempdir }
}

/// Every zone list must partition the device and respect the write pointer
/// rules
fn check_invariants(dev: &mut Device) {
    let zones = dev.list_zones(0, ReportingOptions::All).unwrap();
    let mut next_start = 0;
    for z in &zones {
        assert_eq!(z.start, next_start, "zones must not gap or overlap");
        next_start = z.start + z.length;
        if z.zone_type == ZoneType::SequentialReq &&
            !matches!(z.cond,
                      ZoneCondition::Rdonly | ZoneCondition::Offline)
        {
            assert!(z.write_pointer >= z.start);
            assert!(z.write_pointer <= z.end());
            match z.cond {
                ZoneCondition::Empty =>
                    assert_eq!(z.write_pointer, z.start),
                ZoneCondition::Full =>
                    assert_eq!(z.write_pointer, z.end()),
                _ => (),
            }
        }
    }
    assert_eq!(next_start, dev.info().sectors,
               "zones must cover the whole device");
}

/// A freshly partitioned emulator reports one conventional zone followed by
/// empty sequential zones
#[rstest]
fn fresh_layout(mut harness: Harness) {
    let info = harness.dev.info();
    assert_eq!(info.dev_type, DeviceType::Fake);
    assert_eq!(info.model, ZoneModel::HostManaged);
    assert_eq!(info.sectors, CAPACITY);

    let zones = harness.dev.list_zones(0, ReportingOptions::All).unwrap();
    assert_eq!(zones.len(), NZONES);

    assert_eq!(zones[0].zone_type, ZoneType::Conventional);
    assert_eq!(zones[0].cond, ZoneCondition::NotWp);
    assert_eq!(zones[0].start, 0);
    assert_eq!(zones[0].length, CONV);

    for z in &zones[1..] {
        assert_eq!(z.zone_type, ZoneType::SequentialReq);
        assert_eq!(z.cond, ZoneCondition::Empty);
        assert_eq!(z.length, ZLEN);
        assert_eq!(z.write_pointer, z.start);
    }
    check_invariants(&mut harness.dev);
}

/// An aligned write at a zone's start implicitly opens it and advances the
/// write pointer
#[rstest]
fn write_opens_zone(mut harness: Harness) {
    let buf = vec![0xaau8; 4096 << SECTOR_SHIFT];
    assert_eq!(harness.dev.pwrite(&buf, CONV), Ok(4096));

    let mut zones = [Default::default(); 1];
    let n = harness.dev.report_zones(CONV, ReportingOptions::All,
                                     &mut zones).unwrap();
    assert_eq!(n, 1);
    assert_eq!(zones[0].cond, ZoneCondition::ImpOpen);
    assert_eq!(zones[0].write_pointer, CONV + 4096);

    // What was written can be read back
    let mut rbuf = vec![0u8; 4096 << SECTOR_SHIFT];
    assert_eq!(harness.dev.pread(&mut rbuf, CONV), Ok(4096));
    assert_eq!(rbuf, buf);
    check_invariants(&mut harness.dev);
}

/// A misaligned write is rejected before it reaches the device, leaving all
/// state unchanged
#[rstest]
fn misaligned_write(mut harness: Harness) {
    let buf = vec![0u8; 8 << SECTOR_SHIFT];
    assert_eq!(harness.dev.pwrite(&buf, CONV + 1), Err(Error::EINVAL));
    // Local validation must not disturb the error record
    assert_eq!(harness.dev.last_error(), None);

    let mut zones = [Default::default(); 1];
    harness.dev.report_zones(CONV, ReportingOptions::All, &mut zones)
        .unwrap();
    assert_eq!(zones[0].cond, ZoneCondition::Empty);
    assert_eq!(zones[0].write_pointer, CONV);
}

/// A write that is aligned but not at the write pointer is the device's
/// problem, and it reports it via sense data
#[rstest]
fn write_not_at_wp(mut harness: Harness) {
    let buf = vec![0u8; 8 << SECTOR_SHIFT];
    assert_eq!(harness.dev.pwrite(&buf, CONV + 8), Err(Error::EDEVERR));
    let sense = harness.dev.last_error().unwrap();
    assert_eq!(sense.sense_key(), Some(SenseKey::IllegalRequest));
    assert_eq!(sense.asc_ascq(), Some(AscAscq::UnalignedWrite));
}

/// A read straddling the end of the device is clamped
#[rstest]
fn read_clamped_at_capacity(mut harness: Harness) {
    let mut buf = vec![0u8; 8 << SECTOR_SHIFT];
    assert_eq!(harness.dev.pread(&mut buf, CAPACITY - 4), Ok(4));
    // And entirely past the end transfers nothing
    assert_eq!(harness.dev.pread(&mut buf, CAPACITY), Ok(0));
}

/// Resetting one zone rewinds it to Empty; resetting all zones leaves the
/// conventional zone alone
#[rstest]
fn reset_zones(mut harness: Harness) {
    let buf = vec![0u8; 4096 << SECTOR_SHIFT];
    harness.dev.pwrite(&buf, CONV).unwrap();
    harness.dev.pwrite(&buf, CONV + ZLEN).unwrap();
    harness.dev.pwrite(&buf, 0).unwrap();

    harness.dev.reset_zone(CONV, ZoneOpFlags::NONE).unwrap();
    let zones = harness.dev.list_zones(0, ReportingOptions::All).unwrap();
    assert_eq!(zones[1].cond, ZoneCondition::Empty);
    assert_eq!(zones[1].write_pointer, CONV);
    // Zone 2 is still open
    assert_eq!(zones[2].cond, ZoneCondition::ImpOpen);

    harness.dev.reset_zone(0, ZoneOpFlags::ALL_ZONES).unwrap();
    let zones = harness.dev.list_zones(0, ReportingOptions::All).unwrap();
    for z in &zones[1..] {
        assert_eq!(z.cond, ZoneCondition::Empty);
        assert_eq!(z.write_pointer, z.start);
    }
    // The conventional zone doesn't have a write pointer to reset
    assert_eq!(zones[0].zone_type, ZoneType::Conventional);
    // And its data survived
    let mut rbuf = vec![0u8; 4096 << SECTOR_SHIFT];
    harness.dev.pread(&mut rbuf, 0).unwrap();
    assert_eq!(rbuf, buf);
    check_invariants(&mut harness.dev);
}

/// Filtered reports only return matching zones
#[rstest]
fn report_filters(mut harness: Harness) {
    // Nothing is full on a fresh device
    let full = harness.dev.list_zones(0, ReportingOptions::Full).unwrap();
    assert!(full.is_empty());

    // Fill one zone completely
    let buf = vec![0u8; (ZLEN as usize) << SECTOR_SHIFT];
    assert_eq!(harness.dev.pwrite(&buf, CONV), Ok(ZLEN));
    let full = harness.dev.list_zones(0, ReportingOptions::Full).unwrap();
    assert_eq!(full.len(), 1);
    assert_eq!(full[0].start, CONV);
    assert_eq!(full[0].cond, ZoneCondition::Full);
    assert_eq!(full[0].write_pointer, full[0].end());

    let empty = harness.dev.list_zones(0, ReportingOptions::Empty).unwrap();
    assert_eq!(empty.len(), NZONES - 2);
    check_invariants(&mut harness.dev);
}

/// The count query and the full enumeration agree
#[rstest]
fn count_matches_list(mut harness: Harness) {
    let count = harness.dev.report_nr_zones(0, ReportingOptions::All)
        .unwrap();
    let zones = harness.dev.list_zones(0, ReportingOptions::All).unwrap();
    assert_eq!(count as usize, zones.len());

    // Also from a mid-device starting point
    let count = harness.dev
        .report_nr_zones(CONV + 5 * ZLEN, ReportingOptions::All)
        .unwrap();
    assert_eq!(count as usize, NZONES - 6);
}

/// Explicit zone state transitions: open, close, finish
#[rstest]
fn zone_state_machine(mut harness: Harness) {
    let dev = &mut harness.dev;
    dev.open_zone(CONV, ZoneOpFlags::NONE).unwrap();
    let zones = dev.list_zones(CONV, ReportingOptions::ExpOpen).unwrap();
    assert_eq!(zones.len(), 1);

    dev.close_zone(CONV, ZoneOpFlags::NONE).unwrap();
    let zones = dev.list_zones(CONV, ReportingOptions::Closed).unwrap();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0].start, CONV);

    dev.finish_zone(CONV, ZoneOpFlags::NONE).unwrap();
    let zones = dev.list_zones(CONV, ReportingOptions::Full).unwrap();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0].write_pointer, zones[0].end());

    dev.reset_zone(CONV, ZoneOpFlags::NONE).unwrap();
    check_invariants(dev);
}

/// Zone operations on the conventional zone are device errors with decoded
/// sense
#[rstest]
fn zone_op_on_conventional(mut harness: Harness) {
    assert_eq!(harness.dev.reset_zone(0, ZoneOpFlags::NONE),
               Err(Error::EDEVERR));
    let sense = harness.dev.last_error().unwrap();
    assert_eq!(sense.sense_key(), Some(SenseKey::IllegalRequest));
    assert_eq!(sense.asc_ascq(), Some(AscAscq::InvalidFieldInCdb));
}

/// Vectored I/O round trip through multiple buffers
#[rstest]
fn vectored_io(mut harness: Harness) {
    let b0: Vec<u8> = (0..16 << SECTOR_SHIFT).map(|i| i as u8).collect();
    let b1: Vec<u8> = (0..8 << SECTOR_SHIFT).map(|i| (i * 3) as u8)
        .collect();
    let bufs = [std::io::IoSlice::new(&b0), std::io::IoSlice::new(&b1)];
    assert_eq!(harness.dev.pwritev(&bufs, CONV), Ok(24));

    let mut r0 = vec![0u8; 8 << SECTOR_SHIFT];
    let mut r1 = vec![0u8; 16 << SECTOR_SHIFT];
    let mut rbufs = [std::io::IoSliceMut::new(&mut r0),
                     std::io::IoSliceMut::new(&mut r1)];
    assert_eq!(harness.dev.preadv(&mut rbufs, CONV), Ok(24));

    let mut expected = b0.clone();
    expected.extend_from_slice(&b1);
    let mut actual = r0;
    actual.extend_from_slice(&r1);
    assert_eq!(actual, expected);
}

/// Emulator state survives close and reopen
#[rstest]
fn persistence(harness: Harness) {
    let Harness { mut dev, path, _tempdir } = harness;
    let buf = vec![0x42u8; 4096 << SECTOR_SHIFT];
    dev.pwrite(&buf, CONV).unwrap();
    dev.flush().unwrap();
    dev.close().unwrap();

    let mut dev = Device::open(&path,
                               OpenFlags::RDWR | OpenFlags::DRV_FAKE)
        .unwrap();
    assert_eq!(dev.info().model, ZoneModel::HostManaged);
    let zones = dev.list_zones(CONV, ReportingOptions::All).unwrap();
    assert_eq!(zones[0].cond, ZoneCondition::ImpOpen);
    assert_eq!(zones[0].write_pointer, CONV + 4096);
    let mut rbuf = vec![0u8; 4096 << SECTOR_SHIFT];
    dev.pread(&mut rbuf, CONV).unwrap();
    assert_eq!(rbuf, buf);
}

/// Forcing the write pointer, an emulator-only operation
#[rstest]
fn set_write_pointer(mut harness: Harness) {
    harness.dev.set_write_pointer(CONV, CONV + 4096).unwrap();
    let zones = harness.dev.list_zones(CONV, ReportingOptions::All)
        .unwrap();
    assert_eq!(zones[0].cond, ZoneCondition::ImpOpen);
    assert_eq!(zones[0].write_pointer, CONV + 4096);
    check_invariants(&mut harness.dev);
}

/// The probe form: emulated devices only count as zoned when asked to
#[rstest]
fn is_zoned_probe(harness: Harness) {
    let Harness { dev, path, _tempdir } = harness;
    dev.close().unwrap();
    assert_eq!(is_zoned(&path, true), Ok(true));
    assert_eq!(is_zoned(&path, false), Ok(false));
}

/// Without the emulator opt-in flag, a plain file matches no backend
#[rstest]
fn no_opt_in(harness: Harness) {
    let Harness { dev, path, _tempdir } = harness;
    dev.close().unwrap();
    assert!(matches!(Device::open(&path, OpenFlags::RDWR),
                     Err(Error::ENODEV)));
}

#[test]
fn open_missing_path() {
    assert!(matches!(
        Device::open("/nonexistent/zbd", OpenFlags::RDWR),
        Err(Error::ENOENT)));
}

/// An unpartitioned emulator accepts set_zones and nothing else
#[test]
fn unpartitioned() {
    let tempdir = Builder::new()
        .prefix("test_emulator_unpart")
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("zbd");
    let f = fs::File::create(&path).unwrap();
    f.set_len(CAPACITY << SECTOR_SHIFT).unwrap();
    drop(f);

    let mut dev = Device::open(&path, OpenFlags::RDWR | OpenFlags::DRV_FAKE)
        .unwrap();
    assert_eq!(dev.info().model, ZoneModel::Standard);
    assert_eq!(dev.report_nr_zones(0, ReportingOptions::All), Ok(0));
    let buf = vec![0u8; 8 << SECTOR_SHIFT];
    assert_eq!(dev.pwrite(&buf, 0), Err(Error::EINVAL));
}
