// vim: tw=80
//! Command descriptor block assembly and payload parsing
//!
//! Everything that knows the exact byte layout of a command or of a reply
//! payload lives here: the 16-byte ATA PASS-THROUGH CDB, the ATA Report
//! Zones log page, SCSI sense buffers, and the big-endian helpers for the
//! few SCSI replies that need them.

use crate::{
    types::{Error, Result, SenseInfo},
    zone::{Zone, ZoneCondition, ZoneType},
};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_traits::FromPrimitive;

/// Length of every CDB this library issues
pub const CDB_LEN: usize = 16;

/// SCSI operation code wrapping an ATA command (ATA PASS-THROUGH (16))
pub const ATA16_OPCODE: u8 = 0x85;

// ATA command codes
pub const ATA_EXEC_DEV_DIAGNOSTIC: u8 = 0x90;
pub const ATA_READ_LOG_DMA_EXT: u8 = 0x47;
pub const ATA_READ_DMA_EXT: u8 = 0x25;
pub const ATA_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_FLUSH_CACHE_EXT: u8 = 0xEA;
pub const ATA_ZONE_MGMT_OUT: u8 = 0x9F;

// ATA transport protocols, CDB byte 1 bits 3:1
pub const ATA_PROTO_NON_DATA: u8 = 0x3;
pub const ATA_PROTO_DMA: u8 = 0x6;

// t_length = transfer length is in the COUNT field
pub const ATA_TLEN_COUNT: u8 = 0x2;

/// The log address of the Report Zones log
pub const ATA_REPORT_ZONES_LOG: u8 = 0x1A;
/// The log address of the general purpose log directory
pub const ATA_LOG_DIRECTORY: u8 = 0x00;

/// Size of one zone descriptor in the Report Zones log
pub const ATA_ZONE_DESCRIPTOR_LEN: usize = 64;
/// Bytes in the Report Zones log before the first descriptor
pub const ATA_ZONE_HEADER_LEN: usize = 64;

/// An ATA command to be wrapped in an ATA PASS-THROUGH (16) CDB.
///
/// ```text
/// +=============================================================================+
/// |  Bit|   7    |   6    |   5    |   4    |   3    |   2    |   1    |   0    |
/// |Byte |        |        |        |        |        |        |        |        |
/// |=====+==========================+============================================|
/// | 0   |                           Operation Code (85h)                        |
/// |-----+-----------------------------------------------------------------------|
/// | 1   |      Multiple count      |              Protocol             |  ext   |
/// |-----+-----------------------------------------------------------------------|
/// | 2   |    off_line     |ck_cond | t_type | t_dir  |byt_blk |    t_length     |
/// |-----+-----------------------------------------------------------------------|
/// | 3   |                          features (15:8)                              |
/// |-----+-----------------------------------------------------------------------|
/// | 4   |                          features (7:0)                               |
/// |-----+-----------------------------------------------------------------------|
/// | 5   |                            count (15:8)                               |
/// |-----+-----------------------------------------------------------------------|
/// | 6   |                            count (7:0)                                |
/// |-----+-----------------------------------------------------------------------|
/// | 7   |                          LBA (31:24)                                  |
/// |-----+-----------------------------------------------------------------------|
/// | 8   |                          LBA (7:0)                                    |
/// |-----+-----------------------------------------------------------------------|
/// | 9   |                          LBA (39:32)                                  |
/// |-----+-----------------------------------------------------------------------|
/// | 10  |                          LBA (15:8)                                   |
/// |-----+-----------------------------------------------------------------------|
/// | 11  |                          LBA (47:40)                                  |
/// |-----+-----------------------------------------------------------------------|
/// | 12  |                          LBA (23:16)                                  |
/// |-----+-----------------------------------------------------------------------|
/// | 13  |                           Device                                      |
/// |-----+-----------------------------------------------------------------------|
/// | 14  |                           Command                                     |
/// |-----+-----------------------------------------------------------------------|
/// | 15  |                           Control                                     |
/// +=============================================================================+
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AtaCmd {
    pub protocol: u8,
    pub ext:      bool,
    pub ck_cond:  bool,
    /// Transfer units: false = bytes, true = blocks
    pub t_type:   bool,
    /// Transfer direction: true = from device
    pub t_dir:    bool,
    /// Block counter granularity: true = 512-byte blocks
    pub byt_blk:  bool,
    pub t_length: u8,
    pub features: u16,
    pub count:    u16,
    pub lba:      u64,
    pub device:   u8,
    pub command:  u8,
}

impl AtaCmd {
    /// Serialize into the ATA PASS-THROUGH (16) wire layout
    pub fn cdb(&self) -> [u8; CDB_LEN] {
        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = ATA16_OPCODE;
        cdb[1] = (self.protocol << 1) | self.ext as u8;
        cdb[2] = (self.ck_cond as u8) << 5 |
                 (self.t_type as u8) << 4 |
                 (self.t_dir as u8) << 3 |
                 (self.byt_blk as u8) << 2 |
                 (self.t_length & 0x3);
        cdb[3] = ((self.features >> 8) & 0xff) as u8;
        cdb[4] = (self.features & 0xff) as u8;
        cdb[5] = ((self.count >> 8) & 0xff) as u8;
        cdb[6] = (self.count & 0xff) as u8;
        cdb[7] = ((self.lba >> 24) & 0xff) as u8;
        cdb[8] = (self.lba & 0xff) as u8;
        cdb[9] = ((self.lba >> 32) & 0xff) as u8;
        cdb[10] = ((self.lba >> 8) & 0xff) as u8;
        cdb[11] = ((self.lba >> 40) & 0xff) as u8;
        cdb[12] = ((self.lba >> 16) & 0xff) as u8;
        cdb[13] = self.device;
        cdb[14] = self.command;
        cdb
    }

    /// Recover the fields of a serialized command
    pub fn parse(cdb: &[u8; CDB_LEN]) -> AtaCmd {
        AtaCmd {
            protocol: (cdb[1] >> 1) & 0xf,
            ext: cdb[1] & 0x1 != 0,
            ck_cond: cdb[2] & 0x20 != 0,
            t_type: cdb[2] & 0x10 != 0,
            t_dir: cdb[2] & 0x08 != 0,
            byt_blk: cdb[2] & 0x04 != 0,
            t_length: cdb[2] & 0x3,
            features: (cdb[3] as u16) << 8 | cdb[4] as u16,
            count: (cdb[5] as u16) << 8 | cdb[6] as u16,
            lba: (cdb[8] as u64)
                | (cdb[10] as u64) << 8
                | (cdb[12] as u64) << 16
                | (cdb[7] as u64) << 24
                | (cdb[9] as u64) << 32
                | (cdb[11] as u64) << 40,
            device: cdb[13],
            command: cdb[14],
        }
    }
}

/// Get a word from a little-endian command data buffer
pub fn get_word(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(buf)
}

/// Get a Dword from a little-endian command data buffer
pub fn get_dword(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(buf)
}

/// Get a Qword from a little-endian command data buffer
pub fn get_qword(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(buf)
}

/// Get a big-endian Dword; SCSI replies such as READ CAPACITY use these
pub fn get_be_dword(buf: &[u8]) -> u32 {
    BigEndian::read_u32(buf)
}

/// Get a big-endian Qword
pub fn get_be_qword(buf: &[u8]) -> u64 {
    BigEndian::read_u64(buf)
}

/// Store a big-endian Dword into a CDB field
pub fn put_be_dword(buf: &mut [u8], v: u32) {
    BigEndian::write_u32(buf, v);
}

/// Store a big-endian Qword into a CDB field
pub fn put_be_qword(buf: &mut [u8], v: u64) {
    BigEndian::write_u64(buf, v);
}

/// Number of zones in a Report Zones log page, from the 64-byte header
pub fn ata_report_zones_count(buf: &[u8]) -> Result<u32> {
    if buf.len() < ATA_ZONE_HEADER_LEN {
        return Err(Error::EIO);
    }
    Ok(get_dword(&buf[0..4]))
}

/// Decode one 64-byte zone descriptor from the ATA Report Zones log.
///
/// All fields are little-endian.  Byte 0's low nibble is the zone type,
/// byte 1's high nibble the condition and its bit 0 the reset flag; the
/// length, start, and write pointer qwords follow at offsets 8, 16 and 24.
pub fn ata_parse_zone(buf: &[u8]) -> Result<Zone> {
    if buf.len() < ATA_ZONE_DESCRIPTOR_LEN {
        return Err(Error::EIO);
    }
    let zone_type = ZoneType::from_u8(buf[0] & 0x0f)
        .unwrap_or(ZoneType::Unknown);
    let cond = ZoneCondition::from_u8((buf[1] >> 4) & 0x0f)
        .ok_or(Error::EIO)?;
    Ok(Zone {
        zone_type,
        cond,
        length: get_qword(&buf[8..16]),
        start: get_qword(&buf[16..24]),
        write_pointer: get_qword(&buf[24..32]),
        need_reset: buf[1] & 0x01 != 0,
        non_seq: false,
    })
}

/// Decode a SCSI sense buffer into the key/code pair of the error record.
///
/// Handles both fixed (70h/71h) and descriptor (72h/73h) formats.  Returns
/// `None` when the buffer is too short or carries an unknown response code.
pub fn parse_sense(buf: &[u8]) -> Option<SenseInfo> {
    if buf.len() < 4 {
        return None;
    }
    match buf[0] & 0x7f {
        0x70 | 0x71 => {
            if buf.len() < 14 {
                return None;
            }
            Some(SenseInfo {
                sk: buf[2] & 0x0f,
                asc_ascq: (buf[12] as u16) << 8 | buf[13] as u16,
            })
        }
        0x72 | 0x73 => Some(SenseInfo {
            sk: buf[1] & 0x0f,
            asc_ascq: (buf[2] as u16) << 8 | buf[3] as u16,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng, rngs::StdRng};
use super::*;

/// The exact wire bytes of a Report Zones log read, compared against the
/// layout table byte for byte.
#[test]
fn read_log_wire_format() {
    let cmd = AtaCmd {
        protocol: ATA_PROTO_DMA,
        ext: true,
        t_dir: true,
        byt_blk: true,
        t_length: ATA_TLEN_COUNT,
        features: 0x0001,          // reporting options in features(7:0)
        count: 128,                // buffer sectors
        lba: (0x0002u64 << 8) | ATA_REPORT_ZONES_LOG as u64,
        command: ATA_READ_LOG_DMA_EXT,
        ..Default::default()
    };
    let cdb = cmd.cdb();
    assert_eq!(cdb[0], 0x85);
    assert_eq!(cdb[1], (0x6 << 1) | 0x01);  // DMA protocol, ext=1
    assert_eq!(cdb[2], 0x0e);  // ck_cond=0 t_type=0 t_dir=1 byt_blk=1 len=10
    assert_eq!(cdb[4], 0x01);
    assert_eq!(cdb[5], 0x00);
    assert_eq!(cdb[6], 128);
    assert_eq!(cdb[8], 0x1A);  // log address in LBA(7:0)
    assert_eq!(cdb[10], 0x02); // page number in LBA(15:8)
    assert_eq!(cdb[14], 0x47);
    assert_eq!(cdb[15], 0x00);
}

#[test]
fn lba_interleave() {
    let cmd = AtaCmd {
        lba: 0x0000_CDEF_89AB_4567,
        ..Default::default()
    };
    let cdb = cmd.cdb();
    assert_eq!(cdb[7], 0xEF);   // 31:24
    assert_eq!(cdb[8], 0x67);   // 7:0
    assert_eq!(cdb[9], 0xAB);   // 39:32
    assert_eq!(cdb[10], 0x45);  // 15:8
    assert_eq!(cdb[11], 0xCD);  // 47:40
    assert_eq!(cdb[12], 0x89);  // 23:16
}

#[test]
fn cdb_roundtrip() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..1000 {
        let cmd = AtaCmd {
            protocol: rng.gen_range(0..16),
            ext: rng.gen(),
            ck_cond: rng.gen(),
            t_type: rng.gen(),
            t_dir: rng.gen(),
            byt_blk: rng.gen(),
            t_length: rng.gen_range(0..4),
            features: rng.gen(),
            count: rng.gen(),
            lba: rng.gen_range(0..1u64 << 48),
            device: rng.gen(),
            command: rng.gen(),
        };
        assert_eq!(cmd, AtaCmd::parse(&cmd.cdb()));
    }
}

#[test]
fn zone_descriptor() {
    let mut desc = [0u8; 64];
    desc[0] = 0x02;             // sequential write required
    desc[1] = (0x2 << 4) | 0x1; // implicitly open, reset recommended
    LittleEndian::write_u64(&mut desc[8..16], 131072);
    LittleEndian::write_u64(&mut desc[16..24], 262144);
    LittleEndian::write_u64(&mut desc[24..32], 266240);
    let z = ata_parse_zone(&desc).unwrap();
    assert_eq!(z.zone_type, ZoneType::SequentialReq);
    assert_eq!(z.cond, ZoneCondition::ImpOpen);
    assert_eq!(z.length, 131072);
    assert_eq!(z.start, 262144);
    assert_eq!(z.write_pointer, 266240);
    assert!(z.need_reset);
    assert!(!z.non_seq);
}

#[test]
fn zone_descriptor_malformed() {
    // Truncated descriptor
    assert_eq!(ata_parse_zone(&[0u8; 32]), Err(Error::EIO));
    // Reserved condition nibble
    let mut desc = [0u8; 64];
    desc[0] = 0x02;
    desc[1] = 0x5 << 4;
    assert_eq!(ata_parse_zone(&desc), Err(Error::EIO));
}

#[test]
fn report_zones_header() {
    let mut buf = [0u8; 512];
    LittleEndian::write_u32(&mut buf[0..4], 55);
    assert_eq!(ata_report_zones_count(&buf).unwrap(), 55);
    assert_eq!(ata_report_zones_count(&buf[0..32]), Err(Error::EIO));
}

#[test]
fn sense_formats() {
    // Fixed format
    let mut fixed = [0u8; 18];
    fixed[0] = 0x70;
    fixed[2] = 0x05;
    fixed[12] = 0x21;
    fixed[13] = 0x04;
    let s = parse_sense(&fixed).unwrap();
    assert_eq!(s.sk, 0x05);
    assert_eq!(s.asc_ascq, 0x2104);

    // Descriptor format
    let mut desc = [0u8; 32];
    desc[0] = 0x72;
    desc[1] = 0x07;
    desc[2] = 0x27;
    desc[3] = 0x08;
    let s = parse_sense(&desc).unwrap();
    assert_eq!(s.sk, 0x07);
    assert_eq!(s.asc_ascq, 0x2708);

    // Garbage
    assert_eq!(parse_sense(&[0xffu8; 18]), None);
    assert_eq!(parse_sense(&[0x70u8]), None);
}

#[test]
fn endian_helpers() {
    let buf = [0x12u8, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0];
    assert_eq!(get_word(&buf), 0x3412);
    assert_eq!(get_dword(&buf), 0x78563412);
    assert_eq!(get_qword(&buf), 0xf0debc9a78563412);
    assert_eq!(get_be_dword(&buf), 0x12345678);
    assert_eq!(get_be_qword(&buf), 0x123456789abcdef0);
    let mut out = [0u8; 8];
    put_be_qword(&mut out, 0x123456789abcdef0);
    assert_eq!(out, buf);
    put_be_dword(&mut out[0..4], 0xdeadbeef);
    assert_eq!(&out[0..4], &[0xde, 0xad, 0xbe, 0xef]);
}

}
