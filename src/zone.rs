// vim: tw=80
//! Zone descriptors and zone classification
//!
//! Sequential-write-required zones move through a small state machine:
//!
//! ```text
//!             reset                      write
//!   Empty <---------- Closed <--------> ImpOpen ----> Full
//!     |                  ^   close/open    |            ^
//!     |  open            |                 | open       | write/finish
//!     +-------------> ExpOpen <------------+------------+
//! ```
//!
//! `Rdonly` and `Offline` are absorbing from the host's perspective.  The
//! transitions themselves are enforced by the device (or the emulator
//! backend); this module only describes zones.

use crate::types::SectorT;
use enum_primitive_derive::Primitive;
use serde_derive::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Zone type, using the ZBC/ZAC wire ordinals
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Primitive,
         Serialize)]
pub enum ZoneType {
    #[default]
    Unknown        = 0x00,
    /// Not a write pointer zone; random writes allowed
    Conventional   = 0x01,
    /// Sequential-write-required: writes must start at the write pointer
    SequentialReq  = 0x02,
    /// Sequential-write-preferred: non-sequential writes tolerated
    SequentialPref = 0x03,
}

/// Zone condition, using the ZBC/ZAC wire ordinals
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Primitive,
         Serialize)]
pub enum ZoneCondition {
    /// A conventional zone; no write pointer
    #[default]
    NotWp   = 0x00,
    Empty   = 0x01,
    ImpOpen = 0x02,
    ExpOpen = 0x03,
    Closed  = 0x04,
    Rdonly  = 0x0D,
    Full    = 0x0E,
    Offline = 0x0F,
}

/// Zone operations accepted by [`crate::Device::zone_op`]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum ZoneOp {
    /// Rewind the write pointer to the start of the zone
    Reset  = 0x01,
    /// Explicitly open the zone
    Open   = 0x02,
    /// Close an open zone
    Close  = 0x03,
    /// Advance the write pointer to the end of the zone
    Finish = 0x04,
}

/// Flag bits modifying a zone operation
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ZoneOpFlags(u32);

impl ZoneOpFlags {
    pub const NONE: ZoneOpFlags = ZoneOpFlags(0);
    /// Apply the operation to every applicable zone; the sector argument is
    /// ignored.
    pub const ALL_ZONES: ZoneOpFlags = ZoneOpFlags(0x01);

    pub fn contains(self, other: ZoneOpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn all_zones(self) -> bool {
        self.contains(ZoneOpFlags::ALL_ZONES)
    }
}

impl std::ops::BitOr for ZoneOpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        ZoneOpFlags(self.0 | rhs.0)
    }
}

/// Zone filters for [`crate::Device::report_zones`].
///
/// Only the low 4 bits travel on the wire; backends honour the filter so the
/// report iterator never has to re-filter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Primitive)]
pub enum ReportingOptions {
    /// Report every zone
    #[default]
    All       = 0x00,
    Empty     = 0x01,
    ImpOpen   = 0x02,
    ExpOpen   = 0x03,
    Closed    = 0x04,
    Full      = 0x05,
    Rdonly    = 0x06,
    Offline   = 0x07,
    /// Zones with the reset-recommended flag set
    NeedReset = 0x08,
    /// Zones with the non-sequential-resources flag set
    NonSeq    = 0x09,
}

impl ReportingOptions {
    /// The wire-level filter mask, without the partial bit
    pub fn mask(self) -> u8 {
        self as u8 & 0x0f
    }
}

/// Wire flag requesting that the backend report only as many zones as fit in
/// its buffer rather than failing.  OR-ed into the options mask by the report
/// iterator, never set by callers.
pub(crate) const RO_PARTIAL: u8 = 0x80;

/// Does the zone match the filter nibble of a reporting-options mask?
///
/// Backends without device-side filtering use this so that every backend
/// honours the filter identically.  Reserved filter values are invalid
/// arguments.
pub(crate) fn zone_matches(z: &Zone, ro: u8) -> crate::types::Result<bool> {
    Ok(match ro & 0x0f {
        0x00 => true,
        0x01 => z.cond == ZoneCondition::Empty,
        0x02 => z.cond == ZoneCondition::ImpOpen,
        0x03 => z.cond == ZoneCondition::ExpOpen,
        0x04 => z.cond == ZoneCondition::Closed,
        0x05 => z.cond == ZoneCondition::Full,
        0x06 => z.cond == ZoneCondition::Rdonly,
        0x07 => z.cond == ZoneCondition::Offline,
        0x08 => z.need_reset,
        0x09 => z.non_seq,
        _ => return Err(crate::types::Error::EINVAL),
    })
}

/// A single zone descriptor
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Zone {
    /// Zone type
    pub zone_type:     ZoneType,
    /// Current zone condition
    pub cond:          ZoneCondition,
    /// First sector of the zone, in 512-byte units
    pub start:         SectorT,
    /// Zone length in 512-byte sectors
    pub length:        SectorT,
    /// Next legal write position.  Only meaningful for write-pointer zones
    /// in a condition that has one; see [`Zone::wp_valid`].
    pub write_pointer: SectorT,
    /// The device recommends resetting this zone
    pub need_reset:    bool,
    /// The zone was written non-sequentially
    pub non_seq:       bool,
}

impl Zone {
    /// First sector past the end of the zone
    pub fn end(&self) -> SectorT {
        self.start + self.length
    }

    pub fn is_conventional(&self) -> bool {
        self.zone_type == ZoneType::Conventional
    }

    /// Does this zone have sequential-write semantics?
    pub fn is_sequential(&self) -> bool {
        matches!(self.zone_type,
                 ZoneType::SequentialReq | ZoneType::SequentialPref)
    }

    pub fn is_empty(&self) -> bool {
        self.cond == ZoneCondition::Empty
    }

    pub fn is_full(&self) -> bool {
        self.cond == ZoneCondition::Full
    }

    /// Is the zone implicitly or explicitly open?
    pub fn is_open(&self) -> bool {
        matches!(self.cond, ZoneCondition::ImpOpen | ZoneCondition::ExpOpen)
    }

    pub fn is_read_only(&self) -> bool {
        self.cond == ZoneCondition::Rdonly
    }

    pub fn is_offline(&self) -> bool {
        self.cond == ZoneCondition::Offline
    }

    /// Is the write pointer meaningful in the zone's current condition?
    pub fn wp_valid(&self) -> bool {
        !self.is_conventional() &&
            !matches!(self.cond,
                      ZoneCondition::NotWp | ZoneCondition::Rdonly |
                      ZoneCondition::Offline | ZoneCondition::Full)
    }

    /// Does `sector` fall within this zone?
    pub fn contains(&self, sector: SectorT) -> bool {
        sector >= self.start && sector < self.end()
    }
}

impl Display for ZoneType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ZoneType::Conventional => "Conventional",
            ZoneType::SequentialReq => "Sequential-write-required",
            ZoneType::SequentialPref => "Sequential-write-preferred",
            ZoneType::Unknown => "Unknown-zone-type",
        };
        s.fmt(f)
    }
}

impl Display for ZoneCondition {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ZoneCondition::NotWp => "Not-write-pointer",
            ZoneCondition::Empty => "Empty",
            ZoneCondition::ImpOpen => "Implicit-open",
            ZoneCondition::ExpOpen => "Explicit-open",
            ZoneCondition::Closed => "Closed",
            ZoneCondition::Rdonly => "Read-only",
            ZoneCondition::Full => "Full",
            ZoneCondition::Offline => "Offline",
        };
        s.fmt(f)
    }
}

impl Display for Zone {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.wp_valid() {
            write!(f, "{}: sector {}, {} sectors, {}, wp {}",
                   self.zone_type, self.start, self.length, self.cond,
                   self.write_pointer)
        } else {
            write!(f, "{}: sector {}, {} sectors, {}",
                   self.zone_type, self.start, self.length, self.cond)
        }
    }
}

#[cfg(test)]
mod t {
use num_traits::FromPrimitive;
use pretty_assertions::assert_eq;
use super::*;

fn swr(cond: ZoneCondition, start: SectorT, len: SectorT, wp: SectorT) -> Zone
{
    Zone {
        zone_type: ZoneType::SequentialReq,
        cond,
        start,
        length: len,
        write_pointer: wp,
        need_reset: false,
        non_seq: false,
    }
}

#[test]
fn wire_ordinals() {
    assert_eq!(ZoneType::from_u8(0x01), Some(ZoneType::Conventional));
    assert_eq!(ZoneType::from_u8(0x02), Some(ZoneType::SequentialReq));
    assert_eq!(ZoneType::from_u8(0x03), Some(ZoneType::SequentialPref));
    assert_eq!(ZoneCondition::from_u8(0x0D), Some(ZoneCondition::Rdonly));
    assert_eq!(ZoneCondition::from_u8(0x0E), Some(ZoneCondition::Full));
    assert_eq!(ZoneCondition::from_u8(0x0F), Some(ZoneCondition::Offline));
    assert_eq!(ZoneCondition::from_u8(0x05), None);
    assert_eq!(ZoneOp::Reset as u8, 1);
    assert_eq!(ZoneOp::Open as u8, 2);
    assert_eq!(ZoneOp::Close as u8, 3);
    assert_eq!(ZoneOp::Finish as u8, 4);
}

#[test]
fn predicates() {
    let z = swr(ZoneCondition::Empty, 1000, 100, 1000);
    assert!(z.is_sequential());
    assert!(!z.is_conventional());
    assert!(z.is_empty());
    assert!(z.wp_valid());
    assert_eq!(z.end(), 1100);
    assert!(z.contains(1000));
    assert!(z.contains(1099));
    assert!(!z.contains(1100));

    let z = swr(ZoneCondition::Full, 1000, 100, 1100);
    assert!(z.is_full());
    assert!(!z.wp_valid());

    let z = swr(ZoneCondition::ImpOpen, 1000, 100, 1050);
    assert!(z.is_open());
    let z = swr(ZoneCondition::ExpOpen, 1000, 100, 1050);
    assert!(z.is_open());

    let conv = Zone {
        zone_type: ZoneType::Conventional,
        cond: ZoneCondition::NotWp,
        start: 0,
        length: 1000,
        ..Default::default()
    };
    assert!(conv.is_conventional());
    assert!(!conv.wp_valid());
    assert!(!conv.is_open());
}

#[test]
fn reporting_option_masks() {
    assert_eq!(ReportingOptions::All.mask(), 0x00);
    assert_eq!(ReportingOptions::Empty.mask(), 0x01);
    assert_eq!(ReportingOptions::Full.mask(), 0x05);
    assert_eq!(ReportingOptions::NonSeq.mask(), 0x09);
    // The partial flag lives outside the filter nibble
    assert_eq!(RO_PARTIAL & 0x0f, 0);
}

#[test]
fn display() {
    let z = swr(ZoneCondition::ImpOpen, 200, 100, 250);
    assert_eq!(z.to_string(),
        "Sequential-write-required: sector 200, 100 sectors, \
         Implicit-open, wp 250");
    let z = swr(ZoneCondition::Full, 200, 100, 300);
    assert_eq!(z.to_string(),
        "Sequential-write-required: sector 200, 100 sectors, Full");
}

}
