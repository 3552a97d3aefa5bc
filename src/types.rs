// vim: tw=80
//! Common type definitions used throughout the library

use enum_primitive_derive::Primitive;
use nix::errno::Errno;
use num_traits::FromPrimitive;
use std::{
    fmt::{self, Display, Formatter},
    io,
    ops::{BitOr, BitOrAssign},
};
use tracing::level_filters::LevelFilter;

/// All external addresses are in units of 512-byte sectors, regardless of
/// the device's logical block size.
pub type SectorT = u64;

/// Log2 of the sector size
pub const SECTOR_SHIFT: u32 = 9;

/// Size of a sector in bytes
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// The library's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum Error {
    // Standard errnos
    EPERM      = libc::EPERM as isize,
    ENOENT     = libc::ENOENT as isize,
    EINTR      = libc::EINTR as isize,
    EIO        = libc::EIO as isize,
    ENXIO      = libc::ENXIO as isize,
    EBADF      = libc::EBADF as isize,
    ENOMEM     = libc::ENOMEM as isize,
    EACCES     = libc::EACCES as isize,
    EFAULT     = libc::EFAULT as isize,
    EBUSY      = libc::EBUSY as isize,
    ENODEV     = libc::ENODEV as isize,
    ENOTDIR    = libc::ENOTDIR as isize,
    EISDIR     = libc::EISDIR as isize,
    EINVAL     = libc::EINVAL as isize,
    ENOSPC     = libc::ENOSPC as isize,
    EROFS      = libc::EROFS as isize,
    ENOTTY     = libc::ENOTTY as isize,
    EOVERFLOW  = libc::EOVERFLOW as isize,
    EOPNOTSUPP = libc::EOPNOTSUPP as isize,

    // Library-specific error types below
    EUNKNOWN   = 256,
    /// The device terminated a command with CHECK CONDITION status.  The
    /// decoded sense data is available from [`crate::Device::last_error`].
    EDEVERR    = 257,
}

pub type Result<T = ()> = std::result::Result<T, Error>;

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::from_i32(e as i32).unwrap_or(Error::EUNKNOWN)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

/// Flags accepted by [`crate::Device::open`].
///
/// The access mode defaults to read-only; `RDWR` requests write access.
/// The `DRV_*` bits restrict which backends may be probed.  An empty
/// restriction mask allows every backend, except that the emulator backend
/// always requires `DRV_FAKE` to be set explicitly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open the device read-only.  This is the default.
    pub const RDONLY: OpenFlags = OpenFlags(0);
    /// Open the device for reading and writing.
    pub const RDWR: OpenFlags = OpenFlags(0x0000_0001);
    /// Allow the native zoned-block-ioctl backend.
    pub const DRV_BLOCK: OpenFlags = OpenFlags(0x0100_0000);
    /// Allow the SCSI/ZBC backend.
    pub const DRV_SCSI: OpenFlags = OpenFlags(0x0200_0000);
    /// Allow the ATA/ZAC backend.
    pub const DRV_ATA: OpenFlags = OpenFlags(0x0400_0000);
    /// Allow (and opt into) the file-backed emulator backend.
    pub const DRV_FAKE: OpenFlags = OpenFlags(0x0800_0000);

    const DRV_MASK: u32 = 0x0F00_0000;

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw flag bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// The backend-restriction portion of the flags.  Zero means
    /// "unrestricted".
    pub fn drv_mask(self) -> u32 {
        self.0 & OpenFlags::DRV_MASK
    }

    pub fn writable(self) -> bool {
        self.contains(OpenFlags::RDWR)
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// SCSI sense keys reported for zone-related failures
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum SenseKey {
    IllegalRequest = 0x05,
    DataProtect    = 0x07,
    AbortedCommand = 0x0B,
}

/// Additional sense code + qualifier pairs for the zone-specific conditions,
/// encoded as `(asc << 8) | ascq`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum AscAscq {
    InvalidFieldInCdb         = 0x2400,
    LbaOutOfRange             = 0x2100,
    UnalignedWrite            = 0x2104,
    WriteBoundaryViolation    = 0x2105,
    AttemptToReadInvalidData  = 0x2106,
    ReadBoundaryViolation     = 0x2107,
    ZoneIsReadOnly            = 0x2708,
    InsufficientZoneResources = 0x550E,
}

/// Decoded sense data from the most recent failed command on a handle.
///
/// The raw byte values are stored so that sense codes this library doesn't
/// know about survive the round trip from the device to the caller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SenseInfo {
    /// Raw sense key
    pub sk:       u8,
    /// Raw additional sense code and qualifier, `(asc << 8) | ascq`
    pub asc_ascq: u16,
}

impl SenseInfo {
    pub fn new(sk: SenseKey, asc_ascq: AscAscq) -> Self {
        SenseInfo { sk: sk as u8, asc_ascq: asc_ascq as u16 }
    }

    /// The decoded sense key, if it is one of the zone-related keys.
    pub fn sense_key(&self) -> Option<SenseKey> {
        SenseKey::from_u8(self.sk)
    }

    /// The decoded ASC/ASCQ pair, if it is one of the zone-related codes.
    pub fn asc_ascq(&self) -> Option<AscAscq> {
        AscAscq::from_u16(self.asc_ascq)
    }
}

impl Display for SenseInfo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.sense_key() {
            Some(SenseKey::IllegalRequest) => write!(f, "Illegal-request")?,
            Some(SenseKey::DataProtect) => write!(f, "Data-protect")?,
            Some(SenseKey::AbortedCommand) => write!(f, "Aborted-command")?,
            None => write!(f, "Unknown-sense-key 0x{:02X}", self.sk)?,
        }
        write!(f, " / ")?;
        match self.asc_ascq() {
            Some(AscAscq::InvalidFieldInCdb) =>
                write!(f, "Invalid-field-in-cdb"),
            Some(AscAscq::LbaOutOfRange) =>
                write!(f, "Logical-block-address-out-of-range"),
            Some(AscAscq::UnalignedWrite) =>
                write!(f, "Unaligned-write-command"),
            Some(AscAscq::WriteBoundaryViolation) =>
                write!(f, "Write-boundary-violation"),
            Some(AscAscq::AttemptToReadInvalidData) =>
                write!(f, "Attempt-to-read-invalid-data"),
            Some(AscAscq::ReadBoundaryViolation) =>
                write!(f, "Read-boundary-violation"),
            Some(AscAscq::ZoneIsReadOnly) =>
                write!(f, "Zone-is-read-only"),
            Some(AscAscq::InsufficientZoneResources) =>
                write!(f, "Insufficient-zone-resources"),
            None => write!(f,
                "Unknown-additional-sense-code-qualifier 0x{:04X}",
                self.asc_ascq),
        }
    }
}

/// Set the library's diagnostic verbosity.
///
/// Accepts `"none"`, `"error"`, `"warning"`, `"info"` or `"debug"`; `None`
/// selects the default of `"error"`.  The first successful call installs a
/// global `tracing` subscriber and wins; later calls are no-ops.  An
/// application that installs its own subscriber should simply not call this.
/// Verbosity only affects diagnostic output, never behaviour.
pub fn set_log_level(level: Option<&str>) {
    let filter = match level {
        None => LevelFilter::ERROR,
        Some("none") => LevelFilter::OFF,
        Some("error") => LevelFilter::ERROR,
        Some("warning") => LevelFilter::WARN,
        Some("info") => LevelFilter::INFO,
        Some("debug") => LevelFilter::DEBUG,
        Some(other) => {
            eprintln!("Unknown log level \"{other}\"");
            return;
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_writer(io::stderr)
        .try_init();
}
