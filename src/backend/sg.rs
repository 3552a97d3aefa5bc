// vim: tw=80
//! SCSI-generic pass-through transport
//!
//! Executes one prepared CDB against a kernel pass-through channel and
//! surfaces the result: transfer residual, and decoded sense data when the
//! target returns CHECK CONDITION.  Everything above this layer is
//! transport-agnostic; everything below it belongs to the kernel.

use crate::{
    backend::cdb::{self, CDB_LEN},
    types::{Error, Result, SenseInfo},
};
use cfg_if::cfg_if;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

/// Data transfer direction of one command
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Xfer {
    None,
    FromDev,
    ToDev,
}

const SENSE_BUF_LEN: usize = 64;

/// Command timeout, in milliseconds
const SG_TIMEOUT: u32 = 30_000;

// SG_IO interface constants
const SG_INTERFACE_ID: libc::c_int = 'S' as libc::c_int;
const SG_DXFER_NONE: libc::c_int = -1;
const SG_DXFER_TO_DEV: libc::c_int = -2;
const SG_DXFER_FROM_DEV: libc::c_int = -3;

const SG_CHECK_CONDITION: u8 = 0x02;
const SG_DRIVER_SENSE: u16 = 0x08;

/// FFI definition of the kernel's SG_IO request block.  It can't go in libc
/// because the ioctl wrapper uses Nix's macros, and it isn't really a stable
/// interface anyway.
#[doc(hidden)]
#[repr(C)]
pub struct sg_io_hdr {
    pub interface_id:    libc::c_int,
    pub dxfer_direction: libc::c_int,
    pub cmd_len:         u8,
    pub mx_sb_len:       u8,
    pub iovec_count:     u16,
    pub dxfer_len:       u32,
    pub dxferp:          *mut libc::c_void,
    pub cmdp:            *mut u8,
    pub sbp:             *mut u8,
    pub timeout:         u32,
    pub flags:           u32,
    pub pack_id:         libc::c_int,
    pub usr_ptr:         *mut libc::c_void,
    pub status:          u8,
    pub masked_status:   u8,
    pub msg_status:      u8,
    pub sb_len_wr:       u8,
    pub host_status:     u16,
    pub driver_status:   u16,
    pub resid:           libc::c_int,
    pub duration:        u32,
    pub info:            u32,
}

impl Default for sg_io_hdr {
    fn default() -> Self {
        // Safe because sg_io_hdr is plain old data and all-zeroes is a valid
        // (if useless) request
        unsafe { std::mem::zeroed() }
    }
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod ffi {
            use nix::ioctl_readwrite_bad;

            const SG_IO: libc::c_ulong = 0x2285;

            ioctl_readwrite_bad! {
                #[doc(hidden)]
                sg_io, SG_IO, super::sg_io_hdr
            }
        }
    }
}

/// One pass-through command: CDB in, data and sense out.
pub struct SgCmd {
    cdb:        [u8; CDB_LEN],
    cdb_len:    u8,
    dir:        Xfer,
    sense_buf:  [u8; SENSE_BUF_LEN],
    sb_len:     u8,
    resid:      u32,
    sense_info: Option<SenseInfo>,
}

impl SgCmd {
    /// Prepare a command.  `cdb` may be shorter than 16 bytes for the legacy
    /// SCSI opcodes (INQUIRY is 6 bytes).
    pub fn new(cdb: &[u8], dir: Xfer) -> SgCmd {
        assert!(cdb.len() <= CDB_LEN);
        let mut c = [0u8; CDB_LEN];
        c[..cdb.len()].copy_from_slice(cdb);
        SgCmd {
            cdb: c,
            cdb_len: cdb.len() as u8,
            dir,
            sense_buf: [0u8; SENSE_BUF_LEN],
            sb_len: 0,
            resid: 0,
            sense_info: None,
        }
    }

    /// Bytes the device did not transfer
    pub fn resid(&self) -> u32 {
        self.resid
    }

    /// Decoded sense data, if the command failed with CHECK CONDITION
    pub fn sense_info(&self) -> Option<SenseInfo> {
        self.sense_info
    }

    /// The raw sense buffer returned by the device.  Commands issued with
    /// `ck_cond` use this to read the ATA register file out of the sense
    /// descriptor.
    pub fn sense_data(&self) -> &[u8] {
        &self.sense_buf[..self.sb_len as usize]
    }

    /// Execute a command with no data transfer
    pub fn exec_none(&mut self, fd: RawFd) -> Result {
        self.exec(fd, std::ptr::null_mut(), 0, 0)
    }

    /// Execute a command reading into one contiguous buffer
    pub fn exec_from_dev(&mut self, fd: RawFd, buf: &mut [u8]) -> Result {
        debug_assert_eq!(self.dir, Xfer::FromDev);
        self.exec(fd, buf.as_mut_ptr() as *mut libc::c_void,
                  buf.len() as u32, 0)
    }

    /// Execute a command writing from one contiguous buffer
    pub fn exec_to_dev(&mut self, fd: RawFd, buf: &[u8]) -> Result {
        debug_assert_eq!(self.dir, Xfer::ToDev);
        self.exec(fd, buf.as_ptr() as *mut libc::c_void, buf.len() as u32, 0)
    }

    /// Execute a command scattering the read data into `bufs`.
    ///
    /// `IoSliceMut` is ABI-compatible with the `iovec` the SG driver
    /// expects.
    pub fn exec_readv(&mut self, fd: RawFd, bufs: &mut [IoSliceMut])
        -> Result
    {
        debug_assert_eq!(self.dir, Xfer::FromDev);
        let len = bufs.iter().map(|b| b.len()).sum::<usize>() as u32;
        self.exec(fd, bufs.as_mut_ptr() as *mut libc::c_void, len,
                  bufs.len() as u16)
    }

    /// Execute a command gathering the write data from `bufs`
    pub fn exec_writev(&mut self, fd: RawFd, bufs: &[IoSlice]) -> Result {
        debug_assert_eq!(self.dir, Xfer::ToDev);
        let len = bufs.iter().map(|b| b.len()).sum::<usize>() as u32;
        self.exec(fd, bufs.as_ptr() as *mut libc::c_void, len,
                  bufs.len() as u16)
    }

    #[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
    fn exec(&mut self, fd: RawFd, dxferp: *mut libc::c_void, dxfer_len: u32,
            iovec_count: u16) -> Result
    {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                let mut hdr = sg_io_hdr {
                    interface_id: SG_INTERFACE_ID,
                    dxfer_direction: match self.dir {
                        Xfer::None => SG_DXFER_NONE,
                        Xfer::FromDev => SG_DXFER_FROM_DEV,
                        Xfer::ToDev => SG_DXFER_TO_DEV,
                    },
                    cmd_len: self.cdb_len,
                    mx_sb_len: SENSE_BUF_LEN as u8,
                    iovec_count,
                    dxfer_len,
                    dxferp,
                    cmdp: self.cdb.as_mut_ptr(),
                    sbp: self.sense_buf.as_mut_ptr(),
                    timeout: SG_TIMEOUT,
                    ..Default::default()
                };
                // Safe because hdr's pointers are valid for the duration of
                // the ioctl and the kernel writes nothing past the stated
                // lengths
                unsafe {
                    ffi::sg_io(fd, &mut hdr)
                }.map_err(Error::from)?;
                self.resid = hdr.resid.max(0) as u32;
                self.sb_len = hdr.sb_len_wr;
                self.complete(hdr.status, hdr.host_status, hdr.driver_status)
            } else {
                // No SCSI-generic pass-through on this platform
                Err(Error::EOPNOTSUPP)
            }
        }
    }

    /// Classify a completed command from its status bytes
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn complete(&mut self, status: u8, host_status: u16, driver_status: u16)
        -> Result
    {
        let has_sense = status == SG_CHECK_CONDITION ||
            driver_status & SG_DRIVER_SENSE != 0;
        if has_sense {
            return match cdb::parse_sense(self.sense_data()) {
                // NO SENSE and RECOVERED ERROR are informational; commands
                // issued with ck_cond land here with the ATA register file
                // in the sense descriptors.
                Some(si) if si.sk <= 0x01 => Ok(()),
                Some(si) => {
                    self.sense_info = Some(si);
                    Err(Error::EDEVERR)
                }
                None => Err(Error::EIO),
            };
        }
        if status != 0 || host_status != 0 || driver_status != 0 {
            return Err(Error::EIO);
        }
        Ok(())
    }
}
