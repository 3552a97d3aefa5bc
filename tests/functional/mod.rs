// vim: tw=80
//! Functional tests that exercise a whole device stack.
//!
//! Everything here runs against the file-backed emulator backend, which is
//! the only backend that works without privileged access to real zoned
//! hardware.

mod emulator;
