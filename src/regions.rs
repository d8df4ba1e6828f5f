// SPDX-License-Identifier: MIT OR Apache-2.0

//! Guest memory and the byte-layout machinery used to describe structures living in it.
//!
//! ## Base machinery
//!
//! - [`trait GuestMemory`](GuestMemory). Byte-addressable, fallible access to guest physical
//!   memory. Every structure the unit reads (device table, page tables, command ring, interrupt
//!   remapping tables) and writes (event log, completion-wait stores) goes through it.
//!
//! - [`bit_field!`](crate::bit_field). Integers whose bits are individual fields, each with an
//!   access mode. Used for registers and for every quadword of every guest structure.
//!
//! - [`le_struct!`](crate::le_struct). Fixed-size little-endian byte buffers with typed fields at
//!   byte offsets.
//!
//! ## `GuestMemory` implementations
//!
//! - [`struct GuestRam`](GuestRam). A heap-backed window of guest physical memory starting at some
//!   base address. Accesses outside the window fail.

/* ---------------------------------------------------------------------------------------------- */

mod bit_field_macros;
mod struct_macros;
pub mod structured;

use std::fmt::{self, Debug};
use std::io::{self, ErrorKind};
use std::sync::Mutex;

/* ---------------------------------------------------------------------------------------------- */

/// Describes which operations may be performed on some piece of memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Permissions {
    /// Only reading is allowed.
    Read,
    /// Only writing is allowed.
    Write,
    /// Both reading and writing are allowed.
    ReadWrite,
}

impl Permissions {
    pub fn new(can_read: bool, can_write: bool) -> Option<Permissions> {
        match (can_read, can_write) {
            (false, false) => None,
            (true, false) => Some(Permissions::Read),
            (false, true) => Some(Permissions::Write),
            (true, true) => Some(Permissions::ReadWrite),
        }
    }

    pub fn can_read(&self) -> bool {
        match self {
            Permissions::Read => true,
            Permissions::Write => false,
            Permissions::ReadWrite => true,
        }
    }

    pub fn can_write(&self) -> bool {
        match self {
            Permissions::Read => false,
            Permissions::Write => true,
            Permissions::ReadWrite => true,
        }
    }

    /// Whether every operation `access` needs is allowed by `self`.
    pub fn allows(&self, access: Permissions) -> bool {
        (!access.can_read() || self.can_read()) && (!access.can_write() || self.can_write())
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Guest physical memory as seen by the IOMMU.
///
/// Accesses may fail: the guest controls every address the unit dereferences, and an address that
/// maps to nothing is a guest misconfiguration. Failures are reported, never fatal.
///
/// All multi-byte helpers are little-endian.
pub trait GuestMemory: Send + Sync {
    /// Read from a contiguous range of guest memory into a byte buffer.
    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> io::Result<()>;

    /// Write a byte buffer to a contiguous range of guest memory.
    fn write_bytes(&self, address: u64, data: &[u8]) -> io::Result<()>;

    /// Read a little-endian [`u32`] at the given guest physical address.
    fn read_le_u32(&self, address: u64) -> io::Result<u32> {
        let mut bytes = [0; 4];
        self.read_bytes(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian [`u32`] at the given guest physical address.
    fn write_le_u32(&self, address: u64, value: u32) -> io::Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    /// Read a little-endian [`u64`] at the given guest physical address.
    fn read_le_u64(&self, address: u64) -> io::Result<u64> {
        let mut bytes = [0; 8];
        self.read_bytes(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a little-endian [`u64`] at the given guest physical address.
    fn write_le_u64(&self, address: u64, value: u64) -> io::Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A heap-backed window of guest physical memory `[base, base + length)`.
pub struct GuestRam {
    base: u64,
    data: Mutex<Vec<u8>>,
}

impl GuestRam {
    /// Creates zero-filled memory of `length` bytes starting at guest physical address `base`.
    pub fn new(base: u64, length: usize) -> GuestRam {
        GuestRam {
            base,
            data: Mutex::new(vec![0; length]),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // nothing panics while holding the lock, but don't propagate poisoning either way
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Translates `[address, address + len)` into a range of indices into `data`.
    fn validate_access(&self, address: u64, len: usize, total: usize) -> io::Result<usize> {
        let end = address.checked_add(len as u64);
        let limit = self.base + total as u64;

        match end {
            Some(end) if address >= self.base && end <= limit => Ok((address - self.base) as usize),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Tried to access guest range [{:#x}, {:#x}), must be within [{:#x}, {:#x})",
                    address,
                    address.wrapping_add(len as u64),
                    self.base,
                    limit
                ),
            )),
        }
    }
}

impl GuestMemory for GuestRam {
    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> io::Result<()> {
        let data = self.lock();
        let start = self.validate_access(address, buffer.len(), data.len())?;
        buffer.copy_from_slice(&data[start..start + buffer.len()]);
        Ok(())
    }

    fn write_bytes(&self, address: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.lock();
        let start = self.validate_access(address, bytes.len(), data.len())?;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Debug for GuestRam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestRam")
            .field("base", &format_args!("{:#x}", self.base))
            .field("length", &format_args!("{:#x}", self.len()))
            .finish()
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
