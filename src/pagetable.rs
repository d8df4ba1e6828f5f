// SPDX-License-Identifier: MIT OR Apache-2.0

//! The I/O page table walker.
//!
//! A DTE with paging mode `N` points at a table of level `N - 1`. Each level resolves 9 bits of the
//! IOVA above the 12-bit page offset, so an entry at level `L` covers `1 << (12 + 9 * L)` bytes.
//! Permission bits are ANDed from the DTE down to the entry where the walk stops.
//!
//! A non-leaf entry names the level of the table it points to, which may skip levels: an entry in
//! a level-3 table whose Next Level is 1 points straight at a table of 4 KiB entries. Next Level
//! must always decrease along the walk.
//!
//! An entry whose Next Level field is 7 starts a run of contiguous entries that together map one
//! larger page. The size of that page is encoded in the entry's address field: the number of
//! consecutive ones starting at bit 12, plus 12, is one less than its log2.

/* ---------------------------------------------------------------------------------------------- */

use log::trace;

use crate::bit_field;
use crate::devtab::DeviceTableEntry;
use crate::error::Fault;
use crate::regions::{GuestMemory, Permissions};

/* ---------------------------------------------------------------------------------------------- */

pub const PAGE_SIZE_4K: u64 = 1 << 12;

/// Bits 12 to 51, the frame address of an entry.
const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

bit_field! {
    pub struct Pte : u64 {
        present          @ 0      : RW,
        __               @ 1--8   : RsvdP,
        /// 0 for a leaf, 7 for a contiguous run, otherwise the level of the next table.
        next_level       @ 9--11  : RW u8,
        address          @ 12--51 : RW u64,
        __               @ 52--60 : RsvdP,
        read_permission  @ 61     : RW,
        write_permission @ 62     : RW,
        __               @ 63     : RsvdP,
    }
}

impl Pte {
    fn permissions(&self) -> (bool, bool) {
        (self.read_permission(), self.write_permission())
    }

    fn is_leaf(&self) -> bool {
        matches!(self.next_level(), 0 | 7)
    }

    /// Size of the page mapped by the contiguous run this entry belongs to.
    fn large_page_size(&self) -> u64 {
        let ones = (self.0 | 0xfff).trailing_ones();
        1 << (ones + 1).min(63)
    }

    /// Address of the entry for `iova` in the level-`level` table this entry points to.
    fn next_entry_address(&self, level: u8, iova: u64) -> u64 {
        (self.0 & ADDRESS_MASK) + (((iova >> level_shift(level)) & 0x1ff) << 3)
    }
}

fn level_shift(level: u8) -> u32 {
    12 + 9 * u32::from(level)
}

/// Bytes covered by one entry at `level`.
pub fn level_page_size(level: u8) -> u64 {
    1 << level_shift(level)
}

/// Highest IOVA a paging mode can translate.
pub fn max_address(mode: u8) -> u64 {
    match 1u64.checked_shl(level_shift(mode)) {
        Some(size) => size - 1,
        None => u64::MAX,
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The page containing some IOVA, as resolved by a walk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Translation {
    /// First IOVA of the page.
    pub iova: u64,
    /// Address the first IOVA of the page translates to.
    pub translated_addr: u64,
    /// Size of the page, a power of two.
    pub page_size: u64,
    /// `None` when the page isn't mapped.
    pub permissions: Option<Permissions>,
}

impl Translation {
    /// The page of size `page_size` containing `address`, translated to itself.
    pub fn identity(address: u64, page_size: u64, permissions: Option<Permissions>) -> Translation {
        let iova = address & !(page_size - 1);
        Translation {
            iova,
            translated_addr: iova,
            page_size,
            permissions,
        }
    }

    pub fn address_mask(&self) -> u64 {
        self.page_size - 1
    }

    pub fn contains(&self, address: u64) -> bool {
        address & !self.address_mask() == self.iova
    }

    /// Translates an address inside the page.
    pub fn translate(&self, address: u64) -> u64 {
        self.translated_addr | (address & self.address_mask())
    }

    pub fn is_mapped(&self) -> bool {
        self.permissions.is_some()
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Reason a walk could not determine whether an IOVA is mapped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkError {
    /// The DTE's TV bit is clear.
    TranslationNotValid,
    /// The IOVA is beyond what the DTE's paging mode can translate.
    AddressOutOfRange { mode: u8 },
    /// The top-level table could not be read. Nothing in the address space can be translated.
    RootPointerRead { address: u64 },
    /// A lower-level table could not be read. Only the `page_size` bytes covered by the failed
    /// entry are affected.
    PageTableRead { address: u64, page_size: u64 },
    /// The entry at `address` points to a table at or above its own level. Like a read failure,
    /// only the `page_size` bytes covered by that entry are affected.
    IllegalNextLevel { address: u64, page_size: u64 },
}

impl WalkError {
    pub fn into_fault(self, device_id: u16, iova: u64) -> Fault {
        match self {
            WalkError::TranslationNotValid => Fault::TranslationNotValid { device_id },
            WalkError::AddressOutOfRange { mode } => Fault::AddressOutOfRange { iova, mode },
            WalkError::RootPointerRead { address } => Fault::RootPointerRead { address },
            WalkError::PageTableRead { address, .. } => Fault::PageTableRead { address },
            WalkError::IllegalNextLevel { address, .. } => Fault::IllegalNextLevel { address },
        }
    }
}

/// Resolves the page containing `iova` through the page tables of `dte`.
///
/// Pages that aren't present, or whose accumulated permissions are empty, come back as a
/// [`Translation`] without permissions. The returned page is always the first page of a contiguous
/// run, even if `iova` falls in the middle of it.
pub fn walk(
    memory: &dyn GuestMemory,
    dte: &DeviceTableEntry,
    iova: u64,
) -> Result<Translation, WalkError> {
    if !dte.translation_valid() {
        return Err(WalkError::TranslationNotValid);
    }

    let mode = dte.mode();
    if mode == 0 {
        return Ok(Translation::identity(iova, PAGE_SIZE_4K, dte.permissions()));
    }

    if mode == 7 || iova > max_address(mode) {
        return Err(WalkError::AddressOutOfRange { mode });
    }

    // the DTE behaves like an entry pointing at the top-level table
    let mut entry = Pte(dte.quad0().0);
    let (mut can_read, mut can_write) = entry.permissions();
    let mut level = mode - 1;
    let mut page_size = level_page_size(level);

    while can_read || can_write {
        page_size = level_page_size(level);

        let address = entry.next_entry_address(level, iova);
        entry = match memory.read_le_u64(address) {
            Ok(value) => Pte(value),
            // levels strictly decrease, so only the first fetch can be at `mode - 1`
            Err(_) if level == mode - 1 => return Err(WalkError::RootPointerRead { address }),
            Err(_) => return Err(WalkError::PageTableRead { address, page_size }),
        };

        trace!("level {} entry at {:#x} is {:?}", level, address, entry);

        let (read, write) = entry.permissions();
        can_read &= read;
        can_write &= write;

        if !entry.present() {
            can_read = false;
            can_write = false;
            break;
        }

        if entry.is_leaf() {
            if entry.next_level() == 7 {
                page_size = entry.large_page_size().max(page_size);
            }
            break;
        }

        // Next Level counts from 1 for the 4 KiB table
        let next_level = entry.next_level();
        if next_level > level {
            return Err(WalkError::IllegalNextLevel { address, page_size });
        }
        level = next_level - 1;
    }

    let permissions = Permissions::new(can_read, can_write);
    let page_mask = !(page_size - 1);

    Ok(Translation {
        iova: iova & page_mask,
        translated_addr: match permissions {
            Some(_) => entry.0 & ADDRESS_MASK & page_mask,
            None => 0,
        },
        page_size,
        permissions,
    })
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
