// SPDX-License-Identifier: MIT OR Apache-2.0

//! Commands the guest places in the command ring, and their decoding.
//!
//! Every command is two quadwords with the opcode in the top four bits of the first. Each opcode
//! has its own layout below, and a command with any reserved bit set is refused as a whole.

/* ---------------------------------------------------------------------------------------------- */

use std::ops::RangeInclusive;

use crate::{bit_field, le_struct};

/* ---------------------------------------------------------------------------------------------- */

/// Size of a command in bytes.
pub const COMMAND_SIZE: u64 = 16;

pub const COMPLETION_WAIT: u8 = 0x1;
pub const INVALIDATE_DEVTAB_ENTRY: u8 = 0x2;
pub const INVALIDATE_IOMMU_PAGES: u8 = 0x3;
pub const INVALIDATE_IOTLB_PAGES: u8 = 0x4;
pub const INVALIDATE_INTERRUPT_TABLE: u8 = 0x5;
pub const PREFETCH_IOMMU_PAGES: u8 = 0x6;
pub const COMPLETE_PPR_REQUEST: u8 = 0x7;
pub const INVALIDATE_IOMMU_ALL: u8 = 0x8;

le_struct! {
    pub struct RawCommand : 16 {
        quad0 @ 0x00 : u64,
        quad1 @ 0x08 : u64,
    }
}

bit_field! {
    pub struct CommandHeader : u64 {
        opcode @ 60--63 : RW u8,
    }

    pub struct CompletionWaitHeader : u64 {
        store         @ 0      : RW,
        interrupt     @ 1      : RW,
        flush_queue   @ 2      : RW,
        /// Store address, in 8-byte units.
        store_address @ 3--51  : RW u64,
        __            @ 52--59 : RsvdZ,
        opcode        @ 60--63 : RW u8,
    }

    /// First quadword of the commands that only name a device.
    pub struct DeviceCommandHeader : u64 {
        device_id @ 0--15  : RW u16,
        __        @ 16--59 : RsvdZ,
        opcode    @ 60--63 : RW u8,
    }

    pub struct InvalidateIommuPagesHeader : u64 {
        pasid     @ 0--19  : RW u32,
        __        @ 20--31 : RsvdZ,
        domain_id @ 32--47 : RW u16,
        __        @ 48--59 : RsvdZ,
        opcode    @ 60--63 : RW u8,
    }

    pub struct InvalidateIommuPagesAddress : u64 {
        size              @ 0      : RW,
        page_directories  @ 1      : RW,
        guest             @ 2      : RW,
        __                @ 3--11  : RsvdZ,
        address           @ 12--63 : RW u64,
    }

    pub struct InvalidateIotlbPagesHeader : u64 {
        device_id   @ 0--15  : RW u16,
        pasid_high  @ 16--23 : RW u8,
        max_pending @ 24--31 : RW u8,
        queue_id    @ 32--51 : RW u32,
        __          @ 52--59 : RsvdZ,
        opcode      @ 60--63 : RW u8,
    }

    pub struct InvalidateIotlbPagesAddress : u64 {
        size    @ 0      : RW,
        __      @ 1      : RsvdZ,
        guest   @ 2      : RW,
        __      @ 3--11  : RsvdZ,
        address @ 12--63 : RW u64,
    }

    pub struct PrefetchHeader : u64 {
        device_id @ 0--15  : RW u16,
        __        @ 16--23 : RsvdZ,
        count     @ 24--31 : RW u8,
        pasid     @ 32--51 : RW u32,
        __        @ 52--59 : RsvdZ,
        opcode    @ 60--63 : RW u8,
    }

    pub struct PrefetchAddress : u64 {
        size       @ 0      : RW,
        __         @ 1      : RsvdZ,
        guest      @ 2      : RW,
        __         @ 3      : RsvdZ,
        invalidate @ 4      : RW,
        __         @ 5--11  : RsvdZ,
        address    @ 12--63 : RW u64,
    }

    pub struct CompletePprHeader : u64 {
        device_id @ 0--15  : RW u16,
        __        @ 16--31 : RsvdZ,
        pasid     @ 32--51 : RW u32,
        __        @ 52--59 : RsvdZ,
        opcode    @ 60--63 : RW u8,
    }

    pub struct CompletePprTag : u64 {
        __             @ 0--1   : RsvdZ,
        guest          @ 2      : RW,
        __             @ 3--31  : RsvdZ,
        completion_tag @ 32--47 : RW u16,
        __             @ 48--63 : RsvdZ,
    }

    pub struct InvalidateAllHeader : u64 {
        __     @ 0--59  : RsvdZ,
        opcode @ 60--63 : RW u8,
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Addresses covered by an invalidation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvalidationRange {
    /// `size` bytes starting at `start`, naturally aligned.
    Pages { start: u64, size: u64 },
    /// The whole address space.
    All,
}

impl InvalidationRange {
    /// Decodes the S bit and address field shared by the invalidation commands.
    ///
    /// Without S, the range is the 4 KiB page at `address`. With S, the lowest zero bit of the
    /// address at or above bit 12, at index `n`, gives a size of `2^(n + 1)`.
    pub fn decode(size_bit: bool, address: u64) -> InvalidationRange {
        if !size_bit {
            return InvalidationRange::Pages {
                start: address & !0xfff,
                size: 0x1000,
            };
        }

        let n = (address | 0xfff).trailing_ones();
        if n >= 51 {
            return InvalidationRange::All;
        }

        let size = 1u64 << (n + 1);
        InvalidationRange::Pages {
            start: address & !(size - 1),
            size,
        }
    }

    /// The covered addresses, with the whole address space capped at `max_address`.
    pub fn clamp(&self, max_address: u64) -> Option<RangeInclusive<u64>> {
        match *self {
            InvalidationRange::All => Some(0..=max_address),
            InvalidationRange::Pages { start, .. } if start > max_address => None,
            InvalidationRange::Pages { start, size } => {
                Some(start..=(start + (size - 1)).min(max_address))
            }
        }
    }

    pub fn bounds(&self) -> (u64, u64) {
        match *self {
            InvalidationRange::All => (0, u64::MAX),
            InvalidationRange::Pages { start, size } => (start, start + (size - 1)),
        }
    }
}

/// A decoded, well-formed command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    CompletionWait {
        /// Where to store `data`, if anywhere.
        store: Option<u64>,
        data: u64,
        interrupt: bool,
    },
    InvalidateDevtabEntry {
        device_id: u16,
    },
    InvalidateIommuPages {
        domain_id: u16,
        range: InvalidationRange,
    },
    InvalidateIotlbPages {
        device_id: u16,
        range: InvalidationRange,
    },
    InvalidateInterruptTable {
        device_id: u16,
    },
    PrefetchIommuPages {
        device_id: u16,
        address: u64,
    },
    CompletePprRequest {
        device_id: u16,
    },
    InvalidateAll,
}

/// Why a command was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    UnknownOpcode(u8),
    ReservedBits(u8),
}

impl DecodeError {
    pub fn opcode(&self) -> u8 {
        match *self {
            DecodeError::UnknownOpcode(opcode) | DecodeError::ReservedBits(opcode) => opcode,
        }
    }
}

impl RawCommand {
    pub fn opcode(&self) -> u8 {
        CommandHeader(self.quad0()).opcode()
    }

    pub fn decode(&self) -> Result<Command, DecodeError> {
        let (quad0, quad1) = (self.quad0(), self.quad1());
        let opcode = self.opcode();

        let (command, reserved) = match opcode {
            COMPLETION_WAIT => {
                let header = CompletionWaitHeader(quad0);
                let command = Command::CompletionWait {
                    store: header.store().then(|| header.store_address() << 3),
                    data: quad1,
                    interrupt: header.interrupt(),
                };
                (command, header.reserved_bits() != 0)
            }

            INVALIDATE_DEVTAB_ENTRY | INVALIDATE_INTERRUPT_TABLE => {
                let header = DeviceCommandHeader(quad0);
                let device_id = header.device_id();
                let command = if opcode == INVALIDATE_DEVTAB_ENTRY {
                    Command::InvalidateDevtabEntry { device_id }
                } else {
                    Command::InvalidateInterruptTable { device_id }
                };
                (command, header.reserved_bits() != 0 || quad1 != 0)
            }

            INVALIDATE_IOMMU_PAGES => {
                let header = InvalidateIommuPagesHeader(quad0);
                let address = InvalidateIommuPagesAddress(quad1);
                let command = Command::InvalidateIommuPages {
                    domain_id: header.domain_id(),
                    range: InvalidationRange::decode(address.size(), quad1),
                };
                (
                    command,
                    header.reserved_bits() != 0 || address.reserved_bits() != 0,
                )
            }

            INVALIDATE_IOTLB_PAGES => {
                let header = InvalidateIotlbPagesHeader(quad0);
                let address = InvalidateIotlbPagesAddress(quad1);
                let command = Command::InvalidateIotlbPages {
                    device_id: header.device_id(),
                    range: InvalidationRange::decode(address.size(), quad1),
                };
                (
                    command,
                    header.reserved_bits() != 0 || address.reserved_bits() != 0,
                )
            }

            PREFETCH_IOMMU_PAGES => {
                let header = PrefetchHeader(quad0);
                let address = PrefetchAddress(quad1);
                let command = Command::PrefetchIommuPages {
                    device_id: header.device_id(),
                    address: address.address() << 12,
                };
                (
                    command,
                    header.reserved_bits() != 0 || address.reserved_bits() != 0,
                )
            }

            COMPLETE_PPR_REQUEST => {
                let header = CompletePprHeader(quad0);
                let tag = CompletePprTag(quad1);
                let command = Command::CompletePprRequest {
                    device_id: header.device_id(),
                };
                (
                    command,
                    header.reserved_bits() != 0 || tag.reserved_bits() != 0,
                )
            }

            INVALIDATE_IOMMU_ALL => {
                let header = InvalidateAllHeader(quad0);
                (Command::InvalidateAll, header.reserved_bits() != 0 || quad1 != 0)
            }

            _ => return Err(DecodeError::UnknownOpcode(opcode)),
        };

        if reserved {
            Err(DecodeError::ReservedBits(opcode))
        } else {
            Ok(command)
        }
    }
}

impl Command {
    /// Encodes the command the way a guest driver would.
    pub fn encode(&self) -> RawCommand {
        let (quad0, quad1) = match *self {
            Command::CompletionWait {
                store,
                data,
                interrupt,
            } => (
                CompletionWaitHeader(0)
                    .with_store(store.is_some())
                    .with_interrupt(interrupt)
                    .with_store_address(store.unwrap_or(0) >> 3)
                    .with_opcode(COMPLETION_WAIT)
                    .0,
                data,
            ),
            Command::InvalidateDevtabEntry { device_id } => (
                DeviceCommandHeader(0)
                    .with_device_id(device_id)
                    .with_opcode(INVALIDATE_DEVTAB_ENTRY)
                    .0,
                0,
            ),
            Command::InvalidateIommuPages { domain_id, range } => (
                InvalidateIommuPagesHeader(0)
                    .with_domain_id(domain_id)
                    .with_opcode(INVALIDATE_IOMMU_PAGES)
                    .0,
                encode_range(range),
            ),
            Command::InvalidateIotlbPages { device_id, range } => (
                InvalidateIotlbPagesHeader(0)
                    .with_device_id(device_id)
                    .with_opcode(INVALIDATE_IOTLB_PAGES)
                    .0,
                encode_range(range),
            ),
            Command::InvalidateInterruptTable { device_id } => (
                DeviceCommandHeader(0)
                    .with_device_id(device_id)
                    .with_opcode(INVALIDATE_INTERRUPT_TABLE)
                    .0,
                0,
            ),
            Command::PrefetchIommuPages { device_id, address } => (
                PrefetchHeader(0)
                    .with_device_id(device_id)
                    .with_opcode(PREFETCH_IOMMU_PAGES)
                    .0,
                PrefetchAddress(0).with_address(address >> 12).0,
            ),
            Command::CompletePprRequest { device_id } => (
                CompletePprHeader(0)
                    .with_device_id(device_id)
                    .with_opcode(COMPLETE_PPR_REQUEST)
                    .0,
                0,
            ),
            Command::InvalidateAll => (
                InvalidateAllHeader(0).with_opcode(INVALIDATE_IOMMU_ALL).0,
                0,
            ),
        };

        RawCommand::default().with_quad0(quad0).with_quad1(quad1)
    }
}

fn encode_range(range: InvalidationRange) -> u64 {
    match range {
        InvalidationRange::All => InvalidateIommuPagesAddress(0)
            .with_size(true)
            .with_address(u64::MAX >> 13)
            .0,
        InvalidationRange::Pages { start, size: 0x1000 } => start & !0xfff,
        InvalidationRange::Pages { start, size } => {
            InvalidateIommuPagesAddress((start | ((size >> 1) - 1)) & !0xfff)
                .with_size(true)
                .0
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
