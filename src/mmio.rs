// SPDX-License-Identifier: MIT OR Apache-2.0

//! The memory-mapped register block.
//!
//! Every byte of the block has a read-only mask and a write-1-to-clear mask. Guest writes go
//! through [`RegisterFile::write`], which applies them; the unit itself updates registers with
//! [`RegisterFile::set`], which doesn't.

/* ---------------------------------------------------------------------------------------------- */

use crate::bit_field;
use crate::config::AmdViConfig;
use crate::regions::structured::{LeField, RegisterValue};

/* ---------------------------------------------------------------------------------------------- */

/// Size of the register block in bytes.
pub const MMIO_SIZE: u64 = 0x4000;

pub const DEVICE_TABLE: u64 = 0x0000;
pub const COMMAND_BASE: u64 = 0x0008;
pub const EVENT_BASE: u64 = 0x0010;
pub const CONTROL: u64 = 0x0018;
pub const EXCLUSION_BASE: u64 = 0x0020;
pub const EXCLUSION_LIMIT: u64 = 0x0028;
pub const EXT_FEATURES: u64 = 0x0030;

pub const COMMAND_HEAD: u64 = 0x2000;
pub const COMMAND_TAIL: u64 = 0x2008;
pub const EVENT_HEAD: u64 = 0x2010;
pub const EVENT_TAIL: u64 = 0x2018;
pub const STATUS: u64 = 0x2020;

/* ---------------------------------------------------------------------------------------------- */

bit_field! {
    /// Location and size of the device table.
    pub struct DeviceTableBase : u64 {
        /// Size of the table in 4 KiB pages, minus one.
        size @ 0--8   : RW u16,
        __   @ 9--11  : RsvdP,
        /// Guest physical address of the table, in 4 KiB units.
        base @ 12--51 : RW u64,
        __   @ 52--63 : RsvdP,
    }

    /// Location and size of the command ring or the event log.
    pub struct RingBase : u64 {
        __     @ 0--11  : RsvdP,
        base   @ 12--51 : RW u64,
        __     @ 52--55 : RsvdP,
        /// Log2 of the number of entries.
        length @ 56--59 : RW u8,
        __     @ 60--63 : RsvdP,
    }

    /// Head or tail index of the command ring or the event log.
    pub struct RingPointer : u64 {
        __    @ 0--3   : RsvdP,
        index @ 4--18  : RW u16,
        __    @ 19--63 : RsvdP,
    }

    pub struct Control : u64 {
        iommu_enable          @  0 : RW,
        ht_tunnel_enable      @  1 : RW,
        event_log_enable      @  2 : RW,
        event_int_enable      @  3 : RW,
        com_wait_int_enable   @  4 : RW,
        command_buffer_enable @ 12 : RW,
        ga_enable             @ 17 : RW,
        xt_enable             @ 50 : RW,
    }

    /// Start of the range of addresses that bypass translation.
    pub struct ExclusionBase : u64 {
        exclusion_enable @ 0      : RW,
        allow_all        @ 1      : RW,
        __               @ 2--11  : RsvdP,
        base             @ 12--51 : RW u64,
        __               @ 52--63 : RsvdP,
    }

    /// End of the exclusion range. The low 12 bits always read as ones.
    pub struct ExclusionLimit : u64 {
        __    @ 0--11  : RsvdP,
        limit @ 12--51 : RW u64,
        __    @ 52--63 : RsvdP,
    }

    pub struct ExtendedFeatures : u64 {
        __                                @ 0--1   : RsvdP,
        xt_supported                      @ 2      : RO,
        __                                @ 3--5   : RsvdP,
        invalidate_all_supported          @ 6      : RO,
        ga_supported                      @ 7      : RO,
        __                                @ 8--9   : RsvdP,
        host_address_translation_size     @ 10--11 : RO u8,
        __                                @ 12--63 : RsvdP,
    }

    pub struct Status : u64 {
        event_overflow @  0 : RW1C,
        event_log_int  @  1 : RW1C,
        com_wait_int   @  2 : RW1C,
        event_log_run  @  3 : RO,
        cmd_buffer_run @  4 : RO,
        ppr_overflow   @  5 : RW1C,
        ppr_int        @  6 : RW1C,
        ppr_log_run    @  7 : RO,
        __             @ 8--63 : RsvdP,
    }
}

impl DeviceTableBase {
    /// Number of 32-byte entries the table holds.
    pub fn entries(&self) -> u64 {
        (u64::from(self.size()) + 1) * 4096 / 32
    }

    pub fn address(&self) -> u64 {
        self.base() << 12
    }
}

impl RingBase {
    pub fn entries(&self) -> u64 {
        1 << self.length().min(15)
    }

    pub fn address(&self) -> u64 {
        self.base() << 12
    }
}

impl ExclusionBase {
    pub fn address(&self) -> u64 {
        self.base() << 12
    }
}

impl ExclusionLimit {
    /// Last address of the range, inclusive.
    pub fn address(&self) -> u64 {
        (self.limit() << 12) | 0xfff
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A register at a fixed offset of the register block.
pub trait Register: LeField {
    const OFFSET: u64;
    const READ_ONLY_MASK: u64;
    const WRITE_1_CLEAR_MASK: u64;
}

macro_rules! impl_register {
    ($($type:ident @ $offset:ident),* $(,)?) => {
        $(
            impl Register for $type {
                const OFFSET: u64 = $offset;
                const READ_ONLY_MASK: u64 = $type::READ_ONLY_MASK;
                const WRITE_1_CLEAR_MASK: u64 = $type::WRITE_1_CLEAR_MASK;
            }
        )*
    };
}

impl_register! {
    DeviceTableBase @ DEVICE_TABLE,
    Control @ CONTROL,
    ExclusionBase @ EXCLUSION_BASE,
    ExclusionLimit @ EXCLUSION_LIMIT,
    ExtendedFeatures @ EXT_FEATURES,
    Status @ STATUS,
}

/// Names one of the four ring registers that share a layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ring {
    CommandHead,
    CommandTail,
    EventHead,
    EventTail,
}

impl Ring {
    pub const fn offset(self) -> u64 {
        match self {
            Ring::CommandHead => COMMAND_HEAD,
            Ring::CommandTail => COMMAND_TAIL,
            Ring::EventHead => EVENT_HEAD,
            Ring::EventTail => EVENT_TAIL,
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The register block as raw bytes, with its masks.
pub struct RegisterFile {
    bytes: Box<[u8]>,
    read_only: Box<[u8]>,
    write_1_clear: Box<[u8]>,
}

impl RegisterFile {
    /// Creates the register block in its reset state.
    pub fn new(config: &AmdViConfig) -> RegisterFile {
        let size = MMIO_SIZE as usize;
        let mut file = RegisterFile {
            bytes: vec![0; size].into_boxed_slice(),
            read_only: vec![0; size].into_boxed_slice(),
            write_1_clear: vec![0; size].into_boxed_slice(),
        };

        file.define::<DeviceTableBase>(0);
        file.define_at(COMMAND_BASE, 0, RingBase::READ_ONLY_MASK, 0);
        file.define_at(EVENT_BASE, 0, RingBase::READ_ONLY_MASK, 0);
        file.define::<Control>(0);
        file.define::<ExclusionBase>(0);
        file.define::<ExclusionLimit>(0xfff);
        file.define::<ExtendedFeatures>(config.extended_features().0);
        file.define::<Status>(0);

        for ring in [
            Ring::CommandHead,
            Ring::CommandTail,
            Ring::EventHead,
            Ring::EventTail,
        ] {
            file.define_at(ring.offset(), 0, RingPointer::READ_ONLY_MASK, 0);
        }

        file
    }

    fn define<R: Register>(&mut self, value: u64) {
        self.define_at(
            R::OFFSET,
            value,
            R::READ_ONLY_MASK,
            R::WRITE_1_CLEAR_MASK,
        );
    }

    fn define_at(&mut self, offset: u64, value: u64, read_only: u64, write_1_clear: u64) {
        let range = offset as usize..offset as usize + 8;
        RegisterValue::write_le_slice(value, &mut self.bytes[range.clone()]);
        RegisterValue::write_le_slice(read_only, &mut self.read_only[range.clone()]);
        RegisterValue::write_le_slice(write_1_clear, &mut self.write_1_clear[range]);
    }

    /// Reads a guest access of `size` bytes. Accesses past the end of the block read as all ones.
    pub fn read(&self, offset: u64, size: usize) -> u64 {
        match self.range(offset, size) {
            Some(range) => {
                let mut buf = [0; 8];
                buf[..size].copy_from_slice(&self.bytes[range]);
                u64::from_le_bytes(buf)
            }
            None => u64::MAX >> (64 - 8 * size.clamp(1, 8)),
        }
    }

    /// Applies a guest write of `size` bytes, honouring the read-only and write-1-to-clear masks.
    /// Writes past the end of the block are ignored.
    pub fn write(&mut self, offset: u64, size: usize, value: u64) {
        if let Some(range) = self.range(offset, size) {
            for (i, index) in range.enumerate() {
                let old = self.bytes[index];
                let new = (value >> (8 * i)) as u8;
                let ro = self.read_only[index];
                let w1c = self.write_1_clear[index];

                self.bytes[index] = ((old & (ro | w1c)) | (new & !ro)) & !(new & w1c);
            }
        }
    }

    fn range(&self, offset: u64, size: usize) -> Option<std::ops::Range<usize>> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return None;
        }

        let end = offset.checked_add(size as u64)?;
        if end > self.bytes.len() as u64 {
            return None;
        }

        Some(offset as usize..end as usize)
    }

    /// Current value of a register.
    pub fn get<R: Register>(&self) -> R {
        R::from_le_slice(&self.bytes[R::OFFSET as usize..])
    }

    /// Updates a register on behalf of the hardware, bypassing the masks.
    pub fn set<R: Register>(&mut self, value: R) {
        value.write_le_slice(&mut self.bytes[R::OFFSET as usize..]);
    }

    pub fn get_u64(&self, offset: u64) -> u64 {
        <u64 as RegisterValue>::from_le_slice(&self.bytes[offset as usize..])
    }

    pub fn set_u64(&mut self, offset: u64, value: u64) {
        RegisterValue::write_le_slice(value, &mut self.bytes[offset as usize..]);
    }

    pub fn command_base(&self) -> RingBase {
        RingBase(self.get_u64(COMMAND_BASE))
    }

    pub fn event_base(&self) -> RingBase {
        RingBase(self.get_u64(EVENT_BASE))
    }

    /// Index held by a head or tail register.
    pub fn ring_index(&self, ring: Ring) -> u64 {
        u64::from(RingPointer(self.get_u64(ring.offset())).index())
    }

    pub fn set_ring_index(&mut self, ring: Ring, index: u64) {
        let value = RingPointer(self.get_u64(ring.offset())).with_index(index as u16);
        self.set_u64(ring.offset(), value.0);
    }

    /// Sets or clears status bits on behalf of the hardware.
    pub fn update_status(&mut self, update: impl FnOnce(Status) -> Status) {
        let status = self.get::<Status>();
        self.set(update(status));
    }
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterFile")
            .field("device_table", &self.get::<DeviceTableBase>())
            .field("command_base", &self.command_base())
            .field("event_base", &self.event_base())
            .field("control", &self.get::<Control>())
            .field("status", &self.get::<Status>())
            .finish()
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
