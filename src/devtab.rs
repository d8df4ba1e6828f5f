// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device table entries and the walker that fetches them.

/* ---------------------------------------------------------------------------------------------- */

use crate::config::AmdViConfig;
use crate::error::Fault;
use crate::mmio::DeviceTableBase;
use crate::regions::{GuestMemory, Permissions};
use crate::{bit_field, le_struct};

/* ---------------------------------------------------------------------------------------------- */

/// Size of a device table entry in bytes.
pub const DTE_SIZE: u64 = 32;

bit_field! {
    pub struct DteQuad0 : u64 {
        valid             @ 0      : RW,
        translation_valid @ 1      : RW,
        __                @ 2--6   : RsvdZ,
        host_access_dirty @ 7--8   : RW u8,
        /// Number of page table levels, or 0 to leave addresses untranslated.
        mode              @ 9--11  : RW u8,
        /// Page table root, in 4 KiB units.
        page_table_root   @ 12--51 : RW u64,
        /// PPR, guest PPR, and guest translation enables. Guest translation is not emulated, so
        /// these must be zero.
        __                @ 52--55 : RsvdZ,
        guest_levels      @ 56--57 : RW u8,
        gcr3_low          @ 58--60 : RW u8,
        read_permission   @ 61     : RW,
        write_permission  @ 62     : RW,
        __                @ 63     : RsvdZ,
    }

    pub struct DteQuad1 : u64 {
        domain_id         @ 0--15  : RW u16,
        gcr3_mid          @ 16--31 : RW u16,
        iotlb_enable      @ 32     : RW,
        suppress_events   @ 33     : RW,
        suppress_all      @ 34     : RW,
        io_control        @ 35--36 : RW u8,
        cache_hint        @ 37     : RW,
        snoop_disable     @ 38     : RW,
        /// Exclusion range applies to this device.
        exclusion         @ 39     : RW,
        system_management @ 40--41 : RW u8,
        __                @ 42     : RsvdP,
        gcr3_high         @ 43--63 : RW u32,
    }

    pub struct DteQuad2 : u64 {
        interrupt_valid          @ 0      : RW,
        /// Log2 of the number of interrupt remapping table entries.
        interrupt_table_length   @ 1--4   : RW u8,
        ignore_unmapped          @ 5      : RW,
        /// Interrupt remapping table root, in 64-byte units.
        interrupt_table_root     @ 6--51  : RW u64,
        __                       @ 52--55 : RsvdZ,
        init_pass                @ 56     : RW,
        external_interrupt_pass  @ 57     : RW,
        nmi_pass                 @ 58     : RW,
        __                       @ 59     : RsvdZ,
        interrupt_control        @ 60--61 : RW u8,
        lint0_pass               @ 62     : RW,
        lint1_pass               @ 63     : RW,
    }
}

le_struct! {
    pub struct DeviceTableEntry : 32 {
        quad0 @ 0x00 : DteQuad0,
        quad1 @ 0x08 : DteQuad1,
        quad2 @ 0x10 : DteQuad2,
        quad3 @ 0x18 : u64,
    }
}

impl DeviceTableEntry {
    pub fn is_valid(&self) -> bool {
        self.quad0().valid()
    }

    pub fn translation_valid(&self) -> bool {
        self.quad0().translation_valid()
    }

    pub fn mode(&self) -> u8 {
        self.quad0().mode()
    }

    pub fn domain_id(&self) -> u16 {
        self.quad1().domain_id()
    }

    pub fn page_table_root(&self) -> u64 {
        self.quad0().page_table_root() << 12
    }

    /// Access allowed by the entry itself, before any page table is consulted.
    pub fn permissions(&self) -> Option<Permissions> {
        let quad0 = self.quad0();
        Permissions::new(quad0.read_permission(), quad0.write_permission())
    }

    pub fn interrupt_table_address(&self) -> u64 {
        self.quad2().interrupt_table_root() << 6
    }

    pub fn interrupt_table_entries(&self) -> u64 {
        1 << self.quad2().interrupt_table_length()
    }

    /// Whether the unit would refuse this entry.
    pub fn is_legal(&self, config: &AmdViConfig) -> bool {
        let quad0 = self.quad0();

        if quad0.reserved_bits() != 0
            || self.quad1().reserved_bits() != 0
            || self.quad2().reserved_bits() != 0
        {
            return false;
        }

        if quad0.mode() == 7 || quad0.mode() > config.effective_paging_levels() {
            return false;
        }

        config.host_translation || quad0.page_table_root() == 0
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Where the guest put the device table. The default table has no entries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceTable {
    pub address: u64,
    pub entries: u64,
}

impl DeviceTable {
    pub fn new(base: DeviceTableBase) -> DeviceTable {
        DeviceTable {
            address: base.address(),
            entries: base.entries(),
        }
    }

    /// Whether the guest has programmed a device table yet.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Guest physical address of the entry for `device_id`.
    pub fn entry_address(&self, device_id: u16) -> u64 {
        self.address + u64::from(device_id) * DTE_SIZE
    }

    /// Reads and validates the entry for `device_id`.
    ///
    /// The entry is read fresh every time: the guest may rewrite it at any moment and only tells
    /// the unit about it through commands.
    pub fn fetch(
        &self,
        memory: &dyn GuestMemory,
        config: &AmdViConfig,
        device_id: u16,
    ) -> Result<DeviceTableEntry, Fault> {
        if u64::from(device_id) >= self.entries {
            return Err(Fault::IllegalDeviceTableEntry { device_id });
        }

        let address = self.entry_address(device_id);
        let dte = DeviceTableEntry::read_from(memory, address)
            .map_err(|_| Fault::DeviceTableRead { device_id, address })?;

        if !dte.is_legal(config) {
            return Err(Fault::IllegalDeviceTableEntry { device_id });
        }

        Ok(dte)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
