// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interrupt remapping.
//!
//! A device's MSI write is redirected through the interrupt remapping table its DTE points at.
//! Fixed and arbitrated interrupts are looked up in the table, indexed by the low bits of the
//! message data. NMI, INIT, and ExtInt bypass the table and are forwarded only if the DTE lets
//! them through.

/* ---------------------------------------------------------------------------------------------- */

use log::trace;

use crate::config::AmdViConfig;
use crate::devtab::DeviceTableEntry;
use crate::error::Fault;
use crate::regions::GuestMemory;
use crate::{bit_field, le_struct};

/* ---------------------------------------------------------------------------------------------- */

/// First address of the window MSI writes target.
pub const INTERRUPT_WINDOW_START: u64 = 0xfee0_0000;

/// Last address of the window MSI writes target.
pub const INTERRUPT_WINDOW_END: u64 = 0xfeef_ffff;

/// An MSI write: the address and the 32-bit value written to it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

bit_field! {
    pub struct MsiAddress : u64 {
        __                @ 0--1   : RsvdP,
        /// Logical rather than physical destination.
        dest_mode         @ 2      : RW,
        redirection_hint  @ 3      : RW,
        __                @ 4--11  : RsvdP,
        destination       @ 12--19 : RW u8,
        window            @ 20--31 : RW u16,
        destination_high  @ 32--63 : RW u32,
    }

    pub struct MsiData : u32 {
        vector        @ 0--7   : RW u8,
        delivery_mode @ 8--10  : RW u8,
        __            @ 11--13 : RsvdP,
        level         @ 14     : RW,
        trigger_mode  @ 15     : RW,
        __            @ 16--31 : RsvdP,
    }

    /// Legacy interrupt remapping table entry.
    pub struct LegacyIrte : u32 {
        remap_enable            @ 0      : RW,
        suppress_io_page_faults @ 1      : RW,
        interrupt_type          @ 2--4   : RW u8,
        request_eoi             @ 5      : RW,
        dest_mode               @ 6      : RW,
        guest_mode              @ 7      : RW,
        destination             @ 8--15  : RW u8,
        vector                  @ 16--23 : RW u8,
        __                      @ 24--31 : RsvdP,
    }

    pub struct GaIrteLow : u64 {
        remap_enable            @ 0      : RW,
        suppress_io_page_faults @ 1      : RW,
        interrupt_type          @ 2--4   : RW u8,
        request_eoi             @ 5      : RW,
        dest_mode               @ 6      : RW,
        guest_mode              @ 7      : RW,
        destination             @ 8--31  : RW u32,
        __                      @ 32--63 : RsvdP,
    }

    pub struct GaIrteHigh : u64 {
        vector           @ 0--7   : RW u8,
        __               @ 8--55  : RsvdP,
        destination_high @ 56--63 : RW u8,
    }
}

le_struct! {
    /// Interrupt remapping table entry in the guest virtual APIC format.
    pub struct GaIrte : 16 {
        low  @ 0x00 : GaIrteLow,
        high @ 0x08 : GaIrteHigh,
    }
}

/// Delivery modes of [`MsiData::delivery_mode`].
pub mod delivery_mode {
    pub const FIXED: u8 = 0;
    pub const ARBITRATED: u8 = 1;
    pub const SMI: u8 = 2;
    pub const NMI: u8 = 4;
    pub const INIT: u8 = 5;
    pub const EXT_INT: u8 = 7;
}

/// Values of the DTE's IntCtl field.
mod interrupt_control {
    pub const ABORT: u8 = 0;
    pub const FORWARD: u8 = 1;
    pub const REMAP: u8 = 2;
}

/* ---------------------------------------------------------------------------------------------- */

/// Where a remapped interrupt goes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemappedInterrupt {
    pub destination: u32,
    pub vector: u8,
    pub delivery_mode: u8,
    pub dest_mode: bool,
    pub redir_hint: bool,
    pub trigger_mode: bool,
}

impl RemappedInterrupt {
    pub fn to_msi(&self) -> MsiMessage {
        let address = MsiAddress(0)
            .with_window((INTERRUPT_WINDOW_START >> 20) as u16)
            .with_destination(self.destination as u8)
            .with_destination_high(self.destination & 0xffff_ff00)
            .with_redirection_hint(self.redir_hint)
            .with_dest_mode(self.dest_mode);

        let data = MsiData(0)
            .with_vector(self.vector)
            .with_delivery_mode(self.delivery_mode)
            .with_trigger_mode(self.trigger_mode);

        MsiMessage {
            address: address.0,
            data: data.0,
        }
    }
}

/// Remaps `message` from `device_id` through the interrupt settings of its DTE.
///
/// `ga_enabled` selects the 16-byte table entry format.
pub fn remap(
    memory: &dyn GuestMemory,
    config: &AmdViConfig,
    ga_enabled: bool,
    dte: &DeviceTableEntry,
    device_id: u16,
    message: MsiMessage,
) -> Result<MsiMessage, Fault> {
    let settings = dte.quad2();
    if !dte.is_valid() || !settings.interrupt_valid() {
        return Ok(message);
    }

    if !config.intremap {
        return Err(Fault::InterruptRemappingUnsupported);
    }

    let address = message.address;
    if !(INTERRUPT_WINDOW_START..=INTERRUPT_WINDOW_END).contains(&address) {
        return Err(Fault::InterruptAddressInvalid { address });
    }

    let data = MsiData(message.data);

    let pass = match data.delivery_mode() {
        delivery_mode::FIXED | delivery_mode::ARBITRATED => {
            return match settings.interrupt_control() {
                interrupt_control::ABORT => Err(Fault::InterruptAborted { device_id }),
                interrupt_control::FORWARD => Ok(message),
                interrupt_control::REMAP => {
                    let remapped = lookup(memory, ga_enabled, dte, device_id, data)?;
                    trace!("Interrupt from {:#06x} remapped to {:?}", device_id, remapped);
                    Ok(remapped.to_msi())
                }
                _ => Err(Fault::IllegalInterruptEntry { device_id }),
            };
        }
        delivery_mode::NMI => settings.nmi_pass(),
        delivery_mode::INIT => settings.init_pass(),
        delivery_mode::EXT_INT => settings.external_interrupt_pass(),
        mode => return Err(Fault::UnsupportedDeliveryMode { delivery_mode: mode }),
    };

    // only fixed and arbitrated interrupts may use logical destinations
    if pass && !MsiAddress(address).dest_mode() {
        Ok(message)
    } else {
        Err(Fault::IllegalInterruptEntry { device_id })
    }
}

fn lookup(
    memory: &dyn GuestMemory,
    ga_enabled: bool,
    dte: &DeviceTableEntry,
    device_id: u16,
    data: MsiData,
) -> Result<RemappedInterrupt, Fault> {
    let index = u64::from(data.0 & 0x7ff);
    if index >= dte.interrupt_table_entries() {
        return Err(Fault::IllegalInterruptEntry { device_id });
    }

    let table = dte.interrupt_table_address();

    let (remap_enable, guest_mode, interrupt) = if ga_enabled {
        let address = table + index * GaIrte::SIZE as u64;
        let entry = GaIrte::read_from(memory, address)
            .map_err(|_| Fault::InterruptTableRead { address })?;
        let (low, high) = (entry.low(), entry.high());

        let interrupt = RemappedInterrupt {
            destination: low.destination() | (u32::from(high.destination_high()) << 24),
            vector: high.vector(),
            delivery_mode: low.interrupt_type(),
            dest_mode: low.dest_mode(),
            redir_hint: low.request_eoi(),
            trigger_mode: data.trigger_mode(),
        };
        (low.remap_enable(), low.guest_mode(), interrupt)
    } else {
        let address = table + index * 4;
        let entry = LegacyIrte(
            memory
                .read_le_u32(address)
                .map_err(|_| Fault::InterruptTableRead { address })?,
        );

        let interrupt = RemappedInterrupt {
            destination: u32::from(entry.destination()),
            vector: entry.vector(),
            delivery_mode: entry.interrupt_type(),
            dest_mode: entry.dest_mode(),
            redir_hint: entry.request_eoi(),
            trigger_mode: data.trigger_mode(),
        };
        (entry.remap_enable(), entry.guest_mode(), interrupt)
    };

    if !remap_enable {
        return Err(Fault::InterruptAborted { device_id });
    }

    if guest_mode {
        return Err(Fault::GuestModeInterrupt);
    }

    if interrupt.delivery_mode > delivery_mode::ARBITRATED {
        return Err(Fault::IllegalInterruptEntry { device_id });
    }

    Ok(interrupt)
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
