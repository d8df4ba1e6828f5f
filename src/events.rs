// SPDX-License-Identifier: MIT OR Apache-2.0

//! The event log: a ring in guest memory the unit appends fault reports to.

/* ---------------------------------------------------------------------------------------------- */

use bitflags::bitflags;
use log::{trace, warn};

use crate::device::PciHost;
use crate::mmio::{Control, RegisterFile, Ring};
use crate::regions::GuestMemory;
use crate::{bit_field, le_struct};

/* ---------------------------------------------------------------------------------------------- */

/// Size of an event log entry in bytes.
pub const EVENT_SIZE: u64 = 16;

bit_field! {
    pub struct EventHeader : u64 {
        device_id @ 0--15  : RW u16,
        __        @ 16--47 : RsvdP,
        flags     @ 48--59 : RW u16,
        code      @ 60--63 : RW u8,
    }
}

le_struct! {
    pub struct EventEntry : 16 {
        header  @ 0x00 : EventHeader,
        address @ 0x08 : u64,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum EventCode {
    IllegalDeviceTableEntry = 1,
    IoPageFault = 2,
    DeviceTableHardwareError = 3,
    PageTableHardwareError = 4,
    IllegalCommand = 5,
    CommandHardwareError = 6,
}

bitflags! {
    /// Details of an I/O page fault, as stored in the flags field of its event.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct IoPageFaultFlags: u16 {
        /// The access was an interrupt request.
        const INTERRUPT = 1 << 3;
        /// The page was present.
        const PRESENT = 1 << 4;
        /// The access was a write.
        const WRITE = 1 << 5;
        /// The page was present but its permissions denied the access.
        const PERMISSION = 1 << 6;
        /// A page table entry set a reserved bit or had an illegal Next Level.
        const RESERVED = 1 << 7;
    }
}

/// Something the guest must be told about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    IllegalDeviceTableEntry {
        device_id: u16,
        address: u64,
    },
    IoPageFault {
        device_id: u16,
        address: u64,
        flags: IoPageFaultFlags,
    },
    DeviceTableHardwareError {
        device_id: u16,
        address: u64,
    },
    PageTableHardwareError {
        device_id: u16,
        address: u64,
    },
    IllegalCommand {
        address: u64,
    },
    CommandHardwareError {
        address: u64,
    },
}

impl Event {
    pub fn code(&self) -> EventCode {
        match self {
            Event::IllegalDeviceTableEntry { .. } => EventCode::IllegalDeviceTableEntry,
            Event::IoPageFault { .. } => EventCode::IoPageFault,
            Event::DeviceTableHardwareError { .. } => EventCode::DeviceTableHardwareError,
            Event::PageTableHardwareError { .. } => EventCode::PageTableHardwareError,
            Event::IllegalCommand { .. } => EventCode::IllegalCommand,
            Event::CommandHardwareError { .. } => EventCode::CommandHardwareError,
        }
    }

    /// The entry written to the log.
    pub fn encode(&self) -> EventEntry {
        let (device_id, address, flags) = match *self {
            Event::IoPageFault {
                device_id,
                address,
                flags,
            } => (device_id, address, flags.bits()),
            Event::IllegalDeviceTableEntry { device_id, address }
            | Event::DeviceTableHardwareError { device_id, address }
            | Event::PageTableHardwareError { device_id, address } => (device_id, address, 0),
            Event::IllegalCommand { address } | Event::CommandHardwareError { address } => {
                (0, address, 0)
            }
        };

        EventEntry::default()
            .with_header(
                EventHeader(0)
                    .with_device_id(device_id)
                    .with_flags(flags)
                    .with_code(self.code() as u8),
            )
            .with_address(address)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Appends `event` to the event log, if the guest enabled it.
///
/// When the log is full the event is dropped and EventOverflow is set. Either way the unit's MSI
/// is raised if EventIntEn is set.
pub fn log_event(
    regs: &mut RegisterFile,
    memory: &dyn GuestMemory,
    host: &dyn PciHost,
    event: Event,
) {
    let control = regs.get::<Control>();
    if !control.event_log_enable() {
        trace!("Event log disabled, dropping {:?}", event);
        return;
    }

    let base = regs.event_base();
    let entries = base.entries();
    let head = regs.ring_index(Ring::EventHead) % entries;
    let tail = regs.ring_index(Ring::EventTail) % entries;
    let next = (tail + 1) % entries;

    if next == head {
        warn!("Event log full, dropping {:?}", event);
        regs.update_status(|status| status.with_event_overflow(true));
    } else {
        let address = base.address() + tail * EVENT_SIZE;
        if let Err(e) = event.encode().write_to(memory, address) {
            warn!("Could not write event to {:#x}: {}", address, e);
        }

        trace!("Logged {:?} at {:#x}", event, address);

        regs.set_ring_index(Ring::EventTail, next);
        regs.update_status(|status| status.with_event_log_int(true));
    }

    if control.event_int_enable() {
        host.notify_msi();
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
