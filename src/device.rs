// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Display};

use crate::interrupts::MsiMessage;

/* ---------------------------------------------------------------------------------------------- */

/// Identifies a PCI __function__ behind the IOMMU by bus number and device/function number.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PciBdf {
    pub bus: u8,
    pub devfn: u8,
}

impl PciBdf {
    pub const fn new(bus: u8, device: u8, function: u8) -> PciBdf {
        PciBdf {
            bus,
            devfn: (device << 3) | (function & 0x7),
        }
    }

    pub const fn from_device_id(device_id: u16) -> PciBdf {
        PciBdf {
            bus: (device_id >> 8) as u8,
            devfn: device_id as u8,
        }
    }

    /// The 16-bit requester id used to index the device table.
    pub const fn device_id(&self) -> u16 {
        ((self.bus as u16) << 8) | self.devfn as u16
    }

    pub const fn device(&self) -> u8 {
        self.devfn >> 3
    }

    pub const fn function(&self) -> u8 {
        self.devfn & 0x7
    }
}

impl Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device(), self.function())
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The platform around the IOMMU: the PCI function it is exposed as, and the interrupt controller
/// that receives remapped interrupts.
pub trait PciHost: Send + Sync {
    /// Raises the IOMMU's own MSI, used for event log and completion-wait interrupts.
    fn notify_msi(&self);

    /// Records that the IOMMU signalled a target abort on the bus.
    fn signal_target_abort(&self);

    /// Delivers an interrupt message after remapping.
    fn deliver_msi(&self, message: MsiMessage);
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
