// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use thiserror::Error;

/* ---------------------------------------------------------------------------------------------- */

/// Broad category of a [`Fault`], which decides how it is reported to the guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FaultClass {
    /// Guest memory backing some structure could not be read or written.
    HardwareAccess,
    /// A guest structure or request is ill-formed: reserved bits, out-of-range addresses,
    /// unsupported encodings.
    MalformedInput,
    /// The request is well-formed but the guest's configuration forbids it.
    PolicyViolation,
}

/// Reason a translation, interrupt remapping, or other request could not be honoured.
///
/// Faults never terminate the unit. Each one affects only the access or command that raised it.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Fault {
    #[error("could not read device table entry {device_id:#06x} at {address:#x}")]
    DeviceTableRead { device_id: u16, address: u64 },

    #[error("illegal device table entry {device_id:#06x}")]
    IllegalDeviceTableEntry { device_id: u16 },

    #[error("device table entry {device_id:#06x} is not valid")]
    DeviceNotValid { device_id: u16 },

    #[error("device table entry {device_id:#06x} has no valid translation information")]
    TranslationNotValid { device_id: u16 },

    #[error("could not read page table root at {address:#x}")]
    RootPointerRead { address: u64 },

    #[error("could not read page table entry at {address:#x}")]
    PageTableRead { address: u64 },

    #[error("page table entry at {address:#x} points to a table at or above its own level")]
    IllegalNextLevel { address: u64 },

    #[error("address {iova:#x} exceeds the range of paging mode {mode}")]
    AddressOutOfRange { iova: u64, mode: u8 },

    #[error("no mapping for address {iova:#x}")]
    NotMapped { iova: u64 },

    #[error("access to address {iova:#x} denied by page permissions")]
    PermissionDenied { iova: u64 },

    #[error("could not access guest memory at {address:#x}")]
    DmaAccess { address: u64 },

    #[error("interrupt remapping is not supported")]
    InterruptRemappingUnsupported,

    #[error("interrupt address {address:#x} is outside the interrupt window")]
    InterruptAddressInvalid { address: u64 },

    #[error("could not read interrupt remapping entry at {address:#x}")]
    InterruptTableRead { address: u64 },

    #[error("interrupt from device {device_id:#06x} is target-aborted")]
    InterruptAborted { device_id: u16 },

    #[error("interrupt remapping entry selects guest virtual APIC mode")]
    GuestModeInterrupt,

    #[error("illegal interrupt remapping configuration for device {device_id:#06x}")]
    IllegalInterruptEntry { device_id: u16 },

    #[error("unsupported interrupt delivery mode {delivery_mode}")]
    UnsupportedDeliveryMode { delivery_mode: u8 },

    #[error("MAP notifications require DMA remapping support")]
    MapNotifierUnsupported,

    #[error("no notifier with id {id} is registered")]
    UnknownNotifier { id: u64 },
}

impl Fault {
    pub fn class(&self) -> FaultClass {
        match self {
            Fault::DeviceTableRead { .. }
            | Fault::RootPointerRead { .. }
            | Fault::PageTableRead { .. }
            | Fault::DmaAccess { .. }
            | Fault::InterruptTableRead { .. } => FaultClass::HardwareAccess,

            Fault::IllegalDeviceTableEntry { .. }
            | Fault::AddressOutOfRange { .. }
            | Fault::IllegalNextLevel { .. }
            | Fault::InterruptAddressInvalid { .. }
            | Fault::IllegalInterruptEntry { .. }
            | Fault::UnsupportedDeliveryMode { .. } => FaultClass::MalformedInput,

            Fault::DeviceNotValid { .. }
            | Fault::TranslationNotValid { .. }
            | Fault::NotMapped { .. }
            | Fault::PermissionDenied { .. }
            | Fault::InterruptRemappingUnsupported
            | Fault::InterruptAborted { .. }
            | Fault::GuestModeInterrupt
            | Fault::MapNotifierUnsupported
            | Fault::UnknownNotifier { .. } => FaultClass::PolicyViolation,
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classes() {
        assert_eq!(
            Fault::RootPointerRead { address: 0x1000 }.class(),
            FaultClass::HardwareAccess
        );
        assert_eq!(
            Fault::IllegalNextLevel { address: 0x30_0008 }.class(),
            FaultClass::MalformedInput
        );
        assert_eq!(
            Fault::AddressOutOfRange { iova: 1 << 39, mode: 3 }.class(),
            FaultClass::MalformedInput
        );
        assert_eq!(
            Fault::PermissionDenied { iova: 0 }.class(),
            FaultClass::PolicyViolation
        );
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::DeviceTableRead {
            device_id: 0x0010,
            address: 0x20_0200,
        };
        assert_eq!(
            fault.to_string(),
            "could not read device table entry 0x0010 at 0x200200"
        );
    }
}

/* ---------------------------------------------------------------------------------------------- */
