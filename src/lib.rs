// SPDX-License-Identifier: MIT OR Apache-2.0

//! An emulated AMD-Vi IOMMU, for machine models that place one in front of their PCI devices.
//!
//! The emulation revolves around [`AmdVi`](unit::AmdVi). A machine model creates one with an
//! [`AmdViConfig`](config::AmdViConfig), the guest's memory, and a [`PciHost`](device::PciHost)
//! standing for the platform around the unit, then forwards to it:
//!
//! 1. Guest accesses to its 16 KiB register block;
//! 2. DMA from the devices behind it, which is translated through the guest's I/O page tables;
//! 3. MSIs from the devices behind it, which are remapped through the guest's interrupt remapping
//!    tables.
//!
//! The guest drives the unit the way it drives the real thing: it points the unit at a device
//! table, a command ring, and an event log in its own memory, enables translation, and submits
//! invalidation commands whenever it changes a device table entry or a page table. Faults are
//! reported back through the event log.
//!
//! Components that need to know about a device's mappings, such as a passthrough device that has
//! to mirror them into a host IOMMU, register an [`IommuNotifier`](iommu::IommuNotifier). The unit
//! keeps a shadow of what each notifier has been told and reports the difference every time the
//! guest invalidates something.
//!
//! Example usage:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use amdvi::config::AmdViConfig;
//! use amdvi::device::{PciBdf, PciHost};
//! use amdvi::mmio::{Control, CONTROL, DEVICE_TABLE};
//! use amdvi::regions::{GuestRam, Permissions};
//! use amdvi::unit::AmdVi;
//!
//! let host: Arc<dyn PciHost> = unimplemented!();
//! let ram = Arc::new(GuestRam::new(0, 256 << 20));
//!
//! let mut iommu = AmdVi::new(AmdViConfig::default(), ram, host);
//!
//! // What the guest's driver does
//!
//! iommu.mmio_write(DEVICE_TABLE, 8, 0x10_0000 | 0x1ff);
//! iommu.mmio_write(CONTROL, 8, Control(0).with_iommu_enable(true).0);
//!
//! // What a device behind the unit does
//!
//! let device = PciBdf::new(0, 3, 0);
//! let mut buffer = [0; 64];
//! iommu.dma_read(device, 0x8000, &mut buffer)?;
//!
//! let translation = iommu.translate(device, 0x8000, Permissions::Write)?;
//! let guest_physical = translation.translate(0x8000);
//! # Ok::<(), amdvi::error::Fault>(())
//! ```
//!
//! ## Guest structures
//!
//! Registers and guest structures are described with two macros, [`bit_field!`] and
//! [`le_struct!`], which generate typed accessors so the rest of the crate never shifts or masks by
//! hand. For instance, the first quadword of a device table entry is declared as:
//!
//! ```ignore
//! bit_field! {
//!     pub struct DteQuad0 : u64 {
//!         valid             @ 0      : RW,
//!         translation_valid @ 1      : RW,
//!         __                @ 2--6   : RsvdZ,
//!         host_access_dirty @ 7--8   : RW u8,
//!         mode              @ 9--11  : RW u8,
//!         page_table_root   @ 12--51 : RW u64,
//!         ...
//!     }
//! }
//! ```
//!
//! `RsvdZ` bits must be zero in a well-formed entry; the unit refuses entries that set any. A whole
//! entry is then a fixed-size little-endian structure made of such quadwords:
//!
//! ```ignore
//! le_struct! {
//!     pub struct DeviceTableEntry : 32 {
//!         quad0 @ 0x00 : DteQuad0,
//!         quad1 @ 0x08 : DteQuad1,
//!         quad2 @ 0x10 : DteQuad2,
//!         quad3 @ 0x18 : u64,
//!     }
//! }
//! ```
//!
//! which can be read from and written to [`GuestMemory`](regions::GuestMemory) in one go.
//!
//! ## Testing
//!
//! Enabling the `test-mocks` feature exposes [`mockall`](https://docs.rs/mockall) mocks of the
//! collaborator traits in the [`mocks`] module.

/* ---------------------------------------------------------------------------------------------- */

pub mod address_space;
pub mod commands;
pub mod config;
pub mod device;
pub mod devtab;
pub mod error;
pub mod events;
pub mod interrupts;
pub mod iommu;
pub mod iotlb;
pub mod mmio;
pub mod pagetable;
pub mod regions;
pub mod shadow;
pub mod unit;

#[cfg(any(test, feature = "test-mocks"))]
pub mod mocks;

#[cfg(test)]
mod testing;

pub use config::AmdViConfig;
pub use device::{PciBdf, PciHost};
pub use error::{Fault, FaultClass};
pub use iommu::{IommuNotifier, NotifierFlags, NotifierId};
pub use unit::AmdVi;

#[doc(hidden)]
pub mod __private {
    pub use paste;
}

/* ---------------------------------------------------------------------------------------------- */
