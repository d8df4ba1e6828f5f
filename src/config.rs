// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use crate::mmio::ExtendedFeatures;

/* ---------------------------------------------------------------------------------------------- */

/// Properties the machine model sets on the IOMMU before creating it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AmdViConfig {
    /// Interrupt remapping is supported. When `false`, a DTE that enables remapping makes every
    /// interrupt of that device fault.
    pub intremap: bool,

    /// The guest virtual APIC remapping table format may be selected through `CONTROL.GAEn`.
    pub ga_supported: bool,

    /// x2APIC destinations are advertised in the extended-feature register.
    pub xt_supported: bool,

    /// Host-side shadow mappings can be maintained, so notifiers may ask for MAP events.
    pub dma_remap: bool,

    /// Host address translation is supported. When `false`, DTEs with a page table root are
    /// illegal.
    pub host_translation: bool,

    /// Deepest paging mode the unit accepts: 4, 5, or 6.
    pub paging_levels: u8,

    /// Number of IOTLB entries kept before the whole cache is flushed.
    pub iotlb_capacity: usize,

    /// Requester id for interrupts that don't come from a PCI function, such as the I/O APIC's.
    pub ioapic_device_id: u16,
}

impl Default for AmdViConfig {
    fn default() -> Self {
        AmdViConfig {
            intremap: true,
            ga_supported: true,
            xt_supported: false,
            dma_remap: true,
            host_translation: true,
            paging_levels: 6,
            iotlb_capacity: 1024,
            ioapic_device_id: 0x00a0,
        }
    }
}

impl AmdViConfig {
    /// Paging levels actually used, clamped to what the hardware format can express.
    pub fn effective_paging_levels(&self) -> u8 {
        self.paging_levels.clamp(4, 6)
    }

    /// Value of the read-only extended-feature register.
    pub fn extended_features(&self) -> ExtendedFeatures {
        let hats = if self.host_translation {
            self.effective_paging_levels() - 4
        } else {
            3
        };

        ExtendedFeatures(0)
            .with_xt_supported(self.xt_supported)
            .with_invalidate_all_supported(true)
            .with_ga_supported(self.ga_supported)
            .with_host_address_translation_size(hats)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
