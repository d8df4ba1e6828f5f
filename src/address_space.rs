// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use log::debug;

use crate::device::PciBdf;
use crate::devtab::DeviceTableEntry;
use crate::error::Fault;
use crate::pagetable::max_address;
use crate::regions::GuestMemory;
use crate::shadow::ShadowMappings;

/* ---------------------------------------------------------------------------------------------- */

/// How DMA from a device currently reaches guest memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// Addresses are used as-is.
    PassThrough,
    /// Addresses go through the page tables of this DTE. `None` when the DTE could not be used, in
    /// which case nothing is mapped.
    Translated(Option<DeviceTableEntry>),
}

impl Route {
    fn is_pass_through(&self) -> bool {
        matches!(self, Route::PassThrough)
    }

    /// Picks the route for a device given whether the unit is enabled and what fetching its DTE
    /// gave.
    pub fn select(iommu_enabled: bool, dte: Result<DeviceTableEntry, Fault>) -> Route {
        if !iommu_enabled {
            return Route::PassThrough;
        }

        match dte {
            Ok(dte) if !dte.is_valid() => Route::PassThrough,
            Ok(dte) if dte.translation_valid() && dte.mode() == 0 => Route::PassThrough,
            Ok(dte) if dte.translation_valid() => Route::Translated(Some(dte)),
            _ => Route::Translated(None),
        }
    }
}

/// Per-device state: which route its DMA takes and the shadow of its mappings.
///
/// Created the first time the device is looked up and kept until the unit is dropped.
#[derive(Debug)]
pub struct AddressSpace {
    bdf: PciBdf,
    route: Route,
    shadow: ShadowMappings,
}

impl AddressSpace {
    pub fn new(bdf: PciBdf) -> AddressSpace {
        AddressSpace {
            bdf,
            route: Route::PassThrough,
            shadow: ShadowMappings::default(),
        }
    }

    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn shadow(&self) -> &ShadowMappings {
        &self.shadow
    }

    pub fn shadow_mut(&mut self) -> &mut ShadowMappings {
        &mut self.shadow
    }

    /// Switches to the route implied by `iommu_enabled` and `dte`, then resynchronizes the shadow.
    ///
    /// Leaving a route drops every mapping made under it. A translated route is resynchronized over
    /// the whole address space, including gaps, so stale mappings disappear.
    pub fn refresh_route(
        &mut self,
        memory: &dyn GuestMemory,
        iommu_enabled: bool,
        dte: Result<DeviceTableEntry, Fault>,
    ) {
        let route = Route::select(iommu_enabled, dte);

        if route.is_pass_through() != self.route.is_pass_through() {
            debug!(
                "Device {} switches to {}",
                self.bdf,
                if route.is_pass_through() {
                    "pass-through"
                } else {
                    "translation"
                }
            );
            self.shadow.unmap_all();
        }

        self.route = route;

        match route {
            Route::PassThrough => {}
            Route::Translated(None) => self.shadow.unmap_all(),
            Route::Translated(Some(dte)) => {
                self.shadow
                    .sync_range(memory, &dte, 0..=max_address(dte.mode()), true);
            }
        }
    }

    /// Drops every shadow mapping and goes back to pass-through.
    pub fn reset(&mut self) {
        self.shadow.unmap_all();
        self.route = Route::PassThrough;
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
