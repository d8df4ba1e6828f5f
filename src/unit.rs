// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::ops::RangeInclusive;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::address_space::{AddressSpace, Route};
use crate::commands::{Command, InvalidationRange, RawCommand, COMMAND_SIZE};
use crate::config::AmdViConfig;
use crate::device::{PciBdf, PciHost};
use crate::devtab::{DeviceTable, DeviceTableEntry};
use crate::error::Fault;
use crate::events::{log_event, Event, IoPageFaultFlags};
use crate::interrupts::{self, MsiMessage, INTERRUPT_WINDOW_END, INTERRUPT_WINDOW_START};
use crate::iommu::{IommuNotifier, NotifierFlags, NotifierId, NotifierRegistration};
use crate::iotlb::Iotlb;
use crate::mmio::{
    Control, DeviceTableBase, ExclusionBase, ExclusionLimit, RegisterFile, Ring, RingBase, Status,
    COMMAND_BASE, COMMAND_TAIL, CONTROL, DEVICE_TABLE, MMIO_SIZE,
};
use crate::pagetable::{max_address, walk, Translation, WalkError, PAGE_SIZE_4K};
use crate::regions::{GuestMemory, Permissions};

/* ---------------------------------------------------------------------------------------------- */

/// An emulated AMD-Vi IOMMU.
///
/// The unit sits between the PCI functions of a machine and guest memory. The machine model
/// forwards to it:
///
/// - Guest accesses to its register block, through [`AmdVi::mmio_read`] and [`AmdVi::mmio_write`].
///   Writes to the command tail or control registers process the command ring before returning.
/// - DMA from the devices behind it, through [`AmdVi::translate`], [`AmdVi::dma_read`], and
///   [`AmdVi::dma_write`].
/// - MSIs from the devices behind it, through [`AmdVi::remap_msi`] or [`AmdVi::deliver_msi`].
///
/// Consumers that need real host mappings of a device's address space, such as a passthrough
/// device, subscribe with [`AmdVi::register_notifier`].
///
/// All state is owned by the value. Methods that change it take `&mut self`, so the unit is driven
/// from a single thread at a time.
pub struct AmdVi {
    config: AmdViConfig,
    memory: Arc<dyn GuestMemory>,
    host: Arc<dyn PciHost>,
    regs: RegisterFile,
    iotlb: Iotlb,
    address_spaces: BTreeMap<PciBdf, AddressSpace>,
    device_table: DeviceTable,
    command_ring: RingBase,
    next_notifier_id: u64,
}

impl AmdVi {
    pub fn new(config: AmdViConfig, memory: Arc<dyn GuestMemory>, host: Arc<dyn PciHost>) -> AmdVi {
        AmdVi {
            regs: RegisterFile::new(&config),
            iotlb: Iotlb::new(config.iotlb_capacity),
            config,
            memory,
            host,
            address_spaces: BTreeMap::new(),
            device_table: DeviceTable::default(),
            command_ring: RingBase::default(),
            next_notifier_id: 1,
        }
    }

    pub fn config(&self) -> &AmdViConfig {
        &self.config
    }

    pub fn iotlb(&self) -> &Iotlb {
        &self.iotlb
    }

    /// The address space of `bdf`, if the device was ever seen.
    pub fn address_space(&self, bdf: PciBdf) -> Option<&AddressSpace> {
        self.address_spaces.get(&bdf)
    }

    fn iommu_enabled(&self) -> bool {
        self.regs.get::<Control>().iommu_enable()
    }

    /// Returns the address space of `bdf`, creating it with the route its DTE currently implies.
    fn address_space_mut(&mut self, bdf: PciBdf) -> &mut AddressSpace {
        let enabled = self.iommu_enabled();
        let memory = self.memory.as_ref();
        let config = &self.config;
        let table = self.device_table;

        self.address_spaces.entry(bdf).or_insert_with(|| {
            debug!("Creating address space for {}", bdf);
            let mut space = AddressSpace::new(bdf);
            space.refresh_route(memory, enabled, table.fetch(memory, config, bdf.device_id()));
            space
        })
    }

    fn log(&mut self, event: Event) {
        log_event(
            &mut self.regs,
            self.memory.as_ref(),
            self.host.as_ref(),
            event,
        );
    }

    /// Fetches a DTE, reporting a failure to the guest.
    fn fetch_dte(&mut self, device_id: u16) -> Result<DeviceTableEntry, Fault> {
        let result = self
            .device_table
            .fetch(self.memory.as_ref(), &self.config, device_id);

        match result {
            Err(Fault::DeviceTableRead { address, .. }) => {
                warn!("Could not read DTE {:#06x} at {:#x}", device_id, address);
                self.log(Event::DeviceTableHardwareError { device_id, address });
                self.host.signal_target_abort();
            }
            Err(Fault::IllegalDeviceTableEntry { .. }) => {
                warn!("Illegal DTE {:#06x}", device_id);
                let address = self.device_table.entry_address(device_id);
                self.log(Event::IllegalDeviceTableEntry { device_id, address });
            }
            _ => {}
        }

        result
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Handles a guest read of `size` bytes from the register block.
    pub fn mmio_read(&self, offset: u64, size: usize) -> u64 {
        let value = self.regs.read(offset, size);
        trace!("MMIO read {:#06x}/{} -> {:#x}", offset, size, value);
        value
    }

    /// Handles a guest write of `size` bytes to the register block, with its side effects.
    pub fn mmio_write(&mut self, offset: u64, size: usize, value: u64) {
        trace!("MMIO write {:#06x}/{} <- {:#x}", offset, size, value);

        let in_range = matches!(size, 1 | 2 | 4 | 8)
            && offset
                .checked_add(size as u64)
                .map_or(false, |end| end <= MMIO_SIZE);
        if !in_range {
            warn!("Ignoring MMIO write {:#x}/{}", offset, size);
            return;
        }

        let old_control = self.regs.get::<Control>();
        self.regs.write(offset, size, value);

        // base registers take effect once their high half is written
        let latch = size == 8 || offset & 7 != 0;

        match offset & !7 {
            DEVICE_TABLE if latch => {
                self.device_table = DeviceTable::new(self.regs.get::<DeviceTableBase>());
                debug!(
                    "Device table at {:#x} with {} entries",
                    self.device_table.address, self.device_table.entries
                );
            }
            COMMAND_BASE if latch => {
                self.command_ring = self.regs.command_base();
                self.regs.set_ring_index(Ring::CommandHead, 0);
                self.regs.set_ring_index(Ring::CommandTail, 0);
                debug!(
                    "Command ring at {:#x} with {} entries",
                    self.command_ring.address(),
                    self.command_ring.entries()
                );
            }
            CONTROL => self.control_written(old_control),
            COMMAND_TAIL => self.process_commands(),
            _ => {}
        }
    }

    fn control_written(&mut self, old: Control) {
        let control = self.regs.get::<Control>();
        let enabled = control.iommu_enable();

        self.regs.update_status(|status| {
            status
                .with_cmd_buffer_run(enabled && control.command_buffer_enable())
                .with_event_log_run(enabled && control.event_log_enable())
        });

        if old.iommu_enable() != enabled {
            debug!("Translation {}", if enabled { "enabled" } else { "disabled" });
            self.refresh_all_routes();
        }

        self.process_commands();
    }

    fn refresh_all_routes(&mut self) {
        let enabled = self.iommu_enabled();
        let memory = self.memory.as_ref();

        for (bdf, space) in &mut self.address_spaces {
            let dte = self.device_table.fetch(memory, &self.config, bdf.device_id());
            space.refresh_route(memory, enabled, dte);
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Executes commands from the head of the ring until it reaches the tail.
    fn process_commands(&mut self) {
        let control = self.regs.get::<Control>();
        if !control.iommu_enable() || !control.command_buffer_enable() {
            return;
        }

        let ring = self.command_ring;
        let entries = ring.entries();

        // a guest moving the tail concurrently can't keep us here forever
        for _ in 0..entries {
            let head = self.regs.ring_index(Ring::CommandHead) % entries;
            let tail = self.regs.ring_index(Ring::CommandTail) % entries;
            if head == tail {
                break;
            }

            let address = ring.address() + head * COMMAND_SIZE;

            match RawCommand::read_from(self.memory.as_ref(), address) {
                Ok(raw) => match raw.decode() {
                    Ok(command) => {
                        trace!("Command at {:#x}: {:?}", address, command);
                        self.execute(command);
                    }
                    Err(e) => {
                        warn!("Illegal command at {:#x}: {:?} ({:?})", address, raw, e);
                        self.log(Event::IllegalCommand { address });
                    }
                },
                Err(e) => {
                    warn!("Could not read command at {:#x}: {}", address, e);
                    self.log(Event::CommandHardwareError { address });
                    self.host.signal_target_abort();
                }
            }

            self.regs
                .set_ring_index(Ring::CommandHead, (head + 1) % entries);
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::CompletionWait {
                store,
                data,
                interrupt,
            } => {
                if let Some(address) = store {
                    if let Err(e) = self.memory.write_le_u64(address, data) {
                        warn!("Could not store completion value at {:#x}: {}", address, e);
                    }
                }

                if interrupt {
                    self.regs
                        .update_status(|status| status.with_com_wait_int(true));
                    if self.regs.get::<Control>().com_wait_int_enable() {
                        self.host.notify_msi();
                    }
                }
            }

            Command::InvalidateDevtabEntry { device_id } => {
                self.iotlb.invalidate_device(device_id);

                let bdf = PciBdf::from_device_id(device_id);
                if self.address_spaces.contains_key(&bdf) {
                    let enabled = self.iommu_enabled();
                    let dte = if enabled {
                        self.fetch_dte(device_id)
                    } else {
                        Err(Fault::DeviceNotValid { device_id })
                    };

                    if let Some(space) = self.address_spaces.get_mut(&bdf) {
                        space.refresh_route(self.memory.as_ref(), enabled, dte);
                    }
                }
            }

            Command::InvalidateIommuPages { domain_id, range } => {
                let (start, last) = range.bounds();
                self.iotlb.invalidate_domain_range(domain_id, start, last);
                self.sync_domain(domain_id, range);
            }

            Command::InvalidateIotlbPages { device_id, range } => match range {
                InvalidationRange::All => self.iotlb.invalidate_device(device_id),
                InvalidationRange::Pages { .. } => {
                    let (start, last) = range.bounds();
                    self.iotlb.invalidate_device_range(device_id, start, last);
                }
            },

            Command::InvalidateInterruptTable { .. }
            | Command::PrefetchIommuPages { .. }
            | Command::CompletePprRequest { .. } => {}

            Command::InvalidateAll => {
                self.iotlb.invalidate_all();
                self.resync_all();
            }
        }
    }

    /// Brings the shadow of every address space in `domain_id` up to date over `range`.
    fn sync_domain(&mut self, domain_id: u16, range: InvalidationRange) {
        let enabled = self.iommu_enabled();
        let memory = self.memory.as_ref();
        let (start, last) = range.bounds();

        for (bdf, space) in &mut self.address_spaces {
            let current = match space.route() {
                Route::Translated(dte) if space.shadow().has_notifiers() => dte,
                _ => continue,
            };

            // a device leaving the domain, or whose DTE became unusable, is affected too
            let fetched = self.device_table.fetch(memory, &self.config, bdf.device_id());
            let affected = match (&fetched, current) {
                (Err(_), _) => true,
                (Ok(dte), _) if dte.domain_id() == domain_id => true,
                (Ok(_), Some(old)) => old.domain_id() == domain_id,
                (Ok(_), None) => false,
            };
            if !affected {
                continue;
            }

            match fetched {
                Ok(dte) if current == Some(dte) => {
                    if let Some(range) = range.clamp(max_address(dte.mode())) {
                        space.shadow_mut().sync_range(memory, &dte, range, true);
                    }
                }
                fetched => {
                    debug!("Route of {} changed under domain {} invalidation", bdf, domain_id);
                    space.refresh_route(memory, enabled, fetched);
                }
            }

            space.shadow().notify_invalidation(start, last);
        }
    }

    /// Re-derives the route of every address space with notifiers and resynchronizes it over the
    /// whole address space.
    fn resync_all(&mut self) {
        let enabled = self.iommu_enabled();
        let memory = self.memory.as_ref();

        for (bdf, space) in &mut self.address_spaces {
            if !space.shadow().has_notifiers() {
                continue;
            }

            let dte = self.device_table.fetch(memory, &self.config, bdf.device_id());
            space.refresh_route(memory, enabled, dte);

            if let Route::Translated(Some(dte)) = space.route() {
                space.shadow().notify_invalidation(0, max_address(dte.mode()));
            }
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Translates a DMA `access` by `bdf` to `address`.
    ///
    /// Faults the guest should know about are written to the event log before returning.
    pub fn translate(
        &mut self,
        bdf: PciBdf,
        address: u64,
        access: Permissions,
    ) -> Result<Translation, Fault> {
        let identity = Translation::identity(address, PAGE_SIZE_4K, Some(Permissions::ReadWrite));

        if !self.iommu_enabled() {
            return Ok(identity);
        }

        if (INTERRUPT_WINDOW_START..=INTERRUPT_WINDOW_END).contains(&address) {
            return Ok(Translation::identity(
                address,
                PAGE_SIZE_4K,
                Some(Permissions::Write),
            ));
        }

        self.address_space_mut(bdf);
        let device_id = bdf.device_id();

        if let Some(entry) = self.iotlb.lookup(device_id, address) {
            let translation = entry.translation;
            return self.check_access(device_id, address, access, translation);
        }

        let dte = self.fetch_dte(device_id)?;

        if !dte.is_valid() {
            return Ok(identity);
        }

        if self.is_excluded(&dte, address) {
            trace!("{:#x} of {} is in the exclusion range", address, bdf);
            return Ok(identity);
        }

        if !dte.translation_valid() {
            return Err(Fault::TranslationNotValid { device_id });
        }

        if dte.mode() == 0 {
            return Ok(identity);
        }

        match walk(self.memory.as_ref(), &dte, address) {
            Ok(translation) => {
                self.iotlb
                    .insert(device_id, address, dte.domain_id(), translation);
                self.check_access(device_id, address, access, translation)
            }
            Err(e) => {
                let fault = e.into_fault(device_id, address);
                warn!("Translation of {:#x} for {} failed: {}", address, bdf, fault);

                match e {
                    WalkError::RootPointerRead { address: pte }
                    | WalkError::PageTableRead { address: pte, .. } => {
                        self.log(Event::PageTableHardwareError {
                            device_id,
                            address: pte,
                        });
                        self.host.signal_target_abort();
                    }
                    WalkError::AddressOutOfRange { .. } => {
                        self.log(Event::IoPageFault {
                            device_id,
                            address,
                            flags: access_flags(access),
                        });
                        self.host.signal_target_abort();
                    }
                    WalkError::IllegalNextLevel { .. } => {
                        self.log(Event::IoPageFault {
                            device_id,
                            address,
                            flags: access_flags(access)
                                | IoPageFaultFlags::PRESENT
                                | IoPageFaultFlags::RESERVED,
                        });
                        self.host.signal_target_abort();
                    }
                    WalkError::TranslationNotValid => {}
                }

                Err(fault)
            }
        }
    }

    fn is_excluded(&self, dte: &DeviceTableEntry, address: u64) -> bool {
        let base = self.regs.get::<ExclusionBase>();
        let limit = self.regs.get::<ExclusionLimit>();

        base.exclusion_enable()
            && (base.allow_all() || dte.quad1().exclusion())
            && (base.address()..=limit.address()).contains(&address)
    }

    fn check_access(
        &mut self,
        device_id: u16,
        address: u64,
        access: Permissions,
        translation: Translation,
    ) -> Result<Translation, Fault> {
        let mut flags = access_flags(access);

        let fault = match translation.permissions {
            Some(permissions) if permissions.allows(access) => return Ok(translation),
            Some(_) => {
                flags |= IoPageFaultFlags::PRESENT | IoPageFaultFlags::PERMISSION;
                Fault::PermissionDenied { iova: address }
            }
            None => Fault::NotMapped { iova: address },
        };

        debug!("Device {:#06x}: {}", device_id, fault);

        self.log(Event::IoPageFault {
            device_id,
            address,
            flags,
        });
        self.host.signal_target_abort();

        Err(fault)
    }

    /// Reads guest memory on behalf of `bdf`, translating page by page.
    pub fn dma_read(&mut self, bdf: PciBdf, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        let mut done = 0;

        while done < buffer.len() {
            let (target, chunk) =
                self.dma_chunk(bdf, address, done, buffer.len(), Permissions::Read)?;
            self.memory
                .read_bytes(target, &mut buffer[done..done + chunk])
                .map_err(|_| Fault::DmaAccess { address: target })?;
            done += chunk;
        }

        Ok(())
    }

    /// Writes guest memory on behalf of `bdf`, translating page by page.
    pub fn dma_write(&mut self, bdf: PciBdf, address: u64, data: &[u8]) -> Result<(), Fault> {
        let mut done = 0;

        while done < data.len() {
            let (target, chunk) =
                self.dma_chunk(bdf, address, done, data.len(), Permissions::Write)?;
            self.memory
                .write_bytes(target, &data[done..done + chunk])
                .map_err(|_| Fault::DmaAccess { address: target })?;
            done += chunk;
        }

        Ok(())
    }

    /// Translates the part of a transfer starting `done` bytes in. Returns the target address and
    /// how many bytes fit in its page.
    fn dma_chunk(
        &mut self,
        bdf: PciBdf,
        address: u64,
        done: usize,
        len: usize,
        access: Permissions,
    ) -> Result<(u64, usize), Fault> {
        let iova = address
            .checked_add(done as u64)
            .ok_or(Fault::DmaAccess { address })?;

        let translation = self.translate(bdf, iova, access)?;
        if !translation.permissions.map_or(false, |p| p.allows(access)) {
            return Err(Fault::PermissionDenied { iova });
        }

        let page_left = translation.page_size - (iova & translation.address_mask());
        let chunk = page_left.min((len - done) as u64) as usize;

        Ok((translation.translate(iova), chunk))
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Remaps an MSI. `source` is `None` for interrupts that don't come from a PCI function, which
    /// are attributed to the I/O APIC.
    ///
    /// Faults are not reported to the guest: the event log has no entry type for them.
    pub fn remap_msi(
        &mut self,
        source: Option<PciBdf>,
        message: MsiMessage,
    ) -> Result<MsiMessage, Fault> {
        let control = self.regs.get::<Control>();
        if !control.iommu_enable() || self.device_table.is_empty() {
            return Ok(message);
        }

        let device_id = match source {
            Some(bdf) => {
                self.address_space_mut(bdf);
                bdf.device_id()
            }
            None => self.config.ioapic_device_id,
        };

        let dte = self.fetch_dte(device_id)?;
        let ga_enabled = control.ga_enable() && self.config.ga_supported;

        interrupts::remap(
            self.memory.as_ref(),
            &self.config,
            ga_enabled,
            &dte,
            device_id,
            message,
        )
    }

    /// Remaps an MSI and hands it to the interrupt controller. A message that fails remapping is
    /// dropped.
    pub fn deliver_msi(&mut self, source: Option<PciBdf>, message: MsiMessage) -> Result<(), Fault> {
        match self.remap_msi(source, message) {
            Ok(remapped) => {
                self.host.deliver_msi(remapped);
                Ok(())
            }
            Err(fault) => {
                debug!("Dropping interrupt {:?}: {}", message, fault);
                Err(fault)
            }
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Subscribes `notifier` to the mappings of `bdf` within `range`.
    ///
    /// A notifier asking for [`NotifierFlags::MAP`] is told about everything already mapped right
    /// away.
    pub fn register_notifier(
        &mut self,
        bdf: PciBdf,
        flags: NotifierFlags,
        range: RangeInclusive<u64>,
        notifier: Arc<dyn IommuNotifier>,
    ) -> Result<NotifierId, Fault> {
        let flags = flags.normalized();
        if flags.contains(NotifierFlags::MAP) && !self.config.dma_remap {
            return Err(Fault::MapNotifierUnsupported);
        }

        let id = NotifierId(self.next_notifier_id);
        self.next_notifier_id += 1;

        debug!("Registering notifier {} on {} ({:?})", id, bdf, flags);

        let registration = NotifierRegistration {
            id,
            flags,
            range,
            notifier,
        };
        let wants_map = registration.wants_map();

        self.address_space_mut(bdf)
            .shadow_mut()
            .add_notifier(registration);

        let memory = self.memory.as_ref();
        let dte = self
            .device_table
            .fetch(memory, &self.config, bdf.device_id());

        if let Some(space) = self.address_spaces.get_mut(&bdf) {
            if let (true, Route::Translated(Some(_)), Ok(dte)) = (wants_map, space.route(), dte) {
                space
                    .shadow_mut()
                    .sync_range(memory, &dte, 0..=max_address(dte.mode()), false);
            }
        }

        Ok(id)
    }

    /// Unsubscribes a notifier, which first receives UNMAP for its whole range.
    pub fn unregister_notifier(&mut self, bdf: PciBdf, id: NotifierId) -> Result<(), Fault> {
        let space = self
            .address_spaces
            .get_mut(&bdf)
            .ok_or(Fault::UnknownNotifier { id: id.0 })?;

        space
            .shadow_mut()
            .remove_notifier(id)
            .ok_or(Fault::UnknownNotifier { id: id.0 })?;

        debug!("Unregistered notifier {} from {}", id, bdf);
        Ok(())
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Puts the unit back in its power-on state. Every notifier is told its whole range is
    /// unmapped.
    pub fn reset(&mut self) {
        debug!("Reset");

        for space in self.address_spaces.values_mut() {
            space.reset();
        }

        self.iotlb.invalidate_all();
        self.regs = RegisterFile::new(&self.config);
        self.device_table = DeviceTable::default();
        self.command_ring = RingBase::default();
    }
}

fn access_flags(access: Permissions) -> IoPageFaultFlags {
    if access.can_write() {
        IoPageFaultFlags::WRITE
    } else {
        IoPageFaultFlags::empty()
    }
}

impl Debug for AmdVi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmdVi")
            .field("config", &self.config)
            .field("regs", &self.regs)
            .field("status", &self.regs.get::<Status>())
            .field("device_table", &self.device_table)
            .field("iotlb_entries", &self.iotlb.len())
            .field("address_spaces", &self.address_spaces)
            .finish()
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devtab::{DteQuad0, DteQuad1, DteQuad2};
    use crate::events::{EventCode, EventEntry, EVENT_SIZE};
    use crate::interrupts::{LegacyIrte, MsiData};
    use crate::mmio::{
        RingPointer, COMMAND_HEAD, EVENT_BASE, EVENT_TAIL, EXCLUSION_BASE, EXCLUSION_LIMIT,
        STATUS,
    };
    use crate::mocks::MockPciHost;
    use crate::pagetable::Pte;
    use crate::regions::GuestRam;
    use crate::testing::{Notification, PageTableBuilder, RecordingNotifier};

    const DEVICE_TABLE_ADDR: u64 = 0x1_0000;
    const COMMAND_RING: u64 = 0x2_0000;
    const EVENT_LOG: u64 = 0x3_0000;
    const SCRATCH: u64 = 0x5_0000;
    const TABLES: u64 = 0x10_0000;

    const DEV_A: PciBdf = PciBdf::new(0, 2, 0);
    const DEV_B: PciBdf = PciBdf::new(0, 3, 0);

    fn permissive_host() -> MockPciHost {
        let mut host = MockPciHost::new();
        host.expect_notify_msi().return_const(());
        host.expect_signal_target_abort().return_const(());
        host.expect_deliver_msi().return_const(());
        host
    }

    struct Machine {
        ram: Arc<GuestRam>,
        unit: AmdVi,
    }

    impl Machine {
        fn new() -> Machine {
            Machine::with(AmdViConfig::default(), permissive_host())
        }

        fn with(config: AmdViConfig, host: MockPciHost) -> Machine {
            let ram = Arc::new(GuestRam::new(0, 0x100_0000));
            let unit = AmdVi::new(config, ram.clone(), Arc::new(host));
            Machine { ram, unit }
        }

        /// Programs the device table, command ring, and event log, then enables everything.
        fn enable(&mut self) {
            self.unit
                .mmio_write(DEVICE_TABLE, 8, DEVICE_TABLE_ADDR | 1);
            self.unit
                .mmio_write(COMMAND_BASE, 8, COMMAND_RING | (8 << 56));
            self.unit.mmio_write(EVENT_BASE, 8, EVENT_LOG | (8 << 56));

            let control = Control(0)
                .with_iommu_enable(true)
                .with_event_log_enable(true)
                .with_command_buffer_enable(true)
                .with_com_wait_int_enable(true);
            self.unit.mmio_write(CONTROL, 8, control.0);
        }

        fn tables(&self, area: u64) -> PageTableBuilder {
            PageTableBuilder::new(Arc::clone(&self.ram), area, 3)
        }

        fn write_dte(&self, bdf: PciBdf, dte: DeviceTableEntry) {
            let address = DEVICE_TABLE_ADDR + u64::from(bdf.device_id()) * 32;
            dte.write_to(&*self.ram, address).unwrap();
        }

        fn submit(&mut self, commands: &[RawCommand]) {
            let mut tail = self.unit.regs.ring_index(Ring::CommandTail);
            for command in commands {
                command
                    .write_to(&*self.ram, COMMAND_RING + tail * COMMAND_SIZE)
                    .unwrap();
                tail = (tail + 1) % 256;
            }

            let pointer = RingPointer(0).with_index(tail as u16);
            self.unit.mmio_write(COMMAND_TAIL, 8, pointer.0);
        }

        fn run(&mut self, commands: &[Command]) {
            let raw: Vec<_> = commands.iter().map(Command::encode).collect();
            self.submit(&raw);
        }

        fn events(&self) -> Vec<EventEntry> {
            let tail = RingPointer(self.unit.mmio_read(EVENT_TAIL, 8)).index();
            (0..u64::from(tail))
                .map(|i| EventEntry::read_from(&*self.ram, EVENT_LOG + i * EVENT_SIZE).unwrap())
                .collect()
        }

        fn map_notifier(&mut self, bdf: PciBdf) -> RecordingNotifier {
            let recorder = RecordingNotifier::default();
            self.unit
                .register_notifier(
                    bdf,
                    NotifierFlags::MAP,
                    0..=u64::MAX,
                    Arc::new(recorder.clone()),
                )
                .unwrap();
            recorder
        }
    }

    fn rw() -> Permissions {
        Permissions::ReadWrite
    }

    #[test]
    fn test_disabled_unit_is_identity() {
        let mut machine = Machine::new();

        let translation = machine
            .unit
            .translate(DEV_A, 0x1234_5678, Permissions::Write)
            .unwrap();

        assert_eq!(translation.translate(0x1234_5678), 0x1234_5678);
        assert_eq!(translation.permissions, Some(rw()));
        assert!(machine.unit.iotlb().is_empty());
    }

    #[test]
    fn test_second_translation_comes_from_iotlb() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x4000, 0x80_0000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let first = machine
            .unit
            .translate(DEV_A, 0x4321, Permissions::Read)
            .unwrap();
        assert_eq!(machine.unit.iotlb().len(), 1);

        // only a cached copy can still see the page
        tables.unmap(0x4000, 0);
        let second = machine
            .unit
            .translate(DEV_A, 0x4321, Permissions::Read)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.translate(0x4321), 0x80_0321);
    }

    #[test]
    fn test_mode_0_translates_to_itself() {
        let mut machine = Machine::new();
        machine.enable();
        let dte = DeviceTableEntry::default().with_quad0(
            DteQuad0(0)
                .with_valid(true)
                .with_translation_valid(true)
                .with_mode(0),
        );
        machine.write_dte(DEV_A, dte);

        for address in [0, 0x1234_5678, 0xffff_ffff_f000, u64::MAX] {
            for access in [Permissions::Read, Permissions::Write, rw()] {
                let translation = machine.unit.translate(DEV_A, address, access).unwrap();
                assert_eq!(translation.translate(address), address);
                assert_eq!(translation.permissions, Some(rw()));
            }
        }
        assert!(machine.events().is_empty());
    }

    #[test]
    fn test_invalid_dte_passes_through() {
        let mut machine = Machine::new();
        machine.enable();

        let translation = machine
            .unit
            .translate(DEV_A, 0x9000, Permissions::Write)
            .unwrap();
        assert_eq!(translation.translate(0x9000), 0x9000);
    }

    #[test]
    fn test_translation_not_valid_is_silent() {
        let mut machine = Machine::new();
        machine.enable();
        machine.write_dte(
            DEV_A,
            DeviceTableEntry::default().with_quad0(DteQuad0(0).with_valid(true)),
        );

        assert_eq!(
            machine.unit.translate(DEV_A, 0x9000, Permissions::Read),
            Err(Fault::TranslationNotValid {
                device_id: DEV_A.device_id()
            })
        );
        assert!(machine.events().is_empty());
    }

    #[test]
    fn test_missing_page_logs_fault_and_aborts() {
        let mut host = MockPciHost::new();
        host.expect_signal_target_abort().times(1).return_const(());
        let mut machine = Machine::with(AmdViConfig::default(), host);
        machine.enable();
        let tables = machine.tables(TABLES);
        machine.write_dte(DEV_A, tables.dte(7));

        assert_eq!(
            machine.unit.translate(DEV_A, 0x7000, Permissions::Write),
            Err(Fault::NotMapped { iova: 0x7000 })
        );

        let events = machine.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].header().code(), EventCode::IoPageFault as u8);
        assert_eq!(events[0].header().device_id(), DEV_A.device_id());
        assert_eq!(
            events[0].header().flags(),
            IoPageFaultFlags::WRITE.bits()
        );
        assert_eq!(events[0].address(), 0x7000);
    }

    #[test]
    fn test_permission_fault() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x4000, 0x80_0000, Permissions::Read);
        machine.write_dte(DEV_A, tables.dte(7));

        assert!(machine
            .unit
            .translate(DEV_A, 0x4000, Permissions::Read)
            .is_ok());
        assert_eq!(
            machine.unit.translate(DEV_A, 0x4000, Permissions::Write),
            Err(Fault::PermissionDenied { iova: 0x4000 })
        );

        let flags = IoPageFaultFlags::PRESENT | IoPageFaultFlags::WRITE | IoPageFaultFlags::PERMISSION;
        assert_eq!(machine.events()[0].header().flags(), flags.bits());
    }

    #[test]
    fn test_reserved_dte_bit_logs_illegal_entry() {
        let mut machine = Machine::new();
        machine.enable();
        let tables = machine.tables(TABLES);
        let dte = tables.dte(7);
        machine.write_dte(DEV_B, dte.with_quad0(DteQuad0(dte.quad0().0 | 1 << 55)));

        assert_eq!(
            machine.unit.translate(DEV_B, 0x1000, Permissions::Read),
            Err(Fault::IllegalDeviceTableEntry {
                device_id: DEV_B.device_id()
            })
        );

        let events = machine.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].header().code(),
            EventCode::IllegalDeviceTableEntry as u8
        );
        assert_eq!(events[0].header().0 & 0xffff, u64::from(DEV_B.device_id()));
        assert_eq!(
            events[0].address(),
            DEVICE_TABLE_ADDR + u64::from(DEV_B.device_id()) * 32
        );
    }

    #[test]
    fn test_unreadable_page_table_is_a_hardware_error() {
        let mut machine = Machine::new();
        machine.enable();
        let tables = machine.tables(TABLES);
        let dte = tables.dte(7);
        machine.write_dte(
            DEV_A,
            dte.with_quad0(dte.quad0().with_page_table_root(0x10_0000)),
        );

        assert_eq!(
            machine.unit.translate(DEV_A, 0x1000, Permissions::Read),
            Err(Fault::RootPointerRead {
                address: 0x1_0000_0000
            })
        );

        let events = machine.events();
        assert_eq!(
            events[0].header().code(),
            EventCode::PageTableHardwareError as u8
        );
        assert_eq!(events[0].address(), 0x1_0000_0000);
    }

    #[test]
    fn test_illegal_next_level_is_a_page_fault() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());

        // the level-1 entry points at a table of its own level
        let pointer = Pte(0x40_0000)
            .with_present(true)
            .with_next_level(2)
            .with_read_permission(true)
            .with_write_permission(true);
        tables.set_entry(0x1000, 1, pointer);
        machine.write_dte(DEV_A, tables.dte(7));

        assert_eq!(
            machine.unit.translate(DEV_A, 0x1000, Permissions::Write),
            Err(Fault::IllegalNextLevel {
                address: TABLES + 0x1000
            })
        );

        let events = machine.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].header().code(), EventCode::IoPageFault as u8);
        assert_eq!(events[0].address(), 0x1000);
    }

    #[test]
    fn test_exclusion_range_bypasses_translation() {
        let mut machine = Machine::new();
        machine.enable();
        let tables = machine.tables(TABLES);
        let dte = tables.dte(7);
        machine.write_dte(DEV_A, dte.with_quad1(dte.quad1().with_exclusion(true)));

        machine
            .unit
            .mmio_write(EXCLUSION_BASE, 8, 0x40_0000 | 1);
        machine.unit.mmio_write(EXCLUSION_LIMIT, 8, 0x40_1000);

        let translation = machine
            .unit
            .translate(DEV_A, 0x40_1abc, Permissions::Write)
            .unwrap();
        assert_eq!(translation.translate(0x40_1abc), 0x40_1abc);

        assert_eq!(
            machine.unit.translate(DEV_A, 0x40_2000, Permissions::Write),
            Err(Fault::NotMapped { iova: 0x40_2000 })
        );
    }

    #[test]
    fn test_interrupt_window_is_write_only() {
        let mut machine = Machine::new();
        machine.enable();
        let tables = machine.tables(TABLES);
        machine.write_dte(DEV_A, tables.dte(7));

        let translation = machine
            .unit
            .translate(DEV_A, 0xfee0_1000, Permissions::Write)
            .unwrap();
        assert_eq!(translation.permissions, Some(Permissions::Write));

        let mut buffer = [0; 4];
        assert_eq!(
            machine.unit.dma_read(DEV_A, 0xfee0_1000, &mut buffer),
            Err(Fault::PermissionDenied { iova: 0xfee0_1000 })
        );
        assert!(machine.events().is_empty());
    }

    #[test]
    fn test_dma_crosses_pages() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        tables.map_page(0x2000, 0x90_0000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        machine.unit.dma_write(DEV_A, 0x1ffc, &data).unwrap();

        let mut low = [0; 4];
        let mut high = [0; 4];
        machine.ram.read_bytes(0x80_0ffc, &mut low).unwrap();
        machine.ram.read_bytes(0x90_0000, &mut high).unwrap();
        assert_eq!(low, [1, 2, 3, 4]);
        assert_eq!(high, [5, 6, 7, 8]);

        let mut back = [0; 8];
        machine.unit.dma_read(DEV_A, 0x1ffc, &mut back).unwrap();
        assert_eq!(back, data);

        let mut beyond = [0; 8];
        assert_eq!(
            machine.unit.dma_read(DEV_A, 0x2ffc, &mut beyond),
            Err(Fault::NotMapped { iova: 0x3000 })
        );
    }

    #[test]
    fn test_base_registers_latch_on_high_half() {
        let mut machine = Machine::new();

        machine
            .unit
            .mmio_write(DEVICE_TABLE, 4, DEVICE_TABLE_ADDR | 1);
        assert!(machine.unit.device_table.is_empty());

        machine.unit.mmio_write(DEVICE_TABLE + 4, 4, 0);
        assert_eq!(machine.unit.device_table.address, DEVICE_TABLE_ADDR);
        assert_eq!(machine.unit.device_table.entries, 256);

        machine
            .unit
            .mmio_write(COMMAND_BASE, 8, COMMAND_RING | (8 << 56));
        machine.unit.mmio_write(COMMAND_TAIL, 8, 0x30);
        machine.unit.mmio_write(COMMAND_HEAD, 8, 0x10);
        machine.unit.mmio_write(COMMAND_BASE + 4, 4, 8 << 24);
        assert_eq!(machine.unit.mmio_read(COMMAND_HEAD, 8), 0);
        assert_eq!(machine.unit.mmio_read(COMMAND_TAIL, 8), 0);
    }

    #[test]
    fn test_control_updates_status() {
        let mut machine = Machine::new();
        machine.enable();

        let status = Status(machine.unit.mmio_read(STATUS, 8));
        assert!(status.cmd_buffer_run());
        assert!(status.event_log_run());

        machine.unit.mmio_write(CONTROL, 8, Control(0).with_iommu_enable(true).0);
        let status = Status(machine.unit.mmio_read(STATUS, 8));
        assert!(!status.cmd_buffer_run());
        assert!(!status.event_log_run());
    }

    #[test]
    fn test_invalidate_all_then_completion_wait() {
        let mut machine = Machine::new();
        machine.enable();

        machine.run(&[
            Command::InvalidateAll,
            Command::CompletionWait {
                store: Some(SCRATCH),
                data: 0x1234_5678_9abc_def0,
                interrupt: false,
            },
        ]);

        assert_eq!(
            machine.ram.read_le_u64(SCRATCH).unwrap(),
            0x1234_5678_9abc_def0
        );
        assert_eq!(
            machine.unit.mmio_read(COMMAND_HEAD, 8),
            machine.unit.mmio_read(COMMAND_TAIL, 8)
        );
        assert!(machine.events().is_empty());
    }

    #[test]
    fn test_completion_wait_interrupt() {
        let mut host = MockPciHost::new();
        host.expect_notify_msi().times(1).return_const(());
        let mut machine = Machine::with(AmdViConfig::default(), host);
        machine.enable();

        machine.run(&[Command::CompletionWait {
            store: None,
            data: 0,
            interrupt: true,
        }]);

        assert!(Status(machine.unit.mmio_read(STATUS, 8)).com_wait_int());
    }

    #[test]
    fn test_illegal_command_does_not_stop_the_ring() {
        let mut machine = Machine::new();
        machine.enable();

        let bad = RawCommand::default().with_quad0(0xf << 60);
        let wait = Command::CompletionWait {
            store: Some(SCRATCH),
            data: 1,
            interrupt: false,
        }
        .encode();
        machine.submit(&[bad, wait]);

        assert_eq!(machine.ram.read_le_u64(SCRATCH).unwrap(), 1);

        let events = machine.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].header().code(), EventCode::IllegalCommand as u8);
        assert_eq!(events[0].address(), COMMAND_RING);
        assert_eq!(RingPointer(machine.unit.mmio_read(COMMAND_HEAD, 8)).index(), 2);
    }

    #[test]
    fn test_commands_wait_for_enable() {
        let mut machine = Machine::new();
        machine.enable();
        machine.unit.mmio_write(CONTROL, 8, Control(0).with_iommu_enable(true).0);

        machine.run(&[Command::CompletionWait {
            store: Some(SCRATCH),
            data: 5,
            interrupt: false,
        }]);
        assert_eq!(machine.ram.read_le_u64(SCRATCH).unwrap(), 0);

        let control = Control(0)
            .with_iommu_enable(true)
            .with_command_buffer_enable(true);
        machine.unit.mmio_write(CONTROL, 8, control.0);
        assert_eq!(machine.ram.read_le_u64(SCRATCH).unwrap(), 5);
    }

    #[test]
    fn test_domain_invalidation_covers_every_device() {
        let mut machine = Machine::new();
        machine.enable();

        let mut tables_a = machine.tables(TABLES);
        let mut tables_b = machine.tables(TABLES + 0x10_0000);
        let mut tables_c = machine.tables(TABLES + 0x20_0000);
        tables_a.map_page(0x1000, 0x80_0000, rw());
        tables_b.map_page(0x1000, 0x81_0000, rw());
        tables_c.map_page(0x1000, 0x82_0000, rw());
        machine.write_dte(DEV_A, tables_a.dte(7));
        machine.write_dte(DEV_B, tables_b.dte(7));
        let dev_c = PciBdf::new(0, 4, 0);
        machine.write_dte(dev_c, tables_c.dte(8));

        let recorder = machine.map_notifier(DEV_A);
        assert_eq!(recorder.take().len(), 1);

        for bdf in [DEV_A, DEV_B, dev_c] {
            machine.unit.translate(bdf, 0x1000, Permissions::Read).unwrap();
        }
        assert_eq!(machine.unit.iotlb().len(), 3);

        tables_a.unmap(0x1000, 0);
        machine.run(&[Command::InvalidateIommuPages {
            domain_id: 7,
            range: InvalidationRange::All,
        }]);

        assert!(machine.unit.iotlb().lookup(DEV_A.device_id(), 0x1000).is_none());
        assert!(machine.unit.iotlb().lookup(DEV_B.device_id(), 0x1000).is_none());
        assert!(machine.unit.iotlb().lookup(dev_c.device_id(), 0x1000).is_some());
        assert_eq!(
            recorder.take(),
            vec![Notification::Unmap {
                iova: 0x1000,
                size: 0x1000
            }]
        );
    }

    #[test]
    fn test_domain_invalidation_after_cleared_dte_unmaps() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = machine.map_notifier(DEV_A);
        assert_eq!(recorder.take().len(), 1);

        // the cleared entry no longer names domain 7
        machine.write_dte(DEV_A, DeviceTableEntry::default());
        machine.run(&[Command::InvalidateIommuPages {
            domain_id: 7,
            range: InvalidationRange::All,
        }]);

        assert_eq!(
            recorder.take(),
            vec![
                Notification::Unmap {
                    iova: 0,
                    size: 1 << 63
                },
                Notification::Unmap {
                    iova: 1 << 63,
                    size: 1 << 63
                },
            ]
        );
        assert_eq!(
            machine.unit.address_space(DEV_A).unwrap().route(),
            Route::PassThrough
        );
        assert!(machine.unit.address_space(DEV_A).unwrap().shadow().tree().is_empty());
    }

    #[test]
    fn test_domain_invalidation_after_illegal_dte_unmaps() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        let dte = tables.dte(7);
        machine.write_dte(DEV_A, dte);

        let recorder = machine.map_notifier(DEV_A);
        recorder.take();

        machine.write_dte(DEV_A, dte.with_quad0(DteQuad0(dte.quad0().0 | 1 << 55)));
        machine.run(&[Command::InvalidateIommuPages {
            domain_id: 7,
            range: InvalidationRange::All,
        }]);

        assert_eq!(recorder.take().len(), 2);
        assert_eq!(
            machine.unit.address_space(DEV_A).unwrap().route(),
            Route::Translated(None)
        );
        assert!(machine.unit.address_space(DEV_A).unwrap().shadow().tree().is_empty());
    }

    #[test]
    fn test_domain_invalidation_skips_other_domains() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = machine.map_notifier(DEV_A);
        recorder.take();

        tables.unmap(0x1000, 0);
        machine.run(&[Command::InvalidateIommuPages {
            domain_id: 8,
            range: InvalidationRange::All,
        }]);

        assert_eq!(recorder.take(), vec![]);
    }

    #[test]
    fn test_invalidating_a_sub_page_unmaps_the_large_page() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_large(0x40_8000, 0x80_0000, 0x8000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = machine.map_notifier(DEV_A);
        assert_eq!(
            recorder.take(),
            vec![Notification::Map {
                iova: 0x40_8000,
                size: 0x8000,
                translated_addr: 0x80_0000,
                permissions: rw(),
            }]
        );

        for i in 0..8 {
            tables.unmap(0x40_8000 + i * 0x1000, 0);
        }
        machine.run(&[Command::InvalidateIommuPages {
            domain_id: 7,
            range: InvalidationRange::Pages {
                start: 0x40_a000,
                size: 0x1000,
            },
        }]);

        assert_eq!(
            recorder.take(),
            vec![Notification::Unmap {
                iova: 0x40_8000,
                size: 0x8000
            }]
        );
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        tables.map_page(0x20_0000, 0x90_0000, Permissions::Read);
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = machine.map_notifier(DEV_A);
        assert_eq!(recorder.take().len(), 2);

        machine.run(&[Command::InvalidateAll]);
        machine.run(&[Command::InvalidateIommuPages {
            domain_id: 7,
            range: InvalidationRange::All,
        }]);
        assert_eq!(recorder.take(), vec![]);
    }

    #[test]
    fn test_unmap_only_notifier_gets_invalidations() {
        let mut machine = Machine::new();
        machine.enable();
        let tables = machine.tables(TABLES);
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = RecordingNotifier::default();
        machine
            .unit
            .register_notifier(
                DEV_A,
                NotifierFlags::UNMAP,
                0..=u64::MAX,
                Arc::new(recorder.clone()),
            )
            .unwrap();

        machine.run(&[Command::InvalidateIommuPages {
            domain_id: 7,
            range: InvalidationRange::Pages {
                start: 0x20_0000,
                size: 0x20_0000,
            },
        }]);

        assert_eq!(
            recorder.take(),
            vec![Notification::Unmap {
                iova: 0x20_0000,
                size: 0x20_0000
            }]
        );
    }

    #[test]
    fn test_devtab_invalidation_switches_route() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = machine.map_notifier(DEV_A);
        recorder.take();

        let dte = tables.dte(7);
        machine.write_dte(DEV_A, dte.with_quad0(dte.quad0().with_mode(0)));
        machine.run(&[Command::InvalidateDevtabEntry {
            device_id: DEV_A.device_id(),
        }]);

        assert_eq!(
            machine.unit.address_space(DEV_A).unwrap().route(),
            Route::PassThrough
        );
        assert_eq!(
            recorder.take(),
            vec![
                Notification::Unmap {
                    iova: 0,
                    size: 1 << 63
                },
                Notification::Unmap {
                    iova: 1 << 63,
                    size: 1 << 63
                },
            ]
        );

        // and back
        machine.write_dte(DEV_A, tables.dte(7));
        machine.run(&[Command::InvalidateDevtabEntry {
            device_id: DEV_A.device_id(),
        }]);
        assert_eq!(
            recorder.take().last(),
            Some(&Notification::Map {
                iova: 0x1000,
                size: 0x1000,
                translated_addr: 0x80_0000,
                permissions: rw(),
            })
        );
    }

    #[test]
    fn test_disabling_translation_unmaps_notifiers() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = machine.map_notifier(DEV_A);
        recorder.take();

        machine.unit.mmio_write(CONTROL, 8, 0);
        assert_eq!(recorder.take().len(), 2);
        assert_eq!(
            machine.unit.address_space(DEV_A).unwrap().route(),
            Route::PassThrough
        );
    }

    #[test]
    fn test_map_notifiers_need_dma_remap() {
        let config = AmdViConfig {
            dma_remap: false,
            ..AmdViConfig::default()
        };
        let mut machine = Machine::with(config, permissive_host());

        assert_eq!(
            machine.unit.register_notifier(
                DEV_A,
                NotifierFlags::MAP,
                0..=u64::MAX,
                Arc::new(RecordingNotifier::default()),
            ),
            Err(Fault::MapNotifierUnsupported)
        );
        assert!(machine
            .unit
            .register_notifier(
                DEV_A,
                NotifierFlags::UNMAP,
                0..=u64::MAX,
                Arc::new(RecordingNotifier::default()),
            )
            .is_ok());
    }

    #[test]
    fn test_unregister_notifier() {
        let mut machine = Machine::new();
        let recorder = RecordingNotifier::default();
        let id = machine
            .unit
            .register_notifier(
                DEV_A,
                NotifierFlags::UNMAP,
                0x1000..=0x1fff,
                Arc::new(recorder.clone()),
            )
            .unwrap();

        machine.unit.unregister_notifier(DEV_A, id).unwrap();
        assert_eq!(
            recorder.take(),
            vec![Notification::Unmap {
                iova: 0x1000,
                size: 0x1000
            }]
        );

        assert_eq!(
            machine.unit.unregister_notifier(DEV_A, id),
            Err(Fault::UnknownNotifier { id: id.0 })
        );
        assert_eq!(
            machine.unit.unregister_notifier(DEV_B, id),
            Err(Fault::UnknownNotifier { id: id.0 })
        );
    }

    #[test]
    fn test_remap_msi() {
        let remapped = MsiMessage {
            address: 0xfee0_2000,
            data: 0x0000_8033,
        };
        let mut host = MockPciHost::new();
        host.expect_deliver_msi()
            .withf(move |message| *message == remapped)
            .times(1)
            .return_const(());
        let mut machine = Machine::with(AmdViConfig::default(), host);

        let message = MsiMessage {
            address: 0xfee0_0000,
            data: MsiData(1).with_trigger_mode(true).0,
        };

        // nothing happens before the unit is enabled
        assert_eq!(machine.unit.remap_msi(Some(DEV_A), message), Ok(message));

        machine.enable();
        let dte = DeviceTableEntry::default()
            .with_quad0(DteQuad0(0).with_valid(true))
            .with_quad1(DteQuad1(0).with_domain_id(7))
            .with_quad2(
                DteQuad2(0)
                    .with_interrupt_valid(true)
                    .with_interrupt_table_length(2)
                    .with_interrupt_table_root(SCRATCH >> 6)
                    .with_interrupt_control(2),
            );
        machine.write_dte(DEV_A, dte);
        let irte = LegacyIrte(0)
            .with_remap_enable(true)
            .with_destination(2)
            .with_vector(0x33);
        machine.ram.write_le_u32(SCRATCH + 4, irte.0).unwrap();

        machine.unit.deliver_msi(Some(DEV_A), message).unwrap();
    }

    #[test]
    fn test_ioapic_interrupts_use_configured_id() {
        let mut machine = Machine::new();
        machine.enable();
        let ioapic = PciBdf::from_device_id(machine.unit.config().ioapic_device_id);
        let dte = DeviceTableEntry::default()
            .with_quad0(DteQuad0(0).with_valid(true))
            .with_quad2(DteQuad2(0).with_interrupt_valid(true));
        machine.write_dte(ioapic, dte);

        let message = MsiMessage {
            address: 0xfee0_0000,
            data: 0x31,
        };
        assert_eq!(
            machine.unit.remap_msi(None, message),
            Err(Fault::InterruptAborted {
                device_id: ioapic.device_id()
            })
        );
    }

    #[test]
    fn test_reset() {
        let mut machine = Machine::new();
        machine.enable();
        let mut tables = machine.tables(TABLES);
        tables.map_page(0x1000, 0x80_0000, rw());
        machine.write_dte(DEV_A, tables.dte(7));

        let recorder = machine.map_notifier(DEV_A);
        machine.unit.translate(DEV_A, 0x1000, Permissions::Read).unwrap();
        recorder.take();

        machine.unit.reset();

        assert_eq!(recorder.take().len(), 2);
        assert!(machine.unit.iotlb().is_empty());
        assert_eq!(machine.unit.mmio_read(CONTROL, 8), 0);
        assert!(machine.unit.device_table.is_empty());
        assert_eq!(
            machine.unit.address_space(DEV_A).unwrap().route(),
            Route::PassThrough
        );
    }
}

/* ---------------------------------------------------------------------------------------------- */
