// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-side shadow of a device's guest page tables.
//!
//! Consumers registered with [`NotifierFlags::MAP`](crate::iommu::NotifierFlags::MAP) are told about
//! every page the guest maps, with its full size. Each such notification is recorded as an extent
//! in an [`IovaTree`]. Extents are never merged or split: a page that is later found unmapped is
//! reported with the size it was mapped with, even if the guest only cleared part of it, since
//! consumers expect map and unmap sizes to match.
//!
//! Consumers that only asked for [`NotifierFlags::UNMAP`](crate::iommu::NotifierFlags::UNMAP)
//! don't track mappings. They are told about invalidated ranges directly.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use log::{debug, warn};

use crate::devtab::DeviceTableEntry;
use crate::iommu::{aligned_chunks, NotifierId, NotifierRegistration};
use crate::pagetable::{walk, Translation, WalkError};
use crate::regions::{GuestMemory, Permissions};

/* ---------------------------------------------------------------------------------------------- */

/// A mapping that was reported to MAP notifiers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MappedExtent {
    pub size: u64,
    pub translated_addr: u64,
    pub permissions: Permissions,
}

/// Non-overlapping IOVA extents, ordered by start address.
#[derive(Clone, Debug, Default)]
pub struct IovaTree {
    extents: BTreeMap<u64, MappedExtent>,
}

impl IovaTree {
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Extents intersecting `[start, last]`, in address order.
    pub fn overlapping(&self, start: u64, last: u64) -> Vec<(u64, MappedExtent)> {
        // ends are ordered like starts, so stop at the first extent ending before `start`
        let mut found: Vec<_> = self
            .extents
            .range(..=last)
            .rev()
            .take_while(|&(&iova, extent)| iova + (extent.size - 1) >= start)
            .map(|(&iova, &extent)| (iova, extent))
            .collect();
        found.reverse();
        found
    }

    pub fn insert(&mut self, iova: u64, extent: MappedExtent) {
        self.extents.insert(iova, extent);
    }

    pub fn remove(&mut self, iova: u64) -> Option<MappedExtent> {
        self.extents.remove(&iova)
    }

    pub fn clear(&mut self) {
        self.extents.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, MappedExtent)> + '_ {
        self.extents.iter().map(|(&iova, &extent)| (iova, extent))
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The notifiers of one address space and the extents reported to them.
#[derive(Debug, Default)]
pub struct ShadowMappings {
    tree: IovaTree,
    notifiers: Vec<NotifierRegistration>,
}

impl ShadowMappings {
    pub fn tree(&self) -> &IovaTree {
        &self.tree
    }

    pub fn has_notifiers(&self) -> bool {
        !self.notifiers.is_empty()
    }

    pub fn has_map_notifiers(&self) -> bool {
        self.notifiers.iter().any(NotifierRegistration::wants_map)
    }

    pub(crate) fn add_notifier(&mut self, registration: NotifierRegistration) {
        // a newcomer hasn't seen what the others were told
        if registration.wants_map() {
            for (iova, extent) in self.tree.iter() {
                let last = iova + (extent.size - 1);
                if registration.overlaps(iova, last) {
                    if let Err(e) = registration.notifier.on_map(
                        iova,
                        extent.size,
                        extent.translated_addr,
                        extent.permissions,
                    ) {
                        warn!("Notifier {} failed to replay {:#x}: {}", registration.id, iova, e);
                    }
                }
            }
        }

        self.notifiers.push(registration);
    }

    /// Removes a notifier after sending it UNMAP for its whole range.
    pub(crate) fn remove_notifier(&mut self, id: NotifierId) -> Option<NotifierRegistration> {
        let index = self.notifiers.iter().position(|r| r.id == id)?;
        let registration = self.notifiers.remove(index);

        unmap_registration(&registration);

        if !self.has_map_notifiers() {
            self.tree.clear();
        }

        Some(registration)
    }

    /// Sends UNMAP for the whole registered range of every notifier and forgets all extents.
    pub fn unmap_all(&mut self) {
        for registration in &self.notifiers {
            unmap_registration(registration);
        }
        self.tree.clear();
    }

    /// Brings recorded extents in line with the page tables of `dte` over `range`.
    ///
    /// Mapped pages that aren't recorded yet, or are recorded differently, are reported with MAP.
    /// When `unmap_gaps` is set, recorded extents intersecting unmapped pages are reported with
    /// UNMAP. A walk that fails for the whole address space unmaps everything.
    pub fn sync_range(
        &mut self,
        memory: &dyn GuestMemory,
        dte: &DeviceTableEntry,
        range: RangeInclusive<u64>,
        unmap_gaps: bool,
    ) {
        if !self.has_map_notifiers() || dte.mode() == 0 {
            return;
        }

        if dte.permissions().is_none() {
            self.unmap_all();
            return;
        }

        let last = *range.end();
        let mut iova = *range.start();

        loop {
            let translation = match walk(memory, dte, iova) {
                Ok(translation) => translation,
                Err(WalkError::PageTableRead { page_size, .. })
                | Err(WalkError::IllegalNextLevel { page_size, .. }) => {
                    Translation::identity(iova, page_size, None)
                }
                Err(WalkError::AddressOutOfRange { .. }) => break,
                Err(e) => {
                    debug!("Address space walk failed at {:#x}: {:?}", iova, e);
                    self.unmap_all();
                    return;
                }
            };

            if let Some(permissions) = translation.permissions {
                self.map(
                    translation.iova,
                    translation.page_size,
                    translation.translated_addr,
                    permissions,
                );
            } else if unmap_gaps {
                self.unmap(translation.iova, translation.page_size);
            }

            match translation.iova.checked_add(translation.page_size) {
                Some(next) if next <= last => iova = next,
                _ => break,
            }
        }
    }

    /// Records and reports a mapping, replacing whatever was recorded over the same range.
    fn map(&mut self, iova: u64, size: u64, translated_addr: u64, permissions: Permissions) {
        let extent = MappedExtent {
            size,
            translated_addr,
            permissions,
        };

        let overlapping = self.tree.overlapping(iova, iova + (size - 1));
        if overlapping == [(iova, extent)] {
            return;
        }

        for (old_iova, old) in overlapping {
            self.tree.remove(old_iova);
            self.notify_unmap(old_iova, old.size);
        }

        if self.notify_map(iova, &extent) {
            self.tree.insert(iova, extent);
        }
    }

    /// Reports every recorded extent intersecting the range as unmapped, with its recorded size.
    fn unmap(&mut self, iova: u64, size: u64) {
        for (old_iova, old) in self.tree.overlapping(iova, iova + (size - 1)) {
            self.tree.remove(old_iova);
            self.notify_unmap(old_iova, old.size);
        }
    }

    /// Returns whether every interested notifier accepted the mapping.
    fn notify_map(&self, iova: u64, extent: &MappedExtent) -> bool {
        let last = iova + (extent.size - 1);
        let mut accepted = true;

        for registration in self.notifiers.iter().filter(|r| r.wants_map()) {
            if !registration.overlaps(iova, last) {
                continue;
            }

            debug!(
                "MAP {:#x}+{:#x} -> {:#x} ({:?}) to notifier {}",
                iova, extent.size, extent.translated_addr, extent.permissions, registration.id
            );

            if let Err(e) = registration.notifier.on_map(
                iova,
                extent.size,
                extent.translated_addr,
                extent.permissions,
            ) {
                warn!("Notifier {} failed to map {:#x}: {}", registration.id, iova, e);
                accepted = false;
            }
        }

        accepted
    }

    fn notify_unmap(&self, iova: u64, size: u64) {
        let last = iova + (size - 1);

        for registration in self.notifiers.iter().filter(|r| r.wants_map()) {
            if registration.overlaps(iova, last) {
                debug!("UNMAP {:#x}+{:#x} to notifier {}", iova, size, registration.id);
                if let Err(e) = registration.notifier.on_unmap(iova, size) {
                    warn!("Notifier {} failed to unmap {:#x}: {}", registration.id, iova, e);
                }
            }
        }
    }

    /// Tells notifiers that don't track mappings that `[start, last]` was invalidated.
    pub fn notify_invalidation(&self, start: u64, last: u64) {
        for registration in self.notifiers.iter().filter(|r| !r.wants_map()) {
            if registration.flags.is_empty() || !registration.overlaps(start, last) {
                continue;
            }

            let start = start.max(*registration.range.start());
            let last = last.min(*registration.range.end());

            for (iova, size) in aligned_chunks(start, last) {
                if let Err(e) = registration.notifier.on_unmap(iova, size) {
                    warn!("Notifier {} failed to unmap {:#x}: {}", registration.id, iova, e);
                }
            }
        }
    }
}

fn unmap_registration(registration: &NotifierRegistration) {
    let range = &registration.range;
    if registration.flags.is_empty() {
        return;
    }

    for (iova, size) in aligned_chunks(*range.start(), *range.end()) {
        debug!("UNMAP {:#x}+{:#x} to notifier {}", iova, size, registration.id);
        if let Err(e) = registration.notifier.on_unmap(iova, size) {
            warn!("Notifier {} failed to unmap {:#x}: {}", registration.id, iova, e);
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
