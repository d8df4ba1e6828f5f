// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;

use log::debug;

use crate::pagetable::Translation;

/* ---------------------------------------------------------------------------------------------- */

/// A cached translation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IotlbEntry {
    pub domain_id: u16,
    pub translation: Translation,
}

impl IotlbEntry {
    fn overlaps(&self, start: u64, last: u64) -> bool {
        let translation = &self.translation;
        translation.iova <= last && translation.iova + translation.address_mask() >= start
    }
}

/// Translation cache keyed by device id and 4 KiB guest frame number.
///
/// A large page is cached once per frame it was looked up through. When the cache is full, the
/// next insertion flushes it entirely.
#[derive(Debug)]
pub struct Iotlb {
    entries: HashMap<(u16, u64), IotlbEntry>,
    capacity: usize,
}

impl Iotlb {
    pub fn new(capacity: usize) -> Iotlb {
        Iotlb {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, device_id: u16, iova: u64) -> Option<&IotlbEntry> {
        let entry = self
            .entries
            .get(&(device_id, iova >> 12))
            .filter(|entry| entry.translation.contains(iova));

        match entry {
            Some(_) => debug!("IOTLB hit for {:#06x} at {:#x}", device_id, iova),
            None => debug!("IOTLB miss for {:#06x} at {:#x}", device_id, iova),
        }

        entry
    }

    /// Caches a translation for the frame containing `iova`. Unmapped translations are ignored.
    pub fn insert(&mut self, device_id: u16, iova: u64, domain_id: u16, translation: Translation) {
        if !translation.is_mapped() || self.capacity == 0 {
            return;
        }

        if self.entries.len() >= self.capacity {
            debug!("IOTLB full, flushing {} entries", self.entries.len());
            self.entries.clear();
        }

        self.entries.insert(
            (device_id, iova >> 12),
            IotlbEntry {
                domain_id,
                translation,
            },
        );
    }

    /// Drops every entry of `device_id` whose page contains `iova`.
    pub fn invalidate_page(&mut self, device_id: u16, iova: u64) {
        self.entries
            .retain(|&(id, _), entry| id != device_id || !entry.translation.contains(iova));
    }

    /// Drops every entry of `device_id` whose page intersects `[start, last]`.
    pub fn invalidate_device_range(&mut self, device_id: u16, start: u64, last: u64) {
        self.entries
            .retain(|&(id, _), entry| id != device_id || !entry.overlaps(start, last));
    }

    pub fn invalidate_device(&mut self, device_id: u16) {
        self.entries.retain(|&(id, _), _| id != device_id);
    }

    /// Drops every entry of `domain_id` whose page intersects `[start, last]`.
    pub fn invalidate_domain_range(&mut self, domain_id: u16, start: u64, last: u64) {
        self.entries
            .retain(|_, entry| entry.domain_id != domain_id || !entry.overlaps(start, last));
    }

    pub fn invalidate_domain(&mut self, domain_id: u16) {
        self.entries.retain(|_, entry| entry.domain_id != domain_id);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
