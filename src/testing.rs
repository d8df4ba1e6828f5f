// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers shared by the unit tests: a page table builder writing into [`GuestRam`] and a notifier
//! that records what it is told.

/* ---------------------------------------------------------------------------------------------- */

use std::io;
use std::sync::{Arc, Mutex};

use crate::devtab::{DeviceTableEntry, DteQuad0, DteQuad1};
use crate::iommu::IommuNotifier;
use crate::pagetable::{level_page_size, Pte};
use crate::regions::{GuestMemory, GuestRam, Permissions};

/* ---------------------------------------------------------------------------------------------- */

/// Builds I/O page tables in guest memory. Tables are allocated one after the other starting at
/// the address given to [`PageTableBuilder::new`], the first one being the root.
pub(crate) struct PageTableBuilder {
    ram: Arc<GuestRam>,
    root: u64,
    next_table: u64,
    mode: u8,
}

impl PageTableBuilder {
    pub fn new(ram: Arc<GuestRam>, table_area: u64, mode: u8) -> PageTableBuilder {
        PageTableBuilder {
            ram,
            root: table_area,
            next_table: table_area + 0x1000,
            mode,
        }
    }

    /// A valid DTE with translation enabled, full permissions, and these tables.
    pub fn dte(&self, domain_id: u16) -> DeviceTableEntry {
        DeviceTableEntry::default()
            .with_quad0(
                DteQuad0(0)
                    .with_valid(true)
                    .with_translation_valid(true)
                    .with_mode(self.mode)
                    .with_page_table_root(self.root >> 12)
                    .with_read_permission(true)
                    .with_write_permission(true),
            )
            .with_quad1(DteQuad1(0).with_domain_id(domain_id))
    }

    pub fn map_page(&mut self, iova: u64, address: u64, permissions: Permissions) {
        self.map_level(iova, address, 0, permissions);
    }

    /// Maps a page of the size of a `level` entry with a single leaf entry.
    pub fn map_level(&mut self, iova: u64, address: u64, level: u8, permissions: Permissions) {
        let entry = leaf(address, permissions);
        self.set_entry(iova, level, entry);
    }

    /// Maps `size` bytes with a run of contiguous entries at the largest level that fits.
    pub fn map_large(&mut self, iova: u64, address: u64, size: u64, permissions: Permissions) {
        let mut level = 0;
        while level + 1 < self.mode && level_page_size(level + 1) <= size {
            level += 1;
        }

        let encoded = address | (((size >> 1) - 1) & !0xfff);
        let entry = leaf(encoded, permissions).with_next_level(7);

        let step = level_page_size(level);
        for i in 0..size / step {
            self.set_entry(iova + i * step, level, entry);
        }
    }

    /// Clears the `level` entry covering `iova`.
    pub fn unmap(&mut self, iova: u64, level: u8) {
        self.set_entry(iova, level, Pte(0));
    }

    /// Writes the `level` entry covering `iova`, creating intermediate tables as needed.
    pub fn set_entry(&mut self, iova: u64, level: u8, entry: Pte) {
        let table = self.table_for(iova, level);
        self.ram
            .write_le_u64(table + index(iova, level) * 8, entry.0)
            .unwrap();
    }

    fn table_for(&mut self, iova: u64, level: u8) -> u64 {
        let mut table = self.root;

        for current in ((level + 1)..self.mode).rev() {
            let address = table + index(iova, current) * 8;
            let entry = Pte(self.ram.read_le_u64(address).unwrap());

            table = if entry.present() && matches!(entry.next_level(), 1..=6) {
                entry.address() << 12
            } else {
                let next = self.next_table;
                self.next_table += 0x1000;

                let pointer = Pte(0)
                    .with_present(true)
                    .with_next_level(current)
                    .with_address(next >> 12)
                    .with_read_permission(true)
                    .with_write_permission(true);
                self.ram.write_le_u64(address, pointer.0).unwrap();

                next
            };
        }

        table
    }
}

fn index(iova: u64, level: u8) -> u64 {
    (iova >> (12 + 9 * u32::from(level))) & 0x1ff
}

fn leaf(address: u64, permissions: Permissions) -> Pte {
    Pte(address & 0x000f_ffff_ffff_f000)
        .with_present(true)
        .with_read_permission(permissions.can_read())
        .with_write_permission(permissions.can_write())
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Notification {
    Map {
        iova: u64,
        size: u64,
        translated_addr: u64,
        permissions: Permissions,
    },
    Unmap {
        iova: u64,
        size: u64,
    },
}

/// Records notifications. Clones share the same record.
#[derive(Clone, Default)]
pub(crate) struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    /// Returns and forgets everything recorded so far.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.notifications.lock().unwrap())
    }
}

impl IommuNotifier for RecordingNotifier {
    fn on_map(
        &self,
        iova: u64,
        size: u64,
        translated_addr: u64,
        permissions: Permissions,
    ) -> io::Result<()> {
        self.notifications.lock().unwrap().push(Notification::Map {
            iova,
            size,
            translated_addr,
            permissions,
        });
        Ok(())
    }

    fn on_unmap(&self, iova: u64, size: u64) -> io::Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::Unmap { iova, size });
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */
