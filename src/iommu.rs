// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug};
use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;

use bitflags::bitflags;

use crate::regions::Permissions;

/* ---------------------------------------------------------------------------------------------- */

/// Observer of the mappings of one device's address space, for consumers that need real host-side
/// mappings rather than translations on demand (for instance, a passthrough device's host IOMMU).
///
/// Every range passed to [`IommuNotifier::on_unmap`] was either passed to
/// [`IommuNotifier::on_map`] before with the same `iova` and `size`, or is a naturally aligned
/// chunk of the notifier's registered range. Sizes are powers of two no larger than `1 << 63`.
pub trait IommuNotifier: Send + Sync {
    /// `[iova, iova + size)` is now mapped to `[translated_addr, translated_addr + size)`.
    ///
    /// If this fails, the range isn't considered mapped and will be offered again on the next
    /// synchronization.
    fn on_map(
        &self,
        iova: u64,
        size: u64,
        translated_addr: u64,
        permissions: Permissions,
    ) -> io::Result<()>;

    /// `[iova, iova + size)` is no longer mapped.
    fn on_unmap(&self, iova: u64, size: u64) -> io::Result<()>;
}

bitflags! {
    /// Which notifications an [`IommuNotifier`] wants.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct NotifierFlags: u8 {
        /// Invalidations and removed mappings.
        const UNMAP = 1 << 0;
        /// New mappings. Always comes with `UNMAP`.
        const MAP = 1 << 1;
    }
}

impl NotifierFlags {
    /// `MAP` implies `UNMAP`.
    pub fn normalized(self) -> NotifierFlags {
        if self.contains(NotifierFlags::MAP) {
            self | NotifierFlags::UNMAP
        } else {
            self
        }
    }
}

/// Handle returned by [`AmdVi::register_notifier`](crate::unit::AmdVi::register_notifier).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NotifierId(pub(crate) u64);

impl fmt::Display for NotifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A registered notifier and what it asked for.
#[derive(Clone)]
pub(crate) struct NotifierRegistration {
    pub id: NotifierId,
    pub flags: NotifierFlags,
    pub range: RangeInclusive<u64>,
    pub notifier: Arc<dyn IommuNotifier>,
}

impl NotifierRegistration {
    pub fn wants_map(&self) -> bool {
        self.flags.contains(NotifierFlags::MAP)
    }

    /// Whether `[iova, last]` intersects the registered range.
    pub fn overlaps(&self, iova: u64, last: u64) -> bool {
        iova <= *self.range.end() && last >= *self.range.start()
    }
}

impl Debug for NotifierRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierRegistration")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("range", &self.range)
            .finish()
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Splits `[start, last]` into the largest naturally aligned power-of-two chunks, none larger than
/// `1 << 63`. Returns `(iova, size)` pairs.
pub(crate) fn aligned_chunks(start: u64, last: u64) -> Vec<(u64, u64)> {
    const MAX_CHUNK: u128 = 1 << 63;

    let mut chunks = Vec::new();
    let mut iova = u128::from(start);
    let end = u128::from(last) + 1;

    while iova < end {
        let alignment = if iova == 0 {
            MAX_CHUNK
        } else {
            (1u128 << iova.trailing_zeros()).min(MAX_CHUNK)
        };

        let remaining = end - iova;
        let fits = 1u128 << (127 - remaining.leading_zeros());

        let size = alignment.min(fits);
        chunks.push((iova as u64, size as u64));
        iova += size;
    }

    chunks
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
