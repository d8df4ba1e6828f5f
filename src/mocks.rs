// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::io;

use mockall::mock;

use crate::device::PciHost;
use crate::interrupts::MsiMessage;
use crate::iommu::IommuNotifier;
use crate::regions::{GuestMemory, Permissions};

/* ---------------------------------------------------------------------------------------------- */

mock! {
    /// Guest memory whose every access is an expectation, for exercising failure paths that
    /// [`GuestRam`](crate::regions::GuestRam) can't reach.
    #[derive(Debug)]
    pub GuestMemory {}

    impl GuestMemory for GuestMemory {
        fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> io::Result<()>;
        fn write_bytes(&self, address: u64, data: &[u8]) -> io::Result<()>;
    }
}

mock! {
    #[derive(Debug)]
    pub PciHost {}

    impl PciHost for PciHost {
        fn notify_msi(&self);
        fn signal_target_abort(&self);
        fn deliver_msi(&self, message: MsiMessage);
    }
}

mock! {
    #[derive(Debug)]
    pub IommuNotifier {}

    impl IommuNotifier for IommuNotifier {
        fn on_map(
            &self,
            iova: u64,
            size: u64,
            translated_addr: u64,
            permissions: Permissions,
        ) -> io::Result<()>;
        fn on_unmap(&self, iova: u64, size: u64) -> io::Result<()>;
    }
}

/* ---------------------------------------------------------------------------------------------- */
