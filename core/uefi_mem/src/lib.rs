//! UEFI Memory Services
//!
//! Page and pool allocation for a pre-OS boot environment. The physical
//! address space is tracked as a sorted memory map of typed ranges; page
//! allocations convert ranges between conventional memory and their target
//! type, and the pool allocator carves byte granularity blocks out of pages.
//!
//! All state lives in a [`SpinLockedMemoryManager`], which guards the map and
//! the pool registry behind a single TPL-aware lock.
//!
//! ## Examples
//!
//! ```ignore
//! static MEMORY_MANAGER: SpinLockedMemoryManager = SpinLockedMemoryManager::new();
//!
//! unsafe {
//!     MEMORY_MANAGER.add_memory_space(MemoryType::Conventional, base, length, DEFAULT_CACHE_ATTR)?;
//! }
//! let pages = MEMORY_MANAGER.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 4)?;
//! let buffer = MEMORY_MANAGER.allocate_pool(MemoryType::BootServicesData, 128)?;
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![no_std]

pub mod memory_type;
mod page;
mod pool;

use r_efi::efi;
use tpl_lock::TplMutex;
use uefi_base::error::EfiError;

pub use memory_type::MemoryType;
pub use page::{AllocateType, MemoryMapDescriptor, MemoryResourceInfo};
pub use pool::MAX_POOL_SIZE;

use page::MemoryMap;
use pool::PoolRegistry;

/// Returns the given error if the condition does not hold.
#[macro_export]
macro_rules! ensure {
    ($condition:expr, $err:expr) => {
        if !($condition) {
            return Err($err);
        }
    };
}

/// Returns the given error.
#[macro_export]
macro_rules! error {
    ($err:expr) => {
        return Err($err)
    };
}

/// The memory map and pool registry. Always accessed under the manager lock;
/// the raw pointers inside are what keep this from being auto-Send.
pub(crate) struct MemoryServices {
    pub(crate) map: MemoryMap,
    pub(crate) pools: PoolRegistry,
}

unsafe impl Send for MemoryServices {}

impl MemoryServices {
    const fn new() -> Self {
        Self { map: MemoryMap::new(), pools: PoolRegistry::new() }
    }
}

/// Lock guarded page and pool allocation services.
///
/// Page operations take the lock unconditionally and panic on re-entry. Pool
/// allocation only tries the lock and reports contention as
/// `OutOfResources`, so pool requests made from code that interrupted an
/// allocation fail cleanly instead of deadlocking.
pub struct SpinLockedMemoryManager {
    inner: TplMutex<MemoryServices>,
}

impl SpinLockedMemoryManager {
    pub const fn new() -> Self {
        Self { inner: TplMutex::new(efi::TPL_NOTIFY, MemoryServices::new(), "MemoryLock") }
    }

    /// Seeds the manager with a range of address space. Ranges added as
    /// conventional memory become allocatable.
    ///
    /// # Safety
    ///
    /// The range must be real, exclusively owned memory; the manager writes
    /// to conventional pages in it.
    pub unsafe fn add_memory_space(
        &self,
        memory_type: MemoryType,
        base: efi::PhysicalAddress,
        length: u64,
        attributes: u64,
    ) -> Result<(), EfiError> {
        self.inner.lock().map.add_memory_space(memory_type, base, length, attributes)
    }

    /// Allocates pages of the given type. See [`AllocateType`] for address
    /// resolution strategies.
    pub fn allocate_pages(
        &self,
        allocate_type: AllocateType,
        memory_type: MemoryType,
        number_of_pages: u64,
    ) -> Result<efi::PhysicalAddress, EfiError> {
        // Geometrically impossible exact-address requests are rejected before
        // the lock is taken.
        if let AllocateType::Address(address) = allocate_type {
            ensure!(address & uefi_base::base::UEFI_PAGE_MASK as u64 == 0, EfiError::NotFound);
            let length = number_of_pages
                .checked_mul(uefi_base::base::UEFI_PAGE_SIZE as u64)
                .ok_or(EfiError::NotFound)?;
            ensure!(length != 0, EfiError::InvalidParameter);
            address.checked_add(length - 1).ok_or(EfiError::NotFound)?;
        }
        self.inner.lock().map.allocate_pages(allocate_type, memory_type, number_of_pages)
    }

    /// Returns previously allocated pages to conventional memory.
    pub fn free_pages(&self, address: efi::PhysicalAddress, number_of_pages: u64) -> Result<(), EfiError> {
        self.inner.lock().map.free_pages(address, number_of_pages)
    }

    /// Allocates `size` bytes of pool memory of the given type. The returned
    /// buffer is zeroed and 8 byte aligned.
    pub fn allocate_pool(&self, memory_type: MemoryType, size: usize) -> Result<*mut u8, EfiError> {
        ensure!(memory_type.is_allocatable(), EfiError::InvalidParameter);
        ensure!(size <= MAX_POOL_SIZE, EfiError::OutOfResources);
        let mut services = self.inner.try_lock().ok_or(EfiError::OutOfResources)?;
        services.allocate_pool_i(memory_type, size)
    }

    /// Frees a buffer previously returned by [`Self::allocate_pool`].
    pub fn free_pool(&self, buffer: *mut u8) -> Result<(), EfiError> {
        self.inner.lock().free_pool_i(buffer).map(|_| ())
    }

    /// Reports the address window and derived free space for a builtin type.
    pub fn get_memory_resource_info(&self, memory_type: MemoryType) -> Result<MemoryResourceInfo, EfiError> {
        self.inner.lock().map.get_memory_resource_info(memory_type)
    }

    /// Confines future allocations of a builtin type to `[base, maximum]`.
    pub fn configure_type_window(
        &self,
        memory_type: MemoryType,
        base_address: efi::PhysicalAddress,
        maximum_address: efi::PhysicalAddress,
    ) -> Result<(), EfiError> {
        self.inner.lock().map.configure_type_window(memory_type, base_address, maximum_address)
    }

    /// The key identifying the current revision of the memory map. Changes on
    /// every map mutation.
    pub fn memory_map_key(&self) -> u64 {
        self.inner.lock().map.map_key()
    }

    /// Number of descriptors [`Self::get_memory_map`] will produce.
    pub fn memory_descriptor_count(&self) -> usize {
        self.inner.lock().map.descriptor_count()
    }

    /// Copies the current memory map into the caller's buffer and returns the
    /// number of descriptors written.
    pub fn get_memory_map(&self, descriptors: &mut [MemoryMapDescriptor]) -> Result<usize, EfiError> {
        self.inner.lock().map.get_memory_map(descriptors)
    }
}

impl Default for SpinLockedMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SpinLockedMemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.inner.try_lock() {
            Some(services) => services.map.fmt(f),
            None => write!(f, "SpinLockedMemoryManager {{ <locked> }}"),
        }
    }
}


#[cfg(test)]
mod tests {
    extern crate std;

    use std::format;

    use super::*;
    use crate::tests_support::seeded_manager;
    use uefi_base::base::UEFI_PAGE_SIZE;

    #[test]
    fn manager_page_round_trip() {
        let manager = seeded_manager(0x400000);
        let address = manager.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 4).unwrap();
        manager.free_pages(address, 4).unwrap();
    }

    #[test]
    fn manager_pool_round_trip() {
        let manager = seeded_manager(0x400000);
        let buffer = manager.allocate_pool(MemoryType::BootServicesData, 128).unwrap();
        manager.free_pool(buffer).unwrap();
    }

    #[test]
    fn pool_rejects_illegal_types_and_sizes() {
        let manager = seeded_manager(0x400000);
        assert_eq!(manager.allocate_pool(MemoryType::Conventional, 16), Err(EfiError::InvalidParameter));
        assert_eq!(manager.allocate_pool(MemoryType::BootServicesData, usize::MAX), Err(EfiError::OutOfResources));
    }

    #[test]
    fn pool_contention_reports_out_of_resources() {
        let manager = seeded_manager(0x400000);
        // Hold the lock the way an interrupted allocation would.
        let _guard = manager.inner.lock();
        assert_eq!(manager.allocate_pool(MemoryType::BootServicesData, 16), Err(EfiError::OutOfResources));
    }

    #[test]
    fn exact_address_checks_precede_locking() {
        let manager = seeded_manager(0x400000);
        // Misaligned and wrapping requests fail even while the lock is held.
        let _guard = manager.inner.lock();
        assert_eq!(
            manager.allocate_pages(AllocateType::Address(0x123), MemoryType::LoaderData, 1),
            Err(EfiError::NotFound)
        );
        assert_eq!(
            manager.allocate_pages(
                AllocateType::Address(u64::MAX - (UEFI_PAGE_SIZE as u64 - 1)),
                MemoryType::LoaderData,
                2
            ),
            Err(EfiError::NotFound)
        );
    }

    #[test]
    fn map_key_is_exposed() {
        let manager = seeded_manager(0x400000);
        let key = manager.memory_map_key();
        let address = manager.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderData, 1).unwrap();
        assert!(manager.memory_map_key() > key);
        manager.free_pages(address, 1).unwrap();
    }

    #[test]
    fn debug_renders_the_map() {
        let manager = seeded_manager(0x400000);
        let rendered = format!("{manager:?}");
        assert!(rendered.contains("Conventional Memory"));
        let _guard = manager.inner.lock();
        assert!(format!("{manager:?}").contains("<locked>"));
    }
}
