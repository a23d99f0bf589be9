//! Memory Type definitions
//!
//! Closed representation of the UEFI memory type space, including the OEM and
//! OS reserved ranges, along with the per-type allocation policy used by the
//! page and pool allocators.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;
use uefi_base::{base::SIZE_4KB, error::EfiError};

/// Start of the OEM reserved memory type range.
pub const OEM_RESERVED_MEMORY_TYPE_MIN: u32 = 0x7000_0000;
/// End of the OEM reserved memory type range (inclusive).
pub const OEM_RESERVED_MEMORY_TYPE_MAX: u32 = 0x7FFF_FFFF;
/// Start of the OS reserved memory type range.
pub const OS_RESERVED_MEMORY_TYPE_MIN: u32 = 0x8000_0000;

/// Number of builtin (non-reserved-range) memory types.
pub const NUM_BUILTIN_MEMORY_TYPES: usize = 16;

/// Builtin memory types indexed by their raw UEFI encoding, which is also
/// their statistics table slot.
pub(crate) const BUILTIN_MEMORY_TYPES: [MemoryType; NUM_BUILTIN_MEMORY_TYPES] = [
    MemoryType::Reserved,
    MemoryType::LoaderCode,
    MemoryType::LoaderData,
    MemoryType::BootServicesCode,
    MemoryType::BootServicesData,
    MemoryType::RuntimeServicesCode,
    MemoryType::RuntimeServicesData,
    MemoryType::Conventional,
    MemoryType::Unusable,
    MemoryType::AcpiReclaim,
    MemoryType::AcpiNvs,
    MemoryType::Mmio,
    MemoryType::MmioPortSpace,
    MemoryType::PalCode,
    MemoryType::Persistent,
    MemoryType::Unaccepted,
];

pub(crate) const DEFAULT_PAGE_ALLOCATION_GRANULARITY: usize = SIZE_4KB;

// Per the UEFI spec, AARCH64 runtime pages need to be allocated on 64KB boundaries in units of 64KB to accommodate
// OSes that use 16KB or 64KB page sizes. Other architectures use 4KB pages, so we don't have any additional
// granularity requirements for them.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub(crate) const RUNTIME_PAGE_ALLOCATION_GRANULARITY: usize = uefi_base::base::SIZE_64KB;
    } else {
        pub(crate) const RUNTIME_PAGE_ALLOCATION_GRANULARITY: usize = DEFAULT_PAGE_ALLOCATION_GRANULARITY;
    }
}

/// The semantic type of a memory range or allocation.
///
/// The raw UEFI encoding leaves `16..=0x6FFFFFFF` undefined; values in that
/// gap are rejected on conversion rather than carried as an escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Reserved,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    RuntimeServicesCode,
    RuntimeServicesData,
    Conventional,
    Unusable,
    AcpiReclaim,
    AcpiNvs,
    Mmio,
    MmioPortSpace,
    PalCode,
    Persistent,
    Unaccepted,
    /// OEM defined type in `[0x70000000, 0x7FFFFFFF]`.
    OemReserved(u32),
    /// OS defined type in `[0x80000000, 0xFFFFFFFF]`.
    OsReserved(u32),
}

impl TryFrom<efi::MemoryType> for MemoryType {
    type Error = EfiError;

    fn try_from(value: efi::MemoryType) -> Result<Self, Self::Error> {
        match value {
            efi::RESERVED_MEMORY_TYPE => Ok(MemoryType::Reserved),
            efi::LOADER_CODE => Ok(MemoryType::LoaderCode),
            efi::LOADER_DATA => Ok(MemoryType::LoaderData),
            efi::BOOT_SERVICES_CODE => Ok(MemoryType::BootServicesCode),
            efi::BOOT_SERVICES_DATA => Ok(MemoryType::BootServicesData),
            efi::RUNTIME_SERVICES_CODE => Ok(MemoryType::RuntimeServicesCode),
            efi::RUNTIME_SERVICES_DATA => Ok(MemoryType::RuntimeServicesData),
            efi::CONVENTIONAL_MEMORY => Ok(MemoryType::Conventional),
            efi::UNUSABLE_MEMORY => Ok(MemoryType::Unusable),
            efi::ACPI_RECLAIM_MEMORY => Ok(MemoryType::AcpiReclaim),
            efi::ACPI_MEMORY_NVS => Ok(MemoryType::AcpiNvs),
            efi::MEMORY_MAPPED_IO => Ok(MemoryType::Mmio),
            efi::MEMORY_MAPPED_IO_PORT_SPACE => Ok(MemoryType::MmioPortSpace),
            efi::PAL_CODE => Ok(MemoryType::PalCode),
            efi::PERSISTENT_MEMORY => Ok(MemoryType::Persistent),
            efi::UNACCEPTED_MEMORY_TYPE => Ok(MemoryType::Unaccepted),
            OEM_RESERVED_MEMORY_TYPE_MIN..=OEM_RESERVED_MEMORY_TYPE_MAX => Ok(MemoryType::OemReserved(value)),
            OS_RESERVED_MEMORY_TYPE_MIN..=u32::MAX => Ok(MemoryType::OsReserved(value)),
            // Memory types in the [EfiMaxMemoryType, 0x6FFFFFFF] gap are illegal.
            _ => Err(EfiError::InvalidParameter),
        }
    }
}

impl From<MemoryType> for efi::MemoryType {
    fn from(value: MemoryType) -> efi::MemoryType {
        match value {
            MemoryType::Reserved => efi::RESERVED_MEMORY_TYPE,
            MemoryType::LoaderCode => efi::LOADER_CODE,
            MemoryType::LoaderData => efi::LOADER_DATA,
            MemoryType::BootServicesCode => efi::BOOT_SERVICES_CODE,
            MemoryType::BootServicesData => efi::BOOT_SERVICES_DATA,
            MemoryType::RuntimeServicesCode => efi::RUNTIME_SERVICES_CODE,
            MemoryType::RuntimeServicesData => efi::RUNTIME_SERVICES_DATA,
            MemoryType::Conventional => efi::CONVENTIONAL_MEMORY,
            MemoryType::Unusable => efi::UNUSABLE_MEMORY,
            MemoryType::AcpiReclaim => efi::ACPI_RECLAIM_MEMORY,
            MemoryType::AcpiNvs => efi::ACPI_MEMORY_NVS,
            MemoryType::Mmio => efi::MEMORY_MAPPED_IO,
            MemoryType::MmioPortSpace => efi::MEMORY_MAPPED_IO_PORT_SPACE,
            MemoryType::PalCode => efi::PAL_CODE,
            MemoryType::Persistent => efi::PERSISTENT_MEMORY,
            MemoryType::Unaccepted => efi::UNACCEPTED_MEMORY_TYPE,
            MemoryType::OemReserved(value) => value,
            MemoryType::OsReserved(value) => value,
        }
    }
}

impl MemoryType {
    /// Returns the statistics table index for builtin types, or None for the
    /// OEM and OS reserved ranges (which carry no statistics window).
    pub(crate) fn statistics_index(&self) -> Option<usize> {
        match self {
            MemoryType::OemReserved(_) | MemoryType::OsReserved(_) => None,
            _ => Some(efi::MemoryType::from(*self) as usize),
        }
    }

    /// Indicates whether allocations of this type persist into the OS runtime.
    pub const fn is_runtime(&self) -> bool {
        matches!(
            self,
            MemoryType::Reserved
                | MemoryType::RuntimeServicesCode
                | MemoryType::RuntimeServicesData
                | MemoryType::AcpiNvs
                | MemoryType::PalCode
        )
    }

    /// Indicates whether this type's pages are released when boot services end.
    pub const fn is_special(&self) -> bool {
        matches!(
            self,
            MemoryType::LoaderCode
                | MemoryType::LoaderData
                | MemoryType::BootServicesCode
                | MemoryType::BootServicesData
                | MemoryType::AcpiReclaim
        )
    }

    /// The alignment and rounding unit for page allocations of this type.
    pub fn page_allocation_granularity(&self) -> usize {
        match self {
            MemoryType::AcpiReclaim
            | MemoryType::AcpiNvs
            | MemoryType::RuntimeServicesCode
            | MemoryType::RuntimeServicesData => RUNTIME_PAGE_ALLOCATION_GRANULARITY,
            _ => DEFAULT_PAGE_ALLOCATION_GRANULARITY,
        }
    }

    /// Indicates whether this type may be requested through the allocation entry
    /// points. Conventional, persistent, and unaccepted memory are tracked in
    /// the map but cannot be the target of an allocation.
    pub fn is_allocatable(&self) -> bool {
        !matches!(self, MemoryType::Conventional | MemoryType::Persistent | MemoryType::Unaccepted)
    }
}

impl core::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let string = match self {
            MemoryType::Reserved => "Reserved Memory",
            MemoryType::LoaderCode => "Loader Code",
            MemoryType::LoaderData => "Loader Data",
            MemoryType::BootServicesCode => "BootServicesCode",
            MemoryType::BootServicesData => "BootServicesData",
            MemoryType::RuntimeServicesCode => "RuntimeServicesCode",
            MemoryType::RuntimeServicesData => "RuntimeServicesData",
            MemoryType::Conventional => "Conventional Memory",
            MemoryType::Unusable => "Unusable Memory",
            MemoryType::AcpiReclaim => "ACPI Reclaim Memory",
            MemoryType::AcpiNvs => "ACPI Memory NVS",
            MemoryType::Mmio => "Memory Mapped IO",
            MemoryType::MmioPortSpace => "Memory Mapped IO Port Space",
            MemoryType::PalCode => "PAL Code",
            MemoryType::Persistent => "Persistent Memory",
            MemoryType::Unaccepted => "Unaccepted Memory",
            MemoryType::OemReserved(value) => return write!(f, "OEM Reserved Memory ({value:#x})"),
            MemoryType::OsReserved(value) => return write!(f, "OS Reserved Memory ({value:#x})"),
        };
        write!(f, "{string}")
    }
}
