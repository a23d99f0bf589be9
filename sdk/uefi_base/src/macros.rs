//! Macro definitions shared across the workspace.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Converts a size in bytes to the number of UEFI pages required.
///
/// # Example
///
/// ```rust
/// use uefi_base::base::UEFI_PAGE_SIZE;
/// use uefi_base::uefi_size_to_pages;
///
/// let size_in_bytes = UEFI_PAGE_SIZE * 3;
/// let pages = uefi_size_to_pages!(size_in_bytes);
/// assert_eq!(pages, 3);
/// ```
#[macro_export]
macro_rules! uefi_size_to_pages {
    ($size:expr) => {
        (($size) + $crate::base::UEFI_PAGE_MASK) / $crate::base::UEFI_PAGE_SIZE
    };
}

/// Converts a number of UEFI pages to the corresponding size in bytes.
///
/// # Example
///
/// ```rust
/// use uefi_base::base::UEFI_PAGE_SIZE;
/// use uefi_base::uefi_pages_to_size;
///
/// let pages = 3;
/// let size_in_bytes = uefi_pages_to_size!(pages);
/// assert_eq!(size_in_bytes, 3 * UEFI_PAGE_SIZE);
/// ```
#[macro_export]
macro_rules! uefi_pages_to_size {
    ($pages:expr) => {
        ($pages) * $crate::base::UEFI_PAGE_SIZE
    };
}
