//! Memory Map and Page Allocator
//!
//! Tracks the physical address space as a sorted, doubly linked list of typed
//! ranges and services page granularity allocation requests against it.
//! Adjacent ranges of the same type and attribute are merged eagerly, so the
//! map never contains two mergeable neighbors.
//!
//! Map entries have a bootstrapping problem: inserting an entry may require
//! new entry storage, and obtaining that storage allocates pages, which
//! re-enters the code doing the insertion. New entries therefore start life
//! on a small fixed stack and are migrated to page-backed slab storage by a
//! flush step that runs only when no insertion is in progress.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::ptr::NonNull;

use r_efi::efi;
use uefi_base::{
    base::{align_down, UEFI_PAGE_MASK, UEFI_PAGE_SHIFT, UEFI_PAGE_SIZE},
    error::EfiError,
};

use crate::{
    ensure, error,
    memory_type::{MemoryType, BUILTIN_MEMORY_TYPES, NUM_BUILTIN_MEMORY_TYPES},
};

/// Bound on entries awaiting migration to slab storage. Range insertion
/// recursion is shallow (an insertion can trigger at most one slab page
/// allocation, which inserts a bounded number of ranges itself), so
/// exceeding this depth means the map logic is broken.
const MAP_STACK_DEPTH: usize = 8;

/// Bound on slab pages used for map entry storage.
const MAP_ENTRY_SLABS: usize = 64;

const ENTRY_SLOT_SIZE: usize = core::mem::size_of::<MapEntry>();
const SLOTS_PER_SLAB: usize = UEFI_PAGE_SIZE / ENTRY_SLOT_SIZE;

/// Identifies a map entry by its storage location. The variant doubles as
/// the entry's provenance: `Stack` entries are awaiting flush, `Slab`
/// entries live in page-backed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryHandle {
    Stack(usize),
    Slab { slab: u16, slot: u16 },
}

/// One contiguous range of homogeneously typed and attributed address space.
#[derive(Debug, Clone, Copy)]
struct MapEntry {
    memory_type: MemoryType,
    start: efi::PhysicalAddress,
    /// Inclusive end address of the range.
    end: efi::PhysicalAddress,
    attribute: u64,
    prev: Option<EntryHandle>,
    next: Option<EntryHandle>,
    linked: bool,
}

const EMPTY_ENTRY: MapEntry = MapEntry {
    memory_type: MemoryType::Conventional,
    start: 0,
    end: 0,
    attribute: 0,
    prev: None,
    next: None,
    linked: false,
};

/// Allocation accounting and the preferred address window for one builtin
/// memory type.
#[derive(Debug, Clone, Copy)]
pub struct MemoryTypeStatistics {
    /// Lowest address allocations of this type should occupy.
    pub base_address: efi::PhysicalAddress,
    /// Highest address allocations of this type should occupy (inclusive).
    pub maximum_address: efi::PhysicalAddress,
    /// Pages currently charged to this type within its window.
    pub current_pages: u64,
    /// Pages ever designated for this type within its window.
    pub total_pages: u64,
    /// Pages of this type are released when boot services end.
    pub special: bool,
    /// Pages of this type persist into the OS runtime.
    pub runtime: bool,
}

const DEFAULT_STATISTICS: MemoryTypeStatistics = MemoryTypeStatistics {
    base_address: 0,
    maximum_address: efi::PhysicalAddress::MAX,
    current_pages: 0,
    total_pages: 0,
    special: false,
    runtime: false,
};

const fn default_statistics() -> [MemoryTypeStatistics; NUM_BUILTIN_MEMORY_TYPES] {
    let mut statistics = [DEFAULT_STATISTICS; NUM_BUILTIN_MEMORY_TYPES];
    let mut index = 0;
    while index < NUM_BUILTIN_MEMORY_TYPES {
        let memory_type = BUILTIN_MEMORY_TYPES[index];
        statistics[index].special = memory_type.is_special();
        statistics[index].runtime = memory_type.is_runtime();
        index += 1;
    }
    statistics
}

/// Strategy for resolving the base address of a page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateType {
    /// Any free range large enough, searched top down.
    AnyPages,
    /// Any free range large enough entirely below the given address.
    MaxAddress(efi::PhysicalAddress),
    /// Exactly the given address.
    Address(efi::PhysicalAddress),
}

/// A snapshot of one memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapDescriptor {
    pub memory_type: MemoryType,
    pub physical_start: efi::PhysicalAddress,
    pub number_of_pages: u64,
    pub attribute: u64,
}

/// Address window and derived free space for one memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryResourceInfo {
    pub base_address: efi::PhysicalAddress,
    /// `end_address` less the bytes currently mapped to the type. Computed
    /// by an O(map) scan; approximate under fragmentation.
    pub free_address: efi::PhysicalAddress,
    pub end_address: efi::PhysicalAddress,
}

/// The global memory map and page allocation state.
pub(crate) struct MemoryMap {
    head: Option<EntryHandle>,
    map_key: u64,
    maximum_address: efi::PhysicalAddress,
    descriptor_count: usize,
    statistics: [MemoryTypeStatistics; NUM_BUILTIN_MEMORY_TYPES],
    map_stack: [MapEntry; MAP_STACK_DEPTH],
    map_depth: usize,
    flushing: bool,
    slabs: [Option<NonNull<u8>>; MAP_ENTRY_SLABS],
    slab_count: usize,
    free_slots: Option<EntryHandle>,
}

impl MemoryMap {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            map_key: 0,
            maximum_address: 0,
            descriptor_count: 0,
            statistics: default_statistics(),
            map_stack: [EMPTY_ENTRY; MAP_STACK_DEPTH],
            map_depth: 0,
            flushing: false,
            slabs: [None; MAP_ENTRY_SLABS],
            slab_count: 0,
            free_slots: None,
        }
    }

    // Entry storage access. Entries are Copy; they are read out, modified,
    // and written back rather than referenced in place.

    fn slot_ptr(&self, slab: u16, slot: u16) -> *mut MapEntry {
        let base = match self.slabs[slab as usize] {
            Some(base) => base.as_ptr(),
            None => panic!("map entry slab {slab} is not present"),
        };
        unsafe { base.add(slot as usize * ENTRY_SLOT_SIZE) as *mut MapEntry }
    }

    fn entry(&self, handle: EntryHandle) -> MapEntry {
        match handle {
            EntryHandle::Stack(index) => self.map_stack[index],
            EntryHandle::Slab { slab, slot } => unsafe { self.slot_ptr(slab, slot).read() },
        }
    }

    fn set_entry(&mut self, handle: EntryHandle, entry: MapEntry) {
        match handle {
            EntryHandle::Stack(index) => self.map_stack[index] = entry,
            EntryHandle::Slab { slab, slot } => unsafe { self.slot_ptr(slab, slot).write(entry) },
        }
    }

    // List maintenance. The list is kept sorted by start address.

    fn link_sorted(&mut self, handle: EntryHandle) {
        let mut entry = self.entry(handle);
        let mut prev: Option<EntryHandle> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let current_entry = self.entry(current);
            if current_entry.start > entry.start {
                break;
            }
            prev = Some(current);
            cursor = current_entry.next;
        }
        entry.prev = prev;
        entry.next = cursor;
        entry.linked = true;
        self.set_entry(handle, entry);
        match prev {
            Some(prev) => {
                let mut prev_entry = self.entry(prev);
                prev_entry.next = Some(handle);
                self.set_entry(prev, prev_entry);
            }
            None => self.head = Some(handle),
        }
        if let Some(next) = cursor {
            let mut next_entry = self.entry(next);
            next_entry.prev = Some(handle);
            self.set_entry(next, next_entry);
        }
        self.descriptor_count += 1;
    }

    fn unlink(&mut self, handle: EntryHandle) {
        let mut entry = self.entry(handle);
        debug_assert!(entry.linked);
        match entry.prev {
            Some(prev) => {
                let mut prev_entry = self.entry(prev);
                prev_entry.next = entry.next;
                self.set_entry(prev, prev_entry);
            }
            None => self.head = entry.next,
        }
        if let Some(next) = entry.next {
            let mut next_entry = self.entry(next);
            next_entry.prev = entry.prev;
            self.set_entry(next, next_entry);
        }
        entry.prev = None;
        entry.next = None;
        entry.linked = false;
        self.set_entry(handle, entry);
        self.descriptor_count -= 1;
    }

    // Removes an entry from the map and recycles its storage. Stack entries
    // keep their slot until the next flush discards them.
    fn remove_entry(&mut self, handle: EntryHandle) {
        self.unlink(handle);
        if let EntryHandle::Slab { .. } = handle {
            self.release_slot(handle);
        }
    }

    fn covering_entry(&self, address: efi::PhysicalAddress) -> Option<EntryHandle> {
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let entry = self.entry(handle);
            if entry.start > address {
                return None;
            }
            if address <= entry.end {
                return Some(handle);
            }
            cursor = entry.next;
        }
        None
    }

    // Entry slot recycling. Free slots are chained through their own `next`
    // field; the chain is replenished one page at a time from boot services
    // data pages allocated out of the map itself.

    fn release_slot(&mut self, handle: EntryHandle) {
        let mut entry = EMPTY_ENTRY;
        entry.next = self.free_slots;
        self.set_entry(handle, entry);
        self.free_slots = Some(handle);
    }

    fn allocate_map_entry(&mut self) -> Option<EntryHandle> {
        if self.free_slots.is_none() {
            self.grow_entry_storage();
        }
        let handle = self.free_slots?;
        let entry = self.entry(handle);
        self.free_slots = entry.next;
        Some(handle)
    }

    fn grow_entry_storage(&mut self) {
        if self.slab_count >= MAP_ENTRY_SLABS {
            log::error!("memory map entry slab table exhausted");
            debug_assert!(false, "memory map entry slab table exhausted");
            return;
        }
        let Some(base) = self.find_free_pages(self.maximum_address, 1, MemoryType::BootServicesData, UEFI_PAGE_SIZE as u64)
        else {
            return;
        };
        // This conversion re-enters add_range; the new range lands on the map
        // stack and is picked up by the in-progress flush.
        if self.convert_pages(base, 1, Some(MemoryType::BootServicesData), None).is_err() {
            return;
        }
        let Some(base) = NonNull::new(base as *mut u8) else {
            return;
        };
        let slab = self.slab_count as u16;
        self.slabs[self.slab_count] = Some(base);
        self.slab_count += 1;
        for slot in 0..SLOTS_PER_SLAB as u16 {
            self.release_slot(EntryHandle::Slab { slab, slot });
        }
    }

    /// Migrates every entry on the map stack into slab storage.
    ///
    /// Idempotent and guarded: the slab page allocation inside this routine
    /// re-enters `add_range`, whose flush call must not recurse. If storage
    /// cannot be grown, entries stay on the stack for a later flush.
    fn flush_map_stack(&mut self) {
        if self.flushing {
            return;
        }
        self.flushing = true;
        while self.map_depth != 0 {
            let Some(slot) = self.allocate_map_entry() else {
                break;
            };
            self.map_depth -= 1;
            let stacked = self.map_stack[self.map_depth];
            if stacked.linked {
                // Replace the stack entry with the slab copy at the same list
                // position; the list stays sorted.
                self.set_entry(slot, stacked);
                match stacked.prev {
                    Some(prev) => {
                        let mut prev_entry = self.entry(prev);
                        prev_entry.next = Some(slot);
                        self.set_entry(prev, prev_entry);
                    }
                    None => self.head = Some(slot),
                }
                if let Some(next) = stacked.next {
                    let mut next_entry = self.entry(next);
                    next_entry.prev = Some(slot);
                    self.set_entry(next, next_entry);
                }
                self.map_stack[self.map_depth].linked = false;
            } else {
                // The entry was removed from the map before the flush ran.
                self.release_slot(slot);
            }
        }
        self.flushing = false;
    }

    /// Adds `[start, end]` to the map, eagerly merging any same-type,
    /// same-attribute neighbor it touches. The caller must hold the lock and
    /// must eventually flush the map stack.
    fn add_range(
        &mut self,
        memory_type: MemoryType,
        start: efi::PhysicalAddress,
        end: efi::PhysicalAddress,
        attribute: u64,
    ) {
        debug_assert_eq!(start & UEFI_PAGE_MASK as u64, 0);
        debug_assert!(end > start);

        log::trace!(target: "allocations", "AddRange: {start:#x}-{end:#x} as {memory_type}");

        // The page at address 0 stays zeroed whenever it is tracked as
        // conventional memory, so that stray null dereferences read zeros and
        // legacy consumers of low memory see a clean page.
        if start == 0 && memory_type == MemoryType::Conventional {
            unsafe { core::ptr::write_bytes(start as *mut u8, 0, UEFI_PAGE_SIZE) };
        }

        self.map_key += 1;

        let mut start = start;
        let mut end = end;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let entry = self.entry(handle);
            cursor = entry.next;
            if entry.memory_type != memory_type || entry.attribute != attribute {
                continue;
            }
            if entry.end.wrapping_add(1) == start {
                start = entry.start;
                self.remove_entry(handle);
            } else if entry.start == end.wrapping_add(1) {
                end = entry.end;
                self.remove_entry(handle);
            }
        }

        assert!(self.map_depth < MAP_STACK_DEPTH, "memory map stack overflow");
        let index = self.map_depth;
        self.map_depth += 1;
        self.map_stack[index] =
            MapEntry { memory_type, start, end, attribute, prev: None, next: None, linked: false };
        self.link_sorted(EntryHandle::Stack(index));
    }

    /// Converts the type or the attributes (exactly one) of a page range that
    /// is already fully covered by map entries.
    ///
    /// The conversion proceeds one covering entry at a time and is not
    /// transactional: if coverage runs out partway, the sub-ranges already
    /// converted stay converted and `NotFound` is returned.
    pub(crate) fn convert_pages(
        &mut self,
        start: efi::PhysicalAddress,
        number_of_pages: u64,
        new_type: Option<MemoryType>,
        new_attributes: Option<u64>,
    ) -> Result<(), EfiError> {
        ensure!(new_type.is_some() != new_attributes.is_some(), EfiError::InvalidParameter);
        ensure!(number_of_pages != 0, EfiError::InvalidParameter);
        ensure!(start & UEFI_PAGE_MASK as u64 == 0, EfiError::InvalidParameter);
        let length = number_of_pages.checked_mul(UEFI_PAGE_SIZE as u64).ok_or(EfiError::InvalidParameter)?;
        let end = start.checked_add(length - 1).ok_or(EfiError::InvalidParameter)?;

        let mut cursor_start = start;
        loop {
            let Some(handle) = self.covering_entry(cursor_start) else {
                log::error!("ConvertPages: no covering entry for {cursor_start:#x}");
                error!(EfiError::NotFound);
            };
            let entry = self.entry(handle);
            let range_end = core::cmp::min(end, entry.end);

            if let Some(new_type) = new_type {
                if entry.memory_type != MemoryType::Conventional && new_type != MemoryType::Conventional {
                    log::error!(
                        "ConvertPages: incompatible conversion from {} to {} at {cursor_start:#x}",
                        entry.memory_type,
                        new_type
                    );
                    error!(EfiError::NotFound);
                }
            }

            log::trace!(
                target: "allocations",
                "ConvertRange: {cursor_start:#x}-{range_end:#x} from {} in entry {:#x}-{:#x}",
                entry.memory_type,
                entry.start,
                entry.end
            );

            // Pull the converted sub-range out of the covering entry.
            let mut clipped = entry;
            if entry.start == cursor_start {
                clipped.start = range_end.wrapping_add(1);
                self.set_entry(handle, clipped);
                if clipped.start > clipped.end || clipped.start == 0 {
                    self.remove_entry(handle);
                }
            } else if entry.end == range_end {
                clipped.end = cursor_start - 1;
                self.set_entry(handle, clipped);
            } else {
                // Interior sub-range; the right remainder becomes a new stack
                // entry inheriting the original type and attributes.
                assert!(self.map_depth < MAP_STACK_DEPTH, "memory map stack overflow");
                let index = self.map_depth;
                self.map_depth += 1;
                self.map_stack[index] = MapEntry {
                    memory_type: entry.memory_type,
                    start: range_end + 1,
                    end: entry.end,
                    attribute: entry.attribute,
                    prev: None,
                    next: None,
                    linked: false,
                };
                clipped.end = cursor_start - 1;
                self.set_entry(handle, clipped);
                self.link_sorted(EntryHandle::Stack(index));
            }

            let converted_pages = ((range_end - cursor_start) >> UEFI_PAGE_SHIFT) + 1;
            if let Some(new_type) = new_type {
                if let Some(index) = entry.memory_type.statistics_index() {
                    let statistics = &mut self.statistics[index];
                    if cursor_start >= statistics.base_address && cursor_start <= statistics.maximum_address {
                        statistics.current_pages = statistics.current_pages.saturating_sub(converted_pages);
                    }
                }
                if let Some(index) = new_type.statistics_index() {
                    let statistics = &mut self.statistics[index];
                    if cursor_start >= statistics.base_address && cursor_start <= statistics.maximum_address {
                        statistics.current_pages += converted_pages;
                        statistics.total_pages += converted_pages;
                    }
                }
            }

            let final_type = new_type.unwrap_or(entry.memory_type);
            let final_attribute = new_attributes.unwrap_or(entry.attribute);
            self.add_range(final_type, cursor_start, range_end, final_attribute);

            if new_type == Some(MemoryType::Conventional) {
                // Freed memory is swept to zeros. Page 0 is never swept from
                // here; add_range has already zeroed it.
                if cursor_start == 0 {
                    if range_end >= UEFI_PAGE_SIZE as u64 {
                        let sweep_start = UEFI_PAGE_SIZE as u64;
                        unsafe {
                            core::ptr::write_bytes(
                                sweep_start as *mut u8,
                                0,
                                (range_end - sweep_start + 1) as usize,
                            )
                        };
                    }
                } else {
                    unsafe {
                        core::ptr::write_bytes(cursor_start as *mut u8, 0, (range_end - cursor_start + 1) as usize)
                    };
                }
            }

            self.flush_map_stack();

            if range_end == end {
                break;
            }
            cursor_start = range_end + 1;
        }
        Ok(())
    }

    /// Finds the highest free range that can hold `number_of_pages` below
    /// `max_address`, constrained to the preferred type's address window.
    ///
    /// There is no fallback outside the window: types with a configured
    /// window stay geographically local, and callers see out-of-resources
    /// even if free memory exists elsewhere.
    pub(crate) fn find_free_pages(
        &self,
        max_address: efi::PhysicalAddress,
        number_of_pages: u64,
        memory_type: MemoryType,
        alignment: u64,
    ) -> Option<efi::PhysicalAddress> {
        let length = number_of_pages.checked_mul(UEFI_PAGE_SIZE as u64)?;
        if length == 0 {
            return None;
        }

        let mut ceiling = core::cmp::min(max_address, self.maximum_address);
        let mut floor = 0;
        if let Some(index) = memory_type.statistics_index() {
            let statistics = &self.statistics[index];
            ceiling = core::cmp::min(ceiling, statistics.maximum_address);
            floor = statistics.base_address;
        }

        let mut best: Option<efi::PhysicalAddress> = None;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let entry = self.entry(handle);
            cursor = entry.next;
            if entry.memory_type != MemoryType::Conventional || entry.start > ceiling {
                continue;
            }
            // Clip the candidate to the ceiling and round its end down to the
            // alignment boundary; allocation grows downward from there.
            let clipped_end = core::cmp::min(entry.end, ceiling);
            let candidate_end = match clipped_end.checked_add(1) {
                Some(end_exclusive) => {
                    let Ok(aligned_end_exclusive) = align_down(end_exclusive, alignment) else {
                        return None;
                    };
                    if aligned_end_exclusive <= entry.start {
                        continue;
                    }
                    aligned_end_exclusive - 1
                }
                // 2^64 is a multiple of every power-of-two alignment, so an
                // entry reaching the top of the address space keeps its end.
                None => efi::PhysicalAddress::MAX,
            };
            if candidate_end - entry.start < length - 1 {
                continue;
            }
            let target = (candidate_end - (length - 1)) & !(alignment - 1);
            if target < floor || target < entry.start {
                continue;
            }
            if best.is_none_or(|best| target > best) {
                best = Some(target);
            }
        }
        best
    }

    /// Allocates pages of the given type. Alignment and page count widen to
    /// the type's allocation granularity.
    pub(crate) fn allocate_pages(
        &mut self,
        allocate_type: AllocateType,
        memory_type: MemoryType,
        number_of_pages: u64,
    ) -> Result<efi::PhysicalAddress, EfiError> {
        ensure!(memory_type.is_allocatable(), EfiError::InvalidParameter);
        ensure!(number_of_pages != 0, EfiError::InvalidParameter);

        let alignment = memory_type.page_allocation_granularity() as u64;
        let mut number_of_pages = number_of_pages;
        if alignment > UEFI_PAGE_SIZE as u64 {
            let granule_pages = alignment >> UEFI_PAGE_SHIFT;
            number_of_pages =
                number_of_pages.checked_add(granule_pages - 1).ok_or(EfiError::InvalidParameter)? & !(granule_pages - 1);
        }
        let length = number_of_pages.checked_mul(UEFI_PAGE_SIZE as u64).ok_or(EfiError::InvalidParameter)?;

        let start = match allocate_type {
            AllocateType::Address(address) => {
                ensure!(address & (alignment - 1) == 0, EfiError::NotFound);
                let end = address.checked_add(length - 1).ok_or(EfiError::NotFound)?;
                ensure!(end <= self.maximum_address, EfiError::NotFound);
                address
            }
            AllocateType::MaxAddress(max_address) => {
                ensure!(max_address >= length - 1, EfiError::NotFound);
                self.find_free_pages(max_address, number_of_pages, memory_type, alignment)
                    .ok_or(EfiError::OutOfResources)?
            }
            AllocateType::AnyPages => self
                .find_free_pages(self.maximum_address, number_of_pages, memory_type, alignment)
                .ok_or(EfiError::OutOfResources)?,
        };

        self.convert_pages(start, number_of_pages, Some(memory_type), None)?;
        log::trace!(target: "allocations", "AllocatePages: {number_of_pages} pages at {start:#x} as {memory_type}");
        Ok(start)
    }

    /// Returns pages to conventional memory. The covering entry's type
    /// determines the alignment rule the address must satisfy.
    pub(crate) fn free_pages(&mut self, address: efi::PhysicalAddress, number_of_pages: u64) -> Result<(), EfiError> {
        let handle = self.covering_entry(address).ok_or(EfiError::NotFound)?;
        let entry = self.entry(handle);
        ensure!(entry.memory_type != MemoryType::Conventional, EfiError::NotFound);
        ensure!(number_of_pages != 0, EfiError::InvalidParameter);

        let alignment = entry.memory_type.page_allocation_granularity() as u64;
        ensure!(address & (alignment - 1) == 0, EfiError::InvalidParameter);

        let mut number_of_pages = number_of_pages;
        if alignment > UEFI_PAGE_SIZE as u64 {
            let granule_pages = alignment >> UEFI_PAGE_SHIFT;
            number_of_pages =
                number_of_pages.checked_add(granule_pages - 1).ok_or(EfiError::InvalidParameter)? & !(granule_pages - 1);
        }

        log::trace!(target: "allocations", "FreePages: {number_of_pages} pages at {address:#x}");
        self.convert_pages(address, number_of_pages, Some(MemoryType::Conventional), None)
    }

    /// Seeds the map with a range of usable address space.
    ///
    /// # Safety
    ///
    /// The range must be real, unused memory; converted-to-conventional pages
    /// in it will be written.
    pub(crate) unsafe fn add_memory_space(
        &mut self,
        memory_type: MemoryType,
        base: efi::PhysicalAddress,
        length: u64,
        attributes: u64,
    ) -> Result<(), EfiError> {
        ensure!(length != 0, EfiError::InvalidParameter);
        ensure!(base & UEFI_PAGE_MASK as u64 == 0, EfiError::InvalidParameter);
        ensure!(length & UEFI_PAGE_MASK as u64 == 0, EfiError::InvalidParameter);
        let end = base.checked_add(length - 1).ok_or(EfiError::InvalidParameter)?;

        if end > self.maximum_address {
            self.maximum_address = end;
        }
        if let Some(index) = memory_type.statistics_index() {
            let pages = length >> UEFI_PAGE_SHIFT;
            self.statistics[index].current_pages += pages;
            self.statistics[index].total_pages += pages;
        }
        self.add_range(memory_type, base, end, attributes);
        self.flush_map_stack();
        Ok(())
    }

    /// Reports a type's address window and derived free space.
    pub(crate) fn get_memory_resource_info(&self, memory_type: MemoryType) -> Result<MemoryResourceInfo, EfiError> {
        let index = memory_type.statistics_index().ok_or(EfiError::InvalidParameter)?;
        let statistics = &self.statistics[index];
        let end_address = core::cmp::min(statistics.maximum_address, self.maximum_address);

        let mut used_bytes: u64 = 0;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let entry = self.entry(handle);
            cursor = entry.next;
            if entry.memory_type == memory_type {
                used_bytes += entry.end - entry.start + 1;
            }
        }

        Ok(MemoryResourceInfo {
            base_address: statistics.base_address,
            free_address: end_address.saturating_sub(used_bytes),
            end_address,
        })
    }

    /// Narrows the preferred address window for a builtin type. Subsequent
    /// allocations of the type are confined to `[base, maximum]`.
    pub(crate) fn configure_type_window(
        &mut self,
        memory_type: MemoryType,
        base_address: efi::PhysicalAddress,
        maximum_address: efi::PhysicalAddress,
    ) -> Result<(), EfiError> {
        let index = memory_type.statistics_index().ok_or(EfiError::InvalidParameter)?;
        ensure!(base_address <= maximum_address, EfiError::InvalidParameter);
        self.statistics[index].base_address = base_address;
        self.statistics[index].maximum_address = maximum_address;
        Ok(())
    }

    pub(crate) fn statistics(&self, memory_type: MemoryType) -> Option<&MemoryTypeStatistics> {
        memory_type.statistics_index().map(|index| &self.statistics[index])
    }

    pub(crate) fn map_key(&self) -> u64 {
        self.map_key
    }

    pub(crate) fn descriptor_count(&self) -> usize {
        self.descriptor_count
    }

    /// Copies the current map into the caller's buffer, sorted by start
    /// address. Fails with `BufferTooSmall` if the buffer cannot hold every
    /// descriptor.
    pub(crate) fn get_memory_map(&self, descriptors: &mut [MemoryMapDescriptor]) -> Result<usize, EfiError> {
        ensure!(descriptors.len() >= self.descriptor_count, EfiError::BufferTooSmall);
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let entry = self.entry(handle);
            cursor = entry.next;
            descriptors[count] = MemoryMapDescriptor {
                memory_type: entry.memory_type,
                physical_start: entry.start,
                number_of_pages: ((entry.end - entry.start) >> UEFI_PAGE_SHIFT) + 1,
                attribute: entry.attribute,
            };
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn maximum_address(&self) -> efi::PhysicalAddress {
        self.maximum_address
    }
}

impl core::fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "{:<25} {:<20} {:<16} {:<20}", "Type", "Physical Start", "Number of Pages", "Attribute")?;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let entry = self.entry(handle);
            cursor = entry.next;
            writeln!(
                f,
                "{:<25} {:<#20x} {:<#16x} {:<#20x}",
                entry.memory_type,
                entry.start,
                ((entry.end - entry.start) >> UEFI_PAGE_SHIFT) + 1,
                entry.attribute
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::alloc::{GlobalAlloc, Layout};
    use std::alloc::System;

    use super::*;
    use uefi_base::base::DEFAULT_CACHE_ATTR;

    fn backing_memory(size: usize) -> u64 {
        let layout = Layout::from_size_align(size, UEFI_PAGE_SIZE).unwrap();
        let base = unsafe { System.alloc(layout) as u64 };
        assert_ne!(base, 0);
        base
    }

    fn seeded_map(size: usize) -> (MemoryMap, u64) {
        let mut map = MemoryMap::new();
        let base = backing_memory(size);
        unsafe {
            map.add_memory_space(MemoryType::Conventional, base, size as u64, DEFAULT_CACHE_ATTR).unwrap();
        }
        (map, base)
    }

    fn descriptors(map: &MemoryMap) -> std::vec::Vec<MemoryMapDescriptor> {
        let mut buffer = std::vec![
            MemoryMapDescriptor {
                memory_type: MemoryType::Conventional,
                physical_start: 0,
                number_of_pages: 0,
                attribute: 0
            };
            map.descriptor_count()
        ];
        let count = map.get_memory_map(&mut buffer).unwrap();
        buffer.truncate(count);
        buffer
    }

    #[test]
    fn add_memory_space_creates_entries() {
        let (map, base) = seeded_map(0x100000);
        // One slab page was carved out of the top for entry storage.
        let entries = descriptors(&map);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].memory_type, MemoryType::Conventional);
        assert_eq!(entries[0].physical_start, base);
        assert_eq!(entries[0].number_of_pages, 0x100 - 1);
        assert_eq!(entries[1].memory_type, MemoryType::BootServicesData);
        assert_eq!(entries[1].number_of_pages, 1);
    }

    #[test]
    fn adjacent_same_type_ranges_coalesce() {
        let size = 0x200000;
        let mut map = MemoryMap::new();
        let base = backing_memory(size);
        unsafe {
            // Seed the two halves in separate calls; they must merge.
            map.add_memory_space(MemoryType::Conventional, base, (size / 2) as u64, DEFAULT_CACHE_ATTR).unwrap();
            map.add_memory_space(
                MemoryType::Conventional,
                base + (size / 2) as u64,
                (size / 2) as u64,
                DEFAULT_CACHE_ATTR,
            )
            .unwrap();
        }
        let entries = descriptors(&map);
        let conventional: std::vec::Vec<_> =
            entries.iter().filter(|d| d.memory_type == MemoryType::Conventional).collect();
        assert_eq!(conventional.len(), 1);
        assert_eq!(conventional[0].physical_start, base);
    }

    #[test]
    fn mismatched_attributes_do_not_coalesce() {
        let size = 0x100000;
        let mut map = MemoryMap::new();
        let base = backing_memory(size);
        unsafe {
            map.add_memory_space(MemoryType::Conventional, base, (size / 2) as u64, DEFAULT_CACHE_ATTR).unwrap();
            map.add_memory_space(MemoryType::Conventional, base + (size / 2) as u64, (size / 2) as u64, 0).unwrap();
        }
        let conventional =
            descriptors(&map).iter().filter(|d| d.memory_type == MemoryType::Conventional).count();
        assert_eq!(conventional, 2);
    }

    #[test]
    fn conservation_of_pages() {
        let size = 0x400000;
        let (mut map, _base) = seeded_map(size);
        let total_pages: u64 = descriptors(&map).iter().map(|d| d.number_of_pages).sum();
        assert_eq!(total_pages, (size / UEFI_PAGE_SIZE) as u64);

        let address = map.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderData, 5).unwrap();
        let after_alloc: u64 = descriptors(&map).iter().map(|d| d.number_of_pages).sum();
        assert_eq!(after_alloc, total_pages);

        map.free_pages(address, 5).unwrap();
        let after_free: u64 = descriptors(&map).iter().map(|d| d.number_of_pages).sum();
        assert_eq!(after_free, total_pages);
    }

    #[test]
    fn allocate_free_round_trip_restores_map() {
        let (mut map, _base) = seeded_map(0x400000);
        // Warm up entry storage so the snapshot is stable.
        let warmup = map.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 1).unwrap();
        map.free_pages(warmup, 1).unwrap();

        let before = descriptors(&map);
        let address = map.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 4).unwrap();
        assert_ne!(descriptors(&map), before);
        map.free_pages(address, 4).unwrap();
        assert_eq!(descriptors(&map), before);
    }

    #[test]
    fn allocation_is_top_down() {
        let (mut map, base) = seeded_map(0x400000);
        let first = map.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 1).unwrap();
        let second = map.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 1).unwrap();
        assert!(first > second);
        assert!(second >= base);
    }

    #[test]
    fn max_address_allocation_stays_below_ceiling() {
        let (mut map, base) = seeded_map(0x400000);
        let ceiling = base + 0x200000 - 1;
        let address = map.allocate_pages(AllocateType::MaxAddress(ceiling), MemoryType::LoaderData, 4).unwrap();
        assert!(address + 4 * UEFI_PAGE_SIZE as u64 - 1 <= ceiling);
        // Top-down: the highest qualifying aligned base below the ceiling.
        assert_eq!(address, (ceiling + 1) - 4 * UEFI_PAGE_SIZE as u64);
    }

    #[test]
    fn entry_at_address_space_top_is_searchable() {
        let (mut map, base) = seeded_map(0x100000);
        let top = u64::MAX - (UEFI_PAGE_SIZE as u64 - 1);
        unsafe {
            map.add_memory_space(MemoryType::Conventional, top, UEFI_PAGE_SIZE as u64, DEFAULT_CACHE_ATTR).unwrap();
        }
        // The page ending at u64::MAX is itself a candidate.
        assert_eq!(map.find_free_pages(u64::MAX, 1, MemoryType::LoaderData, UEFI_PAGE_SIZE as u64), Some(top));
        // Too small for two pages; the search falls through to the seeded
        // region instead of giving up.
        let found = map.find_free_pages(u64::MAX, 2, MemoryType::LoaderData, UEFI_PAGE_SIZE as u64).unwrap();
        assert!(found >= base && found < base + 0x100000);
    }

    #[test]
    fn default_statistics_follow_type_policy() {
        let map = MemoryMap::new();
        for memory_type in BUILTIN_MEMORY_TYPES {
            let statistics = map.statistics(memory_type).unwrap();
            assert_eq!(statistics.special, memory_type.is_special());
            assert_eq!(statistics.runtime, memory_type.is_runtime());
        }
    }

    #[test]
    fn exact_address_allocation() {
        let (mut map, base) = seeded_map(0x400000);
        let target = base + 0x100000;
        let address = map.allocate_pages(AllocateType::Address(target), MemoryType::LoaderData, 2).unwrap();
        assert_eq!(address, target);
        // The same range cannot be allocated twice.
        assert_eq!(
            map.allocate_pages(AllocateType::Address(target), MemoryType::LoaderData, 2),
            Err(EfiError::NotFound)
        );
        map.free_pages(address, 2).unwrap();
    }

    #[test]
    fn exact_address_geometric_violations() {
        let (mut map, _base) = seeded_map(0x100000);
        // Misaligned.
        assert_eq!(
            map.allocate_pages(AllocateType::Address(0x123), MemoryType::LoaderData, 1),
            Err(EfiError::NotFound)
        );
        // Beyond the addressable range.
        let beyond = map.maximum_address() + UEFI_PAGE_SIZE as u64;
        assert_eq!(
            map.allocate_pages(AllocateType::Address(beyond), MemoryType::LoaderData, 1),
            Err(EfiError::NotFound)
        );
        // Wraps the address space.
        assert_eq!(
            map.allocate_pages(AllocateType::Address(u64::MAX - UEFI_PAGE_MASK as u64), MemoryType::LoaderData, 2),
            Err(EfiError::NotFound)
        );
    }

    #[test]
    fn illegal_allocation_types_rejected() {
        let (mut map, _base) = seeded_map(0x100000);
        for memory_type in [MemoryType::Conventional, MemoryType::Persistent, MemoryType::Unaccepted] {
            assert_eq!(
                map.allocate_pages(AllocateType::AnyPages, memory_type, 1),
                Err(EfiError::InvalidParameter)
            );
        }
        assert_eq!(
            map.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderData, 0),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn free_of_unallocated_range_fails() {
        let (mut map, base) = seeded_map(0x100000);
        assert_eq!(map.free_pages(base, 1), Err(EfiError::NotFound));
        // Outside the map entirely.
        assert_eq!(map.free_pages(base + 0x10000000, 1), Err(EfiError::NotFound));
    }

    #[test]
    fn freed_pages_are_zero_filled() {
        let (mut map, _base) = seeded_map(0x400000);
        let address = map.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 1).unwrap();
        unsafe {
            core::ptr::write_bytes(address as *mut u8, 0xA5, UEFI_PAGE_SIZE);
        }
        map.free_pages(address, 1).unwrap();
        let slice = unsafe { core::slice::from_raw_parts(address as *const u8, UEFI_PAGE_SIZE) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn convert_requires_exactly_one_change() {
        let (mut map, base) = seeded_map(0x100000);
        assert_eq!(map.convert_pages(base, 1, None, None), Err(EfiError::InvalidParameter));
        assert_eq!(
            map.convert_pages(base, 1, Some(MemoryType::LoaderData), Some(DEFAULT_CACHE_ATTR)),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn convert_rejects_non_conventional_pair() {
        let (mut map, _base) = seeded_map(0x400000);
        let address = map.allocate_pages(AllocateType::AnyPages, MemoryType::BootServicesData, 2).unwrap();
        assert_eq!(
            map.convert_pages(address, 2, Some(MemoryType::LoaderData), None),
            Err(EfiError::NotFound)
        );
        map.free_pages(address, 2).unwrap();
    }

    #[test]
    fn partial_conversion_persists_after_not_found() {
        let (mut map, _base) = seeded_map(0x400000);
        // The entry storage page at the top of the map is BootServicesData.
        // A span covering one conventional page plus that page converts the
        // first page, then fails; the conversion is not rolled back.
        let blocker = map.maximum_address() + 1 - UEFI_PAGE_SIZE as u64;
        let span_start = blocker - UEFI_PAGE_SIZE as u64;
        assert_eq!(
            map.convert_pages(span_start, 2, Some(MemoryType::LoaderCode), None),
            Err(EfiError::NotFound)
        );
        let entries = descriptors(&map);
        assert!(entries.iter().any(|d| d.memory_type == MemoryType::LoaderCode
            && d.physical_start == span_start
            && d.number_of_pages == 1));
    }

    #[test]
    fn type_window_confinement() {
        let (mut map, base) = seeded_map(0x400000);
        let window_base = base + 0x100000;
        let window_end = base + 0x1FFFFF;
        map.configure_type_window(MemoryType::LoaderCode, window_base, window_end).unwrap();

        for _ in 0..16 {
            let Ok(address) = map.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderCode, 4) else {
                break;
            };
            assert!(address >= window_base);
            assert!(address + 4 * UEFI_PAGE_SIZE as u64 - 1 <= window_end);
        }
    }

    #[test]
    fn window_exhaustion_does_not_fall_back() {
        let (mut map, base) = seeded_map(0x400000);
        let window_base = base + 0x100000;
        let window_end = base + 0x100000 + 4 * UEFI_PAGE_SIZE as u64 - 1;
        map.configure_type_window(MemoryType::LoaderCode, window_base, window_end).unwrap();

        // The window holds exactly 4 pages; a 8 page request must fail even
        // though plenty of conventional memory exists outside the window.
        assert_eq!(
            map.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderCode, 8),
            Err(EfiError::OutOfResources)
        );
    }

    #[test]
    fn find_free_pages_respects_alignment() {
        let (map, _base) = seeded_map(0x400000);
        let alignment = 16 * UEFI_PAGE_SIZE as u64;
        if let Some(address) = map.find_free_pages(map.maximum_address(), 4, MemoryType::LoaderData, alignment) {
            assert_eq!(address & (alignment - 1), 0);
        }
    }

    #[test]
    fn map_key_increments_on_mutation() {
        let (mut map, _base) = seeded_map(0x400000);
        let key = map.map_key();
        let address = map.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderData, 1).unwrap();
        assert!(map.map_key() > key);
        let key = map.map_key();
        map.free_pages(address, 1).unwrap();
        assert!(map.map_key() > key);
    }

    #[test]
    fn resource_info_tracks_usage() {
        let (mut map, _base) = seeded_map(0x400000);
        let before = map.get_memory_resource_info(MemoryType::LoaderData).unwrap();
        let address = map.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderData, 4).unwrap();
        let during = map.get_memory_resource_info(MemoryType::LoaderData).unwrap();
        assert_eq!(during.free_address, before.free_address - 4 * UEFI_PAGE_SIZE as u64);
        map.free_pages(address, 4).unwrap();
        let after = map.get_memory_resource_info(MemoryType::LoaderData).unwrap();
        assert_eq!(after.free_address, before.free_address);
    }

    #[test]
    fn resource_info_rejects_custom_types() {
        let (map, _base) = seeded_map(0x100000);
        assert_eq!(
            map.get_memory_resource_info(MemoryType::OemReserved(0x7000_0000)),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn statistics_track_conversions() {
        let (mut map, _base) = seeded_map(0x400000);
        let before = map.statistics(MemoryType::LoaderData).unwrap().current_pages;
        let address = map.allocate_pages(AllocateType::AnyPages, MemoryType::LoaderData, 4).unwrap();
        assert_eq!(map.statistics(MemoryType::LoaderData).unwrap().current_pages, before + 4);
        map.free_pages(address, 4).unwrap();
        assert_eq!(map.statistics(MemoryType::LoaderData).unwrap().current_pages, before);
    }

    #[test]
    fn get_memory_map_requires_capacity() {
        let (map, _base) = seeded_map(0x100000);
        let mut too_small: [MemoryMapDescriptor; 1] = [MemoryMapDescriptor {
            memory_type: MemoryType::Conventional,
            physical_start: 0,
            number_of_pages: 0,
            attribute: 0,
        }];
        assert_eq!(map.get_memory_map(&mut too_small), Err(EfiError::BufferTooSmall));
    }
}
