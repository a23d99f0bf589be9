//! Pool Allocator
//!
//! Byte granularity allocation carved out of pages obtained from the memory
//! map. Free blocks are binned by a Fibonacci size progression so that a
//! block of one bin splits exactly into smaller bins with no slack, and a
//! fully freed allocation granule reassembles without bookkeeping beyond the
//! blocks themselves.
//!
//! Every live allocation is bracketed by a signed head and tail record; a
//! signature mismatch on free means the caller scribbled outside its buffer
//! and the block is abandoned rather than recycled.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::ptr;

use uefi_base::{
    base::{UEFI_PAGE_MASK, UEFI_PAGE_SHIFT},
    error::EfiError,
    uefi_size_to_pages,
};

use crate::{
    ensure, error,
    memory_type::{MemoryType, NUM_BUILTIN_MEMORY_TYPES},
    MemoryServices,
};

const fn signature_32(a: char, b: char, c: char, d: char) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

const POOL_HEAD_SIGNATURE: u32 = signature_32('p', 'h', 'd', '0');
const POOL_TAIL_SIGNATURE: u32 = signature_32('p', 't', 'a', 'l');
const POOL_FREE_SIGNATURE: u32 = signature_32('p', 'f', 'r', '0');
const POOL_SIGNATURE: u32 = signature_32('p', 'l', 's', 't');

/// Free block bin sizes. Each size is the sum of the previous two, seeded at
/// 128 and 256, so splitting any bin greedily into smaller bins terminates
/// with zero remainder.
const POOL_SIZES: [usize; 14] =
    [128, 256, 384, 640, 1024, 1664, 2688, 4352, 7040, 11392, 18432, 29824, 48256, 78080];

/// Header preceding every live pool allocation.
#[repr(C)]
struct PoolHead {
    signature: u32,
    reserved: u32,
    memory_type: u32,
    pad: u32,
    /// Total block size in bytes, head and tail included.
    size: u64,
}

/// Trailer following every live pool allocation.
#[repr(C)]
struct PoolTail {
    signature: u32,
    reserved: u32,
    size: u64,
}

const POOL_HEAD_SIZE: usize = core::mem::size_of::<PoolHead>();
const POOL_TAIL_SIZE: usize = core::mem::size_of::<PoolTail>();
const POOL_OVERHEAD: usize = POOL_HEAD_SIZE + POOL_TAIL_SIZE;

/// Largest byte count accepted by allocate_pool. Leaves room for the head
/// and tail records, the 8 byte size rounding, and the page round-up on the
/// whole-page path.
pub const MAX_POOL_SIZE: usize = usize::MAX - POOL_OVERHEAD - 7 - UEFI_PAGE_MASK;

/// A free block, threaded through the bin list of its size class. The block's
/// own memory holds the record.
#[repr(C)]
struct PoolFree {
    signature: u32,
    /// Index into POOL_SIZES describing this block's size.
    index: u32,
    next: *mut PoolFree,
}

/// Free list state for one memory type.
struct Pool {
    signature: u32,
    /// Bytes currently live out of this pool.
    used: u64,
    memory_type: u32,
    free_lists: [*mut PoolFree; POOL_SIZES.len()],
    next: *mut Pool,
}

impl Pool {
    const fn new(memory_type: u32) -> Self {
        Self {
            signature: POOL_SIGNATURE,
            used: 0,
            memory_type,
            free_lists: [ptr::null_mut(); POOL_SIZES.len()],
            next: ptr::null_mut(),
        }
    }
}

/// Pool state for every memory type. Builtin types get static slots; OEM and
/// OS reserved types get pool records allocated on first use and destroyed
/// when their last allocation is freed.
pub(crate) struct PoolRegistry {
    builtin: [Pool; NUM_BUILTIN_MEMORY_TYPES],
    custom: *mut Pool,
}

impl PoolRegistry {
    pub(crate) const fn new() -> Self {
        const EMPTY: Pool = Pool::new(0);
        let mut builtin = [EMPTY; NUM_BUILTIN_MEMORY_TYPES];
        let mut index = 0;
        while index < NUM_BUILTIN_MEMORY_TYPES {
            builtin[index].memory_type = index as u32;
            index += 1;
        }
        Self { builtin, custom: ptr::null_mut() }
    }
}

// Bin selection helpers.

fn pool_index_for(size: usize) -> Option<usize> {
    POOL_SIZES.iter().position(|&bin| bin >= size)
}

fn granule_index_for(granularity: usize) -> usize {
    pool_index_for(granularity).unwrap_or(POOL_SIZES.len())
}

impl MemoryServices {
    /// Finds the pool record for a memory type, creating one for OEM and OS
    /// reserved types on first use.
    fn lookup_pool(&mut self, memory_type: MemoryType) -> Result<*mut Pool, EfiError> {
        if let Some(index) = memory_type.statistics_index() {
            return Ok(&mut self.pools.builtin[index] as *mut Pool);
        }
        let raw_type = u32::from(memory_type);
        let mut cursor = self.pools.custom;
        while !cursor.is_null() {
            let pool = unsafe { &*cursor };
            if pool.memory_type == raw_type {
                return Ok(cursor);
            }
            cursor = pool.next;
        }
        // First use of this custom type. The pool record itself comes out of
        // boot services data pool storage.
        let record =
            self.allocate_pool_i(MemoryType::BootServicesData, core::mem::size_of::<Pool>())? as *mut Pool;
        unsafe {
            record.write(Pool::new(raw_type));
            (*record).next = self.pools.custom;
        }
        self.pools.custom = record;
        Ok(record)
    }

    /// Allocates `size` bytes of pool of the given type. Caller validates the
    /// type and size and holds the lock.
    pub(crate) fn allocate_pool_i(&mut self, memory_type: MemoryType, size: usize) -> Result<*mut u8, EfiError> {
        let granularity = memory_type.page_allocation_granularity();
        let padded = (size + POOL_OVERHEAD + 7) & !7;
        let granule_index = granule_index_for(granularity);

        let pool = self.lookup_pool(memory_type)?;

        let (head, block_size) = match pool_index_for(padded) {
            Some(index) if index < granule_index => {
                let head = match self.pop_free_block(pool, index) {
                    Some(block) => block,
                    None => self.carve_block(pool, index, memory_type, granularity)?,
                };
                (head, POOL_SIZES[index])
            }
            // Requests at or beyond the granule threshold go straight to the
            // page allocator.
            _ => {
                let pages = uefi_size_to_pages!(padded) as u64;
                let granule_pages = (granularity >> UEFI_PAGE_SHIFT) as u64;
                let pages = (pages + granule_pages - 1) & !(granule_pages - 1);
                let head = self.allocate_pool_pages(memory_type, pages, granularity as u64)?;
                (head, (pages << UEFI_PAGE_SHIFT) as usize)
            }
        };

        let head = head as *mut PoolHead;
        unsafe {
            head.write(PoolHead {
                signature: POOL_HEAD_SIGNATURE,
                reserved: 0,
                memory_type: u32::from(memory_type),
                pad: 0,
                size: block_size as u64,
            });
            let tail = (head as *mut u8).add(block_size - POOL_TAIL_SIZE) as *mut PoolTail;
            tail.write(PoolTail { signature: POOL_TAIL_SIGNATURE, reserved: 0, size: block_size as u64 });
            let data = (head as *mut u8).add(POOL_HEAD_SIZE);
            ptr::write_bytes(data, 0, block_size - POOL_OVERHEAD);
            (*pool).used += block_size as u64;
            log::trace!(target: "allocations", "AllocatePool: {size} bytes at {:#x} as {memory_type}", data as usize);
            Ok(data)
        }
    }

    fn pop_free_block(&mut self, pool: *mut Pool, index: usize) -> Option<*mut u8> {
        let head = unsafe { (*pool).free_lists[index] };
        if head.is_null() {
            return None;
        }
        unsafe {
            debug_assert_eq!((*head).signature, POOL_FREE_SIGNATURE);
            (*pool).free_lists[index] = (*head).next;
        }
        Some(head as *mut u8)
    }

    fn push_free_block(&mut self, pool: *mut Pool, index: usize, block: *mut u8) {
        let free = block as *mut PoolFree;
        unsafe {
            free.write(PoolFree { signature: POOL_FREE_SIGNATURE, index: index as u32, next: (*pool).free_lists[index] });
            (*pool).free_lists[index] = free;
        }
    }

    /// Obtains a block of bin `index` by splitting a larger free block, or a
    /// fresh allocation granule if none is available. The remainder past the
    /// requested block is scattered into smaller bins with zero slack.
    fn carve_block(
        &mut self,
        pool: *mut Pool,
        index: usize,
        memory_type: MemoryType,
        granularity: usize,
    ) -> Result<*mut u8, EfiError> {
        let granule_index = granule_index_for(granularity);

        let mut region: *mut u8 = ptr::null_mut();
        let mut region_size = 0;
        for donor in index + 1..granule_index {
            if let Some(block) = self.pop_free_block(pool, donor) {
                region = block;
                region_size = POOL_SIZES[donor];
                break;
            }
        }
        if region.is_null() {
            let granule_pages = (granularity >> UEFI_PAGE_SHIFT) as u64;
            region = self.allocate_pool_pages(memory_type, granule_pages, granularity as u64)?;
            region_size = granularity;
        }

        let mut offset = POOL_SIZES[index];
        while offset < region_size {
            let remaining = region_size - offset;
            let Some(frag_index) = POOL_SIZES.iter().rposition(|&bin| bin <= remaining) else {
                debug_assert!(false, "pool region remainder {remaining} smaller than the smallest bin");
                break;
            };
            self.push_free_block(pool, frag_index, unsafe { region.add(offset) });
            offset += POOL_SIZES[frag_index];
        }
        debug_assert_eq!(offset, region_size);
        Ok(region)
    }

    /// Frees a pool allocation, returning its memory type. Corrupt head or
    /// tail records fail with `InvalidParameter` and the block is abandoned.
    pub(crate) fn free_pool_i(&mut self, buffer: *mut u8) -> Result<MemoryType, EfiError> {
        ensure!(!buffer.is_null(), EfiError::InvalidParameter);
        let head = unsafe { buffer.sub(POOL_HEAD_SIZE) } as *mut PoolHead;

        let (size, raw_type) = unsafe {
            if (*head).signature != POOL_HEAD_SIGNATURE {
                log::error!("FreePool: head signature corrupt at {:#x}", head as usize);
                debug_assert!(false, "pool head signature corrupt");
                error!(EfiError::InvalidParameter);
            }
            let size = (*head).size as usize;
            let tail = (head as *mut u8).add(size - POOL_TAIL_SIZE) as *mut PoolTail;
            if (*tail).signature != POOL_TAIL_SIGNATURE || (*tail).size != (*head).size {
                log::error!("FreePool: tail record corrupt at {:#x}", tail as usize);
                debug_assert!(false, "pool tail record corrupt");
                error!(EfiError::InvalidParameter);
            }
            (*head).signature = 0;
            (*tail).signature = 0;
            (size, (*head).memory_type)
        };

        let memory_type = MemoryType::try_from(raw_type)?;
        let granularity = memory_type.page_allocation_granularity();
        let granule_index = granule_index_for(granularity);
        let pool = self.lookup_pool(memory_type)?;
        unsafe {
            (*pool).used = (*pool).used.saturating_sub(size as u64);
        }

        log::trace!(target: "allocations", "FreePool: {size} byte block at {:#x}", head as usize);

        match pool_index_for(size) {
            Some(index) if index < granule_index => {
                self.push_free_block(pool, index, head as *mut u8);
                self.coalesce_granule(pool, head as *mut u8, granularity)?;
            }
            _ => {
                let pages = (size >> UEFI_PAGE_SHIFT) as u64;
                self.free_pool_pages(head as u64, pages)?;
            }
        }

        // Custom type pools are destroyed once their last allocation is gone.
        if memory_type.statistics_index().is_none() {
            let pool_used = unsafe { (*pool).used };
            if pool_used == 0 {
                self.destroy_custom_pool(pool)?;
            }
        }
        Ok(memory_type)
    }

    /// Returns a whole allocation granule to the page map when every block in
    /// it is free. Blocks are self describing, so the granule is verified by
    /// walking it front to back.
    fn coalesce_granule(&mut self, pool: *mut Pool, block: *mut u8, granularity: usize) -> Result<(), EfiError> {
        let granule_base = (block as usize) & !(granularity - 1);

        let mut offset = 0;
        while offset < granularity {
            let free = (granule_base + offset) as *mut PoolFree;
            let (signature, index) = unsafe { ((*free).signature, (*free).index as usize) };
            if signature != POOL_FREE_SIGNATURE || index >= POOL_SIZES.len() {
                // A live block or a foreign page shares the granule.
                return Ok(());
            }
            offset += POOL_SIZES[index];
        }
        if offset != granularity {
            return Ok(());
        }

        let mut offset = 0;
        while offset < granularity {
            let free = (granule_base + offset) as *mut PoolFree;
            let index = unsafe { (*free).index as usize };
            self.remove_free_block(pool, index, free);
            offset += POOL_SIZES[index];
        }

        let pages = (granularity >> UEFI_PAGE_SHIFT) as u64;
        self.free_pool_pages(granule_base as u64, pages)
    }

    fn remove_free_block(&mut self, pool: *mut Pool, index: usize, block: *mut PoolFree) {
        unsafe {
            let mut cursor: *mut *mut PoolFree = &mut (*pool).free_lists[index];
            while !(*cursor).is_null() {
                if *cursor == block {
                    *cursor = (*block).next;
                    return;
                }
                cursor = &mut (**cursor).next;
            }
        }
        debug_assert!(false, "free block missing from its bin");
    }

    fn allocate_pool_pages(
        &mut self,
        memory_type: MemoryType,
        pages: u64,
        alignment: u64,
    ) -> Result<*mut u8, EfiError> {
        let base = self
            .map
            .find_free_pages(self.map.maximum_address(), pages, memory_type, alignment)
            .ok_or(EfiError::OutOfResources)?;
        self.map.convert_pages(base, pages, Some(memory_type), None)?;
        Ok(base as *mut u8)
    }

    fn free_pool_pages(&mut self, base: u64, pages: u64) -> Result<(), EfiError> {
        self.map.convert_pages(base, pages, Some(MemoryType::Conventional), None)
    }

    fn destroy_custom_pool(&mut self, pool: *mut Pool) -> Result<(), EfiError> {
        unsafe {
            debug_assert_eq!((*pool).signature, POOL_SIGNATURE);
            let mut cursor: *mut *mut Pool = &mut self.pools.custom;
            while !(*cursor).is_null() {
                if *cursor == pool {
                    *cursor = (*pool).next;
                    // The record was pool allocated; free it through the
                    // normal path.
                    return self.free_pool_i(pool as *mut u8).map(|_| ());
                }
                cursor = &mut (**cursor).next;
            }
        }
        debug_assert!(false, "custom pool record missing from the registry");
        Ok(())
    }
}
