/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of IBFS.
 *
 * IBFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * IBFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * IBFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Block address allocator.
//!
//! The address space covers the user-addressable range of a volume: every
//! block past the root and the meta cluster. It is two layers deep: a dense
//! bitmap recording which addresses are allocated, and a small LIFO cache of
//! addresses already marked allocated but not yet handed out.
//!
//! An allocation pops the cache. When the cache runs dry, one region of the
//! bitmap is scanned and its free addresses are marked and pushed; regions
//! are visited round-robin so churn spreads over the whole volume instead of
//! hammering its start. A bit is always set *before* the address leaves the
//! allocator, so an address can never be handed out twice.

use crate::error::ErrorKind;
use crate::error::Result;

/// Capacity of the allocation cache, which is also the size of a replenish
/// region, in addresses.
const DEFAULT_CACHE_CAPACITY: usize = 64;

/// The address space of one opened volume.
#[derive(Debug)]
pub struct AddressSpace {
    /// First allocatable address.
    offset: u64,
    /// Total number of blocks of the volume.
    block_count: u64,
    /// One bit per address in `[offset, block_count)`, set when allocated.
    bitmap: Vec<u64>,
    /// Allocated addresses not yet handed out, popped from the back.
    cache: Vec<u64>,
    /// Cache capacity and replenish region size.
    capacity: usize,
    /// Next region to scan.
    region: u64,
}

impl AddressSpace {
    /// Creates an address space with every address free.
    ///
    /// Arguments:
    /// - `block_count` is the total number of blocks of the volume.
    /// - `offset` is the first allocatable address.
    pub fn new(block_count: u64, offset: u64) -> Self {
        Self::with_capacity(block_count, offset, DEFAULT_CACHE_CAPACITY)
    }

    /// Creates an address space with the given cache capacity.
    pub fn with_capacity(block_count: u64, offset: u64, capacity: usize) -> Self {
        let len = block_count.saturating_sub(offset);
        let words = crate::util::ceil_division(len.max(1), 64) as usize;
        Self {
            offset,
            block_count,
            bitmap: vec![0; words],
            cache: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            region: 0,
        }
    }

    /// Returns the first allocatable address.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the number of allocatable addresses.
    pub fn len(&self) -> u64 {
        self.block_count.saturating_sub(self.offset)
    }

    /// Tells whether no address is allocatable.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the bitmap slot of the given address.
    fn index(&self, address: u64) -> Result<(usize, u64)> {
        if address < self.offset || address >= self.block_count {
            return Err(ErrorKind::OutOfBounds.into());
        }
        let bit = address - self.offset;
        Ok(((bit / 64) as usize, bit % 64))
    }

    /// Tells whether the given address is allocated.
    pub fn is_allocated(&self, address: u64) -> Result<bool> {
        let (word, bit) = self.index(address)?;
        Ok(self.bitmap[word] & (1 << bit) != 0)
    }

    /// Marks the given address allocated without going through the cache.
    ///
    /// Used when loading a volume whose live blocks are known by address.
    pub fn mark(&mut self, address: u64) -> Result<()> {
        let (word, bit) = self.index(address)?;
        self.bitmap[word] |= 1 << bit;
        Ok(())
    }

    /// Returns an allocated address.
    ///
    /// The address is marked in the bitmap before it is returned.
    pub fn alloc(&mut self) -> Result<u64> {
        if let Some(address) = self.cache.pop() {
            return Ok(address);
        }
        self.fast_replenish()?;
        self.cache
            .pop()
            .ok_or_else(|| ErrorKind::AddressExhausted.into())
    }

    /// Refills the cache from the next region holding free addresses.
    ///
    /// Regions are visited round-robin; a full cycle of empty regions means
    /// the volume is out of addresses.
    fn fast_replenish(&mut self) -> Result<()> {
        let len = self.len();
        if len == 0 {
            return Err(ErrorKind::AddressExhausted.into());
        }
        let regions = crate::util::ceil_division(len, self.capacity as u64);
        for _ in 0..regions {
            let region = self.region;
            self.region = (self.region + 1) % regions;

            let start = self.offset + region * self.capacity as u64;
            let end = (start + self.capacity as u64).min(self.block_count);
            let before = self.cache.len();
            for address in start..end {
                if self.cache.len() >= self.capacity {
                    break;
                }
                let (word, bit) = self.index(address)?;
                if self.bitmap[word] & (1 << bit) == 0 {
                    self.bitmap[word] |= 1 << bit;
                    self.cache.push(address);
                }
            }
            if self.cache.len() > before {
                log::trace!(
                    "replenished {} addresses from region {region}",
                    self.cache.len() - before
                );
                return Ok(());
            }
        }
        Err(ErrorKind::AddressExhausted.into())
    }

    /// Returns the given address to the space.
    ///
    /// The caller must have removed every on-disk reference to the address
    /// first.
    pub fn free(&mut self, address: u64) -> Result<()> {
        let (word, bit) = self.index(address)?;
        self.bitmap[word] &= !(1 << bit);
        Ok(())
    }

    /// Returns the number of free addresses, cached ones excluded.
    pub fn free_count(&self) -> u64 {
        let ones: u64 = self.bitmap.iter().map(|w| w.count_ones() as u64).sum();
        self.len() - ones
    }

    /// Returns the number of addresses still available for allocation: free
    /// addresses plus cached ones.
    pub fn available(&self) -> u64 {
        self.free_count() + self.cache.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn alloc_in_range_and_distinct() {
        let mut space = AddressSpace::new(100, 65);
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let addr = space.alloc().unwrap();
            assert!((65..100).contains(&addr));
            assert!(seen.insert(addr));
            assert!(space.is_allocated(addr).unwrap());
        }
    }

    #[test]
    fn freed_addresses_come_back() {
        let mut space = AddressSpace::new(100, 65);
        let allocated: Vec<u64> = (0..10).map(|_| space.alloc().unwrap()).collect();

        let returned = [allocated[0], allocated[4], allocated[9]];
        for addr in returned {
            space.free(addr).unwrap();
        }

        // Drain the space entirely; the freed addresses must reappear
        let mut rest = Vec::new();
        while let Ok(addr) = space.alloc() {
            rest.push(addr);
        }
        for addr in returned {
            assert!(rest.contains(&addr));
        }
        // 35 addressable in total: 10 allocated, 3 freed and re-issued
        assert_eq!(rest.len(), 35 - 10 + 3);
        assert_eq!(space.available(), 0);
    }

    #[test]
    fn exhaustion() {
        let mut space = AddressSpace::new(68, 65);
        for _ in 0..3 {
            space.alloc().unwrap();
        }
        let err = space.alloc().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressExhausted);
    }

    #[test]
    fn reserved_range_rejected() {
        let mut space = AddressSpace::new(100, 65);
        assert_eq!(space.free(64).unwrap_err().kind(), ErrorKind::OutOfBounds);
        assert_eq!(space.free(100).unwrap_err().kind(), ErrorKind::OutOfBounds);
        assert_eq!(space.mark(3).unwrap_err().kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn availability_is_conserved() {
        let mut space = AddressSpace::new(1000, 65);
        let initial = space.available();
        assert_eq!(initial, 935);

        let mut held = Vec::new();
        for round in 0..7 {
            for _ in 0..(10 + round * 3) {
                held.push(space.alloc().unwrap());
            }
            // Interleave frees from both ends
            for _ in 0..(5 + round) {
                space.free(held.pop().unwrap()).unwrap();
            }
            for _ in 0..5 {
                space.free(held.remove(0)).unwrap();
            }
        }
        for addr in held.drain(..) {
            space.free(addr).unwrap();
        }
        assert_eq!(space.available(), initial);
    }

    #[test]
    fn regions_cycle_round_robin() {
        let mut space = AddressSpace::with_capacity(100, 65, 8);
        // First replenish scans region 0, second one region 1
        let a = space.alloc().unwrap();
        assert!((65..73).contains(&a));
        for _ in 0..7 {
            space.alloc().unwrap();
        }
        let b = space.alloc().unwrap();
        assert!((73..81).contains(&b));
    }

    #[test]
    fn spans_more_than_one_word() {
        let mut space = AddressSpace::with_capacity(200, 65, 16);
        let mut seen = HashSet::new();
        while let Ok(addr) = space.alloc() {
            assert!(seen.insert(addr));
        }
        assert_eq!(seen.len(), 135);
    }
}
