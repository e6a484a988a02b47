//! Vmspace zone
//!
//! A zone owns one order table and one lock. Every allocation and free of the
//! zone runs entirely under that lock; the blocking allocation path is the
//! only one that gives the lock up while it waits.

use core::ops::Range;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::block::{GrowthDirection, OwnerId, Vmspace, VmspaceId};
use super::descriptor_pool::{DescriptorPool, SlotView};
use super::order_table::OrderTable;
use super::stats::{MemoryStatsReporter, ZoneStats};
use super::wait::{CancelToken, FreeEvents, Relax, SPIN_RELAX};
use crate::{
    is_aligned, request_order, VmspaceError, VmspaceResult, DEFAULT_PAGE_SIZE,
    DEFAULT_POOL_CAPACITY, MAX_ORDER,
};

/// Pages in the largest block a bucket can hold
pub const MAX_BLOCK_PAGES: usize = 1 << (MAX_ORDER - 1);

/// Per-zone configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneConfig {
    pub growth: GrowthDirection,
}

/// Descriptors needed to break `pages` into power-of-two pieces, beyond the
/// one already describing them.
#[inline]
pub(crate) const fn divide_cost(pages: usize) -> usize {
    (pages.count_ones() as usize).saturating_sub(1)
}

/// Everything guarded by the zone lock
pub(crate) struct ZoneState<'p, const PAGE_SIZE: usize, const CAP: usize> {
    pub(super) zone_id: usize,
    pub(super) growth: GrowthDirection,
    pub(super) slots: SlotView<'p, CAP>,
    pub(super) table: OrderTable,
    pub(super) total_pages: usize,
    pub(super) used_pages: usize,
    pub(super) allocations: usize,
    pub(super) frees: usize,
    pub(super) merges: usize,
}

impl<'p, const PAGE_SIZE: usize, const CAP: usize> ZoneState<'p, PAGE_SIZE, CAP> {
    pub(super) fn new(zone_id: usize, growth: GrowthDirection, slots: SlotView<'p, CAP>) -> Self {
        Self {
            zone_id,
            growth,
            slots,
            table: OrderTable::new(),
            total_pages: 0,
            used_pages: 0,
            allocations: 0,
            frees: 0,
            merges: 0,
        }
    }

    /// Put a free power-of-two block into its bucket, returning the order
    pub(super) fn insert_free(&mut self, id: VmspaceId) -> usize {
        let pages = self.slots.get(id).present_size / PAGE_SIZE;
        debug_assert!(pages.is_power_of_two() && pages <= MAX_BLOCK_PAGES);
        let order = pages.trailing_zeros() as usize;
        self.table.push(&mut self.slots, order, id);
        order
    }

    /// Link `new` into the buddy chain right before `next`
    pub(super) fn link_before(&mut self, next: VmspaceId, new: VmspaceId) {
        let prev = self.slots.get(next).buddy_prev;
        {
            let desc = self.slots.get_mut(new);
            desc.buddy_prev = prev;
            desc.buddy_next = Some(next);
        }
        if let Some(prev) = prev {
            self.slots.get_mut(prev).buddy_next = Some(new);
        }
        self.slots.get_mut(next).buddy_prev = Some(new);
    }

    /// Link `new` into the buddy chain right after `prev`
    pub(super) fn link_after(&mut self, prev: VmspaceId, new: VmspaceId) {
        let next = self.slots.get(prev).buddy_next;
        {
            let desc = self.slots.get_mut(new);
            desc.buddy_prev = Some(prev);
            desc.buddy_next = next;
        }
        if let Some(next) = next {
            self.slots.get_mut(next).buddy_prev = Some(new);
        }
        self.slots.get_mut(prev).buddy_next = Some(new);
    }

    /// Mark a detached block as used and build the caller's handle
    pub(super) fn grant(&mut self, id: VmspaceId) -> Vmspace {
        let zone_id = self.zone_id;
        let growth = self.growth;
        let desc = self.slots.get_mut(id);
        desc.used = true;
        desc.generation = desc.generation.wrapping_add(1);
        let vmspace = Vmspace {
            zone_id,
            id,
            generation: desc.generation,
            start: desc.start,
            size: desc.present_size,
            owner: desc.owner,
            growth,
        };

        self.used_pages += vmspace.size / PAGE_SIZE;
        self.allocations += 1;
        vmspace
    }

    /// Search the order table from `order` upwards and carve the request
    /// out of the first block found.
    pub(super) fn allocate_from(&mut self, order: usize, size: usize) -> VmspaceResult<Vmspace> {
        let found = self
            .table
            .first_non_empty(order)
            .ok_or(VmspaceError::Exhausted)?;
        let source = self
            .table
            .pop(&mut self.slots, found)
            .ok_or(VmspaceError::Exhausted)?;

        match self.select_and_divide(source, size) {
            Ok(vmspace) => {
                debug!(
                    "zone {}: allocated {:#x} bytes at {:#x} from order {} (asked order {})",
                    self.zone_id, vmspace.size, vmspace.start, found, order
                );
                Ok(vmspace)
            }
            Err(e) => {
                // Nothing was modified yet, put the source back where it was.
                self.table.push(&mut self.slots, found, source);
                Err(e)
            }
        }
    }

    /// Seed the zone with a free region, as one buddy chain
    pub(super) fn add_region(
        &mut self,
        start: usize,
        size: usize,
        owner: OwnerId,
    ) -> VmspaceResult<usize> {
        if size == 0 || !is_aligned(start, PAGE_SIZE) || !is_aligned(size, PAGE_SIZE) {
            warn!(
                "zone {}: region start {:#x} size {:#x} not page aligned",
                self.zone_id, start, size
            );
            return Err(VmspaceError::InvalidParam);
        }
        let fits = match self.growth {
            GrowthDirection::Upward => start.checked_add(size).is_some(),
            GrowthDirection::Downward => start >= size,
        };
        if !fits {
            warn!(
                "zone {}: region start {:#x} size {:#x} wraps the address space",
                self.zone_id, start, size
            );
            return Err(VmspaceError::InvalidParam);
        }

        let mut remaining = size / PAGE_SIZE;
        let mut cursor = start;
        let mut prev: Option<VmspaceId> = None;
        let mut highest = 0;

        while remaining > 0 {
            let chunk = remaining.min(MAX_BLOCK_PAGES);
            let mut claimed = self.slots.claim_batch(1 + divide_cost(chunk))?;
            let id = claimed.take()?;
            {
                let desc = self.slots.get_mut(id);
                desc.start = cursor;
                desc.present_size = chunk * PAGE_SIZE;
                desc.initial_size = chunk * PAGE_SIZE;
                desc.owner = owner;
            }
            if let Some(prev) = prev {
                self.link_after(prev, id);
            }

            let order = if chunk.is_power_of_two() {
                self.insert_free(id)
            } else {
                self.divide(id, &mut claimed)?
            };
            highest = highest.max(order);

            self.total_pages += chunk;
            remaining -= chunk;
            cursor = self.growth.advance(cursor, chunk * PAGE_SIZE);
            // The next chunk goes after the last piece of this one.
            let mut tail = id;
            while let Some(next) = self.slots.get(tail).buddy_next {
                tail = next;
            }
            prev = Some(tail);
        }

        debug!(
            "zone {}: added region {:#x} of {:#x} bytes",
            self.zone_id, start, size
        );
        Ok(highest)
    }

    pub(super) fn free_pages(&self) -> usize {
        (0..MAX_ORDER).map(|order| self.table.len(order) << order).sum()
    }

    pub(super) fn stats(&self) -> ZoneStats {
        let mut stats = ZoneStats::new(self.zone_id);
        stats.total_pages = self.total_pages;
        stats.used_pages = self.used_pages;
        for order in 0..MAX_ORDER {
            stats.free_blocks_by_order[order] = self.table.len(order);
        }
        stats.free_pages = self.free_pages();
        stats.allocations = self.allocations;
        stats.frees = self.frees;
        stats.merges = self.merges;
        stats
    }

    /// Check bucket membership, block sizes, chain contiguity and page accounting
    pub(super) fn check_consistency(&self) -> bool {
        let mut ok = true;

        for order in 0..MAX_ORDER {
            let mut seen = 0;
            self.table.for_each(&self.slots, order, |id| {
                seen += 1;
                let desc = self.slots.get(id);
                if desc.used
                    || desc.bucket != Some(order as u8)
                    || desc.present_size != (PAGE_SIZE << order)
                    || desc.present_size > desc.initial_size
                {
                    error!(
                        "zone {}: block {:?} in bucket {} is inconsistent: {:?}",
                        self.zone_id, id, order, desc
                    );
                    ok = false;
                }
                if !self.check_chain(id) {
                    ok = false;
                }
            });
            if seen != self.table.len(order) {
                error!(
                    "zone {}: bucket {} holds {} blocks, count says {}",
                    self.zone_id,
                    order,
                    seen,
                    self.table.len(order)
                );
                ok = false;
            }
        }

        if self.free_pages() + self.used_pages != self.total_pages {
            error!(
                "zone {}: free {} + used {} pages != total {}",
                self.zone_id,
                self.free_pages(),
                self.used_pages,
                self.total_pages
            );
            ok = false;
        }
        ok
    }

    /// Walk the whole chain containing `id` and verify it is contiguous
    fn check_chain(&self, id: VmspaceId) -> bool {
        let mut head = id;
        let mut steps = 0;
        while let Some(prev) = self.slots.get(head).buddy_prev {
            head = prev;
            steps += 1;
            if steps > CAP {
                error!("zone {}: cycle in buddy chain at {:?}", self.zone_id, id);
                return false;
            }
        }

        let mut current = head;
        steps = 0;
        while let Some(next) = self.slots.get(current).buddy_next {
            let a = self.slots.get(current);
            let b = self.slots.get(next);
            let contiguous = b.start == self.growth.advance(a.start, a.present_size);
            if b.buddy_prev != Some(current)
                || !contiguous
                || b.present_size == 0
                || b.present_size > b.initial_size
                || b.used == b.bucket.is_some()
            {
                error!(
                    "zone {}: buddy chain broken between {:?} and {:?}",
                    self.zone_id, current, next
                );
                return false;
            }
            current = next;
            steps += 1;
            if steps > CAP {
                error!("zone {}: cycle in buddy chain at {:?}", self.zone_id, id);
                return false;
            }
        }
        true
    }
}

/// A zone of address space managed as a buddy system
///
/// Zones borrow a [`DescriptorPool`] that may be shared with other zones.
/// All operations take `&self`; a zone can be shared between threads.
pub struct Zone<
    'p,
    const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE,
    const CAP: usize = DEFAULT_POOL_CAPACITY,
> {
    id: usize,
    growth: GrowthDirection,
    state: SpinNoIrq<ZoneState<'p, PAGE_SIZE, CAP>>,
    events: FreeEvents,
    relax: &'static dyn Relax,
}

impl<'p, const PAGE_SIZE: usize, const CAP: usize> Zone<'p, PAGE_SIZE, CAP> {
    /// Create an empty zone drawing descriptors from `pool`
    pub fn new(pool: &'p DescriptorPool<CAP>, config: ZoneConfig) -> Self {
        assert!(
            PAGE_SIZE.is_power_of_two(),
            "page size {:#x} is not a power of two",
            PAGE_SIZE
        );
        let id = pool.register_zone();
        // SAFETY: `id` is fresh and the view is only reachable through this
        // zone's lock.
        let slots = unsafe { SlotView::new(pool, id) };

        Self {
            id,
            growth: config.growth,
            state: SpinNoIrq::new(ZoneState::new(id, config.growth, slots)),
            events: FreeEvents::new(),
            relax: &SPIN_RELAX,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn growth(&self) -> GrowthDirection {
        self.growth
    }

    /// Set what a blocked allocation does while waiting (defaults to spinning)
    pub fn set_relax(&mut self, relax: &'static dyn Relax) {
        self.relax = relax;
    }

    /// Add a free region to the zone
    ///
    /// For an upward zone the region is `[start, start + size)`, for a
    /// downward zone `[start - size, start)`. The region is cut into
    /// power-of-two blocks linked in one buddy chain.
    pub fn add_region(&self, start: usize, size: usize, owner: OwnerId) -> VmspaceResult {
        let mut state = self.state.lock();
        let order = state.add_region(start, size, owner)?;
        self.events.notify(order);
        Ok(())
    }

    /// Allocate a region of at least `size` bytes
    ///
    /// Fails with [`VmspaceError::Exhausted`] when no block at or above the
    /// needed order is free.
    pub fn allocate(&self, size: usize) -> VmspaceResult<Vmspace> {
        let order = request_order(size, PAGE_SIZE)?;
        let mut state = self.state.lock();
        let result = state.allocate_from(order, size);
        if let Err(VmspaceError::Exhausted) = result {
            warn!(
                "zone {}: no free block for {:#x} bytes at order >= {}",
                self.id, size, order
            );
            MemoryStatsReporter::print_alloc_failure_stats(PAGE_SIZE, &state.stats(), size, order);
        }
        result
    }

    /// Allocate a region of at least `size` bytes, waiting for a free if
    /// the zone is currently exhausted
    pub fn allocate_blocking(&self, size: usize) -> VmspaceResult<Vmspace> {
        self.allocate_blocking_with(size, &CancelToken::new())
    }

    /// Like [`Self::allocate_blocking`], but gives up with
    /// [`VmspaceError::Cancelled`] once `cancel` is triggered.
    pub fn allocate_blocking_with(
        &self,
        size: usize,
        cancel: &CancelToken,
    ) -> VmspaceResult<Vmspace> {
        let order = request_order(size, PAGE_SIZE)?;
        loop {
            let mut state = self.state.lock();
            match state.allocate_from(order, size) {
                Err(VmspaceError::Exhausted) => {
                    let seen = self.events.snapshot(order);
                    drop(state);
                    debug!(
                        "zone {}: waiting for a free block at order >= {}",
                        self.id, order
                    );
                    self.events.wait(order, seen, self.relax, cancel)?;
                }
                result => return result,
            }
        }
    }

    /// Return a region obtained from this zone
    ///
    /// The freed block only merges with the free blocks that follow it along
    /// the buddy chain. A region split into pieces and freed front to back
    /// therefore stays in small blocks; freed back to front it merges into
    /// one again.
    pub fn free(&self, vmspace: Vmspace) -> VmspaceResult {
        let mut state = self.state.lock();
        let order = state.release(&vmspace)?;
        self.events.notify(order);
        Ok(())
    }

    /// Number of free blocks at `order`
    pub fn free_block_count(&self, order: usize) -> usize {
        self.state.lock().table.len(order)
    }

    pub fn free_pages(&self) -> usize {
        self.state.lock().free_pages()
    }

    pub fn stats(&self) -> ZoneStats {
        self.state.lock().stats()
    }

    /// Call `f` with the address range of every free block at `order`
    ///
    /// The zone lock is held while `f` runs; `f` must not call back into the zone.
    pub fn for_each_free_block(&self, order: usize, mut f: impl FnMut(Range<usize>)) {
        let state = self.state.lock();
        let growth = state.growth;
        state.table.for_each(&state.slots, order, |id| {
            let desc = state.slots.get(id);
            f(growth.span(desc.start, desc.present_size));
        });
    }

    /// Verify the zone's internal invariants, logging the first problems found
    pub fn check_consistency(&self) -> bool {
        self.state.lock().check_consistency()
    }

    /// Print zone layout and block distribution
    pub fn print_zone_info(&self) {
        MemoryStatsReporter::print_zone_info(PAGE_SIZE, self.growth, &self.stats());
    }
}

impl<const PAGE_SIZE: usize, const CAP: usize> Drop for Zone<'_, PAGE_SIZE, CAP> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let released = state.slots.retire_all();
        debug!("zone {}: returned {} descriptors to the pool", self.id, released);
    }
}
