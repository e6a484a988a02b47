//! Coalescing engine
//!
//! Freed blocks are merged with the free blocks that follow them along the
//! buddy chain. Splits are asymmetric (a granted size plus reserve pieces of
//! several orders), so merge candidates are found by walking the chain and
//! summing sizes rather than by buddy address arithmetic.

#[cfg(feature = "log")]
use log::{debug, warn};

use super::block::{Vmspace, VmspaceId};
use super::zone::{divide_cost, ZoneState, MAX_BLOCK_PAGES};
use crate::{VmspaceError, VmspaceResult};

impl<const PAGE_SIZE: usize, const CAP: usize> ZoneState<'_, PAGE_SIZE, CAP> {
    /// Check that `vmspace` names a live allocation of this zone
    fn validate(&self, vmspace: &Vmspace) -> VmspaceResult<VmspaceId> {
        if vmspace.zone_id != self.zone_id || !self.slots.owns(vmspace.id) {
            warn!(
                "zone {}: freeing {:#x} that belongs to zone {}",
                self.zone_id, vmspace.start, vmspace.zone_id
            );
            return Err(VmspaceError::NotAllocated);
        }

        let desc = self.slots.get(vmspace.id);
        if !desc.used
            || desc.generation != vmspace.generation
            || desc.start != vmspace.start
            || desc.present_size != vmspace.size
        {
            warn!(
                "zone {}: double free or stale handle at {:#x} ({:#x} bytes)",
                self.zone_id, vmspace.start, vmspace.size
            );
            return Err(VmspaceError::NotAllocated);
        }
        Ok(vmspace.id)
    }

    /// Return a granted block to the order table, merging where possible
    ///
    /// Returns the highest order a block was bucketed at. On error the block
    /// stays allocated.
    pub(super) fn release(&mut self, vmspace: &Vmspace) -> VmspaceResult<usize> {
        let id = self.validate(vmspace)?;
        self.slots.get_mut(id).used = false;

        let result = match self.find_merge_run(id) {
            Some((last, total_pages)) => Ok(self.merge_run(id, last, total_pages)),
            None => self.settle(id),
        };

        match result {
            Ok(order) => {
                self.used_pages -= vmspace.size / PAGE_SIZE;
                self.frees += 1;
                debug!(
                    "zone {}: freed {:#x} bytes at {:#x}, landed at order {}",
                    self.zone_id, vmspace.size, vmspace.start, order
                );
                Ok(order)
            }
            Err(e) => {
                self.slots.get_mut(id).used = true;
                Err(e)
            }
        }
    }

    /// Walk the free successors of `id`, remembering the furthest one at
    /// which the accumulated size is a power of two.
    fn find_merge_run(&self, id: VmspaceId) -> Option<(VmspaceId, usize)> {
        let mut total = self.slots.get(id).present_size / PAGE_SIZE;
        let mut current = id;
        let mut candidate = None;

        while let Some(next) = self.slots.get(current).buddy_next {
            let desc = self.slots.get(next);
            if desc.used {
                break;
            }
            total += desc.present_size / PAGE_SIZE;
            if total > MAX_BLOCK_PAGES {
                break;
            }
            if total.is_power_of_two() {
                candidate = Some((next, total));
            }
            current = next;
        }
        candidate
    }

    /// Fold the chain run `head..=last` into `head` and bucket the result
    fn merge_run(&mut self, head: VmspaceId, last: VmspaceId, total_pages: usize) -> usize {
        let after_last = self.slots.get(last).buddy_next;
        let mut current = self.slots.get(head).buddy_next;

        while let Some(id) = current {
            let next = self.slots.get(id).buddy_next;
            self.table.remove(&mut self.slots, id);
            self.slots.retire(id);
            if id == last {
                break;
            }
            current = next;
        }

        {
            let desc = self.slots.get_mut(head);
            desc.buddy_next = after_last;
            desc.present_size = total_pages * PAGE_SIZE;
            desc.initial_size = total_pages * PAGE_SIZE;
        }
        if let Some(next) = after_last {
            self.slots.get_mut(next).buddy_prev = Some(head);
        }

        self.merges += 1;
        debug!(
            "zone {}: merged {} pages at {:#x}",
            self.zone_id,
            total_pages,
            self.slots.get(head).start
        );
        self.insert_free(head)
    }

    /// Bucket a free block that cannot merge, dividing it first if needed
    fn settle(&mut self, id: VmspaceId) -> VmspaceResult<usize> {
        let pages = self.slots.get(id).present_size / PAGE_SIZE;
        if pages.is_power_of_two() {
            return Ok(self.insert_free(id));
        }
        let mut claimed = self.slots.claim_batch(divide_cost(pages))?;
        self.divide(id, &mut claimed)
    }
}

#[cfg(test)]
mod tests {
    use crate::vmspace::{DescriptorPool, GrowthDirection, Zone, ZoneConfig};
    use crate::VmspaceError;

    const PAGE: usize = 0x1000;
    const TEST_CAP: usize = 64;

    type TestZone<'p> = Zone<'p, PAGE, TEST_CAP>;

    #[test]
    fn test_free_restores_whole_region() {
        let pool = DescriptorPool::<TEST_CAP>::new();
        let zone = TestZone::new(&pool, ZoneConfig::default());
        zone.add_region(0, 16 * PAGE, 0).unwrap();
        let vacant = pool.vacant_count();

        let v = zone.allocate(20000).unwrap();
        assert_eq!(zone.stats().free_blocks(), 3);

        zone.free(v).unwrap();
        assert_eq!(zone.free_block_count(4), 1);
        assert_eq!(zone.stats().free_blocks(), 1);
        assert_eq!(zone.free_pages(), 16);
        assert_eq!(pool.vacant_count(), vacant);
        assert!(zone.check_consistency());

        let mut ranges = alloc::vec::Vec::new();
        zone.for_each_free_block(4, |r| ranges.push(r));
        assert_eq!(ranges, [0..16 * PAGE]);
    }

    #[test]
    fn test_free_with_used_successor_divides() {
        let pool = DescriptorPool::<TEST_CAP>::new();
        let zone = TestZone::new(&pool, ZoneConfig::default());
        zone.add_region(0, 16 * PAGE, 0).unwrap();

        // a: [0, 5), b: [5, 6), free: 2 pages at 6, 8 pages at 8
        let a = zone.allocate(20000).unwrap();
        let b = zone.allocate(0).unwrap();
        assert_eq!(b.start(), 5 * PAGE);

        // a cannot merge forward: 5 pages become 1 + 4
        zone.free(a).unwrap();
        assert_eq!(zone.free_block_count(0), 1);
        assert_eq!(zone.free_block_count(2), 1);
        assert!(zone.check_consistency());

        // b + 2 = 3 and b + 2 + 8 = 11 pages: no merge, b lands at order 0
        zone.free(b).unwrap();
        assert_eq!(zone.free_block_count(0), 2);
        assert_eq!(zone.free_pages(), 16);
        assert!(zone.check_consistency());
    }

    #[test]
    fn test_partial_merge_stops_at_used_block() {
        let pool = DescriptorPool::<TEST_CAP>::new();
        let zone = TestZone::new(&pool, ZoneConfig::default());
        zone.add_region(0, 16 * PAGE, 0).unwrap();

        // a: 2 pages [0, 2), reserve 14 = 2 + 4 + 8
        let a = zone.allocate(PAGE).unwrap();
        assert_eq!(a.size(), 2 * PAGE);
        // b takes the 2 pages at [2, 4)
        let b = zone.allocate(PAGE).unwrap();
        assert_eq!(b.start(), 2 * PAGE);

        // a's successor is used: stays a lone order-1 block
        zone.free(a).unwrap();
        assert_eq!(zone.free_block_count(1), 1);
        assert!(zone.check_consistency());

        // b + 4 = 6, + 8 = 14: never a power of two past b itself
        zone.free(b).unwrap();
        assert_eq!(zone.free_block_count(1), 2);
        assert_eq!(zone.free_block_count(2), 1);
        assert_eq!(zone.free_block_count(3), 1);
        assert!(zone.check_consistency());
    }

    #[test]
    fn test_double_free_rejected() {
        let pool = DescriptorPool::<TEST_CAP>::new();
        let zone = TestZone::new(&pool, ZoneConfig::default());
        zone.add_region(0, 16 * PAGE, 0).unwrap();

        let v = zone.allocate(20000).unwrap();
        zone.free(v).unwrap();
        assert_eq!(zone.free(v), Err(VmspaceError::NotAllocated));

        // Same slot granted again: the old handle is still stale
        let w = zone.allocate(20000).unwrap();
        assert_eq!(w.start(), v.start());
        assert_eq!(zone.free(v), Err(VmspaceError::NotAllocated));
        zone.free(w).unwrap();
        assert_eq!(zone.free_pages(), 16);
        assert!(zone.check_consistency());
    }

    #[test]
    fn test_free_pool_exhausted_keeps_block_allocated() {
        let pool = DescriptorPool::<4>::new();
        let zone = Zone::<PAGE, 4>::new(&pool, ZoneConfig::default());
        zone.add_region(0, 16 * PAGE, 0).unwrap();

        // a: [0, 5) + 1 + 2 + 8 uses all four descriptors
        let a = zone.allocate(20000).unwrap();
        assert_eq!(pool.vacant_count(), 0);
        // b takes the single page right after a, reusing its descriptor
        let b = zone.allocate(0).unwrap();

        // a (5 pages) must be divided into 1 + 4 but no descriptor is left
        assert_eq!(zone.free(a), Err(VmspaceError::PoolExhausted));
        assert_eq!(zone.stats().used_pages, 6);
        assert!(zone.check_consistency());

        // Once b is gone a can merge: 5 + 1 + 2 = 8, + 8 = 16
        zone.free(b).unwrap();
        zone.free(a).unwrap();
        assert_eq!(zone.free_block_count(4), 1);
        assert_eq!(pool.vacant_count(), 3);
        assert!(zone.check_consistency());
    }

    fn fill_single_pages(zone: &TestZone<'_>) -> alloc::vec::Vec<crate::vmspace::Vmspace> {
        let mut pages = alloc::vec::Vec::new();
        while let Ok(v) = zone.allocate(0) {
            pages.push(v);
        }
        pages.sort_unstable_by_key(|v| v.start());
        pages
    }

    #[test]
    fn test_free_front_to_back_stays_fragmented() {
        let pool = DescriptorPool::<TEST_CAP>::new();
        let zone = TestZone::new(&pool, ZoneConfig::default());
        zone.add_region(0, 16 * PAGE, 0).unwrap();
        let pages = fill_single_pages(&zone);
        assert_eq!(pages.len(), 16);

        // Each page's successor is still used when it is freed
        for v in pages {
            zone.free(v).unwrap();
        }
        assert_eq!(zone.free_pages(), 16);
        assert_eq!(zone.free_block_count(0), 16);
        assert_eq!(zone.free_block_count(4), 0);
        assert_eq!(zone.allocate(7 * PAGE), Err(VmspaceError::Exhausted));
        assert!(zone.check_consistency());
    }

    #[test]
    fn test_free_back_to_front_merges_fully() {
        let pool = DescriptorPool::<TEST_CAP>::new();
        let zone = TestZone::new(&pool, ZoneConfig::default());
        zone.add_region(0, 16 * PAGE, 0).unwrap();
        let pages = fill_single_pages(&zone);

        for v in pages.into_iter().rev() {
            zone.free(v).unwrap();
        }
        assert_eq!(zone.free_block_count(4), 1);
        assert_eq!(zone.stats().free_blocks(), 1);
        assert!(zone.allocate(7 * PAGE).is_ok());
        assert!(zone.check_consistency());
    }

    #[test]
    fn test_free_merges_downward() {
        let pool = DescriptorPool::<TEST_CAP>::new();
        let zone = TestZone::new(
            &pool,
            ZoneConfig {
                growth: GrowthDirection::Downward,
            },
        );
        let top = 0x40_0000;
        zone.add_region(top, 16 * PAGE, 0).unwrap();

        let v = zone.allocate(20000).unwrap();
        let w = zone.allocate(3 * PAGE).unwrap();
        assert!(zone.check_consistency());

        // w merges with its 4-page remainder, then v walks over both
        zone.free(w).unwrap();
        assert_eq!(zone.free_block_count(3), 1);
        zone.free(v).unwrap();
        assert_eq!(zone.free_block_count(4), 1);
        let mut ranges = alloc::vec::Vec::new();
        zone.for_each_free_block(4, |r| ranges.push(r));
        assert_eq!(ranges, [top - 16 * PAGE..top]);
        assert!(zone.check_consistency());
    }
}
