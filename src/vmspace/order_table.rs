//! Per-zone order table
//!
//! One bucket per order, each holding a count and an intrusive doubly linked
//! list threaded through the descriptors' `order_prev`/`order_next` fields.
//! The list itself only stores head and length; the links live in the pool.

#[cfg(feature = "log")]
use log::error;

use super::block::VmspaceId;
use super::descriptor_pool::SlotView;
use crate::MAX_ORDER;

/// Free blocks of a single order
#[derive(Debug, Clone, Copy)]
pub struct OrderBucket {
    head: Option<VmspaceId>,
    count: usize,
}

impl OrderBucket {
    pub const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

impl Default for OrderBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// The `MAX_ORDER` buckets of one zone
pub struct OrderTable {
    buckets: [OrderBucket; MAX_ORDER],
}

impl OrderTable {
    pub const fn new() -> Self {
        Self {
            buckets: [const { OrderBucket::new() }; MAX_ORDER],
        }
    }

    /// Number of free blocks at `order`
    pub fn len(&self, order: usize) -> usize {
        if order < MAX_ORDER {
            self.buckets[order].len()
        } else {
            0
        }
    }

    /// Lowest non-empty order at or above `order`
    pub fn first_non_empty(&self, order: usize) -> Option<usize> {
        (order..MAX_ORDER).find(|&o| !self.buckets[o].is_empty())
    }

    /// Put a free descriptor at the head of the bucket for `order`
    pub(crate) fn push<const CAP: usize>(
        &mut self,
        slots: &mut SlotView<'_, CAP>,
        order: usize,
        id: VmspaceId,
    ) {
        debug_assert!(order < MAX_ORDER);
        let bucket = &mut self.buckets[order];
        let old_head = bucket.head;

        {
            let desc = slots.get_mut(id);
            debug_assert!(!desc.used, "used block pushed into bucket {}", order);
            debug_assert!(desc.bucket.is_none(), "block already bucketed");
            desc.bucket = Some(order as u8);
            desc.order_prev = None;
            desc.order_next = old_head;
        }
        if let Some(head) = old_head {
            slots.get_mut(head).order_prev = Some(id);
        }

        bucket.head = Some(id);
        bucket.count += 1;
    }

    /// Unlink `id` from whichever bucket it sits in (O(1))
    ///
    /// Returns the order it was removed from.
    pub(crate) fn remove<const CAP: usize>(
        &mut self,
        slots: &mut SlotView<'_, CAP>,
        id: VmspaceId,
    ) -> Option<usize> {
        let desc = slots.get(id);
        let Some(order) = desc.bucket.map(usize::from) else {
            error!(
                "zone {}: block {:?} is not in any bucket",
                slots.zone_id(),
                id
            );
            return None;
        };

        match desc.order_prev {
            Some(prev) => slots.get_mut(prev).order_next = desc.order_next,
            None => self.buckets[order].head = desc.order_next,
        }
        if let Some(next) = desc.order_next {
            slots.get_mut(next).order_prev = desc.order_prev;
        }

        let desc = slots.get_mut(id);
        desc.bucket = None;
        desc.order_prev = None;
        desc.order_next = None;
        self.buckets[order].count -= 1;
        Some(order)
    }

    /// Detach any block from the bucket for `order`
    pub(crate) fn pop<const CAP: usize>(
        &mut self,
        slots: &mut SlotView<'_, CAP>,
        order: usize,
    ) -> Option<VmspaceId> {
        let head = self.buckets.get(order)?.head?;
        self.remove(slots, head);
        Some(head)
    }

    /// Visit every block currently in the bucket for `order`
    pub(crate) fn for_each<const CAP: usize>(
        &self,
        slots: &SlotView<'_, CAP>,
        order: usize,
        mut f: impl FnMut(VmspaceId),
    ) {
        if order >= MAX_ORDER {
            return;
        }
        let mut current = self.buckets[order].head;
        let mut visited = 0;
        while let Some(id) = current {
            if visited > self.buckets[order].count {
                error!("Potential cycle detected in bucket {}", order);
                return;
            }
            f(id);
            current = slots.get(id).order_next;
            visited += 1;
        }
    }
}

impl Default for OrderTable {
    fn default() -> Self {
        Self::new()
    }
}
