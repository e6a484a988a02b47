//! Descriptor pool shared by all zones
//!
//! Every block descriptor any zone ever creates lives in one slot of this
//! fixed-capacity pool; there is no dynamic metadata allocation. Vacant slots
//! are kept on an explicit stack of indices, so claiming is O(1) and fails
//! with [`VmspaceError::PoolExhausted`] instead of searching forever.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::error;

use super::block::{Descriptor, VmspaceId};
use crate::{VmspaceError, VmspaceResult, DEFAULT_POOL_CAPACITY, MAX_ORDER};

/// Largest number of descriptors a single split or divide needs at once
pub(crate) const MAX_BATCH: usize = MAX_ORDER + 1;

/// Zone ids are unique across every pool, so a handle never matches a zone
/// of another pool.
static NEXT_ZONE_ID: AtomicUsize = AtomicUsize::new(1);

struct DescriptorSlot(UnsafeCell<Descriptor>);

/// Bookkeeping protected by the pool lock
struct PoolState<const CAP: usize> {
    /// Stack of vacant slot indices; `vacant[..top]` is live
    vacant: [u32; CAP],
    top: usize,
    /// Zone id of the claimant of each slot, 0 while vacant
    owners: [usize; CAP],
    total_claims: usize,
    total_releases: usize,
}

/// Fixed pool of block descriptors
///
/// The pool is zone-agnostic: claiming and releasing slots is serialized by
/// the pool's own lock, independent of any zone lock. The contents of a
/// claimed slot belong to the zone that claimed it and are only touched
/// under that zone's lock.
pub struct DescriptorPool<const CAP: usize = DEFAULT_POOL_CAPACITY> {
    slots: [DescriptorSlot; CAP],
    state: SpinNoIrq<PoolState<CAP>>,
}

// SAFETY: vacant slots are only read or written while holding `state`, and a
// claimed slot is only accessed through the `SlotView` of the single zone
// recorded in `owners`, under that zone's lock.
unsafe impl<const CAP: usize> Sync for DescriptorPool<CAP> {}

impl<const CAP: usize> DescriptorPool<CAP> {
    /// Create a pool with every slot vacant
    pub const fn new() -> Self {
        assert!(CAP <= u32::MAX as usize, "descriptor pool too large");
        let mut vacant = [0u32; CAP];
        let mut i = 0;
        // Lowest indices on top of the stack so slots are handed out in order.
        while i < CAP {
            vacant[i] = (CAP - 1 - i) as u32;
            i += 1;
        }

        Self {
            slots: [const { DescriptorSlot(UnsafeCell::new(Descriptor::vacant())) }; CAP],
            state: SpinNoIrq::new(PoolState {
                vacant,
                top: CAP,
                owners: [0; CAP],
                total_claims: 0,
                total_releases: 0,
            }),
        }
    }

    /// Total number of slots
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Number of slots currently free for reuse
    pub fn vacant_count(&self) -> usize {
        self.state.lock().top
    }

    /// Get pool statistics
    pub fn get_stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: CAP,
            vacant: state.top,
            claimed: CAP - state.top,
            total_claims: state.total_claims,
            total_releases: state.total_releases,
        }
    }

    /// Hands out a fresh zone id; ids start at 1 and are never reused,
    /// whichever pool the zone draws from.
    pub(crate) fn register_zone(&self) -> usize {
        NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed)
    }

    fn slot_ptr(&self, index: usize) -> *mut Descriptor {
        self.slots[index].0.get()
    }

    fn claim_locked(state: &mut PoolState<CAP>, zone_id: usize) -> VmspaceResult<VmspaceId> {
        if state.top == 0 {
            error!("descriptor pool: exhausted, all {} slots claimed", CAP);
            return Err(VmspaceError::PoolExhausted);
        }
        state.top -= 1;
        let index = state.vacant[state.top] as usize;
        state.owners[index] = zone_id;
        state.total_claims += 1;
        Ok(VmspaceId::new(index))
    }

    /// Claim one vacant slot for `zone_id`
    #[cfg(test)]
    pub(crate) fn claim(&self, zone_id: usize) -> VmspaceResult<VmspaceId> {
        let mut state = self.state.lock();
        let id = Self::claim_locked(&mut state, zone_id)?;
        // SAFETY: the slot was vacant and we hold the pool lock.
        debug_assert!(unsafe { (*self.slot_ptr(id.index())).is_vacant() });
        Ok(id)
    }

    /// Claim `count` slots at once, or none at all
    pub(crate) fn claim_batch(
        &self,
        zone_id: usize,
        count: usize,
    ) -> VmspaceResult<ClaimedSlots<'_, CAP>> {
        let mut batch = ClaimedSlots {
            pool: self,
            zone_id,
            ids: [None; MAX_BATCH],
            len: 0,
        };
        if count == 0 {
            return Ok(batch);
        }
        if count > MAX_BATCH {
            return Err(VmspaceError::InvalidParam);
        }

        let mut state = self.state.lock();
        if state.top < count {
            error!(
                "descriptor pool: {} slots needed, only {} of {} vacant",
                count, state.top, CAP
            );
            return Err(VmspaceError::PoolExhausted);
        }
        for _ in 0..count {
            let id = Self::claim_locked(&mut state, zone_id)?;
            // SAFETY: the slot was vacant and we hold the pool lock.
            debug_assert!(unsafe { (*self.slot_ptr(id.index())).is_vacant() });
            batch.ids[batch.len] = Some(id);
            batch.len += 1;
        }
        Ok(batch)
    }

    /// Zero a slot and return it to the vacant stack
    ///
    /// The caller must be the zone that claimed the slot.
    pub(crate) fn release(&self, zone_id: usize, id: VmspaceId) {
        let index = id.index();
        // SAFETY: the slot is claimed by `zone_id`, whose lock the caller holds.
        unsafe { (*self.slot_ptr(index)).reset() };

        let mut state = self.state.lock();
        debug_assert_eq!(state.owners[index], zone_id, "slot {} released by non-owner", index);
        state.owners[index] = 0;
        let top = state.top;
        state.vacant[top] = index as u32;
        state.top += 1;
        state.total_releases += 1;
    }

    /// Release every slot still claimed by `zone_id`
    ///
    /// Only valid once the zone is going away and no longer touches its slots.
    pub(crate) fn release_all(&self, zone_id: usize) -> usize {
        let mut state = self.state.lock();
        let mut released = 0;
        for index in 0..CAP {
            if state.owners[index] != zone_id {
                continue;
            }
            // SAFETY: the owning zone is being torn down and holds its lock.
            unsafe { (*self.slot_ptr(index)).reset() };
            state.owners[index] = 0;
            let top = state.top;
            state.vacant[top] = index as u32;
            state.top += 1;
            state.total_releases += 1;
            released += 1;
        }
        released
    }

    /// Whether `id` is a slot currently claimed by `zone_id`
    pub(crate) fn is_claimed_by(&self, zone_id: usize, id: VmspaceId) -> bool {
        id.index() < CAP && self.state.lock().owners[id.index()] == zone_id
    }
}

impl<const CAP: usize> Default for DescriptorPool<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor pool statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub vacant: usize,
    pub claimed: usize,
    pub total_claims: usize,
    pub total_releases: usize,
}

/// Slots claimed up front for one split; unused ones go back on drop.
pub(crate) struct ClaimedSlots<'p, const CAP: usize> {
    pool: &'p DescriptorPool<CAP>,
    zone_id: usize,
    ids: [Option<VmspaceId>; MAX_BATCH],
    len: usize,
}

impl<const CAP: usize> ClaimedSlots<'_, CAP> {
    pub fn take(&mut self) -> VmspaceResult<VmspaceId> {
        if self.len == 0 {
            return Err(VmspaceError::PoolExhausted);
        }
        self.len -= 1;
        self.ids[self.len].take().ok_or(VmspaceError::PoolExhausted)
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl<const CAP: usize> Drop for ClaimedSlots<'_, CAP> {
    fn drop(&mut self) {
        while let Ok(id) = self.take() {
            self.pool.release(self.zone_id, id);
        }
    }
}

/// One zone's window onto the slots it has claimed
///
/// Every `ZoneState` owns exactly one view, and the view lives inside the
/// zone's lock, so `&mut self` here means the zone lock is held.
pub(crate) struct SlotView<'p, const CAP: usize> {
    pool: &'p DescriptorPool<CAP>,
    zone_id: usize,
}

impl<'p, const CAP: usize> SlotView<'p, CAP> {
    /// # Safety
    ///
    /// `zone_id` must come from `pool.register_zone()` and no other view with
    /// the same id may exist. Only ids claimed through this view (or checked
    /// with [`Self::owns`]) may be passed to the accessors.
    pub(crate) unsafe fn new(pool: &'p DescriptorPool<CAP>, zone_id: usize) -> Self {
        Self { pool, zone_id }
    }

    pub fn zone_id(&self) -> usize {
        self.zone_id
    }

    pub fn get(&self, id: VmspaceId) -> Descriptor {
        // SAFETY: `id` is claimed by this zone and the zone lock is held.
        unsafe { *self.pool.slot_ptr(id.index()) }
    }

    pub fn get_mut(&mut self, id: VmspaceId) -> &mut Descriptor {
        // SAFETY: as in `get`; the returned borrow is tied to `&mut self`.
        unsafe { &mut *self.pool.slot_ptr(id.index()) }
    }

    #[cfg(test)]
    pub fn claim(&mut self) -> VmspaceResult<VmspaceId> {
        self.pool.claim(self.zone_id)
    }

    pub fn claim_batch(&mut self, count: usize) -> VmspaceResult<ClaimedSlots<'p, CAP>> {
        self.pool.claim_batch(self.zone_id, count)
    }

    /// Zero a descriptor this zone no longer needs and give it back
    pub fn retire(&mut self, id: VmspaceId) {
        self.pool.release(self.zone_id, id);
    }

    pub fn owns(&self, id: VmspaceId) -> bool {
        self.pool.is_claimed_by(self.zone_id, id)
    }

    /// Give back every descriptor of this zone; used when the zone is dropped
    pub fn retire_all(&mut self) -> usize {
        self.pool.release_all(self.zone_id)
    }
}
