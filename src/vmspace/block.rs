//! Vmspace block metadata
//!
//! Describes one contiguous address-space region, free or allocated, and the
//! handle given out to callers for allocated regions.

use core::ops::Range;

/// Opaque identifier of the holder of a region.
pub type OwnerId = usize;

/// Index of a descriptor slot in the [`DescriptorPool`](super::DescriptorPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmspaceId(u32);

impl VmspaceId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Slot index inside the pool
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Direction in which successive allocations move through a source block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowthDirection {
    /// A block covers `[start, start + size)`; `start` increases as space is handed out.
    #[default]
    Upward,
    /// A block covers `[start - size, start)`; `start` decreases as space is handed out.
    Downward,
}

impl GrowthDirection {
    /// Moves `start` by `bytes` along the growth direction.
    #[inline]
    pub const fn advance(self, start: usize, bytes: usize) -> usize {
        match self {
            GrowthDirection::Upward => start + bytes,
            GrowthDirection::Downward => start - bytes,
        }
    }

    /// Address range covered by a block with the given `start` and `size`.
    #[inline]
    pub const fn span(self, start: usize, size: usize) -> Range<usize> {
        match self {
            GrowthDirection::Upward => start..start + size,
            GrowthDirection::Downward => start - size..start,
        }
    }
}

/// Block descriptor stored in a pool slot
///
/// `bucket`/`order_prev`/`order_next` form the order-bucket membership and are
/// only meaningful while the block is free. `buddy_prev`/`buddy_next` link the
/// block to its physical neighbours regardless of state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Descriptor {
    pub start: usize,
    pub present_size: usize,
    /// Size when the block was carved or last merged. Splits only shrink
    /// `present_size`, so `present_size <= initial_size` holds for every
    /// live descriptor; the zone consistency check verifies it. Nothing
    /// else reads it apart from the vacancy test.
    pub initial_size: usize,
    pub owner: OwnerId,
    pub used: bool,
    pub generation: u32,
    pub bucket: Option<u8>,
    pub order_prev: Option<VmspaceId>,
    pub order_next: Option<VmspaceId>,
    pub buddy_prev: Option<VmspaceId>,
    pub buddy_next: Option<VmspaceId>,
}

impl Descriptor {
    pub const fn vacant() -> Self {
        Self {
            start: 0,
            present_size: 0,
            initial_size: 0,
            owner: 0,
            used: false,
            generation: 0,
            bucket: None,
            order_prev: None,
            order_next: None,
            buddy_prev: None,
            buddy_next: None,
        }
    }

    /// A slot may be handed out again only when both sizes are zero.
    pub const fn is_vacant(&self) -> bool {
        self.present_size == 0 && self.initial_size == 0
    }

    /// Wipes everything but the generation counter.
    pub fn reset(&mut self) {
        let generation = self.generation;
        *self = Self::vacant();
        self.generation = generation;
    }
}

/// An allocated region handed out by a [`Zone`](super::Zone)
///
/// The handle is the only way to free a region; it is checked against the
/// descriptor it names, so a stale or duplicated handle is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vmspace {
    pub(crate) zone_id: usize,
    pub(crate) id: VmspaceId,
    pub(crate) generation: u32,
    pub(crate) start: usize,
    pub(crate) size: usize,
    pub(crate) owner: OwnerId,
    pub(crate) growth: GrowthDirection,
}

impl Vmspace {
    /// Start address, interpreted according to the zone's growth direction
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Address range covered by this region
    pub const fn range(&self) -> Range<usize> {
        self.growth.span(self.start, self.size)
    }

    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    pub const fn zone_id(&self) -> usize {
        self.zone_id
    }

    pub const fn id(&self) -> VmspaceId {
        self.id
    }
}
