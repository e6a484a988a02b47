//! Buddy vmspace allocator
//!
//! This crate implements a zone-based buddy allocator for kernel address-space
//! regions ("vmspaces"), featuring:
//! - A fixed descriptor pool shared by all zones (no dynamic metadata allocation)
//! - Per-zone order tables with power-of-two free buckets
//! - Asymmetric splitting of free blocks around the requested size
//! - Coalescing by walking an address-ordered buddy chain
//! - Per-zone locking with a blocking, cancellable allocation path

#![no_std]

#[cfg(test)]
extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

#[cfg(feature = "log")]
use log::error;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Number of orders per zone; valid orders are `0..MAX_ORDER`.
pub const MAX_ORDER: usize = 11;

/// Default number of descriptor slots in a pool
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// The error type used for vmspace operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmspaceError {
    /// The requested size maps to an order outside `[0, MAX_ORDER)`.
    OrderOutOfRange,
    /// No free block at or above the requested order.
    Exhausted,
    /// The descriptor pool has no vacant slot left.
    PoolExhausted,
    /// The handle does not name a live allocation of this zone.
    NotAllocated,
    /// Invalid region passed to the zone (e.g. unaligned or empty).
    InvalidParam,
    /// A blocking allocation was cancelled while waiting.
    Cancelled,
}

/// A [`Result`] type with [`VmspaceError`] as the error type.
pub type VmspaceResult<T = ()> = Result<T, VmspaceError>;

/// Number of pages granted for a request of `size` bytes.
///
/// One page is always added on top of the truncated page count, so sizes
/// that are an exact multiple of the page size receive one spare page.
#[inline]
pub const fn pages_for_size(size: usize, page_size: usize) -> usize {
    size / page_size + 1
}

/// Smallest order whose blocks hold `pages` pages.
#[inline]
const fn order_of_pages(pages: usize) -> Option<usize> {
    match pages.checked_next_power_of_two() {
        Some(p) => Some(p.trailing_zeros() as usize),
        None => None,
    }
}

/// Order of the bucket a request of `size` bytes is served from.
pub fn request_order(size: usize, page_size: usize) -> VmspaceResult<usize> {
    match order_of_pages(pages_for_size(size, page_size)) {
        Some(order) if order < MAX_ORDER => Ok(order),
        _ => {
            error!(
                "vmspace: request of {:#x} bytes needs an order beyond MAX_ORDER {}",
                size, MAX_ORDER
            );
            Err(VmspaceError::OrderOutOfRange)
        }
    }
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod vmspace;
pub use vmspace::{
    CancelToken, DescriptorPool, GrowthDirection, OwnerId, PoolStats, Relax, SpinRelax, Vmspace,
    VmspaceId, Zone, ZoneConfig, ZoneStats,
};
