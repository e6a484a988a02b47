//! Buddy vmspace allocator module
//!
//! This module provides the zone-based buddy system with:
//! - A shared fixed-capacity descriptor pool
//! - Per-zone order tables with O(1) removal
//! - Splitting and chain-walking coalescing engines
//! - Blocking allocation with cancellation

pub mod block;
mod coalesce;
pub mod descriptor_pool;
pub mod order_table;
mod split;
pub mod stats;
pub mod wait;
pub mod zone;

pub use block::{GrowthDirection, OwnerId, Vmspace, VmspaceId};
pub use descriptor_pool::{DescriptorPool, PoolStats};
pub use order_table::{OrderBucket, OrderTable};
pub use stats::{MemoryStatsReporter, ZoneStats};
pub use wait::{CancelToken, Relax, SpinRelax};
pub use zone::{Zone, ZoneConfig, MAX_BLOCK_PAGES};
