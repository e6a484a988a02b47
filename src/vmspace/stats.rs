//! Statistics and debugging for vmspace zones
//!
//! Provides per-zone snapshots and failure reporting.

#[cfg(feature = "log")]
use log::{error, info};

use super::block::GrowthDirection;
use crate::MAX_ORDER;

/// Snapshot of one zone's accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStats {
    pub zone_id: usize,
    /// Pages handed to the zone through `add_region`
    pub total_pages: usize,
    pub used_pages: usize,
    pub free_pages: usize,
    pub free_blocks_by_order: [usize; MAX_ORDER],
    pub allocations: usize,
    pub frees: usize,
    pub merges: usize,
}

impl ZoneStats {
    pub const fn new(zone_id: usize) -> Self {
        Self {
            zone_id,
            total_pages: 0,
            used_pages: 0,
            free_pages: 0,
            free_blocks_by_order: [0; MAX_ORDER],
            allocations: 0,
            frees: 0,
            merges: 0,
        }
    }

    /// Number of free blocks across all orders
    pub fn free_blocks(&self) -> usize {
        self.free_blocks_by_order.iter().sum()
    }
}

/// Detailed memory statistics reporter
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Print detailed allocation failure statistics
    #[allow(unused_variables)]
    pub fn print_alloc_failure_stats(
        page_size: usize,
        stats: &ZoneStats,
        request_size: usize,
        request_order: usize,
    ) {
        error!("========================================");
        error!(
            "Zone {}: request of {} bytes (order {}) cannot be satisfied",
            stats.zone_id, request_size, request_order
        );
        error!(
            "  Total pages: {} ({} KB)",
            stats.total_pages,
            (stats.total_pages * page_size) / 1024
        );
        error!(
            "  Free pages: {} ({} KB)",
            stats.free_pages,
            (stats.free_pages * page_size) / 1024
        );
        error!(
            "  Used pages: {} ({} KB)",
            stats.used_pages,
            (stats.used_pages * page_size) / 1024
        );
        error!("  Free blocks by order:");
        for order in (0..MAX_ORDER).rev() {
            let count = stats.free_blocks_by_order[order];
            if count > 0 {
                error!(
                    "    Order {}: {} blocks ({} KB each)",
                    order,
                    count,
                    ((1 << order) * page_size) / 1024
                );
            }
        }
        error!("========================================");
    }

    /// Print zone layout and block distribution
    #[allow(unused_variables)]
    pub fn print_zone_info(page_size: usize, growth: GrowthDirection, stats: &ZoneStats) {
        info!("========== Vmspace Zone {} ==========", stats.zone_id);
        info!("Page size: {:#x}, growth: {:?}", page_size, growth);
        info!(
            "Pages: total {}, used {}, free {}",
            stats.total_pages, stats.used_pages, stats.free_pages
        );
        info!(
            "Operations: {} allocations, {} frees, {} merges",
            stats.allocations, stats.frees, stats.merges
        );
        for order in 0..MAX_ORDER {
            let count = stats.free_blocks_by_order[order];
            if count > 0 {
                let block_size = (1 << order) * page_size;
                info!(
                    "  Order {}: {} blocks (size {} bytes each, total {:#x})",
                    order,
                    count,
                    block_size,
                    count * block_size
                );
            }
        }
        info!("======================================");
    }
}
