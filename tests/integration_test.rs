//! Integration tests for the vmspace allocator
//!
//! Drives zones only through the public API, covering full allocate/free
//! cycles, growth directions and several zones sharing one pool.

#![no_std]

extern crate alloc;
extern crate buddy_vmspace_allocator;

use alloc::vec::Vec;
use buddy_vmspace_allocator::{
    pages_for_size, request_order, DescriptorPool, GrowthDirection, Vmspace, VmspaceError, Zone,
    ZoneConfig, MAX_ORDER,
};

const PAGE_SIZE: usize = 0x1000;
const POOL_CAP: usize = 256;

type TestZone<'p> = Zone<'p, PAGE_SIZE, POOL_CAP>;

fn free_ranges(zone: &TestZone<'_>, order: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    zone.for_each_free_block(order, |r| ranges.push((r.start, r.end)));
    ranges
}

fn bucket_counts(zone: &TestZone<'_>) -> [usize; MAX_ORDER] {
    zone.stats().free_blocks_by_order
}

#[test]
fn test_allocate_free_round_trip() {
    let pool = DescriptorPool::<POOL_CAP>::new();
    let zone = TestZone::new(&pool, ZoneConfig::default());
    zone.add_region(0x10_0000, 16 * PAGE_SIZE, 42).unwrap();
    let counts_before = bucket_counts(&zone);
    let claimed_before = pool.get_stats().claimed;

    let v = zone.allocate(20000).unwrap();
    assert_eq!(v.start(), 0x10_0000);
    assert_eq!(v.size(), 20480);
    assert_eq!(v.range(), 0x10_0000..0x10_5000);
    assert_eq!(v.owner(), 42);
    assert_eq!(v.zone_id(), zone.id());

    // Remaining 11 pages as 1 + 2 + 8
    assert_eq!(free_ranges(&zone, 0), [(0x10_5000, 0x10_6000)]);
    assert_eq!(free_ranges(&zone, 1), [(0x10_6000, 0x10_8000)]);
    assert_eq!(free_ranges(&zone, 3), [(0x10_8000, 0x11_0000)]);
    assert_eq!(zone.free_pages(), 11);
    assert!(zone.check_consistency());

    zone.free(v).unwrap();
    assert_eq!(bucket_counts(&zone), counts_before);
    assert_eq!(free_ranges(&zone, 4), [(0x10_0000, 0x11_0000)]);
    assert_eq!(pool.get_stats().claimed, claimed_before);

    let stats = zone.stats();
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.merges, 1);
    assert_eq!(stats.used_pages, 0);
    assert_eq!(stats.free_pages, 16);
    assert!(zone.check_consistency());
}

#[test]
fn test_granted_size_matches_request() {
    let pool = DescriptorPool::<POOL_CAP>::new();
    let zone = TestZone::new(&pool, ZoneConfig::default());
    zone.add_region(0, 1024 * PAGE_SIZE, 0).unwrap();

    for size in [0, 1, PAGE_SIZE - 1, PAGE_SIZE, 3 * PAGE_SIZE + 17, 100 * PAGE_SIZE] {
        let order = request_order(size, PAGE_SIZE).unwrap();
        let v = zone.allocate(size).unwrap();
        assert_eq!(v.size(), pages_for_size(size, PAGE_SIZE) * PAGE_SIZE);
        assert!(v.size() > size);
        assert!(v.size() <= PAGE_SIZE << order);
        assert!(zone.check_consistency());
        zone.free(v).unwrap();
    }
    assert_eq!(zone.free_pages(), 1024);
    assert!(zone.check_consistency());
}

#[test]
fn test_fill_and_drain() {
    let pool = DescriptorPool::<POOL_CAP>::new();
    let zone = TestZone::new(&pool, ZoneConfig::default());
    zone.add_region(0, 16 * PAGE_SIZE, 0).unwrap();

    let mut regions: Vec<Vmspace> = Vec::new();
    loop {
        match zone.allocate(0) {
            Ok(v) => regions.push(v),
            Err(e) => {
                assert_eq!(e, VmspaceError::Exhausted);
                break;
            }
        }
    }
    assert_eq!(regions.len(), 16);
    assert_eq!(zone.free_pages(), 0);

    // Single pages never overlap and cover the region
    let mut starts: Vec<usize> = regions.iter().map(|v| v.start()).collect();
    starts.sort_unstable();
    for (i, start) in starts.iter().enumerate() {
        assert_eq!(*start, i * PAGE_SIZE);
    }

    for v in regions.drain(..).rev() {
        zone.free(v).unwrap();
        assert!(zone.check_consistency());
    }
    assert_eq!(zone.free_pages(), 16);
    assert_eq!(zone.stats().used_pages, 0);
}

#[test]
fn test_downward_zone() {
    let pool = DescriptorPool::<POOL_CAP>::new();
    let zone = TestZone::new(
        &pool,
        ZoneConfig {
            growth: GrowthDirection::Downward,
        },
    );
    let top = 0xffff_0000;
    zone.add_region(top, 32 * PAGE_SIZE, 0).unwrap();
    assert_eq!(free_ranges(&zone, 5), [(top - 32 * PAGE_SIZE, top)]);

    let a = zone.allocate(PAGE_SIZE).unwrap();
    let b = zone.allocate(PAGE_SIZE).unwrap();
    assert_eq!(a.start(), top);
    assert_eq!(a.range(), top - 2 * PAGE_SIZE..top);
    assert_eq!(b.range().end, a.range().start);

    zone.free(b).unwrap();
    zone.free(a).unwrap();
    assert_eq!(zone.free_pages(), 32);
    assert!(zone.check_consistency());
}

#[test]
fn test_zones_are_isolated() {
    let pool = DescriptorPool::<POOL_CAP>::new();
    let first = TestZone::new(&pool, ZoneConfig::default());
    let second = TestZone::new(&pool, ZoneConfig::default());
    first.add_region(0x100_0000, 64 * PAGE_SIZE, 1).unwrap();
    second.add_region(0x200_0000, 64 * PAGE_SIZE, 2).unwrap();

    let mut held = Vec::new();
    for size in [20000, 0, 3 * PAGE_SIZE, 7 * PAGE_SIZE] {
        held.push((first.allocate(size).unwrap(), second.allocate(size).unwrap()));
    }
    for (a, b) in &held {
        assert!(first.stats().zone_id != b.zone_id());
        assert!(a.range().end <= 0x200_0000);
        assert!(b.range().start >= 0x200_0000);
        assert_eq!(second.free(*a), Err(VmspaceError::NotAllocated));
    }
    for (a, b) in held {
        first.free(a).unwrap();
        second.free(b).unwrap();
    }

    assert_eq!(first.free_pages(), 64);
    assert_eq!(second.free_pages(), 64);
    assert!(first.check_consistency());
    assert!(second.check_consistency());
}

#[test]
fn test_exhaustion_reports_without_side_effects() {
    let pool = DescriptorPool::<POOL_CAP>::new();
    let zone = TestZone::new(&pool, ZoneConfig::default());
    zone.add_region(0, 8 * PAGE_SIZE, 0).unwrap();

    let v = zone.allocate(5 * PAGE_SIZE).unwrap();
    assert_eq!(v.size(), 6 * PAGE_SIZE);
    let before = zone.stats();

    assert_eq!(zone.allocate(2 * PAGE_SIZE), Err(VmspaceError::Exhausted));
    assert_eq!(
        zone.allocate(1 << 30),
        Err(VmspaceError::OrderOutOfRange)
    );
    assert_eq!(zone.stats(), before);

    zone.print_zone_info();
    zone.free(v).unwrap();
    assert_eq!(zone.free_block_count(3), 1);
}

#[test]
fn test_dropped_zone_returns_descriptors() {
    let pool = DescriptorPool::<POOL_CAP>::new();
    {
        let zone = TestZone::new(&pool, ZoneConfig::default());
        zone.add_region(0, 100 * PAGE_SIZE, 0).unwrap();
        let _held = zone.allocate(20000).unwrap();
        assert!(pool.get_stats().claimed > 0);
    }
    let stats = pool.get_stats();
    assert_eq!(stats.claimed, 0);
    assert_eq!(stats.vacant, POOL_CAP);
    assert_eq!(stats.total_claims, stats.total_releases);
}
