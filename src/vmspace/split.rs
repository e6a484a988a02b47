//! Splitting engine
//!
//! Carves the granted part off the front of a free block and breaks what is
//! left into power-of-two blocks, keeping the buddy chain contiguous.

#[cfg(feature = "log")]
use log::trace;

use super::block::{Vmspace, VmspaceId};
use super::descriptor_pool::ClaimedSlots;
use super::zone::{divide_cost, ZoneState};
use crate::{pages_for_size, VmspaceResult};

impl<const PAGE_SIZE: usize, const CAP: usize> ZoneState<'_, PAGE_SIZE, CAP> {
    /// Grant `size` bytes from the front of the detached free block `source`
    ///
    /// Every descriptor the split needs is claimed before anything changes,
    /// so on error `source` is untouched.
    pub(super) fn select_and_divide(
        &mut self,
        source: VmspaceId,
        size: usize,
    ) -> VmspaceResult<Vmspace> {
        let pages_needed = pages_for_size(size, PAGE_SIZE);
        let granted_size = pages_needed * PAGE_SIZE;
        let src = self.slots.get(source);
        debug_assert!(!src.used && src.bucket.is_none());
        debug_assert!(src.present_size >= granted_size);
        let reserve_pages = (src.present_size - granted_size) / PAGE_SIZE;

        if reserve_pages == 0 {
            // Exact fit: the free descriptor itself is handed out.
            return Ok(self.grant(source));
        }

        // One for the granted block, the rest for the reserve pieces.
        let mut claimed = self.slots.claim_batch(1 + divide_cost(reserve_pages))?;
        let granted = claimed.take()?;
        {
            let desc = self.slots.get_mut(granted);
            desc.start = src.start;
            desc.present_size = granted_size;
            desc.initial_size = granted_size;
            desc.owner = src.owner;
        }
        self.link_before(source, granted);

        let remainder_start = self.growth.advance(src.start, granted_size);
        {
            let desc = self.slots.get_mut(source);
            desc.start = remainder_start;
            desc.present_size = reserve_pages * PAGE_SIZE;
        }

        trace!(
            "zone {}: split {:#x} pages at {:#x}: {} granted, {} reserved",
            self.zone_id,
            src.present_size / PAGE_SIZE,
            src.start,
            pages_needed,
            reserve_pages
        );

        if reserve_pages.is_power_of_two() {
            self.insert_free(source);
        } else {
            self.divide(source, &mut claimed)?;
        }

        Ok(self.grant(granted))
    }

    /// Break the free block `id` into power-of-two blocks and bucket them
    ///
    /// Pieces are laid out along the growth direction by ascending size: `id`
    /// keeps the smallest one, every larger piece gets a descriptor from
    /// `claimed`. Returns the highest order bucketed.
    pub(super) fn divide(
        &mut self,
        id: VmspaceId,
        claimed: &mut ClaimedSlots<'_, CAP>,
    ) -> VmspaceResult<usize> {
        let desc = self.slots.get(id);
        let pages = desc.present_size / PAGE_SIZE;
        debug_assert!(pages > 0);
        debug_assert!(claimed.len() >= divide_cost(pages));

        let first = pages & pages.wrapping_neg();
        self.slots.get_mut(id).present_size = first * PAGE_SIZE;
        let mut highest = self.insert_free(id);

        let mut rest = pages - first;
        let mut start = self.growth.advance(desc.start, first * PAGE_SIZE);
        let mut prev = id;
        while rest != 0 {
            let chunk = rest & rest.wrapping_neg();
            let piece = claimed.take()?;
            {
                let piece_desc = self.slots.get_mut(piece);
                piece_desc.start = start;
                piece_desc.present_size = chunk * PAGE_SIZE;
                piece_desc.initial_size = chunk * PAGE_SIZE;
                piece_desc.owner = desc.owner;
            }
            self.link_after(prev, piece);
            highest = highest.max(self.insert_free(piece));

            trace!(
                "zone {}: divided off {} pages at {:#x}",
                self.zone_id,
                chunk,
                start
            );
            start = self.growth.advance(start, chunk * PAGE_SIZE);
            rest -= chunk;
            prev = piece;
        }

        Ok(highest)
    }
}
