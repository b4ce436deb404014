//! Share counting for copy-on-write frame tracking.
//!
//! The page-fault path needs to know how many owners still reference a
//! physical frame before it may reuse or remap it. [`ShareCountIndex`] is a
//! point-in-time snapshot of the free list, pairing each frame address with
//! a share count and answering lookups by binary search.
//!
//! The index is stale by design: frames that enter or leave the pool after
//! [`capture`](ShareCountIndex::capture) are simply absent. It also carries
//! no lock of its own; mutation goes through `&mut self`, so concurrent
//! writers are ruled out at compile time and any sharing must be arranged by
//! the caller.

use alloc::boxed::Box;

use crate::{FrameAllocator, PhysicalAddress};

/// Maximum number of frames one index can hold.
///
/// Chosen to exceed the frame count of any supported machine. A free list
/// larger than this cannot be captured; see
/// [`capture`](ShareCountIndex::capture).
pub const INDEX_CAPACITY: usize = 58_000;

#[derive(Clone, Copy, Debug)]
struct Slot {
    frame: PhysicalAddress,
    count: u32,
}

/// Address-sorted snapshot of the free list with per-frame share counts.
pub struct ShareCountIndex {
    slots: Box<[Slot]>,
}

impl ShareCountIndex {
    /// Builds an index from the allocator's current free list.
    ///
    /// Every frame that is free right now gets a slot with a share count of
    /// zero. Slots are sorted by address, so lookup correctness does not
    /// depend on how the free list happened to be threaded at capture time.
    ///
    /// # Panics
    ///
    /// Panics if the free list holds more than [`INDEX_CAPACITY`] frames.
    pub fn capture(allocator: &FrameAllocator) -> Self {
        let mut frames = allocator.free_list();
        assert!(
            frames.len() <= INDEX_CAPACITY,
            "free list ({} frames) exceeds the share-count index capacity ({INDEX_CAPACITY})",
            frames.len()
        );

        frames.sort_unstable();
        let slots: Box<[Slot]> = frames
            .into_iter()
            .map(|frame| Slot { frame, count: 0 })
            .collect();

        log::trace!("share-count index captured over {} free frames", slots.len());
        Self { slots }
    }

    /// Finds the slot for `frame`, or `None` if it was not free at capture
    /// time.
    pub fn lookup(&self, frame: PhysicalAddress) -> Option<usize> {
        self.slots.binary_search_by_key(&frame, |slot| slot.frame).ok()
    }

    /// Adds one owner to `frame`'s share count.
    ///
    /// Returns the new count, or `None` if the frame is not in the index.
    pub fn increment(&mut self, frame: PhysicalAddress) -> Option<u32> {
        let idx = self.lookup(frame)?;
        let slot = &mut self.slots[idx];
        slot.count += 1;
        Some(slot.count)
    }

    /// Removes one owner from `frame`'s share count.
    ///
    /// Counts never go below zero. Returns the new count, or `None` if the
    /// frame is not in the index.
    pub fn decrement(&mut self, frame: PhysicalAddress) -> Option<u32> {
        let idx = self.lookup(frame)?;
        let slot = &mut self.slots[idx];
        slot.count = slot.count.saturating_sub(1);
        Some(slot.count)
    }

    /// Returns `frame`'s share count, or `None` if the frame is not in the
    /// index. A present-but-unshared frame reports `Some(0)`, which is
    /// distinct from absence.
    pub fn count(&self, frame: PhysicalAddress) -> Option<u32> {
        self.lookup(frame).map(|idx| self.slots[idx].count)
    }

    /// Returns the number of frames in the index.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the index holds no frames.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates over `(frame, share count)` pairs in ascending address
    /// order. Inspection aid.
    pub fn iter(&self) -> impl Iterator<Item = (PhysicalAddress, u32)> + '_ {
        self.slots.iter().map(|slot| (slot.frame, slot.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressTranslator, FRAME_SIZE};

    const EMULATED_BYTES: usize = 4 * 1024 * 1024;

    /// An allocator over a fresh emulated region with `frames` seeded frames.
    fn seeded_allocator(frames: usize) -> (FrameAllocator, PhysicalAddress) {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(EMULATED_BYTES));
        }
        let base = AddressTranslator::current()
            .allocate(frames * FRAME_SIZE, FRAME_SIZE)
            .expect("emulated memory exhausted");
        let start = PhysicalAddress::new(base);
        let end = PhysicalAddress::new(base + frames * FRAME_SIZE);

        let allocator = FrameAllocator::new(start, end);
        allocator.init_phase_one(start, end);
        (allocator, start)
    }

    #[test]
    fn every_free_frame_is_present_with_count_zero() {
        let (allocator, _) = seeded_allocator(4);
        let index = ShareCountIndex::capture(&allocator);

        assert_eq!(index.len(), 4);
        for frame in allocator.free_list() {
            assert!(index.lookup(frame).is_some());
            assert_eq!(index.count(frame), Some(0));
        }
    }

    #[test]
    fn never_freed_address_is_absent() {
        // Seed only the low 3 frames of a 4-frame region.
        let (allocator, start) = {
            let (allocator, start) = seeded_allocator(4);
            // Drain and re-seed a subset for a well-known pool.
            while allocator.allocate().is_some() {}
            for i in 0..3 {
                allocator.free(start + i * FRAME_SIZE);
            }
            (allocator, start)
        };

        let index = ShareCountIndex::capture(&allocator);
        assert_eq!(index.len(), 3);
        assert_eq!(index.lookup(start + 3 * FRAME_SIZE), None);
        assert_eq!(index.count(start + 3 * FRAME_SIZE), None);
    }

    #[test]
    fn slots_are_sorted_by_address() {
        let (allocator, _) = seeded_allocator(5);
        // The live list runs highest-to-lowest; the index must not.
        let index = ShareCountIndex::capture(&allocator);

        let addresses: Vec<_> = index.iter().map(|(frame, _)| frame).collect();
        let mut sorted = addresses.clone();
        sorted.sort_unstable();
        assert_eq!(addresses, sorted);
    }

    #[test]
    fn share_counts_round_trip() {
        let (allocator, start) = seeded_allocator(2);
        let mut index = ShareCountIndex::capture(&allocator);

        assert_eq!(index.increment(start), Some(1));
        assert_eq!(index.increment(start), Some(2));
        assert_eq!(index.decrement(start), Some(1));
        assert_eq!(index.count(start), Some(1));

        // The other frame is untouched.
        assert_eq!(index.count(start + FRAME_SIZE), Some(0));
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let (allocator, start) = seeded_allocator(1);
        let mut index = ShareCountIndex::capture(&allocator);

        assert_eq!(index.decrement(start), Some(0));
        assert_eq!(index.count(start), Some(0));
    }

    #[test]
    fn mutating_an_absent_frame_reports_none() {
        let (allocator, start) = seeded_allocator(1);
        let mut index = ShareCountIndex::capture(&allocator);

        let absent = start + FRAME_SIZE;
        assert_eq!(index.increment(absent), None);
        assert_eq!(index.decrement(absent), None);
    }

    #[test]
    fn capture_is_a_point_in_time_snapshot() {
        let (allocator, _) = seeded_allocator(2);
        let index = ShareCountIndex::capture(&allocator);

        // Allocating after the capture does not remove the frame from the
        // index; it is stale by design.
        let frame = allocator.allocate().unwrap();
        assert_eq!(index.count(frame), Some(0));
    }

    #[test]
    fn recapture_reflects_the_new_pool() {
        let (allocator, _) = seeded_allocator(3);
        let first = ShareCountIndex::capture(&allocator);
        assert_eq!(first.len(), 3);

        let frame = allocator.allocate().unwrap();
        let second = ShareCountIndex::capture(&allocator);
        assert_eq!(second.len(), 2);
        assert_eq!(second.lookup(frame), None);
    }

    #[test]
    fn empty_pool_captures_an_empty_index() {
        let (allocator, start) = seeded_allocator(1);
        allocator.allocate().unwrap();

        let index = ShareCountIndex::capture(&allocator);
        assert!(index.is_empty());
        assert_eq!(index.lookup(start), None);
    }
}
