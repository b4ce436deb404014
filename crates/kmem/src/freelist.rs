//! The kernel page-frame pool.
//!
//! Physical memory is handed out one 4096-byte frame at a time from a
//! singly-linked LIFO free list. The list needs no storage of its own: each
//! free frame's first bytes hold the link to the next free frame, written
//! through the direct map (or the emulated buffer under test).
//!
//! The pool is seeded in two phases. Phase one runs on the boot core while
//! only the early page table exists, so it must not touch the lock; phase
//! two seeds the remaining memory once every core maps all of physical
//! memory, then turns locking on for good. [`PhaseLock`] enforces exactly
//! that discipline.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use alloc::vec::Vec;

use crate::phase_lock::PhaseLock;
use crate::{AddressTranslator, HumanSize, PhysicalAddress};

/// Size in bytes of a physical page frame.
pub const FRAME_SIZE: usize = 4096;

/// Byte written across a frame when it is freed. A dangling reference into a
/// freed frame then reads garbage instead of plausibly-valid data.
const JUNK_BYTE: u8 = 0x01;

/// Intrusive free-list node, living in the first bytes of a free frame.
#[repr(C)]
struct FreeFrame {
    next: *mut FreeFrame,
}

/// Singly-linked LIFO list of free frames.
struct FreeList {
    head: *mut FreeFrame,
    len: usize,
}

// SAFETY: the head pointer refers to frames owned exclusively by the list;
// the allocator serializes all access through its phase lock.
unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// Pushes a frame node onto the list head.
    fn push(&mut self, node: *mut FreeFrame) {
        unsafe {
            (*node).next = self.head;
        }
        self.head = node;
        self.len += 1;
    }

    /// Pops the head node, returning None if the list is empty.
    fn pop(&mut self) -> Option<NonNull<FreeFrame>> {
        let head = NonNull::new(self.head)?;
        self.head = unsafe { (*head.as_ptr()).next };
        self.len -= 1;
        Some(head)
    }
}

/// Bootstrap progress: nothing seeded yet.
const PHASE_NEW: u8 = 0;
/// Bootstrap progress: the early pool is seeded, locking still off.
const PHASE_EARLY: u8 = 1;
/// Bootstrap progress: the full pool is seeded and locking is on.
const PHASE_READY: u8 = 2;

/// Allocator for physical page frames.
///
/// Frames below the end of the kernel image or at/past the physical memory
/// ceiling are never valid to free; both bounds are fixed at construction
/// from what the boot code reports.
///
/// Allocation and freeing are short, non-blocking critical sections. An
/// empty pool is reported immediately as `None`, never awaited. No
/// atomicity is provided across calls: the pool may change arbitrarily
/// between two operations.
pub struct FrameAllocator {
    free: PhaseLock<FreeList>,
    phase: AtomicU8,
    kernel_end: PhysicalAddress,
    ceiling: PhysicalAddress,
}

impl FrameAllocator {
    /// Creates an empty allocator for frames in `[kernel_end, ceiling)`.
    ///
    /// `kernel_end` is the first address past the loaded kernel image;
    /// `ceiling` is the top of physical memory. The pool starts empty with
    /// locking disabled; seed it with [`init_phase_one`] and
    /// [`init_phase_two`].
    ///
    /// [`init_phase_one`]: FrameAllocator::init_phase_one
    /// [`init_phase_two`]: FrameAllocator::init_phase_two
    pub const fn new(kernel_end: PhysicalAddress, ceiling: PhysicalAddress) -> Self {
        Self {
            free: PhaseLock::new(FreeList::new()),
            phase: AtomicU8::new(PHASE_NEW),
            kernel_end,
            ceiling,
        }
    }

    /// Seeds the early pool from every whole frame in `[start, end)`.
    ///
    /// Runs without locking: only the boot core is alive at this point, and
    /// the ranges mapped by the early page table are all it can reach. Must
    /// be called exactly once, before any allocation.
    ///
    /// # Panics
    ///
    /// Panics if the early pool was already seeded.
    pub fn init_phase_one(&self, start: PhysicalAddress, end: PhysicalAddress) {
        assert!(
            self.phase
                .compare_exchange(PHASE_NEW, PHASE_EARLY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "early pool already seeded"
        );

        let frames = self.free_range(start, end);
        log::debug!(
            "early frame pool: {} frames ({}) in [{}, {})",
            frames,
            HumanSize(frames * FRAME_SIZE),
            start,
            end
        );
    }

    /// Seeds the rest of the pool from `[start, end)`, then enables locking.
    ///
    /// The caller guarantees that a page table mapping all physical memory
    /// is installed on every core before this runs; the allocator trusts
    /// that and does not verify it. Must be called exactly once, after
    /// [`init_phase_one`](FrameAllocator::init_phase_one).
    ///
    /// # Panics
    ///
    /// Panics if the early pool has not been seeded, or if the full pool
    /// already was.
    pub fn init_phase_two(&self, start: PhysicalAddress, end: PhysicalAddress) {
        match self
            .phase
            .compare_exchange(PHASE_EARLY, PHASE_READY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(PHASE_NEW) => panic!("full pool seeding requires the early pool to be seeded first"),
            Err(_) => panic!("full pool already seeded"),
        }

        let frames = self.free_range(start, end);
        self.free.enable();
        log::debug!(
            "full frame pool: {} more frames ({}) in [{}, {}); locking enabled",
            frames,
            HumanSize(frames * FRAME_SIZE),
            start,
            end
        );
    }

    /// Frees every whole frame contained in `[start, end)`.
    ///
    /// Walks the range at increasing addresses, so the last frame freed (and
    /// therefore the next one allocated) is the highest-addressed one.
    fn free_range(&self, start: PhysicalAddress, end: PhysicalAddress) -> usize {
        let mut frame = start.align_up(FRAME_SIZE);
        let mut count = 0;
        while frame.as_usize() + FRAME_SIZE <= end.as_usize() {
            self.free(frame);
            frame = frame + FRAME_SIZE;
            count += 1;
        }
        count
    }

    /// Returns `frame` to the pool.
    ///
    /// The frame's previous contents are destroyed: the whole frame is
    /// overwritten with a junk pattern before it is linked in, and the list
    /// node itself occupies the frame's first bytes. Callers must be done
    /// reading the frame.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not frame-aligned, lies below the end of the
    /// kernel image, or lies at/above the physical memory ceiling. Any of
    /// those indicates a bug in the caller; continuing would corrupt the
    /// pool.
    pub fn free(&self, frame: PhysicalAddress) {
        assert!(
            frame.is_aligned(FRAME_SIZE),
            "freed frame {frame} is not aligned to the frame size"
        );
        assert!(
            frame >= self.kernel_end,
            "freed frame {frame} overlaps the kernel image"
        );
        assert!(
            frame < self.ceiling,
            "freed frame {frame} is past the end of physical memory"
        );

        let node: *mut u8 = AddressTranslator::current().phys_to_ptr(frame);
        // SAFETY: the checks above guarantee `frame` is a whole, aligned
        // frame inside the allocator's range, and the caller is handing
        // ownership of it back.
        unsafe {
            ptr::write_bytes(node, JUNK_BYTE, FRAME_SIZE);
        }

        self.free.with(|list| list.push(node.cast()));
    }

    /// Allocates one frame, or returns `None` when the pool is empty.
    ///
    /// The most recently freed frame is returned first. The frame's
    /// contents are NOT cleared; callers see whatever junk or stale data
    /// the frame last held.
    pub fn allocate(&self) -> Option<PhysicalAddress> {
        let node = self.free.with(|list| list.pop())?;
        Some(AddressTranslator::current().ptr_to_phys(node.as_ptr()))
    }

    /// Returns the number of frames currently in the pool.
    pub fn free_frames(&self) -> usize {
        self.free.with(|list| list.len)
    }

    /// Returns the addresses of all free frames, in list traversal order.
    ///
    /// Purely an inspection aid; the pool may change the moment this
    /// returns.
    pub fn free_list(&self) -> Vec<PhysicalAddress> {
        self.free.with(|list| {
            let translator = AddressTranslator::current();
            let mut frames = Vec::with_capacity(list.len);
            let mut cursor = list.head;
            while let Some(node) = NonNull::new(cursor) {
                frames.push(translator.ptr_to_phys(node.as_ptr()));
                cursor = unsafe { (*node.as_ptr()).next };
            }
            frames
        })
    }

    /// Returns whether the bootstrap has completed and locking is active.
    pub fn locking_enabled(&self) -> bool {
        self.free.is_enabled()
    }
}
