#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Kernel page-frame allocator
//!
//! `kmem` hands out and reclaims 4096-byte physical page frames for the rest
//! of the kernel. It provides:
//!
//! - A LIFO free list whose nodes live inside the free frames themselves, so
//!   the allocator needs no storage of its own.
//! - A two-phase bootstrap: an early pool is seeded before secondary cores
//!   have a usable page table (and therefore without locking), and the full
//!   pool is seeded once all physical memory is mapped everywhere.
//! - A share-count index over a snapshot of the free list, used to track how
//!   many owners reference a frame for copy-on-write page handling.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
#[cfg(any(test, feature = "software-emulation"))]
mod emulated;
mod freelist;
mod human_size;
mod phase_lock;
mod refcount;

pub use address::{AddressTranslator, PhysicalAddress};
#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::EmulatedMemory;
pub use freelist::{FRAME_SIZE, FrameAllocator};
pub use human_size::HumanSize;
pub use phase_lock::PhaseLock;
pub use refcount::{INDEX_CAPACITY, ShareCountIndex};
