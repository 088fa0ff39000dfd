//! Two-tier heap allocator for kernel and process address spaces.
//!
//! A [`Heap`] manages one virtual address range split into two tiers:
//!
//! - a **block tier** for small and medium requests: a growable arena carved
//!   into boundary-tagged blocks with an address-ordered free list, split on
//!   allocation and coalesced on free;
//! - a **page tier** for large requests: a fixed range handed out in whole
//!   pages and tracked by a descriptor table with one slot per page.
//!
//! The heap dispatches each request by size and each pointer by address,
//! and resizes across tiers when a new size belongs to the other one. Page
//! runs grow in place when their neighbour is free and otherwise move by
//! remapping their frames instead of copying bytes.
//!
//! The heap owns no memory of its own. It talks to the frame subsystem
//! through the [`AddressSpace`] trait, and every boundary tag and link word
//! is read and written through that trait too.
//!
//! # Usage
//!
//! ```rust
//! use kheap::{Heap, HeapLayout, PAGE_SIZE, VirtAddr, testing::SimAddressSpace};
//!
//! let layout = HeapLayout::new(
//!     VirtAddr::new(0x10_0000),
//!     PAGE_SIZE,
//!     VirtAddr::new(0x20_0000),
//!     VirtAddr::new(0x30_0000),
//! );
//! let heap: Heap<_, 256> = Heap::new(layout, SimAddressSpace::new(64));
//!
//! let small = heap.allocate(48).unwrap();
//! let large = heap.allocate(3 * PAGE_SIZE).unwrap();
//! assert_eq!(heap.allocation_size(large), 3 * PAGE_SIZE);
//!
//! let moved = heap.resize(small, 2 * PAGE_SIZE).unwrap().unwrap();
//! heap.free(moved);
//! heap.free(large);
//! ```
//!
//! # Errors and Violations
//!
//! Running out of arena, page range or frames is an ordinary [`AllocError`]
//! or [`GrowError`] and leaves the heap unchanged. Breaking the heap's
//! contract, such as freeing an address outside both tiers or freeing a page
//! run twice, is a [`Violation`] and panics through [`error::report`].
//!
//! # Concurrency
//!
//! Each heap holds its state behind one spin lock, taken once per operation.
//! If [`sync::set_context_id`] is installed, re-entering a heap from the
//! context that already holds its lock panics instead of deadlocking.
//!
//! # Features
//!
//! - `testing`: exposes [`testing::SimAddressSpace`], a simulated frame
//!   subsystem with real backing memory, and [`testing::CaptureSink`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod address;
mod arena;
mod block;
pub mod config;
pub mod error;
pub mod frame;
mod heap;
mod segment;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod translate;

pub use self::{
    address::{PhysAddr, VirtAddr},
    block::MIN_BLOCK_SIZE,
    config::{DEFAULT_MAX_BLOCK_SIZE, FitStrategy, HeapLayout},
    error::{AllocError, GrowError, OutOfFrames, Violation},
    frame::{AddressSpace, MapFlags},
    heap::Heap,
};

/// Size of one page and of one frame.
pub const PAGE_SIZE: usize = 4096;

/// Size of one boundary tag or link word.
pub const WORD_SIZE: usize = size_of::<usize>();
