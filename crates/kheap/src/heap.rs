//! The public heap: tier dispatch, cross-tier resize and the `GlobalAlloc`
//! adapter.
//!
//! Requests of at most [`HeapLayout::max_block_size`] bytes are served by the
//! block tier; larger ones are rounded up to whole pages and served by the
//! page tier. Pointers are routed back to their tier by address range alone.
//!
//! | old tier | new size  | resize action                                        |
//! |----------|-----------|------------------------------------------------------|
//! | block    | block     | in place if possible, else move within the tier      |
//! | block    | page      | allocate pages, copy, free the block                 |
//! | page     | block     | allocate a block, copy, free the pages               |
//! | page     | page      | expand in place or move by frame transfer; shrink    |

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use snafu::{IntoError as _, ensure};

use crate::{
    PAGE_SIZE, WORD_SIZE,
    address::{PhysAddr, VirtAddr},
    arena::Arena,
    block::BlockAllocator,
    config::HeapLayout,
    error::{
        self, AlignmentSnafu, AllocError, ForeignAddressSnafu, GrowError, InitialMappingSnafu,
        ZeroSizeSnafu,
    },
    frame::AddressSpace,
    segment::SegmentAllocator,
    sync::SpinMutex,
    translate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Block,
    Page,
}

/// One heap instance: a block arena and a page range in one address space.
///
/// `PAGES` is the capacity of the page tier's descriptor table and must be at
/// least [`HeapLayout::page_count`]. Every operation takes the heap's lock
/// once for its whole duration.
///
/// The heap initializes itself on first use; [`init`](Self::init) does it
/// eagerly.
///
/// # Reentrancy
///
/// Calling back into a heap while one of its operations is running, for
/// example allocating through [`GlobalAlloc`] inside
/// [`with_address_space`](Self::with_address_space), is detected only once
/// [`sync::set_context_id`](crate::sync::set_context_id) has been installed.
/// Then it panics with [`Violation::RecursiveLock`](crate::Violation).
/// Without the hook the inner call spins forever.
pub struct Heap<A, const PAGES: usize> {
    layout: HeapLayout,
    state: SpinMutex<HeapState<A, PAGES>>,
}

struct HeapState<A, const PAGES: usize> {
    space: A,
    arena: Arena,
    blocks: BlockAllocator,
    segments: SegmentAllocator<PAGES>,
}

impl<A, const PAGES: usize> Heap<A, PAGES>
where
    A: AddressSpace,
{
    /// Creates an uninitialized heap over `space`.
    ///
    /// Install [`sync::set_context_id`](crate::sync::set_context_id) before
    /// the first operation so that recursive use of the heap is reported
    /// instead of deadlocking.
    #[track_caller]
    pub const fn new(layout: HeapLayout, space: A) -> Self {
        Self {
            layout,
            state: SpinMutex::new(HeapState {
                space,
                arena: Arena::new(layout.start, layout.limit, layout.flags),
                blocks: BlockAllocator::new(layout.strategy),
                segments: SegmentAllocator::new(layout.page_start, layout.page_end, layout.flags),
            }),
        }
    }

    #[must_use]
    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    /// Maps the initial arena and seeds both free lists.
    ///
    /// Does nothing on an initialized heap.
    ///
    /// # Panics
    ///
    /// Panics if the layout is unusable or frames run out while mapping the
    /// initial arena.
    pub fn init(&self) {
        self.state.lock().init(&self.layout);
    }

    /// Allocates at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<VirtAddr, AllocError> {
        let mut state = self.state.lock();
        state.allocate(&self.layout, size).inspect_err(|err| {
            warn!("allocate({size}) failed: {err}");
        })
    }

    /// Frees the allocation at `va`. Null is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `va` is outside both tiers, or is not the start of a live
    /// page-tier allocation.
    pub fn free(&self, va: VirtAddr) {
        self.state.lock().free(&self.layout, va);
    }

    /// Resizes the allocation at `va` to `new_size` bytes.
    ///
    /// Returns the possibly moved allocation, or `None` when `new_size` is 0
    /// and the allocation was freed. A null `va` allocates. On failure the
    /// original allocation is untouched.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`free`](Self::free).
    pub fn resize(&self, va: VirtAddr, new_size: usize) -> Result<Option<VirtAddr>, AllocError> {
        let mut state = self.state.lock();
        state.resize(&self.layout, va, new_size).inspect_err(|err| {
            warn!("resize({va}, {new_size}) failed: {err}");
        })
    }

    /// Grows the block arena by `pages` pages and returns the previous break.
    ///
    /// The new space is added to the block tier's free list.
    pub fn extend_break(&self, pages: usize) -> Result<VirtAddr, GrowError> {
        let mut state = self.state.lock();
        state.init(&self.layout);
        let HeapState {
            space,
            arena,
            blocks,
            ..
        } = &mut *state;
        blocks.extend(space, arena, pages)
    }

    /// Current end of the block arena.
    #[must_use]
    pub fn brk(&self) -> VirtAddr {
        self.state.lock().arena.brk()
    }

    /// Usable bytes of the live allocation at `va`.
    ///
    /// # Panics
    ///
    /// Panics if `va` lies outside both tiers or does not start a live
    /// allocation.
    #[must_use]
    pub fn allocation_size(&self, va: VirtAddr) -> usize {
        self.state.lock().allocation_size(va, "allocation_size")
    }

    /// Physical address backing `va`, if `va` lies in a mapped page of this
    /// heap.
    #[must_use]
    pub fn physical_address(&self, va: VirtAddr) -> Option<PhysAddr> {
        let state = self.state.lock();
        state
            .tier(va)
            .and_then(|_| translate::physical_address(&state.space, va))
    }

    /// Virtual address of this heap at which `pa` is mapped.
    #[must_use]
    pub fn virtual_address(&self, pa: PhysAddr) -> Option<VirtAddr> {
        let state = self.state.lock();
        translate::virtual_address(&state.space, pa).filter(|va| state.tier(*va).is_some())
    }

    /// Calls `f` with the payload address and total size of every free block.
    pub fn for_each_free_block<F>(&self, f: F)
    where
        F: FnMut(VirtAddr, usize),
    {
        let state = self.state.lock();
        state.blocks.for_each_free(&state.space, f);
    }

    /// Calls `f` with the payload address, total size and allocation state of
    /// every block in the arena.
    pub fn for_each_block<F>(&self, f: F)
    where
        F: FnMut(VirtAddr, usize, bool),
    {
        let state = self.state.lock();
        if state.arena.is_initialized() {
            BlockAllocator::for_each_block(&state.space, &state.arena, f);
        }
    }

    /// Calls `f` with the start and page count of every free page run.
    pub fn for_each_free_segment<F>(&self, f: F)
    where
        F: FnMut(VirtAddr, usize),
    {
        self.state.lock().segments.for_each_free(f);
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.state.lock().blocks.free_block_count()
    }

    #[must_use]
    pub fn free_segment_count(&self) -> usize {
        self.state.lock().segments.free_segment_count()
    }

    /// Writes both free lists to the log at debug level.
    pub fn log_free_lists(&self) {
        let state = self.state.lock();
        debug!("free blocks ({}):", state.blocks.free_block_count());
        state.blocks.for_each_free(&state.space, |va, size| {
            debug!("  {va}: {size} bytes");
        });
        debug!("free segments ({}):", state.segments.free_segment_count());
        state.segments.for_each_free(|va, pages| {
            debug!("  {va}: {pages} pages");
        });
    }

    /// Runs `f` with the heap's address space while holding the lock.
    pub fn with_address_space<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut A) -> R,
    {
        f(&mut self.state.lock().space)
    }

    fn allocate_layout(&self, layout: Layout) -> Result<VirtAddr, AllocError> {
        self.state.lock().allocate_layout(&self.layout, layout)
    }
}

impl<A, const PAGES: usize> HeapState<A, PAGES>
where
    A: AddressSpace,
{
    fn init(&mut self, layout: &HeapLayout) {
        if self.arena.is_initialized() {
            return;
        }
        if let Err(violation) = layout.validate(PAGES) {
            error::report(violation);
        }
        if let Err(source) = self.arena.init(&mut self.space, layout.initial_size) {
            error::report(InitialMappingSnafu { addr: layout.start }.into_error(source));
        }
        self.blocks.init(&mut self.space, &self.arena);
        self.segments.init();
        info!(
            "heap initialized: blocks {}..{}, pages {}..{}, max block {} bytes",
            layout.start, layout.limit, layout.page_start, layout.page_end, layout.max_block_size
        );
    }

    fn tier(&self, va: VirtAddr) -> Option<Tier> {
        if self.arena.contains(va) {
            Some(Tier::Block)
        } else if self.segments.contains(va) {
            Some(Tier::Page)
        } else {
            None
        }
    }

    #[track_caller]
    fn tier_of(&self, va: VirtAddr, operation: &'static str) -> Tier {
        let Some(tier) = self.tier(va) else {
            error::report(
                ForeignAddressSnafu {
                    operation,
                    addr: va,
                    block: (self.arena.base(), self.arena.brk()),
                    pages: self.segments.range(),
                }
                .build(),
            );
        };
        tier
    }

    fn allocate(&mut self, layout: &HeapLayout, size: usize) -> Result<VirtAddr, AllocError> {
        ensure!(size != 0, ZeroSizeSnafu);
        self.init(layout);
        if size <= layout.max_block_size {
            self.blocks.allocate(&mut self.space, &mut self.arena, size)
        } else {
            self.segments
                .allocate(&mut self.space, size.div_ceil(PAGE_SIZE))
        }
    }

    fn free(&mut self, layout: &HeapLayout, va: VirtAddr) {
        if va.is_null() {
            return;
        }
        self.init(layout);
        match self.tier_of(va, "free") {
            Tier::Block => self.blocks.free(&mut self.space, &self.arena, va),
            Tier::Page => self.segments.free(&mut self.space, va),
        }
    }

    #[track_caller]
    fn allocation_size(&self, va: VirtAddr, operation: &'static str) -> usize {
        match self.tier_of(va, operation) {
            Tier::Block => BlockAllocator::usable_size(&self.space, &self.arena, va, operation),
            Tier::Page => self.segments.run_pages(va, operation) * PAGE_SIZE,
        }
    }

    fn resize(
        &mut self,
        layout: &HeapLayout,
        va: VirtAddr,
        new_size: usize,
    ) -> Result<Option<VirtAddr>, AllocError> {
        if new_size == 0 {
            self.free(layout, va);
            return Ok(None);
        }
        if va.is_null() {
            return self.allocate(layout, new_size).map(Some);
        }
        self.init(layout);

        let tier = self.tier_of(va, "resize");
        let va = match tier {
            Tier::Block => va,
            Tier::Page => va.page_align_down(),
        };
        let new = match (tier, new_size <= layout.max_block_size) {
            (Tier::Block, true) => {
                self.blocks
                    .resize(&mut self.space, &mut self.arena, va, new_size)?
            }
            (Tier::Page, false) => self.resize_pages(va, new_size.div_ceil(PAGE_SIZE))?,
            (Tier::Block | Tier::Page, _) => self.move_across(layout, va, new_size)?,
        };
        Ok(Some(new))
    }

    fn resize_pages(&mut self, va: VirtAddr, new_pages: usize) -> Result<VirtAddr, AllocError> {
        let pages = self.segments.run_pages(va, "resize");
        if new_pages < pages {
            self.segments.shrink(&mut self.space, va, new_pages);
        } else if new_pages > pages && !self.segments.try_expand(&mut self.space, va, new_pages) {
            return self.segments.relocate(&mut self.space, va, new_pages);
        }
        Ok(va)
    }

    /// Moves the allocation at `va` to the other tier.
    fn move_across(
        &mut self,
        layout: &HeapLayout,
        va: VirtAddr,
        new_size: usize,
    ) -> Result<VirtAddr, AllocError> {
        let old_size = self.allocation_size(va, "resize");
        let new = self.allocate(layout, new_size)?;
        unsafe {
            self.space.copy_bytes(va, new, old_size.min(new_size));
        }
        self.free(layout, va);
        Ok(new)
    }

    /// Serves a `GlobalAlloc` request. Word-aligned layouts take the normal
    /// path; layouts aligned up to a page always go to the page tier.
    fn allocate_layout(&mut self, layout: &HeapLayout, request: Layout) -> Result<VirtAddr, AllocError> {
        let align = request.align();
        if align <= WORD_SIZE {
            return self.allocate(layout, request.size());
        }
        ensure!(align <= PAGE_SIZE, AlignmentSnafu { align });
        ensure!(request.size() != 0, ZeroSizeSnafu);
        self.init(layout);
        self.segments
            .allocate(&mut self.space, request.size().div_ceil(PAGE_SIZE))
    }

    /// Resizes an allocation made by [`allocate_layout`](Self::allocate_layout).
    fn resize_layout(
        &mut self,
        layout: &HeapLayout,
        va: VirtAddr,
        request: Layout,
        new_size: usize,
    ) -> Result<VirtAddr, AllocError> {
        if request.align() <= WORD_SIZE || self.tier_of(va, "resize") == Tier::Block {
            return self
                .resize(layout, va, new_size)?
                .ok_or_else(|| ZeroSizeSnafu.build());
        }
        ensure!(new_size != 0, ZeroSizeSnafu);
        self.resize_pages(va, new_size.div_ceil(PAGE_SIZE))
    }
}

unsafe impl<A, const PAGES: usize> GlobalAlloc for Heap<A, PAGES>
where
    A: AddressSpace + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_layout(layout)
            .map_or(ptr::null_mut(), VirtAddr::as_mut_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(VirtAddr::from_ptr(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let va = VirtAddr::from_ptr(ptr);
        self.state
            .lock()
            .resize_layout(&self.layout, va, layout, new_size)
            .map_or(ptr::null_mut(), VirtAddr::as_mut_ptr)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FitStrategy,
        frame::MapFlags,
        testing::{PHYS_BASE, SimAddressSpace},
    };

    const START: VirtAddr = VirtAddr::new(0x10_0000);
    const LIMIT: VirtAddr = VirtAddr::new(0x10_8000);
    const PAGE_START: VirtAddr = VirtAddr::new(0x10_9000);
    const PAGE_END: VirtAddr = VirtAddr::new(0x11_3000);

    type TestHeap = Heap<SimAddressSpace, 16>;

    fn heap(frames: usize) -> TestHeap {
        let layout = HeapLayout::new(START, PAGE_SIZE, LIMIT, PAGE_END);
        Heap::new(layout, SimAddressSpace::new(frames))
    }

    #[test]
    fn allocation_initializes_lazily() {
        let heap = heap(32);
        assert_eq!(heap.brk(), START);
        let va = heap.allocate(16).unwrap();
        assert!(START < va && va < START + PAGE_SIZE);
        assert_eq!(heap.brk(), START + PAGE_SIZE);
        assert_eq!(heap.free_segment_count(), 1);
    }

    #[test]
    fn init_is_idempotent() {
        let heap = heap(32);
        heap.init();
        let va = heap.allocate(64).unwrap();
        heap.init();
        assert_eq!(heap.allocation_size(va), 64);
        assert_eq!(heap.free_block_count(), 1);
    }

    #[test]
    fn sizes_are_routed_by_threshold() {
        let heap = heap(32);
        let small = heap.allocate(2048).unwrap();
        let large = heap.allocate(2049).unwrap();
        assert!(small < LIMIT);
        assert_eq!(large, PAGE_START);
        assert_eq!(heap.allocation_size(large), PAGE_SIZE);
    }

    #[test]
    fn zero_sized_requests() {
        let heap = heap(32);
        assert!(matches!(heap.allocate(0), Err(AllocError::ZeroSize { .. })));
        assert_eq!(heap.resize(VirtAddr::NULL, 0).unwrap(), None);

        let va = heap.resize(VirtAddr::NULL, 24).unwrap().unwrap();
        assert_eq!(heap.allocation_size(va), 24);
        assert_eq!(heap.resize(va, 0).unwrap(), None);
        assert_eq!(heap.free_block_count(), 1);
        heap.free(VirtAddr::NULL);
    }

    #[test]
    fn page_resize_expands_in_place_then_relocates() {
        let heap = heap(32);
        let x = heap.allocate(2 * PAGE_SIZE).unwrap();
        let y = heap.allocate(2 * PAGE_SIZE).unwrap();
        heap.free(y);

        assert_eq!(heap.resize(x, 3 * PAGE_SIZE).unwrap(), Some(x));
        let z = heap.allocate(PAGE_SIZE).unwrap();
        assert_eq!(z, PAGE_START + 3 * PAGE_SIZE);

        let moved = heap.resize(x, 4 * PAGE_SIZE).unwrap().unwrap();
        assert_eq!(moved, PAGE_START + 4 * PAGE_SIZE);
        assert_eq!(heap.allocation_size(moved), 4 * PAGE_SIZE);

        assert_eq!(heap.resize(moved, 2 * PAGE_SIZE).unwrap(), Some(moved));
        assert_eq!(heap.allocation_size(moved), 2 * PAGE_SIZE);
        assert_eq!(heap.free_segment_count(), 2);
    }

    #[test]
    fn cross_tier_resize_keeps_the_prefix() {
        let heap = heap(32);
        let small = heap.allocate(100).unwrap();
        heap.with_address_space(|space| space.write_bytes(small, &[7; 100]));

        let large = heap.resize(small, 3 * PAGE_SIZE).unwrap().unwrap();
        assert!(large >= PAGE_START);
        heap.with_address_space(|space| {
            assert_eq!(space.read_bytes(large, 100), [7; 100]);
            space.write_bytes(large + 100, &[9; 100]);
        });
        assert_eq!(heap.free_block_count(), 1);

        let back = heap.resize(large, 150).unwrap().unwrap();
        assert!(back < LIMIT);
        heap.with_address_space(|space| {
            assert_eq!(space.read_bytes(back, 100), [7; 100]);
            assert_eq!(space.read_bytes(back + 100, 50), [9; 50]);
        });
        assert_eq!(heap.free_segment_count(), 1);
    }

    #[test]
    fn failed_resize_keeps_the_allocation() {
        let heap = heap(3);
        let small = heap.allocate(64).unwrap();
        assert!(matches!(
            heap.resize(small, 4 * PAGE_SIZE),
            Err(AllocError::BackPages { .. })
        ));
        assert_eq!(heap.allocation_size(small), 64);
        assert_eq!(heap.free_segment_count(), 1);
    }

    #[test]
    fn extend_break_feeds_the_block_tier() {
        let heap = heap(32);
        let old = heap.extend_break(2).unwrap();
        assert_eq!(old, START + PAGE_SIZE);
        assert_eq!(heap.extend_break(0).unwrap(), START + 3 * PAGE_SIZE);
        assert_eq!(heap.free_block_count(), 1);
        assert!(matches!(heap.extend_break(6), Err(GrowError::LimitExceeded { .. })));
    }

    #[test]
    fn translation_is_limited_to_the_heap() {
        let heap = heap(32);
        let va = heap.allocate(32).unwrap();
        let pa = heap.physical_address(va).unwrap();
        assert_eq!(pa.page_offset(), va.page_offset());
        assert_eq!(heap.virtual_address(pa), Some(va));
        assert_eq!(heap.physical_address(LIMIT), None);
        assert_eq!(heap.virtual_address(PhysAddr::new(PHYS_BASE + 31 * PAGE_SIZE)), None);

        let outside = VirtAddr::new(0x50_0000);
        let frame = heap.with_address_space(|space| {
            let frame = space.allocate_frame().unwrap();
            space.map_frame(frame, outside, MapFlags::RW).unwrap();
            frame
        });
        let pa = heap.with_address_space(|space| space.frame_phys_addr(frame));
        assert_eq!(heap.physical_address(outside), None);
        assert_eq!(heap.virtual_address(pa), None);
    }

    #[test]
    fn process_heaps_map_user_pages() {
        let layout = HeapLayout::new(START, PAGE_SIZE, LIMIT, PAGE_END)
            .with_flags(MapFlags::URW)
            .with_strategy(FitStrategy::BestFit);
        let heap: TestHeap = Heap::new(layout, SimAddressSpace::new(32));
        let small = heap.allocate(8).unwrap();
        let large = heap.allocate(3 * PAGE_SIZE).unwrap();
        heap.with_address_space(|space| {
            assert_eq!(space.flags_at(small), Some(MapFlags::URW));
            assert_eq!(space.flags_at(large), Some(MapFlags::URW));
        });
    }

    #[test]
    #[should_panic(expected = "free: address 0x300000 is outside the block arena")]
    fn foreign_free_is_a_violation() {
        let heap = heap(32);
        heap.free(VirtAddr::new(0x30_0000));
    }

    #[test]
    #[should_panic(expected = "init: initial size")]
    fn oversized_initial_arena_is_a_violation() {
        let layout = HeapLayout::new(START, 9 * PAGE_SIZE, LIMIT, PAGE_END);
        let heap: TestHeap = Heap::new(layout, SimAddressSpace::new(32));
        heap.init();
    }

    #[test]
    #[should_panic(expected = "out of frames while mapping the initial arena")]
    fn initial_mapping_needs_frames() {
        let layout = HeapLayout::new(START, 2 * PAGE_SIZE, LIMIT, PAGE_END);
        let heap: TestHeap = Heap::new(layout, SimAddressSpace::new(1));
        heap.init();
    }

    #[test]
    #[should_panic(expected = "descriptor table")]
    fn page_range_must_fit_the_table() {
        let heap: Heap<SimAddressSpace, 4> = Heap::new(
            HeapLayout::new(START, PAGE_SIZE, LIMIT, PAGE_END),
            SimAddressSpace::new(32),
        );
        heap.init();
    }

    #[test]
    fn global_alloc_honours_alignment() {
        let heap = heap(32);
        unsafe {
            let word = heap.alloc(Layout::from_size_align(24, 8).unwrap());
            assert!(!word.is_null() && word.addr().is_multiple_of(8));

            let page = heap.alloc(Layout::from_size_align(64, 256).unwrap());
            assert_eq!(VirtAddr::from_ptr(page), PAGE_START);

            let grown = heap.realloc(page, Layout::from_size_align(64, 256).unwrap(), 2 * PAGE_SIZE);
            assert!(VirtAddr::from_ptr(grown).is_page_aligned());
            assert_eq!(heap.allocation_size(VirtAddr::from_ptr(grown)), 2 * PAGE_SIZE);

            let huge = heap.alloc(Layout::from_size_align(64, 2 * PAGE_SIZE).unwrap());
            assert!(huge.is_null());

            heap.dealloc(word, Layout::from_size_align(24, 8).unwrap());
            heap.dealloc(grown, Layout::from_size_align(2 * PAGE_SIZE, 256).unwrap());
        }
        assert_eq!(heap.free_segment_count(), 1);
    }
}
