//! Boundary-tag block allocator.
//!
//! This module serves small and medium requests out of the [`Arena`]. Every
//! block carries its size twice, in a header word right before the payload and
//! in a footer word at the payload's end, so both neighbours of any block can
//! be found with plain arithmetic.
//!
//! # Memory Layout
//!
//! ```text
//! base                                                           brk
//!  │ BEG │ hdr │ payload ........ │ ftr │ hdr │ payload │ ftr │ END │
//!  └─────┴─────┴──────────────────┴─────┴─────┴─────────┴─────┴─────┘
//!              ▲ address handed out
//! ```
//!
//! A tag word holds `total_size | allocated`, where `total_size` counts the
//! header, the payload and the footer. Sizes are word multiples, which leaves
//! the low bit free for the flag. The BEG and END sentinels are tags of size
//! zero marked allocated; neighbour scans stop at them.
//!
//! Free blocks are kept in a doubly linked list sorted by address. The two
//! link words live in the free block's own payload:
//!
//! ```text
//! │ hdr │ prev │ next │ ....... │ ftr │
//! ```
//!
//! # Algorithm
//!
//! - **Allocation**: first-fit or best-fit over the free list, see
//!   [`FitStrategy`]. A hit is split when the rest can still form a block of
//!   [`MIN_BLOCK_SIZE`]. A miss grows the arena by whole pages and retries in
//!   the new space.
//! - **Deallocation**: the block is inserted in address order and merged with
//!   a free predecessor and a free successor.
//! - **Resize**: shrinking always stays in place; growing absorbs a free
//!   successor when it is large enough and relocates otherwise.

use snafu::{ResultExt as _, ensure};

use crate::{
    PAGE_SIZE, WORD_SIZE,
    address::VirtAddr,
    arena::Arena,
    config::FitStrategy,
    error::{self, AllocError, ArenaExhaustedSnafu, GrowError, UnknownBlockSnafu, ZeroSizeSnafu},
    frame::AddressSpace,
};

/// Smallest block: two tag words and two link words.
pub const MIN_BLOCK_SIZE: usize = 4 * WORD_SIZE;

/// Header plus footer.
const TAGS_SIZE: usize = 2 * WORD_SIZE;

/// Total block size needed to serve a `size`-byte request.
///
/// The caller keeps `size` well below `usize::MAX`.
pub(crate) fn block_size(size: usize) -> usize {
    size.next_multiple_of(WORD_SIZE)
        .max(MIN_BLOCK_SIZE - TAGS_SIZE)
        + TAGS_SIZE
}

/// One boundary tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(usize);

impl Tag {
    const ALLOCATED: usize = 1;

    /// BEG and END.
    pub(crate) const SENTINEL: Self = Self(Self::ALLOCATED);

    const fn free(size: usize) -> Self {
        Self(size)
    }

    const fn allocated(size: usize) -> Self {
        Self(size | Self::ALLOCATED)
    }

    pub(crate) const fn bits(self) -> usize {
        self.0
    }

    const fn size(self) -> usize {
        self.0 & !Self::ALLOCATED
    }

    const fn is_allocated(self) -> bool {
        self.0 & Self::ALLOCATED != 0
    }
}

fn read<A>(space: &A, va: VirtAddr) -> usize
where
    A: AddressSpace,
{
    // Blocks are only formed from tags inside the mapped arena.
    unsafe { space.read_word(va) }
}

fn write<A>(space: &mut A, va: VirtAddr, value: usize)
where
    A: AddressSpace,
{
    unsafe { space.write_word(va, value) }
}

/// View of one block, named by its payload address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Block(VirtAddr);

impl Block {
    /// Returns the block whose header sits at `header`.
    fn at_header(header: VirtAddr) -> Self {
        Self(header + WORD_SIZE)
    }

    fn payload(self) -> VirtAddr {
        self.0
    }

    fn tag<A>(self, space: &A) -> Tag
    where
        A: AddressSpace,
    {
        Tag(read(space, self.0.sub_bytes(WORD_SIZE)))
    }

    fn size<A>(self, space: &A) -> usize
    where
        A: AddressSpace,
    {
        self.tag(space).size()
    }

    fn is_free<A>(self, space: &A) -> bool
    where
        A: AddressSpace,
    {
        !self.tag(space).is_allocated()
    }

    /// Writes `tag` to both the header and the footer.
    fn set_tag<A>(self, space: &mut A, tag: Tag)
    where
        A: AddressSpace,
    {
        write(space, self.0.sub_bytes(WORD_SIZE), tag.bits());
        write(space, (self.0 + tag.size()).sub_bytes(TAGS_SIZE), tag.bits());
    }

    /// Returns the block right after this one in memory, `None` at END.
    fn next_in_memory<A>(self, space: &A) -> Option<Self>
    where
        A: AddressSpace,
    {
        let next = Self(self.0 + self.size(space));
        (next.size(space) != 0).then_some(next)
    }

    /// Returns the block right before this one in memory, `None` at BEG.
    fn prev_in_memory<A>(self, space: &A) -> Option<Self>
    where
        A: AddressSpace,
    {
        let footer = Tag(read(space, self.0.sub_bytes(TAGS_SIZE)));
        (footer.size() != 0).then(|| Self(self.0.sub_bytes(footer.size())))
    }

    fn links<A>(self, space: &A) -> (Option<Self>, Option<Self>)
    where
        A: AddressSpace,
    {
        let decode = |word| (word != 0).then(|| Self(VirtAddr::new(word)));
        (
            decode(read(space, self.0)),
            decode(read(space, self.0 + WORD_SIZE)),
        )
    }

    fn set_prev<A>(self, space: &mut A, prev: Option<Self>)
    where
        A: AddressSpace,
    {
        write(space, self.0, prev.map_or(0, |b| b.0.value()));
    }

    fn set_next<A>(self, space: &mut A, next: Option<Self>)
    where
        A: AddressSpace,
    {
        write(space, self.0 + WORD_SIZE, next.map_or(0, |b| b.0.value()));
    }
}

/// Free-list state of the block tier.
///
/// The list nodes themselves live in arena memory; this struct only holds
/// the ends of the list.
#[derive(Debug)]
pub(crate) struct BlockAllocator {
    head: Option<Block>,
    tail: Option<Block>,
    len: usize,
    strategy: FitStrategy,
}

impl BlockAllocator {
    pub(crate) const fn new(strategy: FitStrategy) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            strategy,
        }
    }

    /// Turns the whole of a freshly initialized arena into one free block.
    pub(crate) fn init<A>(&mut self, space: &mut A, arena: &Arena)
    where
        A: AddressSpace,
    {
        let block = Block::at_header(arena.base() + WORD_SIZE);
        let size = arena.brk() - arena.base() - TAGS_SIZE;
        block.set_tag(space, Tag::free(size));
        self.link(space, block, None, None);
    }

    /// Number of blocks on the free list.
    pub(crate) fn free_block_count(&self) -> usize {
        self.len
    }

    /// Allocates a block with at least `size` payload bytes.
    ///
    /// # Returns
    ///
    /// The payload address, which is always word aligned.
    pub(crate) fn allocate<A>(
        &mut self,
        space: &mut A,
        arena: &mut Arena,
        size: usize,
    ) -> Result<VirtAddr, AllocError>
    where
        A: AddressSpace,
    {
        ensure!(size != 0, ZeroSizeSnafu);

        let needed = block_size(size);
        let block = match self.find_fit(space, needed) {
            Some(block) => block,
            None => self.grow(space, arena, size, needed)?,
        };
        self.place(space, block, needed);
        trace!("block allocated: {} ({needed} bytes)", block.payload());
        Ok(block.payload())
    }

    /// Moves the break up by `pages` pages and frees the new space into the
    /// list. Returns the previous break.
    pub(crate) fn extend<A>(
        &mut self,
        space: &mut A,
        arena: &mut Arena,
        pages: usize,
    ) -> Result<VirtAddr, GrowError>
    where
        A: AddressSpace,
    {
        let old = arena.extend_break(space, pages)?;
        if pages > 0 {
            self.adopt(space, old, pages);
        }
        Ok(old)
    }

    /// Frees the block at `va`.
    ///
    /// Freeing a block that is already free does nothing.
    #[track_caller]
    pub(crate) fn free<A>(&mut self, space: &mut A, arena: &Arena, va: VirtAddr)
    where
        A: AddressSpace,
    {
        let block = Block(va);
        let tag = Self::tag_at(space, arena, va, "free");
        if !tag.is_allocated() {
            debug!("ignoring free of the free block {va}");
            return;
        }
        self.release(space, block, tag.size());
        trace!("block freed: {va}");
    }

    /// Resizes the block at `va` to hold `new_size` bytes.
    ///
    /// # Returns
    ///
    /// The new payload address. It equals `va` unless the block had to move.
    /// On failure the block at `va` is untouched.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not the payload of a live block.
    #[track_caller]
    pub(crate) fn resize<A>(
        &mut self,
        space: &mut A,
        arena: &mut Arena,
        va: VirtAddr,
        new_size: usize,
    ) -> Result<VirtAddr, AllocError>
    where
        A: AddressSpace,
    {
        let (block, size) = Self::live_block(space, arena, va, "resize");
        let needed = block_size(new_size);

        if needed <= size {
            self.shrink(space, block, size, needed);
            return Ok(va);
        }

        if let Some(next) = block.next_in_memory(space)
            && next.is_free(space)
            && size + next.size(space) >= needed
        {
            let total = size + next.size(space);
            self.unlink(space, next);
            block.set_tag(space, Tag::allocated(total));
            self.shrink(space, block, total, needed);
            return Ok(va);
        }

        let new = self.allocate(space, arena, new_size)?;
        unsafe {
            space.copy_bytes(va, new, size - TAGS_SIZE);
        }
        self.release(space, block, size);
        Ok(new)
    }

    /// Payload bytes of the live block at `va`.
    #[track_caller]
    pub(crate) fn usable_size<A>(
        space: &A,
        arena: &Arena,
        va: VirtAddr,
        operation: &'static str,
    ) -> usize
    where
        A: AddressSpace,
    {
        Self::live_block(space, arena, va, operation).1 - TAGS_SIZE
    }

    /// Returns the block at `va` with its total size. Anything but a live
    /// block is reported as a violation of `operation`.
    #[track_caller]
    fn live_block<A>(
        space: &A,
        arena: &Arena,
        va: VirtAddr,
        operation: &'static str,
    ) -> (Block, usize)
    where
        A: AddressSpace,
    {
        let tag = Self::tag_at(space, arena, va, operation);
        if !tag.is_allocated() {
            Self::unknown_block(arena, va, operation);
        }
        (Block(va), tag.size())
    }

    /// Reads the header of the block whose payload starts at `va`. Addresses
    /// that cannot be a payload, and the sentinels, are reported as a
    /// violation of `operation`.
    #[track_caller]
    fn tag_at<A>(space: &A, arena: &Arena, va: VirtAddr, operation: &'static str) -> Tag
    where
        A: AddressSpace,
    {
        if va < arena.base() + TAGS_SIZE || !va.value().is_multiple_of(WORD_SIZE) {
            Self::unknown_block(arena, va, operation);
        }
        let tag = Block(va).tag(space);
        if tag.size() == 0 {
            Self::unknown_block(arena, va, operation);
        }
        tag
    }

    #[track_caller]
    fn unknown_block(arena: &Arena, va: VirtAddr, operation: &'static str) -> ! {
        error::report(
            UnknownBlockSnafu {
                operation,
                addr: va,
                block: (arena.base(), arena.brk()),
            }
            .build(),
        )
    }

    /// Calls `f` with the payload address and total size of every free block,
    /// in address order.
    pub(crate) fn for_each_free<A, F>(&self, space: &A, mut f: F)
    where
        A: AddressSpace,
        F: FnMut(VirtAddr, usize),
    {
        let mut cursor = self.head;
        while let Some(block) = cursor {
            f(block.payload(), block.size(space));
            cursor = block.links(space).1;
        }
    }

    /// Calls `f` with the payload address, total size and allocation state of
    /// every block in the arena, in address order.
    pub(crate) fn for_each_block<A, F>(space: &A, arena: &Arena, mut f: F)
    where
        A: AddressSpace,
        F: FnMut(VirtAddr, usize, bool),
    {
        let first = Block::at_header(arena.base() + WORD_SIZE);
        let mut cursor = (first.size(space) != 0).then_some(first);
        while let Some(block) = cursor {
            let tag = block.tag(space);
            f(block.payload(), tag.size(), tag.is_allocated());
            cursor = block.next_in_memory(space);
        }
    }

    fn find_fit<A>(&self, space: &A, needed: usize) -> Option<Block>
    where
        A: AddressSpace,
    {
        let mut best: Option<(Block, usize)> = None;
        let mut cursor = self.head;
        while let Some(block) = cursor {
            let size = block.size(space);
            if size >= needed {
                match self.strategy {
                    FitStrategy::FirstFit => return Some(block),
                    FitStrategy::BestFit if size == needed => return Some(block),
                    FitStrategy::BestFit => {
                        if best.is_none_or(|(_, best_size)| size < best_size) {
                            best = Some((block, size));
                        }
                    }
                }
            }
            cursor = block.links(space).1;
        }
        best.map(|(block, _)| block)
    }

    /// Grows the arena by enough pages for a `needed`-byte block and returns
    /// the free block covering the new space.
    fn grow<A>(
        &mut self,
        space: &mut A,
        arena: &mut Arena,
        size: usize,
        needed: usize,
    ) -> Result<Block, AllocError>
    where
        A: AddressSpace,
    {
        let pages = needed.div_ceil(PAGE_SIZE);
        let old = arena
            .extend_break(space, pages)
            .context(ArenaExhaustedSnafu { size })?;
        let block = self.adopt(space, old, pages);
        debug!(
            "arena grown by {pages} pages, free block {} ({} bytes)",
            block.payload(),
            block.size(space)
        );
        Ok(block)
    }

    /// Turns `pages` pages freshly added at the old break `old` into a free
    /// block, merged with a free block that ended at `old`.
    fn adopt<A>(&mut self, space: &mut A, old: VirtAddr, pages: usize) -> Block
    where
        A: AddressSpace,
    {
        // The old END word becomes the header of the new block.
        let block = Block::at_header(old.sub_bytes(WORD_SIZE));
        self.release(space, block, pages * PAGE_SIZE)
    }

    /// Marks the free block `block` allocated with a total size of `needed`,
    /// splitting off the rest when it can form a block of its own.
    fn place<A>(&mut self, space: &mut A, block: Block, needed: usize)
    where
        A: AddressSpace,
    {
        let size = block.size(space);
        let rest = size - needed;
        if rest >= MIN_BLOCK_SIZE {
            let remainder = Block(block.payload() + needed);
            remainder.set_tag(space, Tag::free(rest));
            self.replace(space, block, remainder);
            block.set_tag(space, Tag::allocated(needed));
        } else {
            self.unlink(space, block);
            block.set_tag(space, Tag::allocated(size));
        }
    }

    /// Cuts the allocated `block` of total size `size` down to `needed`.
    ///
    /// The tail joins a free successor, becomes a free block of its own, or
    /// stays in the block as slack when it is too small for either.
    fn shrink<A>(&mut self, space: &mut A, block: Block, size: usize, needed: usize)
    where
        A: AddressSpace,
    {
        let rest = size - needed;
        if rest == 0 {
            return;
        }

        let tail = Block(block.payload() + needed);
        match block.next_in_memory(space) {
            Some(next) if next.is_free(space) => {
                let merged = rest + next.size(space);
                tail.set_tag(space, Tag::free(merged));
                self.replace(space, next, tail);
            }
            _ if rest >= MIN_BLOCK_SIZE => {
                tail.set_tag(space, Tag::free(rest));
                self.insert(space, tail);
            }
            _ => return,
        }
        block.set_tag(space, Tag::allocated(needed));
    }

    /// Puts `block` of total size `size` on the free list and merges it with
    /// its free neighbours. Returns the resulting free block.
    fn release<A>(&mut self, space: &mut A, block: Block, size: usize) -> Block
    where
        A: AddressSpace,
    {
        block.set_tag(space, Tag::free(size));
        self.insert(space, block);
        self.coalesce(space, block)
    }

    fn coalesce<A>(&mut self, space: &mut A, block: Block) -> Block
    where
        A: AddressSpace,
    {
        let mut block = block;
        if let Some(next) = block.next_in_memory(space)
            && next.is_free(space)
        {
            let size = block.size(space) + next.size(space);
            self.unlink(space, next);
            block.set_tag(space, Tag::free(size));
        }
        if let Some(prev) = block.prev_in_memory(space)
            && prev.is_free(space)
        {
            let size = prev.size(space) + block.size(space);
            self.unlink(space, block);
            prev.set_tag(space, Tag::free(size));
            block = prev;
        }
        block
    }

    /// Inserts the free `block` in address order.
    fn insert<A>(&mut self, space: &mut A, block: Block)
    where
        A: AddressSpace,
    {
        if self.tail.is_none_or(|tail| tail < block) {
            self.link(space, block, self.tail, None);
            return;
        }

        let mut cursor = self.head;
        while let Some(node) = cursor {
            if node > block {
                let (prev, _) = node.links(space);
                self.link(space, block, prev, Some(node));
                return;
            }
            cursor = node.links(space).1;
        }
        unreachable!("free list tail is below {}", block.payload());
    }

    /// Links `block` between the adjacent list nodes `prev` and `next`.
    fn link<A>(&mut self, space: &mut A, block: Block, prev: Option<Block>, next: Option<Block>)
    where
        A: AddressSpace,
    {
        block.set_prev(space, prev);
        block.set_next(space, next);
        match prev {
            Some(prev) => prev.set_next(space, Some(block)),
            None => self.head = Some(block),
        }
        match next {
            Some(next) => next.set_prev(space, Some(block)),
            None => self.tail = Some(block),
        }
        self.len += 1;
    }

    fn unlink<A>(&mut self, space: &mut A, block: Block)
    where
        A: AddressSpace,
    {
        let (prev, next) = block.links(space);
        match prev {
            Some(prev) => prev.set_next(space, next),
            None => self.head = next,
        }
        match next {
            Some(next) => next.set_prev(space, prev),
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Puts `new` in the list position of `old`.
    ///
    /// `old`'s link words must still be intact, and `new` must sit between
    /// `old`'s list neighbours in address order.
    fn replace<A>(&mut self, space: &mut A, old: Block, new: Block)
    where
        A: AddressSpace,
    {
        let (prev, next) = old.links(space);
        self.len -= 1;
        self.link(space, new, prev, next);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame::MapFlags, testing::SimAddressSpace};

    const BASE: VirtAddr = VirtAddr::new(0x10_0000);

    struct TestHeap {
        space: SimAddressSpace,
        arena: Arena,
        blocks: BlockAllocator,
    }

    impl TestHeap {
        fn allocate(&mut self, size: usize) -> VirtAddr {
            self.blocks
                .allocate(&mut self.space, &mut self.arena, size)
                .unwrap()
        }

        fn free(&mut self, va: VirtAddr) {
            self.blocks.free(&mut self.space, &self.arena, va);
        }

        fn resize(&mut self, va: VirtAddr, size: usize) -> VirtAddr {
            self.blocks
                .resize(&mut self.space, &mut self.arena, va, size)
                .unwrap()
        }

        fn free_blocks(&self) -> Vec<(VirtAddr, usize)> {
            let mut blocks = vec![];
            self.blocks
                .for_each_free(&self.space, |va, size| blocks.push((va, size)));
            blocks
        }

        /// Checks tags, neighbour merging and the free list against each other.
        fn check(&self) {
            let mut free_in_arena = vec![];
            let mut prev_free = false;
            let mut end = self.arena.base() + WORD_SIZE;
            BlockAllocator::for_each_block(&self.space, &self.arena, |va, size, allocated| {
                assert_eq!(va.sub_bytes(WORD_SIZE), end, "blocks must tile the arena");
                assert!(size >= MIN_BLOCK_SIZE && size.is_multiple_of(WORD_SIZE));
                let footer_at = (va + size).sub_bytes(TAGS_SIZE);
                let footer = unsafe { self.space.read_word(footer_at) };
                assert_eq!(footer, Block(va).tag(&self.space).bits());
                assert!(allocated || !prev_free, "adjacent free blocks at {va}");
                if !allocated {
                    free_in_arena.push((va, size));
                }
                prev_free = !allocated;
                end = va.sub_bytes(WORD_SIZE) + size;
            });
            assert_eq!(end, self.arena.brk().sub_bytes(WORD_SIZE));
            assert_eq!(self.free_blocks(), free_in_arena);
            assert_eq!(self.blocks.free_block_count(), free_in_arena.len());
        }
    }

    fn with_test_heap<F>(pages: usize, strategy: FitStrategy, f: F)
    where
        F: FnOnce(&mut TestHeap),
    {
        let mut space = SimAddressSpace::new(16);
        let mut arena = Arena::new(BASE, BASE + 8 * PAGE_SIZE, MapFlags::RW);
        arena.init(&mut space, pages * PAGE_SIZE).unwrap();
        let mut blocks = BlockAllocator::new(strategy);
        blocks.init(&mut space, &arena);
        let mut heap = TestHeap {
            space,
            arena,
            blocks,
        };
        heap.check();
        f(&mut heap);
        heap.check();
    }

    #[test]
    fn sizes_round_to_words_and_the_minimum() {
        assert_eq!(block_size(1), MIN_BLOCK_SIZE);
        assert_eq!(block_size(2 * WORD_SIZE), MIN_BLOCK_SIZE);
        assert_eq!(block_size(2 * WORD_SIZE + 1), MIN_BLOCK_SIZE + WORD_SIZE);
        assert_eq!(block_size(64), 64 + TAGS_SIZE);
    }

    #[test]
    fn reuse_and_full_coalescing() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(64);
            let b = heap.allocate(64);
            let c = heap.allocate(64);
            assert!(a < b && b < c);

            heap.free(b);
            heap.check();
            let d = heap.allocate(32);
            assert_eq!(d, b);
            assert_eq!(heap.arena.brk(), BASE + PAGE_SIZE);

            heap.free(a);
            heap.free(c);
            heap.free(d);
            assert_eq!(heap.free_blocks(), [(BASE + TAGS_SIZE, PAGE_SIZE - TAGS_SIZE)]);
        });
    }

    #[test]
    fn freeing_in_any_order_merges_neighbours() {
        for order in [[0, 1, 2], [2, 1, 0], [1, 0, 2], [0, 2, 1]] {
            with_test_heap(1, FitStrategy::FirstFit, |heap| {
                let blocks = [heap.allocate(40), heap.allocate(72), heap.allocate(16)];
                let _guard = heap.allocate(8);
                for i in order {
                    heap.free(blocks[i]);
                    heap.check();
                }
                let merged = heap.free_blocks()[0];
                assert_eq!(merged.0, blocks[0]);
                assert_eq!(merged.1, block_size(40) + block_size(72) + block_size(16));
            });
        }
    }

    #[test]
    fn small_remainders_are_not_split() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(64);
            let _b = heap.allocate(8);
            heap.free(a);

            // The hole is one word too small for a split.
            let c = heap.allocate(64 - MIN_BLOCK_SIZE + WORD_SIZE);
            assert_eq!(c, a);
            assert_eq!(BlockAllocator::usable_size(&heap.space, &heap.arena, c, "usable_size"), 64);
        });
    }

    #[test]
    fn best_fit_takes_the_smallest_hole() {
        with_test_heap(1, FitStrategy::BestFit, |heap| {
            let big = heap.allocate(256);
            let _s1 = heap.allocate(8);
            let small = heap.allocate(48);
            let _s2 = heap.allocate(8);
            heap.free(big);
            heap.free(small);
            assert_eq!(heap.allocate(40), small);
        });
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let big = heap.allocate(256);
            let _s1 = heap.allocate(8);
            let small = heap.allocate(48);
            let _s2 = heap.allocate(8);
            heap.free(big);
            heap.free(small);
            assert_eq!(heap.allocate(40), big);
        });
    }

    #[test]
    fn double_free_is_ignored() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(32);
            let _b = heap.allocate(32);
            heap.free(a);
            heap.free(a);
            assert_eq!(heap.blocks.free_block_count(), 2);
        });
    }

    #[test]
    fn allocation_grows_the_arena() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(3000);
            let b = heap.allocate(3000);
            assert_eq!(heap.arena.brk(), BASE + 2 * PAGE_SIZE);
            assert!(b > a);
            heap.check();

            heap.free(a);
            heap.free(b);
            assert_eq!(heap.free_blocks(), [(BASE + TAGS_SIZE, 2 * PAGE_SIZE - TAGS_SIZE)]);
        });
    }

    #[test]
    fn extend_frees_the_new_space() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(PAGE_SIZE - MIN_BLOCK_SIZE);
            let old = heap
                .blocks
                .extend(&mut heap.space, &mut heap.arena, 2)
                .unwrap();
            assert_eq!(old, BASE + PAGE_SIZE);
            heap.check();
            assert_eq!(
                heap.free_blocks(),
                [(old, 2 * PAGE_SIZE)],
                "the new block starts at the old END word"
            );
            heap.free(a);
            assert_eq!(heap.blocks.free_block_count(), 1);
        });
    }

    #[test]
    fn exhausted_arena_fails_cleanly() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let err = heap
                .blocks
                .allocate(&mut heap.space, &mut heap.arena, 9 * PAGE_SIZE)
                .unwrap_err();
            assert!(matches!(err, AllocError::ArenaExhausted { .. }));
            assert_eq!(heap.arena.brk(), BASE + PAGE_SIZE);
        });
    }

    #[test]
    fn zero_size_is_rejected() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let err = heap
                .blocks
                .allocate(&mut heap.space, &mut heap.arena, 0)
                .unwrap_err();
            assert!(matches!(err, AllocError::ZeroSize { .. }));
        });
    }

    #[test]
    fn resize_to_the_same_size_keeps_the_block() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(100);
            let usable = BlockAllocator::usable_size(&heap.space, &heap.arena, a, "usable_size");
            assert_eq!(heap.resize(a, usable), a);
            assert_eq!(heap.resize(a, 100), a);
        });
    }

    #[test]
    fn resize_shrinks_in_place() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(256);
            let b = heap.allocate(64);
            let _c = heap.allocate(8);
            assert_eq!(heap.resize(a, 64), a);
            heap.check();
            assert_eq!(heap.free_blocks()[0], (a + block_size(64), 256 - 64));

            // Too small a tail with an allocated successor stays as slack.
            assert_eq!(heap.resize(b, 64 - WORD_SIZE), b);
            assert_eq!(BlockAllocator::usable_size(&heap.space, &heap.arena, b, "usable_size"), 64);
        });
    }

    #[test]
    fn shrink_tail_joins_a_free_successor() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(64);
            let before = heap.free_blocks()[0];
            assert_eq!(heap.resize(a, 64 - WORD_SIZE), a);
            let after = heap.free_blocks()[0];
            assert_eq!(after.0, before.0.sub_bytes(WORD_SIZE));
            assert_eq!(after.1, before.1 + WORD_SIZE);
        });
    }

    #[test]
    fn resize_grows_into_a_free_successor() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(64);
            let b = heap.allocate(256);
            let _c = heap.allocate(8);
            heap.space.write_bytes(a, &[0x5a; 64]);
            heap.free(b);

            assert_eq!(heap.resize(a, 128), a);
            heap.check();
            assert_eq!(heap.space.read_bytes(a, 64), [0x5a; 64]);
            assert_eq!(BlockAllocator::usable_size(&heap.space, &heap.arena, a, "usable_size"), 128);
        });
    }

    #[test]
    fn resize_relocates_when_blocked() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(64);
            let _b = heap.allocate(8);
            heap.space.write_bytes(a, &[0xa5; 64]);

            let moved = heap.resize(a, 512);
            assert_ne!(moved, a);
            assert_eq!(heap.space.read_bytes(moved, 64), [0xa5; 64]);
            assert!(Block(a).is_free(&heap.space));
        });
    }

    #[test]
    #[should_panic(expected = "resize: no live block starts at")]
    fn resizing_a_freed_block_is_a_violation() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(64);
            let _b = heap.allocate(64);
            heap.free(a);
            heap.resize(a, 16);
        });
    }

    #[test]
    #[should_panic(expected = "usable_size: no live block starts at")]
    fn size_of_a_freed_block_is_a_violation() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            let a = heap.allocate(64);
            heap.free(a);
            let _ = BlockAllocator::usable_size(&heap.space, &heap.arena, a, "usable_size");
        });
    }

    #[test]
    #[should_panic(expected = "free: no live block starts at")]
    fn freeing_a_sentinel_is_a_violation() {
        with_test_heap(1, FitStrategy::FirstFit, |heap| {
            heap.free(BASE + WORD_SIZE);
        });
    }
}
