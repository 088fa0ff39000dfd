//! Page-granular segment allocator.
//!
//! Large requests are served in whole pages from a fixed virtual range.
//! Bookkeeping lives out of band in a descriptor table with one slot per page
//! of the range, so the descriptor of any page is found by index arithmetic.
//!
//! - The slot of the first page of a free run describes the run and links it
//!   into an address-ordered, doubly linked free list.
//! - The slot of the first page of an allocated run records its length.
//! - Every other slot is unused.
//!
//! Pages of free runs are never mapped; pages of allocated runs always are.

use snafu::{OptionExt as _, ResultExt as _};

use crate::{
    PAGE_SIZE,
    address::VirtAddr,
    error::{self, AllocError, BackPagesSnafu, MissingFrameSnafu, NoSegmentSnafu, UnknownAllocationSnafu},
    frame::{self, AddressSpace, MapFlags},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unused,
    Free {
        pages: usize,
        prev: Option<usize>,
        next: Option<usize>,
    },
    Allocated {
        pages: usize,
    },
}

#[derive(Debug)]
pub(crate) struct SegmentAllocator<const N: usize> {
    base: VirtAddr,
    end: VirtAddr,
    flags: MapFlags,
    slots: [Slot; N],
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<const N: usize> SegmentAllocator<N> {
    pub(crate) const fn new(base: VirtAddr, end: VirtAddr, flags: MapFlags) -> Self {
        Self {
            base,
            end,
            flags,
            slots: [Slot::Unused; N],
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Seeds the free list with one run spanning the whole range.
    ///
    /// The range must fit the table.
    pub(crate) fn init(&mut self) {
        let pages = (self.end - self.base) / PAGE_SIZE;
        debug_assert!(pages <= N);
        self.slots[0] = Slot::Free {
            pages,
            prev: None,
            next: None,
        };
        self.head = Some(0);
        self.tail = Some(0);
        self.len = 1;
    }

    pub(crate) fn range(&self) -> (VirtAddr, VirtAddr) {
        (self.base, self.end)
    }

    pub(crate) fn contains(&self, va: VirtAddr) -> bool {
        self.base <= va && va < self.end
    }

    pub(crate) fn free_segment_count(&self) -> usize {
        self.len
    }

    /// Length in pages of the live run starting in the page of `va`.
    #[cfg(test)]
    fn allocated_pages(&self, va: VirtAddr) -> Option<usize> {
        match self.slots[self.index(va)] {
            Slot::Allocated { pages } => Some(pages),
            _ => None,
        }
    }

    /// Length in pages of the live run starting in the page of `va`.
    ///
    /// Anything other than a live run is reported as a violation of
    /// `operation`.
    #[track_caller]
    pub(crate) fn run_pages(&self, va: VirtAddr, operation: &'static str) -> usize {
        self.live_run(va, operation).1
    }

    /// Reserves `pages` pages and backs each with a fresh frame.
    ///
    /// If frames run out part-way the pages mapped so far are dropped and the
    /// reservation is returned to the free list.
    pub(crate) fn allocate<A>(&mut self, space: &mut A, pages: usize) -> Result<VirtAddr, AllocError>
    where
        A: AddressSpace,
    {
        debug_assert!(pages > 0);
        let index = self.reserve(pages).context(NoSegmentSnafu { pages })?;
        let va = self.start(index);
        if let Err(source) = frame::map_fresh_pages(space, va, pages, self.flags) {
            self.release(index, pages);
            return Err(source).context(BackPagesSnafu { va, pages });
        }
        debug!("segment allocated: {va} ({pages} pages)");
        Ok(va)
    }

    /// Unmaps the live run starting in the page of `va` and returns it to the
    /// free list.
    ///
    /// Anything but the first page of a live run, a double free included, is
    /// reported as a violation.
    pub(crate) fn free<A>(&mut self, space: &mut A, va: VirtAddr)
    where
        A: AddressSpace,
    {
        let (index, pages) = self.live_run(va, "free");
        let start = self.start(index);
        frame::unmap_pages(space, start, pages);
        self.release(index, pages);
        debug!("segment freed: {start} ({pages} pages)");
    }

    /// Grows the live run at `va` to `new_pages` pages without moving it.
    ///
    /// Succeeds only when the run right after it is free and long enough.
    /// Returns `false`, with nothing changed, otherwise or when frames run out.
    #[must_use]
    pub(crate) fn try_expand<A>(&mut self, space: &mut A, va: VirtAddr, new_pages: usize) -> bool
    where
        A: AddressSpace,
    {
        let (index, pages) = self.live_run(va, "resize");
        debug_assert!(new_pages > pages);
        let extra = new_pages - pages;
        let neighbour = index + pages;
        let Some(&Slot::Free {
            pages: available,
            prev,
            next,
        }) = self.slots.get(neighbour)
        else {
            return false;
        };
        if available < extra {
            return false;
        }

        if frame::map_fresh_pages(space, self.start(neighbour), extra, self.flags).is_err() {
            warn!("expanding {} in place ran out of frames", self.start(index));
            return false;
        }

        self.slots[neighbour] = Slot::Unused;
        if available > extra {
            self.slots[neighbour + extra] = Slot::Free {
                pages: available - extra,
                prev,
                next,
            };
            self.relink(neighbour + extra, prev, next);
        } else {
            self.unlink_neighbours(prev, next);
        }
        self.slots[index] = Slot::Allocated { pages: new_pages };
        true
    }

    /// Cuts the live run at `va` down to `new_pages` pages in place.
    pub(crate) fn shrink<A>(&mut self, space: &mut A, va: VirtAddr, new_pages: usize)
    where
        A: AddressSpace,
    {
        let (index, pages) = self.live_run(va, "resize");
        debug_assert!(0 < new_pages && new_pages < pages);
        let excess = pages - new_pages;
        frame::unmap_pages(space, self.start(index + new_pages), excess);
        self.slots[index] = Slot::Allocated { pages: new_pages };
        self.release(index + new_pages, excess);
    }

    /// Moves the live run at `va` to a fresh run of `new_pages` pages.
    ///
    /// The existing frames are remapped at the new address rather than
    /// copied; pages beyond the old length get fresh frames. On failure the
    /// old run is left exactly as it was.
    pub(crate) fn relocate<A>(
        &mut self,
        space: &mut A,
        va: VirtAddr,
        new_pages: usize,
    ) -> Result<VirtAddr, AllocError>
    where
        A: AddressSpace,
    {
        let (index, pages) = self.live_run(va, "resize");
        let old = self.start(index);
        let new_index = self
            .reserve(new_pages)
            .context(NoSegmentSnafu { pages: new_pages })?;
        let new = self.start(new_index);
        let moved = pages.min(new_pages);

        if let Err(err) = self.transfer_frames(space, old, new, moved, new_pages) {
            self.release(new_index, new_pages);
            return Err(err);
        }

        frame::unmap_pages(space, old, pages);
        self.release(index, pages);
        debug!("segment moved: {old} -> {new} ({pages} -> {new_pages} pages)");
        Ok(new)
    }

    /// Calls `f` with the start and page count of every free run, in address
    /// order.
    pub(crate) fn for_each_free<F>(&self, mut f: F)
    where
        F: FnMut(VirtAddr, usize),
    {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let (pages, _, next) = self.free_slot(index);
            f(self.start(index), pages);
            cursor = next;
        }
    }

    /// Maps the first `moved` frames of `old` at `new`, then fresh frames up
    /// to `total` pages. Undoes every new mapping on failure.
    fn transfer_frames<A>(
        &self,
        space: &mut A,
        old: VirtAddr,
        new: VirtAddr,
        moved: usize,
        total: usize,
    ) -> Result<(), AllocError>
    where
        A: AddressSpace,
    {
        for i in 0..moved {
            let from = old + i * PAGE_SIZE;
            let Some(frame) = space.frame_at(from) else {
                error::report(
                    MissingFrameSnafu {
                        operation: "resize",
                        addr: from,
                    }
                    .build(),
                );
            };
            if let Err(source) = space.map_frame(frame, new + i * PAGE_SIZE, self.flags) {
                warn!("frame transfer {old} -> {new} failed after {i} pages, rolling back");
                frame::unmap_pages(space, new, i);
                return Err(source).context(BackPagesSnafu {
                    va: new,
                    pages: total,
                });
            }
        }

        let fresh = new + moved * PAGE_SIZE;
        if let Err(source) = frame::map_fresh_pages(space, fresh, total - moved, self.flags) {
            frame::unmap_pages(space, new, moved);
            return Err(source).context(BackPagesSnafu {
                va: new,
                pages: total,
            });
        }
        Ok(())
    }

    fn index(&self, va: VirtAddr) -> usize {
        (va - self.base) / PAGE_SIZE
    }

    fn start(&self, index: usize) -> VirtAddr {
        self.base + index * PAGE_SIZE
    }

    /// Looks up the live run starting in the page of `va`.
    #[track_caller]
    fn live_run(&self, va: VirtAddr, operation: &'static str) -> (usize, usize) {
        let index = self.index(va);
        match self.slots[index] {
            Slot::Allocated { pages } => (index, pages),
            _ => error::report(
                UnknownAllocationSnafu {
                    operation,
                    addr: va,
                    pages: self.range(),
                }
                .build(),
            ),
        }
    }

    fn free_slot(&self, index: usize) -> (usize, Option<usize>, Option<usize>) {
        match self.slots[index] {
            Slot::Free { pages, prev, next } => (pages, prev, next),
            slot => unreachable!("free list node {index} is {slot:?}"),
        }
    }

    fn set_links(&mut self, index: usize, new_prev: Option<usize>, new_next: Option<usize>) {
        if let Slot::Free { prev, next, .. } = &mut self.slots[index] {
            *prev = new_prev;
            *next = new_next;
        }
    }

    fn set_prev(&mut self, index: usize, new_prev: Option<usize>) {
        let (_, _, next) = self.free_slot(index);
        self.set_links(index, new_prev, next);
    }

    fn set_next(&mut self, index: usize, new_next: Option<usize>) {
        let (_, prev, _) = self.free_slot(index);
        self.set_links(index, prev, new_next);
    }

    /// First-fit search. Splits off and keeps the surplus of the match.
    fn reserve(&mut self, pages: usize) -> Option<usize> {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let (available, prev, next) = self.free_slot(index);
            if available >= pages {
                if available > pages {
                    let rest = index + pages;
                    self.slots[rest] = Slot::Free {
                        pages: available - pages,
                        prev,
                        next,
                    };
                    self.relink(rest, prev, next);
                } else {
                    self.unlink_neighbours(prev, next);
                }
                self.slots[index] = Slot::Allocated { pages };
                return Some(index);
            }
            cursor = next;
        }
        None
    }

    /// Makes the free run at `index` take the list position between `prev`
    /// and `next`, replacing whatever node sat there.
    fn relink(&mut self, index: usize, prev: Option<usize>, next: Option<usize>) {
        match prev {
            Some(prev) => self.set_next(prev, Some(index)),
            None => self.head = Some(index),
        }
        match next {
            Some(next) => self.set_prev(next, Some(index)),
            None => self.tail = Some(index),
        }
    }

    /// Removes the node sitting between `prev` and `next` from the list.
    fn unlink_neighbours(&mut self, prev: Option<usize>, next: Option<usize>) {
        match prev {
            Some(prev) => self.set_next(prev, next),
            None => self.head = next,
        }
        match next {
            Some(next) => self.set_prev(next, prev),
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    fn unlink(&mut self, index: usize) {
        let (_, prev, next) = self.free_slot(index);
        self.unlink_neighbours(prev, next);
        self.slots[index] = Slot::Unused;
    }

    /// Returns the run `index..index + pages` to the free list and merges it
    /// with free runs on either side.
    fn release(&mut self, index: usize, pages: usize) {
        let (prev, next) = if self.tail.is_none_or(|tail| tail < index) {
            (self.tail, None)
        } else {
            let mut cursor = self.head;
            loop {
                let Some(node) = cursor else {
                    unreachable!("free list tail is below slot {index}");
                };
                let (_, prev, next) = self.free_slot(node);
                if node > index {
                    break (prev, Some(node));
                }
                cursor = next;
            }
        };

        let mut index = index;
        let mut pages = pages;
        let mut prev = prev;
        let mut next = next;

        if let Some(n) = next
            && index + pages == n
        {
            let (n_pages, _, n_next) = self.free_slot(n);
            self.unlink(n);
            pages += n_pages;
            next = n_next;
        }
        if let Some(p) = prev
            && p + self.free_slot(p).0 == index
        {
            let (p_pages, p_prev, _) = self.free_slot(p);
            self.unlink(p);
            self.slots[index] = Slot::Unused;
            index = p;
            pages += p_pages;
            prev = p_prev;
        }

        self.slots[index] = Slot::Free { pages, prev, next };
        self.relink(index, prev, next);
        self.len += 1;
    }
}
