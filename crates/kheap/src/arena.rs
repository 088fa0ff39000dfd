//! Growable backing region of the block tier.
//!
//! The arena spans `[base, brk)`; every page in it is mapped. The first word
//! holds the BEG sentinel and the last word the END sentinel, so the block
//! tier's neighbour scans stop at both edges. `brk` only moves up, and never
//! past `limit`.

use snafu::{OptionExt as _, ResultExt as _};

use crate::{
    PAGE_SIZE, WORD_SIZE,
    address::VirtAddr,
    block::Tag,
    error::{BackArenaSnafu, GrowError, LimitExceededSnafu, OutOfFrames},
    frame::{self, AddressSpace, MapFlags},
};

#[derive(Debug)]
pub(crate) struct Arena {
    base: VirtAddr,
    brk: VirtAddr,
    limit: VirtAddr,
    flags: MapFlags,
    initialized: bool,
}

impl Arena {
    pub(crate) const fn new(base: VirtAddr, limit: VirtAddr, flags: MapFlags) -> Self {
        Self {
            base,
            brk: base,
            limit,
            flags,
            initialized: false,
        }
    }

    pub(crate) fn base(&self) -> VirtAddr {
        self.base
    }

    pub(crate) fn brk(&self) -> VirtAddr {
        self.brk
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns `true` if `va` lies in `[base, brk)`.
    pub(crate) fn contains(&self, va: VirtAddr) -> bool {
        self.base <= va && va < self.brk
    }

    /// Maps `[base, base + initial_size)` and writes both sentinels.
    ///
    /// On failure nothing stays mapped and the arena is still uninitialized.
    pub(crate) fn init<A>(&mut self, space: &mut A, initial_size: usize) -> Result<(), OutOfFrames>
    where
        A: AddressSpace,
    {
        debug_assert!(!self.initialized);
        frame::map_fresh_pages(space, self.base, initial_size / PAGE_SIZE, self.flags)?;
        self.brk = self.base + initial_size;
        self.initialized = true;
        unsafe {
            space.write_word(self.base, Tag::SENTINEL.bits());
        }
        self.write_end(space);
        info!(
            "arena initialized: {}..{} (limit {})",
            self.base, self.brk, self.limit
        );
        Ok(())
    }

    /// Grows the arena by `pages` pages and returns the previous break.
    ///
    /// `pages == 0` returns the current break without touching anything.
    /// The new space is mapped and a fresh END sentinel is written in its
    /// last word; turning the rest of it into a block is up to the caller.
    pub(crate) fn extend_break<A>(&mut self, space: &mut A, pages: usize) -> Result<VirtAddr, GrowError>
    where
        A: AddressSpace,
    {
        let old = self.brk;
        if pages == 0 {
            return Ok(old);
        }

        let new = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| old.checked_add(bytes))
            .filter(|new| *new <= self.limit)
            .context(LimitExceededSnafu {
                brk: old,
                pages,
                limit: self.limit,
            })?;
        frame::map_fresh_pages(space, old, pages, self.flags)
            .context(BackArenaSnafu { brk: old, pages })?;

        self.brk = new;
        self.write_end(space);
        debug!("arena break moved {old} -> {new}");
        Ok(old)
    }

    fn write_end<A>(&self, space: &mut A)
    where
        A: AddressSpace,
    {
        unsafe {
            space.write_word(self.brk.sub_bytes(WORD_SIZE), Tag::SENTINEL.bits());
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimAddressSpace;

    const BASE: VirtAddr = VirtAddr::new(0x10_0000);

    fn arena(space: &mut SimAddressSpace, limit_pages: usize) -> Arena {
        let mut arena = Arena::new(BASE, BASE + limit_pages * PAGE_SIZE, MapFlags::RW);
        arena.init(space, PAGE_SIZE).unwrap();
        arena
    }

    fn word(space: &SimAddressSpace, va: VirtAddr) -> usize {
        unsafe { space.read_word(va) }
    }

    #[test]
    fn init_writes_both_sentinels() {
        let mut space = SimAddressSpace::new(4);
        let arena = arena(&mut space, 4);
        assert!(arena.is_initialized());
        assert_eq!(arena.brk(), BASE + PAGE_SIZE);
        assert_eq!(word(&space, BASE), Tag::SENTINEL.bits());
        assert_eq!(word(&space, arena.brk().sub_bytes(WORD_SIZE)), Tag::SENTINEL.bits());
    }

    #[test]
    fn extend_break_returns_the_old_break() {
        let mut space = SimAddressSpace::new(4);
        let mut arena = arena(&mut space, 4);
        let old = arena.brk();
        assert_eq!(arena.extend_break(&mut space, 0).unwrap(), old);
        assert_eq!(arena.extend_break(&mut space, 2).unwrap(), old);
        assert_eq!(arena.brk(), old + 2 * PAGE_SIZE);
        assert!(space.is_mapped(old + PAGE_SIZE));
        assert_eq!(word(&space, arena.brk().sub_bytes(WORD_SIZE)), Tag::SENTINEL.bits());
    }

    #[test]
    fn extend_break_stops_at_the_limit() {
        let mut space = SimAddressSpace::new(8);
        let mut arena = arena(&mut space, 3);
        let old = arena.brk();
        assert!(matches!(
            arena.extend_break(&mut space, 3),
            Err(GrowError::LimitExceeded { .. })
        ));
        assert!(matches!(
            arena.extend_break(&mut space, usize::MAX),
            Err(GrowError::LimitExceeded { .. })
        ));
        assert_eq!(arena.brk(), old);
        assert_eq!(arena.extend_break(&mut space, 2).unwrap(), old);
    }

    #[test]
    fn extend_break_rolls_back_on_exhaustion() {
        let mut space = SimAddressSpace::new(2);
        let mut arena = arena(&mut space, 4);
        let old = arena.brk();
        assert!(matches!(
            arena.extend_break(&mut space, 2),
            Err(GrowError::BackArena { .. })
        ));
        assert_eq!(arena.brk(), old);
        assert!(!space.is_mapped(old));
        assert_eq!(space.free_frame_count(), 1);
    }
}
