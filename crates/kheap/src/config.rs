//! Static description of one heap instance.

use snafu::ensure;

use crate::{
    PAGE_SIZE,
    address::VirtAddr,
    block::MIN_BLOCK_SIZE,
    error::{InitialSizeExceedsLimitSnafu, InvalidLayoutSnafu, Violation},
    frame::MapFlags,
};

/// Largest request served by the block tier unless a layout says otherwise.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 2048;

/// Placement policy of the block tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitStrategy {
    /// Take the lowest-addressed free block that fits.
    #[default]
    FirstFit,
    /// Take the smallest free block that fits, the lowest-addressed one on
    /// ties.
    BestFit,
}

/// Address ranges and policies of one heap.
///
/// ```text
///  start          start + initial_size        limit    page_start      page_end
///    |--- mapped at init ---|--- grown on demand ---|guard|--- page tier ---|
/// ```
///
/// The page tier starts one guard page past `limit` unless
/// [`with_page_range`](Self::with_page_range) moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub start: VirtAddr,
    pub initial_size: usize,
    pub limit: VirtAddr,
    pub page_start: VirtAddr,
    pub page_end: VirtAddr,
    pub max_block_size: usize,
    pub strategy: FitStrategy,
    pub flags: MapFlags,
}

impl HeapLayout {
    /// Creates a kernel heap layout with the default threshold and strategy.
    #[must_use]
    pub const fn new(
        start: VirtAddr,
        initial_size: usize,
        limit: VirtAddr,
        page_end: VirtAddr,
    ) -> Self {
        Self {
            start,
            initial_size,
            limit,
            page_start: VirtAddr::new(limit.value().wrapping_add(PAGE_SIZE)),
            page_end,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            strategy: FitStrategy::FirstFit,
            flags: MapFlags::RW,
        }
    }

    #[must_use]
    pub const fn with_page_range(mut self, start: VirtAddr, end: VirtAddr) -> Self {
        self.page_start = start;
        self.page_end = end;
        self
    }

    #[must_use]
    pub const fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: FitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the permissions of every page the heap maps, e.g.
    /// [`MapFlags::URW`] for a process heap.
    #[must_use]
    pub const fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Number of pages in the page-tier range.
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.page_end.value().saturating_sub(self.page_start.value()) / PAGE_SIZE
    }

    /// Checks that the layout describes a usable heap whose page tier fits a
    /// descriptor table of `capacity` slots.
    pub(crate) fn validate(&self, capacity: usize) -> Result<(), Violation> {
        ensure!(
            self.start.is_page_aligned() && self.limit.is_page_aligned(),
            InvalidLayoutSnafu {
                reason: "block arena bounds are not page aligned",
            }
        );
        ensure!(
            self.initial_size != 0 && self.initial_size.is_multiple_of(PAGE_SIZE),
            InvalidLayoutSnafu {
                reason: "initial size is not a positive multiple of the page size",
            }
        );
        ensure!(
            self.limit
                .checked_sub(self.start)
                .is_some_and(|room| self.initial_size <= room),
            InitialSizeExceedsLimitSnafu {
                start: self.start,
                initial_size: self.initial_size,
                limit: self.limit,
            }
        );
        ensure!(
            self.page_start.is_page_aligned() && self.page_end.is_page_aligned(),
            InvalidLayoutSnafu {
                reason: "page range is not page aligned",
            }
        );
        ensure!(
            self.page_start < self.page_end,
            InvalidLayoutSnafu {
                reason: "page range is empty",
            }
        );
        ensure!(
            self.page_start >= self.limit || self.page_end <= self.start,
            InvalidLayoutSnafu {
                reason: "page range overlaps the block arena",
            }
        );
        ensure!(
            self.page_count() <= capacity,
            InvalidLayoutSnafu {
                reason: "page range exceeds the descriptor table",
            }
        );
        ensure!(
            self.max_block_size >= MIN_BLOCK_SIZE,
            InvalidLayoutSnafu {
                reason: "max block size is below the minimum block size",
            }
        );
        ensure!(
            self.max_block_size <= self.limit - self.start,
            InvalidLayoutSnafu {
                reason: "max block size exceeds the block arena",
            }
        );
        Ok(())
    }
}
