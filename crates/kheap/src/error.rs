//! Error types and the fatal reporting path.
//!
//! Capacity failures are ordinary [`Result`] errors ([`AllocError`],
//! [`GrowError`], [`OutOfFrames`]) that callers handle as out-of-memory.
//! Invariant violations ([`Violation`]) mean a caller broke the allocator's
//! contract; they never come back as values and are handed to [`report`],
//! which halts the faulting context.

use core::{error::Error, fmt};

use snafu::{GenerateImplicitData, Snafu};

use crate::address::VirtAddr;

/// Source location captured when an error is built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(pub(crate) &'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The frame subsystem ran out of physical frames.
#[derive(Debug, Snafu)]
#[snafu(display("physical frames exhausted"), visibility(pub))]
pub struct OutOfFrames {
    #[snafu(implicit)]
    location: Location,
}

/// Errors returned by [`Heap::allocate`](crate::Heap::allocate) and
/// [`Heap::resize`](crate::Heap::resize).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("zero-sized allocation request"))]
    ZeroSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free block fits {size} bytes and the arena cannot grow"))]
    ArenaExhausted {
        size: usize,
        #[snafu(source)]
        source: GrowError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free segment spans {pages} pages"))]
    NoSegment {
        pages: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to back {pages} pages at {va}"))]
    BackPages {
        va: VirtAddr,
        pages: usize,
        #[snafu(source)]
        source: OutOfFrames,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("alignment {align} is not supported"))]
    Alignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Errors returned by [`Heap::extend_break`](crate::Heap::extend_break).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GrowError {
    #[snafu(display("growing the break {brk} by {pages} pages passes the limit {limit}"))]
    LimitExceeded {
        brk: VirtAddr,
        pages: usize,
        limit: VirtAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to back {pages} arena pages at {brk}"))]
    BackArena {
        brk: VirtAddr,
        pages: usize,
        #[snafu(source)]
        source: OutOfFrames,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Broken allocator contracts. These are programming errors in a caller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Violation {
    #[snafu(display(
        "{operation}: address {addr} is outside the block arena {}..{} and the page range {}..{}",
        block.0, block.1, pages.0, pages.1
    ))]
    ForeignAddress {
        operation: &'static str,
        addr: VirtAddr,
        block: (VirtAddr, VirtAddr),
        pages: (VirtAddr, VirtAddr),
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{operation}: page {addr} is already mapped"))]
    AlreadyMapped {
        operation: &'static str,
        addr: VirtAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{operation}: page {addr} has no backing frame"))]
    MissingFrame {
        operation: &'static str,
        addr: VirtAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "init: initial size {initial_size:#x} from {start} exceeds the limit {limit}"
    ))]
    InitialSizeExceedsLimit {
        start: VirtAddr,
        initial_size: usize,
        limit: VirtAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("init: out of frames while mapping the initial arena at {addr}"))]
    InitialMapping {
        addr: VirtAddr,
        #[snafu(source)]
        source: OutOfFrames,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid heap layout: {reason}"))]
    InvalidLayout {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "{operation}: no live allocation starts at {addr} in the page range {}..{}",
        pages.0, pages.1
    ))]
    UnknownAllocation {
        operation: &'static str,
        addr: VirtAddr,
        pages: (VirtAddr, VirtAddr),
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "{operation}: no live block starts at {addr} in the block arena {}..{}",
        block.0, block.1
    ))]
    UnknownBlock {
        operation: &'static str,
        addr: VirtAddr,
        block: (VirtAddr, VirtAddr),
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("recursive acquisition of a spin lock held since {locked_at}"))]
    RecursiveLock {
        locked_at: Location,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Violation {
    /// Returns where the violation was detected.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::ForeignAddress { location, .. }
            | Self::AlreadyMapped { location, .. }
            | Self::MissingFrame { location, .. }
            | Self::InitialSizeExceedsLimit { location, .. }
            | Self::InitialMapping { location, .. }
            | Self::InvalidLayout { location, .. }
            | Self::UnknownAllocation { location, .. }
            | Self::UnknownBlock { location, .. }
            | Self::RecursiveLock { location, .. } => *location,
        }
    }
}

/// Renders an error and its chain of sources.
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: \x1B[31;1m{}\x1B[0m", self.error)?;
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: \x1B[31;1m{s}\x1B[0m")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

/// Halts the current context on an invariant violation.
#[track_caller]
pub fn report(violation: Violation) -> ! {
    let location = violation.location();
    error!("heap invariant violated at {location}: {violation}");
    let report = Report::new(violation);
    panic!("\x1B[31;1mHeap invariant violated\x1B[0m\n\n{report}  at \x1B[90;1m{location}\x1B[0m");
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use snafu::ResultExt as _;

    use super::*;

    fn exhausted() -> Result<(), OutOfFrames> {
        OutOfFramesSnafu.fail()
    }

    #[test]
    fn report_walks_sources() {
        let err = exhausted()
            .context(BackArenaSnafu {
                brk: VirtAddr::new(0x4000),
                pages: 2_usize,
            })
            .unwrap_err();
        let text = format!("{}", Report::new(err));
        assert!(text.contains("failed to back 2 arena pages at 0x4000"));
        assert!(text.contains("Caused by:"));
        assert!(text.contains("physical frames exhausted"));
    }

    #[test]
    fn violation_records_location() {
        let violation = InvalidLayoutSnafu { reason: "empty" }.build();
        assert!(format!("{}", violation.location()).contains("error.rs"));
    }

    #[test]
    #[should_panic(expected = "free: address 0x10 is outside the block arena")]
    fn report_panics_with_the_message() {
        report(
            ForeignAddressSnafu {
                operation: "free",
                addr: VirtAddr::new(0x10),
                block: (VirtAddr::new(0x1000), VirtAddr::new(0x2000)),
                pages: (VirtAddr::new(0x3000), VirtAddr::new(0x4000)),
            }
            .build(),
        );
    }
}
