//! Interface to the frame subsystem.
//!
//! A heap never owns physical memory. It asks an [`AddressSpace`] for frames,
//! keeps them mapped for the lifetime of an allocation, and reads or writes
//! its own metadata through the same trait.

use bitflags::bitflags;

use crate::{
    PAGE_SIZE,
    address::{PhysAddr, VirtAddr},
    error::{self, AlreadyMappedSnafu, OutOfFrames},
};

bitflags! {
    /// Permissions for a mapped heap page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// The page is readable.
        const R = 1 << 0;
        /// The page is writable.
        const W = 1 << 1;
        /// The page is reachable from user mode.
        const U = 1 << 2;

        const RW = Self::R.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
    }
}

/// One address space together with the frame subsystem backing it.
///
/// Frames are reference counted by the implementor: [`map_frame`] takes a
/// reference and [`unmap_frame`] drops one, freeing the frame when the last
/// reference goes away.
///
/// [`map_frame`]: Self::map_frame
/// [`unmap_frame`]: Self::unmap_frame
pub trait AddressSpace {
    /// Handle to one physical frame.
    type Frame: Copy + Eq + core::fmt::Debug;

    /// Allocates an unmapped frame with no references.
    fn allocate_frame(&mut self) -> Result<Self::Frame, OutOfFrames>;

    /// Returns a frame that was allocated but never mapped.
    fn free_frame(&mut self, frame: Self::Frame);

    /// Maps `frame` at the page `va`.
    ///
    /// On failure nothing is left mapped and the frame's reference count is
    /// unchanged.
    fn map_frame(
        &mut self,
        frame: Self::Frame,
        va: VirtAddr,
        flags: MapFlags,
    ) -> Result<(), OutOfFrames>;

    /// Removes the mapping of the page `va`, if any.
    fn unmap_frame(&mut self, va: VirtAddr);

    /// Returns the frame mapped at the page containing `va`.
    fn frame_at(&self, va: VirtAddr) -> Option<Self::Frame>;

    /// Returns the physical address of the first byte of `frame`.
    fn frame_phys_addr(&self, frame: Self::Frame) -> PhysAddr;

    /// Returns the frame containing `pa`, if `pa` is managed memory.
    fn frame_by_phys_addr(&self, pa: PhysAddr) -> Option<Self::Frame>;

    /// Returns the virtual page `frame` was most recently mapped at, or
    /// `None` if it is not mapped.
    fn frame_owner_page(&self, frame: Self::Frame) -> Option<VirtAddr>;

    /// Reads the machine word at `va`.
    ///
    /// # Safety
    ///
    /// `va` must be word aligned and lie in a mapped page of this address
    /// space.
    unsafe fn read_word(&self, va: VirtAddr) -> usize;

    /// Writes the machine word at `va`.
    ///
    /// # Safety
    ///
    /// `va` must be word aligned and lie in a mapped page of this address
    /// space that no live allocation other than the caller's owns.
    unsafe fn write_word(&mut self, va: VirtAddr, value: usize);

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    ///
    /// # Safety
    ///
    /// Both ranges must lie in mapped pages of this address space.
    unsafe fn copy_bytes(&mut self, src: VirtAddr, dst: VirtAddr, len: usize);
}

/// Backs the page `va` with a fresh frame.
///
/// Mapping over an existing mapping is a caller bug and is reported as a
/// violation.
pub(crate) fn map_fresh_page<A>(
    space: &mut A,
    va: VirtAddr,
    flags: MapFlags,
) -> Result<(), OutOfFrames>
where
    A: AddressSpace,
{
    if space.frame_at(va).is_some() {
        error::report(
            AlreadyMappedSnafu {
                operation: "map_fresh_page",
                addr: va,
            }
            .build(),
        );
    }

    let frame = space.allocate_frame()?;
    if let Err(err) = space.map_frame(frame, va, flags) {
        space.free_frame(frame);
        return Err(err);
    }
    Ok(())
}

/// Backs `count` pages starting at `va` with fresh frames.
///
/// Either all pages end up mapped or, on failure, none of them are.
pub(crate) fn map_fresh_pages<A>(
    space: &mut A,
    va: VirtAddr,
    count: usize,
    flags: MapFlags,
) -> Result<(), OutOfFrames>
where
    A: AddressSpace,
{
    for i in 0..count {
        if let Err(err) = map_fresh_page(space, va + i * PAGE_SIZE, flags) {
            warn!("out of frames after {i} of {count} pages at {va}, rolling back");
            unmap_pages(space, va, i);
            return Err(err);
        }
    }
    Ok(())
}

/// Drops the mappings of `count` pages starting at `va`.
pub(crate) fn unmap_pages<A>(space: &mut A, va: VirtAddr, count: usize)
where
    A: AddressSpace,
{
    for i in 0..count {
        space.unmap_frame(va + i * PAGE_SIZE);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimAddressSpace;

    #[test]
    fn map_fresh_pages_maps_every_page() {
        let mut space = SimAddressSpace::new(8);
        let va = VirtAddr::new(0x10_0000);
        map_fresh_pages(&mut space, va, 3, MapFlags::RW).unwrap();
        for i in 0..3 {
            assert!(space.frame_at(va + i * PAGE_SIZE).is_some());
        }
        assert_eq!(space.free_frame_count(), 5);
    }

    #[test]
    fn map_fresh_pages_rolls_back_on_exhaustion() {
        let mut space = SimAddressSpace::new(2);
        let va = VirtAddr::new(0x10_0000);
        assert!(map_fresh_pages(&mut space, va, 3, MapFlags::RW).is_err());
        for i in 0..3 {
            assert!(space.frame_at(va + i * PAGE_SIZE).is_none());
        }
        assert_eq!(space.free_frame_count(), 2);
    }

    #[test]
    fn map_failure_returns_the_frame() {
        let mut space = SimAddressSpace::new(2);
        space.fail_next_maps(1);
        let va = VirtAddr::new(0x10_0000);
        assert!(map_fresh_page(&mut space, va, MapFlags::RW).is_err());
        assert!(space.frame_at(va).is_none());
        assert_eq!(space.free_frame_count(), 2);
    }

    #[test]
    #[should_panic(expected = "is already mapped")]
    fn mapping_twice_is_a_violation() {
        let mut space = SimAddressSpace::new(2);
        let va = VirtAddr::new(0x10_0000);
        map_fresh_page(&mut space, va, MapFlags::RW).unwrap();
        let _ = map_fresh_page(&mut space, va, MapFlags::RW);
    }
}
