//! Virtual to physical address translation and back.
//!
//! Both directions are a single lookup in the frame subsystem plus the
//! in-page offset.

use crate::{
    address::{PhysAddr, VirtAddr},
    frame::AddressSpace,
};

/// Returns the physical address backing `va`, or `None` if its page is not
/// mapped.
pub(crate) fn physical_address<A>(space: &A, va: VirtAddr) -> Option<PhysAddr>
where
    A: AddressSpace,
{
    let frame = space.frame_at(va)?;
    Some(space.frame_phys_addr(frame) + va.page_offset())
}

/// Returns the virtual address `pa` is mapped at, or `None` if its frame is
/// not managed or not mapped.
pub(crate) fn virtual_address<A>(space: &A, pa: PhysAddr) -> Option<VirtAddr>
where
    A: AddressSpace,
{
    let frame = space.frame_by_phys_addr(pa)?;
    let page = space.frame_owner_page(frame)?;
    Some(page + pa.page_offset())
}
