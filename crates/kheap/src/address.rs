//! Typed virtual and physical addresses.
//!
//! Both tiers do all of their tag, neighbour and descriptor arithmetic on
//! these wrappers instead of raw pointers. Nothing here dereferences memory;
//! reads and writes go through [`AddressSpace`](crate::frame::AddressSpace).

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::PAGE_SIZE;

macro_rules! impl_hex {
    ($ty:ty) => {
        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl fmt::UpperHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::UpperHex::fmt(&self.0, f)
            }
        }
    };
}

macro_rules! impl_addr {
    ($ty:ident, $what:literal) => {
        impl $ty {
            /// Creates an address from a raw value.
            #[must_use]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[must_use]
            pub const fn value(self) -> usize {
                self.0
            }

            /// Safely adds a byte offset to this address.
            ///
            /// Returns `None` if the addition would overflow.
            #[must_use]
            pub const fn checked_add(self, bytes: usize) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(addr) => Some(Self(addr)),
                    None => None,
                }
            }

            /// Safely subtracts another address from this one.
            ///
            /// Returns `None` if the subtraction would underflow.
            #[must_use]
            pub const fn checked_sub(self, rhs: Self) -> Option<usize> {
                self.0.checked_sub(rhs.0)
            }

            /// Subtracts a byte offset from this address.
            ///
            /// # Panics
            ///
            /// Panics if the subtraction would underflow.
            #[must_use]
            pub const fn sub_bytes(self, bytes: usize) -> Self {
                match self.0.checked_sub(bytes) {
                    Some(addr) => Self(addr),
                    None => panic!(concat!($what, " address underflow")),
                }
            }

            /// Returns the offset of this address within its page.
            #[must_use]
            pub const fn page_offset(self) -> usize {
                self.0 % PAGE_SIZE
            }

            /// Returns the start of the page containing this address.
            #[must_use]
            pub const fn page_align_down(self) -> Self {
                Self(self.0 / PAGE_SIZE * PAGE_SIZE)
            }

            /// Returns `true` if this address is on a page boundary.
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.0.is_multiple_of(PAGE_SIZE)
            }
        }

        impl Add<usize> for $ty {
            type Output = Self;

            fn add(self, rhs: usize) -> Self::Output {
                match self.checked_add(rhs) {
                    Some(addr) => addr,
                    None => panic!(concat!($what, " address overflow")),
                }
            }
        }

        impl Sub<Self> for $ty {
            type Output = usize;

            fn sub(self, rhs: Self) -> Self::Output {
                match self.checked_sub(rhs) {
                    Some(diff) => diff,
                    None => panic!(concat!($what, " address underflow")),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

/// Virtual address inside a heap's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);
impl_hex!(VirtAddr);
impl_addr!(VirtAddr, "virtual");

impl VirtAddr {
    /// Address 0, never handed out by a heap.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Creates a virtual address from a pointer.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.addr())
    }

    /// Converts this address to a mutable pointer.
    ///
    /// Only meaningful for address spaces whose virtual addresses are
    /// directly dereferenceable by the running code.
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        core::ptr::with_exposed_provenance_mut(self.0)
    }
}

/// Physical address of a byte inside some frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);
impl_hex!(PhysAddr);
impl_addr!(PhysAddr, "physical");
