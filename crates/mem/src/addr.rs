/*
  ____                 __               __   _ __
 / __ \__ _____ ____  / /___ ____ _    / /  (_) /
/ /_/ / // / _ `/ _ \/ __/ // /  ' \  / /__/ / _ \
\___\_\_,_/\_,_/_//_/\__/\_,_/_/_/_/ /____/_/_.__/
    Part of the Quantum OS Project

Copyright 2025 Gavin Kellam

Permission is hereby granted, free of charge, to any person obtaining a copy of this software and
associated documentation files (the "Software"), to deal in the Software without restriction,
including without limitation the rights to use, copy, modify, merge, publish, distribute,
sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all copies or substantial
portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT
NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT
OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
*/

use util::{align_down_to, align_to, is_align_to};

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

macro_rules! impl_addr_for {
    ($($t:ty),*) => {
        $(
            impl $t {
                pub const fn new(addr: usize) -> Self {
                    Self(addr)
                }

                pub const fn addr(&self) -> usize {
                    self.0
                }

                pub const fn is_null(&self) -> bool {
                    self.0 == 0
                }

                pub const fn offset(self, by: usize) -> Self {
                    Self(self.0 + by)
                }

                pub const fn is_aligned_to(&self, alignment: usize) -> bool {
                    is_align_to(self.0, alignment)
                }

                pub const fn align_up(self, alignment: usize) -> Self {
                    Self(align_to(self.0, alignment))
                }

                pub const fn align_down(self, alignment: usize) -> Self {
                    Self(align_down_to(self.0, alignment))
                }

                /// Distance (in bytes) from `self` to `rhs`.
                ///
                /// `rhs` is the end point, so this will panic if `rhs` is
                /// lower than `self`.
                pub const fn distance_to(&self, rhs: &Self) -> usize {
                    rhs.0 - self.0
                }
            }

            impl From<usize> for $t {
                fn from(value: usize) -> Self {
                    Self(value)
                }
            }

            impl core::fmt::Debug for $t {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    f.debug_tuple(stringify!($t))
                        .field(&format_args!("{:#x}", self.0))
                        .finish()
                }
            }

            impl core::fmt::Display for $t {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    write!(f, "{:#x}", self.0)
                }
            }
        )*
    };
}

impl_addr_for! { PhysAddr, VirtAddr }

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_addr_alignment() {
        let a = VirtAddr::new(4097);

        assert!(!a.is_aligned_to(4096));
        assert_eq!(a.align_up(4096), VirtAddr::new(8192));
        assert_eq!(a.align_down(4096), VirtAddr::new(4096));
    }

    #[test]
    fn test_addr_distance() {
        let a = PhysAddr::new(4096);
        let b = PhysAddr::new(8192);

        assert_eq!(a.distance_to(&b), 4096);
        assert_eq!(a.offset(4096), b);
    }
}
