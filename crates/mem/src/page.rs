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

use crate::addr::{PhysAddr, VirtAddr};
use util::consts::PAGE_4K;

/// A 4 KiB aligned physical page, stored by page id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysPage(usize);

/// A 4 KiB aligned virtual page, stored by page id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(usize);

impl PhysPage {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the page that contains this physical address.
    pub const fn containing_addr(addr: PhysAddr) -> Self {
        Self(addr.addr() / PAGE_4K)
    }

    /// Get the address of the start of this page.
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 * PAGE_4K)
    }

    pub const fn page(&self) -> usize {
        self.0
    }

    pub const fn offset(self, pages: usize) -> Self {
        Self(self.0 + pages)
    }
}

impl VirtPage {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the page that contains this virtual address.
    pub const fn containing_addr(addr: VirtAddr) -> Self {
        Self(addr.addr() / PAGE_4K)
    }

    /// Get the address of the start of this page.
    pub const fn addr(&self) -> VirtAddr {
        VirtAddr::new(self.0 * PAGE_4K)
    }

    pub const fn page(&self) -> usize {
        self.0
    }

    pub const fn offset(self, pages: usize) -> Self {
        Self(self.0 + pages)
    }
}

macro_rules! impl_page_fmt_for {
    ($($t:ty),*) => {
        $(
            impl core::fmt::Debug for $t {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    f.debug_tuple(stringify!($t)).field(&self.0).finish()
                }
            }
        )*
    };
}

impl_page_fmt_for! { PhysPage, VirtPage }
