/*
  ____                 __               __ __                 __
 / __ \__ _____ ____  / /___ ____ _    / //_/__ _______  ___ / /
/ /_/ / // / _ `/ _ \/ __/ // /  ' \  / ,< / -_) __/ _ \/ -_) /
\___\_\_,_/\_,_/_//_/\__/\_,_/_/_/_/ /_/|_|\__/_/ /_//_/\__/_/
  Part of the Quantum OS Kernel

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

//! The virtual address space layout.
//!
//! A flat 32-bit-style split: user memory low, kernel memory high. User
//! stacks grow down from [`USER_STACK_LIMIT`]; anonymous user mappings are
//! placed from [`USER_MMAP_BASE`] up; the program loader sits just below the
//! top of the user area so exec can wipe everything between the stacks and
//! the loader without tearing the loader down.

/// The lowest address user memory may occupy. Everything below is the null
/// guard region.
pub const USER_AREA_BASE: usize = 0x0010_0000;

/// User stacks live immediately below this address.
pub const USER_STACK_LIMIT: usize = 0x1000_0000;

/// Placement of user mappings that don't request a fixed address.
pub const USER_MMAP_BASE: usize = 0x2000_0000;

/// The program loader's image starts here; exec keeps it.
pub const PROG_LOADER_BASE: usize = 0xA000_0000;

/// The first address past all user memory.
pub const USER_AREA_LIMIT: usize = 0xB000_0000;

/// Placement of kernel mappings that don't request a fixed address.
pub const KERNEL_SBRK_BASE: usize = 0xC000_0000;
