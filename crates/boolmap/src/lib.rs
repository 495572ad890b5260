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

#![no_std]

extern crate alloc;
use alloc::vec::Vec;

type BackingType = u64;

/// A growable map of bits.
///
/// Bits that have never been set read as `false`. Used for allocation maps
/// (physical frames, thread/process ids, swap slots) where most queries are
/// "find me a clear bit" or "find me a clear run".
#[derive(Clone, Default)]
pub struct BoolMap(Vec<BackingType>);

impl BoolMap {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    const fn index_of(bit_index: usize) -> (usize, usize) {
        (
            bit_index / (BackingType::BITS as usize),
            bit_index % (BackingType::BITS as usize),
        )
    }

    const fn recombine_to(array_index: usize, bit_index: usize) -> usize {
        (array_index * (BackingType::BITS as usize)) + bit_index
    }

    pub fn set(&mut self, index: usize, state: bool) {
        let (array_idx, bit_idx) = Self::index_of(index);

        // Clearing a bit past the end of the array is a no-op, so we don't
        // need to grow for it.
        if array_idx >= self.0.len() && !state {
            return;
        }

        let before_len = self.0.len();
        for _ in before_len..=array_idx {
            self.0.push(0);
        }

        if state {
            self.0[array_idx] |= 1 << bit_idx;
        } else {
            self.0[array_idx] &= !(1 << bit_idx);
        }
    }

    pub fn get(&self, index: usize) -> bool {
        let (array_idx, bit_idx) = Self::index_of(index);

        if array_idx >= self.0.len() {
            return false;
        }

        self.0[array_idx] & (1 << bit_idx) != 0
    }

    /// Find the lowest bit index holding `state`.
    ///
    /// Since unstored bits read as `false`, searching for `false` always
    /// succeeds (possibly just past the stored words).
    pub fn find_first_of(&self, state: bool) -> Option<usize> {
        if state {
            for (array_idx, el) in self.0.iter().enumerate() {
                if *el != 0 {
                    return Some(Self::recombine_to(
                        array_idx,
                        el.trailing_zeros() as usize,
                    ));
                }
            }

            None
        } else {
            for (array_idx, el) in self.0.iter().enumerate() {
                if *el != BackingType::MAX {
                    return Some(Self::recombine_to(
                        array_idx,
                        el.trailing_ones() as usize,
                    ));
                }
            }

            Some(Self::recombine_to(self.0.len(), 0))
        }
    }

    /// Count the number of `true` bits stored in the map.
    pub fn count_of(&self, state: bool) -> usize {
        let ones: usize = self.0.iter().map(|el| el.count_ones() as usize).sum();

        if state {
            ones
        } else {
            // Only meaningful relative to the stored words.
            self.0.len() * (BackingType::BITS as usize) - ones
        }
    }

    /// Find a run of `len` consecutive bits holding `state` within
    /// `[min_index, max_index)`.
    ///
    /// The run's first index will be a multiple of `align` (use 1 for no
    /// alignment), and the run will not cross any index that is a multiple of
    /// `boundary` (use 0 for no boundary), although it may start on one.
    pub fn find_run_of(
        &self,
        state: bool,
        len: usize,
        min_index: usize,
        max_index: usize,
        align: usize,
        boundary: usize,
    ) -> Option<usize> {
        if len == 0 || min_index >= max_index {
            return None;
        }

        let align = align.max(1);
        let mut count = 0;

        for index in min_index..max_index {
            if self.get(index) != state {
                count = 0;
                continue;
            }

            // A run may begin on a boundary but never extend across one.
            if count != 0 && boundary != 0 && index % boundary == 0 {
                count = 0;
            }

            if count == 0 && index % align != 0 {
                continue;
            }

            count += 1;
            if count == len {
                return Some(index + 1 - len);
            }
        }

        None
    }
}
