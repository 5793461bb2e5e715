// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/regalloc.rs

// Bitmap register pool used during code generation.

// <>

use std::fmt;

/// Register number returned when the pool is exhausted; never part of
/// a window, since r0 is the fixed value register
pub const NO_REG: u8 = 0;

/// Fixed-capacity allocator over the register window `[start, end)`
///
/// Bit `i` of the mask records whether register `start + i` is held.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegPool {
    start: u8,
    end: u8,
    mask: u64,
}

impl RegPool {
    /// Creates a pool over `[start, end)` with every register free
    pub fn init(start: u8, end: u8) -> Self {
        assert!(start > NO_REG, "register window may not include r0");
        assert!(start <= end, "register window is inverted");
        assert!(end - start <= 64, "register window wider than 64");

        Self { start, end, mask: 0 }
    }

    fn window(&self) -> u64 {
        match self.end - self.start {
            64 => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }

    /// Number of registers the pool can hand out
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Number of registers currently held
    pub fn held(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn held_p(&self, reg: u8) -> bool {
        self.contains(reg) && self.mask & (1 << (reg - self.start)) != 0
    }

    fn contains(&self, reg: u8) -> bool {
        reg >= self.start && reg < self.end
    }

    /// Takes the highest free register, or [`NO_REG`] when all are held
    pub fn retain(&mut self) -> u8 {
        let free = self.window() & !self.mask;
        if free == 0 {
            return NO_REG;
        }

        let idx = 63 - free.leading_zeros();
        self.mask |= 1 << idx;
        self.start + idx as u8
    }

    pub fn try_retain(&mut self) -> Option<u8> {
        match self.retain() {
            NO_REG => None,
            r => Some(r),
        }
    }

    /// Returns a register to the pool; unheld registers are ignored
    pub fn release(&mut self, reg: u8) {
        if self.contains(reg) {
            self.mask &= !(1 << (reg - self.start));
        }
    }

    /// Held registers in ascending order
    pub fn live(&self) -> impl Iterator<Item = u8> + '_ {
        (self.start..self.end).filter(move |r| self.held_p(*r))
    }

    /// Frees every register
    pub fn reset(&mut self) {
        self.mask = 0;
    }
}

impl fmt::Debug for RegPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegPool[{}, {}){{", self.start, self.end)?;
        let mut first = true;
        for reg in self.live() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "r{}", reg)?;
            first = false;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn exhaustion() {
        let mut pool = RegPool::init(1, 26);
        let mut seen = HashSet::new();

        for _ in 0..pool.capacity() {
            let r = pool.retain();
            assert!((1..26).contains(&r));
            assert!(seen.insert(r));
        }

        assert_eq!(pool.retain(), NO_REG);
        assert_eq!(pool.try_retain(), None);

        pool.release(7);
        assert_eq!(pool.retain(), 7);
    }

    #[test]
    fn highest_first() {
        let mut pool = RegPool::init(4, 8);
        assert_eq!(pool.retain(), 7);
        assert_eq!(pool.retain(), 6);
        pool.release(7);
        assert_eq!(pool.retain(), 7);
        assert_eq!(pool.held(), 2);
    }

    #[test]
    fn release_is_idempotent() {
        let mut pool = RegPool::init(1, 4);
        pool.release(2);
        pool.release(40);
        pool.release(NO_REG);
        assert_eq!(pool.held(), 0);

        let r = pool.retain();
        pool.release(r);
        pool.release(r);
        assert_eq!(pool.held(), 0);
        assert_eq!(format!("{:?}", pool), "RegPool[1, 4){}");
    }

    #[test]
    fn full_width() {
        let mut pool = RegPool::init(1, 65);
        for _ in 0..64 {
            assert_ne!(pool.retain(), NO_REG);
        }
        assert_eq!(pool.retain(), NO_REG);

        pool.reset();
        assert_eq!(pool.retain(), 64);
    }

    #[test]
    fn empty_window() {
        let mut pool = RegPool::init(3, 3);
        assert_eq!(pool.retain(), NO_REG);
    }

    #[test]
    #[should_panic]
    fn rejects_r0() {
        RegPool::init(0, 4);
    }
}
