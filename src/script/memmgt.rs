// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/memmgt.rs

// Memory management for the scripting runtime. Owns the cell heap,
// hands out cells from a free list, runs mark-sweep collection from
// an explicit root set, and keeps the protection stack used to root
// objects still under construction.

// <>

use std::ops::{Deref, DerefMut};

use super::core::{Hndl, Obj, FALSE, NIL, TRUE};
use super::Ctx;

/// Number of permanent cells at the bottom of every heap
const RESERVED: usize = 3;

/// Contiguous cell storage with a free list and mark bits
///
/// **Collection invalidates any handle reachable only through a Rust
/// local.** Anything that must survive a call to
/// [`Ctx::collect_garbage`] has to be reachable from a root: the
/// protection stack, the global environment, the call list, or a
/// handler-supplied root set.
pub struct Heap {
    cells: Vec<Obj>,
    marks: Vec<bool>,
    /// Head of the free cell list
    free: Option<Hndl>,
    /// Count of cells not on the free list
    live: usize,
    /// Protection stack; every entry is a root
    protect: Vec<Hndl>,
    /// Completed collection count
    cycles: usize,
    /// Marking worklist, kept to avoid reallocation between cycles
    work: Vec<Hndl>,
}

impl Heap {
    pub fn new(cap: usize) -> Self {
        let mut cells = Vec::with_capacity(cap.max(RESERVED));
        cells.push(Obj::Nil);
        cells.push(Obj::Bool(true));
        cells.push(Obj::Bool(false));

        debug_assert_eq!(cells.len(), RESERVED);
        debug_assert!(matches!(cells[NIL.index()], Obj::Nil));
        debug_assert!(matches!(cells[TRUE.index()], Obj::Bool(true)));
        debug_assert!(matches!(cells[FALSE.index()], Obj::Bool(false)));

        if cfg!(feature = "memdbg") {
            log::debug!("Creating heap with {} cells", cap);
        }

        Self {
            marks: vec![false; RESERVED],
            cells,
            free: None,
            live: RESERVED,
            protect: Vec::with_capacity(64),
            cycles: 0,
            work: Vec::new(),
        }
    }

    /// Stores an object in a free or fresh cell and returns its handle
    ///
    /// Never collects; the heap grows when the free list is empty.
    pub fn alloc(&mut self, obj: Obj) -> Hndl {
        let out = match self.free {
            Some(h) => {
                self.free = match self.cells[h.index()] {
                    Obj::Free(next) => next,
                    _ => unreachable!("free list links a live cell"),
                };
                self.cells[h.index()] = obj;
                h
            }
            None => {
                let h = Hndl(self.cells.len() as u32);
                self.cells.push(obj);
                self.marks.push(false);
                h
            }
        };

        self.live += 1;

        if cfg!(feature = "memdbg") {
            log::trace!("O {} BIRTH ({})", out.0, self.cells[out.index()].kind());
        }

        out
    }

    #[inline(always)]
    pub fn get(&self, h: Hndl) -> &Obj {
        &self.cells[h.index()]
    }

    #[inline(always)]
    pub fn get_mut(&mut self, h: Hndl) -> &mut Obj {
        &mut self.cells[h.index()]
    }

    /// Bounds-checked access for handles recovered from raw words
    pub fn try_get(&self, h: Hndl) -> Option<&Obj> {
        self.cells.get(h.index())
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Total cells, live or free
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    // protection stack

    pub fn save(&self) -> usize {
        self.protect.len()
    }

    pub fn restore(&mut self, idx: usize) {
        self.protect.truncate(idx);
    }

    pub fn push(&mut self, h: Hndl) {
        self.protect.push(h);
    }

    pub fn pop(&mut self) -> Option<Hndl> {
        self.protect.pop()
    }

    pub fn protected(&self) -> &[Hndl] {
        &self.protect
    }

    // collection

    fn clear_marks(&mut self) {
        self.marks.iter_mut().for_each(|m| *m = false);
        for i in 0..RESERVED {
            self.marks[i] = true;
        }
    }

    /// Marks everything reachable from `root`
    ///
    /// `ext` reports the children of opaque pointer cells, which the
    /// heap cannot see into.
    pub fn mark(&mut self, root: Hndl, ext: Option<&dyn Fn(usize) -> Vec<Hndl>>) {
        self.work.push(root);

        while let Some(h) = self.work.pop() {
            let idx = h.index();
            if idx >= self.cells.len() || self.marks[idx] {
                continue;
            }
            self.marks[idx] = true;

            let cell = &self.cells[idx];
            let work = &mut self.work;
            cell.each_child(|c| work.push(c));

            if let (Obj::Ptr(p), Some(ext)) = (cell, ext) {
                work.extend(ext(*p));
            }
        }
    }

    /// Reclaims every unmarked cell, rebuilding the free list
    ///
    /// `fin` sees the payload of each swept pointer cell. Returns the
    /// number of cells reclaimed by this sweep.
    pub fn sweep(&mut self, fin: &mut dyn FnMut(usize)) -> usize {
        let mut freed = 0;
        let mut head = None;

        // walk downward so the list hands out low cells first
        for idx in (RESERVED..self.cells.len()).rev() {
            if self.marks[idx] {
                continue;
            }

            let old = std::mem::replace(&mut self.cells[idx], Obj::Free(head));
            match old {
                Obj::Free(_) => (),
                other => {
                    if let Obj::Ptr(p) = other {
                        fin(p);
                    }
                    freed += 1;

                    if cfg!(feature = "memdbg") {
                        log::trace!("O {} DEATH", idx);
                    }
                }
            }

            head = Some(Hndl(idx as u32));
        }

        self.free = head;
        self.live -= freed;
        self.cycles += 1;
        freed
    }

    /// Full mark-sweep cycle over the given roots plus the protection
    /// stack
    pub fn collect(
        &mut self,
        roots: &[Hndl],
        ext: Option<&dyn Fn(usize) -> Vec<Hndl>>,
        fin: &mut dyn FnMut(usize),
    ) -> usize {
        self.clear_marks();

        for i in 0..self.protect.len() {
            let h = self.protect[i];
            self.mark(h, ext);
        }
        for h in roots {
            self.mark(*h, ext);
        }

        self.sweep(fin)
    }

    /// Whether the cell is currently on the free list
    pub fn free_p(&self, h: Hndl) -> bool {
        matches!(self.try_get(h), Some(Obj::Free(_)) | None)
    }
}

/// Protection checkpoint; restores the stack to its saved height when
/// dropped
///
/// Derefs to the context so rooted construction can continue through
/// the guard.
pub struct GcGuard<'c> {
    ctx: &'c mut Ctx,
    idx: usize,
}

impl<'c> GcGuard<'c> {
    pub(super) fn new(ctx: &'c mut Ctx) -> Self {
        let idx = ctx.save_gc();
        Self { ctx, idx }
    }

    /// Height the stack returns to on drop
    pub fn checkpoint(&self) -> usize {
        self.idx
    }
}

impl Deref for GcGuard<'_> {
    type Target = Ctx;

    fn deref(&self) -> &Ctx {
        self.ctx
    }
}

impl DerefMut for GcGuard<'_> {
    fn deref_mut(&mut self) -> &mut Ctx {
        self.ctx
    }
}

impl Drop for GcGuard<'_> {
    fn drop(&mut self) {
        self.ctx.restore_gc(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_fin(_: usize) {}

    #[test]
    fn alloc_reuses_free() {
        let mut heap = Heap::new(16);

        let a = heap.alloc(Obj::Fixnum(1));
        let b = heap.alloc(Obj::Fixnum(2));
        assert_eq!(heap.live(), RESERVED + 2);

        heap.push(b);
        let freed = heap.collect(&[], None, &mut no_fin);
        assert_eq!(freed, 1);
        assert!(heap.free_p(a));
        assert!(!heap.free_p(b));

        // the freed cell comes back first
        let c = heap.alloc(Obj::Fixnum(3));
        assert_eq!(c, a);
        assert_eq!(heap.len(), RESERVED + 2);
    }

    #[test]
    fn reserved_survive() {
        let mut heap = Heap::new(4);
        heap.collect(&[], None, &mut no_fin);

        assert!(matches!(heap.get(NIL), Obj::Nil));
        assert!(matches!(heap.get(TRUE), Obj::Bool(true)));
        assert!(matches!(heap.get(FALSE), Obj::Bool(false)));
    }

    #[test]
    fn marks_through_pairs() {
        let mut heap = Heap::new(16);

        let x = heap.alloc(Obj::Fixnum(7));
        let tail = heap.alloc(Obj::Pair(x, NIL));
        let head = heap.alloc(Obj::Pair(x, tail));
        let stray = heap.alloc(Obj::Fixnum(8));

        let freed = heap.collect(&[head], None, &mut no_fin);
        assert_eq!(freed, 1);
        assert!(heap.free_p(stray));
        assert!(matches!(heap.get(x), Obj::Fixnum(7)));
    }

    #[test]
    fn cyclic_marks_terminate() {
        let mut heap = Heap::new(16);

        let a = heap.alloc(Obj::Pair(NIL, NIL));
        let b = heap.alloc(Obj::Pair(a, a));
        *heap.get_mut(a) = Obj::Pair(b, b);

        assert_eq!(heap.collect(&[a], None, &mut no_fin), 0);
        assert_eq!(heap.collect(&[], None, &mut no_fin), 2);
    }

    #[test]
    fn pointer_hooks() {
        let mut heap = Heap::new(16);

        let kept = heap.alloc(Obj::Fixnum(99));
        let p = heap.alloc(Obj::Ptr(0xbeef));
        let lost = heap.alloc(Obj::Ptr(0xdead));

        let ext = |payload: usize| if payload == 0xbeef { vec![kept] } else { vec![] };
        let mut finalized = vec![];

        heap.collect(&[p], Some(&ext), &mut |v| finalized.push(v));

        assert!(!heap.free_p(kept));
        assert!(heap.free_p(lost));
        assert_eq!(finalized, vec![0xdead]);
    }

    #[test]
    fn protection_rewind() {
        let mut heap = Heap::new(16);
        let a = heap.alloc(Obj::Fixnum(1));

        let idx = heap.save();
        heap.push(a);
        assert_eq!(heap.collect(&[], None, &mut no_fin), 0);

        heap.restore(idx);
        assert_eq!(heap.collect(&[], None, &mut no_fin), 1);
        assert_eq!(heap.cycles(), 2);
    }
}
