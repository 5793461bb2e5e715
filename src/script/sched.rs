// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/sched.rs

// Cooperative round-robin scheduling of VM programs. Every strand
// shares one context and runs for a fixed instruction budget per
// turn, so interleaving is deterministic.

// <>

use super::core::Hndl;
use super::emit::Program;
use super::vm::{Status, Vm, VmError};
use super::Ctx;

/// How a strand finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Exit { value: Hndl, status: bool },
    Fault(VmError),
}

struct Strand {
    id: usize,
    vm: Vm,
    outcome: Option<Outcome>,
}

/// Set of VM strands advanced in turn
pub struct Weft {
    budget: i64,
    nxt_id: usize,
    strands: Vec<Strand>,
    turns: u64,
}

impl Weft {
    /// Creates an empty weft giving each strand `budget` instructions
    /// per turn
    pub fn create(budget: i64) -> Self {
        Self {
            budget: budget.max(1),
            nxt_id: 0,
            strands: Vec::with_capacity(4),
            turns: 0,
        }
    }

    /// Starts a strand running `prog` on a fresh machine; returns its
    /// ID
    pub fn spawn(&mut self, ctx: &Ctx, prog: &Program) -> Result<usize, VmError> {
        let mut vm = Vm::with_standard_layout(ctx.config())?;
        vm.load(prog)?;

        let id = self.nxt_id;
        self.nxt_id += 1;
        self.strands.push(Strand { id, vm, outcome: None });

        log::debug!("spawned strand {}", id);
        Ok(id)
    }

    /// Gives every unfinished strand one turn; returns whether any
    /// strand is still running
    pub fn advance(&mut self, ctx: &mut Ctx) -> bool {
        self.turns += 1;

        for s in self.strands.iter_mut().filter(|s| s.outcome.is_none()) {
            match s.vm.step(ctx, self.budget) {
                Ok(Status::Yield) => (),
                Ok(Status::Exit(status)) => {
                    log::debug!("strand {} exited after {} cycles", s.id, s.vm.cycles());
                    s.outcome = Some(Outcome::Exit {
                        value: s.vm.result(),
                        status,
                    });
                }
                Err(e) => {
                    log::warn!("strand {} faulted: {}", s.id, e);
                    s.outcome = Some(Outcome::Fault(e));
                }
            }
        }

        !self.done_p()
    }

    /// Runs every strand to completion, returning outcomes in spawn
    /// order
    pub fn run(&mut self, ctx: &mut Ctx) -> Vec<(usize, Outcome)> {
        while self.advance(ctx) {}

        self.strands
            .iter()
            .filter_map(|s| s.outcome.clone().map(|o| (s.id, o)))
            .collect()
    }

    pub fn done_p(&self) -> bool {
        self.strands.iter().all(|s| s.outcome.is_some())
    }

    pub fn result(&self, id: usize) -> Option<&Outcome> {
        self.strands.iter().find(|s| s.id == id)?.outcome.as_ref()
    }

    /// Turns taken so far
    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Collects garbage with every strand's machine state as roots
    pub fn collect_garbage(&self, ctx: &mut Ctx) -> usize {
        let roots: Vec<Hndl> = self.strands.iter().flat_map(|s| s.vm.roots(ctx)).collect();
        ctx.collect_garbage_with(&roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compile::compile_program;
    use crate::script::parser::Reader;

    fn compile(ctx: &mut Ctx, code: &str) -> Program {
        let expr = Reader::new(code.as_bytes()).read(ctx).unwrap().unwrap();
        compile_program(ctx, expr, None).unwrap()
    }

    fn tracer(ctx: &mut Ctx, tag: &str) -> Program {
        let code = format!(
            "(do (define n{0} 0) (while (< n{0} 3) (set! trace (cons '{0} trace)) (set! n{0} (+ n{0} 1))) n{0})",
            tag
        );
        compile(ctx, &code)
    }

    fn traced(budget: i64) -> String {
        let mut ctx = Ctx::default();
        ctx.eval_source(b"(define trace nil)");

        let a = tracer(&mut ctx, "a");
        let b = tracer(&mut ctx, "b");

        let mut weft = Weft::create(budget);
        weft.spawn(&ctx, &a).unwrap();
        weft.spawn(&ctx, &b).unwrap();
        let out = weft.run(&mut ctx);

        for (_, o) in &out {
            match o {
                Outcome::Exit { value, status } => {
                    assert!(status);
                    assert_eq!(ctx.fixnum_get(*value), Some(3));
                }
                Outcome::Fault(e) => panic!("strand faulted: {}", e),
            }
        }

        let (trace, _) = ctx.eval_source(b"trace");
        ctx.display(trace).to_string()
    }

    #[test]
    fn small_budgets_interleave() {
        assert_eq!(traced(1), "(b a b a b a)");
    }

    #[test]
    fn large_budgets_run_whole() {
        assert_eq!(traced(100_000), "(b b b a a a)");
    }

    #[test]
    fn faults_stay_local() {
        let mut ctx = Ctx::default();
        let bad = compile(&mut ctx, "(missing 1)");
        let good = compile(&mut ctx, "(+ 1 1)");

        let mut weft = Weft::create(2);
        let b = weft.spawn(&ctx, &bad).unwrap();
        let g = weft.spawn(&ctx, &good).unwrap();
        assert!(!weft.done_p());

        let out = weft.run(&mut ctx);
        assert_eq!(out.len(), 2);
        assert!(weft.done_p());
        assert!(weft.turns() > 1);

        assert!(matches!(weft.result(b), Some(Outcome::Fault(VmError::Raised(_)))));
        match weft.result(g) {
            Some(Outcome::Exit { value, status: true }) => assert_eq!(ctx.fixnum_get(*value), Some(2)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(weft.result(99), None);
    }

    #[test]
    fn collection_keeps_strand_values() {
        let mut ctx = Ctx::default();
        let prog = compile(&mut ctx, "(list 1 2 3)");

        let mut weft = Weft::create(4);
        let id = weft.spawn(&ctx, &prog).unwrap();
        weft.run(&mut ctx);
        weft.collect_garbage(&mut ctx);

        match weft.result(id) {
            Some(Outcome::Exit { value, .. }) => assert_eq!(ctx.display(*value).to_string(), "(1 2 3)"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
