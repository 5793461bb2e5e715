// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/compile.rs

// Compiler from script expressions to VM block graphs. Heads that
// resolve at compile time are dispatched statically: special forms
// become control flow, built-ins become `prim`, macros are expanded
// in place, and closures become procedures entered with `bl`.
// Anything else is looked up and applied at run time.

// <>

use std::collections::HashMap;
use std::fmt;

use super::core::{Closure, Hndl, Obj, Prim, NIL, TRUE};
use super::emit::{AsmError, BlockId, BlockKind, Emitter, Insn, Program, Target, CLOS_FUNC, CLOS_MACRO, EP, FP, R0, SP};
use super::ffi;
use super::parser::Reader;
use super::regalloc::RegPool;
use super::symtab::SymId;
use super::vm::{Vm, VmError};
use super::Ctx;

/// Conditions that abort compilation of one top-level form
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    /// More values live at once than the register window holds
    RegistersExhausted,
    /// Statically known callee given the wrong number of arguments
    Arity(String),
    BadForm(String),
    NotCompilable(String),
    UnknownPrimitive(String),
    Assembly(AsmError),
    /// Error object raised while expanding at compile time
    Raised(Hndl),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::RegistersExhausted => write!(f, "register pool exhausted"),
            CompileError::Arity(s) => write!(f, "arity mismatch: {}", s),
            CompileError::BadForm(s) => write!(f, "malformed form: {}", s),
            CompileError::NotCompilable(s) => write!(f, "cannot compile: {}", s),
            CompileError::UnknownPrimitive(s) => write!(f, "no code generator for primitive {}", s),
            CompileError::Assembly(e) => write!(f, "assembly failed: {}", e),
            CompileError::Raised(h) => write!(f, "error raised during expansion {}", h),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<AsmError> for CompileError {
    fn from(e: AsmError) -> Self {
        CompileError::Assembly(e)
    }
}

/// Everything one dispatch step needs to know about its form
#[derive(Clone, Copy, Debug)]
pub struct CompileCtx {
    /// Block receiving the generated code
    pub block: BlockId,
    pub expr: Hndl,
    /// Compile-time scope; names bound here to `nil` are known to be
    /// shadowed by a local and are never resolved statically
    pub env: Hndl,
    /// Whether the value is used after this form; false for all but
    /// the last form of a body
    pub top: bool,
}

/// Where a compiled value ended up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Compiled {
    /// Block in which control continues
    pub block: BlockId,
    pub reg: u8,
    /// Register came from the pool and must be released by the
    /// consumer; otherwise it is `r0`, valid only until the next
    /// instruction that writes `r0`
    pub temp: bool,
}

impl Compiled {
    fn r0(block: BlockId) -> Self {
        Self {
            block,
            reg: R0,
            temp: false,
        }
    }
}

/// How a call head resolves at compile time
enum Callee {
    Special(Prim),
    Builtin(Prim),
    Macro(Hndl),
    Func(Hndl, Closure),
    /// Host callback or foreign prototype
    Native(Hndl),
    Dynamic,
}

/// Offset of spill slot `i` below the frame pointer
fn slot(i: usize) -> i32 {
    -8 * (i as i32 + 1)
}

pub struct Compiler<'c> {
    ctx: &'c mut Ctx,
    em: Emitter,
    pool: RegPool,
    /// Procedure entry blocks, keyed by closure cell
    procs: HashMap<Hndl, BlockId>,
    /// Spill slots needed by the procedure being compiled
    spill_max: usize,
    depth: usize,
}

impl<'c> Compiler<'c> {
    pub fn new(ctx: &'c mut Ctx) -> Self {
        let (start, end) = ctx.config().reg_window;
        Self {
            ctx,
            em: Emitter::new(),
            pool: RegPool::init(start, end),
            procs: HashMap::new(),
            spill_max: 0,
            depth: 0,
        }
    }

    fn retain(&mut self) -> Result<u8, CompileError> {
        self.pool.try_retain().ok_or(CompileError::RegistersExhausted)
    }

    fn release(&mut self, c: Compiled) {
        if c.temp {
            self.pool.release(c.reg);
        }
    }

    /// Moves a value out of `r0` into a register of its own
    fn own(&mut self, c: Compiled) -> Result<Compiled, CompileError> {
        if c.temp {
            return Ok(c);
        }
        let reg = self.retain()?;
        self.em.emit(c.block, Insn::Mov(reg, c.reg));
        Ok(Compiled {
            block: c.block,
            reg,
            temp: true,
        })
    }

    fn load_const(&mut self, cc: CompileCtx, val: Hndl) -> Compiled {
        if cc.top {
            let k = self.em.literal(val);
            self.em.emit(cc.block, Insn::Ldk(R0, k));
        }
        Compiled::r0(cc.block)
    }

    fn sub(&self, cc: CompileCtx, block: BlockId, expr: Hndl) -> CompileCtx {
        CompileCtx {
            block,
            expr,
            env: cc.env,
            top: true,
        }
    }

    /// Generates code for one expression
    pub fn compile(&mut self, cc: CompileCtx) -> Result<Compiled, CompileError> {
        if self.depth >= self.ctx.config().max_depth {
            return Err(CompileError::BadForm("expression nested too deeply".into()));
        }

        self.depth += 1;
        let out = self.compile_expr(cc);
        self.depth -= 1;
        out
    }

    fn compile_expr(&mut self, cc: CompileCtx) -> Result<Compiled, CompileError> {
        match self.ctx.obj(cc.expr) {
            Obj::Symbol(id) => {
                let id = *id;
                self.em.emit(cc.block, Insn::Get(R0, id));
                Ok(Compiled::r0(cc.block))
            }
            Obj::Pair(head, args) => {
                let (head, args) = (*head, *args);
                match self.resolve(head, cc.env)? {
                    Callee::Special(p) => self.compile_special(cc, p, args),
                    Callee::Builtin(p) => {
                        let argv = self.arg_list(args)?;
                        let (block, n) = self.push_args(cc, cc.block, &argv)?;
                        self.em.emit(block, Insn::Prim(R0, p.id(), n));
                        Ok(Compiled::r0(block))
                    }
                    Callee::Macro(mac) => {
                        let expansion = self.ctx.macroexpand(mac, args).map_err(CompileError::Raised)?;
                        self.compile(CompileCtx { expr: expansion, ..cc })
                    }
                    Callee::Func(f, c) => self.compile_apply(cc, head, f, c, args),
                    Callee::Native(f) => self.compile_native(cc, f, args),
                    Callee::Dynamic => {
                        let f = self.compile(self.sub(cc, cc.block, head))?;
                        let f = self.own(f)?;
                        let argv = self.arg_list(args)?;
                        let (block, n) = self.push_args(cc, f.block, &argv)?;
                        self.em.emit(block, Insn::Call(R0, f.reg, n));
                        self.release(f);
                        Ok(Compiled::r0(block))
                    }
                }
            }
            _ => Ok(self.load_const(cc, cc.expr)),
        }
    }

    fn resolve(&mut self, head: Hndl, env: Hndl) -> Result<Callee, CompileError> {
        let val = match self.ctx.obj(head) {
            Obj::Symbol(id) => match self.ctx.env_lookup_by_id(env, *id) {
                Some(v) => v,
                None => return Ok(Callee::Dynamic),
            },
            Obj::Pair(..) => return Ok(Callee::Dynamic),
            _ => head,
        };

        Ok(match self.ctx.obj(val) {
            Obj::Prim(p) if p.special_p() => Callee::Special(*p),
            Obj::Prim(p) => Callee::Builtin(*p),
            Obj::Macro(_) => Callee::Macro(val),
            Obj::Func(c) => Callee::Func(val, *c),
            Obj::CFunc(_) | Obj::Proto(_) => Callee::Native(val),
            other if val == head => {
                return Err(CompileError::NotCompilable(format!("cannot call {}", other.kind())))
            }
            _ => Callee::Dynamic,
        })
    }

    fn arg_list(&self, args: Hndl) -> Result<Vec<Hndl>, CompileError> {
        self.ctx
            .list_to_vec(args)
            .ok_or_else(|| CompileError::BadForm("improper argument list".into()))
    }

    /// Evaluates arguments left to right onto the data stack
    fn push_args(&mut self, cc: CompileCtx, mut block: BlockId, argv: &[Hndl]) -> Result<(BlockId, u8), CompileError> {
        let n = u8::try_from(argv.len()).map_err(|_| CompileError::BadForm(format!("{} arguments in one call", argv.len())))?;

        for a in argv {
            let c = self.compile(self.sub(cc, block, *a))?;
            self.em.emit(c.block, Insn::Push(SP, c.reg));
            self.release(c);
            block = c.block;
        }

        Ok((block, n))
    }

    fn compile_native(&mut self, cc: CompileCtx, f: Hndl, args: Hndl) -> Result<Compiled, CompileError> {
        let argv = self.arg_list(args)?;

        match self.ctx.obj(f) {
            Obj::CFunc(id) => {
                if let Some(cf) = self.ctx.cfunc(*id) {
                    if cf.argct.map_or(false, |n| n as usize != argv.len()) {
                        return Err(CompileError::Arity(format!(
                            "{}: expected {} arguments, got {}",
                            cf.name,
                            cf.argct.unwrap_or(0),
                            argv.len()
                        )));
                    }
                }
            }
            Obj::Proto(id) => {
                if let Some(proto) = self.ctx.proto(*id) {
                    let (min, max) = ffi::arity(&*proto);
                    if argv.len() < min || max.map_or(false, |m| argv.len() > m) {
                        return Err(CompileError::Arity(format!(
                            "{}: {} arguments out of range",
                            proto.name(),
                            argv.len()
                        )));
                    }
                }
            }
            _ => (),
        }

        let (block, n) = self.push_args(cc, cc.block, &argv)?;
        let k = self.em.literal(f);
        self.em.emit(block, Insn::Ldk(R0, k));
        self.em.emit(block, Insn::Call(R0, R0, n));
        Ok(Compiled::r0(block))
    }

    /// Splits a parameter list into its fixed names and rest name
    fn param_ids(&self, mut params: Hndl) -> Result<(Vec<SymId>, Option<SymId>), CompileError> {
        let mut fixed = vec![];
        loop {
            match self.ctx.obj(params) {
                Obj::Nil => return Ok((fixed, None)),
                Obj::Symbol(id) => return Ok((fixed, Some(*id))),
                Obj::Pair(s, rest) => match self.ctx.sym_id(*s) {
                    Some(id) => {
                        fixed.push(id);
                        params = *rest;
                    }
                    None => break,
                },
                _ => break,
            }
        }
        Err(CompileError::BadForm("malformed parameter list".into()))
    }

    /// Calls a closure known at compile time through its procedure
    fn compile_apply(&mut self, cc: CompileCtx, head: Hndl, f: Hndl, c: Closure, args: Hndl) -> Result<Compiled, CompileError> {
        let argv = self.arg_list(args)?;
        let (fixed, rest) = self.param_ids(c.params)?;

        if argv.len() < fixed.len() || (rest.is_none() && argv.len() > fixed.len()) {
            let name = match self.ctx.sym_id(head) {
                Some(id) => self.ctx.sym_name(id).to_string(),
                None => "procedure".to_string(),
            };
            return Err(CompileError::Arity(format!(
                "{}: expected {}{} arguments, got {}",
                name,
                fixed.len(),
                if rest.is_some() { " or more" } else { "" },
                argv.len()
            )));
        }

        let proc = self.procedure(f, c)?;

        let (mut block, _) = self.push_args(cc, cc.block, &argv[..fixed.len()])?;
        if rest.is_some() {
            let (b, n) = self.push_args(cc, block, &argv[fixed.len()..])?;
            self.em.emit(b, Insn::Prim(R0, Prim::List.id(), n));
            self.em.emit(b, Insn::Push(SP, R0));
            block = b;
        }

        // caller saves every held register across the call
        let live: Vec<u8> = self.pool.live().collect();
        for (i, r) in live.iter().enumerate() {
            self.em.emit(block, Insn::St(*r, FP, slot(i)));
        }
        self.spill_max = self.spill_max.max(live.len());

        self.em.emit(block, Insn::Bl(Target::Block(proc)));

        for (i, r) in live.iter().enumerate() {
            self.em.emit(block, Insn::Ld(*r, FP, slot(i)));
        }

        Ok(Compiled::r0(block))
    }

    /// Entry block of the procedure for a closure, compiling it on
    /// first use
    fn procedure(&mut self, f: Hndl, c: Closure) -> Result<BlockId, CompileError> {
        if let Some(b) = self.procs.get(&f) {
            return Ok(*b);
        }

        let entry = self.em.make_basic_block(BlockKind::Proc);
        self.procs.insert(f, entry);

        let saved = (self.pool, self.spill_max);
        self.pool.reset();
        self.spill_max = 0;

        let out = self.procedure_body(entry, c);

        self.pool = saved.0;
        self.spill_max = saved.1;
        out.map(|_| entry)
    }

    fn procedure_body(&mut self, entry: BlockId, c: Closure) -> Result<(), CompileError> {
        let (fixed, rest) = self.param_ids(c.params)?;

        let k = self.em.literal(c.env);
        let t = self.retain()?;
        self.em.emit(entry, Insn::Ldk(t, k));
        self.em.emit(entry, Insn::Frame(t));
        self.pool.release(t);

        // arguments were pushed in order, so they pop last first
        if let Some(id) = rest {
            self.em.emit(entry, Insn::Bind(id));
        }
        for id in fixed.iter().rev() {
            self.em.emit(entry, Insn::Bind(*id));
        }

        let enter = self.em.emit(entry, Insn::Enter(0));

        let scope = self.ctx.make_environment(Some(c.env));
        for id in fixed.iter().chain(rest.iter()) {
            self.ctx.env_define_id(scope, *id, NIL);
        }

        let out = self.compile_body(entry, scope, c.body, true)?;
        self.epilogue(entry, enter, out, Insn::Ret)
    }

    /// Moves the result to `r0`, tears down the frame and finishes
    /// with `last`; patches the matching `enter` with the final spill
    /// count
    fn epilogue(&mut self, entry: BlockId, enter: usize, out: Compiled, last: Insn) -> Result<(), CompileError> {
        if out.reg != R0 {
            self.em.emit(out.block, Insn::Mov(R0, out.reg));
        }
        self.release(out);

        let n = u16::try_from(self.spill_max).map_err(|_| CompileError::RegistersExhausted)?;
        self.em.set_insn(entry, enter, Insn::Enter(n));
        self.em.emit(out.block, Insn::Leave(n));
        self.em.emit(out.block, Insn::Unframe);
        self.em.emit(out.block, last);
        Ok(())
    }

    /// Compiles a list of forms in sequence, keeping only the last
    /// value
    fn compile_body(&mut self, mut block: BlockId, env: Hndl, body: Hndl, top: bool) -> Result<Compiled, CompileError> {
        let forms = self.arg_list(body)?;
        let Some((last, init)) = forms.split_last() else {
            return Ok(self.load_const(
                CompileCtx {
                    block,
                    expr: NIL,
                    env,
                    top,
                },
                NIL,
            ));
        };

        for e in init {
            let c = self.compile(CompileCtx {
                block,
                expr: *e,
                env,
                top: false,
            })?;
            self.release(c);
            block = c.block;
        }

        self.compile(CompileCtx {
            block,
            expr: *last,
            env,
            top,
        })
    }

    fn form_args(&self, p: Prim, args: Hndl, min: usize, max: Option<usize>) -> Result<Vec<Hndl>, CompileError> {
        let Some(argv) = self.ctx.list_to_vec(args) else {
            return Err(CompileError::BadForm(format!("{}: improper form", p.name())));
        };

        if argv.len() < min || max.map_or(false, |m| argv.len() > m) {
            return Err(CompileError::BadForm(format!(
                "{}: wrong number of forms ({})",
                p.name(),
                argv.len()
            )));
        }

        Ok(argv)
    }

    fn symbol_of(&self, p: Prim, h: Hndl) -> Result<SymId, CompileError> {
        self.ctx
            .sym_id(h)
            .ok_or_else(|| CompileError::BadForm(format!("{}: cannot bind non-symbol {}", p.name(), self.ctx.kind(h))))
    }

    fn compile_closure(&mut self, block: BlockId, p: Prim, params: Hndl, body: Hndl) -> Result<Compiled, CompileError> {
        self.param_ids(params)?;

        let kind = match p {
            Prim::Mac | Prim::Macro => CLOS_MACRO,
            _ => CLOS_FUNC,
        };
        let params = self.em.literal(params);
        let body = self.em.literal(body);
        self.em.emit(block, Insn::Clos(R0, params, body, kind));
        Ok(Compiled::r0(block))
    }

    fn compile_special(&mut self, cc: CompileCtx, p: Prim, args: Hndl) -> Result<Compiled, CompileError> {
        match p {
            Prim::Quote => {
                let argv = self.form_args(p, args, 1, Some(1))?;
                Ok(self.load_const(cc, argv[0]))
            }
            Prim::Quasi => {
                let argv = self.form_args(p, args, 1, Some(1))?;
                let expr = self.ctx.quasi_expand(argv[0], 1).map_err(CompileError::Raised)?;
                self.compile(CompileCtx { expr, ..cc })
            }
            Prim::Unquote | Prim::Splice => Err(CompileError::BadForm(format!("{} outside quasiquote", p.name()))),
            Prim::If => self.compile_if(cc, args),
            Prim::Do | Prim::Begin => self.compile_body(cc.block, cc.env, args, cc.top),
            Prim::Let | Prim::Define | Prim::Def => {
                let argv = self.form_args(p, args, 1, None)?;
                match self.ctx.pair(argv[0]) {
                    // (define (name . params) body...)
                    Some((name, params)) => {
                        let id = self.symbol_of(p, name)?;
                        let body = self.ctx.cdr(args);
                        let c = self.compile_closure(cc.block, Prim::Fn, params, body)?;
                        self.em.emit(c.block, Insn::Def(c.reg, id));
                        self.ctx.env_define_id(cc.env, id, NIL);
                        Ok(c)
                    }
                    None => {
                        if argv.len() > 2 {
                            return Err(CompileError::BadForm(format!(
                                "{}: wrong number of forms ({})",
                                p.name(),
                                argv.len()
                            )));
                        }
                        let id = self.symbol_of(p, argv[0])?;
                        let val = argv.get(1).copied().unwrap_or(NIL);
                        let c = self.compile(self.sub(cc, cc.block, val))?;
                        self.em.emit(c.block, Insn::Def(c.reg, id));
                        self.ctx.env_define_id(cc.env, id, NIL);
                        Ok(c)
                    }
                }
            }
            Prim::Set => {
                let argv = self.form_args(p, args, 2, Some(2))?;
                let id = self.symbol_of(p, argv[0])?;
                let c = self.compile(self.sub(cc, cc.block, argv[1]))?;
                self.em.emit(c.block, Insn::Set(c.reg, id));
                Ok(c)
            }
            Prim::Fn | Prim::Lambda | Prim::Mac | Prim::Macro => {
                let argv = self.form_args(p, args, 1, None)?;
                let body = self.ctx.cdr(args);
                self.compile_closure(cc.block, p, argv[0], body)
            }
            Prim::While => self.compile_while(cc, args),
            Prim::And => self.compile_and(cc, args),
            Prim::Or => self.compile_or(cc, args),
            _ => Err(CompileError::UnknownPrimitive(p.name().to_string())),
        }
    }

    /// Chained `(if c1 e1 c2 e2 ... else)`; every arm moves its value
    /// into one destination register
    fn compile_if(&mut self, cc: CompileCtx, args: Hndl) -> Result<Compiled, CompileError> {
        let forms = self.form_args(Prim::If, args, 0, None)?;
        let dest = self.retain()?;
        let join = self.em.make_basic_block(BlockKind::Join);

        let mut block = cc.block;
        let mut arms = forms.chunks_exact(2);
        for arm in &mut arms {
            let c = self.compile(self.sub(cc, block, arm[0]))?;
            self.em.emit(c.block, Insn::Test(c.reg));
            self.release(c);

            let then = self.em.make_basic_block(BlockKind::Branch);
            let other = self.em.make_basic_block(BlockKind::Branch);
            self.em.emit(c.block, Insn::Bz(Target::Block(other)));
            self.em.set_next(c.block, then);

            let t = self.compile(self.sub(cc, then, arm[1]))?;
            self.em.emit(t.block, Insn::Mov(dest, t.reg));
            self.release(t);
            self.em.emit(t.block, Insn::Jmp(Target::Block(join)));

            block = other;
        }

        let e = match arms.remainder() {
            [fallback] => self.compile(self.sub(cc, block, *fallback))?,
            _ => self.load_const(self.sub(cc, block, NIL), NIL),
        };
        self.em.emit(e.block, Insn::Mov(dest, e.reg));
        self.release(e);
        self.em.set_next(e.block, join);

        Ok(Compiled {
            block: join,
            reg: dest,
            temp: true,
        })
    }

    fn compile_while(&mut self, cc: CompileCtx, args: Hndl) -> Result<Compiled, CompileError> {
        let argv = self.form_args(Prim::While, args, 1, None)?;
        let body = self.ctx.cdr(args);

        let head = self.em.make_basic_block(BlockKind::Loop);
        let inner = self.em.make_basic_block(BlockKind::Body);
        let exit = self.em.make_basic_block(BlockKind::Join);
        let done = self.em.new_label();
        self.em.bind_label(done, exit);
        self.em.set_next(cc.block, head);

        let c = self.compile(self.sub(cc, head, argv[0]))?;
        self.em.emit(c.block, Insn::Test(c.reg));
        self.release(c);
        self.em.emit(c.block, Insn::Bz(Target::Label(done)));
        self.em.set_next(c.block, inner);

        let out = self.compile_body(inner, cc.env, body, false)?;
        self.release(out);
        self.em.emit(out.block, Insn::Jmp(Target::Block(head)));

        Ok(self.load_const(CompileCtx { block: exit, ..cc }, NIL))
    }

    fn compile_and(&mut self, cc: CompileCtx, args: Hndl) -> Result<Compiled, CompileError> {
        let forms = self.form_args(Prim::And, args, 0, None)?;
        let dest = self.retain()?;

        if forms.is_empty() {
            let k = self.em.literal(TRUE);
            self.em.emit(cc.block, Insn::Ldk(dest, k));
            return Ok(Compiled {
                block: cc.block,
                reg: dest,
                temp: true,
            });
        }

        let join = self.em.make_basic_block(BlockKind::Join);
        let mut block = cc.block;
        for (i, e) in forms.iter().enumerate() {
            let c = self.compile(self.sub(cc, block, *e))?;
            self.em.emit(c.block, Insn::Mov(dest, c.reg));
            self.release(c);

            if i + 1 == forms.len() {
                self.em.set_next(c.block, join);
            } else {
                self.em.emit(c.block, Insn::Test(dest));
                self.em.emit(c.block, Insn::Bz(Target::Block(join)));
                block = self.em.make_basic_block(BlockKind::Body);
                self.em.set_next(c.block, block);
            }
        }

        Ok(Compiled {
            block: join,
            reg: dest,
            temp: true,
        })
    }

    fn compile_or(&mut self, cc: CompileCtx, args: Hndl) -> Result<Compiled, CompileError> {
        let forms = self.form_args(Prim::Or, args, 0, None)?;
        let dest = self.retain()?;
        let join = self.em.make_basic_block(BlockKind::Join);

        let mut block = cc.block;
        for e in forms {
            let c = self.compile(self.sub(cc, block, e))?;
            self.em.emit(c.block, Insn::Mov(dest, c.reg));
            self.release(c);
            self.em.emit(c.block, Insn::Test(dest));
            self.em.emit(c.block, Insn::Bnz(Target::Block(join)));
            block = self.em.make_basic_block(BlockKind::Body);
            self.em.set_next(c.block, block);
        }

        let k = self.em.literal(NIL);
        self.em.emit(block, Insn::Ldk(dest, k));
        self.em.set_next(block, join);

        Ok(Compiled {
            block: join,
            reg: dest,
            temp: true,
        })
    }
}

/// Compiles one top-level expression into a program that runs it
/// against `env` (the global environment by default) and exits with
/// its value
pub fn compile_program(ctx: &mut Ctx, expr: Hndl, env: Option<Hndl>) -> Result<Program, CompileError> {
    let env = env.unwrap_or_else(|| ctx.global());
    let mut c = Compiler::new(ctx);

    let entry = c.em.make_basic_block(BlockKind::Entry);
    let k = c.em.literal(env);
    let t = c.retain()?;
    c.em.emit(entry, Insn::Ldk(t, k));
    c.em.emit(entry, Insn::Push(EP, t));
    c.pool.release(t);
    let enter = c.em.emit(entry, Insn::Enter(0));

    let scope = c.ctx.make_environment(Some(env));
    let out = c.compile(CompileCtx {
        block: entry,
        expr,
        env: scope,
        top: true,
    })?;
    c.epilogue(entry, enter, out, Insn::Exit(R0))?;

    if cfg!(feature = "stkdbg") {
        log::trace!("compiled {} blocks, {} procedures", c.em.block_count(), c.procs.len());
    }

    Ok(c.em.assemble(entry)?)
}

fn describe(ctx: &Ctx, h: Hndl) -> String {
    ctx.error_message(h).unwrap_or("?").to_string()
}

/// Compiles and runs each top-level form of `src` in turn, returning
/// the last value
///
/// Forms run before the next one is compiled, so definitions made by
/// one form are visible to the compiler for the next. `on_program`
/// sees every program before it runs.
pub fn run_source(ctx: &mut Ctx, src: &[u8], mut on_program: impl FnMut(&Ctx, &Program)) -> Result<Hndl, String> {
    let mut vm = Vm::with_standard_layout(ctx.config()).map_err(|e| e.to_string())?;
    let mut reader = Reader::new(src);
    let base = ctx.save_gc();
    let mut last = NIL;

    let out = loop {
        ctx.restore_gc(base);
        ctx.push_gc(last);

        let expr = match reader.read(ctx) {
            Ok(Some(expr)) => expr,
            Ok(None) => break Ok(last),
            Err(e) => break Err(e.to_string()),
        };
        ctx.push_gc(expr);

        let prog = match compile_program(ctx, expr, None) {
            Ok(prog) => prog,
            Err(CompileError::Raised(h)) => break Err(describe(ctx, h)),
            Err(e) => break Err(e.to_string()),
        };
        on_program(ctx, &prog);

        vm.reset();
        last = match vm.run(ctx, &prog) {
            Ok((val, _)) => val,
            Err(VmError::Raised(h)) => break Err(describe(ctx, h)),
            Err(e) => break Err(e.to_string()),
        };

        ctx.restore_gc(base);
        ctx.push_gc(last);
        ctx.safe_point();
    };

    ctx.restore_gc(base);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::emit::disassemble;
    use crate::script::vm::Status;
    use crate::script::{interpret, Config};

    fn compiled(code: &str) -> Result<String, String> {
        let mut ctx = Ctx::default();
        let val = run_source(&mut ctx, code.as_bytes(), |_, _| ())?;
        Ok(ctx.display(val).to_string())
    }

    /// Compiled and interpreted runs must agree
    fn agree(code: &str) -> String {
        let vm = compiled(code);
        assert_eq!(vm, interpret(code), "diverged on {}", code);
        vm.unwrap_or_else(|e| format!("error: {}", e))
    }

    fn program(ctx: &mut Ctx, code: &str) -> Result<Program, CompileError> {
        let expr = Reader::new(code.as_bytes()).read(ctx).unwrap().unwrap();
        compile_program(ctx, expr, None)
    }

    #[test]
    fn constants_and_arithmetic() {
        assert_eq!(agree("42"), "42");
        assert_eq!(agree("\"text\""), "\"text\"");
        assert_eq!(agree("(+ 1 2 3)"), "6");
        assert_eq!(agree("(- (* 4 5) (/ 9 3))"), "17");
        assert_eq!(agree("(do (let result 50) result)"), "50");
        assert_eq!(agree("'(a b)"), "(a b)");
        assert_eq!(agree("(do 1 2 3)"), "3");
        assert_eq!(agree("(do)"), "nil");
    }

    #[test]
    fn conditionals() {
        assert_eq!(agree("(if nil 1 2)"), "2");
        assert_eq!(agree("(if #f 1 #f 2 3)"), "3");
        assert_eq!(agree("(if #f 1 #t 2 3)"), "2");
        assert_eq!(agree("(if #f 1)"), "nil");
        assert_eq!(agree("(if)"), "nil");
        assert_eq!(agree("(and 1 2 3)"), "3");
        assert_eq!(agree("(and 1 nil 3)"), "nil");
        assert_eq!(agree("(and)"), "#t");
        assert_eq!(agree("(or nil #f)"), "nil");
        assert_eq!(agree("(or nil 4 5)"), "4");
    }

    #[test]
    fn loops() {
        assert_eq!(
            agree("(let i 0) (let s 0) (while (< i 5) (set! s (+ s i)) (set! i (+ i 1))) s"),
            "10"
        );
        assert_eq!(agree("(while #f 1)"), "nil");
    }

    #[test]
    fn procedures() {
        assert_eq!(
            agree("(define (fib n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2))))) (fib 15)"),
            "610"
        );
        assert_eq!(agree("(define (f a . r) r) (f 1 2 3)"), "(2 3)");
        assert_eq!(agree("(define (g . xs) xs) (g)"), "nil");
        assert_eq!(agree("(define (h) (let y 3) (* y y)) (h)"), "9");
    }

    #[test]
    fn closures() {
        assert_eq!(agree("(define (adder n) (fn (x) (+ x n))) ((adder 3) 4)"), "7");
        assert_eq!(agree("((fn (x y) (cons y x)) 1 2)"), "(2 . 1)");

        // a parameter shadows the global procedure of the same name
        assert_eq!(
            agree("(define (f x) (* x 2)) (define (g f) (f 10)) (g (fn (y) (+ y 1)))"),
            "11"
        );

        // a closure built in a procedure frame keeps that frame alive
        assert_eq!(
            agree("(define (counter) (let n 0) (fn () (set! n (+ n 1)) n)) (let c (counter)) (c) (c) (c)"),
            "3"
        );
    }

    #[test]
    fn macros_and_quasiquote() {
        assert_eq!(
            agree("(let unless (mac (c . body) (list 'if c nil (cons 'do body)))) (unless #f 1 2)"),
            "2"
        );
        assert_eq!(agree("(let x 5) `(a ,x ,@(list 1 2))"), "(a 5 1 2)");
        assert_eq!(agree("(let list 0) `(,list)"), "(0)");
    }

    #[test]
    fn natives() {
        assert_eq!(agree("(length '(1 2 3))"), "3");
        assert_eq!(agree("(apply + 1 '(2 3))"), "6");
        assert_eq!(agree("(string-append \"a\" \"b\")"), "\"ab\"");
    }

    #[test]
    fn runtime_errors() {
        assert_eq!(agree("(undefined-thing 1)"), "error: unbound symbol: undefined-thing");
        assert_eq!(agree("(set! nope 1)"), "error: set! of unbound symbol: nope");
        agree("(car 1 2)");
        agree("(+ 1 \"a\")");
    }

    #[test]
    fn static_errors() {
        let mut ctx = Ctx::default();
        assert!(matches!(program(&mut ctx, "(5 1)"), Err(CompileError::NotCompilable(_))));
        assert!(matches!(program(&mut ctx, "(let 5 1)"), Err(CompileError::BadForm(_))));
        assert!(matches!(program(&mut ctx, "(fn (1) 1)"), Err(CompileError::BadForm(_))));
        assert!(matches!(program(&mut ctx, ",x"), Err(CompileError::BadForm(_))));
        assert!(matches!(program(&mut ctx, "(length 1 2)"), Err(CompileError::Arity(_))));

        let err = compiled("(define (f a) a) (f 1 2)").unwrap_err();
        assert_eq!(err, "arity mismatch: f: expected 1 arguments, got 2");
    }

    #[test]
    fn register_exhaustion() {
        let mut ctx = Ctx::new(Config {
            reg_window: (1, 3),
            ..Config::default()
        });

        assert!(program(&mut ctx, "(if (if a b c) d e)").is_ok());
        assert_eq!(
            program(&mut ctx, "(if (if (if a b c) d e) f g)").unwrap_err(),
            CompileError::RegistersExhausted
        );

        // the failed compile leaves nothing behind for the next one
        assert!(program(&mut ctx, "(if (if a b c) d e)").is_ok());
    }

    #[test]
    fn step_budget_matches_full_run() {
        let mut ctx = Ctx::default();
        let prog = program(&mut ctx, "(+ 20 22)").unwrap();

        let mut whole = Vm::with_standard_layout(ctx.config()).unwrap();
        whole.load(&prog).unwrap();
        let full = whole.step(&mut ctx, -1).unwrap();

        let mut stepped = Vm::with_standard_layout(ctx.config()).unwrap();
        stepped.load(&prog).unwrap();
        let last = loop {
            match stepped.step(&mut ctx, 1).unwrap() {
                Status::Yield => continue,
                st => break st,
            }
        };

        assert_eq!(last, full);
        assert_eq!(last, Status::Exit(true));
        assert_eq!(stepped.cycles(), whole.cycles());
        assert_eq!(ctx.fixnum_get(stepped.result()), Some(42));
    }

    #[test]
    fn listing() {
        let mut ctx = Ctx::default();
        let prog = program(&mut ctx, "(+ 1 2)").unwrap();
        let text = disassemble(&prog.code, Some(&ctx));

        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("0000: ldk"));
        assert!(lines[1].contains("push ep"));
        assert!(text.contains("prim"));
        assert!(lines.last().unwrap().contains("exit r0"));

        let mut seen = 0;
        run_source(&mut ctx, b"(define x 1) x", |_, _| seen += 1).unwrap();
        assert_eq!(seen, 2);
    }
}
