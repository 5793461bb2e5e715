// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/mod.rs

// The embedded scripting runtime: a small Lisp used for configuration
// and build scripting. Defines the interpreter context, which owns
// the object heap, symbol table, global environment and call list,
// along with the printer and the top-level evaluation entry points.

// <>

use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::rc::Rc;

pub mod compile;
pub mod core;
pub mod emit;
pub mod env;
pub mod eval;
pub mod ffi;
pub mod memmgt;
pub mod parser;
pub mod regalloc;
pub mod sched;
pub mod stdenv;
pub mod symtab;
pub mod vm;

pub use self::core::{Closure, Hndl, Kind, Obj, Prim, FALSE, NIL, TRUE};
pub use memmgt::GcGuard;
pub use symtab::SymId;

use self::core::{ErrObj, Frame};
use memmgt::Heap;
use symtab::SymbolTable;

/// Result of evaluation at the Rust boundary: `Err` always holds an
/// error object
pub type EvalResult = Result<Hndl, Hndl>;

/// Native callback signature; receives evaluated arguments
pub type NativeFn = fn(&mut Ctx, &[Hndl]) -> EvalResult;

/// Tunables for a context and the VMs that run against it
#[derive(Clone, Debug)]
pub struct Config {
    /// Cells reserved when the heap is created
    pub heap_cells: usize,
    /// Live cell count above which safe points collect
    pub gc_threshold: usize,
    /// Maximum nesting of evaluator calls
    pub max_depth: usize,
    /// Largest size, in bytes, any VM memory area may grow to
    pub area_hard_cap: usize,
    /// Initial capacity in bytes of the VM code area
    pub code_area: usize,
    /// Initial capacity in bytes of the VM heap area
    pub heap_area: usize,
    /// Initial capacity in bytes of each VM stack area
    pub stack_area: usize,
    /// Register window `[start, end)` handed to the compiler's pool
    pub reg_window: (u8, u8),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heap_cells: 4096,
            gc_threshold: 1 << 16,
            max_depth: 256,
            area_hard_cap: 64 << 20,
            code_area: 4096,
            heap_area: 4096,
            stack_area: 4096,
            reg_window: (1, 26),
        }
    }
}

/// Extension hooks consulted by the collector and error path
#[derive(Default)]
pub struct Handlers {
    /// Reports the handles kept alive by an opaque pointer payload
    pub mark: Option<Box<dyn Fn(usize) -> Vec<Hndl>>>,
    /// Finalises the payload of a swept pointer cell
    pub gc: Option<Box<dyn FnMut(usize)>>,
    /// Observes every error object as it is raised
    pub error: Option<Box<dyn FnMut(&str, Hndl)>>,
    /// Supplies extra roots for every collection
    pub roots: Option<Box<dyn Fn() -> Vec<Hndl>>>,
}

/// A host callback reachable from script code
#[derive(Clone)]
pub struct CFunc {
    pub name: Box<str>,
    /// Required argument count; `None` accepts any number
    pub argct: Option<u16>,
    pub body: Rc<dyn Fn(&mut Ctx, &[Hndl]) -> EvalResult>,
}

/// Status half of a top-level evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalStatus {
    Ok,
    Error,
}

/// Interpreter context: one heap, one protection stack, one global
/// environment and one call list
///
/// Not safe to share across threads without external locking.
pub struct Ctx {
    pub(crate) heap: Heap,
    pub(crate) symtab: SymbolTable,
    global: Hndl,
    /// Active call expressions, outermost first
    calls: Vec<Hndl>,
    cfuncs: Vec<CFunc>,
    protos: Vec<Rc<dyn ffi::Proto>>,
    handlers: Handlers,
    config: Config,
    pub(crate) depth: usize,
    gensym_ctr: u64,
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Ctx {
    /// Creates a context with primitives and the standard environment
    /// loaded into the global frame
    pub fn new(config: Config) -> Self {
        log::debug!("Creating script context");

        let mut heap = Heap::new(config.heap_cells);
        let global = heap.alloc(Obj::Env(Frame::default()));

        let mut ctx = Self {
            heap,
            symtab: SymbolTable::new(256),
            global,
            calls: Vec::with_capacity(64),
            cfuncs: Vec::new(),
            protos: Vec::new(),
            handlers: Handlers::default(),
            config,
            depth: 0,
            gensym_ctr: 0,
        };

        for p in Prim::ALL {
            let cell = ctx.alloc(Obj::Prim(*p));
            ctx.define_global(p.name(), cell);
        }

        stdenv::install(&mut ctx);

        ctx
    }

    /// Tears the context down, finalising every remaining pointer cell
    pub fn free(mut self) {
        self.heap.restore(0);
        self.calls.clear();
        let mut fin = self.handlers.gc.take();
        self.heap.collect(&[], None, &mut |p| {
            if let Some(f) = fin.as_mut() {
                f(p)
            }
        });
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handlers_mut(&mut self) -> &mut Handlers {
        &mut self.handlers
    }

    /// The outermost environment frame
    pub fn global(&self) -> Hndl {
        self.global
    }

    // allocation and access

    pub fn alloc(&mut self, obj: Obj) -> Hndl {
        self.heap.alloc(obj)
    }

    #[inline(always)]
    pub fn obj(&self, h: Hndl) -> &Obj {
        self.heap.get(h)
    }

    #[inline(always)]
    pub fn obj_mut(&mut self, h: Hndl) -> &mut Obj {
        self.heap.get_mut(h)
    }

    pub fn kind(&self, h: Hndl) -> Kind {
        self.heap.get(h).kind()
    }

    pub fn heap_live(&self) -> usize {
        self.heap.live()
    }

    pub fn fixnum(&mut self, n: i64) -> Hndl {
        self.alloc(Obj::Fixnum(n))
    }

    pub fn flonum(&mut self, n: f64) -> Hndl {
        self.alloc(Obj::Flonum(n))
    }

    pub fn string(&mut self, s: &str) -> Hndl {
        self.alloc(Obj::String(s.into()))
    }

    pub fn boolean(&self, b: bool) -> Hndl {
        if b {
            TRUE
        } else {
            FALSE
        }
    }

    pub fn symbol(&mut self, name: &str) -> Hndl {
        let id = self.symtab.get_id(name);
        self.alloc(Obj::Symbol(id))
    }

    pub fn keyword(&mut self, name: &str) -> Hndl {
        let id = self.symtab.get_id(name);
        self.alloc(Obj::Keyword(id))
    }

    pub fn ptr(&mut self, payload: usize) -> Hndl {
        self.alloc(Obj::Ptr(payload))
    }

    pub fn cons(&mut self, car: Hndl, cdr: Hndl) -> Hndl {
        self.alloc(Obj::Pair(car, cdr))
    }

    /// Builds a proper list from a slice of handles
    pub fn list(&mut self, items: &[Hndl]) -> Hndl {
        items.iter().rev().fold(NIL, |acc, h| self.cons(*h, acc))
    }

    pub fn intern(&mut self, name: &str) -> SymId {
        self.symtab.get_id(name)
    }

    pub fn sym_name(&self, id: SymId) -> &str {
        self.symtab.lookup_by_id(id).unwrap_or("?")
    }

    // predicates and accessors

    #[inline(always)]
    pub fn nil_p(&self, h: Hndl) -> bool {
        matches!(self.obj(h), Obj::Nil)
    }

    /// Everything except nil and false counts as true
    #[inline(always)]
    pub fn truthy(&self, h: Hndl) -> bool {
        !matches!(self.obj(h), Obj::Nil | Obj::Bool(false))
    }

    pub fn error_p(&self, h: Hndl) -> bool {
        matches!(self.obj(h), Obj::Error(_))
    }

    pub fn pair(&self, h: Hndl) -> Option<(Hndl, Hndl)> {
        match self.obj(h) {
            Obj::Pair(a, d) => Some((*a, *d)),
            _ => None,
        }
    }

    /// First element of a pair; nil for anything else
    pub fn car(&self, h: Hndl) -> Hndl {
        self.pair(h).map_or(NIL, |p| p.0)
    }

    /// Rest of a pair; nil for anything else
    pub fn cdr(&self, h: Hndl) -> Hndl {
        self.pair(h).map_or(NIL, |p| p.1)
    }

    pub fn sym_id(&self, h: Hndl) -> Option<SymId> {
        match self.obj(h) {
            Obj::Symbol(id) => Some(*id),
            _ => None,
        }
    }

    pub fn fixnum_get(&self, h: Hndl) -> Option<i64> {
        match self.obj(h) {
            Obj::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn string_get(&self, h: Hndl) -> Option<&str> {
        match self.obj(h) {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }

    /// Collects a proper list into a vector; `None` for improper or
    /// circular lists
    pub fn list_to_vec(&self, mut h: Hndl) -> Option<Vec<Hndl>> {
        let mut out = vec![];
        let mut slow = h;
        loop {
            match self.obj(h) {
                Obj::Nil => return Some(out),
                Obj::Pair(a, d) => {
                    out.push(*a);
                    h = *d;
                }
                _ => return None,
            }

            if out.len() % 2 == 0 {
                slow = self.cdr(slow);
                if slow == h {
                    return None;
                }
            }
        }
    }

    /// Fresh uninterned-looking symbol for macro hygiene by hand
    pub fn gensym(&mut self) -> Hndl {
        self.gensym_ctr += 1;
        let name = format!(" g{}", self.gensym_ctr);
        self.symbol(&name)
    }

    // garbage collection

    /// Current height of the protection stack
    pub fn save_gc(&self) -> usize {
        self.heap.save()
    }

    /// Drops protection for everything pushed since `idx`
    pub fn restore_gc(&mut self, idx: usize) {
        self.heap.restore(idx)
    }

    pub fn push_gc(&mut self, h: Hndl) {
        self.heap.push(h)
    }

    pub fn pop_gc(&mut self) -> Option<Hndl> {
        self.heap.pop()
    }

    /// Opens a protection checkpoint that rewinds when dropped
    pub fn gc_scope(&mut self) -> GcGuard<'_> {
        GcGuard::new(self)
    }

    /// Full collection from the context roots; returns cells reclaimed
    pub fn collect_garbage(&mut self) -> usize {
        self.collect_garbage_with(&[])
    }

    /// Full collection with additional caller-supplied roots
    pub fn collect_garbage_with(&mut self, extra: &[Hndl]) -> usize {
        let mut roots = Vec::with_capacity(1 + self.calls.len() + extra.len());
        roots.push(self.global);
        roots.extend_from_slice(&self.calls);
        roots.extend_from_slice(extra);
        if let Some(f) = self.handlers.roots.as_ref() {
            roots.extend(f());
        }

        let before = self.heap.live();

        let ext = self.handlers.mark.as_deref();
        let fin = &mut self.handlers.gc;
        let freed = self.heap.collect(&roots, ext, &mut |p| {
            if let Some(f) = fin.as_mut() {
                f(p)
            }
        });

        log::debug!(
            "gc cycle {}: {} live before, {} freed",
            self.heap.cycles(),
            before,
            freed
        );

        freed
    }

    /// Collects if the live cell count has passed the threshold
    pub(crate) fn safe_point(&mut self) {
        if self.heap.live() > self.config.gc_threshold {
            self.collect_garbage();
        }
    }

    // call list

    pub(crate) fn call_push(&mut self, expr: Hndl) {
        self.calls.push(expr);
    }

    pub(crate) fn call_pop(&mut self) {
        self.calls.pop();
    }

    /// Active call expressions, outermost first
    pub fn calls(&self) -> &[Hndl] {
        &self.calls
    }

    // errors

    /// Raises an error object carrying the current call list
    pub fn error(&mut self, msg: &str) -> Hndl {
        let mut backtrace = NIL;
        for i in 0..self.calls.len() {
            let c = self.calls[i];
            backtrace = self.cons(c, backtrace);
        }

        let err = self.alloc(Obj::Error(ErrObj {
            message: msg.into(),
            backtrace,
        }));

        if cfg!(feature = "stkdbg") {
            log::debug!("raised error: {}", msg);
        }

        if let Some(f) = self.handlers.error.as_mut() {
            f(msg, err);
        }

        err
    }

    pub fn error_message(&self, h: Hndl) -> Option<&str> {
        match self.obj(h) {
            Obj::Error(e) => Some(&e.message),
            _ => None,
        }
    }

    pub fn error_backtrace(&self, h: Hndl) -> Option<Hndl> {
        match self.obj(h) {
            Obj::Error(e) => Some(e.backtrace),
            _ => None,
        }
    }

    // natives and foreign prototypes

    /// Binds a host callback under `name` in the global environment
    pub fn define_cfunc(
        &mut self,
        name: &str,
        argct: Option<u16>,
        body: Rc<dyn Fn(&mut Ctx, &[Hndl]) -> EvalResult>,
    ) -> Hndl {
        let id = self.cfuncs.len() as u32;
        self.cfuncs.push(CFunc {
            name: name.into(),
            argct,
            body,
        });

        let cell = self.alloc(Obj::CFunc(id));
        self.define_global(name, cell);
        cell
    }

    pub fn define_native(&mut self, name: &str, argct: Option<u16>, f: NativeFn) -> Hndl {
        self.define_cfunc(name, argct, Rc::new(f))
    }

    pub(crate) fn cfunc(&self, id: u32) -> Option<&CFunc> {
        self.cfuncs.get(id as usize)
    }

    pub(crate) fn proto_push(&mut self, proto: Rc<dyn ffi::Proto>) -> u32 {
        self.protos.push(proto);
        (self.protos.len() - 1) as u32
    }

    pub(crate) fn proto(&self, id: u32) -> Option<Rc<dyn ffi::Proto>> {
        self.protos.get(id as usize).cloned()
    }

    /// Binds a value to a name in the global frame
    pub fn define_global(&mut self, name: &str, val: Hndl) {
        let id = self.intern(name);
        let global = self.global;
        self.env_set_or_define(global, id, val);
    }

    // top-level entry points

    /// Reads and evaluates every expression in `src` against the
    /// global environment, returning the last value
    ///
    /// Stops at the first error, returning the error object. The
    /// returned handle is not protected; push it before any further
    /// collection.
    pub fn eval_source(&mut self, src: &[u8]) -> (Hndl, EvalStatus) {
        let base = self.save_gc();
        let mut reader = parser::Reader::new(src);
        let mut last = NIL;

        loop {
            self.restore_gc(base);
            self.push_gc(last);

            let expr = match reader.read(self) {
                Ok(Some(expr)) => expr,
                Ok(None) => break,
                Err(e) => {
                    self.restore_gc(base);
                    let msg = e.to_string();
                    return (self.error(&msg), EvalStatus::Error);
                }
            };

            self.push_gc(expr);
            let global = self.global;
            last = self.eval(expr, global);

            if self.error_p(last) {
                self.restore_gc(base);
                return (last, EvalStatus::Error);
            }

            self.restore_gc(base);
            self.push_gc(last);
            self.safe_point();
        }

        self.restore_gc(base);
        (last, EvalStatus::Ok)
    }

    /// Evaluates a script file; I/O failures come back as error objects
    pub fn eval_file(&mut self, path: impl AsRef<Path>) -> (Hndl, EvalStatus) {
        match std::fs::read(path.as_ref()) {
            Ok(src) => self.eval_source(&src),
            Err(e) => {
                let msg = format!("cannot read {}: {}", path.as_ref().display(), e);
                (self.error(&msg), EvalStatus::Error)
            }
        }
    }

    // printing

    /// Display adapter that writes values in readable form
    pub fn display(&self, val: Hndl) -> ShownVal<'_> {
        ShownVal {
            ctx: self,
            val,
            write: true,
        }
    }

    /// Display adapter that prints strings without quoting
    pub fn display_raw(&self, val: Hndl) -> ShownVal<'_> {
        ShownVal {
            ctx: self,
            val,
            write: false,
        }
    }
}

/// Bundles together a value and its context for display
pub struct ShownVal<'a> {
    ctx: &'a Ctx,
    val: Hndl,
    write: bool,
}

/// Depth past which the printer elides nested structure
const PRINT_DEPTH: usize = 256;

impl ShownVal<'_> {
    fn print(&self, f: &mut fmt::Formatter<'_>, val: Hndl, depth: usize) -> fmt::Result {
        let ctx = self.ctx;

        if depth > PRINT_DEPTH {
            return write!(f, "...");
        }

        match ctx.obj(val) {
            Obj::Pair(..) => {
                write!(f, "(")?;
                let mut elt = val;
                let mut slow = val;
                let mut n = 0;
                loop {
                    match ctx.obj(elt) {
                        Obj::Pair(a, d) => {
                            if n > 0 {
                                write!(f, " ")?;
                            }
                            self.print(f, *a, depth + 1)?;
                            elt = *d;
                            n += 1;

                            if n % 2 == 0 {
                                slow = ctx.cdr(slow);
                                if slow == elt {
                                    write!(f, " ...")?;
                                    break;
                                }
                            }
                        }
                        Obj::Nil => break,
                        _ => {
                            write!(f, " . ")?;
                            self.print(f, elt, depth + 1)?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            Obj::Free(_) => write!(f, "<free>"),
            Obj::Nil => write!(f, "nil"),
            Obj::Fixnum(n) => write!(f, "{}", n),
            Obj::Flonum(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Obj::Symbol(id) => write!(f, "{}", ctx.sym_name(*id)),
            Obj::String(s) => {
                if self.write {
                    write!(f, "\"")?;
                    for c in s.chars() {
                        match c {
                            '"' => write!(f, "\\\"")?,
                            '\\' => write!(f, "\\\\")?,
                            '\n' => write!(f, "\\n")?,
                            '\t' => write!(f, "\\t")?,
                            '\r' => write!(f, "\\r")?,
                            _ => write!(f, "{}", c)?,
                        }
                    }
                    write!(f, "\"")
                } else {
                    write!(f, "{}", s)
                }
            }
            Obj::Func(_) => write!(f, "<fn>"),
            Obj::Macro(_) => write!(f, "<mac>"),
            Obj::Prim(p) => write!(f, "<prim {}>", p.name()),
            Obj::CFunc(id) => match ctx.cfunc(*id) {
                Some(c) => write!(f, "<cfunc {}>", c.name),
                None => write!(f, "<cfunc>"),
            },
            Obj::Ptr(p) => write!(f, "<ptr {:#x}>", p),
            Obj::Bool(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Obj::Keyword(id) => write!(f, ":{}", ctx.sym_name(*id)),
            Obj::Proto(id) => match ctx.proto(*id) {
                Some(p) => write!(f, "<proto {}>", p.name()),
                None => write!(f, "<proto>"),
            },
            Obj::Error(e) => write!(f, "<error: {}>", e.message),
            Obj::Env(_) => write!(f, "<env>"),
        }
    }
}

impl fmt::Display for ShownVal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print(f, self.val, 0)
    }
}

/// Accepts an input stream and runs a read - evaluate - print loop
/// until end of input
pub fn repl(config: Config, stream_in: io::Stdin) {
    repl_with(config, stream_in.lock(), io::stdout())
}

/// Line REPL over any reader and writer; each line is evaluated in
/// one context built from `config`
pub fn repl_with(config: Config, input: impl BufRead, mut out: impl Write) {
    let mut ctx = Ctx::new(config);

    for line in input.lines() {
        let input = match line {
            Ok(l) => l,
            Err(e) => {
                log::warn!("repl read failed: {}", e);
                break;
            }
        };

        let (val, status) = ctx.eval_source(input.as_bytes());
        let text = match status {
            EvalStatus::Ok => ctx.display(val).to_string(),
            EvalStatus::Error => format!("Error: {}", ctx.error_message(val).unwrap_or("?")),
        };

        if writeln!(out, "{}", text).is_err() {
            break;
        }
    }
}

/// Evaluates a script file in a fresh context, returning the printed
/// result
pub fn run_file(path: &str) -> Result<String, String> {
    run_file_with(Config::default(), path)
}

pub fn run_file_with(config: Config, path: &str) -> Result<String, String> {
    let mut ctx = Ctx::new(config);
    let (val, status) = ctx.eval_file(path);
    match status {
        EvalStatus::Ok => Ok(ctx.display(val).to_string()),
        EvalStatus::Error => Err(ctx.error_message(val).unwrap_or("?").to_string()),
    }
}

/// Interprets source text in a fresh context, returning the result
pub fn interpret(code: &str) -> Result<String, String> {
    let mut ctx = Ctx::default();
    let (val, status) = ctx.eval_source(code.as_bytes());
    match status {
        EvalStatus::Ok => Ok(ctx.display(val).to_string()),
        EvalStatus::Error => Err(ctx.error_message(val).unwrap_or("?").to_string()),
    }
}

/// Compiles and runs source text on the VM in a fresh context; with
/// `listing`, prints the disassembly of every program before it runs
pub fn run_vm(config: Config, src: &[u8], listing: bool) -> Result<String, String> {
    let mut ctx = Ctx::new(config);
    let val = compile::run_source(&mut ctx, src, |ctx, prog| {
        if listing {
            print!("{}", emit::disassemble(&prog.code, Some(ctx)));
        }
    })?;
    Ok(ctx.display(val).to_string())
}

pub fn interpret_vm(code: &str) -> Result<String, String> {
    run_vm(Config::default(), code.as_bytes(), false)
}
