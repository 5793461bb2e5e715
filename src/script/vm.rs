// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/vm.rs

// Register machine that runs assembled programs. Owns a register file,
// a flag register, and named memory areas bound to cursor registers;
// executes a bounded number of instructions per call so that callers
// can interleave many machines.

// <>

use std::fmt;

use super::core::{Closure, Hndl, Obj, Prim, FALSE, NIL};
use super::emit::{DecodeError, Insn, Program, Target, CLOS_MACRO, EP, FP, LR, NREGS, PC, R0, SP};
use super::{Config, Ctx};

/// Negative result
pub const FLAG_N: u8 = 1 << 0;
/// Zero result, or a false value under `test`
pub const FLAG_Z: u8 = 1 << 1;
/// Unsigned borrow
pub const FLAG_C: u8 = 1 << 2;
/// Signed overflow
pub const FLAG_V: u8 = 1 << 3;
/// Interrupts enabled; reserved
pub const FLAG_I: u8 = 1 << 4;

const WORD: u64 = 8;

/// Outcome of a call to [`Vm::step`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Budget spent; the next call resumes where this one stopped
    Yield,
    /// Program executed `exit`, with the truthiness of its operand
    Exit(bool),
}

/// Conditions that stop a machine; once raised, every further step
/// reports the same error
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmError {
    InvalidOpcode { byte: u8, at: u64 },
    BadRegister(u8),
    BadAddress(u64),
    /// Word used as an object handle does not name a live cell
    BadHandle(u64),
    AreaOverflow { area: String, need: usize },
    AreaUnderflow { area: String },
    /// Register has no memory area bound to it
    NoArea(u8),
    /// Script-level error object raised by an instruction
    Raised(Hndl),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidOpcode { byte, at } => write!(f, "invalid opcode {:#04x} at {:#x}", byte, at),
            VmError::BadRegister(r) => write!(f, "register {} out of range", r),
            VmError::BadAddress(a) => write!(f, "address {:#x} outside every area", a),
            VmError::BadHandle(w) => write!(f, "word {:#x} is not a live object", w),
            VmError::AreaOverflow { area, need } => {
                write!(f, "area {} cannot grow to {} bytes", area, need)
            }
            VmError::AreaUnderflow { area } => write!(f, "area {} is empty", area),
            VmError::NoArea(r) => write!(f, "no area bound to register {}", r),
            VmError::Raised(h) => write!(f, "script error {}", h),
        }
    }
}

impl std::error::Error for VmError {}

/// Named growable region addressed through its bound register
///
/// Each area owns a fixed virtual anchor; `top` areas span
/// `[anchor - cap, anchor)` and grow downward, the rest span
/// `[anchor, anchor + cap)` and grow upward. Growth never moves a
/// virtual address.
#[derive(Debug)]
pub struct Area {
    name: Box<str>,
    reg: u8,
    top: bool,
    anchor: u64,
    buf: Vec<u8>,
    /// Bytes written by program loading
    fill: usize,
}

impl Area {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reg(&self) -> u8 {
        self.reg
    }

    pub fn top_p(&self) -> bool {
        self.top
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Initial cursor value
    pub fn base(&self) -> u64 {
        self.anchor
    }

    fn lo(&self) -> u64 {
        if self.top {
            self.anchor - self.buf.len() as u64
        } else {
            self.anchor
        }
    }

    fn hi(&self) -> u64 {
        if self.top {
            self.anchor
        } else {
            self.anchor + self.buf.len() as u64
        }
    }

    /// Buffer index of `[addr, addr + n)`, if wholly inside the area
    fn index(&self, addr: u64, n: u64) -> Option<usize> {
        let end = addr.checked_add(n)?;
        (addr >= self.lo() && end <= self.hi()).then(|| (addr - self.lo()) as usize)
    }

    /// Ensures capacity of at least `need` bytes, keeping content at
    /// the same virtual addresses
    fn grow(&mut self, need: usize, hard_cap: usize) -> Result<(), VmError> {
        let cap = self.buf.len();
        if need <= cap {
            return Ok(());
        }
        if need > hard_cap {
            return Err(VmError::AreaOverflow {
                area: self.name.to_string(),
                need,
            });
        }

        let new_cap = (cap * 2).max(need).max(64).min(hard_cap);

        if self.top {
            let mut buf = vec![0; new_cap];
            buf[new_cap - cap..].copy_from_slice(&self.buf);
            self.buf = buf;
        } else {
            self.buf.resize(new_cap, 0);
        }

        if cfg!(feature = "memdbg") {
            log::debug!("area {} grew from {} to {} bytes", self.name, cap, new_cap);
        }

        Ok(())
    }

    fn read(&self, addr: u64) -> Option<u64> {
        let i = self.index(addr, WORD)?;
        let mut b = [0; 8];
        b.copy_from_slice(&self.buf[i..i + 8]);
        Some(u64::from_le_bytes(b))
    }

    fn write(&mut self, addr: u64, w: u64) -> Option<()> {
        let i = self.index(addr, WORD)?;
        self.buf[i..i + 8].copy_from_slice(&w.to_le_bytes());
        Some(())
    }
}

/// Virtual machine state
pub struct Vm {
    regs: [u64; NREGS],
    flags: u8,
    areas: Vec<Area>,
    hard_cap: usize,
    /// Set once `exit` runs
    status: Option<bool>,
    fault: Option<VmError>,
    result: Hndl,
    /// Instructions executed since the last reset
    cycles: u64,
    /// Objects named by loaded code
    literals: Vec<Hndl>,
}

impl Vm {
    /// Creates a machine with no areas mapped
    pub fn new(hard_cap: usize) -> Self {
        Self {
            regs: [0; NREGS],
            flags: 0,
            areas: vec![],
            hard_cap: hard_cap.min(1 << 31),
            status: None,
            fault: None,
            result: NIL,
            cycles: 0,
            literals: vec![],
        }
    }

    /// Code bound to `pc`, heap to `hp`, and environment and data
    /// stacks bound to `ep` and `sp`
    pub fn with_standard_layout(config: &Config) -> Result<Self, VmError> {
        let mut vm = Self::new(config.area_hard_cap);
        vm.memory_map("code", PC, config.code_area, false)?;
        vm.memory_map("heap", super::emit::HP, config.heap_area, false)?;
        vm.memory_map("env", EP, config.stack_area, true)?;
        vm.memory_map("stack", SP, config.stack_area, true)?;
        Ok(vm)
    }

    /// Binds a new area to `reg` and points the register at its base
    pub fn memory_map(&mut self, name: &str, reg: u8, cap: usize, top: bool) -> Result<usize, VmError> {
        if reg as usize >= NREGS {
            return Err(VmError::BadRegister(reg));
        }
        if cap > self.hard_cap {
            return Err(VmError::AreaOverflow {
                area: name.to_string(),
                need: cap,
            });
        }

        let idx = self.areas.len();
        let anchor = (idx as u64 + 1) << 32;

        self.areas.push(Area {
            name: name.into(),
            reg,
            top,
            anchor,
            buf: vec![0; cap],
            fill: 0,
        });
        self.regs[reg as usize] = anchor;

        log::debug!("mapped area {} to {} at {:#x}", name, super::emit::reg_name(reg), anchor);

        Ok(idx)
    }

    /// Returns every cursor to its base and clears machine state;
    /// backing storage is kept
    pub fn reset(&mut self) {
        self.regs = [0; NREGS];
        for a in &mut self.areas {
            a.fill = 0;
            self.regs[a.reg as usize] = a.anchor;
        }
        self.flags = 0;
        self.status = None;
        self.fault = None;
        self.result = NIL;
        self.cycles = 0;
        self.literals.clear();
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    pub fn reg(&self, r: u8) -> Result<u64, VmError> {
        self.regs.get(r as usize).copied().ok_or(VmError::BadRegister(r))
    }

    pub fn set_reg(&mut self, r: u8, w: u64) -> Result<(), VmError> {
        let slot = self.regs.get_mut(r as usize).ok_or(VmError::BadRegister(r))?;
        *slot = w;
        Ok(())
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Exit status, once the program has exited
    pub fn status(&self) -> Option<bool> {
        self.status
    }

    /// Value passed to the last `exit`
    pub fn result(&self) -> Hndl {
        self.result
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Appends a program to the code area and points `pc` at its entry
    pub fn load(&mut self, prog: &Program) -> Result<u64, VmError> {
        let i = self.area_of(PC)?;
        let hard = self.hard_cap;
        let a = &mut self.areas[i];

        let start = a.fill;
        a.grow(start + prog.code.len(), hard)?;
        a.buf[start..start + prog.code.len()].copy_from_slice(&prog.code);
        a.fill += prog.code.len();

        let entry = a.lo() + (start + prog.entry) as u64;
        self.regs[PC as usize] = entry;
        self.literals.extend_from_slice(&prog.literals);
        self.status = None;
        self.fault = None;

        Ok(entry)
    }

    fn area_of(&self, reg: u8) -> Result<usize, VmError> {
        self.areas
            .iter()
            .position(|a| a.reg == reg)
            .ok_or(VmError::NoArea(reg))
    }

    fn area_at(&self, addr: u64) -> Result<usize, VmError> {
        self.areas
            .iter()
            .position(|a| a.index(addr, WORD).is_some())
            .ok_or(VmError::BadAddress(addr))
    }

    /// Pushes a word through the cursor register of an area
    pub fn push(&mut self, reg: u8, w: u64) -> Result<(), VmError> {
        let i = self.area_of(reg)?;
        let cur = self.reg(reg)?;
        let hard = self.hard_cap;
        let a = &mut self.areas[i];

        let (at, next) = if a.top {
            let at = cur.wrapping_sub(WORD);
            if at < a.lo() && at < a.anchor {
                a.grow((a.anchor - at) as usize, hard)?;
            }
            (at, at)
        } else {
            let end = cur.checked_add(WORD).ok_or(VmError::BadAddress(cur))?;
            if end > a.hi() && cur >= a.anchor {
                a.grow((end - a.anchor) as usize, hard)?;
            }
            (cur, end)
        };

        a.write(at, w).ok_or(VmError::BadAddress(at))?;
        self.regs[reg as usize] = next;
        Ok(())
    }

    /// Address of the most recently pushed word in an area
    fn top_addr(&self, reg: u8) -> Result<(usize, u64, u64), VmError> {
        let i = self.area_of(reg)?;
        let cur = self.reg(reg)?;
        let a = &self.areas[i];

        let underflow = || VmError::AreaUnderflow {
            area: a.name.to_string(),
        };

        if a.top {
            if cur >= a.anchor {
                return Err(underflow());
            }
            Ok((i, cur, cur + WORD))
        } else {
            if cur < a.anchor + WORD {
                return Err(underflow());
            }
            Ok((i, cur - WORD, cur - WORD))
        }
    }

    pub fn pop(&mut self, reg: u8) -> Result<u64, VmError> {
        let (i, at, next) = self.top_addr(reg)?;
        let w = self.areas[i].read(at).ok_or(VmError::BadAddress(at))?;
        self.regs[reg as usize] = next;
        Ok(w)
    }

    pub fn top(&self, reg: u8) -> Result<u64, VmError> {
        let (i, at, _) = self.top_addr(reg)?;
        self.areas[i].read(at).ok_or(VmError::BadAddress(at))
    }

    /// Reads a word from whichever area holds `addr`
    pub fn load_word(&self, addr: u64) -> Result<u64, VmError> {
        let i = self.area_at(addr)?;
        self.areas[i].read(addr).ok_or(VmError::BadAddress(addr))
    }

    pub fn store_word(&mut self, addr: u64, w: u64) -> Result<(), VmError> {
        let i = self.area_at(addr)?;
        self.areas[i].write(addr, w).ok_or(VmError::BadAddress(addr))
    }

    fn handle(&self, ctx: &Ctx, w: u64) -> Result<Hndl, VmError> {
        match Hndl::from_word(w) {
            Some(h) if !matches!(ctx.heap.try_get(h), None | Some(Obj::Free(_))) => Ok(h),
            _ => Err(VmError::BadHandle(w)),
        }
    }

    fn handle_in(&self, ctx: &Ctx, r: u8) -> Result<Hndl, VmError> {
        let w = self.reg(r)?;
        self.handle(ctx, w)
    }

    /// Innermost environment on the environment stack
    fn env(&self, ctx: &Ctx) -> Result<Hndl, VmError> {
        let w = self.top(EP)?;
        self.handle(ctx, w)
    }

    /// Pops `argc` handles off the data stack, first argument first
    fn pop_args(&mut self, ctx: &Ctx, argc: u8) -> Result<Vec<Hndl>, VmError> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            let w = self.pop(SP)?;
            args.push(self.handle(ctx, w)?);
        }
        args.reverse();
        Ok(args)
    }

    fn fetch(&self) -> Result<(Insn, u64), VmError> {
        let pc = self.regs[PC as usize];
        let i = self.area_of(PC)?;
        let a = &self.areas[i];

        let idx = a.index(pc, 1).ok_or(VmError::BadAddress(pc))?;
        match Insn::decode(&a.buf[..a.fill], idx) {
            Ok((insn, len)) => Ok((insn, len as u64)),
            Err(DecodeError::InvalidOpcode { byte, .. }) => Err(VmError::InvalidOpcode { byte, at: pc }),
            Err(DecodeError::Truncated { .. }) => Err(VmError::BadAddress(pc)),
        }
    }

    fn branch(&mut self, t: Target, next: u64) -> Result<(), VmError> {
        match t {
            Target::Rel(rel) => {
                self.regs[PC as usize] = next.wrapping_add_signed(rel as i64);
                Ok(())
            }
            _ => Err(VmError::BadAddress(next)),
        }
    }

    fn raise(ctx: &mut Ctx, msg: &str) -> VmError {
        VmError::Raised(ctx.error(msg))
    }

    /// Runs up to `cycles` instructions, or until exit when negative
    ///
    /// After an exit or an error the machine stays halted, and every
    /// further call reports the same outcome.
    pub fn step(&mut self, ctx: &mut Ctx, cycles: i64) -> Result<Status, VmError> {
        if let Some(e) = &self.fault {
            return Err(e.clone());
        }
        if let Some(st) = self.status {
            return Ok(Status::Exit(st));
        }

        let mut left = cycles;
        while left != 0 {
            let done = match self.exec(ctx) {
                Ok(done) => done,
                Err(e) => {
                    log::debug!("vm fault after {} cycles: {}", self.cycles, e);
                    self.fault = Some(e.clone());
                    return Err(e);
                }
            };
            self.cycles += 1;

            if let Some(st) = done {
                log::debug!("vm exit ({}) after {} cycles", st, self.cycles);
                return Ok(Status::Exit(st));
            }
            if left > 0 {
                left -= 1;
            }
        }

        Ok(Status::Yield)
    }

    /// Executes one instruction, returning the exit status if it was
    /// `exit`
    fn exec(&mut self, ctx: &mut Ctx) -> Result<Option<bool>, VmError> {
        let pc = self.regs[PC as usize];
        let (insn, len) = self.fetch()?;
        let next = pc + len;
        self.regs[PC as usize] = next;

        if cfg!(feature = "stkdbg") {
            log::trace!("{:#x}: {}", pc, insn);
        }

        match insn {
            Insn::Nop => (),
            Insn::Exit(rs) => {
                let w = self.reg(rs)?;
                let st = w != NIL.to_word() && w != FALSE.to_word();
                self.regs[R0 as usize] = w;
                self.result = self.handle(ctx, w).unwrap_or(NIL);
                self.status = Some(st);
                return Ok(Some(st));
            }
            Insn::Mov(rd, rs) => {
                let w = self.reg(rs)?;
                self.set_reg(rd, w)?;
            }
            Insn::Ldi(rd, i) => self.set_reg(rd, i as u64)?,
            Insn::Ldk(rd, k) => self.set_reg(rd, k as u64)?,
            Insn::Push(a, rs) => {
                let w = self.reg(rs)?;
                self.push(a, w)?;
            }
            Insn::Pop(rd, a) => {
                let w = self.pop(a)?;
                self.set_reg(rd, w)?;
            }
            Insn::Top(rd, a) => {
                let w = self.top(a)?;
                self.set_reg(rd, w)?;
            }
            Insn::Ld(rd, ra, off) => {
                let addr = self.reg(ra)?.wrapping_add_signed(off as i64);
                let w = self.load_word(addr)?;
                self.set_reg(rd, w)?;
            }
            Insn::St(rs, ra, off) => {
                let addr = self.reg(ra)?.wrapping_add_signed(off as i64);
                let w = self.reg(rs)?;
                self.store_word(addr, w)?;
            }
            Insn::Addi(rd, rs, i) => {
                let w = self.reg(rs)?.wrapping_add_signed(i as i64);
                self.set_reg(rd, w)?;
            }
            Insn::Cmp(ra, rb) => {
                let a = self.reg(ra)? as i64;
                let b = self.reg(rb)? as i64;
                let mut f = self.flags & FLAG_I;
                if a.wrapping_sub(b) < 0 {
                    f |= FLAG_N;
                }
                if a == b {
                    f |= FLAG_Z;
                }
                if (a as u64) < (b as u64) {
                    f |= FLAG_C;
                }
                if a.checked_sub(b).is_none() {
                    f |= FLAG_V;
                }
                self.flags = f;
            }
            Insn::Test(rs) => {
                let w = self.reg(rs)?;
                self.flags &= !(FLAG_Z | FLAG_N);
                if w == NIL.to_word() || w == FALSE.to_word() {
                    self.flags |= FLAG_Z;
                }
            }
            Insn::Jmp(t) => self.branch(t, next)?,
            Insn::Bz(t) => {
                if self.flags & FLAG_Z != 0 {
                    self.branch(t, next)?;
                }
            }
            Insn::Bnz(t) => {
                if self.flags & FLAG_Z == 0 {
                    self.branch(t, next)?;
                }
            }
            Insn::Bl(t) => {
                self.regs[LR as usize] = next;
                self.branch(t, next)?;
            }
            Insn::Ret => self.regs[PC as usize] = self.regs[LR as usize],
            Insn::Enter(n) => {
                self.push(SP, self.regs[LR as usize])?;
                self.push(SP, self.regs[FP as usize])?;
                self.regs[FP as usize] = self.regs[SP as usize];
                for _ in 0..n {
                    self.push(SP, 0)?;
                }
            }
            Insn::Leave(n) => {
                if cfg!(feature = "stkdbg") {
                    let depth = self.regs[FP as usize].wrapping_sub(self.regs[SP as usize]) / WORD;
                    if depth != n as u64 {
                        log::trace!("leave {} with {} words above the frame", n, depth);
                    }
                }
                self.regs[SP as usize] = self.regs[FP as usize];
                self.regs[FP as usize] = self.pop(SP)?;
                self.regs[LR as usize] = self.pop(SP)?;
            }
            Insn::Get(rd, sym) => {
                let env = self.env(ctx)?;
                match ctx.env_lookup_by_id(env, sym) {
                    Some(v) => self.set_reg(rd, v.to_word())?,
                    None => {
                        let msg = format!("unbound symbol: {}", ctx.sym_name(sym));
                        return Err(Self::raise(ctx, &msg));
                    }
                }
            }
            Insn::Def(rs, sym) => {
                let env = self.env(ctx)?;
                let v = self.handle_in(ctx, rs)?;
                ctx.env_define_id(env, sym, v);
            }
            Insn::Set(rs, sym) => {
                let env = self.env(ctx)?;
                let v = self.handle_in(ctx, rs)?;
                ctx.env_set_id(env, sym, v).map_err(VmError::Raised)?;
            }
            Insn::Frame(rs) => {
                let parent = self.handle_in(ctx, rs)?;
                let frame = ctx.make_environment(Some(parent));
                self.push(EP, frame.to_word())?;
            }
            Insn::Unframe => {
                self.pop(EP)?;
            }
            Insn::Bind(sym) => {
                let w = self.pop(SP)?;
                let v = self.handle(ctx, w)?;
                let env = self.env(ctx)?;
                ctx.env_define_id(env, sym, v);
            }
            Insn::Prim(rd, id, argc) => {
                let Some(p) = Prim::from_id(id) else {
                    let msg = format!("unknown primitive {}", id);
                    return Err(Self::raise(ctx, &msg));
                };
                let args = self.pop_args(ctx, argc)?;
                let v = ctx.call_builtin(p, &args).map_err(VmError::Raised)?;
                self.set_reg(rd, v.to_word())?;
            }
            Insn::Call(rd, rf, argc) => {
                let f = self.handle_in(ctx, rf)?;
                let args = self.pop_args(ctx, argc)?;
                let v = ctx.apply(f, &args).map_err(VmError::Raised)?;
                self.set_reg(rd, v.to_word())?;
            }
            Insn::Clos(rd, params, body, kind) => {
                let env = self.env(ctx)?;
                let c = Closure {
                    params: self.handle(ctx, params as u64)?,
                    body: self.handle(ctx, body as u64)?,
                    env,
                };
                let h = ctx.alloc(if kind == CLOS_MACRO { Obj::Macro(c) } else { Obj::Func(c) });
                self.set_reg(rd, h.to_word())?;
            }
        }

        Ok(None)
    }

    /// Every handle the machine might hold: registers, area words and
    /// loaded literals
    ///
    /// Roots are found conservatively: any word that happens to equal
    /// the index of a live cell keeps that cell alive.
    pub fn roots(&self, ctx: &Ctx) -> Vec<Hndl> {
        let live = |w: u64| self.handle(ctx, w).ok();

        let mut roots: Vec<Hndl> = self.regs.iter().filter_map(|w| live(*w)).collect();
        for a in &self.areas {
            roots.extend(
                a.buf
                    .chunks_exact(8)
                    .filter_map(|c| c.try_into().ok().map(u64::from_le_bytes))
                    .filter_map(live),
            );
        }
        roots.extend_from_slice(&self.literals);
        roots.push(self.result);
        roots
    }

    /// Collects garbage with this machine's roots added to the
    /// context's own
    pub fn collect_garbage(&self, ctx: &mut Ctx) -> usize {
        let roots = self.roots(ctx);
        ctx.collect_garbage_with(&roots)
    }

    /// Loads a program and runs it to completion
    pub fn run(&mut self, ctx: &mut Ctx, prog: &Program) -> Result<(Hndl, bool), VmError> {
        self.load(prog)?;
        match self.step(ctx, -1)? {
            Status::Exit(st) => Ok((self.result, st)),
            Status::Yield => Ok((self.result, false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::emit::{BlockKind, Emitter, HP};
    use crate::script::TRUE;

    fn countdown(n: i64) -> Program {
        let mut em = Emitter::new();
        let entry = em.make_basic_block(BlockKind::Entry);
        let body = em.make_basic_block(BlockKind::Loop);
        let done = em.make_basic_block(BlockKind::Body);

        em.emit(entry, Insn::Ldi(1, n));
        em.set_next(entry, body);

        em.emit(body, Insn::Addi(1, 1, -1));
        em.emit(body, Insn::Ldi(2, 0));
        em.emit(body, Insn::Cmp(1, 2));
        em.emit(body, Insn::Bnz(Target::Block(body)));
        em.set_next(body, done);

        em.emit(done, Insn::Ldk(3, TRUE.0));
        em.emit(done, Insn::Exit(3));

        em.assemble(entry).unwrap()
    }

    fn machine() -> Vm {
        Vm::with_standard_layout(&Config::default()).unwrap()
    }

    #[test]
    fn runs_to_exit() {
        let mut ctx = Ctx::default();
        let mut vm = machine();
        vm.load(&countdown(5)).unwrap();

        assert_eq!(vm.step(&mut ctx, -1), Ok(Status::Exit(true)));
        assert_eq!(vm.cycles(), 1 + 5 * 4 + 2);
        assert_eq!(vm.reg(1), Ok(0));
        assert_eq!(vm.result(), TRUE);

        // halted machines stay halted
        assert_eq!(vm.step(&mut ctx, 10), Ok(Status::Exit(true)));
        assert_eq!(vm.cycles(), 23);
    }

    #[test]
    fn single_steps_match_full_run() {
        let mut ctx = Ctx::default();

        let mut whole = machine();
        whole.load(&countdown(7)).unwrap();
        let full = whole.step(&mut ctx, -1).unwrap();

        let mut stepped = machine();
        stepped.load(&countdown(7)).unwrap();
        let mut calls = 0;
        let last = loop {
            calls += 1;
            match stepped.step(&mut ctx, 1).unwrap() {
                Status::Yield => continue,
                st => break st,
            }
        };

        assert_eq!(last, full);
        assert_eq!(stepped.cycles(), whole.cycles());
        assert_eq!(calls, whole.cycles());
    }

    #[test]
    fn budget_yields() {
        let mut ctx = Ctx::default();
        let mut vm = machine();
        vm.load(&countdown(3)).unwrap();

        assert_eq!(vm.step(&mut ctx, 4), Ok(Status::Yield));
        assert_eq!(vm.cycles(), 4);
        assert_eq!(vm.step(&mut ctx, 0), Ok(Status::Yield));
        assert_eq!(vm.cycles(), 4);
        assert_eq!(vm.step(&mut ctx, 100), Ok(Status::Exit(true)));
        assert_eq!(vm.cycles(), 1 + 3 * 4 + 2);
    }

    #[test]
    fn stack_area_grows() {
        let mut vm = Vm::new(1 << 20);
        vm.memory_map("stack", SP, 16, true).unwrap();

        vm.push(SP, 1000).unwrap();
        let first = vm.reg(SP).unwrap();

        for i in 1..100u64 {
            vm.push(SP, 1000 + i).unwrap();
        }
        assert!(vm.areas()[0].capacity() >= 800);

        // addresses taken before growth still name the same word
        assert_eq!(vm.load_word(first), Ok(1000));
        assert_eq!(vm.top(SP), Ok(1099));

        for i in (0..100u64).rev() {
            assert_eq!(vm.pop(SP), Ok(1000 + i));
        }
        assert_eq!(vm.reg(SP), Ok(vm.areas()[0].base()));
        assert!(matches!(vm.pop(SP), Err(VmError::AreaUnderflow { .. })));
    }

    #[test]
    fn heap_area_grows() {
        let mut vm = Vm::new(1 << 20);
        vm.memory_map("heap", HP, 8, false).unwrap();

        for i in 0..40u64 {
            vm.push(HP, i * 3).unwrap();
        }
        let base = vm.areas()[0].base();
        assert_eq!(vm.load_word(base + 8 * 7), Ok(21));

        for i in (0..40u64).rev() {
            assert_eq!(vm.pop(HP), Ok(i * 3));
        }
        assert!(matches!(vm.top(HP), Err(VmError::AreaUnderflow { .. })));
    }

    #[test]
    fn hard_cap_stops_growth() {
        let mut vm = Vm::new(64);
        vm.memory_map("stack", SP, 16, true).unwrap();
        for _ in 0..8 {
            vm.push(SP, 7).unwrap();
        }
        assert_eq!(
            vm.push(SP, 7),
            Err(VmError::AreaOverflow {
                area: "stack".into(),
                need: 72
            })
        );
        assert!(vm.memory_map("big", 3, 128, false).is_err());
    }

    #[test]
    fn unmapped_access() {
        let mut vm = machine();
        assert_eq!(vm.push(5, 1), Err(VmError::NoArea(5)));
        assert_eq!(vm.load_word(0x10), Err(VmError::BadAddress(0x10)));
        assert_eq!(vm.set_reg(40, 0), Err(VmError::BadRegister(40)));
    }

    #[test]
    fn faults_are_sticky() {
        let mut ctx = Ctx::default();
        let mut vm = machine();
        vm.load(&Program {
            code: vec![0xff],
            entry: 0,
            literals: vec![],
        })
        .unwrap();

        let err = vm.step(&mut ctx, -1).unwrap_err();
        assert!(matches!(err, VmError::InvalidOpcode { byte: 0xff, .. }));
        assert_eq!(vm.step(&mut ctx, 1), Err(err));
    }

    #[test]
    fn bad_register_faults() {
        let mut ctx = Ctx::default();
        let mut em = Emitter::new();
        let b = em.make_basic_block(BlockKind::Entry);
        em.emit(b, Insn::Mov(40, 1));
        let prog = em.assemble(b).unwrap();

        let mut vm = machine();
        vm.load(&prog).unwrap();
        assert_eq!(vm.step(&mut ctx, -1), Err(VmError::BadRegister(40)));
    }

    #[test]
    fn running_off_the_end_faults() {
        let mut ctx = Ctx::default();
        let mut em = Emitter::new();
        let b = em.make_basic_block(BlockKind::Entry);
        em.emit(b, Insn::Nop);
        let prog = em.assemble(b).unwrap();

        let mut vm = machine();
        vm.load(&prog).unwrap();
        assert!(matches!(vm.step(&mut ctx, -1), Err(VmError::BadAddress(_))));
    }

    #[test]
    fn frames_and_calls() {
        let mut ctx = Ctx::default();
        let mut em = Emitter::new();
        let main = em.make_basic_block(BlockKind::Entry);
        let sub = em.make_basic_block(BlockKind::Proc);

        let global = em.literal(ctx.global());
        let x = ctx.intern("x");
        let seven = ctx.fixnum(7);
        let seven = em.literal(seven);

        em.emit(main, Insn::Ldk(1, global));
        em.emit(main, Insn::Push(EP, 1));
        em.emit(main, Insn::Enter(0));
        em.emit(main, Insn::Bl(Target::Block(sub)));
        em.emit(main, Insn::Leave(0));
        em.emit(main, Insn::Unframe);
        em.emit(main, Insn::Exit(R0));

        // sub binds x in a fresh frame and returns it
        em.emit(sub, Insn::Ldk(2, seven));
        em.emit(sub, Insn::Push(SP, 2));
        em.emit(sub, Insn::Frame(1));
        em.emit(sub, Insn::Bind(x));
        em.emit(sub, Insn::Enter(1));
        em.emit(sub, Insn::Get(R0, x));
        em.emit(sub, Insn::Leave(1));
        em.emit(sub, Insn::Unframe);
        em.emit(sub, Insn::Ret);

        let prog = em.assemble(main).unwrap();
        let mut vm = machine();
        let (v, st) = vm.run(&mut ctx, &prog).unwrap();
        assert!(st);
        assert_eq!(ctx.fixnum_get(v), Some(7));

        // the frame is gone, so x is unbound globally
        assert!(ctx.env_lookup_by_id(ctx.global(), x).is_none());
        assert_eq!(vm.reg(SP), Ok(vm.areas()[3].base()));
        assert_eq!(vm.reg(EP), Ok(vm.areas()[2].base()));
    }

    #[test]
    fn raised_errors_carry_objects() {
        let mut ctx = Ctx::default();
        let mut em = Emitter::new();
        let b = em.make_basic_block(BlockKind::Entry);
        let global = em.literal(ctx.global());
        let missing = ctx.intern("missing");
        em.emit(b, Insn::Ldk(1, global));
        em.emit(b, Insn::Push(EP, 1));
        em.emit(b, Insn::Get(2, missing));
        em.emit(b, Insn::Exit(2));

        let mut vm = machine();
        match vm.run(&mut ctx, &em.assemble(b).unwrap()) {
            Err(VmError::Raised(e)) => assert_eq!(ctx.error_message(e), Some("unbound symbol: missing")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cmp_flags() {
        let mut ctx = Ctx::default();
        let mut em = Emitter::new();
        let b = em.make_basic_block(BlockKind::Entry);
        em.emit(b, Insn::Ldi(1, 3));
        em.emit(b, Insn::Ldi(2, 5));
        em.emit(b, Insn::Cmp(1, 2));
        em.emit(b, Insn::Exit(1));

        let mut vm = machine();
        vm.run(&mut ctx, &em.assemble(b).unwrap()).unwrap();
        assert_eq!(vm.flags(), FLAG_N | FLAG_C);
    }

    #[test]
    fn reset_keeps_storage() {
        let mut ctx = Ctx::default();
        let mut vm = machine();
        for _ in 0..1000 {
            vm.push(SP, 1).unwrap();
        }
        let cap = vm.areas()[3].capacity();

        vm.load(&countdown(2)).unwrap();
        vm.step(&mut ctx, -1).unwrap();
        vm.reset();

        assert_eq!(vm.areas()[3].capacity(), cap);
        assert_eq!(vm.reg(SP), Ok(vm.areas()[3].base()));
        assert_eq!(vm.status(), None);
        assert_eq!(vm.cycles(), 0);

        vm.load(&countdown(2)).unwrap();
        assert_eq!(vm.step(&mut ctx, -1), Ok(Status::Exit(true)));
    }

    #[test]
    fn collection_sees_machine_roots() {
        let mut ctx = Ctx::default();
        let mut vm = machine();

        let kept = ctx.fixnum(11);
        let stacked = ctx.fixnum(12);
        let lost = ctx.fixnum(13);
        vm.set_reg(4, kept.to_word()).unwrap();
        vm.push(SP, stacked.to_word()).unwrap();

        vm.collect_garbage(&mut ctx);
        assert_eq!(ctx.fixnum_get(kept), Some(11));
        assert_eq!(ctx.fixnum_get(stacked), Some(12));
        assert!(ctx.heap.free_p(lost));
    }
}
