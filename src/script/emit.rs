// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/emit.rs

// Instruction set, basic-block graph, assembler and disassembler for
// the script virtual machine. Instructions are variable-length: one
// opcode byte, then register bytes and little-endian immediates.

// <>

use std::fmt;
use std::fmt::Write;

use super::core::Hndl;
use super::Ctx;

/// Number of machine registers
pub const NREGS: usize = 32;

/// Value and return register
pub const R0: u8 = 0;
/// Frame pointer
pub const FP: u8 = 26;
/// Heap area cursor
pub const HP: u8 = 27;
/// Environment stack cursor
pub const EP: u8 = 28;
/// Data stack cursor
pub const SP: u8 = 29;
/// Link register
pub const LR: u8 = 30;
/// Program counter
pub const PC: u8 = 31;

/// Printable name of a register
pub fn reg_name(r: u8) -> String {
    match r {
        FP => "fp".into(),
        HP => "hp".into(),
        EP => "ep".into(),
        SP => "sp".into(),
        LR => "lr".into(),
        PC => "pc".into(),
        _ => format!("r{}", r),
    }
}

macro_rules! enum_and_tryfrom {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl TryFrom<u8> for $name {
            type Error = ();

            #[inline(always)]
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}

enum_and_tryfrom! {
    /// Operation byte at the start of every instruction
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Opcode {
        Nop = 0x00,
        /// rs; halts with the truthiness of rs
        Exit = 0x01,
        Mov = 0x02,
        /// rd, i64
        Ldi = 0x03,
        /// rd, handle
        Ldk = 0x04,
        /// area register, rs
        Push = 0x08,
        /// rd, area register
        Pop = 0x09,
        /// rd, area register
        Top = 0x0a,
        /// rd, address register, i32 offset
        Ld = 0x0b,
        /// rs, address register, i32 offset
        St = 0x0c,
        Addi = 0x10,
        Cmp = 0x11,
        Test = 0x12,
        Jmp = 0x18,
        Bz = 0x19,
        Bnz = 0x1a,
        Bl = 0x1b,
        Ret = 0x1c,
        /// u16 slot count
        Enter = 0x20,
        Leave = 0x21,
        /// rd, symbol
        Get = 0x28,
        Def = 0x29,
        Set = 0x2a,
        /// rs; pushes a new frame whose parent is rs
        Frame = 0x2b,
        Unframe = 0x2c,
        /// symbol; pops the data stack into the top frame
        Bind = 0x2d,
        /// rd, primitive id, argc
        Prim = 0x30,
        /// rd, callee register, argc
        Call = 0x31,
        /// rd, params, body, kind
        Clos = 0x32,
    }
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Exit => "exit",
            Opcode::Mov => "mov",
            Opcode::Ldi => "ldi",
            Opcode::Ldk => "ldk",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Top => "top",
            Opcode::Ld => "ld",
            Opcode::St => "st",
            Opcode::Addi => "addi",
            Opcode::Cmp => "cmp",
            Opcode::Test => "test",
            Opcode::Jmp => "jmp",
            Opcode::Bz => "bz",
            Opcode::Bnz => "bnz",
            Opcode::Bl => "bl",
            Opcode::Ret => "ret",
            Opcode::Enter => "enter",
            Opcode::Leave => "leave",
            Opcode::Get => "get",
            Opcode::Def => "def",
            Opcode::Set => "set",
            Opcode::Frame => "frame",
            Opcode::Unframe => "unframe",
            Opcode::Bind => "bind",
            Opcode::Prim => "prim",
            Opcode::Call => "call",
            Opcode::Clos => "clos",
        }
    }

    /// Encoded length in bytes, opcode included
    pub fn width(self) -> usize {
        1 + match self {
            Opcode::Nop | Opcode::Ret | Opcode::Unframe => 0,
            Opcode::Exit | Opcode::Test | Opcode::Frame => 1,
            Opcode::Mov | Opcode::Push | Opcode::Pop | Opcode::Top | Opcode::Cmp => 2,
            Opcode::Enter | Opcode::Leave => 2,
            Opcode::Prim | Opcode::Call => 3,
            Opcode::Jmp | Opcode::Bz | Opcode::Bnz | Opcode::Bl | Opcode::Bind => 4,
            Opcode::Ldk | Opcode::Get | Opcode::Def | Opcode::Set => 5,
            Opcode::Ld | Opcode::St | Opcode::Addi => 6,
            Opcode::Ldi => 9,
            Opcode::Clos => 10,
        }
    }
}

/// Basic block identifier, local to one emitter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

/// Forward-declared branch target, bound to a block before assembly
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Branch destination; only `Rel` survives assembly
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Block(BlockId),
    Label(Label),
    /// Displacement from the end of the branch instruction
    Rel(i32),
}

/// One instruction, either pseudo (unresolved targets) or decoded
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Insn {
    Nop,
    Exit(u8),
    Mov(u8, u8),
    Ldi(u8, i64),
    Ldk(u8, u32),
    Push(u8, u8),
    Pop(u8, u8),
    Top(u8, u8),
    Ld(u8, u8, i32),
    St(u8, u8, i32),
    Addi(u8, u8, i32),
    Cmp(u8, u8),
    Test(u8),
    Jmp(Target),
    Bz(Target),
    Bnz(Target),
    Bl(Target),
    Ret,
    Enter(u16),
    Leave(u16),
    Get(u8, u32),
    Def(u8, u32),
    Set(u8, u32),
    Frame(u8),
    Unframe,
    Bind(u32),
    Prim(u8, u8, u8),
    Call(u8, u8, u8),
    Clos(u8, u32, u32, u8),
}

/// Failure to decode the byte stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    InvalidOpcode { byte: u8, at: usize },
    Truncated { at: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidOpcode { byte, at } => write!(f, "invalid opcode {:#04x} at {:#x}", byte, at),
            DecodeError::Truncated { at } => write!(f, "truncated instruction at {:#x}", at),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failure to lay out or encode a block graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsmError {
    UnboundLabel(u32),
    BadBlock(u32),
    DisplacementOverflow,
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::UnboundLabel(l) => write!(f, "label L{} was never bound", l),
            AsmError::BadBlock(b) => write!(f, "reference to nonexistent block B{}", b),
            AsmError::DisplacementOverflow => write!(f, "branch displacement exceeds 32 bits"),
        }
    }
}

impl std::error::Error for AsmError {}

/// Byte cursor used by the decoder
struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or(DecodeError::Truncated { at: self.start })?;
        self.pos += N;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    fn rel(&mut self) -> Result<Target, DecodeError> {
        Ok(Target::Rel(self.i32()?))
    }
}

impl Insn {
    pub fn opcode(&self) -> Opcode {
        match self {
            Insn::Nop => Opcode::Nop,
            Insn::Exit(..) => Opcode::Exit,
            Insn::Mov(..) => Opcode::Mov,
            Insn::Ldi(..) => Opcode::Ldi,
            Insn::Ldk(..) => Opcode::Ldk,
            Insn::Push(..) => Opcode::Push,
            Insn::Pop(..) => Opcode::Pop,
            Insn::Top(..) => Opcode::Top,
            Insn::Ld(..) => Opcode::Ld,
            Insn::St(..) => Opcode::St,
            Insn::Addi(..) => Opcode::Addi,
            Insn::Cmp(..) => Opcode::Cmp,
            Insn::Test(..) => Opcode::Test,
            Insn::Jmp(..) => Opcode::Jmp,
            Insn::Bz(..) => Opcode::Bz,
            Insn::Bnz(..) => Opcode::Bnz,
            Insn::Bl(..) => Opcode::Bl,
            Insn::Ret => Opcode::Ret,
            Insn::Enter(..) => Opcode::Enter,
            Insn::Leave(..) => Opcode::Leave,
            Insn::Get(..) => Opcode::Get,
            Insn::Def(..) => Opcode::Def,
            Insn::Set(..) => Opcode::Set,
            Insn::Frame(..) => Opcode::Frame,
            Insn::Unframe => Opcode::Unframe,
            Insn::Bind(..) => Opcode::Bind,
            Insn::Prim(..) => Opcode::Prim,
            Insn::Call(..) => Opcode::Call,
            Insn::Clos(..) => Opcode::Clos,
        }
    }

    #[inline(always)]
    pub fn width(&self) -> usize {
        self.opcode().width()
    }

    /// Branch target, if this is a control transfer
    pub fn target(&self) -> Option<Target> {
        match self {
            Insn::Jmp(t) | Insn::Bz(t) | Insn::Bnz(t) | Insn::Bl(t) => Some(*t),
            _ => None,
        }
    }

    fn with_target(self, t: Target) -> Self {
        match self {
            Insn::Jmp(_) => Insn::Jmp(t),
            Insn::Bz(_) => Insn::Bz(t),
            Insn::Bnz(_) => Insn::Bnz(t),
            Insn::Bl(_) => Insn::Bl(t),
            other => other,
        }
    }

    /// Appends the encoding; branch targets must already be relative
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), AsmError> {
        out.push(self.opcode() as u8);

        match *self {
            Insn::Nop | Insn::Ret | Insn::Unframe => (),
            Insn::Exit(r) | Insn::Test(r) | Insn::Frame(r) => out.push(r),
            Insn::Mov(a, b) | Insn::Push(a, b) | Insn::Pop(a, b) | Insn::Top(a, b) | Insn::Cmp(a, b) => {
                out.extend_from_slice(&[a, b])
            }
            Insn::Ldi(r, i) => {
                out.push(r);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Insn::Ldk(r, k) | Insn::Get(r, k) | Insn::Def(r, k) | Insn::Set(r, k) => {
                out.push(r);
                out.extend_from_slice(&k.to_le_bytes());
            }
            Insn::Ld(a, b, off) | Insn::St(a, b, off) | Insn::Addi(a, b, off) => {
                out.extend_from_slice(&[a, b]);
                out.extend_from_slice(&off.to_le_bytes());
            }
            Insn::Jmp(t) | Insn::Bz(t) | Insn::Bnz(t) | Insn::Bl(t) => match t {
                Target::Rel(rel) => out.extend_from_slice(&rel.to_le_bytes()),
                Target::Block(b) => return Err(AsmError::BadBlock(b.0)),
                Target::Label(l) => return Err(AsmError::UnboundLabel(l.0)),
            },
            Insn::Enter(n) | Insn::Leave(n) => out.extend_from_slice(&n.to_le_bytes()),
            Insn::Bind(s) => out.extend_from_slice(&s.to_le_bytes()),
            Insn::Prim(a, b, c) | Insn::Call(a, b, c) => out.extend_from_slice(&[a, b, c]),
            Insn::Clos(r, p, b, k) => {
                out.push(r);
                out.extend_from_slice(&p.to_le_bytes());
                out.extend_from_slice(&b.to_le_bytes());
                out.push(k);
            }
        }

        Ok(())
    }

    /// Decodes the instruction at `at`, returning it with its width
    pub fn decode(code: &[u8], at: usize) -> Result<(Insn, usize), DecodeError> {
        let mut c = Cursor {
            code,
            pos: at,
            start: at,
        };

        let byte = c.u8()?;
        let op = Opcode::try_from(byte).map_err(|_| DecodeError::InvalidOpcode { byte, at })?;

        let insn = match op {
            Opcode::Nop => Insn::Nop,
            Opcode::Exit => Insn::Exit(c.u8()?),
            Opcode::Mov => Insn::Mov(c.u8()?, c.u8()?),
            Opcode::Ldi => Insn::Ldi(c.u8()?, c.i64()?),
            Opcode::Ldk => Insn::Ldk(c.u8()?, c.u32()?),
            Opcode::Push => Insn::Push(c.u8()?, c.u8()?),
            Opcode::Pop => Insn::Pop(c.u8()?, c.u8()?),
            Opcode::Top => Insn::Top(c.u8()?, c.u8()?),
            Opcode::Ld => Insn::Ld(c.u8()?, c.u8()?, c.i32()?),
            Opcode::St => Insn::St(c.u8()?, c.u8()?, c.i32()?),
            Opcode::Addi => Insn::Addi(c.u8()?, c.u8()?, c.i32()?),
            Opcode::Cmp => Insn::Cmp(c.u8()?, c.u8()?),
            Opcode::Test => Insn::Test(c.u8()?),
            Opcode::Jmp => Insn::Jmp(c.rel()?),
            Opcode::Bz => Insn::Bz(c.rel()?),
            Opcode::Bnz => Insn::Bnz(c.rel()?),
            Opcode::Bl => Insn::Bl(c.rel()?),
            Opcode::Ret => Insn::Ret,
            Opcode::Enter => Insn::Enter(c.u16()?),
            Opcode::Leave => Insn::Leave(c.u16()?),
            Opcode::Get => Insn::Get(c.u8()?, c.u32()?),
            Opcode::Def => Insn::Def(c.u8()?, c.u32()?),
            Opcode::Set => Insn::Set(c.u8()?, c.u32()?),
            Opcode::Frame => Insn::Frame(c.u8()?),
            Opcode::Unframe => Insn::Unframe,
            Opcode::Bind => Insn::Bind(c.u32()?),
            Opcode::Prim => Insn::Prim(c.u8()?, c.u8()?, c.u8()?),
            Opcode::Call => Insn::Call(c.u8()?, c.u8()?, c.u8()?),
            Opcode::Clos => Insn::Clos(c.u8()?, c.u32()?, c.u32()?, c.u8()?),
        };

        Ok((insn, c.pos - at))
    }

    /// Renders operands; `at` turns relative targets into addresses
    fn render(&self, at: usize, ctx: Option<&Ctx>) -> String {
        let sym = |id: u32| match ctx.and_then(|c| c.symtab.lookup_by_id(id)) {
            Some(name) => name.to_string(),
            None => format!("#{}", id),
        };
        let r = reg_name;
        let mnem = self.opcode().mnemonic();

        let ops = match *self {
            Insn::Nop | Insn::Ret | Insn::Unframe => String::new(),
            Insn::Exit(a) | Insn::Test(a) | Insn::Frame(a) => r(a),
            Insn::Mov(a, b) | Insn::Push(a, b) | Insn::Pop(a, b) | Insn::Top(a, b) | Insn::Cmp(a, b) => {
                format!("{}, {}", r(a), r(b))
            }
            Insn::Ldi(a, i) => format!("{}, {}", r(a), i),
            Insn::Ldk(a, k) => match ctx.filter(|c| c.heap.try_get(Hndl(k)).is_some()) {
                Some(c) => format!("{}, {}", r(a), c.display(Hndl(k))),
                None => format!("{}, {}", r(a), Hndl(k)),
            },
            Insn::Get(a, s) | Insn::Def(a, s) | Insn::Set(a, s) => format!("{}, {}", r(a), sym(s)),
            Insn::Ld(a, b, off) | Insn::St(a, b, off) => format!("{}, [{}{:+}]", r(a), r(b), off),
            Insn::Addi(a, b, i) => format!("{}, {}, {}", r(a), r(b), i),
            Insn::Jmp(t) | Insn::Bz(t) | Insn::Bnz(t) | Insn::Bl(t) => match t {
                Target::Rel(rel) => {
                    let dest = at as i64 + self.width() as i64 + rel as i64;
                    format!("{:#06x}", dest)
                }
                Target::Block(b) => format!("B{}", b.0),
                Target::Label(l) => format!("L{}", l.0),
            },
            Insn::Enter(n) | Insn::Leave(n) => n.to_string(),
            Insn::Bind(s) => sym(s),
            Insn::Prim(a, id, n) => {
                let name = super::core::Prim::from_id(id).map_or("?", |p| p.name());
                format!("{}, {}, {}", r(a), name, n)
            }
            Insn::Call(a, f, n) => format!("{}, {}, {}", r(a), r(f), n),
            Insn::Clos(a, p, b, k) => {
                let kind = if k == CLOS_MACRO { "mac" } else { "fn" };
                format!("{}, {}, {}, {}", r(a), Hndl(p), Hndl(b), kind)
            }
        };

        if ops.is_empty() {
            mnem.to_string()
        } else {
            format!("{} {}", mnem, ops)
        }
    }
}

/// `clos` kind operand for functions
pub const CLOS_FUNC: u8 = 0;
/// `clos` kind operand for macros
pub const CLOS_MACRO: u8 = 1;

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(0, None))
    }
}

/// Role of a block in the graph, kept for diagnostics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Entry,
    Body,
    Branch,
    Join,
    Loop,
    Proc,
}

/// Ordered pseudo-instructions plus outgoing edges
#[derive(Debug)]
pub struct BasicBlock {
    pub kind: BlockKind,
    pub insns: Vec<Insn>,
    /// Explicit successors recorded while emitting branches
    pub succ: Vec<BlockId>,
    /// Block control falls into after the last instruction
    pub next: Option<BlockId>,
}

/// Assembled code, position independent
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub code: Vec<u8>,
    /// Offset of the first instruction to run
    pub entry: usize,
    /// Heap objects named by `ldk` and `clos`; GC roots while loaded
    pub literals: Vec<Hndl>,
}

/// Owner of a block graph under construction
#[derive(Debug, Default)]
pub struct Emitter {
    blocks: Vec<BasicBlock>,
    labels: Vec<Option<BlockId>>,
    literals: Vec<Hndl>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_basic_block(&mut self, kind: BlockKind) -> BlockId {
        self.blocks.push(BasicBlock {
            kind,
            insns: vec![],
            succ: vec![],
            next: None,
        });
        BlockId((self.blocks.len() - 1) as u32)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Appends an instruction, returning its index within the block
    pub fn emit(&mut self, id: BlockId, insn: Insn) -> usize {
        if let Some(Target::Block(to)) = insn.target() {
            self.link(id, to);
        }

        let b = &mut self.blocks[id.0 as usize];
        b.insns.push(insn);
        b.insns.len() - 1
    }

    /// Replaces an instruction emitted earlier, for operands known
    /// only after later code is generated
    pub fn set_insn(&mut self, id: BlockId, idx: usize, insn: Insn) {
        self.blocks[id.0 as usize].insns[idx] = insn;
    }

    pub fn link(&mut self, from: BlockId, to: BlockId) {
        let b = &mut self.blocks[from.0 as usize];
        if !b.succ.contains(&to) {
            b.succ.push(to);
        }
    }

    /// Sets the block `from` falls through to
    pub fn set_next(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0 as usize].next = Some(to);
        self.link(from, to);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    pub fn bind_label(&mut self, label: Label, block: BlockId) {
        self.labels[label.0 as usize] = Some(block);
    }

    /// Records a heap object referenced from code and returns its
    /// operand encoding
    pub fn literal(&mut self, h: Hndl) -> u32 {
        if !self.literals.contains(&h) {
            self.literals.push(h);
        }
        h.0
    }

    fn resolve(&self, t: Target) -> Result<Option<BlockId>, AsmError> {
        match t {
            Target::Block(b) if (b.0 as usize) < self.blocks.len() => Ok(Some(b)),
            Target::Block(b) => Err(AsmError::BadBlock(b.0)),
            Target::Label(l) => match self.labels.get(l.0 as usize) {
                Some(Some(b)) => Ok(Some(*b)),
                _ => Err(AsmError::UnboundLabel(l.0)),
            },
            Target::Rel(_) => Ok(None),
        }
    }

    /// Orders reachable blocks so that fall-through successors follow
    /// their predecessors wherever possible
    fn layout(&self, entry: BlockId) -> Result<Vec<BlockId>, AsmError> {
        let mut placed = vec![false; self.blocks.len()];
        let mut order = vec![];
        let mut stack = vec![entry];

        while let Some(start) = stack.pop() {
            let mut cur = Some(start);
            while let Some(id) = cur {
                let idx = id.0 as usize;
                if idx >= self.blocks.len() {
                    return Err(AsmError::BadBlock(id.0));
                }
                if placed[idx] {
                    break;
                }
                placed[idx] = true;
                order.push(id);

                let b = &self.blocks[idx];
                let mut out = b.succ.clone();
                for insn in &b.insns {
                    if let Some(to) = insn.target().map(|t| self.resolve(t)).transpose()?.flatten() {
                        out.push(to);
                    }
                }
                for to in out.into_iter().rev() {
                    if !placed[to.0 as usize] && Some(to) != b.next {
                        stack.push(to);
                    }
                }

                cur = b.next;
            }
        }

        Ok(order)
    }

    /// Lays out every block reachable from `entry` and encodes it,
    /// rewriting block and label references into relative offsets
    pub fn assemble(&self, entry: BlockId) -> Result<Program, AsmError> {
        let order = self.layout(entry)?;

        // pass one: addresses, counting implicit jumps for fall-through
        // edges broken by the layout
        let mut addr = vec![0usize; self.blocks.len()];
        let mut bridge = vec![None; self.blocks.len()];
        let mut pc = 0;
        for (i, id) in order.iter().enumerate() {
            let b = &self.blocks[id.0 as usize];
            addr[id.0 as usize] = pc;
            pc += b.insns.iter().map(Insn::width).sum::<usize>();

            if let Some(next) = b.next {
                if order.get(i + 1) != Some(&next) {
                    bridge[id.0 as usize] = Some(next);
                    pc += Opcode::Jmp.width();
                }
            }
        }

        // pass two: encoding
        let mut code = Vec::with_capacity(pc);
        let rel = |from: usize, width: usize, to: BlockId| -> Result<Target, AsmError> {
            let d = addr[to.0 as usize] as i64 - (from + width) as i64;
            i32::try_from(d)
                .map(Target::Rel)
                .map_err(|_| AsmError::DisplacementOverflow)
        };

        for id in &order {
            let b = &self.blocks[id.0 as usize];
            for insn in &b.insns {
                let here = code.len();
                let fixed = match insn.target() {
                    Some(t) => match self.resolve(t)? {
                        Some(to) => insn.with_target(rel(here, insn.width(), to)?),
                        None => *insn,
                    },
                    None => *insn,
                };
                fixed.encode(&mut code)?;
            }

            if let Some(next) = bridge[id.0 as usize] {
                let here = code.len();
                Insn::Jmp(rel(here, Opcode::Jmp.width(), next)?).encode(&mut code)?;
            }
        }

        if cfg!(feature = "memdbg") {
            log::debug!("assembled {} blocks into {} bytes", order.len(), code.len());
        }

        Ok(Program {
            code,
            entry: 0,
            literals: self.literals.clone(),
        })
    }
}

/// Textual listing of assembled code, one `addr: insn` line each
///
/// Symbols and literals are named when a context is supplied. Bytes
/// that fail to decode end the listing with a marker line.
pub fn disassemble(code: &[u8], ctx: Option<&Ctx>) -> String {
    let mut out = String::new();
    let mut at = 0;

    while at < code.len() {
        match Insn::decode(code, at) {
            Ok((insn, len)) => {
                let _ = writeln!(out, "{:04x}: {}", at, insn.render(at, ctx));
                at += len;
            }
            Err(e) => {
                let _ = writeln!(out, "{:04x}: ?? ({})", at, e);
                break;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_match_encoding() {
        let samples = [
            Insn::Nop,
            Insn::Exit(R0),
            Insn::Mov(1, 2),
            Insn::Ldi(3, -40),
            Insn::Ldk(4, 77),
            Insn::Push(SP, 5),
            Insn::Pop(5, SP),
            Insn::Top(6, EP),
            Insn::Ld(1, FP, -16),
            Insn::St(1, FP, -8),
            Insn::Addi(2, 2, 1),
            Insn::Cmp(1, 2),
            Insn::Test(1),
            Insn::Jmp(Target::Rel(-5)),
            Insn::Bz(Target::Rel(12)),
            Insn::Bnz(Target::Rel(0)),
            Insn::Bl(Target::Rel(100)),
            Insn::Ret,
            Insn::Enter(3),
            Insn::Leave(3),
            Insn::Get(1, 9),
            Insn::Def(1, 9),
            Insn::Set(1, 9),
            Insn::Frame(2),
            Insn::Unframe,
            Insn::Bind(9),
            Insn::Prim(1, 18, 2),
            Insn::Call(1, 2, 3),
            Insn::Clos(1, 10, 11, CLOS_MACRO),
        ];

        for insn in samples {
            let mut buf = vec![];
            insn.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), insn.width(), "{}", insn);
            assert_eq!(Insn::decode(&buf, 0), Ok((insn, buf.len())));
        }
    }

    #[test]
    fn decode_errors() {
        assert_eq!(
            Insn::decode(&[0xff], 0),
            Err(DecodeError::InvalidOpcode { byte: 0xff, at: 0 })
        );
        assert_eq!(
            Insn::decode(&[Opcode::Ldi as u8, 1, 2], 0),
            Err(DecodeError::Truncated { at: 0 })
        );
    }

    #[test]
    fn unresolved_targets_do_not_encode() {
        let mut buf = vec![];
        let mut em = Emitter::new();
        let b = em.make_basic_block(BlockKind::Body);
        assert_eq!(Insn::Jmp(Target::Block(b)).encode(&mut buf), Err(AsmError::BadBlock(0)));
    }

    #[test]
    fn assembles_branches() {
        let mut em = Emitter::new();
        let entry = em.make_basic_block(BlockKind::Entry);
        let then = em.make_basic_block(BlockKind::Branch);
        let join = em.make_basic_block(BlockKind::Join);
        let done = em.new_label();

        em.emit(entry, Insn::Ldi(1, 0));
        em.emit(entry, Insn::Test(1));
        em.emit(entry, Insn::Bz(Target::Label(done)));
        em.set_next(entry, then);

        em.emit(then, Insn::Ldi(1, 5));
        em.set_next(then, join);

        em.bind_label(done, join);
        em.emit(join, Insn::Exit(1));

        let prog = em.assemble(entry).unwrap();
        let text = disassemble(&prog.code, None);
        assert_eq!(
            text,
            "0000: ldi r1, 0\n\
             000a: test r1\n\
             000c: bz 0x001b\n\
             0011: ldi r1, 5\n\
             001b: exit r1\n"
        );
    }

    #[test]
    fn bridges_broken_fallthrough() {
        let mut em = Emitter::new();
        let entry = em.make_basic_block(BlockKind::Entry);
        let far = em.make_basic_block(BlockKind::Body);
        let near = em.make_basic_block(BlockKind::Body);

        // near follows entry, so far needs a jump back to it
        em.emit(entry, Insn::Bnz(Target::Block(far)));
        em.set_next(entry, near);
        em.emit(near, Insn::Exit(R0));
        em.emit(far, Insn::Nop);
        em.set_next(far, near);

        let prog = em.assemble(entry).unwrap();
        let text = disassemble(&prog.code, None);
        assert_eq!(text, "0000: bnz 0x0007\n0005: exit r0\n0007: nop\n0008: jmp 0x0005\n");
    }

    #[test]
    fn unbound_labels_fail() {
        let mut em = Emitter::new();
        let entry = em.make_basic_block(BlockKind::Entry);
        let l = em.new_label();
        em.emit(entry, Insn::Jmp(Target::Label(l)));
        assert_eq!(em.assemble(entry).unwrap_err(), AsmError::UnboundLabel(0));
    }

    #[test]
    fn unreachable_blocks_are_dropped() {
        let mut em = Emitter::new();
        let entry = em.make_basic_block(BlockKind::Entry);
        let dead = em.make_basic_block(BlockKind::Body);
        em.emit(entry, Insn::Exit(R0));
        em.emit(dead, Insn::Nop);
        assert_eq!(em.assemble(entry).unwrap().code.len(), 2);
    }

    #[test]
    fn disassembly_is_deterministic() {
        let mut em = Emitter::new();
        let entry = em.make_basic_block(BlockKind::Entry);
        em.emit(entry, Insn::Enter(2));
        em.emit(entry, Insn::St(3, FP, -8));
        em.emit(entry, Insn::Prim(R0, crate::script::Prim::Add.id(), 2));
        em.emit(entry, Insn::Leave(2));
        em.emit(entry, Insn::Ret);

        let prog = em.assemble(entry).unwrap();
        let a = disassemble(&prog.code, None);
        assert_eq!(a, disassemble(&prog.code, None));
        assert_eq!(
            a,
            "0000: enter 2\n0003: st r3, [fp-8]\n000a: prim r0, +, 2\n000e: leave 2\n0011: ret\n"
        );
    }

    #[test]
    fn truncated_listing() {
        let text = disassemble(&[Opcode::Nop as u8, 0xee], None);
        assert_eq!(text, "0000: nop\n0001: ?? (invalid opcode 0xee at 0x1)\n");
    }
}
