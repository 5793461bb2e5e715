// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/core.rs

// Core object model for the scripting runtime. Defines heap handles,
// the tagged cell type every script value is stored as, and the
// closed set of primitive operations built into the language.

// <>

use std::collections::HashMap;
use std::fmt;

use super::symtab::SymId;

/// Identity of a cell in the context heap
///
/// A handle is an index into the cell array, so it stays valid across
/// heap growth; it is only invalidated by a collection that finds the
/// cell unreachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hndl(pub(crate) u32);

impl Hndl {
    /// Heap index of this handle
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Word representation used in VM registers and memory areas
    #[inline(always)]
    pub fn to_word(self) -> u64 {
        self.0 as u64
    }

    /// Reinterprets a VM word as a handle; range is checked by the heap
    #[inline(always)]
    pub fn from_word(word: u64) -> Option<Self> {
        u32::try_from(word).ok().map(Hndl)
    }
}

impl fmt::Display for Hndl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// The empty list; always the first cell of a heap
pub const NIL: Hndl = Hndl(0);
/// Canonical true cell
pub const TRUE: Hndl = Hndl(1);
/// Canonical false cell
pub const FALSE: Hndl = Hndl(2);

/// Parameters, body and captured environment of a closure or macro
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Closure {
    pub params: Hndl,
    pub body: Hndl,
    pub env: Hndl,
}

/// One binding layer of an environment chain
#[derive(Debug, Default)]
pub struct Frame {
    pub parent: Option<Hndl>,
    pub vars: HashMap<SymId, Hndl>,
}

/// Payload of an error object
#[derive(Debug)]
pub struct ErrObj {
    pub message: Box<str>,
    /// List of active call expressions, innermost first
    pub backtrace: Hndl,
}

/// A tagged heap cell; every script value is one of these
#[derive(Debug)]
pub enum Obj {
    Pair(Hndl, Hndl),
    /// Reclaimed cell; links to the next free cell
    Free(Option<Hndl>),
    Nil,
    Fixnum(i64),
    Flonum(f64),
    Symbol(SymId),
    String(Box<str>),
    Func(Closure),
    Macro(Closure),
    Prim(Prim),
    /// Index into the context's native callback table
    CFunc(u32),
    /// Opaque host pointer, managed through the context handlers
    Ptr(usize),
    Bool(bool),
    Keyword(SymId),
    /// Index into the context's foreign prototype table
    Proto(u32),
    Error(ErrObj),
    Env(Frame),
}

/// Fieldless discriminant of an [`Obj`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Pair,
    Free,
    Nil,
    Fixnum,
    Flonum,
    Symbol,
    String,
    Func,
    Macro,
    Prim,
    CFunc,
    Ptr,
    Bool,
    Keyword,
    Proto,
    Error,
    Env,
}

impl Obj {
    pub fn kind(&self) -> Kind {
        match self {
            Obj::Pair(..) => Kind::Pair,
            Obj::Free(_) => Kind::Free,
            Obj::Nil => Kind::Nil,
            Obj::Fixnum(_) => Kind::Fixnum,
            Obj::Flonum(_) => Kind::Flonum,
            Obj::Symbol(_) => Kind::Symbol,
            Obj::String(_) => Kind::String,
            Obj::Func(_) => Kind::Func,
            Obj::Macro(_) => Kind::Macro,
            Obj::Prim(_) => Kind::Prim,
            Obj::CFunc(_) => Kind::CFunc,
            Obj::Ptr(_) => Kind::Ptr,
            Obj::Bool(_) => Kind::Bool,
            Obj::Keyword(_) => Kind::Keyword,
            Obj::Proto(_) => Kind::Proto,
            Obj::Error(_) => Kind::Error,
            Obj::Env(_) => Kind::Env,
        }
    }

    /// Calls `f` with every handle this cell keeps alive
    pub fn each_child(&self, mut f: impl FnMut(Hndl)) {
        match self {
            Obj::Pair(car, cdr) => {
                f(*car);
                f(*cdr);
            }
            Obj::Func(c) | Obj::Macro(c) => {
                f(c.params);
                f(c.body);
                f(c.env);
            }
            Obj::Error(e) => f(e.backtrace),
            Obj::Env(frame) => {
                if let Some(p) = frame.parent {
                    f(p);
                }
                frame.vars.values().for_each(|v| f(*v));
            }
            _ => {}
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Pair => "pair",
            Kind::Free => "free",
            Kind::Nil => "nil",
            Kind::Fixnum => "fixnum",
            Kind::Flonum => "flonum",
            Kind::Symbol => "symbol",
            Kind::String => "string",
            Kind::Func => "func",
            Kind::Macro => "macro",
            Kind::Prim => "prim",
            Kind::CFunc => "cfunc",
            Kind::Ptr => "ptr",
            Kind::Bool => "boolean",
            Kind::Keyword => "keyword",
            Kind::Proto => "proto",
            Kind::Error => "error",
            Kind::Env => "environment",
        };
        write!(f, "{}", name)
    }
}

macro_rules! prim_table {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $( $vname:ident = $text:literal, )*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $( $vname, )*
        }

        impl $name {
            /// Every primitive, in table order
            pub const ALL: &'static [$name] = &[$( $name::$vname, )*];

            /// Name the primitive is bound to in the global environment
            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$vname => $text, )*
                }
            }

            /// Stable numeric identifier used in bytecode
            pub fn id(self) -> u8 {
                self as u8
            }

            pub fn from_id(id: u8) -> Option<Self> {
                Self::ALL.get(id as usize).copied()
            }
        }
    };
}

prim_table! {
    /// Operations implemented directly by the runtime
    ///
    /// The forms up to `Or` are special: they receive their argument
    /// forms unevaluated. All later entries are plain built-ins that
    /// receive evaluated arguments.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[repr(u8)]
    pub enum Prim {
        Quote = "quote",
        Quasi = "quasiquote",
        Unquote = "unquote",
        Splice = "unquote-splicing",
        If = "if",
        Do = "do",
        Begin = "begin",
        Let = "let",
        Define = "define",
        Def = "def",
        Set = "set!",
        Fn = "fn",
        Lambda = "lambda",
        Mac = "mac",
        Macro = "macro",
        While = "while",
        And = "and",
        Or = "or",
        Cons = "cons",
        Car = "car",
        Cdr = "cdr",
        SetCar = "setcar",
        SetCdr = "setcdr",
        List = "list",
        Append = "append",
        Not = "not",
        Is = "is",
        EqP = "eq?",
        AtomP = "atom?",
        NilP = "nil?",
        Add = "+",
        Sub = "-",
        Mul = "*",
        Div = "/",
        Mod = "mod",
        Lt = "<",
        Le = "<=",
        Gt = ">",
        Ge = ">=",
        NumEq = "=",
        Print = "print",
    }
}

impl Prim {
    /// True for forms whose arguments are passed unevaluated
    pub fn special_p(self) -> bool {
        (self as u8) <= (Prim::Or as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prim_ids_round_trip() {
        for p in Prim::ALL {
            assert_eq!(Prim::from_id(p.id()), Some(*p));
        }
        assert_eq!(Prim::from_id(200), None);
        assert_eq!(Prim::Add.name(), "+");
    }

    #[test]
    fn special_split() {
        assert!(Prim::Quote.special_p());
        assert!(Prim::Or.special_p());
        assert!(!Prim::Cons.special_p());
        assert!(!Prim::Print.special_p());
    }

    #[test]
    fn children() {
        let mut seen = vec![];
        Obj::Pair(Hndl(5), Hndl(6)).each_child(|h| seen.push(h));
        assert_eq!(seen, vec![Hndl(5), Hndl(6)]);

        seen.clear();
        Obj::Fixnum(3).each_child(|h| seen.push(h));
        assert!(seen.is_empty());
    }
}
