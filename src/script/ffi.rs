// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/ffi.rs

// Boundary to foreign procedures. The runtime knows a prototype only
// by its name, return type and parameter descriptors; marshalling to
// a native calling convention belongs to whoever implements it.

// <>

use std::fmt;
use std::rc::Rc;

use super::core::{Hndl, Obj};
use super::{Ctx, EvalResult};

/// Coarse value classes a foreign parameter or result can take
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeClass {
    Void = 0,
    Int = 1,
    Float = 2,
    Pointer = 3,
    String = 4,
    /// Any script value, passed through untouched
    Object = 5,
}

pub const INT_LEN: u8 = 8;
pub const FLOAT_LEN: u8 = 8;
pub const PTR_LEN: u8 = 8;

/// Class and width in bytes of one foreign value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeDesc {
    pub class: TypeClass,
    pub size: u8,
}

/// Default value for an omitted argument, materialised per call
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Box<str>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: Box<str>,
    pub ty: TypeDesc,
    pub default: Option<Literal>,
    /// Collects all remaining arguments into a list; only valid last
    pub rest: bool,
}

impl Param {
    pub fn new(name: &str, class: TypeClass, size: u8) -> Self {
        Self {
            name: name.into(),
            ty: TypeDesc { class, size },
            default: None,
            rest: false,
        }
    }

    pub fn with_default(mut self, lit: Literal) -> Self {
        self.default = Some(lit);
        self
    }

    pub fn rest(mut self) -> Self {
        self.rest = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FfiError {
    Marshal { param: String, reason: String },
    MissingSymbol(String),
    Arity { expected: String, got: usize },
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiError::Marshal { param, reason } => write!(f, "cannot marshal {}: {}", param, reason),
            FfiError::MissingSymbol(s) => write!(f, "native symbol {} not found", s),
            FfiError::Arity { expected, got } => write!(f, "expected {} arguments, got {}", expected, got),
        }
    }
}

impl std::error::Error for FfiError {}

/// A foreign procedure as the runtime sees it
pub trait Proto {
    fn name(&self) -> &str;
    fn ret(&self) -> TypeDesc;
    fn params(&self) -> &[Param];
    /// Invokes the procedure with one argument per parameter, rest
    /// arguments already packed into a list
    fn call(&self, ctx: &mut Ctx, args: &[Hndl]) -> Result<Hndl, FfiError>;
}

/// Wraps a prototype as a callable heap object
///
/// The prototype table only grows; collecting the returned cell does
/// not release its slot, so wrap once per prototype and keep the cell.
pub fn wrap(ctx: &mut Ctx, proto: Rc<dyn Proto>) -> Hndl {
    let id = ctx.proto_push(proto);
    ctx.alloc(Obj::Proto(id))
}

/// Wraps a prototype and binds it globally under its own name
pub fn define_proto(ctx: &mut Ctx, proto: Rc<dyn Proto>) -> Hndl {
    let name = proto.name().to_string();
    let cell = wrap(ctx, proto);
    ctx.define_global(&name, cell);
    cell
}

/// Fewest and most arguments a prototype accepts; no upper bound when
/// it takes rest arguments
pub fn arity(proto: &dyn Proto) -> (usize, Option<usize>) {
    let params = proto.params();
    let fixed = params.iter().filter(|p| !p.rest).count();
    let required = params.iter().filter(|p| !p.rest && p.default.is_none()).count();
    let max = (!params.iter().any(|p| p.rest)).then_some(fixed);
    (required, max)
}

fn materialise(ctx: &mut Ctx, lit: &Literal) -> Hndl {
    match lit {
        Literal::Nil => super::NIL,
        Literal::Bool(b) => ctx.boolean(*b),
        Literal::Int(n) => ctx.fixnum(*n),
        Literal::Float(x) => ctx.flonum(*x),
        Literal::Str(s) => ctx.string(s),
    }
}

fn check(ctx: &Ctx, p: &Param, arg: Hndl) -> Result<(), FfiError> {
    let ok = match (p.ty.class, ctx.obj(arg)) {
        (TypeClass::Object, _) => true,
        (TypeClass::Void, _) => false,
        (TypeClass::Int, Obj::Fixnum(_)) => true,
        (TypeClass::Float, Obj::Fixnum(_) | Obj::Flonum(_)) => true,
        (TypeClass::Pointer, Obj::Ptr(_) | Obj::Nil) => true,
        (TypeClass::String, Obj::String(_)) => true,
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(FfiError::Marshal {
            param: p.name.to_string(),
            reason: format!("{:?} parameter given {}", p.ty.class, ctx.kind(arg)),
        })
    }
}

/// Lines up call arguments with parameters: fills defaults, packs
/// rest arguments and checks classes
fn prepare(ctx: &mut Ctx, proto: &dyn Proto, argv: &[Hndl]) -> Result<Vec<Hndl>, FfiError> {
    let (min, max) = arity(proto);
    if argv.len() < min || max.map_or(false, |m| argv.len() > m) {
        let expected = match max {
            Some(m) if m == min => min.to_string(),
            Some(m) => format!("{} to {}", min, m),
            None => format!("at least {}", min),
        };
        return Err(FfiError::Arity {
            expected,
            got: argv.len(),
        });
    }

    let mut args = Vec::with_capacity(proto.params().len());
    let mut rest = argv.iter();

    for p in proto.params() {
        if p.rest {
            let tail: Vec<Hndl> = rest.by_ref().copied().collect();
            for a in &tail {
                check(ctx, p, *a)?;
            }
            args.push(ctx.list(&tail));
            continue;
        }

        let arg = match (rest.next(), &p.default) {
            (Some(a), _) => *a,
            (None, Some(lit)) => materialise(ctx, lit),
            (None, None) => {
                return Err(FfiError::Arity {
                    expected: min.to_string(),
                    got: argv.len(),
                })
            }
        };
        check(ctx, p, arg)?;
        args.push(arg);
    }

    Ok(args)
}

/// Invokes a wrapped prototype, turning failures into error objects
pub(crate) fn call_proto(ctx: &mut Ctx, id: u32, argv: &[Hndl]) -> EvalResult {
    let Some(proto) = ctx.proto(id) else {
        return Err(ctx.error("call to unknown foreign prototype"));
    };

    let out = prepare(ctx, &*proto, argv).and_then(|args| {
        let base = ctx.save_gc();
        for a in &args {
            ctx.push_gc(*a);
        }
        let r = proto.call(ctx, &args);
        ctx.restore_gc(base);
        r
    });

    out.map_err(|e| {
        if cfg!(feature = "stkdbg") {
            log::trace!("foreign call {} failed: {:?}", proto.name(), e);
        }
        let msg = format!("{}: {}", proto.name(), e);
        ctx.error(&msg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compile::run_source;
    use crate::script::EvalStatus;

    struct Scale {
        params: Vec<Param>,
    }

    impl Proto for Scale {
        fn name(&self) -> &str {
            "scale"
        }

        fn ret(&self) -> TypeDesc {
            TypeDesc {
                class: TypeClass::Int,
                size: INT_LEN,
            }
        }

        fn params(&self) -> &[Param] {
            &self.params
        }

        fn call(&self, ctx: &mut Ctx, args: &[Hndl]) -> Result<Hndl, FfiError> {
            let n = ctx.fixnum_get(args[0]).unwrap_or(0);
            let k = ctx.fixnum_get(args[1]).unwrap_or(0);
            let extra = ctx.list_to_vec(args[2]).map_or(0, |v| v.len() as i64);
            Ok(ctx.fixnum(n * k + extra))
        }
    }

    struct Unlinked;

    impl Proto for Unlinked {
        fn name(&self) -> &str {
            "unlinked"
        }

        fn ret(&self) -> TypeDesc {
            TypeDesc {
                class: TypeClass::Void,
                size: 0,
            }
        }

        fn params(&self) -> &[Param] {
            &[]
        }

        fn call(&self, _: &mut Ctx, _: &[Hndl]) -> Result<Hndl, FfiError> {
            Err(FfiError::MissingSymbol("unlinked_fn".into()))
        }
    }

    fn setup() -> Ctx {
        let mut ctx = Ctx::default();
        let scale = Scale {
            params: vec![
                Param::new("n", TypeClass::Int, INT_LEN),
                Param::new("k", TypeClass::Int, INT_LEN).with_default(Literal::Int(10)),
                Param::new("more", TypeClass::Object, PTR_LEN).rest(),
            ],
        };
        define_proto(&mut ctx, Rc::new(scale));
        define_proto(&mut ctx, Rc::new(Unlinked));
        ctx
    }

    fn eval(ctx: &mut Ctx, code: &str) -> String {
        let (val, status) = ctx.eval_source(code.as_bytes());
        match status {
            EvalStatus::Ok => ctx.display(val).to_string(),
            EvalStatus::Error => format!("error: {}", ctx.error_message(val).unwrap_or("?")),
        }
    }

    #[test]
    fn defaults_and_rest() {
        let mut ctx = setup();
        assert_eq!(eval(&mut ctx, "(scale 4)"), "40");
        assert_eq!(eval(&mut ctx, "(scale 4 2)"), "8");
        assert_eq!(eval(&mut ctx, "(scale 4 2 'a 'b)"), "10");
        assert_eq!(eval(&mut ctx, "scale"), "<proto scale>");
    }

    #[test]
    fn failures_become_errors() {
        let mut ctx = setup();
        assert_eq!(
            eval(&mut ctx, "(scale)"),
            "error: scale: expected at least 1 arguments, got 0"
        );
        assert_eq!(
            eval(&mut ctx, "(scale \"x\")"),
            "error: scale: cannot marshal n: Int parameter given string"
        );
        assert_eq!(
            eval(&mut ctx, "(unlinked)"),
            "error: unlinked: native symbol unlinked_fn not found"
        );
        assert_eq!(
            eval(&mut ctx, "(unlinked 1)"),
            "error: unlinked: expected 0 arguments, got 1"
        );
    }

    #[test]
    fn arity_ranges() {
        let ctx = setup();
        let scale = ctx.proto(0).unwrap();
        assert_eq!(arity(&*scale), (1, None));
        assert_eq!(scale.ret().class, TypeClass::Int);

        let unlinked = ctx.proto(1).unwrap();
        assert_eq!(arity(&*unlinked), (0, Some(0)));
    }

    #[test]
    fn compiled_calls() {
        let mut ctx = setup();
        let val = run_source(&mut ctx, b"(scale 3 3 nil)", |_, _| ()).unwrap();
        assert_eq!(ctx.fixnum_get(val), Some(10));

        let err = run_source(&mut ctx, b"(unlinked)", |_, _| ()).unwrap_err();
        assert_eq!(err, "unlinked: native symbol unlinked_fn not found");
    }
}
