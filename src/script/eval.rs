// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/eval.rs

// Recursive tree-walking evaluator. Dispatches on the head of each
// call: special forms see raw argument forms, built-ins and natives
// see evaluated arguments, closures get a fresh frame over their
// captured environment, and macros expand before evaluation.

// <>

use super::core::{Closure, Hndl, Obj, Prim, NIL, TRUE};
use super::{ffi, Ctx, EvalResult};

/// Numeric operand, promoted to float when either side is a float
#[derive(Clone, Copy, Debug)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

impl Ctx {
    /// Evaluates an expression, returning either its value or an
    /// error object
    pub fn eval(&mut self, expr: Hndl, env: Hndl) -> Hndl {
        match self.eval_in(expr, env) {
            Ok(v) | Err(v) => v,
        }
    }

    pub(crate) fn eval_in(&mut self, expr: Hndl, env: Hndl) -> EvalResult {
        match self.obj(expr) {
            Obj::Symbol(_) => self.env_get(env, expr),
            Obj::Pair(head, args) => {
                let (head, args) = (*head, *args);
                self.eval_call(expr, head, args, env)
            }
            _ => Ok(expr),
        }
    }

    /// Tracks the call on the call list and depth counter around
    /// dispatch
    fn eval_call(&mut self, expr: Hndl, head: Hndl, args: Hndl, env: Hndl) -> EvalResult {
        if self.depth >= self.config().max_depth {
            return Err(self.error("maximum evaluation depth exceeded"));
        }

        if cfg!(feature = "stkdbg") {
            log::trace!("eval depth {}: {}", self.depth, self.display(expr));
        }

        let base = self.save_gc();
        self.depth += 1;
        self.call_push(expr);

        let out = self.dispatch(head, args, env);

        self.call_pop();
        self.depth -= 1;
        self.restore_gc(base);
        out
    }

    fn dispatch(&mut self, head: Hndl, args: Hndl, env: Hndl) -> EvalResult {
        let f = self.eval_in(head, env)?;
        self.push_gc(f);

        match self.obj(f) {
            Obj::Prim(p) if p.special_p() => {
                let p = *p;
                self.eval_special(p, args, env)
            }
            Obj::Macro(c) => {
                let c = *c;
                let expansion = self.expand_with(c, args)?;
                self.push_gc(expansion);
                self.eval_in(expansion, env)
            }
            Obj::Prim(_) | Obj::CFunc(_) | Obj::Func(_) | Obj::Proto(_) => {
                let argv = self.eval_args(args, env)?;
                self.apply(f, &argv)
            }
            other => {
                let msg = format!("cannot call {}", other.kind());
                Err(self.error(&msg))
            }
        }
    }

    /// Evaluates each element of an argument list, protecting results
    fn eval_args(&mut self, mut args: Hndl, env: Hndl) -> Result<Vec<Hndl>, Hndl> {
        let mut out = vec![];
        loop {
            match self.obj(args) {
                Obj::Nil => return Ok(out),
                Obj::Pair(a, d) => {
                    let (a, d) = (*a, *d);
                    let v = self.eval_in(a, env)?;
                    self.push_gc(v);
                    out.push(v);
                    args = d;
                }
                _ => return Err(self.error("improper argument list")),
            }
        }
    }

    /// Applies a callable to already-evaluated arguments
    pub fn apply(&mut self, f: Hndl, argv: &[Hndl]) -> EvalResult {
        match self.obj(f) {
            Obj::Prim(p) if !p.special_p() => {
                let p = *p;
                self.call_builtin(p, argv)
            }
            Obj::CFunc(id) => {
                let id = *id;
                self.call_cfunc(id, argv)
            }
            Obj::Func(c) => {
                let c = *c;
                self.apply_closure(c, argv)
            }
            Obj::Proto(id) => {
                let id = *id;
                ffi::call_proto(self, id, argv)
            }
            other => {
                let msg = format!("cannot apply {}", other.kind());
                Err(self.error(&msg))
            }
        }
    }

    fn call_cfunc(&mut self, id: u32, argv: &[Hndl]) -> EvalResult {
        let Some(cf) = self.cfunc(id).cloned() else {
            return Err(self.error("dangling native callback"));
        };

        if let Some(n) = cf.argct {
            if argv.len() != n as usize {
                let msg = format!("{}: expected {} arguments, got {}", cf.name, n, argv.len());
                return Err(self.error(&msg));
            }
        }

        (cf.body)(self, argv)
    }

    /// Runs a closure body in a new frame over its captured environment
    pub(crate) fn apply_closure(&mut self, c: Closure, argv: &[Hndl]) -> EvalResult {
        let frame = self.make_environment(Some(c.env));
        self.push_gc(frame);
        self.bind_params(frame, c.params, argv)?;
        self.eval_body(c.body, frame)
    }

    /// Binds arguments against a proper, dotted or lone-symbol
    /// parameter list
    pub(crate) fn bind_params(&mut self, frame: Hndl, params: Hndl, argv: &[Hndl]) -> Result<(), Hndl> {
        let mut p = params;
        let mut i = 0;

        loop {
            match self.obj(p) {
                Obj::Nil => {
                    if i < argv.len() {
                        let msg = format!("too many arguments: expected {}, got {}", i, argv.len());
                        return Err(self.error(&msg));
                    }
                    return Ok(());
                }
                Obj::Symbol(_) => {
                    let rest = self.list(&argv[i.min(argv.len())..]);
                    return self.env_define(frame, p, rest);
                }
                Obj::Pair(sym, next) => {
                    let (sym, next) = (*sym, *next);
                    let Some(arg) = argv.get(i) else {
                        let msg = format!("too few arguments: got {}", argv.len());
                        return Err(self.error(&msg));
                    };
                    self.env_define(frame, sym, *arg)?;
                    i += 1;
                    p = next;
                }
                _ => return Err(self.error("malformed parameter list")),
            }
        }
    }

    /// Evaluates a list of expressions, yielding the last value
    pub(crate) fn eval_body(&mut self, mut body: Hndl, env: Hndl) -> EvalResult {
        let mut last = NIL;
        while let Some((expr, rest)) = self.pair(body) {
            last = self.eval_in(expr, env)?;
            body = rest;
        }
        Ok(last)
    }

    /// Expands one macro call form without evaluating the result
    pub fn macroexpand(&mut self, mac: Hndl, args: Hndl) -> EvalResult {
        match self.obj(mac) {
            Obj::Macro(c) => {
                let c = *c;
                self.expand_with(c, args)
            }
            other => {
                let msg = format!("cannot expand {}", other.kind());
                Err(self.error(&msg))
            }
        }
    }

    fn expand_with(&mut self, c: Closure, args: Hndl) -> EvalResult {
        let Some(argv) = self.list_to_vec(args) else {
            return Err(self.error("improper macro argument list"));
        };
        self.apply_closure(c, &argv)
    }

    // special forms

    fn form_args(&mut self, p: Prim, args: Hndl, min: usize, max: Option<usize>) -> Result<Vec<Hndl>, Hndl> {
        let Some(argv) = self.list_to_vec(args) else {
            let msg = format!("{}: improper form", p.name());
            return Err(self.error(&msg));
        };

        if argv.len() < min || max.map_or(false, |m| argv.len() > m) {
            let msg = format!("{}: wrong number of forms ({})", p.name(), argv.len());
            return Err(self.error(&msg));
        }

        Ok(argv)
    }

    /// Checks that a parameter list has one of the accepted shapes
    pub(crate) fn check_params(&mut self, mut params: Hndl) -> Result<(), Hndl> {
        loop {
            match self.obj(params) {
                Obj::Nil | Obj::Symbol(_) => return Ok(()),
                Obj::Pair(s, rest) if self.sym_id(*s).is_some() => params = *rest,
                _ => return Err(self.error("malformed parameter list")),
            }
        }
    }

    fn make_closure(&mut self, p: Prim, params: Hndl, body: Hndl, env: Hndl) -> EvalResult {
        self.check_params(params)?;
        let c = Closure { params, body, env };
        Ok(match p {
            Prim::Mac | Prim::Macro => self.alloc(Obj::Macro(c)),
            _ => self.alloc(Obj::Func(c)),
        })
    }

    fn eval_special(&mut self, p: Prim, args: Hndl, env: Hndl) -> EvalResult {
        match p {
            Prim::Quote => {
                let argv = self.form_args(p, args, 1, Some(1))?;
                Ok(argv[0])
            }
            Prim::Quasi => {
                let argv = self.form_args(p, args, 1, Some(1))?;
                let expr = self.quasi_expand(argv[0], 1)?;
                self.push_gc(expr);
                self.eval_in(expr, env)
            }
            Prim::Unquote | Prim::Splice => {
                let msg = format!("{} outside quasiquote", p.name());
                Err(self.error(&msg))
            }
            Prim::If => {
                let mut rest = args;
                loop {
                    match self.pair(rest) {
                        None => return Ok(NIL),
                        Some((cond, more)) => match self.pair(more) {
                            // trailing else branch
                            None => return self.eval_in(cond, env),
                            Some((then, next)) => {
                                let c = self.eval_in(cond, env)?;
                                if self.truthy(c) {
                                    return self.eval_in(then, env);
                                }
                                rest = next;
                            }
                        },
                    }
                }
            }
            Prim::Do | Prim::Begin => self.eval_body(args, env),
            Prim::Let | Prim::Define | Prim::Def => {
                let argv = self.form_args(p, args, 1, None)?;
                match self.pair(argv[0]) {
                    // (define (name . params) body...)
                    Some((name, params)) => {
                        let body = self.cdr(args);
                        let f = self.make_closure(Prim::Fn, params, body, env)?;
                        self.env_define(env, name, f)?;
                        Ok(f)
                    }
                    None => {
                        if argv.len() > 2 {
                            let msg = format!("{}: wrong number of forms ({})", p.name(), argv.len());
                            return Err(self.error(&msg));
                        }
                        let val = match argv.get(1) {
                            Some(e) => self.eval_in(*e, env)?,
                            None => NIL,
                        };
                        self.env_define(env, argv[0], val)?;
                        Ok(val)
                    }
                }
            }
            Prim::Set => {
                let argv = self.form_args(p, args, 2, Some(2))?;
                let val = self.eval_in(argv[1], env)?;
                self.env_set(env, argv[0], val)?;
                Ok(val)
            }
            Prim::Fn | Prim::Lambda | Prim::Mac | Prim::Macro => {
                let argv = self.form_args(p, args, 1, None)?;
                let body = self.cdr(args);
                self.make_closure(p, argv[0], body, env)
            }
            Prim::While => {
                let argv = self.form_args(p, args, 1, None)?;
                let body = self.cdr(args);
                let base = self.save_gc();
                loop {
                    self.restore_gc(base);
                    let c = self.eval_in(argv[0], env)?;
                    if !self.truthy(c) {
                        return Ok(NIL);
                    }
                    self.eval_body(body, env)?;
                }
            }
            Prim::And => {
                let mut last = TRUE;
                let mut rest = args;
                while let Some((e, more)) = self.pair(rest) {
                    last = self.eval_in(e, env)?;
                    if !self.truthy(last) {
                        return Ok(last);
                    }
                    rest = more;
                }
                Ok(last)
            }
            Prim::Or => {
                let mut rest = args;
                while let Some((e, more)) = self.pair(rest) {
                    let v = self.eval_in(e, env)?;
                    if self.truthy(v) {
                        return Ok(v);
                    }
                    rest = more;
                }
                Ok(NIL)
            }
            _ => {
                let msg = format!("{} is not a special form", p.name());
                Err(self.error(&msg))
            }
        }
    }

    // quasiquote

    fn prim_cell(&mut self, p: Prim) -> Hndl {
        self.alloc(Obj::Prim(p))
    }

    fn quote_form(&mut self, x: Hndl) -> Hndl {
        let q = self.prim_cell(Prim::Quote);
        self.list(&[q, x])
    }

    /// Whether `x` is a two-element form headed by the symbol `name`
    fn tagged(&self, x: Hndl, name: &str) -> Option<Hndl> {
        let (head, rest) = self.pair(x)?;
        let id = self.sym_id(head)?;
        if self.symtab.lookup_by_id(id)? != name {
            return None;
        }
        let (arg, tail) = self.pair(rest)?;
        self.nil_p(tail).then_some(arg)
    }

    /// Rewrites a quasiquote template into plain construction code
    ///
    /// The expansion names primitives by their cells rather than by
    /// symbol, so it means the same thing in any environment; both the
    /// evaluator and the compiler consume it.
    pub fn quasi_expand(&mut self, tmpl: Hndl, depth: usize) -> EvalResult {
        if let Some(x) = self.tagged(tmpl, "unquote") {
            if depth == 1 {
                return Ok(x);
            }
            let inner = self.quasi_expand(x, depth - 1)?;
            return self.rewrap("unquote", inner);
        }

        if let Some(x) = self.tagged(tmpl, "quasiquote") {
            let inner = self.quasi_expand(x, depth + 1)?;
            return self.rewrap("quasiquote", inner);
        }

        if self.tagged(tmpl, "unquote-splicing").is_some() && depth == 1 {
            return Err(self.error("unquote-splicing outside a list"));
        }

        match self.obj(tmpl) {
            Obj::Pair(..) => (),
            Obj::Symbol(_) => return Ok(self.quote_form(tmpl)),
            _ => return Ok(tmpl),
        }

        // split into elements and a tail, which may itself be unquoted
        let mut items = vec![];
        let mut rest = tmpl;
        while let Some((a, d)) = self.pair(rest) {
            if self.tagged(rest, "unquote").is_some() {
                break;
            }
            items.push(a);
            rest = d;
        }

        let mut acc = if self.nil_p(rest) {
            NIL
        } else {
            self.quasi_expand(rest, depth)?
        };

        for item in items.into_iter().rev() {
            match self.tagged(item, "unquote-splicing") {
                Some(x) if depth == 1 => {
                    let app = self.prim_cell(Prim::Append);
                    acc = self.list(&[app, x, acc]);
                }
                _ => {
                    let e = self.quasi_expand(item, depth)?;
                    let cons = self.prim_cell(Prim::Cons);
                    acc = self.list(&[cons, e, acc]);
                }
            }
        }

        Ok(acc)
    }

    /// Builds code for `(name <value of inner>)`
    fn rewrap(&mut self, name: &str, inner: Hndl) -> EvalResult {
        let sym = self.symbol(name);
        let quoted = self.quote_form(sym);
        let list = self.prim_cell(Prim::List);
        Ok(self.list(&[list, quoted, inner]))
    }

    // built-ins

    fn arity(&mut self, p: Prim, argv: &[Hndl], n: usize) -> Result<(), Hndl> {
        if argv.len() != n {
            let msg = format!("{}: expected {} arguments, got {}", p.name(), n, argv.len());
            return Err(self.error(&msg));
        }
        Ok(())
    }

    fn num(&mut self, p: Prim, h: Hndl) -> Result<Num, Hndl> {
        match self.obj(h) {
            Obj::Fixnum(i) => Ok(Num::Int(*i)),
            Obj::Flonum(f) => Ok(Num::Float(*f)),
            other => {
                let msg = format!("{}: expected number, got {}", p.name(), other.kind());
                Err(self.error(&msg))
            }
        }
    }

    fn num_cell(&mut self, n: Num) -> Hndl {
        match n {
            Num::Int(i) => self.fixnum(i),
            Num::Float(f) => self.flonum(f),
        }
    }

    /// Identity, extended to interned names and booleans
    pub fn identical(&self, a: Hndl, b: Hndl) -> bool {
        if a == b {
            return true;
        }
        match (self.obj(a), self.obj(b)) {
            (Obj::Symbol(x), Obj::Symbol(y)) | (Obj::Keyword(x), Obj::Keyword(y)) => x == y,
            (Obj::Bool(x), Obj::Bool(y)) => x == y,
            (Obj::Prim(x), Obj::Prim(y)) => x == y,
            (Obj::CFunc(x), Obj::CFunc(y)) | (Obj::Proto(x), Obj::Proto(y)) => x == y,
            _ => false,
        }
    }

    /// Value equality for numbers and strings, identity otherwise
    pub fn is_equal(&self, a: Hndl, b: Hndl) -> bool {
        match (self.obj(a), self.obj(b)) {
            (Obj::Fixnum(x), Obj::Fixnum(y)) => x == y,
            (Obj::Flonum(x), Obj::Flonum(y)) => x == y,
            (Obj::String(x), Obj::String(y)) => x == y,
            _ => self.identical(a, b),
        }
    }

    fn arith(&mut self, p: Prim, a: Num, b: Num) -> Result<Num, Hndl> {
        let out = match (a, b) {
            (Num::Int(x), Num::Int(y)) => {
                let r = match p {
                    Prim::Add => x.checked_add(y),
                    Prim::Sub => x.checked_sub(y),
                    Prim::Mul => x.checked_mul(y),
                    Prim::Div | Prim::Mod if y == 0 => {
                        return Err(self.error("division by zero"));
                    }
                    Prim::Div => x.checked_div(y),
                    _ => x.checked_rem(y),
                };
                match r {
                    Some(r) => Num::Int(r),
                    None => {
                        let msg = format!("{}: integer overflow", p.name());
                        return Err(self.error(&msg));
                    }
                }
            }
            _ => {
                let (x, y) = (a.as_f64(), b.as_f64());
                Num::Float(match p {
                    Prim::Add => x + y,
                    Prim::Sub => x - y,
                    Prim::Mul => x * y,
                    Prim::Div => x / y,
                    _ => x % y,
                })
            }
        };
        Ok(out)
    }

    fn compare(p: Prim, a: Num, b: Num) -> bool {
        let ord = match (a, b) {
            (Num::Int(x), Num::Int(y)) => x.partial_cmp(&y),
            _ => a.as_f64().partial_cmp(&b.as_f64()),
        };
        let Some(ord) = ord else {
            return false;
        };
        match p {
            Prim::Lt => ord.is_lt(),
            Prim::Le => ord.is_le(),
            Prim::Gt => ord.is_gt(),
            Prim::Ge => ord.is_ge(),
            _ => ord.is_eq(),
        }
    }

    fn pair_arg(&mut self, p: Prim, h: Hndl) -> Result<(Hndl, Hndl), Hndl> {
        match self.pair(h) {
            Some(pr) => Ok(pr),
            None => {
                let msg = format!("{}: expected pair, got {}", p.name(), self.kind(h));
                Err(self.error(&msg))
            }
        }
    }

    /// Runs a non-special primitive on evaluated arguments
    pub fn call_builtin(&mut self, p: Prim, argv: &[Hndl]) -> EvalResult {
        match p {
            Prim::Cons => {
                self.arity(p, argv, 2)?;
                Ok(self.cons(argv[0], argv[1]))
            }
            Prim::Car | Prim::Cdr => {
                self.arity(p, argv, 1)?;
                if self.nil_p(argv[0]) {
                    return Ok(NIL);
                }
                let (a, d) = self.pair_arg(p, argv[0])?;
                Ok(if p == Prim::Car { a } else { d })
            }
            Prim::SetCar | Prim::SetCdr => {
                self.arity(p, argv, 2)?;
                let (a, d) = self.pair_arg(p, argv[0])?;
                *self.obj_mut(argv[0]) = if p == Prim::SetCar {
                    Obj::Pair(argv[1], d)
                } else {
                    Obj::Pair(a, argv[1])
                };
                Ok(argv[1])
            }
            Prim::List => Ok(self.list(argv)),
            Prim::Append => {
                let Some((last, init)) = argv.split_last() else {
                    return Ok(NIL);
                };
                let mut items = vec![];
                for l in init {
                    match self.list_to_vec(*l) {
                        Some(v) => items.extend(v),
                        None => return Err(self.error("append: expected proper list")),
                    }
                }
                Ok(items.iter().rev().fold(*last, |acc, h| self.cons(*h, acc)))
            }
            Prim::Not => {
                self.arity(p, argv, 1)?;
                Ok(self.boolean(!self.truthy(argv[0])))
            }
            Prim::Is => {
                self.arity(p, argv, 2)?;
                Ok(self.boolean(self.is_equal(argv[0], argv[1])))
            }
            Prim::EqP => {
                self.arity(p, argv, 2)?;
                Ok(self.boolean(self.identical(argv[0], argv[1])))
            }
            Prim::AtomP => {
                self.arity(p, argv, 1)?;
                Ok(self.boolean(self.pair(argv[0]).is_none()))
            }
            Prim::NilP => {
                self.arity(p, argv, 1)?;
                Ok(self.boolean(self.nil_p(argv[0])))
            }
            Prim::Add | Prim::Mul | Prim::Sub | Prim::Div => {
                let (mut acc, rest) = match argv {
                    [] if p == Prim::Add => return Ok(self.fixnum(0)),
                    [] if p == Prim::Mul => return Ok(self.fixnum(1)),
                    [] => {
                        let msg = format!("{}: expected at least 1 argument", p.name());
                        return Err(self.error(&msg));
                    }
                    // unary minus and reciprocal
                    [x] if p == Prim::Sub || p == Prim::Div => {
                        let unit = Num::Int(if p == Prim::Sub { 0 } else { 1 });
                        (unit, std::slice::from_ref(x))
                    }
                    [x, rest @ ..] => (self.num(p, *x)?, rest),
                };
                for h in rest {
                    let n = self.num(p, *h)?;
                    acc = self.arith(p, acc, n)?;
                }
                Ok(self.num_cell(acc))
            }
            Prim::Mod => {
                self.arity(p, argv, 2)?;
                let a = self.num(p, argv[0])?;
                let b = self.num(p, argv[1])?;
                let r = self.arith(p, a, b)?;
                Ok(self.num_cell(r))
            }
            Prim::Lt | Prim::Le | Prim::Gt | Prim::Ge | Prim::NumEq => {
                if argv.is_empty() {
                    let msg = format!("{}: expected at least 1 argument", p.name());
                    return Err(self.error(&msg));
                }
                let mut prev = self.num(p, argv[0])?;
                let mut ok = true;
                for h in &argv[1..] {
                    let n = self.num(p, *h)?;
                    ok &= Self::compare(p, prev, n);
                    prev = n;
                }
                Ok(self.boolean(ok))
            }
            Prim::Print => {
                let line = argv
                    .iter()
                    .map(|h| self.display_raw(*h).to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{}", line);
                Ok(argv.last().copied().unwrap_or(NIL))
            }
            _ => {
                let msg = format!("{} is a special form", p.name());
                Err(self.error(&msg))
            }
        }
    }
}
