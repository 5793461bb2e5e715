// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/stdenv.rs

// Native procedures which are part of the standard script environment
// and are loaded into every new context.

// <>

use super::core::{Hndl, Obj};
use super::{Ctx, EvalResult, NativeFn};

/// Generates a slice of native function pointers along with names
/// and argument counts
///
/// The syntax is close to that of regular functions but eases access
/// to arguments in the body. An argument count of `_` accepts any
/// number of arguments, reachable through the slice ident named in
/// the header.
macro_rules! native_fn {
    ( const $array:ident; $ctx:ident $all:ident;
      $( $name:literal $argct:tt [ $($args:ident),* ] $body:block )+
    ) => {
        pub const $array: &[(&str, NativeFn, Option<u16>)] =
            &[$(($name,
                 |$ctx: &mut Ctx, $all: &[Hndl]| -> EvalResult {
                     #[allow(unused_mut)]
                     let mut _ind = 0;
                     $(
                         let $args = $all[_ind];
                         _ind += 1;
                     )*

                     $body
                 },
                 native_fn!(@argct $argct))),+];
    };

    (@argct _) => { None };
    (@argct $n:literal) => { Some($n) };
}

fn type_err(ctx: &mut Ctx, name: &str, want: &str, got: Hndl) -> Hndl {
    let msg = format!("{}: expected {}, got {}", name, want, ctx.kind(got));
    ctx.error(&msg)
}

native_fn! {
    const STDFNS;
    ctx args;

    "length" 1 [l] {
        match ctx.list_to_vec(l) {
            Some(v) => Ok(ctx.fixnum(v.len() as i64)),
            None => Err(type_err(ctx, "length", "list", l)),
        }
    }

    "reverse" 1 [l] {
        match ctx.list_to_vec(l) {
            Some(v) => Ok(v.iter().fold(crate::script::NIL, |acc, h| ctx.cons(*h, acc))),
            None => Err(type_err(ctx, "reverse", "list", l)),
        }
    }

    "nth" 2 [n, l] {
        let Some(idx) = ctx.fixnum_get(n) else {
            return Err(type_err(ctx, "nth", "fixnum", n));
        };

        let mut pos = l;
        for _ in 0..idx.max(0) {
            match ctx.pair(pos) {
                Some((_, d)) => pos = d,
                None => return Ok(crate::script::NIL),
            }
        }
        Ok(ctx.car(pos))
    }

    "string-length" 1 [s] {
        match ctx.string_get(s).map(|s| s.chars().count()) {
            Some(n) => Ok(ctx.fixnum(n as i64)),
            None => Err(type_err(ctx, "string-length", "string", s)),
        }
    }

    "string-append" _ [] {
        let mut out = String::new();
        for s in args {
            match ctx.string_get(*s) {
                Some(text) => out.push_str(text),
                None => return Err(type_err(ctx, "string-append", "string", *s)),
            }
        }
        Ok(ctx.string(&out))
    }

    "symbol->string" 1 [s] {
        match ctx.obj(s) {
            Obj::Symbol(id) | Obj::Keyword(id) => {
                let name = ctx.sym_name(*id).to_string();
                Ok(ctx.string(&name))
            }
            _ => Err(type_err(ctx, "symbol->string", "symbol", s)),
        }
    }

    "string->symbol" 1 [s] {
        match ctx.string_get(s).map(str::to_string) {
            Some(name) => Ok(ctx.symbol(&name)),
            None => Err(type_err(ctx, "string->symbol", "string", s)),
        }
    }

    "number->string" 1 [n] {
        match ctx.obj(n) {
            Obj::Fixnum(_) | Obj::Flonum(_) => {
                let text = ctx.display(n).to_string();
                Ok(ctx.string(&text))
            }
            _ => Err(type_err(ctx, "number->string", "number", n)),
        }
    }

    // (apply f a b '(c d)) calls f with a b c d
    "apply" _ [] {
        let Some((f, rest)) = args.split_first() else {
            return Err(ctx.error("apply: expected a function"));
        };

        let mut argv = rest.to_vec();
        if let Some(last) = argv.pop() {
            match ctx.list_to_vec(last) {
                Some(v) => argv.extend(v),
                None => return Err(type_err(ctx, "apply", "list", last)),
            }
        }
        ctx.apply(*f, &argv)
    }

    "error" _ [] {
        let msg = args
            .iter()
            .map(|h| ctx.display_raw(*h).to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Err(ctx.error(&msg))
    }

    "gensym" 0 [] {
        Ok(ctx.gensym())
    }

    "eval" 1 [x] {
        let global = ctx.global();
        ctx.eval_in(x, global)
    }
}

/// Binds every standard native into the global environment
pub fn install(ctx: &mut Ctx) {
    for (name, f, argct) in STDFNS {
        ctx.define_native(name, *argct, *f);
    }
}

#[cfg(test)]
mod tests {
    use crate::script::interpret;

    fn run(code: &str) -> String {
        match interpret(code) {
            Ok(s) => s,
            Err(e) => format!("error: {}", e),
        }
    }

    #[test]
    fn list_natives() {
        assert_eq!(run("(length '(1 2 3))"), "3");
        assert_eq!(run("(length nil)"), "0");
        assert_eq!(run("(reverse '(1 2 3))"), "(3 2 1)");
        assert_eq!(run("(nth 1 '(a b c))"), "b");
        assert_eq!(run("(nth 9 '(a b c))"), "nil");
        assert_eq!(run("(nth 9223372036854775807 '(a b))"), "nil");
        assert_eq!(run("(nth -2 '(a b))"), "a");
        assert_eq!(run("(length 4)"), "error: length: expected list, got fixnum");
        assert_eq!(
            run("(let p (list 1 2)) (setcdr (cdr p) p) (length p)"),
            "error: length: expected list, got pair"
        );
    }

    #[test]
    fn string_natives() {
        assert_eq!(run("(string-length \"héllo\")"), "5");
        assert_eq!(run("(string-append \"ab\" \"\" \"cd\")"), "\"abcd\"");
        assert_eq!(run("(symbol->string 'abc)"), "\"abc\"");
        assert_eq!(run("(eq? (string->symbol \"q\") 'q)"), "#t");
        assert_eq!(run("(number->string 2.0)"), "\"2.0\"");
    }

    #[test]
    fn apply_spreads() {
        assert_eq!(run("(apply + 1 2 '(3 4))"), "10");
        assert_eq!(run("(apply list '())"), "nil");
        assert_eq!(run("(apply (fn (a b) (- a b)) '(9 4))"), "5");
    }

    #[test]
    fn raises() {
        assert_eq!(run("(error \"bad value:\" 42)"), "error: bad value: 42");
        assert_eq!(run("(gensym 1)"), "error: gensym: expected 0 arguments, got 1");
    }

    #[test]
    fn gensyms_differ() {
        assert_eq!(run("(eq? (gensym) (gensym))"), "#f");
    }

    #[test]
    fn evals() {
        assert_eq!(run("(eval (list '+ 1 2))"), "3");
    }
}
