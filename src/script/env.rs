// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/env.rs

// Lexical environments. An environment is a chain of frames, each a
// heap cell mapping symbol IDs to values with a link to its parent;
// lookups walk the chain from the innermost frame outward.

// <>

use super::core::{Frame, Hndl, Obj};
use super::symtab::SymId;
use super::Ctx;

impl Ctx {
    /// Creates an empty frame whose lookups fall through to `parent`
    pub fn make_environment(&mut self, parent: Option<Hndl>) -> Hndl {
        self.alloc(Obj::Env(Frame {
            parent,
            vars: Default::default(),
        }))
    }

    fn frame(&self, env: Hndl) -> Option<&Frame> {
        match self.obj(env) {
            Obj::Env(f) => Some(f),
            _ => None,
        }
    }

    fn frame_mut(&mut self, env: Hndl) -> Option<&mut Frame> {
        match self.obj_mut(env) {
            Obj::Env(f) => Some(f),
            _ => None,
        }
    }

    /// Innermost frame in the chain that binds `id`
    fn env_owner(&self, mut env: Hndl, id: SymId) -> Option<Hndl> {
        loop {
            let frame = self.frame(env)?;
            if frame.vars.contains_key(&id) {
                return Some(env);
            }
            env = frame.parent?;
        }
    }

    /// Looks up a symbol by ID, walking outward through parent frames
    pub fn env_lookup_by_id(&self, mut env: Hndl, id: SymId) -> Option<Hndl> {
        loop {
            let frame = self.frame(env)?;
            if let Some(v) = frame.vars.get(&id) {
                return Some(*v);
            }
            env = frame.parent?;
        }
    }

    /// Value bound to `sym`, or an unbound-symbol error object
    pub fn env_get(&mut self, env: Hndl, sym: Hndl) -> Result<Hndl, Hndl> {
        let Some(id) = self.sym_id(sym) else {
            let msg = format!("cannot look up non-symbol {}", self.kind(sym));
            return Err(self.error(&msg));
        };

        match self.env_lookup_by_id(env, id) {
            Some(v) => Ok(v),
            None => {
                let msg = format!("unbound symbol: {}", self.sym_name(id));
                Err(self.error(&msg))
            }
        }
    }

    /// Binds in the given frame only, shadowing any outer binding
    pub fn env_define_id(&mut self, env: Hndl, id: SymId, val: Hndl) {
        if let Some(frame) = self.frame_mut(env) {
            frame.vars.insert(id, val);
        }
    }

    pub fn env_define(&mut self, env: Hndl, sym: Hndl, val: Hndl) -> Result<(), Hndl> {
        match self.sym_id(sym) {
            Some(id) => {
                self.env_define_id(env, id, val);
                Ok(())
            }
            None => {
                let msg = format!("cannot bind non-symbol {}", self.kind(sym));
                Err(self.error(&msg))
            }
        }
    }

    /// Rebinds the nearest existing binding; unbound symbols are an
    /// error
    pub fn env_set(&mut self, env: Hndl, sym: Hndl, val: Hndl) -> Result<(), Hndl> {
        let Some(id) = self.sym_id(sym) else {
            let msg = format!("cannot set non-symbol {}", self.kind(sym));
            return Err(self.error(&msg));
        };

        self.env_set_id(env, id, val)
    }

    pub fn env_set_id(&mut self, env: Hndl, id: SymId, val: Hndl) -> Result<(), Hndl> {
        match self.env_owner(env, id) {
            Some(owner) => {
                self.env_define_id(owner, id, val);
                Ok(())
            }
            None => {
                let msg = format!("set! of unbound symbol: {}", self.sym_name(id));
                Err(self.error(&msg))
            }
        }
    }

    /// Rebinds the nearest binding if one exists, else defines in
    /// `env` itself
    pub fn env_set_or_define(&mut self, env: Hndl, id: SymId, val: Hndl) {
        let owner = self.env_owner(env, id).unwrap_or(env);
        self.env_define_id(owner, id, val);
    }

    pub fn env_parent(&self, env: Hndl) -> Option<Hndl> {
        self.frame(env).and_then(|f| f.parent)
    }
}

#[cfg(test)]
mod tests {
    use crate::script::Ctx;

    #[test]
    fn shadowing() {
        let mut ctx = Ctx::default();
        let outer = ctx.make_environment(None);
        let inner = ctx.make_environment(Some(outer));

        let x = ctx.symbol("x");
        let one = ctx.fixnum(1);
        let two = ctx.fixnum(2);

        ctx.env_define(outer, x, one).unwrap();
        assert_eq!(ctx.env_get(inner, x), Ok(one));

        ctx.env_define(inner, x, two).unwrap();
        assert_eq!(ctx.env_get(inner, x), Ok(two));
        assert_eq!(ctx.env_get(outer, x), Ok(one));
    }

    #[test]
    fn set_walks_outward() {
        let mut ctx = Ctx::default();
        let outer = ctx.make_environment(None);
        let inner = ctx.make_environment(Some(outer));

        let y = ctx.symbol("y");
        let one = ctx.fixnum(1);
        let three = ctx.fixnum(3);

        ctx.env_define(outer, y, one).unwrap();
        ctx.env_set(inner, y, three).unwrap();
        assert_eq!(ctx.env_get(outer, y), Ok(three));
        assert_eq!(ctx.env_parent(inner), Some(outer));
    }

    #[test]
    fn unbound_errors() {
        let mut ctx = Ctx::default();
        let env = ctx.make_environment(None);
        let z = ctx.symbol("zzz");
        let v = ctx.fixnum(0);

        let err = ctx.env_get(env, z).unwrap_err();
        assert_eq!(ctx.error_message(err), Some("unbound symbol: zzz"));
        assert!(ctx.env_set(env, z, v).is_err());

        let id = ctx.intern("zzz");
        ctx.env_set_or_define(env, id, v);
        assert_eq!(ctx.env_get(env, z), Ok(v));
    }
}
