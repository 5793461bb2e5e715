// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/script/symtab.rs

// A table to associate symbol names with efficient internal IDs.

// <>

use std::collections::HashMap;

/// Interned symbol identifier
pub type SymId = u32;

/// Bidirectional map between symbol names and IDs
///
/// Each name is stored once; IDs are dense and handed out in order of
/// first appearance.
pub struct SymbolTable {
    id_to_nm: Vec<Box<str>>,
    nm_to_id: HashMap<Box<str>, SymId>,
}

impl SymbolTable {
    pub fn new(approx_cap: usize) -> Self {
        Self {
            id_to_nm: Vec::with_capacity(approx_cap),
            nm_to_id: HashMap::with_capacity(approx_cap),
        }
    }

    /// Returns the ID for a name, interning it if not yet present
    pub fn get_id(&mut self, name: &str) -> SymId {
        if let Some(id) = self.nm_to_id.get(name) {
            return *id;
        }

        let id = self.id_to_nm.len() as SymId;
        self.id_to_nm.push(name.into());
        self.nm_to_id.insert(name.into(), id);
        id
    }

    pub fn lookup_by_id(&self, id: SymId) -> Option<&str> {
        self.id_to_nm.get(id as usize).map(|s| &**s)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<SymId> {
        self.nm_to_id.get(name).copied()
    }

    /// Number of interned symbols
    pub fn load(&self) -> usize {
        self.id_to_nm.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_test() {
        let mut tab = SymbolTable::new(100);

        let id = tab.get_id("testsym");

        assert!(tab.lookup_by_id(42).is_none());
        assert!(tab.lookup_by_name("nothere").is_none());

        assert_eq!(tab.lookup_by_id(id).unwrap(), "testsym");
        assert_eq!(tab.lookup_by_name("testsym").unwrap(), id);
    }

    #[test]
    fn manysym() {
        let mut tab = SymbolTable::new(8);

        // generates symbols a00 - z99
        for i in 0..2600u32 {
            let name = format!("{}{:02}", (b'a' + (i / 100) as u8) as char, i % 100);
            assert_eq!(tab.get_id(&name), i);
        }

        assert_eq!("m13", tab.lookup_by_id(1213).unwrap());
        assert_eq!(692, tab.lookup_by_name("g92").unwrap());

        // repeated interning hands back prior ids
        assert_eq!(tab.get_id("a00"), 0);
        assert_eq!(tab.load(), 2600);
    }
}
