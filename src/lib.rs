// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lib.rs

// Crate root. The scripting runtime lives under `script`: reader,
// tree-walking evaluator, register-machine compiler and VM.

// <>

pub mod script;

pub use script::{interpret, interpret_vm, run_file, Config, Ctx, EvalStatus, Hndl};
