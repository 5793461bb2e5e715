// KEEL, a systems foundation library.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KEEL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/main.rs

// Command line front end for the scripting runtime.

// <>

use keel::script::{self, Config};

use std::env;
use std::io;
use std::process;

const USAGE: &str = "usage: keel [--heap <cells>] [--depth <n>] [--verbose] \
                     (file <path> | vm <path> [--dis] | repl)";

fn usage() -> ! {
    eprintln!("{}", USAGE);
    process::exit(2)
}

fn number(flag: &str, val: Option<String>) -> usize {
    match val.as_deref().map(str::parse) {
        Some(Ok(n)) => n,
        _ => {
            eprintln!("{} expects a number", flag);
            usage()
        }
    }
}

fn main() {
    let mut config = Config::default();
    let mut level = log::LevelFilter::Warn;
    let mut dis = false;
    let mut words = vec![];

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--heap" => config.heap_cells = number("--heap", args.next()),
            "--depth" => config.max_depth = number("--depth", args.next()),
            "--dis" => dis = true,
            "--verbose" => level = log::LevelFilter::Debug,
            _ => words.push(arg),
        }
    }

    if let Err(e) = simple_logger::SimpleLogger::new().with_level(level).init() {
        eprintln!("logger setup failed: {}", e);
    }

    // keel file <path> to run a script with the evaluator
    // keel vm <path> to compile and run it on the VM
    // keel repl for a line REPL
    let out = match words.iter().map(String::as_str).collect::<Vec<_>>()[..] {
        ["file", path] => script::run_file_with(config, path),
        ["vm", path] => match std::fs::read(path) {
            Ok(src) => script::run_vm(config, &src, dis),
            Err(e) => Err(format!("cannot read {}: {}", path, e)),
        },
        ["repl"] => {
            script::repl(config, io::stdin());
            return;
        }
        _ => usage(),
    };

    match out {
        Ok(val) => println!("{}", val),
        Err(msg) => {
            eprintln!("Error: {}", msg);
            process::exit(1);
        }
    }
}
