// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A static, in-memory stand-in for an external loader.
//!
//! There is no filesystem: every program `exec` can load has to be
//! known to the kernel ahead of time, by name, as a fixed entry point
//! and a fixed set of segments. Real systems populate this from a boot
//! archive; this kernel bakes the table in at compile time instead,
//! which is enough to exercise `exec` without also building a file
//! format for it.

use memlayout::USER_REGION;
use virtmem::Segment;

/// One entry in the program table: a name, the virtual address execution
/// starts at, and the segments that must be mapped before it runs.
struct Program {
    name: &'static str,
    entry: u32,
    segments: &'static [Segment],
}

// A single demo program, occupying the first page past the user/kernel
// split: enough to exist, not enough to pretend this is a real binary
// loader. Additional programs are added here as entries, not discovered.
static INIT_SEGMENTS: &[Segment] = &[Segment {
    va: USER_REGION.start(),
    len: 0x1000,
    writable: false,
}];

static PROGRAMS: &[Program] = &[Program {
    name: "init",
    entry: USER_REGION.start(),
    segments: INIT_SEGMENTS,
}];

/// Looks up `name` in the static program table, returning its entry
/// point and segments if known.
pub fn lookup(name: &str) -> Option<(u32, &'static [Segment])> {
    PROGRAMS
        .iter()
        .find(|p| p.name == name)
        .map(|p| (p.entry, p.segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_program_resolves() {
        assert!(lookup("init").is_some());
    }

    #[test]
    fn unknown_program_is_none() {
        assert!(lookup("does-not-exist").is_none());
    }
}
