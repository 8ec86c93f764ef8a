//! Fixture: a fake `s3270 -script` over stdin/stdout.
//! Used for testing the emulator subprocess path.
//!
//! Usage: `tn3270-fake-s3270 [--unreachable] [--stuck] [--refuse <n>] [s3270 args...]`
//!
//! Unknown arguments (`-script`, `-model 3278-2`, ...) are accepted and ignored.

// Test fixtures require special allowances - they are not production code
#![allow(clippy::print_stdout)]

use std::env;
use std::io::{self, BufRead, Write};
use tn3270_bridge_fixtures::{FakeHost, HostBehavior};

fn main() {
    let mut behavior = HostBehavior::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--unreachable" => behavior.unreachable = true,
            "--stuck" => behavior.unlock_keys.clear(),
            "--refuse" => {
                behavior.refuse_connects = args.next().and_then(|n| n.parse().ok()).unwrap_or(1);
            }
            _ => {}
        }
    }

    let mut host = FakeHost::new(behavior);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        for reply in host.handle(&line) {
            println!("{reply}");
        }
        stdout.flush().ok();
    }
}
