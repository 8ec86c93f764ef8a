//! Test fixtures for tn3270-bridge integration tests.
//!
//! This crate provides a scripted fake host that speaks the `s3270 -script`
//! line protocol, so the whole bridge stack can be exercised without a real
//! emulator or mainframe:
//!
//! - [`FakeHost`] - In-process protocol state machine (TSO-style logon panels)
//! - [`HostBehavior`] - Failure modes: unreachable host, refusals, stuck locks
//! - `tn3270-fake-s3270` - The same host over stdin/stdout, for subprocess tests
//!
//! # Example
//!
//! ```ignore
//! use tn3270_bridge_fixtures::{FakeHost, HostBehavior};
//!
//! let mut host = FakeHost::new(HostBehavior::default());
//! let reply = host.handle("Connect(127.0.0.1:3270)");
//! assert_eq!(reply.last().map(String::as_str), Some("ok"));
//! ```

// Test fixtures crate - relaxed lints for test utilities
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::indexing_slicing)]

pub mod host;

pub use host::{FakeHost, HostBehavior, Panel, COLS, ROWS};
