//! tn3270-bridge: drive TN3270 hosts through a scripted `s3270` emulator.
//!
//! The bridge owns terminal sessions, decodes raw screen buffers into a typed
//! screen model, executes validated fill and key actions with timeout
//! discipline, recovers locked keyboards, and runs declarative flows whose
//! run logs can be compared offline against golden layouts and earlier runs.

#![forbid(unsafe_code)]
// Library documentation is in progress. Public API types have docs;
// internal types will be documented in future releases.
#![allow(missing_docs)]

pub mod artifacts;
pub mod config;
pub mod decoder;
pub mod emulator;
pub mod error;
pub mod executor;
pub mod flow;
pub mod golden;
pub mod model;
pub mod protocol;
pub mod replay;
pub mod runner;
pub mod server;
pub mod session;

pub use crate::error::{BridgeError, BridgeResult, ErrorCode};
pub use crate::model::*;
