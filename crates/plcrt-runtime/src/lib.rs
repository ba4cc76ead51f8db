//! `plcrt-runtime` - dynamically-loaded PLC module runtime.
//!
//! Executes one position-independent control module on a strict
//! periodic cycle and exposes live variable trace/force through a
//! session-tokened sample channel.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Runtime configuration.
pub mod config;
/// Runtime errors.
pub mod error;
/// Flash partition abstraction.
pub mod flash;
/// Scripted module stand-ins for tests.
pub mod harness;
/// Module image container format.
pub mod image;
/// Process image and I/O drivers.
pub mod io;
/// Module loading from staged files or flash.
pub mod loader;
/// Module ABI and execution context.
pub mod module;
/// External symbol resolution.
pub mod resolver;
mod ring;
/// Module-side message log.
pub mod rtelog;
/// The runtime aggregate.
pub mod runtime;
/// Cycle scheduling.
pub mod scheduler;
/// Logical clock types.
pub mod time;
/// Variable trace and force engine.
pub mod trace;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use loader::LoadSource;
pub use runtime::Runtime;
pub use scheduler::PlcStatus;
pub use trace::{FetchBatch, SessionToken, TraceHandle, TraceOrder, TraceSample};
