//! # windump-core
//!
//! Process-wide crash capture: when the process hits a fatal exception, write
//! a human-readable entry to `<path>.log` and a minidump to `<path>.dmp`, then
//! let the exception continue as if nothing had watched it.
//!
//! This crate provides:
//! - Exception triage (`classifier`): error severity plus a denylist of
//!   codes the OS and other runtimes raise and handle internally
//! - A reentrancy guard so a fault during a capture is not captured again
//! - The dump writer, with the snapshot routine resolved at capture time
//! - Install/uninstall lifecycle and a self-test fault
//! - Reading artifacts back from a supervising process (`report`)
//!
//! ## Platform Support
//!
//! - **Windows**: vectored exception handler and `MiniDumpWriteDump` from `dbghelp.dll`
//! - **Unix**: `sigaction` hooks and a built-in minidump writer (system info,
//!   faulting thread with registers and stack, module list)
//!
//! ## Example
//!
//! ```rust,no_run
//! let _capture = windump_core::global().scoped("/var/tmp/myapp-crash")?;
//! // ... run the application; a crash leaves myapp-crash.log and myapp-crash.dmp
//! # Ok::<(), windump_core::CaptureError>(())
//! ```
//!
//! ## Why unsafe code is needed
//!
//! Registering exception hooks, reading the platform exception context and
//! calling the OS dump routine are all raw system calls. They are wrapped in
//! safe types. The handler path itself takes no locks, does no tracing and
//! does not allocate: a fault inside `malloc` leaves the allocator locked.

#![allow(unsafe_code)] // Required for exception hooks and raw platform contexts

pub mod classifier;
pub mod context;
pub mod error;
pub mod guard;
pub mod interceptor;
pub mod lifecycle;
pub mod platform;
pub mod prelude;
pub mod report;
mod slot;
pub mod writer;

// Re-export commonly used types
pub use classifier::{classify, should_ignore, ExceptionCode, Verdict};
pub use error::{CaptureError, CaptureResult};
pub use guard::InstallGuard;
pub use interceptor::CaptureState;
pub use lifecycle::{global, install, trigger_self_test, uninstall, CrashCapture};
pub use report::ArtifactReport;
