//! # Platform-Specific Implementations
//!
//! Each backend provides the same small surface, re-exported here:
//!
//! - `NativePath`, `native_path`, `open_artifact`, `open_log`: artifact paths
//!   encoded once for the OS and opened without conversion inside the handler
//! - `PlatformHook`: the [`ExceptionHook`](crate::lifecycle::ExceptionHook)
//!   that registers the process-wide trampoline
//! - `default_resolver`: where snapshots come from
//!
//! Backends:
//!
//! - **windows**: vectored exception handler plus `dbghelp.dll`
//!   - See: [AddVectoredExceptionHandler](https://learn.microsoft.com/en-us/windows/win32/api/errhandlingapi/nf-errhandlingapi-addvectoredexceptionhandler)
//!   - See: [MiniDumpWriteDump](https://learn.microsoft.com/en-us/windows/win32/api/minidumpapiset/nf-minidumpapiset-minidumpwritedump)
//! - **unix**: `sigaction` hooks chained to the previous dispositions, with a
//!   built-in minidump writer that does not allocate
//!   - See: [sigaction(2) man page](https://man7.org/linux/man-pages/man2/sigaction.2.html)

#[cfg(unix)]
pub mod unix;
#[cfg(unix)]
pub use unix::{default_resolver, native_path, open_artifact, open_log, NativePath, PlatformHook};

#[cfg(windows)]
pub mod windows;
#[cfg(windows)]
pub use windows::{default_resolver, native_path, open_artifact, open_log, NativePath, PlatformHook};

#[cfg(not(any(unix, windows)))]
compile_error!("windump-core supports Windows and Unix targets only");
