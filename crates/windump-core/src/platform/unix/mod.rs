//! # Unix Crash Capture
//!
//! Unix has no vectored exception handlers, so faults are observed through
//! `sigaction` hooks on the fatal signals. Each signal is mapped onto the
//! Windows exception code space so the classifier and the log format stay the
//! same across targets.
//!
//! Modules:
//!
//! - `signals`: the hook, the trampoline and chaining to previous dispositions
//! - `snapshot`: built-in minidump writer, streamed through `dump_file`
//! - `cpu`: `ucontext_t` to minidump `CONTEXT_*` conversion
//! - `proc_maps`: `/proc/self` readers and the module list
//!
//! ## Dependencies
//!
//! - **libc crate**: `sigaction`, `open`, `pwrite`, `uname`, `raise`, thread ids
//! - **minidump-common / scroll**: minidump record layouts and their serialization

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;

use crate::error::{CaptureError, CaptureResult};
use crate::writer::FacilityResolver;

pub mod cpu;
pub mod dump_file;
pub mod proc_maps;
pub mod signals;
pub mod snapshot;

pub use signals::PlatformHook;
pub use snapshot::{BuiltinResolver, MinidumpFacility};

/// Dump path as handed to `open(2)`.
pub type NativePath = CString;

/// Encode `path` for `open(2)`.
///
/// ## Errors
///
/// [`CaptureError::InvalidPath`] if the path contains a NUL byte.
pub fn native_path(path: &Path) -> CaptureResult<NativePath>
{
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CaptureError::InvalidPath(format!("{} contains a NUL byte", path.display())))
}

/// Create (or truncate) the dump artifact.
///
/// ## Errors
///
/// The `errno` of the failed `open(2)`.
pub fn open_artifact(path: &NativePath) -> io::Result<File>
{
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fd` was just opened and is owned by nobody else
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Open the artifact log for appending, creating it if needed.
///
/// ## Errors
///
/// The `errno` of the failed `open(2)`.
pub fn open_log(path: &NativePath) -> io::Result<File>
{
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fd` was just opened and is owned by nobody else
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Snapshots come from the built-in minidump writer.
#[must_use]
pub fn default_resolver() -> Box<dyn FacilityResolver>
{
    Box::new(BuiltinResolver)
}

/// OS id of the calling thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn current_thread_id() -> u64
{
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// OS id of the calling thread.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn current_thread_id() -> u64
{
    unsafe { libc::pthread_self() as usize as u64 }
}

#[cfg(test)]
mod tests
{
    use std::io::Write;

    use super::*;

    #[test]
    fn test_nul_byte_rejected()
    {
        let err = native_path(Path::new("/tmp/bad\0path.dmp")).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidPath(_)));
    }

    #[test]
    fn test_open_artifact_truncates()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.dmp");
        std::fs::write(&path, b"previous contents").unwrap();

        let mut file = open_artifact(&native_path(&path).unwrap()).unwrap();
        file.write_all(b"new").unwrap();
        drop(file);

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_open_log_appends()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.log");
        std::fs::write(&path, b"first\n").unwrap();

        let native = native_path(&path).unwrap();
        open_log(&native).unwrap().write_all(b"second\n").unwrap();
        open_log(&native).unwrap().write_all(b"third\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\nthird\n");
    }

    #[test]
    fn test_open_artifact_reports_errno()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("crash.dmp");

        let err = open_artifact(&native_path(&path).unwrap()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
