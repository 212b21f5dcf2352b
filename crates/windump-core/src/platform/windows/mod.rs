//! # Windows Crash Capture
//!
//! Faults are observed through a vectored exception handler registered at
//! the front of the chain, and dumps are written by `MiniDumpWriteDump`,
//! which is looked up in `dbghelp.dll` only when a capture happens.
//!
//! Modules:
//!
//! - `veh`: registration and the trampoline
//! - `dbghelp`: loading `dbghelp.dll` and calling `MiniDumpWriteDump`
//!
//! ## Dependencies
//!
//! - **windows-sys crate**: Win32 bindings
//!
//! Artifact paths are encoded when capture is installed. A successful capture
//! allocates nothing; failure paths build error values that carry the library
//! name.

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{FromRawHandle, RawHandle};
use std::path::Path;
use std::ptr;

use windows_sys::Win32::Foundation::{GENERIC_WRITE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, CREATE_ALWAYS, FILE_APPEND_DATA, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS,
};

use crate::error::{CaptureError, CaptureResult};
use crate::writer::FacilityResolver;

pub mod dbghelp;
pub mod veh;

pub use dbghelp::{DbgHelpFacility, DbgHelpResolver};
pub use veh::PlatformHook;

/// Dump path as a NUL-terminated UTF-16 string for `CreateFileW`.
pub type NativePath = Vec<u16>;

/// NUL-terminated UTF-16 copy of `value`, or `None` if it contains a NUL.
pub(crate) fn wide(value: &OsStr) -> Option<Vec<u16>>
{
    let mut encoded: Vec<u16> = value.encode_wide().collect();
    if encoded.contains(&0) {
        return None;
    }
    encoded.push(0);
    Some(encoded)
}

/// Encode `path` for `CreateFileW`.
///
/// ## Errors
///
/// [`CaptureError::InvalidPath`] if the path contains a NUL character.
pub fn native_path(path: &Path) -> CaptureResult<NativePath>
{
    wide(path.as_os_str()).ok_or_else(|| CaptureError::InvalidPath(format!("{} contains a NUL character", path.display())))
}

/// Create (or truncate) the dump artifact.
///
/// ## Errors
///
/// The `GetLastError()` of the failed `CreateFileW`.
pub fn open_artifact(path: &NativePath) -> io::Result<File>
{
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            GENERIC_WRITE,
            FILE_SHARE_WRITE,
            ptr::null(),
            CREATE_ALWAYS,
            FILE_ATTRIBUTE_NORMAL,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `handle` was just created and is owned by nobody else
    Ok(unsafe { File::from_raw_handle(handle as RawHandle) })
}

/// Open the artifact log for appending, creating it if needed.
///
/// ## Errors
///
/// The `GetLastError()` of the failed `CreateFileW`.
pub fn open_log(path: &NativePath) -> io::Result<File>
{
    // Append-only access: every write lands at the current end of file
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            FILE_APPEND_DATA,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            ptr::null(),
            OPEN_ALWAYS,
            FILE_ATTRIBUTE_NORMAL,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `handle` was just opened and is owned by nobody else
    Ok(unsafe { File::from_raw_handle(handle as RawHandle) })
}

/// Snapshots come from `MiniDumpWriteDump` in the system `dbghelp.dll`.
#[must_use]
pub fn default_resolver() -> Box<dyn FacilityResolver>
{
    Box::new(DbgHelpResolver::default())
}
