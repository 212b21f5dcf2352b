//! `MiniDumpWriteDump` resolved out of `dbghelp.dll` at capture time.
//!
//! The library is loaded by name, so the usual DLL search order applies. A
//! copy that loads but lacks the export is reported as the wrong version.
//! The name is encoded when the resolver is built and the facility lives on
//! the handler's stack, so a successful capture does not allocate.
//!
//! ## References
//!
//! - [MiniDumpWriteDump](https://learn.microsoft.com/en-us/windows/win32/api/minidumpapiset/nf-minidumpapiset-minidumpwritedump)
//! - [MINIDUMP_EXCEPTION_INFORMATION](https://learn.microsoft.com/en-us/windows/win32/api/minidumpapiset/ns-minidumpapiset-minidump_exception_information)

use std::ffi::{c_void, OsStr};
use std::fs::File;
use std::mem;
use std::os::windows::io::AsRawHandle;
use std::ptr;

use windows_sys::Win32::Foundation::{GetLastError, BOOL, FALSE, HANDLE, HMODULE};
use windows_sys::Win32::System::Diagnostics::Debug::{EXCEPTION_POINTERS, MINIDUMP_EXCEPTION_INFORMATION};
use windows_sys::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryW};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetCurrentProcessId};

use super::wide;
use crate::context::ExceptionContext;
use crate::error::{CaptureError, CaptureResult};
use crate::writer::{FacilityResolver, SnapshotFacility, SnapshotKind, UseFacility};

/// Library searched for by default.
pub const DEFAULT_LIBRARY: &str = "dbghelp.dll";

const ENTRY_POINT: &str = "MiniDumpWriteDump";

type MiniDumpWriteDumpFn = unsafe extern "system" fn(
    process: HANDLE,
    process_id: u32,
    file: HANDLE,
    dump_type: u32,
    exception: *const MINIDUMP_EXCEPTION_INFORMATION,
    user_streams: *const c_void,
    callback: *const c_void,
) -> BOOL;

/// Loads `MiniDumpWriteDump` from a named library.
#[derive(Debug, Clone)]
pub struct DbgHelpResolver
{
    library: String,
    // NUL-terminated UTF-16, `None` if the name holds a NUL
    wide_library: Option<Vec<u16>>,
}

impl Default for DbgHelpResolver
{
    fn default() -> Self
    {
        Self::new(DEFAULT_LIBRARY)
    }
}

impl DbgHelpResolver
{
    /// Resolve from `library` instead of the system `dbghelp.dll`.
    #[must_use]
    pub fn new(library: impl Into<String>) -> Self
    {
        let library = library.into();
        let wide_library = wide(OsStr::new(&library));
        Self { library, wide_library }
    }
}

impl FacilityResolver for DbgHelpResolver
{
    fn name(&self) -> &str
    {
        &self.library
    }

    fn resolve(&self, use_facility: &mut UseFacility<'_>) -> CaptureResult<()>
    {
        let Some(name) = &self.wide_library else {
            return Err(CaptureError::FacilityUnavailable {
                library: self.library.clone(),
                code: 0,
            });
        };

        let module = unsafe { LoadLibraryW(name.as_ptr()) };
        if module.is_null() {
            return Err(CaptureError::FacilityUnavailable {
                library: self.library.clone(),
                code: unsafe { GetLastError() },
            });
        }

        let symbol = unsafe { GetProcAddress(module, b"MiniDumpWriteDump\0".as_ptr()) };
        let Some(symbol) = symbol else {
            unsafe {
                FreeLibrary(module);
            }
            return Err(CaptureError::FacilityMismatch {
                library: self.library.clone(),
                symbol: ENTRY_POINT,
            });
        };

        // Unloaded when it goes out of scope
        let facility = DbgHelpFacility {
            module,
            // SAFETY: the export has this signature in every dbghelp.dll that provides it
            write_dump: unsafe { mem::transmute::<unsafe extern "system" fn() -> isize, MiniDumpWriteDumpFn>(symbol) },
        };
        use_facility(&facility)
    }
}

/// A loaded `dbghelp.dll`; unloaded on drop.
pub struct DbgHelpFacility
{
    module: HMODULE,
    write_dump: MiniDumpWriteDumpFn,
}

impl Drop for DbgHelpFacility
{
    fn drop(&mut self)
    {
        unsafe {
            FreeLibrary(self.module);
        }
    }
}

impl SnapshotFacility for DbgHelpFacility
{
    fn write_snapshot(&self, context: &ExceptionContext, destination: &File, kind: SnapshotKind) -> CaptureResult<()>
    {
        let exception = MINIDUMP_EXCEPTION_INFORMATION {
            ThreadId: context.thread_id() as u32,
            ExceptionPointers: context.raw().cast::<EXCEPTION_POINTERS>(),
            ClientPointers: FALSE,
        };
        // Without platform state the dump is written with no exception record
        let exception_ptr = if context.has_platform_state() {
            &exception as *const MINIDUMP_EXCEPTION_INFORMATION
        } else {
            ptr::null()
        };

        let written = unsafe {
            (self.write_dump)(
                GetCurrentProcess(),
                GetCurrentProcessId(),
                destination.as_raw_handle() as HANDLE,
                kind.minidump_flags(),
                exception_ptr,
                ptr::null(),
                ptr::null(),
            )
        };
        if written == FALSE {
            return Err(CaptureError::SnapshotFailed {
                code: unsafe { GetLastError() },
            });
        }
        Ok(())
    }
}
