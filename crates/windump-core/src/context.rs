//! Exception context handed from the platform trampoline to the interceptor.

use std::ffi::c_void;
use std::ptr;

use crate::classifier::ExceptionCode;

/// Snapshot of one exception as seen by the interceptor.
///
/// `raw` is the platform context the snapshot facility embeds in the dump:
/// `EXCEPTION_POINTERS*` on Windows, `ucontext_t*` on Unix. It is only valid
/// for the duration of the handler invocation.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionContext
{
    code: ExceptionCode,
    address: usize,
    thread_id: u64,
    raw: *mut c_void,
}

impl ExceptionContext
{
    /// Build a context from what the platform handler received.
    ///
    /// ## Safety
    ///
    /// `raw` must be null or point to the platform context of the exception
    /// being handled, alive for as long as this value is used.
    #[must_use]
    pub unsafe fn from_platform(code: ExceptionCode, address: usize, thread_id: u64, raw: *mut c_void) -> Self
    {
        Self {
            code,
            address,
            thread_id,
            raw,
        }
    }

    /// A context without platform state, for simulated exceptions.
    ///
    /// Snapshot facilities write the dump without an exception record.
    #[must_use]
    pub fn synthetic(code: ExceptionCode, address: usize) -> Self
    {
        Self {
            code,
            address,
            thread_id: 0,
            raw: ptr::null_mut(),
        }
    }

    /// Exception code.
    #[must_use]
    pub fn code(&self) -> ExceptionCode
    {
        self.code
    }

    /// Faulting address.
    #[must_use]
    pub fn address(&self) -> usize
    {
        self.address
    }

    /// OS id of the faulting thread (0 when unknown).
    #[must_use]
    pub fn thread_id(&self) -> u64
    {
        self.thread_id
    }

    /// Platform context pointer, null for synthetic contexts.
    #[must_use]
    pub fn raw(&self) -> *mut c_void
    {
        self.raw
    }

    /// Whether this context carries real platform state.
    #[must_use]
    pub fn has_platform_state(&self) -> bool
    {
        !self.raw.is_null()
    }
}
