//! # Vectored Exception Hook
//!
//! One handler at the front of the vectored chain. It never handles
//! anything: after the interceptor ran it returns
//! `EXCEPTION_CONTINUE_SEARCH`, so frame-based handlers and the default
//! unhandled-exception path behave as if it were absent.
//!
//! Registration and removal are serialized by a lock; the handler reads the
//! registration slot without it.
//!
//! ## References
//!
//! - [AddVectoredExceptionHandler](https://learn.microsoft.com/en-us/windows/win32/api/errhandlingapi/nf-errhandlingapi-addvectoredexceptionhandler)
//! - [Vectored Exception Handling](https://learn.microsoft.com/en-us/windows/win32/debug/vectored-exception-handling)

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_POINTERS,
};
use windows_sys::Win32::System::Threading::GetCurrentThreadId;

use crate::classifier::ExceptionCode;
use crate::context::ExceptionContext;
use crate::error::{CaptureError, CaptureResult};
use crate::interceptor::{CaptureState, Disposition};
use crate::lifecycle::{ExceptionHook, HandlerToken};
use crate::slot::RetiringSlot;

const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
// Called before every other vectored handler
const FIRST_HANDLER: u32 = 1;

struct Registration
{
    handle: usize,
    state: Arc<CaptureState>,
}

static REGISTRATION: RetiringSlot<Registration> = RetiringSlot::new();
static REGISTER_LOCK: Mutex<()> = Mutex::new(());

fn already_registered() -> CaptureError
{
    CaptureError::HookRegistration("a vectored handler is already registered in this process".to_string())
}

/// [`ExceptionHook`] backed by `AddVectoredExceptionHandler`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformHook;

impl ExceptionHook for PlatformHook
{
    fn register(&self, state: Arc<CaptureState>) -> CaptureResult<HandlerToken>
    {
        let _serialized = REGISTER_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        // Published first: the handler is live as soon as it is added
        REGISTRATION
            .claim(Registration {
                handle: 0,
                state: Arc::clone(&state),
            })
            .map_err(|_| already_registered())?;
        let handle = unsafe { AddVectoredExceptionHandler(FIRST_HANDLER, Some(handle_exception)) };
        if handle.is_null() {
            REGISTRATION.clear();
            return Err(CaptureError::HookRegistration(format!(
                "AddVectoredExceptionHandler failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let handle = handle as usize;
        REGISTRATION.replace(Registration { handle, state });
        debug!(handle, "Vectored exception handler registered");
        Ok(HandlerToken::from_raw(handle))
    }

    fn unregister(&self, token: HandlerToken) -> CaptureResult<()>
    {
        let _serialized = REGISTER_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = REGISTRATION.get() else {
            return Err(CaptureError::NotInstalled);
        };
        if current.handle != token.raw() {
            return Err(CaptureError::HookRegistration(format!(
                "handle {:#x} does not match the registered handler",
                token.raw()
            )));
        }

        if unsafe { RemoveVectoredExceptionHandler(token.raw() as *const c_void) } == 0 {
            return Err(CaptureError::HookRegistration(format!(
                "RemoveVectoredExceptionHandler failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        REGISTRATION.clear();
        debug!(handle = token.raw(), "Vectored exception handler removed");
        Ok(())
    }
}

unsafe extern "system" fn handle_exception(pointers: *mut EXCEPTION_POINTERS) -> i32
{
    let Some(registration) = REGISTRATION.get() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    if pointers.is_null() || unsafe { (*pointers).ExceptionRecord.is_null() } {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let record = unsafe { &*(*pointers).ExceptionRecord };
    let code = ExceptionCode(record.ExceptionCode as u32);
    let address = record.ExceptionAddress as usize;

    // A panic must not unwind across the system frame
    let disposition = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `pointers` is the exception being dispatched to this handler
        let context =
            unsafe { ExceptionContext::from_platform(code, address, u64::from(GetCurrentThreadId()), pointers.cast()) };
        registration.state.intercept(&context).disposition()
    }))
    .unwrap_or(Disposition::ContinueSearch);

    match disposition {
        Disposition::ContinueSearch => EXCEPTION_CONTINUE_SEARCH,
    }
}
