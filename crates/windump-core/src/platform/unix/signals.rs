//! # Signal Hook
//!
//! Installs one trampoline for the fatal signals and chains to whatever was
//! installed before, so the process behaves as if the hook were absent:
//!
//! - previous handler is a function: call it with the same arguments
//! - previous disposition is `SIG_DFL`/`SIG_IGN`: restore it and return; a
//!   hardware fault re-executes and now hits the restored disposition, a
//!   signal sent with `kill`/`raise` is raised again
//!
//! The trampoline finds the [`CaptureState`] through a process-wide slot, so
//! only one hook can be registered at a time. Registration and removal are
//! serialized by a lock; the trampoline reads the slot without it.
//!
//! ## References
//!
//! - [sigaction(2) man page](https://man7.org/linux/man-pages/man2/sigaction.2.html)
//! - [signal-safety(7) man page](https://man7.org/linux/man-pages/man7/signal-safety.7.html)

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::{mem, ptr};

use libc::{c_int, siginfo_t};
use tracing::debug;

use super::current_thread_id;
use crate::classifier::ExceptionCode;
use crate::context::ExceptionContext;
use crate::error::{CaptureError, CaptureResult};
use crate::interceptor::CaptureState;
use crate::lifecycle::{ExceptionHook, HandlerToken};
use crate::slot::RetiringSlot;

/// Signals the hook observes.
pub const HANDLED_SIGNALS: [c_int; 5] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE, libc::SIGABRT];

/// Windows exception code reported for `signal`.
#[must_use]
pub fn exception_code_for(signal: c_int) -> ExceptionCode
{
    match signal {
        libc::SIGSEGV => ExceptionCode::ACCESS_VIOLATION,
        libc::SIGBUS => ExceptionCode::IN_PAGE_ERROR,
        libc::SIGILL => ExceptionCode::ILLEGAL_INSTRUCTION,
        libc::SIGFPE => ExceptionCode::INT_DIVIDE_BY_ZERO,
        libc::SIGABRT => ExceptionCode::FAIL_FAST,
        libc::SIGTRAP => ExceptionCode::BREAKPOINT,
        // Informational severity: classified as noise
        other => ExceptionCode(other as u32),
    }
}

struct Registration
{
    token: usize,
    state: Arc<CaptureState>,
    previous: Vec<(c_int, libc::sigaction)>,
}

impl Registration
{
    fn previous_action(&self, signal: c_int) -> Option<&libc::sigaction>
    {
        self.previous
            .iter()
            .find(|(candidate, _)| *candidate == signal)
            .map(|(_, action)| action)
    }
}

static REGISTRATION: RetiringSlot<Registration> = RetiringSlot::new();
static REGISTER_LOCK: Mutex<()> = Mutex::new(());
static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

fn already_registered() -> CaptureError
{
    CaptureError::HookRegistration("a signal hook is already registered in this process".to_string())
}

/// [`ExceptionHook`] backed by `sigaction`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformHook;

impl ExceptionHook for PlatformHook
{
    fn register(&self, state: Arc<CaptureState>) -> CaptureResult<HandlerToken>
    {
        let _serialized = REGISTER_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        if REGISTRATION.is_occupied() {
            return Err(already_registered());
        }

        let mut previous = Vec::with_capacity(HANDLED_SIGNALS.len());
        for signal in HANDLED_SIGNALS {
            previous.push((signal, query_action(signal)?));
        }

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        // Published before the first sigaction so the trampoline can always chain
        REGISTRATION
            .claim(Registration { token, state, previous })
            .map_err(|_| already_registered())?;

        let action = trampoline_action();
        for (installed, signal) in HANDLED_SIGNALS.iter().enumerate() {
            if let Err(err) = set_action(*signal, &action) {
                if let Some(registration) = REGISTRATION.get() {
                    restore(&registration.previous[..installed]);
                }
                REGISTRATION.clear();
                return Err(err);
            }
        }

        debug!(token, signals = ?HANDLED_SIGNALS, "Signal hook registered");
        Ok(HandlerToken::from_raw(token))
    }

    fn unregister(&self, token: HandlerToken) -> CaptureResult<()>
    {
        let _serialized = REGISTER_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = REGISTRATION.get() else {
            return Err(CaptureError::NotInstalled);
        };
        if current.token != token.raw() {
            return Err(CaptureError::HookRegistration(format!(
                "token {} does not match the registered hook",
                token.raw()
            )));
        }

        restore(&current.previous);
        REGISTRATION.clear();
        debug!(token = token.raw(), "Signal hook removed");
        Ok(())
    }
}

fn query_action(signal: c_int) -> CaptureResult<libc::sigaction>
{
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    if unsafe { libc::sigaction(signal, ptr::null(), &mut action) } != 0 {
        return Err(CaptureError::HookRegistration(format!(
            "sigaction({signal}) query failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(action)
}

fn set_action(signal: c_int, action: &libc::sigaction) -> CaptureResult<()>
{
    if unsafe { libc::sigaction(signal, action, ptr::null_mut()) } != 0 {
        return Err(CaptureError::HookRegistration(format!(
            "sigaction({signal}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn restore(previous: &[(c_int, libc::sigaction)])
{
    for (signal, action) in previous {
        unsafe {
            libc::sigaction(*signal, action, ptr::null_mut());
        }
    }
}

fn trampoline_action() -> libc::sigaction
{
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handle_signal as *const () as usize;
    // No SA_ONSTACK: the 8 KiB alternate stacks std installs are too small for a capture
    action.sa_flags = libc::SA_SIGINFO;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    action
}

// kill(2)/raise(3)/sigqueue(3) set si_code <= 0
fn sent_by_process(info: *const siginfo_t) -> bool
{
    info.is_null() || unsafe { (*info).si_code } <= 0
}

extern "C" fn handle_signal(signal: c_int, info: *mut siginfo_t, ucontext: *mut c_void)
{
    let Some(registration) = REGISTRATION.get() else {
        fall_through(signal, None, info);
        return;
    };

    let address = if sent_by_process(info) {
        0
    } else {
        unsafe { (*info).si_addr() as usize }
    };

    // A panic must not unwind into the kernel's signal frame
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `ucontext` is the context the kernel passed for this signal
        let context =
            unsafe { ExceptionContext::from_platform(exception_code_for(signal), address, current_thread_id(), ucontext) };
        registration.state.intercept(&context).disposition()
    }));

    match registration.previous_action(signal) {
        Some(previous) if !is_disposition(previous.sa_sigaction) => unsafe {
            if previous.sa_flags & libc::SA_SIGINFO != 0 {
                let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = mem::transmute(previous.sa_sigaction);
                handler(signal, info, ucontext);
            } else {
                let handler: extern "C" fn(c_int) = mem::transmute(previous.sa_sigaction);
                handler(signal);
            }
        },
        previous => fall_through(signal, previous, info),
    }
}

fn is_disposition(handler: libc::sighandler_t) -> bool
{
    handler == libc::SIG_DFL || handler == libc::SIG_IGN
}

// Put back the previous disposition (default when unknown) and let the fault happen again.
fn fall_through(signal: c_int, previous: Option<&libc::sigaction>, info: *const siginfo_t)
{
    unsafe {
        match previous {
            Some(action) => {
                libc::sigaction(signal, action, ptr::null_mut());
            }
            None => {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
        if sent_by_process(info) {
            libc::raise(signal);
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_fatal_signals_map_to_captured_codes()
    {
        for signal in HANDLED_SIGNALS {
            let code = exception_code_for(signal);
            assert!(!crate::classifier::should_ignore(code.raw()), "signal {signal} maps to {code}");
        }
    }

    #[test]
    fn test_signal_mapping()
    {
        assert_eq!(exception_code_for(libc::SIGSEGV), ExceptionCode::ACCESS_VIOLATION);
        assert_eq!(exception_code_for(libc::SIGILL), ExceptionCode::ILLEGAL_INSTRUCTION);
        assert_eq!(exception_code_for(libc::SIGABRT), ExceptionCode::FAIL_FAST);
        assert!(crate::classifier::should_ignore(exception_code_for(libc::SIGUSR1).raw()));
    }
}
