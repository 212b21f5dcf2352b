//! # RAII Guards for Crash Capture
//!
//! Guards that restore state when dropped, so every exit path of the capture
//! pipeline (including a panic caught at the trampoline) leaves things the
//! way it found them.
//!
//! ## Guards
//!
//! - **ReentrancyGuard** / **CaptureClaim**: the process-wide "capture in
//!   flight" flag; the claim releases it on drop
//! - **InstallGuard**: uninstalls crash capture on drop
//!
//! ## Example
//!
//! ```rust
//! use windump_core::guard::ReentrancyGuard;
//!
//! let guard = ReentrancyGuard::new();
//! let claim = guard.try_claim().expect("idle guard");
//! // A nested fault while the claim is alive is skipped
//! assert!(guard.try_claim().is_none());
//! drop(claim);
//! assert!(!guard.is_held());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::CaptureResult;
use crate::lifecycle::CrashCapture;

/// Flag marking a capture as in flight.
///
/// Claimed with a compare-and-swap, so two threads faulting at the same time
/// cannot both pass: one captures, the other is skipped.
#[derive(Debug, Default)]
pub struct ReentrancyGuard
{
    busy: AtomicBool,
}

impl ReentrancyGuard
{
    /// A guard in the idle state.
    #[must_use]
    pub const fn new() -> Self
    {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    /// Claim the guard, or `None` when a capture is already running.
    #[must_use]
    pub fn try_claim(&self) -> Option<CaptureClaim<'_>>
    {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| CaptureClaim { guard: self })
    }

    /// Whether a capture currently holds the guard.
    #[must_use]
    pub fn is_held(&self) -> bool
    {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof that the holder owns the [`ReentrancyGuard`]; releases it on drop.
#[derive(Debug)]
pub struct CaptureClaim<'a>
{
    guard: &'a ReentrancyGuard,
}

impl Drop for CaptureClaim<'_>
{
    fn drop(&mut self)
    {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// RAII guard that uninstalls crash capture when dropped.
///
/// Returned by [`CrashCapture::scoped`]; mirrors the "install, get back the
/// uninstall function" entry point host applications use.
///
/// ```rust,no_run
/// use windump_core::CrashCapture;
///
/// let capture = CrashCapture::new();
/// {
///     let _guard = capture.scoped("/tmp/myapp-crash")?;
///     // faults in here are captured
/// }
/// assert!(!capture.is_installed());
/// # Ok::<(), windump_core::CaptureError>(())
/// ```
#[must_use = "dropping the guard uninstalls crash capture immediately"]
pub struct InstallGuard<'a>
{
    capture: &'a CrashCapture,
    active: bool,
}

impl<'a> InstallGuard<'a>
{
    pub(crate) fn new(capture: &'a CrashCapture) -> Self
    {
        Self { capture, active: true }
    }

    /// Uninstall now and report the result. Dropping afterwards is a no-op.
    ///
    /// ## Errors
    ///
    /// Whatever [`CrashCapture::uninstall`] returns.
    pub fn release(mut self) -> CaptureResult<()>
    {
        self.active = false;
        self.capture.uninstall()
    }

    /// Keep capture installed past the guard's lifetime.
    pub fn forget(mut self)
    {
        self.active = false;
    }
}

impl Drop for InstallGuard<'_>
{
    fn drop(&mut self)
    {
        if self.active {
            // Best effort uninstall
            if let Err(err) = self.capture.uninstall() {
                warn!("Failed to uninstall crash capture on drop: {err}");
            }
        }
    }
}
