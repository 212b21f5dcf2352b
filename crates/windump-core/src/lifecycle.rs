//! # Lifecycle Controller
//!
//! Installs and removes the process-wide hook, and provides the self-test
//! fault.
//!
//! ## State machine
//!
//! ```text
//!              install(path)                 install(path): path update only
//! UNINSTALLED ───────────────▶ INSTALLED ◀──┐
//!      ▲                           │  └─────┘
//!      └───────── uninstall() ─────┘
//! ```
//!
//! [`CrashCapture`] owns one [`CaptureState`] and hands it to an
//! [`ExceptionHook`] at install. The process-wide instance behind
//! [`install`]/[`uninstall`] uses the platform hook; tests build their own
//! with fake hooks and resolvers.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::error::{CaptureError, CaptureResult};
use crate::guard::InstallGuard;
use crate::interceptor::CaptureState;
use crate::platform::{self, PlatformHook};
use crate::writer::FacilityResolver;

/// Opaque identifier of a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(usize);

impl HandlerToken
{
    /// Wrap a raw platform handle.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self
    {
        Self(raw)
    }

    /// The raw platform handle.
    #[must_use]
    pub const fn raw(self) -> usize
    {
        self.0
    }
}

/// Registers the trampoline that feeds exceptions into a [`CaptureState`].
pub trait ExceptionHook: Send + Sync
{
    /// Register a hook at the front of the exception notification chain.
    ///
    /// ## Errors
    ///
    /// [`CaptureError::HookRegistration`] if the platform refuses.
    fn register(&self, state: Arc<CaptureState>) -> CaptureResult<HandlerToken>;

    /// Remove the hook identified by `token`.
    ///
    /// ## Errors
    ///
    /// [`CaptureError::NotInstalled`] or [`CaptureError::HookRegistration`]
    /// when `token` is not the registered hook.
    fn unregister(&self, token: HandlerToken) -> CaptureResult<()>;
}

/// Install/uninstall controller around one [`CaptureState`].
pub struct CrashCapture
{
    state: Arc<CaptureState>,
    hook: Box<dyn ExceptionHook>,
    token: Mutex<Option<HandlerToken>>,
}

impl fmt::Debug for CrashCapture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("CrashCapture")
            .field("state", &self.state)
            .field("token", &*self.token_slot())
            .finish_non_exhaustive()
    }
}

impl Default for CrashCapture
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl CrashCapture
{
    /// A controller using the platform hook and snapshot facility.
    #[must_use]
    pub fn new() -> Self
    {
        Self::with_parts(Box::new(PlatformHook), platform::default_resolver())
    }

    /// A controller with an explicit hook and snapshot resolver.
    #[must_use]
    pub fn with_parts(hook: Box<dyn ExceptionHook>, resolver: Box<dyn FacilityResolver>) -> Self
    {
        Self {
            state: Arc::new(CaptureState::new(resolver)),
            hook,
            token: Mutex::new(None),
        }
    }

    /// Start capturing into `<path>.log` / `<path>.dmp`.
    ///
    /// Registers the hook on the first call; later calls only change the path.
    ///
    /// ## Errors
    ///
    /// - [`CaptureError::InvalidPath`]: `path` is empty or not encodable
    /// - [`CaptureError::HookRegistration`]: the platform refused the hook
    pub fn install(&self, path: &str) -> CaptureResult<()>
    {
        self.state.set_artifact_path(path)?;

        let mut token = self.token_slot();
        if token.is_some() {
            debug!(path, "Crash capture already installed, artifact path updated");
            return Ok(());
        }

        let registered = self.hook.register(Arc::clone(&self.state))?;
        *token = Some(registered);
        info!(path, token = registered.raw(), "Crash capture installed");
        Ok(())
    }

    /// Stop capturing.
    ///
    /// ## Errors
    ///
    /// - [`CaptureError::NotInstalled`]: nothing to remove
    /// - whatever the hook reports while unregistering; the token is kept then
    pub fn uninstall(&self) -> CaptureResult<()>
    {
        let mut token = self.token_slot();
        let Some(registered) = *token else {
            return Err(CaptureError::NotInstalled);
        };

        self.hook.unregister(registered)?;
        *token = None;
        info!(token = registered.raw(), "Crash capture uninstalled");
        Ok(())
    }

    /// Install and get a guard that uninstalls on drop.
    ///
    /// ## Errors
    ///
    /// Same as [`CrashCapture::install`].
    pub fn scoped(&self, path: &str) -> CaptureResult<InstallGuard<'_>>
    {
        self.install(path)?;
        Ok(InstallGuard::new(self))
    }

    /// Whether a hook is registered.
    #[must_use]
    pub fn is_installed(&self) -> bool
    {
        self.token_slot().is_some()
    }

    /// The shared state the hook reads.
    #[must_use]
    pub fn state(&self) -> &Arc<CaptureState>
    {
        &self.state
    }

    fn token_slot(&self) -> MutexGuard<'_, Option<HandlerToken>>
    {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static GLOBAL: Lazy<CrashCapture> = Lazy::new(CrashCapture::new);

/// The process-wide controller.
#[must_use]
pub fn global() -> &'static CrashCapture
{
    &GLOBAL
}

/// Start process-wide crash capture into `<path>.log` / `<path>.dmp`.
///
/// ```rust,no_run
/// windump_core::install("/var/tmp/myapp-crash")?;
/// # Ok::<(), windump_core::CaptureError>(())
/// ```
///
/// ## Errors
///
/// See [`CrashCapture::install`].
pub fn install(path: &str) -> CaptureResult<()>
{
    GLOBAL.install(path)
}

/// Stop process-wide crash capture.
///
/// ## Errors
///
/// See [`CrashCapture::uninstall`].
pub fn uninstall() -> CaptureResult<()>
{
    GLOBAL.uninstall()
}

/// Crash the process with an access violation.
///
/// Exercises the whole pipeline: the write lands on an unmapped page, the
/// hook captures it and the process then dies as it would without the hook.
pub fn trigger_self_test() -> !
{
    info!("Triggering crash capture self test");

    // Low page, never mapped
    let invalid = 0x10 as *mut u8;
    unsafe {
        invalid.write_volatile(0);
    }

    // Only reached if something swallowed the fault
    std::process::abort()
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::platform::default_resolver;

    #[derive(Default)]
    struct Counters
    {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
    }

    struct CountingHook(Arc<Counters>);

    impl ExceptionHook for CountingHook
    {
        fn register(&self, _state: Arc<CaptureState>) -> CaptureResult<HandlerToken>
        {
            let count = self.0.registered.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerToken::from_raw(0x1000 + count))
        }

        fn unregister(&self, _token: HandlerToken) -> CaptureResult<()>
        {
            self.0.unregistered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counted() -> (CrashCapture, Arc<Counters>)
    {
        let counters = Arc::new(Counters::default());
        let capture = CrashCapture::with_parts(Box::new(CountingHook(Arc::clone(&counters))), default_resolver());
        (capture, counters)
    }

    #[test]
    fn test_repeated_install_registers_once()
    {
        let (capture, counters) = counted();

        capture.install("/tmp/first").unwrap();
        capture.install("/tmp/first").unwrap();
        capture.install("/tmp/second").unwrap();

        assert_eq!(counters.registered.load(Ordering::SeqCst), 1);
        assert!(capture.is_installed());
        assert_eq!(capture.state().artifact_paths().unwrap().base(), "/tmp/second");
    }

    #[test]
    fn test_uninstall_without_install_is_rejected()
    {
        let (capture, counters) = counted();

        assert!(matches!(capture.uninstall(), Err(CaptureError::NotInstalled)));
        assert_eq!(counters.unregistered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_install_uninstall_install_cycle()
    {
        let (capture, counters) = counted();

        capture.install("/tmp/crash").unwrap();
        capture.uninstall().unwrap();
        assert!(!capture.is_installed());
        capture.install("/tmp/crash").unwrap();

        assert_eq!(counters.registered.load(Ordering::SeqCst), 2);
        assert_eq!(counters.unregistered.load(Ordering::SeqCst), 1);
        assert!(matches!(capture.uninstall(), Ok(())));
        assert!(matches!(capture.uninstall(), Err(CaptureError::NotInstalled)));
    }

    #[test]
    fn test_invalid_path_does_not_register()
    {
        let (capture, counters) = counted();

        assert!(matches!(capture.install(""), Err(CaptureError::InvalidPath(_))));
        assert_eq!(counters.registered.load(Ordering::SeqCst), 0);
        assert!(!capture.is_installed());
    }

    #[test]
    fn test_scoped_install_uninstalls_on_drop()
    {
        let (capture, counters) = counted();

        {
            let _guard = capture.scoped("/tmp/crash").unwrap();
            assert!(capture.is_installed());
        }

        assert!(!capture.is_installed());
        assert_eq!(counters.unregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scoped_release_and_forget()
    {
        let (capture, counters) = counted();

        capture.scoped("/tmp/crash").unwrap().release().unwrap();
        assert!(!capture.is_installed());

        capture.scoped("/tmp/crash").unwrap().forget();
        assert!(capture.is_installed());
        assert_eq!(counters.unregistered.load(Ordering::SeqCst), 1);
    }
}
