//! # Exception Interceptor
//!
//! The logic behind the installed hook. Platform trampolines build an
//! [`ExceptionContext`] and call [`CaptureState::intercept`]; whatever it
//! returns, they tell the OS to keep searching for a handler. The interceptor
//! only watches.
//!
//! ## Pipeline
//!
//! 1. Classify the code; noise is let through untouched
//! 2. Claim the reentrancy guard; a fault during a capture is let through
//! 3. Append the entry header to `<path>.log`
//! 4. Run the [`DumpWriter`]
//!
//! This path runs inside exception dispatch: it does no tracing, takes no
//! locks and never allocates. The artifact paths are read through a
//! `RetiringSlot` and the log is opened from its pre-encoded path.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};

use chrono::Utc;

use crate::classifier;
use crate::context::ExceptionContext;
use crate::error::CaptureResult;
use crate::guard::ReentrancyGuard;
use crate::platform;
use crate::slot::RetiringSlot;
use crate::writer::{log_line, ArtifactPaths, DumpWriter, FacilityResolver};

/// What the platform handler tells the OS after the interceptor ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition
{
    /// Keep looking for a handler (`EXCEPTION_CONTINUE_SEARCH` / chain to the previous signal action).
    ContinueSearch,
}

/// What the interceptor did with one exception.
#[derive(Debug)]
pub enum Interception
{
    /// Classified as noise.
    Ignored,
    /// Another capture held the reentrancy guard.
    Reentrant,
    /// No artifact path configured yet.
    Unconfigured,
    /// A capture ran; carries the dump writer's outcome (already logged).
    Captured(CaptureResult<()>),
}

impl Interception
{
    /// Always [`Disposition::ContinueSearch`].
    #[must_use]
    pub fn disposition(&self) -> Disposition
    {
        Disposition::ContinueSearch
    }

    /// Whether the dump writer was invoked.
    #[must_use]
    pub fn attempted_dump(&self) -> bool
    {
        matches!(self, Self::Captured(_))
    }
}

/// Shared state read by the installed hook.
pub struct CaptureState
{
    artifacts: RetiringSlot<ArtifactPaths>,
    guard: ReentrancyGuard,
    resolver: Box<dyn FacilityResolver>,
}

impl fmt::Debug for CaptureState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("CaptureState")
            .field("artifacts", &self.artifacts.get().map(ArtifactPaths::base))
            .field("capturing", &self.guard.is_held())
            .field("resolver", &self.resolver.name())
            .finish()
    }
}

impl Default for CaptureState
{
    fn default() -> Self
    {
        Self::new(platform::default_resolver())
    }
}

impl CaptureState
{
    /// State with no artifact path, using `resolver` for snapshots.
    #[must_use]
    pub fn new(resolver: Box<dyn FacilityResolver>) -> Self
    {
        Self {
            artifacts: RetiringSlot::new(),
            guard: ReentrancyGuard::new(),
            resolver,
        }
    }

    /// Point captures at `base` (no extension).
    ///
    /// ## Errors
    ///
    /// [`crate::CaptureError::InvalidPath`] if `base` cannot be used.
    pub fn set_artifact_path(&self, base: &str) -> CaptureResult<()>
    {
        let paths = ArtifactPaths::new(base)?;
        self.artifacts.replace(paths);
        Ok(())
    }

    /// Current artifact locations.
    #[must_use]
    pub fn artifact_paths(&self) -> Option<&ArtifactPaths>
    {
        self.artifacts.get()
    }

    /// The reentrancy guard.
    #[must_use]
    pub fn guard(&self) -> &ReentrancyGuard
    {
        &self.guard
    }

    /// Run the capture pipeline for one exception.
    pub fn intercept(&self, context: &ExceptionContext) -> Interception
    {
        if classifier::should_ignore(context.code().raw()) {
            return Interception::Ignored;
        }

        let Some(_claim) = self.guard.try_claim() else {
            return Interception::Reentrant;
        };

        let Some(artifacts) = self.artifact_paths() else {
            return Interception::Unconfigured;
        };

        let mut log = CaptureLog::open(artifacts);
        write_entry_header(&mut log, context);
        let outcome = DumpWriter::new(self.resolver.as_ref()).write(&mut log, context, artifacts);
        Interception::Captured(outcome)
    }
}

/// `<base>.log` opened for appending, or a sink when it cannot be opened.
///
/// An unopenable log must not stop the dump; its lines go nowhere instead.
pub enum CaptureLog
{
    /// The artifact log
    File(File),
    /// Lines are dropped
    Discard(io::Sink),
}

impl CaptureLog
{
    /// Open the log for `artifacts`.
    #[must_use]
    pub fn open(artifacts: &ArtifactPaths) -> Self
    {
        match platform::open_log(artifacts.log_native()) {
            Ok(file) => Self::File(file),
            Err(_) => Self::Discard(io::sink()),
        }
    }
}

impl Write for CaptureLog
{
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>
    {
        match self {
            Self::File(file) => file.write(bytes),
            Self::Discard(sink) => sink.write(bytes),
        }
    }

    fn flush(&mut self) -> io::Result<()>
    {
        match self {
            Self::File(file) => file.flush(),
            Self::Discard(sink) => sink.flush(),
        }
    }
}

/// Write the per-exception header lines.
pub fn write_entry_header(log: &mut dyn Write, context: &ExceptionContext)
{
    log_line(log, format_args!("Exception time: {}", Utc::now().timestamp()));
    log_line(log, format_args!("Exception code: {}", context.code()));
    log_line(log, format_args!("Exception address: {:#x}", context.address()));
}

#[cfg(test)]
mod tests
{
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, OnceLock};

    use super::*;
    use crate::classifier::ExceptionCode;
    use crate::writer::{SnapshotFacility, SnapshotKind, UseFacility};

    /// Shared between the test and its resolver; `nested` lets a snapshot
    /// fault back into the state that is capturing.
    #[derive(Default)]
    struct Recorder
    {
        snapshots: AtomicUsize,
        nested: OnceLock<Arc<CaptureState>>,
        nested_outcome: OnceLock<String>,
    }

    struct RecordingFacility(Arc<Recorder>);

    impl SnapshotFacility for RecordingFacility
    {
        fn write_snapshot(&self, context: &ExceptionContext, mut destination: &File, _kind: SnapshotKind) -> CaptureResult<()>
        {
            self.0.snapshots.fetch_add(1, Ordering::SeqCst);
            if let Some(state) = self.0.nested.get() {
                let nested = state.intercept(context);
                let _ = self.0.nested_outcome.set(format!("{nested:?}"));
            }
            destination.write_all(b"MDMP")?;
            Ok(())
        }
    }

    struct RecordingResolver(Arc<Recorder>);

    impl FacilityResolver for RecordingResolver
    {
        fn name(&self) -> &str
        {
            "recording"
        }

        fn resolve(&self, use_facility: &mut UseFacility<'_>) -> CaptureResult<()>
        {
            use_facility(&RecordingFacility(Arc::clone(&self.0)))
        }
    }

    fn recorded_state() -> (Arc<CaptureState>, Arc<Recorder>)
    {
        let recorder = Arc::new(Recorder::default());
        let state = Arc::new(CaptureState::new(Box::new(RecordingResolver(Arc::clone(&recorder)))));
        (state, recorder)
    }

    #[test]
    fn test_ignored_codes_never_touch_disk()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let (state, recorder) = recorded_state();
        state.set_artifact_path(base.to_str().unwrap()).unwrap();

        for code in [0x4001_0006, 0xE06D_7363, 0xE043_4352] {
            let outcome = state.intercept(&ExceptionContext::synthetic(ExceptionCode(code), 0x1000));
            assert!(matches!(outcome, Interception::Ignored));
            assert_eq!(outcome.disposition(), Disposition::ContinueSearch);
        }

        assert_eq!(recorder.snapshots.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("crash.log").exists());
    }

    #[test]
    fn test_access_violation_produces_one_entry_and_one_dump()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let (state, recorder) = recorded_state();
        state.set_artifact_path(base.to_str().unwrap()).unwrap();

        let outcome = state.intercept(&ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0xdead));

        assert!(matches!(outcome, Interception::Captured(Ok(()))));
        assert_eq!(outcome.disposition(), Disposition::ContinueSearch);
        assert_eq!(recorder.snapshots.load(Ordering::SeqCst), 1);
        let log = fs::read_to_string(dir.path().join("crash.log")).unwrap();
        assert_eq!(log.matches("Exception code: c0000005").count(), 1);
        assert!(log.contains("Exception address: 0xdead"));
        assert!(log.lines().any(|line| line.starts_with("Exception time: ")));
        assert!(log.ends_with("success\n"));
        assert_eq!(fs::read(dir.path().join("crash.dmp")).unwrap(), b"MDMP");
        assert!(!state.guard().is_held());
    }

    #[test]
    fn test_log_is_appended_across_captures()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let (state, _recorder) = recorded_state();
        state.set_artifact_path(base.to_str().unwrap()).unwrap();

        state.intercept(&ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x1));
        state.intercept(&ExceptionContext::synthetic(ExceptionCode::ILLEGAL_INSTRUCTION, 0x2));

        let log = fs::read_to_string(dir.path().join("crash.log")).unwrap();
        assert_eq!(log.matches("Exception time: ").count(), 2);
        assert!(log.contains("Exception code: c000001d"));
    }

    #[test]
    fn test_fault_during_capture_is_not_captured_again()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let (state, recorder) = recorded_state();
        state.set_artifact_path(base.to_str().unwrap()).unwrap();
        assert!(recorder.nested.set(Arc::clone(&state)).is_ok());

        let outcome = state.intercept(&ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x10));

        assert!(outcome.attempted_dump());
        assert_eq!(recorder.snapshots.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.nested_outcome.get().map(String::as_str), Some("Reentrant"));
        let log = fs::read_to_string(dir.path().join("crash.log")).unwrap();
        assert_eq!(log.matches("Exception time: ").count(), 1);
        assert!(!state.guard().is_held());
    }

    #[test]
    fn test_held_guard_skips_capture()
    {
        let (state, recorder) = recorded_state();
        state.set_artifact_path("/nonexistent/crash").unwrap();

        let _claim = state.guard().try_claim().unwrap();
        let outcome = state.intercept(&ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x10));

        assert!(matches!(outcome, Interception::Reentrant));
        assert_eq!(recorder.snapshots.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unconfigured_state_does_nothing()
    {
        let (state, recorder) = recorded_state();

        let outcome = state.intercept(&ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x10));

        assert!(matches!(outcome, Interception::Unconfigured));
        assert_eq!(recorder.snapshots.load(Ordering::SeqCst), 0);
        assert!(!state.guard().is_held());
    }

    #[test]
    fn test_unopenable_log_still_writes_dump()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        fs::create_dir(dir.path().join("crash.log")).unwrap();
        let (state, recorder) = recorded_state();
        state.set_artifact_path(base.to_str().unwrap()).unwrap();

        let outcome = state.intercept(&ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x10));

        assert!(matches!(outcome, Interception::Captured(Ok(()))));
        assert_eq!(recorder.snapshots.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(dir.path().join("crash.dmp")).unwrap(), b"MDMP");
    }

    #[test]
    fn test_path_update_redirects_next_capture()
    {
        let dir = tempfile::tempdir().unwrap();
        let (state, _recorder) = recorded_state();
        state.set_artifact_path(dir.path().join("first").to_str().unwrap()).unwrap();
        state.set_artifact_path(dir.path().join("second").to_str().unwrap()).unwrap();

        state.intercept(&ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x10));

        assert!(!dir.path().join("first.log").exists());
        assert!(dir.path().join("second.log").exists());
        assert!(dir.path().join("second.dmp").exists());
    }
}
