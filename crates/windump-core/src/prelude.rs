//! Common module for library exports

pub use crate::classifier::{classify, should_ignore, ExceptionCode, Verdict};
pub use crate::context::ExceptionContext;
pub use crate::error::{CaptureError, CaptureResult};
pub use crate::guard::InstallGuard;
pub use crate::interceptor::{CaptureState, Interception};
pub use crate::lifecycle::{install, trigger_self_test, uninstall, CrashCapture, ExceptionHook, HandlerToken};
pub use crate::report::ArtifactReport;
pub use crate::writer::{FacilityResolver, SnapshotFacility, SnapshotKind};
