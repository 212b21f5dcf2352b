//! # Error Types
//!
//! Error handling for crash capture.
//!
//! Errors fall into two groups. Lifecycle errors (`InvalidPath`, `NotInstalled`,
//! `HookRegistration`) are returned to the caller of `install`/`uninstall`.
//! Capture errors never leave the exception handler: the dump writer prints
//! them into `<path>.log`, which is why their `Display` output is the exact
//! log line.

use std::io;

use thiserror::Error;

/// Main error type for crash capture operations
#[derive(Error, Debug)]
pub enum CaptureError
{
    /// The dump library could not be loaded at capture time.
    ///
    /// `code` is the platform error code (`GetLastError()` on Windows).
    #[error("{library} not loaded: {code:x}")]
    FacilityUnavailable
    {
        /// Library that failed to load
        library: String,
        /// Platform error code
        code: u32,
    },

    /// The dump library loaded but does not export the expected entry point
    ///
    /// Usually an old or foreign copy of the library shadowing the system one.
    #[error("wrong version of {library}")]
    FacilityMismatch
    {
        /// Library that was loaded
        library: String,
        /// Missing symbol
        symbol: &'static str,
    },

    /// The `.dmp` artifact could not be created (permissions, missing directory, disk full).
    ///
    /// Built inside the exception handler, so it carries no path.
    #[error("failed to create dmp file: {code:x}")]
    ArtifactCreate
    {
        /// Platform error code
        code: u32,
    },

    /// The snapshot routine itself reported failure.
    #[error("failed to write dump: {code:x}")]
    SnapshotFailed
    {
        /// Platform error code
        code: u32,
    },

    /// The artifact base path cannot be used
    ///
    /// Examples:
    /// - Empty path
    /// - Interior NUL byte (cannot be passed to the OS)
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    /// `uninstall` was called while no interceptor is registered.
    #[error("Crash capture is not installed")]
    NotInstalled,

    /// The platform refused to register the exception hook.
    #[error("Failed to register exception hook: {0}")]
    HookRegistration(String),

    /// I/O error outside the capture path (reading artifacts back, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError
{
    /// Build an [`CaptureError::ArtifactCreate`] from the error returned by the OS.
    #[must_use]
    pub fn artifact_create(err: &io::Error) -> Self
    {
        Self::ArtifactCreate { code: os_code(err) }
    }

    /// Platform error code carried by this error, if any.
    #[must_use]
    pub fn platform_code(&self) -> Option<u32>
    {
        match self {
            Self::FacilityUnavailable { code, .. } | Self::ArtifactCreate { code } | Self::SnapshotFailed { code } => Some(*code),
            Self::Io(err) => err.raw_os_error().map(|raw| raw as u32),
            _ => None,
        }
    }
}

/// Raw OS error code of `err`, or 0 when the error did not come from the OS.
#[must_use]
pub fn os_code(err: &io::Error) -> u32
{
    #[allow(clippy::cast_sign_loss)]
    err.raw_os_error().map_or(0, |raw| raw as u32)
}

/// Convenience type alias for `Result<T, CaptureError>`
///
/// ```rust
/// use windump_core::error::CaptureResult;
/// fn foo() -> CaptureResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;
