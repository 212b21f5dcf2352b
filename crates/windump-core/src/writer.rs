//! # Dump Writer
//!
//! Writes `<path>.dmp` for one exception and narrates the attempt into the
//! capture log.
//!
//! The snapshot routine is not linked in. A [`FacilityResolver`] looks it up
//! at capture time (on Windows, `MiniDumpWriteDump` out of `dbghelp.dll`),
//! so a missing or mismatched library costs one log line instead of the
//! whole process. Tests swap in their own resolver.
//!
//! Nothing in here returns early without logging: each failure becomes the
//! `Display` of a [`CaptureError`] on its own line.
//!
//! Nothing in here touches the heap. A fault inside `malloc` leaves the
//! allocator locked, so log lines are formatted into a [`LineBuffer`] on the
//! stack and both artifacts are opened from paths encoded at install time.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::context::ExceptionContext;
use crate::error::{CaptureError, CaptureResult};
use crate::platform::{self, NativePath};

/// Extension of the dump artifact.
pub const DUMP_EXTENSION: &str = "dmp";
/// Extension of the capture log.
pub const LOG_EXTENSION: &str = "log";

/// Longest log line kept; anything past it is cut.
pub const LINE_CAPACITY: usize = 1024;

/// How much of the process goes into the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotKind
{
    /// Faulting thread context, stacks and the module list; no heap.
    ///
    /// `MiniDumpNormal` on Windows.
    #[default]
    Minimal,
}

impl SnapshotKind
{
    /// The `MINIDUMP_TYPE` flags for this kind.
    #[must_use]
    pub const fn minidump_flags(self) -> u32
    {
        match self {
            Self::Minimal => 0x0000_0000,
        }
    }
}

/// A resolved snapshot routine.
pub trait SnapshotFacility
{
    /// Write a snapshot of the current process into `destination`.
    ///
    /// ## Errors
    ///
    /// [`CaptureError::SnapshotFailed`] with the platform error code.
    fn write_snapshot(&self, context: &ExceptionContext, destination: &File, kind: SnapshotKind) -> CaptureResult<()>;
}

/// Callback handed the resolved facility.
pub type UseFacility<'f> = dyn FnMut(&dyn SnapshotFacility) -> CaptureResult<()> + 'f;

/// Looks up a [`SnapshotFacility`] at capture time.
pub trait FacilityResolver: Send + Sync
{
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Load the facility, run `use_facility` with it, then release it.
    ///
    /// The facility only lives for the call, so nothing has to be boxed
    /// while an exception is being dispatched.
    ///
    /// ## Errors
    ///
    /// - [`CaptureError::FacilityUnavailable`]: the library could not be loaded
    /// - [`CaptureError::FacilityMismatch`]: the entry point is missing
    /// - whatever `use_facility` returns
    fn resolve(&self, use_facility: &mut UseFacility<'_>) -> CaptureResult<()>;
}

/// One log line formatted on the stack.
///
/// Writes past [`LINE_CAPACITY`] are dropped, never reallocated.
pub struct LineBuffer
{
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl Default for LineBuffer
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl LineBuffer
{
    /// An empty line.
    #[must_use]
    pub const fn new() -> Self
    {
        Self {
            bytes: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    /// Format `args` followed by a newline.
    #[must_use]
    pub fn line(args: fmt::Arguments<'_>) -> Self
    {
        let mut buffer = Self::new();
        let _ = fmt::Write::write_fmt(&mut buffer, args);
        // Always room for the terminator
        if buffer.len == LINE_CAPACITY {
            buffer.len -= 1;
        }
        buffer.bytes[buffer.len] = b'\n';
        buffer.len += 1;
        buffer
    }

    /// The formatted bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes[..self.len]
    }
}

impl fmt::Write for LineBuffer
{
    fn write_str(&mut self, text: &str) -> fmt::Result
    {
        let room = LINE_CAPACITY - self.len;
        let taken = text.len().min(room);
        self.bytes[self.len..self.len + taken].copy_from_slice(&text.as_bytes()[..taken]);
        self.len += taken;
        if taken < text.len() {
            return Err(fmt::Error);
        }
        Ok(())
    }
}

/// Write one line to `log` with a single `write` call.
pub fn log_line(log: &mut dyn Write, args: fmt::Arguments<'_>)
{
    let line = LineBuffer::line(args);
    let _ = log.write_all(line.as_bytes());
}

/// Artifact locations derived from the base path given to `install`.
#[derive(Debug, Clone)]
pub struct ArtifactPaths
{
    base: String,
    log: PathBuf,
    dump: PathBuf,
    log_native: NativePath,
    dump_native: NativePath,
}

impl ArtifactPaths
{
    /// Derive the log and dump paths for `base` (which has no extension).
    ///
    /// ## Errors
    ///
    /// [`CaptureError::InvalidPath`] when `base` is empty or cannot be
    /// encoded for the OS.
    pub fn new(base: &str) -> CaptureResult<Self>
    {
        if base.is_empty() {
            return Err(CaptureError::InvalidPath("empty path".to_string()));
        }

        let log = with_extension(base, LOG_EXTENSION);
        let dump = with_extension(base, DUMP_EXTENSION);
        let log_native = platform::native_path(&log)?;
        let dump_native = platform::native_path(&dump)?;

        Ok(Self {
            base: base.to_string(),
            log,
            dump,
            log_native,
            dump_native,
        })
    }

    /// Base path as given to `install`.
    #[must_use]
    pub fn base(&self) -> &str
    {
        &self.base
    }

    /// `<base>.log`
    #[must_use]
    pub fn log(&self) -> &Path
    {
        &self.log
    }

    /// `<base>.dmp`
    #[must_use]
    pub fn dump(&self) -> &Path
    {
        &self.dump
    }

    /// Log path pre-encoded for the OS.
    #[must_use]
    pub fn log_native(&self) -> &NativePath
    {
        &self.log_native
    }

    /// Dump path pre-encoded for the OS.
    #[must_use]
    pub fn dump_native(&self) -> &NativePath
    {
        &self.dump_native
    }
}

// Appends instead of `Path::with_extension`, which would eat a dot in the base name.
fn with_extension(base: &str, extension: &str) -> PathBuf
{
    PathBuf::from(format!("{base}.{extension}"))
}

/// Produces the dump artifact for one exception.
pub struct DumpWriter<'a>
{
    resolver: &'a dyn FacilityResolver,
    kind: SnapshotKind,
}

impl<'a> DumpWriter<'a>
{
    /// A writer using `resolver` for the snapshot routine.
    #[must_use]
    pub fn new(resolver: &'a dyn FacilityResolver) -> Self
    {
        Self {
            resolver,
            kind: SnapshotKind::Minimal,
        }
    }

    /// Write the dump for `context` to `artifacts.dump()` and log the outcome to `log`.
    ///
    /// The returned result is informational; every failure has already been
    /// written to `log` by the time this returns.
    pub fn write(&self, log: &mut dyn Write, context: &ExceptionContext, artifacts: &ArtifactPaths) -> CaptureResult<()>
    {
        let result = self.write_dump(log, context, artifacts);
        match &result {
            Ok(()) => log_line(log, format_args!("success")),
            Err(err) => log_line(log, format_args!("{err}")),
        }
        let _ = log.flush();
        result
    }

    fn write_dump(&self, log: &mut dyn Write, context: &ExceptionContext, artifacts: &ArtifactPaths) -> CaptureResult<()>
    {
        self.resolver.resolve(&mut |facility| {
            let file = platform::open_artifact(artifacts.dump_native()).map_err(|err| CaptureError::artifact_create(&err))?;

            log_line(log, format_args!("writing dump {}", artifacts.dump().display()));
            facility.write_snapshot(context, &file, self.kind)
        })
    }
}

#[cfg(test)]
mod tests
{
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::classifier::ExceptionCode;

    struct CountingFacility
    {
        calls: Arc<AtomicUsize>,
        fail_with: Option<u32>,
    }

    impl SnapshotFacility for CountingFacility
    {
        fn write_snapshot(&self, _context: &ExceptionContext, mut destination: &File, _kind: SnapshotKind) -> CaptureResult<()>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(code) = self.fail_with {
                return Err(CaptureError::SnapshotFailed { code });
            }
            destination.write_all(b"MDMP")?;
            Ok(())
        }
    }

    struct TestResolver
    {
        calls: Arc<AtomicUsize>,
        fail_with: Option<u32>,
        unavailable: bool,
    }

    impl TestResolver
    {
        fn working() -> Self
        {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_with: None,
                unavailable: false,
            }
        }
    }

    impl FacilityResolver for TestResolver
    {
        fn name(&self) -> &str
        {
            "test"
        }

        fn resolve(&self, use_facility: &mut UseFacility<'_>) -> CaptureResult<()>
        {
            if self.unavailable {
                return Err(CaptureError::FacilityUnavailable {
                    library: "dbghelp.dll".to_string(),
                    code: 0x7e,
                });
            }
            use_facility(&CountingFacility {
                calls: Arc::clone(&self.calls),
                fail_with: self.fail_with,
            })
        }
    }

    fn context() -> ExceptionContext
    {
        ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x10)
    }

    #[test]
    fn test_paths_append_extensions()
    {
        let paths = ArtifactPaths::new("/tmp/app.v2/crash").unwrap();
        assert_eq!(paths.log(), Path::new("/tmp/app.v2/crash.log"));
        assert_eq!(paths.dump(), Path::new("/tmp/app.v2/crash.dmp"));
        assert_eq!(paths.base(), "/tmp/app.v2/crash");
    }

    #[test]
    fn test_line_buffer_truncates_and_terminates()
    {
        let line = LineBuffer::line(format_args!("writing dump {}", "x".repeat(LINE_CAPACITY * 2)));
        assert_eq!(line.as_bytes().len(), LINE_CAPACITY);
        assert!(line.as_bytes().starts_with(b"writing dump xxx"));
        assert_eq!(line.as_bytes().last(), Some(&b'\n'));

        let short = LineBuffer::line(format_args!("failed to write dump: {:x}", 0x8007_0005u32));
        assert_eq!(short.as_bytes(), b"failed to write dump: 80070005\n");
    }

    #[test]
    fn test_empty_path_rejected()
    {
        assert!(matches!(ArtifactPaths::new(""), Err(CaptureError::InvalidPath(_))));
    }

    #[test]
    fn test_successful_dump_is_logged()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let paths = ArtifactPaths::new(base.to_str().unwrap()).unwrap();
        let resolver = TestResolver::working();
        let mut log = Vec::new();

        DumpWriter::new(&resolver).write(&mut log, &context(), &paths).unwrap();

        let log = String::from_utf8(log).unwrap();
        assert!(log.contains(&format!("writing dump {}", paths.dump().display())));
        assert!(log.ends_with("success\n"));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(paths.dump()).unwrap(), b"MDMP");
    }

    #[test]
    fn test_existing_dump_is_truncated()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let paths = ArtifactPaths::new(base.to_str().unwrap()).unwrap();
        fs::write(paths.dump(), vec![0xAA; 4096]).unwrap();

        DumpWriter::new(&TestResolver::working())
            .write(&mut Vec::new(), &context(), &paths)
            .unwrap();

        assert_eq!(fs::metadata(paths.dump()).unwrap().len(), 4);
    }

    #[test]
    fn test_uncreatable_dump_logs_error_code()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("missing").join("crash");
        let paths = ArtifactPaths::new(base.to_str().unwrap()).unwrap();
        let resolver = TestResolver::working();
        let mut log = Vec::new();

        let result = DumpWriter::new(&resolver).write(&mut log, &context(), &paths);

        let err = result.unwrap_err();
        assert!(matches!(err, CaptureError::ArtifactCreate { .. }));
        let code = err.platform_code().unwrap();
        assert_ne!(code, 0);
        let log = String::from_utf8(log).unwrap();
        assert_eq!(log, format!("failed to create dmp file: {code:x}\n"));
        assert!(!paths.dump().exists());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unavailable_facility_writes_nothing()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let paths = ArtifactPaths::new(base.to_str().unwrap()).unwrap();
        let resolver = TestResolver {
            unavailable: true,
            ..TestResolver::working()
        };
        let mut log = Vec::new();

        let result = DumpWriter::new(&resolver).write(&mut log, &context(), &paths);

        assert!(matches!(result, Err(CaptureError::FacilityUnavailable { .. })));
        assert_eq!(String::from_utf8(log).unwrap(), "dbghelp.dll not loaded: 7e\n");
        assert!(!paths.dump().exists());
    }

    #[test]
    fn test_snapshot_failure_is_logged()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("crash");
        let paths = ArtifactPaths::new(base.to_str().unwrap()).unwrap();
        let resolver = TestResolver {
            fail_with: Some(0x8007_0005),
            ..TestResolver::working()
        };
        let mut log = Vec::new();

        let result = DumpWriter::new(&resolver).write(&mut log, &context(), &paths);

        assert!(matches!(result, Err(CaptureError::SnapshotFailed { code: 0x8007_0005 })));
        let log = String::from_utf8(log).unwrap();
        assert!(log.starts_with("writing dump "));
        assert!(log.ends_with("failed to write dump: 80070005\n"));
    }
}
