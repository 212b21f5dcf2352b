//! # Artifact Report
//!
//! Reads back what a capture left behind. The faulting process does not
//! survive its crash, so this runs in whoever supervised it.

use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

use minidump::{Minidump, MinidumpException};

use crate::classifier::ExceptionCode;
use crate::error::CaptureResult;
use crate::writer::ArtifactPaths;

const CODE_PREFIX: &str = "Exception code: ";
const SUCCESS_LINE: &str = "success";
const ERROR_MARKERS: [&str; 4] = ["failed to create dmp file: ", "failed to write dump: ", " not loaded: ", "wrong version of "];

/// What `<base>.dmp` looks like on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary
{
    /// File size in bytes
    pub size: u64,
    /// Streams in the directory, `None` if the file is not a readable minidump
    pub stream_count: Option<u32>,
    /// Code in the exception stream, if the dump has one
    pub exception_code: Option<ExceptionCode>,
}

impl DumpSummary
{
    /// Summarize the bytes of a dump file.
    #[must_use]
    pub fn parse(bytes: Vec<u8>) -> Self
    {
        let size = bytes.len() as u64;
        match Minidump::read(bytes) {
            Ok(dump) => {
                let exception_code = dump
                    .get_stream::<MinidumpException<'_>>()
                    .ok()
                    .map(|exception| ExceptionCode(exception.raw.exception_record.exception_code));
                Self {
                    size,
                    stream_count: Some(dump.header.stream_count),
                    exception_code,
                }
            }
            Err(_) => Self {
                size,
                stream_count: None,
                exception_code: None,
            },
        }
    }

    /// Non-empty and readable as a minidump.
    #[must_use]
    pub fn is_valid(&self) -> bool
    {
        self.size > 0 && self.stream_count.is_some()
    }
}

/// Summary of the `.log`/`.dmp` pair for one base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReport
{
    /// Base path the artifacts were derived from
    pub base: String,
    /// Whether `<base>.log` exists
    pub log_present: bool,
    /// Exception codes in log order, one per entry
    pub exception_codes: Vec<ExceptionCode>,
    /// Outcome of the last entry: `Some(true)` on `success`, `Some(false)` on
    /// an error line, `None` when the entry has neither (the process died
    /// mid-capture) or there is no entry
    pub last_succeeded: Option<bool>,
    /// Every error line in the log
    pub errors: Vec<String>,
    /// `<base>.dmp`, if it exists
    pub dump: Option<DumpSummary>,
}

impl ArtifactReport
{
    /// Inspect the artifacts for `base` (no extension).
    ///
    /// Missing files (or directories in their place) are reported as absent
    /// rather than as errors.
    ///
    /// ## Errors
    ///
    /// - [`crate::CaptureError::InvalidPath`]: `base` cannot be used
    /// - [`crate::CaptureError::Io`]: an artifact exists but cannot be read
    pub fn inspect(base: &str) -> CaptureResult<Self>
    {
        let paths = ArtifactPaths::new(base)?;

        let mut report = Self {
            base: base.to_string(),
            log_present: false,
            exception_codes: Vec::new(),
            last_succeeded: None,
            errors: Vec::new(),
            dump: None,
        };

        if let Some(log) = read_optional(paths.log())? {
            report.log_present = true;
            report.absorb_log(&String::from_utf8_lossy(&log));
        }

        if let Some(dump) = read_optional(paths.dump())? {
            report.dump = Some(DumpSummary::parse(dump));
        }

        Ok(report)
    }

    /// Whether at least one exception was recorded.
    #[must_use]
    pub fn captured(&self) -> bool
    {
        !self.exception_codes.is_empty()
    }

    /// The last recorded exception succeeded and left a valid dump.
    #[must_use]
    pub fn dump_written(&self) -> bool
    {
        self.last_succeeded == Some(true) && self.dump.is_some_and(|dump| dump.is_valid())
    }

    fn absorb_log(&mut self, log: &str)
    {
        for line in log.lines().map(str::trim_end) {
            if let Some(code) = line.strip_prefix(CODE_PREFIX) {
                if let Ok(raw) = u32::from_str_radix(code.trim(), 16) {
                    self.exception_codes.push(ExceptionCode(raw));
                    self.last_succeeded = None;
                }
            } else if line == SUCCESS_LINE {
                self.last_succeeded = Some(true);
            } else if ERROR_MARKERS.iter().any(|marker| line.contains(marker)) {
                self.errors.push(line.to_string());
                self.last_succeeded = Some(false);
            }
        }
    }
}

impl fmt::Display for ArtifactReport
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        writeln!(f, "artifacts: {}", self.base)?;
        if !self.log_present {
            writeln!(f, "  log: missing")?;
        } else {
            writeln!(f, "  log: {} exception(s)", self.exception_codes.len())?;
            for code in &self.exception_codes {
                writeln!(f, "    code {code}")?;
            }
            for error in &self.errors {
                writeln!(f, "    error: {error}")?;
            }
            let outcome = match self.last_succeeded {
                Some(true) => "success",
                Some(false) => "failed",
                None => "incomplete",
            };
            writeln!(f, "  last capture: {outcome}")?;
        }
        match &self.dump {
            None => write!(f, "  dump: missing"),
            Some(DumpSummary {
                size,
                stream_count: Some(streams),
                exception_code,
            }) => {
                write!(f, "  dump: {size} bytes, MDMP, {streams} stream(s)")?;
                match exception_code {
                    Some(code) => write!(f, ", exception {code}"),
                    None => Ok(()),
                }
            }
            Some(dump) => write!(f, "  dump: {} bytes, not a readable minidump", dump.size),
        }
    }
}

// Anything that is not a regular file counts as missing
fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>>
{
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => fs::read(path).map(Some),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests
{
    use minidump_common::format::{MINIDUMP_HEADER, MINIDUMP_SIGNATURE, MINIDUMP_VERSION};
    use scroll::{Pwrite, LE};

    use super::*;

    // Header and an empty directory
    fn empty_dump() -> Vec<u8>
    {
        let mut bytes = vec![0u8; 32];
        bytes
            .pwrite_with(
                MINIDUMP_HEADER {
                    signature: MINIDUMP_SIGNATURE,
                    version: MINIDUMP_VERSION,
                    stream_count: 0,
                    stream_directory_rva: 32,
                    checksum: 0,
                    time_date_stamp: 0,
                    flags: 0,
                },
                0,
                LE,
            )
            .unwrap();
        bytes
    }

    fn base_in(dir: &tempfile::TempDir) -> String
    {
        dir.path().join("crash").to_string_lossy().into_owned()
    }

    #[test]
    fn test_no_artifacts()
    {
        let dir = tempfile::tempdir().unwrap();
        let report = ArtifactReport::inspect(&base_in(&dir)).unwrap();

        assert!(!report.log_present);
        assert!(!report.captured());
        assert!(report.dump.is_none());
        assert!(!report.dump_written());
    }

    #[test]
    fn test_successful_capture()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = base_in(&dir);
        fs::write(
            format!("{base}.log"),
            "Exception time: 1700000000\nException code: c0000005\nException address: 0x10\nwriting dump x.dmp\nsuccess\n",
        )
        .unwrap();
        fs::write(format!("{base}.dmp"), empty_dump()).unwrap();

        let report = ArtifactReport::inspect(&base).unwrap();
        assert_eq!(report.exception_codes, vec![ExceptionCode::ACCESS_VIOLATION]);
        assert_eq!(report.last_succeeded, Some(true));
        assert!(report.errors.is_empty());
        assert!(report.dump_written());
    }

    #[test]
    fn test_failed_then_interrupted_entries()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = base_in(&dir);
        fs::write(
            format!("{base}.log"),
            "Exception time: 1\nException code: c0000005\nException address: 0x0\nfailed to create dmp file: 5\n\
             Exception time: 2\nException code: c000001d\nException address: 0x0\n",
        )
        .unwrap();

        let report = ArtifactReport::inspect(&base).unwrap();
        assert_eq!(report.exception_codes.len(), 2);
        assert_eq!(report.errors, vec!["failed to create dmp file: 5".to_string()]);
        assert_eq!(report.last_succeeded, None);
        assert!(!report.dump_written());
    }

    #[test]
    fn test_dump_without_signature()
    {
        let dir = tempfile::tempdir().unwrap();
        let base = base_in(&dir);
        fs::write(format!("{base}.dmp"), b"garbage").unwrap();

        let dump = ArtifactReport::inspect(&base).unwrap().dump.unwrap();
        assert_eq!(dump.size, 7);
        assert!(!dump.is_valid());
    }

    #[test]
    fn test_header_only_dump_is_valid()
    {
        let summary = DumpSummary::parse(empty_dump());
        assert_eq!(summary.stream_count, Some(0));
        assert_eq!(summary.exception_code, None);
        assert!(summary.is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn test_summary_reads_exception_code()
    {
        use crate::context::ExceptionContext;
        use crate::platform::unix::MinidumpFacility;
        use crate::writer::SnapshotKind;

        let dir = tempfile::tempdir().unwrap();
        let base = base_in(&dir);
        let file = fs::File::create(format!("{base}.dmp")).unwrap();
        let context = ExceptionContext::synthetic(ExceptionCode::ILLEGAL_INSTRUCTION, 0);
        MinidumpFacility::write_to(&context, &file, SnapshotKind::Minimal).unwrap();
        drop(file);

        let report = ArtifactReport::inspect(&base).unwrap();
        let dump = report.dump.unwrap();
        assert_eq!(dump.exception_code, Some(ExceptionCode::ILLEGAL_INSTRUCTION));
        assert!(dump.stream_count.unwrap() >= 5);
        assert!(report.to_string().contains("MDMP"));
    }
}
