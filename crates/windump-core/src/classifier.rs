//! # Exception Classifier
//!
//! Decides whether an exception is worth a dump.
//!
//! Exception codes follow the Windows `NTSTATUS` layout: the two top bits are
//! the severity, so anything below `0x8000_0000` is a success, informational
//! or debug-print code rather than a fault. On top of that a fixed table of
//! high-severity codes is ignored because they are raised and handled inside
//! the OS or by another runtime sharing the process.
//!
//! Unix signals are mapped onto the same code space by the platform backend,
//! so one policy covers every target.

use std::fmt;

/// A raw exception code as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionCode(pub u32);

impl ExceptionCode
{
    /// `EXCEPTION_BREAKPOINT`
    pub const BREAKPOINT: Self = Self(0x8000_0003);
    /// `EXCEPTION_ACCESS_VIOLATION`
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);
    /// `EXCEPTION_IN_PAGE_ERROR`
    pub const IN_PAGE_ERROR: Self = Self(0xC000_0006);
    /// `EXCEPTION_ILLEGAL_INSTRUCTION`
    pub const ILLEGAL_INSTRUCTION: Self = Self(0xC000_001D);
    /// `EXCEPTION_INT_DIVIDE_BY_ZERO`
    pub const INT_DIVIDE_BY_ZERO: Self = Self(0xC000_0094);
    /// `EXCEPTION_STACK_OVERFLOW`
    pub const STACK_OVERFLOW: Self = Self(0xC000_00FD);
    /// `STATUS_STACK_BUFFER_OVERRUN`, raised by fail-fast and `abort()`
    pub const FAIL_FAST: Self = Self(0xC000_0409);

    /// The raw value.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }

    /// Whether the severity bits mark this as an error.
    #[must_use]
    pub const fn is_error_severity(self) -> bool
    {
        self.0 & SEVERITY_ERROR_BIT != 0
    }
}

impl From<u32> for ExceptionCode
{
    fn from(code: u32) -> Self
    {
        Self(code)
    }
}

impl fmt::Display for ExceptionCode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::LowerHex for ExceptionCode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

const SEVERITY_ERROR_BIT: u32 = 0x8000_0000;

/// One entry of the ignore table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoredCode
{
    /// Exception code
    pub code: u32,
    /// Where the code comes from
    pub origin: &'static str,
}

/// High-severity codes that are not application crashes.
///
/// These are raised by the OS or another runtime and are normally caught by
/// that component's own frames. Adding a code here is the only way to change
/// the policy.
pub static IGNORED_CODES: &[IgnoredCode] = &[
    IgnoredCode { code: 0x8001_0012, origin: "COM: RPC_E_SERVER_DIED_DNE" },
    IgnoredCode { code: 0x8001_0108, origin: "COM: RPC_E_DISCONNECTED" },
    IgnoredCode { code: 0x8001_010D, origin: "COM: RPC_E_CANTCALLOUT_ININPUTSYNCCALL" },
    IgnoredCode { code: 0x8001_010E, origin: "COM: RPC_E_WRONG_THREAD" },
    IgnoredCode { code: 0x8000_4035, origin: "COM: internal" },
    IgnoredCode { code: 0x8004_0155, origin: "COM: REGDB_E_IIDNOTREG" },
    IgnoredCode { code: 0x8004_01FD, origin: "COM: CO_E_OBJNOTCONNECTED" },
    IgnoredCode { code: 0x8007_06B5, origin: "RPC: RPC_S_UNKNOWN_IF" },
    IgnoredCode { code: 0x8007_06BA, origin: "RPC: RPC_S_SERVER_UNAVAILABLE" },
    IgnoredCode { code: 0x8032_0012, origin: "WFP: internal" },
    IgnoredCode { code: 0x8007_274C, origin: "DNS: WSAETIMEDOUT during resolution" },
    IgnoredCode { code: 0xC00C_E514, origin: "MSXML: internal parser signal" },
    IgnoredCode { code: 0xE000_0001, origin: "runtime: user-defined propagation" },
    IgnoredCode { code: 0xE000_0002, origin: "runtime: user-defined propagation" },
    IgnoredCode { code: 0xE06D_7363, origin: "C++ exception (may be caught)" },
    IgnoredCode { code: 0xE043_4352, origin: "CLR exception" },
];

/// Outcome of classifying an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict
{
    /// Not an application fault; let it pass untouched.
    Ignore,
    /// Worth a dump.
    Capture,
}

impl fmt::Display for Verdict
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Ignore => f.write_str("ignore"),
            Self::Capture => f.write_str("capture"),
        }
    }
}

/// Whether `code` should be let through without a capture.
#[must_use]
pub fn should_ignore(code: u32) -> bool
{
    !ExceptionCode(code).is_error_severity() || ignored_entry(code).is_some()
}

/// Classify `code`.
#[must_use]
pub fn classify(code: ExceptionCode) -> Verdict
{
    if should_ignore(code.raw()) {
        Verdict::Ignore
    } else {
        Verdict::Capture
    }
}

/// The ignore-table entry for `code`, if it has one.
#[must_use]
pub fn ignored_entry(code: u32) -> Option<&'static IgnoredCode>
{
    IGNORED_CODES.iter().find(|entry| entry.code == code)
}
