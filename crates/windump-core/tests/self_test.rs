//! End-to-end self test: a child process installs capture and crashes itself
//!
//! The child is this test binary re-executed with `self_test_child` as the
//! only test and the artifact base path in the environment.

use std::env;
use std::process::{Command, Stdio};

use windump_core::{ArtifactReport, ExceptionCode};

const CHILD_BASE_ENV: &str = "WINDUMP_SELFTEST_BASE";

#[test]
fn self_test_child()
{
    // Inert unless launched by the test below
    let Ok(base) = env::var(CHILD_BASE_ENV) else {
        return;
    };

    windump_core::install(&base).unwrap();
    windump_core::trigger_self_test();
}

#[test]
fn test_self_test_leaves_log_and_dump()
{
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("selftest").to_string_lossy().into_owned();

    let status = Command::new(env::current_exe().unwrap())
        .args(["self_test_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_BASE_ENV, &base)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success(), "the self test must kill the child");

    let report = ArtifactReport::inspect(&base).unwrap();
    assert_eq!(report.exception_codes, vec![ExceptionCode::ACCESS_VIOLATION], "{report}");
    assert!(report.exception_codes[0].is_error_severity());
    assert!(report.dump_written(), "{report}");
    assert!(report.dump.unwrap().size > 0);
}
