use std::path::PathBuf;
use std::process::{self, Command};
use std::{env, io};

use clap::{Parser, Subcommand};
use windump_core::classifier::ignored_entry;
use windump_core::{classify, ArtifactReport, ExceptionCode};
use windump_utils::{info, warn, LogLevel, LogSettings};

/// Exit status when no capture was recorded.
const EXIT_NOT_CAPTURED: i32 = 2;

/// Process-wide crash capture: exception log plus minidump.
#[derive(Parser, Debug)]
#[command(name = "windump")]
#[command(version)]
#[command(about = "Capture a log entry and a minidump when the process crashes", long_about = None)]
struct Cli
{
    /// Log level, overrides RUST_LOG (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Install crash capture and crash this process with an access violation
    Crash
    {
        /// Artifact base path; writes <path>.log and <path>.dmp
        #[arg(long)]
        path: String,
    },
    /// Run `crash` in a child process and check what it left behind
    Verify
    {
        /// Artifact base path; writes <path>.log and <path>.dmp
        #[arg(long)]
        path: String,
    },
    /// Tell whether exception codes would be captured or ignored
    Classify
    {
        /// Codes in hex (0xc0000005, c0000005) or decimal
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

fn main()
{
    let cli = Cli::parse();

    // Environment first, --log-level on top
    let mut settings = LogSettings::from_env();
    if let Some(level) = cli.log_level {
        settings = settings.with_level(level);
    }
    let _logging = match settings.init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    match run_command(cli.command, cli.log_level) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn run_command(command: Commands, log_level: Option<LogLevel>) -> Result<i32, Box<dyn std::error::Error>>
{
    match command {
        Commands::Crash { path } => {
            windump_core::install(&path)?;
            println!("Crash capture installed, artifacts at {path}.log and {path}.dmp");
            windump_core::trigger_self_test()
        }
        Commands::Verify { path } => verify(&path, log_level),
        Commands::Classify { codes } => {
            for raw in &codes {
                let code = parse_code(raw)?;
                match ignored_entry(code.raw()) {
                    Some(entry) => println!("{code:08x} {} ({})", classify(code), entry.origin),
                    None => println!("{code:08x} {}", classify(code)),
                }
            }
            Ok(0)
        }
    }
}

fn verify(path: &str, log_level: Option<LogLevel>) -> Result<i32, Box<dyn std::error::Error>>
{
    let base = PathBuf::from(path);
    if let Some(parent) = base.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    // Stale artifacts would make a failed run look like a success
    for extension in ["log", "dmp"] {
        remove_if_present(&format!("{path}.{extension}"))?;
    }

    info!(path, "Spawning crash child");
    let status = Command::new(env::current_exe()?).args(crash_args(path, log_level)).status()?;
    if status.success() {
        warn!("Crash child exited successfully; the self test did not fault");
    }
    println!("crash child exited with {status}");

    let report = ArtifactReport::inspect(path)?;
    println!("{report}");

    if report.captured() && report.dump_written() {
        Ok(0)
    } else {
        Ok(EXIT_NOT_CAPTURED)
    }
}

/// Arguments for the crash child, carrying `--log-level` over.
fn crash_args(path: &str, log_level: Option<LogLevel>) -> Vec<&str>
{
    let mut args = vec!["crash", "--path", path];
    if let Some(level) = log_level {
        args.extend(["--log-level", level.as_str()]);
    }
    args
}

fn remove_if_present(path: &str) -> io::Result<()>
{
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Parse `0x`-prefixed hex, plain decimal, or bare hex (`c0000005`).
fn parse_code(raw: &str) -> Result<ExceptionCode, String>
{
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => trimmed
            .parse::<u32>()
            .ok()
            .or_else(|| u32::from_str_radix(trimmed, 16).ok()),
    };
    parsed
        .map(ExceptionCode)
        .ok_or_else(|| format!("Invalid exception code: {raw}"))
}
