//! # Thread Context
//!
//! Converts the `ucontext_t` the kernel hands a signal handler into the
//! minidump `CONTEXT_*` record for the running architecture, plus the
//! constants the system info stream needs.
//!
//! Registers are converted on Linux x86-64 and AArch64. Elsewhere the dump
//! still carries the thread and its stack, just without a context record.

use std::ffi::c_void;
use std::io;

use minidump_common::format::{PlatformId, ProcessorArchitecture, MINIDUMP_LOCATION_DESCRIPTOR};

use super::dump_file::DumpFile;

/// Registers a dump needs besides the context record itself.
#[derive(Debug, Clone, Copy)]
pub struct ThreadState
{
    /// Where the `CONTEXT_*` record was written
    pub context: MINIDUMP_LOCATION_DESCRIPTOR,
    /// Stack pointer at the time of the fault
    pub stack_pointer: u64,
    /// Faulting instruction
    pub instruction_pointer: u64,
}

/// `MINIDUMP_SYSTEM_INFO::processor_architecture` for this build.
#[must_use]
pub const fn architecture() -> u16
{
    let architecture = if cfg!(target_arch = "x86_64") {
        ProcessorArchitecture::PROCESSOR_ARCHITECTURE_AMD64
    } else if cfg!(target_arch = "aarch64") {
        ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM64
    } else if cfg!(target_arch = "x86") {
        ProcessorArchitecture::PROCESSOR_ARCHITECTURE_INTEL
    } else if cfg!(target_arch = "arm") {
        ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM
    } else {
        ProcessorArchitecture::PROCESSOR_ARCHITECTURE_UNKNOWN
    };
    architecture as u16
}

/// `MINIDUMP_SYSTEM_INFO::platform_id` for this build.
#[must_use]
pub const fn platform_id() -> u32
{
    let platform = if cfg!(target_os = "android") {
        PlatformId::Android
    } else if cfg!(target_os = "linux") {
        PlatformId::Linux
    } else if cfg!(target_os = "macos") {
        PlatformId::MacOs
    } else if cfg!(target_os = "ios") {
        PlatformId::Ios
    } else if cfg!(target_os = "solaris") {
        PlatformId::Solaris
    } else {
        PlatformId::Unix
    };
    platform as u32
}

/// Write the context record for `ucontext` and return where it went.
///
/// `Ok(None)` when there is no context (synthetic exceptions) or this target
/// has no converter.
///
/// ## Safety
///
/// `ucontext` must be null or the `ucontext_t*` passed to a signal handler
/// that is still running.
pub unsafe fn write_thread_state(dump: &mut DumpFile<'_>, ucontext: *const c_void) -> io::Result<Option<ThreadState>>
{
    if ucontext.is_null() {
        return Ok(None);
    }
    // SAFETY: guaranteed by the caller
    let ucontext = unsafe { &*ucontext.cast::<libc::ucontext_t>() };
    imp::write_thread_state(dump, ucontext)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp
{
    use std::io;

    use minidump_common::format::{ContextFlagsAmd64, CONTEXT_AMD64};

    use super::ThreadState;
    use crate::platform::unix::dump_file::DumpFile;

    pub fn convert(ucontext: &libc::ucontext_t) -> CONTEXT_AMD64
    {
        let gregs = &ucontext.uc_mcontext.gregs;
        let reg = |index: libc::c_int| gregs[index as usize] as u64;

        let mut context = CONTEXT_AMD64 {
            context_flags: (ContextFlagsAmd64::CONTEXT_AMD64_CONTROL
                | ContextFlagsAmd64::CONTEXT_AMD64_INTEGER
                | ContextFlagsAmd64::CONTEXT_AMD64_SEGMENTS)
                .bits(),
            ..CONTEXT_AMD64::default()
        };

        // cs, gs and fs packed into one greg, 16 bits each from the bottom
        let segments = reg(libc::REG_CSGSFS);
        context.cs = (segments & 0xffff) as u16;
        context.gs = ((segments >> 16) & 0xffff) as u16;
        context.fs = ((segments >> 32) & 0xffff) as u16;
        context.eflags = reg(libc::REG_EFL) as u32;

        context.rax = reg(libc::REG_RAX);
        context.rcx = reg(libc::REG_RCX);
        context.rdx = reg(libc::REG_RDX);
        context.rbx = reg(libc::REG_RBX);
        context.rsp = reg(libc::REG_RSP);
        context.rbp = reg(libc::REG_RBP);
        context.rsi = reg(libc::REG_RSI);
        context.rdi = reg(libc::REG_RDI);
        context.r8 = reg(libc::REG_R8);
        context.r9 = reg(libc::REG_R9);
        context.r10 = reg(libc::REG_R10);
        context.r11 = reg(libc::REG_R11);
        context.r12 = reg(libc::REG_R12);
        context.r13 = reg(libc::REG_R13);
        context.r14 = reg(libc::REG_R14);
        context.r15 = reg(libc::REG_R15);
        context.rip = reg(libc::REG_RIP);
        context
    }

    pub fn write_thread_state(dump: &mut DumpFile<'_>, ucontext: &libc::ucontext_t) -> io::Result<Option<ThreadState>>
    {
        let context = convert(ucontext);
        let (stack_pointer, instruction_pointer) = (context.rsp, context.rip);
        Ok(Some(ThreadState {
            context: dump.append(context)?,
            stack_pointer,
            instruction_pointer,
        }))
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod imp
{
    use std::io;

    use minidump_common::format::{ContextFlagsArm64, CONTEXT_ARM64};

    use super::ThreadState;
    use crate::platform::unix::dump_file::DumpFile;

    pub fn convert(ucontext: &libc::ucontext_t) -> CONTEXT_ARM64
    {
        let machine = &ucontext.uc_mcontext;

        let mut context = CONTEXT_ARM64 {
            context_flags: (ContextFlagsArm64::CONTEXT_ARM64_CONTROL | ContextFlagsArm64::CONTEXT_ARM64_INTEGER).bits(),
            cpsr: machine.pstate as u32,
            sp: machine.sp as u64,
            pc: machine.pc as u64,
            ..CONTEXT_ARM64::default()
        };
        for (target, source) in context.iregs.iter_mut().zip(machine.regs.iter()) {
            *target = *source as u64;
        }
        context
    }

    pub fn write_thread_state(dump: &mut DumpFile<'_>, ucontext: &libc::ucontext_t) -> io::Result<Option<ThreadState>>
    {
        let context = convert(ucontext);
        let (stack_pointer, instruction_pointer) = (context.sp, context.pc);
        Ok(Some(ThreadState {
            context: dump.append(context)?,
            stack_pointer,
            instruction_pointer,
        }))
    }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
mod imp
{
    use std::io;

    use super::ThreadState;
    use crate::platform::unix::dump_file::DumpFile;

    // No converter: the thread is recorded without a context
    pub fn write_thread_state(_dump: &mut DumpFile<'_>, _ucontext: &libc::ucontext_t) -> io::Result<Option<ThreadState>>
    {
        Ok(None)
    }
}
