//! Built-in minidump writer for Unix targets.
//!
//! Runs inside the signal handler, so it never allocates: everything is
//! streamed into the dump through [`DumpFile`] and stack buffers.
//!
//! Streams written, in order:
//!
//! - `SystemInfoStream`: architecture, platform, CPU count, kernel version
//! - `MiscInfoStream`: process id
//! - `ThreadListStream`: the faulting thread with its stack
//! - `MemoryListStream`: the stack window
//! - `ExceptionStream`: code, faulting address, thread id, thread context
//! - `ModuleListStream`: images from `/proc/self/maps`
//! - `LinuxMaps` and `LinuxCmdLine`: raw copies of the `/proc` files
//!
//! The thread context is a `CONTEXT_AMD64`/`CONTEXT_ARM64` converted from the
//! `ucontext_t` on Linux x86-64 and AArch64. Synthetic exceptions and other
//! targets get an empty context location. The `/proc` streams are skipped
//! where `/proc` does not exist.

use std::ffi::{c_char, CStr};
use std::fs::File;
use std::io::{self, Read};
use std::mem;

use chrono::Utc;
use minidump_common::format::{
    MiscInfoFlags, CPU_INFORMATION, MINIDUMP_EXCEPTION, MINIDUMP_EXCEPTION_STREAM, MINIDUMP_LOCATION_DESCRIPTOR,
    MINIDUMP_MEMORY_DESCRIPTOR, MINIDUMP_MISC_INFO, MINIDUMP_MODULE, MINIDUMP_STREAM_TYPE, MINIDUMP_SYSTEM_INFO,
    MINIDUMP_THREAD, RVA,
};

use super::cpu::{self, ThreadState};
use super::dump_file::{size_of, DumpFile};
use super::proc_maps::{self, scan_modules};
use crate::context::ExceptionContext;
use crate::error::{os_code, CaptureError, CaptureResult};
use crate::writer::{FacilityResolver, SnapshotFacility, SnapshotKind, UseFacility};

/// Bytes of stack captured above the stack pointer.
pub const STACK_WINDOW: usize = 32 * 1024;

/// Resolver for [`MinidumpFacility`]; never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinResolver;

impl FacilityResolver for BuiltinResolver
{
    fn name(&self) -> &str
    {
        "builtin minidump writer"
    }

    fn resolve(&self, use_facility: &mut UseFacility<'_>) -> CaptureResult<()>
    {
        use_facility(&MinidumpFacility)
    }
}

/// Writes a minidump of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinidumpFacility;

impl MinidumpFacility
{
    /// Stream the dump for `context` into `destination`.
    ///
    /// ## Errors
    ///
    /// The first failed write.
    pub fn write_to(context: &ExceptionContext, destination: &File, kind: SnapshotKind) -> io::Result<()>
    {
        let mut dump = DumpFile::new(destination);

        let system_info = write_system_info(&mut dump)?;
        dump.add_stream(MINIDUMP_STREAM_TYPE::SystemInfoStream as u32, system_info);
        let misc_info = write_misc_info(&mut dump)?;
        dump.add_stream(MINIDUMP_STREAM_TYPE::MiscInfoStream as u32, misc_info);

        // SAFETY: non-null raw state is the `ucontext_t*` given to the running signal handler
        let thread = unsafe { cpu::write_thread_state(&mut dump, context.raw().cast_const())? };
        let stack = write_stack(&mut dump, thread.as_ref())?;

        let thread_id = context.thread_id() as u32;
        let thread_context = thread.map(|state| state.context).unwrap_or_default();

        let thread_list = write_thread_list(&mut dump, thread_id, stack, thread_context)?;
        dump.add_stream(MINIDUMP_STREAM_TYPE::ThreadListStream as u32, thread_list);
        let memory_list = write_memory_list(&mut dump, stack)?;
        dump.add_stream(MINIDUMP_STREAM_TYPE::MemoryListStream as u32, memory_list);
        let exception = write_exception(&mut dump, context, thread_id, thread_context)?;
        dump.add_stream(MINIDUMP_STREAM_TYPE::ExceptionStream as u32, exception);

        if let Some(modules) = write_module_list(&mut dump)? {
            dump.add_stream(MINIDUMP_STREAM_TYPE::ModuleListStream as u32, modules);
        }
        if let Some(maps) = copy_proc_file(&mut dump, proc_maps::MAPS)? {
            dump.add_stream(MINIDUMP_STREAM_TYPE::LinuxMaps as u32, maps);
        }
        if let Some(cmdline) = copy_proc_file(&mut dump, proc_maps::CMDLINE)? {
            dump.add_stream(MINIDUMP_STREAM_TYPE::LinuxCmdLine as u32, cmdline);
        }

        dump.finish(Utc::now().timestamp() as u32, u64::from(kind.minidump_flags()))
    }
}

impl SnapshotFacility for MinidumpFacility
{
    fn write_snapshot(&self, context: &ExceptionContext, destination: &File, kind: SnapshotKind) -> CaptureResult<()>
    {
        Self::write_to(context, destination, kind).map_err(|err| CaptureError::SnapshotFailed { code: os_code(&err) })
    }
}

fn write_system_info(dump: &mut DumpFile<'_>) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
{
    let mut uts: libc::utsname = unsafe { mem::zeroed() };
    let named = unsafe { libc::uname(&mut uts) } == 0;

    let (major_version, minor_version, build_number) = if named {
        kernel_version(c_field(&uts.release))
    } else {
        (0, 0, 0)
    };

    // "Linux 6.8.0-45-generic #45-Ubuntu SMP ... x86_64"
    let mut description = [0u8; 4 * 65 + 3];
    let mut described = 0;
    if named {
        for field in [&uts.sysname[..], &uts.release[..], &uts.version[..], &uts.machine[..]] {
            let text = c_field(field);
            if described > 0 {
                description[described] = b' ';
                described += 1;
            }
            description[described..described + text.len()].copy_from_slice(text);
            described += text.len();
        }
    }

    let info = dump.reserve(size_of::<MINIDUMP_SYSTEM_INFO>())?;
    let csd_version_rva = dump.append_string(&description[..described])?;

    let raw = MINIDUMP_SYSTEM_INFO {
        processor_architecture: cpu::architecture(),
        processor_level: 0,
        processor_revision: 0,
        number_of_processors: online_cpus(),
        product_type: 0,
        major_version,
        minor_version,
        build_number,
        platform_id: cpu::platform_id(),
        csd_version_rva,
        suite_mask: 0,
        reserved2: 0,
        cpu: CPU_INFORMATION { data: [0; 24] },
    };
    dump.write_at(info.rva, raw)?;
    Ok(info)
}

// utsname fields are NUL-terminated within their array
fn c_field(field: &[c_char]) -> &[u8]
{
    // SAFETY: c_char and u8 have the same size and alignment
    let bytes = unsafe { &*(std::ptr::from_ref(field) as *const [u8]) };
    CStr::from_bytes_until_nul(bytes).map_or(bytes, CStr::to_bytes)
}

/// `6.8.0-45-generic` becomes `(6, 8, 0)`.
fn kernel_version(release: &[u8]) -> (u32, u32, u32)
{
    let mut parts = [0u32; 3];
    let mut index = 0;
    for &byte in release {
        match byte {
            b'0'..=b'9' => parts[index] = parts[index].saturating_mul(10).saturating_add(u32::from(byte - b'0')),
            b'.' if index < 2 => index += 1,
            _ => break,
        }
    }
    (parts[0], parts[1], parts[2])
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn online_cpus() -> u8
{
    // sched_getaffinity is a plain syscall, unlike sysconf which may read /sys through stdio
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    if unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) } != 0 {
        return 0;
    }
    u8::try_from(unsafe { libc::CPU_COUNT(&set) }).unwrap_or(u8::MAX)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn online_cpus() -> u8
{
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    u8::try_from(count.max(0)).unwrap_or(u8::MAX)
}

fn write_misc_info(dump: &mut DumpFile<'_>) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
{
    dump.append(MINIDUMP_MISC_INFO {
        size_of_info: size_of::<MINIDUMP_MISC_INFO>() as u32,
        flags1: MiscInfoFlags::MINIDUMP_MISC1_PROCESS_ID.bits(),
        process_id: std::process::id(),
        process_create_time: 0,
        process_user_time: 0,
        process_kernel_time: 0,
    })
}

// Stack from the stack pointer upwards; the current frame stands in when there are no registers
fn write_stack(dump: &mut DumpFile<'_>, thread: Option<&ThreadState>) -> io::Result<MINIDUMP_MEMORY_DESCRIPTOR>
{
    let marker = 0u8;
    let start = thread.map_or(std::ptr::from_ref(&marker) as usize, |state| state.stack_pointer as usize);
    let memory = dump.append_memory(start, STACK_WINDOW)?;
    Ok(MINIDUMP_MEMORY_DESCRIPTOR {
        start_of_memory_range: start as u64,
        memory,
    })
}

fn write_thread_list(
    dump: &mut DumpFile<'_>,
    thread_id: u32,
    stack: MINIDUMP_MEMORY_DESCRIPTOR,
    thread_context: MINIDUMP_LOCATION_DESCRIPTOR,
) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
{
    let count = dump.append(1u32)?;
    let thread = dump.append(MINIDUMP_THREAD {
        thread_id,
        suspend_count: 0,
        priority_class: 0,
        priority: 0,
        teb: 0,
        stack,
        thread_context,
    })?;
    Ok(MINIDUMP_LOCATION_DESCRIPTOR {
        data_size: count.data_size + thread.data_size,
        rva: count.rva,
    })
}

fn write_memory_list(dump: &mut DumpFile<'_>, stack: MINIDUMP_MEMORY_DESCRIPTOR) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
{
    let count = dump.append(1u32)?;
    let range = dump.append(stack)?;
    Ok(MINIDUMP_LOCATION_DESCRIPTOR {
        data_size: count.data_size + range.data_size,
        rva: count.rva,
    })
}

fn write_exception(
    dump: &mut DumpFile<'_>,
    context: &ExceptionContext,
    thread_id: u32,
    thread_context: MINIDUMP_LOCATION_DESCRIPTOR,
) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
{
    dump.append(MINIDUMP_EXCEPTION_STREAM {
        thread_id,
        __align: 0,
        exception_record: MINIDUMP_EXCEPTION {
            exception_code: context.code().raw(),
            exception_address: context.address() as u64,
            ..MINIDUMP_EXCEPTION::default()
        },
        thread_context,
    })
}

/// `ModuleListStream` from `/proc/self/maps`; `None` without `/proc`.
///
/// The maps file is read twice: once to size the module array, once to fill
/// it in while the names are appended behind it.
fn write_module_list(dump: &mut DumpFile<'_>) -> io::Result<Option<MINIDUMP_LOCATION_DESCRIPTOR>>
{
    let mut expected = 0usize;
    if scan_modules(|_| {
        expected += 1;
        Ok(())
    })
    .is_err()
    {
        return Ok(None);
    }

    let module_size = size_of::<MINIDUMP_MODULE>();
    let count = dump.append(0u32)?;
    let entries = dump.reserve(expected * module_size)?;

    let mut written = 0usize;
    scan_modules(|module| {
        // Libraries loaded between the two passes are left out
        if written == expected {
            return Ok(());
        }
        let module_name_rva = dump.append_string(module.path)?;
        let slot = entries.rva + (written * module_size) as RVA;
        dump.write_at(
            slot,
            MINIDUMP_MODULE {
                base_of_image: module.base,
                size_of_image: module.size(),
                module_name_rva,
                ..MINIDUMP_MODULE::default()
            },
        )?;
        written += 1;
        Ok(())
    })?;
    dump.write_at(count.rva, written as u32)?;

    Ok(Some(MINIDUMP_LOCATION_DESCRIPTOR {
        data_size: count.data_size + (written * module_size) as u32,
        rva: count.rva,
    }))
}

/// Copy a `/proc` file into the dump as one stream; `None` if it cannot be opened.
fn copy_proc_file(dump: &mut DumpFile<'_>, path: &CStr) -> io::Result<Option<MINIDUMP_LOCATION_DESCRIPTOR>>
{
    let Ok(mut file) = proc_maps::open_proc(path) else {
        return Ok(None);
    };

    let rva = dump.position()?;
    let mut data_size = 0u32;
    let mut buffer = [0u8; 4096];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => data_size += dump.append_bytes(&buffer[..read])?.data_size,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    Ok(Some(MINIDUMP_LOCATION_DESCRIPTOR { data_size, rva }))
}

#[cfg(test)]
mod tests
{
    use minidump::{
        Minidump, MinidumpException, MinidumpMemoryList, MinidumpMiscInfo, MinidumpModuleList, MinidumpSystemInfo,
        MinidumpThreadList, Module,
    };

    use super::*;
    use crate::classifier::ExceptionCode;

    fn dump_bytes(context: &ExceptionContext) -> Vec<u8>
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.dmp");
        let file = File::create(&path).unwrap();
        MinidumpFacility::write_to(context, &file, SnapshotKind::Minimal).unwrap();
        drop(file);
        std::fs::read(&path).unwrap()
    }

    #[test]
    fn test_synthetic_context_dump()
    {
        let context = ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0x10);
        let dump = Minidump::read(dump_bytes(&context)).unwrap();

        let exception: MinidumpException<'_> = dump.get_stream().unwrap();
        assert_eq!(exception.raw.exception_record.exception_code, 0xC000_0005);
        assert_eq!(exception.raw.exception_record.exception_address, 0x10);
        assert_eq!(exception.raw.thread_context.data_size, 0);

        let misc: MinidumpMiscInfo = dump.get_stream().unwrap();
        assert_eq!(misc.raw.process_id(), Some(&std::process::id()));
    }

    #[test]
    fn test_system_info_describes_this_machine()
    {
        let context = ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0);
        let dump = Minidump::read(dump_bytes(&context)).unwrap();

        let system_info: MinidumpSystemInfo = dump.get_stream().unwrap();
        assert_eq!(system_info.raw.processor_architecture, cpu::architecture());
        assert_eq!(system_info.raw.platform_id, cpu::platform_id());
        assert!(system_info.raw.number_of_processors > 0);
        #[cfg(target_os = "linux")]
        assert!(system_info.csd_version().unwrap().starts_with("Linux "));
    }

    #[test]
    fn test_faulting_thread_carries_its_stack()
    {
        let context = ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0);
        let dump = Minidump::read(dump_bytes(&context)).unwrap();

        let threads: MinidumpThreadList<'_> = dump.get_stream().unwrap();
        assert_eq!(threads.threads.len(), 1);
        let thread = &threads.threads[0];
        assert_eq!(u64::from(thread.raw.thread_id), context.thread_id() & u64::from(u32::MAX));
        assert!(thread.raw.stack.memory.data_size > 0);

        let memory: MinidumpMemoryList<'_> = dump.get_stream().unwrap();
        let region = memory.memory_at_address(thread.raw.stack.start_of_memory_range).unwrap();
        assert_eq!(region.size, u64::from(thread.raw.stack.memory.data_size));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_dump_lists_modules()
    {
        let context = ExceptionContext::synthetic(ExceptionCode::ACCESS_VIOLATION, 0);
        let dump = Minidump::read(dump_bytes(&context)).unwrap();

        let exe = std::env::current_exe().unwrap();
        let modules: MinidumpModuleList = dump.get_stream().unwrap();
        assert!(
            modules.iter().any(|module| module.code_file() == exe.to_string_lossy()),
            "{exe:?} missing from the module list"
        );

        // Raw /proc copies ride along
        assert!(!dump.get_raw_stream(MINIDUMP_STREAM_TYPE::LinuxMaps as u32).unwrap().is_empty());
        assert!(dump.get_raw_stream(MINIDUMP_STREAM_TYPE::LinuxCmdLine as u32).is_ok());
    }

    #[test]
    fn test_kernel_version_parsing()
    {
        assert_eq!(kernel_version(b"6.8.0-45-generic"), (6, 8, 0));
        assert_eq!(kernel_version(b"5.15"), (5, 15, 0));
        assert_eq!(kernel_version(b"22.6.0"), (22, 6, 0));
        assert_eq!(kernel_version(b""), (0, 0, 0));
    }

    #[test]
    fn test_resolver_hands_out_the_builtin_facility()
    {
        let mut called = false;
        BuiltinResolver
            .resolve(&mut |_| {
                called = true;
                Ok(())
            })
            .unwrap();
        assert!(called);
    }
}
