//! # /proc Readers
//!
//! Reads `/proc/self/*` with `read(2)` into fixed buffers on the stack, so
//! it can run inside a signal handler.
//!
//! The module list is derived from `/proc/self/maps`: a module starts at a
//! file-backed mapping with offset 0 and spans the following mappings of the
//! same file. Only files with an executable mapping count, which leaves out
//! data files such as locale archives.

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::FromRawFd;

/// `/proc/self/maps`
pub const MAPS: &CStr = c"/proc/self/maps";
/// `/proc/self/cmdline`
pub const CMDLINE: &CStr = c"/proc/self/cmdline";

const LINE_BUFFER: usize = 4096;
const PATH_CAPACITY: usize = 1024;

/// Open a `/proc` file read-only.
///
/// ## Errors
///
/// The `errno` of the failed `open(2)`; `ENOENT` where there is no `/proc`.
pub fn open_proc(path: &CStr) -> io::Result<File>
{
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just opened and is owned by nobody else
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Line-at-a-time reader over a fixed buffer.
///
/// Lines longer than the buffer come back in buffer-sized pieces.
pub struct ProcLines
{
    file: File,
    buffer: [u8; LINE_BUFFER],
    start: usize,
    end: usize,
    exhausted: bool,
}

impl ProcLines
{
    /// Read lines from `file`.
    pub fn new(file: File) -> Self
    {
        Self {
            file,
            buffer: [0; LINE_BUFFER],
            start: 0,
            end: 0,
            exhausted: false,
        }
    }

    /// The next line, without its newline.
    pub fn next_line(&mut self) -> Option<&[u8]>
    {
        loop {
            if let Some(newline) = self.buffer[self.start..self.end].iter().position(|byte| *byte == b'\n') {
                let line = self.start..self.start + newline;
                self.start = line.end + 1;
                return Some(&self.buffer[line]);
            }

            if self.exhausted {
                if self.start == self.end {
                    return None;
                }
                let line = self.start..self.end;
                self.start = self.end;
                return Some(&self.buffer[line]);
            }

            if self.start > 0 {
                self.buffer.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            if self.end == LINE_BUFFER {
                self.start = LINE_BUFFER;
                return Some(&self.buffer[..]);
            }

            match self.file.read(&mut self.buffer[self.end..]) {
                Ok(0) => self.exhausted = true,
                Ok(read) => self.end += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => self.exhausted = true,
            }
        }
    }
}

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping<'a>
{
    /// First address
    pub start: u64,
    /// One past the last address
    pub end: u64,
    /// `x` in the permissions
    pub executable: bool,
    /// Offset into the mapped file
    pub offset: u64,
    /// Path, pseudo-name (`[stack]`) or empty for anonymous mappings
    pub path: &'a [u8],
}

impl<'a> Mapping<'a>
{
    /// Parse `start-end perms offset dev inode path`.
    #[must_use]
    pub fn parse(line: &'a [u8]) -> Option<Self>
    {
        let mut rest = line;
        let range = next_field(&mut rest)?;
        let perms = next_field(&mut rest)?;
        let offset = next_field(&mut rest)?;
        let _device = next_field(&mut rest)?;
        let _inode = next_field(&mut rest)?;

        let split = range.iter().position(|byte| *byte == b'-')?;
        Some(Self {
            start: parse_hex(&range[..split])?,
            end: parse_hex(&range[split + 1..])?,
            executable: perms.get(2) == Some(&b'x'),
            offset: parse_hex(offset)?,
            path: rest.trim_ascii(),
        })
    }

    fn is_file(&self) -> bool
    {
        self.path.first() == Some(&b'/')
    }
}

fn next_field<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]>
{
    let trimmed = rest.trim_ascii_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.iter().position(u8::is_ascii_whitespace).unwrap_or(trimmed.len());
    *rest = &trimmed[end..];
    Some(&trimmed[..end])
}

fn parse_hex(field: &[u8]) -> Option<u64>
{
    u64::from_str_radix(std::str::from_utf8(field).ok()?, 16).ok()
}

/// A loaded image: the span of all mappings of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedModule<'a>
{
    /// Load address
    pub base: u64,
    /// End of the last mapping
    pub end: u64,
    /// File path, truncated to the path buffer
    pub path: &'a [u8],
}

impl MappedModule<'_>
{
    /// `end - base`, saturated to what a minidump module can express.
    #[must_use]
    pub fn size(&self) -> u32
    {
        u32::try_from(self.end.saturating_sub(self.base)).unwrap_or(u32::MAX)
    }
}

// Module being assembled across lines
struct Pending
{
    base: u64,
    end: u64,
    executable: bool,
    path: [u8; PATH_CAPACITY],
    path_len: usize,
}

impl Pending
{
    fn path(&self) -> &[u8]
    {
        &self.path[..self.path_len]
    }

    fn start(&mut self, mapping: &Mapping<'_>)
    {
        self.base = mapping.start;
        self.end = mapping.end;
        self.executable = mapping.executable;
        self.path_len = mapping.path.len().min(PATH_CAPACITY);
        self.path[..self.path_len].copy_from_slice(&mapping.path[..self.path_len]);
    }

    fn same_file(&self, mapping: &Mapping<'_>) -> bool
    {
        self.path_len > 0 && mapping.path.get(..self.path_len) == Some(self.path()) && mapping.path.len() == self.path_len
    }

    fn flush(&mut self, visit: &mut impl FnMut(&MappedModule<'_>) -> io::Result<()>) -> io::Result<()>
    {
        let complete = self.path_len > 0 && self.executable;
        let module = MappedModule {
            base: self.base,
            end: self.end,
            path: &self.path[..self.path_len],
        };
        let result = if complete { visit(&module) } else { Ok(()) };
        self.path_len = 0;
        result
    }
}

/// Call `visit` for each module in `/proc/self/maps`, in address order.
///
/// ## Errors
///
/// `/proc/self/maps` cannot be opened, or `visit` failed.
pub fn scan_modules(mut visit: impl FnMut(&MappedModule<'_>) -> io::Result<()>) -> io::Result<()>
{
    let mut lines = ProcLines::new(open_proc(MAPS)?);
    scan_lines(&mut lines, &mut visit)
}

fn scan_lines(lines: &mut ProcLines, visit: &mut impl FnMut(&MappedModule<'_>) -> io::Result<()>) -> io::Result<()>
{
    let mut pending = Pending {
        base: 0,
        end: 0,
        executable: false,
        path: [0; PATH_CAPACITY],
        path_len: 0,
    };

    while let Some(line) = lines.next_line() {
        let Some(mapping) = Mapping::parse(line) else {
            continue;
        };
        if !mapping.is_file() {
            continue;
        }

        if pending.same_file(&mapping) && mapping.offset != 0 {
            pending.end = pending.end.max(mapping.end);
            pending.executable |= mapping.executable;
        } else if mapping.offset == 0 {
            pending.flush(visit)?;
            pending.start(&mapping);
        }
    }
    pending.flush(visit)
}
