//! # Dump File
//!
//! Streams a minidump into an open file without touching the heap.
//!
//! The header and a fixed-size stream directory are reserved at offset 0.
//! Stream data is appended behind them with positional writes, each structure
//! serialized by `scroll` into a buffer on the stack. The header goes in last,
//! once the number of streams is known.
//!
//! ```text
//! +--------------------+ 0
//! | MINIDUMP_HEADER    |
//! +--------------------+ 32
//! | stream directory   |  MAX_STREAMS entries, unused ones zeroed
//! +--------------------+
//! | stream data        |  in the order it was appended
//! +--------------------+
//! ```

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

use minidump_common::format::{
    MINIDUMP_DIRECTORY, MINIDUMP_HEADER, MINIDUMP_LOCATION_DESCRIPTOR, MINIDUMP_SIGNATURE, MINIDUMP_VERSION, RVA,
};
use scroll::ctx::{SizeWith, TryIntoCtx};
use scroll::{Endian, Pwrite, LE};

/// Room in the directory; the Unix snapshot writes at most nine streams.
pub const MAX_STREAMS: usize = 12;

/// Largest structure serialized in one piece (`CONTEXT_AMD64` is 1232 bytes).
const STRUCT_CAPACITY: usize = 1280;

/// Chunk size for string encoding and memory copies.
const CHUNK: usize = 512;

/// Serialized size of `T`.
pub fn size_of<T: SizeWith<Endian>>() -> usize
{
    T::size_with(&LE)
}

/// A structure `scroll` can write in little-endian order.
pub trait Record: TryIntoCtx<Endian, Error = scroll::Error> + SizeWith<Endian> {}

impl<T> Record for T where T: TryIntoCtx<Endian, Error = scroll::Error> + SizeWith<Endian> {}

// Kind-only errors carry no allocation
fn invalid_data() -> io::Error
{
    io::Error::from(ErrorKind::InvalidData)
}

fn to_rva(offset: u64) -> io::Result<RVA>
{
    RVA::try_from(offset).map_err(|_| invalid_data())
}

/// Minidump under construction.
pub struct DumpFile<'f>
{
    file: &'f File,
    end: u64,
    directory: [MINIDUMP_DIRECTORY; MAX_STREAMS],
    streams: usize,
}

impl<'f> DumpFile<'f>
{
    /// Start a dump in `file`, which should be empty.
    pub fn new(file: &'f File) -> Self
    {
        Self {
            file,
            end: (size_of::<MINIDUMP_HEADER>() + MAX_STREAMS * size_of::<MINIDUMP_DIRECTORY>()) as u64,
            directory: Default::default(),
            streams: 0,
        }
    }

    /// Offset the next append lands at.
    pub fn position(&self) -> io::Result<RVA>
    {
        to_rva(self.end)
    }

    /// Number of streams recorded so far.
    pub fn stream_count(&self) -> usize
    {
        self.streams
    }

    /// Serialize `value` at the end of the file.
    pub fn append<T: Record>(&mut self, value: T) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
    {
        let rva = self.position()?;
        let size = self.put(u64::from(rva), value)?;
        self.end += size as u64;
        Ok(MINIDUMP_LOCATION_DESCRIPTOR {
            data_size: size as u32,
            rva,
        })
    }

    /// Serialize `value` over bytes already reserved at `rva`.
    pub fn write_at<T: Record>(&mut self, rva: RVA, value: T) -> io::Result<()>
    {
        let offset = u64::from(rva);
        if offset + size_of::<T>() as u64 > self.end {
            return Err(invalid_data());
        }
        self.put(offset, value).map(|_| ())
    }

    /// Claim `size` zeroed bytes to be filled in with [`DumpFile::write_at`].
    pub fn reserve(&mut self, size: usize) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
    {
        let rva = self.position()?;
        let data_size = u32::try_from(size).map_err(|_| invalid_data())?;
        self.end += u64::from(data_size);
        // The gap stays a hole until something lands behind it
        self.file.set_len(self.end)?;
        Ok(MINIDUMP_LOCATION_DESCRIPTOR { data_size, rva })
    }

    /// Append raw bytes.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
    {
        let rva = self.position()?;
        let data_size = u32::try_from(bytes.len()).map_err(|_| invalid_data())?;
        self.file.write_all_at(bytes, self.end)?;
        self.end += u64::from(data_size);
        Ok(MINIDUMP_LOCATION_DESCRIPTOR { data_size, rva })
    }

    /// Append a `MINIDUMP_STRING`: byte length, UTF-16LE text, NUL.
    ///
    /// Text that is not UTF-8 is widened byte by byte.
    pub fn append_string(&mut self, text: &[u8]) -> io::Result<RVA>
    {
        let rva = self.position()?;
        let length = self.reserve(4)?;

        let mut chunk = [0u8; CHUNK];
        let mut filled = 0;
        let mut units = 0u32;
        let mut push = |dump: &mut Self, unit: u16| -> io::Result<()> {
            if filled + 2 > CHUNK {
                dump.append_bytes(&chunk[..filled])?;
                filled = 0;
            }
            chunk[filled..filled + 2].copy_from_slice(&unit.to_le_bytes());
            filled += 2;
            units += 1;
            Ok(())
        };

        match std::str::from_utf8(text) {
            Ok(text) => {
                for unit in text.encode_utf16() {
                    push(self, unit)?;
                }
            }
            Err(_) => {
                for byte in text {
                    push(self, u16::from(*byte))?;
                }
            }
        }
        push(self, 0)?;
        self.append_bytes(&chunk[..filled])?;

        // The length excludes the terminator
        self.write_at(length.rva, (units - 1) * 2)?;
        Ok(rva)
    }

    /// Copy up to `len` bytes of this process's memory starting at `address`.
    ///
    /// The kernel reads the source, so an unmapped page ends the copy with
    /// `EFAULT` instead of a fault. Whatever was copied before that is kept.
    pub fn append_memory(&mut self, address: usize, len: usize) -> io::Result<MINIDUMP_LOCATION_DESCRIPTOR>
    {
        let rva = self.position()?;
        let mut copied = 0usize;

        while copied < len {
            let want = CHUNK.min(len - copied);
            let offset = libc::off_t::try_from(self.end + copied as u64).map_err(|_| invalid_data())?;
            // SAFETY: pwrite only reads the source range and reports unmapped pages as EFAULT
            let written = unsafe {
                libc::pwrite(
                    self.file.as_raw_fd(),
                    (address + copied) as *const libc::c_void,
                    want,
                    offset,
                )
            };
            if written == 0 {
                break;
            }
            if written < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EFAULT) => break,
                    _ => return Err(err),
                }
            }
            copied += written as usize;
        }

        let data_size = u32::try_from(copied).map_err(|_| invalid_data())?;
        self.end += u64::from(data_size);
        Ok(MINIDUMP_LOCATION_DESCRIPTOR { data_size, rva })
    }

    /// Record a directory entry. Returns `false` when the directory is full.
    pub fn add_stream(&mut self, stream_type: u32, location: MINIDUMP_LOCATION_DESCRIPTOR) -> bool
    {
        let Some(entry) = self.directory.get_mut(self.streams) else {
            return false;
        };
        *entry = MINIDUMP_DIRECTORY { stream_type, location };
        self.streams += 1;
        true
    }

    /// Write the directory and the header.
    pub fn finish(self, time_date_stamp: u32, flags: u64) -> io::Result<()>
    {
        let header_size = size_of::<MINIDUMP_HEADER>();
        let entry_size = size_of::<MINIDUMP_DIRECTORY>();

        for index in 0..self.streams {
            let entry = self.directory[index].clone();
            self.put((header_size + index * entry_size) as u64, entry)?;
        }

        let header = MINIDUMP_HEADER {
            signature: MINIDUMP_SIGNATURE,
            version: MINIDUMP_VERSION,
            stream_count: self.streams as u32,
            stream_directory_rva: header_size as RVA,
            checksum: 0,
            time_date_stamp,
            flags,
        };
        self.put(0, header).map(|_| ())
    }

    fn put<T: Record>(&self, offset: u64, value: T) -> io::Result<usize>
    {
        let size = size_of::<T>();
        let mut buffer = [0u8; STRUCT_CAPACITY];
        let Some(target) = buffer.get_mut(..size) else {
            return Err(invalid_data());
        };
        target.pwrite_with(value, 0, LE).map_err(|_| invalid_data())?;
        self.file.write_all_at(target, offset)?;
        Ok(size)
    }
}
