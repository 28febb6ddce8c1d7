//! Target memory access.
//!
//! [`TargetMem`] owns the `/proc/<pid>/mem` handle and the ptrace word
//! fallback; no other module may touch either. The fast path is positional
//! I/O at absolute virtual addresses, which works whether or not the target
//! is ptrace-stopped. The word path needs an attached tracee and is only
//! tried when the fast path fails.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::errors::MemoryError;

const WORD: usize = std::mem::size_of::<libc::c_long>();

pub struct TargetMem {
    pid: Pid,
    mem: File,
    writable: bool,
}

impl TargetMem {
    /// Open `/proc/<pid>/mem`, read-write when `writable`
    pub fn open(pid: Pid, writable: bool) -> Result<Self, std::io::Error> {
        let mem = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(format!("/proc/{}/mem", pid))?;
        Ok(Self { pid, mem, writable })
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Read exactly `buf.len()` bytes at `addr`; a short read is an error
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.read_fd(addr, buf) {
            Ok(()) => Ok(()),
            Err(primary) => self.peek_words(addr, buf).map_err(|_| primary),
        }
    }

    /// Write all of `src` at `addr`; a short write is an error
    pub fn write(&self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        if src.is_empty() {
            return Ok(());
        }
        if !self.writable {
            // the word path still works on an attached tracee
            return self.poke_words(addr, src);
        }
        match self.write_fd(addr, src) {
            Ok(()) => Ok(()),
            Err(primary) => self.poke_words(addr, src).map_err(|_| primary),
        }
    }

    /// Read `len` bytes at `addr` into a fresh buffer
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_fd(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .mem
                .read_at(&mut buf[done..], addr + done as u64)
                .map_err(|source| MemoryError::Io {
                    addr: addr + done as u64,
                    source,
                })?;
            if n == 0 {
                return Err(MemoryError::ShortRead {
                    addr,
                    want: buf.len(),
                    got: done,
                });
            }
            done += n;
        }
        Ok(())
    }

    fn write_fd(&self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < src.len() {
            let n = self
                .mem
                .write_at(&src[done..], addr + done as u64)
                .map_err(|source| MemoryError::Io {
                    addr: addr + done as u64,
                    source,
                })?;
            if n == 0 {
                return Err(MemoryError::ShortWrite {
                    addr,
                    want: src.len(),
                    got: done,
                });
            }
            done += n;
        }
        Ok(())
    }

    fn peek_words(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            let word = ptrace::read(self.pid, at as usize as ptrace::AddressType)
                .map_err(|source| MemoryError::Ptrace { addr: at, source })?;
            let bytes = word.to_ne_bytes();
            let take = WORD.min(buf.len() - done);
            buf[done..done + take].copy_from_slice(&bytes[..take]);
            done += take;
        }
        Ok(())
    }

    fn poke_words(&self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while src.len() - done >= WORD {
            let at = addr + done as u64;
            let word = libc::c_long::from_ne_bytes(src[done..done + WORD].try_into().unwrap());
            ptrace::write(self.pid, at as usize as ptrace::AddressType, word)
                .map_err(|source| MemoryError::Ptrace { addr: at, source })?;
            done += WORD;
        }
        if done < src.len() {
            // sub-word tail: read-modify-write the last word
            let at = addr + done as u64;
            let word = ptrace::read(self.pid, at as usize as ptrace::AddressType)
                .map_err(|source| MemoryError::Ptrace { addr: at, source })?;
            let mut bytes = word.to_ne_bytes();
            bytes[..src.len() - done].copy_from_slice(&src[done..]);
            let word = libc::c_long::from_ne_bytes(bytes);
            ptrace::write(self.pid, at as usize as ptrace::AddressType, word)
                .map_err(|source| MemoryError::Ptrace { addr: at, source })?;
        }
        Ok(())
    }
}

/// The system page size
pub fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}
