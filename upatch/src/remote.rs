//! Running syscalls inside the target.
//!
//! The splice site is the start of libc's executable mapping, which the
//! Task invariant guarantees is present and mapped executable. One syscall
//! instruction is written over it, registers are staged per the kernel ABI,
//! the tracee single-steps exactly that one instruction (the kernel runs
//! the whole syscall and traps after it), and both the bytes and the
//! registers are put back. The restore runs on every failure path past the
//! splice; only the initial saves may be skipped.
//!
//! Remote syscalls are strictly serialized per target: attach, then any
//! number of calls, then detach. `&mut self` enforces that within one Task.

use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::debug;

use crate::arch::native as arch;
use crate::errors::RemoteError;
use crate::ptrace;
use crate::task::Task;

impl Task {
    /// Execute one syscall in the target and return its raw result
    pub fn remote_syscall(&mut self, nr: i64, args: [u64; 6]) -> Result<u64, RemoteError> {
        if !self.is_attached() {
            return Err(RemoteError::NotAttached);
        }
        let pid = self.pid;
        let splice = self.libc_vma().start;

        let old_regs = arch::read_gprs(pid).map_err(|source| RemoteError::Ptrace {
            op: "GETREGS",
            pid: pid.as_raw(),
            source,
        })?;

        let mut orig_code = [0u8; arch::SYSCALL_INSN.len()];
        self.memcpy_from(splice, &mut orig_code)?;
        self.memcpy_to(splice, &arch::SYSCALL_INSN)?;

        // Past this point the splice bytes and registers are always put
        // back, error or not.
        let result = self.step_syscall(splice, &old_regs, nr, args);

        let restore_code = self.memcpy_to(splice, &orig_code);
        let restore_regs = arch::write_gprs(pid, &old_regs);

        let value = result?;
        restore_code?;
        restore_regs.map_err(|source| RemoteError::Ptrace {
            op: "SETREGS",
            pid: pid.as_raw(),
            source,
        })?;

        debug!("remote syscall {} -> {:#x}", nr, value);
        Ok(value)
    }

    fn step_syscall(
        &mut self,
        splice: u64,
        old_regs: &arch::Regs,
        nr: i64,
        args: [u64; 6],
    ) -> Result<u64, RemoteError> {
        let pid = self.pid;

        let mut regs = *old_regs;
        arch::set_instruction_pointer(&mut regs, splice);
        arch::prepare_syscall(&mut regs, nr as u64, args);
        arch::write_gprs(pid, &regs).map_err(|source| RemoteError::Ptrace {
            op: "SETREGS",
            pid: pid.as_raw(),
            source,
        })?;

        ptrace::single_step(pid)?;

        let after = arch::read_gprs(pid).map_err(|source| RemoteError::Ptrace {
            op: "GETREGS",
            pid: pid.as_raw(),
            source,
        })?;
        let ret = arch::return_value(&after) as i64;
        if (-4095..0).contains(&ret) {
            return Err(RemoteError::Syscall {
                nr,
                errno: (-ret) as i32,
            });
        }
        Ok(ret as u64)
    }

    pub fn remote_mmap(
        &mut self,
        addr: u64,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> Result<u64, RemoteError> {
        self.remote_syscall(
            libc::SYS_mmap,
            [
                addr,
                length as u64,
                prot as u64,
                flags as i64 as u64,
                fd as i64 as u64,
                offset,
            ],
        )
    }

    pub fn remote_munmap(&mut self, addr: u64, length: usize) -> Result<(), RemoteError> {
        self.remote_syscall(libc::SYS_munmap, [addr, length as u64, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn remote_msync(
        &mut self,
        addr: u64,
        length: usize,
        flags: i32,
    ) -> Result<(), RemoteError> {
        self.remote_syscall(
            libc::SYS_msync,
            [addr, length as u64, flags as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn remote_msync_sync(&mut self, addr: u64, length: usize) -> Result<(), RemoteError> {
        self.remote_msync(addr, length, libc::MS_SYNC)
    }

    pub fn remote_msync_async(&mut self, addr: u64, length: usize) -> Result<(), RemoteError> {
        self.remote_msync(addr, length, libc::MS_ASYNC)
    }

    /// Anonymous read-write private memory in the target
    pub fn remote_malloc(&mut self, length: usize) -> Result<u64, RemoteError> {
        self.remote_mmap(
            0,
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    }

    pub fn remote_free(&mut self, addr: u64, length: usize) -> Result<(), RemoteError> {
        self.remote_munmap(addr, length)
    }

    /// Open a file inside the target.
    ///
    /// The pathname is materialized into the target with a temporary
    /// anonymous mapping. Except when creating, symlinks are resolved in
    /// our own filesystem first; the intended deployment shares one mount
    /// namespace with the target.
    pub fn remote_open(
        &mut self,
        pathname: &Path,
        flags: i32,
        mode: u32,
    ) -> Result<i32, RemoteError> {
        let resolved;
        let pathname = if flags & libc::O_CREAT == 0 {
            resolved = std::fs::canonicalize(pathname)
                .map_err(|e| RemoteError::Path(pathname.into(), e))?;
            resolved.as_path()
        } else {
            pathname
        };

        let mut bytes = pathname.as_os_str().as_bytes().to_vec();
        bytes.push(0);

        let remote_path = self.remote_malloc(bytes.len())?;
        let result = self
            .memcpy_to(remote_path, &bytes)
            .map_err(RemoteError::from)
            .and_then(|_| {
                #[cfg(target_arch = "x86_64")]
                {
                    self.remote_syscall(
                        libc::SYS_open,
                        [remote_path, flags as i64 as u64, mode as u64, 0, 0, 0],
                    )
                }
                #[cfg(target_arch = "aarch64")]
                {
                    self.remote_syscall(
                        libc::SYS_openat,
                        [
                            libc::AT_FDCWD as i64 as u64,
                            remote_path,
                            flags as i64 as u64,
                            mode as u64,
                            0,
                            0,
                        ],
                    )
                }
            });
        let _ = self.remote_free(remote_path, bytes.len());
        result.map(|fd| fd as i32)
    }

    pub fn remote_close(&mut self, fd: i32) -> Result<(), RemoteError> {
        self.remote_syscall(libc::SYS_close, [fd as u64, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn remote_ftruncate(&mut self, fd: i32, length: u64) -> Result<(), RemoteError> {
        self.remote_syscall(libc::SYS_ftruncate, [fd as u64, length, 0, 0, 0, 0])?;
        Ok(())
    }

    /// `fstat(2)` in the target; the stat buffer lives in a temporary
    /// remote allocation and is copied back out.
    pub fn remote_fstat(&mut self, fd: i32) -> Result<libc::stat, RemoteError> {
        let len = mem::size_of::<libc::stat>();
        let remote_buf = self.remote_malloc(len)?;

        let call = self.remote_syscall(libc::SYS_fstat, [fd as u64, remote_buf, 0, 0, 0, 0]);
        let mut statbuf: libc::stat = unsafe { mem::zeroed() };
        let copy = {
            let view = unsafe {
                std::slice::from_raw_parts_mut(&mut statbuf as *mut libc::stat as *mut u8, len)
            };
            self.memcpy_from(remote_buf, view)
        };
        let _ = self.remote_free(remote_buf, len);

        call?;
        copy?;
        Ok(statbuf)
    }

    pub fn remote_prctl(
        &mut self,
        option: i32,
        arg2: u64,
        arg3: u64,
        arg4: u64,
        arg5: u64,
    ) -> Result<u64, RemoteError> {
        self.remote_syscall(
            libc::SYS_prctl,
            [option as i64 as u64, arg2, arg3, arg4, arg5, 0],
        )
    }

    /// Best-effort `PR_SET_VMA_ANON_NAME` so the mapping is identifiable in
    /// the target's maps; pre-5.17 kernels reject the option.
    pub fn remote_set_vma_name(&mut self, addr: u64, length: usize, name: &str) {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        let remote_name = match self.remote_malloc(bytes.len()) {
            Ok(a) => a,
            Err(_) => return,
        };
        if self.memcpy_to(remote_name, &bytes).is_ok() {
            let _ = self.remote_prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME as u64,
                addr,
                length as u64,
                remote_name,
            );
        }
        let _ = self.remote_free(remote_name, bytes.len());
    }
}
