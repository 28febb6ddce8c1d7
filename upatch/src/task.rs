//! The target process handle.
//!
//! A [`Task`] owns everything the engine knows about one attached process:
//! the `/proc/<pid>/mem` handle, the VMA arena, the symbol index, and the
//! optional on-disk registry entry. While a Task is alive, every mutation of
//! the target's mappings must go through it so the indexes stay coherent.
//! There is no global task list; callers own their Tasks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use custom_debug_derive::Debug as CustomDebug;
use enumflags2::{bitflags, BitFlags};
use log::{debug, warn};
use nix::unistd::Pid;
use upelf::File;

use crate::errors::TaskError;
use crate::memory::TargetMem;
use crate::ptrace;
use crate::registry::{Registry, DEFAULT_ROOT};
use crate::symbols::{self, SymbolIndex, TaskSymbol};
use crate::vma::{Vma, VmaIndex, VmaKind, VmaSet};

/// Capabilities requested when opening a target
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// Open target memory read-write
    Rdwr = 0x01,
    /// Model the address space from /proc/&lt;pid&gt;/maps (always implied)
    LoadVmas = 0x02,
    /// Parse the target's own executable from disk
    LoadSelfElf = 0x04,
    /// Parse the target's libc from disk
    LoadLibcElf = 0x08,
    /// Peek ELF headers of every mapping
    LoadVmaElfs = 0x10,
    /// Build the symbol index (implies LoadVmaElfs)
    LoadSymbols = 0x20,
    /// Keep an on-disk registry entry for this target
    RegisterOnDisk = 0x40,
}

/// An ELF file read from disk, kept with its raw bytes for lazy table reads
#[derive(CustomDebug)]
pub struct LoadedElf {
    pub path: PathBuf,
    #[debug(skip)]
    pub raw: Vec<u8>,
    #[debug(skip)]
    pub file: File,
}

impl LoadedElf {
    fn open(path: &Path) -> Result<Self, TaskError> {
        let raw = std::fs::read(path).map_err(|e| TaskError::Io(path.into(), e))?;
        let file = File::from_bytes(&raw).map_err(|e| TaskError::Elf(path.into(), e))?;
        Ok(Self {
            path: path.into(),
            raw,
            file,
        })
    }
}

/// One attached (or at least opened) target process
#[derive(CustomDebug)]
pub struct Task {
    pub pid: Pid,
    pub comm: String,
    pub exe: PathBuf,
    pub flags: BitFlags<OpenFlag>,
    #[debug(skip)]
    pub(crate) mem: TargetMem,
    pub vmas: VmaSet,
    /// Executable libc mapping, the syscall splice site
    pub libc_vma: VmaIndex,
    pub stack_vma: VmaIndex,
    #[debug(skip)]
    pub symbols: SymbolIndex,
    pub exe_elf: Option<LoadedElf>,
    pub libc_elf: Option<LoadedElf>,
    pub registry: Option<Registry>,
    attached: bool,
}

impl Task {
    /// Open a target with the default registry root
    pub fn open(pid: i32, flags: BitFlags<OpenFlag>) -> Result<Self, TaskError> {
        Self::open_with_root(pid, flags, Path::new(DEFAULT_ROOT))
    }

    /// Open a target, placing any registry entry under `root`
    pub fn open_with_root(
        pid: i32,
        flags: BitFlags<OpenFlag>,
        root: &Path,
    ) -> Result<Self, TaskError> {
        let flags = flags | OpenFlag::LoadVmas;

        let proc_dir = PathBuf::from(format!("/proc/{}", pid));
        if !proc_dir.exists() {
            return Err(TaskError::NoProcess(pid));
        }

        let comm_path = proc_dir.join("comm");
        let comm = std::fs::read_to_string(&comm_path)
            .map_err(|e| TaskError::Io(comm_path, e))?
            .trim()
            .to_string();
        let exe_path = proc_dir.join("exe");
        let exe = std::fs::read_link(&exe_path).map_err(|e| TaskError::Io(exe_path, e))?;

        let mem = TargetMem::open(Pid::from_raw(pid), flags.contains(OpenFlag::Rdwr))
            .map_err(|e| TaskError::Io(format!("/proc/{}/mem", pid).into(), e))?;

        let vmas = VmaSet::read(pid, &exe.to_string_lossy())?;
        let libc_vma = vmas.libc.ok_or(TaskError::LibcNotFound(pid))?;
        let stack_vma = vmas.stack.ok_or(TaskError::StackNotFound(pid))?;

        let mut task = Self {
            pid: Pid::from_raw(pid),
            comm,
            exe,
            flags,
            mem,
            vmas,
            libc_vma,
            stack_vma,
            symbols: SymbolIndex::default(),
            exe_elf: None,
            libc_elf: None,
            registry: None,
            attached: false,
        };

        if flags.contains(OpenFlag::LoadSelfElf) || flags.contains(OpenFlag::LoadSymbols) {
            task.exe_elf = Some(LoadedElf::open(&task.exe.clone())?);
        }
        if flags.contains(OpenFlag::LoadLibcElf) {
            let libc_path = PathBuf::from(&task.vmas.get(task.libc_vma).name);
            task.libc_elf = Some(LoadedElf::open(&libc_path)?);
        }

        if flags.contains(OpenFlag::LoadVmaElfs) || flags.contains(OpenFlag::LoadSymbols) {
            task.peek_all_elfs()?;
        }
        if flags.contains(OpenFlag::LoadSymbols) {
            task.load_all_symbols();
        }

        if flags.contains(OpenFlag::RegisterOnDisk) {
            let registry =
                Registry::create(root, pid, &task.comm).map_err(TaskError::Registry)?;
            task.registry = Some(registry);
        }

        debug!("opened task {} ({})", pid, task.comm);
        Ok(task)
    }

    fn peek_all_elfs(&mut self) -> Result<(), TaskError> {
        for idx in 0..self.vmas.len() {
            self.vmas.peek_elf(idx, &self.mem)?;
        }
        Ok(())
    }

    /// Fill the symbol index from the self ELF and every mapped library.
    /// Per-library failures are logged and skipped; a library with odd
    /// dynamic tables must not take the whole task down.
    fn load_all_symbols(&mut self) {
        if let Some(exe_elf) = &self.exe_elf {
            let self_leader = self
                .vmas
                .iter()
                .find(|(idx, v)| v.kind == VmaKind::SelfExe && v.leader == *idx)
                .map(|(idx, _)| idx);
            match self_leader {
                Some(leader) => {
                    if let Err(e) = symbols::load_self_symbols(
                        &mut self.symbols,
                        &exe_elf.file,
                        &exe_elf.raw,
                        leader,
                    ) {
                        warn!("self symbols: {}", e);
                    }
                }
                None => warn!("no self VMA for {}", self.exe.display()),
            }
        }

        for idx in 0..self.vmas.len() {
            let vma = self.vmas.get(idx);
            if vma.leader != idx || vma.elf.is_none() || vma.kind == VmaKind::SelfExe {
                continue;
            }
            if let Err(e) = symbols::load_dynamic_symbols(&mut self.symbols, &self.vmas, idx, &self.mem)
            {
                debug!("{}: dynamic symbols skipped: {}", self.vmas.get(idx).name, e);
            }
        }
        debug!("symbol index holds {} names", self.symbols.len());
    }

    /// Attach and wait until the target is quiescent
    pub fn attach(&mut self) -> Result<(), crate::errors::RemoteError> {
        ptrace::attach(self.pid)?;
        self.attached = true;
        Ok(())
    }

    /// Detach; only valid once per successful attach
    pub fn detach(&mut self) -> Result<(), crate::errors::RemoteError> {
        self.attached = false;
        ptrace::detach(self.pid)
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Read `buf.len()` bytes out of the target at `addr`
    pub fn memcpy_from(&self, addr: u64, buf: &mut [u8]) -> Result<(), crate::errors::MemoryError> {
        self.mem.read(addr, buf)
    }

    /// Write all of `src` into the target at `addr`
    pub fn memcpy_to(&self, addr: u64, src: &[u8]) -> Result<(), crate::errors::MemoryError> {
        self.mem.write(addr, src)
    }

    /// Look a symbol up by name
    pub fn find_symbol(&self, name: &str) -> Option<&TaskSymbol> {
        self.symbols.get(name)
    }

    /// A symbol's runtime address in the target's address space
    pub fn symbol_addr(&self, name: &str) -> Option<u64> {
        self.find_symbol(name)
            .map(|s| symbols::runtime_addr(&self.vmas, s))
    }

    /// Re-read `/proc/<pid>/maps` after the target's mappings changed.
    ///
    /// The arena is rebuilt from scratch; symbol anchors are re-attached to
    /// the new leader indices by backing-file name, and symbols whose
    /// library vanished are dropped.
    pub fn update_vmas(&mut self) -> Result<(), TaskError> {
        let old_names: HashMap<VmaIndex, String> = self
            .vmas
            .iter()
            .map(|(idx, v)| (idx, v.name.clone()))
            .collect();

        self.vmas = VmaSet::read(self.pid.as_raw(), &self.exe.to_string_lossy())?;
        self.libc_vma = self.vmas.libc.ok_or(TaskError::LibcNotFound(self.pid.as_raw()))?;
        self.stack_vma = self
            .vmas
            .stack
            .ok_or(TaskError::StackNotFound(self.pid.as_raw()))?;

        if self.flags.contains(OpenFlag::LoadVmaElfs) || self.flags.contains(OpenFlag::LoadSymbols)
        {
            self.peek_all_elfs()?;
        }

        if !self.symbols.is_empty() {
            let new_leader: HashMap<&str, VmaIndex> = self
                .vmas
                .iter()
                .filter(|(idx, v)| v.leader == *idx)
                .map(|(idx, v)| (v.name.as_str(), idx))
                .collect();

            let mut remapped = SymbolIndex::default();
            let mut dropped = 0;
            for symbol in self.symbols.iter() {
                let name = match old_names.get(&symbol.vma) {
                    Some(n) => n.as_str(),
                    None => continue,
                };
                match new_leader.get(name) {
                    Some(&leader) => remapped.insert(TaskSymbol {
                        vma: leader,
                        ..symbol.clone()
                    }),
                    None => dropped += 1,
                }
            }
            if dropped > 0 {
                warn!("{} symbols dropped with their mappings", dropped);
            }
            self.symbols = remapped;
        }
        Ok(())
    }

    /// The libc splice-site VMA
    pub fn libc_vma(&self) -> &Vma {
        self.vmas.get(self.libc_vma)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = ptrace::detach(self.pid) {
                warn!("detach on drop: {}", e);
            }
        }
        // the registry field drops after us and tears its directory down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_self() {
        let flags = OpenFlag::LoadVmaElfs.into();
        let task = Task::open(std::process::id() as i32, flags).unwrap();

        assert!(!task.comm.is_empty());
        assert!(task.vmas.len() > 4);
        assert!(task.libc_vma().is_exec());
        assert_eq!(task.vmas.get(task.stack_vma).kind, VmaKind::Stack);

        // the libc leader must have been recognized as a shared library
        let leader = task.libc_vma().leader;
        assert!(task.vmas.get(leader).elf.is_some() || task.libc_vma().elf.is_some());
    }

    #[test]
    fn open_self_with_symbols() {
        let flags = OpenFlag::LoadSymbols | OpenFlag::LoadSelfElf;
        let task = Task::open(std::process::id() as i32, flags).unwrap();

        // glibc exports these from its dynamic table
        let addr = task.symbol_addr("printf").expect("printf resolved");
        assert_ne!(addr, 0);
        let found = task.vmas.find(addr).expect("printf lies in a mapping");
        let leader_idx = task.vmas.get(found).leader;
        let leader = task.vmas.get(leader_idx);
        assert_eq!(leader.kind, VmaKind::Libc);
    }

    #[test]
    fn open_missing_pid() {
        // pid 0 never has a /proc entry we can use
        assert!(matches!(
            Task::open(0, BitFlags::empty()),
            Err(TaskError::NoProcess(0)) | Err(TaskError::Io(..))
        ));
    }
}
