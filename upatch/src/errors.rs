//! Error types, one enum per concern

use std::path::PathBuf;

use crate::arch::EncodeError;

/// Errors establishing or inspecting a target process
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("no such process: {0}")]
    NoProcess(i32),
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("could not parse {0}: {1}")]
    ProcParse(PathBuf, String),
    #[error("no executable libc mapping in target {0}")]
    LibcNotFound(i32),
    #[error("no [stack] mapping in target {0}")]
    StackNotFound(i32),
    #[error("ELF error in {0}: {1}")]
    Elf(PathBuf, #[source] upelf::FileError),
    #[error("registry setup failed: {0}")]
    Registry(#[source] std::io::Error),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors touching the target's memory
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("short read at {addr:#x}: wanted {want}, got {got}")]
    ShortRead { addr: u64, want: usize, got: usize },
    #[error("short write at {addr:#x}: wanted {want}, got {got}")]
    ShortWrite { addr: u64, want: usize, got: usize },
    #[error("target memory I/O at {addr:#x}: {source}")]
    Io {
        addr: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("ptrace peek/poke at {addr:#x}: {source}")]
    Ptrace {
        addr: u64,
        #[source]
        source: nix::Error,
    },
}

/// Errors driving the target with ptrace or remote syscalls
#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("ptrace {op} on pid {pid}: {source}")]
    Ptrace {
        op: &'static str,
        pid: i32,
        #[source]
        source: nix::Error,
    },
    #[error("waitpid on pid {pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: nix::Error,
    },
    #[error("target {0} exited during the operation")]
    TargetExited(i32),
    #[error("target {0} faulted while stepping the spliced syscall")]
    TargetFault(i32),
    #[error("remote syscall {nr} failed with errno {errno}")]
    Syscall { nr: i64, errno: i32 },
    #[error("task is not attached")]
    NotAttached,
    #[error("path {0}: {1}")]
    Path(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors resolving symbols in the target
#[derive(thiserror::Error, Debug)]
pub enum SymbolError {
    #[error("symbol {0} not found in target")]
    NotFound(String),
    #[error("no PT_DYNAMIC segment in {0}")]
    NoDynamic(String),
    #[error("dynsym entry size {0}, expected {1}")]
    BadSyment(u64, usize),
    #[error("symbol table of {0}: {1}")]
    Parse(String, String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors applying a relocation against the staged patch image
#[derive(thiserror::Error, Debug)]
pub enum RelocationError {
    #[error("unsupported relocation type {0}")]
    Unsupported(u32),
    #[error("relocation type {typ} at {loc:#x} cannot reach {value:#x}")]
    Overflow { typ: u32, loc: u64, value: u64 },
}

/// Errors across the whole patch lifecycle
#[derive(thiserror::Error, Debug)]
pub enum PatchError {
    #[error("patch file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("patch file {0} is empty")]
    Empty(PathBuf),
    #[error("patch file {0}: {1}")]
    Elf(PathBuf, #[source] upelf::FileError),
    #[error("{0} is not a relocatable object")]
    NotRelocatable(PathBuf),
    #[error("{0} targets {1:?}, host machine is {2:?}")]
    WrongMachine(PathBuf, upelf::Machine, upelf::Machine),
    #[error("missing section {1} in {0}")]
    MissingSection(PathBuf, &'static str),
    #[error("patch metadata: {0}")]
    Meta(String),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("patch is not staged in the target")]
    NotStaged,
    #[error("target function {0} is too small to patch ({1} bytes)")]
    FunctionTooSmall(String, u64),
    #[error("no unique replacement function in the patch object")]
    AmbiguousReplacement,
    #[error("no free span of {0} bytes reachable from the call site")]
    NoSpan(usize),
    #[error("patching requires a task opened with RegisterOnDisk")]
    RegistryRequired,
    #[error("trampoline placement: {0}")]
    Region(#[from] region::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Syms(#[from] upelf::ReadSymsError),
    #[error(transparent)]
    Relas(#[from] upelf::ReadRelaError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error(transparent)]
    Relocation(#[from] RelocationError),
}

impl PatchError {
    /// Best-effort mapping to an errno-style exit code for the CLI
    pub fn errno(&self) -> Option<i32> {
        match self {
            PatchError::Remote(RemoteError::Syscall { errno, .. }) => Some(*errno),
            PatchError::Io(_, e) => e.raw_os_error(),
            _ => None,
        }
    }
}
