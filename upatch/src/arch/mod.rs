//! Architecture-specific encodings and register plumbing.
//!
//! Everything the rest of the crate needs from the ISA comes through
//! [`native`]: branch encoders, the syscall instruction bytes, relocation
//! fixups, and the general-purpose register file layout. The algorithms in
//! `remote` and `patch` stay ISA-independent.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as native;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64 as native;

/// An error producing branch instruction bytes
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("branch from {ip:#x} to {dst:#x} is out of range")]
    OutOfRange { ip: u64, dst: u64 },
    #[error("unaligned branch address {0:#x}")]
    Unaligned(u64),
}
