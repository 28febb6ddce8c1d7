//! Loading a relocatable patch object into the target and redirecting the
//! patched function to it.
//!
//! Lifecycle: `Unloaded -> Parsed -> Staged -> Relocated -> Active`, and
//! back to `Unloaded` on removal or on any failure, with the unwind running
//! in reverse order of what was done.

mod info;
mod install;
mod loader;

pub use info::{parse_load_info, LoadInfo, SectionIndexes};
pub use install::{
    delete_patch, delete_patch_from_meta, init_patch, install_branch, remove_install,
    InstallRecord, Patch, PatchState, Trampoline,
};
pub use loader::{apply_relocations, resolve_symbols, stage, ResolvedSyms};

use upelf::Machine;

/// The machine this build patches for
pub fn host_machine() -> Machine {
    #[cfg(target_arch = "x86_64")]
    {
        Machine::X86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        Machine::Aarch64
    }
}
