//! Parsing and validating a patch object file

use std::path::{Path, PathBuf};

use custom_debug_derive::Debug as CustomDebug;
use log::debug;
use upelf::components::meta::{PatchMeta, UPATCH_INFO_SECTION, UPATCH_STRTAB_SECTION};
use upelf::components::section::KnownSectionType;
use upelf::{ElfType, File};

use super::host_machine;
use crate::errors::PatchError;

/// Indices of the sections the loader keeps coming back to
#[derive(Debug, Clone, Copy)]
pub struct SectionIndexes {
    pub symtab: usize,
    pub strtab: usize,
    pub info: usize,
    pub upatch_strtab: usize,
}

/// Everything known about one patch object, from raw bytes up to (once
/// staged) its image address inside the target
#[derive(CustomDebug)]
pub struct LoadInfo {
    pub path: PathBuf,
    #[debug(skip)]
    pub raw: Vec<u8>,
    #[debug(skip)]
    pub file: File,
    pub index: SectionIndexes,
    pub meta: PatchMeta,
    /// VMA base of the staged image in the target
    pub target_base: Option<u64>,
    /// Registry copy the target mapped
    pub staged_path: Option<PathBuf>,
}

/// Read and validate a relocatable patch object. Nothing in the target is
/// touched; every error leaves only this process's memory behind.
pub fn parse_load_info(path: &Path) -> Result<LoadInfo, PatchError> {
    let raw = std::fs::read(path).map_err(|e| PatchError::Io(path.into(), e))?;
    if raw.is_empty() {
        return Err(PatchError::Empty(path.into()));
    }

    let file = File::from_bytes(&raw).map_err(|e| PatchError::Elf(path.into(), e))?;

    if file.header.typ != ElfType::Rel {
        return Err(PatchError::NotRelocatable(path.into()));
    }
    if file.header.machine != host_machine() {
        return Err(PatchError::WrongMachine(
            path.into(),
            file.header.machine,
            host_machine(),
        ));
    }

    let (symtab, symtab_sh) = file
        .section_with(KnownSectionType::SymTab)
        .ok_or(PatchError::MissingSection(path.into(), ".symtab"))?;
    let strtab = symtab_sh.link as usize;
    if strtab >= file.section_headers.len() {
        return Err(PatchError::MissingSection(path.into(), ".strtab"));
    }

    let (info_idx, info_sh) = file
        .find_section(UPATCH_INFO_SECTION)
        .ok_or(PatchError::MissingSection(path.into(), UPATCH_INFO_SECTION))?;
    let (upatch_strtab, _) = file
        .find_section(UPATCH_STRTAB_SECTION)
        .ok_or(PatchError::MissingSection(
            path.into(),
            UPATCH_STRTAB_SECTION,
        ))?;

    let info_data = file
        .section_data(&raw, info_sh)
        .map_err(|e| PatchError::Elf(path.into(), e))?;
    let meta = match PatchMeta::parse(info_data) {
        Ok((_, meta)) => meta,
        Err(_) => {
            return Err(PatchError::Meta(format!(
                "record too short ({} bytes, need {})",
                info_data.len(),
                PatchMeta::SIZE
            )));
        }
    };
    if meta.target_func.is_empty() {
        return Err(PatchError::Meta("empty target function name".into()));
    }

    debug!(
        "{}: patches {} (author {:?})",
        path.display(),
        meta.target_func,
        meta.author
    );

    Ok(LoadInfo {
        path: path.into(),
        raw,
        file,
        index: SectionIndexes {
            symtab,
            strtab,
            info: info_idx,
            upatch_strtab,
        },
        meta,
        target_base: None,
        staged_path: None,
    })
}
