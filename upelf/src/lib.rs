//! Parsing ELF64 files and in-memory images

pub mod components;
pub mod parse;

use std::convert::TryFrom;
use std::fmt;

use derive_more::{Add, Sub};
use derive_try_from_primitive::TryFromPrimitive;

use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    combinator::{map, verify},
    error::context,
    multi::many_m_n,
    number::complete::{le_u16, le_u32, le_u64},
    sequence::tuple,
    Err::{Error, Failure},
    Offset,
};

use components::{
    rela::Rela,
    section::{KnownSectionType, SectionHeader, SectionType},
    segment::{ProgramHeader, SegmentType},
    strtab::StringTable,
    sym::Sym,
};

/// The fixed-size ELF identification and header, parseable on its own from
/// the first 64 bytes of a file or of a mapped image.
#[derive(Debug, Clone)]
pub struct Header {
    pub typ: ElfType,
    pub machine: Machine,
    pub entry_point: Addr,
    pub ph_offset: Addr,
    pub sh_offset: Addr,
    pub ph_entsize: usize,
    pub ph_count: usize,
    pub sh_entsize: usize,
    pub sh_count: usize,
    pub sh_nidx: usize,
}

impl Header {
    pub const MAGIC: &'static [u8] = &[0x7F, 0x45, 0x4C, 0x46];
    pub const SIZE: usize = 64;

    /// Parse the header, validating the identification bytes
    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        let mut u16_usize = map(le_u16, |x| x as usize);

        let (i, _) = tuple((
            context("Magic", tag(Self::MAGIC)),
            context("Class not 64bit", tag(&[0x2])),
            context("Endianness not little", tag(&[0x1])),
            context("Version not 1", tag(&[0x1])),
            context("OS ABI not sysv/linux", alt((tag(&[0x0]), tag(&[0x3])))),
            context("Padding", take(8_usize)),
        ))(i)?;

        let (i, typ) = ElfType::parse(i)?;
        let (i, machine) = Machine::parse(i)?;
        let (i, _) = context("Version (bis)", verify(le_u32, |&x| x == 1))(i)?;
        let (i, entry_point) = Addr::parse(i)?;
        let (i, ph_offset) = Addr::parse(i)?;
        let (i, sh_offset) = Addr::parse(i)?;
        let (i, _flags) = le_u32(i)?;
        let (i, _hdr_size) = le_u16(i)?;
        let (i, ph_entsize) = u16_usize(i)?;
        let (i, ph_count) = u16_usize(i)?;
        let (i, sh_entsize) = u16_usize(i)?;
        let (i, sh_count) = u16_usize(i)?;
        let (i, sh_nidx) = u16_usize(i)?;

        let res = Self {
            typ,
            machine,
            entry_point,
            ph_offset,
            sh_offset,
            ph_entsize,
            ph_count,
            sh_entsize,
            sh_count,
            sh_nidx,
        };
        Ok((i, res))
    }
}

/// An ELF file: header plus fully parsed program and section header tables
#[derive(Debug)]
pub struct File {
    pub header: Header,
    pub program_headers: Vec<ProgramHeader>,
    pub section_headers: Vec<SectionHeader>,
    shstrtab: StringTable,
}

impl File {
    /// Parse a whole file image
    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        let full_input = i;
        let (i, header) = Header::parse(i)?;

        let mut program_headers = Vec::new();
        if header.ph_count > 0 {
            if header.ph_entsize < ProgramHeader::SIZE {
                return Err(parse::failure(full_input, "program header entry too small"));
            }
            let off: usize = header.ph_offset.into();
            let table = full_input
                .get(off..)
                .ok_or_else(|| parse::failure(full_input, "program header table out of bounds"))?;
            for ph_slice in table.chunks(header.ph_entsize).take(header.ph_count) {
                let (_, ph) = ProgramHeader::parse(ph_slice)?;
                program_headers.push(ph);
            }
        }

        let mut section_headers = Vec::new();
        if header.sh_count > 0 {
            if header.sh_entsize < SectionHeader::SIZE {
                return Err(parse::failure(full_input, "section header entry too small"));
            }
            let off: usize = header.sh_offset.into();
            let table = full_input
                .get(off..)
                .ok_or_else(|| parse::failure(full_input, "section header table out of bounds"))?;
            for sh_slice in table.chunks(header.sh_entsize).take(header.sh_count) {
                let (_, sh) = SectionHeader::parse(sh_slice)?;
                section_headers.push(sh);
            }
        }

        let shstrtab = match section_headers.get(header.sh_nidx) {
            Some(sh) => {
                let off: usize = sh.off.into();
                let len: usize = sh.size.into();
                let data = full_input
                    .get(off..off + len)
                    .ok_or_else(|| parse::failure(full_input, "shstrtab out of bounds"))?;
                StringTable::new(data.to_vec())
            }
            None => StringTable::empty(),
        };

        let res = Self {
            header,
            program_headers,
            section_headers,
            shstrtab,
        };
        Ok((i, res))
    }

    /// Parse a whole file image, turning nom's error chain into a [`FileError`]
    pub fn from_bytes(i: &[u8]) -> Result<Self, FileError> {
        match Self::parse(i) {
            Ok((_, file)) => Ok(file),
            Err(Failure(err)) | Err(Error(err)) => {
                let mut out = String::new();
                for (input, kind) in err.errors.iter().take(3) {
                    let offset = i.offset(input);
                    out.push_str(&format!("{:?} at {:08x} [{:?}]; ", kind, offset, HexDump(input)));
                }
                Err(FileError::Parse(out))
            }
            Err(_) => Err(FileError::Incomplete),
        }
    }

    /// Name of a section, resolved through the section-name string table
    pub fn section_name(&self, sh: &SectionHeader) -> Option<&str> {
        self.shstrtab.at(sh.name as usize)
    }

    /// Find a section by name
    pub fn find_section(&self, name: &str) -> Option<(usize, &SectionHeader)> {
        self.section_headers
            .iter()
            .enumerate()
            .find(|(_, sh)| self.section_name(sh) == Some(name))
    }

    /// Return the first section with the given type
    pub fn section_with(&self, typ: KnownSectionType) -> Option<(usize, &SectionHeader)> {
        self.section_headers
            .iter()
            .enumerate()
            .find(|(_, sh)| sh.typ == SectionType::Known(typ))
    }

    /// Slice the raw bytes of a section out of the file image
    pub fn section_data<'a>(
        &self,
        input: &'a [u8],
        sh: &SectionHeader,
    ) -> Result<&'a [u8], FileError> {
        let off: usize = sh.off.into();
        let len: usize = sh.size.into();
        input
            .get(off..off + len)
            .ok_or(FileError::TruncatedSection { off, len })
    }

    /// Read the symbol table held by the section at `index`
    pub fn read_syms(&self, input: &[u8], index: usize) -> Result<Vec<Sym>, ReadSymsError> {
        let sh = self
            .section_headers
            .get(index)
            .ok_or(ReadSymsError::SymTabSectionNotFound)?;
        let data = self
            .section_data(input, sh)
            .map_err(|_| ReadSymsError::SymTabSectionNotFound)?;

        let n = data.len() / Sym::SIZE;
        match many_m_n(n, n, Sym::parse)(data) {
            Ok((_, syms)) => Ok(syms),
            Err(Failure(err)) | Err(Error(err)) => Err(ReadSymsError::ParsingError(format!(
                "{:?}",
                err.errors.first().map(|(_, kind)| kind)
            ))),
            _ => Err(ReadSymsError::ParsingError("incomplete".into())),
        }
    }

    /// Read the relocation entries held by the `SHT_RELA` section at `index`
    pub fn read_relas(&self, input: &[u8], index: usize) -> Result<Vec<Rela>, ReadRelaError> {
        let sh = self
            .section_headers
            .get(index)
            .ok_or(ReadRelaError::RelaSectionNotFound)?;
        let data = self
            .section_data(input, sh)
            .map_err(|_| ReadRelaError::RelaSectionNotFound)?;

        let n = data.len() / Rela::SIZE;
        match many_m_n(n, n, Rela::parse)(data) {
            Ok((_, relas)) => Ok(relas),
            Err(Failure(err)) | Err(Error(err)) => Err(ReadRelaError::ParsingError(format!(
                "{:?}",
                err.errors.first().map(|(_, kind)| kind)
            ))),
            _ => Err(ReadRelaError::ParsingError("incomplete".into())),
        }
    }

    /// Build an owned copy of the string table held by the section at `index`
    pub fn strtab(&self, input: &[u8], index: usize) -> Result<StringTable, FileError> {
        let sh = self
            .section_headers
            .get(index)
            .ok_or(FileError::NoSuchSection(index))?;
        Ok(StringTable::new(self.section_data(input, sh)?.to_vec()))
    }

    /// Return the first program header with the given type
    pub fn segment_of_type(&self, typ: SegmentType) -> Option<&ProgramHeader> {
        self.program_headers.iter().find(|ph| ph.typ == typ)
    }

    /// The lowest `PT_LOAD` virtual address, the anchor for load-bias math
    pub fn lowest_load_vaddr(&self) -> Option<Addr> {
        self.program_headers
            .iter()
            .filter(|ph| ph.typ == SegmentType::Known(components::segment::KnownSegmentType::Load))
            .map(|ph| ph.vaddr)
            .min()
    }
}

/// An error that occurred while reading an ELF file image
#[derive(thiserror::Error, Debug)]
pub enum FileError {
    #[error("parsing failed: {0}")]
    Parse(String),
    #[error("truncated input")]
    Incomplete,
    #[error("section data out of bounds (off {off:#x}, len {len:#x})")]
    TruncatedSection { off: usize, len: usize },
    #[error("no section with index {0}")]
    NoSuchSection(usize),
}

/// An error that occurred while trying to read relocations
#[derive(thiserror::Error, Debug)]
pub enum ReadRelaError {
    #[error("RELA section not found or out of bounds")]
    RelaSectionNotFound,
    #[error("parsing error: {0}")]
    ParsingError(String),
}

/// An error that occurred while trying to read symbols
#[derive(thiserror::Error, Debug)]
pub enum ReadSymsError {
    #[error("SymTab section not found or out of bounds")]
    SymTabSectionNotFound,
    #[error("parsing error: {0}")]
    ParsingError(String),
}

/// The type of an ELF file
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum ElfType {
    None = 0x0,
    Rel = 0x1,
    Exec = 0x2,
    Dyn = 0x3,
    Core = 0x4,
}

/// The machine an ELF file targets
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum Machine {
    X86 = 0x03,
    X86_64 = 0x3E,
    Aarch64 = 0xB7,
}

impl_parse_for_enum!(ElfType, le_u16);
impl_parse_for_enum!(Machine, le_u16);

/// An address or offset in an ELF file or a target address space
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Add, Sub)]
pub struct Addr(pub u64);

impl Addr {
    /// Parse an address
    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        map(le_u64, From::from)(i)
    }

    /// Round down to the given power-of-two alignment
    pub fn align_down(self, align: u64) -> Self {
        if align <= 1 {
            return self;
        }
        Self(self.0 & !(align - 1))
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u64> for Addr {
    fn from(x: u64) -> Self {
        Self(x)
    }
}

impl From<Addr> for u64 {
    fn from(x: Addr) -> Self {
        x.0
    }
}

impl From<Addr> for usize {
    fn from(x: Addr) -> Self {
        x.0 as usize
    }
}

pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Debug for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &x in self.0.iter().take(20) {
            write!(f, "{:02x} ", x)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Addr, ElfType, Machine};
    use std::convert::TryFrom;

    #[test]
    fn try_enums() {
        assert_eq!(Machine::X86_64 as u16, 0x3E);
        assert_eq!(Machine::try_from(0x3E), Ok(Machine::X86_64));
        assert_eq!(Machine::try_from(0xB7), Ok(Machine::Aarch64));
        assert_eq!(Machine::try_from(0xFA), Err(0xFA));
        assert_eq!(ElfType::try_from(0x1), Ok(ElfType::Rel));
    }

    #[test]
    fn addr_math() {
        assert_eq!(Addr(0x1000) + Addr(0x20), Addr(0x1020));
        assert_eq!(Addr(0x1020) - Addr(0x20), Addr(0x1000));
        assert_eq!(Addr(0x1fff).align_down(0x1000), Addr(0x1000));
        assert_eq!(Addr(0x1fff).align_down(1), Addr(0x1fff));
    }

    #[test]
    fn header_rejects_garbage() {
        assert!(super::Header::parse(&[0u8; 64]).is_err());
        assert!(super::Header::parse(b"\x7fELF").is_err());
    }
}
