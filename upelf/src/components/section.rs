//! Utilities related to parsing of section headers

use core::convert::TryFrom;
use core::fmt;

use derive_try_from_primitive::TryFromPrimitive;
use nom::{
    branch::alt,
    combinator::map,
    number::complete::{le_u32, le_u64},
    sequence::tuple,
};

use crate::{impl_parse_for_enum, parse, Addr};

/// A header for a section
#[derive(Debug)]
pub struct SectionHeader {
    pub name: u32,
    pub typ: SectionType,
    pub flags: u64,
    pub addr: Addr,
    pub off: Addr,
    pub size: Addr,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

/// `SHF_ALLOC`: the section occupies memory at run time
pub const SHF_ALLOC: u64 = 0x2;

impl SectionHeader {
    pub const SIZE: usize = 64;

    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        let (i, (name, typ, flags, addr, off, size, link, info, addralign, entsize)) =
            tuple((
                le_u32,
                SectionType::parse,
                le_u64,
                Addr::parse,
                Addr::parse,
                Addr::parse,
                le_u32,
                le_u32,
                le_u64,
                le_u64,
            ))(i)?;
        let res = Self {
            name,
            typ,
            flags,
            addr,
            off,
            size,
            link,
            info,
            addralign,
            entsize,
        };
        Ok((i, res))
    }

    pub fn is_alloc(&self) -> bool {
        self.flags & SHF_ALLOC != 0
    }
}

/// The type of a section, when we know it
#[repr(u32)]
#[derive(Clone, Copy, Debug, TryFromPrimitive, PartialEq, Eq)]
pub enum KnownSectionType {
    Null = 0x0,
    Progbits = 0x1,
    SymTab = 0x2,
    StrTab = 0x3,
    Rela = 0x4,
    Hash = 0x5,
    Dynamic = 0x6,
    Note = 0x7,
    NoBits = 0x8,
    Rel = 0x9,
    DynSym = 0xB,
    InitArray = 0xE,
    FiniArray = 0xF,
    Group = 0x11,
    SymTabShndx = 0x12,
}

impl_parse_for_enum!(KnownSectionType, le_u32);

/// The type of a section; objects in the wild carry GNU and processor
/// specific types we have no business interpreting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionType {
    Known(KnownSectionType),
    Unknown(u32),
}

impl SectionType {
    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        alt((
            map(KnownSectionType::parse, Self::Known),
            map(le_u32, Self::Unknown),
        ))(i)
    }

    pub fn is(self, k: KnownSectionType) -> bool {
        self == Self::Known(k)
    }
}

/// The section index stored in a symbol
#[derive(Clone, Copy)]
pub struct SectionIndex(pub u16);

impl SectionIndex {
    pub fn is_undef(&self) -> bool {
        self.0 == 0
    }

    pub fn is_special(&self) -> bool {
        self.0 >= 0xff00
    }

    pub fn get(&self) -> Option<usize> {
        if self.is_undef() || self.is_special() {
            None
        } else {
            Some(self.0 as usize)
        }
    }
}

impl fmt::Debug for SectionIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_special() {
            write!(f, "Special({:04x})", self.0)
        } else if self.is_undef() {
            write!(f, "Undef")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_type_open_set() {
        let (_, typ) = SectionType::parse(&0x1u32.to_le_bytes()).unwrap();
        assert!(typ.is(KnownSectionType::Progbits));

        // SHT_GNU_hash, not in our known set
        let (_, typ) = SectionType::parse(&0x6ffffff6u32.to_le_bytes()).unwrap();
        assert_eq!(typ, SectionType::Unknown(0x6ffffff6));
    }

    #[test]
    fn section_index() {
        assert!(SectionIndex(0).is_undef());
        assert!(SectionIndex(0xfff1).is_special());
        assert_eq!(SectionIndex(3).get(), Some(3));
        assert_eq!(SectionIndex(0xfff1).get(), None);
    }
}
