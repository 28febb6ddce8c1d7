//! Utilities related to parsing of symbol table entries

use core::convert::TryFrom;

use derive_try_from_primitive::TryFromPrimitive;
use nom::{
    combinator::map,
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
};

use crate::{parse, Addr};

use super::section::SectionIndex;

/// The bind of a symbol
#[derive(Debug, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SymBind {
    Local = 0,
    Global = 1,
    Weak = 2,
    GnuUnique = 10,
}

/// The type of a symbol
#[derive(Debug, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SymType {
    None = 0,
    Object = 1,
    Func = 2,
    Section = 3,
    File = 4,
    Common = 5,
    Tls = 6,
    GnuIfunc = 10,
}

/// A symbol table entry
///
/// Bind and type are kept as the raw `st_info` byte; dynamic tables in the
/// wild carry values outside the ones we name, and a lookup must not die on
/// them.
#[derive(Clone, Debug)]
pub struct Sym {
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: SectionIndex,
    pub value: Addr,
    pub size: u64,
}

impl Sym {
    pub const SIZE: usize = 24;

    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        let (i, (name, info, other, shndx, value, size)) = tuple((
            le_u32,
            le_u8,
            le_u8,
            map(le_u16, SectionIndex),
            Addr::parse,
            le_u64,
        ))(i)?;
        let res = Self {
            name,
            info,
            other,
            shndx,
            value,
            size,
        };
        Ok((i, res))
    }

    pub fn bind(&self) -> Option<SymBind> {
        SymBind::try_from(self.info >> 4).ok()
    }

    pub fn sym_type(&self) -> Option<SymType> {
        SymType::try_from(self.info & 0xf).ok()
    }

    pub fn is_undef(&self) -> bool {
        self.shndx.is_undef()
    }

    pub fn is_func(&self) -> bool {
        self.sym_type() == Some(SymType::Func)
    }

    pub fn is_global(&self) -> bool {
        matches!(self.bind(), Some(SymBind::Global) | Some(SymBind::Weak))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_sym(name: u32, info: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&name.to_le_bytes());
        raw.push(info);
        raw.push(0);
        raw.extend_from_slice(&shndx.to_le_bytes());
        raw.extend_from_slice(&value.to_le_bytes());
        raw.extend_from_slice(&size.to_le_bytes());
        raw
    }

    #[test]
    fn parse_func_sym() {
        // GLOBAL FUNC in section 1
        let raw = raw_sym(7, 0x12, 1, 0x40, 0x20);
        let (_, sym) = Sym::parse(&raw).unwrap();
        assert_eq!(sym.bind(), Some(SymBind::Global));
        assert_eq!(sym.sym_type(), Some(SymType::Func));
        assert!(sym.is_func() && sym.is_global() && !sym.is_undef());
        assert_eq!(sym.value, Addr(0x40));
    }

    #[test]
    fn unusual_info_does_not_fail() {
        // processor-specific bind (13) and type (15)
        let raw = raw_sym(0, 0xdf, 0, 0, 0);
        let (_, sym) = Sym::parse(&raw).unwrap();
        assert_eq!(sym.bind(), None);
        assert_eq!(sym.sym_type(), None);
        assert!(sym.is_undef());
    }
}
