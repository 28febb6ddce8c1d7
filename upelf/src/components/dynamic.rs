//! Utilities related to parsing of the dynamic table

use core::convert::TryFrom;

use derive_try_from_primitive::TryFromPrimitive;
use nom::{
    branch::alt,
    combinator::map,
    number::complete::le_u64,
    sequence::tuple,
};

use crate::{impl_parse_for_enum, parse, Addr};

/// The tag of a dynamic entry, when we know it
#[repr(u64)]
#[derive(Debug, TryFromPrimitive, PartialEq, Eq, Clone, Copy)]
pub enum KnownDynamicTag {
    Null = 0,
    Needed = 1,
    PltRelSz = 2,
    PltGot = 3,
    Hash = 4,
    StrTab = 5,
    SymTab = 6,
    Rela = 7,
    RelaSz = 8,
    RelaEnt = 9,
    StrSz = 10,
    SymEnt = 11,
    Init = 12,
    Fini = 13,
    SoName = 14,
    RPath = 15,
    Symbolic = 16,
    Rel = 17,
    RelSz = 18,
    RelEnt = 19,
    PltRel = 20,
    Debug = 21,
    TextRel = 22,
    JmpRel = 23,
    BindNow = 24,
    InitArray = 25,
    FiniArray = 26,
    InitArraySz = 27,
    FiniArraySz = 28,
    Runpath = 29,
    Flags = 30,
    GnuHash = 0x6ffffef5,
    VerSym = 0x6ffffff0,
    RelaCount = 0x6ffffff9,
    Flags1 = 0x6ffffffb,
    VerDef = 0x6ffffffc,
    VerDefNum = 0x6ffffffd,
    VerNeed = 0x6ffffffe,
    VerNeedNum = 0x6fffffff,
}

impl_parse_for_enum!(KnownDynamicTag, le_u64);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DynamicTag {
    Known(KnownDynamicTag),
    Unknown(u64),
}

impl DynamicTag {
    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        alt((
            map(KnownDynamicTag::parse, Self::Known),
            map(le_u64, Self::Unknown),
        ))(i)
    }

    pub fn is(self, k: KnownDynamicTag) -> bool {
        self == Self::Known(k)
    }
}

/// A dynamic entry
#[derive(Debug, Clone, Copy)]
pub struct DynamicEntry {
    pub tag: DynamicTag,
    pub addr: Addr,
}

impl DynamicEntry {
    pub const SIZE: usize = 16;

    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        let (i, (tag, addr)) = tuple((DynamicTag::parse, Addr::parse))(i)?;
        Ok((i, Self { tag, addr }))
    }
}

/// Parse a dynamic table out of raw bytes, stopping at `DT_NULL` or at the
/// end of the input
pub fn parse_dynamic_table(i: parse::Input) -> Vec<DynamicEntry> {
    let mut entries = Vec::new();
    let mut rest = i;
    while rest.len() >= DynamicEntry::SIZE {
        match DynamicEntry::parse(rest) {
            Ok((next, entry)) => {
                if entry.tag.is(KnownDynamicTag::Null) {
                    break;
                }
                entries.push(entry);
                rest = next;
            }
            Err(_) => break,
        }
    }
    entries
}
