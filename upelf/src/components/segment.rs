//! Utilities related to parsing of program headers

use core::convert::TryFrom;
use std::ops::Range;

use derive_try_from_primitive::TryFromPrimitive;
use enumflags2::{bitflags, BitFlags};
use nom::{
    branch::alt,
    combinator::map,
    number::complete::le_u32,
    sequence::tuple,
};

use crate::{impl_parse_for_enum, parse, Addr};

/// The type of a segment, when we know it
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum KnownSegmentType {
    Null = 0x0,
    Load = 0x1,
    Dynamic = 0x2,
    Interp = 0x3,
    Note = 0x4,
    ShLib = 0x5,
    PHdr = 0x6,
    TLS = 0x7,
    GnuEhFrame = 0x6474_E550,
    GnuStack = 0x6474_E551,
    GnuRelRo = 0x6474_E552,
    GnuProperty = 0x6474_E553,
}

impl_parse_for_enum!(KnownSegmentType, le_u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Known(KnownSegmentType),
    Unknown(u32),
}

impl SegmentType {
    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        alt((
            map(KnownSegmentType::parse, Self::Known),
            map(le_u32, Self::Unknown),
        ))(i)
    }

    pub fn is(self, k: KnownSegmentType) -> bool {
        self == Self::Known(k)
    }
}

/// Segment permission flags
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFlag {
    Execute = 0x1,
    Write = 0x2,
    Read = 0x4,
}

/// A program header
#[derive(Debug, Clone)]
pub struct ProgramHeader {
    pub typ: SegmentType,
    pub flags: BitFlags<SegmentFlag>,
    pub offset: Addr,
    pub vaddr: Addr,
    pub paddr: Addr,
    pub filesz: Addr,
    pub memsz: Addr,
    pub align: u64,
}

impl ProgramHeader {
    pub const SIZE: usize = 56;

    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        let (i, (typ, flags)) = tuple((
            SegmentType::parse,
            // OS and processor bits may be set beyond R/W/X
            map(le_u32, BitFlags::<SegmentFlag>::from_bits_truncate),
        ))(i)?;
        let (i, (offset, vaddr, paddr, filesz, memsz)) = tuple((
            Addr::parse,
            Addr::parse,
            Addr::parse,
            Addr::parse,
            Addr::parse,
        ))(i)?;
        let (i, align) = nom::number::complete::le_u64(i)?;

        let res = Self {
            typ,
            flags,
            offset,
            vaddr,
            paddr,
            filesz,
            memsz,
            align,
        };
        Ok((i, res))
    }

    /// The address range this segment occupies in memory
    pub fn mem_range(&self) -> Range<Addr> {
        self.vaddr..self.vaddr + self.memsz
    }
}
