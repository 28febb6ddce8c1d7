//! Utilities related to parsing of relocation entries

use nom::{
    combinator::map,
    number::complete::{le_i64, le_u32},
    sequence::tuple,
};

use crate::{parse, Addr};

/// A relocation entry with an explicit addend
///
/// `typ` is kept raw: the numbering is ISA-specific (x86-64 and aarch64
/// reuse the same small integers for different things), so interpretation
/// belongs to whoever knows which machine the object targets.
#[derive(Debug, Clone)]
pub struct Rela {
    pub offset: Addr,
    pub typ: u32,
    pub sym: u32,
    pub addend: i64,
}

impl Rela {
    pub const SIZE: usize = 24;

    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        map(
            tuple((Addr::parse, le_u32, le_u32, le_i64)),
            |(offset, typ, sym, addend)| Rela {
                offset,
                typ,
                sym,
                addend,
            },
        )(i)
    }
}
