//! The patch metadata record carried in a dedicated section

use nom::{
    bytes::complete::take,
    number::complete::{le_u32, le_u64},
    sequence::tuple,
};

use crate::{parse, Addr};

/// Section holding the fixed-layout [`PatchMeta`] record
pub const UPATCH_INFO_SECTION: &str = ".upatch.info";
/// Section holding patch-local strings
pub const UPATCH_STRTAB_SECTION: &str = ".upatch.strtab";

pub const UPATCH_TYPE_PATCH: u32 = 1;
pub const UPATCH_VERSION: u32 = 1;

const NAME_LEN: usize = 64;

/// The packed record describing a patch: which function it replaces, who
/// wrote it, and (once resolved) where the replacement lives in the target.
///
/// On-disk layout:
/// `{ u32 type, u32 version, char target_func[64], char author[64], u64 replace_addr }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMeta {
    pub typ: u32,
    pub version: u32,
    pub target_func: String,
    pub author: String,
    pub replace_addr: Addr,
}

impl PatchMeta {
    pub const SIZE: usize = 4 + 4 + NAME_LEN + NAME_LEN + 8;
    /// Byte offset of `replace_addr` within the record; the loader pokes the
    /// resolved address there in the staged image.
    pub const REPLACE_ADDR_OFFSET: usize = 4 + 4 + NAME_LEN + NAME_LEN;

    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        let (i, (typ, version, target_func, author, replace_addr)) = tuple((
            le_u32,
            le_u32,
            take(NAME_LEN),
            take(NAME_LEN),
            le_u64,
        ))(i)?;
        let res = Self {
            typ,
            version,
            target_func: fixed_str(target_func),
            author: fixed_str(author),
            replace_addr: Addr(replace_addr),
        };
        Ok((i, res))
    }

    /// Encode the record back into its packed layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.typ.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&fixed_bytes(&self.target_func));
        out.extend_from_slice(&fixed_bytes(&self.author));
        out.extend_from_slice(&self.replace_addr.0.to_le_bytes());
        out
    }
}

fn fixed_str(raw: &[u8]) -> String {
    let bytes = raw.split(|&c| c == 0).next().unwrap_or(raw);
    String::from_utf8_lossy(bytes).into_owned()
}

fn fixed_bytes(s: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let n = s.len().min(NAME_LEN - 1);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}
