pub mod dynamic;
pub mod meta;
pub mod rela;
pub mod section;
pub mod segment;
pub mod strtab;
pub mod sym;
