//! Shared nom aliases and the enum-parser macro

pub type Input<'a> = &'a [u8];
pub type Result<'a, O> = nom::IResult<Input<'a>, O, nom::error::VerboseError<Input<'a>>>;

/// Build a `Failure` carrying a static context message, for bounds checks
/// that nom combinators can't express directly.
pub fn failure<'a>(
    input: Input<'a>,
    ctx: &'static str,
) -> nom::Err<nom::error::VerboseError<Input<'a>>> {
    nom::Err::Failure(nom::error::VerboseError {
        errors: vec![(input, nom::error::VerboseErrorKind::Context(ctx))],
    })
}

/// Implement `parse` for a `TryFromPrimitive` enum, reading the value with
/// the given little-endian number parser.
#[macro_export]
macro_rules! impl_parse_for_enum {
    ($type: ident, $number_parser: ident) => {
        impl $type {
            pub fn parse(i: $crate::parse::Input) -> $crate::parse::Result<Self> {
                use nom::{
                    combinator::map_res, error::context, number::complete::$number_parser,
                };
                context(stringify!($type), map_res($number_parser, Self::try_from))(i)
            }
        }
    };
}
