use std::fmt::{Debug, Display, Formatter};

use nom::combinator::all_consuming;
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::IResult;
use nom_supreme::tag::TagError;

pub enum ParserError<I> {
    Custom(anyhow::Error),
    Nom(I, ErrorKind),
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom(error) => f.write_fmt(format_args!("Semantic error at {error}")),
            Self::Nom(input, error) => f.write_fmt(format_args!(
                "Parser error at '{input:?}': expecting {error:?}"
            )),
        }
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I, T> TagError<I, T> for ParserError<I> {
    fn from_tag(input: I, _tag: T) -> Self {
        ParserError::Nom(input, ErrorKind::Tag)
    }
}

impl<I: Display, E: Into<anyhow::Error>> FromExternalError<I, E> for ParserError<I> {
    fn from_external_error(input: I, _: ErrorKind, error: E) -> Self {
        ParserError::Custom(anyhow::anyhow!("'{}': {}", input, error.into()))
    }
}

pub(crate) fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("{:?}", e),
        _ => anyhow::anyhow!(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

/// Runs `parser` on the whole `input` and converts the error into `anyhow`.
pub fn consume_all<'a, O, F>(parser: F, input: &'a str) -> anyhow::Result<O>
where
    F: FnMut(&'a str) -> NomResult<'a, O>,
{
    all_consuming(parser)(input)
        .map(|(_, value)| value)
        .map_err(format_parse_error)
}

#[cfg(test)]
mod tests {
    use nom::character::complete::digit1;
    use nom::combinator::map_res;
    use nom::sequence::preceded;
    use nom_supreme::tag::complete::tag;

    use super::{NomResult, consume_all};

    fn p_batch(input: &str) -> NomResult<u32> {
        preceded(tag("batch_"), map_res(digit1, |n: &str| n.parse::<u32>()))(input)
    }

    #[test]
    fn test_consume_all() {
        assert_eq!(consume_all(p_batch, "batch_007").unwrap(), 7);
    }

    #[test]
    fn test_consume_all_rejects_trailing_input() {
        let error = consume_all(p_batch, "batch_007.fa").unwrap_err();
        assert!(error.to_string().contains(".fa"));
    }

    #[test]
    fn test_tag_mismatch_is_reported() {
        let error = consume_all(p_batch, "query_007").unwrap_err();
        assert!(error.to_string().contains("Tag"));
    }

    #[test]
    fn test_external_error_is_reported() {
        let error = consume_all(p_batch, "batch_99999999999").unwrap_err();
        assert!(error.to_string().starts_with("Semantic error"));
    }
}
