use std::borrow::Cow;
use std::fmt::Write;
use std::ops::Deref;

use nom::bytes::complete::take_while1;
use nom::sequence::delimited;
use nom_supreme::tag::complete::tag;

use crate::Map;
use crate::common::parser::NomResult;

pub type PlaceholderMap<'a> = Map<&'static str, Cow<'a, str>>;

#[derive(Debug, Eq, PartialEq)]
pub enum StringPart<'a> {
    Verbatim(&'a str),
    Placeholder(&'a str),
}

fn is_placeholder_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn parse_placeholder(data: &str) -> NomResult<&str> {
    delimited(tag("${"), take_while1(is_placeholder_char), tag("}"))(data)
}

/// Parses strings containing `${NAME}` placeholders.
///
/// # Example
/// ```rust
/// use elastic_blast::common::placeholders::{parse_resolvable_string, StringPart};
///
/// assert_eq!(parse_resolvable_string("a${b}c"), vec![
///     StringPart::Verbatim("a"),
///     StringPart::Placeholder("b"),
///     StringPart::Verbatim("c"),
/// ]);
/// ```
pub fn parse_resolvable_string(data: &str) -> Vec<StringPart> {
    let mut parts = vec![];
    let mut start = 0;
    let mut input = data;

    while start < input.len() {
        if let Ok((rest, placeholder)) = parse_placeholder(&input[start..]) {
            if start > 0 {
                parts.push(StringPart::Verbatim(&input[..start]));
            }
            input = rest;
            parts.push(StringPart::Placeholder(placeholder));
            start = 0;
        } else {
            start += input[start..].chars().next().map_or(1, char::len_utf8);
        }
    }

    if start > 0 {
        parts.push(StringPart::Verbatim(&input[..start]));
    }

    parts
}

/// Substitutes known placeholders in `input`. Unknown ones are kept verbatim.
pub fn resolve(map: &PlaceholderMap, input: &str) -> String {
    let mut buffer = String::with_capacity(input.len());
    for part in parse_resolvable_string(input) {
        match part {
            StringPart::Verbatim(data) => buffer.push_str(data),
            StringPart::Placeholder(placeholder) => match map.get(placeholder) {
                Some(value) => buffer.push_str(value.deref()),
                None => {
                    log::warn!("Encountered an unknown placeholder `{placeholder}` in template");
                    // Writing into a String cannot fail
                    let _ = write!(buffer, "${{{placeholder}}}");
                }
            },
        }
    }
    buffer
}
