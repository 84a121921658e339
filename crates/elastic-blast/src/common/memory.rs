use std::fmt::{Display, Formatter};
use std::str::FromStr;

use nom::character::complete::{char, digit1, one_of, space0};
use nom::combinator::{map_res, opt, recognize};
use nom::sequence::{pair, terminated, tuple};

use crate::common::parser::{NomResult, consume_all};

const UNITS: [(char, u64); 4] = [
    ('T', 1_000_000_000_000),
    ('G', 1_000_000_000),
    ('M', 1_000_000),
    ('K', 1_000),
];

/// Amount of memory or disk space, e.g. `500M`, `4G` or `1.5T`.
///
/// Units are decimal, matching the Kubernetes quantity suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryStr(u64);

impl MemoryStr {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn gigabytes(amount: u64) -> Self {
        Self(amount * 1_000_000_000)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Whole gigabytes, rounded up. Cloud disk sizes are requested in this unit.
    pub fn as_gigabytes_ceil(&self) -> u64 {
        self.0.div_ceil(1_000_000_000)
    }

    /// Quantity accepted by Kubernetes resource requests and limits.
    pub fn to_k8s_quantity(&self) -> String {
        for (suffix, multiplier) in UNITS {
            if self.0 >= multiplier && self.0 % multiplier == 0 {
                return format!("{}{suffix}", self.0 / multiplier);
            }
        }
        self.0.to_string()
    }
}

impl Display for MemoryStr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_k8s_quantity())
    }
}

fn p_number(input: &str) -> NomResult<f64> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |value: &str| value.parse::<f64>(),
    )(input)
}

fn p_memory(input: &str) -> NomResult<MemoryStr> {
    let (input, (number, _, unit)) = tuple((
        p_number,
        space0,
        opt(terminated(one_of("kKmMgGtT"), opt(one_of("bB")))),
    ))(input)?;
    let multiplier = match unit.map(|c| c.to_ascii_uppercase()) {
        Some(unit) => UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit)
            .map(|(_, multiplier)| *multiplier)
            .unwrap_or(1),
        None => 1,
    };
    Ok((input, MemoryStr((number * multiplier as f64).round() as u64)))
}

impl FromStr for MemoryStr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        consume_all(p_memory, s.trim())
    }
}
