//! Human-readable byte-size parsing, used for the download/clip budget
//! settings in configuration (e.g. `"250G"`, `"800M"`).

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::space0;
use nom::combinator::{map, map_res, opt};
use nom::sequence::{delimited, tuple};
use nom::IResult;
use std::fmt::Write as _;

static MULTIPLIERS: [(char, u64); 4] = [
    // (suffix character, power of 2)
    ('T', 40),
    ('G', 30),
    ('M', 20),
    ('K', 10),
];

/// Encodes a non-negative size into human-readable form, e.g. `2147483648`
/// becomes `"2G"`.
pub fn encode_size(mut raw: i64) -> String {
    let mut encoded = String::new();
    for &(c, n) in &MULTIPLIERS {
        if raw >= 1i64 << n {
            write!(&mut encoded, "{}{} ", raw >> n, c).unwrap();
            raw &= (1i64 << n) - 1;
        }
    }
    if raw > 0 || encoded.is_empty() {
        write!(&mut encoded, "{raw}").unwrap();
    } else {
        encoded.pop(); // remove trailing space.
    }
    encoded
}

fn decode_sizepart(input: &str) -> IResult<&str, i64> {
    map(
        tuple((
            map_res(take_while1(|c: char| c.is_ascii_digit()), |input: &str| {
                input.parse::<i64>()
            }),
            opt(alt((
                nom::combinator::value(1 << 40, tag("T")),
                nom::combinator::value(1 << 30, tag("G")),
                nom::combinator::value(1 << 20, tag("M")),
                nom::combinator::value(1 << 10, tag("K")),
            ))),
        )),
        |(n, opt_unit)| n * opt_unit.unwrap_or(1),
    )(input)
}

fn decode_size_internal(input: &str) -> IResult<&str, i64> {
    nom::multi::fold_many1(
        delimited(space0, decode_sizepart, space0),
        || 0,
        |sum, i| sum + i,
    )(input)
}

/// Decodes a human-readable size as output by [`encode_size`].
#[allow(clippy::result_unit_err)]
pub fn decode_size(encoded: &str) -> Result<i64, ()> {
    let (remaining, decoded) = decode_size_internal(encoded).map_err(|_e| ())?;
    if !remaining.is_empty() {
        return Err(());
    }
    Ok(decoded)
}
