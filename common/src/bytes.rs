//! Binary byte sizes with `k`/`m`/`g`/`t`/`p` suffix parsing and
//! shortest-exact formatting, as used by the kernel resource spec codec.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SUFFIXES: [(char, u64); 5] = [
    ('k', 1 << 10),
    ('m', 1 << 20),
    ('g', 1 << 30),
    ('t', 1 << 40),
    ('p', 1 << 50),
];

/// A byte count with binary-unit rendering (`8589934592` -> `8g`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BinarySize(pub u64);

impl BinarySize {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Largest suffix that divides the value exactly; plain bytes otherwise.
        for (suffix, factor) in SUFFIXES.iter().rev() {
            if self.0 > 0 && self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl FromStr for BinarySize {
    type Err = CommonError;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let invalid = || CommonError::InvalidBinarySize {
            input: input.to_owned(),
        };
        if trimmed.is_empty() {
            return Err(invalid());
        }
        let lower = trimmed.to_ascii_lowercase();
        let body = lower.strip_suffix('b').unwrap_or(&lower);
        let last = body.chars().last().ok_or_else(invalid)?;
        let (digits, factor) = match SUFFIXES.iter().find(|(s, _)| *s == last) {
            Some((_, factor)) => (&body[..body.len() - 1], *factor),
            None => (body, 1),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        value.checked_mul(factor).map(BinarySize).ok_or_else(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_suffixes_and_plain_bytes() {
        assert_eq!("1024m".parse::<BinarySize>().unwrap(), BinarySize(1 << 30));
        assert_eq!("8g".parse::<BinarySize>().unwrap(), BinarySize(8 << 30));
        assert_eq!("512".parse::<BinarySize>().unwrap(), BinarySize(512));
        assert_eq!("2kb".parse::<BinarySize>().unwrap(), BinarySize(2048));
        assert_eq!(" 4m ".parse::<BinarySize>().unwrap(), BinarySize(4 << 20));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<BinarySize>().is_err());
        assert!("4.5g".parse::<BinarySize>().is_err());
        assert!("xyz".parse::<BinarySize>().is_err());
    }

    #[test]
    fn display_uses_largest_exact_suffix() {
        assert_eq!(BinarySize(8 << 30).to_string(), "8g");
        assert_eq!(BinarySize(1536).to_string(), "1536");
        assert_eq!(BinarySize(3 << 20).to_string(), "3m");
    }

    #[test]
    fn round_trips() {
        for value in [0u64, 1, 1024, 1 << 20, (1 << 30) + 7, 8 << 40] {
            let rendered = BinarySize(value).to_string();
            assert_eq!(rendered.parse::<BinarySize>().unwrap(), BinarySize(value));
        }
    }
}
