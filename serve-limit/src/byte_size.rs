use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de;

/// The supplied string is not a byte size of the form `4K`, `20MiB` or `5GB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("byte size must be like 4K, 20MiB or 5GB")]
pub struct InvalidByteSize;

const KILO: u64 = 1000;
const KIBI: u64 = 1024;

/// Recognised units. Bare letters are decimal, `B` and `iB` suffixes are binary.
const UNITS: &[(&str, u64)] = &[
    ("K", KILO),
    ("M", KILO.pow(2)),
    ("G", KILO.pow(3)),
    ("T", KILO.pow(4)),
    ("KB", KIBI),
    ("MB", KIBI.pow(2)),
    ("GB", KIBI.pow(3)),
    ("TB", KIBI.pow(4)),
    ("KiB", KIBI),
    ("MiB", KIBI.pow(2)),
    ("GiB", KIBI.pow(3)),
    ("TiB", KIBI.pow(4)),
];

/// An amount of bytes parsed from a human readable size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Parse sizes such as `4K`, `20MiB` or `5GB`.
    ///
    /// The numeric prefix must be a plain decimal integer and the unit must be one
    /// of `K`, `M`, `G`, `T` (powers of 1000) or the same letters followed by `B` or
    /// `iB` (powers of 1024).
    pub fn parse(s: &str) -> Result<Self, InvalidByteSize> {
        let index = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or(InvalidByteSize)?;
        if index == 0 {
            return Err(InvalidByteSize);
        }

        let (number, unit) = s.split_at(index);
        let number: u64 = number.parse().map_err(|_| InvalidByteSize)?;
        let factor = UNITS
            .iter()
            .find_map(|(symbol, factor)| (*symbol == unit).then_some(*factor))
            .ok_or(InvalidByteSize)?;

        number
            .checked_mul(factor)
            .map(Self)
            .ok_or(InvalidByteSize)
    }

    /// Parse a size that is known to be valid, e.g. a constant in source.
    ///
    /// # Panics
    ///
    /// Panics if `s` is not a valid byte size.
    pub fn must(s: &str) -> Self {
        match Self::parse(s) {
            Ok(size) => size,
            Err(err) => panic!("{err}: {s:?}"),
        }
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = InvalidByteSize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size like 4K, 20MiB or 5GB")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                ByteSize::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}
