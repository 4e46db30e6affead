use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when a string is not a valid 40-hex object ID.
#[derive(Debug, Error)]
#[error("could not parse sha1 from string: {input:?}")]
pub struct Sha1ParseError {
    /// The offending input.
    pub input: String,
}

/// The ID of a Git object which is known to not be the all-zeros ID.
///
/// Depot-side records (changelist descriptions, mirror paths, branch-info
/// files) all carry object IDs as 40-hex strings, so this type round-trips
/// through `Display`/`FromStr` losslessly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1 {
    pub(super) inner: git2::Oid,
}

impl Sha1 {
    /// View this ID as its raw 20 bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Hash `content` as a Git object of the given kind without writing it
    /// to any object database.
    pub fn hash_object(kind: git2::ObjectType, content: &[u8]) -> Result<Self, git2::Error> {
        let oid = git2::Oid::hash_object(kind, content)?;
        Ok(Sha1 { inner: oid })
    }

    /// Split the 40-hex form into the two-character prefix directories and
    /// the 36-character remainder used by content-addressed depot paths.
    pub fn to_path_parts(&self) -> (String, String, String) {
        let hex = self.to_string();
        (
            hex[0..2].to_string(),
            hex[2..4].to_string(),
            hex[4..].to_string(),
        )
    }
}

impl From<git2::Oid> for Sha1 {
    fn from(oid: git2::Oid) -> Self {
        Sha1 { inner: oid }
    }
}

impl From<Sha1> for git2::Oid {
    fn from(sha1: Sha1) -> Self {
        sha1.inner
    }
}

impl fmt::Display for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1({})", self.inner)
    }
}

impl FromStr for Sha1 {
    type Err = Sha1ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match MaybeZeroSha1::from_str(s)? {
            MaybeZeroSha1::NonZero(sha1) => Ok(sha1),
            MaybeZeroSha1::Zero => Err(Sha1ParseError {
                input: s.to_string(),
            }),
        }
    }
}

/// An object ID which may be the all-zeros ID, as appears in pre-receive
/// tuples for ref creation and deletion.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaybeZeroSha1 {
    /// The all-zeros ID (e.g. the old head of a newly-created ref).
    Zero,

    /// A non-zero ID.
    NonZero(Sha1),
}

impl MaybeZeroSha1 {
    /// Convert into `Option`, mapping the zero ID to `None`.
    pub fn into_option(self) -> Option<Sha1> {
        match self {
            MaybeZeroSha1::Zero => None,
            MaybeZeroSha1::NonZero(sha1) => Some(sha1),
        }
    }
}

impl fmt::Display for MaybeZeroSha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeZeroSha1::Zero => write!(f, "{}", git2::Oid::zero()),
            MaybeZeroSha1::NonZero(sha1) => write!(f, "{sha1}"),
        }
    }
}

impl fmt::Debug for MaybeZeroSha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaybeZeroSha1({self})")
    }
}

impl FromStr for MaybeZeroSha1 {
    type Err = Sha1ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let oid = git2::Oid::from_str(s).map_err(|_| Sha1ParseError {
            input: s.to_string(),
        })?;
        if s.len() != 40 {
            return Err(Sha1ParseError {
                input: s.to_string(),
            });
        }
        if oid.is_zero() {
            Ok(MaybeZeroSha1::Zero)
        } else {
            Ok(MaybeZeroSha1::NonZero(Sha1 { inner: oid }))
        }
    }
}

impl From<Sha1> for MaybeZeroSha1 {
    fn from(sha1: Sha1) -> Self {
        MaybeZeroSha1::NonZero(sha1)
    }
}

impl From<Option<Sha1>> for MaybeZeroSha1 {
    fn from(value: Option<Sha1>) -> Self {
        match value {
            Some(sha1) => MaybeZeroSha1::NonZero(sha1),
            None => MaybeZeroSha1::Zero,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "1f6e71b2b1b423bd0c79a4e29f7e34283f0d3367";
    const ZERO: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn test_round_trip() {
        let sha1: Sha1 = SHA.parse().unwrap();
        assert_eq!(sha1.to_string(), SHA);

        let zero: MaybeZeroSha1 = ZERO.parse().unwrap();
        assert_eq!(zero, MaybeZeroSha1::Zero);
        assert_eq!(zero.to_string(), ZERO);
    }

    #[test]
    fn test_rejects_short_and_junk() {
        assert!("1f6e71b".parse::<Sha1>().is_err());
        assert!("not-a-sha1".parse::<Sha1>().is_err());
        assert!(ZERO.parse::<Sha1>().is_err());
    }

    #[test]
    fn test_path_parts() {
        let sha1: Sha1 = SHA.parse().unwrap();
        let (a, b, rest) = sha1.to_path_parts();
        assert_eq!(a, "1f");
        assert_eq!(b, "6e");
        assert_eq!(rest, "71b2b1b423bd0c79a4e29f7e34283f0d3367");
    }
}
