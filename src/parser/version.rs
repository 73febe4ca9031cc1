//! Representation of the requested HTTP version

use std::fmt::Display;

use super::{ParseError, StrictLevel};

/// Representation of the requested HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Version {
    /// Parses a version token. `HTTP/1.2` through `HTTP/1.9` are treated as HTTP/1.1 at lenient
    /// strict levels, as minor versions are backwards compatible.
    pub fn parse(value: &[u8], strict: StrictLevel) -> Result<Self, ParseError> {
        match value {
            b"HTTP/1.0" => return Ok(Self::H1_0),
            b"HTTP/1.1" => return Ok(Self::H1_1),
            _ => {}
        }

        match value {
            [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
                if major.is_ascii_digit() && minor.is_ascii_digit() =>
            {
                if *major == b'1' && strict.at_most(0) {
                    Ok(Self::H1_1)
                } else {
                    Err(ParseError::VersionNotSupported)
                }
            }
            [b'H', b'T', b'T', b'P', b'/', major] if major.is_ascii_digit() => {
                Err(ParseError::VersionNotSupported)
            }
            _ => Err(ParseError::Version),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

impl TryFrom<&[u8]> for Version {
    type Error = ParseError;

    #[inline]
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(value, StrictLevel::DEFAULT)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn http_version_try_from_1_0() {
        assert_eq!(Ok(Version::H1_0), Version::try_from(b"HTTP/1.0" as &[u8]));
    }

    #[test]
    fn http_version_try_from_1_1() {
        assert_eq!(Ok(Version::H1_1), Version::try_from(b"HTTP/1.1" as &[u8]));
    }

    #[test]
    fn http_version_higher_minor_is_1_1_when_lenient() {
        assert_eq!(Ok(Version::H1_1), Version::try_from(b"HTTP/1.7" as &[u8]));
        assert_eq!(
            Err(ParseError::VersionNotSupported),
            Version::parse(b"HTTP/1.7", StrictLevel::MAX)
        );
    }

    #[test]
    fn http_version_2_is_not_supported() {
        assert_eq!(
            Err(ParseError::VersionNotSupported),
            Version::try_from(b"HTTP/2" as &[u8])
        );
        assert_eq!(
            Err(ParseError::VersionNotSupported),
            Version::try_from(b"HTTP/2.0" as &[u8])
        );
    }

    #[test]
    fn http_version_try_from_fails_if_too_long() {
        assert!(Version::try_from(b"HTTP/1.1 " as &[u8]).is_err());
    }

    #[test]
    fn http_version_try_from_fails_if_gibberish() {
        assert_eq!(Err(ParseError::Version), Version::try_from(b"ABCD" as &[u8]))
    }
}
