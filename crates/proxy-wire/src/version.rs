use std::fmt;

use thiserror::Error;

use crate::tags::value::UNDEFINED_VERSION;

/// Component version. Ordering is lexicographic over (major, minor, patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Packs into the integer form used for wire-level comparisons.
    pub const fn packed(self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | self.patch as u32
    }

    pub const fn from_packed(value: u32) -> Self {
        Self {
            major: ((value >> 16) & 0xff) as u8,
            minor: ((value >> 8) & 0xff) as u8,
            patch: (value & 0xff) as u8,
        }
    }

    pub const fn without_patch(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor,
            patch: 0,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A peer's version as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteVersion {
    Undefined,
    Known(Version),
}

impl RemoteVersion {
    /// Packed form, 0 for undefined.
    pub fn packed(self) -> u32 {
        match self {
            RemoteVersion::Undefined => 0,
            RemoteVersion::Known(version) => version.packed(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("malformed version string \"{0}\"")]
    Malformed(String),
    #[error("version component out of range in \"{0}\"")]
    OutOfRange(String),
}

/// Parses `major.minor[.patch]` with an optional trailing release suffix such as
/// `alpha1` or `rc2`. The literal `undefined` short-circuits without parsing.
pub fn parse_version(input: &str) -> Result<RemoteVersion, VersionError> {
    let input = input.trim();
    if input == UNDEFINED_VERSION {
        return Ok(RemoteVersion::Undefined);
    }

    let mut parts = input.splitn(3, '.');
    let major = parse_component(parts.next(), input, false)?;
    let minor = parse_component(parts.next(), input, true)?;
    let patch = match parts.next() {
        Some(raw) => parse_component(Some(raw), input, true)?,
        None => 0,
    };

    Ok(RemoteVersion::Known(Version::new(major, minor, patch)))
}

fn parse_component(raw: Option<&str>, input: &str, allow_suffix: bool) -> Result<u8, VersionError> {
    let raw = raw.ok_or_else(|| VersionError::Malformed(input.to_string()))?;
    let digits_end = raw
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(raw.len());

    if digits_end == 0 || (!allow_suffix && digits_end != raw.len()) {
        return Err(VersionError::Malformed(input.to_string()));
    }

    let suffix = &raw[digits_end..];
    if !suffix.is_empty() && !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(VersionError::Malformed(input.to_string()));
    }

    raw[..digits_end]
        .parse::<u8>()
        .map_err(|_| VersionError::OutOfRange(input.to_string()))
}

/// Support-window bucket for a remote component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compatibility {
    Undefined,
    Current,
    Outdated,
    Unsupported,
}

impl Compatibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Compatibility::Undefined => "undefined",
            Compatibility::Current => "current",
            Compatibility::Outdated => "outdated",
            Compatibility::Unsupported => "unsupported",
        }
    }

    /// Whether exchanges may proceed at all.
    pub fn permits_exchange(self) -> bool {
        matches!(self, Compatibility::Current | Compatibility::Outdated)
    }
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a packed remote version against the local one.
///
/// With a `.0` local release the previous major line is still served as
/// outdated. With a later minor release only older minors of the same major are.
pub fn classify_compatibility(local: Version, remote: u32) -> Compatibility {
    if remote == 0 {
        return Compatibility::Undefined;
    }

    let local = local.without_patch();
    let remote = Version::from_packed(remote).without_patch();

    if remote == local {
        return Compatibility::Current;
    }

    if remote > local {
        return Compatibility::Unsupported;
    }

    if local.minor == 0 {
        if local.major > 0 && remote.major == local.major - 1 {
            return Compatibility::Outdated;
        }
    } else if remote.major == local.major {
        return Compatibility::Outdated;
    }

    Compatibility::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_versions() {
        assert_eq!(
            parse_version("6.0.5"),
            Ok(RemoteVersion::Known(Version::new(6, 0, 5)))
        );
        assert_eq!(
            parse_version("7.0.0alpha1"),
            Ok(RemoteVersion::Known(Version::new(7, 0, 0)))
        );
        assert_eq!(
            parse_version("6.4.0rc2"),
            Ok(RemoteVersion::Known(Version::new(6, 4, 0)))
        );
        assert_eq!(
            parse_version("5.4"),
            Ok(RemoteVersion::Known(Version::new(5, 4, 0)))
        );
    }

    #[test]
    fn undefined_sentinel_short_circuits() {
        assert_eq!(parse_version("undefined"), Ok(RemoteVersion::Undefined));
        assert_eq!(RemoteVersion::Undefined.packed(), 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_version(""), Err(VersionError::Malformed(_))));
        assert!(matches!(parse_version("six"), Err(VersionError::Malformed(_))));
        assert!(matches!(parse_version("6"), Err(VersionError::Malformed(_))));
        assert!(matches!(parse_version("6x.0"), Err(VersionError::Malformed(_))));
        assert!(matches!(parse_version("6.0.1-1"), Err(VersionError::Malformed(_))));
        assert!(matches!(
            parse_version("300.0.0"),
            Err(VersionError::OutOfRange(_))
        ));
    }

    #[test]
    fn packing_round_trips() {
        let version = Version::new(6, 4, 12);
        assert_eq!(version.packed(), (6 << 16) | (4 << 8) | 12);
        assert_eq!(Version::from_packed(version.packed()), version);
    }

    #[test]
    fn compatibility_truth_table() {
        let v = |major, minor, patch| Version::new(major, minor, patch).packed();

        let server = Version::new(6, 4, 3);
        assert_eq!(classify_compatibility(server, 0), Compatibility::Undefined);
        assert_eq!(classify_compatibility(server, v(6, 4, 0)), Compatibility::Current);
        assert_eq!(classify_compatibility(server, v(6, 4, 9)), Compatibility::Current);
        assert_eq!(classify_compatibility(server, v(6, 0, 5)), Compatibility::Outdated);
        assert_eq!(classify_compatibility(server, v(6, 2, 0)), Compatibility::Outdated);
        assert_eq!(classify_compatibility(server, v(6, 5, 0)), Compatibility::Unsupported);
        assert_eq!(classify_compatibility(server, v(7, 0, 0)), Compatibility::Unsupported);
        assert_eq!(classify_compatibility(server, v(5, 4, 0)), Compatibility::Unsupported);

        let server = Version::new(7, 0, 1);
        assert_eq!(classify_compatibility(server, v(7, 0, 0)), Compatibility::Current);
        assert_eq!(classify_compatibility(server, v(6, 4, 0)), Compatibility::Outdated);
        assert_eq!(classify_compatibility(server, v(6, 0, 0)), Compatibility::Outdated);
        assert_eq!(classify_compatibility(server, v(5, 4, 0)), Compatibility::Unsupported);
        assert_eq!(classify_compatibility(server, v(7, 2, 0)), Compatibility::Unsupported);
    }

    #[test]
    fn only_current_and_outdated_permit_exchange() {
        assert!(Compatibility::Current.permits_exchange());
        assert!(Compatibility::Outdated.permits_exchange());
        assert!(!Compatibility::Unsupported.permits_exchange());
        assert!(!Compatibility::Undefined.permits_exchange());
    }
}
