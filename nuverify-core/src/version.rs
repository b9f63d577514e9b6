// Interpreter versions: parsing, ordering, and range arithmetic.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// A `major.minor.patch` version with an optional pre-release tag.
///
/// Ordering, equality, and hashing look only at the numeric triple, so
/// `0.95.0-nightly.3 == 0.95.0`. Use [`Version::exact_eq`] when the
/// pre-release tag matters.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    /// Lowest representable version.
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse `v0.95.0`, `0.95.0`, `0.95`, or `0.95.0-nightly.3`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::Version(input.to_string());

        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let (core, pre) = match trimmed.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (trimmed, None),
        };

        let mut parts = core.split('.');
        let major = parse_component(parts.next()).ok_or_else(invalid)?;
        let minor = parse_component(parts.next()).ok_or_else(invalid)?;
        let patch = match parts.next() {
            Some(p) => parse_component(Some(p)).ok_or_else(invalid)?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// Numeric triple, used for ordering and hashing.
    pub fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    /// Equality including the pre-release tag.
    pub fn exact_eq(&self, other: &Self) -> bool {
        self == other && self.pre == other.pre
    }

    /// A patch release is `x.y.z` with `z > 0`.
    pub fn is_patch_release(&self) -> bool {
        self.patch > 0
    }

    /// Drop the pre-release tag.
    #[must_use]
    pub fn release(&self) -> Self {
        Self::new(self.major, self.minor, self.patch)
    }

    /// Step the minor component back by `distance`, resetting the patch,
    /// never going below `floor`.
    #[must_use]
    pub fn minus_minor(&self, distance: u64, floor: &Version) -> Self {
        let stepped = Self::new(self.major, self.minor.saturating_sub(distance), 0);
        if stepped < *floor {
            floor.release()
        } else {
            stepped
        }
    }

    /// The key used for cache file names: the numeric triple only.
    pub fn cache_key(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn parse_component(part: Option<&str>) -> Option<u64> {
    let part = part?;
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Half-open version range `(from, to]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    pub from: Version,
    pub to: Version,
}

impl VersionRange {
    pub fn new(from: Version, to: Version) -> Self {
        Self { from, to }
    }

    /// `from < v <= to`.
    pub fn contains(&self, v: &Version) -> bool {
        *v > self.from && *v <= self.to
    }

    /// True when this range includes every version `other` does.
    pub fn covers(&self, other: &VersionRange) -> bool {
        self.from <= other.from && self.to >= other.to
    }

    /// Nothing lies in `(from, to]`.
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.from, self.to)
    }
}
