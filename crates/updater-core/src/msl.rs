//! Minimum ship level (MSL) policy.
//!
//! The configured minimum and every candidate version string are reduced to
//! a `(major, minor, rev)` triple with a configured pattern. Capture groups
//! 2, 3 and 4 of the pattern are the three components; group 1 is free for
//! a product prefix, as in the default `([a-z]+)-([0-9]+)\.([0-9]+)\.([0-9]+)`.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;
use tracing::{error, warn};

/// Default MSL pattern.
pub const DEFAULT_MSL_PATTERN: &str = r"([a-z]+)-([0-9]+)\.([0-9]+)\.([0-9]+)";

/// Comparable version triple. Field order gives the lexicographic ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MslVersion {
    pub major: u32,
    pub minor: u32,
    pub rev: u32,
}

impl MslVersion {
    pub fn new(major: u32, minor: u32, rev: u32) -> Self {
        Self { major, minor, rev }
    }
}

impl fmt::Display for MslVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.rev)
    }
}

/// A candidate that does not meet the minimum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MslViolation {
    pub min: String,
    pub actual: String,
}

/// Lexicographic comparison on `(major, minor, rev)`.
pub fn compare(candidate: &MslVersion, minimum: &MslVersion) -> Ordering {
    candidate.cmp(minimum)
}

#[derive(Debug, Clone)]
pub struct MinimumShipLevel {
    minimum: Option<String>,
    pattern: Option<Regex>,
}

impl MinimumShipLevel {
    /// Build the policy. An empty minimum or pattern disables it.
    pub fn new(minimum: Option<&str>, pattern: &str) -> Result<Self, regex::Error> {
        let minimum = minimum
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let pattern = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern)?)
        };
        Ok(Self { minimum, pattern })
    }

    /// Policy that accepts everything.
    pub fn disabled() -> Self {
        Self {
            minimum: None,
            pattern: None,
        }
    }

    pub fn minimum(&self) -> Option<&str> {
        self.minimum.as_deref()
    }

    /// Reduce a version string to its triple; `(0, 0, 0)` when it does not match.
    pub fn parse(&self, input: &str) -> MslVersion {
        let Some(pattern) = &self.pattern else {
            return MslVersion::default();
        };

        let parsed = pattern.captures(input).and_then(|caps| {
            let field = |n: usize| caps.get(n)?.as_str().parse::<u32>().ok();
            Some(MslVersion::new(field(2)?, field(3)?, field(4)?))
        });

        parsed.unwrap_or_else(|| {
            warn!(version = %input, "Unable to parse version for minimum ship level");
            MslVersion::default()
        })
    }

    /// Check a candidate, returning the violation when it is below the minimum.
    pub fn check(&self, candidate: &str) -> Result<(), MslViolation> {
        let Some(minimum) = &self.minimum else {
            return Ok(());
        };
        if self.pattern.is_none() {
            return Ok(());
        }

        let min_version = self.parse(minimum);
        let actual = self.parse(candidate);

        if compare(&actual, &min_version) == Ordering::Less {
            error!(
                min_version = %minimum,
                actual_version = %candidate,
                "Minimum ship level NOT met"
            );
            return Err(MslViolation {
                min: minimum.clone(),
                actual: candidate.to_string(),
            });
        }
        Ok(())
    }

    /// `true` when the candidate may be activated.
    pub fn verify(&self, candidate: &str) -> bool {
        self.check(candidate).is_ok()
    }
}
