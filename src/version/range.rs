//! Version range parsing (single interval).

use std::fmt;

use thiserror::Error;

use super::Version;

/// Range literal that failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid version range `{raw}`: {reason}")]
pub struct VersionRangeError {
    pub raw: String,
    pub reason: String,
}

impl VersionRangeError {
    fn new(raw: &str, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// One endpoint of a range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bound {
    pub version: Version,
    pub inclusive: bool,
}

impl Bound {
    fn new(version: Version, inclusive: bool) -> Self {
        Self { version, inclusive }
    }
}

/// A single version interval. Bounds are optional; a missing bound leaves
/// that side unbounded. Equality is structural.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRange {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl VersionRange {
    /// Parses exactly one interval literal. Unions of intervals are not
    /// accepted here.
    pub fn parse(range: &str) -> Result<Self, VersionRangeError> {
        let lower_inclusive = if range.starts_with('[') {
            true
        } else if range.starts_with('(') {
            false
        } else {
            return Err(VersionRangeError::new(
                range,
                "a range must start with either [ or (",
            ));
        };

        let upper_inclusive = if range.ends_with(']') {
            true
        } else if range.ends_with(')') {
            false
        } else {
            return Err(VersionRangeError::new(
                range,
                "a range must end with either ] or )",
            ));
        };

        let process = &range[1..range.len() - 1];

        match process.find(',') {
            None => {
                if !lower_inclusive || !upper_inclusive {
                    return Err(VersionRangeError::new(
                        range,
                        "single version must be surrounded by []",
                    ));
                }
                if process != process.trim() {
                    return Err(VersionRangeError::new(range, "version must not contain whitespace"));
                }
                if let Some(prefix) = process.strip_suffix(".*") {
                    // The wildcard covers every version sharing the prefix:
                    // the min sentinel sits below any pre-release of the
                    // prefix, the max sentinel above any patch of it.
                    let lower = Version::parse(format!("{prefix}.min"));
                    let upper = Version::parse(format!("{prefix}.max"));
                    Ok(Self {
                        lower: Some(Bound::new(lower, true)),
                        upper: Some(Bound::new(upper, true)),
                    })
                } else {
                    let version = Version::parse(process);
                    Ok(Self {
                        lower: Some(Bound::new(version.clone(), true)),
                        upper: Some(Bound::new(version, true)),
                    })
                }
            }
            Some(index) => {
                let parsed_lower = &process[..index];
                let parsed_upper = &process[index + 1..];

                if parsed_upper.contains(',') {
                    return Err(VersionRangeError::new(
                        range,
                        "bounds may not contain additional ','",
                    ));
                }
                if parsed_lower != parsed_lower.trim() || parsed_upper != parsed_upper.trim() {
                    return Err(VersionRangeError::new(range, "bounds must not contain whitespace"));
                }

                let lower_version = (!parsed_lower.is_empty()).then(|| Version::parse(parsed_lower));
                let upper_version = (!parsed_upper.is_empty()).then(|| Version::parse(parsed_upper));

                if let (Some(lower), Some(upper)) = (&lower_version, &upper_version)
                    && upper < lower
                {
                    return Err(VersionRangeError::new(
                        range,
                        "lower bound must not be greater than upper bound",
                    ));
                }

                Ok(Self {
                    lower: lower_version.map(|v| Bound::new(v, lower_inclusive)),
                    upper: upper_version.map(|v| Bound::new(v, upper_inclusive)),
                })
            }
        }
    }

    pub fn lower(&self) -> Option<&Bound> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&Bound> {
        self.upper.as_ref()
    }

    /// Membership test. A missing bound is unbounded on that side.
    pub fn contains(&self, version: &Version) -> bool {
        if let Some(lower) = &self.lower {
            match lower.version.cmp(version) {
                std::cmp::Ordering::Equal if !lower.inclusive => return false,
                std::cmp::Ordering::Greater => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match upper.version.cmp(version) {
                std::cmp::Ordering::Equal if !upper.inclusive => return false,
                std::cmp::Ordering::Less => return false,
                _ => {}
            }
        }
        true
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Some(lower) => {
                f.write_str(if lower.inclusive { "[" } else { "(" })?;
                f.write_str(lower.version.as_str())?;
            }
            None => f.write_str("(")?,
        }
        f.write_str(",")?;
        match &self.upper {
            Some(upper) => {
                f.write_str(upper.version.as_str())?;
                f.write_str(if upper.inclusive { "]" } else { ")" })
            }
            None => f.write_str(")"),
        }
    }
}
