//! Protocol revisions and the backend compatibility matrix
//!
//! A [`ProtocolVersion`] is one numbered iteration of the REST wire API
//! (`v0.0.42`). The [`CompatibilityMatrix`] maps each revision this crate can
//! speak to the backend release series it is known to work against.

use crate::error::{ClientError, NormalizedError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Immutable, totally ordered protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const V0_0_40: ProtocolVersion = ProtocolVersion::new(0, 0, 40);
    pub const V0_0_41: ProtocolVersion = ProtocolVersion::new(0, 0, 41);
    pub const V0_0_42: ProtocolVersion = ProtocolVersion::new(0, 0, 42);
    pub const V0_0_43: ProtocolVersion = ProtocolVersion::new(0, 0, 43);
    pub const V0_0_44: ProtocolVersion = ProtocolVersion::new(0, 0, 44);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `v<major>.<minor>.<patch>`.
    ///
    /// Components are plain decimal without leading zeros so that parsing and
    /// formatting round-trip exactly.
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let body = input
            .strip_prefix('v')
            .ok_or_else(|| NormalizedError::invalid_version(input, "missing 'v' prefix"))?;

        let mut parts = body.split('.');
        let mut next = |name: &str| -> Result<u32, ClientError> {
            let part = parts.next().ok_or_else(|| {
                NormalizedError::invalid_version(input, &format!("missing {} component", name))
            })?;
            parse_component(input, name, part)
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;

        if parts.next().is_some() {
            let reason = "expected exactly three components";
            return Err(NormalizedError::invalid_version(input, reason).into());
        }

        Ok(Self::new(major, minor, patch))
    }

    /// Revisions this crate ships adapters for, oldest first
    pub fn supported() -> &'static [ProtocolVersion] {
        &SUPPORTED_VERSIONS
    }

    pub fn latest() -> ProtocolVersion {
        ProtocolVersion::V0_0_44
    }

    pub fn stable() -> ProtocolVersion {
        ProtocolVersion::V0_0_42
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(self)
    }

    /// Resolve a user-facing constraint: `""`/`latest`, `stable`, or an exact revision
    pub fn resolve_constraint(constraint: &str) -> Result<ProtocolVersion, ClientError> {
        match constraint.trim() {
            "" | "latest" => Ok(Self::latest()),
            "stable" => Ok(Self::stable()),
            exact => {
                let version = Self::parse(exact)?;
                if version.is_supported() {
                    Ok(version)
                } else {
                    Err(NormalizedError::unsupported_version(exact, &supported_names()).into())
                }
            }
        }
    }
}

fn parse_component(input: &str, name: &str, part: &str) -> Result<u32, ClientError> {
    let invalid = |reason: &str| -> ClientError {
        NormalizedError::invalid_version(input, &format!("{} component {}", name, reason)).into()
    };
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("is not a number"));
    }
    if part.len() > 1 && part.starts_with('0') {
        return Err(invalid("has a leading zero"));
    }
    part.parse::<u32>().map_err(|_| invalid("out of range"))
}

const SUPPORTED_VERSIONS: [ProtocolVersion; 5] = [
    ProtocolVersion::V0_0_40,
    ProtocolVersion::V0_0_41,
    ProtocolVersion::V0_0_42,
    ProtocolVersion::V0_0_43,
    ProtocolVersion::V0_0_44,
];

pub(crate) fn supported_names() -> Vec<String> {
    SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect()
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ProtocolVersion::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Find the first version-shaped path segment in a URL (`/slurm/v0.0.42/` -> `v0.0.42`)
pub fn extract_version_from_url(url: &str) -> Option<ProtocolVersion> {
    url.split(|c| c == '/' || c == '?' || c == '#')
        .filter(|segment| segment.starts_with('v'))
        .find_map(|segment| ProtocolVersion::parse(segment).ok())
}

/// A backend release series such as `25.05`.
///
/// A series covers the bare series string and any dotted refinement of it
/// (`25.05.3`), but not a different series that merely shares a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSeries(String);

impl ReleaseSeries {
    pub fn new(series: impl Into<String>) -> Self {
        Self(series.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn covers(&self, release: &str) -> bool {
        let release = release.trim();
        let release = release.strip_prefix("Slurm-").unwrap_or(release);
        match release.strip_prefix(self.0.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }
}

/// A documented breaking change between two adjacent revisions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakingChange {
    pub change_type: String,
    pub description: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl BreakingChange {
    fn new(
        change_type: &str,
        description: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Self {
        Self {
            change_type: change_type.to_string(),
            description: description.to_string(),
            old_value: old_value.map(str::to_string),
            new_value: new_value.map(str::to_string),
        }
    }
}

/// Static table mapping protocol revisions to backend release series
#[derive(Debug, Clone)]
pub struct CompatibilityMatrix {
    releases: BTreeMap<ProtocolVersion, Vec<ReleaseSeries>>,
    breaking_changes: BTreeMap<(ProtocolVersion, ProtocolVersion), Vec<BreakingChange>>,
}

impl CompatibilityMatrix {
    /// Process-wide matrix, built once on first use and read-only afterwards
    pub fn global() -> &'static CompatibilityMatrix {
        static MATRIX: OnceLock<CompatibilityMatrix> = OnceLock::new();
        MATRIX.get_or_init(CompatibilityMatrix::builtin)
    }

    fn builtin() -> Self {
        let table: [(ProtocolVersion, &[&str]); 5] = [
            (ProtocolVersion::V0_0_40, &["24.05", "24.11", "25.05"]),
            (ProtocolVersion::V0_0_41, &["24.11", "25.05", "25.11"]),
            (ProtocolVersion::V0_0_42, &["25.05", "25.11"]),
            (ProtocolVersion::V0_0_43, &["25.05", "25.11"]),
            (ProtocolVersion::V0_0_44, &["25.11", "26.05"]),
        ];

        let releases = table
            .iter()
            .map(|(version, series)| {
                (*version, series.iter().map(|s| ReleaseSeries::new(*s)).collect::<Vec<_>>())
            })
            .collect();

        let mut breaking_changes = BTreeMap::new();
        breaking_changes.insert(
            (ProtocolVersion::V0_0_40, ProtocolVersion::V0_0_41),
            vec![BreakingChange::new(
                "field_rename",
                "minimum_switches renamed to required_switches",
                Some("minimum_switches"),
                Some("required_switches"),
            )],
        );
        breaking_changes.insert(
            (ProtocolVersion::V0_0_41, ProtocolVersion::V0_0_42),
            vec![BreakingChange::new(
                "field_removed",
                "exclusive and oversubscribe removed from job outputs",
                Some("exclusive, oversubscribe"),
                None,
            )],
        );
        breaking_changes.insert(
            (ProtocolVersion::V0_0_42, ProtocolVersion::V0_0_43),
            vec![
                BreakingChange::new(
                    "endpoint_added",
                    "reservation management endpoints added",
                    None,
                    Some("/slurm/v0.0.43/reservation"),
                ),
                BreakingChange::new(
                    "feature_removed",
                    "FrontEnd mode support removed",
                    Some("FrontEnd mode"),
                    None,
                ),
            ],
        );

        Self {
            releases,
            breaking_changes,
        }
    }

    /// Build a matrix from an explicit table
    pub fn from_table(
        table: impl IntoIterator<Item = (ProtocolVersion, Vec<ReleaseSeries>)>,
    ) -> Self {
        Self {
            releases: table.into_iter().collect(),
            breaking_changes: BTreeMap::new(),
        }
    }

    pub fn contains(&self, version: &ProtocolVersion) -> bool {
        self.releases.contains_key(version)
    }

    pub fn versions(&self) -> impl Iterator<Item = &ProtocolVersion> {
        self.releases.keys()
    }

    pub fn release_series(&self, version: &ProtocolVersion) -> Option<&[ReleaseSeries]> {
        self.releases.get(version).map(Vec::as_slice)
    }

    pub fn is_release_supported(&self, version: &ProtocolVersion, release: &str) -> bool {
        self.releases
            .get(version)
            .map(|series| series.iter().any(|s| s.covers(release)))
            .unwrap_or(false)
    }

    /// Highest revision whose entry covers the given backend release
    pub fn find_best_version(&self, release: &str) -> Result<ProtocolVersion, ClientError> {
        self.releases
            .iter()
            .filter(|(_, series)| series.iter().any(|s| s.covers(release)))
            .map(|(version, _)| *version)
            .max()
            .ok_or_else(|| NormalizedError::no_compatible_version(release).into())
    }

    /// Validate an explicit revision against this matrix
    pub fn require(&self, version: &ProtocolVersion) -> Result<ProtocolVersion, ClientError> {
        if self.contains(version) {
            Ok(*version)
        } else {
            let known: Vec<String> = self.versions().map(|v| v.to_string()).collect();
            Err(NormalizedError::unsupported_version(&version.to_string(), &known).into())
        }
    }

    pub fn breaking_changes(
        &self,
        from: &ProtocolVersion,
        to: &ProtocolVersion,
    ) -> &[BreakingChange] {
        self.breaking_changes
            .get(&(*from, *to))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
