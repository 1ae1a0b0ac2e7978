//! ---
//! dbaas_section: "01-shared-primitives"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Protocol and build version metadata."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// Highest guest protocol version understood by this build.
///
/// `1.0` carries the base lifecycle verbs; `1.1` added the cluster verbs.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 1);

/// Guest protocol version in `major.minor` form.
///
/// A server at `a.b` can serve a request capped at `c.d` when `a == c` and
/// `d <= b`. Minor bumps only ever add verbs or optional arguments.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr,
)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether a server speaking `self` understands a request capped at `requested`.
    pub fn can_serve(&self, requested: ProtocolVersion) -> bool {
        self.major == requested.major && requested.minor <= self.minor
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Raised when a version string is not of the form `major.minor`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid protocol version '{0}', expected <major>.<minor>")]
pub struct ParseVersionError(pub String);

impl FromStr for ProtocolVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| ParseVersionError(s.to_owned()))?;
        let major = major
            .parse::<u16>()
            .map_err(|_| ParseVersionError(s.to_owned()))?;
        let minor = minor
            .parse::<u16>()
            .map_err(|_| ParseVersionError(s.to_owned()))?;
        Ok(Self { major, minor })
    }
}

/// Build metadata reported by binaries.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    /// Workspace semantic version.
    pub semver: String,
    /// Git commit hash injected by the release pipeline, if any.
    pub git_sha: String,
    /// Guest protocol version spoken by this build.
    pub protocol: ProtocolVersion,
}

impl VersionInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            semver: env!("CARGO_PKG_VERSION").to_owned(),
            git_sha: option_env!("R_DBAAS_GIT_SHA")
                .unwrap_or("UNKNOWN")
                .to_owned(),
            protocol: PROTOCOL_VERSION,
        }
    }

    #[must_use]
    pub fn cli_string(&self) -> String {
        format!("{} ({})", self.semver, self.git_sha)
    }

    /// Extended string suitable for `--version` flags.
    #[must_use]
    pub fn extended(&self) -> String {
        format!(
            "R-DBaaS v{} (git {})\nGuest protocol: {}",
            self.semver, self.git_sha, self.protocol
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_major_minor() {
        let version: ProtocolVersion = "1.4".parse().unwrap();
        assert_eq!(version, ProtocolVersion::new(1, 4));
        assert_eq!(version.to_string(), "1.4");
        assert!("1".parse::<ProtocolVersion>().is_err());
        assert!("one.two".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn newer_server_serves_older_minor_but_not_other_major() {
        let server = ProtocolVersion::new(1, 1);
        assert!(server.can_serve(ProtocolVersion::new(1, 0)));
        assert!(server.can_serve(ProtocolVersion::new(1, 1)));
        assert!(!server.can_serve(ProtocolVersion::new(1, 2)));
        assert!(!server.can_serve(ProtocolVersion::new(2, 0)));
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&ProtocolVersion::new(1, 0)).unwrap();
        assert_eq!(json, "\"1.0\"");
        let back: ProtocolVersion = serde_json::from_str("\"1.1\"").unwrap();
        assert_eq!(back, PROTOCOL_VERSION);
    }

    #[test]
    fn extended_contains_semver() {
        let info = VersionInfo::current();
        assert!(info.extended().contains(&info.semver));
    }
}
