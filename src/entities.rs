use crate::error::{BackupError, Result};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

#[cfg(test)]
mod tests;

/// Split URL addressing a backup location.
///
/// The accepted form is `[scheme://][user@host[:port]]/absolute/path`. An
/// authority part is only recognized when a scheme is present, so a bare
/// path never reads as a host. A location is remote iff `host` is set.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LocationUrl {
    pub scheme: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
}

impl LocationUrl {
    /// Parse a location url string.
    ///
    /// Local relative paths are made absolute against the current working
    /// directory. Paths are normalized to carry exactly one trailing
    /// separator, so no later comparison is separator sensitive.
    pub fn parse(text: &str) -> Result<LocationUrl> {
        let text = text.trim();

        if text.is_empty() {
            return Err(BackupError::InvalidUrl(text.into()));
        }

        let (scheme, rest) = match text.find("://") {
            Some(i) => (Some(text[..i].to_string()), &text[i + 3..]),
            None => (None, text),
        };

        let (authority, path) = match scheme {
            Some(_) => match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, ""),
            },
            None => ("", rest),
        };

        let (user, host_port) = match authority.split_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, authority),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                Some(
                    port.parse::<u16>()
                        .map_err(|_| BackupError::InvalidUrl(text.into()))?,
                ),
            ),
            None => (host_port, None),
        };

        let host = match host.is_empty() {
            true => None,
            false => Some(host.to_string()),
        };

        let mut path = path.to_string();

        if host.is_none() && !path.starts_with('/') {
            path = std::env::current_dir()?
                .join(&path)
                .to_string_lossy()
                .into_owned();
        }

        if path.is_empty() {
            return Err(BackupError::InvalidUrl(text.into()));
        }

        let mut path = path.trim_end_matches('/').to_string();
        path.push('/');

        Ok(LocationUrl {
            scheme,
            user,
            host,
            port,
            path,
        })
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    /// Url of the supervising host itself, used for local command probes.
    pub fn localhost() -> LocationUrl {
        LocationUrl {
            scheme: None,
            user: None,
            host: None,
            port: None,
            path: "/".into(),
        }
    }

    /// `user@host` or `host`, the ssh target for remote urls.
    pub fn ssh_target(&self) -> Option<String> {
        self.host.as_ref().map(|host| match &self.user {
            Some(user) => format!("{}@{}", user, host),
            None => host.clone(),
        })
    }
}

impl fmt::Display for LocationUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => {
                write!(f, "{}://", self.scheme.as_deref().unwrap_or("ssh"))?;
                if let Some(user) = &self.user {
                    write!(f, "{}@", user)?;
                }
                write!(f, "{}", host)?;
                if let Some(port) = self.port {
                    write!(f, ":{}", port)?;
                }
                write!(f, "{}", self.path)
            }
            None => write!(f, "{}", self.path),
        }
    }
}

static SNAPSHOT_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^sx-([0-9]{4})([0-9]{2})([0-9]{2})-([0-9]{2})([0-9]{2})([0-9]{2})-utc$")
        .unwrap()
});

/// Timestamp-based snapshot identifier.
///
/// The canonical textual form is `sx-YYYYMMDD-HHMMSS-utc`, always UTC, so
/// that lexicographic order on names equals chronological order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct SnapshotName {
    timestamp: DateTime<Utc>,
}

impl SnapshotName {
    /// Create a snapshot name for the given instant, truncated to seconds.
    pub fn new(timestamp: DateTime<Utc>) -> SnapshotName {
        SnapshotName {
            timestamp: timestamp.trunc_subsecs(0),
        }
    }

    pub fn now() -> SnapshotName {
        SnapshotName::new(Utc::now())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl FromStr for SnapshotName {
    type Err = BackupError;

    fn from_str(name: &str) -> Result<Self> {
        let captures = SNAPSHOT_NAME_REGEX
            .captures(name)
            .ok_or_else(|| BackupError::InvalidSnapshotName(name.into()))?;

        let part = |i: usize| -> u32 { captures[i].parse().unwrap_or(0) };

        let timestamp = Utc
            .with_ymd_and_hms(
                captures[1].parse::<i32>().unwrap_or(0),
                part(2),
                part(3),
                part(4),
                part(5),
                part(6),
            )
            .single()
            .ok_or_else(|| BackupError::InvalidSnapshotName(name.into()))?;

        Ok(SnapshotName { timestamp })
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timestamp.format("sx-%Y%m%d-%H%M%S-utc"))
    }
}

static SUBVOLUME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^ID ([0-9]+).*gen ([0-9]+).*top level ([0-9]+).*path (.+)$").unwrap());

/// One line of `btrfs sub list` output.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Subvolume {
    pub id: u64,
    pub gen: u64,
    pub top_level: u64,
    pub path: String,
}

impl Subvolume {
    /// Parse a line of the form `ID <n> gen <n> top level <n> path <p>`.
    pub fn parse(line: &str) -> Result<Subvolume> {
        let captures = SUBVOLUME_REGEX
            .captures(line)
            .ok_or_else(|| BackupError::InvalidSubvolume(line.into()))?;

        Ok(Subvolume {
            id: captures[1]
                .parse()
                .map_err(|_| BackupError::InvalidSubvolume(line.into()))?,
            gen: captures[2]
                .parse()
                .map_err(|_| BackupError::InvalidSubvolume(line.into()))?,
            top_level: captures[3]
                .parse()
                .map_err(|_| BackupError::InvalidSubvolume(line.into()))?,
            path: captures[4].to_string(),
        })
    }

    /// Directory part of the listed path, used for layout consistency checks.
    pub fn parent_path(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[..i],
            None => "",
        }
    }

    /// Final component of the listed path.
    pub fn name(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[i + 1..],
            None => &self.path,
        }
    }
}

/// In-memory pairing of a parsed snapshot name with the subvolume record
/// it was listed as, if any.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Snapshot {
    name: SnapshotName,
    subvolume: Option<Subvolume>,
}

impl Snapshot {
    pub fn new(name: SnapshotName, subvolume: Option<Subvolume>) -> Snapshot {
        Snapshot { name, subvolume }
    }

    pub fn name(&self) -> SnapshotName {
        self.name
    }

    pub fn subvolume(&self) -> Option<&Subvolume> {
        self.subvolume.as_ref()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Role of a location within a backup job.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LocationType {
    Source,
    Destination,
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationType::Source => write!(f, "Source"),
            LocationType::Destination => write!(f, "Destination"),
        }
    }
}

impl FromStr for LocationType {
    type Err = BackupError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "Source" => Ok(LocationType::Source),
            "Destination" => Ok(LocationType::Destination),
            _ => Err(BackupError::InvalidConfiguration(format!(
                "invalid section name/location type [{}]",
                name
            ))),
        }
    }
}
