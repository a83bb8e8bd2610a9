use crate::entities::{LocationType, LocationUrl};
use crate::error::{BackupError, Result};
use crate::retention::RetentionExpression;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;


pub const GLOBAL_CONFIG_FILENAME: &str = "/etc/btrfs-sxbackup.conf";

const GLOBAL_SECTION: &str = "Default";
const KEY_SOURCE_RETENTION: &str = "source-retention";
const KEY_DEST_RETENTION: &str = "destination-retention";
const KEY_LOG_IDENT: &str = "log-ident";
const KEY_EMAIL_RECIPIENT: &str = "email-recipient";

const KEY_UUID: &str = "uuid";
const KEY_SOURCE: &str = "source";
const KEY_SOURCE_CONTAINER: &str = "source-container";
const KEY_DESTINATION: &str = "destination";
const KEY_KEEP: &str = "keep";
const KEY_RETENTION: &str = "retention";
const KEY_COMPRESS: &str = "compress";

/// Parse a single-section ini document into its section name and key/value
/// pairs. Comments (`#`, `;`) and blank lines are skipped; keys are
/// case-insensitive and stored lowercased.
fn parse_ini(text: &str) -> Result<(String, Vec<(String, String)>)> {
    let mut section: Option<String> = None;
    let mut entries: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            match section {
                None => section = Some(line[1..line.len() - 1].to_string()),
                Some(_) => {
                    return Err(BackupError::InvalidConfiguration(
                        "multiple sections in configuration file".into(),
                    ))
                }
            }
            continue;
        }

        match line.split_once('=') {
            Some((key, value)) => {
                entries.push((key.trim().to_lowercase(), value.trim().to_string()))
            }
            None => {
                return Err(BackupError::InvalidConfiguration(format!(
                    "invalid configuration line [{}]",
                    line
                )))
            }
        }
    }

    match section {
        Some(section) => Ok((section, entries)),
        None => Err(BackupError::InvalidConfiguration(
            "missing section header".into(),
        )),
    }
}

fn write_ini(section: &str, entries: &[(&str, String)]) -> String {
    let mut text = String::new();

    let _ = writeln!(text, "[{}]", section);
    for (key, value) in entries {
        let _ = writeln!(text, "{} = {}", key, value);
    }
    text.push('\n');

    text
}

fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|(k, _)| k.as_str() == key)
        .map(|(_, v)| v.as_str())
}

/// Boolean vocabulary of configuration files written by older versions.
fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Ok(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Ok(false),
        _ => Err(BackupError::InvalidConfiguration(format!(
            "invalid boolean value [{}]",
            value
        ))),
    }
}

/// Per-endpoint job configuration file (`.btrfs-sxbackup` inside the
/// container subvolume).
///
/// The single section name carries the location type; url fields are only
/// present when the peer is reachable from the respective side.
#[derive(Debug, PartialEq, Clone)]
pub struct LocationConfiguration {
    pub location_type: LocationType,
    pub uuid: Option<Uuid>,
    pub source: Option<LocationUrl>,
    pub source_container: Option<String>,
    pub destination: Option<LocationUrl>,
    pub retention: Option<RetentionExpression>,
    pub compress: bool,
}

impl LocationConfiguration {
    pub fn new(location_type: LocationType) -> LocationConfiguration {
        LocationConfiguration {
            location_type,
            uuid: None,
            source: None,
            source_container: None,
            destination: None,
            retention: None,
            compress: false,
        }
    }

    pub fn read(text: &str) -> Result<LocationConfiguration> {
        let (section, entries) = parse_ini(text)?;

        let location_type = LocationType::from_str(&section)?;

        let uuid = match lookup(&entries, KEY_UUID) {
            Some(value) => Some(Uuid::parse_str(value)?),
            None => None,
        };

        let source = match lookup(&entries, KEY_SOURCE) {
            Some(value) => Some(LocationUrl::parse(value)?),
            None => None,
        };

        let source_container = lookup(&entries, KEY_SOURCE_CONTAINER)
            .map(|value| value.trim_end_matches('/').to_string());

        let destination = match lookup(&entries, KEY_DESTINATION) {
            Some(value) => Some(LocationUrl::parse(value)?),
            None => None,
        };

        // keep is the legacy name of retention
        let retention = match lookup(&entries, KEY_RETENTION).or_else(|| lookup(&entries, KEY_KEEP))
        {
            Some(value) => Some(RetentionExpression::from_str(value)?),
            None => None,
        };

        let compress = match lookup(&entries, KEY_COMPRESS) {
            Some(value) => parse_bool(value)?,
            None => false,
        };

        Ok(LocationConfiguration {
            location_type,
            uuid,
            source,
            source_container,
            destination,
            retention,
            compress,
        })
    }

    pub fn write(&self) -> String {
        let mut entries: Vec<(&str, String)> = Vec::new();

        if let Some(uuid) = &self.uuid {
            entries.push((KEY_UUID, uuid.to_string()));
        }
        if let Some(source) = &self.source {
            entries.push((KEY_SOURCE, source.to_string()));
        }
        if let Some(container) = &self.source_container {
            entries.push((KEY_SOURCE_CONTAINER, container.clone()));
        }
        if let Some(destination) = &self.destination {
            entries.push((KEY_DESTINATION, destination.to_string()));
        }
        if let Some(retention) = &self.retention {
            entries.push((KEY_RETENTION, retention.to_string()));
        }
        if self.compress {
            entries.push((KEY_COMPRESS, "True".into()));
        }

        write_ini(&self.location_type.to_string(), &entries)
    }
}

/// Global configuration (`/etc/btrfs-sxbackup.conf`), read once at program
/// entry and passed down explicitly.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct GlobalConfiguration {
    pub source_retention: Option<RetentionExpression>,
    pub destination_retention: Option<RetentionExpression>,
    pub log_ident: Option<String>,
    pub email_recipient: Option<String>,
}

impl GlobalConfiguration {
    /// Read the default configuration file; a missing file yields the
    /// defaults.
    pub fn read() -> Result<GlobalConfiguration> {
        Self::read_from(Path::new(GLOBAL_CONFIG_FILENAME))
    }

    pub fn read_from(path: &Path) -> Result<GlobalConfiguration> {
        if !path.exists() {
            return Ok(GlobalConfiguration::default());
        }

        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<GlobalConfiguration> {
        let (section, entries) = parse_ini(text)?;

        if section != GLOBAL_SECTION {
            return Err(BackupError::InvalidConfiguration(format!(
                "invalid section name [{}]",
                section
            )));
        }

        let source_retention = match lookup(&entries, KEY_SOURCE_RETENTION) {
            Some(value) => Some(RetentionExpression::from_str(value)?),
            None => None,
        };

        let destination_retention = match lookup(&entries, KEY_DEST_RETENTION) {
            Some(value) => Some(RetentionExpression::from_str(value)?),
            None => None,
        };

        Ok(GlobalConfiguration {
            source_retention,
            destination_retention,
            log_ident: lookup(&entries, KEY_LOG_IDENT).map(|v| v.to_string()),
            email_recipient: lookup(&entries, KEY_EMAIL_RECIPIENT).map(|v| v.to_string()),
        })
    }
}
