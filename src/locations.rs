use crate::configs::LocationConfiguration;
use crate::entities::{LocationType, LocationUrl, Snapshot, SnapshotName, Subvolume};
use crate::error::{BackupError, Result};
use crate::retention::RetentionExpression;
use crate::shell::Shell;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;


pub const DEFAULT_CONTAINER_RELPATH: &str = ".sxbackup";

const CONFIG_FILENAME: &str = ".btrfs-sxbackup";

/// One endpoint of a backup job.
///
/// A location owns a container subvolume holding the job's snapshots and
/// the job configuration file. Every mutation of filesystem state goes
/// through here, each operation being a single shell line issued via the
/// [`Shell`] transport, so it works identically for local and remote urls.
pub struct Location {
    url: LocationUrl,
    location_type: Option<LocationType>,
    uuid: Option<Uuid>,
    container_relpath: Option<String>,
    retention: Option<RetentionExpression>,
    compress: bool,
    snapshots: Vec<Snapshot>,
    shell: Arc<dyn Shell>,
}

impl Location {
    pub fn new(
        url: LocationUrl,
        location_type: Option<LocationType>,
        container_relpath: Option<&str>,
        shell: Arc<dyn Shell>,
    ) -> Location {
        // a source keeps its snapshots in a dedicated container subvolume,
        // a destination uses its url path directly
        let container_relpath = match (location_type, container_relpath) {
            (Some(LocationType::Source), None) => Some(DEFAULT_CONTAINER_RELPATH.to_string()),
            (_, relpath) => relpath.map(|r| r.trim_matches('/').to_string()),
        };

        Location {
            url,
            location_type,
            uuid: None,
            container_relpath,
            retention: None,
            compress: false,
            snapshots: Vec::new(),
            shell,
        }
    }

    pub fn url(&self) -> &LocationUrl {
        &self.url
    }

    pub fn is_remote(&self) -> bool {
        self.url.is_remote()
    }

    pub fn location_type(&self) -> Option<LocationType> {
        self.location_type
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn set_uuid(&mut self, uuid: Option<Uuid>) {
        self.uuid = uuid;
    }

    pub fn container_relpath(&self) -> Option<&str> {
        self.container_relpath.as_deref()
    }

    pub fn set_container_relpath(&mut self, relpath: Option<&str>) {
        self.container_relpath = relpath.map(|r| r.trim_matches('/').to_string());
    }

    pub fn retention(&self) -> Option<&RetentionExpression> {
        self.retention.as_ref()
    }

    pub fn set_retention(&mut self, retention: Option<RetentionExpression>) {
        self.retention = retention;
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn set_compress(&mut self, compress: bool) {
        self.compress = compress;
    }

    /// Most recently retrieved snapshots, newest first.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn insert_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshots.insert(0, snapshot);
    }

    /// Absolute path of the container subvolume, trailing-separator
    /// terminated.
    pub fn container_path(&self) -> String {
        match &self.container_relpath {
            Some(relpath) => format!("{}{}/", self.url.path, relpath),
            None => self.url.path.clone(),
        }
    }

    /// Absolute path of a child of the container subvolume.
    pub fn container_child(&self, name: &str) -> String {
        format!("{}{}", self.container_path(), name)
    }

    pub fn configuration_path(&self) -> String {
        self.container_child(CONFIG_FILENAME)
    }

    fn log_name(&self) -> String {
        match self.location_type {
            Some(location_type) => location_type.to_string().to_lowercase(),
            None => self.url.to_string(),
        }
    }

    fn log_info(&self, msg: &str) {
        log::info!("{} :: {}", self.log_name(), msg);
    }

    /// Prepare the location environment.
    ///
    /// Creates the container subvolume on a source if it does not exist
    /// yet, verifies the container actually is a subvolume and sweeps any
    /// `.temp.*` scratch subvolume left behind by an interrupted run.
    pub fn prepare_environment(&self) -> Result<()> {
        let container = self.container_path();

        if self.location_type == Some(LocationType::Source) {
            self.shell.exec_check_output(
                &format!(
                    "if [ ! -d \"{0}\" ] ; then btrfs sub create \"{0}\"; fi",
                    container
                ),
                &self.url,
            )?;
        }

        self.shell
            .exec_check_output(&format!("btrfs sub show \"{}\"", container), &self.url)?;

        self.shell.exec_check_output(
            &format!(
                "for t in \"{}\".temp.* ; do if [ -d \"$t\" ] ; then btrfs sub del \"$t\"; fi; done",
                container
            ),
            &self.url,
        )?;

        Ok(())
    }

    /// List the container's immediate child subvolumes, keep those with
    /// parseable snapshot names sorted newest first, and cache the result.
    pub fn retrieve_snapshots(&mut self) -> Result<Vec<Snapshot>> {
        self.log_info("retrieving snapshot names");

        let output = self.shell.exec_check_output(
            &format!("btrfs sub list -o \"{}\"", self.container_path()),
            &self.url,
        )?;
        let output = String::from_utf8_lossy(&output);

        let subvolumes = output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Subvolume::parse)
            .collect::<Result<Vec<Subvolume>>>()?;

        // all listed snapshots must live directly below the container,
        // nested structures indicate a shared or misconfigured container
        if let Some(first) = subvolumes.first() {
            let expected = first.parent_path().to_string();

            if let Some(nested) = subvolumes.iter().find(|s| s.parent_path() != expected) {
                return Err(BackupError::InconsistentLayout {
                    url: self.url.to_string(),
                    expected,
                    found: nested.path.clone(),
                });
            }
        }

        let mut snapshots: Vec<Snapshot> = subvolumes
            .iter()
            // names which do not parse are not owned by this job
            .filter_map(|s| {
                SnapshotName::from_str(s.name())
                    .ok()
                    .map(|name| Snapshot::new(name, Some(s.clone())))
            })
            .collect();
        snapshots.sort_by(|a, b| b.name().cmp(&a.name()));

        self.snapshots = snapshots.clone();
        Ok(snapshots)
    }

    /// Take a new read-only snapshot of the location's subvolume below the
    /// container, returning its path.
    pub fn create_snapshot(&self, name: &str) -> Result<String> {
        self.log_info("creating snapshot");

        let path = self.container_child(name);

        self.shell.exec_check_output(
            &format!(
                "touch \"{0}\" && btrfs sub snap -r \"{0}\" \"{1}\" && sync",
                self.url.path, path
            ),
            &self.url,
        )?;

        Ok(path)
    }

    /// Scratch name for an in-flight snapshot, unique across interrupted
    /// runs.
    pub fn create_temp_name(&self) -> String {
        format!(".temp.{:08x}", rand::random::<u32>())
    }

    pub fn move_file(&self, source_path: &str, dest_path: &str) -> Result<()> {
        self.shell.exec_check_output(
            &format!("mv \"{}\" \"{}\"", source_path, dest_path),
            &self.url,
        )?;
        Ok(())
    }

    /// Idempotent subvolume removal.
    pub fn remove_btrfs_subvolume(&self, path: &str) -> Result<()> {
        self.log_info(&format!("removing subvolume [{}]", path));

        self.shell.exec_check_output(
            &format!("if [ -d \"{0}\" ] ; then btrfs sub del \"{0}\"; fi", path),
            &self.url,
        )?;
        Ok(())
    }

    /// Remove container children in one batched command.
    fn remove_snapshots(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }

        let quoted: Vec<String> = names.iter().map(|name| format!("\"{}\"", name)).collect();
        self.shell.exec_check_output(
            &format!(
                "cd \"{}\" && btrfs sub del {}",
                self.container_path(),
                quoted.join(" ")
            ),
            &self.url,
        )?;

        Ok(())
    }

    /// Transfer the scratch snapshot into the destination's container via
    /// `btrfs send | btrfs receive`, optionally compressed and metered.
    pub fn transfer_btrfs_snapshot(
        &self,
        dest: &Location,
        temp_name: &str,
        parent: Option<&SnapshotName>,
    ) -> Result<()> {
        self.log_info("transferring snapshot");

        let temp_path = self.container_child(temp_name);

        let mut send_cmd = match parent {
            Some(parent) => format!(
                "btrfs send -p \"{}\" \"{}\"",
                self.container_child(&parent.to_string()),
                temp_path
            ),
            None => format!("btrfs send \"{}\"", temp_path),
        };

        if self.compress {
            send_cmd.push_str(" | lzop -1");
        }

        let mut receive_cmd = format!("btrfs receive \"{}\"", dest.container_path());
        if self.compress {
            receive_cmd = format!("lzop -d | {}", receive_cmd);
        }

        // progress metering only if pv is available on the supervising host
        let progress = self.shell.exists("pv", &LocationUrl::localhost());

        self.shell
            .transfer(&send_cmd, &self.url, &receive_cmd, &dest.url, progress)
    }

    pub fn has_configuration(&self) -> Result<bool> {
        let code = self.shell.exec_call(
            &format!(
                "if [ -f \"{}\" ] ; then exit 10; fi",
                self.configuration_path()
            ),
            &self.url,
        )?;

        Ok(code == 10)
    }

    /// Write the configuration file describing this side of the job.
    ///
    /// A peer url is only recorded when it is reachable from this side,
    /// i.e. the peer is on the same host plane or explicitly remote; this
    /// makes either endpoint a valid entry point for loading the job.
    pub fn write_configuration(&self, peer: Option<&Location>) -> Result<()> {
        let location_type = self.location_type.ok_or_else(|| {
            BackupError::InvalidConfiguration("missing location type".into())
        })?;

        if let Some(peer) = peer {
            match peer.location_type {
                None => {
                    return Err(BackupError::InvalidConfiguration(
                        "missing corresponding location type".into(),
                    ))
                }
                Some(peer_type) if peer_type == location_type => {
                    return Err(BackupError::InvalidConfiguration(format!(
                        "invalid corresponding location type [{}] for this location [{}]",
                        peer_type, location_type
                    )))
                }
                Some(_) => {}
            }

            if self.uuid != peer.uuid {
                return Err(BackupError::InconsistentJob(
                    self.uuid.unwrap_or_else(Uuid::nil),
                    peer.uuid.unwrap_or_else(Uuid::nil),
                ));
            }
        }

        let mut config = LocationConfiguration::new(location_type);
        config.uuid = self.uuid;
        config.retention = self.retention.clone();
        config.compress = self.compress;

        let both_remote_or_local = peer
            .map(|peer| !(self.is_remote() ^ peer.is_remote()))
            .unwrap_or(true);

        match location_type {
            LocationType::Source => {
                if both_remote_or_local {
                    config.source = Some(self.url.clone());
                    config.source_container = self.container_relpath.clone();
                }
                if let Some(peer) = peer {
                    if both_remote_or_local || peer.is_remote() {
                        config.destination = Some(peer.url.clone());
                    }
                }
            }
            LocationType::Destination => {
                if both_remote_or_local {
                    config.destination = Some(self.url.clone());
                }
                if let Some(peer) = peer {
                    if both_remote_or_local || peer.is_remote() {
                        config.source = Some(peer.url.clone());
                        config.source_container = peer.container_relpath.clone();
                    }
                }
            }
        }

        self.log_info("writing configuration");

        self.shell.exec_write(
            &format!("cat > \"{}\"", self.configuration_path()),
            &self.url,
            config.write().as_bytes(),
        )
    }

    /// Read the configuration file, take over its settings and return the
    /// peer location it describes, if any.
    pub fn read_configuration(&mut self) -> Result<Option<Location>> {
        let output = self.shell.exec_check_output(
            &format!("cat \"{}\"", self.configuration_path()),
            &self.url,
        )?;

        let config = LocationConfiguration::read(&String::from_utf8_lossy(&output))?;

        let peer = match config.location_type {
            LocationType::Source => {
                // when loaded through the container's own url, amend this
                // location to its parent directory plus container relpath
                if self.container_relpath.is_none() {
                    let container = self.container_path();
                    let trimmed = container.trim_end_matches('/');

                    if let Some(i) = trimmed.rfind('/') {
                        let relpath = trimmed[i + 1..].to_string();
                        let parent = match i {
                            0 => "/".to_string(),
                            _ => format!("{}/", &trimmed[..i]),
                        };

                        self.url.path = parent;
                        self.container_relpath = Some(relpath);
                    }
                }

                config.destination.map(|url| {
                    Location::new(
                        url,
                        Some(LocationType::Destination),
                        None,
                        self.shell.clone(),
                    )
                })
            }
            LocationType::Destination => config.source.map(|url| {
                Location::new(
                    url,
                    Some(LocationType::Source),
                    config.source_container.as_deref(),
                    self.shell.clone(),
                )
            }),
        };

        self.location_type = Some(config.location_type);
        self.uuid = config.uuid;
        self.retention = config.retention;
        self.compress = config.compress;

        Ok(peer)
    }

    fn remove_configuration(&self) -> Result<()> {
        self.log_info("removing configuration");

        self.shell
            .exec_check_output(&format!("rm \"{}\"", self.configuration_path()), &self.url)?;
        Ok(())
    }

    /// Thin out the cached snapshot list according to the retention
    /// expression. The newest snapshot (index 0) is always kept.
    pub fn purge_snapshots(
        &mut self,
        retention_override: Option<&RetentionExpression>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let retention = match retention_override.or_else(|| self.retention.as_ref()) {
            Some(retention) => retention.clone(),
            None => return Ok(()),
        };

        if self.snapshots.len() <= 1 {
            return Ok(());
        }

        let head = self.snapshots[0].clone();
        let (to_remove, to_retain) =
            retention.filter(&self.snapshots[1..], now, |s| s.name().timestamp());

        for (condition, snapshots) in &to_remove {
            let names: Vec<String> = snapshots.iter().map(|s| s.to_string()).collect();

            self.log_info(&format!(
                "removing {} snapshot{} due to retention [{}]: {}",
                names.len(),
                if names.len() > 1 { "s" } else { "" },
                condition,
                names.join(", ")
            ));

            self.remove_snapshots(&names)?;
        }

        let mut snapshots = vec![head];
        snapshots.extend(to_retain);
        snapshots.sort_by(|a, b| b.name().cmp(&a.name()));
        self.snapshots = snapshots;

        Ok(())
    }

    /// Destroy this side of the job: optionally purge all snapshots, remove
    /// the configuration file and, on a source whose container ended up
    /// empty, the container subvolume itself.
    pub fn destroy(&mut self, purge: bool) -> Result<()> {
        self.retrieve_snapshots()?;

        if purge {
            self.log_info("purging all snapshots");

            let names: Vec<String> = self.snapshots.iter().map(|s| s.to_string()).collect();
            self.remove_snapshots(&names)?;
            self.snapshots.clear();
        }

        self.remove_configuration()?;

        if self.snapshots.is_empty()
            && self.location_type == Some(LocationType::Source)
            && self.container_relpath.is_some()
        {
            self.remove_btrfs_subvolume(&self.container_path())?;
        }

        Ok(())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :: url [{}]", self.log_name(), self.url)?;

        if let Some(relpath) = &self.container_relpath {
            write!(f, " container [{}]", relpath)?;
        }

        write!(
            f,
            " retention [{}] compress [{}]",
            self.retention
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "n/a".into()),
            self.compress
        )
    }
}
