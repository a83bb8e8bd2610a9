use crate::configs::GlobalConfiguration;
use crate::entities::{LocationType, LocationUrl, Snapshot, SnapshotName};
use crate::error::{BackupError, Result};
use crate::locations::{Location, DEFAULT_CONTAINER_RELPATH};
use crate::retention::RetentionExpression;
use crate::shell::Shell;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[cfg(test)]
mod tests;

static DEFAULT_RETENTION_SOURCE: Lazy<RetentionExpression> =
    Lazy::new(|| "3".parse().unwrap());
static DEFAULT_RETENTION_DESTINATION: Lazy<RetentionExpression> =
    Lazy::new(|| "2d: 1/d, 2w:3/w, 1m:1/w, 2m:none".parse().unwrap());

/// A backup job: a source location and an optional destination location
/// bound by a shared uuid.
///
/// Without a destination the job degenerates to snapshot rotation on the
/// source side.
pub struct Job {
    source: Location,
    destination: Option<Location>,
}

impl Job {
    pub fn source(&self) -> &Location {
        &self.source
    }

    pub fn destination(&self) -> Option<&Location> {
        self.destination.as_ref()
    }

    /// Initialize a new backup job and write both configurations.
    pub fn init(
        shell: Arc<dyn Shell>,
        source_url: LocationUrl,
        dest_url: Option<LocationUrl>,
        source_retention: Option<RetentionExpression>,
        dest_retention: Option<RetentionExpression>,
        compress: bool,
        global: &GlobalConfiguration,
    ) -> Result<Job> {
        let mut source = Location::new(
            source_url,
            Some(LocationType::Source),
            None,
            shell.clone(),
        );
        let mut destination =
            dest_url.map(|url| Location::new(url, Some(LocationType::Destination), None, shell));

        if source.has_configuration()? {
            return Err(BackupError::AlreadyInitialized(source.url().to_string()));
        }

        if let Some(dest) = &destination {
            if dest.has_configuration()? {
                return Err(BackupError::AlreadyInitialized(dest.url().to_string()));
            }
        }

        // one fresh identity for both sides
        let uuid = Uuid::new_v4();

        source.set_uuid(Some(uuid));
        source.set_retention(Some(
            source_retention
                .or_else(|| global.source_retention.clone())
                .unwrap_or_else(|| DEFAULT_RETENTION_SOURCE.clone()),
        ));
        source.set_compress(compress);

        if let Some(dest) = &mut destination {
            dest.set_uuid(Some(uuid));
            dest.set_retention(Some(
                dest_retention
                    .or_else(|| global.destination_retention.clone())
                    .unwrap_or_else(|| DEFAULT_RETENTION_DESTINATION.clone()),
            ));
            dest.set_compress(compress);
        }

        log::info!("preparing source and destination environment");
        source.prepare_environment()?;
        if let Some(dest) = &destination {
            dest.prepare_environment()?;
        }

        source.write_configuration(destination.as_ref())?;
        if let Some(dest) = &destination {
            dest.write_configuration(Some(&source))?;
        }

        log::info!("{}", source);
        if let Some(dest) = &destination {
            log::info!("{}", dest);
        }
        log::info!("initialized successfully");

        Ok(Job {
            source,
            destination,
        })
    }

    /// Load a backup job from either of its endpoints.
    pub fn load(shell: Arc<dyn Shell>, url: LocationUrl) -> Result<Job> {
        let mut location = Location::new(url, None, None, shell);

        // probe the default container relpath when the url itself does not
        // hold a configuration
        if !location.has_configuration()? {
            location.set_container_relpath(Some(DEFAULT_CONTAINER_RELPATH));
        }

        let peer = match location.read_configuration() {
            Ok(peer) => peer,
            Err(BackupError::CommandFailed { .. }) => {
                return Err(BackupError::NotInitialized(location.configuration_path()))
            }
            Err(e) => return Err(e),
        };

        let peer = match peer {
            Some(mut peer) => {
                match peer.read_configuration() {
                    Ok(_) => {}
                    Err(BackupError::CommandFailed { .. }) => {
                        return Err(BackupError::NotInitialized(peer.configuration_path()))
                    }
                    Err(e) => return Err(e),
                }

                if peer.uuid() != location.uuid() {
                    return Err(BackupError::InconsistentJob(
                        location.uuid().unwrap_or_else(Uuid::nil),
                        peer.uuid().unwrap_or_else(Uuid::nil),
                    ));
                }

                Some(peer)
            }
            None => None,
        };

        match location.location_type() {
            Some(LocationType::Source) => Ok(Job {
                source: location,
                destination: peer,
            }),
            Some(LocationType::Destination) => {
                let source =
                    peer.ok_or_else(|| BackupError::NoPeer(location.url().to_string()))?;

                Ok(Job {
                    source,
                    destination: Some(location),
                })
            }
            None => Err(BackupError::InvalidConfiguration(
                "location type missing after load".into(),
            )),
        }
    }

    /// Update retention and compression settings and rewrite both
    /// configurations.
    pub fn update(
        &mut self,
        source_retention: Option<RetentionExpression>,
        dest_retention: Option<RetentionExpression>,
        compress: Option<bool>,
    ) -> Result<()> {
        let source_uuid = self.source.uuid().ok_or_else(|| {
            BackupError::InvalidConfiguration(
                "update requires location uuids, this job was presumably created by an older \
                 version"
                    .into(),
            )
        })?;

        if let Some(dest) = &self.destination {
            let dest_uuid = dest.uuid().ok_or_else(|| {
                BackupError::InvalidConfiguration(
                    "update requires location uuids, this job was presumably created by an older \
                     version"
                        .into(),
                )
            })?;

            if source_uuid != dest_uuid {
                return Err(BackupError::InconsistentJob(source_uuid, dest_uuid));
            }
        }

        log::info!("updating configurations");

        if let Some(retention) = source_retention {
            self.source.set_retention(Some(retention));
        }

        if let Some(retention) = dest_retention {
            if let Some(dest) = &mut self.destination {
                dest.set_retention(Some(retention));
            }
        }

        if let Some(compress) = compress {
            self.source.set_compress(compress);
            if let Some(dest) = &mut self.destination {
                dest.set_compress(compress);
            }
        }

        self.source.write_configuration(self.destination.as_ref())?;
        if let Some(dest) = &self.destination {
            dest.write_configuration(Some(&self.source))?;
        }

        log::info!("{}", self.source);
        if let Some(dest) = &self.destination {
            log::info!("{}", dest);
        }
        log::info!("updated successfully");

        Ok(())
    }

    /// Perform one backup run.
    pub fn run(&mut self) -> Result<SnapshotName> {
        self.run_at(Utc::now())
    }

    pub(crate) fn run_at(&mut self, now: DateTime<Utc>) -> Result<SnapshotName> {
        let started = Instant::now();

        log::info!("{}", self.source);
        if let Some(dest) = &self.destination {
            log::info!("{}", dest);
        }

        log::info!("preparing environment");
        self.source.prepare_environment()?;
        if let Some(dest) = &self.destination {
            dest.prepare_environment()?;
        }

        self.source.retrieve_snapshots()?;
        if let Some(dest) = &mut self.destination {
            dest.retrieve_snapshots()?;
        }

        let new = SnapshotName::new(now);

        // the filesystem ordering invariant requires strictly growing names
        if let Some(head) = self.source.snapshots().first() {
            if new.timestamp() <= head.name().timestamp() {
                return Err(BackupError::ClockSkew {
                    new: new.to_string(),
                    head: head.to_string(),
                });
            }
        }

        let Job {
            source,
            destination,
        } = self;

        match destination {
            None => {
                // snapshot rotation only
                source.create_snapshot(&new.to_string())?;
                source.insert_snapshot(Snapshot::new(new, None));
                source.purge_snapshots(None, now)?;
            }
            Some(dest) => {
                transfer_and_promote(source, dest, &new)?;

                source.purge_snapshots(None, now)?;
                dest.purge_snapshots(None, now)?;
            }
        }

        let elapsed = started.elapsed().as_secs();
        log::info!(
            "backup {} created successfully in {:02}:{:02}:{:02}",
            new,
            elapsed / 3600,
            (elapsed % 3600) / 60,
            elapsed % 60
        );

        Ok(new)
    }

    /// Apply retention on both sides, optionally overriding the configured
    /// expressions.
    pub fn purge(
        &mut self,
        source_retention: Option<&RetentionExpression>,
        dest_retention: Option<&RetentionExpression>,
    ) -> Result<()> {
        self.purge_at(Utc::now(), source_retention, dest_retention)
    }

    pub(crate) fn purge_at(
        &mut self,
        now: DateTime<Utc>,
        source_retention: Option<&RetentionExpression>,
        dest_retention: Option<&RetentionExpression>,
    ) -> Result<()> {
        self.source.retrieve_snapshots()?;
        self.source.purge_snapshots(source_retention, now)?;

        if let Some(dest) = &mut self.destination {
            dest.retrieve_snapshots()?;
            dest.purge_snapshots(dest_retention, now)?;
        }

        Ok(())
    }

    /// Destroy both sides of the job.
    pub fn destroy(&mut self, purge: bool) -> Result<()> {
        self.source.destroy(purge)?;

        if let Some(dest) = &mut self.destination {
            dest.destroy(purge)?;
        }

        Ok(())
    }

    /// One-shot transfer between two unconfigured locations.
    pub fn transfer(
        shell: Arc<dyn Shell>,
        source_url: LocationUrl,
        dest_url: LocationUrl,
        compress: bool,
    ) -> Result<SnapshotName> {
        Self::transfer_at(shell, source_url, dest_url, compress, Utc::now())
    }

    pub(crate) fn transfer_at(
        shell: Arc<dyn Shell>,
        source_url: LocationUrl,
        dest_url: LocationUrl,
        compress: bool,
        now: DateTime<Utc>,
    ) -> Result<SnapshotName> {
        let mut source = Location::new(
            source_url,
            Some(LocationType::Source),
            None,
            shell.clone(),
        );
        let mut dest = Location::new(dest_url, Some(LocationType::Destination), None, shell);

        source.set_compress(compress);
        dest.set_compress(compress);

        source.prepare_environment()?;
        dest.prepare_environment()?;

        source.retrieve_snapshots()?;
        dest.retrieve_snapshots()?;

        let new = SnapshotName::new(now);

        if let Some(head) = source.snapshots().first() {
            if new.timestamp() <= head.name().timestamp() {
                return Err(BackupError::ClockSkew {
                    new: new.to_string(),
                    head: head.to_string(),
                });
            }
        }

        transfer_and_promote(&mut source, &mut dest, &new)?;

        log::info!("transferred {} successfully", new);

        Ok(new)
    }

    /// Render both sides' metadata and snapshot listings.
    pub fn print_info(&mut self, out: &mut dyn Write) -> Result<()> {
        if let Err(e) = self.source.retrieve_snapshots() {
            log::error!("{}", e);
        }

        if let Some(dest) = &mut self.destination {
            if let Err(e) = dest.retrieve_snapshots() {
                log::error!("{}", e);
            }
        }

        let source = &self.source;
        let dest = self.destination.as_ref();

        let not_available = "n/a".to_string();

        let mut rows: Vec<(&str, Vec<String>)> = Vec::new();
        rows.push((
            "UUID",
            vec![source
                .uuid()
                .map(|u| u.to_string())
                .unwrap_or_else(|| not_available.clone())],
        ));
        rows.push(("Compress", vec![source.compress().to_string()]));
        rows.push((
            "Source URL",
            vec![source.url().to_string().trim_end_matches('/').to_string()],
        ));
        rows.push((
            "Source container",
            vec![source
                .container_relpath()
                .map(|r| r.to_string())
                .unwrap_or_else(|| not_available.clone())],
        ));
        rows.push((
            "Source retention",
            vec![source
                .retention()
                .map(|r| r.to_string())
                .unwrap_or_else(|| not_available.clone())],
        ));
        rows.push((
            "Source snapshots",
            source.snapshots().iter().map(|s| s.to_string()).collect(),
        ));

        if let Some(dest) = dest {
            rows.push((
                "Destination URL",
                vec![dest.url().to_string().trim_end_matches('/').to_string()],
            ));
            rows.push((
                "Destination retention",
                vec![dest
                    .retention()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| not_available.clone())],
            ));
            rows.push((
                "Destination snapshots",
                dest.snapshots().iter().map(|s| s.to_string()).collect(),
            ));
        }

        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0) + 1;

        for (label, values) in rows {
            for (i, value) in values.iter().enumerate() {
                let label = match i {
                    0 => label,
                    _ => "",
                };
                writeln!(out, "   {:<width$} {}", label, value, width = width)?;
            }
        }

        Ok(())
    }
}

/// Create the scratch snapshot, pipe it over, and atomically promote both
/// sides to the final name.
///
/// Recovery is best effort: after any failure neither side is left holding
/// a scratch subvolume, and a promoted destination snapshot implies the
/// promoted source snapshot exists as well.
fn transfer_and_promote(source: &mut Location, dest: &mut Location, new: &SnapshotName) -> Result<()> {
    // an incremental parent is only usable when both sides agree on the
    // newest snapshot
    let parent = match (source.snapshots().first(), dest.snapshots().first()) {
        (Some(source_head), Some(dest_head))
            if source_head.name().timestamp() == dest_head.name().timestamp() =>
        {
            Some(source_head.name())
        }
        (Some(source_head), Some(dest_head)) => {
            log::warn!(
                "source and destination head snapshots differ [{} != {}], forcing full transfer",
                source_head,
                dest_head
            );
            None
        }
        _ => None,
    };

    let temp_name = source.create_temp_name();
    source.create_snapshot(&temp_name)?;

    let temp_source_path = source.container_child(&temp_name);
    // the receiver names the inbound subvolume after the sent snapshot
    let temp_dest_path = dest.container_child(&temp_name);

    if let Err(e) = source.transfer_btrfs_snapshot(dest, &temp_name, parent.as_ref()) {
        recover(source, &temp_source_path);
        recover(dest, &temp_dest_path);
        return Err(e);
    }

    let final_source_path = source.container_child(&new.to_string());
    let final_dest_path = dest.container_child(&new.to_string());

    if let Err(e) = source.move_file(&temp_source_path, &final_source_path) {
        recover(source, &temp_source_path);
        recover(dest, &temp_dest_path);
        return Err(e);
    }

    if let Err(e) = dest.move_file(&temp_dest_path, &final_dest_path) {
        // take the just-promoted source snapshot back down so the sides
        // stay consistent
        recover(source, &final_source_path);
        recover(dest, &temp_dest_path);
        return Err(e);
    }

    source.insert_snapshot(Snapshot::new(*new, None));
    dest.insert_snapshot(Snapshot::new(*new, None));

    Ok(())
}

fn recover(location: &Location, path: &str) {
    if let Err(e) = location.remove_btrfs_subvolume(path) {
        log::warn!("recovery could not remove [{}]: {}", path, e);
    }
}
