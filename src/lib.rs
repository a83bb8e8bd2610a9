//! Incremental btrfs snapshot backups.
//!
//! A backup job binds a source subvolume to an optional destination
//! container subvolume, either of which may live on a remote host reachable
//! over ssh. Each run takes a read-only snapshot on the source, pipes a
//! (possibly incremental) `btrfs send` stream into the destination's
//! `btrfs receive`, promotes both sides atomically and thins out history
//! according to per-side retention expressions.

pub mod configs;
pub mod entities;
pub mod error;
pub mod jobs;
pub mod locations;
pub mod logging;
pub mod mail;
pub mod retention;
pub mod shell;
