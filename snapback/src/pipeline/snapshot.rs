//! Snapshot naming, latest-snapshot selection and retention filtering.
//!
//! Snapshot names sort lexicographically in promotion order. Everything
//! here is a pure function over a remote listing.

use chrono::{DateTime, Local, NaiveDateTime, Utc};

use crate::remote::RemoteDir;
use crate::retention::Retention;

/// The single mutable directory under a base directory.
pub const STAGING_DIR: &str = ".tmp";

/// `YYYY-MM-DD_HHMMSS`
pub const SNAPSHOT_FORMAT: &str = "%Y-%m-%d_%H%M%S";

pub fn join_remote(base: &str, name: &str) -> String {
    format!("{base}/{name}")
}

/// Listing entries other than the staging directory.
pub fn snapshots(dirs: &[RemoteDir]) -> impl Iterator<Item = &RemoteDir> {
    dirs.iter().filter(|d| d.name != STAGING_DIR)
}

/// The lexicographically greatest snapshot name, if any.
pub fn latest_snapshot(dirs: &[RemoteDir]) -> Option<&str> {
    snapshots(dirs).map(|d| d.name.as_str()).max()
}

/// Whether `name` is a timestamp name, with any `_NNN` collision suffixes.
pub fn is_snapshot_name(name: &str) -> bool {
    let mut stem = name;
    while let Some((rest, suffix)) = stem.rsplit_once('_') {
        if suffix.len() == 3 && suffix.bytes().all(|b| b.is_ascii_digit()) {
            stem = rest;
        } else {
            break;
        }
    }
    stem.len() == "YYYY-MM-DD_HHMMSS".len()
        && NaiveDateTime::parse_from_str(stem, SNAPSHOT_FORMAT).is_ok()
}

/// The greatest timestamp-named snapshot, ignoring foreign directories.
pub fn latest_timestamped(dirs: &[RemoteDir]) -> Option<&str> {
    snapshots(dirs)
        .map(|d| d.name.as_str())
        .filter(|name| is_snapshot_name(name))
        .max()
}

/// Name for a snapshot promoted at `now`.
///
/// Normally the formatted timestamp. When that would not sort strictly
/// after `latest` (same second, or the clock moved backwards) the name is
/// derived from `latest` with a `_NNN` suffix so ordering still holds.
/// A `latest` that is not itself a timestamp name is ignored.
pub fn next_snapshot_name(now: DateTime<Local>, latest: Option<&str>) -> String {
    let candidate = now.format(SNAPSHOT_FORMAT).to_string();
    match latest {
        Some(latest) if is_snapshot_name(latest) && candidate.as_str() <= latest => {
            successor(latest)
        }
        _ => candidate,
    }
}

fn successor(latest: &str) -> String {
    if let Some((stem, suffix)) = latest.rsplit_once('_') {
        if suffix.len() == 3 && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = suffix.parse::<u16>() {
                if n < 999 {
                    return format!("{stem}_{:03}", n + 1);
                }
            }
        }
    }
    format!("{latest}_001")
}

/// Snapshots whose age exceeds `retention`, sorted by name.
///
/// Entries with a change time in the future are never expired.
pub fn expired_snapshots<'a>(
    dirs: &'a [RemoteDir],
    retention: Retention,
    now: DateTime<Utc>,
) -> Vec<&'a str> {
    let mut expired: Vec<&str> = snapshots(dirs)
        .filter(|d| {
            (now - d.changed)
                .to_std()
                .map(|age| retention.is_expired(age))
                .unwrap_or(false)
        })
        .map(|d| d.name.as_str())
        .collect();
    expired.sort_unstable();
    expired
}
