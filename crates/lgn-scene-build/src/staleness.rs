//! Decides whether a build artifact must be rebuilt.
//!
//! Times are compared with a whole-second granularity, the resolution of
//! most filesystems. An artifact is stale when it is missing or strictly
//! older than its input; an artifact as old as its input is up to date.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::project::{ExternalEvents, Project, SourceFile};

fn whole_seconds(time: SystemTime) -> u64 {
    // times before the epoch do not happen on a sane filesystem.
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

fn modification_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Staleness of an artifact given its modification time and the time its
/// input last changed. `None` stands for a missing artifact or an input whose
/// time is unknown, both of which require a rebuild.
pub fn is_stale(artifact_time: Option<SystemTime>, input_time: Option<SystemTime>) -> bool {
    match (artifact_time, input_time) {
        (Some(artifact_time), Some(input_time)) => {
            whole_seconds(artifact_time) < whole_seconds(input_time)
        }
        _ => true,
    }
}

/// Whether the object file built from `source_file` must be rebuilt.
pub fn source_file_needs_rebuild(project: &Project, source_file: &SourceFile, artifact: &Path) -> bool {
    let source_path = project.source_file_absolute_path(source_file);
    is_stale(modification_time(artifact), modification_time(&source_path))
}

/// Whether the object file generated from the events of `external_events`
/// must be rebuilt.
pub fn external_events_need_rebuild(external_events: &ExternalEvents, artifact: &Path) -> bool {
    is_stale(
        modification_time(artifact),
        Some(external_events.last_change()),
    )
}
