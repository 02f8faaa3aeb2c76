//! Session-snapshot directories.
//!
//! A background job running in `isolated` context mode gets a copy of the
//! group's live session directory so the interactive conversation is not
//! disturbed. Snapshots are plain directories under
//! `data/sessions/snapshots/` and are purged by the maintenance loop.

use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Copy the live session directory of `group` into a fresh snapshot
/// directory and return its path. The v7 UUID name keeps snapshots
/// creation-ordered on disk.
pub fn snapshot_session(sessions_dir: &Path, group: &str, session_id: &str) -> Result<PathBuf> {
    let live = sessions_dir.join(group).join(session_id);
    let snap = sessions_dir
        .join("snapshots")
        .join(format!("{group}-{}", Uuid::now_v7()));
    copy_dir_recursive(&live, &snap)?;
    debug!(group, session_id, snapshot = %snap.display(), "session snapshot created");
    Ok(snap)
}

/// Delete snapshot directories whose modification time is older than
/// `max_age`. Returns the number of snapshots removed.
pub fn purge_snapshots_older_than(
    sessions_dir: &Path,
    max_age: std::time::Duration,
) -> Result<usize> {
    let root = sessions_dir.join("snapshots");
    if !root.exists() {
        return Ok(0);
    }
    let now = std::time::SystemTime::now();
    let mut removed = 0usize;
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_dir() {
            continue;
        }
        let age = now
            .duration_since(meta.modified()?)
            .unwrap_or_default();
        if age > max_age {
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    if !src.exists() {
        // A group with no session yet snapshots to an empty directory.
        return Ok(());
    }
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_the_session_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path();
        let live = sessions.join("main/s1/nested");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("state.json"), "{}").unwrap();

        let snap = snapshot_session(sessions, "main", "s1").unwrap();
        assert!(snap.join("nested/state.json").exists());
    }

    #[test]
    fn missing_session_snapshots_to_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot_session(dir.path(), "main", "nope").unwrap();
        assert!(snap.exists());
        assert_eq!(std::fs::read_dir(&snap).unwrap().count(), 0);
    }

    #[test]
    fn purge_ignores_fresh_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        snapshot_session(dir.path(), "main", "s1").unwrap();
        let removed =
            purge_snapshots_older_than(dir.path(), std::time::Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 0);
    }
}
