use std::path::{Component, Path, PathBuf};

use crate::error::{DotclawError, Result};

/// Root of the group workspace as seen from inside the sandbox.
pub const CONTAINER_GROUP_ROOT: &str = "/workspace/group";

/// Resolved install layout. All derived directories hang off `home`.
///
/// The mount allowlist is intentionally *not* part of this tree — anything
/// a container may bind-mount lives outside the install home.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    pub home: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub store_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub groups_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub traces_dir: PathBuf,
    pub prompts_dir: PathBuf,
}

impl InstallPaths {
    /// Resolve from `$DOTCLAW_HOME`, falling back to `~/.dotclaw`.
    pub fn resolve() -> Self {
        let home = std::env::var("DOTCLAW_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let user_home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(user_home).join(".dotclaw")
            });
        Self::from_home(home)
    }

    /// Build the layout under an explicit home (tests pass a temp dir).
    pub fn from_home(home: PathBuf) -> Self {
        let data_dir = home.join("data");
        Self {
            config_dir: home.join("config"),
            store_dir: data_dir.join("store"),
            sessions_dir: data_dir.join("sessions"),
            ipc_dir: data_dir.join("ipc"),
            groups_dir: home.join("groups"),
            logs_dir: home.join("logs"),
            traces_dir: home.join("traces"),
            prompts_dir: home.join("prompts"),
            data_dir,
            home,
        }
    }

    /// Create every derived directory. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.store_dir,
            &self.sessions_dir,
            &self.ipc_dir,
            &self.groups_dir,
            &self.logs_dir,
            &self.traces_dir,
            &self.prompts_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Workspace directory for one tenant group.
    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.groups_dir.join(group)
    }

    /// Translate a host path inside `groups/<group>/` to its in-container
    /// form `/workspace/group/<rel>`.
    ///
    /// Returns an error when the path contains NUL bytes or, after realpath
    /// resolution, escapes the group root.
    pub fn host_path_to_container(&self, group: &str, host: &Path) -> Result<String> {
        reject_nul(host)?;
        let group_root = self
            .group_dir(group)
            .canonicalize()
            .map_err(|e| DotclawError::Path(format!("group root unavailable: {e}")))?;
        let real = host
            .canonicalize()
            .map_err(|e| DotclawError::Path(format!("cannot resolve {}: {e}", host.display())))?;
        let rel = real.strip_prefix(&group_root).map_err(|_| {
            DotclawError::Path(format!("{} escapes the group root", host.display()))
        })?;
        if rel.as_os_str().is_empty() {
            return Ok(CONTAINER_GROUP_ROOT.to_string());
        }
        Ok(format!("{}/{}", CONTAINER_GROUP_ROOT, rel.display()))
    }

    /// Translate `/workspace/group/<rel>` back to the host path under
    /// `groups/<group>/`. Rejects NUL bytes, `..` traversal, and — when the
    /// target exists — realpath escapes.
    pub fn container_path_to_host(&self, group: &str, container: &str) -> Result<PathBuf> {
        if container.contains('\0') {
            return Err(DotclawError::Path("path contains NUL byte".to_string()));
        }
        let rel = container
            .strip_prefix(CONTAINER_GROUP_ROOT)
            .map(|r| r.trim_start_matches('/'))
            .ok_or_else(|| {
                DotclawError::Path(format!("{container} is outside the container group root"))
            })?;

        let rel_path = Path::new(rel);
        if rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(DotclawError::Path(format!("{container} traverses upward")));
        }

        let host = self.group_dir(group).join(rel_path);
        // Existing targets get the realpath escape check too; paths that do
        // not exist yet were already vetted lexically above.
        if host.exists() {
            let group_root = self
                .group_dir(group)
                .canonicalize()
                .map_err(|e| DotclawError::Path(format!("group root unavailable: {e}")))?;
            let real = host
                .canonicalize()
                .map_err(|e| DotclawError::Path(format!("cannot resolve: {e}")))?;
            if !real.starts_with(&group_root) {
                return Err(DotclawError::Path(format!(
                    "{container} escapes the group root"
                )));
            }
            return Ok(real);
        }
        Ok(host)
    }
}

fn reject_nul(path: &Path) -> Result<()> {
    if path.to_string_lossy().contains('\0') {
        return Err(DotclawError::Path("path contains NUL byte".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, InstallPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::from_home(dir.path().to_path_buf());
        paths.ensure().unwrap();
        (dir, paths)
    }

    #[test]
    fn derived_dirs_hang_off_home() {
        let (_dir, paths) = fixture();
        assert!(paths.store_dir.starts_with(&paths.data_dir));
        assert!(paths.ipc_dir.starts_with(&paths.data_dir));
        assert!(paths.config_dir.starts_with(&paths.home));
    }

    #[test]
    fn round_trips_a_path_inside_the_group() {
        let (_dir, paths) = fixture();
        let group_dir = paths.group_dir("main");
        std::fs::create_dir_all(group_dir.join("notes")).unwrap();
        let file = group_dir.join("notes/todo.md");
        std::fs::write(&file, "x").unwrap();

        let container = paths.host_path_to_container("main", &file).unwrap();
        assert_eq!(container, "/workspace/group/notes/todo.md");

        let back = paths.container_path_to_host("main", &container).unwrap();
        assert_eq!(back, file.canonicalize().unwrap());
    }

    #[test]
    fn escaping_host_path_is_rejected() {
        let (_dir, paths) = fixture();
        std::fs::create_dir_all(paths.group_dir("main")).unwrap();
        let outside = paths.home.join("config");
        assert!(paths.host_path_to_container("main", &outside).is_err());
    }

    #[test]
    fn symlink_escape_is_rejected() {
        let (_dir, paths) = fixture();
        let group_dir = paths.group_dir("main");
        std::fs::create_dir_all(&group_dir).unwrap();
        let target = paths.home.join("secret.txt");
        std::fs::write(&target, "s").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&target, group_dir.join("link.txt")).unwrap();
            assert!(paths
                .host_path_to_container("main", &group_dir.join("link.txt"))
                .is_err());
        }
    }

    #[test]
    fn container_traversal_is_rejected() {
        let (_dir, paths) = fixture();
        std::fs::create_dir_all(paths.group_dir("main")).unwrap();
        assert!(paths
            .container_path_to_host("main", "/workspace/group/../../etc/passwd")
            .is_err());
        assert!(paths.container_path_to_host("main", "/etc/passwd").is_err());
        assert!(paths
            .container_path_to_host("main", "/workspace/group/a\0b")
            .is_err());
    }

    #[test]
    fn nonexistent_in_tree_target_translates_lexically() {
        let (_dir, paths) = fixture();
        std::fs::create_dir_all(paths.group_dir("main")).unwrap();
        let host = paths
            .container_path_to_host("main", "/workspace/group/jobs/out.md")
            .unwrap();
        assert!(host.starts_with(paths.group_dir("main")));
    }
}
