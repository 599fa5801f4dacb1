use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Result, StoreError};
use crate::persistence::SqlitePersistence;
use crate::store::NodeStore;

/// `~/.field-memory`, or `./.field-memory` when no home directory is set.
pub fn default_base_dir() -> PathBuf {
    ["HOME", "USERPROFILE"]
        .iter()
        .find_map(|var| env::var_os(var))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".field-memory")
}

fn git_toplevel(dir: &Path) -> Option<PathBuf> {
    let out = Command::new("git")
        .arg("rev-parse")
        .arg("--show-toplevel")
        .current_dir(dir)
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    let top = String::from_utf8_lossy(&out.stdout);
    let top = top.trim();
    (!top.is_empty()).then(|| PathBuf::from(top))
}

/// Project id: the explicit name if it survives sanitizing, else the
/// basename of the enclosing git checkout, else of the working directory.
fn project_id_for(explicit: Option<&str>) -> String {
    if let Some(id) = explicit.map(sanitize_name).filter(|id| !id.is_empty()) {
        return id;
    }
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let root = git_toplevel(&cwd).unwrap_or(cwd);
    root.file_name()
        .map(|name| sanitize_name(&name.to_string_lossy()))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Map a name onto `[A-Za-z0-9_-]`, replacing everything else with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            c if c.is_alphanumeric() => c,
            '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// One SQLite file per project under `<base>/projects/<id>.db`.
pub struct ProjectStore {
    path: PathBuf,
    project_id: String,
}

impl ProjectStore {
    /// `base_dir` replaces [`default_base_dir`]; the CLI passes `FM_DATA_DIR`.
    pub fn locate(project_name: Option<&str>, base_dir: Option<&Path>) -> Result<Self> {
        let dir = base_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(default_base_dir)
            .join("projects");
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::InvalidData(format!("cannot create {}: {e}", dir.display())))?;

        let project_id = project_id_for(project_name);
        Ok(Self {
            path: dir.join(format!("{project_id}.db")),
            project_id,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open_store(&self) -> Result<NodeStore> {
        NodeStore::open(&self.path)
    }

    pub fn open_persistence(&self) -> Result<SqlitePersistence> {
        tracing::info!(project = %self.project_id, path = %self.path.display(), "opening project store");
        Ok(SqlitePersistence::new(self.open_store()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_creates_projects_dir() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectStore::locate(Some("alpha"), Some(dir.path())).unwrap();
        assert_eq!(project.project_id(), "alpha");
        assert!(dir.path().join("projects").is_dir());

        project.open_store().unwrap();
        assert!(dir.path().join("projects/alpha.db").exists());
    }

    #[test]
    fn test_projects_do_not_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let a = ProjectStore::locate(Some("a"), Some(dir.path())).unwrap();
        let b = ProjectStore::locate(Some("b"), Some(dir.path())).unwrap();
        assert_ne!(a.path(), b.path());
        a.open_store().unwrap().set_metadata("owner", "a").unwrap();
        assert!(b.open_store().unwrap().get_metadata("owner").unwrap().is_none());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_name("field memory"), "field_memory");
        assert_eq!(sanitize_name("org/repo"), "org_repo");
        assert_eq!(sanitize_name("ok-name_9"), "ok-name_9");
        assert_eq!(sanitize_name("  padded "), "padded");
    }

    #[test]
    fn test_explicit_name_wins() {
        assert_eq!(project_id_for(Some("my/project name!")), "my_project_name_");
    }

    #[test]
    fn test_blank_name_falls_back_to_directory() {
        assert!(!project_id_for(Some("   ")).is_empty());
    }
}
