use std::path::{Path, PathBuf};
use std::{env, fs, io};

use directories::ProjectDirs;

/// Resolved `.bridge` directory tree under a base directory (§6.4).
#[derive(Debug, Clone)]
pub struct BridgePaths {
    pub base: PathBuf,
    pub root: PathBuf,
    pub config_mappings_dir: PathBuf,
    pub mappings_state_dir: PathBuf,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub tmp_uploads_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl BridgePaths {
    pub fn resolve(cli_override: Option<PathBuf>) -> Result<Self, anyhow::Error> {
        let base = resolve_base_dir(cli_override, env::var("BRIDGE_BASE_DIR").ok())?;
        Ok(Self::from_base(base))
    }

    pub fn from_base(base: PathBuf) -> Self {
        let root = base.join(".bridge");
        Self {
            config_mappings_dir: root.join("config").join("mappings"),
            mappings_state_dir: root.join("mappings_state"),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
            tmp_uploads_dir: root.join("tmp").join("uploads"),
            logs_dir: root.join("logs"),
            root,
            base,
        }
    }

    pub fn sync_state_file(&self) -> PathBuf {
        self.state_dir.join("sync_state.json")
    }

    pub fn upload_tokens_file(&self) -> PathBuf {
        self.cache_dir.join("upload_tokens.json")
    }

    pub fn mapping_config_file(&self, mapping_name: &str) -> PathBuf {
        self.config_mappings_dir.join(format!("{mapping_name}.json"))
    }

    pub fn mapping_history_file(&self, mapping_name: &str) -> PathBuf {
        self.mappings_state_dir
            .join(format!("{mapping_name}.state.json"))
    }

    /// Creates the full tree with mode `0700` on POSIX (best-effort elsewhere),
    /// matching `core/paths.py::ensure_bridge_directory`.
    pub fn ensure_directories(&self) -> Result<(), anyhow::Error> {
        for dir in [
            &self.config_mappings_dir,
            &self.mappings_state_dir,
            &self.state_dir,
            &self.cache_dir,
            &self.tmp_uploads_dir,
            &self.logs_dir,
        ] {
            fs::create_dir_all(dir)?;
            set_dir_private(dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_dir_private(dir: &Path) -> Result<(), anyhow::Error> {
    use std::os::unix::fs::PermissionsExt as _;
    let perms = fs::Permissions::from_mode(0o700);
    fs::set_permissions(dir, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_private(_dir: &Path) -> Result<(), anyhow::Error> {
    Ok(())
}

/// Best-effort `chmod 0600`; ignored on platforms without POSIX permissions,
/// mirroring `core/paths.py::set_secure_file_permissions`.
#[cfg(unix)]
pub fn set_file_private(path: &Path) -> Result<(), anyhow::Error> {
    use std::os::unix::fs::PermissionsExt as _;
    let perms = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_file_private(_path: &Path) -> Result<(), anyhow::Error> {
    Ok(())
}

fn resolve_base_dir(
    cli_override: Option<PathBuf>,
    env_override: Option<String>,
) -> Result<PathBuf, anyhow::Error> {
    if let Some(path) = cli_override {
        ensure_writable(&path)?;
        return Ok(path);
    }

    if let Some(path) = env_override {
        let path = PathBuf::from(path);
        ensure_writable(&path)?;
        return Ok(path);
    }

    let exe_dir = default_exe_base_dir()?;
    if ensure_writable(&exe_dir).is_ok() {
        return Ok(exe_dir);
    }

    let fallback = fallback_base_dir()?;
    ensure_writable(&fallback)?;
    Ok(fallback)
}

fn default_exe_base_dir() -> Result<PathBuf, anyhow::Error> {
    let exe = env::current_exe()?;
    let exe_dir = exe
        .parent()
        .ok_or_else(|| io::Error::other("executable has no parent dir"))?;
    Ok(exe_dir.to_path_buf())
}

fn fallback_base_dir() -> Result<PathBuf, anyhow::Error> {
    let project_dirs = ProjectDirs::from("cloud", "datasnap", "bridge")
        .ok_or_else(|| io::Error::other("unable to determine base dir"))?;
    Ok(project_dirs.data_local_dir().to_path_buf())
}

fn ensure_writable(dir: &Path) -> Result<(), anyhow::Error> {
    fs::create_dir_all(dir)?;
    let probe = tempfile::Builder::new()
        .prefix(".bridge_write_test_")
        .tempfile_in(dir)?;
    probe.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_base_dir_cli_override_wins_over_env() -> Result<(), anyhow::Error> {
        let cli_dir = tempfile::TempDir::new()?;
        let env_dir = tempfile::TempDir::new()?;

        let resolved = resolve_base_dir(
            Some(cli_dir.path().to_path_buf()),
            Some(env_dir.path().to_string_lossy().to_string()),
        )?;
        assert_eq!(resolved, cli_dir.path());
        Ok(())
    }

    #[test]
    fn resolve_base_dir_uses_env_when_no_cli_override() -> Result<(), anyhow::Error> {
        let env_dir = tempfile::TempDir::new()?;
        let resolved =
            resolve_base_dir(None, Some(env_dir.path().to_string_lossy().to_string()))?;
        assert_eq!(resolved, env_dir.path());
        Ok(())
    }

    #[test]
    fn from_base_lays_out_expected_tree() {
        let paths = BridgePaths::from_base(PathBuf::from("/tmp/example"));
        assert_eq!(
            paths.config_mappings_dir,
            PathBuf::from("/tmp/example/.bridge/config/mappings")
        );
        assert_eq!(
            paths.sync_state_file(),
            PathBuf::from("/tmp/example/.bridge/state/sync_state.json")
        );
        assert_eq!(
            paths.mapping_config_file("mydb.users"),
            PathBuf::from("/tmp/example/.bridge/config/mappings/mydb.users.json")
        );
    }

    #[test]
    fn ensure_directories_creates_full_tree() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let paths = BridgePaths::from_base(tmp.path().to_path_buf());
        paths.ensure_directories()?;
        assert!(paths.config_mappings_dir.is_dir());
        assert!(paths.tmp_uploads_dir.is_dir());
        Ok(())
    }
}
