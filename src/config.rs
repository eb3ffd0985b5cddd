//! Contains the persisted settings: which broker to use and the defaults for
//! install sessions.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::broker::BrokerKind;
use crate::error::{InstallError, Result};
use crate::installer::{InstallOptions, DEFAULT_STAGING_DIR};

pub const DEFAULT_INSTALLER: &str = "io.github.huidoudour.zjs";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerKind,
    /// Serial of the adb device to use when several are attached
    pub device: Option<String>,
    pub installer: Option<String>,
    pub replace_existing: bool,
    pub grant_permissions: bool,
    pub user: Option<u32>,
    /// Copy payloads to the device's staging directory before writing them
    pub staged_writes: bool,
    /// Device directory staged copies are written to
    pub staging_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Adb,
            device: None,
            installer: Some(DEFAULT_INSTALLER.to_string()),
            replace_existing: true,
            grant_permissions: true,
            user: None,
            staged_writes: false,
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            cache_dir: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io.github", "huidoudour", "xinstall")
}

impl Settings {
    pub fn default_path() -> Result<PathBuf> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
            .ok_or_else(|| InstallError::Config("could not determine a configuration directory".to_string()))
    }

    /// Missing file gives the defaults; an unreadable one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(InstallError::io(format!("failed to read {}", path.display()), e)),
        };
        serde_json::from_str(&text).map_err(|e| InstallError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| InstallError::io(format!("failed to create {}", parent.display()), e))?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| InstallError::Config(e.to_string()))?;
        fs::write(path, text).map_err(|e| InstallError::io(format!("failed to write {}", path.display()), e))?;
        debug!("saved settings to {}", path.display());
        Ok(())
    }

    /// Directory bundles are extracted under.
    pub fn extraction_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        project_dirs()
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("xinstall"))
    }

    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            replace_existing: self.replace_existing,
            grant_permissions: self.grant_permissions,
            user: self.user,
            installer: self.installer.clone(),
        }
    }

    pub fn switch_broker(&mut self) -> BrokerKind {
        self.broker = self.broker.switched();
        self.broker
    }
}
