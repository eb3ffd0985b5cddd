//! Contains the AdbClient broker, which reaches the device's shell user through `adb`.
use std::path::PathBuf;
use std::process::{Command, Output};
use which::which;
use tracing::debug;
use crate::broker::{join_argv, BrokerCapabilities, PrivilegeBroker, Version};
use crate::error::ExecError;

/// Oldest adb client with working `pm install-*` session streaming.
const ADB_MIN_VERSION: Version = Version(1, 0, 36);

pub struct AdbClient {
    pub adb_path: Option<PathBuf>,
    pub device: Option<String>,
    installer: Option<String>,
}

/// One row of `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    pub state: String,
}

impl std::fmt::Display for DeviceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.serial, self.state)
    }
}

impl AdbClient {
    pub fn new(device: Option<String>, installer: Option<String>) -> Self {
        let adb_path = which("adb").ok();
        if adb_path.is_none() {
            debug!("adb not found in PATH");
        }
        Self { adb_path, device, installer }
    }

    pub fn with_device(mut self, device: String) -> Self {
        self.device = Some(device);
        self
    }

    fn program(&self) -> PathBuf {
        self.adb_path.clone().unwrap_or_else(|| PathBuf::from("adb"))
    }

    pub fn run_command(&self, args: &[&str]) -> Result<Output, ExecError> {
        let output = Command::new(self.program())
            .args(args)
            .output()
            .map_err(|e| ExecError::new(&format!("adb {}", args.join(" ")), e.to_string()))?;
        Ok(output)
    }

    pub fn get_device_list(&self) -> Result<Vec<DeviceEntry>, ExecError> {
        let output = self.run_command(&["devices"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_devices(&stdout))
    }

    fn device_state(&self) -> Result<Option<String>, ExecError> {
        let devices = self.get_device_list()?;
        let entry = match &self.device {
            Some(serial) => devices.into_iter().find(|d| &d.serial == serial),
            None => devices.into_iter().next(),
        };
        Ok(entry.map(|d| d.state))
    }
}

fn parse_devices(stdout: &str) -> Vec<DeviceEntry> {
    stdout
        .lines()
        .filter(|line| !line.is_empty())
        .filter(|line| !line.contains("daemon not running"))
        .filter(|line| !line.contains("daemon started"))
        .filter(|line| !line.contains("List of devices attached"))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                [serial, state, ..] => Some(DeviceEntry { serial: serial.to_string(), state: state.to_string() }),
                _ => None,
            }
        })
        .collect()
}

fn parse_adb_version(stdout: &str) -> Option<Version> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Android Debug Bridge version "))
        .and_then(Version::parse)
}

impl PrivilegeBroker for AdbClient {
    fn name(&self) -> &'static str {
        "adb"
    }

    fn command(&self, argv: &[&str]) -> Command {
        let mut cmd = Command::new(self.program());
        if let Some(device) = &self.device {
            cmd.args(["-s", device]);
        }
        // adb joins its arguments into a single remote command line
        cmd.arg("shell").arg(join_argv(argv));
        cmd
    }

    fn is_installed(&self) -> bool {
        self.adb_path.is_some()
    }

    fn ping(&self) -> Result<bool, ExecError> {
        Ok(self.device_state()?.is_some())
    }

    fn version(&self) -> Result<Option<Version>, ExecError> {
        let output = self.run_command(&["version"])?;
        Ok(parse_adb_version(&String::from_utf8_lossy(&output.stdout)))
    }

    fn min_version(&self) -> Option<Version> {
        Some(ADB_MIN_VERSION)
    }

    fn is_authorized(&self) -> Result<bool, ExecError> {
        Ok(self.device_state()?.as_deref() == Some("device"))
    }

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities { reads_host_paths: false, installer_identity: self.installer.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_rows_and_states() {
        let stdout = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\nemulator-5554\tdevice\n0123456789ABCDEF\tunauthorized\n\n";
        let devices = parse_devices(stdout);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], DeviceEntry { serial: "emulator-5554".into(), state: "device".into() });
        assert_eq!(devices[1].state, "unauthorized");
    }

    #[test]
    fn parses_version_banner() {
        let stdout = "Android Debug Bridge version 1.0.41\nVersion 34.0.5-debian\nInstalled as /usr/lib/android-sdk/platform-tools/adb\n";
        assert_eq!(parse_adb_version(stdout), Some(Version(1, 0, 41)));
        assert_eq!(parse_adb_version("garbage"), None);
    }

    #[test]
    fn wraps_argv_in_a_single_shell_argument() {
        let client = AdbClient { adb_path: Some(PathBuf::from("/opt/adb")), device: Some("emulator-5554".into()), installer: None };
        let cmd = client.command(&["sh", "-c", "pm install-commit 42"]);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "/opt/adb");
        assert_eq!(args, ["-s", "emulator-5554", "shell", "sh -c 'pm install-commit 42'"]);
    }

    #[test]
    fn missing_binary_means_not_installed() {
        let client = AdbClient { adb_path: None, device: None, installer: Some("io.example".into()) };
        assert!(!client.is_installed());
        assert_eq!(client.capabilities().installer_identity.as_deref(), Some("io.example"));
    }
}
