//! Contains the SuClient broker, which runs commands as root through `su` on the local device.
use std::path::PathBuf;
use std::process::{Command, Output};
use which::which;
use crate::broker::{join_argv, BrokerCapabilities, PrivilegeBroker, Version};
use crate::error::ExecError;

pub struct SuClient {
    pub su_path: Option<PathBuf>,
}

impl SuClient {
    pub fn new() -> Self {
        Self { su_path: which("su").ok() }
    }

    fn program(&self) -> PathBuf {
        self.su_path.clone().unwrap_or_else(|| PathBuf::from("su"))
    }

    fn run_command(&self, args: &[&str]) -> Result<Output, ExecError> {
        Command::new(self.program())
            .args(args)
            .output()
            .map_err(|e| ExecError::new(&format!("su {}", args.join(" ")), e.to_string()))
    }
}

/// `su -V` prints a bare version code such as `26400`.
fn parse_su_version(stdout: &str) -> Option<Version> {
    let digits: String = stdout.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().map(|code| Version(code, 0, 0))
}

impl Default for SuClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivilegeBroker for SuClient {
    fn name(&self) -> &'static str {
        "root"
    }

    fn command(&self, argv: &[&str]) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.arg("-c").arg(join_argv(argv));
        cmd
    }

    fn is_installed(&self) -> bool {
        self.su_path.is_some()
    }

    fn ping(&self) -> Result<bool, ExecError> {
        let output = self.run_command(&["-v"])?;
        Ok(output.status.success())
    }

    fn version(&self) -> Result<Option<Version>, ExecError> {
        let output = self.run_command(&["-V"])?;
        Ok(parse_su_version(&String::from_utf8_lossy(&output.stdout)))
    }

    fn min_version(&self) -> Option<Version> {
        None
    }

    fn is_authorized(&self) -> Result<bool, ExecError> {
        let output = self.run_command(&["-c", "id"])?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).contains("uid=0"))
    }

    fn capabilities(&self) -> BrokerCapabilities {
        // root reads any path and installs as itself, so no -i
        BrokerCapabilities { reads_host_paths: true, installer_identity: None }
    }
}
