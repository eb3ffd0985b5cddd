//! Contains the privilege broker seam and the status probe run before any install.
use std::fmt;
use std::process::Command;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::error::ExecError;

/// What a broker's privileged process is able to do beyond running `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerCapabilities {
    /// The privileged process can open files at the caller's paths, so
    /// `pm install-write` may be given a path instead of a stdin stream.
    pub reads_host_paths: bool,
    /// Installer package passed as `-i` to `pm install-create`. Device-owner
    /// style brokers install as themselves and leave this empty.
    pub installer_identity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32, pub u32);

impl Version {
    /// Parses the leading `major[.minor[.patch]]` of a version string,
    /// ignoring whatever follows (`26.1:MAGISK`, `34.0.5-debian`).
    pub fn parse(text: &str) -> Option<Self> {
        let numeric: String = text
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter(|p| !p.is_empty()).map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        Some(Version(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// An external process able to spawn commands with elevated rights.
///
/// Implementations resolve how to reach the broker once, when they are
/// constructed, and reuse that binding for every command.
pub trait PrivilegeBroker: Send + Sync {
    fn name(&self) -> &'static str;
    /// Builds the host process that runs `argv` inside the privileged context.
    fn command(&self, argv: &[&str]) -> Command;
    fn is_installed(&self) -> bool;
    /// Whether the broker's runtime connection is reachable.
    fn ping(&self) -> Result<bool, ExecError>;
    fn version(&self) -> Result<Option<Version>, ExecError>;
    fn min_version(&self) -> Option<Version>;
    fn is_authorized(&self) -> Result<bool, ExecError>;
    fn capabilities(&self) -> BrokerCapabilities;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeStatus {
    NotInstalled,
    NotRunning,
    NotAuthorized,
    Authorized,
    VersionTooLow,
}

impl PrivilegeStatus {
    pub fn is_usable(self) -> bool {
        self == PrivilegeStatus::Authorized
    }
}

impl fmt::Display for PrivilegeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PrivilegeStatus::NotInstalled => "Not Installed",
            PrivilegeStatus::NotRunning => "Not Running",
            PrivilegeStatus::NotAuthorized => "Not Authorized",
            PrivilegeStatus::Authorized => "Authorized",
            PrivilegeStatus::VersionTooLow => "Version Too Low",
        };
        f.write_str(text)
    }
}

/// Checks installed, running, version and authorization in that order,
/// stopping at the first predicate that fails. Broker errors count as
/// "not running".
pub fn probe(broker: &dyn PrivilegeBroker) -> PrivilegeStatus {
    if !broker.is_installed() {
        return PrivilegeStatus::NotInstalled;
    }
    match broker.ping() {
        Ok(true) => {}
        Ok(false) => return PrivilegeStatus::NotRunning,
        Err(e) => {
            debug!("{} ping failed: {}", broker.name(), e);
            return PrivilegeStatus::NotRunning;
        }
    }
    if let Some(min) = broker.min_version() {
        match broker.version() {
            Ok(Some(version)) if version < min => return PrivilegeStatus::VersionTooLow,
            // an unreported version is tolerated
            Ok(_) => {}
            Err(e) => {
                debug!("{} version query failed: {}", broker.name(), e);
                return PrivilegeStatus::NotRunning;
            }
        }
    }
    match broker.is_authorized() {
        Ok(true) => PrivilegeStatus::Authorized,
        Ok(false) => PrivilegeStatus::NotAuthorized,
        Err(e) => {
            debug!("{} permission check failed: {}", broker.name(), e);
            PrivilegeStatus::NotRunning
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Shell-user privileges through `adb shell`
    Adb,
    /// Root privileges through `su` on the local device
    Root,
    /// No elevation, runs `sh` directly
    Local,
}

impl BrokerKind {
    pub fn label(self) -> &'static str {
        match self {
            BrokerKind::Adb => "adb",
            BrokerKind::Root => "root",
            BrokerKind::Local => "local",
        }
    }

    /// The broker the `mode switch` command moves to.
    pub fn switched(self) -> Self {
        match self {
            BrokerKind::Adb => BrokerKind::Root,
            BrokerKind::Root | BrokerKind::Local => BrokerKind::Adb,
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Runs commands directly with `sh`, without elevation. Used for the
/// unprivileged shell fallback.
#[derive(Debug, Default)]
pub struct LocalShell;

impl PrivilegeBroker for LocalShell {
    fn name(&self) -> &'static str {
        "local"
    }

    fn command(&self, argv: &[&str]) -> Command {
        let mut cmd = Command::new(argv.first().copied().unwrap_or("sh"));
        if argv.len() > 1 {
            cmd.args(&argv[1..]);
        }
        cmd
    }

    fn is_installed(&self) -> bool {
        which::which("sh").is_ok()
    }

    fn ping(&self) -> Result<bool, ExecError> {
        Ok(true)
    }

    fn version(&self) -> Result<Option<Version>, ExecError> {
        Ok(None)
    }

    fn min_version(&self) -> Option<Version> {
        None
    }

    fn is_authorized(&self) -> Result<bool, ExecError> {
        Ok(true)
    }

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities { reads_host_paths: true, installer_identity: None }
    }
}

/// Quotes `arg` for a POSIX shell so it survives being joined into a single
/// command line.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c)) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Joins `argv` into one shell command line.
pub fn join_argv(argv: &[&str]) -> String {
    argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Broker whose probe answers are fixed, counting how often each
    /// predicate is consulted.
    pub(crate) struct ScriptedBroker {
        pub installed: bool,
        pub running: Result<bool, ()>,
        pub version: Option<Version>,
        pub min: Option<Version>,
        pub authorized: bool,
        pub calls: AtomicUsize,
    }

    impl ScriptedBroker {
        pub fn authorized() -> Self {
            Self {
                installed: true,
                running: Ok(true),
                version: Some(Version(13, 0, 0)),
                min: Some(Version(11, 0, 0)),
                authorized: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PrivilegeBroker for ScriptedBroker {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn command(&self, argv: &[&str]) -> Command {
            LocalShell.command(argv)
        }
        fn is_installed(&self) -> bool {
            self.installed
        }
        fn ping(&self) -> Result<bool, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.running.map_err(|_| ExecError::new("ping", "binder died"))
        }
        fn version(&self) -> Result<Option<Version>, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.version)
        }
        fn min_version(&self) -> Option<Version> {
            self.min
        }
        fn is_authorized(&self) -> Result<bool, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.authorized)
        }
        fn capabilities(&self) -> BrokerCapabilities {
            BrokerCapabilities::default()
        }
    }

    #[test]
    fn not_installed_short_circuits() {
        let broker = ScriptedBroker { installed: false, ..ScriptedBroker::authorized() };
        assert_eq!(probe(&broker), PrivilegeStatus::NotInstalled);
        assert_eq!(broker.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn broker_errors_read_as_not_running() {
        let broker = ScriptedBroker { running: Err(()), ..ScriptedBroker::authorized() };
        assert_eq!(probe(&broker), PrivilegeStatus::NotRunning);
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn old_version_reported_before_authorization() {
        let broker = ScriptedBroker { version: Some(Version(10, 0, 0)), ..ScriptedBroker::authorized() };
        assert_eq!(probe(&broker), PrivilegeStatus::VersionTooLow);
        assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_version_is_tolerated() {
        let broker = ScriptedBroker { version: None, authorized: false, ..ScriptedBroker::authorized() };
        assert_eq!(probe(&broker), PrivilegeStatus::NotAuthorized);
    }

    #[test]
    fn authorized_when_every_predicate_passes() {
        assert_eq!(probe(&ScriptedBroker::authorized()), PrivilegeStatus::Authorized);
    }

    #[test]
    fn status_reads_as_text() {
        assert_eq!(PrivilegeStatus::VersionTooLow.to_string(), "Version Too Low");
        assert!(!PrivilegeStatus::NotAuthorized.is_usable());
        assert!(PrivilegeStatus::Authorized.is_usable());
    }

    #[test]
    fn parses_version_prefixes() {
        assert_eq!(Version::parse("1.0.41"), Some(Version(1, 0, 41)));
        assert_eq!(Version::parse("26.1:MAGISK"), Some(Version(26, 1, 0)));
        assert_eq!(Version::parse("34.0.5-debian"), Some(Version(34, 0, 5)));
        assert_eq!(Version::parse("MAGISK"), None);
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("install-create"), "install-create");
        assert_eq!(shell_quote("pm install-write -S 1 2 base.apk -"), "'pm install-write -S 1 2 base.apk -'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(join_argv(&["sh", "-c", "echo hi"]), "sh -c 'echo hi'");
    }
}
