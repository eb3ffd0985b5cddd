//! Contains the error types shared by the broker, executor, bundle and installer modules.
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use crate::broker::PrivilegeStatus;

/// Failure to run a single command through the privilege broker.
#[derive(Debug, Error)]
#[error("failed to execute `{command}`: {message}")]
pub struct ExecError {
    pub command: String,
    pub message: String,
}

impl ExecError {
    pub fn new(command: &str, message: impl Into<String>) -> Self {
        Self { command: command.to_string(), message: message.into() }
    }
}

/// Phase of the package manager session a protocol error occurred in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Create,
    Write { name: String },
    Commit,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Create => write!(f, "install-create"),
            Phase::Write { name } => write!(f, "install-write ({})", name),
            Phase::Commit => write!(f, "install-commit"),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("privilege broker unavailable: {0}")]
    BrokerUnavailable(PrivilegeStatus),
    #[error("{phase} failed: {output}")]
    Protocol { phase: Phase, output: String },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid bundle {}: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("no APK entries found in {}", .0.display())]
    EmptyBundle(PathBuf),
    #[error("file does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("install task aborted: {0}")]
    Aborted(String),
}

impl InstallError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        InstallError::Io { context: context.into(), source }
    }
}

pub type Result<T, E = InstallError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_carries_raw_output() {
        let err = InstallError::Protocol {
            phase: Phase::Write { name: "split_config.arm64_v8a.apk".to_string() },
            output: "Failure [INSTALL_FAILED_INVALID_APK]".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "install-write (split_config.arm64_v8a.apk) failed: Failure [INSTALL_FAILED_INVALID_APK]"
        );
    }

    #[test]
    fn exec_error_keeps_original_message() {
        let err: InstallError = ExecError::new("pm install-commit 7", "broken pipe").into();
        assert_eq!(err.to_string(), "failed to execute `pm install-commit 7`: broken pipe");
    }
}
