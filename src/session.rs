//! Contains the `pm install-*` command strings and the parsing of their responses.
//!
//! Success is detected textually: create and write answers must contain the
//! literal `Success`, the commit answer matches `success` in any case. Every
//! such check lives here so it can be swapped for exit-code handling if `pm`
//! ever changes its output.
use std::fmt;
use std::path::{Path, PathBuf};
use regex::Regex;

/// Where `pm install-write` reads a payload from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteSource {
    /// `-`, the payload follows on stdin
    Stdin,
    /// A path the privileged process opens itself
    Path(PathBuf),
}

impl fmt::Display for WriteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteSource::Stdin => f.write_str("-"),
            WriteSource::Path(path) => f.write_str(&crate::broker::shell_quote(&path.to_string_lossy())),
        }
    }
}

pub fn create_command(replace: bool, grant: bool, user: Option<u32>, installer: Option<&str>) -> String {
    let mut cmd = String::from("pm install-create");
    if replace {
        cmd.push_str(" -r");
    }
    if grant {
        cmd.push_str(" -g");
    }
    if let Some(user) = user {
        cmd.push_str(&format!(" --user {}", user));
    }
    if let Some(installer) = installer {
        cmd.push_str(&format!(" -i {}", installer));
    }
    cmd
}

pub fn write_command(size: u64, session_id: &str, name: &str, source: &WriteSource) -> String {
    format!("pm install-write -S {} {} {} {}", size, session_id, name, source)
}

pub fn commit_command(session_id: &str) -> String {
    format!("pm install-commit {}", session_id)
}

pub fn abandon_command(session_id: &str) -> String {
    format!("pm install-abandon {}", session_id)
}

/// Copies a payload into a path `pm` can read.
pub fn stage_command(path: &Path) -> String {
    format!("cat > {}", crate::broker::shell_quote(&path.to_string_lossy()))
}

pub fn remove_command(path: &Path) -> String {
    format!("rm -f {}", crate::broker::shell_quote(&path.to_string_lossy()))
}

/// Literal `Success` marker required of create and write answers.
pub fn is_phase_success(output: &str) -> bool {
    output.contains("Success")
}

pub fn is_commit_success(output: &str) -> bool {
    output.to_lowercase().contains("success")
}

/// Extracts `<id>` from `Success: created install session [<id>]`.
pub fn parse_session_id(output: &str) -> Option<String> {
    if !is_phase_success(output) {
        return None;
    }
    let re = Regex::new(r"\[([^\]]+)\]").ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|id| !id.is_empty())
}
