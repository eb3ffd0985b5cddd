//! Contains the shell terminal: one-shot commands, a persistent privileged
//! `sh` session and its command history.
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};
use crate::broker::PrivilegeBroker;
use crate::error::ExecError;
use crate::executor::{CommandExecutor, CommandResult};

pub const MAX_HISTORY: usize = 100;

/// Common commands offered by the `help` listing, as `(label, command)`.
pub const QUICK_COMMANDS: &[(&str, &str)] = &[
    ("List files", "ls -la"),
    ("Current directory", "pwd"),
    ("Current user", "whoami"),
    ("System info", "uname -a"),
    ("Disk space", "df -h"),
    ("Memory info", "free -h"),
    ("Process list", "ps -A"),
    ("Installed apps", "pm list packages"),
    ("System properties", "getprop"),
    ("System log", "logcat -d -v time"),
];

/// Runs a single command outside of any session.
pub fn run_once(executor: &dyn CommandExecutor, command: &str) -> Result<CommandResult, ExecError> {
    executor.execute(command)
}

#[derive(Debug, Clone, Default)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    cursor: usize,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `command` unless it is blank or repeats the last entry.
    pub fn add(&mut self, command: &str) {
        if command.trim().is_empty() {
            return;
        }
        if self.entries.back().map(String::as_str) == Some(command) {
            self.cursor = self.entries.len();
            return;
        }
        self.entries.push_back(command.to_string());
        if self.entries.len() > MAX_HISTORY {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len();
    }

    pub fn previous(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        self.cursor = self.cursor.saturating_sub(1);
        self.entries.get(self.cursor).map(String::as_str)
    }

    pub fn all(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

struct LiveShell {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: Receiver<String>,
}

impl LiveShell {
    fn spawn(broker: &dyn PrivilegeBroker) -> Result<Self, ExecError> {
        let mut child = broker
            .command(&["sh"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::new("sh", e.to_string()))?;
        let stdin = child.stdin.take().ok_or_else(|| ExecError::new("sh", "stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| ExecError::new("sh", "stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| ExecError::new("sh", "stderr unavailable"))?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        debug!("[{}] started persistent shell", broker.name());
        Ok(Self { child, stdin, stdout: BufReader::new(stdout), stderr: rx })
    }

    fn close(mut self) {
        let _ = self.stdin.write_all(b"exit\n");
        if let Err(e) = self.child.kill() {
            debug!("shell already gone: {}", e);
        }
        let _ = self.child.wait();
    }
}

/// A long-lived `sh` running through a broker, so `cd` and exported
/// variables carry over from one command to the next.
pub struct ShellSession {
    broker: Arc<dyn PrivilegeBroker>,
    shell: Option<LiveShell>,
    history: CommandHistory,
}

static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

fn markers() -> (String, String) {
    let stamp = chrono::Utc::now().timestamp_millis();
    let seq = MARKER_SEQ.fetch_add(1, Ordering::Relaxed);
    (format!("__CMD_EXIT_{}_{}__", stamp, seq), format!("__CMD_END_{}_{}__", stamp, seq))
}

impl ShellSession {
    pub fn new(broker: Arc<dyn PrivilegeBroker>) -> Self {
        Self { broker, shell: None, history: CommandHistory::new() }
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut CommandHistory {
        &mut self.history
    }

    pub fn is_alive(&self) -> bool {
        self.shell.is_some()
    }

    /// Runs `command` in the session, starting the shell if needed.
    pub fn run(&mut self, command: &str) -> Result<CommandResult, ExecError> {
        self.history.add(command);
        if self.shell.is_none() {
            self.shell = Some(LiveShell::spawn(self.broker.as_ref())?);
        }
        let result = match self.shell.as_mut() {
            Some(shell) => exchange(shell, command),
            None => return Err(ExecError::new(command, "shell not running")),
        };
        match result {
            Ok((result, true)) => Ok(result),
            Ok((result, false)) => {
                debug!("shell exited while running `{}`", command);
                self.reset();
                Ok(result)
            }
            Err(e) => {
                warn!("shell session broken: {}", e);
                self.reset();
                Err(e)
            }
        }
    }

    /// Tears the shell down; the next command starts a fresh one.
    pub fn reset(&mut self) {
        if let Some(shell) = self.shell.take() {
            shell.close();
            debug!("[{}] shell session reset", self.broker.name());
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Sends one command followed by the marker echoes and reads back until the
/// end marker. The flag is false when the shell hit EOF first.
fn exchange(shell: &mut LiveShell, command: &str) -> Result<(CommandResult, bool), ExecError> {
    let (exit_marker, end_marker) = markers();
    let script = format!(
        "{}\necho {}$?\necho {}\necho {} >&2\n",
        command, exit_marker, end_marker, end_marker
    );
    shell
        .stdin
        .write_all(script.as_bytes())
        .and_then(|()| shell.stdin.flush())
        .map_err(|e| ExecError::new(command, e.to_string()))?;

    let mut stdout = Vec::new();
    let mut exit_code = None;
    let mut finished = false;
    let mut line = String::new();
    loop {
        line.clear();
        let read = shell.stdout.read_line(&mut line).map_err(|e| ExecError::new(command, e.to_string()))?;
        if read == 0 {
            break;
        }
        let text = line.trim_end_matches(['\n', '\r']);
        if text == end_marker {
            finished = true;
            break;
        }
        if let Some(code) = text.strip_prefix(exit_marker.as_str()) {
            exit_code = code.trim().parse().ok();
            continue;
        }
        stdout.push(text.to_string());
    }

    let mut stderr = Vec::new();
    if finished {
        while let Ok(line) = shell.stderr.recv() {
            if line == end_marker {
                break;
            }
            stderr.push(line);
        }
    } else {
        stderr.extend(shell.stderr.try_iter());
    }
    let result = CommandResult {
        stdout: stdout.join("\n").trim().to_string(),
        stderr: stderr.join("\n").trim().to_string(),
        exit_code,
    };
    Ok((result, finished))
}
