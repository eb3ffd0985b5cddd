//! Contains the privileged command executor that runs `sh -c` through a broker.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{ChildStdin, Stdio};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};
use crate::broker::{BrokerCapabilities, PrivilegeBroker};
use crate::error::ExecError;

/// Size of the chunks payload files are streamed to a process's stdin in.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Captured result of one privileged command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Standard output, or standard error when nothing was printed on stdout.
    pub fn output(&self) -> &str {
        if self.stdout.is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub trait CommandExecutor: Send + Sync {
    /// Runs `command` and collects its output.
    fn execute(&self, command: &str) -> Result<CommandResult, ExecError>;
    /// Runs `command`, streaming the contents of `input` to its stdin first.
    fn execute_with_input(&self, command: &str, input: &Path) -> Result<CommandResult, ExecError>;
    fn capabilities(&self) -> BrokerCapabilities;
}

pub struct PrivilegedExecutor {
    broker: Arc<dyn PrivilegeBroker>,
}

impl PrivilegedExecutor {
    pub fn new(broker: Arc<dyn PrivilegeBroker>) -> Self {
        Self { broker }
    }

    fn run(&self, command: &str, input: Option<&Path>) -> Result<CommandResult, ExecError> {
        debug!("[{}] sh -c {}", self.broker.name(), command);
        let mut child = self
            .broker
            .command(&["sh", "-c", command])
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::new(command, e.to_string()))?;

        // both pipes drain while stdin is being fed, otherwise a chatty
        // process can block on a full pipe before reading its input
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain(stdout));
        let stderr_reader = thread::spawn(move || drain(stderr));

        let fed = match (input, child.stdin.take()) {
            (Some(path), Some(stdin)) => stream_file(path, stdin).map(Some),
            _ => Ok(None),
        };
        let status = child.wait().map_err(|e| ExecError::new(command, e.to_string()))?;
        let stdout = join_reader(command, stdout_reader)?;
        let stderr = join_reader(command, stderr_reader)?;
        let result = CommandResult {
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
            exit_code: status.code(),
        };
        match fed {
            Ok(Some(bytes)) => trace!("streamed {} bytes to stdin", bytes),
            Ok(None) => {}
            Err(e) => {
                let message = match result.output() {
                    "" => e.to_string(),
                    out => format!("{} ({})", e, out),
                };
                return Err(ExecError::new(command, message));
            }
        }
        trace!("exit {:?}: {}", result.exit_code, result.output());
        Ok(result)
    }
}

impl CommandExecutor for PrivilegedExecutor {
    fn execute(&self, command: &str) -> Result<CommandResult, ExecError> {
        self.run(command, None)
    }

    fn execute_with_input(&self, command: &str, input: &Path) -> Result<CommandResult, ExecError> {
        self.run(command, Some(input))
    }

    fn capabilities(&self) -> BrokerCapabilities {
        self.broker.capabilities()
    }
}

fn drain<R: Read>(pipe: Option<R>) -> io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn join_reader(command: &str, handle: thread::JoinHandle<io::Result<String>>) -> Result<String, ExecError> {
    handle
        .join()
        .map_err(|_| ExecError::new(command, "output reader panicked"))?
        .map_err(|e| ExecError::new(command, e.to_string()))
}

/// Copies `path` into the child's stdin in [`CHUNK_SIZE`] pieces, then
/// closes it.
fn stream_file(path: &Path, mut stdin: ChildStdin) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        stdin.write_all(&buf[..read])?;
        total += read as u64;
    }
    stdin.flush()?;
    Ok(total)
}
