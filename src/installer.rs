//! Contains the install session orchestrator: create, write each APK, commit.
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::broker::BrokerCapabilities;
use crate::bundle::{self, BundleEntry, PackageFormat};
use crate::error::{InstallError, Phase, Result};
use crate::executor::{CommandExecutor, CommandResult};
use crate::session::{self, WriteSource};

/// Name single APKs are written into the session under.
pub const BASE_APK_NAME: &str = "base.apk";
pub const DEFAULT_STAGING_DIR: &str = "/data/local/tmp";
const STAGING_PREFIX: &str = "xinstall";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPayload {
    Single(PathBuf),
    Bundle(Vec<BundleEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallOptions {
    pub replace_existing: bool,
    pub grant_permissions: bool,
    pub user: Option<u32>,
    /// Package name passed to `pm install-create -i`
    pub installer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub payload: InstallPayload,
    pub options: InstallOptions,
}

/// How APK payloads reach `pm install-write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Stream through the process's stdin (`-`)
    Stream,
    /// Hand `pm` the file's own path
    DirectPath,
    /// Copy to the staging directory first, then hand `pm` that path
    Staged,
}

impl WriteMode {
    pub fn negotiate(capabilities: &BrokerCapabilities, stage: bool) -> Self {
        if stage {
            WriteMode::Staged
        } else if capabilities.reads_host_paths {
            WriteMode::DirectPath
        } else {
            WriteMode::Stream
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WriteMode::Stream => "stdin stream",
            WriteMode::DirectPath => "direct path",
            WriteMode::Staged => "staged copy",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Extracting,
    Extracted(usize),
    CreatingSession(String),
    SessionCreated(String),
    Writing { index: usize, total: usize, name: String },
    Committing,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Extracting => write!(f, "Extracting bundle..."),
            Progress::Extracted(count) => write!(f, "Extracted {} APK(s)", count),
            Progress::CreatingSession(cmd) => write!(f, "Creating install session: {}", cmd),
            Progress::SessionCreated(id) => write!(f, "Session ID: {}", id),
            Progress::Writing { index, total, name } => write!(f, "Writing APK {}/{}: {}", index, total, name),
            Progress::Committing => write!(f, "Committing install..."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub session_id: String,
    pub apk_count: usize,
    pub message: String,
}

/// Where a [`Session`] is in the create, write, commit sequence. States only
/// move forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created(String),
    Writing { id: String, index: usize },
    Committing(String),
    Succeeded,
    Failed,
}

/// A package manager session between `install-create` and `install-commit`.
/// Committing or abandoning consumes it, so an ID is never used again.
pub struct Session<'a, E: CommandExecutor + ?Sized> {
    executor: &'a E,
    id: String,
    written: usize,
    state: SessionState,
}

impl<'a, E: CommandExecutor + ?Sized> Session<'a, E> {
    pub fn create(executor: &'a E, options: &InstallOptions) -> Result<Self> {
        let cmd = session::create_command(
            options.replace_existing,
            options.grant_permissions,
            options.user,
            options.installer.as_deref(),
        );
        let result = executor.execute(&cmd)?;
        let id = session::parse_session_id(result.output()).ok_or_else(|| InstallError::Protocol {
            phase: Phase::Create,
            output: result.output().to_string(),
        })?;
        info!("created install session {}", id);
        let state = SessionState::Created(id.clone());
        Ok(Self { executor, id, written: 0, state })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Writes one payload. `input` is streamed to stdin when `source` is
    /// [`WriteSource::Stdin`].
    pub fn write(&mut self, name: &str, size: u64, source: &WriteSource, input: &Path) -> Result<()> {
        let cmd = session::write_command(size, &self.id, name, source);
        let result = match source {
            WriteSource::Stdin => self.executor.execute_with_input(&cmd, input)?,
            WriteSource::Path(_) => self.executor.execute(&cmd)?,
        };
        if !session::is_phase_success(result.output()) {
            self.transition(SessionState::Failed);
            return Err(InstallError::Protocol {
                phase: Phase::Write { name: name.to_string() },
                output: result.output().to_string(),
            });
        }
        self.written += 1;
        self.transition(SessionState::Writing { id: self.id.clone(), index: self.written });
        debug!("session {}: wrote {} ({} bytes)", self.id, name, size);
        Ok(())
    }

    pub fn commit(mut self) -> Result<String> {
        self.transition(SessionState::Committing(self.id.clone()));
        let result = self.executor.execute(&session::commit_command(&self.id))?;
        if session::is_commit_success(result.output()) {
            self.transition(SessionState::Succeeded);
            info!("session {} committed ({} APKs)", self.id, self.written);
            Ok(result.output().to_string())
        } else {
            self.transition(SessionState::Failed);
            Err(InstallError::Protocol { phase: Phase::Commit, output: result.output().to_string() })
        }
    }

    /// Best-effort release of the device-side session after a failed write.
    pub fn abandon(mut self) {
        self.transition(SessionState::Failed);
        match self.executor.execute(&session::abandon_command(&self.id)) {
            Ok(result) => debug!("abandoned session {}: {}", self.id, result.output()),
            Err(e) => warn!("could not abandon session {}: {}", self.id, e),
        }
    }
}

struct Payload<'p> {
    name: &'p str,
    size: u64,
    path: &'p Path,
}

pub struct Installer<E: CommandExecutor> {
    executor: E,
    write_mode: WriteMode,
    staging_dir: PathBuf,
}

impl<E: CommandExecutor> Installer<E> {
    pub fn new(executor: E) -> Self {
        let write_mode = WriteMode::negotiate(&executor.capabilities(), false);
        Self { executor, write_mode, staging_dir: PathBuf::from(DEFAULT_STAGING_DIR) }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Drives one session for `request`. The first failing phase ends the
    /// attempt; nothing is retried.
    pub fn run(&self, request: &InstallRequest, progress: &mut dyn FnMut(Progress)) -> Result<InstallReport> {
        let payloads: Vec<Payload<'_>> = match &request.payload {
            InstallPayload::Single(path) => {
                let size = fs::metadata(path)
                    .map_err(|e| InstallError::io(format!("failed to read {}", path.display()), e))?
                    .len();
                vec![Payload { name: BASE_APK_NAME, size, path: path.as_path() }]
            }
            InstallPayload::Bundle(entries) => entries
                .iter()
                .map(|e| Payload { name: &e.name, size: e.size, path: &e.path })
                .collect(),
        };

        progress(Progress::CreatingSession(session::create_command(
            request.options.replace_existing,
            request.options.grant_permissions,
            request.options.user,
            request.options.installer.as_deref(),
        )));
        let mut session = Session::create(&self.executor, &request.options)?;
        progress(Progress::SessionCreated(session.id().to_string()));

        let total = payloads.len();
        for (i, payload) in payloads.iter().enumerate() {
            progress(Progress::Writing { index: i + 1, total, name: payload.name.to_string() });
            if let Err(e) = self.write_payload(&mut session, payload) {
                session.abandon();
                return Err(e);
            }
        }

        progress(Progress::Committing);
        let session_id = session.id().to_string();
        session.commit()?;
        let message = match request.payload {
            InstallPayload::Single(_) => "Installation succeeded".to_string(),
            InstallPayload::Bundle(_) => format!("Installed {} APKs", total),
        };
        Ok(InstallReport { session_id, apk_count: total, message })
    }

    fn write_payload(&self, session: &mut Session<'_, E>, payload: &Payload<'_>) -> Result<()> {
        match self.write_mode {
            WriteMode::Stream => session.write(payload.name, payload.size, &WriteSource::Stdin, payload.path),
            WriteMode::DirectPath => {
                let source = WriteSource::Path(absolute(payload.path));
                session.write(payload.name, payload.size, &source, payload.path)
            }
            WriteMode::Staged => {
                let staged = staging_path(&self.staging_dir, payload.name);
                let copied = self.stage(&staged, payload.path);
                let written = copied.and_then(|()| {
                    session.write(payload.name, payload.size, &WriteSource::Path(staged.clone()), payload.path)
                });
                if let Err(e) = self.executor.execute(&session::remove_command(&staged)) {
                    warn!("could not remove staged copy {}: {}", staged.display(), e);
                }
                written
            }
        }
    }

    fn stage(&self, staged: &Path, source: &Path) -> Result<()> {
        debug!("staging {} at {}", source.display(), staged.display());
        let result: CommandResult = self.executor.execute_with_input(&session::stage_command(staged), source)?;
        if result.success() {
            Ok(())
        } else {
            Err(InstallError::io(
                format!("failed to stage {}", staged.display()),
                std::io::Error::new(std::io::ErrorKind::Other, result.output().to_string()),
            ))
        }
    }

    /// Installs `path`, extracting it first when it is a bundle. Extracted
    /// files are removed whatever the outcome.
    pub fn install_file(
        &self,
        path: &Path,
        options: &InstallOptions,
        cache_dir: &Path,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<InstallReport> {
        if !path.is_file() {
            return Err(InstallError::NotFound(path.to_path_buf()));
        }
        let format = PackageFormat::detect(path);
        info!("installing {} as {}", path.display(), format.description());
        if !format.is_bundle() {
            let request = InstallRequest { payload: InstallPayload::Single(path.to_path_buf()), options: options.clone() };
            return self.run(&request, progress);
        }
        progress(Progress::Extracting);
        let mut extracted = bundle::extract(path, cache_dir)?;
        progress(Progress::Extracted(extracted.len()));
        let request = InstallRequest {
            payload: InstallPayload::Bundle(extracted.entries().to_vec()),
            options: options.clone(),
        };
        let outcome = self.run(&request, progress);
        extracted.cleanup();
        outcome
    }
}

/// `<dir>/xinstall_<unix-ms>_<name>`
pub fn staging_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}_{}_{}", STAGING_PREFIX, chrono::Utc::now().timestamp_millis(), name))
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// A running install. Progress arrives on `progress` until the sequence
/// finishes; `outcome` then resolves to the single result.
pub struct InstallTask {
    pub progress: mpsc::UnboundedReceiver<Progress>,
    pub outcome: JoinHandle<Result<InstallReport>>,
}

impl InstallTask {
    /// Feeds every progress event to `on_progress`, then returns the outcome.
    pub async fn finish(mut self, mut on_progress: impl FnMut(Progress)) -> Result<InstallReport> {
        while let Some(event) = self.progress.recv().await {
            on_progress(event);
        }
        self.outcome.await.map_err(|e| InstallError::Aborted(e.to_string()))?
    }
}

/// Runs [`Installer::install_file`] on a blocking worker.
pub fn spawn_install<E: CommandExecutor + 'static>(
    installer: Arc<Installer<E>>,
    path: PathBuf,
    options: InstallOptions,
    cache_dir: PathBuf,
) -> InstallTask {
    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = tokio::task::spawn_blocking(move || {
        installer.install_file(&path, &options, &cache_dir, &mut |event| {
            // the receiver may have been dropped; the install carries on
            let _ = tx.send(event);
        })
    });
    InstallTask { progress: rx, outcome }
}
