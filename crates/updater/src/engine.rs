use crate::{
    cdn::CdnResolver,
    config::{InstallLayout, UpdaterConfig},
    error::{Result, UpdateError},
    fetcher::{CdnFetcher, HttpCdnClient},
    inspect::inspect,
    manifest::FileAction,
    plan::{plan, OnDiskFiles, PlannedEntry, UpdatePlan},
    progress::{CancellationToken, ProgressEvent, ProgressSink},
    space::{Fs2SpaceProbe, SpaceProbe, SpaceVerifier},
};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{debug, info, warn};

/// Where a run currently is. Runs only ever move forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    Cleaning,
    ResolvingCdn,
    FetchingManifest,
    Planning,
    VerifyingSpace,
    Applying,
    Succeeded,
    Failed,
    Cancelled,
}

impl Stage {
    fn describe(&self) -> &'static str {
        match self {
            Stage::Idle => "Idle",
            Stage::Cleaning => "Cleaning up previous run...",
            Stage::ResolvingCdn => "Looking for the update server...",
            Stage::FetchingManifest => "Fetching latest version info...",
            Stage::Planning => "Checking installed files...",
            Stage::VerifyingSpace => "Checking free space...",
            Stage::Applying => "Downloading and applying update...",
            Stage::Succeeded => "Finished",
            Stage::Failed => "Failed",
            Stage::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed | Stage::Cancelled)
    }
}

/// Terminal result of [`UpdateEngine::start`].
#[derive(Debug)]
pub enum RunOutcome {
    /// The installation now matches this version.
    Succeeded { version: String },
    /// The run stopped on the first error; the card keeps what was already applied.
    Failed(UpdateError),
    /// `stop` was honoured; the card keeps what was already applied.
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}

/// Why the pipeline left the happy path.
enum Halt {
    Cancelled,
    Failed(UpdateError),
}

impl From<UpdateError> for Halt {
    fn from(err: UpdateError) -> Self {
        Halt::Failed(err)
    }
}

/// Drives one install or update of a target root.
pub struct UpdateEngine {
    is_install: bool,
    base_dir: Option<PathBuf>,
    config: UpdaterConfig,
    fetcher: Option<Arc<dyn CdnFetcher>>,
    space_probe: Arc<dyn SpaceProbe>,
    sink: Option<ProgressSink>,
    token: CancellationToken,
    stage: Stage,
    history: Vec<Stage>,
}

impl UpdateEngine {
    /// `is_install` wipes the existing installation (save data excepted)
    /// before writing; otherwise only outdated files are touched.
    pub fn new(is_install: bool) -> Self {
        Self {
            is_install,
            base_dir: None,
            config: UpdaterConfig::default(),
            fetcher: None,
            space_probe: Arc::new(Fs2SpaceProbe),
            sink: None,
            token: CancellationToken::new(),
            stage: Stage::Idle,
            history: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: UpdaterConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of the default HTTP client.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn CdnFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = probe;
        self
    }

    /// Root of the removable storage to install to.
    pub fn set_base_directory(&mut self, path: impl Into<PathBuf>) {
        self.base_dir = Some(path.into());
    }

    /// Sink for every progress event of the run.
    pub fn set_log_function<F>(&mut self, sink: F)
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        self.sink = Some(Arc::new(sink));
    }

    /// Request cancellation. Safe before, during and after `start`.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Handle for stopping the run from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far, in order.
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    /// Run the pipeline to a terminal state.
    pub async fn start(&mut self) -> RunOutcome {
        let outcome = match self.base_dir.clone() {
            None => Err(Halt::Failed(UpdateError::NoBaseDirectory)),
            Some(root) => match RootGuard::acquire(&root) {
                Ok(_guard) => self.run(&root).await,
                Err(err) => Err(Halt::Failed(err)),
            },
        };

        match outcome {
            Ok(version) => {
                self.finish(Stage::Succeeded);
                info!(%version, "update finished");
                RunOutcome::Succeeded { version }
            }
            Err(Halt::Cancelled) => {
                self.finish(Stage::Cancelled);
                info!("update cancelled");
                RunOutcome::Cancelled
            }
            Err(Halt::Failed(err)) => {
                self.finish(Stage::Failed);
                warn!(error = %err, "update failed");
                RunOutcome::Failed(err)
            }
        }
    }

    async fn run(&mut self, root: &Path) -> std::result::Result<String, Halt> {
        let layout = self.config.layout(root);
        let fetcher: Arc<dyn CdnFetcher> = match &self.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(HttpCdnClient::builder().build()?),
        };
        let resolver = CdnResolver::new(fetcher, &self.config);

        self.enter(Stage::Cleaning)?;
        self.clean(&layout)?;

        self.enter(Stage::ResolvingCdn)?;
        let base = self.until_stopped(resolver.resolve_base_url()).await?;

        self.enter(Stage::FetchingManifest)?;
        let manifest = self.until_stopped(resolver.fetch_manifest(&base)).await?;

        self.enter(Stage::Planning)?;
        let state = inspect(root, &self.config)?;
        debug!(?state, "installation state before planning");
        let on_disk = if self.is_install {
            OnDiskFiles::new()
        } else {
            OnDiskFiles::scan(&layout, &manifest)?
        };
        let plan = plan(state, &on_disk, &manifest, &layout);
        info!(
            entries = plan.len(),
            incoming = plan.incoming_bytes,
            removed = plan.removed_bytes,
            delta = plan.byte_delta(),
            "planned update to {}",
            plan.version
        );

        self.enter(Stage::VerifyingSpace)?;
        SpaceVerifier::new(self.space_probe.as_ref(), self.config.space_reserve_bytes)
            .verify(&plan, root)?;

        self.enter(Stage::Applying)?;
        self.apply(&resolver, &base, &plan, &layout).await?;
        Ok(plan.version)
    }

    fn enter(&mut self, stage: Stage) -> std::result::Result<(), Halt> {
        if self.token.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        debug!(?stage, "entering stage");
        self.stage = stage;
        self.history.push(stage);
        self.emit(ProgressEvent::message(stage.describe()));
        Ok(())
    }

    /// Await a network call, giving up as soon as the run is stopped.
    async fn until_stopped<T>(
        &self,
        call: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, Halt> {
        tokio::select! {
            biased;
            result = call => result.map_err(Halt::from),
            _ = self.token.cancelled() => Err(Halt::Cancelled),
        }
    }

    fn finish(&mut self, stage: Stage) {
        debug_assert!(stage.is_terminal());
        self.stage = stage;
        self.history.push(stage);
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    /// Remove leftovers of an interrupted run. A fresh install also clears
    /// everything in the installation directory except the save data.
    fn clean(&self, layout: &InstallLayout) -> Result<()> {
        remove_dir_if_exists(&layout.staging)?;
        if !self.is_install {
            return Ok(());
        }

        match fs::symlink_metadata(&layout.install) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return fs::remove_file(&layout.install)
                    .map_err(|err| UpdateError::fs(&layout.install, err))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(UpdateError::fs(&layout.install, err)),
        }

        let entries =
            fs::read_dir(&layout.install).map_err(|err| UpdateError::fs(&layout.install, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| UpdateError::fs(&layout.install, err))?;
            let path = entry.path();
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| layout.is_save_name(name))
            {
                continue;
            }
            let file_type = entry
                .file_type()
                .map_err(|err| UpdateError::fs(&path, err))?;
            let removed = if file_type.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|err| UpdateError::fs(&path, err))?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        resolver: &CdnResolver,
        base: &Url,
        plan: &UpdatePlan,
        layout: &InstallLayout,
    ) -> std::result::Result<(), Halt> {
        for dir in [&layout.config, &layout.staging] {
            fs::create_dir_all(dir).map_err(|err| UpdateError::fs(dir, err))?;
        }
        fs::write(layout.pending_file(), plan.version.as_bytes())
            .map_err(|err| UpdateError::fs(layout.pending_file(), err))?;

        if plan.is_empty() {
            self.emit(ProgressEvent::message("Already up to date"));
        }

        let total = plan.len() as u64;
        for (index, entry) in plan.entries.iter().enumerate() {
            // Checked between files so a write is never cut in half.
            if self.token.is_cancelled() {
                info!(done = index, total, "stopping before next file");
                return Err(Halt::Cancelled);
            }
            self.apply_entry(resolver, base, entry, layout).await?;
            self.emit(ProgressEvent::Progress {
                current: index as u64 + 1,
                total,
            });
        }

        write_staged(
            plan.version.clone().into_bytes(),
            layout.version_file(),
            layout.staging.clone(),
        )
        .await?;
        remove_file_if_exists(&layout.pending_file())?;
        remove_file_if_exists(&layout.reinstall_flag())?;
        remove_dir_if_exists(&layout.staging)?;
        Ok(())
    }

    async fn apply_entry(
        &self,
        resolver: &CdnResolver,
        base: &Url,
        entry: &PlannedEntry,
        layout: &InstallLayout,
    ) -> std::result::Result<(), Halt> {
        let target = layout.target(&entry.path);
        if entry.action == FileAction::Remove {
            debug!(path = %entry.path, "removing");
            return Ok(remove_file_if_exists(&target)?);
        }

        self.emit(ProgressEvent::message(format!("Downloading {}", entry.path)));
        let bytes = self
            .until_stopped(resolver.fetch_file(base, &entry.path))
            .await?;
        verify_payload(entry, &bytes)?;
        // Once downloaded and verified, the file is always promoted.
        write_staged(bytes, target, layout.staging.clone()).await?;
        Ok(())
    }
}

fn verify_payload(entry: &PlannedEntry, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 != entry.size {
        return Err(UpdateError::Integrity {
            path: entry.path.clone(),
            expected: format!("{} bytes", entry.size),
            actual: format!("{} bytes", bytes.len()),
        });
    }
    let actual = hex::encode(Sha256::digest(bytes));
    if let Some(expected) = &entry.sha256 {
        if &actual != expected {
            return Err(UpdateError::Integrity {
                path: entry.path.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

/// Write `bytes` into the staging area, then rename over `target`.
async fn write_staged(bytes: Vec<u8>, target: PathBuf, staging: PathBuf) -> Result<()> {
    let join_target = target.clone();
    task::spawn_blocking(move || persist_payload(&bytes, &target, &staging))
        .await
        .map_err(|err| {
            UpdateError::fs(
                join_target,
                std::io::Error::new(ErrorKind::Other, format!("task join error: {err}")),
            )
        })?
}

fn persist_payload(bytes: &[u8], target: &Path, staging: &Path) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| UpdateError::fs(target, ErrorKind::InvalidInput.into()))?;
    fs::create_dir_all(parent).map_err(|err| UpdateError::fs(parent, err))?;
    fs::create_dir_all(staging).map_err(|err| UpdateError::fs(staging, err))?;

    let mut temp = NamedTempFile::new_in(staging).map_err(|err| UpdateError::fs(staging, err))?;
    if let Err(err) = write_synced(&mut temp, bytes) {
        return Err(UpdateError::fs(temp.path(), err));
    }
    temp.persist(target)
        .map_err(|err| UpdateError::fs(target, err.error))?;
    Ok(())
}

fn write_synced(temp: &mut NamedTempFile, bytes: &[u8]) -> std::io::Result<()> {
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(UpdateError::fs(path, err)),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(UpdateError::fs(path, err)),
    }
}

fn active_roots() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(Default::default)
}

/// Marks a root as busy for the lifetime of a run.
struct RootGuard {
    root: PathBuf,
}

impl RootGuard {
    fn acquire(root: &Path) -> Result<Self> {
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let mut active = active_roots().lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(root.clone()) {
            return Err(UpdateError::AlreadyRunning(root));
        }
        Ok(Self { root })
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        active_roots()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.root);
    }
}
