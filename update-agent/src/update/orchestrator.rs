//! The update cycle state machine.
//!
//! One cycle walks `Idle → CheckingForUpdate → Downloading → Verifying →
//! BackingUp → Applying → RestartPending`. Failures before `Applying` return
//! to `Idle` without touching the installation. A failed apply goes through
//! `RollingBack`; only a failed restore reaches the terminal `Failed` state.
//!
//! Every error is handled at the state where it happens: nothing escapes
//! [`Orchestrator::run_cycle`].

use super::apply;
use super::backup::{BackupManager, BackupSnapshot};
use super::manifest::is_newer;
use super::source::UpdateSource;
use super::state::{InstallGuard, InstallationState, UpdateState};
use super::verify::verify;
use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The manifest offers nothing newer
    UpToDate { current: String, available: String },
    /// Stopped before the installation was touched
    Aborted {
        state: UpdateState,
        target: Option<String>,
        error: AgentError,
    },
    /// Apply failed and the backup was restored
    RolledBack { target: String, error: AgentError },
    /// New version installed; the process must restart
    RestartPending { from: String, to: String },
    /// Restore failed; the installation is in an unknown state
    Failed { target: String, error: AgentError },
    /// Another cycle is in flight
    Busy,
    /// A previous cycle ended in `state`, which no cycle leaves
    Halted { state: UpdateState },
}

impl CycleOutcome {
    /// Orchestrator state once this outcome is reached
    pub fn final_state(&self) -> UpdateState {
        match self {
            Self::RestartPending { .. } => UpdateState::RestartPending,
            Self::Failed { .. } => UpdateState::Failed,
            Self::Halted { state } => *state,
            // Busy changed nothing
            _ => UpdateState::Idle,
        }
    }

    pub fn summary(&self) -> OutcomeSummary {
        let (outcome, target, error) = match self {
            Self::UpToDate { available, .. } => ("up_to_date", Some(available.clone()), None),
            Self::Aborted { target, error, .. } => ("aborted", target.clone(), Some(error)),
            Self::RolledBack { target, error } => ("rolled_back", Some(target.clone()), Some(error)),
            Self::RestartPending { to, .. } => ("restart_pending", Some(to.clone()), None),
            Self::Failed { target, error } => ("failed", Some(target.clone()), Some(error)),
            Self::Busy => ("busy", None, None),
            Self::Halted { .. } => ("halted", None, None),
        };

        OutcomeSummary {
            outcome,
            target,
            error_kind: error.map(AgentError::kind),
            detail: error.map(ToString::to_string),
            finished_at: Utc::now(),
        }
    }
}

/// Serializable record of the last finished cycle
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSummary {
    pub outcome: &'static str,
    pub target: Option<String>,
    pub error_kind: Option<&'static str>,
    pub detail: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Read-only view of the orchestrator shared with the status API.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    state: watch::Receiver<UpdateState>,
    installation: Arc<RwLock<InstallationState>>,
    last_outcome: Arc<Mutex<Option<OutcomeSummary>>>,
    in_flight: Arc<AtomicBool>,
    trigger: Arc<Notify>,
}

impl StatusHandle {
    pub fn state(&self) -> UpdateState {
        *self.state.borrow()
    }

    pub async fn installation(&self) -> InstallationState {
        self.installation.read().await.clone()
    }

    pub fn last_outcome(&self) -> Option<OutcomeSummary> {
        self.last_outcome.lock().ok().and_then(|last| last.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Ask the poller for an immediate cycle. Returns false when one is already running.
    pub fn request_check(&self) -> bool {
        if self.is_busy() || self.state().is_terminal() {
            return false;
        }
        self.trigger.notify_one();
        true
    }
}

/// Removes the staged artifact when the attempt ends, whatever the outcome.
struct StagedArtifact {
    path: PathBuf,
}

impl StagedArtifact {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed staged artifact {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staged artifact {}: {}", self.path.display(), e),
        }
    }
}

/// Drives update cycles for one installation.
pub struct Orchestrator<S> {
    source: S,
    backups: BackupManager,
    temp_dir: PathBuf,
    state_file: Option<PathBuf>,
    installation: Arc<RwLock<InstallationState>>,
    guard: InstallGuard,
    state_tx: watch::Sender<UpdateState>,
    last_outcome: Arc<Mutex<Option<OutcomeSummary>>>,
    in_flight: Arc<AtomicBool>,
    trigger: Arc<Notify>,
    #[cfg(test)]
    after_backup: Option<fn(&BackupSnapshot)>,
}

impl<S: UpdateSource> Orchestrator<S> {
    pub fn new(
        source: S,
        installation: InstallationState,
        backups: BackupManager,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        let (state_tx, _) = watch::channel(UpdateState::Idle);

        Self {
            source,
            backups,
            temp_dir: temp_dir.into(),
            state_file: None,
            installation: Arc::new(RwLock::new(installation)),
            guard: InstallGuard::new(),
            state_tx,
            last_outcome: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Notify::new()),
            #[cfg(test)]
            after_backup: None,
        }
    }

    /// Persist the installed version here after a successful apply
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Share an existing guard with application code
    pub fn with_guard(mut self, guard: InstallGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn guard(&self) -> InstallGuard {
        self.guard.clone()
    }

    pub fn state(&self) -> UpdateState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state_tx.subscribe()
    }

    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    pub fn status(&self) -> StatusHandle {
        StatusHandle {
            state: self.state_tx.subscribe(),
            installation: self.installation.clone(),
            last_outcome: self.last_outcome.clone(),
            in_flight: self.in_flight.clone(),
            trigger: self.trigger.clone(),
        }
    }

    pub async fn installation(&self) -> InstallationState {
        self.installation.read().await.clone()
    }

    /// Log a leftover backup slot from an earlier attempt
    pub fn report_previous_backup(&self) {
        match self.backups.latest() {
            Ok(Some(snapshot)) => info!(
                version = %snapshot.version,
                created_at = %snapshot.created_at,
                "Backup slot from a previous attempt present; the next update overwrites it"
            ),
            Ok(None) => {}
            Err(e) => warn!("Unreadable backup record, it will be replaced: {}", e),
        }
    }

    /// Run one full update cycle.
    ///
    /// Returns `Busy` without side effects when a cycle is already in flight,
    /// and `Halted` once a cycle has reached `RestartPending` or `Failed`.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let state = self.state();
        if state.is_terminal() {
            return CycleOutcome::Halted { state };
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Update cycle already in flight, skipping");
            return CycleOutcome::Busy;
        }

        let span = info_span!("update_cycle", attempt = %Uuid::new_v4());
        let outcome = self.cycle().instrument(span).await;

        if let Ok(mut last) = self.last_outcome.lock() {
            *last = Some(outcome.summary());
        }
        self.in_flight.store(false, Ordering::Release);

        outcome
    }

    fn transition(&self, to: UpdateState) {
        let from = self.state_tx.send_replace(to);
        info!(from = %from, to = %to, critical = to.is_critical(), "State transition");
    }

    async fn cycle(&self) -> CycleOutcome {
        self.transition(UpdateState::CheckingForUpdate);

        let (current, root) = {
            let installation = self.installation.read().await;
            (installation.current_version.clone(), installation.root.clone())
        };

        // The manifest read here is the one this attempt commits to
        let manifest = match self.source.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(error) => {
                warn!(state = %UpdateState::CheckingForUpdate, error = %error, "Update check failed, retrying next interval");
                return self.abort(UpdateState::CheckingForUpdate, None, error);
            }
        };

        match is_newer(&manifest.version, &current) {
            Ok(true) => {}
            Ok(false) => {
                info!(current = %current, available = %manifest.version, "No update available");
                self.transition(UpdateState::Idle);
                return CycleOutcome::UpToDate {
                    current,
                    available: manifest.version,
                };
            }
            Err(error) => {
                warn!(current = %current, available = %manifest.version, error = %error, "Unusable version in manifest, treating as no update");
                return self.abort(UpdateState::CheckingForUpdate, Some(manifest.version), error);
            }
        }

        let target = manifest.version.clone();
        info!(from = %current, to = %target, "Update available");

        self.transition(UpdateState::Downloading);
        if let Err(e) = tokio::fs::create_dir_all(&self.temp_dir).await {
            let error = AgentError::file_system("failed to create download directory", e);
            error!(version = %target, state = %UpdateState::Downloading, error = %error, "Download failed");
            return self.abort(UpdateState::Downloading, Some(target), error);
        }

        let artifact = StagedArtifact {
            path: self.temp_dir.join(format!("update-{target}.zip")),
        };
        if let Err(error) = self.source.download(&manifest, artifact.path()).await {
            error!(version = %target, state = %UpdateState::Downloading, error = %error, "Download failed, retrying next interval");
            return self.abort(UpdateState::Downloading, Some(target), error);
        }

        self.transition(UpdateState::Verifying);
        let bytes = match tokio::fs::read(artifact.path()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let error = AgentError::file_system("failed to read downloaded artifact", e);
                error!(version = %target, state = %UpdateState::Verifying, error = %error, "Verification failed");
                return self.abort(UpdateState::Verifying, Some(target), error);
            }
        };

        if let Err(error) = verify(&bytes, &manifest.checksum) {
            error!(version = %target, state = %UpdateState::Verifying, error = %error, "Checksum mismatch, discarding artifact");
            return self.abort(UpdateState::Verifying, Some(target), error);
        }
        if manifest.size.is_some_and(|size| size != bytes.len() as u64) {
            warn!(version = %target, "Manifest size disagrees with the verified artifact");
        }
        info!(version = %target, bytes = bytes.len(), "Artifact verified");

        // Critical section over the installation root
        let _root_guard = self.guard.write().await;

        self.transition(UpdateState::BackingUp);
        let snapshot = {
            let backups = self.backups.clone();
            let root = root.clone();
            let version = current.clone();
            match blocking(move || backups.create_backup(&root, &version)).await {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    error!(version = %target, state = %UpdateState::BackingUp, error = %error, "Backup failed, update aborted before any change");
                    return self.abort(UpdateState::BackingUp, Some(target), error);
                }
            }
        };

        #[cfg(test)]
        {
            if let Some(hook) = self.after_backup {
                hook(&snapshot);
            }
        }

        self.transition(UpdateState::Applying);
        let apply_root = root.clone();
        let applied = blocking(move || apply::apply(&bytes, &apply_root))
            .await
            .and_then(|summary| {
                debug!(files = summary.files, "Apply finished");
                self.persist_version(&root, &target)
            });

        match applied {
            Ok(()) => self.commit(&current, &target).await,
            Err(apply_error) => {
                error!(version = %target, state = %UpdateState::Applying, error = %apply_error, "Apply failed, rolling back");
                self.roll_back(snapshot, target, apply_error).await
            }
        }
    }

    /// Record `version` for the next process. Part of applying: files and record change together.
    fn persist_version(&self, root: &Path, version: &str) -> Result<()> {
        match &self.state_file {
            Some(state_file) => InstallationState::new(version, root).persist(state_file),
            None => Ok(()),
        }
    }

    /// Publish the new version. Runs only after apply and persist succeeded.
    async fn commit(&self, from: &str, to: &str) -> CycleOutcome {
        self.installation.write().await.current_version = to.to_string();

        self.transition(UpdateState::RestartPending);
        info!(from = %from, to = %to, "Update applied, restart required");

        CycleOutcome::RestartPending {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    async fn roll_back(
        &self,
        snapshot: BackupSnapshot,
        target: String,
        apply_error: AgentError,
    ) -> CycleOutcome {
        self.transition(UpdateState::RollingBack);

        let backups = self.backups.clone();
        match blocking(move || backups.restore(&snapshot)).await {
            Ok(()) => {
                error!(version = %target, error = %apply_error, "Update failed, rolled back");
                self.transition(UpdateState::Idle);
                CycleOutcome::RolledBack {
                    target,
                    error: apply_error,
                }
            }
            Err(restore_error) => {
                error!(
                    version = %target,
                    apply_error = %apply_error,
                    error = %restore_error,
                    "Rollback failed, installation state unknown; operator intervention required"
                );
                self.transition(UpdateState::Failed);
                CycleOutcome::Failed {
                    target,
                    error: restore_error,
                }
            }
        }
    }

    fn abort(&self, state: UpdateState, target: Option<String>, error: AgentError) -> CycleOutcome {
        self.transition(UpdateState::Idle);
        CycleOutcome::Aborted {
            state,
            target,
            error,
        }
    }
}

/// Run blocking file system work off the async workers
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AgentError::Daemon(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::EntryKind;
    use crate::fs::relative_key;
    use crate::fs::walker::{walk_directory, WalkOptions};
    use crate::update::apply::tests::build_zip;
    use crate::update::manifest::Manifest;
    use crate::update::verify::sha256_hex;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// In-memory update server
    struct StaticSource {
        manifest: Result<Manifest>,
        artifact: Vec<u8>,
        fetches: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl StaticSource {
        fn serving(version: &str, artifact: Vec<u8>) -> Self {
            let manifest = Manifest {
                version: version.to_string(),
                checksum: sha256_hex(&artifact),
                download_url: None,
                size: Some(artifact.len() as u64),
                filename: None,
                timestamp: None,
                changelog: None,
            };
            Self {
                manifest: Ok(manifest),
                artifact,
                fetches: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            }
        }

        fn failing(error: AgentError) -> Self {
            Self {
                manifest: Err(error),
                artifact: Vec::new(),
                fetches: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            }
        }
    }

    impl UpdateSource for StaticSource {
        async fn fetch_manifest(&self) -> Result<Manifest> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match &self.manifest {
                Ok(manifest) => Ok(manifest.clone()),
                Err(error) => Err(AgentError::Network(error.to_string())),
            }
        }

        async fn download(&self, _manifest: &Manifest, dest: &Path) -> Result<u64> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, &self.artifact).await?;
            Ok(self.artifact.len() as u64)
        }
    }

    struct Fixture {
        temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().join("app");
            std::fs::create_dir_all(root.join("data")).unwrap();
            std::fs::write(root.join("program.bin"), b"program v1.0.15").unwrap();
            std::fs::write(root.join("config.toml"), b"level = 1\n").unwrap();
            std::fs::write(root.join("data/db.json"), b"{}").unwrap();
            Self { temp }
        }

        fn root(&self) -> PathBuf {
            self.temp.path().join("app")
        }

        fn backups_dir(&self) -> PathBuf {
            self.temp.path().join("backups")
        }

        fn orchestrator(&self, source: StaticSource) -> Orchestrator<StaticSource> {
            Orchestrator::new(
                source,
                InstallationState::new("1.0.15", self.root()),
                BackupManager::new(self.backups_dir(), vec![]),
                self.temp.path().join("temp"),
            )
            .with_state_file(self.temp.path().join("installed-version.json"))
        }

        fn tree(&self) -> BTreeMap<String, Vec<u8>> {
            walk_directory(&self.root(), &WalkOptions::default())
                .unwrap()
                .into_iter()
                .map(|info| {
                    let contents = match info.metadata.kind {
                        EntryKind::Dir => Vec::new(),
                        EntryKind::Symlink => std::fs::read_link(&info.path)
                            .unwrap()
                            .to_string_lossy()
                            .into_owned()
                            .into_bytes(),
                        EntryKind::File => std::fs::read(&info.path).unwrap(),
                    };
                    (relative_key(&info.relative_path), contents)
                })
                .collect()
        }

        fn temp_dir_is_empty(&self) -> bool {
            std::fs::read_dir(self.temp.path().join("temp"))
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
        }
    }

    fn good_package() -> Vec<u8> {
        build_zip(&[
            ("program.bin", "program v1.0.16"),
            ("plugins/", ""),
            ("plugins/extra.so", "plugin"),
        ])
    }

    #[tokio::test]
    async fn test_newer_version_ends_restart_pending() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", good_package()));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            &outcome,
            CycleOutcome::RestartPending { from, to } if from == "1.0.15" && to == "1.0.16"
        ));
        assert_eq!(orchestrator.state(), UpdateState::RestartPending);
        assert_eq!(orchestrator.installation().await.current_version, "1.0.16");
        assert_eq!(
            std::fs::read(fixture.root().join("program.bin")).unwrap(),
            b"program v1.0.16"
        );
        assert!(fixture.root().join("plugins/extra.so").exists());
        assert!(fixture.temp_dir_is_empty());

        let persisted = InstallationState::load(
            &fixture.temp.path().join("installed-version.json"),
            fixture.root(),
            "0.0.0",
        )
        .unwrap();
        assert_eq!(persisted.current_version, "1.0.16");
    }

    #[tokio::test]
    async fn test_no_further_cycles_after_restart_pending() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", good_package()));

        orchestrator.run_cycle().await;
        let second = orchestrator.run_cycle().await;

        assert!(matches!(
            second,
            CycleOutcome::Halted {
                state: UpdateState::RestartPending
            }
        ));
        assert_eq!(second.final_state(), UpdateState::RestartPending);
        assert_eq!(orchestrator.source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_version_only_fetches_manifest() {
        let fixture = Fixture::new();
        let before = fixture.tree();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.15", good_package()));

        for _ in 0..2 {
            let outcome = orchestrator.run_cycle().await;
            assert!(matches!(outcome, CycleOutcome::UpToDate { .. }));
            assert_eq!(outcome.final_state(), UpdateState::Idle);
        }

        assert_eq!(orchestrator.source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.source.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.tree(), before);
        assert!(!fixture.backups_dir().exists());
    }

    #[tokio::test]
    async fn test_older_manifest_is_not_an_update() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.9", good_package()));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::UpToDate { .. }));
        assert_eq!(orchestrator.source.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_root_untouched() {
        let fixture = Fixture::new();
        let before = fixture.tree();

        let mut source = StaticSource::serving("1.0.16", good_package());
        if let Ok(manifest) = &mut source.manifest {
            manifest.checksum = sha256_hex(b"some other package");
        }
        let orchestrator = fixture.orchestrator(source);

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            outcome,
            CycleOutcome::Aborted {
                state: UpdateState::Verifying,
                error: AgentError::ChecksumMismatch { .. },
                ..
            }
        ));
        assert_eq!(orchestrator.state(), UpdateState::Idle);
        assert_eq!(fixture.tree(), before);
        assert!(!fixture.backups_dir().exists());
        assert!(fixture.temp_dir_is_empty());
        assert_eq!(orchestrator.installation().await.current_version, "1.0.15");
    }

    #[tokio::test]
    async fn test_truncated_artifact_fails_verification() {
        let fixture = Fixture::new();
        let package = good_package();

        let mut source = StaticSource::serving("1.0.16", package.clone());
        source.artifact.truncate(package.len() / 2);
        let orchestrator = fixture.orchestrator(source);

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            outcome,
            CycleOutcome::Aborted {
                error: AgentError::ChecksumMismatch { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_manifest_fetch_failure_returns_to_idle() {
        let fixture = Fixture::new();
        let orchestrator =
            fixture.orchestrator(StaticSource::failing(AgentError::Network("timed out".into())));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            &outcome,
            CycleOutcome::Aborted { state: UpdateState::CheckingForUpdate, error, .. } if error.is_transient()
        ));
        assert_eq!(orchestrator.state(), UpdateState::Idle);
        assert_eq!(orchestrator.source.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_version_is_no_update() {
        let fixture = Fixture::new();
        let mut source = StaticSource::serving("1.0.16", good_package());
        if let Ok(manifest) = &mut source.manifest {
            manifest.version = "latest".to_string();
        }
        let orchestrator = fixture.orchestrator(source);

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            outcome,
            CycleOutcome::Aborted {
                error: AgentError::ManifestParse(_),
                ..
            }
        ));
        assert_eq!(orchestrator.source.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extraction_failure_rolls_back() {
        let fixture = Fixture::new();
        let before = fixture.tree();

        // Writes program.bin, adds a file, then fails replacing the data/ directory
        let package = build_zip(&[
            ("program.bin", "program v1.0.16"),
            ("new-file.txt", "added by update"),
            ("data", "a file where a directory lives"),
        ]);
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", package));
        let mut states = orchestrator.subscribe();

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            &outcome,
            CycleOutcome::RolledBack { target, error: AgentError::FileSystem { .. } } if target == "1.0.16"
        ));
        assert_eq!(outcome.final_state(), UpdateState::Idle);
        assert_eq!(fixture.tree(), before);
        assert_eq!(orchestrator.installation().await.current_version, "1.0.15");
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn test_unsafe_package_rolls_back_without_changes() {
        let fixture = Fixture::new();
        let before = fixture.tree();
        let package = build_zip(&[("program.bin", "evil"), ("../../escape.sh", "rm -rf /")]);
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", package));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            outcome,
            CycleOutcome::RolledBack {
                error: AgentError::Extraction(_),
                ..
            }
        ));
        assert_eq!(fixture.tree(), before);
        assert!(!fixture.temp.path().join("escape.sh").exists());
    }

    #[tokio::test]
    async fn test_cycles_do_not_overlap() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.15", good_package()));

        // Hold the flag as if a cycle were running
        orchestrator.in_flight.store(true, Ordering::SeqCst);
        assert!(matches!(orchestrator.run_cycle().await, CycleOutcome::Busy));
        assert!(!orchestrator.status().request_check());
        assert_eq!(orchestrator.source.fetches.load(Ordering::SeqCst), 0);

        orchestrator.in_flight.store(false, Ordering::SeqCst);
        assert!(matches!(orchestrator.run_cycle().await, CycleOutcome::UpToDate { .. }));
        assert!(orchestrator.status().request_check());
    }

    #[tokio::test]
    async fn test_workload_blocked_during_critical_section() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", good_package()));
        let guard = orchestrator.guard();
        let mut states = orchestrator.subscribe();

        let reader = guard.read().await;
        let orchestrator = Arc::new(orchestrator);
        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_cycle().await })
        };

        // Reaches Verifying, then waits on the guard before BackingUp
        states
            .wait_for(|state| *state == UpdateState::Verifying)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(orchestrator.state(), UpdateState::Verifying);
        assert_eq!(orchestrator.installation().await.current_version, "1.0.15");

        drop(reader);
        let outcome = running.await.unwrap();
        assert!(matches!(outcome, CycleOutcome::RestartPending { .. }));
    }

    #[tokio::test]
    async fn test_status_reports_last_outcome() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.15", good_package()));
        let status = orchestrator.status();

        assert!(status.last_outcome().is_none());
        orchestrator.run_cycle().await;

        let last = status.last_outcome().unwrap();
        assert_eq!(last.outcome, "up_to_date");
        assert_eq!(last.target.as_deref(), Some("1.0.15"));
        assert_eq!(status.state(), UpdateState::Idle);
        assert!(!status.is_busy());
    }

    #[tokio::test]
    async fn test_backup_failure_aborts_before_any_change() {
        let fixture = Fixture::new();
        let before = fixture.tree();
        // A file where the backup directory should be
        std::fs::write(fixture.backups_dir(), b"not a directory").unwrap();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", good_package()));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            outcome,
            CycleOutcome::Aborted {
                state: UpdateState::BackingUp,
                error: AgentError::Backup(_),
                ..
            }
        ));
        assert_eq!(orchestrator.state(), UpdateState::Idle);
        assert_eq!(fixture.tree(), before);
        assert!(fixture.temp_dir_is_empty());
        assert_eq!(orchestrator.installation().await.current_version, "1.0.15");
    }

    fn discard_slot(snapshot: &BackupSnapshot) {
        std::fs::remove_dir_all(&snapshot.slot).unwrap();
    }

    #[tokio::test]
    async fn test_failed_restore_halts_agent() {
        let fixture = Fixture::new();
        let package = build_zip(&[
            ("program.bin", "program v1.0.16"),
            ("data", "a file where a directory lives"),
        ]);
        let mut orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", package));
        orchestrator.after_backup = Some(discard_slot as fn(&BackupSnapshot));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            &outcome,
            CycleOutcome::Failed { target, error: AgentError::Restore(_) } if target == "1.0.16"
        ));
        assert_eq!(orchestrator.state(), UpdateState::Failed);
        assert_eq!(orchestrator.installation().await.current_version, "1.0.15");

        let next = orchestrator.run_cycle().await;
        assert!(matches!(
            next,
            CycleOutcome::Halted {
                state: UpdateState::Failed
            }
        ));
        assert_eq!(orchestrator.source.fetches.load(Ordering::SeqCst), 1);
        assert!(!orchestrator.status().request_check());
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back() {
        let fixture = Fixture::new();
        let state_file = fixture.temp.path().join("installed-version.json");
        InstallationState::new("1.0.15", fixture.root())
            .persist(&state_file)
            .unwrap();
        // The record is written through this sibling; a directory there makes the write fail
        std::fs::create_dir(fixture.temp.path().join(".installed-version.json.update-tmp")).unwrap();
        let before = fixture.tree();
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", good_package()));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            &outcome,
            CycleOutcome::RolledBack { target, error: AgentError::FileSystem { .. } } if target == "1.0.16"
        ));
        assert_eq!(orchestrator.state(), UpdateState::Idle);
        assert_eq!(fixture.tree(), before);
        assert_eq!(orchestrator.installation().await.current_version, "1.0.15");

        let persisted = InstallationState::load(&state_file, fixture.root(), "0.0.0").unwrap();
        assert_eq!(persisted.current_version, "1.0.15");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlinked_directory_cannot_redirect_writes() {
        let fixture = Fixture::new();
        let outside = fixture.temp.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, fixture.root().join("lib")).unwrap();
        let before = fixture.tree();

        let package = build_zip(&[("program.bin", "program v1.0.16"), ("lib/evil.so", "payload")]);
        let orchestrator = fixture.orchestrator(StaticSource::serving("1.0.16", package));

        let outcome = orchestrator.run_cycle().await;

        assert!(matches!(
            outcome,
            CycleOutcome::RolledBack {
                error: AgentError::Extraction(_),
                ..
            }
        ));
        assert!(!outside.join("evil.so").exists());
        assert_eq!(std::fs::read_dir(&outside).unwrap().count(), 0);
        assert_eq!(fixture.tree(), before);
    }
}
