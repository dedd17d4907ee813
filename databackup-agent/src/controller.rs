//! Workflow controller: drives one backup/restore session through its stages.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready <-> Manifesting -> Executing -> Completed
//!                       |                        |              |
//!                       +------------------------+--------------+--> Aborted
//! ```
//!
//! The controller owns the catalog and the selection for the lifetime of the
//! session. Progress is published as immutable [`SessionProgress`] values on
//! a broadcast channel after every change.

use crate::catalog::{self, Catalog, CatalogSource};
use crate::catalog::snapshot::version_label;
use crate::config::Config;
use crate::gateway::{self, GatewayError, PrivilegedGateway};
use crate::manifest::{ConflictPolicy, Manifest, ManifestBuilder, ManifestEntry};
use crate::outcome::ExecutionResult;
use crate::progress::{ProgressTracker, SessionProgress};
use crate::selection::SelectionSet;
use crate::session_log::SessionLog;
use crate::utils::errors::{Result, SessionError};
use crate::workflow::WorkflowType;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum number of queued progress updates per subscriber
const PROGRESS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Uninitialized,
    Initializing,
    Ready,
    Manifesting,
    Executing,
    Completed,
    Aborted,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Completed | ControllerState::Aborted)
    }

    fn before_ready(&self) -> bool {
        matches!(self, ControllerState::Uninitialized | ControllerState::Initializing)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Session-level knobs
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub require_non_empty: bool,
    /// Entries executed at once; 1 runs the manifest sequentially
    pub parallelism: usize,
    pub log_dir: PathBuf,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            require_non_empty: config.session.require_non_empty,
            parallelism: config.session.parallelism,
            log_dir: config.storage.log_dir.clone(),
        }
    }
}

/// Final report of an executed session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub workflow: WorkflowType,
    pub progress: SessionProgress,
    pub results: Vec<ExecutionResult>,
}

/// What happened to one manifest entry during execution
enum EntryRun {
    Done(ExecutionResult),
    GatewayLost(String, String),
    NotStarted(String),
}

pub struct WorkflowController {
    workflow: WorkflowType,
    session_id: String,
    started_at: DateTime<Utc>,
    options: SessionOptions,
    gateway: Arc<dyn PrivilegedGateway>,
    source: Arc<dyn CatalogSource>,
    log: SessionLog,
    state: ControllerState,
    catalog: Option<Catalog>,
    selection: SelectionSet,
    manifest: Option<Manifest>,
    tracker: ProgressTracker,
    results: Vec<ExecutionResult>,
    failure: Option<String>,
    progress_tx: broadcast::Sender<SessionProgress>,
    cancel: CancellationToken,
}

impl WorkflowController {
    pub fn new(
        workflow: WorkflowType,
        gateway: Arc<dyn PrivilegedGateway>,
        source: Arc<dyn CatalogSource>,
        options: SessionOptions,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);

        Self {
            workflow,
            log: SessionLog::new(options.log_dir.clone(), session_id.clone(), started_at),
            session_id,
            started_at,
            options,
            gateway,
            source,
            state: ControllerState::Uninitialized,
            catalog: None,
            selection: SelectionSet::new(),
            manifest: None,
            tracker: ProgressTracker::new(),
            results: Vec::new(),
            failure: None,
            progress_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn workflow(&self) -> WorkflowType {
        self.workflow
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn current_state(&self) -> ControllerState {
        self.state
    }

    pub fn progress(&self) -> SessionProgress {
        self.tracker.snapshot(self.state)
    }

    pub fn catalog(&self) -> Option<&Catalog> {
        self.catalog.as_ref()
    }

    pub fn selection(&self) -> &SelectionSet {
        &self.selection
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Results recorded so far, in execution order
    pub fn results(&self) -> &[ExecutionResult] {
        &self.results
    }

    /// Reason the session was aborted, if it was
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Token that cancels the session between entries
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionProgress> {
        self.progress_tx.subscribe()
    }

    /// Progress updates as a stream that ends after a terminal state
    pub fn progress_stream(&self) -> impl Stream<Item = SessionProgress> + Send + 'static {
        stream::unfold((self.progress_tx.subscribe(), false), |(mut rx, finished)| async move {
            if finished {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(progress) => {
                        let terminal = progress.state.is_terminal();
                        return Some((progress, (rx, terminal)));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Progress subscriber lagged, {} updates dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Connect the gateway and enumerate the catalog concurrently
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ControllerState::Uninitialized {
            return Err(self.invalid("start"));
        }

        info!("Starting {} session {}", self.workflow, self.session_id);
        self.transition(ControllerState::Initializing);

        let gateway = Arc::clone(&self.gateway);
        let source = Arc::clone(&self.source);
        let workflow = self.workflow;
        let cancel = self.cancel.clone();
        let init = async move {
            tokio::join!(
                tokio::task::spawn_blocking(move || gateway.connect()),
                tokio::task::spawn_blocking(move || catalog::enumerate(source.as_ref(), workflow)),
            )
        };

        let (connected, enumerated) = tokio::select! {
            results = init => results,
            _ = cancel.cancelled() => {
                self.abort("cancelled during initialization");
                return Err(SessionError::Cancelled);
            }
        };

        let connected = match connected {
            Ok(Ok(())) => Ok(()),
            Ok(Err(GatewayError::Unavailable(reason))) => {
                Err(SessionError::GatewayUnavailable(reason))
            }
            Err(e) => Err(SessionError::GatewayUnavailable(format!("connect task failed: {}", e))),
        };
        let enumerated = match enumerated {
            Ok(result) => result,
            Err(e) => Err(SessionError::Discovery(format!("enumeration task failed: {}", e))),
        };

        if connected.is_ok() {
            self.tracker.mark_gateway_ready();
        }

        let catalog = match (connected, enumerated) {
            (Ok(()), Ok(catalog)) => catalog,
            (Err(e), _) | (_, Err(e)) => {
                error!("Session {} failed to initialize: {}", self.session_id, e);
                self.abort(&e.to_string());
                return Err(e);
            }
        };

        self.selection = if self.workflow.is_restore() {
            SelectionSet::preseeded(&catalog)
        } else {
            SelectionSet::new()
        };
        info!(
            "Catalog ready: {} entries, {} preselected",
            catalog.len(),
            self.selection.len()
        );
        self.catalog = Some(catalog);
        self.tracker.mark_catalog_ready();
        self.transition(ControllerState::Ready);
        Ok(())
    }

    pub fn select(&mut self, id: &str) -> Result<()> {
        self.ensure_selectable("select")?;
        let catalog = self.catalog.as_ref().ok_or(SessionError::NotInitialized)?;
        self.selection.select(catalog, id)?;
        self.selection_changed();
        Ok(())
    }

    pub fn deselect(&mut self, id: &str) -> Result<()> {
        self.ensure_selectable("deselect")?;
        let catalog = self.catalog.as_ref().ok_or(SessionError::NotInitialized)?;
        self.selection.deselect(catalog, id)?;
        self.selection_changed();
        Ok(())
    }

    pub fn toggle(&mut self, id: &str) -> Result<bool> {
        self.ensure_selectable("toggle")?;
        let catalog = self.catalog.as_ref().ok_or(SessionError::NotInitialized)?;
        let selected = self.selection.toggle(catalog, id)?;
        self.selection_changed();
        Ok(selected)
    }

    pub fn select_all(&mut self) -> Result<()> {
        self.ensure_selectable("select_all")?;
        let catalog = self.catalog.as_ref().ok_or(SessionError::NotInitialized)?;
        self.selection.select_all(catalog);
        self.selection_changed();
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.ensure_selectable("clear")?;
        self.selection.clear();
        self.selection_changed();
        Ok(())
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selection.is_selected(id)
    }

    /// Validate the current selection into a manifest.
    ///
    /// On error the controller stays (or returns to) `Ready` so the caller
    /// can adjust the selection and try again.
    pub fn build_manifest(&mut self, policy: ConflictPolicy) -> Result<&Manifest> {
        if self.state.before_ready() {
            return Err(SessionError::NotInitialized);
        }
        if !matches!(self.state, ControllerState::Ready | ControllerState::Manifesting) {
            return Err(self.invalid("build_manifest"));
        }

        let catalog = self.catalog.as_ref().ok_or(SessionError::NotInitialized)?;
        let builder = ManifestBuilder::new(
            policy,
            self.options.require_non_empty,
            version_label(self.started_at),
        );

        match builder.build(&self.selection, catalog) {
            Ok(manifest) => {
                self.tracker.set_total(manifest.len());
                self.manifest = Some(manifest);
                self.transition(ControllerState::Manifesting);
                self.manifest.as_ref().ok_or(SessionError::NotInitialized)
            }
            Err(e) => {
                warn!("Manifest build failed: {}", e);
                self.manifest = None;
                self.tracker.set_total(0);
                self.transition(ControllerState::Ready);
                Err(e)
            }
        }
    }

    /// Freeze the manifest and execute it.
    ///
    /// Item failures are recorded and do not stop the batch. A dead gateway
    /// or a cancellation stops scheduling further entries; entries already
    /// running are recorded before the session is aborted.
    pub async fn confirm_and_execute(&mut self) -> Result<SessionSummary> {
        if self.state.before_ready() {
            return Err(SessionError::NotInitialized);
        }
        if self.state != ControllerState::Manifesting {
            return Err(self.invalid("confirm_and_execute"));
        }

        let entries: Vec<ManifestEntry> = match &self.manifest {
            Some(manifest) => manifest.entries().to_vec(),
            None => return Err(self.invalid("confirm_and_execute")),
        };
        self.tracker.set_total(entries.len());
        self.transition(ControllerState::Executing);
        info!(
            "Executing {} entries for {} (parallelism: {})",
            entries.len(),
            self.workflow,
            self.options.parallelism
        );

        // Child of the caller's token: cancelled on caller request or on gateway loss
        let halt = self.cancel.child_token();
        let gateway = Arc::clone(&self.gateway);
        let mut runs = stream::iter(entries)
            .map(|entry| {
                let gateway = Arc::clone(&gateway);
                let halt = halt.clone();
                async move {
                    if halt.is_cancelled() {
                        return EntryRun::NotStarted(entry.source_id);
                    }
                    let task_entry = entry.clone();
                    let joined = tokio::task::spawn_blocking(move || {
                        gateway::run_entry(gateway.as_ref(), &task_entry)
                    })
                    .await;
                    match joined {
                        Ok(Ok(result)) => EntryRun::Done(result),
                        Ok(Err(GatewayError::Unavailable(reason))) => {
                            EntryRun::GatewayLost(entry.source_id, reason)
                        }
                        Err(e) => EntryRun::Done(ExecutionResult::crashed(&entry, e.to_string())),
                    }
                }
            })
            .buffered(self.options.parallelism.max(1));

        let mut fatal: Option<SessionError> = None;
        let mut not_started = 0usize;

        while let Some(run) = runs.next().await {
            match run {
                EntryRun::Done(result) => self.record(result),
                EntryRun::GatewayLost(id, reason) => {
                    error!("Gateway lost while executing {}: {}", id, reason);
                    if fatal.is_none() {
                        fatal = Some(SessionError::GatewayUnavailable(reason));
                    }
                    halt.cancel();
                }
                EntryRun::NotStarted(id) => {
                    debug!("Not starting {}", id);
                    not_started += 1;
                }
            }
        }
        drop(runs);

        if let Some(err) = fatal {
            self.abort(&err.to_string());
            return Err(err);
        }
        if not_started > 0 {
            info!("Session {} cancelled with {} entries not started", self.session_id, not_started);
            self.abort("cancelled by caller");
            return Err(SessionError::Cancelled);
        }

        self.flush_pending();
        self.transition(ControllerState::Completed);
        let progress = self.progress();
        info!(
            "Session {} completed: {} of {} succeeded, {} failed",
            self.session_id,
            progress.succeeded(),
            progress.total,
            progress.failed_count
        );

        Ok(SessionSummary {
            session_id: self.session_id.clone(),
            workflow: self.workflow,
            progress,
            results: self.results.clone(),
        })
    }

    /// Request cancellation; takes effect between entries
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Retry log records that have not reached disk yet
    pub fn flush_log(&mut self) -> Result<usize> {
        self.log.flush()
    }

    fn record(&mut self, result: ExecutionResult) {
        debug!("{} -> {}", result.source_id, result.outcome);
        self.tracker.on_result(&result);
        if let Err(e) = self.log.append(self.workflow, &result) {
            warn!("Session log degraded: {}", e);
            self.tracker.warn(e.to_string());
        }
        self.results.push(result);
        self.publish();
    }

    fn flush_pending(&mut self) {
        if self.log.pending() == 0 {
            return;
        }
        if let Err(e) = self.log.flush() {
            warn!("{} log record(s) still pending: {}", self.log.pending(), e);
        }
    }

    fn ensure_selectable(&self, operation: &'static str) -> Result<()> {
        match self.state {
            ControllerState::Ready | ControllerState::Manifesting => Ok(()),
            state if state.before_ready() => Err(SessionError::NotInitialized),
            _ => Err(self.invalid(operation)),
        }
    }

    /// Any selection edit invalidates a built manifest
    fn selection_changed(&mut self) {
        if self.state == ControllerState::Manifesting {
            self.manifest = None;
            self.tracker.set_total(0);
            self.transition(ControllerState::Ready);
        }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    fn transition(&mut self, next: ControllerState) {
        if self.state != next {
            debug!("Session {}: {} -> {}", self.session_id, self.state, next);
        }
        self.state = next;
        self.publish();
    }

    fn abort(&mut self, reason: &str) {
        warn!("Session {} aborted: {}", self.session_id, reason);
        self.failure = Some(reason.to_string());
        self.flush_pending();
        self.transition(ControllerState::Aborted);
    }

    fn publish(&self) {
        // No subscribers is fine
        let _ = self.progress_tx.send(self.progress());
    }
}

impl Drop for WorkflowController {
    fn drop(&mut self) {
        self.flush_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{app, snapshot, StaticSource};
    use crate::catalog::snapshot::SnapshotRecord;
    use crate::catalog::{CatalogEntry, MediaRecord};
    use crate::gateway::tests::{Script, ScriptedGateway};
    use crate::outcome::Outcome;
    use crate::workflow::ItemKind;
    use std::fs;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        controller: WorkflowController,
        gateway: Arc<ScriptedGateway>,
        logs: TempDir,
    }

    fn harness(
        workflow: WorkflowType,
        source: StaticSource,
        gateway: ScriptedGateway,
        parallelism: usize,
    ) -> Harness {
        let logs = TempDir::new().unwrap();
        let gateway = Arc::new(gateway);
        let controller = WorkflowController::new(
            workflow,
            gateway.clone(),
            Arc::new(source),
            SessionOptions {
                require_non_empty: true,
                parallelism,
                log_dir: logs.path().to_path_buf(),
            },
        );
        Harness {
            controller,
            gateway,
            logs,
        }
    }

    fn backup_harness(ids: &[&str]) -> Harness {
        harness(WorkflowType::AppBackup, apps(ids), ScriptedGateway::default(), 1)
    }

    fn apps(ids: &[&str]) -> StaticSource {
        StaticSource {
            apps: ids.iter().map(|id| app(id)).collect(),
            ..Default::default()
        }
    }

    fn logged(h: &Harness) -> Vec<ExecutionResult> {
        let workflow = h.controller.workflow();
        SessionLog::load_session(h.logs.path(), workflow, h.controller.session_id()).unwrap()
    }

    #[tokio::test]
    async fn test_operations_before_start_are_rejected() {
        let mut h = backup_harness(&["a"]);

        assert!(matches!(h.controller.select("a"), Err(SessionError::NotInitialized)));
        assert!(matches!(
            h.controller.build_manifest(ConflictPolicy::Skip),
            Err(SessionError::NotInitialized)
        ));
        assert!(matches!(
            h.controller.confirm_and_execute().await,
            Err(SessionError::NotInitialized)
        ));
        assert!(!h.controller.progress().ready);
    }

    #[tokio::test]
    async fn test_start_reaches_ready() {
        let mut h = backup_harness(&["a", "b"]);
        h.controller.start().await.unwrap();

        assert_eq!(h.controller.current_state(), ControllerState::Ready);
        assert!(h.controller.progress().ready);
        assert_eq!(h.controller.catalog().unwrap().len(), 2);
        assert!(h.controller.selection().is_empty());
        assert!(matches!(h.controller.start().await, Err(SessionError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_discovery_failure_aborts() {
        let source = StaticSource {
            unreachable: true,
            ..Default::default()
        };
        let mut h = harness(WorkflowType::MediaBackup, source, ScriptedGateway::default(), 1);

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Discovery(_)));
        assert_eq!(h.controller.current_state(), ControllerState::Aborted);
        assert!(!h.controller.progress().ready);
    }

    #[tokio::test]
    async fn test_gateway_connect_failure_aborts() {
        let gateway = ScriptedGateway {
            refuse_connect: true,
            ..Default::default()
        };
        let mut h = harness(WorkflowType::AppBackup, apps(&["a"]), gateway, 1);

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, SessionError::GatewayUnavailable(_)));
        assert_eq!(h.controller.current_state(), ControllerState::Aborted);
        assert!(h.controller.failure().is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_start_aborts() {
        let mut h = backup_harness(&["a"]);
        h.controller.cancel();

        // Either branch may win the race; both must leave a consistent state
        match h.controller.start().await {
            Err(SessionError::Cancelled) => {
                assert_eq!(h.controller.current_state(), ControllerState::Aborted)
            }
            Ok(()) => assert_eq!(h.controller.current_state(), ControllerState::Ready),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    /// Replace the enumerated catalog, keeping the session in `Ready`
    fn reseed_catalog(h: &mut Harness, entries: Vec<CatalogEntry>, snapshots: Vec<SnapshotRecord>) {
        let workflow = h.controller.workflow();
        h.controller.catalog = Some(Catalog::new(workflow, entries, snapshots));
    }

    #[tokio::test]
    async fn test_missing_app_excluded_then_executed() {
        let mut h = backup_harness(&["a", "b", "c"]);
        h.controller.start().await.unwrap();

        // "c" was uninstalled after enumeration
        let mut entries: Vec<_> = h.controller.catalog().unwrap().iter().cloned().collect();
        entries[2].available = false;
        reseed_catalog(&mut h, entries, vec![]);

        h.controller.select("a").unwrap();
        h.controller.select("c").unwrap();
        let manifest = h.controller.build_manifest(ConflictPolicy::Skip).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].source_id, "a");
        assert_eq!(manifest.rejected().len(), 1);

        let summary = h.controller.confirm_and_execute().await.unwrap();
        assert_eq!(summary.progress.completed, 1);
        assert_eq!(summary.progress.total, 1);
        assert_eq!(summary.progress.failed_count, 0);
        assert_eq!(h.controller.current_state(), ControllerState::Completed);
        assert_eq!(h.gateway.executed(), vec!["a"]);
        assert_eq!(logged(&h).len(), 1);
    }

    #[tokio::test]
    async fn test_restore_without_snapshot_is_empty_manifest() {
        let source = StaticSource {
            snapshots: vec![snapshot("y", ItemKind::App, "v1", 1)],
            ..Default::default()
        };
        let mut h = harness(WorkflowType::AppRestore, source, ScriptedGateway::default(), 1);
        h.controller.start().await.unwrap();
        assert!(h.controller.is_selected("y"));

        // "x" is listed but its snapshot was pruned
        let mut entries: Vec<_> = h.controller.catalog().unwrap().iter().cloned().collect();
        entries[0].id = "x".to_string();
        reseed_catalog(&mut h, entries, vec![snapshot("y", ItemKind::App, "v1", 1)]);
        h.controller.clear().unwrap();
        h.controller.select("x").unwrap();

        let err = h.controller.build_manifest(ConflictPolicy::Skip).unwrap_err();
        assert!(matches!(err, SessionError::EmptyManifest));
        assert_eq!(h.controller.current_state(), ControllerState::Ready);
        assert!(h.controller.manifest().is_none());
    }

    #[tokio::test]
    async fn test_gateway_loss_aborts_remaining_entries() {
        let gateway = ScriptedGateway::with(&[("b", Script::Unavailable)]);
        let mut h = harness(WorkflowType::AppBackup, apps(&["a", "b", "c"]), gateway, 1);
        h.controller.start().await.unwrap();
        h.controller.select_all().unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();

        let err = h.controller.confirm_and_execute().await.unwrap_err();
        assert!(matches!(err, SessionError::GatewayUnavailable(_)));
        assert_eq!(h.controller.current_state(), ControllerState::Aborted);
        assert_eq!(h.gateway.executed(), vec!["a", "b"]);
        assert_eq!(logged(&h).len(), 1);
        assert_eq!(h.controller.results().len(), 1);
    }

    #[tokio::test]
    async fn test_item_failures_do_not_abort() {
        let gateway = ScriptedGateway::with(&[
            ("a", Script::Fail("permission denied".into())),
            ("b", Script::Panic),
            ("c", Script::Skip("unchanged".into())),
        ]);
        let mut h = harness(WorkflowType::AppBackup, apps(&["a", "b", "c", "d"]), gateway, 1);
        h.controller.start().await.unwrap();
        h.controller.select_all().unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();

        let summary = h.controller.confirm_and_execute().await.unwrap();
        assert_eq!(h.controller.current_state(), ControllerState::Completed);
        assert_eq!(summary.progress.completed, 4);
        assert_eq!(summary.progress.failed_count, 3);
        assert_eq!(summary.progress.skipped, 1);
        let crashed = &summary.results[1].outcome;
        assert!(matches!(crashed, Outcome::Failed(d) if d.contains("crashed")));

        let log = logged(&h);
        assert_eq!(log.len(), 4);
        assert_eq!(log, summary.results);
    }

    #[tokio::test]
    async fn test_parallel_execution_keeps_manifest_order() {
        let ids = ["a", "b", "c", "d", "e", "f"];
        let mut h = harness(WorkflowType::AppBackup, apps(&ids), ScriptedGateway::default(), 3);
        h.controller.start().await.unwrap();
        for id in ids.iter().rev() {
            h.controller.select(id).unwrap();
        }
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();

        let summary = h.controller.confirm_and_execute().await.unwrap();
        let order: Vec<_> = summary.results.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(order, vec!["f", "e", "d", "c", "b", "a"]);
        let logged_order: Vec<_> = logged(&h).into_iter().map(|r| r.source_id).collect();
        assert_eq!(logged_order, order);
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_entries() {
        let mut h = backup_harness(&["a", "b", "c"]);
        h.controller.start().await.unwrap();
        h.controller.select_all().unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();

        let mut updates = h.controller.subscribe();
        let token = h.controller.cancel_token();
        let watcher = tokio::spawn(async move {
            while let Ok(progress) = updates.recv().await {
                if progress.completed == 1 {
                    token.cancel();
                }
                if progress.state.is_terminal() {
                    break;
                }
            }
        });

        let result = h.controller.confirm_and_execute().await;
        watcher.await.unwrap();

        // The watcher races the next entry; at least one entry ran and the log matches
        let recorded = h.controller.results().len();
        assert!(recorded >= 1);
        assert_eq!(logged(&h).len(), recorded);
        match result {
            Err(SessionError::Cancelled) => {
                assert_eq!(h.controller.current_state(), ControllerState::Aborted)
            }
            Ok(_) => assert_eq!(recorded, 3),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_execute_runs_nothing() {
        let mut h = backup_harness(&["a", "b"]);
        h.controller.start().await.unwrap();
        h.controller.select_all().unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();
        h.controller.cancel();

        let err = h.controller.confirm_and_execute().await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(h.controller.current_state(), ControllerState::Aborted);
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
        assert!(logged(&h).is_empty());
    }

    #[tokio::test]
    async fn test_selection_edit_returns_to_ready_and_freezes_after_execution() {
        let mut h = backup_harness(&["a", "b"]);
        h.controller.start().await.unwrap();
        h.controller.select("a").unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();
        assert_eq!(h.controller.current_state(), ControllerState::Manifesting);

        h.controller.select("b").unwrap();
        assert_eq!(h.controller.current_state(), ControllerState::Ready);
        assert!(h.controller.manifest().is_none());
        assert!(matches!(
            h.controller.confirm_and_execute().await,
            Err(SessionError::InvalidState { .. })
        ));

        assert_eq!(h.controller.build_manifest(ConflictPolicy::Skip).unwrap().len(), 2);
        h.controller.confirm_and_execute().await.unwrap();

        assert!(matches!(h.controller.select("a"), Err(SessionError::InvalidState { .. })));
        assert!(matches!(h.controller.clear(), Err(SessionError::InvalidState { .. })));
        assert!(matches!(
            h.controller.build_manifest(ConflictPolicy::Skip),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_entry_keeps_selection_within_catalog() {
        let mut h = backup_harness(&["a"]);
        h.controller.start().await.unwrap();

        assert!(matches!(h.controller.select("ghost"), Err(SessionError::UnknownEntry(_))));
        assert!(matches!(h.controller.toggle("ghost"), Err(SessionError::UnknownEntry(_))));
        h.controller.select("a").unwrap();
        h.controller.deselect("a").unwrap();

        assert!(!h.controller.is_selected("a"));
        let catalog = h.controller.catalog().unwrap();
        assert!(h.controller.selection().iter().all(|id| catalog.contains(id)));
        assert_eq!(h.controller.current_state(), ControllerState::Ready);
    }

    #[tokio::test]
    async fn test_log_failure_is_a_warning() {
        let mut h = backup_harness(&["a", "b"]);
        let blocker = h.logs.path().join("blocked");
        fs::write(&blocker, b"file in the way").unwrap();
        let session_id = h.controller.session_id().to_string();
        h.controller.log = SessionLog::new(&blocker, session_id, Utc::now());

        h.controller.start().await.unwrap();
        h.controller.select_all().unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();

        let summary = h.controller.confirm_and_execute().await.unwrap();
        assert_eq!(h.controller.current_state(), ControllerState::Completed);
        assert_eq!(summary.results.len(), 2);
        assert!(!summary.progress.warnings.is_empty());

        fs::remove_file(&blocker).unwrap();
        assert_eq!(h.controller.flush_log().unwrap(), 2);
        let session_id = h.controller.session_id();
        let restored =
            SessionLog::load_session(&blocker, WorkflowType::AppBackup, session_id).unwrap();
        assert_eq!(restored, summary.results);
    }

    #[tokio::test]
    async fn test_drop_flushes_pending_records() {
        let mut h = backup_harness(&["a", "b"]);
        let blocker = h.logs.path().join("blocked");
        fs::write(&blocker, b"file in the way").unwrap();
        let session_id = h.controller.session_id().to_string();
        h.controller.log = SessionLog::new(&blocker, session_id.clone(), Utc::now());

        h.controller.start().await.unwrap();
        h.controller.select_all().unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();
        let summary = h.controller.confirm_and_execute().await.unwrap();
        assert_eq!(h.controller.log.pending(), 2);

        fs::remove_file(&blocker).unwrap();
        let Harness { controller, logs, .. } = h;
        drop(controller);

        let restored =
            SessionLog::load_session(&blocker, WorkflowType::AppBackup, &session_id).unwrap();
        assert_eq!(restored, summary.results);
        drop(logs);
    }

    #[tokio::test]
    async fn test_conflict_fail_policy_keeps_session_ready() {
        let mut occupied = snapshot("com.a", ItemKind::App, "v1", 1);
        occupied.destination_occupied = true;
        let source = StaticSource {
            snapshots: vec![occupied, snapshot("com.b", ItemKind::App, "v1", 1)],
            ..Default::default()
        };
        let mut h = harness(WorkflowType::AppRestore, source, ScriptedGateway::default(), 1);
        h.controller.start().await.unwrap();
        assert_eq!(h.controller.selection().len(), 2);

        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();
        assert_eq!(h.controller.current_state(), ControllerState::Manifesting);

        let err = h.controller.build_manifest(ConflictPolicy::Fail).unwrap_err();
        assert!(matches!(err, SessionError::ManifestConflict { ref id, .. } if id == "com.a"));
        assert_eq!(h.controller.current_state(), ControllerState::Ready);
        assert!(h.controller.manifest().is_none());
        assert_eq!(h.controller.progress().total, 0);
        assert!(matches!(
            h.controller.confirm_and_execute().await,
            Err(SessionError::InvalidState { .. })
        ));
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gateway_loss_with_parallelism_keeps_log_in_manifest_order() {
        let ids = ["a", "b", "c", "d", "e", "f"];
        let gateway = ScriptedGateway::with(&[("c", Script::Unavailable)]);
        let mut h = harness(WorkflowType::AppBackup, apps(&ids), gateway, 3);
        h.controller.start().await.unwrap();
        h.controller.select_all().unwrap();
        let manifest_len = h.controller.build_manifest(ConflictPolicy::Skip).unwrap().len();

        let err = h.controller.confirm_and_execute().await.unwrap_err();
        assert!(matches!(err, SessionError::GatewayUnavailable(_)));
        assert_eq!(h.controller.current_state(), ControllerState::Aborted);

        let log: Vec<_> = logged(&h).into_iter().map(|r| r.source_id).collect();
        assert!(log.len() < manifest_len);
        assert_eq!(log.len(), h.controller.results().len());
        // Entries ahead of the lost one always finish and are recorded first
        assert_eq!(&log[..2], &["a", "b"]);
        assert!(!log.iter().any(|id| id == "c"));

        let positions: Vec<_> = log
            .iter()
            .map(|id| ids.iter().position(|m| *m == id.as_str()).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_progress_stream_ends_after_terminal_state() {
        let source = StaticSource {
            media: vec![MediaRecord {
                name: "pictures".into(),
                path: PathBuf::from("/sdcard/Pictures"),
                size_bytes: 10,
                modified_at: None,
                exists: true,
            }],
            ..Default::default()
        };
        let mut h = harness(WorkflowType::MediaBackup, source, ScriptedGateway::default(), 1);
        let updates = h.controller.progress_stream();
        let collector = tokio::spawn(updates.collect::<Vec<_>>());

        h.controller.start().await.unwrap();
        h.controller.select("pictures").unwrap();
        h.controller.build_manifest(ConflictPolicy::Skip).unwrap();
        h.controller.confirm_and_execute().await.unwrap();

        let seen = collector.await.unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.state, ControllerState::Completed);
        assert_eq!(last.completed, 1);
        assert!(seen.iter().any(|p| p.state == ControllerState::Executing));
    }
}
