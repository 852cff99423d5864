//! Mirror synchronization engine: cron-driven cycles that keep locally
//! tracked manifests and their archives mirrored into an object store.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use packmirror_archive::{patch_manifest_entry, DownloadedArchive, MissingEntryPolicy};
use packmirror_core::{Manifest, MirrorPaths};
use packmirror_storage::{
    FsStoreProvider, HttpClientConfig, HttpFetcher, ObjectStore, StoreProvider, StoreScope,
};
use serde::Serialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "packmirror-sync";

/// Extension of tracked manifest files under the manifest root.
pub const MANIFEST_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub schedule: String,
    pub manifest_root: PathBuf,
    pub mirror_prefix: String,
    pub store_root: PathBuf,
    pub upload_timeout: Duration,
    pub max_archive_bytes: u64,
    pub missing_entry_policy: MissingEntryPolicy,
    pub credential_duration: Duration,
    pub user_agent: String,
    pub http_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            schedule: std::env::var("PACKMIRROR_SCHEDULE")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            manifest_root: std::env::var("PACKMIRROR_MANIFEST_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./manifests")),
            mirror_prefix: std::env::var("PACKMIRROR_MIRROR_PREFIX")
                .unwrap_or_else(|_| "https://mirror.local/".to_string()),
            store_root: std::env::var("PACKMIRROR_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./objects")),
            upload_timeout: Duration::from_secs(
                std::env::var("PACKMIRROR_UPLOAD_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            max_archive_bytes: std::env::var("PACKMIRROR_MAX_ARCHIVE_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024 * 1024 * 1024),
            missing_entry_policy: match std::env::var("PACKMIRROR_MISSING_ENTRY_POLICY").as_deref()
            {
                Ok("upload-unmodified") => MissingEntryPolicy::UploadUnmodified,
                _ => MissingEntryPolicy::Fail,
            },
            credential_duration: Duration::from_secs(
                std::env::var("PACKMIRROR_CREDENTIAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            user_agent: std::env::var("PACKMIRROR_USER_AGENT")
                .unwrap_or_else(|_| "packmirror/0.1".to_string()),
            http_timeout: Duration::from_secs(
                std::env::var("PACKMIRROR_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

/// Recursively collect tracked manifest files under `root`. An absent root
/// is a configuration error, surfaced at startup rather than per cycle.
pub fn find_manifests(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("manifest root {} is not a directory", root.display());
    }
    let mut manifests = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .is_some_and(|ext| ext == MANIFEST_EXTENSION)
        {
            manifests.push(entry.into_path());
        }
    }
    Ok(manifests)
}

/// Origin-side collaborator: manifest GET plus size-capped archive download.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch_manifest(&self, url: &str) -> Result<String>;
    async fn download_archive(&self, url: &str, dest: &Path, max_bytes: u64) -> Result<u64>;
}

pub struct HttpOrigin {
    fetcher: HttpFetcher,
}

impl HttpOrigin {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            fetcher: HttpFetcher::new(config)?,
        })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch_manifest(&self, url: &str) -> Result<String> {
        self.fetcher
            .fetch_text(url)
            .await
            .with_context(|| format!("fetching manifest {url}"))
    }

    async fn download_archive(&self, url: &str, dest: &Path, max_bytes: u64) -> Result<u64> {
        self.fetcher
            .download_to(url, dest, max_bytes)
            .await
            .with_context(|| format!("downloading archive {url}"))
    }
}

/// Outcome of the per-item decision rule, evaluated once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorDecision {
    /// Local and remote documents differ structurally.
    Changed,
    /// Documents are identical but the mirror object does not exist yet.
    NotYetMirrored,
    /// Nothing to do; the archive is never downloaded.
    UpToDate,
}

/// Two-part rule: structural change wins, otherwise a missing remote
/// manifest object means first-time mirroring, otherwise skip.
pub async fn decide(
    local: &Manifest,
    remote: &Manifest,
    store: &dyn ObjectStore,
    paths: &MirrorPaths,
) -> Result<MirrorDecision> {
    if !local.same_content(remote) {
        return Ok(MirrorDecision::Changed);
    }
    if !store.exists(&paths.manifest_key).await? {
        return Ok(MirrorDecision::NotYetMirrored);
    }
    Ok(MirrorDecision::UpToDate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Mirrored,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    pub mirrored: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct MirrorEngine {
    config: SyncConfig,
    origin: Arc<dyn Origin>,
    store_provider: Arc<dyn StoreProvider>,
}

impl MirrorEngine {
    /// Wire the engine against real collaborators. Configuration errors
    /// (absent manifest root) are fatal here, before the first cycle.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let origin = HttpOrigin::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        let provider = FsStoreProvider::new(config.store_root.clone());
        Self::with_collaborators(config, Arc::new(origin), Arc::new(provider))
    }

    pub fn with_collaborators(
        config: SyncConfig,
        origin: Arc<dyn Origin>,
        store_provider: Arc<dyn StoreProvider>,
    ) -> Result<Self> {
        if !config.manifest_root.is_dir() {
            bail!(
                "manifest root {} is not a directory",
                config.manifest_root.display()
            );
        }
        Ok(Self {
            config,
            origin,
            store_provider,
        })
    }

    /// One full pass over all tracked manifests. Items run sequentially;
    /// a per-item failure is logged and never aborts the cycle, and
    /// cancellation is checked before each item starts.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let scope = StoreScope::read_write(self.config.credential_duration);
        let store = self
            .store_provider
            .acquire(&scope)
            .await
            .context("acquiring object store for cycle")?;

        let manifests = find_manifests(&self.config.manifest_root)?;
        let scanned = manifests.len();
        let mut mirrored = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        for path in manifests {
            if cancel.is_cancelled() {
                info!("cycle cancelled; stopping before next item");
                break;
            }
            let span = info_span!("mirror_item", manifest = %path.display());
            match self
                .mirror_item(store.as_ref(), &path, cancel)
                .instrument(span)
                .await
            {
                Ok(ItemOutcome::Mirrored) => mirrored += 1,
                Ok(ItemOutcome::Skipped) => skipped += 1,
                Err(err) => {
                    warn!(manifest = %path.display(), error = %format!("{err:#}"), "item failed; will retry next cycle");
                    failed += 1;
                }
            }
        }

        let summary = CycleSummary {
            started_at,
            finished_at: Utc::now(),
            scanned,
            mirrored,
            skipped,
            failed,
        };
        info!(
            scanned = summary.scanned,
            mirrored = summary.mirrored,
            skipped = summary.skipped,
            failed = summary.failed,
            "cycle complete"
        );
        Ok(summary)
    }

    async fn mirror_item(
        &self,
        store: &dyn ObjectStore,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        let local_text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading local manifest {}", path.display()))?;
        let local = Manifest::parse(&local_text)
            .with_context(|| format!("parsing local manifest {}", path.display()))?;

        let remote_text = self
            .cancellable(
                cancel,
                "fetching manifest",
                self.origin.fetch_manifest(&local.manifest_url),
            )
            .await?;
        let remote = Manifest::parse(&remote_text)
            .with_context(|| format!("parsing remote manifest {}", local.manifest_url))?;

        let paths = MirrorPaths::derive(&remote.manifest_url)?;
        let decision = decide(&local, &remote, store, &paths).await?;
        if decision == MirrorDecision::UpToDate {
            return Ok(ItemOutcome::Skipped);
        }

        let kind = remote.kind()?;
        let rewritten = remote.rewritten(&self.config.mirror_prefix, &paths);

        let download = DownloadedArchive::create()?;
        self.cancellable(
            cancel,
            "downloading archive",
            self.origin.download_archive(
                &remote.download_url,
                download.path(),
                self.config.max_archive_bytes,
            ),
        )
        .await?;
        let patched =
            patch_manifest_entry(download, kind, &rewritten, self.config.missing_entry_policy)?;

        // Archive first: the manifest object doubles as the "already
        // mirrored" marker, so it must land last.
        self.bounded_write(cancel, &paths.archive_key, || {
            store.put_file(&paths.archive_key, patched.path(), self.config.upload_timeout)
        })
        .await?;
        self.bounded_write(cancel, &paths.manifest_key, || {
            store.put_text(&paths.manifest_key, &rewritten, self.config.upload_timeout)
        })
        .await?;

        // Local state moves only after confirmed remote success, and only
        // when the remote content actually differed.
        if decision == MirrorDecision::Changed {
            fs::write(path, &remote_text)
                .await
                .with_context(|| format!("updating local manifest {}", path.display()))?;
        }

        info!(
            name = %remote.name,
            manifest_key = %paths.manifest_key,
            "mirrored"
        );
        Ok(ItemOutcome::Mirrored)
    }

    /// Race an origin operation against cancellation so in-flight work
    /// unwinds promptly instead of running to completion after shutdown.
    async fn cancellable<T, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        operation: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled while {what}"),
            result = operation => result,
        }
    }

    /// Bound a store write by the per-item upload timeout while also
    /// observing outer cancellation; whichever fires first wins. The store
    /// deadline and this select cover the same window.
    async fn bounded_write<F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        write: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), packmirror_storage::StoreError>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled while uploading {key}"),
            result = tokio::time::timeout(self.config.upload_timeout, write()) => match result {
                Err(_) => bail!("upload of {key} exceeded the {:?} deadline", self.config.upload_timeout),
                Ok(inner) => inner.with_context(|| format!("uploading {key}")),
            },
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    /// Waiting for the next occurrence to pass.
    Idle,
    /// A work execution is due or in flight.
    Running,
}

/// Coarse-polling cron harness. Computes the next occurrence at
/// construction, runs the work once immediately, then polls every few
/// seconds for the occurrence to pass; missed ticks are not replayed.
pub struct CronLoop {
    schedule: Schedule,
    next: DateTime<Utc>,
    poll_interval: Duration,
}

impl CronLoop {
    pub fn new(expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("invalid cron expression `{expression}`"))?;
        let next = schedule
            .upcoming(Utc)
            .next()
            .with_context(|| format!("cron expression `{expression}` yields no occurrence"))?;
        Ok(Self {
            schedule,
            next,
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn next_occurrence(&self) -> DateTime<Utc> {
        self.next
    }

    /// Drive `work` until `cancel` fires. A fault inside one execution is
    /// logged and never terminates the loop; the next poll proceeds.
    pub async fn run<F, Fut>(mut self, cancel: CancellationToken, mut work: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CycleSummary>>,
    {
        // First execution happens immediately at startup.
        let mut state = LoopState::Running;

        loop {
            match state {
                LoopState::Running => {
                    match work().await {
                        Ok(summary) => info!(
                            mirrored = summary.mirrored,
                            failed = summary.failed,
                            "scheduled run finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                    }
                    // Recompute from now, not from the occurrence we just
                    // served: missed ticks are dropped, not queued.
                    match self.schedule.after(&Utc::now()).next() {
                        Some(next) => self.next = next,
                        None => {
                            warn!("schedule exhausted; stopping loop");
                            return;
                        }
                    }
                    state = LoopState::Idle;
                }
                LoopState::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("scheduler cancelled");
                            return;
                        }
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    if Utc::now() >= self.next {
                        state = LoopState::Running;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packmirror_storage::MemoryObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn find_manifests_recurses_and_filters_extension() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("systems/deep")).expect("mkdir");
        std::fs::write(dir.path().join("systems/dnd5e.json"), "{}").expect("write");
        std::fs::write(dir.path().join("systems/deep/pf2e.json"), "{}").expect("write");
        std::fs::write(dir.path().join("systems/notes.txt"), "x").expect("write");

        let mut found = find_manifests(dir.path()).expect("find");
        found.sort();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.extension().is_some_and(|e| e == "json")));
    }

    #[test]
    fn absent_root_is_a_configuration_error() {
        let err = find_manifests(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn decision_rule_orders_change_before_existence() {
        let store = MemoryObjectStore::new();
        let local = Manifest::parse(
            r#"{"name":"a","manifest":"https://o/system.json","download":"https://o/a.zip"}"#,
        )
        .expect("local");
        let changed = Manifest::parse(
            r#"{"name":"a","manifest":"https://o/system.json","download":"https://o/b.zip"}"#,
        )
        .expect("changed");
        let paths = MirrorPaths::derive("https://o/system.json").expect("paths");

        // Different content wins regardless of store state.
        assert_eq!(
            decide(&local, &changed, &store, &paths).await.expect("decide"),
            MirrorDecision::Changed
        );
        // Equal content + absent object -> first-time mirror.
        assert_eq!(
            decide(&local, &local, &store, &paths).await.expect("decide"),
            MirrorDecision::NotYetMirrored
        );
        // Equal content + present object -> skip.
        store
            .put_text(&paths.manifest_key, "{}", Duration::from_secs(1))
            .await
            .expect("put");
        assert_eq!(
            decide(&local, &local, &store, &paths).await.expect("decide"),
            MirrorDecision::UpToDate
        );
    }

    #[test]
    fn invalid_cron_expression_is_fatal_at_construction() {
        assert!(CronLoop::new("not a cron line").is_err());
    }

    #[test]
    fn next_occurrence_is_in_the_future() {
        let cron = CronLoop::new("0 0 * * * *").expect("hourly");
        assert!(cron.next_occurrence() > Utc::now());
    }

    #[tokio::test]
    async fn loop_runs_immediately_and_survives_a_failing_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counted = runs.clone();

        // Every-second schedule with a fast poll: expect the immediate run
        // (which fails) plus at least one scheduled run afterwards.
        let cron = CronLoop::new("* * * * * *")
            .expect("per-second")
            .with_poll_interval(Duration::from_millis(20));
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            cron.run(task_cancel, move || {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        bail!("first run blows up");
                    }
                    Ok(CycleSummary {
                        started_at: Utc::now(),
                        finished_at: Utc::now(),
                        scanned: 0,
                        mirrored: 0,
                        skipped: 0,
                        failed: 0,
                    })
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        task.await.expect("loop task");
        assert!(runs.load(Ordering::SeqCst) >= 2, "loop died after the failing run");
    }
}
