//! Object-store access + HTTP fetch utilities for packmirror.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "packmirror-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failure for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("deadline exceeded writing `{key}`")]
    DeadlineExceeded { key: String },
    #[error("store credentials expired mid-cycle")]
    CredentialsExpired,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Opaque blob-store interface. Writes are bounded by an explicit deadline;
/// implementations surface a timeout as [`StoreError::DeadlineExceeded`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn put_file(&self, key: &str, path: &Path, deadline: Duration) -> Result<(), StoreError>;
    async fn put_text(&self, key: &str, text: &str, deadline: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    List,
}

/// Permission set and credential lifetime requested for one acquisition.
#[derive(Debug, Clone)]
pub struct StoreScope {
    pub permissions: Vec<Permission>,
    pub duration: Duration,
}

impl StoreScope {
    pub fn read_write(duration: Duration) -> Self {
        Self {
            permissions: vec![Permission::Read, Permission::Write, Permission::List],
            duration,
        }
    }
}

/// Scoped store acquisition: a fresh handle with its own temporary
/// credential is obtained at the start of each cycle and dropped at the
/// end, instead of a shared handle being mutated in place.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn acquire(&self, scope: &StoreScope) -> Result<Arc<dyn ObjectStore>, StoreError>;
}

/// Directory-rooted store. Keys are slash-separated relative paths; writes
/// land in a uuid-named temp file and are renamed into place atomically.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.object_path(key);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let guard = TempFileGuard::new(temp_path.clone());
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &target).await
        }
        .await;

        match result {
            Ok(()) => {
                guard.disarm();
                debug!(key, bytes = bytes.len(), "stored object");
                Ok(())
            }
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Streamed variant for large archives: copy into a temp file next to
    /// the target, then rename.
    async fn copy_atomic(&self, key: &str, src: &Path) -> Result<(), StoreError> {
        let target = self.object_path(key);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let guard = TempFileGuard::new(temp_path.clone());
        let result = async {
            let copied = fs::copy(src, &temp_path).await?;
            fs::rename(&temp_path, &target).await?;
            Ok::<u64, std::io::Error>(copied)
        }
        .await;

        match result {
            Ok(copied) => {
                guard.disarm();
                debug!(key, bytes = copied, "stored object");
                Ok(())
            }
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Removes the temp file on drop unless the write was renamed into place.
/// Covers error paths and futures dropped by a timeout or cancellation.
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Best-effort removal of `.*.tmp` leftovers from writes interrupted by a
/// crash, recursively under `root`.
fn sweep_temp_files(root: &Path) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep_temp_files(&path);
        } else if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"))
        {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        fs::try_exists(self.object_path(key))
            .await
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })
    }

    async fn put_file(&self, key: &str, path: &Path, deadline: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(deadline, self.copy_atomic(key, path))
            .await
            .map_err(|_| StoreError::DeadlineExceeded {
                key: key.to_string(),
            })?
    }

    async fn put_text(&self, key: &str, text: &str, deadline: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(deadline, self.write_atomic(key, text.as_bytes()))
            .await
            .map_err(|_| StoreError::DeadlineExceeded {
                key: key.to_string(),
            })?
    }
}

/// Provider for the filesystem store. The scope is accepted for interface
/// parity; local directories need no temporary credential.
#[derive(Debug, Clone)]
pub struct FsStoreProvider {
    root: PathBuf,
}

impl FsStoreProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StoreProvider for FsStoreProvider {
    async fn acquire(&self, _scope: &StoreScope) -> Result<Arc<dyn ObjectStore>, StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                key: self.root.display().to_string(),
                source,
            })?;
        sweep_temp_files(&self.root);
        Ok(Arc::new(FsObjectStore::new(self.root.clone())))
    }
}

/// In-memory store used by engine tests; counts writes so idempotence is
/// directly observable.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().await.contains_key(key))
    }

    async fn put_file(&self, key: &str, path: &Path, _deadline: Duration) -> Result<(), StoreError> {
        let bytes = fs::read(path).await.map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })?;
        self.objects.lock().await.insert(key.to_string(), bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn put_text(&self, key: &str, text: &str, _deadline: Duration) -> Result<(), StoreError> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), text.as_bytes().to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("download of {url} exceeded the {limit}-byte cap")]
    TooLarge { url: String, limit: u64 },
    #[error("writing downloaded bytes: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Thin origin client. No retry or backoff: a failed fetch fails the item
/// for this cycle and the schedule retries it naturally.
///
/// Manifest GETs carry a total-request timeout; archive downloads are
/// bounded by a read-idle timeout instead, so a large body that keeps
/// making progress is never cut off mid-transfer.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .read_timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            request_timeout: config.timeout,
        })
    }

    /// GET a manifest document as UTF-8 text.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    /// Stream an archive body to `dest`, enforcing `max_bytes` while the
    /// download is still in flight. Returns the byte count written.
    pub async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, FetchError> {
        let span = info_span!("archive_download", url, max_bytes);
        async {
            let mut resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            if let Some(len) = resp.content_length() {
                if len > max_bytes {
                    return Err(FetchError::TooLarge {
                        url: url.to_string(),
                        limit: max_bytes,
                    });
                }
            }

            let mut file = fs::File::create(dest).await?;
            let mut written = 0u64;
            while let Some(chunk) = resp.chunk().await? {
                written += chunk.len() as u64;
                if written > max_bytes {
                    return Err(FetchError::TooLarge {
                        url: url.to_string(),
                        limit: max_bytes,
                    });
                }
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            debug!(written, "archive download complete");
            Ok(written)
        }
        .instrument(span)
        .await
    }
}
