use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::core::config::AppPaths;
use crate::core::errors::ChatError;
use crate::events::{AppEvent, EventBus};
use crate::store::types::{Download, DownloadKind, DownloadStatus};
use crate::store::Store;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
const MAX_NETWORK_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
struct Flag(Arc<AtomicBool>);

impl Flag {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct ActiveTask {
    pause: Flag,
    cancel: Flag,
}

/// Resumable byte-range downloader for model files and inference binaries.
///
/// One task per active download. Files stage as `<id>.part` in the downloads
/// directory and move atomically into place on completion.
#[derive(Clone)]
pub struct DownloadManager {
    store: Store,
    paths: Arc<AppPaths>,
    bus: EventBus,
    client: Client,
    tasks: Arc<Mutex<HashMap<String, ActiveTask>>>,
}

impl DownloadManager {
    pub fn new(store: Store, paths: Arc<AppPaths>, bus: EventBus) -> Self {
        Self {
            store,
            paths,
            bus,
            client: Client::new(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mark downloads left mid-flight by a previous run as paused so they can
    /// be resumed.
    pub async fn recover(&self) -> Result<(), ChatError> {
        for download in self.store.list_downloads().await? {
            if matches!(
                download.status,
                DownloadStatus::Downloading | DownloadStatus::Pending
            ) {
                self.store
                    .set_download_status(&download.id, DownloadStatus::Paused, None)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn start(
        &self,
        url: &str,
        kind: DownloadKind,
        checksum: Option<&str>,
    ) -> Result<Download, ChatError> {
        let filename = filename_from_url(url)?;
        let destination = match kind {
            DownloadKind::Model => self.paths.models_dir.join(&filename),
            DownloadKind::Binary => self.paths.bin_dir.join(&filename),
        };

        let download = self
            .store
            .create_download(url, &destination.to_string_lossy(), kind, checksum)
            .await?;

        self.spawn_task(&download.id).await?;
        self.store.get_download(&download.id).await
    }

    pub async fn pause(&self, id: &str) -> Result<Download, ChatError> {
        let download = self.store.get_download(id).await?;
        if download.status.is_terminal() {
            return Err(ChatError::validation(format!(
                "download is already {}",
                download.status.as_str()
            )));
        }

        let tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(id) {
            task.pause.set();
        } else {
            drop(tasks);
            self.store
                .set_download_status(id, DownloadStatus::Paused, None)
                .await?;
        }
        self.store.get_download(id).await
    }

    pub async fn resume(&self, id: &str) -> Result<Download, ChatError> {
        let download = self.store.get_download(id).await?;
        match download.status {
            DownloadStatus::Completed | DownloadStatus::Cancelled => {
                return Err(ChatError::validation(format!(
                    "download is already {}",
                    download.status.as_str()
                )));
            }
            DownloadStatus::Downloading | DownloadStatus::Pending => {
                if self.tasks.lock().await.contains_key(id) {
                    return Ok(download);
                }
            }
            DownloadStatus::Paused | DownloadStatus::Failed => {}
        }

        self.spawn_task(id).await?;
        self.store.get_download(id).await
    }

    /// Cancel a download; the partial file is always deleted.
    pub async fn cancel(&self, id: &str) -> Result<Download, ChatError> {
        let download = self.store.get_download(id).await?;
        if download.status.is_terminal() {
            return Ok(download);
        }

        let tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(id) {
            task.cancel.set();
            drop(tasks);
        } else {
            drop(tasks);
            let _ = tokio::fs::remove_file(self.part_path(id)).await;
            self.store
                .set_download_status(id, DownloadStatus::Cancelled, None)
                .await?;
        }
        self.store.get_download(id).await
    }

    pub async fn status(&self, id: &str) -> Result<Download, ChatError> {
        self.store.get_download(id).await
    }

    pub async fn list(&self) -> Result<Vec<Download>, ChatError> {
        self.store.list_downloads().await
    }

    fn part_path(&self, id: &str) -> PathBuf {
        self.paths.downloads_dir.join(format!("{id}.part"))
    }

    async fn spawn_task(&self, id: &str) -> Result<(), ChatError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(id) {
            return Err(ChatError::busy("download is already running"));
        }

        let pause = Flag::default();
        let cancel = Flag::default();
        tasks.insert(
            id.to_string(),
            ActiveTask {
                pause: pause.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(tasks);

        self.store
            .set_download_status(id, DownloadStatus::Downloading, None)
            .await?;

        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            manager.run_download(&id, pause, cancel).await;
            manager.tasks.lock().await.remove(&id);
        });
        Ok(())
    }

    async fn run_download(&self, id: &str, pause: Flag, cancel: Flag) {
        let mut attempt: u32 = 0;
        loop {
            match self.download_once(id, &pause, &cancel).await {
                Ok(Outcome::Finished) | Ok(Outcome::Stopped) => return,
                Ok(Outcome::NetworkError(detail)) => {
                    attempt += 1;
                    if attempt > MAX_NETWORK_RETRIES {
                        tracing::warn!("download {id} giving up after {attempt} attempts: {detail}");
                        let _ = self
                            .store
                            .set_download_status(id, DownloadStatus::Paused, Some(&detail))
                            .await;
                        self.bus.emit(AppEvent::DownloadError {
                            id: id.to_string(),
                            error: detail,
                        });
                        return;
                    }
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    tracing::info!("download {id} retrying in {delay:?}: {detail}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let detail = err.to_string();
                    let _ = self
                        .store
                        .set_download_status(id, DownloadStatus::Failed, Some(&detail))
                        .await;
                    self.bus.emit(AppEvent::DownloadError {
                        id: id.to_string(),
                        error: detail,
                    });
                    return;
                }
            }
        }
    }

    async fn download_once(
        &self,
        id: &str,
        pause: &Flag,
        cancel: &Flag,
    ) -> Result<Outcome, ChatError> {
        let download = self.store.get_download(id).await?;
        let part_path = self.part_path(id);

        if cancel.is_set() {
            let _ = tokio::fs::remove_file(&part_path).await;
            self.store
                .set_download_status(id, DownloadStatus::Cancelled, None)
                .await?;
            return Ok(Outcome::Stopped);
        }
        if pause.is_set() {
            self.store
                .set_download_status(id, DownloadStatus::Paused, None)
                .await?;
            return Ok(Outcome::Stopped);
        }

        let mut offset = match tokio::fs::metadata(&part_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(&download.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Ok(Outcome::NetworkError(err.to_string())),
        };

        let status = response.status();
        let mut total: Option<i64> = None;

        if offset > 0 {
            if status == StatusCode::PARTIAL_CONTENT {
                // Content-Range: bytes <from>-<to>/<total>
                let range_total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.rsplit('/').next())
                    .and_then(|v| v.parse::<i64>().ok());
                if let (Some(expected), Some(remote)) = (download.expected_size, range_total) {
                    if expected != remote {
                        return Err(ChatError::download(format!(
                            "remote size changed: expected {expected}, server reports {remote}"
                        )));
                    }
                }
                total = range_total.or(download.expected_size);
            } else if status.is_success() {
                // Server ignored the range; start over.
                tracing::info!("download {id}: server does not resume, restarting");
                let _ = tokio::fs::remove_file(&part_path).await;
                offset = 0;
                total = response.content_length().map(|l| l as i64);
            } else if status.is_client_error() {
                return Err(ChatError::download(format!("http {status}")));
            } else {
                return Ok(Outcome::NetworkError(format!("http {status}")));
            }
        } else if status.is_success() {
            total = response.content_length().map(|l| l as i64);
        } else if status.is_client_error() {
            return Err(ChatError::download(format!("http {status}")));
        } else {
            return Ok(Outcome::NetworkError(format!("http {status}")));
        }

        if let Some(total) = total {
            self.store.set_download_expected_size(id, total).await?;
        }
        let total = total.or(download.expected_size);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .await
            .map_err(ChatError::download)?;

        let mut downloaded = offset as i64;
        let mut stream = response.bytes_stream();
        let mut last_emit = Instant::now();
        let mut window_start = Instant::now();
        let mut window_bytes: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if cancel.is_set() {
                drop(file);
                let _ = tokio::fs::remove_file(&part_path).await;
                self.store
                    .set_download_status(id, DownloadStatus::Cancelled, None)
                    .await?;
                return Ok(Outcome::Stopped);
            }
            if pause.is_set() {
                file.flush().await.map_err(ChatError::download)?;
                self.store.set_download_progress(id, downloaded).await?;
                self.store
                    .set_download_status(id, DownloadStatus::Paused, None)
                    .await?;
                return Ok(Outcome::Stopped);
            }

            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    let _ = file.flush().await;
                    let _ = self.store.set_download_progress(id, downloaded).await;
                    return Ok(Outcome::NetworkError(err.to_string()));
                }
            };
            file.write_all(&bytes).await.map_err(ChatError::download)?;
            downloaded += bytes.len() as i64;
            window_bytes += bytes.len() as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                let elapsed = window_start.elapsed().as_secs_f64().max(0.001);
                let speed = window_bytes as f64 / elapsed;
                self.store.set_download_progress(id, downloaded).await?;
                self.bus.emit(AppEvent::DownloadProgress {
                    id: id.to_string(),
                    downloaded_bytes: downloaded,
                    total_bytes: total,
                    speed_bps: speed,
                });
                last_emit = Instant::now();
                window_start = Instant::now();
                window_bytes = 0;
            }
        }

        file.flush().await.map_err(ChatError::download)?;
        drop(file);

        if let Some(total) = total {
            if downloaded < total {
                let _ = self.store.set_download_progress(id, downloaded).await;
                return Ok(Outcome::NetworkError(format!(
                    "connection closed at {downloaded} of {total} bytes"
                )));
            }
        }

        if let Some(expected) = download.checksum.as_deref() {
            let actual = hash_file(&part_path).await?;
            if !expected.eq_ignore_ascii_case(&actual) {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(ChatError::download(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }

        let destination = PathBuf::from(&download.destination_path);
        if let Some(parent) = destination.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::rename(&part_path, &destination)
            .await
            .map_err(ChatError::download)?;

        self.store.set_download_progress(id, downloaded).await?;
        self.store
            .set_download_status(id, DownloadStatus::Completed, None)
            .await?;
        self.bus.emit(AppEvent::DownloadComplete {
            id: id.to_string(),
            path: download.destination_path.clone(),
        });

        Ok(Outcome::Finished)
    }
}

enum Outcome {
    Finished,
    /// Paused or cancelled by flag; state already recorded.
    Stopped,
    /// Transient failure, caller may retry with backoff.
    NetworkError(String),
}

async fn hash_file(path: &Path) -> Result<String, ChatError> {
    let mut file = tokio::fs::File::open(path).await.map_err(ChatError::download)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(ChatError::download)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn filename_from_url(url: &str) -> Result<String, ChatError> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ChatError::validation("cannot derive a filename from the url"))?;
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.trim_matches('.').is_empty() {
        return Err(ChatError::validation("cannot derive a filename from the url"));
    }
    Ok(safe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_extraction_strips_query_and_sanitizes() {
        assert_eq!(
            filename_from_url("https://host/models/llama-3.Q4_K_M.gguf?download=true").unwrap(),
            "llama-3.Q4_K_M.gguf"
        );
        assert_eq!(
            filename_from_url("https://host/a/weird name.bin").unwrap(),
            "weird_name.bin"
        );
        assert!(filename_from_url("https://host/").is_err());
    }

    #[tokio::test]
    async fn hash_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let digest = hash_file(&path).await.unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn recover_pauses_dangling_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(AppPaths::at(dir.path().to_path_buf()));
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::default();
        let manager = DownloadManager::new(store.clone(), paths, bus);

        let download = store
            .create_download("http://localhost/m.gguf", "/tmp/m.gguf", DownloadKind::Model, None)
            .await
            .unwrap();
        store
            .set_download_status(&download.id, DownloadStatus::Downloading, None)
            .await
            .unwrap();

        manager.recover().await.unwrap();
        let recovered = store.get_download(&download.id).await.unwrap();
        assert_eq!(recovered.status, DownloadStatus::Paused);
    }
}
