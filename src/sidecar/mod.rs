use std::collections::VecDeque;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;

use crate::core::config::{AppPaths, GenerationSettings};
use crate::core::errors::ChatError;
use crate::events::{AppEvent, EventBus};

const HEALTH_RETRY_MS: u64 = 500;
const STOP_GRACE_MS: u64 = 2000;
const STREAM_CHANNEL_CAPACITY: usize = 64;
const STDERR_TAIL_LINES: usize = 40;

/// Observable sidecar lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarStatus {
    NotFound,
    NotLoaded,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: SidecarStatus,
    pub message: Option<String>,
}

/// Single-shot cancellation flag observed by the generation worker between
/// tokens. Firing it finalizes the stream with `Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

impl GenerationParams {
    pub fn from_settings(settings: &GenerationSettings, stop: Vec<String>) -> Self {
        Self {
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
            stop,
        }
    }
}

/// One element of a generation stream. `Done`, `Cancelled` and `Error` are
/// terminal.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done,
    Cancelled,
    Error(ChatError),
}

struct SidecarState {
    child: Option<Child>,
    port: u16,
    binary_path: Option<PathBuf>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
}

/// Supervises the external inference process: spawn, health, streaming
/// generation, cancellation, and teardown. One generation at a time.
#[derive(Clone)]
pub struct SidecarSupervisor {
    paths: Arc<AppPaths>,
    inner: Arc<Mutex<SidecarState>>,
    client: Client,
    bus: EventBus,
    status_tx: Arc<watch::Sender<StatusReport>>,
    status_rx: watch::Receiver<StatusReport>,
    generating: Arc<AtomicBool>,
}

impl SidecarSupervisor {
    pub fn new(paths: Arc<AppPaths>, bus: EventBus) -> Self {
        let binary_path = resolve_binary(&paths);
        let initial = StatusReport {
            status: if binary_path.is_some() {
                SidecarStatus::NotLoaded
            } else {
                SidecarStatus::NotFound
            },
            message: None,
        };
        if binary_path.is_none() {
            tracing::warn!("inference binary not found; generation is unavailable until installed");
        }

        let (status_tx, status_rx) = watch::channel(initial);
        Self {
            paths,
            inner: Arc::new(Mutex::new(SidecarState {
                child: None,
                port: 0,
                binary_path,
                stderr_tail: Arc::new(std::sync::Mutex::new(VecDeque::new())),
            })),
            client: Client::new(),
            bus,
            status_tx: Arc::new(status_tx),
            status_rx,
            generating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current status; safe to poll at UI cadence without touching any lock.
    pub fn status(&self) -> StatusReport {
        self.status_rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.status_rx.borrow().status == SidecarStatus::Ready
    }

    /// Re-scan for the inference binary (after a download completes).
    pub async fn refresh_binary_path(&self) -> Option<PathBuf> {
        let resolved = resolve_binary(&self.paths);
        let mut state = self.inner.lock().await;
        state.binary_path = resolved.clone();
        if resolved.is_none() && state.child.is_none() {
            self.set_status(SidecarStatus::NotFound, None);
        } else if state.child.is_none() {
            self.set_status(SidecarStatus::NotLoaded, None);
        }
        resolved
    }

    /// Spawn the sidecar for the configured model and wait for its health
    /// probe. Transitions: loading -> ready, or error on probe timeout /
    /// early exit.
    pub async fn start(&self, settings: &GenerationSettings) -> Result<(), ChatError> {
        let Some(model_path) = settings.model_path.clone() else {
            return Err(ChatError::not_found("no model configured"));
        };
        if !model_path.exists() {
            return Err(ChatError::not_found(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let mut state = self.inner.lock().await;
        let Some(binary_path) = state.binary_path.clone() else {
            self.set_status(SidecarStatus::NotFound, None);
            return Err(ChatError::sidecar("inference binary not found"));
        };

        if let Some(mut child) = state.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        let port = if settings.sidecar_port > 0 {
            settings.sidecar_port
        } else {
            find_free_port()?
        };

        let mut command = Command::new(&binary_path);
        command
            .arg("-m")
            .arg(&model_path)
            .arg("--port")
            .arg(port.to_string())
            .arg("-c")
            .arg(settings.context_size.to_string())
            .arg("--n-gpu-layers")
            .arg(settings.gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            self.set_status(SidecarStatus::Error, Some(e.to_string()));
            ChatError::sidecar(format!("failed to spawn inference process: {e}"))
        })?;

        let tail = Arc::new(std::sync::Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("[sidecar] {}", line);
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() >= STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            });
        }

        state.child = Some(child);
        state.port = port;
        state.stderr_tail = tail;
        drop(state);

        self.set_status(SidecarStatus::Loading, None);

        if let Err(err) = self.wait_for_health(port, settings.health_timeout_secs).await {
            let tail = self.stderr_tail().await;
            self.teardown().await;
            let message = if tail.is_empty() {
                err.to_string()
            } else {
                format!("{err}; stderr: {tail}")
            };
            self.set_status(SidecarStatus::Error, Some(message.clone()));
            return Err(ChatError::sidecar(message));
        }

        self.set_status(SidecarStatus::Ready, None);
        Ok(())
    }

    /// Stop the sidecar, allowing a short grace period before the hard kill.
    pub async fn stop(&self) {
        let mut state = self.inner.lock().await;
        if let Some(mut child) = state.child.take() {
            let _ = child.start_kill();
            let waited =
                tokio::time::timeout(Duration::from_millis(STOP_GRACE_MS), child.wait()).await;
            if waited.is_err() {
                let _ = child.kill().await;
            }
        }
        let has_binary = state.binary_path.is_some();
        drop(state);

        self.set_status(
            if has_binary {
                SidecarStatus::NotLoaded
            } else {
                SidecarStatus::NotFound
            },
            None,
        );
    }

    /// Begin a streaming generation. Only one generation may run at a time;
    /// a second call while one is active fails with `Busy`.
    pub async fn generate(
        &self,
        prompt: String,
        params: GenerationParams,
        cancel: CancelHandle,
    ) -> Result<mpsc::Receiver<StreamEvent>, ChatError> {
        if !self.is_ready() {
            return Err(ChatError::sidecar(format!(
                "sidecar is {:?}",
                self.status().status
            )));
        }
        if self
            .generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ChatError::busy("a generation is already in flight"));
        }
        let slot = GenerationSlot(self.generating.clone());

        let port = self.inner.lock().await.port;
        let url = format!("http://127.0.0.1:{port}/completion");
        let body = json!({
            "prompt": prompt,
            "stream": true,
            "n_predict": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stop": params.stop,
        });

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let supervisor = self.clone();

        tokio::spawn(async move {
            let _slot = slot;

            let response = match client.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(err) => {
                    let event = supervisor.classify_stream_failure(err.to_string()).await;
                    let _ = tx.send(event).await;
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let _ = tx
                    .send(StreamEvent::Error(ChatError::sidecar(format!(
                        "generation request failed: {status} {text}"
                    ))))
                    .await;
                return;
            }

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut finished = false;

            'outer: while let Some(item) = stream.next().await {
                if cancel.is_cancelled() {
                    let _ = tx.send(StreamEvent::Cancelled).await;
                    return;
                }
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let event = supervisor.classify_stream_failure(err.to_string()).await;
                        let _ = tx.send(event).await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(chunk) = parse_stream_line(&line) else {
                        continue;
                    };
                    if !chunk.content.is_empty() {
                        // A full buffer applies back-pressure to the sidecar
                        // read loop; the engine normally drains promptly.
                        if tx.send(StreamEvent::Token(chunk.content)).await.is_err() {
                            return;
                        }
                    }
                    if chunk.stop {
                        finished = true;
                        break 'outer;
                    }
                }
            }

            if finished {
                let _ = tx.send(StreamEvent::Done).await;
            } else if cancel.is_cancelled() {
                let _ = tx.send(StreamEvent::Cancelled).await;
            } else {
                // Stream ended without a stop marker: the sidecar went away.
                let event = supervisor
                    .classify_stream_failure("stream ended unexpectedly".to_string())
                    .await;
                let _ = tx.send(event).await;
            }
        });

        Ok(rx)
    }

    /// Count tokens via the sidecar tokenizer, falling back to the character
    /// heuristic when it is unavailable.
    pub async fn token_count(&self, text: &str) -> usize {
        if self.is_ready() {
            let port = self.inner.lock().await.port;
            let url = format!("http://127.0.0.1:{port}/tokenize");
            let body = json!({ "content": text });
            if let Ok(response) = self.client.post(&url).json(&body).send().await {
                if let Ok(payload) = response.json::<Value>().await {
                    if let Some(tokens) = payload.get("tokens").and_then(|v| v.as_array()) {
                        return tokens.len();
                    }
                }
            }
        }
        heuristic_token_count(text)
    }

    async fn wait_for_health(&self, port: u16, timeout_secs: u64) -> Result<(), ChatError> {
        let url = format!("http://127.0.0.1:{port}/health");
        let retries = (timeout_secs * 1000 / HEALTH_RETRY_MS).max(1);

        for _ in 0..retries {
            if let Some(code) = self.child_exit_code().await {
                return Err(ChatError::sidecar(format!(
                    "inference process exited before ready ({code})"
                )));
            }
            if let Ok(response) = self.client.get(&url).send().await {
                if response.status().is_success() {
                    if let Ok(payload) = response.json::<Value>().await {
                        if payload.get("status").and_then(|v| v.as_str()) == Some("ok") {
                            return Ok(());
                        }
                    } else {
                        return Ok(());
                    }
                }
            }
            sleep(Duration::from_millis(HEALTH_RETRY_MS)).await;
        }

        Err(ChatError::sidecar("timed out waiting for sidecar health"))
    }

    /// Decide whether a mid-stream failure was a crash (process exited) or a
    /// transport error, updating status accordingly.
    async fn classify_stream_failure(&self, detail: String) -> StreamEvent {
        if let Some(code) = self.child_exit_code().await {
            let tail = self.stderr_tail().await;
            let message = if tail.is_empty() {
                format!("inference process exited mid-stream ({code})")
            } else {
                format!("inference process exited mid-stream ({code}); stderr: {tail}")
            };
            self.teardown().await;
            self.set_status(SidecarStatus::Error, Some(message.clone()));
            StreamEvent::Error(ChatError::GenerationInterrupted(message))
        } else {
            StreamEvent::Error(ChatError::sidecar(detail))
        }
    }

    async fn child_exit_code(&self) -> Option<String> {
        let mut state = self.inner.lock().await;
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    }

    async fn stderr_tail(&self) -> String {
        let state = self.inner.lock().await;
        let tail = state.stderr_tail.lock().ok();
        tail.map(|t| t.iter().cloned().collect::<Vec<_>>().join(" | "))
            .unwrap_or_default()
    }

    async fn teardown(&self) {
        let mut state = self.inner.lock().await;
        if let Some(mut child) = state.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    fn set_status(&self, status: SidecarStatus, message: Option<String>) {
        let report = StatusReport {
            status,
            message: message.clone(),
        };
        let _ = self.status_tx.send(report);
        self.bus.emit(AppEvent::ModelStatus { status, message });
    }
}

/// Releases the single-generation slot on every exit path, including panics.
struct GenerationSlot(Arc<AtomicBool>);

impl Drop for GenerationSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct StreamChunk {
    content: String,
    stop: bool,
}

/// Parse one SSE line of the sidecar's completion stream.
fn parse_stream_line(line: &str) -> Option<StreamChunk> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Some(StreamChunk {
            content: String::new(),
            stop: payload == "[DONE]",
        });
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    Some(StreamChunk {
        content: value
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        stop: value.get("stop").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}

pub fn heuristic_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Locate the inference binary: env override, then the managed `bin/`
/// directory, then `PATH`.
pub fn resolve_binary(paths: &AppPaths) -> Option<PathBuf> {
    for key in ["HEARTH_LLAMA_SERVER", "LLAMA_SERVER_PATH"] {
        if let Ok(value) = env::var(key) {
            let path = PathBuf::from(value);
            if path.exists() {
                return Some(path);
            }
        }
    }

    if let Some(found) = find_server_executable(&paths.bin_dir) {
        return Some(found);
    }

    which::which("llama-server").ok()
}

fn find_server_executable(root: &Path) -> Option<PathBuf> {
    let exe_name = if cfg!(target_os = "windows") {
        "llama-server.exe"
    } else {
        "llama-server"
    };

    if !root.exists() {
        return None;
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(exe_name) {
                return Some(path);
            }
        }
    }

    None
}

fn find_free_port() -> Result<u16, ChatError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(ChatError::sidecar)?;
    let port = listener.local_addr().map_err(ChatError::sidecar)?.port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stream_line_extracts_content_and_stop() {
        let chunk = parse_stream_line(r#"data: {"content":"Hel","stop":false}"#).unwrap();
        assert_eq!(chunk.content, "Hel");
        assert!(!chunk.stop);

        let last = parse_stream_line(r#"data: {"content":"","stop":true}"#).unwrap();
        assert!(last.stop);

        let done = parse_stream_line("data: [DONE]").unwrap();
        assert!(done.stop);

        assert!(parse_stream_line(": keep-alive").is_none());
        assert!(parse_stream_line("").is_none());
    }

    #[test]
    fn cancel_handle_is_single_shot_and_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());
        handle.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn heuristic_counts_quarters() {
        assert_eq!(heuristic_token_count("abcdefgh"), 2);
        assert_eq!(heuristic_token_count(""), 0);
    }
}
