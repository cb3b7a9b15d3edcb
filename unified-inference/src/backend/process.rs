//! Process backend.
//!
//! Each model runs in its own inference server subprocess bound to the
//! descriptor's port. The backend polls `/health` until the server is ready,
//! keeps the tail of its output for diagnostics, and terminates it with SIGTERM
//! followed by a kill after the grace period.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use unified_inference_common::{BackendKind, ExecutionMode, LifecycleState, ModelFormat};

use super::{Backend, BackendError, BackendMetrics, BackendSettings, BackendStatus};
use crate::config::ProcessConfig;
use crate::registry::ModelDescriptor;

/// Longest error text kept from a dead process.
const MAX_DIED_OUTPUT_CHARS: usize = 500;
/// How long to wait for output readers to drain after the process exits.
const OUTPUT_DRAIN_TIMEOUT_MS: u64 = 1000;

/// Arguments for the server command line, after `process.program`.
pub fn command_args(descriptor: &ModelDescriptor, process: &ProcessConfig) -> Vec<String> {
    let mut args = process.args.clone();
    args.extend([
        "--model-path".to_string(),
        descriptor.model_path.clone(),
        "--host".to_string(),
        process.host.clone(),
        "--port".to_string(),
        descriptor.port.to_string(),
        "--max-running-requests".to_string(),
        process.max_running_requests.to_string(),
        "--max-total-tokens".to_string(),
        process.max_total_tokens.to_string(),
    ]);

    if descriptor.gpu_id.is_some() {
        args.extend(["--tp".to_string(), "1".to_string()]);
    }
    if descriptor.is_embedding {
        args.push("--is-embedding".to_string());
    }
    if descriptor.trust_remote_code {
        args.push("--trust-remote-code".to_string());
    }
    if let Some(dtype) = &descriptor.dtype {
        args.extend(["--dtype".to_string(), dtype.clone()]);
    }
    if descriptor.format == ModelFormat::Quantized {
        args.extend(["--quantization".to_string(), "awq".to_string()]);
    }

    args.extend(process.extra_args.iter().cloned());
    args
}

/// Environment for the server process. GPU descriptors are pinned to one device.
pub fn command_env(descriptor: &ModelDescriptor) -> Vec<(String, String)> {
    match descriptor.execution_mode {
        ExecutionMode::Gpu => vec![(
            "CUDA_VISIBLE_DEVICES".to_string(),
            descriptor.gpu_id.unwrap_or(0).to_string(),
        )],
        ExecutionMode::Cpu => vec![],
    }
}

/// Bounded buffer of the most recent output lines.
#[derive(Debug)]
struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn clear(&mut self) {
        self.lines.clear();
    }

    /// Joined output, cut to the last `max_chars` characters.
    fn render(&self, max_chars: usize) -> String {
        let joined = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        let count = joined.chars().count();
        if count <= max_chars {
            joined
        } else {
            joined.chars().skip(count - max_chars).collect()
        }
    }
}

/// A model served by an inference server subprocess.
pub struct ProcessBackend {
    descriptor: Arc<ModelDescriptor>,
    settings: Arc<BackendSettings>,
    http_client: Client,
    status: BackendStatus,
    process: Mutex<Option<Child>>,
    output: Arc<StdMutex<OutputTail>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessBackend {
    pub fn new(
        descriptor: Arc<ModelDescriptor>,
        settings: Arc<BackendSettings>,
        http_client: Client,
    ) -> Self {
        let output = OutputTail::new(settings.process.output_tail_lines);
        Self {
            descriptor,
            settings,
            http_client,
            status: BackendStatus::new(),
            process: Mutex::new(None),
            output: Arc::new(StdMutex::new(output)),
            readers: Mutex::new(Vec::new()),
        }
    }

    async fn probe_health(&self) -> bool {
        let url = format!("{}/health", self.url());
        match self
            .http_client
            .get(&url)
            .timeout(self.settings.probe_timeout())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::trace!("Health probe of {} failed: {}", self.descriptor.name, e);
                false
            }
        }
    }

    /// Check if the server process is still alive.
    async fn is_process_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn spawn(&self) -> Result<Child, BackendError> {
        let process = &self.settings.process;
        let mut cmd = Command::new(&process.program);
        cmd.args(command_args(&self.descriptor, process))
            .envs(command_env(&self.descriptor))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|source| BackendError::Spawn {
            program: process.program.clone(),
            source,
        })
    }

    fn capture_output<R>(&self, stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = self.descriptor.name.clone();
        let tail = Arc::clone(&self.output);
        let log_output = self.settings.process.log_output;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if log_output {
                    tracing::info!(model = %name, "{}", line);
                } else {
                    tracing::debug!(model = %name, "{}", line);
                }
                if let Ok(mut tail) = tail.lock() {
                    tail.push(line);
                }
            }
        })
    }

    /// Output of a process that has exited, once its readers reached EOF.
    async fn died_output(&self) -> String {
        let readers: Vec<_> = self.readers.lock().await.drain(..).collect();
        for reader in readers {
            let _ = tokio::time::timeout(Duration::from_millis(OUTPUT_DRAIN_TIMEOUT_MS), reader)
                .await;
        }
        self.output
            .lock()
            .map(|tail| tail.render(MAX_DIED_OUTPUT_CHARS))
            .unwrap_or_default()
    }

    /// Poll the health endpoint until ready, the process dies, or the timeout elapses.
    async fn wait_for_ready(&self) -> Result<(), BackendError> {
        let timeout = self.settings.startup_timeout;
        let poll_interval = Duration::from_millis(self.settings.process.startup_poll_interval_ms);
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                return Err(BackendError::StartupTimeout(timeout));
            }

            if !self.is_process_alive().await {
                let output = self.died_output().await;
                // Reap the exited child.
                self.process.lock().await.take();
                return Err(BackendError::Died(output));
            }

            if self.probe_health().await {
                tracing::info!(
                    "Backend {} ready on port {} ({:?})",
                    self.descriptor.name,
                    self.descriptor.port,
                    start.elapsed()
                );
                return Ok(());
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            tokio::time::sleep(poll_interval.min(remaining).max(Duration::from_millis(1))).await;
        }
    }

    /// Terminate the server process gracefully.
    async fn terminate(&self, mut child: Child) -> Result<(), BackendError> {
        // Try SIGTERM first on Unix
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        let grace = self.settings.shutdown_grace_period;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("Backend {} exited with {}", self.descriptor.name, status);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for backend {}: {}", self.descriptor.name, e);
                child
                    .kill()
                    .await
                    .map_err(|e| BackendError::Stop(e.to_string()))
            }
            Err(_timeout) => {
                tracing::warn!(
                    "Backend {} didn't stop within {:?}, killing",
                    self.descriptor.name,
                    grace
                );
                child
                    .kill()
                    .await
                    .map_err(|e| BackendError::Stop(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    fn status(&self) -> &BackendStatus {
        &self.status
    }

    fn url(&self) -> String {
        self.settings.url_for(&self.descriptor)
    }

    async fn start(&self) -> Result<(), BackendError> {
        if self.status.state().await == LifecycleState::RunningHealthy
            && self.is_process_alive().await
        {
            return Ok(());
        }

        self.status.set_starting(None).await;

        // A server left over from a previous run may already own the port.
        if self.probe_health().await {
            tracing::info!(
                "Adopting backend {} already serving on port {}",
                self.descriptor.name,
                self.descriptor.port
            );
            self.status.set_ready().await;
            return Ok(());
        }

        if let Ok(mut tail) = self.output.lock() {
            tail.clear();
        }

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.status.fail(e.to_string()).await;
                return Err(e);
            }
        };

        let pid = child.id();
        {
            let mut readers = self.readers.lock().await;
            readers.clear();
            if let Some(stdout) = child.stdout.take() {
                readers.push(self.capture_output(stdout));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(self.capture_output(stderr));
            }
        }

        tracing::info!(
            "Spawned backend {} on port {} (pid: {:?})",
            self.descriptor.name,
            self.descriptor.port,
            pid
        );
        *self.process.lock().await = Some(child);
        self.status.set_starting(pid).await;

        match self.wait_for_ready().await {
            Ok(()) => {
                self.status.set_ready().await;
                Ok(())
            }
            Err(e) => {
                if matches!(e, BackendError::StartupTimeout(_)) {
                    if let Err(stop_err) = self.stop().await {
                        tracing::warn!(
                            "Failed to stop backend {} after startup timeout: {}",
                            self.descriptor.name,
                            stop_err
                        );
                    }
                }
                tracing::error!("Backend {} failed to start: {}", self.descriptor.name, e);
                self.status.fail(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), BackendError> {
        let child = self.process.lock().await.take();
        let result = match child {
            Some(child) => {
                tracing::info!("Stopping backend {}", self.descriptor.name);
                self.terminate(child).await
            }
            None => Ok(()),
        };
        self.status.set_stopped().await;
        result
    }

    async fn health_check(&self) -> bool {
        let healthy = self.probe_health().await;
        self.status.set_healthy(healthy).await;
        healthy
    }

    async fn metrics(&self) -> BackendMetrics {
        let url = format!("{}{}", self.url(), self.settings.process.metrics_path);
        let response = self
            .http_client
            .get(&url)
            .timeout(self.settings.probe_timeout())
            .send()
            .await;

        let details: Value = match response {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(value) => value,
                Err(_) => return BackendMetrics::default(),
            },
            _ => return BackendMetrics::default(),
        };

        let queue_length = ["queue_length", "num_requests_running"]
            .iter()
            .find_map(|key| details.get(*key).and_then(Value::as_u64))
            .unwrap_or(0);

        BackendMetrics {
            queue_length: u32::try_from(queue_length).unwrap_or(u32::MAX),
            capacity: self.settings.process.max_running_requests,
            details: Some(details),
        }
    }

    async fn has_exited(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            // Adopted servers have no handle and are never confirmed dead.
            None => false,
        }
    }
}
