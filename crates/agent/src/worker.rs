//! Worker CLI lifecycle: spawn, readiness probe, attach, exit watching.
//!
//! One worker per project at a time, keyed by project id. A worker goes
//! absent → starting → ready; readiness is observable only through the
//! health probe, never through process-aliveness. The port lease is released
//! whenever the process dies, whether at startup or later.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use {
    tokio::process::{Child, Command},
    tracing::{debug, info, warn},
};

use octo_protocol::{
    HEALTH_PROBE_INTERVAL_MS, RUN_TASK_TIMEOUT_SECS, START_TIMEOUT_SECS, error_codes,
};

use crate::ports::{PortAllocator, PortExhausted};

/// Captured output is truncated beyond this.
const MAX_OUTPUT_BYTES: usize = 200 * 1024; // 200KB

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    PortExhausted(#[from] PortExhausted),

    #[error("worker did not become ready within the start timeout")]
    StartTimeout,

    #[error("worker exited before becoming ready")]
    ExitedEarly,

    #[error("task did not finish within the deadline")]
    RunTimeout,

    #[error("failed to start worker: {0}")]
    Spawn(String),
}

impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PortExhausted(_) => error_codes::PORT_EXHAUSTED,
            Self::StartTimeout | Self::ExitedEarly | Self::RunTimeout => {
                error_codes::START_TIMEOUT
            },
            Self::Spawn(_) => error_codes::INTERNAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The worker CLI binary, e.g. `opencode`.
    pub cli_bin: String,
    pub start_timeout: Duration,
    pub run_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cli_bin: "opencode".into(),
            start_timeout: Duration::from_secs(START_TIMEOUT_SECS),
            run_timeout: Duration::from_secs(RUN_TASK_TIMEOUT_SECS),
            probe_interval: Duration::from_millis(HEALTH_PROBE_INTERVAL_MS),
        }
    }
}

/// A worker that answered its health probe.
#[derive(Debug, Clone, Copy)]
pub struct ReadyWorker {
    pub port: u16,
    pub reused: bool,
}

/// Result of an attached `run`.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

struct RunningWorker {
    port: u16,
}

pub struct WorkerSupervisor {
    config: WorkerConfig,
    ports: Arc<PortAllocator>,
    http: reqwest::Client,
    running: Arc<tokio::sync::Mutex<HashMap<String, RunningWorker>>>,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerConfig, ports: Arc<PortAllocator>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            config,
            ports,
            http,
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Reuse the ready worker for this project or start one: allocate a
    /// port, spawn `<cli> serve`, and probe `/global/health` until it
    /// answers 200. On timeout the process is killed and the port released.
    pub async fn ensure_running(
        &self,
        project_id: &str,
        project_path: &Path,
    ) -> Result<ReadyWorker, WorkerError> {
        {
            let running = self.running.lock().await;
            if let Some(worker) = running.get(project_id) {
                debug!(project_id, port = worker.port, "reusing running worker");
                return Ok(ReadyWorker {
                    port: worker.port,
                    reused: true,
                });
            }
        }

        let port = self.ports.allocate(project_id)?;
        let mut command = Command::new(&self.config.cli_bin);
        command
            .arg("serve")
            .args(["--hostname", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .current_dir(project_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(project_id);
                return Err(WorkerError::Spawn(e.to_string()));
            },
        };
        info!(project_id, port, cli = %self.config.cli_bin, "worker starting");

        let deadline = tokio::time::Instant::now() + self.config.start_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                warn!(project_id, %status, "worker exited during startup");
                self.ports.release(project_id);
                return Err(WorkerError::ExitedEarly);
            }
            if probe_health(&self.http, port).await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                self.ports.release(project_id);
                return Err(WorkerError::StartTimeout);
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }

        {
            let mut running = self.running.lock().await;
            running.insert(project_id.to_string(), RunningWorker { port });
        }
        self.spawn_exit_watcher(project_id.to_string(), child);
        info!(project_id, port, "worker ready");
        Ok(ReadyWorker {
            port,
            reused: false,
        })
    }

    /// `<cli> run --attach http://127.0.0.1:<port> <prompt>` in the project
    /// directory, bounded by the task deadline.
    pub async fn run_attached(
        &self,
        port: u16,
        project_path: &Path,
        prompt: &str,
    ) -> Result<TaskOutput, WorkerError> {
        let mut command = Command::new(&self.config.cli_bin);
        command
            .arg("run")
            .arg("--attach")
            .arg(format!("http://127.0.0.1:{port}"))
            .arg(prompt)
            .current_dir(project_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        let output = tokio::time::timeout(self.config.run_timeout, child.wait_with_output())
            .await
            .map_err(|_| WorkerError::RunTimeout)?
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        truncate_output(&mut stdout, MAX_OUTPUT_BYTES);
        truncate_output(&mut stderr, MAX_OUTPUT_BYTES);
        Ok(TaskOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Observe the child until it exits, then clear the registration and
    /// release the port.
    fn spawn_exit_watcher(&self, project_id: String, mut child: Child) {
        let running = Arc::clone(&self.running);
        let ports = Arc::clone(&self.ports);
        tokio::spawn(async move {
            let status = child.wait().await;
            info!(project_id, ?status, "worker exited");
            running.lock().await.remove(&project_id);
            ports.release(&project_id);
        });
    }

    #[cfg(test)]
    pub(crate) async fn insert_ready_for_tests(&self, project_id: &str, port: u16) {
        self.running
            .lock()
            .await
            .insert(project_id.to_string(), RunningWorker { port });
    }
}

async fn probe_health(http: &reqwest::Client, port: u16) -> bool {
    match http
        .get(format!("http://127.0.0.1:{port}/global/health"))
        .send()
        .await
    {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(_) => false,
    }
}

fn truncate_output(output: &mut String, max_bytes: usize) {
    if output.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str("\n... [output truncated]");
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, axum::routing::get};

    fn supervisor(cli_bin: &str, start_timeout: Duration, ports: Arc<PortAllocator>) -> WorkerSupervisor {
        WorkerSupervisor::new(
            WorkerConfig {
                cli_bin: cli_bin.into(),
                start_timeout,
                run_timeout: Duration::from_secs(5),
                probe_interval: Duration::from_millis(50),
            },
            ports,
        )
    }

    #[tokio::test]
    async fn start_timeout_kills_and_releases_port() {
        let ports = Arc::new(PortAllocator::new(5000..=5001));
        // `yes` runs forever and never serves the health endpoint.
        let supervisor = supervisor("yes", Duration::from_millis(250), Arc::clone(&ports));
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .ensure_running("p-1", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::StartTimeout));
        assert_eq!(err.code(), "start.timeout");
        assert!(ports.lease("p-1").is_none());
        assert_eq!(supervisor.running_count().await, 0);
    }

    #[tokio::test]
    async fn spawn_failure_releases_port() {
        let ports = Arc::new(PortAllocator::new(5000..=5001));
        let supervisor = supervisor(
            "/definitely/not/a/real/binary",
            Duration::from_millis(250),
            Arc::clone(&ports),
        );
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .ensure_running("p-1", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
        assert!(ports.lease("p-1").is_none());
    }

    #[tokio::test]
    async fn early_exit_is_detected_and_releases_port() {
        let ports = Arc::new(PortAllocator::new(5000..=5001));
        // `sleep serve --hostname …` rejects its arguments and exits at once.
        let supervisor = supervisor("sleep", Duration::from_secs(5), Arc::clone(&ports));
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .ensure_running("p-1", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ExitedEarly));
        assert_eq!(err.code(), "start.timeout");
        assert!(ports.lease("p-1").is_none());
    }

    #[tokio::test]
    async fn ready_worker_is_reused() {
        let ports = Arc::new(PortAllocator::new(5000..=5001));
        let supervisor = supervisor("yes", Duration::from_millis(100), Arc::clone(&ports));
        supervisor.insert_ready_for_tests("p-1", 5000).await;

        let dir = tempfile::tempdir().unwrap();
        let ready = supervisor.ensure_running("p-1", dir.path()).await.unwrap();
        assert_eq!(ready.port, 5000);
        assert!(ready.reused);
    }

    #[tokio::test]
    async fn probe_accepts_200_and_rejects_silence() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/global/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        // Give the stub server a beat to accept connections.
        for _ in 0..20 {
            if probe_health(&http, port).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(probe_health(&http, port).await);

        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);
        assert!(!probe_health(&http, dead_port).await);
    }

    #[tokio::test]
    async fn run_attached_captures_output() {
        let ports = Arc::new(PortAllocator::new(5000..=5001));
        let supervisor = supervisor("echo", Duration::from_millis(100), ports);
        let dir = tempfile::tempdir().unwrap();

        let output = supervisor
            .run_attached(5000, dir.path(), "say hello")
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("run --attach http://127.0.0.1:5000 say hello"));
    }

    #[tokio::test]
    async fn run_attached_enforces_deadline() {
        let ports = Arc::new(PortAllocator::new(5000..=5001));
        let config = WorkerConfig {
            cli_bin: "yes".into(),
            start_timeout: Duration::from_millis(100),
            run_timeout: Duration::from_millis(200),
            probe_interval: Duration::from_millis(50),
        };
        let supervisor = WorkerSupervisor::new(config, ports);
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .run_attached(5000, dir.path(), "never finishes")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::RunTimeout));
        assert_eq!(err.code(), "start.timeout");
    }

    #[test]
    fn truncation_appends_marker() {
        let mut s = "x".repeat(100);
        truncate_output(&mut s, 10);
        assert!(s.starts_with("xxxxxxxxxx"));
        assert!(s.ends_with("[output truncated]"));

        let mut short = "ok".to_string();
        truncate_output(&mut short, 10);
        assert_eq!(short, "ok");
    }
}
