//! Process Supervisor (§4.5): spawns backend binaries, wires them to a
//! private socket, monitors liveness, restarts on crash, tears down on
//! shutdown.
//!
//! State machine (unchanged from spec):
//! `stopped -[start]-> starting -[socket up]-> running`;
//! `running -[stop]-> stopped`;
//! `running -[child exit]-> error -[tick]-> starting`;
//! `starting|running -[stop]-> stopped`; `error -[stop]-> stopped`.
//!
//! The child process itself is owned by a dedicated watcher task spawned
//! at `start()` time, never by the handle map directly — `Child::wait`
//! can block for as long as the backend runs, and nothing else may hold
//! the handles lock for that long. The watcher reports exit through a
//! `watch` channel (not `Notify`: a notification fired before `stop()`
//! starts waiting on it would otherwise be lost).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::Config;
use crate::error::CoreError;
use crate::meta::{ProjectCollection, ProjectStatus};
use crate::unix_http;

const STOP_GRACE: Duration = Duration::from_secs(5);
const CRASH_RESTART_BASE: Duration = Duration::from_secs(5);
const CRASH_RESTART_MAX: Duration = Duration::from_secs(300);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime-only process handle; never persisted.
pub struct ProcessHandle {
    pub project_id: Uuid,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub started_at: i64,
    stopping: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

struct FailureTracking {
    consecutive_failures: u32,
}

pub struct Supervisor {
    config: Arc<Config>,
    projects: Arc<ProjectCollection>,
    handles: Mutex<HashMap<Uuid, ProcessHandle>>,
    backoff: Mutex<HashMap<Uuid, FailureTracking>>,
    unhealthy_observations: Mutex<HashMap<Uuid, u32>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Supervisor {
    pub fn new(config: Arc<Config>, projects: Arc<ProjectCollection>) -> Arc<Self> {
        Arc::new(Self {
            config,
            projects,
            handles: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            unhealthy_observations: Mutex::new(HashMap::new()),
        })
    }

    pub async fn is_running(&self, project_id: &Uuid) -> bool {
        self.handles.lock().await.contains_key(project_id)
    }

    pub async fn pid_of(&self, project_id: &Uuid) -> Option<u32> {
        self.handles.lock().await.get(project_id).map(|h| h.pid)
    }

    pub async fn unhealthy_count(&self, project_id: &Uuid) -> u32 {
        *self
            .unhealthy_observations
            .lock()
            .await
            .get(project_id)
            .unwrap_or(&0)
    }

    pub async fn start(self: &Arc<Self>, project_id: Uuid) -> Result<(), CoreError> {
        if self.handles.lock().await.contains_key(&project_id) {
            return Err(CoreError::Conflict(format!(
                "project {project_id} already has a running handle"
            )));
        }
        let project = self
            .projects
            .get(&project_id)
            .ok_or_else(|| CoreError::NotFound(project_id.to_string()))?;

        self.projects
            .update(&project_id, |p| p.status = ProjectStatus::Starting)?;

        let _ = std::fs::remove_file(&project.socket_path);

        // The child inherits the parent's environment (the default) plus
        // the two variables the backend contract requires.
        let mut command = Command::new(&project.binary_path);
        command
            .env("SOCKET_PATH", &project.socket_path)
            .env("PROJECT_ID", project_id.to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::Internal(format!("failed to spawn {project_id}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| CoreError::Internal("spawned child has no pid".into()))?;

        forward_child_output(&project_id, &mut child);

        let socket_ready =
            wait_for_socket(&project.socket_path, self.config.process_start_timeout).await;
        if !socket_ready {
            tracing::warn!(
                %project_id,
                socket = %project.socket_path.display(),
                "backend socket did not appear within the start timeout; leaving it starting"
            );
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(false);
        let handle = ProcessHandle {
            project_id,
            pid,
            socket_path: project.socket_path.clone(),
            started_at: now_ms(),
            stopping: Arc::clone(&stopping),
            exited: exit_rx,
        };
        self.handles.lock().await.insert(project_id, handle);

        if socket_ready {
            self.projects.update(&project_id, |p| {
                p.status = ProjectStatus::Running;
                p.pid = Some(pid);
            })?;
        } else {
            self.projects.update(&project_id, |p| {
                p.pid = Some(pid);
            })?;
        }

        self.spawn_exit_watcher(project_id, child, stopping, exit_tx);
        Ok(())
    }

    fn spawn_exit_watcher(
        self: &Arc<Self>,
        project_id: Uuid,
        mut child: Child,
        stopping: Arc<AtomicBool>,
        exit_tx: watch::Sender<bool>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let exit_status = child.wait().await;
            let _ = exit_tx.send(true);

            if stopping.load(Ordering::SeqCst) {
                // Expected: `stop()` already owns tearing this handle down.
                return;
            }

            // The handle may already be gone if a concurrent `stop()` won
            // the race right as the process exited on its own.
            let still_tracked = this.handles.lock().await.remove(&project_id).is_some();
            if !still_tracked {
                return;
            }
            tracing::warn!(%project_id, ?exit_status, "backend process exited");
            let _ = this
                .projects
                .update(&project_id, |p| p.status = ProjectStatus::Error);
            this.schedule_crash_restart(project_id).await;
        });
    }

    async fn schedule_crash_restart(self: &Arc<Self>, project_id: Uuid) {
        let delay = {
            let mut backoff = self.backoff.lock().await;
            let tracking = backoff
                .entry(project_id)
                .or_insert(FailureTracking {
                    consecutive_failures: 0,
                });
            tracking.consecutive_failures += 1;
            let exp = tracking.consecutive_failures.min(8);
            let computed = CRASH_RESTART_BASE.saturating_mul(1u32 << (exp.saturating_sub(1)));
            computed.min(CRASH_RESTART_MAX)
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(delay).await;
            // Re-read the project record: if an intervening manual
            // stop/delete moved status away from `error`, don't restart.
            match this.projects.get(&project_id) {
                Some(project) if project.status == ProjectStatus::Error => {
                    if let Err(err) = this.start(project_id).await {
                        tracing::error!(%project_id, %err, "crash-restart attempt failed");
                    }
                }
                _ => {}
            }
        });
    }

    /// Resets a project's crash-backoff counter back to the base delay;
    /// called when a health check observes the project as healthy again.
    pub async fn reset_backoff(&self, project_id: &Uuid) {
        self.backoff.lock().await.remove(project_id);
    }

    pub async fn stop(&self, project_id: Uuid) -> Result<(), CoreError> {
        let handle = self
            .handles
            .lock()
            .await
            .remove(&project_id)
            .ok_or_else(|| CoreError::NotFound(project_id.to_string()))?;
        stop_handle(handle).await;
        self.backoff.lock().await.remove(&project_id);
        self.projects.update(&project_id, |p| {
            p.status = ProjectStatus::Stopped;
            p.pid = None;
        })?;
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, project_id: Uuid) -> Result<(), CoreError> {
        if self.handles.lock().await.contains_key(&project_id) {
            self.stop(project_id).await?;
        }
        self.start(project_id).await
    }

    pub async fn start_all(self: &Arc<Self>) {
        for project in self.projects.list() {
            if let Err(err) = self.start(project.id).await {
                tracing::error!(project_id = %project.id, %err, "failed to start project at boot");
            }
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<ProcessHandle> = {
            let mut guard = self.handles.lock().await;
            guard.drain().map(|(_, h)| h).collect()
        };
        let project_ids: Vec<Uuid> = handles.iter().map(|h| h.project_id).collect();

        let mut stops = tokio::task::JoinSet::new();
        for handle in handles {
            stops.spawn(stop_handle(handle));
        }
        while stops.join_next().await.is_some() {}

        for project_id in project_ids {
            let _ = self.projects.update(&project_id, |p| {
                p.status = ProjectStatus::Stopped;
                p.pid = None;
            });
        }
    }

    /// Background health-check loop; run as a spawned task for the
    /// lifetime of the process.
    pub async fn run_health_check_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let socket_paths: Vec<(Uuid, PathBuf)> = {
                let handles = self.handles.lock().await;
                handles
                    .values()
                    .map(|h| (h.project_id, h.socket_path.clone()))
                    .collect()
            };
            for (project_id, socket_path) in socket_paths {
                let healthy = unix_http::health_check(&socket_path, HEALTH_CHECK_TIMEOUT).await;
                if healthy {
                    self.unhealthy_observations.lock().await.remove(&project_id);
                    self.reset_backoff(&project_id).await;
                } else {
                    *self
                        .unhealthy_observations
                        .lock()
                        .await
                        .entry(project_id)
                        .or_insert(0) += 1;
                    tracing::warn!(%project_id, "health check failed");
                }
            }
        }
    }
}

async fn stop_handle(mut handle: ProcessHandle) {
    handle.stopping.store(true, Ordering::SeqCst);
    let pid = Pid::from_raw(handle.pid as i32);
    if signal::kill(pid, Signal::SIGTERM).is_ok() {
        let graceful = tokio::time::timeout(STOP_GRACE, handle.exited.wait_for(|exited| *exited))
            .await
            .is_ok();
        if !graceful {
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = handle.exited.wait_for(|exited| *exited).await;
        }
    }
    let _ = std::fs::remove_file(&handle.socket_path);
}

async fn wait_for_socket(path: &std::path::Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
}

fn forward_child_output(project_id: &Uuid, child: &mut Child) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    if let Some(stdout) = child.stdout.take() {
        let project_id = *project_id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(%project_id, backend = "stdout", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let project_id = *project_id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(%project_id, backend = "stderr", "{line}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::tempdir;

    // These tests exercise only the parts of the supervisor that don't
    // require a real HTTP server on the other end of the socket: spawn,
    // crash-detection, and stop semantics against a script that just
    // touches its socket path as a plain file and sleeps, or exits
    // immediately to trigger the crash path.

    #[tokio::test]
    #[serial]
    async fn start_marks_project_running_once_socket_appears() {
        let dir = tempdir().unwrap();
        let sockets_dir = dir.path().join("sockets");
        std::fs::create_dir_all(&sockets_dir).unwrap();
        let projects_dir = dir.path().join("projects");
        std::fs::create_dir_all(&projects_dir).unwrap();

        let projects = Arc::new(
            crate::meta::ProjectCollection::open(
                dir.path().join("projects.db"),
                &projects_dir,
                &sockets_dir,
            )
            .unwrap(),
        );
        let uploaded = projects
            .upload("demo".into(), b"#!/bin/sh\ntouch \"$SOCKET_PATH\"; sleep 5\n")
            .unwrap();

        let mut config = Config::from_env_for_test();
        config.process_start_timeout = Duration::from_secs(2);
        let supervisor = Supervisor::new(Arc::new(config), Arc::clone(&projects));

        supervisor.start(uploaded.id).await.unwrap();
        assert!(supervisor.is_running(&uploaded.id).await);
        let reloaded = projects.get(&uploaded.id).unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Running);

        supervisor.stop(uploaded.id).await.unwrap();
        assert!(!supervisor.is_running(&uploaded.id).await);
        let reloaded = projects.get(&uploaded.id).unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Stopped);
    }

    #[tokio::test]
    #[serial]
    async fn start_leaves_status_starting_when_socket_never_appears() {
        let dir = tempdir().unwrap();
        let sockets_dir = dir.path().join("sockets");
        std::fs::create_dir_all(&sockets_dir).unwrap();
        let projects_dir = dir.path().join("projects");
        std::fs::create_dir_all(&projects_dir).unwrap();

        let projects = Arc::new(
            crate::meta::ProjectCollection::open(
                dir.path().join("projects.db"),
                &projects_dir,
                &sockets_dir,
            )
            .unwrap(),
        );
        // Never touches $SOCKET_PATH, so the start timeout always elapses.
        let uploaded = projects
            .upload("stuck".into(), b"#!/bin/sh\nsleep 5\n")
            .unwrap();

        let mut config = Config::from_env_for_test();
        config.process_start_timeout = Duration::from_millis(200);
        let supervisor = Supervisor::new(Arc::new(config), Arc::clone(&projects));

        supervisor.start(uploaded.id).await.unwrap();
        let reloaded = projects.get(&uploaded.id).unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Starting);
        assert!(reloaded.pid.is_some());
        // The handle is still tracked; only the persisted status withholds
        // `running` until the socket shows up.
        assert!(supervisor.is_running(&uploaded.id).await);

        supervisor.stop(uploaded.id).await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn crash_sets_error_then_restarts() {
        let dir = tempdir().unwrap();
        let sockets_dir = dir.path().join("sockets");
        std::fs::create_dir_all(&sockets_dir).unwrap();
        let projects_dir = dir.path().join("projects");
        std::fs::create_dir_all(&projects_dir).unwrap();

        let projects = Arc::new(
            crate::meta::ProjectCollection::open(
                dir.path().join("projects.db"),
                &projects_dir,
                &sockets_dir,
            )
            .unwrap(),
        );
        let uploaded = projects
            .upload(
                "crasher".into(),
                b"#!/bin/sh\ntouch \"$SOCKET_PATH\"; exit 1\n",
            )
            .unwrap();

        let mut config = Config::from_env_for_test();
        config.process_start_timeout = Duration::from_secs(2);
        let supervisor = Supervisor::new(Arc::new(config), Arc::clone(&projects));

        supervisor.start(uploaded.id).await.unwrap();
        // Give the watcher a moment to observe the exit and flip status.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let reloaded = projects.get(&uploaded.id).unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Error);
        assert!(!supervisor.is_running(&uploaded.id).await);
    }
}
