// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process supervisor.
//!
//! Launches the worker program directly (no shell) as
//! `<program> <args...> --port=<N>`. Termination is SIGTERM first, then
//! SIGKILL once the stop timeout elapses.

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{ProcessHandle, Result, Supervisor, SupervisorError};
use crate::config::{ConfigError, parse_var};

/// Native supervisor configuration.
#[derive(Debug, Clone)]
pub struct NativeSupervisorConfig {
    /// Worker executable.
    pub program: String,
    /// Arguments placed before the `--port=<N>` argument.
    pub args: Vec<String>,
    /// Working directory for the worker processes.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the worker processes.
    pub env: HashMap<String, String>,
    /// How long to wait after SIGTERM before sending SIGKILL.
    pub stop_timeout: Duration,
}

impl Default for NativeSupervisorConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["backend/main.py".to_string(), "--open_gpu=1".to_string()],
            working_dir: None,
            env: HashMap::new(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl NativeSupervisorConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            program: lookup("INFERGATE_WORKER_PROGRAM").unwrap_or(defaults.program),
            args: lookup("INFERGATE_WORKER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.args),
            working_dir: lookup("INFERGATE_WORKER_DIR").map(PathBuf::from),
            env: defaults.env,
            stop_timeout: Duration::from_secs(parse_var(
                &lookup,
                "INFERGATE_STOP_TIMEOUT_SECS",
                defaults.stop_timeout.as_secs(),
            )?),
        })
    }

    /// Set the worker program and its leading arguments.
    pub fn with_command(mut self, program: impl Into<String>, args: &[&str]) -> Self {
        self.program = program.into();
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Set the stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Supervisor that runs workers as child processes of the gateway.
pub struct NativeSupervisor {
    config: NativeSupervisorConfig,
    children: Mutex<HashMap<String, Child>>,
    launches: AtomicU64,
}

impl NativeSupervisor {
    /// Create a new native supervisor.
    pub fn new(config: NativeSupervisorConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
            launches: AtomicU64::new(0),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Ok(Self::new(NativeSupervisorConfig::from_env()?))
    }

    /// Get the configuration.
    pub fn config(&self) -> &NativeSupervisorConfig {
        &self.config
    }
}

#[async_trait]
impl Supervisor for NativeSupervisor {
    fn supervisor_type(&self) -> &'static str {
        "native"
    }

    async fn spawn(&self, port: u16) -> Result<ProcessHandle> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(format!("--port={port}"))
            .envs(&self.config.env)
            .stdin(Stdio::null())
            // Worker logs go to the gateway's own stdout/stderr
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SupervisorError::BinaryNotFound(self.config.program.clone())
            }
            _ => SupervisorError::SpawnFailed(format!("{}: {}", self.config.program, e)),
        })?;

        let seq = self.launches.fetch_add(1, Ordering::Relaxed);
        let handle = ProcessHandle {
            handle_id: format!("native-{port}-{seq}"),
            port,
            pid: child.id(),
            started_at: Utc::now(),
        };

        info!(
            port = port,
            pid = ?handle.pid,
            program = %self.config.program,
            "Worker process spawned"
        );

        self.children
            .lock()
            .await
            .insert(handle.handle_id.clone(), child);

        Ok(handle)
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        let Some(mut child) = self.children.lock().await.remove(&handle.handle_id) else {
            debug!(handle_id = %handle.handle_id, "Stop requested for untracked handle");
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            debug!(port = handle.port, status = %status, "Worker already exited");
            return Ok(());
        }

        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(port = handle.port, pid = pid, "Sent SIGTERM to worker"),
                Err(nix::errno::Errno::ESRCH) => {
                    debug!(port = handle.port, pid = pid, "Worker already gone (ESRCH)")
                }
                Err(e) => warn!(port = handle.port, pid = pid, error = %e, "Failed to send SIGTERM"),
            }
        }

        match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(port = handle.port, status = %status, "Worker process stopped");
            }
            Ok(Err(e)) => return Err(SupervisorError::Io(e)),
            Err(_) => {
                warn!(
                    port = handle.port,
                    timeout_secs = self.config.stop_timeout.as_secs_f64(),
                    "Worker ignored SIGTERM, sending SIGKILL"
                );
                child.kill().await?;
            }
        }

        Ok(())
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let mut children = self.children.lock().await;
        children
            .get_mut(&handle.handle_id)
            .map(|child| matches!(child.try_wait(), Ok(None)))
            .unwrap_or(false)
    }

    async fn exit_code(&self, handle: &ProcessHandle) -> Option<i32> {
        let mut children = self.children.lock().await;
        let child = children.get_mut(&handle.handle_id)?;
        match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }
}
