use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::registry::RegistryStore;

/// What the pid file says about the background watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "pid", rename_all = "snake_case")]
pub enum ServiceState {
    Running(u32),
    Stopped,
    /// Pid file present but the process is gone
    StalePid(u32),
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Running(pid) => write!(f, "running (pid {})", pid),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::StalePid(pid) => write!(f, "stopped (stale pid {})", pid),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Non-removed registry entries; `None` when the registry could not be read
    pub tracked_projects: Option<usize>,
    pub registry_path: PathBuf,
    pub log_file: PathBuf,
}

/// Background-service wrapper around the `watch` command
pub struct ServiceControl {
    global_dir: PathBuf,
    pid_path: PathBuf,
    log_file: PathBuf,
    store: RegistryStore,
    executable: Option<PathBuf>,
}

/// Whether a process with `pid` exists (signal 0 probe)
pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: exists but owned by someone else
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

impl ServiceControl {
    pub fn new(config: &Config) -> Self {
        Self {
            global_dir: config.global_dir.clone(),
            pid_path: config.pid_path(),
            log_file: config.log_dir().join("watcher.log"),
            store: RegistryStore::new(config.registry_path()),
            executable: None,
        }
    }

    /// Binary launched by [`start`](Self::start); defaults to the current executable
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn state(&self) -> ServiceState {
        match self.read_pid() {
            Some(pid) if is_alive(pid) => ServiceState::Running(pid),
            Some(pid) => ServiceState::StalePid(pid),
            None => ServiceState::Stopped,
        }
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(dir) = self.pid_path.parent() {
            fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
        }
        fs::write(&self.pid_path, format!("{}\n", pid)).map_err(|e| SyncError::io(&self.pid_path, e))
    }

    /// Remove the pid file if it still names `pid`
    pub fn release_pid(&self, pid: u32) {
        if self.read_pid() == Some(pid) {
            if let Err(e) = fs::remove_file(&self.pid_path) {
                warn!(path = %self.pid_path.display(), error = %e, "could not remove pid file");
            }
        }
    }

    /// Claim the pid file for a foreground watcher running as `pid`
    pub fn claim(&self, pid: u32) -> Result<()> {
        match self.state() {
            ServiceState::Running(other) if other != pid => Err(SyncError::Conflict(format!(
                "watcher already running with pid {}",
                other
            ))),
            _ => self.write_pid(pid),
        }
    }

    /// Spawn `watch` detached, output appended to the service log
    pub fn start(&self) -> Result<u32> {
        match self.state() {
            ServiceState::Running(pid) => {
                return Err(SyncError::Conflict(format!(
                    "watcher already running with pid {}",
                    pid
                )))
            }
            ServiceState::StalePid(pid) => {
                info!(pid, "replacing stale pid file");
                self.release_pid(pid);
            }
            ServiceState::Stopped => {}
        }

        let executable = match &self.executable {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()
                .map_err(|e| SyncError::config(format!("cannot locate executable: {}", e)))?,
        };

        if let Some(dir) = self.log_file.parent() {
            fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(|e| SyncError::io(&self.log_file, e))?;
        let log_err = log.try_clone().map_err(|e| SyncError::io(&self.log_file, e))?;

        let mut cmd = Command::new(&executable);
        cmd.arg("--global-dir")
            .arg(&self.global_dir)
            .arg("watch")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so terminal signals aimed at the caller miss it
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SyncError::config(format!("failed to start {}: {}", executable.display(), e)))?;
        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, log = %self.log_file.display(), "watcher service started");
        Ok(pid)
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL. Returns whether a live process was stopped.
    pub async fn stop(&self, timeout: Duration) -> Result<bool> {
        let pid = match self.state() {
            ServiceState::Running(pid) => pid,
            ServiceState::StalePid(pid) => {
                self.release_pid(pid);
                return Ok(false);
            }
            ServiceState::Stopped => return Ok(false),
        };

        info!(pid, "stopping watcher service");
        #[cfg(unix)]
        send_signal(pid, libc::SIGTERM).map_err(|e| SyncError::io(&self.pid_path, e))?;

        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < timeout {
            tokio::time::sleep(poll).await;
            waited += poll;
            if !is_alive(pid) {
                self.release_pid(pid);
                info!(pid, "watcher service stopped");
                return Ok(true);
            }
        }

        warn!(pid, "watcher did not exit after SIGTERM, killing");
        #[cfg(unix)]
        send_signal(pid, libc::SIGKILL).map_err(|e| SyncError::io(&self.pid_path, e))?;
        self.release_pid(pid);
        Ok(true)
    }

    pub fn status(&self) -> ServiceStatus {
        let tracked_projects = match self.store.load() {
            Ok(registry) => Some(registry.tracked_count()),
            Err(e) => {
                warn!(error = %e, "registry unreadable");
                None
            }
        };
        ServiceStatus {
            state: self.state(),
            tracked_projects,
            registry_path: self.store.path().to_path_buf(),
            log_file: self.log_file.clone(),
        }
    }

    /// systemd user unit running the watcher in the foreground
    pub fn render_systemd_unit(&self) -> Result<String> {
        let executable = match &self.executable {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()
                .map_err(|e| SyncError::config(format!("cannot locate executable: {}", e)))?,
        };
        Ok(format!(
            "[Unit]\n\
             Description=OpenMemory project watcher\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={} --global-dir {} watch\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             Environment=RUST_LOG=info\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n",
            executable.display(),
            self.global_dir.display()
        ))
    }
}
