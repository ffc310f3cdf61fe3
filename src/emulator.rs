//! Emulator process supervision
//!
//! Locates a BasiliskII/SheepShaver executable, spawns it with the control
//! socket exported in its environment, monitors it with non-blocking waits,
//! and honors the exit-code restart convention. Stopping is cooperative:
//! SIGTERM, a bounded wait, then SIGKILL.
//!
//! The child inherits only stdio: Rust's `Command` marks every descriptor
//! it did not create close-on-exec, which is the fd discipline the protocol
//! requires across a spawn.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::error::{AppError, Result};

/// Exit code by which the child signals "please respawn me"
pub const RESTART_EXIT_CODE: i32 = 75;

/// Pause before respawning after a requested restart
const RESTART_PAUSE: Duration = Duration::from_millis(500);

/// Cooperative-stop polling interval and bound (3 s total)
const STOP_POLL: Duration = Duration::from_millis(100);
const STOP_POLL_ROUNDS: u32 = 30;

/// Conventional locations searched when no explicit path is given
const CANDIDATES: &[&str] = &[
    "./BasiliskII",
    "./SheepShaver",
    "../BasiliskII/src/Unix/BasiliskII",
    "../SheepShaver/src/Unix/SheepShaver",
];

/// What a reaped wait status means for the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit 0: terminal, do not respawn
    Clean,
    /// Exit 75: respawn after a short pause
    RestartRequested,
    /// Any other exit code: terminal
    Failed(i32),
    /// Killed by a signal: terminal
    Signaled,
}

/// Map a wait status exit code to its disposition
pub fn exit_disposition(code: Option<i32>) -> ExitDisposition {
    match code {
        Some(0) => ExitDisposition::Clean,
        Some(RESTART_EXIT_CODE) => ExitDisposition::RestartRequested,
        Some(code) => ExitDisposition::Failed(code),
        None => ExitDisposition::Signaled,
    }
}

/// Spawns, monitors, and stops the emulator child process
pub struct EmulatorSupervisor {
    explicit_path: Option<PathBuf>,
    prefs_path: PathBuf,
    control_sock: PathBuf,
    child: Mutex<Option<Child>>,
    /// -1 when no child is running
    pid: AtomicI32,
    last_exit_code: AtomicI32,
    restart_requested: AtomicBool,
}

impl EmulatorSupervisor {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            explicit_path: config.emulator_path.clone(),
            prefs_path: config.prefs_path.clone(),
            control_sock: config.control_sock_path.clone(),
            child: Mutex::new(None),
            pid: AtomicI32::new(-1),
            last_exit_code: AtomicI32::new(-1),
            restart_requested: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.pid() > 0
    }

    pub fn last_exit_code(&self) -> i32 {
        self.last_exit_code.load(Ordering::Relaxed)
    }

    /// Queue a stop-and-respawn, honored on the next supervision tick
    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::Relaxed);
    }

    /// Resolve the executable: explicit path first, then the conventional
    /// search list, requiring execute permission either way.
    pub fn find_executable(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.explicit_path {
            if access(path.as_path(), AccessFlags::X_OK).is_ok() {
                return Ok(path.clone());
            }
            return Err(AppError::Emulator(format!(
                "specified path not executable: {}",
                path.display()
            )));
        }

        for candidate in CANDIDATES {
            let path = Path::new(candidate);
            if access(path, AccessFlags::X_OK).is_ok() {
                return Ok(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));
            }
        }

        Err(AppError::Emulator(
            "no emulator found; use --emulator or place BasiliskII in the current directory"
                .to_string(),
        ))
    }

    /// Spawn the child. BasiliskII takes `--config`, SheepShaver `--prefs`.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait().map_err(AppError::Io)?.is_none() {
                return Ok(());
            }
            *guard = None;
            self.pid.store(-1, Ordering::Relaxed);
        }

        let exe = self.find_executable()?;
        let prefs_flag = if exe.to_string_lossy().contains("SheepShaver") {
            "--prefs"
        } else {
            "--config"
        };

        tracing::info!(
            "Starting emulator: {} {} {}",
            exe.display(),
            prefs_flag,
            self.prefs_path.display()
        );

        let child = Command::new(&exe)
            .arg(prefs_flag)
            .arg(&self.prefs_path)
            .env("MACEMU_CONTROL_SOCK", &self.control_sock)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Emulator(format!("spawn failed: {}", e)))?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        self.pid.store(pid, Ordering::Relaxed);
        *guard = Some(child);
        tracing::info!("Emulator started with PID {}", pid);
        Ok(())
    }

    /// Cooperative stop: SIGTERM, poll up to 3 s, then force-kill
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return;
        };
        let pid = self.pid();
        tracing::info!("Stopping emulator PID {}", pid);

        if pid > 0 {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::debug!("SIGTERM failed: {}", e);
            }
        }

        for _ in 0..STOP_POLL_ROUNDS {
            match child.try_wait() {
                Ok(Some(_)) => {
                    *guard = None;
                    self.pid.store(-1, Ordering::Relaxed);
                    tracing::info!("Emulator stopped");
                    return;
                }
                Ok(None) => tokio::time::sleep(STOP_POLL).await,
                Err(e) => {
                    tracing::warn!("Wait for emulator failed: {}", e);
                    break;
                }
            }
        }

        tracing::warn!("Emulator did not exit, force killing");
        if let Err(e) = child.kill().await {
            tracing::warn!("Force kill failed: {}", e);
        }
        let _ = child.wait().await;
        *guard = None;
        self.pid.store(-1, Ordering::Relaxed);
    }

    /// One supervision step, run by the orchestrator every 500 ms: reap the
    /// child, respawn on exit 75, and honor a queued restart request.
    pub async fn tick(&self, auto_start: bool) {
        let mut respawn = false;
        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        self.pid.store(-1, Ordering::Relaxed);
                        let code = status.code();
                        self.last_exit_code.store(code.unwrap_or(-1), Ordering::Relaxed);
                        match exit_disposition(code) {
                            ExitDisposition::Clean => {
                                tracing::info!("Emulator exited cleanly");
                            }
                            ExitDisposition::RestartRequested => {
                                tracing::info!("Emulator requested restart (exit code 75)");
                                respawn = auto_start;
                            }
                            ExitDisposition::Failed(code) => {
                                tracing::warn!("Emulator exited with code {}", code);
                            }
                            ExitDisposition::Signaled => {
                                tracing::warn!(
                                    "Emulator killed by signal {:?}",
                                    status.signal()
                                );
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Wait for emulator failed: {}", e),
                }
            }
        }

        if respawn {
            tokio::time::sleep(RESTART_PAUSE).await;
            if let Err(e) = self.start().await {
                tracing::error!("Emulator respawn failed: {}", e);
            }
        }

        if self.restart_requested.swap(false, Ordering::Relaxed) {
            tracing::info!("Restart requested via API");
            self.stop().await;
            tokio::time::sleep(RESTART_PAUSE).await;
            if let Err(e) = self.start().await {
                tracing::error!("Emulator restart failed: {}", e);
            }
        }
    }
}
