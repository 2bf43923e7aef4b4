use anyhow::{Context, Result};

#[cfg(unix)]
use daemonize::Daemonize;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::fs::File;

pub const PID_FILE: &str = "rpatch.pid";
pub const LOG_FILE: &str = "rpatch.log";

#[cfg(unix)]
pub fn start_daemon() -> Result<()> {
    // Progress bars and tracing both write to stderr; keep them in one file.
    let stdout = File::create(LOG_FILE).context("Failed to create log file")?;
    let stderr = stdout.try_clone().context("Failed to clone log file handle")?;

    let daemonize = Daemonize::new()
        .pid_file(PID_FILE)
        .chown_pid_file(true)
        .working_directory(".")
        .stdout(stdout)
        .stderr(stderr);

    daemonize
        .start()
        .map_err(|e| anyhow::anyhow!("Error starting daemon: {}", e))
}

#[cfg(unix)]
fn get_daemon_pid() -> Result<Option<i32>> {
    let path = std::path::Path::new(PID_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let pid = content.trim().parse::<i32>().context("Corrupt pid file")?;
    Ok(Some(pid))
}

#[cfg(unix)]
fn signal_daemon(signal: Signal, action: &str) -> Result<()> {
    match get_daemon_pid()? {
        Some(pid) => {
            signal::kill(Pid::from_raw(pid), signal)
                .with_context(|| format!("Failed to signal daemon (PID: {})", pid))?;
            println!("{} daemon (PID: {})", action, pid);
        }
        None => println!("Daemon is not running."),
    }
    Ok(())
}

/// The daemon pauses its transfer on SIGUSR1; chunk progress stays on disk.
#[cfg(unix)]
pub fn pause_daemon() -> Result<()> {
    signal_daemon(Signal::SIGUSR1, "Paused")
}

#[cfg(unix)]
pub fn resume_daemon() -> Result<()> {
    signal_daemon(Signal::SIGUSR2, "Resumed")
}

/// SIGTERM makes the daemon pause, flush its state and exit.
#[cfg(unix)]
pub fn stop_daemon() -> Result<()> {
    signal_daemon(Signal::SIGTERM, "Stopped")
}

pub fn daemon_pid() -> Option<i32> {
    #[cfg(unix)]
    {
        get_daemon_pid().ok().flatten()
    }
    #[cfg(not(unix))]
    {
        None
    }
}

pub fn cleanup_pid_file() {
    let _ = std::fs::remove_file(PID_FILE);
}

#[cfg(not(unix))]
pub fn start_daemon() -> Result<()> {
    anyhow::bail!("Daemon mode is only supported on Unix")
}

#[cfg(not(unix))]
pub fn pause_daemon() -> Result<()> {
    anyhow::bail!("Daemon mode is only supported on Unix")
}

#[cfg(not(unix))]
pub fn resume_daemon() -> Result<()> {
    anyhow::bail!("Daemon mode is only supported on Unix")
}

#[cfg(not(unix))]
pub fn stop_daemon() -> Result<()> {
    anyhow::bail!("Daemon mode is only supported on Unix")
}
