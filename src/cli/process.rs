use std::{
    env,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, anyhow};
use sysinfo::{Signal, System, get_current_pid};
use tracing::info;

use super::daemon_path::to_daemon_path;

/// Terminates every process running the executable at `name`, except this one and its children.
pub fn kill_previous_servers(name: &Path) -> Result<usize> {
    let system = System::new_all();
    let current_id = get_current_pid().map_err(|e| anyhow!("Failed to get current pid {e}"))?;
    let mut killed = 0;
    for (pid, process) in system.processes().iter() {
        if *pid == current_id {
            continue;
        }
        if matches!(process.parent(), Some(p) if p == current_id) {
            continue;
        }

        if process
            .exe()
            .filter(|v| v.exists())
            .filter(|v| name == *v)
            .is_some()
        {
            info!("Stopping {pid} running {name:?}");
            // SIGTERM lets the daemon write its final snapshot. On Windows this forcefully
            // terminates the process.
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
            process.wait();
            killed += 1;
        }
    }
    Ok(killed)
}

fn daemon_executable() -> Result<PathBuf> {
    let cli = env::current_exe().context("Can't operate without an executable")?;
    Ok(to_daemon_path(cli))
}

/// Stops daemons and foreground `serve` instances.
pub fn stop_servers() -> Result<usize> {
    let cli = env::current_exe().context("Can't operate without an executable")?;
    Ok(kill_previous_servers(&daemon_executable()?)? + kill_previous_servers(&cli)?)
}

/// Shuts down previous daemons and starts a new one. The daemon binary detaches itself.
pub fn restart_server(dir: Option<&Path>) -> Result<()> {
    stop_servers()?;
    let daemon = daemon_executable()?;
    let mut command = std::process::Command::new(&daemon);
    if let Some(dir) = dir {
        command.arg("--dir").arg(std::path::absolute(dir)?);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());

    println!("Spawning {daemon:?}");
    let status = command
        .status()
        .with_context(|| format!("Failed to start {daemon:?}"))?;
    if !status.success() {
        return Err(anyhow!("Daemon exited with {status}"));
    }
    println!("Success");
    Ok(())
}
