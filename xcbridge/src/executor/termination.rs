//! Forced termination of a child and everything in its process group.
//!
//! Children are spawned as leaders of their own process group, so a signal
//! sent to the group also reaches helpers the tool forked (simulator bridges,
//! `xcodebuild` workers) that would otherwise keep the output pipes open.

use std::{process::ExitStatus, time::Duration};
use tokio::process::Child;

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::{errno::Errno, sys::signal, unistd::Pid};

    let pgid = Pid::from_raw(pid as i32);
    match signal::killpg(pgid, signal) {
        Ok(()) => tracing::debug!("Sent {:?} to process group {}", signal, pid),
        Err(Errno::ESRCH) => tracing::debug!("Process group {} already gone", pid),
        Err(e) => tracing::warn!("Failed to send {:?} to process group {}: {}", signal, pid, e),
    }
}

/// Stop `child`: SIGTERM to its group, wait up to `grace`, then SIGKILL.
///
/// Returns the exit status when one could be collected. A child that has
/// already exited is reaped without being signalled again, although its
/// group still receives the signals so orphaned helpers go with it.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();

    if let Ok(Some(status)) = child.try_wait() {
        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        return Some(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                return Some(status);
            }
            tracing::warn!(
                "Process {} ignored SIGTERM for {:?}; sending SIGKILL",
                pid,
                grace
            );
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.start_kill() {
        tracing::debug!("start_kill after group signal: {}", e);
    }
    match tokio::time::timeout(grace.max(Duration::from_millis(500)), child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!("Failed to reap terminated process {:?}: {}", pid, e);
            None
        }
        Err(_) => {
            tracing::warn!("Process {:?} did not exit after SIGKILL", pid);
            None
        }
    }
}
