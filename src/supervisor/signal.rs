//! Signal delivery to process groups

use super::ExitOutcome;
use std::io;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Send `signal` to the process group led by `pid`.
///
/// A group that no longer exists is not an error.
pub fn signal_group(pid: u32, signal: i32) -> io::Result<()> {
    let result = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if result == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Not a group leader, fall back to the process itself
        let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Err(err)
}

/// Send `signal` to a single process
pub fn signal_process(pid: u32, signal: i32) -> io::Result<()> {
    if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether a process with this pid exists
pub fn is_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Stop a process this process did not spawn and cannot wait on.
///
/// Used by `down`, which runs in a different process than the `up` that
/// started the service. Exit codes are not observable here.
pub async fn stop_pid(pid: u32, grace: Duration) -> io::Result<ExitOutcome> {
    if !is_alive(pid) {
        return Ok(ExitOutcome::AlreadyExited { code: None });
    }

    signal_group(pid, libc::SIGTERM)?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return Ok(ExitOutcome::Graceful { code: None });
        }
        sleep(POLL_INTERVAL).await;
    }

    if !is_alive(pid) {
        return Ok(ExitOutcome::Graceful { code: None });
    }

    tracing::warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
    signal_group(pid, libc::SIGKILL)?;
    Ok(ExitOutcome::Forced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_stop_pid_graceful() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        // Reap in the background so the pid disappears once it exits
        let waiter = tokio::spawn(async move {
            let mut child = child;
            child.wait().await
        });

        let outcome = stop_pid(pid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ExitOutcome::Graceful { code: None });
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_pid_already_gone() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let outcome = stop_pid(pid, Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, ExitOutcome::AlreadyExited { code: None });
    }
}
