use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("cannot read pid file {0}: {1}")]
    PidFile(String, std::io::Error),

    #[error("pid file {0} does not contain a valid pid")]
    InvalidPid(String),

    #[error("failed to signal pid {0}: {1}")]
    Signal(i32, String),

    #[error("reload signals are not supported on this platform")]
    Unsupported,
}

fn read_pid(pid_file: &Path) -> Result<i32, ReloadError> {
    let text = std::fs::read_to_string(pid_file)
        .map_err(|e| ReloadError::PidFile(pid_file.display().to_string(), e))?;
    text.trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| ReloadError::InvalidPid(pid_file.display().to_string()))
}

/// Ask the running proxy whose pid is in `pid_file` to reload its config.
#[cfg(unix)]
pub fn request_reload(pid_file: &Path) -> Result<i32, ReloadError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = read_pid(pid_file)?;
    signal::kill(Pid::from_raw(pid), Signal::SIGHUP)
        .map_err(|e| ReloadError::Signal(pid, e.to_string()))?;
    tracing::info!("Sent SIGHUP to proxy process {}", pid);
    Ok(pid)
}

#[cfg(not(unix))]
pub fn request_reload(pid_file: &Path) -> Result<i32, ReloadError> {
    read_pid(pid_file)?;
    Err(ReloadError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = request_reload(&dir.path().join("litellm.pid")).unwrap_err();
        assert!(matches!(err, ReloadError::PidFile(..)));
    }

    #[test]
    fn garbage_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("litellm.pid");
        for content in ["not-a-pid", "0", "-5", ""] {
            std::fs::write(&path, content).unwrap();
            assert!(matches!(request_reload(&path), Err(ReloadError::InvalidPid(_))));
        }
    }

    #[test]
    fn reads_pid_with_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("litellm.pid");
        std::fs::write(&path, " 4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), 4242);
    }
}
