//! Process validation utilities for PID checking and verification.

/// Kill a process with SIGKILL.
///
/// # Returns
/// * `true` - Process was killed or doesn't exist
/// * `false` - Failed to kill (permission denied)
pub fn kill_process(pid: u32) -> bool {
    signal(pid, libc::SIGKILL) || !is_process_alive(pid)
}

/// Ask a process to exit with SIGTERM.
pub fn terminate_process(pid: u32) -> bool {
    signal(pid, libc::SIGTERM)
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    signal(pid, 0)
}

fn signal(pid: u32, sig: libc::c_int) -> bool {
    // kill() treats 0 and negative pids as process groups.
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, sig) == 0 }
}

/// Verify that `pid` is still the hypervisor we recorded, by looking for
/// `marker` (the instance disk path) in its command line.
///
/// Guards against PID reuse between invocations.
pub fn is_same_process(pid: u32, marker: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read(format!("/proc/{}/cmdline", pid)) {
            Ok(raw) => raw
                .split(|b| *b == 0)
                .any(|arg| String::from_utf8_lossy(arg).contains(marker)),
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = marker;
        is_process_alive(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        assert!(!is_process_alive(999999999));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_is_same_process() {
        let pid = std::process::id();
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().into_owned();
        assert!(is_same_process(pid, &name));
        assert!(!is_same_process(pid, "/nonexistent/instance/disk.qcow2"));
        assert!(!is_same_process(999999999, &name));
    }
}
