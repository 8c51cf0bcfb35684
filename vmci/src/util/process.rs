//! Process signalling helpers for the VM process.

/// Send SIGTERM to a process.
///
/// # Returns
/// * `true` - Signal delivered or process already gone
/// * `false` - Failed to signal (permission denied)
pub fn terminate_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 || !is_process_alive(pid) }
}

/// Kill a process with SIGKILL.
///
/// # Returns
/// * `true` - Process was killed or doesn't exist
/// * `false` - Failed to kill (permission denied)
pub fn kill_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// Kill every process in the group led by `pgid` with SIGKILL.
pub fn kill_process_group(pgid: u32) -> bool {
    unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) == 0 }
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
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
        // u32::MAX becomes -1 when cast to i32, which has special meaning in kill()
        assert!(!is_process_alive(999999999));
        assert!(!is_process_alive(888888888));
    }

    #[test]
    fn test_signals_to_missing_process_report_gone() {
        assert!(terminate_process(999999999));
        assert!(kill_process(999999999));
    }
}
