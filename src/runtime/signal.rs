//! Process signalling through libc

use std::io;

pub type SignalResult<T> = std::result::Result<T, io::Error>;

/// Send a signal to a process
pub fn kill(pid: i32, signal: i32) -> SignalResult<()> {
    let result = unsafe { libc::kill(pid, signal) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Send a signal to every process in the group led by `pgid`, falling back
/// to the leader alone when the group is gone
pub fn kill_group(pgid: u32, signal: i32) -> SignalResult<()> {
    match kill(-(pgid as i32), signal) {
        Ok(()) => Ok(()),
        Err(_) => kill(pgid as i32, signal),
    }
}

/// Whether a process with this pid exists
pub fn is_alive(pid: u32) -> bool {
    match kill(pid as i32, 0) {
        Ok(()) => true,
        // exists but belongs to someone else
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

/// Get the current process ID
pub fn getpid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(getpid()));
    }

    #[test]
    fn test_signal_zero_to_self() {
        assert!(kill(getpid() as i32, 0).is_ok());
    }
}
