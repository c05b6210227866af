//! Process-group signalling

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Interrupt,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Send `sig` to every process in group `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
pub(crate) fn signal_group(pgid: i32, sig: Signal) -> io::Result<bool> {
    // 0 and 1 would address our own group or every process we may signal
    if pgid <= 1 {
        return Ok(false);
    }

    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, sig.raw()) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Whether a single pid still exists (zombies included)
#[cfg(test)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
