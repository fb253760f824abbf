//! Waiting for counter samples.

use crate::syscall::SyscallIface;
use crate::{Error, Result};
use std::os::unix::io::RawFd;

/// Block until a hardware counters sample is ready on `fd`.
pub fn wait_for_sample<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<()> {
    const WAIT_FOREVER: i32 = -1;

    if !syscall.poll_read(fd, WAIT_FOREVER)? {
        return Err(Error::System(nix::Error::Sys(nix::errno::Errno::ETIMEDOUT)));
    }

    Ok(())
}

/// Check whether a sample is ready to be read on `fd`, without blocking.
pub fn check_ready_read<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<bool> {
    const NO_WAIT: i32 = 0;

    syscall.poll_read(fd, NO_WAIT)
}
