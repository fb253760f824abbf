//! Mali device file descriptor handle.

use crate::syscall::{SyscallIface, UnixSyscall};
use crate::{Error, Result};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Handle controlling the lifetime of a Mali device file descriptor.
///
/// Descriptors opened by the handle are closed at drop time; externally
/// provided descriptors are left open.
#[derive(Debug)]
pub struct DeviceHandle<S: SyscallIface = UnixSyscall> {
    fd: RawFd,
    owned: bool,
    syscall: S,
}

/// Default device path for instance number `n`.
fn device_path(instance_number: u32) -> PathBuf {
    PathBuf::from(format!("/dev/mali{}", instance_number))
}

impl DeviceHandle<UnixSyscall> {
    /// Open `/dev/mali{instance_number}`.
    pub fn create(instance_number: u32) -> Result<Self> {
        DeviceHandle::create_with(instance_number, UnixSyscall)
    }

    /// Open an explicit device path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        DeviceHandle::from_path_with(path, UnixSyscall)
    }

    /// Wrap an externally owned descriptor. It will not be closed.
    pub fn from_external_fd(fd: RawFd) -> Self {
        DeviceHandle::from_external_fd_with(fd, UnixSyscall)
    }
}

impl<S: SyscallIface> DeviceHandle<S> {
    /// Open `/dev/mali{instance_number}` through `syscall`.
    pub fn create_with(instance_number: u32, syscall: S) -> Result<Self> {
        DeviceHandle::from_path_with(device_path(instance_number), syscall)
    }

    /// Open an explicit device path through `syscall`.
    pub fn from_path_with<P: AsRef<Path>>(path: P, syscall: S) -> Result<Self> {
        let fd = syscall.open(path.as_ref())?;

        let handle = DeviceHandle {
            fd,
            owned: true,
            syscall,
        };

        if !is_char_device(fd) {
            return Err(Error::InvalidArgument("not a character device"));
        }

        Ok(handle)
    }

    /// Wrap an externally owned descriptor. It will not be closed.
    pub fn from_external_fd_with(fd: RawFd, syscall: S) -> Self {
        DeviceHandle {
            fd,
            owned: false,
            syscall,
        }
    }

    /// The device file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The syscall interface this handle was created with.
    pub(crate) fn syscall(&self) -> &S {
        &self.syscall
    }
}

impl<S: SyscallIface> Drop for DeviceHandle<S> {
    fn drop(&mut self) {
        if self.owned {
            let _ = self.syscall.close(self.fd);
        }
    }
}

/// Check that `fd` refers to a character device.
fn is_char_device(fd: RawFd) -> bool {
    match nix::sys::stat::fstat(fd) {
        Ok(stat) => (stat.st_mode & nix::libc::S_IFMT) == nix::libc::S_IFCHR,
        Err(_) => false,
    }
}
