//! Injectable syscall provider used by everything that talks to the kernel.
//!
//! Production code uses [`UnixSyscall`], a zero-sized forwarder to the real
//! system calls. Unit tests substitute stateful fakes to drive the resource
//! guards and back-ends without a Mali device present.

use crate::{Error, Result};
use nix::libc;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Wrapper around all system calls used by the library.
pub trait SyscallIface {
    /// Open `path` read-only with close-on-exec.
    fn open(&self, path: &Path) -> Result<RawFd>;

    /// Close a file descriptor.
    fn close(&self, fd: RawFd) -> Result<()>;

    /// Issue an ioctl whose argument is passed by value.
    fn ioctl_val(&self, fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong)
        -> Result<libc::c_int>;

    /// Issue an ioctl whose argument is passed by pointer.
    ///
    /// # Safety
    /// `arg` must point to a structure matching the layout the `request`
    /// code declares, and must stay valid for the duration of the call.
    unsafe fn ioctl_ptr(
        &self,
        fd: RawFd,
        request: libc::c_ulong,
        arg: *mut libc::c_void,
    ) -> Result<libc::c_int>;

    /// Map `len` bytes of `fd` read-only (`MAP_PRIVATE`).
    fn mmap_ro(&self, fd: RawFd, len: usize) -> Result<*mut libc::c_void>;

    /// Unmap a mapping previously created with [`SyscallIface::mmap_ro`].
    fn munmap(&self, addr: *mut libc::c_void, len: usize) -> Result<()>;

    /// Poll `fd` for readability.
    ///
    /// Returns `true` if `fd` became readable within `timeout_ms`
    /// milliseconds (`-1` waits forever).
    fn poll_read(&self, fd: RawFd, timeout_ms: libc::c_int) -> Result<bool>;
}

/// The real syscall implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSyscall;

impl SyscallIface for UnixSyscall {
    fn open(&self, path: &Path) -> Result<RawFd> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;

        let fd = nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        nix::unistd::close(fd)?;
        Ok(())
    }

    fn ioctl_val(
        &self,
        fd: RawFd,
        request: libc::c_ulong,
        arg: libc::c_ulong,
    ) -> Result<libc::c_int> {
        let result = unsafe { libc::ioctl(fd, request, arg) };
        if result < 0 {
            return Err(Error::from_errno());
        }
        Ok(result)
    }

    unsafe fn ioctl_ptr(
        &self,
        fd: RawFd,
        request: libc::c_ulong,
        arg: *mut libc::c_void,
    ) -> Result<libc::c_int> {
        let result = libc::ioctl(fd, request, arg);
        if result < 0 {
            return Err(Error::from_errno());
        }
        Ok(result)
    }

    fn mmap_ro(&self, fd: RawFd, len: usize) -> Result<*mut libc::c_void> {
        use nix::sys::mman;

        let addr = unsafe {
            mman::mmap(
                std::ptr::null_mut(),
                len,
                mman::ProtFlags::PROT_READ,
                mman::MapFlags::MAP_PRIVATE,
                fd,
                0,
            )?
        };
        Ok(addr)
    }

    fn munmap(&self, addr: *mut libc::c_void, len: usize) -> Result<()> {
        unsafe { nix::sys::mman::munmap(addr, len)? };
        Ok(())
    }

    fn poll_read(&self, fd: RawFd, timeout_ms: libc::c_int) -> Result<bool> {
        let mut pollfd = [nix::poll::PollFd::new(fd, nix::poll::PollFlags::POLLIN)];
        let nready = nix::poll::poll(&mut pollfd, timeout_ms)?;
        Ok(nready == 1)
    }
}

/// Current `CLOCK_MONOTONIC_RAW` timestamp in nanoseconds.
pub(crate) fn monotonic_now_ns() -> u64 {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut now) };

    const NSEC_PER_SEC: u64 = 1_000_000_000;
    (now.tv_sec as u64) * NSEC_PER_SEC + now.tv_nsec as u64
}
