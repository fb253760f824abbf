//! RAII owners for the kernel resources a sampling session holds.

use crate::syscall::{SyscallIface, UnixSyscall};
use crate::Result;
use nix::libc;
use std::os::unix::io::RawFd;

/// Owner of at most one file descriptor.
///
/// The descriptor is closed when the guard is dropped unless ownership was
/// relinquished with [`FdGuard::release`].
#[derive(Debug)]
pub struct FdGuard<S: SyscallIface = UnixSyscall> {
    fd: RawFd,
    syscall: S,
}

impl<S: SyscallIface> FdGuard<S> {
    /// Take ownership of `fd`.
    pub fn new(fd: RawFd, syscall: S) -> Self {
        FdGuard { fd, syscall }
    }

    /// Construct a guard owning nothing.
    pub fn empty(syscall: S) -> Self {
        FdGuard { fd: -1, syscall }
    }

    /// The owned file descriptor, `-1` if none.
    pub fn get(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership and return the raw descriptor.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, -1)
    }

    /// Own a new descriptor, closing the previously owned one if any.
    pub fn reset(&mut self, fd: RawFd) {
        if self.fd >= 0 {
            let _ = self.syscall.close(self.fd);
        }
        self.fd = fd;
    }
}

impl<S: SyscallIface> Drop for FdGuard<S> {
    fn drop(&mut self) {
        self.reset(-1);
    }
}

/// Owner of a read-only memory mapping of the counters sample buffer.
///
/// Maps `size` bytes of a descriptor on construction and unmaps on drop.
/// A default-constructed value owns nothing, distinguishable through
/// [`MappedMemory::is_mapped`].
#[derive(Debug)]
pub struct MappedMemory<S: SyscallIface = UnixSyscall> {
    data: *mut libc::c_void,
    size: usize,
    syscall: S,
}

impl<S: SyscallIface> MappedMemory<S> {
    /// Map `size` bytes of `fd` read-only.
    pub fn map(fd: RawFd, size: usize, syscall: S) -> Result<Self> {
        let data = syscall.mmap_ro(fd, size)?;
        Ok(MappedMemory { data, size, syscall })
    }

    /// Construct an unmapped value.
    pub fn unmapped(syscall: S) -> Self {
        MappedMemory {
            data: std::ptr::null_mut(),
            size: 0,
            syscall,
        }
    }

    /// Wrap an externally created mapping.
    ///
    /// Used by tests to substitute plain memory for a kernel mapping; the
    /// fake syscall interface decides what unmapping means.
    pub fn from_raw(data: *mut libc::c_void, size: usize, syscall: S) -> Self {
        MappedMemory { data, size, syscall }
    }

    /// True if memory is mapped.
    pub fn is_mapped(&self) -> bool {
        !self.data.is_null()
    }

    /// Base address of the mapping.
    pub fn data(&self) -> *const u8 {
        self.data as *const u8
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<S: SyscallIface> Drop for MappedMemory<S> {
    fn drop(&mut self) {
        if self.data.is_null() {
            return;
        }

        let _ = self.syscall.munmap(self.data, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    /// Fake syscall interface recording close/munmap calls.
    #[derive(Debug, Clone, Default)]
    struct FakeSyscall {
        closed: Rc<RefCell<Vec<RawFd>>>,
        unmapped: Rc<RefCell<Vec<usize>>>,
    }

    impl SyscallIface for FakeSyscall {
        fn open(&self, _path: &Path) -> Result<RawFd> {
            Err(Error::NotSupported("fake"))
        }

        fn close(&self, fd: RawFd) -> Result<()> {
            self.closed.borrow_mut().push(fd);
            Ok(())
        }

        fn ioctl_val(
            &self,
            _fd: RawFd,
            _request: libc::c_ulong,
            _arg: libc::c_ulong,
        ) -> Result<libc::c_int> {
            Err(Error::NotSupported("fake"))
        }

        unsafe fn ioctl_ptr(
            &self,
            _fd: RawFd,
            _request: libc::c_ulong,
            _arg: *mut libc::c_void,
        ) -> Result<libc::c_int> {
            Err(Error::NotSupported("fake"))
        }

        fn mmap_ro(&self, _fd: RawFd, _len: usize) -> Result<*mut libc::c_void> {
            Err(Error::NotSupported("fake"))
        }

        fn munmap(&self, _addr: *mut libc::c_void, len: usize) -> Result<()> {
            self.unmapped.borrow_mut().push(len);
            Ok(())
        }

        fn poll_read(&self, _fd: RawFd, _timeout_ms: libc::c_int) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_fd_guard_closes_on_drop() {
        let syscall = FakeSyscall::default();
        {
            let guard = FdGuard::new(42, syscall.clone());
            assert_eq!(guard.get(), 42);
        }
        assert_eq!(*syscall.closed.borrow(), vec![42]);
    }

    #[test]
    fn test_fd_guard_release_relinquishes_ownership() {
        let syscall = FakeSyscall::default();
        {
            let mut guard = FdGuard::new(42, syscall.clone());
            assert_eq!(guard.release(), 42);
            assert_eq!(guard.get(), -1);
        }
        assert!(syscall.closed.borrow().is_empty());
    }

    #[test]
    fn test_fd_guard_reset_closes_previous() {
        let syscall = FakeSyscall::default();
        let mut guard = FdGuard::new(3, syscall.clone());

        guard.reset(7);
        assert_eq!(guard.get(), 7);
        assert_eq!(*syscall.closed.borrow(), vec![3]);

        drop(guard);
        assert_eq!(*syscall.closed.borrow(), vec![3, 7]);
    }

    #[test]
    fn test_mapped_memory_unmaps_on_drop() {
        let syscall = FakeSyscall::default();
        let mut backing = vec![0u8; 128];
        {
            let memory = MappedMemory::from_raw(
                backing.as_mut_ptr() as *mut libc::c_void,
                backing.len(),
                syscall.clone(),
            );
            assert!(memory.is_mapped());
            assert_eq!(memory.size(), 128);
        }
        assert_eq!(*syscall.unmapped.borrow(), vec![128]);

        // An unmapped value does not call munmap.
        drop(MappedMemory::unmapped(syscall.clone()));
        assert_eq!(syscall.unmapped.borrow().len(), 1);
    }
}
