//! Kernel driver interface version handling.

use std::cmp::Ordering;

/// Kbase ioctl interface type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum IoctlIface {
    /// Pre R21 release job manager kernel.
    #[display(fmt = "jm_pre_r21")]
    JmPreR21,
    /// Post R21 release job manager kernel.
    #[display(fmt = "jm_post_r21")]
    JmPostR21,
    /// Command stream front-end kernel.
    #[display(fmt = "csf")]
    Csf,
}

/// Kbase interface version reported by the kernel.
///
/// Versions are totally ordered within one [`IoctlIface`] only. Comparing
/// versions of different interface types is a programming error: the
/// comparison operators debug-assert that both sides share a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "{}.{} ({})", major, minor, iface)]
pub struct KbaseVersion {
    /// Major version number.
    pub major: u16,
    /// Minor version number.
    pub minor: u16,
    /// Ioctl interface type.
    pub iface: IoctlIface,
}

impl KbaseVersion {
    /// Create a new version value.
    pub const fn new(major: u16, minor: u16, iface: IoctlIface) -> Self {
        KbaseVersion { major, minor, iface }
    }
}

impl PartialOrd for KbaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        debug_assert_eq!(self.iface, other.iface);
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let lo = KbaseVersion::new(11, 34, IoctlIface::JmPostR21);
        let hi = KbaseVersion::new(11, 40, IoctlIface::JmPostR21);

        assert!(lo < hi);
        assert!(hi >= lo);
        assert!(lo >= lo);
        assert_eq!(lo, KbaseVersion::new(11, 34, IoctlIface::JmPostR21));

        let csf = KbaseVersion::new(2, 0, IoctlIface::Csf);
        assert!(csf > KbaseVersion::new(1, 99, IoctlIface::Csf));
    }
}
