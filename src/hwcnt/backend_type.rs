//! Counters back-end discovery and selection.
//!
//! Several mutually incompatible counters ioctl interfaces exist across
//! kernel driver generations. [`discover`] computes which of them a given
//! kernel/GPU pair supports, and [`select`] picks one, honoring an
//! explicit override (the facade threads `HWCPIPE_BACKEND_INTERFACE`
//! through here).

use crate::product::ProductId;
use crate::version::{IoctlIface, KbaseVersion};
use crate::{Error, Result};

/// Counters back-end types, listed in priority order (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BackendType {
    /// The vinstr interface.
    #[display(fmt = "vinstr")]
    Vinstr,
    /// The vinstr interface behind the pre R21 ioctl dispatch.
    #[display(fmt = "vinstr_pre_r21")]
    VinstrPreR21,
    /// The kinstr_prfcnt interface.
    #[display(fmt = "kinstr_prfcnt")]
    KinstrPrfcnt,
    /// The kinstr_prfcnt interface with defect workarounds applied.
    #[display(fmt = "kinstr_prfcnt_wa")]
    KinstrPrfcntWa,
    /// The kinstr_prfcnt interface of kernels with known defects.
    #[display(fmt = "kinstr_prfcnt_bad")]
    KinstrPrfcntBad,
}

impl BackendType {
    /// All back-end types, in priority order.
    pub const ALL: [BackendType; 5] = [
        BackendType::Vinstr,
        BackendType::VinstrPreR21,
        BackendType::KinstrPrfcnt,
        BackendType::KinstrPrfcntWa,
        BackendType::KinstrPrfcntBad,
    ];

    /// Bit of this type in a [`BackendTypesSet`].
    fn bit(self) -> u8 {
        match self {
            BackendType::Vinstr => 1 << 0,
            BackendType::VinstrPreR21 => 1 << 1,
            BackendType::KinstrPrfcnt => 1 << 2,
            BackendType::KinstrPrfcntWa => 1 << 3,
            BackendType::KinstrPrfcntBad => 1 << 4,
        }
    }

    /// Parse a back-end type from its fixed name.
    ///
    /// Unknown names fail with [`Error::InvalidArgument`].
    pub fn from_name(name: &str) -> Result<BackendType> {
        match name {
            "vinstr" => Ok(BackendType::Vinstr),
            "vinstr_pre_r21" => Ok(BackendType::VinstrPreR21),
            "kinstr_prfcnt" => Ok(BackendType::KinstrPrfcnt),
            "kinstr_prfcnt_wa" => Ok(BackendType::KinstrPrfcntWa),
            "kinstr_prfcnt_bad" => Ok(BackendType::KinstrPrfcntBad),
            _ => Err(Error::InvalidArgument("unknown back-end name")),
        }
    }
}

/// Set of supported back-end types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendTypesSet(u8);

impl BackendTypesSet {
    /// The empty set.
    pub fn empty() -> Self {
        BackendTypesSet(0)
    }

    /// Add a back-end type to the set.
    pub fn set(&mut self, backend_type: BackendType) {
        self.0 |= backend_type.bit();
    }

    /// True if the set contains `backend_type`.
    pub fn contains(&self, backend_type: BackendType) -> bool {
        (self.0 & backend_type.bit()) != 0
    }

    /// True if no back-end type is in the set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Intersect with another set.
    pub fn intersect(&self, other: BackendTypesSet) -> BackendTypesSet {
        BackendTypesSet(self.0 & other.0)
    }

    /// The highest priority type in the set, if any.
    pub fn highest_priority(&self) -> Option<BackendType> {
        BackendType::ALL
            .iter()
            .copied()
            .find(|&backend_type| self.contains(backend_type))
    }
}

/// True for products where vinstr cannot serve: GPUs with 128 counters
/// per block, which the vinstr interface does not support.
fn is_gtux_or_later(product: ProductId) -> bool {
    use ProductId::*;

    match product {
        T60x | T62x | T720 | T760 | T820 | T830 | T860 | T880 | G31 | G51 | G52 | G57 | G57_2
        | G68 | G71 | G72 | G76 | G77 | G78 | G78Ae | G310 | G510 | G610 | G710 => false,
        _ => true,
    }
}

fn is_vinstr_available(version: KbaseVersion, product: ProductId) -> bool {
    if is_gtux_or_later(product) {
        return false;
    }

    const JM_MAX_VERSION: KbaseVersion = KbaseVersion::new(11, 40, IoctlIface::JmPostR21);
    const CSF_MAX_VERSION: KbaseVersion = KbaseVersion::new(1, 21, IoctlIface::Csf);

    match version.iface {
        IoctlIface::JmPreR21 => true,
        IoctlIface::JmPostR21 => version < JM_MAX_VERSION,
        IoctlIface::Csf => version < CSF_MAX_VERSION,
    }
}

fn is_kinstr_prfcnt_available(version: KbaseVersion) -> bool {
    const JM_MIN_VERSION: KbaseVersion = KbaseVersion::new(11, 37, IoctlIface::JmPostR21);
    const CSF_MIN_VERSION: KbaseVersion = KbaseVersion::new(1, 17, IoctlIface::Csf);

    match version.iface {
        IoctlIface::JmPostR21 => version >= JM_MIN_VERSION,
        IoctlIface::Csf => version >= CSF_MIN_VERSION,
        IoctlIface::JmPreR21 => false,
    }
}

fn is_kinstr_prfcnt_bad_available(version: KbaseVersion) -> bool {
    if is_kinstr_prfcnt_available(version) {
        return false;
    }

    const JM_MIN_VERSION: KbaseVersion = KbaseVersion::new(11, 34, IoctlIface::JmPostR21);
    const CSF_MIN_VERSION: KbaseVersion = KbaseVersion::new(1, 10, IoctlIface::Csf);

    match version.iface {
        IoctlIface::JmPostR21 => version >= JM_MIN_VERSION,
        IoctlIface::Csf => version >= CSF_MIN_VERSION,
        IoctlIface::JmPreR21 => false,
    }
}

/// Discover which counters back-ends are available for a kernel version
/// and GPU product pair.
pub fn discover(version: KbaseVersion, product: ProductId) -> BackendTypesSet {
    let mut result = BackendTypesSet::empty();

    if version.iface == IoctlIface::JmPreR21 {
        result.set(BackendType::VinstrPreR21);
        return result;
    }

    if is_vinstr_available(version, product) {
        result.set(BackendType::Vinstr);
    }

    if is_kinstr_prfcnt_available(version) {
        result.set(BackendType::KinstrPrfcnt);
    }

    if is_kinstr_prfcnt_bad_available(version) {
        result.set(BackendType::KinstrPrfcntBad);
        result.set(BackendType::KinstrPrfcntWa);
    }

    result
}

/// Select the counters back-end to use.
///
/// With an override name present, the set is narrowed to that back-end
/// first; an unknown name fails with [`Error::InvalidArgument`]. The
/// highest priority remaining type wins. An empty result fails with
/// [`Error::NotSupported`].
pub fn select(available: BackendTypesSet, name_override: Option<&str>) -> Result<BackendType> {
    let mut available = available;

    if let Some(name) = name_override {
        let desired = BackendType::from_name(name)?;

        let mut desired_set = BackendTypesSet::empty();
        desired_set.set(desired);

        available = available.intersect(desired_set);
    }

    available
        .highest_priority()
        .ok_or(Error::NotSupported("no back-end available"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jm(major: u16, minor: u16) -> KbaseVersion {
        KbaseVersion::new(major, minor, IoctlIface::JmPostR21)
    }

    fn csf(major: u16, minor: u16) -> KbaseVersion {
        KbaseVersion::new(major, minor, IoctlIface::Csf)
    }

    #[test]
    fn test_discover_pre_r21_is_vinstr_pre_r21_only() {
        for &(major, minor) in &[(10, 2), (10, 4), (11, 0)] {
            let version = KbaseVersion::new(major, minor, IoctlIface::JmPreR21);
            let set = discover(version, ProductId::T60x);

            assert!(set.contains(BackendType::VinstrPreR21));
            for &other in BackendType::ALL.iter() {
                if other != BackendType::VinstrPreR21 {
                    assert!(!set.contains(other));
                }
            }
        }
    }

    #[test]
    fn test_discover_vinstr_version_windows() {
        let set = discover(jm(11, 20), ProductId::G72);
        assert!(set.contains(BackendType::Vinstr));
        assert!(!set.contains(BackendType::KinstrPrfcnt));

        // At the ceiling, vinstr goes away.
        let set = discover(jm(11, 40), ProductId::G72);
        assert!(!set.contains(BackendType::Vinstr));

        // Both can be available in the overlap window.
        let set = discover(jm(11, 37), ProductId::G72);
        assert!(set.contains(BackendType::Vinstr));
        assert!(set.contains(BackendType::KinstrPrfcnt));
    }

    #[test]
    fn test_discover_excludes_vinstr_for_newer_products() {
        for &product in &[
            ProductId::G615,
            ProductId::G715,
            ProductId::G720,
            ProductId::G620,
            ProductId::G725,
            ProductId::G625,
        ] {
            for &version in &[csf(1, 5), csf(1, 17), csf(1, 30)] {
                assert!(!discover(version, product).contains(BackendType::Vinstr));
            }
        }
    }

    #[test]
    fn test_discover_bad_window() {
        // Below the kinstr_prfcnt minimum but above the bad minimum.
        let set = discover(csf(1, 12), ProductId::G710);
        assert!(set.contains(BackendType::KinstrPrfcntBad));
        assert!(set.contains(BackendType::KinstrPrfcntWa));
        assert!(!set.contains(BackendType::KinstrPrfcnt));

        // Below the bad minimum neither is available.
        let set = discover(csf(1, 9), ProductId::G710);
        assert!(!set.contains(BackendType::KinstrPrfcntBad));
        assert!(!set.contains(BackendType::KinstrPrfcntWa));
    }

    #[test]
    fn test_select_priority_order() {
        let set = discover(jm(11, 37), ProductId::G72);
        // Vinstr is the lowest enumerator of the available pair.
        assert_eq!(select(set, None).unwrap(), BackendType::Vinstr);

        let set = discover(csf(1, 22), ProductId::G710);
        assert_eq!(select(set, None).unwrap(), BackendType::KinstrPrfcnt);
    }

    #[test]
    fn test_select_override() {
        let set = discover(jm(11, 37), ProductId::G72);

        let selected = select(set, Some("kinstr_prfcnt")).unwrap();
        assert_eq!(selected, BackendType::KinstrPrfcnt);

        // Requesting an unavailable back-end is not supported.
        match select(set, Some("vinstr_pre_r21")) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        // Unknown names are rejected outright.
        match select(set, Some("no_such_backend")) {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_backend_name_roundtrip() {
        for &backend_type in BackendType::ALL.iter() {
            let name = backend_type.to_string();
            assert_eq!(BackendType::from_name(&name).unwrap(), backend_type);
        }
    }
}
