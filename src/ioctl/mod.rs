//! Binary layout primitives and kernel ioctl interfaces.
//!
//! One submodule per wire protocol generation. The structures are
//! `#[repr(C)]` and bit-exact with the kernel ABI; the request codes are
//! spelled with the `nix` request-code macros the same way the kernel
//! headers spell them with `_IOR`/`_IOW`/`_IOWR`.

mod layout;
pub use layout::{OffsetPointer, OffsetRepr, Pointer64};

pub mod kbase;
pub mod kbase_pre_r21;
pub mod kinstr_prfcnt;
pub mod vinstr;
