//! Kinstr_prfcnt counters session ioctl interface.
//!
//! Enumeration, request and metadata information travel as "flex lists":
//! strided arrays of tagged items whose stride is reported by the kernel.
//! Item type tags encode the list type in their top four bits.

use super::OffsetPointer;
use crate::syscall::SyscallIface;
use crate::Result;
use nix::libc;
use nix::{request_code_read, request_code_write};
use std::mem;
use std::os::unix::io::RawFd;

/// Kinstr performance counters interface version.
pub const API_VERSION: u16 = 0;

/// Compute a flex list item type tag.
const fn flex_list_item_type(list_type: u16, subtype: u16) -> u16 {
    (list_type << 12) | (subtype & 0xFFF)
}

/// Flex list type of enumeration items.
const FLEX_LIST_ENUMERATION: u16 = 0;
/// Flex list type of request items.
const FLEX_LIST_REQUEST: u16 = 1;
/// Flex list type of metadata items.
const FLEX_LIST_METADATA: u16 = 2;

/// Item type tags.
#[allow(missing_docs)]
pub mod item_type {
    use super::flex_list_item_type;
    use super::{FLEX_LIST_ENUMERATION, FLEX_LIST_METADATA, FLEX_LIST_REQUEST};

    /// Sentinel value terminating request and metadata lists.
    pub const NONE: u16 = 0;

    pub const ENUM_BLOCK: u16 = flex_list_item_type(FLEX_LIST_ENUMERATION, 0);
    pub const ENUM_REQUEST: u16 = flex_list_item_type(FLEX_LIST_ENUMERATION, 1);
    pub const ENUM_SAMPLE_INFO: u16 = flex_list_item_type(FLEX_LIST_ENUMERATION, 2);

    pub const REQUEST_MODE: u16 = flex_list_item_type(FLEX_LIST_REQUEST, 0);
    pub const REQUEST_ENABLE: u16 = flex_list_item_type(FLEX_LIST_REQUEST, 1);
    pub const REQUEST_SCOPE: u16 = flex_list_item_type(FLEX_LIST_REQUEST, 2);

    pub const METADATA_SAMPLE: u16 = flex_list_item_type(FLEX_LIST_METADATA, 0);
    pub const METADATA_CLOCK: u16 = flex_list_item_type(FLEX_LIST_METADATA, 1);
    pub const METADATA_BLOCK: u16 = flex_list_item_type(FLEX_LIST_METADATA, 2);
}

/// Raw block type values.
#[allow(missing_docs)]
pub mod raw_block_type {
    pub const FE: u8 = 0;
    pub const TILER: u8 = 1;
    pub const MEMORY: u8 = 2;
    pub const SHADER_CORE: u8 = 3;
    pub const FIRMWARE: u8 = 4;
    pub const CSG: u8 = 5;
}

/// Raw counter set values.
#[allow(missing_docs)]
pub mod raw_prfcnt_set {
    pub const PRIMARY: u8 = 0;
    pub const SECONDARY: u8 = 1;
    pub const TERTIARY: u8 = 2;
}

/// Block state bits of a metadata block item.
#[allow(missing_docs)]
pub mod block_state {
    pub const ON: u32 = 1 << 0;
    pub const OFF: u32 = 1 << 1;
    pub const AVAILABLE: u32 = 1 << 2;
    pub const UNAVAILABLE: u32 = 1 << 3;
    pub const NORMAL_MODE: u32 = 1 << 4;
    pub const PROTECTED_MODE: u32 = 1 << 5;
}

/// Sample flag bits of a metadata sample item.
#[allow(missing_docs)]
pub mod sample_flag {
    pub const OVERFLOW: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 30;
}

/// Header at the start of every flex list item.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemHeader {
    /// Type of the item.
    pub item_type: u16,
    /// Protocol version of the item.
    pub item_version: u16,
}

/// Enumeration item describing one counters block type.
///
/// A block item with zero instances and zero values is the enumeration
/// list sentinel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumItemBlock {
    /// Item header.
    pub hdr: ItemHeader,
    /// Padding.
    pub padding: [u8; 4],
    /// Type of the counters block.
    pub block_type: u8,
    /// The counter set this block provides.
    pub set: u8,
    /// Padding.
    pub pad: [u8; 2],
    /// How many instances of this block type exist in the hardware.
    pub num_instances: u16,
    /// How many entries the values array has for this block.
    pub num_values: u16,
    /// Counter availability bitmask.
    pub counter_mask: [u64; 2],
}

/// Enumeration item describing one supported request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumItemRequest {
    /// Item header.
    pub hdr: ItemHeader,
    /// Padding.
    pub padding: [u8; 4],
    /// Type of the request described.
    pub request_item_type: u16,
    /// Padding.
    pub pad: u16,
    /// Bitmask of interface versions supporting this request.
    pub versions_mask: u32,
}

/// Request types appearing in [`EnumItemRequest`].
#[allow(missing_docs)]
pub mod enum_request_type {
    pub const MODE: u16 = 0;
    pub const ENABLE: u16 = 1;
    pub const SCOPE: u16 = 2;
}

/// Enumeration item describing sample information.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumItemSampleInfo {
    /// Item header.
    pub hdr: ItemHeader,
    /// Padding.
    pub padding: [u8; 4],
    /// Number of clock domains of the GPU.
    pub num_clock_domains: u32,
    /// Padding.
    pub pad: u32,
}

/// Maximum number of clock domains reported in a clock metadata item.
pub const MAX_REPORTED_DOMAINS: usize = 4;

/// Sampling mode values of a mode request.
#[allow(missing_docs)]
pub mod sampling_mode {
    pub const MANUAL: u8 = 0;
    pub const PERIODIC: u8 = 1;
}

/// Mode request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMode {
    /// Capture mode for the session.
    pub mode: u8,
    /// Padding.
    pub pad: [u8; 7],
    /// Sample period in nanoseconds, for periodic mode.
    pub period_ns: u64,
}

/// Enable request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestEnable {
    /// Type of the counters block to enable.
    pub block_type: u8,
    /// Counter set to use.
    pub set: u8,
    /// Padding.
    pub pad: [u8; 6],
    /// Bitmask of counters to enable.
    pub enable_mask: [u64; 2],
}

/// Request item payload union.
#[repr(C)]
#[derive(Clone, Copy)]
pub union RequestPayload {
    /// Mode request payload.
    pub mode: RequestMode,
    /// Enable request payload.
    pub enable: RequestEnable,
    /// Raw payload bytes.
    pub raw: [u8; 24],
}

impl std::fmt::Debug for RequestPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestPayload {{ {:?} }}", unsafe { self.raw })
    }
}

/// Performance counter request item.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestItem {
    /// Item header.
    pub hdr: ItemHeader,
    /// Padding.
    pub padding: [u8; 4],
    /// Request payload.
    pub payload: RequestPayload,
}

impl RequestItem {
    /// The list sentinel item.
    pub fn sentinel() -> Self {
        RequestItem::default()
    }

    /// Construct a mode request.
    pub fn mode(period_ns: u64) -> Self {
        let mut item = RequestItem::default();
        item.hdr = ItemHeader {
            item_type: item_type::REQUEST_MODE,
            item_version: API_VERSION,
        };

        let mut mode = RequestMode::default();
        if period_ns == 0 {
            mode.mode = sampling_mode::MANUAL;
        } else {
            mode.mode = sampling_mode::PERIODIC;
            mode.period_ns = period_ns;
        }

        item.payload = RequestPayload { mode };
        item
    }

    /// Construct an enable request.
    pub fn enable(block_type: u8, set: u8, enable_mask: [u64; 2]) -> Self {
        let mut item = RequestItem::default();
        item.hdr = ItemHeader {
            item_type: item_type::REQUEST_ENABLE,
            item_version: API_VERSION,
        };

        item.payload = RequestPayload {
            enable: RequestEnable {
                block_type,
                set,
                pad: [0; 6],
                enable_mask,
            },
        };
        item
    }
}

impl Default for RequestItem {
    fn default() -> Self {
        RequestItem {
            hdr: ItemHeader::default(),
            padding: [0; 4],
            payload: RequestPayload { raw: [0; 24] },
        }
    }
}

impl std::fmt::Debug for RequestItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestItem {{ {:?} }}", self.hdr)
    }
}

/// Metadata item describing the sample itself.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataItemSample {
    /// Item header.
    pub hdr: ItemHeader,
    /// Padding.
    pub padding: [u8; 4],
    /// Earliest timestamp the sample values represent.
    pub timestamp_start: u64,
    /// Latest timestamp the sample values represent.
    pub timestamp_stop: u64,
    /// Sequence number of the sample.
    pub seq: u64,
    /// User data provided to the start or sample command.
    pub user_data: u64,
    /// Property flags.
    pub flags: u32,
    /// Padding.
    pub pad: u32,
}

/// Metadata item carrying clock cycle counts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataItemClock {
    /// Item header.
    pub hdr: ItemHeader,
    /// Padding.
    pub padding: [u8; 4],
    /// Number of valid entries in `cycles`.
    pub num_domains: u32,
    /// Padding.
    pub pad: u32,
    /// Cycles elapsed in each clock domain.
    pub cycles: [u64; MAX_REPORTED_DOMAINS],
}

/// Metadata item describing one counters block of a sample.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataItemBlock {
    /// Item header.
    pub hdr: ItemHeader,
    /// Padding.
    pub padding: [u8; 4],
    /// Type of the counters block.
    pub block_type: u8,
    /// Index of the counters block.
    pub block_idx: u8,
    /// Counter set of the block.
    pub set: u8,
    /// Padding.
    pub pad_u8: u8,
    /// States the block operated in during the sample.
    pub block_state: u32,
    /// Offset from the mapping start to the block's values array.
    pub values_offset: u32,
    /// Padding.
    pub pad_u32: u32,
}

/// Control command codes.
#[allow(missing_docs)]
pub mod control_cmd_code {
    pub const START: u16 = 1;
    pub const STOP: u16 = 2;
    pub const SAMPLE_SYNC: u16 = 3;
    pub const SAMPLE_ASYNC: u16 = 4;
    pub const DISCARD: u16 = 5;
}

/// Control command for a counters session.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCmd {
    /// Command code.
    pub cmd: u16,
    /// Padding.
    pub pad: [u16; 3],
    /// User data echoed back in sample metadata.
    pub user_data: u64,
}

/// Metadata to access one sample.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleAccess {
    /// Sequence number of the sample. Set by the kernel on get, must be
    /// passed back unchanged on put.
    pub sequence: u64,
    /// Offset from the mapping start to the sample's first metadata item.
    pub sample_metadata_ptr: OffsetPointer<ItemHeader, u64>,
}

/// Kinstr_prfcnt session ioctl interface number.
const IFACE: u8 = 0xbf;

/// Issue a control command.
pub const ISSUE_COMMAND: libc::c_ulong =
    request_code_write!(IFACE, 0x0, mem::size_of::<ControlCmd>()) as libc::c_ulong;
/// Get a sample.
pub const GET_SAMPLE: libc::c_ulong =
    request_code_read!(IFACE, 0x1, mem::size_of::<SampleAccess>()) as libc::c_ulong;
/// Put a sample.
pub const PUT_SAMPLE: libc::c_ulong =
    request_code_write!(IFACE, 0x10, mem::size_of::<SampleAccess>()) as libc::c_ulong;

/// Issue a session control command.
pub fn issue_command<S: SyscallIface>(syscall: &S, fd: RawFd, cmd: u16, user_data: u64) -> Result<()> {
    let mut command = ControlCmd {
        cmd,
        pad: [0; 3],
        user_data,
    };

    unsafe { syscall.ioctl_ptr(fd, ISSUE_COMMAND, &mut command as *mut _ as *mut libc::c_void)? };
    Ok(())
}

/// Get a sample access descriptor.
pub fn get_sample<S: SyscallIface>(syscall: &S, fd: RawFd) -> Result<SampleAccess> {
    let mut access = SampleAccess::default();
    unsafe { syscall.ioctl_ptr(fd, GET_SAMPLE, &mut access as *mut _ as *mut libc::c_void)? };
    Ok(access)
}

/// Put a sample back to the kernel.
pub fn put_sample<S: SyscallIface>(syscall: &S, fd: RawFd, mut access: SampleAccess) -> Result<()> {
    unsafe { syscall.ioctl_ptr(fd, PUT_SAMPLE, &mut access as *mut _ as *mut libc::c_void)? };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_type_tags() {
        assert_eq!(item_type::ENUM_BLOCK, 0x0000);
        assert_eq!(item_type::ENUM_REQUEST, 0x0001);
        assert_eq!(item_type::ENUM_SAMPLE_INFO, 0x0002);
        assert_eq!(item_type::REQUEST_MODE, 0x1000);
        assert_eq!(item_type::REQUEST_ENABLE, 0x1001);
        assert_eq!(item_type::METADATA_SAMPLE, 0x2000);
        assert_eq!(item_type::METADATA_CLOCK, 0x2001);
        assert_eq!(item_type::METADATA_BLOCK, 0x2002);
    }

    #[test]
    fn test_request_item_layout() {
        assert_eq!(mem::size_of::<RequestItem>(), 32);
        assert_eq!(mem::size_of::<MetadataItemBlock>(), 24);
        assert_eq!(mem::size_of::<MetadataItemSample>(), 48);
        assert_eq!(mem::size_of::<MetadataItemClock>(), 48);
        assert_eq!(mem::size_of::<SampleAccess>(), 16);

        let mode = RequestItem::mode(0);
        assert_eq!(unsafe { mode.payload.mode.mode }, sampling_mode::MANUAL);
        let mode = RequestItem::mode(1_000_000);
        assert_eq!(unsafe { mode.payload.mode.mode }, sampling_mode::PERIODIC);
        assert_eq!(unsafe { mode.payload.mode.period_ns }, 1_000_000);
    }
}
