// SPDX-License-Identifier: MPL-2.0

//! Wire protocol of the IOMMU device.
//!
//! Everything here is little-endian on the wire. Multi-byte fields are
//! stored as raw wire values and converted with `from_le`/`to_le` at the
//! point of use, so the structs can be lifted straight out of (or dropped
//! straight into) descriptor-chain buffers.

use bitflags::bitflags;
use int_to_c_enum::TryFromInt;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Request types understood by the command processor.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromInt)]
pub enum ReqType {
    Attach = 1,
    Detach = 2,
    Map = 3,
    Unmap = 4,
    Probe = 5,
}

/// Status byte written into a request tail.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromInt)]
pub enum ReqStatus {
    Ok = 0,
    IoErr = 1,
    Unsupp = 2,
    DevErr = 3,
    Inval = 4,
    Range = 5,
    Noent = 6,
    Fault = 7,
    Nomem = 8,
}

/// Reason byte of an event-queue fault record.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromInt)]
pub enum FaultReason {
    Unknown = 0,
    Domain = 1,
    Mapping = 2,
}

/// Type of a reserved IOVA window.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromInt)]
pub enum ResvRegionType {
    Reserved = 0,
    Msi = 1,
}

bitflags! {
    /// Access bits a mapping grants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const MMIO  = 1 << 2;
    }
}

bitflags! {
    /// Access requested on the DMA path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Flag bits of an event-queue fault record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const ADDRESS = 1 << 8;
    }
}

/// Fixed header of every request.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ReqHead {
    pub req_type: u8,
    pub reserved: [u8; 3],
}

/// Status tail written back for every request.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ReqTail {
    pub status: u8,
    pub reserved: [u8; 3],
}

impl ReqTail {
    pub fn new(status: ReqStatus) -> Self {
        ReqTail {
            status: status as u8,
            reserved: [0; 3],
        }
    }
}

/// ATTACH payload, following the head.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AttachReq {
    pub domain: u32,
    pub endpoint: u32,
    pub reserved: [u8; 8],
}

/// DETACH payload, following the head.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DetachReq {
    pub domain: u32,
    pub endpoint: u32,
    pub reserved: [u8; 8],
}

/// MAP payload, following the head. `virt_start..=virt_end` is closed.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MapReq {
    pub domain: u32,
    pub virt_start: u64,
    pub virt_end: u64,
    pub phys_start: u64,
    pub flags: u32,
}

/// UNMAP payload, following the head.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct UnmapReq {
    pub domain: u32,
    pub virt_start: u64,
    pub virt_end: u64,
    pub reserved: [u8; 4],
}

/// PROBE payload, following the head.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ProbeReq {
    pub endpoint: u32,
    pub reserved: [u8; 64],
}

/// Record pushed into the event queue on a translation fault.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FaultRecord {
    pub reason: u8,
    pub reserved: [u8; 3],
    pub flags: u32,
    pub endpoint: u32,
    pub address: u64,
}

/// Probe property type: reserved-memory record.
pub const PROBE_T_RESV_MEM: u16 = 1;
/// Probe property type: list terminator.
pub const PROBE_T_NONE: u16 = 0;

/// Common head of a probe property. A property list is terminated by an
/// all-zero head.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ProbeProperty {
    pub prop_type: u16,
    pub length: u16,
}

/// Reserved-memory probe property. `length` counts the bytes after the
/// property head.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ResvMemProperty {
    pub head: ProbeProperty,
    pub subtype: u64,
    pub start: u64,
    pub end: u64,
}

/// A `{start, end}` pair of the device configuration, closed on both ends.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

/// Device configuration as read by the guest.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IommuConfig {
    pub page_size_mask: u64,
    pub input_range: AddrRange,
    pub domain_range: AddrRange,
    pub probe_size: u32,
}

const_assert_eq!(core::mem::size_of::<ReqHead>(), 4);
const_assert_eq!(core::mem::size_of::<ReqTail>(), 4);
const_assert_eq!(core::mem::size_of::<AttachReq>(), 16);
const_assert_eq!(core::mem::size_of::<DetachReq>(), 16);
const_assert_eq!(core::mem::size_of::<MapReq>(), 32);
const_assert_eq!(core::mem::size_of::<UnmapReq>(), 24);
const_assert_eq!(core::mem::size_of::<ProbeReq>(), 68);
const_assert_eq!(core::mem::size_of::<FaultRecord>(), 20);
const_assert_eq!(core::mem::size_of::<ProbeProperty>(), 4);
const_assert_eq!(core::mem::size_of::<ResvMemProperty>(), 28);
const_assert_eq!(core::mem::size_of::<AddrRange>(), 16);
const_assert_eq!(core::mem::size_of::<IommuConfig>(), 44);

/// Endpoint id as the bus layer derives it from a bus number and a
/// device/function byte.
pub const fn endpoint_id(bus: u8, devfn: u8) -> u32 {
    ((bus as u32) << 8) | devfn as u32
}
