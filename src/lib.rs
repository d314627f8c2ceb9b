// SPDX-License-Identifier: MPL-2.0

//! The core of a paravirtualized IOMMU device.
//!
//! A guest manages DMA translation for the endpoints of a virtual bus by
//! sending ATTACH/DETACH/MAP/UNMAP/PROBE commands over a request queue:
//! domains are I/O address spaces, endpoints attach to domains, and
//! mappings translate closed IOVA intervals to host physical ranges.
//! Memory-access paths consult [`IommuDevice::translate`] on every DMA,
//! denied accesses surface as fault records on the event queue, and
//! subscribed IOTLB observers are kept coherent with every mapping change.
//!
//! The message-queue transport and the bus enumeration glue live outside
//! this crate, behind [`queue::DriverQueue`] and [`notifier::IotlbSink`].
#![no_std]
#![deny(unsafe_code)]
#![allow(dead_code, unused_imports)]

extern crate alloc;

use bitflags::bitflags;

mod device;
mod domain;
mod error;
pub mod interval;
pub mod notifier;
mod prelude;
pub mod queue;
mod snapshot;
pub mod wire;

pub use self::{
    device::{
        IommuDevice, ReservedRegion, TlbEntry, DEFAULT_PAGE_SIZE_MASK, PROBE_SIZE, QUEUE_SIZE,
    },
    domain::{DomainId, EndpointId, Mapping},
    error::{Errno, Error},
    snapshot::SNAPSHOT_VERSION,
};

bitflags! {
    /// Feature bits the device offers for negotiation.
    ///
    /// Bits 0..=5 are device-specific; the upper bits are the transport
    /// ring features the device is prepared to run with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Feature: u64 {
        /// The input address range is bounded by the configuration.
        const INPUT_RANGE   = 1 << 0;
        /// Domain ids are bounded by the configuration.
        const DOMAIN_RANGE  = 1 << 1;
        /// MAP/UNMAP requests are available.
        const MAP_UNMAP     = 1 << 2;
        /// Unattached endpoints bypass translation instead of faulting.
        const BYPASS        = 1 << 3;
        /// PROBE requests are available.
        const PROBE         = 1 << 4;
        /// Mappings may carry the MMIO flag.
        const MMIO          = 1 << 5;

        // Transport ring features.
        const INDIRECT_DESC = 1 << 28;
        const EVENT_IDX     = 1 << 29;
        const VERSION_1     = 1 << 32;
    }
}
