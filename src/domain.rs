// SPDX-License-Identifier: MPL-2.0

//! Domains and endpoints.
//!
//! A domain is an I/O address space: one interval-keyed mapping table plus
//! the set of endpoints currently translated through it. An endpoint refers
//! to its domain by id; all cross-references between the two tables are ids,
//! never pointers, so the tables can be serialized and rebuilt freely.

use crate::{
    interval::IntervalMap,
    prelude::*,
    wire::MapFlags,
};

pub type DomainId = u32;
pub type EndpointId = u32;

/// One installed translation: the host physical base for the interval's
/// lower bound, plus the access bits granted by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub phys_addr: u64,
    pub flags: MapFlags,
}

/// An I/O address space.
#[derive(Debug)]
pub(crate) struct Domain {
    pub id: DomainId,
    pub mappings: IntervalMap<Mapping>,
    /// Endpoints attached to this domain, kept for map/unmap fan-out.
    pub endpoints: BTreeSet<EndpointId>,
}

impl Domain {
    pub fn new(id: DomainId) -> Self {
        Domain {
            id,
            mappings: IntervalMap::new(),
            endpoints: BTreeSet::new(),
        }
    }
}

/// A DMA-capable device instance on the bus.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub id: EndpointId,
    /// `None` means unattached.
    pub domain: Option<DomainId>,
}

impl Endpoint {
    pub fn new(id: EndpointId) -> Self {
        Endpoint { id, domain: None }
    }
}
