// SPDX-License-Identifier: MPL-2.0

//! IOTLB notifier registry.
//!
//! Downstream translation caches subscribe per endpoint and are told about
//! every mapping change of that endpoint's current domain, so they stay
//! coherent across MAP/UNMAP commands and across rebinding. Sinks are
//! invoked under the device mutex and must not call back into the core.

use crate::{domain::EndpointId, prelude::*};

/// A subscriber keeping a downstream IOTLB coherent with one endpoint's
/// address space.
pub trait IotlbSink: Send {
    /// The range `[iova, iova + size)` became backed by `phys`.
    fn map(&mut self, iova: u64, phys: u64, size: u64);
    /// The range `[iova, iova + size)` was withdrawn.
    fn unmap(&mut self, iova: u64, size: u64);
}

struct Registration {
    endpoint: EndpointId,
    sink: Box<dyn IotlbSink>,
}

/// The set of live subscriptions, one record per subscribed endpoint.
#[derive(Default)]
pub(crate) struct NotifierRegistry {
    entries: Vec<Registration>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        NotifierRegistry {
            entries: Vec::new(),
        }
    }

    /// Activates a subscription for `endpoint`.
    pub fn register(&mut self, endpoint: EndpointId, sink: Box<dyn IotlbSink>) {
        trace!("iommu: notifier added for endpoint {:#x}", endpoint);
        self.entries.push(Registration { endpoint, sink });
    }

    /// Drops every subscription for `endpoint`.
    pub fn unregister(&mut self, endpoint: EndpointId) {
        trace!("iommu: notifier removed for endpoint {:#x}", endpoint);
        self.entries.retain(|entry| entry.endpoint != endpoint);
    }

    /// The sinks subscribed to `endpoint`.
    pub fn for_endpoint(
        &mut self,
        endpoint: EndpointId,
    ) -> impl Iterator<Item = &mut Box<dyn IotlbSink>> + '_ {
        self.entries
            .iter_mut()
            .filter(move |entry| entry.endpoint == endpoint)
            .map(|entry| &mut entry.sink)
    }
}
