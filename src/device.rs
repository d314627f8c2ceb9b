// SPDX-License-Identifier: MPL-2.0

//! The IOMMU device core.
//!
//! One instance owns the translation state of the whole virtual bus: the
//! domain and endpoint tables, every domain's interval-keyed mapping table,
//! and the IOTLB notifier registry. Guest commands arrive as descriptor
//! chains on the request queue and go through [`IommuDevice::handle_requests`];
//! memory-access paths call [`IommuDevice::translate`] on every DMA;
//! translation faults are pushed into the event queue.
//!
//! A single mutex protects all of it. Nothing suspends while holding the
//! mutex, and notifier sinks are invoked synchronously under it, so they
//! must not call back into the device.

use core::{
    mem::size_of,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::Mutex;
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    domain::{Domain, DomainId, Endpoint, EndpointId, Mapping},
    interval::Interval,
    notifier::{IotlbSink, NotifierRegistry},
    prelude::*,
    queue::{DescChain, DriverQueue},
    snapshot,
    wire::{
        Access, AddrRange, AttachReq, DetachReq, FaultFlags, FaultReason, FaultRecord,
        IommuConfig, MapFlags, MapReq, ProbeProperty, ProbeReq, ReqHead, ReqStatus, ReqTail,
        ReqType, ResvMemProperty, ResvRegionType, UnmapReq, PROBE_T_NONE, PROBE_T_RESV_MEM,
    },
    Feature,
};

/// Default size of the request and event queues.
pub const QUEUE_SIZE: u16 = 256;
/// Size of the property blob answered to a PROBE request.
pub const PROBE_SIZE: u32 = 512;
/// Default page size mask: 4 KiB translation granule.
pub const DEFAULT_PAGE_SIZE_MASK: u64 = !0xfff;

static NO_EVENT_BUFFER_LOGGED: AtomicBool = AtomicBool::new(false);
static UNKNOWN_ENDPOINT_LOGGED: AtomicBool = AtomicBool::new(false);

/// A reserved IOVA window, fixed at construction.
///
/// Accesses inside a reserved window never reach the domain's mappings:
/// MSI windows translate as identity, anything else faults.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRegion {
    pub low: u64,
    pub high: u64,
    pub ty: ResvRegionType,
}

/// Result of one translation on the DMA path.
///
/// `perm` is empty when the access was denied; a fault record has then
/// been pushed into the event queue (unless the access was bypassed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub iova: u64,
    pub translated_addr: u64,
    pub addr_mask: u64,
    pub perm: Access,
}

struct State {
    domains: BTreeMap<DomainId, Domain>,
    endpoints: BTreeMap<EndpointId, Endpoint>,
    notifiers: NotifierRegistry,
    event_queue: Option<Box<dyn DriverQueue>>,
    acked_features: Feature,
    broken: bool,
}

pub struct IommuDevice {
    features: Feature,
    page_size_mask: u64,
    probe_size: u32,
    reserved_regions: Vec<ReservedRegion>,
    state: Mutex<State>,
}

impl IommuDevice {
    /// Creates the device with its fixed set of reserved IOVA windows.
    pub fn new(reserved_regions: Vec<ReservedRegion>) -> Self {
        let features = Feature::EVENT_IDX
            | Feature::INDIRECT_DESC
            | Feature::VERSION_1
            | Feature::INPUT_RANGE
            | Feature::DOMAIN_RANGE
            | Feature::MAP_UNMAP
            | Feature::BYPASS
            | Feature::MMIO
            | Feature::PROBE;
        IommuDevice {
            features,
            page_size_mask: DEFAULT_PAGE_SIZE_MASK,
            probe_size: PROBE_SIZE,
            reserved_regions,
            state: Mutex::new(State {
                domains: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                notifiers: NotifierRegistry::new(),
                event_queue: None,
                acked_features: Feature::empty(),
                broken: false,
            }),
        }
    }

    /// The feature bits the device offers.
    pub fn features(&self) -> Feature {
        self.features
    }

    /// Records the feature bits the guest accepted.
    pub fn ack_features(&self, bits: u64) {
        let acked = Feature::from_bits_truncate(bits);
        trace!("iommu: guest acked features {:?}", acked);
        self.state.lock().acked_features = acked;
    }

    /// Device configuration as read by the guest, in wire byte order.
    pub fn config(&self) -> IommuConfig {
        IommuConfig {
            page_size_mask: self.page_size_mask.to_le(),
            input_range: AddrRange {
                start: 0u64.to_le(),
                end: u64::MAX.to_le(),
            },
            domain_range: AddrRange {
                start: 0u64.to_le(),
                end: 32u64.to_le(),
            },
            probe_size: self.probe_size.to_le(),
        }
    }

    /// Guest writes to the configuration are accepted and ignored.
    pub fn set_config(&self, _data: &[u8]) {
        trace!("iommu: guest wrote device config, ignored");
    }

    /// Transport hook; the core keeps no per-status state.
    pub fn set_status(&self, status: u8) {
        trace!("iommu: device status {:#x}", status);
    }

    /// Transport hook; the translation tables survive a queue reset.
    pub fn reset(&self) {
        trace!("iommu: device reset");
    }

    /// Installs the queue that fault records are pushed into.
    pub fn set_event_queue(&self, queue: Box<dyn DriverQueue>) {
        self.state.lock().event_queue = Some(queue);
    }

    /// Activates an IOTLB subscription for `endpoint`.
    pub fn register_notifier(&self, endpoint: EndpointId, sink: Box<dyn IotlbSink>) {
        self.state.lock().notifiers.register(endpoint, sink);
    }

    /// Drops the IOTLB subscription(s) for `endpoint`.
    pub fn unregister_notifier(&self, endpoint: EndpointId) {
        self.state.lock().notifiers.unregister(endpoint);
    }

    /// Drains the request queue, answering every pending command.
    ///
    /// Returns an error only for transport-level failures (descriptor
    /// chains too small for a request head and status tail); the device is
    /// then left in an error state and stops serving requests. Protocol
    /// errors are reported through the status tail instead.
    pub fn handle_requests(&self, queue: &mut dyn DriverQueue) -> Result<()> {
        loop {
            if self.state.lock().broken {
                return_errno_with_msg!(IoFailed, "device is in an error state");
            }
            let Some(mut chain) = queue.pop() else {
                return Ok(());
            };
            if chain.in_capacity() < size_of::<ReqTail>()
                || chain.out_bytes().len() < size_of::<ReqHead>()
            {
                error!("iommu: descriptor chain too small for request head and tail");
                self.state.lock().broken = true;
                queue.detach(chain);
                return_errno_with_msg!(IoFailed, "descriptor chain below head/tail size");
            }

            let reply = {
                let mut state = self.state.lock();
                self.process_one(&mut state, chain.out_bytes())
            };

            if chain.write_in(&reply).is_err() {
                error!("iommu: reply does not fit the descriptor chain");
                self.state.lock().broken = true;
                queue.detach(chain);
                return_errno_with_msg!(IoFailed, "reply exceeds chain capacity");
            }
            queue.push(chain);
        }
    }

    /// Parses and dispatches one request, returning the bytes for the
    /// chain's writable side (the status tail, preceded by the property
    /// blob for PROBE).
    fn process_one(&self, state: &mut State, out: &[u8]) -> Vec<u8> {
        let Ok((head, payload)) = ReqHead::read_from_prefix(out) else {
            return ReqTail::new(ReqStatus::DevErr).as_bytes().to_vec();
        };
        match ReqType::try_from(head.req_type) {
            Ok(ReqType::Attach) => Self::tail(Self::attach(state, payload)),
            Ok(ReqType::Detach) => Self::tail(Self::detach(state, payload)),
            Ok(ReqType::Map) => Self::tail(Self::map(state, payload)),
            Ok(ReqType::Unmap) => Self::tail(Self::unmap(state, payload)),
            Ok(ReqType::Probe) => {
                let probe_size = self.probe_size as usize;
                let mut reply = vec![0u8; probe_size + size_of::<ReqTail>()];
                let status = Self::status_of(self.probe(payload, &mut reply[..probe_size]));
                reply[probe_size..].copy_from_slice(ReqTail::new(status).as_bytes());
                reply
            }
            Err(_) => Self::tail(Err(Error::new(Unsupported))),
        }
    }

    fn tail(result: Result<()>) -> Vec<u8> {
        ReqTail::new(Self::status_of(result)).as_bytes().to_vec()
    }

    fn status_of(result: Result<()>) -> ReqStatus {
        match result {
            Ok(()) => ReqStatus::Ok,
            Err(e) => match e.errno() {
                IoFailed => ReqStatus::IoErr,
                Unsupported => ReqStatus::Unsupp,
                DeviceError => ReqStatus::DevErr,
                InvalidArgs => ReqStatus::Inval,
                OutOfRange => ReqStatus::Range,
                NotFound => ReqStatus::Noent,
                Faulted => ReqStatus::Fault,
                OutOfMemory => ReqStatus::Nomem,
            },
        }
    }

    fn attach(state: &mut State, payload: &[u8]) -> Result<()> {
        let Ok((req, _)) = AttachReq::read_from_prefix(payload) else {
            return_errno_with_msg!(DeviceError, "truncated attach payload");
        };
        let domain_id = u32::from_le(req.domain);
        let ep_id = u32::from_le(req.endpoint);
        debug!("iommu: attach endpoint {:#x} to domain {}", ep_id, domain_id);

        let endpoint = state
            .endpoints
            .entry(ep_id)
            .or_insert_with(|| Endpoint::new(ep_id));
        if endpoint.domain.is_some() {
            // Rebinding: leave the old domain first.
            Self::detach_endpoint_from_domain(state, ep_id);
        }

        let domain = state
            .domains
            .entry(domain_id)
            .or_insert_with(|| Domain::new(domain_id));
        domain.endpoints.insert(ep_id);
        if let Some(endpoint) = state.endpoints.get_mut(&ep_id) {
            endpoint.domain = Some(domain_id);
        }

        // Replay the domain's mappings so a rebinding endpoint's IOTLB
        // ends up coherent again.
        let State {
            domains, notifiers, ..
        } = state;
        if let Some(domain) = domains.get(&domain_id) {
            for (interval, mapping) in domain.mappings.iter() {
                for sink in notifiers.for_endpoint(ep_id) {
                    sink.map(interval.low, mapping.phys_addr, interval.size());
                }
            }
        }
        Ok(())
    }

    fn detach(state: &mut State, payload: &[u8]) -> Result<()> {
        let Ok((req, _)) = DetachReq::read_from_prefix(payload) else {
            return_errno_with_msg!(DeviceError, "truncated detach payload");
        };
        let domain_id = u32::from_le(req.domain);
        let ep_id = u32::from_le(req.endpoint);
        debug!("iommu: detach endpoint {:#x} from domain {}", ep_id, domain_id);

        let Some(endpoint) = state.endpoints.get(&ep_id) else {
            return_errno!(NotFound);
        };
        if endpoint.domain.is_none() {
            return_errno_with_msg!(InvalidArgs, "endpoint is not attached");
        }
        Self::detach_endpoint_from_domain(state, ep_id);
        Ok(())
    }

    /// Unlinks `ep_id` from its domain, telling the endpoint's notifiers
    /// to drop every mapping first.
    fn detach_endpoint_from_domain(state: &mut State, ep_id: EndpointId) {
        let State {
            domains,
            endpoints,
            notifiers,
            ..
        } = state;
        let Some(endpoint) = endpoints.get_mut(&ep_id) else {
            return;
        };
        let Some(domain_id) = endpoint.domain else {
            return;
        };
        if let Some(domain) = domains.get_mut(&domain_id) {
            for (interval, _) in domain.mappings.iter() {
                for sink in notifiers.for_endpoint(ep_id) {
                    sink.unmap(interval.low, interval.size());
                }
            }
            domain.endpoints.remove(&ep_id);
        }
        endpoint.domain = None;
    }

    fn map(state: &mut State, payload: &[u8]) -> Result<()> {
        let Ok((req, _)) = MapReq::read_from_prefix(payload) else {
            return_errno_with_msg!(DeviceError, "truncated map payload");
        };
        let domain_id = u32::from_le(req.domain);
        let virt_start = u64::from_le(req.virt_start);
        let virt_end = u64::from_le(req.virt_end);
        let phys_start = u64::from_le(req.phys_start);
        let flags = MapFlags::from_bits_retain(u32::from_le(req.flags));

        let State {
            domains, notifiers, ..
        } = state;
        let Some(domain) = domains.get_mut(&domain_id) else {
            return_errno!(NotFound);
        };

        let interval = Interval::new(virt_start, virt_end);
        domain.mappings.insert(
            interval,
            Mapping {
                phys_addr: phys_start,
                flags,
            },
        )?;
        debug!(
            "iommu: map [{:#x}, {:#x}] -> {:#x} in domain {}, flags {:?}",
            virt_start, virt_end, phys_start, domain_id, flags
        );

        // Every endpoint of the address space shares the new mapping.
        for ep_id in domain.endpoints.iter() {
            for sink in notifiers.for_endpoint(*ep_id) {
                sink.map(virt_start, phys_start, interval.size());
            }
        }
        Ok(())
    }

    fn unmap(state: &mut State, payload: &[u8]) -> Result<()> {
        let Ok((req, _)) = UnmapReq::read_from_prefix(payload) else {
            return_errno_with_msg!(DeviceError, "truncated unmap payload");
        };
        let domain_id = u32::from_le(req.domain);
        let virt_start = u64::from_le(req.virt_start);
        let virt_end = u64::from_le(req.virt_end);
        debug!(
            "iommu: unmap [{:#x}, {:#x}] in domain {}",
            virt_start, virt_end, domain_id
        );

        let State {
            domains, notifiers, ..
        } = state;
        let Some(domain) = domains.get_mut(&domain_id) else {
            warn!("iommu: unmap in unknown domain {}", domain_id);
            return_errno!(NotFound);
        };

        let query = Interval::new(virt_start, virt_end);
        while let Some(found) = domain.mappings.find_any_overlapping(query) {
            if !query.covers(&found) {
                // Refuse to split a live mapping. Mappings already removed
                // in this loop stay removed.
                warn!(
                    "iommu: unmap [{:#x}, {:#x}] in domain {} forbidden, it would \
                     split mapping [{:#x}, {:#x}]",
                    virt_start, virt_end, domain_id, found.low, found.high
                );
                return_errno!(OutOfRange);
            }
            domain.mappings.remove(&found);
            for ep_id in domain.endpoints.iter() {
                for sink in notifiers.for_endpoint(*ep_id) {
                    sink.unmap(found.low, found.size());
                }
            }
            debug!(
                "iommu: unmapped [{:#x}, {:#x}] in domain {}",
                found.low, found.high, domain_id
            );
        }
        Ok(())
    }

    /// Fills `buf` (of configured probe size) with the reserved-memory
    /// properties and the list terminator.
    fn probe(&self, payload: &[u8], buf: &mut [u8]) -> Result<()> {
        let Ok((req, _)) = ProbeReq::read_from_prefix(payload) else {
            return_errno_with_msg!(DeviceError, "truncated probe payload");
        };
        let ep_id = u32::from_le(req.endpoint);

        let prop_size = size_of::<ResvMemProperty>();
        let free = buf.len() - size_of::<ProbeProperty>();
        if self.reserved_regions.len() * prop_size > free {
            return_errno_with_msg!(InvalidArgs, "reserved regions exceed probe buffer");
        }

        let mut offset = 0;
        for region in &self.reserved_regions {
            let prop = ResvMemProperty {
                head: ProbeProperty {
                    prop_type: PROBE_T_RESV_MEM.to_le(),
                    length: ((prop_size - size_of::<ProbeProperty>()) as u16).to_le(),
                },
                subtype: (region.ty as u64).to_le(),
                start: region.low.to_le(),
                end: region.high.to_le(),
            };
            buf[offset..offset + prop_size].copy_from_slice(prop.as_bytes());
            offset += prop_size;
            debug!(
                "iommu: probe endpoint {:#x}: resv mem [{:#x}, {:#x}] subtype {:?}",
                ep_id, region.low, region.high, region.ty
            );
        }

        let terminator = ProbeProperty {
            prop_type: PROBE_T_NONE,
            length: 0,
        };
        buf[offset..offset + size_of::<ProbeProperty>()].copy_from_slice(terminator.as_bytes());
        Ok(())
    }

    /// Translates one access on the DMA path.
    ///
    /// Denied accesses come back with an empty `perm` after a fault record
    /// was pushed into the event queue; with the bypass feature negotiated,
    /// unattached endpoints get identity translation instead.
    pub fn translate(&self, ep_id: EndpointId, iova: u64, access: Access) -> TlbEntry {
        let mut entry = TlbEntry {
            iova,
            translated_addr: iova,
            addr_mask: (1u64 << self.page_size_mask.trailing_zeros()) - 1,
            perm: Access::empty(),
        };

        let mut state = self.state.lock();
        let state = &mut *state;
        let bypass_allowed = state.acked_features.contains(Feature::BYPASS);

        trace!(
            "iommu: translate iova {:#x} for endpoint {:#x}, access {:?}",
            iova,
            ep_id,
            access
        );

        let endpoint_domain = match state.endpoints.get(&ep_id) {
            Some(endpoint) => endpoint.domain,
            None => {
                if bypass_allowed {
                    entry.perm = access;
                } else {
                    if !UNKNOWN_ENDPOINT_LOGGED.swap(true, Ordering::Relaxed) {
                        error!("iommu: endpoint {:#x} is not known", ep_id);
                    }
                    Self::report_fault(state, FaultReason::Unknown, FaultFlags::empty(), ep_id, 0);
                }
                return entry;
            }
        };

        // Reserved windows take precedence over the domain's mappings.
        for region in &self.reserved_regions {
            if iova >= region.low && iova <= region.high {
                match region.ty {
                    ResvRegionType::Msi => entry.perm = access,
                    ResvRegionType::Reserved => {
                        Self::report_fault(
                            state,
                            FaultReason::Mapping,
                            FaultFlags::empty(),
                            ep_id,
                            iova,
                        );
                    }
                }
                return entry;
            }
        }

        let Some(domain_id) = endpoint_domain else {
            if bypass_allowed {
                entry.perm = access;
            } else {
                warn!("iommu: endpoint {:#x} is not attached to any domain", ep_id);
                Self::report_fault(state, FaultReason::Domain, FaultFlags::empty(), ep_id, 0);
            }
            return entry;
        };

        let found = state
            .domains
            .get(&domain_id)
            .and_then(|domain| domain.mappings.find_containing(iova))
            .map(|(interval, mapping)| (interval, *mapping));
        let Some((interval, mapping)) = found else {
            warn!(
                "iommu: no mapping for iova {:#x} on endpoint {:#x}",
                iova, ep_id
            );
            Self::report_fault(state, FaultReason::Mapping, FaultFlags::empty(), ep_id, iova);
            return entry;
        };

        let mut fault_flags = FaultFlags::empty();
        if access.contains(Access::READ) && !mapping.flags.contains(MapFlags::READ) {
            fault_flags |= FaultFlags::READ;
        }
        if access.contains(Access::WRITE) && !mapping.flags.contains(MapFlags::WRITE) {
            fault_flags |= FaultFlags::WRITE;
        }
        if !fault_flags.is_empty() {
            warn!(
                "iommu: permission error on iova {:#x}: requested {:?}, mapping allows {:?}",
                iova, access, mapping.flags
            );
            Self::report_fault(
                state,
                FaultReason::Mapping,
                fault_flags | FaultFlags::ADDRESS,
                ep_id,
                iova,
            );
            return entry;
        }

        entry.translated_addr = iova
            .wrapping_sub(interval.low)
            .wrapping_add(mapping.phys_addr);
        entry.perm = access;
        trace!(
            "iommu: translated iova {:#x} -> {:#x} for endpoint {:#x}",
            iova,
            entry.translated_addr,
            ep_id
        );
        entry
    }

    /// Pushes one fault record into the event queue.
    ///
    /// Descriptors too small for the record are detached and the next one
    /// is tried; with no descriptor available the record is dropped.
    fn report_fault(
        state: &mut State,
        reason: FaultReason,
        flags: FaultFlags,
        endpoint: u32,
        address: u64,
    ) {
        let record = FaultRecord {
            reason: reason as u8,
            reserved: [0; 3],
            flags: flags.bits().to_le(),
            endpoint: endpoint.to_le(),
            address: address.to_le(),
        };

        let Some(queue) = state.event_queue.as_mut() else {
            if !NO_EVENT_BUFFER_LOGGED.swap(true, Ordering::Relaxed) {
                error!("iommu: no buffer available in event queue to report event");
            }
            return;
        };
        loop {
            let Some(mut chain) = queue.pop() else {
                if !NO_EVENT_BUFFER_LOGGED.swap(true, Ordering::Relaxed) {
                    error!("iommu: no buffer available in event queue to report event");
                }
                return;
            };
            if chain.in_capacity() < size_of::<FaultRecord>()
                || chain.write_in(record.as_bytes()).is_err()
            {
                error!("iommu: event buffer of wrong size");
                queue.detach(chain);
                continue;
            }
            debug!(
                "iommu: fault reported: reason {:?}, flags {:?}, endpoint {:#x}, address {:#x}",
                reason, flags, endpoint, address
            );
            queue.push(chain);
            return;
        }
    }

    /// Re-sends a MAP event for every current mapping of `ep_id`'s domain.
    pub fn replay(&self, ep_id: EndpointId) {
        let mut state = self.state.lock();
        let State {
            domains,
            endpoints,
            notifiers,
            ..
        } = &mut *state;
        let Some(domain_id) = endpoints.get(&ep_id).and_then(|ep| ep.domain) else {
            return;
        };
        let Some(domain) = domains.get(&domain_id) else {
            return;
        };
        for (interval, mapping) in domain.mappings.iter() {
            for sink in notifiers.for_endpoint(ep_id) {
                sink.map(interval.low, mapping.phys_addr, interval.size());
            }
        }
    }

    /// Sends UNMAP followed by MAP for every current mapping of `ep_id`'s
    /// domain; the subscriber-driven refresh path.
    pub fn remap(&self, ep_id: EndpointId) {
        let mut state = self.state.lock();
        let State {
            domains,
            endpoints,
            notifiers,
            ..
        } = &mut *state;
        let Some(domain_id) = endpoints.get(&ep_id).and_then(|ep| ep.domain) else {
            return;
        };
        let Some(domain) = domains.get(&domain_id) else {
            return;
        };
        for (interval, mapping) in domain.mappings.iter() {
            trace!(
                "iommu: remap [{:#x}, {:#x}] -> {:#x}",
                interval.low,
                interval.high,
                mapping.phys_addr
            );
            for sink in notifiers.for_endpoint(ep_id) {
                sink.unmap(interval.low, interval.size());
                sink.map(interval.low, mapping.phys_addr, interval.size());
            }
        }
    }

    /// Serializes the translation tables.
    pub fn save(&self) -> Result<Vec<u8>> {
        let state = self.state.lock();
        snapshot::save(&state.domains, &state.endpoints)
    }

    /// Replaces the translation tables with a previously saved image.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let (domains, endpoints) = snapshot::load(bytes)?;
        let mut state = self.state.lock();
        state.domains = domains;
        state.endpoints = endpoints;
        Ok(())
    }

    /// Tears the device down, destroying both tables.
    ///
    /// Every domain detaches its endpoints (with the corresponding UNMAP
    /// fan-out) before its mapping table is dropped.
    pub fn unrealize(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let domain_ids: Vec<DomainId> = state.domains.keys().copied().collect();
        for domain_id in domain_ids {
            let ep_ids: Vec<EndpointId> = state
                .domains
                .get(&domain_id)
                .map(|domain| domain.endpoints.iter().copied().collect())
                .unwrap_or_default();
            for ep_id in ep_ids {
                Self::detach_endpoint_from_domain(state, ep_id);
            }
            state.domains.remove(&domain_id);
        }
        state.endpoints.clear();
    }
}
