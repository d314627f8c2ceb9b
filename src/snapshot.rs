// SPDX-License-Identifier: MPL-2.0

//! Migration snapshot of the translation tables.
//!
//! The image holds both id tables in ascending id order. Domains carry
//! their mappings and the ids of their attached endpoints; endpoints carry
//! their id only. The endpoint→domain links are deliberately not written:
//! they are rebuilt on load by scanning the domains' endpoint lists, so an
//! image stays loadable even if the endpoint record grows in a later
//! schema revision.

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Domain, DomainId, Endpoint, EndpointId, Mapping},
    interval::Interval,
    prelude::*,
    wire::MapFlags,
};

/// Version of the snapshot image format.
pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct MappingRecord {
    low: u64,
    high: u64,
    phys_addr: u64,
    flags: u32,
}

#[derive(Serialize, Deserialize)]
struct DomainRecord {
    id: DomainId,
    mappings: Vec<MappingRecord>,
    endpoints: Vec<EndpointId>,
}

#[derive(Serialize, Deserialize)]
struct EndpointRecord {
    id: EndpointId,
}

#[derive(Serialize, Deserialize)]
struct Image {
    version: u8,
    domains: Vec<DomainRecord>,
    endpoints: Vec<EndpointRecord>,
}

pub(crate) fn save(
    domains: &BTreeMap<DomainId, Domain>,
    endpoints: &BTreeMap<EndpointId, Endpoint>,
) -> Result<Vec<u8>> {
    let image = Image {
        version: SNAPSHOT_VERSION,
        domains: domains
            .values()
            .map(|domain| DomainRecord {
                id: domain.id,
                mappings: domain
                    .mappings
                    .iter()
                    .map(|(interval, mapping)| MappingRecord {
                        low: interval.low,
                        high: interval.high,
                        phys_addr: mapping.phys_addr,
                        flags: mapping.flags.bits(),
                    })
                    .collect(),
                endpoints: domain.endpoints.iter().copied().collect(),
            })
            .collect(),
        endpoints: endpoints
            .values()
            .map(|endpoint| EndpointRecord { id: endpoint.id })
            .collect(),
    };

    postcard::to_allocvec(&image)
        .map_err(|_| Error::with_msg(OutOfMemory, "snapshot serialization failed"))
}

pub(crate) fn load(
    bytes: &[u8],
) -> Result<(BTreeMap<DomainId, Domain>, BTreeMap<EndpointId, Endpoint>)> {
    // The version byte leads the image; refuse anything newer before
    // attempting to decode the rest.
    match bytes.first() {
        Some(&SNAPSHOT_VERSION) => {}
        Some(_) => return_errno_with_msg!(Unsupported, "unsupported snapshot version"),
        None => return_errno_with_msg!(DeviceError, "empty snapshot image"),
    }
    let image: Image = postcard::from_bytes(bytes)
        .map_err(|_| Error::with_msg(DeviceError, "malformed snapshot image"))?;

    // First pass: rebuild both tables with fresh interval maps and
    // placeholder endpoint lists.
    let mut domains = BTreeMap::new();
    for record in image.domains {
        let mut domain = Domain::new(record.id);
        for mapping in record.mappings {
            domain.mappings.insert(
                Interval::new(mapping.low, mapping.high),
                Mapping {
                    phys_addr: mapping.phys_addr,
                    flags: MapFlags::from_bits_retain(mapping.flags),
                },
            )?;
        }
        domain.endpoints = record.endpoints.into_iter().collect();
        if domains.insert(record.id, domain).is_some() {
            return_errno_with_msg!(DeviceError, "duplicate domain id in snapshot");
        }
    }

    let mut endpoints = BTreeMap::new();
    for record in image.endpoints {
        if endpoints
            .insert(record.id, Endpoint::new(record.id))
            .is_some()
        {
            return_errno_with_msg!(DeviceError, "duplicate endpoint id in snapshot");
        }
    }

    // Second pass: repair the endpoint→domain back-references from the
    // domains' endpoint lists.
    for endpoint in endpoints.values_mut() {
        for domain in domains.values() {
            if domain.endpoints.contains(&endpoint.id) {
                endpoint.domain = Some(domain.id);
                break;
            }
        }
    }

    Ok((domains, endpoints))
}
