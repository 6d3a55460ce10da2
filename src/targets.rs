//! Turns one VM's config and guest addresses into Prometheus `http_sd`
//! target groups.

use std::net::Ipv4Addr;

use indexmap::IndexMap;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::proxmox::{AddressType, NetworkInterface, VmConfig};

const TAG_SEPARATOR: char = ';';
const LABEL_SEPARATOR: &str = "---";
const SKIPPED_TAG: &str = "skipped";

const EXPORTER_LABEL: &str = "exporter";
const NODE_EXPORTER: (&str, u16) = ("node_exporter", 9100);

/// Label values which add an extra scrape target on the same addresses.
const ROLE_EXPORTERS: [(&str, &str, u16); 2] = [
    ("blockchain", "blockchain_exporter", 9110),
    ("blockchain-secondary", "blockchain_secondary_exporter", 9109),
];

/// One element of the `http_sd` response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,

    pub labels: IndexMap<String, String>,
}

/// Labels parsed from a Proxmox tag string, plus whether the VM opted out.
#[derive(Debug, Default, PartialEq)]
pub struct Tags {
    pub skipped: bool,

    pub labels: IndexMap<String, String>,
}

/// Parse `key---value` tags separated by `;`, splitting on the first `---`.
/// Later keys overwrite earlier ones. Tags without the separator carry no
/// label, and neither do tags with an empty key such as `---x`, since
/// Prometheus rejects an empty label name.
pub fn parse_tags(input: &str) -> Tags {
    let mut tags = Tags::default();

    for tag in input.split(TAG_SEPARATOR).filter(|tag| !tag.is_empty()) {
        if tag == SKIPPED_TAG {
            tags.skipped = true;
            continue;
        }

        let Some((key, value)) = tag.split_once(LABEL_SEPARATOR) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }

        tags.labels.insert(key.to_string(), value.to_string());
    }

    tags
}

/// IPv4 guest addresses inside `subnet`, in the order the agent reported them.
fn matching_addresses(interfaces: &[NetworkInterface], subnet: &Ipv4Net) -> Vec<Ipv4Addr> {
    interfaces
        .iter()
        .flat_map(|interface| interface.ip_addresses.iter())
        .filter(|addr| addr.address_type == AddressType::Ipv4)
        .filter_map(|addr| addr.address.parse::<Ipv4Addr>().ok())
        .filter(|addr| subnet.contains(addr))
        .collect()
}

fn with_port(addresses: &[Ipv4Addr], port: u16) -> Vec<String> {
    addresses
        .iter()
        .map(|addr| format!("{addr}:{port}"))
        .collect()
}

/// Build the target groups of a single VM. The first group always scrapes
/// node_exporter, role tags add one group per extra exporter. A VM tagged
/// `skipped` yields nothing.
pub fn build(
    node: &str,
    vmid: u64,
    config: &VmConfig,
    interfaces: &[NetworkInterface],
    subnet: &Ipv4Net,
) -> Vec<TargetGroup> {
    let tags = parse_tags(config.tags.as_deref().unwrap_or_default());
    if tags.skipped {
        return vec![];
    }

    let addresses = matching_addresses(interfaces, subnet);
    let ip = addresses
        .first()
        .map(ToString::to_string)
        .unwrap_or_default();

    let mut labels = IndexMap::with_capacity(6 + tags.labels.len());
    labels.insert("vm_id".to_string(), vmid.to_string());
    labels.insert("pvehost".to_string(), node.to_string());
    labels.insert("name".to_string(), config.name.clone());
    labels.insert("ip".to_string(), ip);
    labels.insert("instance".to_string(), config.name.clone());
    labels.insert(EXPORTER_LABEL.to_string(), NODE_EXPORTER.0.to_string());
    // tags may override the fixed labels, except the exporter
    labels.extend(tags.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels.insert(EXPORTER_LABEL.to_string(), NODE_EXPORTER.0.to_string());

    let mut groups = vec![TargetGroup {
        targets: with_port(&addresses, NODE_EXPORTER.1),
        labels: labels.clone(),
    }];

    for (role, exporter, port) in ROLE_EXPORTERS {
        if !tags.labels.values().any(|value| value == role) {
            continue;
        }

        let mut labels = labels.clone();
        labels.insert(EXPORTER_LABEL.to_string(), exporter.to_string());

        groups.push(TargetGroup {
            targets: with_port(&addresses, port),
            labels,
        });
    }

    groups
}
