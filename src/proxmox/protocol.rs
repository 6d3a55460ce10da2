use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

fn null_to_default<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(d)?;
    Ok(opt.unwrap_or_default())
}

/// Proxmox reports `vmid` as a number, some older releases as a string.
fn number_or_string<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct VmidVisitor;

    impl Visitor<'_> for VmidVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a vmid as integer or string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("negative vmid {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            v.parse()
                .map_err(|_| E::custom(format!("invalid vmid {v:?}")))
        }
    }

    d.deserialize_any(VmidVisitor)
}

/// Every API response wraps the payload in `data`, which is `null` when the
/// call failed on the server side.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
}

/// Response of `POST /access/ticket`
#[derive(Debug, Deserialize)]
pub struct Ticket {
    pub ticket: String,

    pub username: Option<String>,
}

/// One element of `GET /nodes`, not all field included.
#[derive(Debug, Deserialize)]
pub struct Node {
    pub node: String,
}

/// One element of `GET /nodes/{node}/qemu`, not all field included.
#[derive(Debug, Deserialize)]
pub struct VmSummary {
    #[serde(deserialize_with = "number_or_string")]
    pub vmid: u64,
}

/// The part of `GET /nodes/{node}/qemu/{vmid}/config` this crate needs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct VmConfig {
    #[serde(default, deserialize_with = "null_to_default")]
    pub name: String,

    /// Semicolon separated, absent when the VM has no tags.
    #[serde(default)]
    pub tags: Option<String>,
}

/// `data` of `GET /nodes/{node}/qemu/{vmid}/agent/network-get-interfaces`
#[derive(Debug, Deserialize)]
pub struct AgentResult<T> {
    pub result: Option<T>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct NetworkInterface {
    #[serde(default, deserialize_with = "null_to_default")]
    pub name: String,

    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Ipv4,
    Ipv6,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IpAddress {
    #[serde(rename = "ip-address")]
    pub address: String,

    #[serde(rename = "ip-address-type")]
    pub address_type: AddressType,
}

impl IpAddress {
    pub fn ipv4(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            address_type: AddressType::Ipv4,
        }
    }

    pub fn ipv6(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            address_type: AddressType::Ipv6,
        }
    }
}
