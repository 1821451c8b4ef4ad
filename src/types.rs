// Copyright 2021 Stratus Data Systems, Inc.

//! Core data types shared by the wire protocol and the session engine: feed
//! identifiers, product signatures, virtual-circuit endpoints, multicast group
//! coordinates, and the request/reply payloads of the session procedures.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_derive::{Deserialize, Serialize};

/// A feed identifier: a 32-bit bitmask over elemental feed codes. A
/// subscription names a desired mask; the policy oracle reduces it to an
/// allowed subset and the intersection becomes the session's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Feed(pub u32);

impl Feed {
    /// The unsubscribed sentinel.
    pub const NONE: Feed = Feed(0);
    /// Matches every elemental feed code.
    pub const ANY: Feed = Feed(u32::max_value());

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True if every elemental code of `other` is also in `self`.
    pub fn contains(self, other: Feed) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Feed) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitAnd for Feed {
    type Output = Feed;

    fn bitand(self, rhs: Feed) -> Feed {
        Feed(self.0 & rhs.0)
    }
}

impl BitOr for Feed {
    type Output = Feed;

    fn bitor(self, rhs: Feed) -> Feed {
        Feed(self.0 | rhs.0)
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The number of bytes in a product signature.
pub const SIGNATURE_LEN: usize = 16;

/// A 16-byte content signature identifying a product. Rendered as 32 hex
/// digits on the wire and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; SIGNATURE_LEN]);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SIGNATURE_LEN * 2 {
            return Err(format!(
                "signature must be {} hex digits: {:?}",
                SIGNATURE_LEN * 2,
                s
            ));
        }
        let mut bytes = [0u8; SIGNATURE_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|e| format!("bad signature {:?}: {}", s, e))?;
        }
        Ok(Signature(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct SignatureVisitor;

impl<'de> Visitor<'de> for SignatureVisitor {
    type Value = Signature;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a {}-digit hex string", SIGNATURE_LEN * 2)
    }

    fn visit_str<E>(self, value: &str) -> Result<Signature, E>
    where
        E: de::Error,
    {
        value.parse().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(SignatureVisitor)
    }
}

/// One end of a provisionable layer-2 virtual circuit. A switch or port
/// identifier beginning with `dummy` short-circuits provisioning; see
/// `vcircuit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcEndPoint {
    pub switch_id: String,
    pub port_id: String,
    pub vlan_id: u16,
}

impl VcEndPoint {
    pub fn new(switch_id: &str, port_id: &str, vlan_id: u16) -> VcEndPoint {
        VcEndPoint {
            switch_id: String::from(switch_id),
            port_id: String::from(port_id),
            vlan_id,
        }
    }
}

impl fmt::Display for VcEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.switch_id, self.port_id, self.vlan_id)
    }
}

/// A CIDR-tagged IPv4 address, as allocated to the peer's FMTP client from
/// the publisher's address pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrAddr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl CidrAddr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> CidrAddr {
        CidrAddr { addr, prefix_len }
    }

    /// Number of addresses spanned by the prefix, including the network
    /// and final addresses.
    pub fn host_count(&self) -> u32 {
        if self.prefix_len >= 32 {
            1
        } else {
            1u32 << (32 - u32::from(self.prefix_len))
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::max_value() << (32 - u32::from(self.prefix_len))
        };
        u32::from(self.addr) & mask == u32::from(addr) & mask
    }
}

impl fmt::Display for CidrAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Coordinates of a multicast publisher: the group it multicasts on and the
/// TCP server of its FMTP recovery layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McastInfo {
    pub feed: Feed,
    pub group: SocketAddrV4,
    pub fmtp_server: SocketAddrV4,
}

/// Metadata of an immutable data-product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Wall-clock insertion time at the origin.
    pub arrival: DateTime<Utc>,
    pub signature: Signature,
    pub origin: String,
    pub feed: Feed,
    pub seq_num: u32,
    pub ident: String,
    pub size: u32,
}

impl fmt::Display for ProductInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {:>8} {} {:>6} {}",
            self.arrival.format("%Y%m%d%H%M%S%.3f"),
            self.size,
            self.origin,
            self.feed,
            self.ident
        )
    }
}

/// An immutable data-product: metadata plus opaque payload bytes. Payloads
/// travel base64-encoded inside the JSON codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub info: ProductInfo,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

mod base64_bytes {
    use serde::de;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(&encoded).map_err(de::Error::custom)
    }
}

/// A product sent in response to a missed-product lookup, tagged with the
/// multicast sequence index the peer asked about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedProduct {
    pub index: u64,
    pub product: Product,
}

/// The subscription handshake request: the feed the peer wants and the
/// peer's end of the virtual circuit that will carry the multicast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub feed: Feed,
    pub vc_end: VcEndPoint,
}

/// Reply to the subscription handshake. `Unauth` and `NoEnt` are normal,
/// peer-visible rejections carried inside a successful RPC reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum SubscriptionReply {
    /// The policy oracle allows no part of the requested feed.
    Unauth,
    /// The feed is allowed but no publisher is multicasting it.
    NoEnt,
    /// Subscribed. Carries the publisher coordinates and the FMTP client
    /// address allocated to the peer.
    Ok { info: McastInfo, fmtp_addr: CidrAddr },
}

/// A backlog-replay request. Start just past `after` when present, else at
/// `now - time_offset` seconds; stream forward until the product whose
/// signature equals `before`, exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogSpec {
    pub after: Option<Signature>,
    pub time_offset: u64,
    pub before: Signature,
}

/// A product-selection filter for queue scans. Built by narrowing the
/// match-all class to a session's feed; a product matches when its feed mask
/// intersects the class's.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductClass {
    pub feed: Feed,
}

impl ProductClass {
    /// The universal class: matches every product.
    pub fn all() -> ProductClass {
        ProductClass { feed: Feed::ANY }
    }

    /// Narrow the feed mask, keeping the rest of the template.
    pub fn narrow_feed(mut self, feed: Feed) -> ProductClass {
        self.feed = feed;
        self
    }

    pub fn matches(&self, info: &ProductInfo) -> bool {
        self.feed.intersects(info.feed)
    }
}
