use std::{
    collections::HashSet,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use bytes::{Bytes, BytesMut};
use serde::{de::Visitor, ser::SerializeMap, Deserialize, Serialize};

use super::Extension;

/// The `ut_pex` payload: peers that joined and peers that left since the
/// previous message, as compact 6-byte (IPv4) and 18-byte (IPv6) records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("serialization infallible")
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }
}

fn parse_ipv4(chunk: &[u8]) -> SocketAddr {
    let addr = u32::from_be_bytes(chunk[..4].try_into().expect("chunk is 6 bytes"));
    let port = u16::from_be_bytes(chunk[4..].try_into().expect("chunk is 6 bytes"));
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(addr), port))
}

fn parse_ipv6(chunk: &[u8]) -> SocketAddr {
    let addr = u128::from_be_bytes(chunk[..16].try_into().expect("chunk is 18 bytes"));
    let port = u16::from_be_bytes(chunk[16..].try_into().expect("chunk is 18 bytes"));
    SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(addr), port, 0, 0))
}

struct PexMessageVisitor;

impl<'v> Visitor<'v> for PexMessageVisitor {
    type Value = PexMessage;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "bencoded map")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'v>,
    {
        let mut added: Option<Bytes> = None;
        let mut added6: Option<Bytes> = None;
        let mut dropped: Option<Bytes> = None;
        let mut dropped6: Option<Bytes> = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_ref() {
                "added" => added = Some(map.next_value()?),
                "added6" => added6 = Some(map.next_value()?),
                "dropped" => dropped = Some(map.next_value()?),
                "dropped6" => dropped6 = Some(map.next_value()?),
                // flag side channels and future keys
                _ => {
                    map.next_value::<serde::de::IgnoredAny>()?;
                }
            };
        }
        if added.is_none() && added6.is_none() && dropped.is_none() && dropped6.is_none() {
            return Err(serde::de::Error::missing_field(
                "one of: added, added6, dropped, dropped6",
            ));
        }

        let mut added_list = Vec::with_capacity(
            added.as_ref().map(|a| a.len() / 6).unwrap_or_default()
                + added6.as_ref().map(|a| a.len() / 18).unwrap_or_default(),
        );
        if let Some(added) = added {
            added.chunks_exact(6).for_each(|c| added_list.push(parse_ipv4(c)));
        }
        if let Some(added6) = added6 {
            added6.chunks_exact(18).for_each(|c| added_list.push(parse_ipv6(c)));
        }

        let mut dropped_list = Vec::with_capacity(
            dropped.as_ref().map(|a| a.len() / 6).unwrap_or_default()
                + dropped6.as_ref().map(|a| a.len() / 18).unwrap_or_default(),
        );
        if let Some(dropped) = dropped {
            dropped.chunks_exact(6).for_each(|c| dropped_list.push(parse_ipv4(c)));
        }
        if let Some(dropped6) = dropped6 {
            dropped6.chunks_exact(18).for_each(|c| dropped_list.push(parse_ipv6(c)));
        }

        Ok(PexMessage {
            added: added_list,
            dropped: dropped_list,
        })
    }
}

impl<'de> Deserialize<'de> for PexMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(PexMessageVisitor)
    }
}

fn push_compact(out: &mut BytesMut, out6: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(addr) => {
            out.extend(addr.ip().octets());
            out.extend(addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            out6.extend(addr.ip().octets());
            out6.extend(addr.port().to_be_bytes());
        }
    }
}

impl Serialize for PexMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut added = BytesMut::new();
        let mut added6 = BytesMut::new();
        let mut dropped = BytesMut::new();
        let mut dropped6 = BytesMut::new();
        for addr in &self.added {
            push_compact(&mut added, &mut added6, addr);
        }
        for addr in &self.dropped {
            push_compact(&mut dropped, &mut dropped6, addr);
        }
        let size_hint: usize = !added.is_empty() as usize
            + !added6.is_empty() as usize
            + !dropped.is_empty() as usize
            + !dropped6.is_empty() as usize;
        let mut map = serializer.serialize_map(Some(size_hint))?;
        if !added.is_empty() {
            map.serialize_entry("added", &added)?;
        }
        if !added6.is_empty() {
            map.serialize_entry("added6", &added6)?;
        }
        if !dropped.is_empty() {
            map.serialize_entry("dropped", &dropped)?;
        }
        if !dropped6.is_empty() {
            map.serialize_entry("dropped6", &dropped6)?;
        }
        map.end()
    }
}

impl From<PexMessage> for bytes::Bytes {
    fn from(value: PexMessage) -> Self {
        value.as_bytes().into()
    }
}

impl TryFrom<&[u8]> for PexMessage {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let pex_message = serde_bencode::from_bytes(value)?;
        Ok(pex_message)
    }
}

impl Extension<'_> for PexMessage {
    const NAME: &'static str = "ut_pex";
    const CLIENT_ID: u8 = 2;
}

/// The addresses included in the previous broadcast. Each tick diffs the
/// connected set against it and ships only the changes.
#[derive(Debug, Default)]
pub struct PexState {
    pub(crate) last_announced: HashSet<SocketAddr>,
}

impl PexState {
    /// Diff `current` against the last broadcast. `None` means nothing
    /// changed and no message should be sent. Afterwards `last_announced`
    /// equals `current`.
    pub fn tick(&mut self, current: &HashSet<SocketAddr>) -> Option<PexMessage> {
        let added: Vec<SocketAddr> = current.difference(&self.last_announced).copied().collect();
        let dropped: Vec<SocketAddr> = self.last_announced.difference(current).copied().collect();
        if added.is_empty() && dropped.is_empty() {
            return None;
        }
        self.last_announced = current.clone();
        Some(PexMessage { added, dropped })
    }
}
