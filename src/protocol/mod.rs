use std::{collections::HashMap, net::IpAddr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;

use crate::CLIENT_NAME;

/// Peer Exchange (PEX) BEP 11
///
/// Provides an alternative peer discovery mechanism for swarms once peers
/// have bootstrapped via other mechanisms such as DHT or tracker announces.
pub mod pex;

/// A BEP 10 extended-protocol message type. Each side picks the numeric id
/// it wants incoming messages of this type to carry and announces it in the
/// `m` table of its handshake; `CLIENT_ID` is the id we claim for ourselves,
/// while outgoing sends look up whatever the remote claimed.
pub trait Extension<'a>: Into<bytes::Bytes> + TryFrom<&'a [u8]> {
    const NAME: &'static str;
    const CLIENT_ID: u8;
}

pub const CLIENT_EXTENSIONS: [(&str, u8); 1] = [(pex::PexMessage::NAME, pex::PexMessage::CLIENT_ID)];

/// The BEP 10 extended handshake: the `m` table of supported extensions,
/// plus whatever other keys the remote tucked in next to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionHandshake {
    #[serde(rename = "m")]
    pub messages: HashMap<String, u8>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn compact_ip(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => Vec::from(v4.octets()),
        IpAddr::V6(v6) => Vec::from(v6.octets()),
    }
}

fn ip_from_compact(raw: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(raw) {
        return Some(IpAddr::from(v4));
    }
    <[u8; 16]>::try_from(raw).ok().map(IpAddr::from)
}

impl ExtensionHandshake {
    pub fn from_bytes(bytes: &[u8]) -> serde_bencode::Result<Self> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> Bytes {
        serde_bencode::to_bytes(self)
            .expect("serialization infallible")
            .into()
    }

    /// The handshake we advertise to remotes.
    pub fn ours() -> Self {
        let messages = CLIENT_EXTENSIONS
            .iter()
            .map(|(name, id)| (name.to_string(), *id))
            .collect();
        let mut extra = HashMap::new();
        extra.insert(
            "reqq".to_string(),
            Value::Int(crate::PEER_CHANNEL_CAPACITY as i64),
        );
        extra.insert(
            "v".to_string(),
            Value::Bytes(CLIENT_NAME.as_bytes().to_vec()),
        );
        Self { messages, extra }
    }

    /// Id the remote chose for `ut_pex` messages, when it advertised the
    /// extension at all.
    pub fn pex_id(&self) -> Option<u8> {
        self.messages.get(pex::PexMessage::NAME).copied()
    }

    /// Our external address from the remote's point of view: `yourip`
    /// carries 4 or 16 raw address bytes, never a port.
    pub fn your_ip(&self) -> Option<IpAddr> {
        let Value::Bytes(raw) = self.extra.get("yourip")? else {
            return None;
        };
        ip_from_compact(raw)
    }

    /// Record the address we see the remote under, for its `yourip`.
    pub fn set_your_ip(&mut self, addr: IpAddr) {
        self.extra
            .insert("yourip".to_string(), Value::Bytes(compact_ip(addr)));
    }

    /// The `reqq` field: how deep the remote lets its incoming request
    /// queue grow before it starts dropping.
    pub fn request_queue_size(&self) -> Option<i64> {
        let Value::Int(size) = self.extra.get("reqq")? else {
            return None;
        };
        Some(*size)
    }

    /// The remote's self-reported client string (its `v` field).
    pub fn client_name(&self) -> Option<&str> {
        let Value::Bytes(bytes) = self.extra.get("v")? else {
            return None;
        };
        std::str::from_utf8(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::{Extension, ExtensionHandshake};

    #[test]
    fn reencode_extension_handshake() {
        let mut handshake = ExtensionHandshake::ours();
        handshake.set_your_ip(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        let bytes = handshake.as_bytes();
        let decoded = ExtensionHandshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.pex_id(), Some(super::pex::PexMessage::CLIENT_ID));
        assert_eq!(
            decoded.your_ip(),
            Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        );
        assert_eq!(decoded.client_name(), Some(crate::CLIENT_NAME));
        assert_eq!(
            decoded.request_queue_size(),
            Some(crate::PEER_CHANNEL_CAPACITY as i64)
        );
    }

    #[test]
    fn your_ip_handles_both_families() {
        let mut handshake = ExtensionHandshake::ours();
        assert_eq!(handshake.your_ip(), None);
        let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        handshake.set_your_ip(v6);
        assert_eq!(handshake.your_ip(), Some(v6));
    }
}
