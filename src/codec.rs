// Envelope codec: hashes the raw MQTT body, walks the key ring until the
// inner payload parses, canonicalises the gateway id and applies the
// publish-consent gate. Everything downstream pattern-matches on `Decoded`
// instead of poking at optional fields.

use aes::cipher::{KeyIvInit, StreamCipher};
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use sha2::{Digest, Sha256};

use crate::config::DEFAULT_CHANNEL_KEY;
use crate::proto;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum KeyRingError {
    #[error("key {index} has length {len}, expected 16 or 32 bytes")]
    BadLength { index: usize, len: usize },
    #[error("key ring is empty and the default key is excluded")]
    Empty,
}

/// Ordered decryption keys. Tried front to back until the plaintext parses.
#[derive(Clone)]
pub struct KeyRing {
    keys: Vec<Vec<u8>>,
}

impl KeyRing {
    pub fn new(configured: &[Vec<u8>], include_default: bool) -> Result<Self, KeyRingError> {
        let mut keys = Vec::with_capacity(configured.len() + 1);
        for (index, k) in configured.iter().enumerate() {
            if k.len() != 16 && k.len() != 32 {
                return Err(KeyRingError::BadLength {
                    index,
                    len: k.len(),
                });
            }
            keys.push(k.clone());
        }
        if include_default {
            keys.push(DEFAULT_CHANNEL_KEY.to_vec());
        }
        if keys.is_empty() {
            return Err(KeyRingError::Empty);
        }
        Ok(Self { keys })
    }

    fn try_decrypt(&self, packet_id: u32, from: u32, ciphertext: &[u8]) -> Option<proto::Data> {
        for key in &self.keys {
            let mut buf = ciphertext.to_vec();
            apply_ctr(key, packet_id, from, &mut buf);
            if let Ok(data) = proto::Data::decode(buf.as_slice()) {
                // Garbage occasionally survives a protobuf parse; a real
                // payload always carries a known-positive port.
                if data.portnum > 0 && data.portnum < 512 {
                    return Some(data);
                }
            }
        }
        None
    }
}

/// CTR keystream application. The nonce is the packet id zero-extended to
/// 64 bits, then the sender id, both little-endian, then four zero bytes.
pub(crate) fn apply_ctr(key: &[u8], packet_id: u32, from: u32, buf: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    iv[8..12].copy_from_slice(&from.to_le_bytes());
    if key.len() == 16 {
        let mut c = Aes128Ctr::new(key.into(), &iv.into());
        c.apply_keystream(buf);
    } else {
        let mut c = Aes256Ctr::new(key.into(), &iv.into());
        c.apply_keystream(buf);
    }
}

/// One text packet as observed through a single gateway.
#[derive(Debug, Clone)]
pub struct Observation {
    pub envelope_hash: [u8; 32],
    pub packet_id: u32,
    pub sender: u32,
    pub gateway_id: String,
    pub channel_id: String,
    pub sent_at: DateTime<Utc>,
    pub payload: String,
    pub rx_rssi: Option<i32>,
    pub rx_snr: Option<f32>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
}

impl Observation {
    /// Hops travelled, when the packet carries both hop fields.
    pub fn hops_away(&self) -> Option<u32> {
        match (self.hop_start, self.hop_limit) {
            (Some(start), Some(limit)) => Some(start.saturating_sub(limit)),
            _ => None,
        }
    }
}

/// Sender self-description seen on the node-info port. Touches `nodes`
/// only, never `packets`.
#[derive(Debug, Clone)]
pub struct NodeAnnouncement {
    pub envelope_hash: [u8; 32],
    pub node_id: u32,
    pub mesh_id: String,
    pub long_name: String,
    pub short_name: String,
    pub role: &'static str,
}

/// Outcome of decoding one MQTT message body.
#[derive(Debug)]
pub enum Decoded {
    Text(Box<Observation>),
    NodeInfo(Box<NodeAnnouncement>),
    NonText { port: i32, envelope_hash: [u8; 32] },
    PrivateDrop,
    CannotDecrypt,
    Malformed,
}

pub struct Codec {
    ring: KeyRing,
}

impl Codec {
    pub fn new(ring: KeyRing) -> Self {
        Self { ring }
    }

    pub fn decode(&self, body: &[u8]) -> Decoded {
        let envelope_hash: [u8; 32] = Sha256::digest(body).into();

        let envelope = match proto::ServiceEnvelope::decode(body) {
            Ok(e) => e,
            Err(_) => return Decoded::Malformed,
        };
        let Some(packet) = envelope.packet else {
            return Decoded::Malformed;
        };
        let Some(gateway_id) = canonical_gateway_id(&envelope.gateway_id) else {
            return Decoded::Malformed;
        };

        let data = match packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(d)) => d,
            Some(proto::mesh_packet::PayloadVariant::Encrypted(ref ct)) => {
                match self.ring.try_decrypt(packet.id, packet.from, ct) {
                    Some(d) => d,
                    None => return Decoded::CannotDecrypt,
                }
            }
            None => return Decoded::Malformed,
        };

        // Publish-consent gate. A bit that is present and cleared means the
        // sender opted out; firmware that predates the bit never sets it.
        if let Some(bits) = data.bitfield {
            if bits & proto::BITFIELD_OK_TO_PUBLISH == 0 {
                return Decoded::PrivateDrop;
            }
        }

        match data.portnum {
            p if p == proto::PortNum::TextMessageApp as i32 => {
                let sent_at = if packet.rx_time > 0 {
                    Utc.timestamp_opt(packet.rx_time as i64, 0)
                        .single()
                        .unwrap_or_else(Utc::now)
                } else {
                    Utc::now()
                };
                Decoded::Text(Box::new(Observation {
                    envelope_hash,
                    packet_id: packet.id,
                    sender: packet.from,
                    gateway_id,
                    channel_id: envelope.channel_id,
                    sent_at,
                    payload: String::from_utf8_lossy(&data.payload).into_owned(),
                    rx_rssi: (packet.rx_rssi != 0).then_some(packet.rx_rssi),
                    rx_snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr),
                    hop_start: (packet.hop_start > 0).then_some(packet.hop_start),
                    hop_limit: (packet.hop_start > 0).then_some(packet.hop_limit),
                }))
            }
            p if p == proto::PortNum::NodeinfoApp as i32 => {
                match proto::User::decode(data.payload.as_slice()) {
                    Ok(user) => Decoded::NodeInfo(Box::new(NodeAnnouncement {
                        envelope_hash,
                        node_id: packet.from,
                        mesh_id: user.id,
                        long_name: user.long_name,
                        short_name: user.short_name,
                        role: proto::role_label(user.role),
                    })),
                    Err(_) => Decoded::Malformed,
                }
            }
            port => Decoded::NonText {
                port,
                envelope_hash,
            },
        }
    }
}

/// Canonical gateway id: `!` followed by exactly 8 lowercase hex digits.
/// Accepts the bare hex form and short ids, which are zero-padded.
pub fn canonical_gateway_id(raw: &str) -> Option<String> {
    let hex_part = raw.strip_prefix('!').unwrap_or(raw);
    if hex_part.is_empty()
        || hex_part.len() > 8
        || !hex_part.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }
    Some(format!("!{:0>8}", hex_part.to_ascii_lowercase()))
}

/// Node id rendered in the same canonical form as gateway ids.
pub fn canonical_node_id(node_id: u32) -> String {
    format!("!{node_id:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(key: &[u8], packet_id: u32, from: u32, data: &proto::Data) -> Vec<u8> {
        let mut buf = Vec::with_capacity(data.encoded_len());
        data.encode(&mut buf).unwrap();
        apply_ctr(key, packet_id, from, &mut buf);
        buf
    }

    fn text_envelope(key: &[u8], packet_id: u32, from: u32, gateway: &str, text: &str) -> Vec<u8> {
        let data = proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            bitfield: Some(proto::BITFIELD_OK_TO_PUBLISH),
            ..Default::default()
        };
        let env = proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                from,
                to: proto::BROADCAST_ADDR,
                id: packet_id,
                rx_time: 1_722_000_000,
                rx_snr: 6.25,
                rx_rssi: -88,
                hop_start: 3,
                hop_limit: 1,
                payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(encrypt(
                    key, packet_id, from, &data,
                ))),
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: gateway.into(),
        };
        let mut buf = Vec::with_capacity(env.encoded_len());
        env.encode(&mut buf).unwrap();
        buf
    }

    fn default_codec() -> Codec {
        Codec::new(KeyRing::new(&[], true).unwrap())
    }

    #[test]
    fn decrypts_with_default_key() {
        let body = text_envelope(&DEFAULT_CHANNEL_KEY, 7001, 0xa1, "!aabbccdd", "hello");
        match default_codec().decode(&body) {
            Decoded::Text(obs) => {
                assert_eq!(obs.packet_id, 7001);
                assert_eq!(obs.sender, 0xa1);
                assert_eq!(obs.gateway_id, "!aabbccdd");
                assert_eq!(obs.payload, "hello");
                assert_eq!(obs.rx_rssi, Some(-88));
                assert_eq!(obs.hops_away(), Some(2));
            }
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn wrong_key_yields_cannot_decrypt() {
        let other_key = [0x5a; 16];
        let body = text_envelope(&other_key, 7002, 0xb2, "!11111111", "secret");
        assert!(matches!(default_codec().decode(&body), Decoded::CannotDecrypt));
    }

    #[test]
    fn key_ring_order_is_respected() {
        let custom = vec![vec![0x5a; 16]];
        let codec = Codec::new(KeyRing::new(&custom, true).unwrap());
        let body = text_envelope(&[0x5a; 16], 7003, 0xc3, "!22222222", "ring");
        assert!(matches!(codec.decode(&body), Decoded::Text(_)));
    }

    #[test]
    fn aes256_keys_are_supported() {
        let key = vec![0x11u8; 32];
        let codec = Codec::new(KeyRing::new(&[key.clone()], false).unwrap());
        let body = text_envelope(&key, 7004, 0xd4, "!33333333", "long key");
        assert!(matches!(codec.decode(&body), Decoded::Text(_)));
    }

    #[test]
    fn cleared_consent_bit_is_dropped() {
        let data = proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: b"keep me off the internet".to_vec(),
            bitfield: Some(0),
            ..Default::default()
        };
        let env = proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                from: 0xe5,
                id: 7005,
                payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(encrypt(
                    &DEFAULT_CHANNEL_KEY,
                    7005,
                    0xe5,
                    &data,
                ))),
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: "!44444444".into(),
        };
        let mut buf = Vec::new();
        env.encode(&mut buf).unwrap();
        assert!(matches!(default_codec().decode(&buf), Decoded::PrivateDrop));
    }

    #[test]
    fn missing_bitfield_is_treated_as_public() {
        let data = proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: b"old firmware".to_vec(),
            bitfield: None,
            ..Default::default()
        };
        let env = proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                from: 0xf6,
                id: 7006,
                payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(encrypt(
                    &DEFAULT_CHANNEL_KEY,
                    7006,
                    0xf6,
                    &data,
                ))),
                ..Default::default()
            }),
            gateway_id: "!55555555".into(),
            channel_id: String::new(),
        };
        let mut buf = Vec::new();
        env.encode(&mut buf).unwrap();
        assert!(matches!(default_codec().decode(&buf), Decoded::Text(_)));
    }

    #[test]
    fn non_text_ports_are_counted_not_stored() {
        let data = proto::Data {
            portnum: proto::PortNum::TelemetryApp as i32,
            payload: vec![1, 2, 3],
            ..Default::default()
        };
        let env = proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                from: 0x17,
                id: 7007,
                payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(encrypt(
                    &DEFAULT_CHANNEL_KEY,
                    7007,
                    0x17,
                    &data,
                ))),
                ..Default::default()
            }),
            gateway_id: "!66666666".into(),
            channel_id: String::new(),
        };
        let mut buf = Vec::new();
        env.encode(&mut buf).unwrap();
        match default_codec().decode(&buf) {
            Decoded::NonText { port, .. } => assert_eq!(port, 67),
            other => panic!("expected NonText, got {other:?}"),
        }
    }

    #[test]
    fn nodeinfo_updates_are_surfaced() {
        let user = proto::User {
            id: "!000000a1".into(),
            long_name: "Relay on the hill".into(),
            short_name: "HILL".into(),
            role: 2,
            ..Default::default()
        };
        let mut user_buf = Vec::new();
        user.encode(&mut user_buf).unwrap();
        let data = proto::Data {
            portnum: proto::PortNum::NodeinfoApp as i32,
            payload: user_buf,
            ..Default::default()
        };
        let env = proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                from: 0xa1,
                id: 7008,
                payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(encrypt(
                    &DEFAULT_CHANNEL_KEY,
                    7008,
                    0xa1,
                    &data,
                ))),
                ..Default::default()
            }),
            gateway_id: "!77777777".into(),
            channel_id: String::new(),
        };
        let mut buf = Vec::new();
        env.encode(&mut buf).unwrap();
        match default_codec().decode(&buf) {
            Decoded::NodeInfo(info) => {
                assert_eq!(info.node_id, 0xa1);
                assert_eq!(info.long_name, "Relay on the hill");
                assert_eq!(info.role, "router");
            }
            other => panic!("expected NodeInfo, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            default_codec().decode(&[0xff, 0x00, 0x13, 0x37]),
            Decoded::Malformed
        ));
    }

    #[test]
    fn envelope_hash_is_stable_and_content_addressed() {
        let body = text_envelope(&DEFAULT_CHANNEL_KEY, 7009, 0xa2, "!88888888", "same");
        let codec = default_codec();
        let (Decoded::Text(a), Decoded::Text(b)) = (codec.decode(&body), codec.decode(&body))
        else {
            panic!("expected Text twice");
        };
        assert_eq!(a.envelope_hash, b.envelope_hash);
    }

    #[test]
    fn gateway_ids_are_canonicalised() {
        assert_eq!(canonical_gateway_id("!AABBCCDD").unwrap(), "!aabbccdd");
        assert_eq!(canonical_gateway_id("aabbccdd").unwrap(), "!aabbccdd");
        assert_eq!(canonical_gateway_id("!11").unwrap(), "!00000011");
        assert_eq!(canonical_gateway_id("ff").unwrap(), "!000000ff");
        assert!(canonical_gateway_id("").is_none());
        assert!(canonical_gateway_id("!gggggggg").is_none());
        assert!(canonical_gateway_id("!123456789").is_none());
    }

    #[test]
    fn node_id_renders_like_gateway_ids() {
        assert_eq!(canonical_node_id(0xa1), "!000000a1");
        assert_eq!(canonical_node_id(0xdeadbeef), "!deadbeef");
    }
}
