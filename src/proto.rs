// Wire types for the mesh protocol, hand-declared with prost derives.
// Only the subset this server reads or writes is declared; unknown fields
// are skipped by prost on decode.

/// Application port carried inside a decoded payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    WaypointApp = 8,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
}

/// Bit 0 of `Data.bitfield`: the sender consents to public re-publication.
pub const BITFIELD_OK_TO_PUBLISH: u32 = 1;

/// Outer MQTT message body: one relayed packet plus the relaying gateway.
#[derive(Clone, prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(sint32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

/// Inner payload once the envelope is decrypted.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
    #[prost(uint32, optional, tag = "9")]
    pub bitfield: Option<u32>,
}

/// NODEINFO payload: the sender describing itself.
#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

// --- Direct radio link (TCP stream framing) -------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(uint32, tag = "9")]
    pub hops_away: u32,
}

/// Host → radio frame.
#[derive(Clone, prost::Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {}

/// Radio → host frame.
#[derive(Clone, prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 7")]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
    }
}

/// Broadcast destination node id.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Maps a `User.role` to the label stored with the node.
pub fn role_label(role: i32) -> &'static str {
    match role {
        0 => "client",
        1 => "client_mute",
        2 => "router",
        3 => "router_client",
        4 => "repeater",
        5 => "tracker",
        6 => "sensor",
        7 => "tak",
        8 => "client_hidden",
        9 => "lost_and_found",
        10 => "tak_tracker",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn envelope_roundtrip_keeps_gateway() {
        let env = ServiceEnvelope {
            packet: Some(MeshPacket {
                from: 0xa1,
                to: BROADCAST_ADDR,
                id: 7001,
                payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(vec![1, 2, 3])),
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: "!aabbccdd".into(),
        };
        let mut buf = Vec::with_capacity(env.encoded_len());
        env.encode(&mut buf).unwrap();
        let back = ServiceEnvelope::decode(buf.as_slice()).unwrap();
        assert_eq!(back.gateway_id, "!aabbccdd");
        assert_eq!(back.packet.unwrap().id, 7001);
    }

    #[test]
    fn data_bitfield_survives_roundtrip() {
        let d = Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: b"hello mesh".to_vec(),
            bitfield: Some(BITFIELD_OK_TO_PUBLISH),
            ..Default::default()
        };
        let mut buf = Vec::new();
        d.encode(&mut buf).unwrap();
        let back = Data::decode(buf.as_slice()).unwrap();
        assert_eq!(back.bitfield, Some(1));
        assert_eq!(back.portnum, 1);
    }

    #[test]
    fn role_labels_cover_known_roles() {
        assert_eq!(role_label(2), "router");
        assert_eq!(role_label(99), "unknown");
    }
}
