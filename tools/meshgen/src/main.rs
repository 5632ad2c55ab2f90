// Meshgen: fabricates encrypted service envelopes the way gateways publish
// them and pushes them to a broker at a configurable rate. Each logical
// packet fans out through several simulated gateways so the server's
// grouping path gets realistic traffic.

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::Engine;
use clap::Parser;
use prost::Message;
use rand::Rng;
use rumqttc::{Client, MqttOptions, QoS};
use std::time::{Duration, Instant};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const DEFAULT_KEY_B64: &str = "1PG7OiApB1nwvP+rz05pAQ==";

// Proto types matching the server.
pub mod proto {
    #[derive(Clone, prost::Message)]
    pub struct ServiceEnvelope {
        #[prost(message, optional, tag = "1")]
        pub packet: Option<MeshPacket>,
        #[prost(string, tag = "2")]
        pub channel_id: String,
        #[prost(string, tag = "3")]
        pub gateway_id: String,
    }

    #[derive(Clone, prost::Message)]
    pub struct MeshPacket {
        #[prost(fixed32, tag = "1")]
        pub from: u32,
        #[prost(fixed32, tag = "2")]
        pub to: u32,
        #[prost(uint32, tag = "3")]
        pub channel: u32,
        #[prost(bytes, tag = "5")]
        pub encrypted: Vec<u8>,
        #[prost(fixed32, tag = "6")]
        pub id: u32,
        #[prost(fixed32, tag = "7")]
        pub rx_time: u32,
        #[prost(float, tag = "8")]
        pub rx_snr: f32,
        #[prost(uint32, tag = "9")]
        pub hop_limit: u32,
        #[prost(sint32, tag = "12")]
        pub rx_rssi: i32,
        #[prost(bool, tag = "14")]
        pub via_mqtt: bool,
        #[prost(uint32, tag = "15")]
        pub hop_start: u32,
    }

    #[derive(Clone, prost::Message)]
    pub struct Data {
        #[prost(int32, tag = "1")]
        pub portnum: i32,
        #[prost(bytes, tag = "2")]
        pub payload: Vec<u8>,
        #[prost(uint32, optional, tag = "9")]
        pub bitfield: Option<u32>,
    }
}

#[derive(Parser)]
#[command(name = "meshgen")]
#[command(about = "Synthetic envelope generator for the Meshcover ingest server")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Root topic (envelopes go to ROOT/2/e/CHANNEL/GATEWAY)
    #[arg(long, default_value = "msh")]
    topic: String,

    /// Channel name used in the topic and envelope
    #[arg(long, default_value = "LongFast")]
    channel: String,

    /// Logical packets per second
    #[arg(long, default_value_t = 10)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct sender nodes
    #[arg(long, default_value_t = 8)]
    senders: usize,

    /// Maximum gateways relaying each packet
    #[arg(long, default_value_t = 4)]
    gateways: usize,

    /// Base64 channel key (16 or 32 bytes)
    #[arg(long, default_value = DEFAULT_KEY_B64)]
    key: String,

    /// Fraction of packets sent with the consent bit cleared
    #[arg(long, default_value_t = 0.05)]
    private_ratio: f64,
}

fn encrypt(key: &[u8], packet_id: u32, from: u32, plain: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    iv[8..12].copy_from_slice(&from.to_le_bytes());
    let mut buf = plain.to_vec();
    if key.len() == 16 {
        Aes128Ctr::new(key.into(), &iv.into()).apply_keystream(&mut buf);
    } else {
        Aes256Ctr::new(key.into(), &iv.into()).apply_keystream(&mut buf);
    }
    buf
}

fn build_envelope(
    key: &[u8],
    packet_id: u32,
    from: u32,
    gateway: &str,
    channel: &str,
    text: &str,
    public: bool,
    rng: &mut impl Rng,
) -> Vec<u8> {
    let data = proto::Data {
        portnum: 1, // text message
        payload: text.as_bytes().to_vec(),
        bitfield: Some(if public { 1 } else { 0 }),
    };
    let mut plain = Vec::with_capacity(data.encoded_len());
    data.encode(&mut plain).expect("vec encode");

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs() as u32;

    let env = proto::ServiceEnvelope {
        packet: Some(proto::MeshPacket {
            from,
            to: 0xffff_ffff,
            channel: 0,
            encrypted: encrypt(key, packet_id, from, &plain),
            id: packet_id,
            rx_time: now,
            rx_snr: rng.gen_range(-10.0..12.0),
            hop_limit: rng.gen_range(0..3),
            rx_rssi: rng.gen_range(-130..-60),
            via_mqtt: false,
            hop_start: 3,
        }),
        channel_id: channel.to_string(),
        gateway_id: gateway.to_string(),
    };
    let mut buf = Vec::with_capacity(env.encoded_len());
    env.encode(&mut buf).expect("vec encode");
    buf
}

const PHRASES: &[&str] = &[
    "anyone on the ridge tonight?",
    "solar repeater back up",
    "testing from the east bay",
    "good copy, 3 hops",
    "net check-in",
    "heading to the summit",
];

fn main() {
    let args = Args::parse();

    let key = base64::engine::general_purpose::STANDARD
        .decode(&args.key)
        .unwrap_or_else(|e| {
            eprintln!("bad --key base64: {e}");
            std::process::exit(1);
        });
    if key.len() != 16 && key.len() != 32 {
        eprintln!("--key must decode to 16 or 32 bytes, got {}", key.len());
        std::process::exit(1);
    }

    println!("=== Meshgen ===");
    println!("Broker:   {}:{}", args.host, args.port);
    println!("Topic:    {}/2/e/{}/<gateway>", args.topic, args.channel);
    println!("Rate:     {} pkt/s x {}s", args.rate, args.duration);
    println!("Senders:  {}  Gateways: up to {}", args.senders, args.gateways);
    println!();

    let mut options = MqttOptions::new("meshgen", &args.host, args.port);
    options.set_keep_alive(Duration::from_secs(15));
    let (client, mut connection) = Client::new(options, 64);

    // Drive the event loop on a background thread; publishes happen here.
    std::thread::spawn(move || {
        for event in connection.iter() {
            if let Err(e) = event {
                eprintln!("connection error: {e}");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    });

    let mut rng = rand::thread_rng();
    let senders: Vec<u32> = (0..args.senders).map(|_| rng.gen()).collect();
    let gateway_pool: Vec<String> = (0..args.gateways.max(1) * 2)
        .map(|_| format!("!{:08x}", rng.gen::<u32>()))
        .collect();

    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let start = Instant::now();
    let mut packets = 0u64;
    let mut envelopes = 0u64;
    let mut publish_errors = 0u64;

    while Instant::now() < deadline {
        let packet_id: u32 = rng.gen();
        let from = senders[rng.gen_range(0..senders.len())];
        let text = PHRASES[rng.gen_range(0..PHRASES.len())];
        let public = rng.gen_bool(1.0 - args.private_ratio);
        let fanout = rng.gen_range(1..=args.gateways.max(1));

        for gw_index in 0..fanout {
            let gateway = &gateway_pool[(packets as usize + gw_index) % gateway_pool.len()];
            let body = build_envelope(
                &key, packet_id, from, gateway, &args.channel, text, public, &mut rng,
            );
            let topic = format!("{}/2/e/{}/{}", args.topic, args.channel, gateway);
            match client.publish(topic, QoS::AtMostOnce, false, body) {
                Ok(()) => envelopes += 1,
                Err(_) => publish_errors += 1,
            }
        }
        packets += 1;

        if packets % 100 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            println!(
                "  [{:.1}s] packets={} envelopes={} errors={} ({:.0} pkt/s)",
                elapsed,
                packets,
                envelopes,
                publish_errors,
                packets as f64 / elapsed,
            );
        }

        let target = interval * packets as u32;
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    println!("\n=== Results ===");
    println!("Duration:   {:.2}s", elapsed.as_secs_f64());
    println!("Packets:    {packets}");
    println!("Envelopes:  {envelopes}");
    println!("Errors:     {publish_errors}");
    println!(
        "Throughput: {:.1} pkt/s ({:.1} env/s)",
        packets as f64 / elapsed.as_secs_f64(),
        envelopes as f64 / elapsed.as_secs_f64(),
    );
}
