// MQTT ingest: holds the broker session, subscribes to the configured
// topic subtree and feeds each envelope through the codec into the grouper
// channel. The bounded channel applies backpressure through broker flow
// control; protocol-level failures are counted, never fatal.

use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};

use crate::codec::{Codec, Decoded, Observation};
use crate::config::MqttConfig;
use crate::metrics::{Metrics, RuntimeHealth};
use crate::store::Store;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct MqttIngest {
    cfg: MqttConfig,
    codec: Codec,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    health: Arc<RuntimeHealth>,
    grouper_tx: mpsc::Sender<Box<Observation>>,
}

impl MqttIngest {
    pub fn new(
        cfg: MqttConfig,
        codec: Codec,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        health: Arc<RuntimeHealth>,
        grouper_tx: mpsc::Sender<Box<Observation>>,
    ) -> Self {
        Self {
            cfg,
            codec,
            store,
            metrics,
            health,
            grouper_tx,
        }
    }

    fn subscribe_topic(&self) -> String {
        format!("{}/#", self.cfg.root_topic.trim_end_matches('/'))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let client_id = format!("meshcover-{:04x}", rand::random::<u16>());
        let mut options = MqttOptions::new(client_id, self.cfg.host.clone(), self.cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_max_packet_size(256 * 1024, 256 * 1024);
        if let (Some(user), Some(pass)) = (self.cfg.username.clone(), self.cfg.password.clone()) {
            options.set_credentials(user, pass);
        }
        if self.cfg.tls_enabled {
            if self.cfg.tls_insecure {
                // The bundled TLS stack always verifies; the flag is kept
                // for config compatibility.
                warn!("MQTT_TLS_INSECURE set, certificate verification stays enforced");
            }
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let topic = self.subscribe_topic();

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.health.mqtt_connected.store(true, Ordering::Relaxed);
                        info!(topic = %topic, "broker connected, subscribing");
                        if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                            warn!(error = %e, "subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.health.mqtt_connected.store(false, Ordering::Relaxed);
                        warn!(error = %e, "broker connection lost, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        self.health.mqtt_connected.store(false, Ordering::Relaxed);
        let _ = client.disconnect().await;
        info!("mqtt ingest stopped");
    }

    /// One envelope through the codec; the result tag decides the path.
    async fn handle_publish(&self, topic: &str, payload: &Bytes) {
        self.metrics.envelopes_received.fetch_add(1, Ordering::Relaxed);
        match self.codec.decode(payload) {
            Decoded::Text(obs) => {
                if self.grouper_tx.send(obs).await.is_err() {
                    warn!("grouper channel closed, dropping observation");
                }
            }
            Decoded::NodeInfo(ann) => {
                match self
                    .store
                    .register_fingerprint(&ann.envelope_hash, chrono::Utc::now())
                {
                    Ok(true) => {
                        let result = self.store.upsert_node(
                            ann.node_id,
                            Some(ann.long_name.as_str()).filter(|s| !s.is_empty()),
                            Some(ann.short_name.as_str()).filter(|s| !s.is_empty()),
                            Some(ann.mesh_id.as_str()).filter(|s| !s.is_empty()),
                            Some(ann.role),
                            chrono::Utc::now(),
                        );
                        if let Err(e) = result {
                            warn!(node_id = ann.node_id, error = %e, "node announcement upsert failed");
                        }
                    }
                    Ok(false) => {
                        self.metrics.replay_suppressed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!(error = %e, "fingerprint check failed"),
                }
            }
            Decoded::NonText { port, .. } => {
                self.metrics.non_text.fetch_add(1, Ordering::Relaxed);
                debug!(topic, port, "non-text packet counted");
            }
            Decoded::PrivateDrop => {
                self.metrics.private_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(topic, "private packet dropped");
            }
            Decoded::CannotDecrypt => {
                self.metrics.decrypt_failed.fetch_add(1, Ordering::Relaxed);
                debug!(topic, "no key decrypts envelope");
            }
            Decoded::Malformed => {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(topic, "malformed envelope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{apply_ctr, KeyRing};
    use crate::config::DEFAULT_CHANNEL_KEY;
    use crate::proto;
    use prost::Message;

    fn ingest_with_channel() -> (MqttIngest, mpsc::Receiver<Box<Observation>>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(Store::open_in_memory(metrics.clone()).unwrap());
        let codec = Codec::new(KeyRing::new(&[], true).unwrap());
        let health = Arc::new(RuntimeHealth::new());
        let (tx, rx) = mpsc::channel(16);
        let cfg = MqttConfig {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            root_topic: "msh/US/bayarea".into(),
            tls_enabled: false,
            tls_insecure: false,
        };
        (
            MqttIngest::new(cfg, codec, store, metrics.clone(), health, tx),
            rx,
            metrics,
        )
    }

    fn encrypted_text_envelope(packet_id: u32, from: u32, public: bool) -> Vec<u8> {
        let data = proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: b"over the air".to_vec(),
            bitfield: Some(if public { 1 } else { 0 }),
            ..Default::default()
        };
        let mut plain = Vec::new();
        data.encode(&mut plain).unwrap();
        apply_ctr(&DEFAULT_CHANNEL_KEY, packet_id, from, &mut plain);
        let env = proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                from,
                to: proto::BROADCAST_ADDR,
                id: packet_id,
                payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(plain)),
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: "!aabbccdd".into(),
        };
        let mut buf = Vec::new();
        env.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn topic_gets_wildcard_suffix() {
        let (ingest, _, _) = ingest_with_channel();
        assert_eq!(ingest.subscribe_topic(), "msh/US/bayarea/#");
    }

    #[tokio::test]
    async fn text_envelope_reaches_the_grouper() {
        let (ingest, mut rx, metrics) = ingest_with_channel();
        let body = encrypted_text_envelope(7001, 0xa1, true);
        ingest.handle_publish("msh/US/bayarea/2/e/LongFast/!aabbccdd", &Bytes::from(body)).await;
        let obs = rx.try_recv().expect("observation forwarded");
        assert_eq!(obs.packet_id, 7001);
        assert_eq!(obs.sender, 0xa1);
        assert_eq!(metrics.envelopes_received.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn private_envelope_is_counted_and_dropped() {
        let (ingest, mut rx, metrics) = ingest_with_channel();
        let body = encrypted_text_envelope(7002, 0xb2, false);
        ingest.handle_publish("msh/US/bayarea/2/e/LongFast/!aabbccdd", &Bytes::from(body)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.private_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn garbage_is_counted_malformed() {
        let (ingest, mut rx, metrics) = ingest_with_channel();
        ingest.handle_publish("msh/US/bayarea/junk", &Bytes::from_static(&[1, 2, 3])).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.malformed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn nodeinfo_updates_the_node_table() {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(Store::open_in_memory(metrics.clone()).unwrap());
        let codec = Codec::new(KeyRing::new(&[], true).unwrap());
        let health = Arc::new(RuntimeHealth::new());
        let (tx, _rx) = mpsc::channel(16);
        let cfg = MqttConfig {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            root_topic: "msh".into(),
            tls_enabled: false,
            tls_insecure: false,
        };
        let ingest = MqttIngest::new(cfg, codec, store.clone(), metrics.clone(), health, tx);

        let user = proto::User {
            id: "!000000c3".into(),
            long_name: "Water Tower".into(),
            short_name: "WTWR".into(),
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
        let mut plain = Vec::new();
        data.encode(&mut plain).unwrap();
        apply_ctr(&DEFAULT_CHANNEL_KEY, 7003, 0xc3, &mut plain);
        let env = proto::ServiceEnvelope {
            packet: Some(proto::MeshPacket {
                from: 0xc3,
                id: 7003,
                payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(plain)),
                ..Default::default()
            }),
            channel_id: String::new(),
            gateway_id: "!00000099".into(),
        };
        let mut body = Vec::new();
        env.encode(&mut body).unwrap();

        ingest.handle_publish("msh/2/e/x/!00000099", &Bytes::from(body.clone())).await;
        let node = store.node(0xc3).unwrap().expect("node row created");
        assert_eq!(node.long_name.as_deref(), Some("Water Tower"));
        assert_eq!(node.role.as_deref(), Some("router"));

        // Same envelope again is a replay.
        ingest.handle_publish("msh/2/e/x/!00000099", &Bytes::from(body)).await;
        assert_eq!(metrics.replay_suppressed.load(Ordering::Relaxed), 1);
    }
}
