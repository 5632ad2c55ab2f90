// Bounded-time grouping of per-gateway relays into one record per mesh
// packet. A single worker task owns the in-flight map, so arrivals for the
// same key serialise through its channel; the packet_id UNIQUE constraint
// in the store backs that up.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::codec::Observation;
use crate::config::GrouperConfig;
use crate::metrics::Metrics;
use crate::store::{
    GatewayObservation, GroupedPacket, ReconcileOutcome, Store, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    packet_id: u32,
    sender: u32,
}

struct Group {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    /// The packet as parsed from the first observation; later relays only
    /// contribute their gateway id.
    canonical: Observation,
    gateways: Vec<GatewayObservation>,
    fingerprints: Vec<[u8; 32]>,
}

impl Group {
    fn has_gateway(&self, gateway_id: &str) -> bool {
        self.gateways.iter().any(|g| g.gateway_id == gateway_id)
    }
}

pub struct PacketGrouper {
    cfg: GrouperConfig,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    groups: HashMap<GroupKey, Group>,
}

impl PacketGrouper {
    pub fn new(cfg: GrouperConfig, store: Arc<Store>, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            store,
            metrics,
            groups: HashMap::new(),
        }
    }

    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    /// Handles one decoded text observation. The envelope fingerprint is
    /// registered atomically first; a hit means replay and nothing else
    /// happens, including the group's last-seen time.
    pub fn observe(&mut self, obs: Observation, now: DateTime<Utc>) {
        match self.store.register_fingerprint(&obs.envelope_hash, now) {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.replay_suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    packet_id = obs.packet_id,
                    hash = %hex::encode(&obs.envelope_hash[..8]),
                    "replay_suppressed"
                );
                return;
            }
            Err(e) => {
                warn!(error = %e, "fingerprint_check_failed, dropping envelope");
                return;
            }
        }

        let key = GroupKey {
            packet_id: obs.packet_id,
            sender: obs.sender,
        };

        if let Some(group) = self.groups.get_mut(&key) {
            group.last_seen = now;
            group.fingerprints.push(obs.envelope_hash);
            if !group.has_gateway(&obs.gateway_id) {
                group.gateways.push(GatewayObservation {
                    gateway_id: obs.gateway_id,
                    observed_at: now,
                });
            }
            return;
        }

        // Key not in flight: either a late arrival for a persisted packet
        // or the first relay of a new one.
        match self.store.reconcile_late_relay(
            obs.packet_id,
            obs.sender,
            &obs.gateway_id,
            now,
            self.cfg.late_retention,
        ) {
            Ok(ReconcileOutcome::Added { new_count }) => {
                self.metrics.late_reconciled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    packet_id = obs.packet_id,
                    gateway = %obs.gateway_id,
                    new_count,
                    "late_relay_reconciled"
                );
            }
            Ok(ReconcileOutcome::Duplicate) => {
                debug!(packet_id = obs.packet_id, gateway = %obs.gateway_id, "late_relay_duplicate");
            }
            Ok(ReconcileOutcome::Expired) => {
                self.metrics
                    .late_beyond_retention
                    .fetch_add(1, Ordering::Relaxed);
                info!(packet_id = obs.packet_id, "late_beyond_retention");
            }
            Ok(ReconcileOutcome::NotFound) => {
                let gateway = GatewayObservation {
                    gateway_id: obs.gateway_id.clone(),
                    observed_at: now,
                };
                self.groups.insert(
                    key,
                    Group {
                        first_seen: now,
                        last_seen: now,
                        fingerprints: vec![obs.envelope_hash],
                        gateways: vec![gateway],
                        canonical: obs,
                    },
                );
                self.metrics.group_open.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(packet_id = obs.packet_id, error = %e, "late_reconcile_failed");
            }
        }
    }

    /// Closes every group past its close predicate: the window has elapsed
    /// and no arrival landed within the quiescence interval.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.cfg.window).unwrap_or(chrono::Duration::MAX);
        let quiet =
            chrono::Duration::from_std(self.cfg.quiescence).unwrap_or(chrono::Duration::zero());
        let mut due: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|(_, g)| {
                now.signed_duration_since(g.first_seen) >= window
                    && now.signed_duration_since(g.last_seen) >= quiet
            })
            .map(|(k, _)| *k)
            .collect();
        due.sort_by_key(|k| self.groups[k].first_seen);
        for key in due {
            if let Some(group) = self.groups.remove(&key) {
                if let Err(e) = self.close_group(group, now) {
                    warn!(packet_id = key.packet_id, error = %e, "group_close_failed");
                }
            }
        }
    }

    /// Closes everything immediately, window or not. Used at shutdown.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut keys: Vec<GroupKey> = self.groups.keys().copied().collect();
        keys.sort_by_key(|k| self.groups[k].first_seen);
        let mut first_error = None;
        for key in keys {
            if let Some(group) = self.groups.remove(&key) {
                if let Err(e) = self.close_group(group, now) {
                    error!(packet_id = key.packet_id, error = %e, "flush_close_failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close_group(&self, group: Group, now: DateTime<Utc>) -> Result<(), StoreError> {
        let obs = &group.canonical;
        let grouped = GroupedPacket {
            packet_id: obs.packet_id,
            sender: obs.sender,
            sent_at: obs.sent_at,
            payload: obs.payload.clone(),
            rssi: obs.rx_rssi,
            snr: obs.rx_snr,
            hop_start: obs.hop_start,
            hop_limit: obs.hop_limit,
            gateways: group.gateways,
            fingerprints: group.fingerprints,
        };
        let gateway_count = grouped.gateways.len() as u64;
        self.store.insert_grouped_packet(&grouped, now)?;
        self.metrics.group_closed.fetch_add(1, Ordering::Relaxed);
        self.metrics.packets_persisted.fetch_add(1, Ordering::Relaxed);
        self.metrics.observe_gateways(gateway_count);
        debug!(
            packet_id = grouped.packet_id,
            sender = grouped.sender,
            gateways = gateway_count,
            "group_closed"
        );
        Ok(())
    }

    fn tick_period(&self) -> Duration {
        // At least every Q/2; clamped so Q=0 still ticks.
        (self.cfg.quiescence / 2).clamp(Duration::from_millis(250), Duration::from_secs(1))
    }
}

/// Worker loop: observations in, closed groups out to the store. Shutdown
/// flushes all open groups regardless of window.
pub async fn run(
    mut grouper: PacketGrouper,
    mut rx: mpsc::Receiver<Box<Observation>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), StoreError> {
    let mut ticker = tokio::time::interval(grouper.tick_period());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(obs) => grouper.observe(*obs, Utc::now()),
                None => break,
            },
            _ = ticker.tick() => grouper.tick(Utc::now()),
            _ = shutdown.changed() => break,
        }
    }
    // Drain anything already queued, then force-close.
    while let Ok(obs) = rx.try_recv() {
        grouper.observe(*obs, Utc::now());
    }
    let open = grouper.open_groups();
    if open > 0 {
        info!(open, "flushing open groups on shutdown");
    }
    grouper.flush(Utc::now())
}
