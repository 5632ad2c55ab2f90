// Process-wide counters. Everything is a relaxed AtomicU64; the /metrics
// handler renders the Prometheus text exposition from this struct directly.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

/// Upper bounds of the gateways-per-packet histogram buckets. The last
/// bucket is +Inf.
const GW_BUCKETS: [u64; 8] = [1, 2, 3, 5, 8, 12, 20, 50];

pub struct Metrics {
    pub envelopes_received: AtomicU64,
    pub group_open: AtomicU64,
    pub group_closed: AtomicU64,
    pub late_reconciled: AtomicU64,
    pub late_beyond_retention: AtomicU64,
    pub replay_suppressed: AtomicU64,
    pub private_dropped: AtomicU64,
    pub decrypt_failed: AtomicU64,
    pub malformed: AtomicU64,
    pub non_text: AtomicU64,
    pub packets_persisted: AtomicU64,
    pub store_busy_retries: AtomicU64,
    pub commands_processed: AtomicU64,
    pub commands_rate_limited: AtomicU64,
    pub dm_chunks_sent: AtomicU64,
    pub broadcasts_sent: AtomicU64,
    pub bot_reconnects: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub scheduler_job_failures: AtomicU64,
    gw_hist: [AtomicU64; GW_BUCKETS.len() + 1],
    gw_sum: AtomicU64,
    gw_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            envelopes_received: AtomicU64::new(0),
            group_open: AtomicU64::new(0),
            group_closed: AtomicU64::new(0),
            late_reconciled: AtomicU64::new(0),
            late_beyond_retention: AtomicU64::new(0),
            replay_suppressed: AtomicU64::new(0),
            private_dropped: AtomicU64::new(0),
            decrypt_failed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            non_text: AtomicU64::new(0),
            packets_persisted: AtomicU64::new(0),
            store_busy_retries: AtomicU64::new(0),
            commands_processed: AtomicU64::new(0),
            commands_rate_limited: AtomicU64::new(0),
            dm_chunks_sent: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
            bot_reconnects: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            scheduler_job_failures: AtomicU64::new(0),
            gw_hist: Default::default(),
            gw_sum: AtomicU64::new(0),
            gw_count: AtomicU64::new(0),
        }
    }

    pub fn observe_gateways(&self, n: u64) {
        let idx = GW_BUCKETS
            .iter()
            .position(|&le| n <= le)
            .unwrap_or(GW_BUCKETS.len());
        self.gw_hist[idx].fetch_add(1, Ordering::Relaxed);
        self.gw_sum.fetch_add(n, Ordering::Relaxed);
        self.gw_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition, format version 0.0.4.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);
        let counters: [(&str, &str, &AtomicU64); 20] = [
            ("envelopes_received", "Envelopes taken off the broker", &self.envelopes_received),
            ("group_open", "Packet groups opened", &self.group_open),
            ("group_closed", "Packet groups closed and persisted", &self.group_closed),
            ("late_reconciled", "Late relays attached to stored packets", &self.late_reconciled),
            ("late_beyond_retention", "Late relays discarded past retention", &self.late_beyond_retention),
            ("replay_suppressed", "Envelopes dropped by fingerprint replay check", &self.replay_suppressed),
            ("private_dropped", "Packets dropped by the publish-consent gate", &self.private_dropped),
            ("decrypt_failed", "Envelopes no configured key could decrypt", &self.decrypt_failed),
            ("malformed", "Envelopes that failed protobuf decode", &self.malformed),
            ("non_text", "Decoded packets on non-text ports", &self.non_text),
            ("packets_persisted", "Packet rows written to the store", &self.packets_persisted),
            ("store_busy_retries", "Write retries on store contention", &self.store_busy_retries),
            ("commands_processed", "Bot commands parsed and dispatched", &self.commands_processed),
            ("commands_rate_limited", "Bot commands refused by the rate limiter", &self.commands_rate_limited),
            ("dm_chunks_sent", "Direct-message chunks sent to the radio", &self.dm_chunks_sent),
            ("broadcasts_sent", "Channel broadcasts sent to the radio", &self.broadcasts_sent),
            ("bot_reconnects", "Radio link reconnect attempts", &self.bot_reconnects),
            ("cache_hits", "Stat cache hits", &self.cache_hits),
            ("cache_misses", "Stat cache misses", &self.cache_misses),
            ("scheduler_job_failures", "Scheduled jobs that returned an error", &self.scheduler_job_failures),
        ];
        for (name, help, v) in counters {
            let full = format!("meshcover_{name}_total");
            out.push_str(&format!("# HELP {full} {help}\n"));
            out.push_str(&format!("# TYPE {full} counter\n"));
            out.push_str(&format!("{full} {}\n", v.load(Ordering::Relaxed)));
        }

        out.push_str("# HELP meshcover_gateways_per_packet Distinct gateways that relayed each persisted packet\n");
        out.push_str("# TYPE meshcover_gateways_per_packet histogram\n");
        let mut cumulative = 0u64;
        for (i, le) in GW_BUCKETS.iter().enumerate() {
            cumulative += self.gw_hist[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "meshcover_gateways_per_packet_bucket{{le=\"{le}\"}} {cumulative}\n"
            ));
        }
        cumulative += self.gw_hist[GW_BUCKETS.len()].load(Ordering::Relaxed);
        out.push_str(&format!(
            "meshcover_gateways_per_packet_bucket{{le=\"+Inf\"}} {cumulative}\n"
        ));
        out.push_str(&format!(
            "meshcover_gateways_per_packet_sum {}\n",
            self.gw_sum.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "meshcover_gateways_per_packet_count {}\n",
            self.gw_count.load(Ordering::Relaxed)
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Link-level liveness shared between the ingest tasks, the bot and the
/// health endpoint. The bot state byte maps to `bot::LinkState`.
pub struct RuntimeHealth {
    pub started_at: Instant,
    pub mqtt_connected: AtomicBool,
    pub bot_state: AtomicU8,
    pub shutting_down: AtomicBool,
}

impl RuntimeHealth {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: AtomicBool::new(false),
            bot_state: AtomicU8::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let m = Metrics::new();
        m.observe_gateways(1);
        m.observe_gateways(3);
        m.observe_gateways(3);
        m.observe_gateways(100);
        let text = m.render_prometheus();
        assert!(text.contains("meshcover_gateways_per_packet_bucket{le=\"1\"} 1"));
        assert!(text.contains("meshcover_gateways_per_packet_bucket{le=\"3\"} 3"));
        assert!(text.contains("meshcover_gateways_per_packet_bucket{le=\"+Inf\"} 4"));
        assert!(text.contains("meshcover_gateways_per_packet_sum 107"));
        assert!(text.contains("meshcover_gateways_per_packet_count 4"));
    }

    #[test]
    fn counters_render_with_total_suffix() {
        let m = Metrics::new();
        m.replay_suppressed.fetch_add(2, Ordering::Relaxed);
        let text = m.render_prometheus();
        assert!(text.contains("# TYPE meshcover_replay_suppressed_total counter"));
        assert!(text.contains("meshcover_replay_suppressed_total 2"));
    }
}
