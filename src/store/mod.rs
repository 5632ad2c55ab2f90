// Durable state. One rusqlite connection behind a mutex; writers serialise
// through it and transient SQLITE_BUSY (a second process on the same file)
// is retried with bounded backoff. All timestamps are RFC 3339 UTC with
// fixed-width fractional seconds so string comparison orders correctly.

pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::codec::canonical_node_id;
use crate::metrics::Metrics;
use crate::subscriptions::Variant;

const BUSY_MAX_ATTEMPTS: u32 = 10;
const BUSY_BACKOFF_START: Duration = Duration::from_millis(10);
const BUSY_BACKOFF_CAP: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database still busy after {0} attempts")]
    Busy(u32),
    #[error("unsupported database url `{0}` (expected a sqlite path or :memory:)")]
    UnsupportedUrl(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// One relay of a grouped packet, in first-seen order.
#[derive(Debug, Clone)]
pub struct GatewayObservation {
    pub gateway_id: String,
    pub observed_at: DateTime<Utc>,
}

/// A closed group handed over by the grouper, persisted in one transaction.
#[derive(Debug, Clone)]
pub struct GroupedPacket {
    pub packet_id: u32,
    pub sender: u32,
    pub sent_at: DateTime<Utc>,
    pub payload: String,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub gateways: Vec<GatewayObservation>,
    pub fingerprints: Vec<[u8; 32]>,
}

impl GroupedPacket {
    fn hops_away(&self) -> Option<u32> {
        match (self.hop_start, self.hop_limit) {
            (Some(s), Some(l)) => Some(s.saturating_sub(l)),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum GroupInsertOutcome {
    /// Fresh packet row with its relay set.
    Inserted,
    /// A concurrent writer won the unique race; relays were reconciled
    /// into the existing row instead.
    Merged,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Added { new_count: i64 },
    Duplicate,
    /// No packet row for this key; the arrival is not late, it is new.
    NotFound,
    /// The row exists but is older than the retention bound.
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    pub id: i64,
    pub packet_id: i64,
    pub from_node_id: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub sent_at: DateTime<Utc>,
    pub gateway_count: i64,
    pub rssi: Option<i64>,
    pub snr: Option<f64>,
    pub hop_start: Option<i64>,
    pub hop_limit: Option<i64>,
    pub hops_away: Option<i64>,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayRow {
    pub gateway_id: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_id: i64,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub mesh_id: Option<String>,
    pub role: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRow {
    pub user_node_id: i64,
    pub variant: Variant,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandLogRow {
    pub id: i64,
    pub user_node_id: i64,
    pub command: String,
    pub response_sent: bool,
    pub rate_limited: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandDayCount {
    pub date: String,
    pub total: i64,
    pub rate_limited: i64,
}

/// Per-packet row used by the aggregation queries.
#[derive(Debug, Clone)]
pub struct StatRow {
    pub sent_at: DateTime<Utc>,
    pub gateway_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopSender {
    pub node_id: i64,
    pub sender_name: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserGateway {
    pub gateway_id: String,
    pub packet_count: i64,
    pub last_observed: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub path: String,
    pub size_bytes: Option<u64>,
    pub nodes: i64,
    pub packets: i64,
    pub packet_gateways: i64,
    pub envelope_fingerprints: i64,
    pub subscriptions: i64,
    pub stat_cache: i64,
    pub command_logs: i64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct ExpiredCounts {
    pub packets: i64,
    pub packet_gateways: i64,
    pub envelope_fingerprints: i64,
    pub stat_cache: i64,
    pub command_logs: i64,
}

pub struct Store {
    conn: Mutex<Connection>,
    path: String,
    metrics: Arc<Metrics>,
}

impl Store {
    pub fn open(url: &str, metrics: Arc<Metrics>) -> StoreResult<Self> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        if path.contains("://") {
            return Err(StoreError::UnsupportedUrl(url.to_string()));
        }
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_string(),
            metrics,
        })
    }

    pub fn open_in_memory(metrics: Arc<Metrics>) -> StoreResult<Self> {
        Self::open(":memory:", metrics)
    }

    /// Runs `f` against the connection, retrying transient lock contention
    /// with exponential backoff capped at one second.
    fn retry<T>(&self, mut f: impl FnMut(&mut Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let mut delay = BUSY_BACKOFF_START;
        for _ in 0..BUSY_MAX_ATTEMPTS {
            match f(&mut conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    self.metrics
                        .store_busy_retries
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(BUSY_BACKOFF_CAP);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Busy(BUSY_MAX_ATTEMPTS))
    }

    /// Measures a trivial round trip for the health endpoint.
    pub fn ping(&self) -> StoreResult<Duration> {
        let started = Instant::now();
        self.retry(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))?;
        Ok(started.elapsed())
    }

    // --- ingest write paths ------------------------------------------------

    /// Atomic membership-and-insert on the fingerprint table. Returns false
    /// when the envelope was already ingested (replay).
    pub fn register_fingerprint(
        &self,
        hash: &[u8; 32],
        seen_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.retry(|conn| {
            conn.execute(
                "INSERT INTO envelope_fingerprints (hash, seen_at) VALUES (?1, ?2)
                 ON CONFLICT (hash) DO NOTHING",
                params![hash.as_slice(), ts(seen_at)],
            )
            .map(|changed| changed > 0)
        })
    }

    /// One transaction: fingerprints, node upsert, packet row, relay rows,
    /// `gateway_count` set to the relay cardinality. A unique race on
    /// `packet_id` falls back to the reconcile path instead of duplicating.
    pub fn insert_grouped_packet(
        &self,
        group: &GroupedPacket,
        now: DateTime<Utc>,
    ) -> StoreResult<GroupInsertOutcome> {
        let outcome = self.retry(|conn| {
            let tx = conn.transaction()?;
            for fp in &group.fingerprints {
                tx.execute(
                    "INSERT INTO envelope_fingerprints (hash, seen_at) VALUES (?1, ?2)
                     ON CONFLICT (hash) DO NOTHING",
                    params![fp.as_slice(), ts(now)],
                )?;
            }

            tx.execute(
                "INSERT INTO nodes (node_id, first_seen, last_seen) VALUES (?1, ?2, ?2)
                 ON CONFLICT (node_id) DO UPDATE SET
                     last_seen = MAX(nodes.last_seen, excluded.last_seen)",
                params![group.sender as i64, ts(group.sent_at)],
            )?;
            let sender_name: String = tx
                .query_row(
                    "SELECT COALESCE(long_name, short_name) FROM nodes WHERE node_id = ?1",
                    params![group.sender as i64],
                    |row| row.get::<_, Option<String>>(0),
                )?
                .unwrap_or_else(|| canonical_node_id(group.sender));

            let inserted = tx.execute(
                "INSERT INTO packets (packet_id, from_node_id, sender_name, sent_at,
                     gateway_count, rssi, snr, hop_start, hop_limit, hops_away,
                     payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    group.packet_id as i64,
                    group.sender as i64,
                    sender_name,
                    ts(group.sent_at),
                    group.rssi,
                    group.snr.map(|v| v as f64),
                    group.hop_start,
                    group.hop_limit,
                    group.hops_away(),
                    group.payload,
                    ts(now),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(ref e) if is_unique_violation(e) => {
                    // Concurrent writer beat us to this packet_id.
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }

            for gw in &group.gateways {
                tx.execute(
                    "INSERT INTO packet_gateways (packet_id, gateway_id, observed_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (packet_id, gateway_id) DO NOTHING",
                    params![group.packet_id as i64, gw.gateway_id, ts(gw.observed_at)],
                )?;
            }
            tx.execute(
                "UPDATE packets SET gateway_count =
                     (SELECT COUNT(*) FROM packet_gateways WHERE packet_id = ?1)
                 WHERE packet_id = ?1",
                params![group.packet_id as i64],
            )?;
            tx.commit()?;
            Ok(Some(()))
        })?;

        if outcome.is_some() {
            return Ok(GroupInsertOutcome::Inserted);
        }

        // Reconcile each relay into the row the other writer created.
        warn!(
            packet_id = group.packet_id,
            sender = group.sender,
            "grouped insert hit existing packet, reconciling relays"
        );
        for gw in &group.gateways {
            let result = self.reconcile_late_relay(
                group.packet_id,
                group.sender,
                &gw.gateway_id,
                gw.observed_at,
                Duration::MAX,
            );
            match result {
                Ok(ReconcileOutcome::Added { .. }) | Ok(ReconcileOutcome::Duplicate) => {}
                Ok(_) => warn!(
                    packet_id = group.packet_id,
                    sender = group.sender,
                    gateway = %gw.gateway_id,
                    "relay does not match the winning packet row, dropping"
                ),
                Err(e) => warn!(
                    packet_id = group.packet_id,
                    gateway = %gw.gateway_id,
                    error = %e,
                    "relay reconcile after unique race failed, dropping"
                ),
            }
        }
        Ok(GroupInsertOutcome::Merged)
    }

    /// Attaches a late relay to an already persisted packet. Past the
    /// retention bound the arrival is discarded.
    pub fn reconcile_late_relay(
        &self,
        packet_id: u32,
        sender: u32,
        gateway_id: &str,
        observed_at: DateTime<Utc>,
        retention: Duration,
    ) -> StoreResult<ReconcileOutcome> {
        self.retry(|conn| {
            let tx = conn.transaction()?;
            let created_at: Option<String> = tx
                .query_row(
                    "SELECT created_at FROM packets WHERE packet_id = ?1 AND from_node_id = ?2",
                    params![packet_id as i64, sender as i64],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(created_at) = created_at else {
                return Ok(ReconcileOutcome::NotFound);
            };
            let created_at = parse_ts(0, created_at)?;
            let age = observed_at.signed_duration_since(created_at);
            if retention != Duration::MAX
                && age > chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX)
            {
                return Ok(ReconcileOutcome::Expired);
            }

            let inserted = tx.execute(
                "INSERT INTO packet_gateways (packet_id, gateway_id, observed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (packet_id, gateway_id) DO NOTHING",
                params![packet_id as i64, gateway_id, ts(observed_at)],
            )?;
            if inserted == 0 {
                tx.commit()?;
                return Ok(ReconcileOutcome::Duplicate);
            }
            tx.execute(
                "UPDATE packets SET gateway_count = gateway_count + 1, updated_at = ?2
                 WHERE packet_id = ?1",
                params![packet_id as i64, ts(observed_at)],
            )?;
            let new_count: i64 = tx.query_row(
                "SELECT gateway_count FROM packets WHERE packet_id = ?1",
                params![packet_id as i64],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(ReconcileOutcome::Added { new_count })
        })
    }

    /// Name/role refresh from a node-info announcement. Never touches
    /// `packets`; the cached sender name on old rows is intentionally
    /// left as it was at insert time.
    pub fn upsert_node(
        &self,
        node_id: u32,
        long_name: Option<&str>,
        short_name: Option<&str>,
        mesh_id: Option<&str>,
        role: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.retry(|conn| {
            conn.execute(
                "INSERT INTO nodes (node_id, long_name, short_name, mesh_id, role,
                     first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (node_id) DO UPDATE SET
                     long_name = COALESCE(excluded.long_name, nodes.long_name),
                     short_name = COALESCE(excluded.short_name, nodes.short_name),
                     mesh_id = COALESCE(excluded.mesh_id, nodes.mesh_id),
                     role = COALESCE(excluded.role, nodes.role),
                     last_seen = MAX(nodes.last_seen, excluded.last_seen)",
                params![node_id as i64, long_name, short_name, mesh_id, role, ts(seen_at)],
            )?;
            Ok(())
        })
    }

    pub fn node(&self, node_id: u32) -> StoreResult<Option<NodeRecord>> {
        self.retry(|conn| {
            conn.query_row(
                "SELECT node_id, long_name, short_name, mesh_id, role, first_seen, last_seen
                 FROM nodes WHERE node_id = ?1",
                params![node_id as i64],
                |row| {
                    Ok(NodeRecord {
                        node_id: row.get(0)?,
                        long_name: row.get(1)?,
                        short_name: row.get(2)?,
                        mesh_id: row.get(3)?,
                        role: row.get(4)?,
                        first_seen: parse_ts(5, row.get(5)?)?,
                        last_seen: parse_ts(6, row.get(6)?)?,
                    })
                },
            )
            .optional()
        })
    }

    // --- packet reads ------------------------------------------------------

    fn packet_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PacketRecord> {
        let from_node_id: i64 = row.get(2)?;
        Ok(PacketRecord {
            id: row.get(0)?,
            packet_id: row.get(1)?,
            from_node_id,
            sender_id: canonical_node_id(from_node_id as u32),
            sender_name: row.get(3)?,
            sent_at: parse_ts(4, row.get(4)?)?,
            gateway_count: row.get(5)?,
            rssi: row.get(6)?,
            snr: row.get(7)?,
            hop_start: row.get(8)?,
            hop_limit: row.get(9)?,
            hops_away: row.get(10)?,
            payload: row.get(11)?,
            created_at: parse_ts(12, row.get(12)?)?,
            updated_at: parse_ts(13, row.get(13)?)?,
        })
    }

    const PACKET_COLUMNS: &'static str = "id, packet_id, from_node_id, sender_name, sent_at,
        gateway_count, rssi, snr, hop_start, hop_limit, hops_away, payload,
        created_at, updated_at";

    pub fn newest_packets(&self, limit: usize) -> StoreResult<Vec<PacketRecord>> {
        self.retry(|conn| {
            let sql = format!(
                "SELECT {} FROM packets ORDER BY sent_at DESC, id DESC LIMIT ?1",
                Self::PACKET_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![limit as i64], Self::packet_from_row)?;
            rows.collect()
        })
    }

    pub fn newest_packets_for_user(
        &self,
        node_id: u32,
        limit: usize,
    ) -> StoreResult<Vec<PacketRecord>> {
        self.retry(|conn| {
            let sql = format!(
                "SELECT {} FROM packets WHERE from_node_id = ?1
                 ORDER BY sent_at DESC, id DESC LIMIT ?2",
                Self::PACKET_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![node_id as i64, limit as i64], Self::packet_from_row)?;
            rows.collect()
        })
    }

    pub fn relays_for_packet(&self, packet_id: i64) -> StoreResult<Vec<RelayRow>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT gateway_id, observed_at FROM packet_gateways
                 WHERE packet_id = ?1 ORDER BY observed_at, gateway_id",
            )?;
            let rows = stmt.query_map(params![packet_id], |row| {
                Ok(RelayRow {
                    gateway_id: row.get(0)?,
                    observed_at: parse_ts(1, row.get(1)?)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Per-packet stat rows in `[start, end)`, ascending by send time.
    pub fn stat_rows_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<StatRow>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT sent_at, gateway_count FROM packets
                 WHERE sent_at >= ?1 AND sent_at < ?2 ORDER BY sent_at",
            )?;
            let rows = stmt.query_map(params![ts(start), ts(end)], |row| {
                Ok(StatRow {
                    sent_at: parse_ts(0, row.get(0)?)?,
                    gateway_count: row.get(1)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn top_senders(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TopSender>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT from_node_id, sender_name, COUNT(*) AS n FROM packets
                 WHERE sent_at >= ?1 AND sent_at < ?2
                 GROUP BY from_node_id ORDER BY n DESC, from_node_id LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![ts(start), ts(end), limit as i64], |row| {
                Ok(TopSender {
                    node_id: row.get(0)?,
                    sender_name: row.get(1)?,
                    message_count: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Trailing gateway-count sample, newest first, capped.
    pub fn gateway_count_sample(&self, cap: usize) -> StoreResult<Vec<i64>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT gateway_count FROM packets ORDER BY sent_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![cap as i64], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn gateway_count_sample_for_user(
        &self,
        node_id: u32,
        cap: usize,
    ) -> StoreResult<Vec<i64>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT gateway_count FROM packets WHERE from_node_id = ?1
                 ORDER BY sent_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![node_id as i64, cap as i64], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn gateways_for_user(&self, node_id: u32, limit: usize) -> StoreResult<Vec<UserGateway>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT pg.gateway_id, COUNT(*) AS n, MAX(pg.observed_at)
                 FROM packet_gateways pg
                 JOIN packets p ON p.packet_id = pg.packet_id
                 WHERE p.from_node_id = ?1
                 GROUP BY pg.gateway_id ORDER BY n DESC, pg.gateway_id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![node_id as i64, limit as i64], |row| {
                Ok(UserGateway {
                    gateway_id: row.get(0)?,
                    packet_count: row.get(1)?,
                    last_observed: parse_ts(2, row.get(2)?)?,
                })
            })?;
            rows.collect()
        })
    }

    /// (total nodes ever, total distinct gateways ever).
    pub fn network_totals(&self) -> StoreResult<(i64, i64)> {
        self.retry(|conn| {
            let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
            let gateways: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT gateway_id) FROM packet_gateways",
                [],
                |r| r.get(0),
            )?;
            Ok((nodes, gateways))
        })
    }

    /// (nodes that sent, gateways that relayed) since `since`.
    pub fn active_counts(&self, since: DateTime<Utc>) -> StoreResult<(i64, i64)> {
        self.retry(|conn| {
            let nodes: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT from_node_id) FROM packets WHERE sent_at >= ?1",
                params![ts(since)],
                |r| r.get(0),
            )?;
            let gateways: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT gateway_id) FROM packet_gateways WHERE observed_at >= ?1",
                params![ts(since)],
                |r| r.get(0),
            )?;
            Ok((nodes, gateways))
        })
    }

    // --- subscriptions ------------------------------------------------------

    pub fn upsert_subscription(
        &self,
        node_id: u32,
        variant: Variant,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.retry(|conn| {
            conn.execute(
                "INSERT INTO subscriptions (user_node_id, variant, active, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?3)
                 ON CONFLICT (user_node_id) DO UPDATE SET
                     variant = excluded.variant, active = 1, updated_at = excluded.updated_at",
                params![node_id as i64, variant.as_str(), ts(now)],
            )?;
            Ok(())
        })
    }

    /// Marks inactive; the row is retained for audit. False when there was
    /// no active subscription.
    pub fn deactivate_subscription(&self, node_id: u32, now: DateTime<Utc>) -> StoreResult<bool> {
        self.retry(|conn| {
            let changed = conn.execute(
                "UPDATE subscriptions SET active = 0, updated_at = ?2
                 WHERE user_node_id = ?1 AND active = 1",
                params![node_id as i64, ts(now)],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn subscription_for(&self, node_id: u32) -> StoreResult<Option<SubscriptionRow>> {
        self.retry(|conn| {
            conn.query_row(
                "SELECT user_node_id, variant, active, created_at, updated_at
                 FROM subscriptions WHERE user_node_id = ?1 AND active = 1",
                params![node_id as i64],
                Self::subscription_from_row,
            )
            .optional()
        })
    }

    pub fn active_subscriptions(
        &self,
        variant: Option<Variant>,
    ) -> StoreResult<Vec<SubscriptionRow>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT user_node_id, variant, active, created_at, updated_at
                 FROM subscriptions
                 WHERE active = 1 AND (?1 IS NULL OR variant = ?1)
                 ORDER BY user_node_id",
            )?;
            let rows = stmt.query_map(
                params![variant.map(|v| v.as_str())],
                Self::subscription_from_row,
            )?;
            rows.collect()
        })
    }

    fn subscription_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
        let variant: String = row.get(1)?;
        Ok(SubscriptionRow {
            user_node_id: row.get(0)?,
            variant: variant.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            active: row.get(2)?,
            created_at: parse_ts(3, row.get(3)?)?,
            updated_at: parse_ts(4, row.get(4)?)?,
        })
    }

    // --- command audit ------------------------------------------------------

    /// Append-only; written before any reply is attempted.
    pub fn append_command_log(
        &self,
        node_id: u32,
        command: &str,
        rate_limited: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.retry(|conn| {
            conn.execute(
                "INSERT INTO command_logs (user_node_id, command, response_sent, rate_limited, created_at)
                 VALUES (?1, ?2, 0, ?3, ?4)",
                params![node_id as i64, command, rate_limited, ts(now)],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn mark_command_responded(&self, log_id: i64) -> StoreResult<()> {
        self.retry(|conn| {
            conn.execute(
                "UPDATE command_logs SET response_sent = 1 WHERE id = ?1",
                params![log_id],
            )?;
            Ok(())
        })
    }

    pub fn recent_command_logs(&self, limit: usize) -> StoreResult<Vec<CommandLogRow>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, user_node_id, command, response_sent, rate_limited, created_at
                 FROM command_logs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], Self::command_log_from_row)?;
            rows.collect()
        })
    }

    pub fn command_logs_for_user(
        &self,
        node_id: u32,
        limit: usize,
    ) -> StoreResult<Vec<CommandLogRow>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, user_node_id, command, response_sent, rate_limited, created_at
                 FROM command_logs WHERE user_node_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![node_id as i64, limit as i64], Self::command_log_from_row)?;
            rows.collect()
        })
    }

    /// Daily command totals for the last `days` days, UTC buckets.
    pub fn command_day_counts(&self, days: u32) -> StoreResult<Vec<CommandDayCount>> {
        self.retry(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT substr(created_at, 1, 10) AS day,
                        COUNT(*),
                        SUM(rate_limited)
                 FROM command_logs
                 WHERE created_at >= ?1
                 GROUP BY day ORDER BY day DESC",
            )?;
            let cutoff = ts(Utc::now() - chrono::Duration::days(days as i64));
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok(CommandDayCount {
                    date: row.get(0)?,
                    total: row.get(1)?,
                    rate_limited: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                })
            })?;
            rows.collect()
        })
    }

    fn command_log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandLogRow> {
        Ok(CommandLogRow {
            id: row.get(0)?,
            user_node_id: row.get(1)?,
            command: row.get(2)?,
            response_sent: row.get(3)?,
            rate_limited: row.get(4)?,
            created_at: parse_ts(5, row.get(5)?)?,
        })
    }

    // --- stat cache ---------------------------------------------------------

    /// Read-through lookup. An expired entry is a miss.
    pub fn cache_get(&self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<String>> {
        self.retry(|conn| {
            conn.query_row(
                "SELECT value FROM stat_cache WHERE key = ?1 AND expires_at > ?2",
                params![key, ts(now)],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Optimistic last-write-wins refill.
    pub fn cache_put(
        &self,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<()> {
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.retry(|conn| {
            conn.execute(
                "INSERT INTO stat_cache (key, value, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (key) DO UPDATE SET
                     value = excluded.value,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at",
                params![key, value, ts(now), ts(expires)],
            )?;
            Ok(())
        })
    }

    // --- retention ----------------------------------------------------------

    /// Deletes rows older than the cutoff from packets (relays cascade),
    /// fingerprints, stat cache and command logs. Nodes and subscriptions
    /// are never expired.
    pub fn expire_older_than(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ExpiredCounts> {
        let cutoff = ts(now - chrono::Duration::days(days as i64));
        self.retry(|conn| {
            let tx = conn.transaction()?;
            let relays_before: i64 =
                tx.query_row("SELECT COUNT(*) FROM packet_gateways", [], |r| r.get(0))?;
            let packets = tx.execute(
                "DELETE FROM packets WHERE created_at < ?1",
                params![cutoff],
            )? as i64;
            let relays_after: i64 =
                tx.query_row("SELECT COUNT(*) FROM packet_gateways", [], |r| r.get(0))?;
            let fingerprints = tx.execute(
                "DELETE FROM envelope_fingerprints WHERE seen_at < ?1",
                params![cutoff],
            )? as i64;
            let cache = tx.execute(
                "DELETE FROM stat_cache WHERE created_at < ?1 OR expires_at <= ?2",
                params![cutoff, ts(now)],
            )? as i64;
            let logs = tx.execute(
                "DELETE FROM command_logs WHERE created_at < ?1",
                params![cutoff],
            )? as i64;
            tx.commit()?;
            Ok(ExpiredCounts {
                packets,
                packet_gateways: relays_before - relays_after,
                envelope_fingerprints: fingerprints,
                stat_cache: cache,
                command_logs: logs,
            })
        })
    }

    pub fn database_info(&self) -> StoreResult<DatabaseInfo> {
        let size_bytes = (self.path != ":memory:")
            .then(|| std::fs::metadata(Path::new(&self.path)).map(|m| m.len()).ok())
            .flatten();
        self.retry(|conn| {
            let count = |table: &str| -> rusqlite::Result<i64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            };
            Ok(DatabaseInfo {
                path: self.path.clone(),
                size_bytes,
                nodes: count("nodes")?,
                packets: count("packets")?,
                packet_gateways: count("packet_gateways")?,
                envelope_fingerprints: count("envelope_fingerprints")?,
                subscriptions: count("subscriptions")?,
                stat_cache: count("stat_cache")?,
                command_logs: count("command_logs")?,
            })
        })
    }
}
