// Online aggregation over the packet store. Every public method is
// read-through cached in the store's stat_cache table under a canonical
// `function:args` key; an expired entry is a miss and is overwritten
// last-write-wins.

use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveDate, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::metrics::Metrics;
use crate::store::{StatRow, Store, StoreResult, TopSender};

const TTL_DAY: Duration = Duration::from_secs(300);
const TTL_ROLLING: Duration = Duration::from_secs(60);
const TTL_HOURLY: Duration = Duration::from_secs(60);
const TTL_NETWORK: Duration = Duration::from_secs(300);

/// `{count, min, avg, max, p50..p99}` over an inclusive-exclusive range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub message_count: i64,
    pub min_gateways: Option<i64>,
    pub avg_gateways: Option<f64>,
    pub max_gateways: Option<i64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayStat {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub stats: WindowStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourStat {
    pub hour: u32,
    #[serde(flatten)]
    pub stats: WindowStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyStat {
    pub date: NaiveDate,
    pub hours: Vec<HourStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingStats {
    pub last_24h: WindowStats,
    pub last_7d: WindowStats,
    pub last_30d: WindowStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareBlock {
    pub date: NaiveDate,
    pub message_count: i64,
    pub avg_gateways: Option<f64>,
    pub message_count_change_pct: f64,
    pub avg_gateways_change_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparisons {
    pub today: DayStat,
    pub yesterday: CompareBlock,
    pub same_day_last_week: CompareBlock,
    pub same_day_last_month: CompareBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub nodes: i64,
    pub gateways: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_nodes: i64,
    pub total_gateways: i64,
    pub active_24h: ActivityCounts,
    pub active_7d: ActivityCounts,
    pub active_30d: ActivityCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub gateways: String,
    pub packets: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileReport {
    pub sample_size: i64,
    pub min: Option<i64>,
    pub avg: Option<f64>,
    pub max: Option<i64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Linear-interpolated p-quantile over an ascending sample. Empty sample
/// has no quantiles; a single value is every quantile.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = p * (n as f64 - 1.0);
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            Some(sorted[lo] + frac * (sorted[hi] - sorted[lo]))
        }
    }
}

fn window_stats(rows: &[StatRow]) -> WindowStats {
    if rows.is_empty() {
        return WindowStats::default();
    }
    let mut counts: Vec<f64> = rows.iter().map(|r| r.gateway_count as f64).collect();
    counts.sort_by(|a, b| a.total_cmp(b));
    let sum: f64 = counts.iter().sum();
    let n = counts.len();
    WindowStats {
        message_count: n as i64,
        min_gateways: Some(counts[0] as i64),
        avg_gateways: Some(sum / n as f64),
        max_gateways: Some(counts[n - 1] as i64),
        p50: percentile(&counts, 0.50),
        p90: percentile(&counts, 0.90),
        p95: percentile(&counts, 0.95),
        p99: percentile(&counts, 0.99),
        first_message_at: rows.iter().map(|r| r.sent_at).min(),
        last_message_at: rows.iter().map(|r| r.sent_at).max(),
    }
}

fn percentile_report(mut counts: Vec<i64>) -> PercentileReport {
    counts.sort_unstable();
    let sample: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
    let n = sample.len();
    PercentileReport {
        sample_size: n as i64,
        min: counts.first().copied(),
        avg: (n > 0).then(|| sample.iter().sum::<f64>() / n as f64),
        max: counts.last().copied(),
        p50: percentile(&sample, 0.50),
        p90: percentile(&sample, 0.90),
        p95: percentile(&sample, 0.95),
        p99: percentile(&sample, 0.99),
    }
}

fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
    (start, start + ChronoDuration::days(1))
}

fn pct_change(current: f64, baseline: f64) -> f64 {
    (current - baseline) / baseline.max(1.0) * 100.0
}

pub struct StatsEngine {
    store: Arc<Store>,
    metrics: Arc<Metrics>,
}

impl StatsEngine {
    pub fn new(store: Arc<Store>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Read-through cache wrapper. Hits come back verbatim from the cache
    /// table; misses compute, store, and return.
    fn cached<T, F>(&self, key: &str, ttl: Duration, compute: F) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> StoreResult<T>,
    {
        let now = Utc::now();
        if let Some(json) = self.store.cache_get(key, now)? {
            if let Ok(value) = serde_json::from_str(&json) {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            debug!(key, "cache entry unreadable, recomputing");
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        let value = compute()?;
        if let Ok(json) = serde_json::to_string(&value) {
            self.store.cache_put(key, &json, now, ttl)?;
        }
        Ok(value)
    }

    fn day_stat_uncached(&self, date: NaiveDate) -> StoreResult<DayStat> {
        let (start, end) = day_bounds(date);
        let rows = self.store.stat_rows_between(start, end)?;
        Ok(DayStat {
            date,
            stats: window_stats(&rows),
        })
    }

    pub fn day_stat(&self, date: NaiveDate) -> StoreResult<DayStat> {
        self.cached(&format!("day_stat:{date}"), TTL_DAY, || {
            self.day_stat_uncached(date)
        })
    }

    pub fn today(&self) -> StoreResult<DayStat> {
        self.day_stat(Utc::now().date_naive())
    }

    pub fn hourly_stat(&self, date: NaiveDate) -> StoreResult<HourlyStat> {
        self.cached(&format!("hourly_stat:{date}"), TTL_HOURLY, || {
            let (start, end) = day_bounds(date);
            let rows = self.store.stat_rows_between(start, end)?;
            let hours = (0..24)
                .map(|hour| {
                    let hs = start + ChronoDuration::hours(hour as i64);
                    let he = hs + ChronoDuration::hours(1);
                    let bucket: Vec<StatRow> = rows
                        .iter()
                        .filter(|r| r.sent_at >= hs && r.sent_at < he)
                        .cloned()
                        .collect();
                    HourStat {
                        hour,
                        stats: window_stats(&bucket),
                    }
                })
                .collect();
            Ok(HourlyStat { date, hours })
        })
    }

    pub fn rolling(&self) -> StoreResult<RollingStats> {
        self.cached("rolling_stats", TTL_ROLLING, || {
            let now = Utc::now();
            let block = |hours: i64| -> StoreResult<WindowStats> {
                let rows = self
                    .store
                    .stat_rows_between(now - ChronoDuration::hours(hours), now)?;
                Ok(window_stats(&rows))
            };
            Ok(RollingStats {
                last_24h: block(24)?,
                last_7d: block(24 * 7)?,
                last_30d: block(24 * 30)?,
            })
        })
    }

    pub fn comparisons(&self) -> StoreResult<Comparisons> {
        self.cached("comparisons", TTL_DAY, || {
            let today_date = Utc::now().date_naive();
            let today = self.day_stat_uncached(today_date)?;
            let baseline = |date: NaiveDate| -> StoreResult<CompareBlock> {
                let day = self.day_stat_uncached(date)?;
                Ok(CompareBlock {
                    date,
                    message_count: day.stats.message_count,
                    avg_gateways: day.stats.avg_gateways,
                    message_count_change_pct: pct_change(
                        today.stats.message_count as f64,
                        day.stats.message_count as f64,
                    ),
                    avg_gateways_change_pct: today.stats.avg_gateways.map(|cur| {
                        pct_change(cur, day.stats.avg_gateways.unwrap_or(0.0))
                    }),
                })
            };
            let last_month = today_date
                .checked_sub_months(Months::new(1))
                .unwrap_or(today_date - ChronoDuration::days(30));
            Ok(Comparisons {
                yesterday: baseline(today_date - ChronoDuration::days(1))?,
                same_day_last_week: baseline(today_date - ChronoDuration::days(7))?,
                same_day_last_month: baseline(last_month)?,
                today,
            })
        })
    }

    pub fn network(&self) -> StoreResult<NetworkStats> {
        self.cached("network_stats", TTL_NETWORK, || {
            let now = Utc::now();
            let (total_nodes, total_gateways) = self.store.network_totals()?;
            let active = |hours: i64| -> StoreResult<ActivityCounts> {
                let (nodes, gateways) =
                    self.store.active_counts(now - ChronoDuration::hours(hours))?;
                Ok(ActivityCounts { nodes, gateways })
            };
            Ok(NetworkStats {
                total_nodes,
                total_gateways,
                active_24h: active(24)?,
                active_7d: active(24 * 7)?,
                active_30d: active(24 * 30)?,
            })
        })
    }

    pub fn top_senders(
        &self,
        date: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<TopSender>> {
        let (start, end) = day_bounds(date);
        self.store.top_senders(start, end, limit)
    }

    /// Packet counts bucketed by gateway count: `1`, `2`, ... then `>=N`.
    pub fn gateway_histogram(
        &self,
        date: NaiveDate,
        buckets: usize,
    ) -> StoreResult<Vec<HistogramBucket>> {
        let (start, end) = day_bounds(date);
        let rows = self.store.stat_rows_between(start, end)?;
        let buckets = buckets.max(1);
        let mut out: Vec<HistogramBucket> = (1..=buckets)
            .map(|b| HistogramBucket {
                gateways: if b == buckets {
                    format!(">={b}")
                } else {
                    b.to_string()
                },
                packets: 0,
            })
            .collect();
        for row in rows {
            let idx = (row.gateway_count.max(1) as usize).min(buckets) - 1;
            out[idx].packets += 1;
        }
        Ok(out)
    }

    /// Percentile block over the trailing `sample_cap` packets.
    pub fn gateway_percentiles(&self, sample_cap: usize) -> StoreResult<PercentileReport> {
        let counts = self.store.gateway_count_sample(sample_cap)?;
        Ok(percentile_report(counts))
    }

    pub fn gateway_percentiles_for_user(
        &self,
        node_id: u32,
        sample_cap: usize,
    ) -> StoreResult<PercentileReport> {
        let counts = self
            .store
            .gateway_count_sample_for_user(node_id, sample_cap)?;
        Ok(percentile_report(counts))
    }

    /// Precomputes the rolling and network blocks so interactive reads hit
    /// warm cache. Invoked by the scheduler every minute.
    pub fn warm_cache(&self) -> StoreResult<()> {
        self.rolling()?;
        self.network()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GatewayObservation, GroupedPacket};

    fn engine_with_store() -> (StatsEngine, Arc<Store>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(Store::open_in_memory(metrics.clone()).unwrap());
        (
            StatsEngine::new(store.clone(), metrics.clone()),
            store,
            metrics,
        )
    }

    fn insert_packet(store: &Store, packet_id: u32, sent_at: DateTime<Utc>, gateways: usize) {
        let group = GroupedPacket {
            packet_id,
            sender: 0xa1,
            sent_at,
            payload: "m".into(),
            rssi: None,
            snr: None,
            hop_start: None,
            hop_limit: None,
            gateways: (0..gateways)
                .map(|i| GatewayObservation {
                    gateway_id: format!("!000000{i:02x}"),
                    observed_at: sent_at,
                })
                .collect(),
            fingerprints: vec![[packet_id as u8; 32]],
        };
        store.insert_grouped_packet(&group, sent_at).unwrap();
    }

    #[test]
    fn percentile_of_empty_sample_is_none() {
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn percentile_of_single_value_is_that_value() {
        assert_eq!(percentile(&[7.0], 0.5), Some(7.0));
        assert_eq!(percentile(&[7.0], 0.99), Some(7.0));
    }

    #[test]
    fn percentiles_on_reference_sample() {
        // sample [1, 1, 2, 3, 5, 8, 13]: r = p * (n - 1)
        let s = [1.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0];
        assert_eq!(percentile(&s, 0.50), Some(3.0));
        assert_eq!(percentile(&s, 0.90), Some(10.0)); // 8 + 0.4 * (13 - 8)
        let p95 = percentile(&s, 0.95).unwrap();
        assert!((p95 - 11.5).abs() < 1e-9); // r = 5.7
        assert_eq!(percentile(&s, 1.0), Some(13.0));
    }

    #[test]
    fn percentiles_are_monotone() {
        let mut s: Vec<f64> = vec![4.0, 9.0, 1.0, 1.0, 2.0, 7.0, 7.0, 3.0];
        s.sort_by(|a, b| a.total_cmp(b));
        let p50 = percentile(&s, 0.5).unwrap();
        let p90 = percentile(&s, 0.9).unwrap();
        let p95 = percentile(&s, 0.95).unwrap();
        let p99 = percentile(&s, 0.99).unwrap();
        assert!(p50 <= p90 && p90 <= p95 && p95 <= p99 && p99 <= *s.last().unwrap());
    }

    #[test]
    fn window_stats_shape() {
        let t = Utc::now();
        let rows: Vec<StatRow> = [1i64, 1, 2, 3, 5, 8, 13]
            .iter()
            .enumerate()
            .map(|(i, &c)| StatRow {
                sent_at: t + ChronoDuration::seconds(i as i64),
                gateway_count: c,
            })
            .collect();
        let w = window_stats(&rows);
        assert_eq!(w.message_count, 7);
        assert_eq!(w.min_gateways, Some(1));
        assert_eq!(w.max_gateways, Some(13));
        assert_eq!(w.p50, Some(3.0));
        assert!((w.avg_gateways.unwrap() - 33.0 / 7.0).abs() < 1e-9);
        assert_eq!(w.first_message_at, Some(t));
        assert_eq!(w.last_message_at, Some(t + ChronoDuration::seconds(6)));
    }

    #[test]
    fn empty_window_has_null_percentiles() {
        let w = window_stats(&[]);
        assert_eq!(w.message_count, 0);
        assert!(w.p50.is_none() && w.p99.is_none() && w.avg_gateways.is_none());
    }

    #[test]
    fn day_stat_only_counts_that_utc_day() {
        let (engine, store, _) = engine_with_store();
        let date = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let (start, _) = day_bounds(date);
        insert_packet(&store, 1, start + ChronoDuration::hours(1), 2);
        insert_packet(&store, 2, start + ChronoDuration::hours(23), 4);
        insert_packet(&store, 3, start - ChronoDuration::seconds(1), 9);
        insert_packet(&store, 4, start + ChronoDuration::hours(24), 9);

        let day = engine.day_stat(date).unwrap();
        assert_eq!(day.stats.message_count, 2);
        assert_eq!(day.stats.max_gateways, Some(4));
    }

    #[test]
    fn second_read_hits_cache() {
        let (engine, store, metrics) = engine_with_store();
        let date = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let (start, _) = day_bounds(date);
        insert_packet(&store, 1, start, 3);

        let first = engine.day_stat(date).unwrap();
        let second = engine.day_stat(date).unwrap();
        assert_eq!(metrics.cache_misses.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(first.stats.message_count, second.stats.message_count);

        // The cached value is served even though new data arrived.
        insert_packet(&store, 2, start + ChronoDuration::minutes(1), 3);
        let third = engine.day_stat(date).unwrap();
        assert_eq!(third.stats.message_count, 1);
    }

    #[test]
    fn hourly_stat_has_24_buckets() {
        let (engine, store, _) = engine_with_store();
        let date = NaiveDate::from_ymd_opt(2026, 7, 2).unwrap();
        let (start, _) = day_bounds(date);
        insert_packet(&store, 1, start + ChronoDuration::minutes(30), 2);
        insert_packet(&store, 2, start + ChronoDuration::minutes(45), 6);

        let hourly = engine.hourly_stat(date).unwrap();
        assert_eq!(hourly.hours.len(), 24);
        assert_eq!(hourly.hours[0].stats.message_count, 2);
        assert_eq!(hourly.hours[0].stats.max_gateways, Some(6));
        assert_eq!(hourly.hours[1].stats.message_count, 0);
    }

    #[test]
    fn comparisons_use_bounded_baseline() {
        assert_eq!(pct_change(10.0, 0.0), 1000.0);
        assert_eq!(pct_change(10.0, 5.0), 100.0);
        assert_eq!(pct_change(5.0, 10.0), -50.0);
    }

    #[test]
    fn histogram_buckets_overflow_into_last() {
        let (engine, store, _) = engine_with_store();
        let date = Utc::now().date_naive();
        let (start, _) = day_bounds(date);
        insert_packet(&store, 1, start + ChronoDuration::hours(1), 1);
        insert_packet(&store, 2, start + ChronoDuration::hours(1), 2);
        insert_packet(&store, 3, start + ChronoDuration::hours(1), 7);

        let hist = engine.gateway_histogram(date, 4).unwrap();
        assert_eq!(hist.len(), 4);
        assert_eq!(hist[0].packets, 1);
        assert_eq!(hist[1].packets, 1);
        assert_eq!(hist[3].gateways, ">=4");
        assert_eq!(hist[3].packets, 1);
    }

    #[test]
    fn gateway_percentiles_over_trailing_sample() {
        let (engine, store, _) = engine_with_store();
        let t = Utc::now();
        for (i, c) in [1usize, 1, 2, 3, 5, 8, 13].iter().enumerate() {
            insert_packet(&store, i as u32 + 1, t - ChronoDuration::minutes(i as i64), *c);
        }
        let report = engine.gateway_percentiles(100).unwrap();
        assert_eq!(report.sample_size, 7);
        assert_eq!(report.p50, Some(3.0));
        assert_eq!(report.max, Some(13));

        let capped = engine.gateway_percentiles(3).unwrap();
        assert_eq!(capped.sample_size, 3);
    }

    #[test]
    fn network_stats_counts_distinct() {
        let (engine, store, _) = engine_with_store();
        let t = Utc::now();
        insert_packet(&store, 1, t, 2);
        insert_packet(&store, 2, t, 2);
        let net = engine.network().unwrap();
        assert_eq!(net.total_nodes, 1);
        assert_eq!(net.total_gateways, 2);
        assert_eq!(net.active_24h.nodes, 1);
        assert_eq!(net.active_24h.gateways, 2);
    }
}
