// Subscription CRUD and the three daily summary shapes. A node has at most
// one active subscription; subscribing again replaces the variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::stats::DayStat;
use crate::store::{Store, StoreResult, SubscriptionRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Low,
    Avg,
    High,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Low => "low",
            Variant::Avg => "avg",
            Variant::High => "high",
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Variant::Low),
            "avg" => Ok(Variant::Avg),
            "high" => Ok(Variant::High),
            other => Err(format!("unknown subscription variant `{other}`")),
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SubscriptionSvc {
    store: Arc<Store>,
}

impl SubscriptionSvc {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn subscribe(&self, node_id: u32, variant: Variant) -> StoreResult<SubscriptionRow> {
        let now = Utc::now();
        self.store.upsert_subscription(node_id, variant, now)?;
        Ok(self
            .store
            .subscription_for(node_id)?
            .unwrap_or(SubscriptionRow {
                user_node_id: node_id as i64,
                variant,
                active: true,
                created_at: now,
                updated_at: now,
            }))
    }

    /// Returns false when there was nothing to unsubscribe.
    pub fn unsubscribe(&self, node_id: u32) -> StoreResult<bool> {
        self.store.deactivate_subscription(node_id, Utc::now())
    }

    pub fn list(&self, variant: Option<Variant>) -> StoreResult<Vec<SubscriptionRow>> {
        self.store.active_subscriptions(variant)
    }

    pub fn for_node(&self, node_id: u32) -> StoreResult<Option<SubscriptionRow>> {
        self.store.subscription_for(node_id)
    }
}

fn fmt_opt_f(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.1}"),
        None => "-".into(),
    }
}

fn fmt_opt_i(v: Option<i64>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "-".into(),
    }
}

fn fmt_hhmm(v: Option<DateTime<Utc>>) -> String {
    match v {
        Some(v) => v.format("%H:%M").to_string(),
        None => "--:--".into(),
    }
}

/// Renders the daily summary for a variant. The chunker downstream handles
/// anything over the DM byte cap.
pub fn format_summary(variant: Variant, day: &DayStat) -> String {
    let s = &day.stats;
    match variant {
        Variant::Low => format!(
            "Mesh daily {}: {} messages, avg {} gateways.",
            day.date,
            s.message_count,
            fmt_opt_f(s.avg_gateways)
        ),
        Variant::Avg => format!(
            "Mesh daily {}: {} messages. Gateways avg {} (min {}, max {}), median {}.",
            day.date,
            s.message_count,
            fmt_opt_f(s.avg_gateways),
            fmt_opt_i(s.min_gateways),
            fmt_opt_i(s.max_gateways),
            fmt_opt_f(s.p50)
        ),
        Variant::High => format!(
            "Mesh daily {}\nmessages: {}\ngateways: avg {}, min {}, max {}\np50/p90/p95/p99: {}/{}/{}/{}\nfirst {} last {} UTC",
            day.date,
            s.message_count,
            fmt_opt_f(s.avg_gateways),
            fmt_opt_i(s.min_gateways),
            fmt_opt_i(s.max_gateways),
            fmt_opt_f(s.p50),
            fmt_opt_f(s.p90),
            fmt_opt_f(s.p95),
            fmt_opt_f(s.p99),
            fmt_hhmm(s.first_message_at),
            fmt_hhmm(s.last_message_at),
        ),
    }
}
