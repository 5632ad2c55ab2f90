// Chat command bot over a direct TCP link to a mesh radio. The link speaks
// the radio's stream framing: 0x94 0xC3, 2-byte big-endian length, then one
// protobuf frame. The bot owns the session exclusively; the scheduler hands
// it outbound messages through a bounded drop-oldest queue.

pub mod commands;

use chrono::Utc;
use prost::Message;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::{RadioConfig, RadioEndpoint};
use crate::metrics::{Metrics, RuntimeHealth};
use crate::proto;
use crate::stats::StatsEngine;
use crate::store::Store;
use crate::subscriptions::{self, SubscriptionSvc};
use commands::{chunk_reply, Command, ParseError, RateDecision, RateLimiter};

pub const FRAME_START1: u8 = 0x94;
pub const FRAME_START2: u8 = 0xc3;
const MAX_FRAME: usize = 512;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);
const RATE_WINDOW: Duration = Duration::from_secs(60);
const RATE_MAX: usize = 5;
pub const OUTBOUND_CAPACITY: usize = 128;

const SLOW_DOWN: &str = "Please slow down: at most 5 commands per minute.";
const STATS_UNAVAILABLE: &str = "Stats are temporarily unavailable, try again soon.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Subscribed = 3,
    Draining = 4,
}

impl LinkState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::Subscribed,
            4 => LinkState::Draining,
            _ => LinkState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Subscribed => "subscribed",
            LinkState::Draining => "draining",
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Subscribed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Dm { to: u32, text: String },
    Broadcast { channel: u32, text: String },
}

/// Bounded queue with drop-oldest overflow, shared between the scheduler
/// (producer) and the bot session (consumer).
pub struct OutboundQueue {
    items: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: Outbound) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Outbound {
        loop {
            if let Some(item) = self.items.lock().unwrap().pop_front() {
                return item;
            }
            // The periodic re-check covers a notify permit consumed by a
            // cancelled select branch.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// --- stream framing --------------------------------------------------------

pub fn encode_frame(msg: &proto::ToRadio) -> Vec<u8> {
    let body_len = msg.encoded_len();
    let mut buf = Vec::with_capacity(body_len + 4);
    buf.push(FRAME_START1);
    buf.push(FRAME_START2);
    buf.extend_from_slice(&(body_len as u16).to_be_bytes());
    msg.encode(&mut buf).ok();
    buf
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &proto::ToRadio,
) -> io::Result<()> {
    writer.write_all(&encode_frame(msg)).await?;
    writer.flush().await
}

/// Reads the next well-formed frame, resynchronising on the start bytes
/// after any garbage (the radio interleaves debug output on some firmware).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<proto::FromRadio> {
    loop {
        if reader.read_u8().await? != FRAME_START1 {
            continue;
        }
        if reader.read_u8().await? != FRAME_START2 {
            continue;
        }
        let len = reader.read_u16().await? as usize;
        if len > MAX_FRAME {
            continue;
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        match proto::FromRadio::decode(buf.as_slice()) {
            Ok(frame) => return Ok(frame),
            Err(e) => {
                debug!(error = %e, "undecodable frame skipped");
                continue;
            }
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<io::Result<proto::FromRadio>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

fn text_packet(to: u32, channel: u32, text: &str) -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::Packet(proto::MeshPacket {
            to,
            channel,
            id: rand::random(),
            want_ack: false,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        })),
    }
}

struct Reply {
    to: u32,
    text: String,
    log_id: Option<i64>,
}

pub struct CommandBot {
    cfg: RadioConfig,
    store: Arc<Store>,
    stats: Arc<StatsEngine>,
    subs: Arc<SubscriptionSvc>,
    metrics: Arc<Metrics>,
    health: Arc<RuntimeHealth>,
    queue: Arc<OutboundQueue>,
    limiter: RateLimiter,
    my_node_id: AtomicU32,
}

impl CommandBot {
    pub fn new(
        cfg: RadioConfig,
        store: Arc<Store>,
        stats: Arc<StatsEngine>,
        subs: Arc<SubscriptionSvc>,
        metrics: Arc<Metrics>,
        health: Arc<RuntimeHealth>,
        queue: Arc<OutboundQueue>,
    ) -> Self {
        Self {
            cfg,
            store,
            stats,
            subs,
            metrics,
            health,
            queue,
            limiter: RateLimiter::new(RATE_WINDOW, RATE_MAX),
            my_node_id: AtomicU32::new(0),
        }
    }

    fn set_state(&self, state: LinkState) {
        self.health.bot_state.store(state as u8, Ordering::Relaxed);
    }

    /// Connect-and-serve loop with exponential backoff, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(RadioEndpoint::Tcp { host, port }) = self.cfg.endpoint.clone() else {
            error!("command bot needs a tcp:// radio endpoint");
            return;
        };
        let mut backoff = RECONNECT_BASE;
        while !*shutdown.borrow() {
            self.set_state(LinkState::Connecting);
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    info!(%host, port, "radio link established");
                    match self.session(stream, &mut shutdown, &mut backoff).await {
                        Ok(()) => break, // clean shutdown
                        Err(e) => warn!(error = %e, "radio session ended"),
                    }
                }
                Err(e) => {
                    warn!(%host, port, error = %e, "radio connect failed");
                }
            }
            self.set_state(LinkState::Disconnected);
            self.metrics.bot_reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
        self.set_state(LinkState::Disconnected);
    }

    async fn session(
        &self,
        stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let (frame_tx, mut frames) = mpsc::channel::<io::Result<proto::FromRadio>>(32);
        let reader_task = tokio::spawn(read_loop(reader, frame_tx));

        let result = self
            .session_loop(&mut frames, &mut writer, shutdown, backoff)
            .await;
        reader_task.abort();
        result
    }

    async fn session_loop<W: AsyncWrite + Unpin>(
        &self,
        frames: &mut mpsc::Receiver<io::Result<proto::FromRadio>>,
        writer: &mut W,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> io::Result<()> {
        let config_id: u32 = rand::random();
        write_frame(
            writer,
            &proto::ToRadio {
                payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(config_id)),
            },
        )
        .await?;

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_PERIOD,
            HEARTBEAT_PERIOD,
        );
        let mut last_rx = tokio::time::Instant::now();

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let frame = match frame {
                        Some(result) => result?,
                        None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "radio closed the link")),
                    };
                    last_rx = tokio::time::Instant::now();
                    if let Some(reply) = self.handle_frame(frame) {
                        let sent = self
                            .send_chunked(writer, reply.to, 0, &reply.text, shutdown)
                            .await?;
                        *backoff = RECONNECT_BASE;
                        if sent {
                            if let Some(log_id) = reply.log_id {
                                if let Err(e) = self.store.mark_command_responded(log_id) {
                                    warn!(error = %e, "command log update failed");
                                }
                            }
                        }
                    }
                }
                out = self.queue.pop() => {
                    match out {
                        Outbound::Dm { to, text } => {
                            self.send_chunked(writer, to, 0, &text, shutdown).await?;
                        }
                        Outbound::Broadcast { channel, text } => {
                            self.send_chunked(writer, proto::BROADCAST_ADDR, channel, &text, shutdown)
                                .await?;
                            self.metrics.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    *backoff = RECONNECT_BASE;
                }
                _ = heartbeat.tick() => {
                    write_frame(writer, &proto::ToRadio {
                        payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {})),
                    }).await?;
                }
                _ = tokio::time::sleep_until(last_rx + INACTIVITY_TIMEOUT) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "radio link inactive"));
                }
                _ = shutdown.changed() => {
                    self.set_state(LinkState::Draining);
                    let _ = write_frame(writer, &proto::ToRadio {
                        payload_variant: Some(proto::to_radio::PayloadVariant::Disconnect(true)),
                    }).await;
                    return Ok(());
                }
            }
        }
    }

    fn handle_frame(&self, frame: proto::FromRadio) -> Option<Reply> {
        match frame.payload_variant? {
            proto::from_radio::PayloadVariant::MyInfo(info) => {
                self.my_node_id.store(info.my_node_num, Ordering::Relaxed);
                self.set_state(LinkState::Connected);
                info!(node_id = info.my_node_num, "radio identified itself");
                None
            }
            proto::from_radio::PayloadVariant::ConfigCompleteId(_) => {
                self.set_state(LinkState::Subscribed);
                debug!("radio config replay complete, packet events live");
                None
            }
            proto::from_radio::PayloadVariant::NodeInfo(node) => {
                if let Some(user) = node.user {
                    let result = self.store.upsert_node(
                        node.num,
                        Some(user.long_name.as_str()).filter(|s| !s.is_empty()),
                        Some(user.short_name.as_str()).filter(|s| !s.is_empty()),
                        Some(user.id.as_str()).filter(|s| !s.is_empty()),
                        Some(proto::role_label(user.role)),
                        Utc::now(),
                    );
                    if let Err(e) = result {
                        warn!(error = %e, "node info upsert failed");
                    }
                }
                None
            }
            proto::from_radio::PayloadVariant::Packet(packet) => self.handle_packet(packet),
        }
    }

    fn handle_packet(&self, packet: proto::MeshPacket) -> Option<Reply> {
        let Some(proto::mesh_packet::PayloadVariant::Decoded(data)) = packet.payload_variant
        else {
            return None;
        };
        if data.portnum != proto::PortNum::TextMessageApp as i32 {
            return None;
        }
        let me = self.my_node_id.load(Ordering::Relaxed);
        let direct = packet.to == me && me != 0;
        let on_channel =
            packet.to == proto::BROADCAST_ADDR && packet.channel == self.cfg.stats_channel;
        if !direct && !on_channel {
            return None;
        }
        let text = String::from_utf8_lossy(&data.payload).into_owned();
        if !text.trim_start().starts_with('!') {
            return None;
        }
        self.process_command(packet.from, &text)
    }

    /// Audit first, then rate-limit gate, then dispatch. Every command ends
    /// up in the log, limited ones with the flag set.
    fn process_command(&self, sender: u32, text: &str) -> Option<Reply> {
        let decision = self.limiter.check(sender, Instant::now());
        let rate_limited = decision != RateDecision::Allowed;
        self.metrics.commands_processed.fetch_add(1, Ordering::Relaxed);
        if rate_limited {
            self.metrics
                .commands_rate_limited
                .fetch_add(1, Ordering::Relaxed);
        }

        let log_id = match self
            .store
            .append_command_log(sender, text.trim(), rate_limited, Utc::now())
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(sender, error = %e, "command audit write failed");
                None
            }
        };

        let text_out = match decision {
            RateDecision::LimitedSilent => return None,
            RateDecision::LimitedNotify => SLOW_DOWN.to_string(),
            RateDecision::Allowed => match commands::parse(text) {
                Ok(cmd) => self.respond(sender, cmd),
                Err(ParseError::NotACommand) => return None,
                Err(ParseError::Unknown(_)) => commands::HINT.to_string(),
                Err(ParseError::BadArgument(msg)) => msg,
            },
        };
        Some(Reply {
            to: sender,
            text: text_out,
            log_id,
        })
    }

    fn respond(&self, sender: u32, cmd: Command) -> String {
        let result = match cmd {
            Command::Help => Ok([
                "Commands:",
                "!stats last message | !stats last N messages",
                "!stats today | !stats today detailed | !stats status",
                "!subscribe low|avg|high | !unsubscribe | !my_subscriptions",
                "!about",
            ]
            .join("\n")),
            Command::About => Ok(format!(
                "Meshcover: gateway-coverage statistics for this mesh. I am {}. Send !help for commands.",
                crate::codec::canonical_node_id(self.my_node_id.load(Ordering::Relaxed))
            )),
            Command::StatsLast(n) => self.format_last(n),
            Command::StatsToday => self
                .stats
                .today()
                .map(|day| subscriptions::format_summary(subscriptions::Variant::Avg, &day)),
            Command::StatsTodayDetailed => self.format_today_detailed(),
            Command::StatsStatus => self.format_status(),
            Command::Subscribe(variant) => self
                .subs
                .subscribe(sender, variant)
                .map(|row| format!("Subscribed to the {} daily summary.", row.variant)),
            Command::Unsubscribe => self.subs.unsubscribe(sender).map(|was_active| {
                if was_active {
                    "Unsubscribed. No more daily summaries.".to_string()
                } else {
                    "You had no active subscription.".to_string()
                }
            }),
            Command::MySubscriptions => self.subs.for_node(sender).map(|sub| match sub {
                Some(row) => format!(
                    "Active subscription: {} daily summary (since {}).",
                    row.variant,
                    row.created_at.format("%Y-%m-%d")
                ),
                None => "No active subscription. Try !subscribe avg.".to_string(),
            }),
        };
        result.unwrap_or_else(|e| {
            warn!(error = %e, "command dispatch hit the store");
            STATS_UNAVAILABLE.to_string()
        })
    }

    fn format_last(&self, n: usize) -> Result<String, crate::store::StoreError> {
        let packets = self.store.newest_packets(n)?;
        if packets.is_empty() {
            return Ok("No messages stored yet.".to_string());
        }
        let lines: Vec<String> = packets
            .iter()
            .map(|p| {
                format!(
                    "[{}] {}: {} ({} gw)",
                    p.sent_at.format("%H:%M"),
                    p.sender_name,
                    p.payload,
                    p.gateway_count
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    fn format_today_detailed(&self) -> Result<String, crate::store::StoreError> {
        let day = self.stats.today()?;
        let mut out = subscriptions::format_summary(subscriptions::Variant::High, &day);
        let top = self.stats.top_senders(day.date, 5)?;
        if !top.is_empty() {
            out.push_str("\ntop senders:");
            for sender in top {
                out.push_str(&format!(
                    "\n  {} ({} msgs)",
                    sender.sender_name, sender.message_count
                ));
            }
        }
        let hourly = self.stats.hourly_stat(day.date)?;
        if let Some(busiest) = hourly
            .hours
            .iter()
            .max_by_key(|h| h.stats.message_count)
            .filter(|h| h.stats.message_count > 0)
        {
            out.push_str(&format!(
                "\nbusiest hour: {:02}:00 UTC ({} msgs)",
                busiest.hour, busiest.stats.message_count
            ));
        }
        Ok(out)
    }

    fn format_status(&self) -> Result<String, crate::store::StoreError> {
        let db = match self.store.ping() {
            Ok(latency) => format!("ok ({} ms)", latency.as_millis()),
            Err(_) => "unreachable".to_string(),
        };
        let mqtt = if self.health.mqtt_connected.load(Ordering::Relaxed) {
            "connected"
        } else {
            "down"
        };
        let uptime = self.health.uptime_seconds();
        Ok(format!(
            "status: up {}h{:02}m, db {}, mqtt {}, outbound queue {}",
            uptime / 3600,
            (uptime % 3600) / 60,
            db,
            mqtt,
            self.queue.len()
        ))
    }

    /// Sends a reply in DM-sized chunks with the configured delay between
    /// them. Returns false when shutdown abandoned the remaining chunks; a
    /// write error abandons them too, by propagating.
    async fn send_chunked<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        to: u32,
        channel: u32,
        text: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> io::Result<bool> {
        let chunks = chunk_reply(text, self.cfg.dm_byte_cap);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.inter_chunk_delay) => {}
                    _ = shutdown.changed() => {
                        info!(sent = i, total, "shutdown during chunked reply, abandoning rest");
                        return Ok(false);
                    }
                }
            }
            write_frame(writer, &text_packet(to, channel, chunk)).await?;
            self.metrics.dm_chunks_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }
}
