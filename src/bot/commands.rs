// Command grammar, reply chunking and the per-sender rate limit. All pure
// so the transport loop stays thin.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::subscriptions::Variant;

pub const MAX_LAST_MESSAGES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    About,
    /// `stats last message` is 1; `stats last N messages` is 1..=20.
    StatsLast(usize),
    StatsToday,
    StatsTodayDetailed,
    StatsStatus,
    Subscribe(Variant),
    Unsubscribe,
    MySubscriptions,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    NotACommand,
    Unknown(String),
    BadArgument(String),
}

pub const HINT: &str = "Unknown command. Try !help for the list.";

/// Parses a `!`-prefixed command. Case-insensitive and tolerant of extra
/// whitespace between words.
pub fn parse(text: &str) -> Result<Command, ParseError> {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix('!') else {
        return Err(ParseError::NotACommand);
    };
    let tokens: Vec<String> = body
        .split_whitespace()
        .map(|t| t.to_ascii_lowercase())
        .collect();
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["help"] => Ok(Command::Help),
        ["about"] => Ok(Command::About),
        ["stats", "last", "message"] => Ok(Command::StatsLast(1)),
        ["stats", "last", n] | ["stats", "last", n, "messages"] | ["stats", "last", n, "message"] => {
            let n: usize = n
                .parse()
                .map_err(|_| ParseError::BadArgument(format!("`{n}` is not a number")))?;
            if !(1..=MAX_LAST_MESSAGES).contains(&n) {
                return Err(ParseError::BadArgument(format!(
                    "count must be between 1 and {MAX_LAST_MESSAGES}"
                )));
            }
            Ok(Command::StatsLast(n))
        }
        ["stats", "today"] => Ok(Command::StatsToday),
        ["stats", "today", "detailed"] => Ok(Command::StatsTodayDetailed),
        ["stats", "status"] => Ok(Command::StatsStatus),
        ["subscribe", variant] => variant
            .parse::<Variant>()
            .map(Command::Subscribe)
            .map_err(ParseError::BadArgument),
        ["subscribe"] => Err(ParseError::BadArgument(
            "subscribe needs a variant: low, avg or high".into(),
        )),
        ["unsubscribe"] => Ok(Command::Unsubscribe),
        ["my_subscriptions"] | ["my", "subscriptions"] => Ok(Command::MySubscriptions),
        [] => Err(ParseError::Unknown(String::new())),
        [verb, ..] => Err(ParseError::Unknown((*verb).to_string())),
    }
}

/// Splits a reply into chunks no longer than `cap` bytes, never inside a
/// UTF-8 sequence, preferring line breaks, then spaces.
pub fn chunk_reply(text: &str, cap: usize) -> Vec<String> {
    let cap = cap.max(4);
    let mut chunks = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if rest.len() <= cap {
            chunks.push(rest.to_string());
            break;
        }
        let window = &rest[..floor_char_boundary(rest, cap)];
        let split = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window.len());
        let (head, tail) = rest.split_at(split);
        chunks.push(head.trim_end().to_string());
        rest = tail.trim_start();
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the limit, and the sender has not yet been told this window.
    LimitedNotify,
    LimitedSilent,
}

struct SenderWindow {
    hits: VecDeque<Instant>,
    notified: bool,
}

/// Sliding-window limiter: at most `max` commands per `window` per sender.
/// The "slow down" notice goes out once per window.
pub struct RateLimiter {
    window: Duration,
    max: usize,
    senders: DashMap<u32, SenderWindow>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            senders: DashMap::new(),
        }
    }

    pub fn check(&self, sender: u32, now: Instant) -> RateDecision {
        let mut entry = self.senders.entry(sender).or_insert_with(|| SenderWindow {
            hits: VecDeque::new(),
            notified: false,
        });
        while let Some(&front) = entry.hits.front() {
            if now.duration_since(front) >= self.window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }
        if entry.hits.len() < self.max {
            entry.hits.push_back(now);
            entry.notified = false;
            RateDecision::Allowed
        } else if !entry.notified {
            entry.notified = true;
            RateDecision::LimitedNotify
        } else {
            RateDecision::LimitedSilent
        }
    }

    /// Drops senders whose whole window has expired.
    pub fn evict(&self, now: Instant) {
        self.senders.retain(|_, w| {
            w.hits
                .back()
                .is_some_and(|&last| now.duration_since(last) < self.window * 2)
        });
    }
}
