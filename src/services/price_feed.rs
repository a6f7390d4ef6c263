//! Price feed adapters
//!
//! Turn an external ticker into `PriceTick`s on an mpsc channel. The live
//! adapter is a WebSocket client that reconnects forever; the replay adapter
//! reads recorded ticks from a JSON-lines file.

use crate::services::metrics::Metrics;
use crate::types::PriceTick;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// WebSocket ticker client
pub struct PriceFeed;

impl PriceFeed {
    /// Stream ticks for `pairs` from `url` into `tick_tx`. Reconnects after
    /// every disconnect; returns once the receiver is gone.
    pub async fn run(url: String, pairs: Vec<String>, tick_tx: mpsc::Sender<PriceTick>, metrics: Metrics) {
        let pairs: Vec<String> = pairs.iter().map(|p| p.trim().to_uppercase()).collect();

        loop {
            if tick_tx.is_closed() {
                info!("[Feed] Tick receiver closed, shutting down price feed");
                break;
            }

            match Self::run_connection(&url, &pairs, &tick_tx).await {
                Ok(true) => break,
                Ok(false) => {
                    info!("[Feed] Closed by server, reconnecting...");
                    metrics.inc_feed_reconnects();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    warn!("[Feed] Error: {}, reconnecting in {}s", e, RECONNECT_DELAY.as_secs());
                    metrics.inc_feed_reconnects();
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// One connection. `Ok(true)` when the receiver went away, `Ok(false)`
    /// when the server closed the socket.
    async fn run_connection(url: &str, pairs: &[String], tick_tx: &mpsc::Sender<PriceTick>) -> Result<bool> {
        let (ws_stream, _) = connect_async(url).await.context("connect")?;
        let (mut write, mut read) = ws_stream.split();
        info!("[Feed] Connected to {}", url);

        let subscribe = json!({ "type": "subscribe", "pairs": pairs });
        write.send(Message::Text(subscribe.to_string())).await?;
        debug!("[Feed] Subscribed to {} pair(s)", pairs.len());

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(false) };
                    match msg? {
                        Message::Text(text) => {
                            for tick in parse_ticks(&text) {
                                if !pairs.is_empty() && !pairs.contains(&tick.pair) {
                                    continue;
                                }
                                if tick_tx.send(tick).await.is_err() {
                                    return Ok(true);
                                }
                            }
                        }
                        Message::Close(_) => return Ok(false),
                        Message::Pong(_) => debug!("[Feed] Received pong"),
                        _ => {}
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Ping(vec![])).await?;
                }
            }
        }
    }
}

/// Feed recorded ticks from a JSON-lines file. Blank lines and lines
/// starting with `#` are skipped. Returns the number of ticks sent.
pub async fn replay_file(path: &str, tick_tx: mpsc::Sender<PriceTick>, pace: Option<Duration>) -> Result<usize> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open replay file {}", path))?;
    let mut lines = BufReader::new(file).lines();
    let mut sent = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let ticks = parse_ticks(line);
        if ticks.is_empty() {
            warn!("[Feed] Skipping unreadable replay line: {}", line);
            continue;
        }
        for tick in ticks {
            if tick_tx.send(tick).await.is_err() {
                return Ok(sent);
            }
            sent += 1;
            if let Some(pace) = pace {
                tokio::time::sleep(pace).await;
            }
        }
    }

    info!("[Feed] Replayed {} tick(s) from {}", sent, path);
    Ok(sent)
}

/// Parse a ticker message: one object or an array of them. Accepts
/// `pair`/`symbol`, `price`/`last` as string or number and a timestamp as
/// RFC3339 or epoch milliseconds (now when absent).
pub fn parse_ticks(text: &str) -> Vec<PriceTick> {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    match msg {
        Value::Array(items) => items.iter().filter_map(parse_tick).collect(),
        other => parse_tick(&other).into_iter().collect(),
    }
}

fn parse_tick(msg: &Value) -> Option<PriceTick> {
    let pair = msg
        .get("pair")
        .or_else(|| msg.get("symbol"))
        .and_then(Value::as_str)?
        .trim()
        .to_uppercase();
    let price = msg
        .get("price")
        .or_else(|| msg.get("last"))
        .and_then(json_to_decimal)
        .filter(|p| *p > Decimal::ZERO)?;
    let timestamp = match msg.get("timestamp").or_else(|| msg.get("ts")) {
        Some(v) => json_to_time(v)?,
        None => Utc::now(),
    };
    Some(PriceTick { pair, price, timestamp })
}

/// Handles both string "0.45" and number 0.45
fn json_to_decimal(v: &Value) -> Option<Decimal> {
    v.as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .or_else(|| v.as_f64().and_then(|n| Decimal::try_from(n).ok()))
}

fn json_to_time(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = v.as_str() {
        return DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc));
    }
    v.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
