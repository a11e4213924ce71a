//! Reference spot-price feed.
//!
//! Pure producer: connects to the spot trade websocket, parses trades,
//! fans ticks out to every subscribed controller. Persistent across
//! markets; the orchestrator swaps the subscriber list through a watch
//! channel instead of reconnecting. Falls back to the secondary endpoint
//! and reconnects with exponential backoff.

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::types::{Asset, FeedEvent, PriceTick};

pub async fn price_feed(
    asset: Asset,
    ws_url: String,
    ws_fallback: String,
    subscribers: watch::Receiver<Vec<mpsc::Sender<FeedEvent>>>,
    spot_tx: watch::Sender<f64>,
) {
    let mut backoff_ms: u64 = 1_000;

    loop {
        info!(url = %ws_url, "spot feed connecting");

        let ws = match connect_async(&ws_url).await {
            Ok((ws, _)) => {
                info!("spot feed connected");
                backoff_ms = 1_000;
                ws
            }
            Err(e) => {
                warn!(error = %e, "primary failed, trying fallback");
                match connect_async(&ws_fallback).await {
                    Ok((ws, _)) => {
                        info!("spot feed connected via fallback");
                        backoff_ms = 1_000;
                        ws
                    }
                    Err(e2) => {
                        warn!(error = %e2, backoff_ms, "fallback failed, retrying");
                        tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(10_000);
                        continue;
                    }
                }
            }
        };

        let (mut _write, mut read) = ws.split();

        while let Some(msg) = read.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "spot ws error, reconnecting");
                    break;
                }
            };

            if let Message::Text(text) = msg {
                if let Some(tick) = parse_trade(asset, &text) {
                    let _ = spot_tx.send(tick.price);
                    // try_send: a slow controller must not stall the feed;
                    // the next tick is milliseconds away.
                    for tx in subscribers.borrow().iter() {
                        let _ = tx.try_send(FeedEvent::Price(tick.clone()));
                    }
                }
            }
        }

        warn!(backoff_ms, "spot feed disconnected, reconnecting");
        tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(10_000);
    }
}

fn parse_trade(asset: Asset, text: &str) -> Option<PriceTick> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let price: f64 = v["p"].as_str()?.parse().ok()?;
    let ts_ms = v["T"].as_i64()?;
    if price <= 0.0 {
        return None;
    }
    Some(PriceTick {
        asset,
        price,
        ts_ms,
    })
}
