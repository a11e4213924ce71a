//! Order-book feed for one market's outcome tokens.
//!
//! Pure producer: subscribes to the CLOB market websocket for both token
//! ids, parses full `book` snapshots, and forwards them to the owning
//! controller. Levels arrive in no guaranteed order; normalization to a
//! top-of-book happens downstream in `BookUpdate::to_top`. In dry-run
//! mode updates are also mirrored into the paper exchange so the
//! last-mile guard checks real books.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::gateway::paper::PaperExchange;
use crate::types::{BookUpdate, FeedEvent};

pub async fn book_feed(
    ws_url: String,
    token_ids: Vec<String>,
    feed_tx: mpsc::Sender<FeedEvent>,
    paper_mirror: Option<Arc<PaperExchange>>,
) {
    let mut backoff_ms: u64 = 1_000;

    loop {
        info!(url = %ws_url, "book feed connecting");

        let ws = match connect_async(&ws_url).await {
            Ok((ws, _)) => {
                info!("book feed connected");
                backoff_ms = 1_000;
                ws
            }
            Err(e) => {
                warn!(error = %e, backoff_ms, "book feed connect failed, retrying");
                tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(10_000);
                continue;
            }
        };

        let (mut write, mut read) = ws.split();

        let sub = serde_json::json!({
            "assets_ids": token_ids.clone(),
            "type": "market",
        });
        if let Err(e) = write.send(Message::Text(sub.to_string())).await {
            warn!(error = %e, "subscribe failed, reconnecting");
            continue;
        }
        debug!(tokens = token_ids.len(), "subscribed");

        let mut ping_interval = tokio::time::interval(tokio::time::Duration::from_secs(10));

        loop {
            tokio::select! {
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!(error = %e, "book ws error, reconnecting");
                            break;
                        }
                        None => {
                            warn!("book stream ended, reconnecting");
                            break;
                        }
                    };

                    if let Message::Text(text) = msg {
                        for update in parse_book_events(&text) {
                            if let Some(paper) = paper_mirror.as_ref() {
                                paper.set_book(&update.token_id, update.to_top());
                            }
                            if feed_tx.send(FeedEvent::Book(update)).await.is_err() {
                                debug!("controller channel closed, book feed exiting");
                                return;
                            }
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    let _ = write.send(Message::Ping(vec![])).await;
                }
            }
        }

        tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(10_000);
    }
}

/// Parse `book` events out of a CLOB message (single object or array).
fn parse_book_events(text: &str) -> Vec<BookUpdate> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let events: Vec<&serde_json::Value> = if let Some(arr) = v.as_array() {
        arr.iter().collect()
    } else if v.is_object() {
        vec![&v]
    } else {
        return Vec::new();
    };

    events
        .into_iter()
        .filter(|e| e.get("event_type").and_then(|t| t.as_str()) == Some("book"))
        .filter_map(parse_single_book)
        .collect()
}

fn parse_single_book(event: &serde_json::Value) -> Option<BookUpdate> {
    let token_id = event.get("asset_id")?.as_str()?.to_string();

    let parse_levels = |key: &str| -> Vec<(f64, f64)> {
        event
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|lvl| {
                        let p = lvl.get("price")?.as_str()?.parse().ok()?;
                        let s = lvl.get("size")?.as_str()?.parse().ok()?;
                        Some((p, s))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let ts_ms = event
        .get("timestamp")
        .and_then(|t| {
            t.as_i64()
                .or_else(|| t.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    Some(BookUpdate {
        token_id,
        bids: parse_levels("bids"),
        asks: parse_levels("asks"),
        ts_ms,
    })
}
