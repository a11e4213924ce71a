//! Paper exchange: dry-run order simulator.
//!
//! Fills every accepted limit immediately at its limit price and emits
//! the matching fill event, mirroring how a marketable maker order would
//! behave on a quiet book. Books are mirrored in from the live book feed
//! so the last-mile guard sees real data even in dry-run mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::gateway::{Exchange, PlaceOrderRequest, PlaceOrderResponse};
use crate::types::{BookTop, FillEvent};

pub struct PaperExchange {
    books: RwLock<HashMap<String, BookTop>>,
    fill_tx: mpsc::Sender<FillEvent>,
    next_order: AtomicU64,
}

impl PaperExchange {
    pub fn new(fill_tx: mpsc::Sender<FillEvent>) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            fill_tx,
            next_order: AtomicU64::new(1),
        }
    }

    /// Mirror a book update from the live feed.
    pub fn set_book(&self, token_id: &str, top: BookTop) {
        self.books.write().insert(token_id.to_string(), top);
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn place_order(&self, req: PlaceOrderRequest) -> anyhow::Result<PlaceOrderResponse> {
        let seq = self.next_order.fetch_add(1, Ordering::Relaxed);
        let order_id = format!("paper-{}", seq);
        debug!(
            order_id,
            token = %req.token_id,
            side = ?req.side,
            price = req.price,
            size = req.size,
            "paper fill"
        );

        let fill = FillEvent {
            order_id: order_id.clone(),
            token_id: req.token_id.clone(),
            side: req.side,
            qty: req.size,
            price: req.price,
            ts_ms: chrono::Utc::now().timestamp_millis(),
        };
        let _ = self.fill_tx.send(fill).await;

        Ok(PlaceOrderResponse {
            success: true,
            order_id: Some(order_id),
            avg_price: Some(req.price),
            filled_size: Some(req.size),
            error: None,
        })
    }

    async fn cancel_orders(&self, _order_ids: &[String]) -> anyhow::Result<()> {
        // Paper orders fill instantly; nothing rests to cancel.
        Ok(())
    }

    async fn get_book(&self, token_id: &str) -> anyhow::Result<Option<BookTop>> {
        Ok(self.books.read().get(token_id).copied())
    }
}
