//! Exchange capability.
//!
//! The execution path is parameterized by this trait, injected at
//! startup: a paper simulator for dry runs and the live CLOB client.
//! Fill events flow out-of-band through the channel each implementation
//! is constructed with.

pub mod clob;
pub mod paper;

use async_trait::async_trait;

use crate::types::{BookTop, OrderSide};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderType {
    Gtc,
    Gtd,
    Fok,
}

#[derive(Clone, Debug)]
pub struct PlaceOrderRequest {
    pub token_id: String,
    pub side: OrderSide,
    /// Tick-aligned limit price in (0, 1). Validated upstream by the guard.
    pub price: f64,
    /// Outcome-token shares.
    pub size: f64,
    pub order_type: OrderType,
    /// GTD expiry, absolute wall-clock ms.
    pub expiration_ms: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct PlaceOrderResponse {
    pub success: bool,
    pub order_id: Option<String>,
    pub avg_price: Option<f64>,
    pub filled_size: Option<f64>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn place_order(&self, req: PlaceOrderRequest) -> anyhow::Result<PlaceOrderResponse>;

    /// Best-effort cancel; unknown ids are not an error.
    async fn cancel_orders(&self, order_ids: &[String]) -> anyhow::Result<()>;

    /// Current top-of-book for a token, or None when the venue has no book.
    async fn get_book(&self, token_id: &str) -> anyhow::Result<Option<BookTop>>;
}
