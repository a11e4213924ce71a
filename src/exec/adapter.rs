//! Execution adapter: the last mile before the exchange.
//!
//! Tracks one open order per `(market, token, intent type)` slot, re-runs
//! the price guard against a freshly fetched book at submit time, and
//! binds the venue order id back to the slot so fills and cancels can be
//! routed. All failures surface as typed reasons; only genuine exchange
//! failures feed the circuit breaker.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::Config;
use crate::exec::guard::{self, GuardError};
use crate::gateway::{Exchange, OrderType, PlaceOrderRequest, PlaceOrderResponse};
use crate::types::{Intent, IntentType, OrderSide, SkipReason};

pub type SlotKey = (String, String, IntentType);

#[derive(Clone, Debug)]
pub struct OpenOrder {
    pub order_id: String,
    pub intent_id: u64,
    pub correlation_id: Uuid,
    pub placed_ms: i64,
    pub shares: f64,
    pub price: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("ORDER_IN_FLIGHT")]
    OrderInFlight,
    #[error("TOKEN_NOT_FOUND")]
    TokenNotFound,
    #[error("NO_BOOK")]
    NoBook,
    #[error("STALE_BOOK")]
    StaleBook,
    #[error("INVALID_BOOK")]
    InvalidBook,
    #[error("NO_CROSSING_BUY")]
    NoCrossingBuy,
    #[error("NO_CROSSING_SELL")]
    NoCrossingSell,
    #[error("RAW_NAN")]
    RawNan,
    #[error("TIMEOUT")]
    Timeout,
    #[error("exchange: {0}")]
    Exchange(String),
}

/// How a placement failure is handled downstream: exchange-side failures
/// feed the circuit breaker and emit ORDER_FAIL; invariant violations are
/// never retried and surface as ACTION_SKIPPED with the mapped reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Exchange,
    Invariant(SkipReason),
}

impl ExecError {
    fn from_guard(e: GuardError) -> Self {
        match e {
            GuardError::RawNan => ExecError::RawNan,
            GuardError::InvalidBook => ExecError::InvalidBook,
            GuardError::StaleBook => ExecError::StaleBook,
            GuardError::NoCrossingBuy => ExecError::NoCrossingBuy,
            GuardError::NoCrossingSell => ExecError::NoCrossingSell,
        }
    }

    /// The single exchange/invariant split, with the ACTION_SKIPPED code
    /// for the invariant side (the typed reason itself travels in the
    /// detail string).
    pub fn classify(&self) -> FailureClass {
        match self {
            ExecError::Timeout | ExecError::Exchange(_) => FailureClass::Exchange,
            ExecError::OrderInFlight => FailureClass::Invariant(SkipReason::RateLimit),
            ExecError::TokenNotFound | ExecError::NoBook | ExecError::InvalidBook => {
                FailureClass::Invariant(SkipReason::NoOrderbook)
            }
            ExecError::StaleBook => FailureClass::Invariant(SkipReason::StaleMarket),
            ExecError::NoCrossingBuy | ExecError::NoCrossingSell | ExecError::RawNan => {
                FailureClass::Invariant(SkipReason::NoDepth)
            }
        }
    }

    /// Exchange-side failures feed the circuit breaker; local invariant
    /// violations do not.
    pub fn is_exchange_failure(&self) -> bool {
        self.classify() == FailureClass::Exchange
    }
}

#[derive(Clone, Debug)]
pub struct Placed {
    pub order_id: String,
    /// Validated tick-aligned price actually sent.
    pub price: f64,
    pub response: PlaceOrderResponse,
}

pub struct ExecutionAdapter {
    slots: HashMap<SlotKey, OpenOrder>,
    by_order: HashMap<String, SlotKey>,
    tick: f64,
    max_book_age_ms: i64,
    allow_emergency_exit: bool,
    emergency_exit_sec_remaining: f64,
    emergency_cross_ticks: u32,
    order_timeout_ms: i64,
}

impl ExecutionAdapter {
    pub fn new(config: &Config) -> Self {
        Self {
            slots: HashMap::new(),
            by_order: HashMap::new(),
            tick: config.tick,
            max_book_age_ms: config.max_book_age_ms,
            allow_emergency_exit: config.allow_emergency_exit,
            emergency_exit_sec_remaining: config.emergency_exit_sec_remaining,
            emergency_cross_ticks: config.emergency_cross_ticks,
            order_timeout_ms: config.order_timeout_ms,
        }
    }

    pub fn open_orders(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_occupied(&self, market_id: &str, token_id: &str, kind: IntentType) -> bool {
        self.slots
            .contains_key(&(market_id.to_string(), token_id.to_string(), kind))
    }

    pub fn slot_for_order(&self, order_id: &str) -> Option<&SlotKey> {
        self.by_order.get(order_id)
    }

    /// Submit an intent as a limit order.
    ///
    /// Rejects while the slot is occupied, re-fetches the target book, and
    /// runs the guard (emergency variant only for marketable intents inside
    /// the armed emergency window). On success the slot is bound to the
    /// returned order id; an ack without an id is treated as a failure.
    pub async fn place_limit(
        &mut self,
        intent: &Intent,
        exchange: &dyn Exchange,
        now_ms: i64,
    ) -> Result<Placed, ExecError> {
        if intent.token_id.is_empty() {
            return Err(ExecError::TokenNotFound);
        }
        let key: SlotKey = (
            intent.market_id.clone(),
            intent.token_id.clone(),
            intent.kind,
        );
        if self.slots.contains_key(&key) {
            return Err(ExecError::OrderInFlight);
        }

        let book = exchange
            .get_book(&intent.token_id)
            .await
            .map_err(|e| ExecError::Exchange(e.to_string()))?
            .ok_or(ExecError::NoBook)?;

        let emergency = intent.marketable
            && self.allow_emergency_exit
            && intent.secs_to_expiry(now_ms) <= self.emergency_exit_sec_remaining;

        let price = if emergency {
            guard::validate_emergency_cross_price(
                &book,
                OrderSide::Buy,
                intent.price,
                self.tick,
                self.emergency_cross_ticks,
            )
        } else {
            guard::validate_order_price(
                &book,
                OrderSide::Buy,
                intent.price,
                now_ms,
                self.tick,
                self.max_book_age_ms,
            )
        }
        .map_err(ExecError::from_guard)?;

        let req = PlaceOrderRequest {
            token_id: intent.token_id.clone(),
            side: OrderSide::Buy,
            price,
            size: intent.shares,
            order_type: if emergency {
                OrderType::Fok
            } else {
                OrderType::Gtc
            },
            expiration_ms: None,
        };

        let response = timeout(
            Duration::from_millis(self.order_timeout_ms.max(1) as u64),
            exchange.place_order(req),
        )
        .await
        .map_err(|_| ExecError::Timeout)?
        .map_err(|e| ExecError::Exchange(e.to_string()))?;

        if !response.success {
            return Err(ExecError::Exchange(
                response.error.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        let Some(order_id) = response.order_id.clone() else {
            // A venue ack without an id cannot be cancelled or reconciled.
            return Err(ExecError::Exchange("success without order id".to_string()));
        };

        self.slots.insert(
            key.clone(),
            OpenOrder {
                order_id: order_id.clone(),
                intent_id: intent.id,
                correlation_id: intent.correlation_id,
                placed_ms: now_ms,
                shares: intent.shares,
                price,
            },
        );
        self.by_order.insert(order_id.clone(), key);

        Ok(Placed {
            order_id,
            price,
            response,
        })
    }

    /// Terminal fill: release the slot. Returns the slot key for routing.
    pub fn on_order_complete(&mut self, order_id: &str) -> Option<SlotKey> {
        let key = self.by_order.remove(order_id)?;
        self.slots.remove(&key);
        Some(key)
    }

    /// Terminal cancel: release the slot.
    pub fn on_order_cancelled(&mut self, order_id: &str) -> Option<SlotKey> {
        self.on_order_complete(order_id)
    }

    /// Best-effort cancel of whatever the slot currently holds.
    pub async fn cancel_intent(
        &mut self,
        market_id: &str,
        token_id: &str,
        kind: IntentType,
        exchange: &dyn Exchange,
    ) -> Option<String> {
        let key = (market_id.to_string(), token_id.to_string(), kind);
        let open = self.slots.remove(&key)?;
        self.by_order.remove(&open.order_id);
        let _ = exchange.cancel_orders(&[open.order_id.clone()]).await;
        Some(open.order_id)
    }

    /// Evict slots whose order has seen no terminal event within
    /// `timeout_ms`, cancelling best-effort. Returns the evicted orders.
    pub async fn cleanup_stale_orders(
        &mut self,
        now_ms: i64,
        timeout_ms: i64,
        exchange: &dyn Exchange,
    ) -> Vec<(SlotKey, OpenOrder)> {
        let stale: Vec<SlotKey> = self
            .slots
            .iter()
            .filter(|(_, o)| now_ms - o.placed_ms > timeout_ms)
            .map(|(k, _)| k.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(open) = self.slots.remove(&key) {
                self.by_order.remove(&open.order_id);
                let _ = exchange.cancel_orders(&[open.order_id.clone()]).await;
                evicted.push((key, open));
            }
        }
        evicted
    }

    /// Cancel and clear every open slot (shutdown path).
    pub async fn cancel_all(&mut self, exchange: &dyn Exchange) -> Vec<(SlotKey, OpenOrder)> {
        let ids: Vec<String> = self.slots.values().map(|o| o.order_id.clone()).collect();
        if !ids.is_empty() {
            let _ = exchange.cancel_orders(&ids).await;
        }
        self.by_order.clear();
        self.slots.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_helpers::{make_book, make_config, make_intent};
    use crate::types::BookTop;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scriptable exchange double: serves a fixed book and either fills,
    /// rejects, times out, or acks without an id.
    struct MockExchange {
        book: Mutex<Option<BookTop>>,
        reject_with: Mutex<Option<String>>,
        omit_order_id: Mutex<bool>,
        delay_ms: Mutex<u64>,
        placed: Mutex<Vec<PlaceOrderRequest>>,
        cancelled: Mutex<Vec<String>>,
        next_id: AtomicU64,
    }

    impl MockExchange {
        fn new(book: Option<BookTop>) -> Self {
            Self {
                book: Mutex::new(book),
                reject_with: Mutex::new(None),
                omit_order_id: Mutex::new(false),
                delay_ms: Mutex::new(0),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        async fn place_order(
            &self,
            req: PlaceOrderRequest,
        ) -> anyhow::Result<PlaceOrderResponse> {
            let delay = *self.delay_ms.lock();
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.placed.lock().push(req.clone());
            if let Some(err) = self.reject_with.lock().clone() {
                return Ok(PlaceOrderResponse {
                    success: false,
                    error: Some(err),
                    ..Default::default()
                });
            }
            let order_id = if *self.omit_order_id.lock() {
                None
            } else {
                Some(format!("ord-{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
            };
            Ok(PlaceOrderResponse {
                success: true,
                order_id,
                avg_price: Some(req.price),
                filled_size: Some(req.size),
                error: None,
            })
        }

        async fn cancel_orders(&self, order_ids: &[String]) -> anyhow::Result<()> {
            self.cancelled.lock().extend(order_ids.iter().cloned());
            Ok(())
        }

        async fn get_book(&self, _token_id: &str) -> anyhow::Result<Option<BookTop>> {
            Ok(*self.book.lock())
        }
    }

    fn entry_intent(id: u64, price: f64) -> Intent {
        let mut i = make_intent(id, "m1", IntentType::Entry, 0);
        i.price = price;
        i
    }

    /// Scenario: Happy path; fresh book {0.42/0.45}, BUY intent at 0.44.
    /// Expected: Order placed at 0.44; slot bound to the returned id.
    #[tokio::test]
    async fn test_place_limit_happy_path() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        let placed = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap();
        assert!((placed.price - 0.44).abs() < 1e-10);
        assert!(adapter.slot_occupied("m1", "up-tok", IntentType::Entry));
        assert_eq!(
            adapter.slot_for_order(&placed.order_id),
            Some(&("m1".to_string(), "up-tok".to_string(), IntentType::Entry))
        );
    }

    /// Scenario: Two ENTRY intents for the same (market, UP, ENTRY) slot
    /// submitted back to back.
    /// Expected: The first wins the slot; the second returns ORDER_IN_FLIGHT
    /// and never reaches the exchange.
    #[tokio::test]
    async fn test_single_slot_lockout() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap();
        let second = adapter.place_limit(&entry_intent(2, 0.43), &ex, 1_000).await;
        assert!(matches!(second, Err(ExecError::OrderInFlight)));
        assert_eq!(ex.placed.lock().len(), 1, "second order never submitted");
    }

    /// Scenario: Same market and token but a HEDGE intent while an ENTRY
    /// order is open.
    /// Expected: Distinct slot; both orders placed.
    #[tokio::test]
    async fn test_slots_keyed_by_intent_type() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap();
        let mut hedge = make_intent(2, "m1", IntentType::Hedge, 0);
        hedge.price = 0.43;
        adapter.place_limit(&hedge, &ex, 1_000).await.unwrap();
        assert_eq!(adapter.open_orders(), 2);
    }

    /// Scenario: Fill event for the bound order id.
    /// Expected: on_order_complete clears the slot; the next intent for the
    /// same slot is accepted.
    #[tokio::test]
    async fn test_fill_releases_slot() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        let placed = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap();
        let key = adapter.on_order_complete(&placed.order_id).unwrap();
        assert_eq!(key.2, IntentType::Entry);
        assert_eq!(adapter.open_orders(), 0);

        adapter
            .place_limit(&entry_intent(2, 0.44), &ex, 1_000)
            .await
            .unwrap();
    }

    /// Scenario: Requested BUY at 0.50 against ask 0.45 (would cross).
    /// Expected: NO_CROSSING_BUY from the last-mile guard; nothing submitted;
    /// not classified as an exchange failure.
    #[tokio::test]
    async fn test_last_mile_no_crossing() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        let err = adapter
            .place_limit(&entry_intent(1, 0.50), &ex, 1_000)
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::NoCrossingBuy);
        assert!(!err.is_exchange_failure());
        assert!(ex.placed.lock().is_empty());
        assert_eq!(adapter.open_orders(), 0);
    }

    /// Scenario: Book fetched at submit time is 600ms old (max 500ms).
    /// Expected: STALE_BOOK; slot stays free.
    #[tokio::test]
    async fn test_last_mile_stale_book() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        let err = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_600)
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::StaleBook);
    }

    /// Scenario: Venue has no book for the token; then an empty token id.
    /// Expected: NO_BOOK and TOKEN_NOT_FOUND respectively.
    #[tokio::test]
    async fn test_missing_book_and_token() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(None);

        let err = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::NoBook);

        let mut no_token = entry_intent(2, 0.44);
        no_token.token_id = String::new();
        let err = adapter.place_limit(&no_token, &ex, 1_000).await.unwrap_err();
        assert_eq!(err, ExecError::TokenNotFound);
    }

    /// Scenario: Exchange rejects the order with an error string.
    /// Expected: ExecError::Exchange carrying the venue message; counts as an
    /// exchange failure for the breaker.
    #[tokio::test]
    async fn test_exchange_rejection() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));
        *ex.reject_with.lock() = Some("not enough balance".to_string());

        let err = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Exchange(ref m) if m.contains("balance")));
        assert!(err.is_exchange_failure());
        assert_eq!(adapter.open_orders(), 0);
    }

    /// Scenario: Venue acks success but omits the order id.
    /// Expected: Treated as a failure; the slot is not bound.
    #[tokio::test]
    async fn test_success_without_order_id_is_failure() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));
        *ex.omit_order_id.lock() = true;

        let err = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Exchange(_)));
        assert_eq!(adapter.open_orders(), 0);
    }

    /// Scenario: Exchange hangs past the configured hard timeout.
    /// Expected: TIMEOUT failure; slot stays free for cleanup.
    #[tokio::test]
    async fn test_place_timeout() {
        let mut config = make_config();
        config.order_timeout_ms = 10;
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));
        *ex.delay_ms.lock() = 100;

        let err = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::Timeout);
        assert!(err.is_exchange_failure());
        assert_eq!(adapter.open_orders(), 0);
    }

    /// Scenario: cancel_intent on an occupied slot, then on a free one.
    /// Expected: The open order is cancelled at the venue and the slot
    /// cleared; the free slot returns None.
    #[tokio::test]
    async fn test_cancel_intent() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        let placed = adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap();
        let cancelled = adapter
            .cancel_intent("m1", "up-tok", IntentType::Entry, &ex)
            .await;
        assert_eq!(cancelled, Some(placed.order_id.clone()));
        assert_eq!(ex.cancelled.lock().as_slice(), &[placed.order_id]);
        assert_eq!(adapter.open_orders(), 0);

        assert!(adapter
            .cancel_intent("m1", "up-tok", IntentType::Entry, &ex)
            .await
            .is_none());
    }

    /// Scenario: Two orders placed at t=1s; cleanup at t=50s with a 45s slot
    /// timeout.
    /// Expected: Both evicted and cancelled best-effort.
    #[tokio::test]
    async fn test_cleanup_stale_orders() {
        let config = make_config();
        let mut adapter = ExecutionAdapter::new(&config);
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        adapter
            .place_limit(&entry_intent(1, 0.44), &ex, 1_000)
            .await
            .unwrap();
        let mut hedge = make_intent(2, "m1", IntentType::Hedge, 0);
        hedge.price = 0.43;
        adapter.place_limit(&hedge, &ex, 1_000).await.unwrap();

        let evicted = adapter.cleanup_stale_orders(50_000, 45_000, &ex).await;
        assert_eq!(evicted.len(), 2);
        assert_eq!(adapter.open_orders(), 0);
        assert_eq!(ex.cancelled.lock().len(), 2);
    }

    /// Scenario: Every placement failure variant classified.
    /// Expected: Timeout and venue errors are Exchange (breaker-fed); the
    /// six invariant violations map to their ACTION_SKIPPED codes.
    #[test]
    fn test_failure_classification() {
        assert_eq!(ExecError::Timeout.classify(), FailureClass::Exchange);
        assert_eq!(
            ExecError::Exchange("rejected".into()).classify(),
            FailureClass::Exchange
        );
        assert_eq!(
            ExecError::OrderInFlight.classify(),
            FailureClass::Invariant(SkipReason::RateLimit)
        );
        assert_eq!(
            ExecError::TokenNotFound.classify(),
            FailureClass::Invariant(SkipReason::NoOrderbook)
        );
        assert_eq!(
            ExecError::NoBook.classify(),
            FailureClass::Invariant(SkipReason::NoOrderbook)
        );
        assert_eq!(
            ExecError::InvalidBook.classify(),
            FailureClass::Invariant(SkipReason::NoOrderbook)
        );
        assert_eq!(
            ExecError::StaleBook.classify(),
            FailureClass::Invariant(SkipReason::StaleMarket)
        );
        assert_eq!(
            ExecError::NoCrossingBuy.classify(),
            FailureClass::Invariant(SkipReason::NoDepth)
        );
        assert_eq!(
            ExecError::NoCrossingSell.classify(),
            FailureClass::Invariant(SkipReason::NoDepth)
        );
        assert_eq!(
            ExecError::RawNan.classify(),
            FailureClass::Invariant(SkipReason::NoDepth)
        );
    }

    /// Scenario: Marketable UNWIND intent inside the armed emergency window,
    /// priced 2 ticks through the ask, against a stale book.
    /// Expected: Accepted via the emergency path (staleness waived, bounded
    /// crossing allowed) and submitted fill-or-kill.
    #[tokio::test]
    async fn test_emergency_path_for_marketable_unwind() {
        let mut config = make_config();
        config.allow_emergency_exit = true;
        let mut adapter = ExecutionAdapter::new(&config);
        // Book 10s old; normal path would reject STALE_BOOK
        let ex = MockExchange::new(Some(make_book(Some(0.42), Some(0.45), 1_000)));

        let mut unwind = make_intent(1, "m1", IntentType::Unwind, 0);
        unwind.price = 0.47;
        unwind.marketable = true;
        unwind.market_end_ms = 20_000; // 9s to expiry at now=11_000 → inside window

        let placed = adapter.place_limit(&unwind, &ex, 11_000).await.unwrap();
        assert!((placed.price - 0.47).abs() < 1e-10);
        let reqs = ex.placed.lock();
        assert_eq!(reqs[0].order_type, OrderType::Fok);
    }
}
