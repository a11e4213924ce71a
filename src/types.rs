use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Assets & Sides ───

/// Underlying reference asset of an Up/Down market.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl Asset {
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "btc" => Some(Asset::Btc),
            "eth" => Some(Asset::Eth),
            "sol" => Some(Asset::Sol),
            "xrp" => Some(Asset::Xrp),
            _ => None,
        }
    }

    /// Uppercase label for display and log paths: "BTC", "ETH", ...
    pub fn label(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Sol => "SOL",
            Asset::Xrp => "XRP",
        }
    }

    /// Lowercase symbol for slugs and stream names.
    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Btc => "btc",
            Asset::Eth => "eth",
            Asset::Sol => "sol",
            Asset::Xrp => "xrp",
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Outcome token side. UP settles to $1.00 when spot ends above strike.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Up => write!(f, "UP"),
            Side::Down => write!(f, "DOWN"),
        }
    }
}

/// Exchange order direction. The core only buys (pairing is done by buying
/// the opposite token), but the guard and gateway handle both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

// ─── Market Info ───

#[derive(Clone, Debug)]
pub struct MarketInfo {
    pub market_id: String,
    pub asset: Asset,
    pub slug: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub strike: f64,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl MarketInfo {
    pub fn token_for(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.up_token_id,
            Side::Down => &self.down_token_id,
        }
    }

    pub fn side_for_token(&self, token_id: &str) -> Option<Side> {
        if token_id == self.up_token_id {
            Some(Side::Up)
        } else if token_id == self.down_token_id {
            Some(Side::Down)
        } else {
            None
        }
    }
}

// ─── Order Book ───

/// Top-of-book view for one outcome token. Prices live in (0, 1); the
/// exchange guarantees bid < ask when both are present, but the guard
/// re-checks because we also build these from raw websocket snapshots.
#[derive(Clone, Copy, Debug, Default)]
pub struct BookTop {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_size: f64,
    pub ask_size: f64,
    pub levels: u32,
    pub ts_ms: i64,
}

impl BookTop {
    /// Two-sided mid. None unless both sides are quoted.
    #[inline]
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    /// Ask minus bid. None unless both sides are quoted.
    #[inline]
    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// A book is crossed or degenerate when bid >= ask or either quoted
    /// price is outside (0, 1).
    #[inline]
    pub fn is_valid(&self) -> bool {
        if let (Some(b), Some(a)) = (self.bid, self.ask) {
            if b >= a {
                return false;
            }
        }
        for p in [self.bid, self.ask].into_iter().flatten() {
            if !(p > 0.0 && p < 1.0) {
                return false;
            }
        }
        true
    }

    #[inline]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.ts_ms
    }
}

// ─── Feed Events (produced by WS tasks + worker, consumed by controllers) ───

#[derive(Clone, Debug)]
pub struct PriceTick {
    pub asset: Asset,
    pub price: f64,
    pub ts_ms: i64,
}

/// Raw per-token book update. Levels may arrive unordered; consumers
/// normalize (max of bids, min of asks) before deriving a BookTop.
#[derive(Clone, Debug)]
pub struct BookUpdate {
    pub token_id: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub ts_ms: i64,
}

impl BookUpdate {
    /// Collapse the raw levels into a top-of-book view.
    pub fn to_top(&self) -> BookTop {
        let best_bid = self
            .bids
            .iter()
            .filter(|(p, s)| *p > 0.0 && *s > 0.0)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .copied();
        let best_ask = self
            .asks
            .iter()
            .filter(|(p, s)| *p > 0.0 && *s > 0.0)
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .copied();
        BookTop {
            bid: best_bid.map(|(p, _)| p),
            ask: best_ask.map(|(p, _)| p),
            bid_size: best_bid.map_or(0.0, |(_, s)| s),
            ask_size: best_ask.map_or(0.0, |(_, s)| s),
            levels: (self.bids.len() + self.asks.len()) as u32,
            ts_ms: self.ts_ms,
        }
    }
}

/// Raw fill record from the exchange fill stream.
#[derive(Clone, Debug)]
pub struct FillEvent {
    pub order_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub qty: f64,
    pub price: f64,
    pub ts_ms: i64,
}

/// Fill delivered by the exchange fill stream, matched to its intent slot
/// by the execution worker. The owning controller resolves the token back
/// to an outcome side.
#[derive(Clone, Debug)]
pub struct RoutedFill {
    pub order_id: String,
    pub kind: IntentType,
    pub token_id: String,
    pub qty: f64,
    pub price: f64,
    pub ts_ms: i64,
}

/// Placement acknowledgement from the execution worker. Drives the
/// HAS_ENTRY → HEDGE_IN_PROGRESS transition ("hedge placed").
#[derive(Clone, Debug)]
pub struct OrderPlaced {
    pub order_id: String,
    pub kind: IntentType,
    pub side: Side,
    pub price: f64,
    pub shares: f64,
    pub ts_ms: i64,
}

pub enum FeedEvent {
    Price(PriceTick),
    Book(BookUpdate),
    Fill(RoutedFill),
    Placed(OrderPlaced),
    Tick,
}

// ─── Snapshot ───

/// Point-in-time combined view of one market. Produced on every book or
/// price event, consumed by the intent builder, then discarded.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub market_id: String,
    pub asset: Asset,
    pub ts_ms: i64,
    pub secs_to_expiry: f64,
    pub strike: f64,
    pub spot: f64,
    pub up: Option<BookTop>,
    pub down: Option<BookTop>,
    pub ready_up: bool,
    pub ready_down: bool,
    pub queue_len: usize,
    pub queue_stressed: bool,
}

impl Snapshot {
    #[inline]
    pub fn book(&self, side: Side) -> Option<&BookTop> {
        match side {
            Side::Up => self.up.as_ref(),
            Side::Down => self.down.as_ref(),
        }
    }

    #[inline]
    pub fn ready(&self, side: Side) -> bool {
        match side {
            Side::Up => self.ready_up,
            Side::Down => self.ready_down,
        }
    }

    /// |spot − strike|.
    #[inline]
    pub fn delta_abs(&self) -> f64 {
        (self.spot - self.strike).abs()
    }
}

// ─── Intents ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    Entry,
    Accumulate,
    Hedge,
    MicroHedge,
    Unwind,
}

impl IntentType {
    /// Base priority before hedge-mode boosts. Higher is more urgent.
    /// UNWIND outranks everything because it is the last chance to flatten
    /// before settlement.
    pub fn base_priority(&self) -> i32 {
        match self {
            IntentType::Entry => 10,
            IntentType::Accumulate => 15,
            IntentType::MicroHedge => 60,
            IntentType::Hedge => 80,
            IntentType::Unwind => 90,
        }
    }

    /// Protective intents are never shed from the queue and bypass the
    /// open circuit breaker.
    pub fn is_protective(&self) -> bool {
        matches!(
            self,
            IntentType::Hedge | IntentType::MicroHedge | IntentType::Unwind
        )
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentType::Entry => write!(f, "ENTRY"),
            IntentType::Accumulate => write!(f, "ACCUMULATE"),
            IntentType::Hedge => write!(f, "HEDGE"),
            IntentType::MicroHedge => write!(f, "MICRO_HEDGE"),
            IntentType::Unwind => write!(f, "UNWIND"),
        }
    }
}

/// A fully-specified trade intent. Value type, moved through the queue to
/// the execution worker; never shared.
#[derive(Clone, Debug)]
pub struct Intent {
    pub id: u64,
    pub created_ms: i64,
    pub correlation_id: Uuid,
    pub market_id: String,
    pub asset: Asset,
    pub kind: IntentType,
    pub side: Side,
    pub token_id: String,
    pub shares: f64,
    pub price: f64,
    pub marketable: bool,
    pub reason: String,
    pub priority: i32,
    /// Market end timestamp, carried so the last-mile check can decide
    /// whether the emergency-cross path applies without a market lookup.
    pub market_end_ms: i64,
}

impl Intent {
    #[inline]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_ms
    }

    #[inline]
    pub fn secs_to_expiry(&self, now_ms: i64) -> f64 {
        ((self.market_end_ms - now_ms).max(0)) as f64 / 1000.0
    }

    #[inline]
    pub fn notional(&self) -> f64 {
        self.shares * self.price
    }
}

// ─── Market state machine ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketPhase {
    Idle,
    HasEntry,
    HedgeInProgress,
    Done,
}

// ─── Skip reasons (event-sink vocabulary) ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    NoOrderbook,
    Cooldown,
    QueueStress,
    Funds,
    NoDepth,
    PairCost,
    DegradedMode,
    RateLimit,
    StaleMarket,
    TooLate,
    MinEdge,
    CircuitOpen,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::NoOrderbook => "NO_ORDERBOOK",
            SkipReason::Cooldown => "COOLDOWN",
            SkipReason::QueueStress => "QUEUE_STRESS",
            SkipReason::Funds => "FUNDS",
            SkipReason::NoDepth => "NO_DEPTH",
            SkipReason::PairCost => "PAIR_COST",
            SkipReason::DegradedMode => "DEGRADED_MODE",
            SkipReason::RateLimit => "RATE_LIMIT",
            SkipReason::StaleMarket => "STALE_MARKET",
            SkipReason::TooLate => "TOO_LATE",
            SkipReason::MinEdge => "MIN_EDGE",
            SkipReason::CircuitOpen => "CIRCUIT_OPEN",
        };
        write!(f, "{}", s)
    }
}

// ─── Event sink (append-only stream, consumed by telemetry writer) ───

/// Every decision and outcome the system produces, as an append-only
/// record. One JSON object per line in the event log. Order activity is
/// never dropped; telemetry backpressure may shed SNAPSHOT records only.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    Snapshot {
        ts_ms: i64,
        market_id: String,
        asset: Asset,
        secs_to_expiry: f64,
        spot: f64,
        strike: f64,
        up_bid: Option<f64>,
        up_ask: Option<f64>,
        down_bid: Option<f64>,
        down_ask: Option<f64>,
        ready_up: bool,
        ready_down: bool,
        queue_len: usize,
    },
    Inventory {
        ts_ms: i64,
        market_id: String,
        up_shares: f64,
        down_shares: f64,
        up_invested: f64,
        down_invested: f64,
        unpaired_shares: f64,
        unpaired_notional: f64,
        unpaired_age_sec: f64,
        risk_score: f64,
        pair_cost: f64,
        degraded: bool,
    },
    IntentCreated {
        ts_ms: i64,
        market_id: String,
        correlation_id: Uuid,
        intent_id: u64,
        kind: IntentType,
        side: Side,
        shares: f64,
        price: f64,
        priority: i32,
        reason: String,
    },
    OrderSubmitted {
        ts_ms: i64,
        market_id: String,
        correlation_id: Uuid,
        kind: IntentType,
        side: Side,
        token_id: String,
        shares: f64,
        price: f64,
    },
    OrderAck {
        ts_ms: i64,
        market_id: String,
        correlation_id: Uuid,
        order_id: String,
        latency_ms: f64,
    },
    OrderFail {
        ts_ms: i64,
        market_id: String,
        correlation_id: Uuid,
        kind: IntentType,
        error: String,
    },
    OrderCancel {
        ts_ms: i64,
        market_id: String,
        order_id: String,
        reason: String,
    },
    Fill {
        ts_ms: i64,
        market_id: String,
        order_id: String,
        kind: IntentType,
        side: Side,
        qty: f64,
        price: f64,
    },
    DegradedModeEnter {
        ts_ms: i64,
        market_id: String,
        unpaired_notional: f64,
        unpaired_age_sec: f64,
        risk_score: f64,
    },
    DegradedModeExit {
        ts_ms: i64,
        market_id: String,
    },
    CircuitBreakerEnter {
        ts_ms: i64,
        failures_in_window: usize,
    },
    CircuitBreakerExit {
        ts_ms: i64,
        open_for_ms: i64,
    },
    ActionSkipped {
        ts_ms: i64,
        market_id: String,
        correlation_id: Option<Uuid>,
        intent_type: Option<IntentType>,
        reason: SkipReason,
        detail: String,
    },
}
