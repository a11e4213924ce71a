//! Order-book readiness gating.
//!
//! A token is ready when its book exists, quotes at least `min_levels`
//! levels with one side present, and is fresh. Intent-type rules sit on
//! top: entries need both asks, hedges only the hedged side's ask. Gate
//! failures park the intended intent under `(market, intent type)`; parked
//! intents are reconsidered every tick and discarded once a fresh gate
//! passes (the next builder pass re-emits anything still wanted).

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{BookTop, Intent, IntentType, Side, SkipReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum GateFailure {
    #[error("NO_ORDERBOOK")]
    NoOrderbook,
    #[error("NO_LIQUIDITY")]
    NoLiquidity,
    #[error("STALE_DATA")]
    StaleData,
}

impl GateFailure {
    /// Map onto the ACTION_SKIPPED vocabulary.
    pub fn skip_reason(&self) -> SkipReason {
        match self {
            GateFailure::NoOrderbook => SkipReason::NoOrderbook,
            GateFailure::NoLiquidity => SkipReason::NoDepth,
            GateFailure::StaleData => SkipReason::StaleMarket,
        }
    }
}

/// Per-token liveness check.
pub fn token_ready(
    book: Option<&BookTop>,
    now_ms: i64,
    min_levels: u32,
    max_age_ms: i64,
) -> Result<(), GateFailure> {
    let book = book.ok_or(GateFailure::NoOrderbook)?;
    if book.levels < min_levels {
        return Err(GateFailure::NoLiquidity);
    }
    if book.bid.is_none() && book.ask.is_none() {
        return Err(GateFailure::NoLiquidity);
    }
    if book.age_ms(now_ms) > max_age_ms {
        return Err(GateFailure::StaleData);
    }
    Ok(())
}

/// A market is ready iff both tokens are.
pub fn market_ready(
    up: Option<&BookTop>,
    down: Option<&BookTop>,
    now_ms: i64,
    min_levels: u32,
    max_age_ms: i64,
) -> Result<(), GateFailure> {
    token_ready(up, now_ms, min_levels, max_age_ms)?;
    token_ready(down, now_ms, min_levels, max_age_ms)?;
    Ok(())
}

/// Intent-type specific gate, consulted immediately before enqueue.
///
/// ENTRY/ACCUMULATE trade against both books and need both asks quoted.
/// HEDGE/MICRO_HEDGE/UNWIND buy exactly one side and need only that
/// side's book and ask.
pub fn gate_for_intent(
    kind: IntentType,
    side: Side,
    up: Option<&BookTop>,
    down: Option<&BookTop>,
    now_ms: i64,
    min_levels: u32,
    max_age_ms: i64,
) -> Result<(), GateFailure> {
    match kind {
        IntentType::Entry | IntentType::Accumulate => {
            market_ready(up, down, now_ms, min_levels, max_age_ms)?;
            let up_ask = up.and_then(|b| b.ask);
            let down_ask = down.and_then(|b| b.ask);
            if up_ask.is_none() || down_ask.is_none() {
                return Err(GateFailure::NoLiquidity);
            }
            Ok(())
        }
        IntentType::Hedge | IntentType::MicroHedge | IntentType::Unwind => {
            let book = match side {
                Side::Up => up,
                Side::Down => down,
            };
            token_ready(book, now_ms, min_levels, max_age_ms)?;
            if book.and_then(|b| b.ask).is_none() {
                return Err(GateFailure::NoLiquidity);
            }
            Ok(())
        }
    }
}

// ─── Parked intents ───

#[derive(Clone, Debug)]
pub struct ParkedIntent {
    pub intent: Intent,
    pub parked_ms: i64,
    pub retries: u32,
    pub failure: GateFailure,
}

/// Process-wide parked-intent store, owned by the orchestrator and
/// accessed through its handle. Keyed by `(market id, intent type)`; a
/// re-park of the same key replaces the stale intent but keeps counting
/// retries.
#[derive(Default)]
pub struct ParkedIntents {
    map: HashMap<(String, IntentType), ParkedIntent>,
}

impl ParkedIntents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Park (or re-park) an intent. Returns the updated retry count.
    pub fn park(&mut self, intent: Intent, failure: GateFailure, now_ms: i64) -> u32 {
        let key = (intent.market_id.clone(), intent.kind);
        let retries = self.map.get(&key).map_or(0, |p| p.retries) + 1;
        self.map.insert(
            key,
            ParkedIntent {
                intent,
                parked_ms: now_ms,
                retries,
                failure,
            },
        );
        retries
    }

    pub fn get(&self, market_id: &str, kind: IntentType) -> Option<&ParkedIntent> {
        self.map.get(&(market_id.to_string(), kind))
    }

    /// Discard a parked intent once a fresh gate passes for its key.
    pub fn discard(&mut self, market_id: &str, kind: IntentType) -> Option<ParkedIntent> {
        self.map.remove(&(market_id.to_string(), kind))
    }

    /// Intent types currently parked for one market.
    pub fn kinds_for_market(&self, market_id: &str) -> Vec<IntentType> {
        self.map
            .keys()
            .filter(|(m, _)| m == market_id)
            .map(|(_, k)| *k)
            .collect()
    }

    /// Drop everything parked longer than `max_age_ms`. Returns the
    /// expired entries for ACTION_SKIPPED emission.
    pub fn expire(&mut self, now_ms: i64, max_age_ms: i64) -> Vec<ParkedIntent> {
        let expired_keys: Vec<(String, IntentType)> = self
            .map
            .iter()
            .filter(|(_, p)| now_ms - p.parked_ms > max_age_ms)
            .map(|(k, _)| k.clone())
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| self.map.remove(&k))
            .collect()
    }

    /// Drop every parked intent for one market (market teardown).
    pub fn drain_market(&mut self, market_id: &str) -> Vec<ParkedIntent> {
        let keys: Vec<(String, IntentType)> = self
            .map
            .keys()
            .filter(|(m, _)| m == market_id)
            .cloned()
            .collect();
        keys.into_iter().filter_map(|k| self.map.remove(&k)).collect()
    }
}
