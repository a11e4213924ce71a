//! Bounded priority queue for trade intents.
//!
//! Ordering: priority descending, ties broken by intent id ascending (ids
//! are a monotonic creation sequence, so older intents win ties). A
//! per-market index is maintained in lockstep with the global order for
//! the capacity and shedding rules. Protective intents (HEDGE,
//! MICRO_HEDGE, UNWIND) are never rejected; when capacity is exhausted
//! they displace the oldest ENTRY/ACCUMULATE, or over-admit if none exist.

use std::collections::HashMap;

use crate::types::{Intent, IntentType};

/// Outcome of an enqueue attempt. Displaced intents are handed back so the
/// caller can emit ACTION_SKIPPED records; the queue never drops silently.
pub enum Enqueued {
    Admitted { displaced: Vec<Intent> },
    Rejected(Box<Intent>),
}

pub struct IntentQueue {
    items: Vec<Intent>,
    by_market: HashMap<String, Vec<u64>>,
    max_per_market: usize,
    max_global: usize,
    stress_size: usize,
    pub dropped: u64,
    pub processed: u64,
}

impl IntentQueue {
    pub fn new(max_per_market: usize, max_global: usize, stress_size: usize) -> Self {
        Self {
            items: Vec::with_capacity(max_global.min(256)),
            by_market: HashMap::new(),
            max_per_market,
            max_global,
            stress_size,
            dropped: 0,
            processed: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn market_len(&self, market_id: &str) -> usize {
        self.by_market.get(market_id).map_or(0, |v| v.len())
    }

    /// Queue-stress flag: signals upstream to suppress ENTRY/ACCUMULATE.
    #[inline]
    pub fn is_stressed(&self) -> bool {
        self.items.len() >= self.stress_size
    }

    fn resort(&mut self) {
        self.items
            .sort_unstable_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    }

    fn remove_id(&mut self, id: u64) -> Option<Intent> {
        let pos = self.items.iter().position(|i| i.id == id)?;
        let intent = self.items.remove(pos);
        if let Some(ids) = self.by_market.get_mut(&intent.market_id) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                self.by_market.remove(&intent.market_id);
            }
        }
        Some(intent)
    }

    /// Oldest (smallest id) sheddable intent, optionally restricted to one
    /// market. Only ENTRY/ACCUMULATE are sheddable.
    fn oldest_sheddable(&self, market_id: Option<&str>) -> Option<u64> {
        self.items
            .iter()
            .filter(|i| !i.kind.is_protective())
            .filter(|i| market_id.map_or(true, |m| i.market_id == m))
            .min_by_key(|i| i.id)
            .map(|i| i.id)
    }

    /// Admit an intent under the capacity protocol:
    /// per-market cap first (protective intents shed the market's oldest
    /// low-priority intent or over-admit; low-priority intents are
    /// rejected), then the global cap (shed the oldest low-priority intent
    /// anywhere; reject low-priority if none), then insert and re-sort.
    pub fn enqueue(&mut self, intent: Intent) -> Enqueued {
        let mut displaced = Vec::new();

        if self.market_len(&intent.market_id) >= self.max_per_market {
            if intent.kind.is_protective() {
                if let Some(victim) = self.oldest_sheddable(Some(&intent.market_id)) {
                    if let Some(v) = self.remove_id(victim) {
                        self.dropped += 1;
                        displaced.push(v);
                    }
                }
                // No sheddable victim: over-admit; safety intents are
                // never rejected.
            } else {
                self.dropped += 1;
                return Enqueued::Rejected(Box::new(intent));
            }
        }

        if self.items.len() >= self.max_global {
            if let Some(victim) = self.oldest_sheddable(None) {
                if let Some(v) = self.remove_id(victim) {
                    self.dropped += 1;
                    displaced.push(v);
                }
            } else if !intent.kind.is_protective() {
                self.dropped += 1;
                return Enqueued::Rejected(Box::new(intent));
            }
        }

        self.by_market
            .entry(intent.market_id.clone())
            .or_default()
            .push(intent.id);
        self.items.push(intent);
        self.resort();

        Enqueued::Admitted { displaced }
    }

    /// Pop the highest-priority intent (oldest within a priority level).
    pub fn dequeue(&mut self) -> Option<Intent> {
        if self.items.is_empty() {
            return None;
        }
        let intent = self.items.remove(0);
        if let Some(ids) = self.by_market.get_mut(&intent.market_id) {
            ids.retain(|&x| x != intent.id);
            if ids.is_empty() {
                self.by_market.remove(&intent.market_id);
            }
        }
        self.processed += 1;
        Some(intent)
    }

    /// Drop every intent older than `max_age_ms`. Returns the pruned
    /// intents for ACTION_SKIPPED emission.
    pub fn prune_stale(&mut self, now_ms: i64, max_age_ms: i64) -> Vec<Intent> {
        let stale_ids: Vec<u64> = self
            .items
            .iter()
            .filter(|i| i.age_ms(now_ms) > max_age_ms)
            .map(|i| i.id)
            .collect();
        let mut pruned = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(i) = self.remove_id(id) {
                self.dropped += 1;
                pruned.push(i);
            }
        }
        pruned
    }

    /// Drain every queued intent for one market (used at market teardown).
    pub fn drain_market(&mut self, market_id: &str) -> Vec<Intent> {
        let ids: Vec<u64> = self
            .by_market
            .get(market_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.remove_id(id)).collect()
    }
}
