//! Per-market inventory accounting.
//!
//! Tracks shares and invested USDC per outcome side, derives the unpaired
//! imbalance, its notional and age, and the risk score that gates
//! degraded mode. The owning controller is the only writer; fills are
//! applied strictly before the next intent-builder pass.

use crate::config::Config;
use crate::types::{Side, Snapshot};

/// Shares below this are treated as zero; fill quantities are decimal
/// share counts and accumulate float dust.
const SHARE_EPS: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DegradedChange {
    Entered,
    Exited,
}

#[derive(Clone, Debug)]
pub struct Inventory {
    pub market_id: String,

    pub up_shares: f64,
    pub down_shares: f64,
    pub up_invested: f64,
    pub down_invested: f64,

    /// When the unpaired imbalance last returned to zero. Initialized to
    /// market open so the first one-sided fill ages from a sane anchor.
    pub last_paired_ms: i64,
    pub first_fill_ms: i64,
    pub last_fill_ms: i64,
    pub fills: u32,

    pub degraded: bool,

    // Derived by recalc_risk; read by the intent builder.
    pub unpaired_shares: f64,
    pub unpaired_notional: f64,
    pub unpaired_age_sec: f64,
    pub risk_score: f64,
}

impl Inventory {
    pub fn new(market_id: impl Into<String>, open_ms: i64) -> Self {
        Self {
            market_id: market_id.into(),
            up_shares: 0.0,
            down_shares: 0.0,
            up_invested: 0.0,
            down_invested: 0.0,
            last_paired_ms: open_ms,
            first_fill_ms: 0,
            last_fill_ms: 0,
            fills: 0,
            degraded: false,
            unpaired_shares: 0.0,
            unpaired_notional: 0.0,
            unpaired_age_sec: 0.0,
            risk_score: 0.0,
        }
    }

    #[inline]
    pub fn shares(&self, side: Side) -> f64 {
        match side {
            Side::Up => self.up_shares,
            Side::Down => self.down_shares,
        }
    }

    #[inline]
    pub fn invested(&self, side: Side) -> f64 {
        match side {
            Side::Up => self.up_invested,
            Side::Down => self.down_invested,
        }
    }

    /// Average cost per share for one side; 0 when flat on that side.
    #[inline]
    pub fn avg_cost(&self, side: Side) -> f64 {
        let s = self.shares(side);
        if s > SHARE_EPS {
            self.invested(side) / s
        } else {
            0.0
        }
    }

    #[inline]
    pub fn total_invested(&self) -> f64 {
        self.up_invested + self.down_invested
    }

    #[inline]
    pub fn paired_shares(&self) -> f64 {
        self.up_shares.min(self.down_shares)
    }

    #[inline]
    pub fn is_flat(&self) -> bool {
        self.up_shares <= SHARE_EPS && self.down_shares <= SHARE_EPS
    }

    /// Side holding the surplus. None when balanced (including flat).
    pub fn dominant_side(&self) -> Option<Side> {
        let diff = self.up_shares - self.down_shares;
        if diff > SHARE_EPS {
            Some(Side::Up)
        } else if diff < -SHARE_EPS {
            Some(Side::Down)
        } else {
            None
        }
    }

    /// The side that needs buying to restore balance.
    pub fn weak_side(&self) -> Option<Side> {
        self.dominant_side().map(|s| s.opposite())
    }

    /// Apply a fill: shares and invested grow monotonically (the core never
    /// sells), averages are implied, and a fill that restores balance
    /// stamps `last_paired_ms`.
    pub fn update_on_fill(&mut self, side: Side, qty: f64, price: f64, ts_ms: i64) {
        if qty <= 0.0 || price <= 0.0 {
            return;
        }
        let was_unpaired = (self.up_shares - self.down_shares).abs() > SHARE_EPS;

        match side {
            Side::Up => {
                self.up_shares += qty;
                self.up_invested += qty * price;
            }
            Side::Down => {
                self.down_shares += qty;
                self.down_invested += qty * price;
            }
        }

        if self.first_fill_ms == 0 {
            self.first_fill_ms = ts_ms;
        }
        self.last_fill_ms = ts_ms;
        self.fills += 1;

        self.unpaired_shares = (self.up_shares - self.down_shares).abs();
        if was_unpaired && self.unpaired_shares <= SHARE_EPS {
            self.last_paired_ms = ts_ms;
        }
    }

    /// Recompute the unpaired exposure against the current snapshot.
    ///
    /// The dominant side's value is estimated from its book (ask preferred,
    /// then bid, then 0.50); `riskScore = unpairedNotional × unpairedAgeSec`.
    pub fn recalc_risk(&mut self, snap: &Snapshot) {
        self.unpaired_shares = (self.up_shares - self.down_shares).abs();

        if self.unpaired_shares <= SHARE_EPS {
            self.unpaired_shares = 0.0;
            self.unpaired_notional = 0.0;
            self.unpaired_age_sec = 0.0;
            self.risk_score = 0.0;
            return;
        }

        let est = match self.dominant_side() {
            Some(side) => snap
                .book(side)
                .and_then(|b| b.ask.or(b.bid))
                .unwrap_or(0.50),
            None => 0.50,
        };

        self.unpaired_notional = self.unpaired_shares * est;
        self.unpaired_age_sec = ((snap.ts_ms - self.last_paired_ms).max(0)) as f64 / 1000.0;
        self.risk_score = self.unpaired_notional * self.unpaired_age_sec;
    }

    /// Realized pair cost: total invested per paired share. 0 until at
    /// least one full pair exists. Guaranteed profit iff < 1.00.
    pub fn pair_cost(&self) -> f64 {
        let paired = self.paired_shares();
        if paired > SHARE_EPS {
            self.total_invested() / paired
        } else {
            0.0
        }
    }

    /// Forward-looking pair cost: sum of per-side averages. Used for
    /// projections because it prices the *next* pair, not the realized book.
    pub fn average_pair_cost(&self) -> f64 {
        self.avg_cost(Side::Up) + self.avg_cost(Side::Down)
    }

    /// Average pair cost as it would stand after buying `qty` at `price`.
    pub fn project_pair_cost_after_buy(&self, side: Side, qty: f64, price: f64) -> f64 {
        if qty <= 0.0 {
            return self.average_pair_cost();
        }
        let new_shares = self.shares(side) + qty;
        let new_invested = self.invested(side) + qty * price;
        let new_avg = if new_shares > SHARE_EPS {
            new_invested / new_shares
        } else {
            0.0
        };
        new_avg + self.avg_cost(side.opposite())
    }

    /// Degraded-mode hysteresis. Enter when the unpaired exposure is both
    /// large and old, or the risk score alone trips; exit only when the
    /// book is fully paired again (which refreshes the pairing anchor).
    pub fn evaluate_degraded(&mut self, ts_ms: i64, config: &Config) -> Option<DegradedChange> {
        if !self.degraded {
            let trip = (self.unpaired_notional >= config.degraded_trigger_notional
                && self.unpaired_age_sec >= config.degraded_trigger_age_sec)
                || self.risk_score >= config.degraded_risk_score_trigger;
            if trip {
                self.degraded = true;
                return Some(DegradedChange::Entered);
            }
        } else if self.unpaired_shares <= SHARE_EPS {
            self.degraded = false;
            self.last_paired_ms = ts_ms;
            return Some(DegradedChange::Exited);
        }
        None
    }
}
