//! Intent construction.
//!
//! Pure function of `(snapshot, inventory, phase, fair, pending)`; no
//! I/O, no mutation, no clocks. Re-running with unchanged inputs yields
//! the same drafts; identity (ids, correlation, timestamps) is stamped by
//! the controller at materialization. Everything the builder declines to
//! do is returned as a skip record so the event stream documents it.

use crate::config::{asset_params, Config};
use crate::engine::inventory::Inventory;
use crate::types::{Asset, IntentType, MarketPhase, Side, SkipReason, Snapshot};

// ─── Delta regime ───

/// How far spot has run from the strike, in asset-calibrated terms. The
/// regime parameterizes hedge urgency and whether entries are permitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaRegime {
    Low,
    Mid,
    High,
}

pub fn delta_regime(asset: Asset, delta_abs: f64) -> DeltaRegime {
    let p = asset_params(asset);
    if delta_abs < p.regime_low_usd {
        DeltaRegime::Low
    } else if delta_abs < p.regime_high_usd {
        DeltaRegime::Mid
    } else {
        DeltaRegime::High
    }
}

// ─── Hedge mode ───

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HedgeMode {
    Normal,
    Survival,
    HighDeltaCritical,
    Panic,
}

impl HedgeMode {
    /// Priority boost applied to hedge-class intents.
    pub fn priority_boost(&self) -> i32 {
        match self {
            HedgeMode::Normal => 0,
            HedgeMode::Survival => 20,
            HedgeMode::HighDeltaCritical => 20,
            HedgeMode::Panic => 40,
        }
    }
}

pub fn hedge_mode(regime: DeltaRegime, secs_to_expiry: f64, deadline_sec: f64) -> HedgeMode {
    match regime {
        DeltaRegime::Low => HedgeMode::Normal,
        DeltaRegime::Mid => HedgeMode::Survival,
        DeltaRegime::High => {
            if secs_to_expiry <= deadline_sec * 2.0 {
                HedgeMode::Panic
            } else {
                HedgeMode::HighDeltaCritical
            }
        }
    }
}

// ─── Bot state ───

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BotState {
    Flat,
    OneSided,
    Hedged,
    Skewed,
    DeepDislocation,
    Unwind,
}

pub fn bot_state(inv: &Inventory, snap: &Snapshot, config: &Config) -> BotState {
    if snap.secs_to_expiry <= config.deadline_sec_remaining {
        return BotState::Unwind;
    }
    if inv.risk_score >= config.degraded_risk_score_trigger {
        return BotState::DeepDislocation;
    }
    if inv.is_flat() {
        return BotState::Flat;
    }
    let has_up = inv.up_shares > 1e-9;
    let has_down = inv.down_shares > 1e-9;
    if has_up != has_down {
        BotState::OneSided
    } else if inv.unpaired_shares <= 1e-9 {
        BotState::Hedged
    } else {
        BotState::Skewed
    }
}

// ─── Micro-hedge accumulator ───

/// Small-fill accumulator. Owned and mutated by the controller; the
/// builder only reads it. Sub-threshold imbalances pool here until they
/// are worth a MICRO_HEDGE; a cooldown throttles retries.
#[derive(Clone, Debug, Default)]
pub struct HedgePending {
    pub pending_shares: f64,
    pub cooldown_until_ms: i64,
    pub retries: u32,
}

impl HedgePending {
    /// Mirror the current sub-threshold imbalance.
    pub fn note_unpaired(&mut self, unpaired: f64) {
        self.pending_shares = unpaired;
    }

    /// A MICRO_HEDGE was emitted: start the cooldown, count the retry.
    pub fn on_emitted(&mut self, now_ms: i64, cooldown_ms: i64) {
        self.cooldown_until_ms = now_ms + cooldown_ms;
        self.retries += 1;
    }

    /// A fill restored balance: clear pending shares and reset retry state.
    pub fn on_paired(&mut self) {
        *self = HedgePending::default();
    }
}

// ─── Builder output ───

/// Draft intent: everything but identity.
#[derive(Clone, Debug)]
pub struct IntentDraft {
    pub kind: IntentType,
    pub side: Side,
    pub shares: f64,
    pub price: f64,
    pub marketable: bool,
    pub reason: String,
    pub priority: i32,
}

#[derive(Clone, Debug)]
pub struct Skip {
    pub kind: IntentType,
    pub reason: SkipReason,
    pub detail: String,
}

#[derive(Default)]
pub struct BuildOutcome {
    pub intents: Vec<IntentDraft>,
    pub skips: Vec<Skip>,
}

impl BuildOutcome {
    fn skip(&mut self, kind: IntentType, reason: SkipReason, detail: impl Into<String>) {
        self.skips.push(Skip {
            kind,
            reason,
            detail: detail.into(),
        });
    }
}

pub struct BuildInput<'a> {
    pub snap: &'a Snapshot,
    pub inv: &'a Inventory,
    pub phase: MarketPhase,
    /// Trusted fair UP for this snapshot's cell, if any.
    pub fair_up: Option<f64>,
    pub pending: &'a HedgePending,
    /// Markets currently live for this asset (concurrency cap input).
    pub open_markets_for_asset: usize,
}

// ─── Builder ───

/// Evaluate one snapshot into zero or more intent drafts.
pub fn build(input: &BuildInput<'_>, config: &Config) -> BuildOutcome {
    let mut out = BuildOutcome::default();
    let snap = input.snap;
    let inv = input.inv;

    if input.phase == MarketPhase::Done {
        return out;
    }

    let state = bot_state(inv, snap, config);
    let regime = delta_regime(snap.asset, snap.delta_abs());
    let mode = hedge_mode(regime, snap.secs_to_expiry, config.deadline_sec_remaining);

    match state {
        BotState::Unwind => {
            build_unwind(&mut out, input, config);
        }
        BotState::DeepDislocation => {
            // Fast exit: defensive hedges only.
            build_hedge(&mut out, input, mode, config);
        }
        BotState::OneSided | BotState::Skewed => {
            build_hedge(&mut out, input, mode, config);
        }
        BotState::Flat => {
            build_entry(&mut out, input, IntentType::Entry, regime, config);
        }
        BotState::Hedged => {
            build_entry(&mut out, input, IntentType::Accumulate, regime, config);
        }
    }

    out
}

/// Entry rules: nine gates, each with a documented skip on failure.
fn build_entry(
    out: &mut BuildOutcome,
    input: &BuildInput<'_>,
    kind: IntentType,
    regime: DeltaRegime,
    config: &Config,
) {
    let snap = input.snap;
    let inv = input.inv;

    if !(snap.ready_up && snap.ready_down) {
        out.skip(kind, SkipReason::NoOrderbook, "market not ready");
        return;
    }
    if inv.degraded {
        out.skip(kind, SkipReason::DegradedMode, "degraded mode blocks entries");
        return;
    }
    if snap.queue_stressed {
        out.skip(kind, SkipReason::QueueStress, "intent queue stressed");
        return;
    }
    if regime == DeltaRegime::High {
        out.skip(kind, SkipReason::TooLate, "high delta regime blocks entries");
        return;
    }
    if snap.secs_to_expiry < config.min_sec_remaining {
        out.skip(
            kind,
            SkipReason::TooLate,
            format!("{:.0}s to expiry", snap.secs_to_expiry),
        );
        return;
    }
    if snap.secs_to_expiry > config.max_sec_remaining {
        out.skip(
            kind,
            SkipReason::TooLate,
            format!("window not mature ({:.0}s left)", snap.secs_to_expiry),
        );
        return;
    }
    if input.open_markets_for_asset > config.max_concurrent_markets_per_asset {
        out.skip(
            kind,
            SkipReason::RateLimit,
            format!("{} markets live for asset", input.open_markets_for_asset),
        );
        return;
    }

    let (up_ask, down_ask) = match (
        snap.up.as_ref().and_then(|b| b.ask),
        snap.down.as_ref().and_then(|b| b.ask),
    ) {
        (Some(u), Some(d)) => (u, d),
        _ => {
            out.skip(kind, SkipReason::NoDepth, "ask missing on one side");
            return;
        }
    };

    let Some(fair_up) = input.fair_up else {
        out.skip(kind, SkipReason::MinEdge, "no trusted fair");
        return;
    };

    // Edge on each side; buy the cheaper one.
    let edge_up = fair_up - up_ask;
    let edge_down = (1.0 - fair_up) - down_ask;
    let (side, ask, edge) = if edge_up >= edge_down {
        (Side::Up, up_ask, edge_up)
    } else {
        (Side::Down, down_ask, edge_down)
    };

    if edge < config.edge_entry_min {
        out.skip(
            kind,
            SkipReason::MinEdge,
            format!("edge {:.3} < {:.3}", edge, config.edge_entry_min),
        );
        return;
    }

    let book = snap.book(side);
    let spread = book.and_then(|b| b.spread());
    match spread {
        Some(s) if s <= config.max_spread => {}
        _ => {
            out.skip(kind, SkipReason::NoDepth, "spread too wide");
            return;
        }
    }
    let top_size = book.map_or(0.0, |b| b.ask_size);
    if top_size < config.min_depth {
        out.skip(
            kind,
            SkipReason::NoDepth,
            format!("top size {:.0} < {:.0}", top_size, config.min_depth),
        );
        return;
    }

    let price = ask - config.tick;
    if price <= 0.0 {
        out.skip(kind, SkipReason::MinEdge, "ask at tick floor");
        return;
    }

    let remaining = config.max_notional_usd_per_market - inv.total_invested();
    let budget_shares = if price > 0.0 { remaining / price } else { 0.0 };
    let shares = config
        .base_shares
        .min(config.max_shares)
        .min(budget_shares);
    if shares < 1.0 {
        out.skip(
            kind,
            SkipReason::Funds,
            format!("${:.2} notional remaining", remaining.max(0.0)),
        );
        return;
    }

    out.intents.push(IntentDraft {
        kind,
        side,
        shares,
        price,
        marketable: false,
        reason: format!("edge {:.3} on {} at ask {:.2}", edge, side, ask),
        priority: kind.base_priority(),
    });
}

/// Hedge rules: restore pair balance on the weak side. Imbalances below
/// the hedge floor pool in the micro-hedge accumulator.
fn build_hedge(
    out: &mut BuildOutcome,
    input: &BuildInput<'_>,
    mode: HedgeMode,
    config: &Config,
) {
    let snap = input.snap;
    let inv = input.inv;

    let unpaired = inv.unpaired_shares;
    if unpaired <= 1e-9 {
        return;
    }
    let Some(weak) = inv.weak_side() else {
        return;
    };

    let ask = snap.book(weak).and_then(|b| b.ask);

    if unpaired >= config.hedge_min_shares {
        let shares = (unpaired * config.hedge_ratio).min(config.hedge_max_shares);
        // Maker-first at the touch, capped by the worst acceptable ask.
        let price = match ask {
            Some(a) => (a - config.tick).min(config.max_opp_ask),
            // Book not usable yet; draft at the cap and let the gate
            // park it until the side quotes.
            None => config.max_opp_ask,
        };
        if price <= 0.0 {
            out.skip(IntentType::Hedge, SkipReason::NoDepth, "ask at tick floor");
            return;
        }

        // The projection veto needs a real quote; the placeholder price of
        // a bookless side parks at the gate instead.
        if ask.is_some() {
            let projected = inv.project_pair_cost_after_buy(weak, shares, price);
            if projected > config.max_cpp_approx {
                out.skip(
                    IntentType::Hedge,
                    SkipReason::PairCost,
                    format!(
                        "projected pair cost {:.3} > {:.2}",
                        projected, config.max_cpp_approx
                    ),
                );
                return;
            }
        }

        out.intents.push(IntentDraft {
            kind: IntentType::Hedge,
            side: weak,
            shares,
            price,
            marketable: false,
            reason: format!("pair {:.1} unpaired shares ({:?})", unpaired, mode),
            priority: IntentType::Hedge.base_priority() + mode.priority_boost(),
        });
        return;
    }

    // Sub-threshold: micro-hedge once enough dust has pooled.
    let pending = input.pending;
    if pending.pending_shares < config.micro_hedge_min_shares {
        return;
    }
    if snap.ts_ms < pending.cooldown_until_ms {
        out.skip(
            IntentType::MicroHedge,
            SkipReason::Cooldown,
            format!("cooldown for {}ms", pending.cooldown_until_ms - snap.ts_ms),
        );
        return;
    }

    let price = match ask {
        Some(a) => (a - config.tick).min(config.max_opp_ask),
        None => config.max_opp_ask,
    };
    if price <= 0.0 {
        out.skip(IntentType::MicroHedge, SkipReason::NoDepth, "ask at tick floor");
        return;
    }
    let shares = pending.pending_shares;
    if ask.is_some() {
        let projected = inv.project_pair_cost_after_buy(weak, shares, price);
        if projected > config.max_cpp_approx {
            out.skip(
                IntentType::MicroHedge,
                SkipReason::PairCost,
                format!(
                    "projected pair cost {:.3} > {:.2}",
                    projected, config.max_cpp_approx
                ),
            );
            return;
        }
    }

    out.intents.push(IntentDraft {
        kind: IntentType::MicroHedge,
        side: weak,
        shares,
        price,
        marketable: false,
        reason: format!("micro-hedge {:.1} pooled shares", shares),
        priority: IntentType::MicroHedge.base_priority() + mode.priority_boost(),
    });
}

/// Unwind rules: inside the deadline window, flatten the imbalance by
/// buying the weak side. With the emergency exit armed and the market in
/// its final seconds the draft is marketable and priced through the touch.
fn build_unwind(out: &mut BuildOutcome, input: &BuildInput<'_>, config: &Config) {
    let snap = input.snap;
    let inv = input.inv;

    if inv.unpaired_shares <= 1e-9 {
        // Fully paired books ride to settlement.
        return;
    }
    let Some(weak) = inv.weak_side() else {
        return;
    };

    let ask = snap.book(weak).and_then(|b| b.ask);
    let emergency = config.allow_emergency_exit
        && snap.secs_to_expiry <= config.emergency_exit_sec_remaining;

    let price = match ask {
        Some(a) if emergency => {
            (a + config.emergency_cross_ticks as f64 * config.tick).min(1.0 - config.tick)
        }
        Some(a) => (a - config.tick).max(config.tick),
        None => snap
            .book(weak)
            .and_then(|b| b.bid)
            .map(|b| b + config.tick)
            .unwrap_or(0.50),
    };

    out.intents.push(IntentDraft {
        kind: IntentType::Unwind,
        side: weak,
        shares: inv.unpaired_shares,
        price,
        marketable: emergency,
        reason: format!(
            "flatten {:.1} unpaired with {:.0}s left",
            inv.unpaired_shares, snap.secs_to_expiry
        ),
        priority: IntentType::Unwind.base_priority(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_helpers::{make_config, make_snapshot};

    fn flat_inventory() -> Inventory {
        Inventory::new("m1", 0)
    }

    fn build_with(
        snap: &Snapshot,
        inv: &Inventory,
        fair_up: Option<f64>,
        pending: &HedgePending,
        config: &Config,
    ) -> BuildOutcome {
        build(
            &BuildInput {
                snap,
                inv,
                phase: MarketPhase::Idle,
                fair_up,
                pending,
                open_markets_for_asset: 1,
            },
            config,
        )
    }

    fn skip_reasons(out: &BuildOutcome) -> Vec<SkipReason> {
        out.skips.iter().map(|s| s.reason).collect()
    }

    // ── delta regime ──

    /// Scenario: BTC deltas below, inside, and above the $30/$120 thresholds.
    /// Expected: LOW < $30 ≤ MID < $120 ≤ HIGH.
    #[test]
    fn test_delta_regime_thresholds() {
        assert_eq!(delta_regime(Asset::Btc, 0.0), DeltaRegime::Low);
        assert_eq!(delta_regime(Asset::Btc, 29.9), DeltaRegime::Low);
        assert_eq!(delta_regime(Asset::Btc, 30.0), DeltaRegime::Mid);
        assert_eq!(delta_regime(Asset::Btc, 119.9), DeltaRegime::Mid);
        assert_eq!(delta_regime(Asset::Btc, 120.0), DeltaRegime::High);
    }

    // ── hedge mode ──

    /// Scenario: Each regime mapped to its hedge mode, including the panic
    /// window (tte within 2× the unwind deadline).
    /// Expected: Low→Normal(+0), Mid→Survival(+20), High→Critical(+20),
    /// High near expiry→Panic(+40).
    #[test]
    fn test_hedge_mode_mapping_and_boosts() {
        assert_eq!(hedge_mode(DeltaRegime::Low, 600.0, 45.0), HedgeMode::Normal);
        assert_eq!(hedge_mode(DeltaRegime::Mid, 600.0, 45.0), HedgeMode::Survival);
        assert_eq!(
            hedge_mode(DeltaRegime::High, 600.0, 45.0),
            HedgeMode::HighDeltaCritical
        );
        assert_eq!(hedge_mode(DeltaRegime::High, 89.0, 45.0), HedgeMode::Panic);

        assert_eq!(HedgeMode::Normal.priority_boost(), 0);
        assert_eq!(HedgeMode::Survival.priority_boost(), 20);
        assert_eq!(HedgeMode::HighDeltaCritical.priority_boost(), 20);
        assert_eq!(HedgeMode::Panic.priority_boost(), 40);
    }

    // ── bot state ──

    /// Scenario: Inventory shapes; flat, one-sided, balanced, skewed,
    /// dislocated, and near expiry.
    /// Expected: Each classifies to its own state; UNWIND dominates.
    #[test]
    fn test_bot_state_classification() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.52), Some(0.50));

        let inv = flat_inventory();
        assert_eq!(bot_state(&inv, &snap, &config), BotState::Flat);

        let mut one_sided = flat_inventory();
        one_sided.update_on_fill(Side::Up, 20.0, 0.50, 1_000);
        one_sided.recalc_risk(&snap);
        assert_eq!(bot_state(&one_sided, &snap, &config), BotState::OneSided);

        let mut hedged = one_sided.clone();
        hedged.update_on_fill(Side::Down, 20.0, 0.45, 2_000);
        hedged.recalc_risk(&snap);
        assert_eq!(bot_state(&hedged, &snap, &config), BotState::Hedged);

        let mut skewed = hedged.clone();
        skewed.update_on_fill(Side::Up, 5.0, 0.50, 3_000);
        skewed.recalc_risk(&snap);
        assert_eq!(bot_state(&skewed, &snap, &config), BotState::Skewed);

        let mut deep = skewed.clone();
        deep.risk_score = config.degraded_risk_score_trigger + 1.0;
        assert_eq!(bot_state(&deep, &snap, &config), BotState::DeepDislocation);

        // 40s to expiry < deadline 45s → UNWIND regardless of inventory
        let late = make_snapshot(860_000, Some(0.52), Some(0.50));
        assert_eq!(bot_state(&deep, &late, &config), BotState::Unwind);
    }

    // ── entry rules ──

    /// Scenario: Flat inventory, fair UP 0.50, DOWN ask 0.40 (10¢ edge),
    /// tight spread, deep book, mid-window.
    /// Expected: One ENTRY draft buying DOWN at ask − tick = 0.39.
    #[test]
    fn test_entry_happy_path() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let inv = flat_inventory();
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);

        assert_eq!(out.intents.len(), 1, "skips: {:?}", out.skips);
        let draft = &out.intents[0];
        assert_eq!(draft.kind, IntentType::Entry);
        assert_eq!(draft.side, Side::Down);
        assert!((draft.price - 0.39).abs() < 1e-10);
        assert!((draft.shares - config.base_shares).abs() < 1e-10);
        assert_eq!(draft.priority, 10);
        assert!(!draft.marketable);
    }

    /// Scenario: Identical inputs evaluated twice.
    /// Expected: Identical drafts; the builder is pure.
    #[test]
    fn test_builder_is_deterministic() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let inv = flat_inventory();
        let pending = HedgePending::default();
        let a = build_with(&snap, &inv, Some(0.50), &pending, &config);
        let b = build_with(&snap, &inv, Some(0.50), &pending, &config);
        assert_eq!(a.intents.len(), b.intents.len());
        for (x, y) in a.intents.iter().zip(b.intents.iter()) {
            assert_eq!(x.kind, y.kind);
            assert_eq!(x.side, y.side);
            assert!((x.price - y.price).abs() < 1e-12);
            assert!((x.shares - y.shares).abs() < 1e-12);
            assert_eq!(x.priority, y.priority);
        }
    }

    /// Scenario: Degraded inventory with an otherwise perfect entry setup.
    /// Expected: No draft; skip reason DEGRADED_MODE.
    #[test]
    fn test_entry_blocked_by_degraded_mode() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let mut inv = flat_inventory();
        inv.degraded = true;
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::DegradedMode]);
    }

    /// Scenario: Queue stress flag set on the snapshot.
    /// Expected: Entry suppressed with QUEUE_STRESS.
    #[test]
    fn test_entry_blocked_by_queue_stress() {
        let config = make_config();
        let mut snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        snap.queue_stressed = true;
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::QueueStress]);
    }

    /// Scenario: Market not ready (missing DOWN book).
    /// Expected: Entry suppressed with NO_ORDERBOOK.
    #[test]
    fn test_entry_blocked_when_not_ready() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), None);
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::NoOrderbook]);
    }

    /// Scenario: Spot $150 above strike; HIGH delta regime.
    /// Expected: Entries not permitted; TOO_LATE skip.
    #[test]
    fn test_entry_blocked_in_high_regime() {
        let config = make_config();
        let mut snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        snap.spot = snap.strike + 150.0;
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::TooLate]);
    }

    /// Scenario: 90s to expiry with minSecRemaining=120.
    /// Expected: TOO_LATE skip.
    #[test]
    fn test_entry_blocked_too_close_to_expiry() {
        let config = make_config();
        let snap = make_snapshot(810_000, Some(0.62), Some(0.40));
        assert!(snap.secs_to_expiry < config.min_sec_remaining);
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::TooLate]);
    }

    /// Scenario: 880s to expiry with maxSecRemaining=840.
    /// Expected: Window not mature; TOO_LATE skip.
    #[test]
    fn test_entry_blocked_window_not_mature() {
        let config = make_config();
        let snap = make_snapshot(20_000, Some(0.62), Some(0.40));
        assert!(snap.secs_to_expiry > config.max_sec_remaining);
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::TooLate]);
    }

    /// Scenario: Three markets already live for the asset with a cap of 2.
    /// Expected: RATE_LIMIT skip.
    #[test]
    fn test_entry_blocked_by_concurrency_cap() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let out = build(
            &BuildInput {
                snap: &snap,
                inv: &flat_inventory(),
                phase: MarketPhase::Idle,
                fair_up: Some(0.50),
                pending: &HedgePending::default(),
                open_markets_for_asset: 3,
            },
            &config,
        );
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::RateLimit]);
    }

    /// Scenario: No trusted fair for the cell.
    /// Expected: MIN_EDGE skip; without a fair there is no edge.
    #[test]
    fn test_entry_blocked_without_fair() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let out = build_with(&snap, &flat_inventory(), None, &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::MinEdge]);
    }

    /// Scenario: Fair UP 0.50 with DOWN ask 0.45; only 5¢ edge (< 8¢).
    /// Expected: MIN_EDGE skip.
    #[test]
    fn test_entry_blocked_below_min_edge() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.57), Some(0.45));
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::MinEdge]);
    }

    /// Scenario: Good edge but top-of-book ask size 30 (< minDepth 50).
    /// Expected: NO_DEPTH skip.
    #[test]
    fn test_entry_blocked_thin_book() {
        let config = make_config();
        let mut snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        if let Some(b) = snap.down.as_mut() {
            b.ask_size = 30.0;
        }
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::NoDepth]);
    }

    /// Scenario: Good edge but an 8¢ spread on the chosen side (> 6¢ max).
    /// Expected: NO_DEPTH skip.
    #[test]
    fn test_entry_blocked_wide_spread() {
        let config = make_config();
        let mut snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        if let Some(b) = snap.down.as_mut() {
            b.bid = Some(0.32); // spread 0.08
        }
        let out = build_with(&snap, &flat_inventory(), Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::NoDepth]);
    }

    /// Scenario: $249 of the $250 per-market notional already invested.
    /// Expected: FUNDS skip; remaining budget buys less than one share.
    #[test]
    fn test_entry_blocked_by_notional_cap() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let mut inv = flat_inventory();
        inv.update_on_fill(Side::Up, 300.0, 0.4165, 1_000);
        inv.update_on_fill(Side::Down, 300.0, 0.4165, 1_000);
        // $249.90 of $250 spent → remaining buys < 1 share at 0.39
        assert!(inv.total_invested() > 249.8);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::Funds]);
    }

    /// Scenario: Budget allows only 12 shares at the draft price.
    /// Expected: Draft quantity capped by remaining notional, not baseShares.
    #[test]
    fn test_entry_quantity_capped_by_budget() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let mut inv = flat_inventory();
        // Invest $245.32 of $250 → remaining $4.68 / 0.39 = 12 shares
        inv.update_on_fill(Side::Up, 290.0, 0.423, 1_000);
        inv.update_on_fill(Side::Down, 290.0, 0.423, 1_000);
        let remaining = config.max_notional_usd_per_market - inv.total_invested();
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1, "skips: {:?}", out.skips);
        let draft = &out.intents[0];
        assert!(draft.shares < config.base_shares);
        assert!(draft.shares * draft.price <= remaining + 1e-9);
    }

    /// Scenario: Balanced (hedged) inventory with a fresh edge.
    /// Expected: ACCUMULATE draft (priority 15), not ENTRY.
    #[test]
    fn test_hedged_state_accumulates() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let mut inv = flat_inventory();
        inv.update_on_fill(Side::Up, 10.0, 0.45, 1_000);
        inv.update_on_fill(Side::Down, 10.0, 0.40, 2_000);
        inv.recalc_risk(&snap);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1, "skips: {:?}", out.skips);
        assert_eq!(out.intents[0].kind, IntentType::Accumulate);
        assert_eq!(out.intents[0].priority, 15);
    }

    // ── hedge rules ──

    fn skewed_inventory(snap: &Snapshot, surplus: f64) -> Inventory {
        let mut inv = Inventory::new("m1", 0);
        inv.update_on_fill(Side::Up, surplus, 0.50, 1_000);
        inv.recalc_risk(snap);
        inv
    }

    /// Scenario: 20 surplus UP shares (≥ hedgeMinShares 10), DOWN ask 0.40.
    /// Expected: HEDGE draft buying DOWN, sized 20 × hedgeRatio, priced at
    /// ask − tick, priority 80 in the LOW regime.
    #[test]
    fn test_hedge_emitted_on_weak_side() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let inv = skewed_inventory(&snap, 20.0);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1, "skips: {:?}", out.skips);
        let draft = &out.intents[0];
        assert_eq!(draft.kind, IntentType::Hedge);
        assert_eq!(draft.side, Side::Down);
        assert!((draft.shares - 20.0).abs() < 1e-10);
        assert!((draft.price - 0.39).abs() < 1e-10);
        assert_eq!(draft.priority, 80);
    }

    /// Scenario: Same hedge in the MID delta regime (survival mode).
    /// Expected: Priority boosted to 100.
    #[test]
    fn test_hedge_priority_boost_in_survival() {
        let config = make_config();
        let mut snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        snap.spot = snap.strike + 50.0; // MID regime
        let inv = skewed_inventory(&snap, 20.0);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1);
        assert_eq!(out.intents[0].priority, 100);
    }

    /// Scenario: Weak-side ask at 0.95 (> maxOppAsk 0.80).
    /// Expected: Hedge limit capped at 0.80, never chasing the ask.
    #[test]
    fn test_hedge_price_capped() {
        let mut config = make_config();
        config.max_cpp_approx = 2.0; // isolate the price cap
        let snap = make_snapshot(300_000, Some(0.04), Some(0.95));
        let inv = skewed_inventory(&snap, 20.0);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1, "skips: {:?}", out.skips);
        assert!((out.intents[0].price - config.max_opp_ask).abs() < 1e-10);
    }

    /// Scenario: Surplus UP bought at 0.50 with the DOWN hedge costing 0.55.
    /// Expected: Projected pair cost 1.05 > 1.00; PAIR_COST skip, no draft.
    #[test]
    fn test_hedge_blocked_by_pair_cost() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.46), Some(0.56));
        let inv = skewed_inventory(&snap, 20.0);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::PairCost]);
    }

    /// Scenario: 200 surplus shares with hedgeMaxShares=500, then with a
    /// tighter 50-share cap.
    /// Expected: Quantity clamps to the configured ceiling.
    #[test]
    fn test_hedge_quantity_clamped() {
        let mut config = make_config();
        config.max_cpp_approx = 2.0; // isolate the clamp
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let inv = skewed_inventory(&snap, 200.0);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert!((out.intents[0].shares - 200.0).abs() < 1e-10);

        config.hedge_max_shares = 50.0;
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert!((out.intents[0].shares - 50.0).abs() < 1e-10);
    }

    // ── micro-hedge rules ──

    /// Scenario: 6 surplus shares (< hedgeMin 10) with 6 pooled in the
    /// accumulator (≥ microMin 5), no cooldown.
    /// Expected: MICRO_HEDGE draft for the pooled quantity, priority 60.
    #[test]
    fn test_micro_hedge_emitted() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let inv = skewed_inventory(&snap, 6.0);
        let mut pending = HedgePending::default();
        pending.note_unpaired(6.0);
        let out = build_with(&snap, &inv, Some(0.50), &pending, &config);
        assert_eq!(out.intents.len(), 1, "skips: {:?}", out.skips);
        let draft = &out.intents[0];
        assert_eq!(draft.kind, IntentType::MicroHedge);
        assert_eq!(draft.side, Side::Down);
        assert!((draft.shares - 6.0).abs() < 1e-10);
        assert_eq!(draft.priority, 60);
    }

    /// Scenario: Only 3 shares pooled (< microMin 5).
    /// Expected: Nothing emitted; dust keeps pooling.
    #[test]
    fn test_micro_hedge_defers_below_threshold() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let inv = skewed_inventory(&snap, 3.0);
        let mut pending = HedgePending::default();
        pending.note_unpaired(3.0);
        let out = build_with(&snap, &inv, Some(0.50), &pending, &config);
        assert!(out.intents.is_empty());
        assert!(out.skips.is_empty(), "pooling is not an externally visible skip");
    }

    /// Scenario: Pooled shares ready but cooldown runs until t+2s.
    /// Expected: COOLDOWN skip; after expiry the draft appears.
    #[test]
    fn test_micro_hedge_cooldown() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let inv = skewed_inventory(&snap, 6.0);
        let mut pending = HedgePending::default();
        pending.note_unpaired(6.0);
        pending.on_emitted(snap.ts_ms, config.micro_hedge_cooldown_ms);
        let out = build_with(&snap, &inv, Some(0.50), &pending, &config);
        assert!(out.intents.is_empty());
        assert_eq!(skip_reasons(&out), vec![SkipReason::Cooldown]);

        let later = make_snapshot(300_000 + config.micro_hedge_cooldown_ms + 1, Some(0.62), Some(0.40));
        let mut inv2 = skewed_inventory(&later, 6.0);
        inv2.recalc_risk(&later);
        let out = build_with(&later, &inv2, Some(0.50), &pending, &config);
        assert_eq!(out.intents.len(), 1);
    }

    /// Scenario: A fill restores balance after micro-hedge retries.
    /// Expected: on_paired() clears pending shares, retries, and cooldown.
    #[test]
    fn test_micro_hedge_reset_on_pairing() {
        let mut pending = HedgePending::default();
        pending.note_unpaired(6.0);
        pending.on_emitted(1_000, 3_000);
        pending.on_emitted(5_000, 3_000);
        assert_eq!(pending.retries, 2);
        pending.on_paired();
        assert_eq!(pending.retries, 0);
        assert_eq!(pending.pending_shares, 0.0);
        assert_eq!(pending.cooldown_until_ms, 0);
    }

    // ── deep dislocation ──

    /// Scenario: Risk score past the dislocation threshold with a perfect
    /// entry edge also on screen.
    /// Expected: Only the defensive HEDGE draft; entries are not evaluated.
    #[test]
    fn test_deep_dislocation_hedges_only() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let mut inv = skewed_inventory(&snap, 20.0);
        inv.risk_score = config.degraded_risk_score_trigger + 1.0;
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1);
        assert_eq!(out.intents[0].kind, IntentType::Hedge);
    }

    // ── unwind rules ──

    /// Scenario: 30s to expiry (≤ deadline 45s) with 12 unpaired shares and
    /// emergency exit disabled.
    /// Expected: UNWIND draft at ask − tick, priority 90, not marketable.
    #[test]
    fn test_unwind_maker_priced() {
        let config = make_config();
        let snap = make_snapshot(870_000, Some(0.62), Some(0.40));
        let mut inv = Inventory::new("m1", 0);
        inv.update_on_fill(Side::Up, 12.0, 0.50, 1_000);
        inv.recalc_risk(&snap);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1);
        let draft = &out.intents[0];
        assert_eq!(draft.kind, IntentType::Unwind);
        assert_eq!(draft.side, Side::Down);
        assert!((draft.shares - 12.0).abs() < 1e-10);
        assert!((draft.price - 0.39).abs() < 1e-10);
        assert_eq!(draft.priority, 90);
        assert!(!draft.marketable);
    }

    /// Scenario: Emergency exit armed, 15s to expiry (≤ 20s window),
    /// DOWN ask 0.40, 3 cross ticks.
    /// Expected: Marketable UNWIND priced through the touch at 0.43.
    #[test]
    fn test_unwind_emergency_crosses() {
        let mut config = make_config();
        config.allow_emergency_exit = true;
        let snap = make_snapshot(885_000, Some(0.62), Some(0.40));
        let mut inv = Inventory::new("m1", 0);
        inv.update_on_fill(Side::Up, 12.0, 0.50, 1_000);
        inv.recalc_risk(&snap);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert_eq!(out.intents.len(), 1);
        let draft = &out.intents[0];
        assert!(draft.marketable);
        assert!((draft.price - 0.43).abs() < 1e-10);
    }

    /// Scenario: Fully paired inventory inside the unwind window.
    /// Expected: Nothing; a locked pair rides to settlement.
    #[test]
    fn test_unwind_noop_when_paired() {
        let config = make_config();
        let snap = make_snapshot(870_000, Some(0.62), Some(0.40));
        let mut inv = Inventory::new("m1", 0);
        inv.update_on_fill(Side::Up, 10.0, 0.48, 1_000);
        inv.update_on_fill(Side::Down, 10.0, 0.47, 2_000);
        inv.recalc_risk(&snap);
        let out = build_with(&snap, &inv, Some(0.50), &HedgePending::default(), &config);
        assert!(out.intents.is_empty());
        assert!(out.skips.is_empty());
    }

    /// Scenario: Market phase already DONE.
    /// Expected: Builder emits nothing at all.
    #[test]
    fn test_done_phase_emits_nothing() {
        let config = make_config();
        let snap = make_snapshot(300_000, Some(0.62), Some(0.40));
        let out = build(
            &BuildInput {
                snap: &snap,
                inv: &flat_inventory(),
                phase: MarketPhase::Done,
                fair_up: Some(0.50),
                pending: &HedgePending::default(),
                open_markets_for_asset: 1,
            },
            &config,
        );
        assert!(out.intents.is_empty());
        assert!(out.skips.is_empty());
    }
}
