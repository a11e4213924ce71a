// Shared test fixtures for engine, queue, and execution tests.
// Only compiled under #[cfg(test)].

use crate::config::Config;
use crate::types::{Asset, BookTop, Intent, IntentType, MarketInfo, Side, Snapshot};
use uuid::Uuid;

/// Default config for tests, mirroring the `from_env()` defaults without
/// touching the process environment.
pub fn make_config() -> Config {
    Config {
        asset: Asset::Btc,
        binance_ws: String::new(),
        binance_ws_fallback: String::new(),
        clob_ws: String::new(),
        gamma_api_url: String::new(),
        polymarket_private_key: None,
        polymarket_funder_address: None,
        polymarket_signature_type: 0,
        dry_run: true,
        event_log_dir: "logs".into(),
        surface_checkpoint_path: String::new(),
        min_levels: 1,
        max_snapshot_age_ms: 3_000,
        tick: 0.01,
        max_book_age_ms: 500,
        allow_emergency_exit: false,
        emergency_exit_sec_remaining: 20.0,
        emergency_cross_ticks: 3,
        emergency_rate_limit_ms: 2_000,
        order_timeout_ms: 30_000,
        order_slot_timeout_ms: 45_000,
        edge_entry_min: 0.08,
        max_spread: 0.06,
        min_depth: 50.0,
        base_shares: 20.0,
        max_shares: 100.0,
        max_notional_usd_per_market: 250.0,
        max_concurrent_markets_per_asset: 2,
        min_sec_remaining: 120.0,
        max_sec_remaining: 840.0,
        hedge_ratio: 1.0,
        max_opp_ask: 0.80,
        max_cpp_approx: 1.00,
        hedge_min_shares: 10.0,
        hedge_max_shares: 500.0,
        micro_hedge_min_shares: 5.0,
        micro_hedge_cooldown_ms: 3_000,
        deadline_sec_remaining: 45.0,
        degraded_trigger_notional: 25.0,
        degraded_trigger_age_sec: 90.0,
        degraded_risk_score_trigger: 3_000.0,
        queue_stress_size: 8,
        max_pending_per_market: 4,
        max_pending_global: 64,
        stale_intent_max_age_ms: 10_000,
        failures_per_min: 10,
        breaker_window_ms: 60_000,
        breaker_auto_reset_ms: 300_000,
        ewma_alpha: 0.15,
        min_samples_to_trade: 20,
        max_fair_age_ms: 120_000,
        time_bucket_edges_sec: vec![0, 120, 240, 360, 480, 600, 720, 900],
        park_max_age_ms: 15_000,
    }
}

/// Fresh two-sided book: bid 2¢ under the ask, deep on both sides.
pub fn make_book(bid: Option<f64>, ask: Option<f64>, ts_ms: i64) -> BookTop {
    BookTop {
        bid,
        ask,
        bid_size: 100.0,
        ask_size: 100.0,
        levels: 2,
        ts_ms,
    }
}

pub fn make_market_info() -> MarketInfo {
    MarketInfo {
        market_id: "m1".into(),
        asset: Asset::Btc,
        slug: "btc-updown-15m-1700000000".into(),
        up_token_id: "up-tok".into(),
        down_token_id: "down-tok".into(),
        strike: 95_000.0,
        start_ms: 0,
        end_ms: 900_000,
    }
}

/// Snapshot with symmetric fresh books at the given asks (bid = ask − 2¢).
/// Ready flags are set when the corresponding book exists.
pub fn make_snapshot(ts_ms: i64, up_ask: Option<f64>, down_ask: Option<f64>) -> Snapshot {
    let book = |ask: Option<f64>| {
        ask.map(|a| BookTop {
            bid: Some(a - 0.02),
            ask: Some(a),
            bid_size: 100.0,
            ask_size: 100.0,
            levels: 2,
            ts_ms,
        })
    };
    let up = book(up_ask);
    let down = book(down_ask);
    Snapshot {
        market_id: "m1".into(),
        asset: Asset::Btc,
        ts_ms,
        secs_to_expiry: ((900_000 - ts_ms).max(0)) as f64 / 1000.0,
        strike: 95_000.0,
        spot: 95_010.0,
        ready_up: up.is_some(),
        ready_down: down.is_some(),
        up,
        down,
        queue_len: 0,
        queue_stressed: false,
    }
}

pub fn make_intent(id: u64, market: &str, kind: IntentType, created_ms: i64) -> Intent {
    Intent {
        id,
        created_ms,
        correlation_id: Uuid::new_v4(),
        market_id: market.to_string(),
        asset: Asset::Btc,
        kind,
        side: Side::Up,
        token_id: "up-tok".into(),
        shares: 10.0,
        price: 0.45,
        marketable: false,
        reason: String::new(),
        priority: kind.base_priority(),
        market_end_ms: 900_000,
    }
}
