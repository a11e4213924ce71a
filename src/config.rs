use crate::types::Asset;

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Per-asset bucketing and delta-regime parameters. Widths follow the venue
/// convention for each underlying; regime thresholds and the delta clamp are
/// width multiples so every asset behaves identically in bucket space.
#[derive(Clone, Copy, Debug)]
pub struct AssetParams {
    /// Width of one |spot − strike| bucket in USD.
    pub delta_width_usd: f64,
    /// Absolute delta is clamped here before bucketing (24 widths).
    pub max_delta_usd: f64,
    /// Below this the market is in the LOW delta regime (3 widths).
    pub regime_low_usd: f64,
    /// At or above this the market is in the HIGH delta regime (12 widths).
    pub regime_high_usd: f64,
}

pub fn asset_params(asset: Asset) -> AssetParams {
    let width = match asset {
        Asset::Btc => 10.0,
        Asset::Eth => 0.05,
        Asset::Sol => 0.01,
        Asset::Xrp => 0.0005,
    };
    AssetParams {
        delta_width_usd: width,
        max_delta_usd: width * 24.0,
        regime_low_usd: width * 3.0,
        regime_high_usd: width * 12.0,
    }
}

/// Parse comma-separated time bucket edges ("0,120,240,...,900").
/// Falls back to the default 120-second grid on any parse failure.
fn parse_bucket_edges(raw: &str) -> Option<Vec<i64>> {
    let edges: Vec<i64> = raw
        .split(',')
        .map(|s| s.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if edges.len() >= 2 && edges.windows(2).all(|w| w[0] < w[1]) {
        Some(edges)
    } else {
        None
    }
}

fn default_bucket_edges() -> Vec<i64> {
    vec![0, 120, 240, 360, 480, 600, 720, 900]
}

/// Configuration loaded from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    // Asset + endpoints
    pub asset: Asset,
    pub binance_ws: String,
    pub binance_ws_fallback: String,
    pub clob_ws: String,
    pub gamma_api_url: String,

    // Credentials (live mode only)
    pub polymarket_private_key: Option<String>,
    pub polymarket_funder_address: Option<String>,
    pub polymarket_signature_type: u8,

    // Mode & paths
    pub dry_run: bool,
    pub event_log_dir: String,
    pub surface_checkpoint_path: String,

    // Readiness
    pub min_levels: u32,
    pub max_snapshot_age_ms: i64,

    // Execution
    pub tick: f64,
    pub max_book_age_ms: i64,
    pub allow_emergency_exit: bool,
    pub emergency_exit_sec_remaining: f64,
    pub emergency_cross_ticks: u32,
    pub emergency_rate_limit_ms: i64,
    pub order_timeout_ms: i64,
    pub order_slot_timeout_ms: i64,

    // Entry
    pub edge_entry_min: f64,
    pub max_spread: f64,
    pub min_depth: f64,
    pub base_shares: f64,
    pub max_shares: f64,
    pub max_notional_usd_per_market: f64,
    pub max_concurrent_markets_per_asset: usize,
    pub min_sec_remaining: f64,
    pub max_sec_remaining: f64,

    // Hedge
    pub hedge_ratio: f64,
    pub max_opp_ask: f64,
    pub max_cpp_approx: f64,
    pub hedge_min_shares: f64,
    pub hedge_max_shares: f64,
    pub micro_hedge_min_shares: f64,
    pub micro_hedge_cooldown_ms: i64,
    pub deadline_sec_remaining: f64,

    // Risk
    pub degraded_trigger_notional: f64,
    pub degraded_trigger_age_sec: f64,
    pub degraded_risk_score_trigger: f64,
    pub queue_stress_size: usize,

    // Queue
    pub max_pending_per_market: usize,
    pub max_pending_global: usize,
    pub stale_intent_max_age_ms: i64,

    // Breaker
    pub failures_per_min: usize,
    pub breaker_window_ms: i64,
    pub breaker_auto_reset_ms: i64,

    // Fair surface
    pub ewma_alpha: f64,
    pub min_samples_to_trade: u64,
    pub max_fair_age_ms: i64,
    pub time_bucket_edges_sec: Vec<i64>,

    // Parked intents
    pub park_max_age_ms: i64,
}

impl Config {
    pub fn from_env() -> Self {
        let asset = Asset::from_symbol(&env_str("ASSET", "btc")).unwrap_or(Asset::Btc);

        // Auto-derive spot WS from asset unless explicitly overridden
        let binance_ws = std::env::var("BINANCE_WS").unwrap_or_else(|_| {
            format!("wss://stream.binance.com:9443/ws/{}usdt@trade", asset.symbol())
        });
        let binance_ws_fallback = std::env::var("BINANCE_WS_FALLBACK").unwrap_or_else(|_| {
            format!("wss://stream.binance.us:9443/ws/{}usd@trade", asset.symbol())
        });

        let time_bucket_edges_sec = std::env::var("TIME_BUCKETS_SEC")
            .ok()
            .and_then(|raw| parse_bucket_edges(&raw))
            .unwrap_or_else(default_bucket_edges);

        Self {
            asset,
            binance_ws,
            binance_ws_fallback,
            clob_ws: env_str(
                "PM_CLOB_WS",
                "wss://ws-subscriptions-clob.polymarket.com/ws/market",
            ),
            gamma_api_url: env_str("GAMMA_API_URL", "https://gamma-api.polymarket.com"),

            polymarket_private_key: std::env::var("POLYMARKET_PRIVATE_KEY").ok(),
            polymarket_funder_address: std::env::var("POLYMARKET_FUNDER_ADDRESS").ok(),
            polymarket_signature_type: env_u32("POLYMARKET_SIGNATURE_TYPE", 0) as u8,

            dry_run: env_bool("DRY_RUN", true),
            event_log_dir: env_str("EVENT_LOG_DIR", "logs"),
            surface_checkpoint_path: env_str(
                "SURFACE_CHECKPOINT_PATH",
                "state/fair_surface.json",
            ),

            min_levels: env_u32("MIN_LEVELS", 1),
            max_snapshot_age_ms: env_i64("MAX_SNAPSHOT_AGE_MS", 3_000),

            tick: env_f64("TICK", 0.01),
            max_book_age_ms: env_i64("MAX_BOOK_AGE_MS", 500),
            allow_emergency_exit: env_bool("ALLOW_EMERGENCY_EXIT", false),
            emergency_exit_sec_remaining: env_f64("EMERGENCY_EXIT_SEC_REMAINING", 20.0),
            emergency_cross_ticks: env_u32("EMERGENCY_CROSS_TICKS", 3),
            emergency_rate_limit_ms: env_i64("EMERGENCY_RATE_LIMIT_MS", 2_000),
            order_timeout_ms: env_i64("ORDER_TIMEOUT_MS", 30_000),
            order_slot_timeout_ms: env_i64("ORDER_SLOT_TIMEOUT_MS", 45_000),

            edge_entry_min: env_f64("EDGE_ENTRY_MIN", 0.08),
            max_spread: env_f64("MAX_SPREAD", 0.06),
            min_depth: env_f64("MIN_DEPTH", 50.0),
            base_shares: env_f64("BASE_SHARES", 20.0),
            max_shares: env_f64("MAX_SHARES", 100.0),
            max_notional_usd_per_market: env_f64("MAX_NOTIONAL_USD_PER_MARKET", 250.0),
            max_concurrent_markets_per_asset: env_usize("MAX_CONCURRENT_MARKETS_PER_ASSET", 2),
            min_sec_remaining: env_f64("MIN_SEC_REMAINING", 120.0),
            max_sec_remaining: env_f64("MAX_SEC_REMAINING", 840.0),

            hedge_ratio: env_f64("HEDGE_RATIO", 1.0),
            max_opp_ask: env_f64("MAX_OPP_ASK", 0.80),
            max_cpp_approx: env_f64("MAX_CPP_APPROX", 1.00),
            hedge_min_shares: env_f64("HEDGE_MIN_SHARES", 10.0),
            hedge_max_shares: env_f64("HEDGE_MAX_SHARES", 500.0),
            micro_hedge_min_shares: env_f64("MICRO_HEDGE_MIN_SHARES", 5.0),
            micro_hedge_cooldown_ms: env_i64("MICRO_HEDGE_COOLDOWN_MS", 3_000),
            deadline_sec_remaining: env_f64("DEADLINE_SEC_REMAINING", 45.0),

            degraded_trigger_notional: env_f64("DEGRADED_TRIGGER_NOTIONAL", 25.0),
            degraded_trigger_age_sec: env_f64("DEGRADED_TRIGGER_AGE_SEC", 90.0),
            degraded_risk_score_trigger: env_f64("DEGRADED_RISK_SCORE_TRIGGER", 3_000.0),
            queue_stress_size: env_usize("QUEUE_STRESS_SIZE", 8),

            max_pending_per_market: env_usize("MAX_PENDING_PER_MARKET", 4),
            max_pending_global: env_usize("MAX_PENDING_GLOBAL", 64),
            stale_intent_max_age_ms: env_i64("STALE_INTENT_MAX_AGE_MS", 10_000),

            failures_per_min: env_usize("FAILURES_PER_MIN", 10),
            breaker_window_ms: env_i64("BREAKER_WINDOW_MS", 60_000),
            breaker_auto_reset_ms: env_i64("BREAKER_AUTO_RESET_MS", 300_000),

            ewma_alpha: env_f64("EWMA_ALPHA", 0.15),
            min_samples_to_trade: env_i64("MIN_SAMPLES_TO_TRADE", 20) as u64,
            max_fair_age_ms: env_i64("MAX_FAIR_AGE_MS", 120_000),
            time_bucket_edges_sec,

            park_max_age_ms: env_i64("PARK_MAX_AGE_MS", 15_000),
        }
    }

    /// Slug prefix for market discovery: "{asset}-updown-15m-".
    pub fn slug_prefix(&self) -> String {
        format!("{}-updown-15m-", self.asset.symbol())
    }

    /// Event window duration. This system trades the 15-minute series only.
    pub fn window_secs(&self) -> i64 {
        900
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: Per-asset bucket tables for all four supported assets.
    /// Expected: Thresholds are consistent width multiples and strictly ordered
    /// low < high < clamp for every asset.
    #[test]
    fn test_asset_params_ordering() {
        for asset in [Asset::Btc, Asset::Eth, Asset::Sol, Asset::Xrp] {
            let p = asset_params(asset);
            assert!(p.delta_width_usd > 0.0);
            assert!(p.regime_low_usd < p.regime_high_usd, "{:?}", asset);
            assert!(p.regime_high_usd < p.max_delta_usd, "{:?}", asset);
            assert!((p.regime_low_usd / p.delta_width_usd - 3.0).abs() < 1e-9);
            assert!((p.regime_high_usd / p.delta_width_usd - 12.0).abs() < 1e-9);
            assert!((p.max_delta_usd / p.delta_width_usd - 24.0).abs() < 1e-9);
        }
    }

    /// Scenario: BTC bucket width.
    /// Expected: $10 per bucket, matching the venue's strike granularity.
    #[test]
    fn test_btc_delta_width() {
        assert!((asset_params(Asset::Btc).delta_width_usd - 10.0).abs() < 1e-12);
    }

    /// Scenario: Valid, unsorted, and garbage bucket-edge strings.
    /// Expected: Strictly increasing lists parse; anything else is rejected.
    #[test]
    fn test_parse_bucket_edges() {
        assert_eq!(
            parse_bucket_edges("0,120,240"),
            Some(vec![0, 120, 240])
        );
        assert_eq!(parse_bucket_edges("0, 120, 900"), Some(vec![0, 120, 900]));
        assert_eq!(parse_bucket_edges("120,0"), None, "not increasing");
        assert_eq!(parse_bucket_edges("0"), None, "needs two edges");
        assert_eq!(parse_bucket_edges("a,b"), None, "not numeric");
    }

    /// Scenario: Default time grid.
    /// Expected: Eight edges covering [0, 900) in 120-second steps with a
    /// final [720, 900) bucket.
    #[test]
    fn test_default_bucket_edges_cover_window() {
        let edges = default_bucket_edges();
        assert_eq!(edges.first(), Some(&0));
        assert_eq!(edges.last(), Some(&900));
        assert!(edges.windows(2).all(|w| w[0] < w[1]));
    }
}
