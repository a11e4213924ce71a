//! Market discovery via the Gamma API.
//!
//! The 15-minute Up/Down series uses deterministic slugs:
//! `{asset}-updown-15m-{unix_window_start}`. We compute the current and
//! next window boundaries from the clock, try each slug, and parse the
//! event's two outcome tokens. The strike is the reference candle open at
//! the window boundary, fetched separately.

use anyhow::{anyhow, Context};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::MarketInfo;

/// Find the current or next 15-minute market for the configured asset.
pub async fn discover_next_market(
    client: &reqwest::Client,
    config: &Config,
) -> anyhow::Result<MarketInfo> {
    let now_s = chrono::Utc::now().timestamp();
    let ws = config.window_secs();

    let current_window_start = (now_s / ws) * ws;
    let next_window_start = current_window_start + ws;

    let now_ms = chrono::Utc::now().timestamp_millis();
    for &window_start in &[current_window_start, next_window_start] {
        let slug = format!("{}{}", config.slug_prefix(), window_start);
        debug!(slug, "trying slug");

        match fetch_event_by_slug(client, config, &slug).await {
            Ok(Some(market)) => {
                if market.end_ms < now_ms {
                    debug!(slug, "market already ended, skipping");
                    continue;
                }
                info!(
                    slug = %market.slug,
                    starts_in_s = (market.start_ms - now_ms) / 1000,
                    remaining_s = (market.end_ms - now_ms) / 1000,
                    "market discovered"
                );
                return Ok(market);
            }
            Ok(None) => debug!(slug, "slug not found"),
            Err(e) => warn!(slug, error = %e, "slug lookup failed"),
        }
    }

    Err(anyhow!(
        "no active {} 15m market found",
        config.asset.label()
    ))
}

async fn fetch_event_by_slug(
    client: &reqwest::Client,
    config: &Config,
    slug: &str,
) -> anyhow::Result<Option<MarketInfo>> {
    let url = format!("{}/events?slug={}", config.gamma_api_url, slug);
    let resp = client.get(&url).send().await.context("gamma request")?;
    let events: serde_json::Value = resp.json().await.context("gamma response")?;

    let Some(event) = events.as_array().and_then(|a| a.first()) else {
        return Ok(None);
    };
    Ok(parse_event(event, slug, config))
}

fn parse_event(event: &serde_json::Value, slug: &str, config: &Config) -> Option<MarketInfo> {
    let markets = event.get("markets")?.as_array()?;
    if markets.is_empty() {
        return None;
    }

    let end_ms = event
        .get("endDate")
        .and_then(|s| s.as_str())
        .and_then(parse_datetime_ms)?;

    // Window start is encoded in the slug's trailing unix timestamp.
    let start_ms = slug
        .rsplit('-')
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .map(|ts| if ts > 1_000_000_000_000 { ts } else { ts * 1000 })
        .unwrap_or(end_ms - config.window_secs() * 1000);

    let (up_token_id, down_token_id) = extract_token_ids(markets)?;

    Some(MarketInfo {
        market_id: slug.to_string(),
        asset: config.asset,
        slug: slug.to_string(),
        up_token_id,
        down_token_id,
        strike: 0.0, // set from the reference candle open at start
        start_ms,
        end_ms,
    })
}

/// Pull the UP/DOWN token pair out of the event's markets. The Gamma API
/// serves either two single-outcome markets or one market whose
/// `outcomes`/`clobTokenIds` are parallel JSON-array strings.
fn extract_token_ids(markets: &[serde_json::Value]) -> Option<(String, String)> {
    let mut up = String::new();
    let mut down = String::new();

    for market in markets {
        let outcomes_str = market.get("outcomes").and_then(|o| o.as_str()).unwrap_or("");
        let tokens_str = market
            .get("clobTokenIds")
            .and_then(|t| t.as_str())
            .unwrap_or("");

        if let (Ok(outcomes), Ok(tokens)) = (
            serde_json::from_str::<Vec<String>>(outcomes_str),
            serde_json::from_str::<Vec<String>>(tokens_str),
        ) {
            for (outcome, token) in outcomes.iter().zip(tokens.iter()) {
                let lower = outcome.to_lowercase();
                if lower.contains("up") || lower.contains("yes") || lower.contains("higher") {
                    up = token.clone();
                } else if lower.contains("down")
                    || lower.contains("no")
                    || lower.contains("lower")
                {
                    down = token.clone();
                }
            }
        }
    }

    if up.is_empty() || down.is_empty() {
        None
    } else {
        Some((up, down))
    }
}

fn parse_datetime_ms(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(ts) = s.parse::<i64>() {
        return Some(if ts > 1_000_000_000_000 { ts } else { ts * 1000 });
    }
    None
}

/// Fetch the reference candle open at the current 15-minute boundary.
/// This is the strike per the venue's resolution rules. Falls back to the
/// spot ticker when the klines endpoint misbehaves.
pub async fn fetch_strike(client: &reqwest::Client, config: &Config) -> anyhow::Result<f64> {
    let symbol = format!("{}USDT", config.asset.label());
    let url = format!(
        "https://api.binance.com/api/v3/klines?symbol={}&interval=15m&limit=1",
        symbol
    );

    match client.get(&url).send().await {
        Ok(resp) => {
            if let Ok(v) = resp.json::<serde_json::Value>().await {
                // klines: [[open_time, open, high, low, close, ...], ...]
                if let Some(open) = v
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|candle| candle.get(1))
                    .and_then(|o| o.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                {
                    info!(symbol, open, "strike from candle open");
                    return Ok(open);
                }
            }
            warn!("klines parse failed, falling back to spot ticker");
        }
        Err(e) => warn!(error = %e, "klines fetch failed, falling back to spot ticker"),
    }

    let url = format!(
        "https://api.binance.com/api/v3/ticker/price?symbol={}",
        symbol
    );
    let v: serde_json::Value = client
        .get(&url)
        .send()
        .await
        .context("spot ticker request")?
        .json()
        .await
        .context("spot ticker response")?;
    v["price"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("spot ticker missing price"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_helpers::make_config;

    /// Scenario: Gamma event with parallel outcomes/clobTokenIds arrays.
    /// Expected: UP and DOWN token ids extracted in outcome order.
    #[test]
    fn test_extract_token_ids_parallel_arrays() {
        let markets = vec![serde_json::json!({
            "outcomes": "[\"Up\", \"Down\"]",
            "clobTokenIds": "[\"tok-a\", \"tok-b\"]"
        })];
        let (up, down) = extract_token_ids(&markets).unwrap();
        assert_eq!(up, "tok-a");
        assert_eq!(down, "tok-b");
    }

    /// Scenario: Outcomes labeled Yes/No instead of Up/Down.
    /// Expected: Yes maps to UP, No maps to DOWN.
    #[test]
    fn test_extract_token_ids_yes_no_labels() {
        let markets = vec![serde_json::json!({
            "outcomes": "[\"No\", \"Yes\"]",
            "clobTokenIds": "[\"tok-no\", \"tok-yes\"]"
        })];
        let (up, down) = extract_token_ids(&markets).unwrap();
        assert_eq!(up, "tok-yes");
        assert_eq!(down, "tok-no");
    }

    /// Scenario: Market with only one recognizable outcome.
    /// Expected: None; both tokens are required.
    #[test]
    fn test_extract_token_ids_incomplete() {
        let markets = vec![serde_json::json!({
            "outcomes": "[\"Up\"]",
            "clobTokenIds": "[\"tok-a\"]"
        })];
        assert!(extract_token_ids(&markets).is_none());
    }

    /// Scenario: Full Gamma event for slug btc-updown-15m-1700000100.
    /// Expected: start_ms decoded from the slug, end_ms from endDate, and
    /// the market id equals the slug.
    #[test]
    fn test_parse_event() {
        let config = make_config();
        let event = serde_json::json!({
            "endDate": "2023-11-14T22:30:00Z",
            "markets": [{
                "outcomes": "[\"Up\", \"Down\"]",
                "clobTokenIds": "[\"u\", \"d\"]"
            }]
        });
        let info = parse_event(&event, "btc-updown-15m-1700000100", &config).unwrap();
        assert_eq!(info.market_id, "btc-updown-15m-1700000100");
        assert_eq!(info.start_ms, 1_700_000_100_000);
        assert!(info.end_ms > info.start_ms);
        assert_eq!(info.up_token_id, "u");
        assert_eq!(info.down_token_id, "d");
    }

    /// Scenario: RFC3339, bare-seconds, and millisecond timestamp strings.
    /// Expected: All parse to epoch milliseconds.
    #[test]
    fn test_parse_datetime_formats() {
        assert_eq!(
            parse_datetime_ms("2023-11-14T22:30:00Z"),
            Some(1_700_001_000_000)
        );
        assert_eq!(parse_datetime_ms("1700001000"), Some(1_700_001_000_000));
        assert_eq!(parse_datetime_ms("1700001000000"), Some(1_700_001_000_000));
        assert_eq!(parse_datetime_ms("not a date"), None);
    }
}
