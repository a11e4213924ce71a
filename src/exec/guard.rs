//! Last-mile price validation.
//!
//! Every outbound order price passes through here against a fresh book:
//! tick alignment, book sanity, freshness, and the no-crossing rule. The
//! emergency variant relaxes crossing by a bounded number of ticks and
//! skips the staleness check; it is reachable only from the late-expiry
//! exit path.

use thiserror::Error;

use crate::types::{BookTop, OrderSide};

/// Tolerance for float-to-tick conversion. Prices arrive as f64 sums of
/// decimal fractions, so exact multiples of the tick can sit a few ulps
/// below the true value.
const TICK_EPS: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("RAW_NAN")]
    RawNan,
    #[error("INVALID_BOOK")]
    InvalidBook,
    #[error("STALE_BOOK")]
    StaleBook,
    #[error("NO_CROSSING_BUY")]
    NoCrossingBuy,
    #[error("NO_CROSSING_SELL")]
    NoCrossingSell,
}

#[inline]
fn ticks_floor(raw: f64, tick: f64) -> i64 {
    ((raw / tick) + TICK_EPS).floor() as i64
}

#[inline]
fn ticks_ceil(raw: f64, tick: f64) -> i64 {
    ((raw / tick) - TICK_EPS).ceil() as i64
}

/// Nearest tick count for prices that are already aligned (book prices).
#[inline]
fn ticks_round(raw: f64, tick: f64) -> i64 {
    ((raw / tick) + 0.5).floor() as i64
}

/// Round a raw price onto the tick grid: BUY prices round down (never pay
/// more than asked for), SELL prices round up.
#[inline]
pub fn round_to_tick(side: OrderSide, raw: f64, tick: f64) -> f64 {
    let t = match side {
        OrderSide::Buy => ticks_floor(raw, tick),
        OrderSide::Sell => ticks_ceil(raw, tick),
    };
    t as f64 * tick
}

/// Validate a requested order price against the current book.
///
/// Checks, in order: finiteness, book sanity (crossed or non-positive
/// quotes), book freshness, then the no-crossing rule; a BUY must rest at
/// least one tick under the best ask, a SELL at least one tick above the
/// best bid. Comparison runs in integer ticks.
///
/// Returns the validated tick-aligned price.
pub fn validate_order_price(
    book: &BookTop,
    side: OrderSide,
    raw: f64,
    now_ms: i64,
    tick: f64,
    max_book_age_ms: i64,
) -> Result<f64, GuardError> {
    if !raw.is_finite() {
        return Err(GuardError::RawNan);
    }
    if !book.is_valid() {
        return Err(GuardError::InvalidBook);
    }
    if book.age_ms(now_ms) > max_book_age_ms {
        return Err(GuardError::StaleBook);
    }

    let max_tick = ticks_round(1.0, tick) - 1;
    let t = match side {
        OrderSide::Buy => ticks_floor(raw, tick),
        OrderSide::Sell => ticks_ceil(raw, tick),
    }
    .clamp(1, max_tick);

    match side {
        OrderSide::Buy => {
            if let Some(ask) = book.ask {
                let ask_t = ticks_round(ask, tick);
                if t > ask_t - 1 {
                    return Err(GuardError::NoCrossingBuy);
                }
            }
        }
        OrderSide::Sell => {
            if let Some(bid) = book.bid {
                let bid_t = ticks_round(bid, tick);
                if t < bid_t + 1 {
                    return Err(GuardError::NoCrossingSell);
                }
            }
        }
    }

    Ok(t as f64 * tick)
}

/// Emergency variant: permits crossing the touch by up to `cross_ticks`
/// and skips the staleness check. Reachable only when the emergency exit
/// is enabled and the market is inside its final seconds.
pub fn validate_emergency_cross_price(
    book: &BookTop,
    side: OrderSide,
    raw: f64,
    tick: f64,
    cross_ticks: u32,
) -> Result<f64, GuardError> {
    if !raw.is_finite() {
        return Err(GuardError::RawNan);
    }
    if !book.is_valid() {
        return Err(GuardError::InvalidBook);
    }

    let max_tick = ticks_round(1.0, tick) - 1;
    let t = match side {
        OrderSide::Buy => ticks_floor(raw, tick),
        OrderSide::Sell => ticks_ceil(raw, tick),
    }
    .clamp(1, max_tick);

    match side {
        OrderSide::Buy => {
            if let Some(ask) = book.ask {
                let limit = ticks_round(ask, tick) + cross_ticks as i64;
                if t > limit {
                    return Err(GuardError::NoCrossingBuy);
                }
            }
        }
        OrderSide::Sell => {
            if let Some(bid) = book.bid {
                let limit = ticks_round(bid, tick) - cross_ticks as i64;
                if t < limit {
                    return Err(GuardError::NoCrossingSell);
                }
            }
        }
    }

    Ok((t.min(max_tick)) as f64 * tick)
}
