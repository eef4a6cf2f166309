//! Limit price selection.
//!
//! Buys (and covers) are priced off the ask, sells (and shorts) off the
//! bid, falling back to the last trade. The quote is pushed away from the
//! market by a buffer in basis points so the order is marketable, then
//! rounded to cents.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::broker::Quote;
use crate::models::OrderSide;

const BPS: Decimal = dec!(10_000);

/// How the gateway prices a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceInstruction {
    /// MARKET order, no price.
    Market,
    /// LIMIT at a known price.
    Fixed(Decimal),
    /// LIMIT priced from a fresh quote, else `fallback`.
    FromQuote {
        /// Buffer applied to the quote, in basis points.
        buffer_bps: Decimal,
        /// Price used when no quote is available.
        fallback: Option<Decimal>,
    },
}

/// Reference price for `side` from `quote`.
#[must_use]
pub fn reference_price(side: OrderSide, quote: &Quote) -> Option<Decimal> {
    let touch = match side {
        OrderSide::Buy => quote.ask,
        OrderSide::Sell => quote.bid,
    };
    touch
        .or(quote.last)
        .filter(|price| *price > Decimal::ZERO)
}

/// Apply the buffer to `reference` and round to cents.
#[must_use]
pub fn buffered_limit(side: OrderSide, reference: Decimal, buffer_bps: Decimal) -> Decimal {
    let factor = match side {
        OrderSide::Buy => Decimal::ONE + buffer_bps / BPS,
        OrderSide::Sell => Decimal::ONE - buffer_bps / BPS,
    };
    (reference * factor).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Limit price for `side` from an optional quote.
#[must_use]
pub fn limit_from_quote(
    side: OrderSide,
    quote: Option<&Quote>,
    buffer_bps: Decimal,
) -> Option<Decimal> {
    quote
        .and_then(|q| reference_price(side, q))
        .map(|reference| buffered_limit(side, reference, buffer_bps))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote() -> Quote {
        Quote {
            bid: Some(dec!(249.90)),
            ask: Some(dec!(250.10)),
            last: Some(dec!(250.00)),
        }
    }

    #[test]
    fn test_reference_uses_touch_for_side() {
        assert_eq!(reference_price(OrderSide::Buy, &quote()), Some(dec!(250.10)));
        assert_eq!(reference_price(OrderSide::Sell, &quote()), Some(dec!(249.90)));
    }

    #[test]
    fn test_reference_falls_back_to_last() {
        let q = Quote {
            bid: None,
            ask: None,
            last: Some(dec!(12.5)),
        };
        assert_eq!(reference_price(OrderSide::Buy, &q), Some(dec!(12.5)));
        assert_eq!(reference_price(OrderSide::Buy, &Quote::default()), None);
    }

    #[test]
    fn test_buffer_direction_and_rounding() {
        // 250.10 * 1.001 = 250.3501
        assert_eq!(
            buffered_limit(OrderSide::Buy, dec!(250.10), dec!(10)),
            dec!(250.35)
        );
        // 249.90 * 0.999 = 249.6501
        assert_eq!(
            buffered_limit(OrderSide::Sell, dec!(249.90), dec!(10)),
            dec!(249.65)
        );
        assert_eq!(
            buffered_limit(OrderSide::Buy, dec!(100), Decimal::ZERO),
            dec!(100)
        );
    }

    #[test]
    fn test_basis_point_scale() {
        assert_eq!(BPS, Decimal::from(10_000));
        assert_eq!(
            buffered_limit(OrderSide::Buy, dec!(100), dec!(10_000)),
            dec!(200)
        );
    }

    #[test]
    fn test_limit_from_missing_quote() {
        assert_eq!(limit_from_quote(OrderSide::Sell, None, dec!(10)), None);
        assert_eq!(
            limit_from_quote(OrderSide::Sell, Some(&quote()), dec!(10)),
            Some(dec!(249.65))
        );
    }
}
