//! Swing pivots and break-of-structure detection over a price series

use crate::types::Direction;

/// Indices of swing highs and swing lows.
///
/// A bar is a swing high (low) when it equals the maximum (minimum) of the
/// window of `lookback` bars on each side of it. Ties count, so a flat top
/// yields several pivots.
pub fn swing_pivots(price: &[f64], lookback: usize) -> (Vec<usize>, Vec<usize>) {
    let mut highs = Vec::new();
    let mut lows = Vec::new();
    let n = price.len();
    if lookback == 0 || n < 2 * lookback + 1 {
        return (highs, lows);
    }

    for i in lookback..n - lookback {
        let window = &price[i - lookback..=i + lookback];
        let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = window.iter().copied().fold(f64::INFINITY, f64::min);
        if price[i] == max {
            highs.push(i);
        }
        if price[i] == min {
            lows.push(i);
        }
    }
    (highs, lows)
}

/// First break of structure in `price`, as an index into `price`.
///
/// Walking forward from `2 * lookback + 1`, an up-break is the first bar
/// trading above the highest swing high recorded within the preceding
/// `4 * lookback` bars by more than `min_break`; a down-break mirrors it
/// against swing lows.
pub fn first_break(price: &[f64], lookback: usize, min_break: f64, direction: Direction) -> Option<usize> {
    let (highs, lows) = swing_pivots(price, lookback);
    let window = lookback * 4;

    for i in lookback * 2 + 1..price.len() {
        let broke = match direction {
            Direction::Long => recent_extreme(price, &highs, i, window, f64::max)
                .is_some_and(|level| price[i] > level + min_break),
            Direction::Short => recent_extreme(price, &lows, i, window, f64::min)
                .is_some_and(|level| price[i] < level - min_break),
        };
        if broke {
            return Some(i);
        }
    }
    None
}

/// Extreme of the pivots that precede `i` by at most `window` bars
fn recent_extreme(
    price: &[f64],
    pivots: &[usize],
    i: usize,
    window: usize,
    pick: fn(f64, f64) -> f64,
) -> Option<f64> {
    pivots
        .iter()
        .filter(|&&j| j < i && i - j <= window)
        .map(|&j| price[j])
        .reduce(pick)
}
