//! Fixed-step price grid built from raw depth levels.
//!
//! Every call rebuilds the grid from scratch, so float drift between two
//! otherwise identical books can never change the row count.

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;
use tracing::{instrument, trace, warn};

use crate::engine::types::{AggregatedBook, BookLevel, GridRow, PriceRow, Zone, prices_match};

/// Substituted for a non-positive or non-finite price step.
pub const DEFAULT_PRICE_STEP: f64 = 0.01;

/// Grid prices are never shown with fewer decimals than this.
pub const MIN_DISPLAY_DECIMALS: u32 = 2;
const MAX_DISPLAY_DECIMALS: u32 = 9;

/// Hard ceiling on grid size for absurd step/range combinations.
pub const MAX_GRID_ROWS: usize = 20_000;

pub fn normalise_step(price_step: f64) -> f64 {
    if price_step.is_finite() && price_step > 0.0 {
        price_step
    } else {
        DEFAULT_PRICE_STEP
    }
}

/// Decimals needed to print `step` exactly, floored at [`MIN_DISPLAY_DECIMALS`].
pub fn display_decimals(step: f64) -> u32 {
    let mut decimals = 0;
    while decimals < MAX_DISPLAY_DECIMALS {
        let scaled = step * 10f64.powi(decimals as i32);
        if (scaled - scaled.round()).abs() < 1e-9 * scaled.abs().max(1.0) {
            break;
        }
        decimals += 1;
    }
    decimals.max(MIN_DISPLAY_DECIMALS)
}

fn round_to(price: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (price * scale).round() / scale
}

/// Build the display grid for one book.
///
/// Rows come out highest price first with at most one [`GridRow::Spread`]
/// between the best ask and the best bid. Both sides empty yields a grid with
/// no rows at all, which consumers treat as "no data".
#[instrument(level = "trace", skip(bids, asks), fields(bids = bids.len(), asks = asks.len()))]
pub fn aggregate(bids: &[BookLevel], asks: &[BookLevel], price_step: f64, lot_size: u64) -> AggregatedBook {
    let bids = sanitise(bids);
    let asks = sanitise(asks);
    if bids.is_empty() && asks.is_empty() {
        trace!("empty book");
        return AggregatedBook::default();
    }

    let step = normalise_step(price_step);
    let lot_size = lot_size.max(1);
    let tolerance = step / 2.0;
    let grid = build_grid(&bids, &asks, step, display_decimals(step));

    let best_bid = bids.iter().map(|l| l.price).reduce(f64::max);
    let best_ask = asks.iter().map(|l| l.price).reduce(f64::min);
    let spread_open = matches!((best_bid, best_ask), (Some(bid), Some(ask)) if bid < ask);

    let peaks = SidePeaks {
        ask: side_peak(&asks),
        bid: side_peak(&bids),
    };

    let mut rows = Vec::with_capacity(grid.len() + 1);
    let mut spread_inserted = false;
    for &price in grid.iter().rev() {
        if spread_open && !spread_inserted {
            if let Some(ask) = best_ask {
                if price < ask && !prices_match(price, ask, tolerance) {
                    rows.push(GridRow::Spread);
                    spread_inserted = true;
                }
            }
        }
        rows.push(GridRow::Price(price_row(price, &bids, &asks, &peaks, tolerance, lot_size)));
    }

    mark_peak_sum(&mut rows);

    let (min_volume, max_volume, min_sum, max_sum) = bounds(&rows);
    trace!(rows = rows.len(), spread = spread_inserted, "aggregated");
    AggregatedBook {
        rows,
        tolerance,
        min_volume,
        max_volume,
        min_sum,
        max_sum,
    }
}

fn sanitise(levels: &[BookLevel]) -> Vec<BookLevel> {
    levels.iter().copied().filter(|l| l.price.is_finite()).collect()
}

fn build_grid(bids: &[BookLevel], asks: &[BookLevel], step: f64, decimals: u32) -> Vec<f64> {
    let distinct: BTreeSet<OrderedFloat<f64>> =
        bids.iter().chain(asks).map(|l| OrderedFloat(l.price)).collect();
    let (Some(min), Some(max)) = (distinct.first(), distinct.last()) else {
        return Vec::new();
    };
    let (min, max) = (min.0, max.0);
    let limit = max + step / 2.0;

    let mut grid = Vec::new();
    let mut i = 0usize;
    loop {
        // Index-based so the step error never accumulates along the grid.
        let price = min + i as f64 * step;
        if price > limit {
            break;
        }
        if grid.len() == MAX_GRID_ROWS {
            warn!(min, max, step, max_rows = MAX_GRID_ROWS, "price grid truncated");
            break;
        }
        grid.push(round_to(price, decimals));
        i += 1;
    }

    if grid.is_empty() {
        grid.push(round_to(min, decimals));
    }
    grid
}

struct SidePeaks {
    ask: Option<BookLevel>,
    bid: Option<BookLevel>,
}

// First level in feed order carrying the side's largest quantity.
fn side_peak(levels: &[BookLevel]) -> Option<BookLevel> {
    let max = levels.iter().map(|l| l.quantity).max()?;
    levels.iter().find(|l| l.quantity == max).copied()
}

fn matched_volume(levels: &[BookLevel], price: f64, tolerance: f64) -> u64 {
    levels
        .iter()
        .filter(|l| prices_match(l.price, price, tolerance))
        .fold(0u64, |acc, l| acc.saturating_add(l.quantity))
}

fn price_row(
    price: f64,
    bids: &[BookLevel],
    asks: &[BookLevel],
    peaks: &SidePeaks,
    tolerance: f64,
    lot_size: u64,
) -> PriceRow {
    let ask_volume = matched_volume(asks, price, tolerance);
    let bid_volume = matched_volume(bids, price, tolerance);
    // Both sides on one grid price is a feed anomaly; asks win.
    let volume = if ask_volume > 0 { ask_volume } else { bid_volume };
    let sum = if volume > 0 {
        price * volume as f64 * lot_size as f64
    } else {
        0.0
    };

    let holds = |peak: Option<BookLevel>| peak.is_some_and(|p| prices_match(p.price, price, tolerance));
    let volume_zone = if (ask_volume > 0 && holds(peaks.ask)) || (bid_volume > 0 && holds(peaks.bid)) {
        Zone::Peak
    } else {
        side_zone(ask_volume, bid_volume)
    };

    PriceRow {
        price,
        ask_volume,
        bid_volume,
        volume,
        sum,
        volume_zone,
        sum_zone: side_zone(ask_volume, bid_volume),
    }
}

fn side_zone(ask_volume: u64, bid_volume: u64) -> Zone {
    if ask_volume > 0 {
        Zone::Ask
    } else if bid_volume > 0 {
        Zone::Bid
    } else {
        Zone::Empty
    }
}

// Only the first row (highest price) with the largest positive notional is promoted.
fn mark_peak_sum(rows: &mut [GridRow]) {
    let mut peak: Option<(usize, f64)> = None;
    for (idx, row) in rows.iter().enumerate() {
        if let GridRow::Price(r) = row {
            if r.sum > 0.0 && peak.map_or(true, |(_, best)| r.sum > best) {
                peak = Some((idx, r.sum));
            }
        }
    }
    if let Some((idx, _)) = peak {
        if let GridRow::Price(r) = &mut rows[idx] {
            r.sum_zone = Zone::Peak;
        }
    }
}

// (min positive volume, max volume, min positive sum, max sum), 0 when nothing qualifies.
fn bounds(rows: &[GridRow]) -> (u64, u64, f64, f64) {
    let price_rows = || rows.iter().filter_map(GridRow::as_price_row);

    let min_volume = price_rows().map(|r| r.volume).filter(|v| *v > 0).min().unwrap_or(0);
    let max_volume = price_rows().map(|r| r.volume).max().unwrap_or(0);
    let min_sum = price_rows()
        .map(|r| OrderedFloat(r.sum))
        .filter(|s| s.0 > 0.0)
        .min()
        .map_or(0.0, |s| s.0);
    let max_sum = price_rows().map(|r| OrderedFloat(r.sum)).max().map_or(0.0, |s| s.0.max(0.0));

    (min_volume, max_volume, min_sum, max_sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lv(price: f64, quantity: u64) -> BookLevel {
        BookLevel::new(price, quantity)
    }

    fn prices(book: &AggregatedBook) -> Vec<Option<f64>> {
        book.rows.iter().map(GridRow::price).collect()
    }

    fn row(book: &AggregatedBook, idx: usize) -> &PriceRow {
        book.rows[idx].as_price_row().expect("price row")
    }

    fn reference_book() -> AggregatedBook {
        let bids = [lv(100.00, 5), lv(99.99, 3)];
        let asks = [lv(100.02, 4)];
        aggregate(&bids, &asks, 0.01, 10)
    }

    #[test]
    fn test_reference_layout() {
        let book = reference_book();
        assert_eq!(
            prices(&book),
            vec![Some(100.02), None, Some(100.01), Some(100.0), Some(99.99)]
        );
        assert_eq!(book.spread_index(), Some(1));
    }

    #[test]
    fn test_reference_volumes_and_sums() {
        let book = reference_book();

        let ask = row(&book, 0);
        assert_eq!((ask.ask_volume, ask.bid_volume, ask.volume), (4, 0, 4));
        assert!((ask.sum - 4000.8).abs() < 1e-9);

        let gap = row(&book, 2);
        assert_eq!(gap.volume, 0);
        assert_eq!(gap.sum, 0.0);
        assert_eq!(gap.volume_zone, Zone::Empty);

        let best_bid = row(&book, 3);
        assert_eq!(best_bid.volume, 5);
        assert!((best_bid.sum - 5000.0).abs() < 1e-9);

        let deep_bid = row(&book, 4);
        assert_eq!(deep_bid.volume, 3);
        assert!((deep_bid.sum - 2999.7).abs() < 1e-9);
    }

    #[test]
    fn test_reference_zones() {
        let book = reference_book();
        // Each side's largest level is a peak in the volume view.
        assert_eq!(row(&book, 0).volume_zone, Zone::Peak);
        assert_eq!(row(&book, 3).volume_zone, Zone::Peak);
        assert_eq!(row(&book, 4).volume_zone, Zone::Bid);

        // Only the single largest notional is a peak in the sum view.
        assert_eq!(row(&book, 0).sum_zone, Zone::Ask);
        assert_eq!(row(&book, 3).sum_zone, Zone::Peak);
        assert_eq!(row(&book, 4).sum_zone, Zone::Bid);
        assert_eq!(row(&book, 2).sum_zone, Zone::Empty);
    }

    #[test]
    fn test_reference_bounds() {
        let book = reference_book();
        assert_eq!(book.min_volume, 3);
        assert_eq!(book.max_volume, 5);
        assert!((book.min_sum - 2999.7).abs() < 1e-9);
        assert!((book.max_sum - 5000.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_book_has_no_rows() {
        let book = aggregate(&[], &[], 0.01, 1);
        assert!(book.is_empty());
        assert_eq!(book.max_volume, 0);
        assert_eq!(book.max_sum, 0.0);
    }

    #[test]
    fn test_non_finite_levels_are_ignored() {
        let book = aggregate(&[lv(f64::NAN, 3)], &[lv(f64::INFINITY, 1)], 0.01, 1);
        assert!(book.is_empty());

        let book = aggregate(&[lv(10.0, 1), lv(f64::NAN, 9)], &[], 0.01, 1);
        assert_eq!(prices(&book), vec![Some(10.0)]);
    }

    #[test]
    fn test_one_sided_books_have_no_spread() {
        let asks_only = aggregate(&[], &[lv(10.0, 1), lv(10.05, 2)], 0.01, 1);
        assert_eq!(asks_only.spread_index(), None);
        assert_eq!(asks_only.rows.len(), 6);

        let bids_only = aggregate(&[lv(10.0, 1), lv(9.98, 2)], &[], 0.01, 1);
        assert_eq!(bids_only.spread_index(), None);
        assert_eq!(row(&bids_only, 0).volume_zone, Zone::Bid);
        assert_eq!(row(&bids_only, 2).volume_zone, Zone::Peak);
    }

    #[test]
    fn test_adjacent_sides_still_get_a_spread_row() {
        let book = aggregate(&[lv(100.00, 1)], &[lv(100.01, 1)], 0.01, 1);
        assert_eq!(prices(&book), vec![Some(100.01), None, Some(100.0)]);
    }

    // Bid and ask share one grid cell: the gap is narrower than the tolerance,
    // so there is no row to put a spread before.
    #[test]
    fn test_sub_tick_open_book_has_no_spread() {
        let book = aggregate(&[lv(100.00, 2)], &[lv(100.004, 3)], 0.01, 1);
        assert_eq!(prices(&book), vec![Some(100.0)]);
        assert_eq!(book.spread_index(), None);
        let only = row(&book, 0);
        assert_eq!((only.ask_volume, only.bid_volume, only.volume), (3, 2, 3));
    }

    #[test]
    fn test_crossed_book_has_no_spread() {
        let book = aggregate(&[lv(100.02, 1)], &[lv(100.00, 1)], 0.01, 1);
        assert_eq!(book.spread_index(), None);
    }

    #[test]
    fn test_wide_gap_gets_exactly_one_spread() {
        let book = aggregate(&[lv(99.0, 1)], &[lv(101.0, 1)], 0.5, 1);
        assert_eq!(
            prices(&book),
            vec![Some(101.0), None, Some(100.5), Some(100.0), Some(99.5), Some(99.0)]
        );
        assert_eq!(book.rows.iter().filter(|r| r.is_spread()).count(), 1);
    }

    #[test]
    fn test_bad_step_falls_back_to_default() {
        for step in [0.0, -1.0, f64::NAN] {
            let book = aggregate(&[lv(1.00, 1)], &[lv(1.03, 1)], step, 1);
            assert_eq!(book.tolerance, DEFAULT_PRICE_STEP / 2.0);
            assert_eq!(book.price_rows().count(), 4);
        }
    }

    #[test]
    fn test_float_drift_keeps_row_count() {
        let clean = aggregate(&[lv(100.00, 1), lv(99.97, 1)], &[lv(100.03, 1)], 0.01, 1);
        let noisy = aggregate(
            &[lv(100.000_000_01, 1), lv(99.969_999_99, 1)],
            &[lv(100.030_000_02, 1)],
            0.01,
            1,
        );
        assert_eq!(clean.rows.len(), noisy.rows.len());
        assert_eq!(prices(&clean), prices(&noisy));
    }

    #[test]
    fn test_duplicate_levels_merge_into_one_row() {
        let book = aggregate(&[lv(50.0, 2), lv(50.000_000_1, 3)], &[], 0.01, 1);
        assert_eq!(book.rows.len(), 1);
        assert_eq!(row(&book, 0).volume, 5);
    }

    #[test]
    fn test_ask_volume_wins_on_overlap() {
        let book = aggregate(&[lv(10.0, 7)], &[lv(10.0, 2)], 0.01, 1);
        let r = row(&book, 0);
        assert_eq!((r.ask_volume, r.bid_volume, r.volume), (2, 7, 2));
    }

    #[test]
    fn test_peak_volume_tie_takes_first_in_feed_order() {
        let asks = [lv(10.01, 5), lv(10.02, 5)];
        let book = aggregate(&[], &asks, 0.01, 1);
        assert_eq!(row(&book, 0).price, 10.02);
        assert_eq!(row(&book, 0).volume_zone, Zone::Ask);
        assert_eq!(row(&book, 1).price, 10.01);
        assert_eq!(row(&book, 1).volume_zone, Zone::Peak);
    }

    #[test]
    fn test_peak_sum_tie_takes_highest_row() {
        // 20 * 1 == 10 * 2: identical notional on two rows.
        let book = aggregate(&[lv(10.0, 2)], &[lv(20.0, 1)], 10.0, 1);
        let peaks: Vec<_> = book.price_rows().filter(|r| r.sum_zone == Zone::Peak).collect();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].price, 20.0);
    }

    #[test]
    fn test_zero_lot_size_counts_as_one() {
        let book = aggregate(&[lv(5.0, 2)], &[], 0.01, 0);
        assert_eq!(row(&book, 0).sum, 10.0);
    }

    #[test]
    fn test_zero_quantity_levels_stay_empty() {
        let book = aggregate(&[lv(5.0, 0)], &[lv(5.02, 0)], 0.01, 1);
        assert!(book.price_rows().all(|r| r.volume_zone == Zone::Empty));
        assert_eq!((book.min_volume, book.max_volume), (0, 0));
        assert_eq!((book.min_sum, book.max_sum), (0.0, 0.0));
    }

    #[test]
    fn test_display_decimals() {
        assert_eq!(display_decimals(0.01), 2);
        assert_eq!(display_decimals(0.5), 2);
        assert_eq!(display_decimals(1.0), 2);
        assert_eq!(display_decimals(0.001), 3);
        assert_eq!(display_decimals(0.0025), 4);
    }

    #[test]
    fn test_fine_step_keeps_its_precision() {
        let book = aggregate(&[lv(1.001, 1)], &[lv(1.003, 1)], 0.001, 1);
        assert_eq!(prices(&book), vec![Some(1.003), None, Some(1.002), Some(1.001)]);
    }

    #[test]
    fn test_oversized_range_is_capped() {
        let book = aggregate(&[lv(0.0, 1)], &[lv(1_000_000.0, 1)], 0.01, 1);
        assert!(book.price_rows().count() <= MAX_GRID_ROWS);
    }

    #[test]
    fn test_row_lookup_uses_tolerance() {
        let book = reference_book();
        assert_eq!(book.row_for_price(100.004), Some(3));
        assert_eq!(book.row_for_price(100.0199), Some(0));
        assert_eq!(book.row_for_price(101.0), None);
        assert_eq!(book.row_for_price(f64::NAN), None);
    }

    #[test]
    fn test_aggregate_is_pure() {
        assert_eq!(reference_book(), reference_book());
    }
}
