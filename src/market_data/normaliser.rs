// Convert wire quotations into plain prices and lot counts.
// Bad numbers are sanitised here, never surfaced as errors.

use crate::engine::types::BookLevel;
use crate::market_data::adapters::tinvest_types::{WsOrder, WsQuotation};

const NANO_SCALE: f64 = 1_000_000_000.0;

/// `units + nano / 1e9`. Both parts carry the same sign on the wire.
pub fn quotation_to_price(q: WsQuotation) -> f64 {
    q.units as f64 + f64::from(q.nano) / NANO_SCALE
}

pub fn quantity_to_lots(quantity: i64) -> u64 {
    u64::try_from(quantity).unwrap_or(0)
}

/// `None` for levels whose price is not a finite number.
pub fn level(order: &WsOrder) -> Option<BookLevel> {
    let price = quotation_to_price(order.price);
    price
        .is_finite()
        .then(|| BookLevel::new(price, quantity_to_lots(order.quantity)))
}

pub fn side(orders: &[WsOrder]) -> Vec<BookLevel> {
    orders.iter().filter_map(level).collect()
}
