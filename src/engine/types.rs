use std::sync::Arc;

/// Opaque broker identifier (FIGI or instrument UID).
pub type InstrumentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Buy,
    Sell,
}

// Instrument as the metadata collaborator hands it over; fixed for the life of a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRef {
    pub id: InstrumentId,
    pub price_step: f64,
    pub lot_size: u64,
}

impl InstrumentRef {
    pub fn new(id: impl Into<InstrumentId>, price_step: f64, lot_size: u64) -> Self {
        Self { id: id.into(), price_step, lot_size }
    }
}

// One raw (price, quantity) pair from the feed; not grid aligned
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: u64,
}

impl BookLevel {
    pub fn new(price: f64, quantity: u64) -> Self {
        Self { price, quantity }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl RawBook {
    pub fn new(bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        Self { bids, asks }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Highest bid price, ignoring non-finite garbage.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids
            .iter()
            .map(|l| l.price)
            .filter(|p| p.is_finite())
            .fold(None, |best, p| Some(best.map_or(p, |b: f64| b.max(p))))
    }

    /// Lowest ask price, ignoring non-finite garbage.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks
            .iter()
            .map(|l| l.price)
            .filter(|p| p.is_finite())
            .fold(None, |best, p| Some(best.map_or(p, |b: f64| b.min(p))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    pub price: f64,
    pub quantity: u64,
    pub direction: Direction,
}

/// Highlight tier of a grid row. `Peak` means side-max volume in the volume
/// view and global max notional in the sum view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    Peak,
    Ask,
    Bid,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceRow {
    pub price: f64,
    pub ask_volume: u64,
    pub bid_volume: u64,
    pub volume: u64,
    pub sum: f64,
    pub volume_zone: Zone,
    pub sum_zone: Zone,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GridRow {
    Price(PriceRow),
    Spread,
}

impl GridRow {
    pub fn price(&self) -> Option<f64> {
        match self {
            GridRow::Price(row) => Some(row.price),
            GridRow::Spread => None,
        }
    }

    pub fn as_price_row(&self) -> Option<&PriceRow> {
        match self {
            GridRow::Price(row) => Some(row),
            GridRow::Spread => None,
        }
    }

    pub fn is_spread(&self) -> bool {
        matches!(self, GridRow::Spread)
    }
}

/// Display-ready grid, rows ordered by descending price.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedBook {
    pub rows: Vec<GridRow>,
    /// Tolerance the grid was built with (half a price step).
    pub tolerance: f64,
    pub min_volume: u64,
    pub max_volume: u64,
    pub min_sum: f64,
    pub max_sum: f64,
}

impl AggregatedBook {
    /// No rows at all: the feed had nothing on either side.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn price_rows(&self) -> impl Iterator<Item = &PriceRow> {
        self.rows.iter().filter_map(GridRow::as_price_row)
    }

    pub fn spread_index(&self) -> Option<usize> {
        self.rows.iter().position(GridRow::is_spread)
    }

    /// Index of the first row whose price lies within the grid tolerance of `price`.
    pub fn row_for_price(&self, price: f64) -> Option<usize> {
        if !price.is_finite() {
            return None;
        }
        self.rows
            .iter()
            .position(|row| row.price().is_some_and(|p| prices_match(p, price, self.tolerance)))
    }
}

/// `|a - b| < tolerance`, with the difference rounded to 6 places so float
/// noise in the last digits never flips a match.
pub fn prices_match(a: f64, b: f64, tolerance: f64) -> bool {
    let diff = ((a - b) * 1e6).round() / 1e6;
    diff.abs() < tolerance
}

/// What the multiplexer routes to one instrument. Either half may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedUpdate {
    pub book: Option<RawBook>,
    pub trade: Option<Trade>,
}

impl FeedUpdate {
    pub fn book(book: RawBook) -> Self {
        Self { book: Some(book), trade: None }
    }

    pub fn trade(trade: Trade) -> Self {
        Self { book: None, trade: Some(trade) }
    }

    /// Layer `self` over an older pending update: fields present here win,
    /// fields absent here are carried over from `older`.
    pub fn merged_over(self, older: FeedUpdate) -> FeedUpdate {
        FeedUpdate {
            book: self.book.or(older.book),
            trade: self.trade.or(older.trade),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.book.is_none() && self.trade.is_none()
    }
}

/// Consumer-facing end of one instrument pane.
pub trait BookSink: Send + Sync + 'static {
    fn on_book_update(&self, book: Arc<AggregatedBook>);
    fn on_trade(&self, trade: Trade, row: Option<usize>);
    fn on_error(&self, message: &str);
}
