// Per-instrument pipeline: multiplexer -> throttle -> aggregator -> consumer sink

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::engine::grid;
use crate::engine::types::{AggregatedBook, BookSink, FeedUpdate, InstrumentRef};
use crate::market_data::router::UpdateSink;
use crate::market_data::throttle::UpdateThrottle;

pub struct BookFeed {
    instrument: InstrumentRef,
    throttle: UpdateThrottle,
    sink: Arc<dyn BookSink>,
    // Newest grid, so a trade-only flush still resolves its row.
    last_grid: Mutex<Option<Arc<AggregatedBook>>>,
}

impl BookFeed {
    pub fn new(instrument: InstrumentRef, sink: Arc<dyn BookSink>) -> Arc<Self> {
        Arc::new(Self {
            instrument,
            throttle: UpdateThrottle::new(),
            sink,
            last_grid: Mutex::new(None),
        })
    }

    pub fn instrument(&self) -> &InstrumentRef {
        &self.instrument
    }

    pub fn last_grid(&self) -> Option<Arc<AggregatedBook>> {
        self.last_grid.lock().clone()
    }

    /// Deliver whatever is pending. Book first, then the trade against the
    /// grid that was just built (or the previous one for trade-only flushes).
    pub fn flush_once(&self) -> bool {
        match self.throttle.flush() {
            Some(update) => {
                self.deliver(update);
                true
            }
            None => false,
        }
    }

    fn deliver(&self, update: FeedUpdate) {
        if let Some(book) = update.book {
            let grid = Arc::new(grid::aggregate(
                &book.bids,
                &book.asks,
                self.instrument.price_step,
                self.instrument.lot_size,
            ));
            trace!(instrument = %self.instrument.id, rows = grid.rows.len(), "grid built");
            *self.last_grid.lock() = Some(grid.clone());
            self.sink.on_book_update(grid);
            counter!("lobgrid_book_flushes_total").increment(1);
        }

        if let Some(trade) = update.trade {
            let row = self.last_grid.lock().as_ref().and_then(|g| g.row_for_price(trade.price));
            self.sink.on_trade(trade, row);
        }
    }

    /// Flush on a fixed cadence until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move {
            debug!(instrument = %feed.instrument.id, interval_ms = interval.as_millis() as u64, "feed started");
            feed.throttle.run(interval, cancel, |update| feed.deliver(update)).await;
        })
    }
}

impl UpdateSink for BookFeed {
    fn on_update(&self, update: FeedUpdate) {
        self.throttle.push(update);
    }

    fn on_error(&self, message: &str) {
        self.sink.on_error(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{BookLevel, Direction, RawBook, Trade};

    #[derive(Default)]
    struct Recorder {
        books: Mutex<Vec<Arc<AggregatedBook>>>,
        trades: Mutex<Vec<(Trade, Option<usize>)>>,
        errors: Mutex<Vec<String>>,
    }

    impl BookSink for Recorder {
        fn on_book_update(&self, book: Arc<AggregatedBook>) {
            self.books.lock().push(book);
        }

        fn on_trade(&self, trade: Trade, row: Option<usize>) {
            self.trades.lock().push((trade, row));
        }

        fn on_error(&self, message: &str) {
            self.errors.lock().push(message.to_owned());
        }
    }

    fn feed() -> (Arc<BookFeed>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let feed = BookFeed::new(InstrumentRef::new("SBER", 0.01, 10), recorder.clone());
        (feed, recorder)
    }

    fn reference_book() -> RawBook {
        RawBook::new(
            vec![BookLevel::new(100.00, 5), BookLevel::new(99.99, 3)],
            vec![BookLevel::new(100.02, 4)],
        )
    }

    #[test]
    fn test_book_then_trade_in_one_flush() {
        let (feed, recorder) = feed();
        feed.on_update(FeedUpdate::book(reference_book()));
        feed.on_update(FeedUpdate::trade(Trade { price: 100.0, quantity: 2, direction: Direction::Sell }));

        assert!(feed.flush_once());
        assert_eq!(recorder.books.lock().len(), 1);
        let trades = recorder.trades.lock();
        assert_eq!(trades.len(), 1);
        // rows: 100.02, spread, 100.01, 100.00, 99.99
        assert_eq!(trades[0].1, Some(3));
    }

    #[test]
    fn test_trade_only_flush_uses_previous_grid() {
        let (feed, recorder) = feed();
        feed.on_update(FeedUpdate::book(reference_book()));
        feed.flush_once();

        feed.on_update(FeedUpdate::trade(Trade { price: 100.02, quantity: 1, direction: Direction::Buy }));
        feed.flush_once();

        assert_eq!(recorder.books.lock().len(), 1);
        assert_eq!(recorder.trades.lock()[0].1, Some(0));
    }

    #[test]
    fn test_trade_before_any_book_has_no_row() {
        let (feed, recorder) = feed();
        feed.on_update(FeedUpdate::trade(Trade { price: 1.0, quantity: 1, direction: Direction::Buy }));
        feed.flush_once();
        assert_eq!(recorder.trades.lock()[0].1, None);
    }

    #[test]
    fn test_empty_book_delivers_empty_grid() {
        let (feed, recorder) = feed();
        feed.on_update(FeedUpdate::book(RawBook::default()));
        feed.flush_once();
        let books = recorder.books.lock();
        assert_eq!(books.len(), 1);
        assert!(books[0].is_empty());
    }

    #[test]
    fn test_errors_bypass_throttle() {
        let (feed, recorder) = feed();
        feed.on_update(FeedUpdate::book(reference_book()));
        UpdateSink::on_error(feed.as_ref(), "stream closed by server");
        assert_eq!(*recorder.errors.lock(), vec!["stream closed by server".to_string()]);
        assert!(recorder.books.lock().is_empty());
    }

    #[test]
    fn test_nothing_pending() {
        let (feed, _) = feed();
        assert!(!feed.flush_once());
        assert!(feed.last_grid().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_feed_flushes_on_cadence() {
        let (feed, recorder) = feed();
        let cancel = CancellationToken::new();
        let task = feed.spawn(Duration::from_millis(50), cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            feed.on_update(FeedUpdate::book(reference_book()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.books.lock().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
