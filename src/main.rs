use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lobgrid_rs::config::{Cli, InstrumentCatalog, Settings};
use lobgrid_rs::engine::types::{AggregatedBook, BookSink, InstrumentId, Trade};
use lobgrid_rs::market_data::adapters::tinvest::TinvestTransport;
use lobgrid_rs::market_data::book_feed::BookFeed;
use lobgrid_rs::market_data::router::StreamMultiplexer;
use lobgrid_rs::telemetry;

// Stand-in for a UI pane: logs what a renderer would draw.
struct LogSink {
    instrument: InstrumentId,
}

impl BookSink for LogSink {
    fn on_book_update(&self, book: Arc<AggregatedBook>) {
        if book.is_empty() {
            debug!(instrument = %self.instrument, "no data");
            return;
        }
        let top = book.price_rows().next().map(|r| r.price);
        debug!(
            instrument = %self.instrument,
            rows = book.rows.len(),
            top,
            spread_row = book.spread_index(),
            max_volume = book.max_volume,
            max_sum = book.max_sum,
            "book"
        );
    }

    fn on_trade(&self, trade: Trade, row: Option<usize>) {
        info!(
            instrument = %self.instrument,
            price = trade.price,
            quantity = trade.quantity,
            direction = ?trade.direction,
            row,
            "trade"
        );
    }

    fn on_error(&self, message: &str) {
        warn!(instrument = %self.instrument, error = message, "stream error");
    }
}

// Step and lot size come from the catalog at registration time and stay fixed.
fn subscribe(
    mux: &StreamMultiplexer,
    catalog: &impl InstrumentCatalog,
    id: &str,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let instrument = catalog.lookup(id)?;
    let sink = Arc::new(LogSink { instrument: instrument.id.clone() });
    let feed = BookFeed::new(instrument, sink);
    let flusher = feed.spawn(flush_interval, cancel);
    mux.register(id, feed);
    Some(flusher)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    telemetry::init_tracing("info");

    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    info!(?settings, "starting lobgrid");

    if let Some(port) = settings.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let transport = Arc::new(TinvestTransport::new(
        settings.token(),
        settings.endpoint.clone(),
        settings.connect_timeout(),
    ));
    let mux = StreamMultiplexer::new(transport, settings.mux_config());
    let cancel = CancellationToken::new();

    let mut flushers = Vec::new();
    for id in settings.instrument_ids() {
        match subscribe(&mux, &settings, &id, settings.flush_interval(), cancel.clone()) {
            Some(flusher) => flushers.push(flusher),
            None => warn!(instrument = %id, "no metadata for instrument, skipped"),
        }
    }

    let mut state = mux.watch_state();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("received ctrl-c, shutting down");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!(state = ?current, "multiplexer");
            }
        }
    }

    mux.shutdown().await;
    cancel.cancel();
    for flusher in flushers {
        flusher.await?;
    }
    info!("stopped");
    Ok(())
}
