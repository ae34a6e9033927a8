// Market data module entrypoint
pub mod adapters;   // transport trait + T-Invest websocket stream
pub mod book_feed;  // per-instrument throttle -> grid -> consumer pipeline
pub mod normaliser; // wire quotations -> f64 prices / lot counts
pub mod router;     // stream multiplexer: one connection, many instruments
pub mod throttle;   // latest-value-wins flush buffer
