// Shared trait + event for market data transports

use async_trait::async_trait;

use crate::engine::types::{BookLevel, InstrumentId, Trade};
use crate::error::StreamResult;

/// Decoded once at the protocol boundary; nothing deeper probes wire fields.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    BookUpdate {
        instrument_id: InstrumentId,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
    Trade {
        instrument_id: InstrumentId,
        trade: Trade,
    },
    Heartbeat,
}

impl MarketEvent {
    pub fn instrument_id(&self) -> Option<&str> {
        match self {
            MarketEvent::BookUpdate { instrument_id, .. } | MarketEvent::Trade { instrument_id, .. } => {
                Some(instrument_id)
            }
            MarketEvent::Heartbeat => None,
        }
    }
}

// Everything a stream has to declare up front; it cannot change once open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub instruments: Vec<InstrumentId>,
    pub depth: u32,
}

#[async_trait]
pub trait MarketTransport: Send + Sync + 'static {
    /// Open one bidirectional stream subscribed to book depth and trades for
    /// every instrument in `request`.
    async fn open(&self, request: &SubscriptionRequest) -> StreamResult<Box<dyn MarketConnection>>;
}

#[async_trait]
pub trait MarketConnection: Send {
    /// Next decoded event; `None` once the server has closed the stream.
    /// Must be cancel-safe: it is raced against the keep-alive timer.
    async fn next_event(&mut self) -> Option<StreamResult<MarketEvent>>;

    async fn send_heartbeat(&mut self) -> StreamResult<()>;

    async fn close(&mut self);
}

pub mod tinvest;
pub mod tinvest_types;
