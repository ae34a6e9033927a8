// T-Invest market data stream over the JSON websocket gateway

use std::time::Duration;

use ahash::AHashSet;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use itertools::Itertools;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::tinvest_types::{
    keepalive_request, order_book_request, trades_request, WsResponse, WsSubscriptionStatus, DIRECTION_BUY,
    DIRECTION_SELL,
};
use super::{MarketConnection, MarketEvent, MarketTransport, SubscriptionRequest};
use crate::engine::types::{Direction, InstrumentId, Trade};
use crate::error::{StreamError, StreamResult};
use crate::market_data::normaliser;

pub const DEFAULT_ENDPOINT: &str =
    "wss://invest-public-api.tinkoff.ru/ws/tinkoff.public.invest.api.contract.v1.MarketDataStreamService/MarketDataStream";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One instance per API token.
pub struct TinvestTransport {
    pub token: String,
    pub endpoint: String,
    pub connect_timeout: Duration,
}

impl TinvestTransport {
    pub fn new(token: impl Into<String>, endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            token: token.into(),
            endpoint: endpoint.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl MarketTransport for TinvestTransport {
    async fn open(&self, request: &SubscriptionRequest) -> StreamResult<Box<dyn MarketConnection>> {
        let mut ws_request = self.endpoint.as_str().into_client_request()?;
        let headers = ws_request.headers_mut();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", self.token))?);
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("json"));

        info!(
            endpoint = %self.endpoint,
            instruments = %request.instruments.iter().join(","),
            depth = request.depth,
            "connecting"
        );

        let (ws_stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(ws_request))
            .await
            .map_err(|_| StreamError::ConnectTimeout(self.connect_timeout))??;
        debug!(status = %response.status(), "websocket handshake done");

        let (mut write, read) = ws_stream.split();

        // The gateway only accepts the instrument set at the start of a stream.
        write.send(Message::Text(order_book_request(request).to_string())).await?;
        write.send(Message::Text(trades_request(request).to_string())).await?;

        Ok(Box::new(TinvestConnection {
            write,
            read,
            subscribed: request.instruments.iter().cloned().collect(),
        }))
    }
}

pub struct TinvestConnection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    subscribed: AHashSet<InstrumentId>,
}

#[async_trait]
impl MarketConnection for TinvestConnection {
    async fn next_event(&mut self) -> Option<StreamResult<MarketEvent>> {
        loop {
            let text = match self.read.next().await? {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(_) | Message::Pong(_)) => return Some(Ok(MarketEvent::Heartbeat)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "close frame received");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            };

            match decode(&text, &self.subscribed) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, payload_head = head(&text), "parse error");
                }
            }
        }
    }

    // Goes to the stream service itself, not just the websocket layer.
    async fn send_heartbeat(&mut self) -> StreamResult<()> {
        self.write.send(Message::Text(keepalive_request().to_string())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            debug!(error = %e, "close handshake failed");
        }
    }
}

/// Decode one text frame. `Ok(None)` for frames that carry nothing routable
/// (subscription acks, unknown payloads, trades with no direction or price).
pub fn decode(text: &str, subscribed: &AHashSet<InstrumentId>) -> serde_json::Result<Option<MarketEvent>> {
    let frame: WsResponse = serde_json::from_str(text)?;

    if let Some(book) = frame.orderbook {
        return Ok(Some(MarketEvent::BookUpdate {
            instrument_id: route_id(book.figi, book.instrument_uid, subscribed),
            bids: normaliser::side(&book.bids),
            asks: normaliser::side(&book.asks),
        }));
    }

    if let Some(trade) = frame.trade {
        let direction = match trade.direction.as_str() {
            DIRECTION_BUY => Direction::Buy,
            DIRECTION_SELL => Direction::Sell,
            other => {
                trace!(figi = %trade.figi, direction = other, "trade without direction");
                return Ok(None);
            }
        };
        let Some(price) = trade
            .price
            .map(normaliser::quotation_to_price)
            .filter(|p| p.is_finite())
        else {
            trace!(figi = %trade.figi, "trade without price");
            return Ok(None);
        };
        return Ok(Some(MarketEvent::Trade {
            instrument_id: route_id(trade.figi, trade.instrument_uid, subscribed),
            trade: Trade {
                price,
                quantity: normaliser::quantity_to_lots(trade.quantity),
                direction,
            },
        }));
    }

    if frame.ping.is_some() {
        return Ok(Some(MarketEvent::Heartbeat));
    }

    if let Some(acks) = frame.subscribe_order_book_response {
        report_subscriptions("orderbook", &acks.order_book_subscriptions);
    }
    if let Some(acks) = frame.subscribe_trades_response {
        report_subscriptions("trades", &acks.trade_subscriptions);
    }
    Ok(None)
}

// Route by the id the caller subscribed with: UID when that is what was asked for, else FIGI.
fn route_id(figi: String, uid: Option<String>, subscribed: &AHashSet<InstrumentId>) -> InstrumentId {
    match uid {
        Some(uid) if subscribed.contains(&uid) => uid,
        _ => figi,
    }
}

fn report_subscriptions(kind: &'static str, statuses: &[WsSubscriptionStatus]) {
    for status in statuses {
        if status.is_ok() {
            debug!(kind, figi = %status.figi, "subscribed");
        } else {
            warn!(
                kind,
                figi = %status.figi,
                uid = ?status.instrument_uid,
                status = %status.subscription_status,
                "subscription rejected"
            );
        }
    }
}

fn head(text: &str) -> &str {
    let end = text.char_indices().nth(200).map_or(text.len(), |(i, _)| i);
    &text[..end]
}
