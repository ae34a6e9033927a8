// Source: T-Invest API MarketDataStreamService, JSON websocket transport.
// Proto3 JSON: int64 arrives as a string, zero-valued fields are omitted.

use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use crate::market_data::adapters::SubscriptionRequest;

pub const SUBSCRIBE: &str = "SUBSCRIPTION_ACTION_SUBSCRIBE";
pub const SUBSCRIPTION_OK: &str = "SUBSCRIPTION_STATUS_SUCCESS";
pub const DIRECTION_BUY: &str = "TRADE_DIRECTION_BUY";
pub const DIRECTION_SELL: &str = "TRADE_DIRECTION_SELL";

/// One server frame. Exactly one payload field is set per frame.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsResponse {
    #[serde(default)]
    pub orderbook: Option<WsOrderBook>,
    #[serde(default)]
    pub trade: Option<WsTrade>,
    #[serde(default)]
    pub ping: Option<Value>,
    #[serde(default)]
    pub subscribe_order_book_response: Option<WsOrderBookSubscriptions>,
    #[serde(default)]
    pub subscribe_trades_response: Option<WsTradeSubscriptions>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WsQuotation {
    #[serde(default, deserialize_with = "int64")]
    pub units: i64,
    #[serde(default)]
    pub nano: i32,
}

#[derive(Debug, Deserialize)]
pub struct WsOrder {
    #[serde(default)]
    pub price: WsQuotation,
    #[serde(default, deserialize_with = "int64")]
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsOrderBook {
    #[serde(default)]
    pub figi: String,
    #[serde(default)]
    pub instrument_uid: Option<String>,
    #[serde(default)]
    pub depth: i32,
    #[serde(default)]
    pub bids: Vec<WsOrder>,
    #[serde(default)]
    pub asks: Vec<WsOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsTrade {
    #[serde(default)]
    pub figi: String,
    #[serde(default)]
    pub instrument_uid: Option<String>,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub price: Option<WsQuotation>,
    #[serde(default, deserialize_with = "int64")]
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsOrderBookSubscriptions {
    #[serde(default)]
    pub order_book_subscriptions: Vec<WsSubscriptionStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsTradeSubscriptions {
    #[serde(default)]
    pub trade_subscriptions: Vec<WsSubscriptionStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSubscriptionStatus {
    #[serde(default)]
    pub figi: String,
    #[serde(default)]
    pub instrument_uid: Option<String>,
    #[serde(default)]
    pub subscription_status: String,
}

impl WsSubscriptionStatus {
    pub fn is_ok(&self) -> bool {
        self.subscription_status == SUBSCRIPTION_OK
    }
}

// int64 fields: quoted per proto3 JSON, but accept bare numbers too
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

pub fn order_book_request(request: &SubscriptionRequest) -> Value {
    let instruments: Vec<Value> = request
        .instruments
        .iter()
        .map(|id| json!({ "instrumentId": id, "depth": request.depth }))
        .collect();
    json!({
        "subscribeOrderBookRequest": {
            "subscriptionAction": SUBSCRIBE,
            "instruments": instruments,
        }
    })
}

/// Empty `MarketDataRequest`; the stream service treats it as a keep-alive.
pub fn keepalive_request() -> Value {
    json!({})
}

pub fn trades_request(request: &SubscriptionRequest) -> Value {
    let instruments: Vec<Value> = request
        .instruments
        .iter()
        .map(|id| json!({ "instrumentId": id }))
        .collect();
    json!({
        "subscribeTradesRequest": {
            "subscriptionAction": SUBSCRIBE,
            "instruments": instruments,
        }
    })
}
