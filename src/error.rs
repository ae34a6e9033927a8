//! Transport-level failures. Everything below the stream layer sanitises bad
//! data instead of failing, so this is the only error type the library surfaces.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid authorization header")]
    InvalidToken(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("stream closed by server")]
    Closed,
}

pub type StreamResult<T> = Result<T, StreamError>;
