//! Message transport beneath the signaling client
//!
//! The signaling client only sees [`Frame`]s; [`WsConnector`] maps them onto a
//! WebSocket, tests substitute an in-memory connector.

use std::pin::Pin;

use async_trait::async_trait;
use futures::future;
use futures::{Sink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::error::{Result, SessionError};

/// One transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SessionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An open, split connection
pub struct TransportChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transport connections for the signaling client.
///
/// Every call is one underlying connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<TransportChannel>;
}

/// WebSocket transport (tokio-tungstenite)
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<TransportChannel> {
        let (ws_stream, response) = connect_async(url.as_str()).await?;
        debug!(status = %response.status(), path = url.path(), "WebSocket upgrade complete");
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(SessionError::from)
            .with(|frame: Frame| future::ready(Ok::<_, SessionError>(to_ws(frame))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => from_ws(msg).map(Ok),
                Err(e) => Some(Err(SessionError::from(e))),
            })
        });

        Ok(TransportChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_ws(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Ping(payload) => Message::Ping(payload),
        Frame::Pong(payload) => Message::Pong(payload),
        Frame::Close => Message::Close(None),
    }
}

fn from_ws(msg: Message) -> Option<Frame> {
    match msg {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(bytes) => String::from_utf8(bytes).ok().map(Frame::Text),
        Message::Ping(payload) => Some(Frame::Ping(payload)),
        Message::Pong(payload) => Some(Frame::Pong(payload)),
        Message::Close(_) => Some(Frame::Close),
        Message::Frame(_) => None,
    }
}
