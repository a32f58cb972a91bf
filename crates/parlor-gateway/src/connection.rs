//! Connection abstraction
//!
//! The hub never touches a socket directly. A connection is split into a
//! write half ([`FrameSink`]) owned by the writer pump and a read half
//! ([`FrameStream`]) owned by the reader pump.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;

/// One message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one frame
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError>;

    /// Send a close notice and shut the write half down
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Read half of a connection
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Next inbound frame, or `None` once the peer is gone
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        SinkExt::send(self, message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameStream for SplitStream<WebSocket> {
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        let message = match self.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e.into())),
        };
        let frame = match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        };
        Some(Ok(frame))
    }
}

/// Connection-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),
}
