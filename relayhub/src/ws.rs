//! Websocket halves of a session's signaling channel
//!
//! Envelopes travel as text frames; ping/pong and binary frames are skipped.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relayhub_sfu::{SignalMessage, SignalSink, SignalSource, SignalingError};

pub struct WsSignalSource {
    receiver: SplitStream<WebSocket>,
}

pub struct WsSignalSink {
    sender: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into signaling halves
pub fn split(socket: WebSocket) -> (WsSignalSource, WsSignalSink) {
    let (sender, receiver) = socket.split();
    (WsSignalSource { receiver }, WsSignalSink { sender })
}

#[async_trait]
impl SignalSource for WsSignalSource {
    async fn recv(&mut self) -> Option<Result<SignalMessage, SignalingError>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(SignalMessage::from_json(&text)),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(SignalingError::Read(e.to_string()))),
                Some(Ok(_)) => {}
            }
        }
    }
}

#[async_trait]
impl SignalSink for WsSignalSink {
    async fn send(&mut self, message: SignalMessage) -> Result<(), SignalingError> {
        let text = message.to_json().map_err(|source| SignalingError::Encode {
            what: "message",
            source,
        })?;
        self.sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SignalingError::Write(e.to_string()))
    }
}
