use std::fmt::Display;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use super::{ControlChannel, TransportError, TransportErrorKind, TransportKind};
use crate::message::{self, ControlMessage, DecodeError};

fn map_ws_error(err: impl Display) -> TransportError {
    TransportError::new(TransportErrorKind::Io, err.to_string())
}

fn map_encode_error(err: serde_json::Error) -> TransportError {
    TransportError::new(TransportErrorKind::EncodingFailure, err.to_string())
}

fn map_decode_error(err: DecodeError) -> TransportError {
    TransportError::new(TransportErrorKind::DecodingFailure, err.to_string())
}

/// Control channel over a WebSocket: one text frame per control message.
pub struct WsChannel<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsChannel<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl WsChannel<MaybeTlsStream<TcpStream>> {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(map_ws_error)?;
        Ok(Self::new(stream))
    }
}

impl WsChannel<TcpStream> {
    pub async fn accept(stream: TcpStream) -> Result<Self, TransportError> {
        let stream = accept_async(stream).await.map_err(map_ws_error)?;
        Ok(Self::new(stream))
    }
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Send a raw text frame, bypassing the codec.
    pub async fn send_raw(&mut self, text: impl Into<String>) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(map_ws_error)
    }
}

#[async_trait]
impl<S> ControlChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send_message(&mut self, message: &ControlMessage) -> Result<(), TransportError> {
        let bytes = message::encode(message).map_err(map_encode_error)?;
        let text = String::from_utf8(bytes).map_err(|err| {
            TransportError::new(TransportErrorKind::EncodingFailure, err.to_string())
        })?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn recv_message(&mut self) -> Result<ControlMessage, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return message::decode(text.as_bytes()).map_err(map_decode_error);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return message::decode(&bytes).map_err(map_decode_error);
                }
                // tungstenite answers pings itself on the next write or read.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::closed()),
                Some(Ok(other)) => {
                    return Err(TransportError::new(
                        TransportErrorKind::Unsupported,
                        format!("unsupported frame: {other:?}"),
                    ));
                }
                Some(Err(err)) => return Err(map_ws_error(err)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await.map_err(map_ws_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ControlKind;

    #[tokio::test]
    async fn ws_channel_roundtrip_and_bad_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut channel = WsChannel::accept(tcp).await.expect("accept ws");
            let bad = channel.recv_message().await.expect_err("garbage");
            assert!(bad.is_recoverable());
            let good = channel.recv_message().await.expect("recv");
            channel.send_message(&ControlMessage::pong(9, 1, 2)).await.expect("send");
            good
        });

        let mut client = WsChannel::connect(&format!("ws://{addr}"))
            .await
            .expect("connect");
        client.send_raw("{not json").await.expect("send raw");
        client
            .send_message(&ControlMessage::ping(9, 1))
            .await
            .expect("send");
        let reply = client.recv_message().await.expect("reply");

        assert_eq!(server.await.expect("join").kind(), ControlKind::Ping);
        assert_eq!(reply.kind(), ControlKind::Pong);
        assert_eq!(client.kind(), TransportKind::WebSocket);
    }
}
