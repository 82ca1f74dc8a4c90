//! WebSocket client transport for the inspector endpoint.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Chain, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    endpoint::Endpoint,
    frame::{Frame, FrameCodec},
    transport::{Transport, TransportError},
};

/// Handshake key. The inspector does not validate it.
pub const HANDSHAKE_KEY: &str = "key==";

/// Upper bound on the upgrade response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

type Reader<S> = FramedRead<Chain<Cursor<Vec<u8>>, ReadHalf<S>>, FrameCodec>;
type Writer<S> = FramedWrite<WriteHalf<S>, FrameCodec>;

/// Text-frame transport over an upgraded byte stream.
pub struct WebSocketTransport<S> {
    reader: Mutex<Reader<S>>,
    writer: Mutex<Writer<S>>,
}

impl WebSocketTransport<TcpStream> {
    /// Connect to the endpoint and perform the upgrade handshake.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        tracing::debug!(%endpoint, "connecting");
        let stream = TcpStream::connect(endpoint.authority()).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, endpoint).await
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Perform the upgrade handshake on an already connected stream.
    pub async fn handshake(mut stream: S, endpoint: &Endpoint) -> Result<Self, TransportError> {
        stream.write_all(upgrade_request(endpoint).as_bytes()).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(1024);
        let head_len = loop {
            if let Some(pos) = find_head_end(&buf) {
                break pos;
            }
            if buf.len() > MAX_RESPONSE_HEAD {
                return Err(TransportError::Handshake("response head too large".to_string()));
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(TransportError::Handshake(
                    "connection closed during handshake".to_string(),
                ));
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_len]).into_owned();
        check_status(&head)?;
        tracing::debug!(%endpoint, "upgrade accepted");

        let leftover = buf.split_off(head_len).to_vec();
        Ok(Self::from_upgraded(stream, leftover))
    }

    /// Wrap a stream that is already past the upgrade.
    ///
    /// `leftover` holds bytes read past the response head; they are decoded
    /// before anything else read from the stream.
    pub fn from_upgraded(stream: S, leftover: Vec<u8>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(
                Cursor::new(leftover).chain(read_half),
                FrameCodec::new(),
            )),
            writer: Mutex::new(FramedWrite::new(write_half, FrameCodec::new())),
        }
    }

    async fn echo_close(&self) {
        if let Err(e) = self.writer.lock().await.send(Frame::Close).await {
            tracing::debug!("failed to echo close frame: {e}");
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: String) -> Result<(), TransportError> {
        tracing::trace!(bytes = message.len(), "ws send");
        self.writer.lock().await.send(Frame::Text(message)).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Frame::Text(text))) => {
                    tracing::trace!(bytes = text.len(), "ws recv");
                    return Ok(Some(text));
                }
                Some(Ok(Frame::Close)) => {
                    tracing::debug!("peer sent close frame");
                    self.echo_close().await;
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(Frame::Close).await?;
        writer.get_mut().shutdown().await?;
        Ok(())
    }
}

/// The HTTP upgrade request for `endpoint`.
#[must_use]
pub fn upgrade_request(endpoint: &Endpoint) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {HANDSHAKE_KEY}\r\n\
         \r\n",
        path = endpoint.path,
        host = endpoint.authority(),
    )
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn check_status(head: &str) -> Result<(), TransportError> {
    let status_line = head.lines().next().unwrap_or_default();
    let code = status_line.split_whitespace().nth(1);
    if code == Some("101") {
        Ok(())
    } else {
        Err(TransportError::Handshake(format!(
            "unexpected response: {status_line}"
        )))
    }
}
