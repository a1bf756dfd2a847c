use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::{timeout, Instant},
};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::protocol::{codec::FrameSplitter, layout::FRAME_LEN};

use super::{Delivered, Delivery, ReceiveHandler, Transport, TransportError};


/// Quiet gap that ends a reply which never formed a frame.
const REPLY_IDLE: Duration = Duration::from_millis(250);

/// Request/response over a fresh TCP connection per frame.
///
/// Requests are fully serialized: a second `send` waits until the first
/// has its reply, or has timed out.
pub struct SocketTransport {
    addr: String,
    timeout: Duration,
    open: AtomicBool,
    session: Mutex<()>,
}

impl SocketTransport {
    /// `timeout` bounds the connect and the read, separately.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            timeout,
            open: AtomicBool::new(false),
            session: Mutex::new(()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn exchange(&self, frame: &[u8]) -> Result<Bytes, TransportError> {
        let mut stream = timeout(self.timeout, TcpStream::connect(&self.addr)).await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|err| TransportError::ConnectFailed {
                endpoint: self.addr.clone(),
                reason: err.to_string(),
            })?;

        stream.set_nodelay(true)?;
        stream.write_all(frame).await?;
        trace!(addr = %self.addr, "sent {}", hex::encode(frame));

        let reply = self.read_reply(&mut stream).await?;
        trace!(addr = %self.addr, "received {}", hex::encode(&reply));

        Ok(reply)
    }

    /// Reads until a whole frame has arrived.
    ///
    /// Bytes that never form a frame are still a reply: they are returned
    /// as received once the peer closes or goes quiet for `REPLY_IDLE`.
    async fn read_reply(&self, stream: &mut TcpStream) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + self.timeout;
        let mut splitter = FrameSplitter;
        let mut buffer = BytesMut::with_capacity(FRAME_LEN * 2);
        let mut received = BytesMut::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = if received.is_empty() { remaining } else { remaining.min(REPLY_IDLE) };

            let read = match timeout(wait, stream.read_buf(&mut buffer)).await {
                Err(_) if received.is_empty() => return Err(TransportError::Timeout(self.timeout)),
                Err(_) => return Ok(received.freeze()),
                Ok(read) => read?,
            };

            if read == 0 {
                return match splitter.decode_eof(&mut buffer)? {
                    Some(frame) => Ok(frame),
                    None if received.is_empty() => Err(TransportError::NoReply),
                    None => Ok(received.freeze()),
                };
            }

            received.extend_from_slice(&buffer[buffer.len() - read..]);

            if let Some(frame) = splitter.decode(&mut buffer)? {
                return Ok(frame);
            }
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn delivery(&self) -> Delivery {
        Delivery::Reply
    }

    async fn connect(&self) -> Result<(), TransportError> {
        // connections are per request, nothing to hold open
        self.open.store(true, Ordering::SeqCst);
        debug!(addr = %self.addr, "socket transport ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let _session = self.session.lock().await;
        self.open.store(false, Ordering::SeqCst);
        debug!(addr = %self.addr, "socket transport closed");
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<Delivered, TransportError> {
        let _session = self.session.lock().await;

        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        self.exchange(&frame).await.map(Delivered::Reply)
    }

    fn set_receive_handler(&self, _handler: ReceiveHandler) {
        debug!(addr = %self.addr, "socket replies are returned by send, receive handler unused");
    }
}
