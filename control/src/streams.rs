use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::instrument;

use crate::codec::{Error, Message, MessageType, NdtCodec};

/// Attempts made for a send interrupted by a transient condition.
pub const SEND_ATTEMPTS: u32 = 5;

/// Default deadline for a single receive.
pub const RECV_DEADLINE: std::time::Duration = std::time::Duration::from_secs(600);

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}

fn is_peer_gone(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Framed send half of a control connection.
///
/// Generic over the underlying writer type so tests can run over in-memory pipes.
#[derive(Debug)]
pub struct SendStream<W = OwnedWriteHalf> {
    framed: tokio_util::codec::FramedWrite<W, NdtCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(stream, NdtCodec::default());
        Self { framed }
    }

    /// Sends one message, retrying transient write interruptions.
    ///
    /// The frame stays buffered between attempts, so a retry resumes where the
    /// interrupted write stopped.
    #[instrument(level = "trace", skip(self, message), fields(kind = %message.kind, len = message.payload.len()))]
    pub async fn send(&mut self, message: Message) -> Result<(), Error> {
        self.framed.feed(message).await?;
        let mut attempts = 0;
        loop {
            match self.framed.flush().await {
                Ok(()) => return Ok(()),
                Err(Error::Io(err)) if is_transient(&err) => {
                    attempts += 1;
                    if attempts >= SEND_ATTEMPTS {
                        return Err(Error::RetriesExhausted(attempts));
                    }
                    tracing::debug!("send interrupted ({err}), retrying, attempt {attempts}");
                }
                Err(Error::Io(err)) if is_peer_gone(&err) => return Err(Error::PeerClosed),
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn send_text(&mut self, kind: MessageType, text: &str) -> Result<(), Error> {
        self.send(Message::new(kind, text.to_string())).await
    }

    pub async fn send_empty(&mut self, kind: MessageType) -> Result<(), Error> {
        self.send(Message::empty(kind)).await
    }

    /// Writes bytes outside of any frame (the legacy probe).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut attempts = 0;
        let stream = self.framed.get_mut();
        loop {
            match stream.write_all(bytes).await {
                Ok(()) => break,
                Err(err) if is_transient(&err) => {
                    attempts += 1;
                    if attempts >= SEND_ATTEMPTS {
                        return Err(Error::RetriesExhausted(attempts));
                    }
                }
                Err(err) if is_peer_gone(&err) => return Err(Error::PeerClosed),
                Err(err) => return Err(err.into()),
            }
        }
        stream.flush().await?;
        Ok(())
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.framed.close().await
    }
}

/// Framed receive half of a control connection.
#[derive(Debug)]
pub struct RecvStream<R = OwnedReadHalf> {
    framed: tokio_util::codec::FramedRead<R, NdtCodec>,
    deadline: std::time::Duration,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(stream, NdtCodec::default());
        Self {
            framed,
            deadline: RECV_DEADLINE,
        }
    }

    pub fn set_deadline(&mut self, deadline: std::time::Duration) {
        self.deadline = deadline;
    }

    /// Receives one message of at most `capacity` payload bytes within the default deadline.
    pub async fn recv(&mut self, capacity: usize) -> Result<Message, Error> {
        self.recv_within(capacity, self.deadline).await
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn recv_within(
        &mut self,
        capacity: usize,
        deadline: std::time::Duration,
    ) -> Result<Message, Error> {
        self.framed.decoder_mut().set_capacity(capacity);
        match tokio::time::timeout(deadline, self.framed.next()).await {
            Err(_) => Err(Error::Timeout(deadline)),
            Ok(None) => Err(Error::PeerClosed),
            Ok(Some(Err(Error::Io(err)))) if is_peer_gone(&err) => Err(Error::PeerClosed),
            Ok(Some(res)) => res,
        }
    }

    /// Receives a message and checks its type.
    pub async fn expect(&mut self, kind: MessageType, capacity: usize) -> Result<Message, Error> {
        let message = self.recv(capacity).await?;
        if message.kind != kind {
            return Err(Error::UnexpectedType {
                expected: kind,
                actual: message.kind,
            });
        }
        Ok(message)
    }

    pub fn get_ref(&self) -> &R {
        self.framed.get_ref()
    }
}

/// Control connection to one client (bidirectional TCP connection).
#[derive(Debug)]
pub struct ControlConnection {
    send: SendStream,
    recv: RecvStream,
    peer: std::net::SocketAddr,
    local: std::net::SocketAddr,
}

impl ControlConnection {
    /// Create a control connection from a TCP stream
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            send: SendStream::new(write_half),
            recv: RecvStream::new(read_half),
            peer,
            local,
        })
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local
    }

    /// The underlying socket, e.g. for reading TCP counters.
    pub fn socket(&self) -> &TcpStream {
        self.recv.get_ref().as_ref()
    }

    pub fn set_deadline(&mut self, deadline: std::time::Duration) {
        self.recv.set_deadline(deadline);
    }

    pub async fn send(&mut self, message: Message) -> Result<(), Error> {
        self.send.send(message).await
    }

    pub async fn send_text(&mut self, kind: MessageType, text: &str) -> Result<(), Error> {
        self.send.send_text(kind, text).await
    }

    pub async fn send_empty(&mut self, kind: MessageType) -> Result<(), Error> {
        self.send.send_empty(kind).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.send.write_raw(bytes).await
    }

    pub async fn recv(&mut self, capacity: usize) -> Result<Message, Error> {
        self.recv.recv(capacity).await
    }

    pub async fn recv_within(
        &mut self,
        capacity: usize,
        deadline: std::time::Duration,
    ) -> Result<Message, Error> {
        self.recv.recv_within(capacity, deadline).await
    }

    pub async fn expect(&mut self, kind: MessageType, capacity: usize) -> Result<Message, Error> {
        self.recv.expect(kind, capacity).await
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.send.close().await
    }

    /// Get mutable access to send stream
    pub fn send_mut(&mut self) -> &mut SendStream {
        &mut self.send
    }

    /// Get mutable access to recv stream
    pub fn recv_mut(&mut self) -> &mut RecvStream {
        &mut self.recv
    }
}
