//! A duplex byte stream to one peer.
//!
//! A [`Connection`] owns one TCP stream for its whole life. It is created
//! either by [`Connection::connect`] or by a [`Listener`](crate::Listener)
//! accepting a peer, and it moves between tasks by value; it is never shared.
//! Once closed, every operation fails with [`ConnectionError::Closed`].

use crate::{
    endpoint::Endpoint,
    envelope::Envelope,
    wire::{self, WireError},
};
use futures::FutureExt;
use std::{io, net::SocketAddr, time::Duration};
use thiserror::Error as ThisError;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

pub struct Connection {
    halves: Option<Halves>,
    peer: Option<SocketAddr>,
}

struct Halves {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    /// Opens a connection to `endpoint`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ConnectionError> {
        let host = endpoint
            .address
            .trim_start_matches('[')
            .trim_end_matches(']');
        let stream = TcpStream::connect((host, endpoint.port))
            .await
            .map_err(|source| ConnectionError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already connected stream, as handed out by `accept`.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle's algorithm: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Self {
            halves: Some(Halves {
                reader: BufReader::new(reader),
                writer: BufWriter::new(writer),
            }),
            peer,
        }
    }

    fn halves(&mut self) -> Result<&mut Halves, ConnectionError> {
        self.halves.as_mut().ok_or(ConnectionError::Closed)
    }

    /// Whether the connection can still be used.
    pub fn is_valid(&self) -> bool {
        self.halves.is_some()
    }

    /// The remote side of the connection, as it was when it was opened.
    pub fn peer_endpoint(&self) -> Option<Endpoint> {
        self.peer.map(Endpoint::from)
    }

    /// Writes all of `bytes` and flushes them to the socket.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let halves = self.halves()?;
        halves.writer.write_all(bytes).await?;
        halves.writer.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes.
    pub async fn recv(&mut self, len: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = vec![0; len];
        self.recv_into(&mut buf).await?;
        Ok(buf)
    }

    /// Fills `buf` completely from the stream.
    pub async fn recv_into(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        let halves = self.halves()?;
        match halves.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(WireError::UnexpectedEof.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sends `text` followed by `terminator`.
    pub async fn send_string(&mut self, text: &str, terminator: u8) -> Result<(), ConnectionError> {
        if text.as_bytes().contains(&terminator) {
            return Err(WireError::Unencodable(text.to_string()).into());
        }
        let halves = self.halves()?;
        halves.writer.write_all(text.as_bytes()).await?;
        halves.writer.write_all(&[terminator]).await?;
        halves.writer.flush().await?;
        Ok(())
    }

    /// Reads up to and including `terminator`, returning the text before it.
    pub async fn recv_string(&mut self, terminator: u8) -> Result<String, ConnectionError> {
        let halves = self.halves()?;
        wire::read_terminated(&mut halves.reader, terminator)
            .await?
            .ok_or(ConnectionError::Disconnected)
    }

    /// Serializes and sends one envelope.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let bytes = wire::encode_envelope(envelope)?;
        self.send(&bytes).await
    }

    /// Reads one envelope, or `None` if the peer closed the stream between
    /// envelopes.
    pub async fn recv_envelope(&mut self) -> Result<Option<Envelope>, ConnectionError> {
        let halves = self.halves()?;
        Ok(wire::read_envelope(&mut halves.reader).await?)
    }

    /// Number of bytes that can be read without waiting. Nothing is consumed.
    ///
    /// Counts what is buffered plus what the socket holds once the runtime
    /// has had one chance to poll for new readiness. Bytes still in flight
    /// are not counted.
    pub async fn bytes_waiting(&mut self) -> usize {
        let Some(halves) = self.halves.as_mut() else {
            return 0;
        };
        let buffered = halves.reader.buffer().len();
        tokio::task::yield_now().await;
        let mut peek = [0u8; 4096];
        let in_socket = halves
            .reader
            .get_mut()
            .peek(&mut peek)
            .now_or_never()
            .and_then(Result::ok)
            .unwrap_or(0);
        buffered + in_socket
    }

    /// Whether the peer has closed or reset the stream, judged without
    /// waiting for it. A stream whose state the runtime has not observed yet
    /// counts as open.
    pub async fn peer_closed(&mut self) -> bool {
        let Some(halves) = self.halves.as_mut() else {
            return true;
        };
        if !halves.reader.buffer().is_empty() {
            return false;
        }
        tokio::task::yield_now().await;
        let mut byte = [0u8; 1];
        matches!(
            halves.reader.get_mut().peek(&mut byte).now_or_never(),
            Some(Ok(0) | Err(_))
        )
    }

    /// Waits up to `timeout` for readable data. Returns false on timeout,
    /// end of stream or error.
    pub async fn wait_for_data(&mut self, timeout: Duration) -> bool {
        let Some(halves) = self.halves.as_mut() else {
            return false;
        };
        matches!(
            tokio::time::timeout(timeout, halves.reader.fill_buf()).await,
            Ok(Ok(buf)) if !buf.is_empty()
        )
    }

    /// Flushes pending output and signals end of stream to the peer. Reading
    /// remains possible.
    pub async fn shutdown_send(&mut self) -> Result<(), ConnectionError> {
        let halves = self.halves()?;
        halves.writer.shutdown().await?;
        Ok(())
    }

    /// Shuts the stream down in both directions and closes it. Calling this
    /// on a closed connection does nothing.
    pub async fn shutdown(&mut self) {
        if let Some(mut halves) = self.halves.take() {
            if let Err(e) = halves.writer.shutdown().await {
                tracing::trace!("Shutdown of connection to {:?} failed: {}", self.peer, e);
            }
        }
    }

    /// Releases the stream without a graceful shutdown. Idempotent.
    pub fn close(&mut self) {
        self.halves = None;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_valid())
            .finish()
    }
}

#[derive(Debug, ThisError)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,
    #[error("Peer closed the connection")]
    Disconnected,
    #[error("Could not connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Wire(#[from] WireError),
    #[error("{0}")]
    Io(#[from] io::Error),
}
