use crate::{
    config::CommConfig,
    connection::{Connection, ConnectionError},
    endpoint::Endpoint,
    envelope::{attr, Envelope},
    queue::BlockingQueue,
};
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error as ThisError;
use tokio::{fs::File, io::AsyncReadExt, task::JoinHandle};
use tracing::{Instrument, Span};

/// An item on the outbound queue.
#[derive(Debug)]
enum Outgoing {
    Envelope(Envelope),
    /// Ends the send task once everything posted before it is on the wire.
    Stop,
}

/// Drains posted envelopes onto the wire from a dedicated task.
///
/// The sender keeps at most one open connection. Each envelope is sent to its
/// `to` endpoint; when that differs from the endpoint of the open connection,
/// the connection is closed and a new one is made, and the same happens when
/// the peer has closed its end. Envelopes that cannot be delivered are logged
/// and dropped.
pub struct Sender {
    queue: Arc<BlockingQueue<Outgoing>>,
    config: CommConfig,
    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl Sender {
    pub fn new(config: CommConfig, parent: &Span) -> Self {
        Self {
            queue: Arc::new(BlockingQueue::new()),
            config,
            task: Mutex::new(None),
            span: tracing::info_span!(parent: parent, "sender"),
        }
    }

    /// Starts the send task. Does nothing if it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(tokio::spawn(
                send_loop(self.queue.clone(), self.config.clone()).instrument(self.span.clone()),
            ));
        }
    }

    /// Queues an envelope for sending and returns immediately.
    ///
    /// Posting after [`stop`](Sender::stop) is accepted but the envelope is
    /// never sent.
    pub fn post_message(&self, envelope: Envelope) {
        self.queue.enqueue(Outgoing::Envelope(envelope));
    }

    /// Number of envelopes waiting to be sent.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Lets the send task flush what was posted so far, then waits for it to
    /// exit.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            self.queue.enqueue(Outgoing::Stop);
            if let Err(e) = task.await {
                tracing::error!(parent: &self.span, "Send task failed: {}", e);
            }
        }
    }
}

async fn send_loop(queue: Arc<BlockingQueue<Outgoing>>, config: CommConfig) {
    let mut current: Option<(Endpoint, Connection)> = None;
    loop {
        let mut envelope = match queue.dequeue().await {
            Outgoing::Envelope(envelope) => envelope,
            Outgoing::Stop => break,
        };
        let to = match envelope.to() {
            Ok(to) => to,
            Err(e) => {
                tracing::warn!(command = envelope.command(), "Dropping envelope: {}", e);
                continue;
            }
        };
        // The peer reads a payload whenever it sees a content-length
        if envelope.file().is_none() && envelope.remove(attr::CONTENT_LENGTH).is_some() {
            tracing::debug!(
                command = envelope.command(),
                "Removed content-length from an envelope without a file"
            );
        }
        deliver(&mut current, &to, &envelope, &config).await;
    }

    if let Some((endpoint, mut connection)) = current.take() {
        connection.shutdown().await;
        tracing::debug!(%endpoint, "Closed connection");
    }
    tracing::debug!("Send task stopping");
}

/// Writes one envelope to `to`. A write that fails on a reused connection is
/// retried once on a new one; any other failure drops the envelope.
async fn deliver(
    current: &mut Option<(Endpoint, Connection)>,
    to: &Endpoint,
    envelope: &Envelope,
    config: &CommConfig,
) {
    loop {
        let (connection, fresh) = match connection_to(current, to, config).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(%to, command = envelope.command(), "Dropping envelope: {}", e);
                return;
            }
        };

        let sent = match envelope.file() {
            Some(file) => send_with_file(connection, envelope, file, config).await,
            None => connection
                .send_envelope(envelope)
                .await
                .map_err(SendError::Stream),
        };
        match sent {
            Ok(()) => {
                tracing::trace!(%to, command = envelope.command(), "Sent envelope");
                return;
            }
            Err(e @ SendError::File { .. }) => {
                tracing::warn!(%to, command = envelope.command(), "Dropping envelope: {}", e);
                return;
            }
            Err(SendError::Stream(e)) => {
                // Whatever was half-written makes the stream unusable
                if let Some((_, mut connection)) = current.take() {
                    connection.close();
                }
                if fresh {
                    tracing::warn!(%to, command = envelope.command(), "Dropping envelope: {}", e);
                    return;
                }
                tracing::debug!(%to, command = envelope.command(), "Resending on a new connection: {}", e);
            }
        }
    }
}

/// Returns the open connection to `to`, replacing whatever connection is open
/// to a different endpoint or has been closed by its peer. The flag is true
/// when the connection was just made.
async fn connection_to<'a>(
    current: &'a mut Option<(Endpoint, Connection)>,
    to: &Endpoint,
    config: &CommConfig,
) -> Result<(&'a mut Connection, bool), ConnectionError> {
    let reusable = match current.as_mut() {
        Some((endpoint, connection)) if *endpoint == *to && connection.is_valid() => {
            let closed = connection.peer_closed().await;
            if closed {
                tracing::debug!(endpoint = %to, "Peer closed the connection");
            }
            !closed
        }
        _ => false,
    };
    if !reusable {
        if let Some((endpoint, mut connection)) = current.take() {
            connection.shutdown().await;
            tracing::debug!(%endpoint, "Closed connection");
        }
        let connection = connect(to, config).await?;
        tracing::debug!(endpoint = %to, "Connected");
        *current = Some((to.clone(), connection));
    }
    current
        .as_mut()
        .map(|(_, connection)| (connection, !reusable))
        .ok_or(ConnectionError::Closed)
}

async fn connect(to: &Endpoint, config: &CommConfig) -> Result<Connection, ConnectionError> {
    let mut attempt = 1;
    loop {
        match Connection::connect(to).await {
            Ok(connection) => return Ok(connection),
            Err(e) if attempt < config.connect_attempts => {
                tracing::debug!(endpoint = %to, attempt, "Connect failed: {}", e);
                attempt += 1;
                tokio::time::sleep(config.connect_retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sends the envelope with its `content-length` filled in, then the file's
/// bytes in `chunk_size` blocks.
async fn send_with_file(
    connection: &mut Connection,
    envelope: &Envelope,
    file_name: &str,
    config: &CommConfig,
) -> Result<(), SendError> {
    let path = config.send_path.join(file_name);
    let file_error = |source: io::Error| SendError::File {
        path: path.display().to_string(),
        source,
    };
    let mut file = File::open(&path).await.map_err(file_error)?;
    let len = file.metadata().await.map_err(file_error)?.len();

    let mut header = envelope.clone();
    header.insert(attr::CONTENT_LENGTH, len.to_string());
    connection
        .send_envelope(&header)
        .await
        .map_err(SendError::Stream)?;

    // From here on the peer expects exactly `len` bytes, so any failure
    // leaves the stream unusable
    let mut buf = vec![0; config.chunk_size];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..want])
            .await
            .map_err(|e| SendError::Stream(e.into()))?;
        connection
            .send(&buf[..want])
            .await
            .map_err(SendError::Stream)?;
        remaining -= want as u64;
    }
    tracing::debug!(file = file_name, bytes = len, "Sent file");
    Ok(())
}

#[derive(Debug, ThisError)]
enum SendError {
    /// Nothing was written.
    #[error("Could not read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Stream(ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn accept_one(listener: &TcpListener) -> Connection {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("no connection arrived")
            .unwrap();
        Connection::from_stream(stream)
    }

    #[tokio::test]
    async fn reconnects_when_destination_changes() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ep_a = Endpoint::from(a.local_addr().unwrap());
        let ep_b = Endpoint::from(b.local_addr().unwrap());
        let me = Endpoint::new("127.0.0.1", 1);

        let sender = Sender::new(CommConfig::new(), &Span::none());
        sender.start();
        sender.post_message(Envelope::request("e1", &me, &ep_a));
        sender.post_message(Envelope::request("e2", &me, &ep_b));

        let mut conn_a = accept_one(&a).await;
        assert_eq!(conn_a.recv_envelope().await.unwrap().unwrap().command(), "e1");
        let mut conn_b = accept_one(&b).await;
        assert_eq!(conn_b.recv_envelope().await.unwrap().unwrap().command(), "e2");
        // The first connection was closed before the second was opened
        assert!(conn_a.recv_envelope().await.unwrap().is_none());

        sender.stop().await;
        assert!(conn_b.recv_envelope().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_destination_is_dropped() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let good = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let me = Endpoint::new("127.0.0.1", 1);

        let config = CommConfig::new()
            .connect_attempts(2)
            .connect_retry_delay(Duration::from_millis(10));
        let sender = Sender::new(config, &Span::none());
        sender.start();
        sender.post_message(Envelope::request("lost", &me, &Endpoint::new("127.0.0.1", port)));
        sender.post_message(Envelope::request("kept", &me, &Endpoint::from(good.local_addr().unwrap())));

        let mut conn = accept_one(&good).await;
        assert_eq!(conn.recv_envelope().await.unwrap().unwrap().command(), "kept");
        sender.stop().await;
    }

    #[tokio::test]
    async fn missing_file_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to = Endpoint::from(listener.local_addr().unwrap());
        let me = Endpoint::new("127.0.0.1", 1);

        let sender = Sender::new(CommConfig::new().send_path(dir.path()), &Span::none());
        sender.start();
        sender.post_message(Envelope::request("checkIn", &me, &to).with(attr::FILE, "absent.txt"));
        sender.post_message(Envelope::request("after", &me, &to));

        let mut conn = accept_one(&listener).await;
        let first = conn.recv_envelope().await.unwrap().unwrap();
        assert_eq!(first.command(), "after");
        sender.stop().await;
    }

    #[tokio::test]
    async fn reconnects_after_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to = Endpoint::from(listener.local_addr().unwrap());
        let me = Endpoint::new("127.0.0.1", 1);

        let sender = Sender::new(CommConfig::new(), &Span::none());
        sender.start();
        sender.post_message(Envelope::request("e1", &me, &to));
        let mut first = accept_one(&listener).await;
        assert_eq!(first.recv_envelope().await.unwrap().unwrap().command(), "e1");
        first.close();

        sender.post_message(Envelope::request("e2", &me, &to));
        sender.post_message(Envelope::request("e3", &me, &to));
        let mut second = accept_one(&listener).await;
        assert_eq!(second.recv_envelope().await.unwrap().unwrap().command(), "e2");
        assert_eq!(second.recv_envelope().await.unwrap().unwrap().command(), "e3");
        sender.stop().await;
    }

    #[tokio::test]
    async fn content_length_without_file_is_removed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to = Endpoint::from(listener.local_addr().unwrap());
        let me = Endpoint::new("127.0.0.1", 1);

        let sender = Sender::new(CommConfig::new(), &Span::none());
        sender.start();
        sender.post_message(Envelope::request("meta", &me, &to).with(attr::CONTENT_LENGTH, "5"));
        sender.post_message(
            Envelope::request("blank", &me, &to)
                .with(attr::FILE, "")
                .with(attr::CONTENT_LENGTH, "5"),
        );
        sender.post_message(Envelope::request("after", &me, &to));

        let mut conn = accept_one(&listener).await;
        let meta = conn.recv_envelope().await.unwrap().unwrap();
        assert_eq!(meta.command(), "meta");
        assert!(!meta.contains_key(attr::CONTENT_LENGTH));
        let blank = conn.recv_envelope().await.unwrap().unwrap();
        assert!(!blank.contains_key(attr::CONTENT_LENGTH));
        assert_eq!(conn.recv_envelope().await.unwrap().unwrap().command(), "after");
        sender.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_posted_envelopes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to = Endpoint::from(listener.local_addr().unwrap());
        let me = Endpoint::new("127.0.0.1", 1);

        let sender = Sender::new(CommConfig::new(), &Span::none());
        sender.start();
        for i in 0..20 {
            sender.post_message(Envelope::request(i.to_string(), &me, &to));
        }
        let accept = tokio::spawn(async move { accept_one(&listener).await });
        sender.stop().await;
        assert_eq!(sender.pending(), 0);

        let mut conn = accept.await.unwrap();
        for i in 0..20 {
            assert_eq!(
                conn.recv_envelope().await.unwrap().unwrap().command(),
                i.to_string()
            );
        }
        assert!(conn.recv_envelope().await.unwrap().is_none());

        // Accepted but never sent
        sender.post_message(Envelope::request("late", &me, &to));
        assert_eq!(sender.pending(), 1);
    }
}
