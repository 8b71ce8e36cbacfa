use crate::{
    config::CommConfig,
    connection::{Connection, ConnectionError},
    endpoint::Endpoint,
    envelope::{attr, Envelope},
    listener::{Listener, ListenerError},
    queue::BlockingQueue,
    wire::WireError,
};
use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error as ThisError;
use tokio::{fs::File, io::AsyncWriteExt, select};
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Accepts peers on a local endpoint and turns what they send into envelopes
/// on the inbound queue.
///
/// A peer may send any number of envelopes over one connection. An envelope
/// that declares a `content-length` is followed by that many file bytes,
/// which are written under the configured save directory before the envelope
/// is queued.
pub struct Receiver {
    queue: Arc<BlockingQueue<Envelope>>,
    listener: Listener,
    config: CommConfig,
}

impl Receiver {
    pub fn new(endpoint: Endpoint, config: CommConfig, parent: &Span) -> Self {
        let span = tracing::info_span!(parent: parent, "receiver");
        Self {
            queue: Arc::new(BlockingQueue::new()),
            listener: Listener::new(endpoint, config.listen_backlog, &span),
            config,
        }
    }

    /// Starts listening. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ListenerError> {
        let queue = self.queue.clone();
        let config = Arc::new(self.config.clone());
        self.listener
            .start(move |connection, cancel| {
                serve_connection(connection, cancel, queue.clone(), config.clone())
            })
            .await
    }

    /// Stops listening and closes every inbound connection. Envelopes already
    /// queued stay available to [`get_message`](Receiver::get_message).
    pub async fn stop(&self) {
        self.listener.stop().await;
    }

    /// Waits for the next envelope.
    pub async fn get_message(&self) -> Envelope {
        self.queue.dequeue().await
    }

    pub fn try_get_message(&self) -> Option<Envelope> {
        self.queue.try_dequeue()
    }

    /// The inbound queue itself.
    pub fn queue(&self) -> Arc<BlockingQueue<Envelope>> {
        self.queue.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }
}

async fn serve_connection(
    mut connection: Connection,
    cancel: CancellationToken,
    queue: Arc<BlockingQueue<Envelope>>,
    config: Arc<CommConfig>,
) {
    loop {
        let envelope = select! {
            _ = cancel.cancelled() => break,
            received = connection.recv_envelope() => match received {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    tracing::debug!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Closing connection: {}", e);
                    break;
                }
            }
        };

        if envelope.content_length().is_some() {
            match receive_file(&mut connection, &envelope, &config, &cancel).await {
                Ok(path) => tracing::debug!(path = %path.display(), "Received file"),
                Err(e) => {
                    tracing::warn!(
                        command = envelope.command(),
                        "Discarding envelope and closing connection: {}",
                        e
                    );
                    break;
                }
            }
        }

        tracing::trace!(command = envelope.command(), "Queued envelope");
        queue.enqueue(envelope);
    }
    connection.close();
}

/// Reads the payload that follows a file envelope into the save directory.
/// A partially written file is removed.
async fn receive_file(
    connection: &mut Connection,
    envelope: &Envelope,
    config: &CommConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf, ReceiveError> {
    let len = match envelope.content_length() {
        Some(Ok(len)) => len,
        Some(Err(_)) | None => {
            let raw = envelope.get(attr::CONTENT_LENGTH).unwrap_or_default();
            return Err(WireError::InvalidLength(raw.to_string()).into());
        }
    };
    let name = envelope.file().ok_or(ReceiveError::MissingFileName)?;
    let path = save_location(&config.save_path, name)?;

    tokio::fs::create_dir_all(&config.save_path).await?;
    let written = select! {
        _ = cancel.cancelled() => Err(ReceiveError::Cancelled),
        written = write_payload(connection, &path, len, config.chunk_size) => written,
    };
    if written.is_err() {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), "Could not remove partial file: {}", e);
        }
    }
    written.map(|_| path)
}

async fn write_payload(
    connection: &mut Connection,
    path: &Path,
    len: u64,
    chunk_size: usize,
) -> Result<(), ReceiveError> {
    let mut file = File::create(path).await?;
    let mut buf = vec![0; chunk_size];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        connection.recv_into(&mut buf[..want]).await?;
        file.write_all(&buf[..want]).await?;
        remaining -= want as u64;
    }
    file.flush().await?;
    Ok(())
}

/// Only the last component of the peer's file name is used, so the file
/// always lands directly inside `save_path`.
fn save_location(save_path: &Path, name: &str) -> Result<PathBuf, ReceiveError> {
    Path::new(name)
        .file_name()
        .map(|file_name| save_path.join(file_name))
        .ok_or_else(|| ReceiveError::InvalidFileName(name.to_string()))
}

#[derive(Debug, ThisError)]
enum ReceiveError {
    #[error("File envelope has no file name")]
    MissingFileName,
    #[error("Invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("Receiver is stopping")]
    Cancelled,
    #[error("{0}")]
    Wire(#[from] WireError),
    #[error("{0}")]
    Connection(#[from] ConnectionError),
    #[error("{0}")]
    Io(#[from] io::Error),
}
